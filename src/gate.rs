/// One launch attempt: lock the history, decide, then either hand off to the
/// target command or run the stop protocol.
use crate::config::LimitConfig;
use crate::handoff::{Handoff, HandoffError};
use crate::metadata::{MetadataStore, StoreError};
use crate::stop::{StopOrchestrator, StopOutcome};
use crate::window::{Decision, RestartLimiter};

/// Decide whether `command` may launch and act on it.
///
/// On admission this only returns if the handoff failed. On denial it returns
/// [`GateError::IntensityExceeded`] once the stop protocol has finished.
pub async fn run_gate(
    config: &LimitConfig,
    command: &[String],
    handoff: &dyn Handoff,
) -> Result<(), GateError> {
    let store = MetadataStore::new(&config.metadata_dir);
    // Held until exec or exit.
    let mut handle = store.open(&config.metadata_key)?;
    let mut metadata = handle.load();

    let limiter = RestartLimiter::new(config.window, config.max_restarts);
    let (decision, restarts) = limiter.evaluate(&metadata.restarts);

    match decision {
        Decision::Deny => {
            let recent = restarts.len();
            tracing::warn!(
                key = %config.metadata_key,
                recent,
                max_restarts = config.max_restarts,
                "restart intensity exceeded, requesting stop"
            );
            let stop = StopOrchestrator::new(config.stop_command.as_deref())
                .run()
                .await;
            tracing::debug!(?stop, "stop protocol finished");
            Err(GateError::IntensityExceeded { recent, stop })
        }
        Decision::Admit => {
            tracing::info!(
                key = %config.metadata_key,
                path = %handle.path().display(),
                recent = restarts.len(),
                max_restarts = config.max_restarts,
                "launch admitted"
            );
            metadata.restarts = restarts;
            if let Err(e) = handle.store(&metadata) {
                tracing::warn!(error = %e, "could not write metadata");
            }
            let err = handoff.handoff(command);
            drop(handle);
            Err(GateError::Handoff(err))
        }
    }
}

/// Fatal outcomes of a launch attempt.
#[derive(Debug)]
pub enum GateError {
    Store(StoreError),
    IntensityExceeded { recent: usize, stop: StopOutcome },
    Handoff(HandoffError),
}

impl From<StoreError> for GateError {
    fn from(e: StoreError) -> Self {
        GateError::Store(e)
    }
}

impl std::fmt::Display for GateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateError::Store(e) => write!(f, "{e}"),
            GateError::IntensityExceeded { recent, .. } => write!(
                f,
                "max restart intensity reached ({recent} restarts in window)"
            ),
            GateError::Handoff(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for GateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GateError::Store(e) => Some(e),
            GateError::IntensityExceeded { .. } => None,
            GateError::Handoff(e) => Some(e),
        }
    }
}
