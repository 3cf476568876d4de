/// Hand control to the target command by replacing this process image.
///
/// The target inherits our PID, so the supervisor keeps watching the same
/// process it started.
use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::execvp;
use std::ffi::CString;

/// Something that can turn this process into `argv`.
pub trait Handoff {
    /// Never returns on success; the returned value is always the failure.
    fn handoff(&self, argv: &[String]) -> HandoffError;
}

/// `execvp(3)`: PATH lookup, environment inherited.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecHandoff;

impl Handoff for ExecHandoff {
    fn handoff(&self, argv: &[String]) -> HandoffError {
        let args = match to_cstrings(argv) {
            Ok(args) => args,
            Err(e) => return e,
        };

        tracing::info!(command = %argv[0], args = ?&argv[1..], "handing off");
        restore_default_signals();
        match execvp(&args[0], args.as_slice()) {
            Ok(never) => match never {},
            Err(errno) => HandoffError::Exec {
                program: argv[0].clone(),
                source: errno,
            },
        }
    }
}

/// The Rust runtime ignores SIGPIPE, and ignored signals survive exec. Put
/// it back so the target starts with the dispositions its parent would have
/// given it.
fn restore_default_signals() {
    // SAFETY: SIG_DFL installs no handler function.
    if let Err(e) = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) } {
        tracing::warn!(error = %e, "failed to reset SIGPIPE disposition");
    }
}

fn to_cstrings(argv: &[String]) -> Result<Vec<CString>, HandoffError> {
    if argv.is_empty() {
        return Err(HandoffError::EmptyCommand);
    }
    argv.iter()
        .map(|arg| {
            CString::new(arg.as_str()).map_err(|_| HandoffError::NulByte { arg: arg.clone() })
        })
        .collect()
}

/// Why the handoff did not happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffError {
    EmptyCommand,
    /// An argument contains an interior NUL and cannot be passed to exec.
    NulByte { arg: String },
    Exec { program: String, source: Errno },
}

impl std::fmt::Display for HandoffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandoffError::EmptyCommand => write!(f, "no command supplied"),
            HandoffError::NulByte { arg } => {
                write!(f, "argument {arg:?} contains a NUL byte")
            }
            HandoffError::Exec { program, source } => {
                write!(f, "failed to exec {program}: {source}")
            }
        }
    }
}

impl std::error::Error for HandoffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HandoffError::Exec { source, .. } => Some(source),
            _ => None,
        }
    }
}
