/// Read-only view of an identity's restart history (`--status`).
use crate::config::LimitConfig;
use crate::metadata::{MetadataStore, StoreError};
use crate::window::{window, Decision, RestartLimiter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// The JSON payload printed by `--status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub metadata_key: String,
    pub metadata_file: PathBuf,
    pub window_secs: i64,
    pub max_restarts: u32,
    /// Restarts still inside the window, oldest first.
    pub restarts: Vec<DateTime<Utc>>,
    pub count: usize,
    pub would_admit: bool,
    pub checked_at: DateTime<Utc>,
}

/// Build a report without recording anything.
pub fn report(config: &LimitConfig) -> Result<StatusReport, StoreError> {
    let store = MetadataStore::new(&config.metadata_dir);
    let metadata = store.peek(&config.metadata_key)?;
    let now = Utc::now();

    let restarts = window(&metadata.restarts, now, config.window);
    let (decision, _) =
        RestartLimiter::new(config.window, config.max_restarts).evaluate_at(&restarts, now);

    Ok(StatusReport {
        metadata_key: config.metadata_key.clone(),
        metadata_file: store.path_for(&config.metadata_key),
        window_secs: config.window.num_seconds(),
        max_restarts: config.max_restarts,
        count: restarts.len(),
        restarts,
        would_admit: decision == Decision::Admit,
        checked_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use chrono::TimeDelta;

    fn config(dir: &std::path::Path) -> LimitConfig {
        LimitConfig {
            window: TimeDelta::seconds(600),
            max_restarts: 2,
            metadata_dir: dir.to_path_buf(),
            metadata_key: "web".to_string(),
            stop_command: None,
        }
    }

    #[test]
    fn test_report_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = report(&config(dir.path())).unwrap();
        assert_eq!(report.count, 0);
        assert!(report.would_admit);
        assert_eq!(report.window_secs, 600);
        assert!(!report.metadata_file.exists());
    }

    #[test]
    fn test_report_counts_only_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        let now = Utc::now();
        let mut handle = store.open("web").unwrap();
        handle
            .store(&Metadata {
                restarts: vec![
                    now - TimeDelta::hours(1),
                    now - TimeDelta::seconds(20),
                    now - TimeDelta::seconds(10),
                ],
                ..Default::default()
            })
            .unwrap();
        drop(handle);

        let report = report(&config(dir.path())).unwrap();
        assert_eq!(report.count, 2);
        assert!(!report.would_admit);

        // Reporting never writes.
        assert_eq!(store.peek("web").unwrap().restarts.len(), 3);
    }

    #[test]
    fn test_report_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let report = report(&config(dir.path())).unwrap();
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["metadata_key"], "web");
        assert_eq!(json["would_admit"], true);
        assert_eq!(json["restarts"].as_array().unwrap().len(), 0);
    }
}
