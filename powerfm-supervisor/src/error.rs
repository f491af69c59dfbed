/// Station operation failures
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Unknown station: {0}")]
    UnknownStation(String),
    #[error("Station {key} already running (pid {pid:?})")]
    AlreadyRunning { key: String, pid: Option<u32> },
    #[error("Failed to start station {key}: {source}")]
    Spawn {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
