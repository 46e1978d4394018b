use std::path::PathBuf;

use thiserror::Error;

/// Why a configured URL could not be turned into a trusted stream.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),
    #[error("no streams found in playlist {0}")]
    NoStreamsInPlaylist(String),
    #[error("{url} is not reachable: {reason}")]
    NotReachable { url: String, reason: String },
    #[error("{url} did not decode as audio: {reason}")]
    NotValidAudio { url: String, reason: String },
    #[error("no working stream for {url} after http(s) fallback")]
    NoWorkingStream { url: String },
}

#[derive(Debug, Error)]
pub enum RecorderError {
    /// Bad or duplicate operator input. Never retried.
    #[error("{0}")]
    Validation(String),
    #[error("unknown station: {0}")]
    UnknownStation(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("insufficient disk space on {}: {free_gib:.2} GiB free, {floor_gib:.2} GiB required", path.display())]
    InsufficientDisk {
        path: PathBuf,
        free_gib: f64,
        floor_gib: f64,
    },
    /// Spawn or kill failure on a capture process.
    #[error("process control: {0}")]
    ProcessControl(String),
    #[error("station store: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("station store at {}: {source}", path.display())]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;
