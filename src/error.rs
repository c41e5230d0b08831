use std::io;

use thiserror::Error;

/// Setup-phase failures of a scan. Per-port failures never surface here.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid port range {start}-{end} (ports must be within 1-65535 and start <= end)")]
    InvalidPortRange { start: u32, end: u32 },

    #[error("invalid port list: {0}")]
    InvalidPortList(String),

    #[error("failed to resolve host `{host}`")]
    HostResolution {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("scan cancelled before any probe completed")]
    Cancelled,
}
