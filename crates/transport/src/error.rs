//! Error types for the transport clients.

/// Errors produced by a blob store backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("object or container not found")]
    NotFound,

    #[error("backend cannot serve partial content")]
    RangeUnsupported,

    #[error("commit referenced unstaged block IDs: {missing:?}")]
    IncompleteParts { missing: Vec<String> },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("backend returned {status}: {message}")]
    Backend { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether a retry with backoff may succeed.
    ///
    /// Connection-level failures and 5xx / 429 responses are transient;
    /// everything else requires caller action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Io(_) => true,
            Self::Backend { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Maps a non-success HTTP response onto the error taxonomy.
pub(crate) async fn status_error(resp: reqwest::Response) -> TransportError {
    let status = resp.status().as_u16();
    match status {
        404 => TransportError::NotFound,
        401 | 403 => TransportError::Auth(format!("backend returned status {status}")),
        _ => {
            let message: String = resp
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            TransportError::Backend { status, message }
        }
    }
}
