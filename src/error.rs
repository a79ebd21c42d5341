// Error taxonomy for the relay core.
//
// Both enums are recovered from inside the core: the orchestrator matches on
// them to decide between "skip this item" and "stop launching encoders". The
// HTTP layer never sees them directly, only the strings they render to in the
// status snapshot.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download timed out: {0}")]
    Timeout(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("TLS/SSL failure: {0}")]
    Ssl(String),

    #[error("remote returned an empty body")]
    EmptyBody,

    #[error("download cancelled by shutdown")]
    Cancelled,

    #[error("download failed: {0}")]
    Other(String),
}

impl FetchError {
    /// Classify a reqwest error. SSL problems are not exposed as a distinct
    /// kind by reqwest, so we look for them in the source chain.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return FetchError::Timeout(err.to_string());
        }

        let mut chain = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(s) = source {
            chain.push_str(": ");
            chain.push_str(&s.to_string());
            source = s.source();
        }
        let lc = chain.to_ascii_lowercase();
        if lc.contains("certificate") || lc.contains("ssl") || lc.contains("tls") || lc.contains("handshake") {
            return FetchError::Ssl(chain);
        }

        if err.is_connect() || err.is_request() || err.is_status() || err.is_body() || err.is_redirect() {
            return FetchError::Network(chain);
        }
        FetchError::Other(chain)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Other(format!("i/o: {err}"))
    }
}

#[derive(Debug, Error)]
pub enum EncoderStartError {
    #[error("input file does not exist: {0}")]
    InputMissing(String),

    /// Fatal for all playback: nothing will stream until the operator fixes
    /// the installation.
    #[error("encoder binary not found: {0}")]
    BinaryNotFound(String),

    /// Per-item failure; the item is abandoned and the loop moves on.
    #[error("encoder launch failed: {0}")]
    LaunchFailure(String),
}

impl EncoderStartError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EncoderStartError::BinaryNotFound(_))
    }
}
