use std::time::Duration;

/// Core error type for the booking bot pipeline.
///
/// Adapter crates map their specific errors into this type so the pipeline can
/// classify failures consistently (user-facing message vs retryable).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    /// A named downstream collaborator (booking, payments, broadcast...) failed.
    #[error("{name}: {message}")]
    Collaborator { name: String, message: String },

    #[error("processing timed out after {0:?}")]
    Timeout(Duration),

    #[error("circuit open for {name} (retry in {retry_in:?})")]
    CircuitOpen { name: String, retry_in: Duration },
}

impl Error {
    pub fn collaborator(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Name of the collaborator this error originated from, when known.
    pub fn collaborator_name(&self) -> Option<&str> {
        match self {
            Self::Collaborator { name, .. } | Self::CircuitOpen { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collaborator_name_is_exposed_for_named_failures() {
        let e = Error::collaborator("payments", "gateway returned 502");
        assert_eq!(e.collaborator_name(), Some("payments"));
        assert_eq!(e.to_string(), "payments: gateway returned 502");

        let open = Error::CircuitOpen {
            name: "calendar".to_string(),
            retry_in: Duration::from_secs(3),
        };
        assert_eq!(open.collaborator_name(), Some("calendar"));

        assert_eq!(Error::External("x".into()).collaborator_name(), None);
    }
}
