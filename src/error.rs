use std::time::Duration;

use thiserror::Error;

use crate::constants::DEFAULT_RETRY_DELAY;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a provisioning or teardown pass.
///
/// Whether an error is retried is decided where it is created: request
/// problems are `Config`, anything the hypervisor or the network may fix on
/// its own is `Transient` and carries the delay the driver should wait.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid machine request: {0}")]
    Config(String),

    #[error("{context}: {source:#}")]
    Transient {
        context: String,
        delay: Duration,
        #[source]
        source: anyhow::Error,
    },

    #[error("domain {domain} is in unknown state {state}")]
    UnknownState {
        domain: String,
        state: String,
        delay: Duration,
    },

    #[error("{context}: {source:#}")]
    Fatal {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn transient(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::transient_after(DEFAULT_RETRY_DELAY, context, source)
    }

    pub fn transient_after(
        delay: Duration,
        context: impl Into<String>,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        Self::Transient {
            context: context.into(),
            delay,
            source: source.into(),
        }
    }

    pub fn fatal(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Fatal {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Delay hint for the driver, `None` when the error must not be retried.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { delay, .. } | Self::UnknownState { delay, .. } => Some(*delay),
            Self::Config(_) | Self::Fatal { .. } => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.retry_after().is_none()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::config("cores must be positive").is_fatal());
        assert!(Error::fatal("render", anyhow!("boom")).is_fatal());

        let err = Error::transient("looking up pool", anyhow!("connection reset"));
        assert_eq!(err.retry_after(), Some(DEFAULT_RETRY_DELAY));

        let err = Error::UnknownState {
            domain: "m1".to_string(),
            state: "pmsuspended".to_string(),
            delay: Duration::from_secs(10),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_transient_message_keeps_context() {
        let err = Error::transient("creating volume m1.qcow2", anyhow!("pool is inactive"));
        assert_eq!(err.to_string(), "creating volume m1.qcow2: pool is inactive");
    }
}
