//! Error types for kernel lifecycle and channel operations.
//!
//! Only startup failures and caller mistakes live here. Anything that goes
//! wrong while a run is streaming (unexpected messages, execution errors,
//! reply timeouts, a dead socket) is folded into the run's event stream
//! instead, so the consumer of a run never unwinds on kernel trouble.

use std::time::Duration;

use crate::client::Channel;

/// Error type for launching a kernel process.
#[derive(Debug, thiserror::Error)]
pub enum KernelStartError {
    #[error("No kernelspec named '{0}' is installed")]
    SpecNotFound(String),

    #[error("Failed to launch kernel: {0}")]
    Launch(#[from] std::io::Error),

    #[error("Failed to write connection file: {0}")]
    ConnectionFile(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error type for opening the channel set to a kernel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelStartupError {
    #[error("Kernel did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Failed to open channels: {0}")]
    Transport(#[from] anyhow::Error),
}

/// Errors on a connected channel client.
///
/// `Closed` is the one transport-death case; the rest are caller mistakes.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Client is disconnected")]
    Disconnected,

    #[error("Execution {0} is still in flight")]
    ExecutionInFlight(String),

    #[error("No input request is pending")]
    NoInputPending,

    #[error("The {0} channel closed")]
    Closed(Channel),
}

/// Error type for starting a kernel through the bridge.
#[derive(Debug, thiserror::Error)]
pub enum StartKernelError {
    #[error(transparent)]
    Kernel(#[from] KernelStartError),

    #[error(transparent)]
    Channels(#[from] ChannelStartupError),
}

/// Caller errors on the bridge surface.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("No kernel with id '{0}'")]
    UnknownKernel(String),

    #[error("Kernel '{0}' already has a run in flight")]
    KernelBusy(String),

    #[error("No run with id '{0}'")]
    UnknownRun(String),

    #[error("Run '{0}' has no pending input request")]
    NoInputPending(String),

    #[error("Run '{0}' already has an answer queued")]
    AnswerQueued(String),

    #[error(transparent)]
    Control(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_messages() {
        assert_eq!(
            ChannelError::Closed(Channel::Iopub).to_string(),
            "The iopub channel closed"
        );
        assert_eq!(
            ChannelError::NoInputPending.to_string(),
            "No input request is pending"
        );
    }

    #[test]
    fn test_kernel_start_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no python");
        let err: KernelStartError = io.into();
        assert!(err.to_string().contains("Failed to launch kernel"));
    }

    #[test]
    fn test_start_kernel_error_is_transparent() {
        let err: StartKernelError =
            ChannelStartupError::Timeout(Duration::from_secs(60)).into();
        assert_eq!(err.to_string(), "Kernel did not answer within 60s");
    }
}
