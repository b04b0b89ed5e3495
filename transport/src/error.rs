use crate::node_address::NodeAddress;
use std::time::Duration;
use thiserror::Error;

/// Errors while acquiring the anonymity substrate or publishing the hidden endpoint
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// The substrate could not be reached at all (e.g. the binary cannot be started or the
    ///  control port refuses connections)
    #[error("substrate unreachable: {0}")]
    Io(#[from] std::io::Error),
    #[error("control protocol error: {0}")]
    Control(String),
    #[error("bootstrapping stalled at {progress}%")]
    BootstrapStalled { progress: u8 },
    #[error("substrate process exited during startup: {0}")]
    ProcessExited(String),
    #[error("authentication with the control port failed: {0}")]
    Authentication(String),
    #[error("hidden endpoint was not published within {0:?}")]
    PublishTimeout(Duration),
    #[error("giving up after {attempts} failed attempts, last error: {last}")]
    RestartsExhausted { attempts: u32, last: Box<BootstrapError> },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BootstrapError {
    /// Retryable errors typically mean that the substrate could not build circuits with its
    ///  current relay set, so trying again with different bridges may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            BootstrapError::Control(_)
            | BootstrapError::BootstrapStalled { .. }
            | BootstrapError::ProcessExited(_) => true,
            BootstrapError::Io(_)
            | BootstrapError::Authentication(_)
            | BootstrapError::PublishTimeout(_)
            | BootstrapError::RestartsExhausted { .. }
            | BootstrapError::Config(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("peer {peer} is unreachable: {reason}")]
    Unreachable { peer: NodeAddress, reason: String },
    #[error("dialing {peer} timed out after {after:?}")]
    Timeout { peer: NodeAddress, after: Duration },
    #[error("malformed peer address {0}")]
    MalformedAddress(String),
    #[error("proxy error: {0}")]
    Proxy(String),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("connection {0} is closed")]
    ConnectionClosed(String),
    #[error("node is shutting down")]
    ShutDown,
    #[error("node is not ready yet")]
    NotReady,
    #[error("refusing to send a message to our own address {0}")]
    OwnAddress(NodeAddress),
    #[error("failed to encode envelope: {0}")]
    Encoding(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::control(BootstrapError::Control("551".to_string()), true)]
    #[case::stalled(BootstrapError::BootstrapStalled { progress: 10 }, true)]
    #[case::exited(BootstrapError::ProcessExited("code 1".to_string()), true)]
    #[case::io(BootstrapError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no tor")), false)]
    #[case::auth(BootstrapError::Authentication("bad password".to_string()), false)]
    fn test_is_retryable(#[case] error: BootstrapError, #[case] expected: bool) {
        assert_eq!(error.is_retryable(), expected);
    }

    #[test]
    fn test_dial_error_into_send_error() {
        let send_error: SendError = DialError::MalformedAddress("x".to_string()).into();
        assert!(matches!(send_error, SendError::Dial(DialError::MalformedAddress(_))));
    }
}
