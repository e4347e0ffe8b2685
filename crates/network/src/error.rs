use mvsd_primitives::EncodingError;
use serde_json::{json, Value};
use thiserror::Error;

/// Error kinds shared by the whole networking stack. Success is `Ok(())`;
/// every failure carries a stable numeric code for CLI/RPC callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum NetError {
    #[error("channel stopped")]
    ChannelStopped,
    #[error("channel timed out")]
    ChannelTimeout,
    #[error("accept failed")]
    AcceptFailed,
    #[error("address blocked")]
    AddressBlocked,
    #[error("bad stream")]
    BadStream,
    #[error("operation failed")]
    OperationFailed,
    #[error("object does not exist")]
    NotFound,
    #[error("not satisfied")]
    NotSatisfied,
    #[error("operation canceled")]
    OperationCanceled,
    #[error("file system error")]
    FileSystem,
    #[error("service stopped")]
    ServiceStopped,
}

impl NetError {
    pub fn code(self) -> i32 {
        match self {
            NetError::ChannelStopped => 1,
            NetError::ChannelTimeout => 2,
            NetError::AcceptFailed => 3,
            NetError::AddressBlocked => 4,
            NetError::BadStream => 5,
            NetError::OperationFailed => 6,
            NetError::NotFound => 7,
            NetError::NotSatisfied => 8,
            NetError::OperationCanceled => 9,
            NetError::FileSystem => 10,
            NetError::ServiceStopped => 11,
        }
    }

    /// The `{"code", "error", "result"}` failure envelope consumed by CLI
    /// tooling.
    pub fn envelope(self) -> Value {
        json!({
            "code": self.code(),
            "error": self.to_string(),
            "result": Value::Null,
        })
    }
}

/// Success envelope counterpart of [`NetError::envelope`].
pub fn success_envelope(result: Value) -> Value {
    json!({
        "code": 0,
        "error": "",
        "result": result,
    })
}

impl From<EncodingError> for NetError {
    fn from(_: EncodingError) -> Self {
        NetError::BadStream
    }
}

pub type NetResult<T> = Result<T, NetError>;

/// Maps transport failures onto channel stop codes: orderly remote close
/// reads as a stopped channel, anything else as a failed operation.
pub fn io_to_net(err: &std::io::Error) -> NetError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => NetError::ChannelStopped,
        _ => NetError::OperationFailed,
    }
}
