use bacio_core::types::{AbortReason, ErrorClass, ErrorCode, RejectReason};
use bacio_datalink::DataLinkError;
use thiserror::Error;

/// Everything a client call can fail with. Remote protocol outcomes keep
/// their raw enumeration values so vendor-specific codes survive; the
/// accessors map them onto the standard enumerations where possible.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("datalink error: {0}")]
    DataLink(#[from] DataLinkError),
    #[error("encode error: {0}")]
    Encode(#[from] bacio_core::EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] bacio_core::DecodeError),
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("all 256 invoke ids are in flight")]
    ResourceExhausted,
    #[error("device {device_id} not found")]
    DeviceNotFound { device_id: u32 },
    #[error("write priority {priority} outside 1-16")]
    InvalidPriority { priority: u8 },
    #[error("remote error: class={class}, code={code}")]
    Remote { class: u32, code: u32 },
    #[error("remote reject: reason={reason}")]
    Reject { reason: u8 },
    #[error("remote abort: server={server}, reason={reason}")]
    Abort { server: bool, reason: u8 },
    #[error("unexpected response")]
    UnexpectedResponse,
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// The device was never resolved, or the remote reported it (or the
    /// addressed object) unknown.
    pub fn is_device_not_found(&self) -> bool {
        match self {
            Self::DeviceNotFound { .. } => true,
            Self::Remote { code, .. } => {
                *code == ErrorCode::UnknownDevice.to_u32()
                    || *code == ErrorCode::UnknownObject.to_u32()
            }
            _ => false,
        }
    }

    pub fn is_property_not_found(&self) -> bool {
        matches!(self, Self::Remote { code, .. } if *code == ErrorCode::UnknownProperty.to_u32())
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            Self::Remote { code, .. }
                if *code == ErrorCode::ReadAccessDenied.to_u32()
                    || *code == ErrorCode::WriteAccessDenied.to_u32()
        )
    }

    /// The standard error class of a remote error, when it maps.
    pub fn remote_class(&self) -> Option<ErrorClass> {
        match self {
            Self::Remote { class, .. } => ErrorClass::from_u32(*class),
            _ => None,
        }
    }

    /// The standard error code of a remote error, when it maps.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote { code, .. } => ErrorCode::from_u32(*code),
            _ => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Reject { reason } => RejectReason::from_u8(*reason),
            _ => None,
        }
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::Abort { reason, .. } => AbortReason::from_u8(*reason),
            _ => None,
        }
    }
}
