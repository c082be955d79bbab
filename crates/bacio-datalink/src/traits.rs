use crate::DataLinkAddress;
use core::future::Future;
use thiserror::Error;

/// Errors that can occur at the data-link layer.
#[derive(Debug, Error)]
pub enum DataLinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport not open")]
    NotOpen,
    #[error("frame too large")]
    FrameTooLarge,
    #[error("invalid frame")]
    InvalidFrame,
    #[error("unsupported BVLC function 0x{0:02x}")]
    UnsupportedBvlcFunction(u8),
    #[error("BVLC result code 0x{0:04x}")]
    BvlcResult(u16),
    #[error("bbmd not configured")]
    BbmdNotConfigured,
}

impl DataLinkError {
    /// Frame-level failures the receive loop should log and skip rather
    /// than treat as fatal.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrame | Self::FrameTooLarge | Self::UnsupportedBvlcFunction(_)
        )
    }
}

/// Async datagram endpoint for raw BACnet frames (BVLC framing included on
/// the wire, stripped from the payloads seen here).
///
/// The futures are `Send` so a receive loop over any implementation can be
/// spawned onto a multi-threaded runtime.
pub trait DataLink: Send + Sync {
    /// Sends `payload` as a single datagram to `address`. A partial send is
    /// an error.
    fn send(
        &self,
        address: DataLinkAddress,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), DataLinkError>> + Send;

    /// Receives one frame into `buf`, returning `(bytes_read, source)`.
    /// The source is the originating device when the frame arrived as a
    /// `Forwarded-NPDU`.
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = Result<(usize, DataLinkAddress), DataLinkError>> + Send;
}
