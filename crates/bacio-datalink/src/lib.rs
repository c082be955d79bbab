//! BACnet/IP (ASHRAE 135 Annex J) data link layer.
//!
//! Frames every datagram with the 4-byte BVLC header, owns the UDP socket,
//! unwraps `Forwarded-NPDU` relays from BBMDs, and registers the client as
//! a foreign device on a remote broadcast domain.

pub mod address;
pub mod bip;
pub mod traits;

pub use address::DataLinkAddress;
pub use bip::bvlc::{BvlcFunction, BvlcHeader};
pub use bip::transport::BacnetIpTransport;
pub use traits::{DataLink, DataLinkError};
