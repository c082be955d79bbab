//! BACnet wire-format encoding and decoding in pure Rust.
//!
//! `bacio-core` implements the layered binary codec used by BACnet/IP
//! clients: the ASN.1-style tag system, primitive value encodings, the NPDU
//! network-layer header, APDU headers for every PDU type, and the payload
//! codecs for the discovery, property-access, and COV services. The crate
//! performs no I/O and holds no state; everything operates on caller-owned
//! buffers through a zero-copy reader/writer pair.
//!
//! # Feature flags
//!
//! - **`std`** (default) — enables `std::error::Error` implementations.
//! - **`alloc`** (default) — enables service decoders that allocate
//!   (constructed values, RPM and COV notification lists).

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "std")]
extern crate std;

/// APDU (Application Protocol Data Unit) headers for all eight PDU types.
pub mod apdu;
/// Binary encoding primitives, the tag system, and the zero-copy reader/writer.
pub mod encoding;
/// Error types for encoding and decoding operations.
pub mod error;
/// NPDU (Network Protocol Data Unit) encoding and decoding.
pub mod npdu;
/// BACnet service request and response codecs.
pub mod services;
/// Core BACnet data types: object identifiers, property identifiers, values.
pub mod types;

pub use error::{DecodeError, EncodeError};
