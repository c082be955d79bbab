use crate::encoding::{reader::Reader, writer::Writer};
use crate::{DecodeError, EncodeError};

/// BACnet network layer protocol version (always `0x01`).
pub const NPDU_VERSION: u8 = 0x01;

/// Control-byte flag: the NPDU carries a network-layer message, not an APDU.
pub const CONTROL_NETWORK_MESSAGE: u8 = 0x80;
/// Control-byte flag: a destination specifier (DNET/DLEN/DADR + hop count) follows.
pub const CONTROL_DESTINATION: u8 = 0x20;
/// Control-byte flag: a source specifier (SNET/SLEN/SADR) follows.
pub const CONTROL_SOURCE: u8 = 0x08;
/// Control-byte flag: the sender expects a reply to this NPDU.
pub const CONTROL_EXPECTING_REPLY: u8 = 0x04;

/// A network-layer address consisting of a network number and a MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpduAddress {
    /// The DNET/SNET network number.
    pub network: u16,
    /// MAC address bytes (up to 6).
    pub mac: [u8; 6],
    /// Number of valid bytes in `mac`.
    pub mac_len: u8,
}

impl NpduAddress {
    /// The valid prefix of the MAC address.
    pub fn mac_bytes(&self) -> &[u8] {
        &self.mac[..usize::from(self.mac_len.min(6))]
    }
}

/// BACnet Network Protocol Data Unit header.
///
/// This client only ever originates the two-byte version + control form;
/// the optional destination/source specifiers, hop count, and
/// network-layer message fields exist to decode what routers and remote
/// devices send back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Npdu {
    pub control: u8,
    pub destination: Option<NpduAddress>,
    pub source: Option<NpduAddress>,
    pub hop_count: Option<u8>,
    pub message_type: Option<u8>,
    pub vendor_id: Option<u16>,
}

impl Npdu {
    pub const fn new(control: u8) -> Self {
        Self {
            control,
            destination: None,
            source: None,
            hop_count: None,
            message_type: None,
            vendor_id: None,
        }
    }

    /// Header for an application request; `expecting_reply` is set on
    /// confirmed services.
    pub const fn application(expecting_reply: bool) -> Self {
        Self::new(if expecting_reply {
            CONTROL_EXPECTING_REPLY
        } else {
            0
        })
    }

    pub const fn is_network_message(&self) -> bool {
        (self.control & CONTROL_NETWORK_MESSAGE) != 0
    }

    pub const fn expecting_reply(&self) -> bool {
        (self.control & CONTROL_EXPECTING_REPLY) != 0
    }

    /// Delivery priority from the low two control bits (0 = normal,
    /// 3 = life safety).
    pub const fn priority(&self) -> u8 {
        self.control & 0x03
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(NPDU_VERSION)?;
        w.write_u8(self.control)?;

        if let Some(dest) = self.destination {
            encode_addr(w, dest)?;
        }
        if let Some(src) = self.source {
            encode_addr(w, src)?;
        }
        if self.destination.is_some() {
            w.write_u8(self.hop_count.unwrap_or(255))?;
        }
        if self.is_network_message() {
            w.write_u8(self.message_type.unwrap_or(0))?;
            if matches!(self.message_type, Some(0x80..=0xFF)) {
                w.write_be_u16(self.vendor_id.unwrap_or(0))?;
            }
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = r.read_u8()?;
        if version != NPDU_VERSION {
            return Err(DecodeError::InvalidVersion);
        }

        let control = r.read_u8()?;
        let has_dest = (control & CONTROL_DESTINATION) != 0;
        let has_src = (control & CONTROL_SOURCE) != 0;
        let is_network_msg = (control & CONTROL_NETWORK_MESSAGE) != 0;

        let destination = if has_dest {
            Some(decode_addr(r)?)
        } else {
            None
        };
        let source = if has_src { Some(decode_addr(r)?) } else { None };
        let hop_count = if has_dest { Some(r.read_u8()?) } else { None };

        let (message_type, vendor_id) = if is_network_msg {
            let mt = r.read_u8()?;
            let vid = if mt >= 0x80 {
                Some(r.read_be_u16()?)
            } else {
                None
            };
            (Some(mt), vid)
        } else {
            (None, None)
        };

        Ok(Self {
            control,
            destination,
            source,
            hop_count,
            message_type,
            vendor_id,
        })
    }
}

fn encode_addr(w: &mut Writer<'_>, addr: NpduAddress) -> Result<(), EncodeError> {
    if addr.mac_len as usize > addr.mac.len() {
        return Err(EncodeError::InvalidLength);
    }
    w.write_be_u16(addr.network)?;
    w.write_u8(addr.mac_len)?;
    w.write_all(&addr.mac[..addr.mac_len as usize])
}

fn decode_addr(r: &mut Reader<'_>) -> Result<NpduAddress, DecodeError> {
    let network = r.read_be_u16()?;
    let mac_len = r.read_u8()?;
    if mac_len > 6 {
        return Err(DecodeError::InvalidLength);
    }
    let mut mac = [0u8; 6];
    let src = r.read_exact(mac_len as usize)?;
    mac[..mac_len as usize].copy_from_slice(src);
    Ok(NpduAddress {
        network,
        mac,
        mac_len,
    })
}
