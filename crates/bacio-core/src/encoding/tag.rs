use crate::encoding::{reader::Reader, writer::Writer};
use crate::{DecodeError, EncodeError};

/// Application-class tag numbers defined by the BACnet encoding rules.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectId = 12,
}

impl AppTag {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Boolean),
            2 => Ok(Self::UnsignedInt),
            3 => Ok(Self::SignedInt),
            4 => Ok(Self::Real),
            5 => Ok(Self::Double),
            6 => Ok(Self::OctetString),
            7 => Ok(Self::CharacterString),
            8 => Ok(Self::BitString),
            9 => Ok(Self::Enumerated),
            10 => Ok(Self::Date),
            11 => Ok(Self::Time),
            12 => Ok(Self::ObjectId),
            _ => Err(DecodeError::InvalidTag),
        }
    }
}

/// A decoded BACnet tag header.
///
/// Application booleans are a special case: their length nibble carries the
/// value itself and no payload follows, so `len` is 0 or 1 with nothing to
/// read either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Application { tag: AppTag, len: u32 },
    Context { tag_num: u8, len: u32 },
    Opening { tag_num: u8 },
    Closing { tag_num: u8 },
}

impl Tag {
    pub fn encode(self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Tag::Application { tag, len } => encode_with_meta(w, tag as u8, false, len),
            Tag::Context { tag_num, len } => encode_with_meta(w, tag_num, true, len),
            Tag::Opening { tag_num } => encode_open_close(w, tag_num, true),
            Tag::Closing { tag_num } => encode_open_close(w, tag_num, false),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let first = r.read_u8()?;
        let class_context = (first & 0b0000_1000) != 0;

        let mut tag_num = (first >> 4) & 0x0f;
        if tag_num == 0x0f {
            tag_num = r.read_u8()?;
        }

        let len_code = first & 0x07;

        if class_context && len_code == 6 {
            return Ok(Tag::Opening { tag_num });
        }
        if class_context && len_code == 7 {
            return Ok(Tag::Closing { tag_num });
        }

        let len = decode_len(r, len_code)?;
        if class_context {
            if len as usize > r.remaining() {
                return Err(DecodeError::InvalidLength);
            }
            return Ok(Tag::Context { tag_num, len });
        }

        let tag = AppTag::from_u8(tag_num)?;
        // An application boolean carries its value in the length nibble and
        // has no payload, so the remaining-bytes check does not apply.
        if tag != AppTag::Boolean && len as usize > r.remaining() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(Tag::Application { tag, len })
    }
}

fn encode_with_meta(
    w: &mut Writer<'_>,
    tag_num: u8,
    is_context: bool,
    len: u32,
) -> Result<(), EncodeError> {
    let mut first: u8 = 0;

    if tag_num <= 14 {
        first |= tag_num << 4;
    } else {
        first |= 0xF0;
    }

    if is_context {
        first |= 0b0000_1000;
    }

    let len_code = if len <= 4 { len as u8 } else { 5 };

    first |= len_code;
    w.write_u8(first)?;

    if tag_num > 14 {
        w.write_u8(tag_num)?;
    }

    if len_code == 5 {
        if len <= 253 {
            w.write_u8(len as u8)?;
        } else if len <= 65535 {
            w.write_u8(254)?;
            w.write_be_u16(len as u16)?;
        } else {
            w.write_u8(255)?;
            w.write_be_u32(len)?;
        }
    }

    Ok(())
}

fn encode_open_close(w: &mut Writer<'_>, tag_num: u8, opening: bool) -> Result<(), EncodeError> {
    let mut first: u8 = 0b0000_1000;

    if tag_num <= 14 {
        first |= tag_num << 4;
    } else {
        first |= 0xF0;
    }

    first |= if opening { 6 } else { 7 };
    w.write_u8(first)?;

    if tag_num > 14 {
        w.write_u8(tag_num)?;
    }

    Ok(())
}

fn decode_len(r: &mut Reader<'_>, len_code: u8) -> Result<u32, DecodeError> {
    match len_code {
        0..=4 => Ok(len_code as u32),
        5 => {
            let v = r.read_u8()?;
            if v <= 253 {
                Ok(v as u32)
            } else if v == 254 {
                Ok(r.read_be_u16()? as u32)
            } else {
                r.read_be_u32()
            }
        }
        _ => Err(DecodeError::InvalidLength),
    }
}

#[cfg(test)]
mod tests {
    use super::{AppTag, Tag};
    use crate::encoding::{reader::Reader, writer::Writer};
    use crate::DecodeError;

    fn roundtrip(tag: Tag, payload_len: usize) -> Tag {
        let mut buf = [0u8; 80_000];
        let mut w = Writer::new(&mut buf);
        tag.encode(&mut w).unwrap();
        for _ in 0..payload_len {
            w.write_u8(0).unwrap();
        }
        let mut r = Reader::new(w.as_written());
        Tag::decode(&mut r).unwrap()
    }

    #[test]
    fn roundtrip_application_tag() {
        let t = Tag::Application {
            tag: AppTag::UnsignedInt,
            len: 3,
        };
        assert_eq!(roundtrip(t, 3), t);
    }

    #[test]
    fn roundtrip_extended_tag_number() {
        let t = Tag::Context {
            tag_num: 30,
            len: 2,
        };
        assert_eq!(roundtrip(t, 2), t);
    }

    #[test]
    fn roundtrip_extended_length_one_byte() {
        let t = Tag::Context {
            tag_num: 1,
            len: 200,
        };
        assert_eq!(roundtrip(t, 200), t);
    }

    #[test]
    fn roundtrip_extended_length_two_bytes() {
        let t = Tag::Context {
            tag_num: 1,
            len: 300,
        };
        assert_eq!(roundtrip(t, 300), t);
    }

    #[test]
    fn roundtrip_extended_length_four_bytes() {
        let t = Tag::Context {
            tag_num: 2,
            len: 70_000,
        };
        assert_eq!(roundtrip(t, 70_000), t);
    }

    #[test]
    fn open_close_sentinels() {
        assert_eq!(roundtrip(Tag::Opening { tag_num: 3 }, 0), Tag::Opening {
            tag_num: 3
        });
        assert_eq!(roundtrip(Tag::Closing { tag_num: 3 }, 0), Tag::Closing {
            tag_num: 3
        });
        assert_eq!(roundtrip(Tag::Opening { tag_num: 20 }, 0), Tag::Opening {
            tag_num: 20
        });
    }

    #[test]
    fn length_past_end_of_buffer_is_rejected() {
        // Extended length of 100 with only two payload bytes behind it.
        let mut r = Reader::new(&[0x1D, 100, 0xAA, 0xBB]);
        assert_eq!(Tag::decode(&mut r).unwrap_err(), DecodeError::InvalidLength);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut r = Reader::new(&[0x15]);
        assert_eq!(Tag::decode(&mut r).unwrap_err(), DecodeError::UnexpectedEof);
    }
}
