use crate::encoding::{
    reader::Reader,
    tag::{AppTag, Tag},
    writer::Writer,
};
use crate::{DecodeError, EncodeError};

/// Writes `value` as a minimum-length big-endian unsigned integer and
/// returns the number of bytes used (1-4; zero encodes as one `0x00` byte).
pub fn encode_unsigned(w: &mut Writer<'_>, value: u32) -> Result<usize, EncodeError> {
    let len = if value <= 0xFF {
        1
    } else if value <= 0xFFFF {
        2
    } else if value <= 0xFF_FFFF {
        3
    } else {
        4
    };

    let bytes = value.to_be_bytes();
    w.write_all(&bytes[4 - len..])?;
    Ok(len)
}

/// Reads a big-endian unsigned integer of any legal length (1-4 bytes).
pub fn decode_unsigned(r: &mut Reader<'_>, len: usize) -> Result<u32, DecodeError> {
    if len == 0 || len > 4 {
        return Err(DecodeError::InvalidLength);
    }
    let mut value = 0u32;
    for byte in r.read_exact(len)? {
        value = (value << 8) | u32::from(*byte);
    }
    Ok(value)
}

/// Writes `value` as minimum-length big-endian two's complement.
pub fn encode_signed(w: &mut Writer<'_>, value: i32) -> Result<usize, EncodeError> {
    let len = if (-128..=127).contains(&value) {
        1
    } else if (-32_768..=32_767).contains(&value) {
        2
    } else if (-8_388_608..=8_388_607).contains(&value) {
        3
    } else {
        4
    };

    let bytes = value.to_be_bytes();
    w.write_all(&bytes[4 - len..])?;
    Ok(len)
}

/// Reads a big-endian two's complement integer of any legal length (1-4 bytes).
pub fn decode_signed(r: &mut Reader<'_>, len: usize) -> Result<i32, DecodeError> {
    if len == 0 || len > 4 {
        return Err(DecodeError::InvalidLength);
    }

    let bytes = r.read_exact(len)?;
    let mut out = [0u8; 4];
    out[4 - len..].copy_from_slice(bytes);
    if (bytes[0] & 0x80) != 0 {
        for b in &mut out[..4 - len] {
            *b = 0xFF;
        }
    }
    Ok(i32::from_be_bytes(out))
}

fn encode_app_small_int(w: &mut Writer<'_>, tag: AppTag, value: u32) -> Result<(), EncodeError> {
    let mut scratch = [0u8; 4];
    let mut tw = Writer::new(&mut scratch);
    let len = encode_unsigned(&mut tw, value)? as u32;
    Tag::Application { tag, len }.encode(w)?;
    w.write_all(&scratch[..len as usize])
}

pub fn encode_app_unsigned(w: &mut Writer<'_>, value: u32) -> Result<(), EncodeError> {
    encode_app_small_int(w, AppTag::UnsignedInt, value)
}

pub fn encode_app_enumerated(w: &mut Writer<'_>, value: u32) -> Result<(), EncodeError> {
    encode_app_small_int(w, AppTag::Enumerated, value)
}

pub fn encode_app_signed(w: &mut Writer<'_>, value: i32) -> Result<(), EncodeError> {
    let mut scratch = [0u8; 4];
    let mut tw = Writer::new(&mut scratch);
    let len = encode_signed(&mut tw, value)? as u32;
    Tag::Application {
        tag: AppTag::SignedInt,
        len,
    }
    .encode(w)?;
    w.write_all(&scratch[..len as usize])
}

pub fn encode_app_real(w: &mut Writer<'_>, value: f32) -> Result<(), EncodeError> {
    Tag::Application {
        tag: AppTag::Real,
        len: 4,
    }
    .encode(w)?;
    w.write_all(&value.to_bits().to_be_bytes())
}

pub fn encode_app_double(w: &mut Writer<'_>, value: f64) -> Result<(), EncodeError> {
    Tag::Application {
        tag: AppTag::Double,
        len: 8,
    }
    .encode(w)?;
    w.write_all(&value.to_bits().to_be_bytes())
}

pub fn encode_app_object_id(w: &mut Writer<'_>, object_id_raw: u32) -> Result<(), EncodeError> {
    Tag::Application {
        tag: AppTag::ObjectId,
        len: 4,
    }
    .encode(w)?;
    w.write_be_u32(object_id_raw)
}

pub fn decode_app_unsigned(r: &mut Reader<'_>) -> Result<u32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::UnsignedInt,
            len,
        } => decode_unsigned(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn decode_app_enumerated(r: &mut Reader<'_>) -> Result<u32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::Enumerated,
            len,
        } => decode_unsigned(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn decode_app_signed(r: &mut Reader<'_>) -> Result<i32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::SignedInt,
            len,
        } => decode_signed(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn decode_app_real(r: &mut Reader<'_>) -> Result<f32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::Real,
            len: 4,
        } => {
            let bytes = r.read_exact(4)?;
            Ok(f32::from_bits(u32::from_be_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])))
        }
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn decode_app_object_id_raw(r: &mut Reader<'_>) -> Result<u32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::ObjectId,
            len: 4,
        } => r.read_be_u32(),
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn encode_ctx_unsigned(w: &mut Writer<'_>, tag_num: u8, value: u32) -> Result<(), EncodeError> {
    let mut scratch = [0u8; 4];
    let mut tw = Writer::new(&mut scratch);
    let len = encode_unsigned(&mut tw, value)? as u32;
    Tag::Context { tag_num, len }.encode(w)?;
    w.write_all(&scratch[..len as usize])
}

pub fn encode_ctx_signed(w: &mut Writer<'_>, tag_num: u8, value: i32) -> Result<(), EncodeError> {
    let mut scratch = [0u8; 4];
    let mut tw = Writer::new(&mut scratch);
    let len = encode_signed(&mut tw, value)? as u32;
    Tag::Context { tag_num, len }.encode(w)?;
    w.write_all(&scratch[..len as usize])
}

pub fn encode_ctx_object_id(
    w: &mut Writer<'_>,
    tag_num: u8,
    object_id_raw: u32,
) -> Result<(), EncodeError> {
    Tag::Context { tag_num, len: 4 }.encode(w)?;
    w.write_be_u32(object_id_raw)
}

/// Context-tagged boolean: length 1 with a single 0/1 payload byte, unlike
/// the application form which folds the value into the length nibble.
pub fn encode_ctx_boolean(w: &mut Writer<'_>, tag_num: u8, value: bool) -> Result<(), EncodeError> {
    Tag::Context { tag_num, len: 1 }.encode(w)?;
    w.write_u8(u8::from(value))
}

pub fn encode_opening_tag(w: &mut Writer<'_>, tag_num: u8) -> Result<(), EncodeError> {
    Tag::Opening { tag_num }.encode(w)
}

pub fn encode_closing_tag(w: &mut Writer<'_>, tag_num: u8) -> Result<(), EncodeError> {
    Tag::Closing { tag_num }.encode(w)
}
