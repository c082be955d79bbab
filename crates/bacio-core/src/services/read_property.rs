use crate::encoding::{
    primitives::{encode_ctx_object_id, encode_ctx_unsigned},
    reader::Reader,
    tag::Tag,
    writer::Writer,
};
use crate::services::value_codec::decode_application_data_value;
use crate::services::{decode_required_ctx_object_id, decode_required_ctx_unsigned};
use crate::types::{DataValue, ObjectId, PropertyId};
use crate::{DecodeError, EncodeError};

#[cfg(feature = "alloc")]
use crate::services::value_codec::decode_application_data_value_from_tag;
#[cfg(feature = "alloc")]
use alloc::vec;

pub const SERVICE_READ_PROPERTY: u8 = 0x0C;

/// Service data of a ReadProperty request, written after the confirmed
/// request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_id: ObjectId,
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_ctx_object_id(w, 0, self.object_id.raw())?;
        encode_ctx_unsigned(w, 1, self.property_id.to_u32())?;
        if let Some(idx) = self.array_index {
            encode_ctx_unsigned(w, 2, idx)?;
        }
        Ok(())
    }
}

/// A decoded ReadProperty acknowledgement.
///
/// When the `[3]` value frame carries several application-tagged
/// primitives, `value` is a constructed sequence of them.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyAck<'a> {
    pub object_id: ObjectId,
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
    pub value: DataValue<'a>,
}

impl<'a> ReadPropertyAck<'a> {
    pub fn decode_after_header(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let object_id = decode_required_ctx_object_id(r, 0)?;
        let property_id = PropertyId::from_u32(decode_required_ctx_unsigned(r, 1)?);

        let next = Tag::decode(r)?;
        let (array_index, value_open_tag) = match next {
            Tag::Context { tag_num: 2, len } => {
                let idx = crate::encoding::primitives::decode_unsigned(r, len as usize)?;
                (Some(idx), Tag::decode(r)?)
            }
            other => (None, other),
        };

        if value_open_tag != (Tag::Opening { tag_num: 3 }) {
            return Err(DecodeError::InvalidTag);
        }

        let first = decode_application_data_value(r)?;
        let value = match Tag::decode(r)? {
            Tag::Closing { tag_num: 3 } => first,
            #[cfg(feature = "alloc")]
            more => {
                let mut values = vec![first, decode_application_data_value_from_tag(r, more)?];
                loop {
                    let tag = Tag::decode(r)?;
                    if tag == (Tag::Closing { tag_num: 3 }) {
                        break;
                    }
                    values.push(decode_application_data_value_from_tag(r, tag)?);
                }
                DataValue::Constructed { tag_num: 3, values }
            }
            #[cfg(not(feature = "alloc"))]
            _ => return Err(DecodeError::Unsupported),
        };

        Ok(Self {
            object_id,
            property_id,
            array_index,
            value,
        })
    }
}
