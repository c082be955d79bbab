use crate::encoding::{
    primitives::{encode_ctx_object_id, encode_ctx_unsigned},
    tag::Tag,
    writer::Writer,
};
use crate::types::{ObjectId, PropertyId};
use crate::EncodeError;

#[cfg(feature = "alloc")]
use crate::encoding::{primitives::decode_unsigned, reader::Reader};
#[cfg(feature = "alloc")]
use crate::services::value_codec::decode_application_data_value_from_tag;
#[cfg(feature = "alloc")]
use crate::types::DataValue;
#[cfg(feature = "alloc")]
use crate::DecodeError;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

pub const SERVICE_READ_PROPERTY_MULTIPLE: u8 = 0x0E;

/// One property reference inside a read-access specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyReference {
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
}

/// All properties requested from a single object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadAccessSpecification<'a> {
    pub object_id: ObjectId,
    pub properties: &'a [PropertyReference],
}

/// Service data of a ReadPropertyMultiple request: one
/// `[0] object-id [1]{ property references }[1]` group per object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyMultipleRequest<'a> {
    pub specs: &'a [ReadAccessSpecification<'a>],
}

impl ReadPropertyMultipleRequest<'_> {
    pub fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        for spec in self.specs {
            encode_ctx_object_id(w, 0, spec.object_id.raw())?;
            Tag::Opening { tag_num: 1 }.encode(w)?;
            for prop in spec.properties {
                encode_ctx_unsigned(w, 0, prop.property_id.to_u32())?;
                if let Some(idx) = prop.array_index {
                    encode_ctx_unsigned(w, 1, idx)?;
                }
            }
            Tag::Closing { tag_num: 1 }.encode(w)?;
        }

        Ok(())
    }
}

/// Outcome of one property inside an RPM acknowledgement: the value, or the
/// `[5]`-wrapped access error the device reported for just that property.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyOutcome<'a> {
    Value(DataValue<'a>),
    Error { class: u32, code: u32 },
}

#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResultElement<'a> {
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
    pub outcome: PropertyOutcome<'a>,
}

#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq)]
pub struct ReadAccessResult<'a> {
    pub object_id: ObjectId,
    pub results: Vec<ReadResultElement<'a>>,
}

#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPropertyMultipleAck<'a> {
    pub results: Vec<ReadAccessResult<'a>>,
}

#[cfg(feature = "alloc")]
impl<'a> ReadPropertyMultipleAck<'a> {
    pub fn decode_after_header(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let mut all_results = Vec::new();

        while !r.is_empty() {
            let object_id = match Tag::decode(r)? {
                Tag::Context { tag_num: 0, len } => {
                    ObjectId::from_raw(decode_unsigned(r, len as usize)?)
                }
                _ => return Err(DecodeError::InvalidTag),
            };

            match Tag::decode(r)? {
                Tag::Opening { tag_num: 1 } => {}
                _ => return Err(DecodeError::InvalidTag),
            }

            let mut elements = Vec::new();
            loop {
                let tag = Tag::decode(r)?;
                if tag == (Tag::Closing { tag_num: 1 }) {
                    break;
                }

                let property_id = match tag {
                    Tag::Context { tag_num: 2, len } => {
                        PropertyId::from_u32(decode_unsigned(r, len as usize)?)
                    }
                    _ => return Err(DecodeError::InvalidTag),
                };

                let next = Tag::decode(r)?;
                let (array_index, outcome_open) = match next {
                    Tag::Context { tag_num: 3, len } => {
                        let idx = decode_unsigned(r, len as usize)?;
                        (Some(idx), Tag::decode(r)?)
                    }
                    other => (None, other),
                };

                let outcome = match outcome_open {
                    Tag::Opening { tag_num: 4 } => {
                        let value_tag = Tag::decode(r)?;
                        let value = decode_application_data_value_from_tag(r, value_tag)?;
                        match Tag::decode(r)? {
                            Tag::Closing { tag_num: 4 } => {}
                            _ => return Err(DecodeError::InvalidTag),
                        }
                        PropertyOutcome::Value(value)
                    }
                    Tag::Opening { tag_num: 5 } => {
                        let class = decode_error_component(r, 0)?;
                        let code = decode_error_component(r, 1)?;
                        match Tag::decode(r)? {
                            Tag::Closing { tag_num: 5 } => {}
                            _ => return Err(DecodeError::InvalidTag),
                        }
                        PropertyOutcome::Error { class, code }
                    }
                    _ => return Err(DecodeError::InvalidTag),
                };

                elements.push(ReadResultElement {
                    property_id,
                    array_index,
                    outcome,
                });
            }

            all_results.push(ReadAccessResult {
                object_id,
                results: elements,
            });
        }

        Ok(Self {
            results: all_results,
        })
    }
}

/// An error component inside `[5]{ }` is context-tagged in the field but
/// some stacks emit application enumerateds; accept either.
#[cfg(feature = "alloc")]
fn decode_error_component(r: &mut Reader<'_>, expected_ctx: u8) -> Result<u32, DecodeError> {
    use crate::encoding::tag::AppTag;

    match Tag::decode(r)? {
        Tag::Context { tag_num, len } if tag_num == expected_ctx => {
            decode_unsigned(r, len as usize)
        }
        Tag::Application {
            tag: AppTag::Enumerated,
            len,
        } => decode_unsigned(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}
