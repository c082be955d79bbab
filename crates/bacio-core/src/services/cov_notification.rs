#[cfg(feature = "alloc")]
use crate::encoding::{primitives::decode_unsigned, reader::Reader, tag::Tag};
#[cfg(feature = "alloc")]
use crate::services::value_codec::decode_application_data_value_from_tag;
#[cfg(feature = "alloc")]
use crate::services::{decode_required_ctx_object_id, decode_required_ctx_unsigned};
#[cfg(feature = "alloc")]
use crate::types::{DataValue, ObjectId, PropertyId};
#[cfg(feature = "alloc")]
use crate::DecodeError;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

pub const SERVICE_CONFIRMED_COV_NOTIFICATION: u8 = 0x01;
pub const SERVICE_UNCONFIRMED_COV_NOTIFICATION: u8 = 0x02;

/// One reported property inside a COV notification.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq)]
pub struct CovPropertyValue<'a> {
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
    pub value: DataValue<'a>,
    pub priority: Option<u8>,
}

/// The body of a COV notification, identical for the confirmed and
/// unconfirmed services.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, PartialEq)]
pub struct CovNotificationPayload<'a> {
    pub subscriber_process_id: u32,
    pub initiating_device_id: ObjectId,
    pub monitored_object_id: ObjectId,
    pub time_remaining_seconds: u32,
    pub values: Vec<CovPropertyValue<'a>>,
}

#[cfg(feature = "alloc")]
impl<'a> CovNotificationPayload<'a> {
    pub fn decode_after_header(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let subscriber_process_id = decode_required_ctx_unsigned(r, 0)?;
        let initiating_device_id = decode_required_ctx_object_id(r, 1)?;
        let monitored_object_id = decode_required_ctx_object_id(r, 2)?;
        let time_remaining_seconds = decode_required_ctx_unsigned(r, 3)?;

        match Tag::decode(r)? {
            Tag::Opening { tag_num: 4 } => {}
            _ => return Err(DecodeError::InvalidTag),
        }

        let mut values = Vec::new();
        loop {
            let property_start = Tag::decode(r)?;
            if property_start == (Tag::Closing { tag_num: 4 }) {
                break;
            }

            let property_id = match property_start {
                Tag::Context { tag_num: 0, len } => {
                    PropertyId::from_u32(decode_unsigned(r, len as usize)?)
                }
                _ => return Err(DecodeError::InvalidTag),
            };

            let next = Tag::decode(r)?;
            let (array_index, value_open_tag) = match next {
                Tag::Context { tag_num: 1, len } => {
                    let idx = decode_unsigned(r, len as usize)?;
                    (Some(idx), Tag::decode(r)?)
                }
                other => (None, other),
            };
            if value_open_tag != (Tag::Opening { tag_num: 2 }) {
                return Err(DecodeError::InvalidTag);
            }

            let value_tag = Tag::decode(r)?;
            let value = decode_application_data_value_from_tag(r, value_tag)?;
            match Tag::decode(r)? {
                Tag::Closing { tag_num: 2 } => {}
                _ => return Err(DecodeError::InvalidTag),
            }

            // Optional [3] priority; back out if the next tag is something else.
            let checkpoint = *r;
            let priority = if r.is_empty() {
                None
            } else {
                match Tag::decode(r)? {
                    Tag::Context { tag_num: 3, len } => {
                        let p = decode_unsigned(r, len as usize)?;
                        if p > u32::from(u8::MAX) {
                            return Err(DecodeError::InvalidValue);
                        }
                        Some(p as u8)
                    }
                    _ => {
                        *r = checkpoint;
                        None
                    }
                }
            };

            values.push(CovPropertyValue {
                property_id,
                array_index,
                value,
                priority,
            });
        }

        Ok(Self {
            subscriber_process_id,
            initiating_device_id,
            monitored_object_id,
            time_remaining_seconds,
            values,
        })
    }
}

#[cfg(test)]
#[cfg(feature = "alloc")]
mod tests {
    use super::{CovNotificationPayload, SERVICE_UNCONFIRMED_COV_NOTIFICATION};
    use crate::apdu::UnconfirmedRequestHeader;
    use crate::encoding::reader::Reader;
    use crate::types::{DataValue, ObjectId, ObjectType, PropertyId};

    #[test]
    fn decodes_standard_notification() {
        let fixture = [
            0x10, 0x02, // unconfirmed COV notification
            0x09, 0x11, // [0] process id 17
            0x1C, 0x02, 0x00, 0x00, 0x01, // [1] initiating device:1
            0x2C, 0x00, 0x00, 0x00, 0x01, // [2] monitored analog-input:1
            0x39, 0x3C, // [3] time remaining 60
            0x4E, // [4] opening list-of-values
            0x09, 0x55, // [0] present-value
            0x2E, // [2] opening value
            0x44, 0x42, 0x20, 0x00, 0x00, // real 40.0
            0x2F, // [2] closing value
            0x4F, // [4] closing list-of-values
        ];

        let mut r = Reader::new(&fixture);
        let header = UnconfirmedRequestHeader::decode(&mut r).unwrap();
        assert_eq!(header.service_choice, SERVICE_UNCONFIRMED_COV_NOTIFICATION);

        let cov = CovNotificationPayload::decode_after_header(&mut r).unwrap();
        assert_eq!(cov.subscriber_process_id, 17);
        assert_eq!(cov.initiating_device_id, ObjectId::new(ObjectType::Device, 1));
        assert_eq!(
            cov.monitored_object_id,
            ObjectId::new(ObjectType::AnalogInput, 1)
        );
        assert_eq!(cov.time_remaining_seconds, 60);
        assert_eq!(cov.values.len(), 1);
        assert_eq!(cov.values[0].property_id, PropertyId::PresentValue);
        assert_eq!(cov.values[0].value, DataValue::Real(40.0));
        assert_eq!(cov.values[0].priority, None);
    }

    #[test]
    fn decodes_priority_after_value() {
        let fixture = [
            0x09, 0x4D, // [0] process id 77
            0x1C, 0x02, 0x00, 0x00, 0x01, // [1] device:1
            0x2C, 0x00, 0x00, 0x00, 0x02, // [2] analog-input:2
            0x39, 0x78, // [3] time remaining 120
            0x4E, // [4] opening
            0x09, 0x55, // [0] present-value
            0x2E, 0x44, 0x42, 0x29, 0x00, 0x00, 0x2F, // [2]{ real 42.25 }[2]
            0x39, 0x08, // [3] priority 8
            0x4F, // [4] closing
        ];
        let mut r = Reader::new(&fixture);
        let cov = CovNotificationPayload::decode_after_header(&mut r).unwrap();
        assert_eq!(cov.values.len(), 1);
        assert_eq!(cov.values[0].priority, Some(8));
    }
}
