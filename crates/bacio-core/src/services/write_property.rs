use crate::encoding::{
    primitives::{
        encode_closing_tag, encode_ctx_object_id, encode_ctx_unsigned, encode_opening_tag,
    },
    writer::Writer,
};
use crate::services::value_codec::encode_application_data_value;
use crate::types::{DataValue, ObjectId, PropertyId};
use crate::EncodeError;

pub const SERVICE_WRITE_PROPERTY: u8 = 0x0F;

/// Service data of a WriteProperty request, written after the confirmed
/// request header. `priority`, when present, must already be validated to
/// 1-16 by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePropertyRequest<'a> {
    pub object_id: ObjectId,
    pub property_id: PropertyId,
    pub value: DataValue<'a>,
    pub array_index: Option<u32>,
    pub priority: Option<u8>,
}

impl WritePropertyRequest<'_> {
    pub fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_ctx_object_id(w, 0, self.object_id.raw())?;
        encode_ctx_unsigned(w, 1, self.property_id.to_u32())?;
        if let Some(idx) = self.array_index {
            encode_ctx_unsigned(w, 2, idx)?;
        }

        encode_opening_tag(w, 3)?;
        encode_application_data_value(w, &self.value)?;
        encode_closing_tag(w, 3)?;

        if let Some(priority) = self.priority {
            encode_ctx_unsigned(w, 4, u32::from(priority))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::WritePropertyRequest;
    use crate::encoding::writer::Writer;
    use crate::types::{DataValue, ObjectId, ObjectType, PropertyId};

    #[test]
    fn real_with_priority_matches_fixture() {
        let req = WritePropertyRequest {
            object_id: ObjectId::new(ObjectType::AnalogOutput, 1),
            property_id: PropertyId::PresentValue,
            value: DataValue::Real(75.5),
            array_index: None,
            priority: Some(8),
        };
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        req.encode_payload(&mut w).unwrap();
        assert_eq!(
            w.as_written(),
            &[
                0x0C, 0x00, 0x40, 0x00, 0x01, // [0] analog-output:1
                0x19, 0x55, // [1] present-value
                0x3E, 0x44, 0x42, 0x97, 0x00, 0x00, 0x3F, // [3]{ real 75.5 }[3]
                0x49, 0x08, // [4] priority 8
            ]
        );
    }

    #[test]
    fn null_at_priority_relinquishes() {
        let req = WritePropertyRequest {
            object_id: ObjectId::new(ObjectType::AnalogOutput, 1),
            property_id: PropertyId::PresentValue,
            value: DataValue::Null,
            array_index: None,
            priority: Some(8),
        };
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        req.encode_payload(&mut w).unwrap();
        // The value frame holds an application-tagged null.
        assert_eq!(
            w.as_written(),
            &[0x0C, 0x00, 0x40, 0x00, 0x01, 0x19, 0x55, 0x3E, 0x00, 0x3F, 0x49, 0x08]
        );
    }
}
