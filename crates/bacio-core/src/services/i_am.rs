use crate::apdu::UnconfirmedRequestHeader;
use crate::encoding::{
    primitives::{
        decode_app_enumerated, decode_app_object_id_raw, decode_app_unsigned,
        encode_app_enumerated, encode_app_object_id, encode_app_unsigned,
    },
    reader::Reader,
    writer::Writer,
};
use crate::types::ObjectId;
use crate::{DecodeError, EncodeError};

pub const SERVICE_I_AM: u8 = 0x00;

/// I-Am announcement body: device object id, max APDU, segmentation
/// capability (enumerated on the wire), vendor id, in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmPayload {
    pub device_id: ObjectId,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
}

impl IAmPayload {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        UnconfirmedRequestHeader {
            service_choice: SERVICE_I_AM,
        }
        .encode(w)?;

        encode_app_object_id(w, self.device_id.raw())?;
        encode_app_unsigned(w, self.max_apdu)?;
        encode_app_enumerated(w, self.segmentation)?;
        encode_app_unsigned(w, self.vendor_id)?;
        Ok(())
    }

    pub fn decode_after_header(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            device_id: ObjectId::from_raw(decode_app_object_id_raw(r)?),
            max_apdu: decode_app_unsigned(r)?,
            segmentation: decode_app_enumerated(r)?,
            vendor_id: decode_app_unsigned(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{IAmPayload, SERVICE_I_AM};
    use crate::apdu::UnconfirmedRequestHeader;
    use crate::encoding::{reader::Reader, writer::Writer};
    use crate::types::{ObjectId, ObjectType};

    #[test]
    fn roundtrip_and_fixture_bytes() {
        let body = IAmPayload {
            device_id: ObjectId::new(ObjectType::Device, 1234),
            max_apdu: 1476,
            segmentation: 3,
            vendor_id: 25,
        };
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        body.encode(&mut w).unwrap();

        assert_eq!(
            w.as_written(),
            &[
                0x10, 0x00, // unconfirmed request, I-Am
                0xC4, 0x02, 0x00, 0x04, 0xD2, // object id device:1234
                0x22, 0x05, 0xC4, // max APDU 1476
                0x91, 0x03, // segmentation: none (enumerated, not unsigned)
                0x21, 0x19, // vendor 25
            ]
        );

        let mut r = Reader::new(w.as_written());
        let hdr = UnconfirmedRequestHeader::decode(&mut r).unwrap();
        assert_eq!(hdr.service_choice, SERVICE_I_AM);
        assert_eq!(IAmPayload::decode_after_header(&mut r).unwrap(), body);
    }
}
