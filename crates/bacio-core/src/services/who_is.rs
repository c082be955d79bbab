use crate::apdu::UnconfirmedRequestHeader;
use crate::encoding::primitives::encode_ctx_unsigned;
use crate::encoding::writer::Writer;
use crate::EncodeError;

pub const SERVICE_WHO_IS: u8 = 0x08;

/// Who-Is discovery request. The body is either empty (global) or carries
/// both range limits; encoding a half-open range is not representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhoIsRequest {
    pub limits: Option<(u32, u32)>,
}

impl WhoIsRequest {
    pub const fn global() -> Self {
        Self { limits: None }
    }

    pub const fn range(low: u32, high: u32) -> Self {
        Self {
            limits: Some((low, high)),
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        UnconfirmedRequestHeader {
            service_choice: SERVICE_WHO_IS,
        }
        .encode(w)?;

        if let Some((low, high)) = self.limits {
            encode_ctx_unsigned(w, 0, low)?;
            encode_ctx_unsigned(w, 1, high)?;
        }
        Ok(())
    }
}
