use crate::encoding::{
    primitives::{encode_ctx_boolean, encode_ctx_object_id, encode_ctx_unsigned},
    writer::Writer,
};
use crate::types::ObjectId;
use crate::EncodeError;

pub const SERVICE_SUBSCRIBE_COV: u8 = 0x05;

/// Service data of a SubscribeCOV request. Omitting both the confirmed flag
/// and the lifetime turns the request into a cancellation for the
/// (process id, object id) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeCovRequest {
    pub subscriber_process_id: u32,
    pub monitored_object_id: ObjectId,
    pub issue_confirmed_notifications: Option<bool>,
    pub lifetime_seconds: Option<u32>,
}

impl SubscribeCovRequest {
    pub const fn cancellation(subscriber_process_id: u32, monitored_object_id: ObjectId) -> Self {
        Self {
            subscriber_process_id,
            monitored_object_id,
            issue_confirmed_notifications: None,
            lifetime_seconds: None,
        }
    }

    pub fn encode_payload(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_ctx_unsigned(w, 0, self.subscriber_process_id)?;
        encode_ctx_object_id(w, 1, self.monitored_object_id.raw())?;
        if let Some(confirmed) = self.issue_confirmed_notifications {
            encode_ctx_boolean(w, 2, confirmed)?;
        }
        if let Some(lifetime) = self.lifetime_seconds {
            encode_ctx_unsigned(w, 3, lifetime)?;
        }
        Ok(())
    }
}
