//! Change-of-value subscriptions and notification dispatch.

use crate::value::Value;
use bacio_core::services::cov_notification::CovNotificationPayload;
use bacio_core::types::{ObjectId, PropertyId};
use bacio_datalink::DataLinkAddress;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One property change inside a notification.
#[derive(Debug, Clone, PartialEq)]
pub struct CovValue {
    pub property_id: PropertyId,
    pub array_index: Option<u32>,
    pub value: Value,
    pub priority: Option<u8>,
}

/// A decoded COV notification handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct CovNotification {
    pub source: DataLinkAddress,
    pub confirmed: bool,
    pub subscriber_process_id: u32,
    pub initiating_device_id: ObjectId,
    pub monitored_object_id: ObjectId,
    pub time_remaining_seconds: u32,
    pub values: Vec<CovValue>,
}

impl CovNotification {
    pub(crate) fn from_payload(
        payload: &CovNotificationPayload<'_>,
        source: DataLinkAddress,
        confirmed: bool,
    ) -> Self {
        Self {
            source,
            confirmed,
            subscriber_process_id: payload.subscriber_process_id,
            initiating_device_id: payload.initiating_device_id,
            monitored_object_id: payload.monitored_object_id,
            time_remaining_seconds: payload.time_remaining_seconds,
            values: payload
                .values
                .iter()
                .map(|v| CovValue {
                    property_id: v.property_id,
                    array_index: v.array_index,
                    value: Value::from_wire(&v.value),
                    priority: v.priority,
                })
                .collect(),
        }
    }
}

/// Callback invoked for each notification matching a subscription. Runs on
/// the receive loop task, so keep it short; hand heavy work to a channel.
pub type CovHandler = Arc<dyn Fn(CovNotification) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    device_id: u32,
    object_id: ObjectId,
    handler: CovHandler,
}

/// Subscription table keyed by the subscriber process id carried on the
/// wire, with (device, object) fallback matching for peers that echo a
/// different process id than they were given.
#[derive(Default)]
pub(crate) struct CovSubscriptions {
    subs: Mutex<HashMap<u32, Subscription>>,
}

impl CovSubscriptions {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Subscription>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(
        &self,
        process_id: u32,
        device_id: u32,
        object_id: ObjectId,
        handler: CovHandler,
    ) {
        self.lock().insert(
            process_id,
            Subscription {
                device_id,
                object_id,
                handler,
            },
        );
    }

    pub fn remove(&self, process_id: u32) -> bool {
        self.lock().remove(&process_id).is_some()
    }

    /// Finds the handler for a notification. The clone happens under the
    /// lock; the caller invokes it after release, so a handler that calls
    /// back into the client cannot deadlock.
    pub fn match_handler(&self, notification: &CovNotification) -> Option<CovHandler> {
        let subs = self.lock();
        if let Some(sub) = subs.get(&notification.subscriber_process_id) {
            return Some(sub.handler.clone());
        }
        subs.values()
            .find(|sub| {
                sub.device_id == notification.initiating_device_id.instance()
                    && sub.object_id == notification.monitored_object_id
            })
            .map(|sub| sub.handler.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}
