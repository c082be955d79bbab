//! In-flight confirmed-request bookkeeping.
//!
//! Invoke ids come from a rotating counter over a 256-bit occupancy bitmap,
//! so an id is never handed out twice while its transaction lives. Each
//! transaction owns a single-capacity delivery slot; the receive loop moves
//! the sender out under the lock and completes it after release.

use crate::error::ClientError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// What the receive loop hands back to a waiting caller.
#[derive(Debug)]
pub(crate) enum Reply {
    SimpleAck {
        service_choice: u8,
    },
    ComplexAck {
        service_choice: u8,
        payload: Vec<u8>,
    },
    ServiceError {
        service_choice: u8,
        class: Option<u32>,
        code: Option<u32>,
    },
    Reject {
        reason: u8,
    },
    Abort {
        server: bool,
        reason: u8,
    },
    /// The connection went away with the request outstanding.
    Closed,
}

#[derive(Debug)]
struct Inner {
    next: u8,
    live: [u64; 4],
    pending: HashMap<u8, oneshot::Sender<Reply>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            next: 1,
            live: [0; 4],
            pending: HashMap::new(),
        }
    }
}

impl Inner {
    fn is_live(&self, id: u8) -> bool {
        self.live[usize::from(id >> 6)] & (1u64 << (id & 63)) != 0
    }

    fn set_live(&mut self, id: u8, on: bool) {
        let bit = 1u64 << (id & 63);
        if on {
            self.live[usize::from(id >> 6)] |= bit;
        } else {
            self.live[usize::from(id >> 6)] &= !bit;
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct TransactionTable {
    inner: Mutex<Inner>,
}

impl TransactionTable {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the next free invoke id and registers its delivery slot.
    /// Fails with `ResourceExhausted` when all 256 ids are in flight.
    pub fn begin(&self) -> Result<(TransactionSlot<'_>, oneshot::Receiver<Reply>), ClientError> {
        let mut inner = self.lock();
        for _ in 0..=u8::MAX {
            let id = inner.next;
            inner.next = inner.next.wrapping_add(1);
            if inner.is_live(id) {
                continue;
            }
            inner.set_live(id, true);
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(id, tx);
            return Ok((
                TransactionSlot {
                    table: self,
                    invoke_id: id,
                },
                rx,
            ));
        }
        Err(ClientError::ResourceExhausted)
    }

    /// Delivers a reply to the matching slot. Returns false when no
    /// transaction is waiting on that invoke id.
    pub fn deliver(&self, invoke_id: u8, reply: Reply) -> bool {
        let sender = self.lock().pending.remove(&invoke_id);
        match sender {
            Some(tx) => {
                let _ = tx.send(reply);
                true
            }
            None => false,
        }
    }

    /// Fails every outstanding transaction; used when the connection dies.
    pub fn fail_all(&self) {
        let senders: Vec<_> = {
            let mut inner = self.lock();
            inner.pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in senders {
            let _ = tx.send(Reply::Closed);
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.lock()
            .live
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum()
    }
}

/// RAII handle for one in-flight transaction. Dropping it removes the
/// delivery slot and returns the invoke id to the pool, whatever the
/// outcome was; ids are reused only after this runs.
#[derive(Debug)]
pub(crate) struct TransactionSlot<'a> {
    table: &'a TransactionTable,
    invoke_id: u8,
}

impl TransactionSlot<'_> {
    pub fn invoke_id(&self) -> u8 {
        self.invoke_id
    }
}

impl Drop for TransactionSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.table.lock();
        inner.pending.remove(&self.invoke_id);
        inner.set_live(self.invoke_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::{Reply, TransactionTable};
    use crate::error::ClientError;

    #[test]
    fn ids_are_unique_while_live() {
        let table = TransactionTable::default();
        let mut slots = Vec::new();
        for _ in 0..10 {
            let (slot, rx) = table.begin().unwrap();
            slots.push((slot.invoke_id(), slot, rx));
        }
        let mut ids: Vec<u8> = slots.iter().map(|(id, _, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 10);
        assert_eq!(table.live_count(), 10);
    }

    #[test]
    fn pool_exhausts_at_256_and_recovers() {
        let table = TransactionTable::default();
        let mut held = Vec::new();
        for _ in 0..256 {
            held.push(table.begin().unwrap());
        }
        assert!(matches!(
            table.begin().unwrap_err(),
            ClientError::ResourceExhausted
        ));

        held.pop();
        let (slot, _rx) = table.begin().unwrap();
        let _ = slot;
        drop(held);
        assert_eq!(table.live_count(), 0);
    }

    #[tokio::test]
    async fn deliver_reaches_the_right_slot() {
        let table = TransactionTable::default();
        let (a, rx_a) = table.begin().unwrap();
        let (b, rx_b) = table.begin().unwrap();

        assert!(table.deliver(
            b.invoke_id(),
            Reply::SimpleAck { service_choice: 15 }
        ));
        let reply = rx_b.await.unwrap();
        assert!(matches!(reply, Reply::SimpleAck { service_choice: 15 }));

        // A never got anything; an unknown id is reported as unmatched.
        drop(a);
        assert!(!table.deliver(42, Reply::SimpleAck { service_choice: 0 }));
        drop(rx_a);
    }

    #[tokio::test]
    async fn fail_all_closes_every_pending_slot() {
        let table = TransactionTable::default();
        let (_a, rx_a) = table.begin().unwrap();
        let (_b, rx_b) = table.begin().unwrap();
        table.fail_all();
        assert!(matches!(rx_a.await.unwrap(), Reply::Closed));
        assert!(matches!(rx_b.await.unwrap(), Reply::Closed));
    }

    #[test]
    fn id_is_reused_only_after_drop() {
        let table = TransactionTable::default();
        let (slot, _rx) = table.begin().unwrap();
        let first = slot.invoke_id();
        drop(slot);
        drop(_rx);

        // The counter advances past the freed id before wrapping back.
        let mut seen_first_again = false;
        for _ in 0..256 {
            let (s, _r) = table.begin().unwrap();
            if s.invoke_id() == first {
                seen_first_again = true;
                break;
            }
        }
        assert!(seen_first_again);
    }
}
