//! In-memory message store

use std::time::Instant;

use ahash::AHashMap;
use parking_lot::Mutex;

use super::{MessageStore, PendingDelivery, StoreResult};

/// Default [`MessageStore`] keeping records in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    /// packet id -> (creation sequence, record)
    records: AHashMap<u16, (u64, PendingDelivery)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn put(&self, delivery: PendingDelivery) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let seq = match inner.records.get(&delivery.packet_id) {
            Some((seq, _)) => *seq,
            None => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                seq
            }
        };
        inner.records.insert(delivery.packet_id, (seq, delivery));
        Ok(())
    }

    fn get(&self, packet_id: u16) -> StoreResult<Option<PendingDelivery>> {
        Ok(self
            .inner
            .lock()
            .records
            .get(&packet_id)
            .map(|(_, d)| d.clone()))
    }

    fn delete(&self, packet_id: u16) -> StoreResult<Option<PendingDelivery>> {
        Ok(self.inner.lock().records.remove(&packet_id).map(|(_, d)| d))
    }

    fn contains(&self, packet_id: u16) -> StoreResult<bool> {
        Ok(self.inner.lock().records.contains_key(&packet_id))
    }

    fn all(&self) -> StoreResult<Vec<PendingDelivery>> {
        let inner = self.inner.lock();
        let mut records: Vec<_> = inner.records.values().collect();
        records.sort_unstable_by_key(|(seq, _)| *seq);
        Ok(records.into_iter().map(|(_, d)| d.clone()).collect())
    }

    fn oldest_sent_at(&self) -> StoreResult<Option<Instant>> {
        Ok(self
            .inner
            .lock()
            .records
            .values()
            .map(|(_, d)| d.sent_at)
            .min())
    }

    fn len(&self) -> StoreResult<usize> {
        Ok(self.inner.lock().records.len())
    }

    fn reset(&self) -> StoreResult<()> {
        self.inner.lock().records.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::protocol::{Publish, QoS};
    use crate::store::Stage;

    fn outgoing(id: u16) -> PendingDelivery {
        let publish = Publish::new("t", Bytes::from_static(b"p"), QoS::AtLeastOnce);
        PendingDelivery::outgoing(publish, id, Stage::AwaitingAck, Instant::now())
    }

    #[test]
    fn test_put_get_delete() {
        let store = MemoryStore::new();
        store.put(outgoing(7)).unwrap();

        assert!(store.contains(7).unwrap());
        assert_eq!(store.get(7).unwrap().unwrap().packet_id, 7);
        assert_eq!(store.delete(7).unwrap().unwrap().packet_id, 7);
        assert!(store.get(7).unwrap().is_none());
        assert!(store.delete(7).unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_all_is_creation_ordered() {
        let store = MemoryStore::new();
        for id in [30, 10, 20] {
            store.put(outgoing(id)).unwrap();
        }

        // Replacing a record keeps its slot
        let mut updated = outgoing(30);
        updated.stage = Stage::AwaitingComp;
        store.put(updated).unwrap();

        let all = store.all().unwrap();
        let ids: Vec<u16> = all.iter().map(|d| d.packet_id).collect();
        assert_eq!(ids, vec![30, 10, 20]);
        assert_eq!(all[0].stage, Stage::AwaitingComp);
    }

    #[test]
    fn test_oldest_sent_at() {
        let store = MemoryStore::new();
        assert_eq!(store.oldest_sent_at().unwrap(), None);

        let now = Instant::now();
        let mut late = outgoing(1);
        late.sent_at = now + Duration::from_secs(5);
        let mut early = outgoing(2);
        early.sent_at = now;
        store.put(late).unwrap();
        store.put(early).unwrap();

        assert_eq!(store.oldest_sent_at().unwrap(), Some(now));
    }

    #[test]
    fn test_reset() {
        let store = MemoryStore::new();
        store.put(outgoing(1)).unwrap();
        store.put(PendingDelivery::incoming(2, Instant::now())).unwrap();
        assert_eq!(store.len().unwrap(), 2);

        store.reset().unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }
}
