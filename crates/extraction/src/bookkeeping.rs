use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::message::Message;
use crate::timestamp::Timestamp;

/// One distinct message timestamp's acked/unacked messages, inside one queue.
///
/// Corresponds to `TimestampInfo` in the design: a bucket is created when a
/// queue first sees a strictly newer timestamp, and destroyed only once it is
/// the deque head, carries no unacked messages, and is not the sole bucket.
#[derive(Default)]
pub(crate) struct TimestampBucket {
    pub unacked: HashSet<Message>,
    pub acked: Vec<Message>,
}

/// FIFO, strictly-increasing-by-timestamp list of buckets, plus the
/// message -> owning-timestamp index used for O(1) dedup and ack lookup.
///
/// A plain `HashMap<Message, Timestamp>` stands in for `MessageInfo`'s
/// back-reference: since buckets are keyed by timestamp rather than an arena
/// index, looking a message's bucket up is just a map lookup, and popping the
/// head bucket never invalidates anything still referenced from `index`.
pub(crate) struct Bookkeeping {
    buckets: IndexMap<Timestamp, TimestampBucket>,
    index: HashMap<Message, Timestamp>,
}

impl Bookkeeping {
    pub fn new() -> Self {
        Self {
            buckets: IndexMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn head_timestamp(&self) -> Option<Timestamp> {
        self.buckets.get_index(0).map(|(ts, _)| *ts)
    }

    /// Ensures an (initially empty) bucket exists at `ts`. Used when seeding
    /// bookkeeping from persisted state, where no messages have been
    /// re-observed yet but the restart anchor is known.
    pub fn seed(&mut self, ts: Timestamp) {
        self.buckets.entry(ts).or_insert_with(Default::default);
    }

    pub fn contains(&self, msg: &Message) -> bool {
        self.index.contains_key(msg)
    }

    /// Inserts a freshly-dispatched message into the bucket at `ts` (created
    /// if absent). Returns `false` without modifying state if the message was
    /// already seen (redundant re-query of an in-flight row).
    pub fn insert_unacked(&mut self, ts: Timestamp, msg: Message) -> bool {
        if self.index.contains_key(&msg) {
            return false;
        }
        let bucket = self.buckets.entry(ts).or_insert_with(Default::default);
        bucket.unacked.insert(msg.clone());
        self.index.insert(msg, ts);
        true
    }

    /// Inserts a message directly as already-acked, used when a restart-saved
    /// ack hash matches a re-observed row. Returns `false` on a duplicate.
    pub fn insert_acked(&mut self, ts: Timestamp, msg: Message) -> bool {
        if self.index.contains_key(&msg) {
            return false;
        }
        let bucket = self.buckets.entry(ts).or_insert_with(Default::default);
        bucket.acked.push(msg.clone());
        self.index.insert(msg, ts);
        true
    }

    /// Moves a message from unacked to acked. Returns `false` if the message
    /// is unknown, or was not currently unacked (ack for an unknown message).
    pub fn ack(&mut self, msg: &Message) -> bool {
        let Some(ts) = self.index.get(msg).copied() else {
            return false;
        };
        let Some(bucket) = self.buckets.get_mut(&ts) else {
            return false;
        };
        if bucket.unacked.remove(msg) {
            bucket.acked.push(msg.clone());
            true
        } else {
            false
        }
    }

    /// While the head bucket has no unacked messages and is not the sole
    /// bucket, removes it and purges its acked messages from the index.
    /// Returns the new head timestamp (unchanged if nothing collapsed).
    pub fn advance_pointer(&mut self) -> Option<Timestamp> {
        while self.buckets.len() > 1 {
            let head_empty = self
                .buckets
                .get_index(0)
                .map(|(_, b)| b.unacked.is_empty())
                .unwrap_or(false);
            if !head_empty {
                break;
            }
            let (_, bucket) = self.buckets.shift_remove_index(0).unwrap();
            for msg in bucket.acked {
                self.index.remove(&msg);
            }
        }
        self.head_timestamp()
    }

    /// All acked messages still resident in buckets (not yet reclaimed by
    /// `advance_pointer`), paired with their owning timestamp. Used to
    /// reconstruct the durable `acked` map on save.
    pub fn resident_acked(&self) -> impl Iterator<Item = (Timestamp, &Message)> {
        self.buckets
            .iter()
            .flat_map(|(ts, bucket)| bucket.acked.iter().map(move |m| (*ts, m)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn msg(ts: &str, id: i64) -> Message {
        Message::WaveSample(crate::message::WaveSampleRow {
            mapping_id: crate::message::MappingId(id),
            timestamp: ts.parse().unwrap(),
            fields: Default::default(),
        })
    }

    #[test]
    fn dedup_on_second_insert() {
        let mut bk = Bookkeeping::new();
        let ts = "2024-01-01T00:00:00Z".parse().unwrap();
        let m = msg("2024-01-01T00:00:00Z", 1);
        assert!(bk.insert_unacked(ts, m.clone()));
        assert!(!bk.insert_unacked(ts, m));
    }

    #[test]
    fn pointer_advances_only_past_fully_acked_heads() {
        let mut bk = Bookkeeping::new();
        let t100: Timestamp = "2024-01-01T00:01:40Z".parse().unwrap();
        let t200: Timestamp = "2024-01-01T00:03:20Z".parse().unwrap();
        let t300: Timestamp = "2024-01-01T00:05:00Z".parse().unwrap();
        let m100 = msg("2024-01-01T00:01:40Z", 1);
        let m200 = msg("2024-01-01T00:03:20Z", 2);
        let m300 = msg("2024-01-01T00:05:00Z", 3);
        bk.insert_unacked(t100, m100.clone());
        bk.insert_unacked(t200, m200.clone());
        bk.insert_unacked(t300, m300.clone());

        bk.ack(&m200);
        assert_eq!(bk.advance_pointer(), Some(t100));

        bk.ack(&m100);
        assert_eq!(bk.advance_pointer(), Some(t300));
        assert!(!bk.contains(&m100));
        assert!(!bk.contains(&m200));
        assert!(bk.contains(&m300));
    }

    #[test]
    fn ack_of_unknown_message_reports_false() {
        let mut bk = Bookkeeping::new();
        assert!(!bk.ack(&msg("2024-01-01T00:00:00Z", 9)));
    }
}
