use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Duration;

use crate::bookkeeping::Bookkeeping;
use crate::database::ParserSpec;
use crate::error::ExtractError;
use crate::hash::CanonicalBytes;
use crate::message::{MappingId, Message, PatientId};
use crate::origin::PatientIdRegistry;
use crate::timestamp::Timestamp;

/// Which field a queue's messages are routed and stalled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keying {
    MappingId,
    PatientId,
    None,
}

/// The nine concrete extraction queues. Each differs from the shared
/// batch-cycle machinery in `ExtractorQueue` only by the constants and small
/// behaviors returned here, per the design's "sum type plus a small trait"
/// guidance — a trait per variant would only duplicate this match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    WaveSample,
    NumericValue,
    EnumerationValue,
    Alert,
    PatientMapping,
    PatientBasicInfo,
    PatientDateAttribute,
    PatientStringAttribute,
    BedTag,
}

impl QueueKind {
    pub const ALL: [QueueKind; 9] = [
        QueueKind::WaveSample,
        QueueKind::NumericValue,
        QueueKind::EnumerationValue,
        QueueKind::Alert,
        QueueKind::PatientMapping,
        QueueKind::PatientBasicInfo,
        QueueKind::PatientDateAttribute,
        QueueKind::PatientStringAttribute,
        QueueKind::BedTag,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QueueKind::WaveSample => "wave_sample",
            QueueKind::NumericValue => "numeric_value",
            QueueKind::EnumerationValue => "enumeration_value",
            QueueKind::Alert => "alert",
            QueueKind::PatientMapping => "patient_mapping",
            QueueKind::PatientBasicInfo => "patient_basic_info",
            QueueKind::PatientDateAttribute => "patient_date_attribute",
            QueueKind::PatientStringAttribute => "patient_string_attribute",
            QueueKind::BedTag => "bed_tag",
        }
    }

    pub fn keying(&self) -> Keying {
        match self {
            QueueKind::WaveSample
            | QueueKind::NumericValue
            | QueueKind::EnumerationValue
            | QueueKind::Alert
            | QueueKind::PatientMapping => Keying::MappingId,
            QueueKind::PatientBasicInfo
            | QueueKind::PatientDateAttribute
            | QueueKind::PatientStringAttribute => Keying::PatientId,
            QueueKind::BedTag => Keying::None,
        }
    }

    pub fn default_batch_duration(&self) -> Duration {
        match self {
            QueueKind::WaveSample
            | QueueKind::NumericValue
            | QueueKind::EnumerationValue
            | QueueKind::Alert
            | QueueKind::PatientMapping => Duration::seconds(11),
            QueueKind::PatientBasicInfo
            | QueueKind::PatientDateAttribute
            | QueueKind::PatientStringAttribute
            | QueueKind::BedTag => Duration::minutes(60),
        }
    }

    pub fn bias(&self) -> Duration {
        match self {
            QueueKind::WaveSample => Duration::seconds(-30),
            QueueKind::PatientMapping => Duration::minutes(-8),
            _ => Duration::zero(),
        }
    }

    pub fn idle_delay(&self) -> Duration {
        match self {
            QueueKind::WaveSample => Duration::milliseconds(500),
            QueueKind::NumericValue => Duration::seconds(1),
            QueueKind::EnumerationValue => Duration::milliseconds(500),
            QueueKind::Alert => Duration::seconds(1),
            QueueKind::PatientMapping => Duration::minutes(5),
            QueueKind::PatientBasicInfo => Duration::minutes(31),
            QueueKind::PatientDateAttribute => Duration::minutes(32),
            QueueKind::PatientStringAttribute => Duration::minutes(33),
            QueueKind::BedTag => Duration::minutes(34),
        }
    }

    /// BedTag's TTL is a fixed placeholder in the original design; preserved
    /// verbatim rather than generalized to `limit * 20`.
    pub fn ttl(&self, limit_per_batch: u64) -> i64 {
        match self {
            QueueKind::BedTag => 1000,
            _ => (limit_per_batch * 20) as i64,
        }
    }

    /// A mapping-id queue other than PatientMapping itself stalls on
    /// PatientMapping while it has pending (unresolved) mapping ids.
    pub fn stalls_on(&self) -> Option<QueueKind> {
        match self {
            QueueKind::WaveSample
            | QueueKind::NumericValue
            | QueueKind::EnumerationValue
            | QueueKind::Alert => Some(QueueKind::PatientMapping),
            _ => None,
        }
    }
}

/// Inputs to the adaptive batch-sizing policy: the previous batch's outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub count: u64,
    pub count_at_newest: u64,
    pub limit: u64,
    pub duration: Option<Duration>,
}

/// Pure function `(previous batch stats) -> (next row cap, next window width)`.
/// `started = false` only for the very first query a queue ever issues.
pub fn next_batch_params(
    started: bool,
    prev: BatchStats,
    limit_per_batch: u64,
    default_duration: Duration,
) -> (u64, Option<Duration>) {
    if !started {
        (limit_per_batch, None)
    } else if prev.count > prev.count_at_newest || prev.duration.is_none() {
        // Multiple timestamps arrived (or we have no duration yet): advance
        // by the default window, resetting the row cap.
        (limit_per_batch, Some(default_duration))
    } else if prev.count < prev.limit {
        // A single timestamp, but we did not fill the row cap: the window
        // was too narrow. Double it and keep the cap.
        (prev.limit, prev.duration.map(|d| d * 2))
    } else {
        // A single timestamp that filled the row cap: data is dense right
        // here. Double the cap and keep the window narrow.
        (prev.limit * 2, prev.duration)
    }
}

/// Durable, per-queue extraction state: virtual clock, ack bookkeeping, and
/// adaptive batch-sizing history. One instance per `QueueKind`.
pub struct ExtractorQueue {
    kind: QueueKind,
    mapping_id: Option<MappingId>,
    patient_id: Option<PatientId>,
    limit_per_batch: u64,
    end_time: Option<Timestamp>,

    newest_seen_timestamp: Option<Timestamp>,
    oldest_unacked_timestamp: Option<Timestamp>,
    bookkeeping: Bookkeeping,
    acked_saved: HashMap<Timestamp, HashSet<String>>,

    last_batch_count: u64,
    last_batch_count_at_newest: u64,
    last_batch_limit: u64,
    last_batch_duration: Option<Duration>,
    last_batch_end: Option<Timestamp>,
    query_time: Timestamp,

    pending_mapping_ids: HashSet<MappingId>,
}

impl ExtractorQueue {
    pub fn new(kind: QueueKind, limit_per_batch: u64, end_time: Option<Timestamp>) -> Self {
        Self {
            kind,
            mapping_id: None,
            patient_id: None,
            limit_per_batch,
            end_time,
            newest_seen_timestamp: None,
            oldest_unacked_timestamp: None,
            bookkeeping: Bookkeeping::new(),
            acked_saved: HashMap::new(),
            last_batch_count: 0,
            last_batch_count_at_newest: 0,
            last_batch_limit: 0,
            last_batch_duration: None,
            last_batch_end: None,
            query_time: Timestamp::VERY_OLD,
            pending_mapping_ids: HashSet::new(),
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn newest_seen_timestamp(&self) -> Option<Timestamp> {
        self.newest_seen_timestamp
    }

    pub fn oldest_unacked_timestamp(&self) -> Option<Timestamp> {
        self.oldest_unacked_timestamp
    }

    pub fn query_time(&self) -> Timestamp {
        self.query_time
    }

    /// Updates `query_time`, the maximum timestamp observed so far in the
    /// current batch. Called by the scheduler once per received message.
    pub fn observe_query_time(&mut self, ts: Timestamp) {
        if ts > self.query_time {
            self.query_time = ts;
        }
    }

    /// Whether this queue should yield its turn to another queue. Opportunistically
    /// drops any pending mapping id the registry has since resolved, so a
    /// stall clears the moment its blocker catches up rather than only when
    /// this queue next gets to run `channel_for` itself.
    pub fn stalling_queue(&mut self, registry: &PatientIdRegistry) -> Option<QueueKind> {
        self.pending_mapping_ids.retain(|id| registry.get_patient_id(*id).is_none());
        if self.pending_mapping_ids.is_empty() {
            None
        } else {
            self.kind.stalls_on()
        }
    }

    /// Builds the bounded query for this queue's next batch, per the
    /// adaptive policy in `next_batch_params`, and resets per-batch counters.
    pub fn next_message_parser(&mut self) -> ParserSpec {
        let started = self.newest_seen_timestamp.is_some();
        let prev = BatchStats {
            count: self.last_batch_count,
            count_at_newest: self.last_batch_count_at_newest,
            limit: self.last_batch_limit,
            duration: self.last_batch_duration,
        };
        let (n, mut d) = next_batch_params(
            started,
            prev,
            self.limit_per_batch,
            self.kind.default_batch_duration(),
        );

        let start = self.newest_seen_timestamp;
        let end = match start {
            None => self.end_time,
            Some(start) => {
                let mut window = d.unwrap_or_else(|| self.kind.default_batch_duration());
                if let Some(end_time) = self.end_time {
                    window = window.min(end_time - start);
                }
                d = Some(window);
                Some(start.saturating_add(window))
            }
        };

        self.last_batch_limit = n;
        self.last_batch_end = end;
        self.last_batch_duration = d;
        self.last_batch_count = 0;
        self.last_batch_count_at_newest = 0;

        ParserSpec {
            kind: self.kind,
            limit: n,
            time_ge: start,
            time_le: end,
            time_lt: None,
            reverse: false,
            mapping_id: self.mapping_id,
            patient_id: self.patient_id,
        }
    }

    /// A reverse, limit-1 probe up to `end_time`, used by the scheduler to
    /// refresh its virtual clock when a stall redirect would otherwise idle
    /// forever waiting for messages that never arrive.
    pub fn final_message_parser(&self) -> ParserSpec {
        ParserSpec {
            kind: self.kind,
            limit: 1,
            time_ge: self.newest_seen_timestamp,
            time_le: None,
            time_lt: self.end_time,
            reverse: true,
            mapping_id: self.mapping_id,
            patient_id: self.patient_id,
        }
    }

    pub fn reached_present(&self) -> bool {
        match self.end_time {
            Some(end_time) => {
                self.last_batch_end.map_or(false, |e| e >= end_time)
                    && self.last_batch_count < self.last_batch_limit
            }
            None => {
                tracing::debug!(
                    queue = self.kind.name(),
                    "reached_present() without end_time is an approximation; \
                     real-time extraction should set end_time"
                );
                self.last_batch_count < self.last_batch_limit
            }
        }
    }

    fn channel_for(
        &mut self,
        msg: &Message,
        registry: &PatientIdRegistry,
    ) -> Result<Option<PatientId>, ExtractError> {
        match self.kind.keying() {
            Keying::None => Ok(None),
            Keying::PatientId => match msg {
                Message::PatientBasicInfo(r) => Ok(Some(r.patient_id)),
                Message::PatientDateAttribute(r) => Ok(Some(r.patient_id)),
                Message::PatientStringAttribute(r) => Ok(Some(r.patient_id)),
                _ => Err(ExtractError::MismatchedMessageKind(self.kind.name())),
            },
            Keying::MappingId => {
                if self.kind == QueueKind::PatientMapping {
                    let Message::PatientMapping(r) = msg else {
                        return Err(ExtractError::MismatchedMessageKind(self.kind.name()));
                    };
                    registry.set_patient_id(r.mapping_id, r.patient_id);
                    self.pending_mapping_ids.remove(&r.mapping_id);
                    return Ok(Some(r.patient_id));
                }
                let Some(mapping_id) = msg.mapping_id() else {
                    return Err(ExtractError::MismatchedMessageKind(self.kind.name()));
                };
                match registry.get_patient_id(mapping_id) {
                    Some(patient_id) => {
                        self.pending_mapping_ids.remove(&mapping_id);
                        Ok(Some(patient_id))
                    }
                    None => {
                        self.pending_mapping_ids.insert(mapping_id);
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Ingests one message from the current batch: extracts its routing
    /// attributes, applies the non-decreasing-timestamp and dedup rules, and
    /// returns the `(channel, ttl)` to dispatch with, or `None` if the
    /// message must not be dispatched (rejected, duplicate, or already acked
    /// in a prior run).
    pub fn push_message(
        &mut self,
        msg: Message,
        registry: &PatientIdRegistry,
    ) -> Result<Option<(Option<PatientId>, i64)>, ExtractError> {
        let ts = msg.timestamp();
        self.last_batch_count += 1;

        let is_new_bucket = match self.newest_seen_timestamp {
            None => true,
            Some(newest) if ts == newest => {
                self.last_batch_count_at_newest += 1;
                false
            }
            Some(newest) if ts > newest => true,
            Some(_) => {
                tracing::warn!(queue = self.kind.name(), %ts, "unexpected message; ignored");
                return Ok(None);
            }
        };

        if is_new_bucket {
            self.newest_seen_timestamp = Some(ts);
            self.last_batch_count_at_newest = 1;
            if self.oldest_unacked_timestamp.is_none() {
                self.oldest_unacked_timestamp = Some(ts);
            }
        }

        // Computed unconditionally, ahead of the dedup/already-acked checks
        // below: for PatientMapping this is also where the mapping-id ->
        // patient-id association is registered, and that registry is
        // in-memory only, so a redelivered row that is a duplicate or was
        // already acked in a prior run must still re-register it. Otherwise
        // a restart that reseeds the query window at oldest_unacked_timestamp
        // would re-observe an already-acked PatientMapping row without ever
        // restoring the association, leaving dependent queues stalled.
        let channel = self.channel_for(&msg, registry)?;
        let ttl = self.kind.ttl(self.limit_per_batch);

        if self.bookkeeping.contains(&msg) {
            return Ok(None);
        }

        // Check whether this message was acked in a prior run before it is
        // dispatched again. Hashing is deferred until we know there is a
        // saved-ack bucket at this timestamp, since it is comparatively
        // expensive.
        if let Some(saved) = self.acked_saved.get_mut(&ts) {
            let digest = msg.content_hash();
            if saved.remove(&digest) {
                if saved.is_empty() {
                    self.acked_saved.remove(&ts);
                }
                self.bookkeeping.insert_acked(ts, msg);
                return Ok(None);
            }
        }

        self.bookkeeping.insert_unacked(ts, msg);
        Ok(Some((channel, ttl)))
    }

    pub fn ack_message(&mut self, msg: &Message) {
        if !self.bookkeeping.ack(msg) {
            tracing::warn!(queue = self.kind.name(), "ack for an unknown message");
        }
        self.update_pointer();
    }

    /// No-op: the message stays unacked. Redelivery/dead-letter routing is
    /// the dispatcher's responsibility, driven by the message's TTL.
    pub fn nack_message(&mut self, _msg: &Message) {}

    fn update_pointer(&mut self) {
        let Some(new_head) = self.bookkeeping.advance_pointer() else {
            return;
        };
        self.oldest_unacked_timestamp = Some(new_head);

        let stale: Vec<Timestamp> = self
            .acked_saved
            .keys()
            .copied()
            .filter(|ts| *ts < new_head)
            .collect();
        for ts in stale {
            if let Some(missed) = self.acked_saved.remove(&ts) {
                if !missed.is_empty() {
                    tracing::warn!(
                        queue = self.kind.name(),
                        %ts,
                        count = missed.len(),
                        "missed expected messages; corrupt DB or query window underrun?"
                    );
                }
            }
        }
    }

    fn state_file_name(dest_dir: &Path, kind: QueueKind) -> PathBuf {
        dest_dir.join(format!("%{}.queue", kind.name()))
    }

    /// Loads persisted state from `<dest_dir>/%<name>.queue`. A missing or
    /// unparseable file leaves the queue in its initial (first-run) state.
    pub fn load_state(&mut self, dest_dir: &Path) -> Result<(), ExtractError> {
        let path = Self::state_file_name(dest_dir, self.kind);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(ExtractError::StateRead { path, source: err }),
        };
        let parsed: Result<StateFile, _> = serde_json::from_str(&data);
        let Ok(parsed) = parsed else {
            tracing::warn!(queue = self.kind.name(), "unparseable queue state; starting fresh");
            return Ok(());
        };
        let Ok(ts) = parsed.time.parse::<Timestamp>() else {
            tracing::warn!(queue = self.kind.name(), "queue state missing a valid time; starting fresh");
            return Ok(());
        };

        self.newest_seen_timestamp = Some(ts);
        self.oldest_unacked_timestamp = Some(ts);
        self.bookkeeping = Bookkeeping::new();
        self.bookkeeping.seed(ts);

        self.acked_saved = HashMap::new();
        for (tsstr, hashes) in parsed.acked {
            if let Ok(ts) = tsstr.parse::<Timestamp>() {
                self.acked_saved.entry(ts).or_default().extend(hashes);
            }
        }
        Ok(())
    }

    /// Crash-safe save: serialize to `<path>.tmp`, fsync, then rename over
    /// the final path. `deterministic` additionally sorts keys and per-
    /// timestamp hash lists for byte-exact reproducible output.
    pub fn save_state(&self, dest_dir: &Path, deterministic: bool) -> Result<(), ExtractError> {
        let Some(oldest) = self.oldest_unacked_timestamp else {
            return Ok(());
        };

        let mut acked: HashMap<String, Vec<String>> = HashMap::new();
        for (ts, hashes) in &self.acked_saved {
            acked.entry(ts.to_string()).or_default().extend(hashes.iter().cloned());
        }
        for (ts, msg) in self.bookkeeping.resident_acked() {
            acked.entry(ts.to_string()).or_default().push(msg.content_hash());
        }
        if deterministic {
            for v in acked.values_mut() {
                v.sort();
            }
        }

        let path = Self::state_file_name(dest_dir, self.kind);
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));

        let body = if deterministic {
            let ordered: std::collections::BTreeMap<_, _> = acked.into_iter().collect();
            serde_json::to_string(&StateFileRef {
                time: &oldest.to_string(),
                acked: &ordered,
            })
        } else {
            serde_json::to_string(&StateFileRef {
                time: &oldest.to_string(),
                acked: &acked,
            })
        }?;

        let write = || -> std::io::Result<()> {
            use std::io::Write;
            let mut f = std::fs::File::create(&tmp_path)?;
            f.write_all(body.as_bytes())?;
            f.write_all(b"\n")?;
            f.flush()?;
            f.sync_data()?;
            std::fs::rename(&tmp_path, &path)?;
            Ok(())
        };
        write().map_err(|source| ExtractError::StateWrite {
            path: path.clone(),
            source,
        })
    }
}

/// Shared, lock-per-queue table of every registered queue. Handed to the
/// dispatcher as an `AckSink` (see `dispatcher.rs`) so worker threads can
/// ack/nack back into scheduler state without the dispatcher depending on
/// `Extractor` itself. Registration goes through a `RwLock` so new queues can
/// be added after the table's `Arc` has already been cloned into dispatcher
/// worker threads; steady-state reads (`with`) only ever take its read side.
pub struct QueueTable {
    queues: std::sync::RwLock<HashMap<QueueKind, Mutex<ExtractorQueue>>>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self {
            queues: std::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, kind: QueueKind, queue: ExtractorQueue) {
        self.queues.write().unwrap().insert(kind, Mutex::new(queue));
    }

    /// Runs `f` against the named queue while holding its lock. Panics if
    /// `kind` was never registered, which is a caller programming error.
    pub fn with<R>(&self, kind: QueueKind, f: impl FnOnce(&mut ExtractorQueue) -> R) -> R {
        let table = self.queues.read().unwrap();
        let mut q = table
            .get(&kind)
            .unwrap_or_else(|| panic!("queue {} was never registered", kind.name()))
            .lock()
            .unwrap();
        f(&mut q)
    }
}

impl Default for QueueTable {
    fn default() -> Self {
        Self::new()
    }
}

impl crate::dispatcher::AckSink for QueueTable {
    fn ack_message(&self, queue: QueueKind, message: &Message) {
        self.with(queue, |q| q.ack_message(message));
    }

    fn nack_message(&self, queue: QueueKind, message: &Message) {
        self.with(queue, |q| q.nack_message(message));
    }
}

#[derive(serde::Deserialize)]
struct StateFile {
    time: String,
    #[serde(default)]
    acked: HashMap<String, Vec<String>>,
}

#[derive(serde::Serialize)]
struct StateFileRef<'a, M: serde::Serialize> {
    time: &'a str,
    acked: &'a M,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn batch_params_first_query_is_unbounded() {
        let (n, d) = next_batch_params(false, BatchStats::default(), 10, Duration::seconds(11));
        assert_eq!(n, 10);
        assert_eq!(d, None);
    }

    #[test]
    fn batch_params_hit_limit_doubles_cap() {
        let prev = BatchStats {
            count: 10,
            count_at_newest: 10,
            limit: 10,
            duration: Some(Duration::seconds(11)),
        };
        let (n, d) = next_batch_params(true, prev, 10, Duration::seconds(11));
        assert_eq!(n, 20);
        assert_eq!(d, Some(Duration::seconds(11)));
    }

    #[test]
    fn batch_params_under_limit_doubles_window() {
        let prev = BatchStats {
            count: 3,
            count_at_newest: 3,
            limit: 10,
            duration: Some(Duration::seconds(11)),
        };
        let (n, d) = next_batch_params(true, prev, 10, Duration::seconds(11));
        assert_eq!(n, 10);
        assert_eq!(d, Some(Duration::seconds(22)));
    }

    #[test]
    fn batch_params_multi_timestamp_resets() {
        let prev = BatchStats {
            count: 8,
            count_at_newest: 3,
            limit: 20,
            duration: Some(Duration::seconds(22)),
        };
        let (n, d) = next_batch_params(true, prev, 10, Duration::seconds(11));
        assert_eq!(n, 10);
        assert_eq!(d, Some(Duration::seconds(11)));
    }

    #[test]
    fn bed_tag_ttl_is_fixed() {
        assert_eq!(QueueKind::BedTag.ttl(500), 1000);
        assert_eq!(QueueKind::WaveSample.ttl(500), 10000);
    }

    fn wave_sample(ts: &str, mapping_id: i64) -> Message {
        Message::WaveSample(crate::message::WaveSampleRow {
            mapping_id: MappingId(mapping_id),
            timestamp: ts.parse().unwrap(),
            fields: Default::default(),
        })
    }

    #[test]
    fn unresolved_mapping_id_stalls_on_patient_mapping() {
        let registry = PatientIdRegistry::new();
        let mut q = ExtractorQueue::new(QueueKind::WaveSample, 10, None);

        let outcome = q
            .push_message(wave_sample("2024-01-01T00:00:00Z", 7), &registry)
            .unwrap()
            .expect("message should still be dispatched, with an unresolved channel");
        assert_eq!(outcome.0, None);
        assert_eq!(q.stalling_queue(&registry), Some(QueueKind::PatientMapping));

        registry.set_patient_id(MappingId(7), PatientId(99));
        // Resolved in the registry, but `channel_for` hasn't run again yet:
        // `stalling_queue` opportunistically notices and clears the stall.
        assert_eq!(q.stalling_queue(&registry), None);

        let outcome = q
            .push_message(wave_sample("2024-01-01T00:00:01Z", 7), &registry)
            .unwrap()
            .unwrap();
        assert_eq!(outcome.0, Some(PatientId(99)));
        assert_eq!(q.stalling_queue(&registry), None);
    }

    fn patient_mapping(ts: &str, mapping_id: i64, patient_id: i64) -> Message {
        Message::PatientMapping(crate::message::PatientMappingRow {
            mapping_id: MappingId(mapping_id),
            patient_id: PatientId(patient_id),
            timestamp: ts.parse().unwrap(),
            fields: Default::default(),
        })
    }

    /// A redelivered PatientMapping row that was already acked in a prior run
    /// must still re-register its mapping-id -> patient-id association: the
    /// registry is in-memory only, so after a restart it starts empty and can
    /// only be repopulated by messages the reseeded query window re-observes.
    #[test]
    fn already_acked_patient_mapping_redelivery_still_registers_patient_id() {
        let registry = PatientIdRegistry::new();
        let mut q = ExtractorQueue::new(QueueKind::PatientMapping, 10, None);
        let ts: Timestamp = "2024-01-01T00:00:00Z".parse().unwrap();
        let msg = patient_mapping("2024-01-01T00:00:00Z", 7, 99);

        // Simulate state reloaded after a restart: this row was already acked
        // in a prior run (its hash is in acked_saved), but the registry is
        // fresh and knows nothing yet.
        q.acked_saved.entry(ts).or_default().insert(msg.content_hash());
        assert_eq!(registry.get_patient_id(MappingId(7)), None);

        let outcome = q.push_message(msg, &registry).unwrap();
        assert!(outcome.is_none(), "already-acked row must not be redispatched");
        assert_eq!(
            registry.get_patient_id(MappingId(7)),
            Some(PatientId(99)),
            "redelivery of an already-acked PatientMapping row must still register its patient id"
        );
    }

    #[test]
    fn out_of_order_message_is_rejected_without_touching_bookkeeping() {
        let registry = PatientIdRegistry::new();
        let mut q = ExtractorQueue::new(QueueKind::BedTag, 10, None);

        q.push_message(bed_tag_msg("2024-01-01T00:01:00Z"), &registry)
            .unwrap()
            .unwrap();
        let rejected = q
            .push_message(bed_tag_msg("2024-01-01T00:00:30Z"), &registry)
            .unwrap();
        assert!(rejected.is_none());
        assert_eq!(q.newest_seen_timestamp(), Some("2024-01-01T00:01:00Z".parse().unwrap()));
    }

    fn bed_tag_msg(ts: &str) -> Message {
        Message::BedTag(crate::message::BedTagRow {
            timestamp: ts.parse().unwrap(),
            fields: Default::default(),
        })
    }
}
