use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::database::Database;
use crate::dispatcher::{AckSink, DeadLetterHandler, Dispatcher, Handler};
use crate::error::ExtractError;
use crate::origin::PatientIdRegistry;
use crate::queue::{ExtractorQueue, QueueKind, QueueTable};
use crate::timestamp::Timestamp;

/// The scheduler: owns every registered queue, a virtual clock
/// (`current_timestamp`), an insertion-ordered `queue_timestamp` map used for
/// least-advanced-first selection with round-robin tie-breaking, and the
/// database/dispatcher collaborators it drives.
///
/// `run()` advances exactly one queue by one batch; callers loop it (typically
/// behind `idle()`, sleeping when every queue reports nothing to do).
pub struct Extractor {
    db: Box<dyn Database>,
    dest_dir: Option<PathBuf>,
    deterministic_output: bool,
    queues: Arc<QueueTable>,
    queue_timestamp: IndexMap<QueueKind, Timestamp>,
    current_timestamp: Timestamp,
    dispatcher: Dispatcher,
    origin: PatientIdRegistry,
}

impl Extractor {
    pub fn new(db: Box<dyn Database>, dest_dir: Option<PathBuf>, parallelism: usize, fatal_exceptions: bool, deterministic_output: bool) -> Self {
        let queues = Arc::new(QueueTable::new());
        let ack_sink: Arc<dyn AckSink> = queues.clone();
        let dispatcher = Dispatcher::new(parallelism, fatal_exceptions, ack_sink);
        Self {
            db,
            dest_dir,
            deterministic_output,
            queues,
            queue_timestamp: IndexMap::new(),
            current_timestamp: Timestamp::VERY_OLD,
            dispatcher,
            origin: PatientIdRegistry::new(),
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn Handler>) {
        self.dispatcher.add_handler(handler);
    }

    pub fn add_dead_letter_handler(&self, handler: Arc<dyn DeadLetterHandler>) {
        self.dispatcher.add_dead_letter_handler(handler);
    }

    pub fn current_timestamp(&self) -> Timestamp {
        self.current_timestamp
    }

    /// Registers a queue, loading any persisted state for it, and seeds its
    /// entry in `queue_timestamp` and the scheduler's virtual clock from
    /// whatever state came back. Must be called before `run`/`idle`/`flush`.
    pub fn add_queue(&mut self, kind: QueueKind, limit_per_batch: u64, end_time: Option<Timestamp>) -> Result<(), ExtractError> {
        let mut queue = ExtractorQueue::new(kind, limit_per_batch, end_time);
        if let Some(dir) = &self.dest_dir {
            queue.load_state(dir)?;
        }

        let mut next_fire = Timestamp::VERY_OLD;
        if let Some(newest) = queue.newest_seen_timestamp() {
            next_fire = newest.saturating_add(kind.bias());
            if newest > self.current_timestamp {
                self.current_timestamp = newest;
            }
        }

        self.queue_timestamp.insert(kind, next_fire);
        self.queues.insert(kind, queue);
        Ok(())
    }

    /// The queue with the smallest scheduled fire time, ties broken by
    /// registration order (the first minimal entry encountered wins).
    fn argmin_queue(&self) -> QueueKind {
        let mut iter = self.queue_timestamp.iter();
        let (mut best, mut best_ts) = iter
            .next()
            .map(|(k, t)| (*k, *t))
            .expect("at least one queue must be registered before run()/idle()");
        for (k, ts) in iter {
            if *ts < best_ts {
                best = *k;
                best_ts = *ts;
            }
        }
        best
    }

    /// Follows `stalling_queue()` redirects starting from `start`, returning
    /// the final queue and whether any redirection happened at all.
    fn resolve_stalls(&self, start: QueueKind) -> (QueueKind, bool) {
        let mut resolved = start;
        let mut stalled = false;
        while let Some(next) = self.queues.with(resolved, |q| q.stalling_queue(&self.origin)) {
            resolved = next;
            stalled = true;
        }
        (resolved, stalled)
    }

    /// One scheduling step. Advances the resolved queue by one batch. See the
    /// module doc for the overall loop shape.
    pub fn run(&mut self) -> Result<(), ExtractError> {
        let candidate = self.argmin_queue();

        let selected = if self.queue_timestamp[&candidate] > self.current_timestamp {
            // Every queue is idle relative to the virtual clock: rotate the
            // first-in-order queue to the end and run it anyway, so idle
            // queues get serviced round-robin rather than starving.
            let (kind, ts) = self.queue_timestamp.shift_remove_index(0).unwrap();
            self.queue_timestamp.insert(kind, ts);
            kind
        } else {
            candidate
        };

        let (resolved, stalled) = self.resolve_stalls(selected);

        if stalled {
            let reached_present = self.queues.with(resolved, |q| q.reached_present());
            if reached_present {
                self.update_current_time()?;
            }
        }

        self.run_batch(resolved)
    }

    /// Mirrors `run()`'s selection logic without running a batch: reports
    /// whether the queue that would be selected has nothing to do yet.
    pub fn idle(&self) -> bool {
        let candidate = self.argmin_queue();
        if self.queue_timestamp[&candidate] > self.current_timestamp {
            return true;
        }
        let (resolved, _) = self.resolve_stalls(candidate);
        self.queue_timestamp[&resolved] > self.current_timestamp
    }

    /// Probes every queue's tail with a cheap reverse limit-1 query, lifting
    /// the virtual clock so a stall redirect does not wait forever on a
    /// blocker that has in fact caught up.
    fn update_current_time(&mut self) -> Result<(), ExtractError> {
        let kinds: Vec<QueueKind> = self.queue_timestamp.keys().copied().collect();
        for kind in kinds {
            let spec = self.queues.with(kind, |q| q.final_message_parser());
            for msg in self.db.get_messages(&spec)? {
                let ts = msg.timestamp();
                if ts > self.current_timestamp {
                    self.current_timestamp = ts;
                }
            }
        }
        Ok(())
    }

    fn run_batch(&mut self, kind: QueueKind) -> Result<(), ExtractError> {
        let spec = self.queues.with(kind, |q| q.next_message_parser());
        let messages = self.db.get_messages(&spec)?;

        for msg in messages {
            let ts = msg.timestamp();
            if ts > self.current_timestamp {
                self.current_timestamp = ts;
            }
            let dispatched = msg.clone();
            let outcome = self.queues.with(kind, |q| {
                q.observe_query_time(ts);
                q.push_message(msg, &self.origin)
            })?;
            if let Some((channel, ttl)) = outcome {
                self.dispatcher.send_message(channel, dispatched, kind, ttl);
            }
        }

        let reached_present = self.queues.with(kind, |q| q.reached_present());
        let next_fire = if reached_present {
            self.current_timestamp.saturating_add(kind.idle_delay())
        } else {
            self.queues.with(kind, |q| q.query_time()).saturating_add(kind.bias())
        };
        self.queue_timestamp.insert(kind, next_fire);
        Ok(())
    }

    #[cfg(test)]
    fn registration_order(&self) -> Vec<QueueKind> {
        self.queue_timestamp.keys().copied().collect()
    }

    /// Flushes the dispatcher (blocking until every dispatched message has
    /// been tried by a handler or dead-lettered), then durably saves every
    /// queue's state.
    pub fn flush(&self) -> Result<(), ExtractError> {
        self.dispatcher.flush()?;
        if let Some(dir) = &self.dest_dir {
            for kind in self.queue_timestamp.keys().copied() {
                self.queues.with(kind, |q| q.save_state(dir, self.deterministic_output))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::database::ParserSpec;
    use crate::error::DbError;
    use crate::message::{BedTagRow, Fields, Message};
    use std::sync::Mutex as StdMutex;

    /// An in-memory `Database` fixture: each call to `get_messages` pops from
    /// a fixed, pre-seeded backlog matching the spec's kind/time-window
    /// filters. Good enough to drive the scheduler in tests without a real
    /// warehouse connection.
    struct FakeDatabase {
        rows: StdMutex<Vec<Message>>,
    }

    impl FakeDatabase {
        fn new(rows: Vec<Message>) -> Self {
            Self {
                rows: StdMutex::new(rows),
            }
        }
    }

    impl Database for FakeDatabase {
        fn dialect(&self) -> &str {
            "fake"
        }

        fn paramstyle(&self) -> &str {
            "named"
        }

        fn get_messages(&self, spec: &ParserSpec) -> Result<Vec<Message>, DbError> {
            let rows = self.rows.lock().unwrap();
            let mut matched: Vec<Message> = rows
                .iter()
                .filter(|m| match m {
                    Message::BedTag(_) => spec.kind == crate::queue::QueueKind::BedTag,
                    _ => false,
                })
                .filter(|m| spec.time_ge.map_or(true, |ge| m.timestamp() >= ge))
                .filter(|m| spec.time_le.map_or(true, |le| m.timestamp() <= le))
                .filter(|m| spec.time_lt.map_or(true, |lt| m.timestamp() < lt))
                .cloned()
                .collect();
            matched.sort_by_key(|m| m.timestamp());
            if spec.reverse {
                matched.reverse();
            }
            matched.truncate(spec.limit as usize);
            Ok(matched)
        }
    }

    fn bed_tag(ts: &str) -> Message {
        Message::BedTag(BedTagRow {
            timestamp: ts.parse().unwrap(),
            fields: Fields::new(),
        })
    }

    #[test]
    fn run_dispatches_a_single_bed_tag_row() {
        let db = FakeDatabase::new(vec![bed_tag("2024-01-01T00:00:00Z")]);
        let mut ex = Extractor::new(Box::new(db), None, 1, true, false);
        ex.add_queue(QueueKind::BedTag, 10, None).unwrap();

        ex.run().unwrap();
        ex.flush().unwrap();

        assert_eq!(ex.current_timestamp(), "2024-01-01T00:00:00Z".parse().unwrap());
    }

    #[test]
    fn idle_queue_reports_idle_after_catching_up() {
        let db = FakeDatabase::new(vec![bed_tag("2024-01-01T00:00:00Z")]);
        let mut ex = Extractor::new(Box::new(db), None, 1, true, false);
        ex.add_queue(QueueKind::BedTag, 10, Some("2024-01-01T00:00:01Z".parse().unwrap()))
            .unwrap();

        assert!(!ex.idle());
        ex.run().unwrap();
        assert!(ex.idle());
    }

    #[test]
    fn round_robins_when_every_queue_is_idle() {
        let db = FakeDatabase::new(vec![]);
        let mut ex = Extractor::new(Box::new(db), None, 1, true, false);
        ex.add_queue(QueueKind::BedTag, 10, Some(Timestamp::VERY_OLD)).unwrap();
        ex.add_queue(QueueKind::PatientBasicInfo, 10, Some(Timestamp::VERY_OLD))
            .unwrap();

        // Run 1 and 2: each queue still fires at VERY_OLD (== current_timestamp),
        // so neither hits the idle-all branch; they just get serviced in turn.
        assert_eq!(ex.registration_order(), vec![QueueKind::BedTag, QueueKind::PatientBasicInfo]);
        ex.run().unwrap(); // services BedTag, whose next fire moves into the future
        ex.run().unwrap(); // services PatientBasicInfo, same

        // Both queues now fire strictly after current_timestamp (still VERY_OLD,
        // since no data was ever seen): the idle-all branch triggers and rotates
        // the first-in-order queue (BedTag) to the end.
        assert!(ex.idle());
        ex.run().unwrap();
        assert_eq!(ex.registration_order(), vec![QueueKind::PatientBasicInfo, QueueKind::BedTag]);
    }
}
