use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::error::HandlerError;
use crate::message::{Message, PatientId};
use crate::queue::QueueKind;

/// Lets a handler call back into queue bookkeeping from a worker thread once
/// it has durably committed (or given up on) a message, without the
/// dispatcher needing to know anything about the scheduler that owns the
/// queues.
pub trait AckSink: Send + Sync {
    fn ack_message(&self, queue: QueueKind, message: &Message);
    fn nack_message(&self, queue: QueueKind, message: &Message);
}

/// A handler claims messages on channels it cares about. Real archive
/// writers (waveforms, numerics, enums, alerts, mapping, bed tags) are out of
/// scope for this crate; this trait is the seam they would plug into.
pub trait Handler: Send + Sync + 'static {
    /// Attempts to claim `message`. `Ok(true)` means this handler owns it;
    /// `Ok(false)` lets the dispatcher offer it to the next handler. `Err` is
    /// governed by the dispatcher's `fatal_exceptions` policy. A handler that
    /// claims a message is responsible for eventually calling `ack`/`nack`.
    fn try_handle(
        &self,
        channel: Option<PatientId>,
        message: &Message,
        source_queue: QueueKind,
        ttl: i64,
        ack: &dyn AckSink,
    ) -> Result<bool, HandlerError>;
}

/// Receives messages no live handler claimed.
pub trait DeadLetterHandler: Send + Sync + 'static {
    fn handle(&self, channel: Option<PatientId>, message: &Message, source_queue: QueueKind, ttl: i64);
}

/// Default dead-letter handler: logs and drops. Matches the source's
/// `DefaultDeadLetterHandler`.
pub struct LoggingDeadLetterHandler;

impl DeadLetterHandler for LoggingDeadLetterHandler {
    fn handle(&self, channel: Option<PatientId>, message: &Message, source_queue: QueueKind, _ttl: i64) {
        tracing::warn!(
            queue = source_queue.name(),
            ?channel,
            timestamp = %message.timestamp(),
            "unhandled message"
        );
    }
}

enum Job {
    Send {
        channel: Option<PatientId>,
        message: Message,
        source_queue: QueueKind,
        ttl: i64,
    },
    Shutdown,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    not_empty: Condvar,
    inflight: Mutex<u64>,
    idle: Condvar,
}

/// A fixed-size thread-pool fan-out sink implementing the core's dispatcher
/// interface: `send_message`, `add_handler`, `add_dead_letter_handler`,
/// `flush`, gated by a `fatal_exceptions` policy. Handlers are tried in
/// registration order; the first to claim a message wins.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<std::thread::JoinHandle<()>>,
    handlers: Arc<Mutex<Vec<Arc<dyn Handler>>>>,
    dead_letter: Arc<Mutex<Arc<dyn DeadLetterHandler>>>,
    fatal_exceptions: bool,
    failure: Arc<Mutex<Option<HandlerError>>>,
}

impl Dispatcher {
    pub fn new(parallelism: usize, fatal_exceptions: bool, ack: Arc<dyn AckSink>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            inflight: Mutex::new(0),
            idle: Condvar::new(),
        });
        let handlers: Arc<Mutex<Vec<Arc<dyn Handler>>>> = Arc::new(Mutex::new(Vec::new()));
        let dead_letter: Arc<Mutex<Arc<dyn DeadLetterHandler>>> =
            Arc::new(Mutex::new(Arc::new(LoggingDeadLetterHandler)));
        let failure = Arc::new(Mutex::new(None));

        let workers = (0..parallelism.max(1))
            .map(|_| {
                let shared = shared.clone();
                let handlers = handlers.clone();
                let dead_letter = dead_letter.clone();
                let failure = failure.clone();
                let ack = ack.clone();
                std::thread::spawn(move || {
                    worker_loop(shared, handlers, dead_letter, failure, ack, fatal_exceptions)
                })
            })
            .collect();

        Self {
            shared,
            workers,
            handlers,
            dead_letter,
            fatal_exceptions,
            failure,
        }
    }

    pub fn add_handler(&self, handler: Arc<dyn Handler>) {
        self.handlers.lock().unwrap().push(handler);
    }

    pub fn add_dead_letter_handler(&self, handler: Arc<dyn DeadLetterHandler>) {
        *self.dead_letter.lock().unwrap() = handler;
    }

    pub fn send_message(&self, channel: Option<PatientId>, message: Message, source_queue: QueueKind, ttl: i64) {
        *self.shared.inflight.lock().unwrap() += 1;
        self.shared.queue.lock().unwrap().push_back(Job::Send {
            channel,
            message,
            source_queue,
            ttl,
        });
        self.shared.not_empty.notify_one();
    }

    /// Blocks until every currently-queued message has been tried by a
    /// handler or routed to dead-letter. Propagates the first handler error
    /// seen since the last flush, if `fatal_exceptions` is set.
    pub fn flush(&self) -> Result<(), HandlerError> {
        let mut inflight = self.shared.inflight.lock().unwrap();
        while *inflight > 0 {
            inflight = self.shared.idle.wait(inflight).unwrap();
        }
        drop(inflight);
        if self.fatal_exceptions {
            if let Some(err) = self.failure.lock().unwrap().take() {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        {
            let mut q = self.shared.queue.lock().unwrap();
            for _ in &self.workers {
                q.push_back(Job::Shutdown);
            }
        }
        self.shared.not_empty.notify_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

fn worker_loop(
    shared: Arc<Shared>,
    handlers: Arc<Mutex<Vec<Arc<dyn Handler>>>>,
    dead_letter: Arc<Mutex<Arc<dyn DeadLetterHandler>>>,
    failure: Arc<Mutex<Option<HandlerError>>>,
    ack: Arc<dyn AckSink>,
    fatal_exceptions: bool,
) {
    loop {
        let job = {
            let mut q = shared.queue.lock().unwrap();
            while q.is_empty() {
                q = shared.not_empty.wait(q).unwrap();
            }
            q.pop_front().unwrap()
        };

        let (channel, message, source_queue, ttl) = match job {
            Job::Shutdown => return,
            Job::Send {
                channel,
                message,
                source_queue,
                ttl,
            } => (channel, message, source_queue, ttl),
        };

        let mut claimed = false;
        for handler in handlers.lock().unwrap().iter() {
            match handler.try_handle(channel, &message, source_queue, ttl, ack.as_ref()) {
                Ok(true) => {
                    claimed = true;
                    break;
                }
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!(queue = source_queue.name(), %err, "handler failed");
                    if fatal_exceptions {
                        // Abort-the-process policy: stash the failure for
                        // `flush()` to propagate and stop here, without
                        // falling through to dead-letter.
                        *failure.lock().unwrap() = Some(err);
                        claimed = true;
                    } else {
                        // Logged-and-routed-to-dead-letter policy: treat the
                        // message as unclaimed so it reaches dead_letter below.
                        claimed = false;
                    }
                    break;
                }
            }
        }
        if !claimed {
            dead_letter.lock().unwrap().handle(channel, &message, source_queue, ttl);
        }

        let mut inflight = shared.inflight.lock().unwrap();
        *inflight -= 1;
        if *inflight == 0 {
            shared.idle.notify_all();
        }
    }
}
