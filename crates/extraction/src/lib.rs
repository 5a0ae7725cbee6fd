//! Streaming extraction core for a clinical-database-warehouse unpacker.
//!
//! Drains nine concrete message tables through per-queue adaptive batching,
//! deduplicates and tracks acknowledgements by content hash, durably
//! checkpoints per-queue progress, and resolves cross-queue stalls by
//! priority inheritance. See [`Extractor`] for the scheduler entry point and
//! [`QueueKind`] for the nine queues it drives.

mod bookkeeping;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod hash;
pub mod message;
pub mod origin;
pub mod queue;
pub mod timestamp;

pub use config::ExtractorConfig;
pub use database::{Database, ParserSpec};
pub use dispatcher::{AckSink, DeadLetterHandler, Dispatcher, Handler, LoggingDeadLetterHandler};
pub use error::{DbError, ExtractError, HandlerError};
pub use extractor::Extractor;
pub use hash::{content_hash, CanonicalBytes};
pub use message::{
    AlertRow, BedTagRow, EnumerationValueRow, Fields, MappingId, Message, NumericValueRow, PatientBasicInfoRow,
    PatientDateAttributeRow, PatientId, PatientMappingRow, PatientStringAttributeRow, WaveSampleRow,
};
pub use origin::PatientIdRegistry;
pub use queue::{ExtractorQueue, QueueKind, QueueTable};
pub use timestamp::Timestamp;
