use crate::error::DbError;
use crate::message::{MappingId, Message, PatientId};
use crate::queue::QueueKind;
use crate::timestamp::Timestamp;

/// Describes one bounded query: which queue it is for, the row cap, the
/// timestamp window, and (for mapping/patient-id-keyed queues) an optional
/// key filter. Built by `ExtractorQueue::next_message_parser` /
/// `final_message_parser` and consumed by `Database::get_messages`.
///
/// The core does not know SQL dialects; a real implementation of `Database`
/// is expected to translate this into a dialect-specific, parameterized
/// query using its own `dialect`/`paramstyle`.
#[derive(Debug, Clone)]
pub struct ParserSpec {
    pub kind: QueueKind,
    pub limit: u64,
    pub time_ge: Option<Timestamp>,
    pub time_le: Option<Timestamp>,
    pub time_lt: Option<Timestamp>,
    pub reverse: bool,
    pub mapping_id: Option<MappingId>,
    pub patient_id: Option<PatientId>,
}

/// The database collaborator the core drives but does not implement: one
/// connection abstraction, with a single polymorphic query entry point keyed
/// by `ParserSpec::kind`. Rows are returned eagerly (rather than as a lazy
/// cursor) so the trait stays object-safe; the core treats each `run()` as
/// at most one such call regardless.
pub trait Database: Send + Sync {
    fn dialect(&self) -> &str;
    fn paramstyle(&self) -> &str;

    /// Runs the bounded query described by `spec`, returning matching rows in
    /// non-decreasing timestamp order (or reverse, when `spec.reverse`).
    fn get_messages(&self, spec: &ParserSpec) -> Result<Vec<Message>, DbError>;
}
