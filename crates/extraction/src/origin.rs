use std::collections::HashMap;
use std::sync::Mutex;

use crate::message::{MappingId, PatientId};

/// Shared association between mapping ids and resolved patient ids.
///
/// Written by the PatientMapping queue as a side effect of computing its own
/// channel, and read by every other mapping-id-keyed queue when it needs to
/// resolve a message's dispatcher channel. Shared by reference across all
/// queues, since a mapping observed by one queue must be visible to the rest
/// without waiting for their own batches to reload it.
#[derive(Default)]
pub struct PatientIdRegistry {
    inner: Mutex<HashMap<MappingId, PatientId>>,
}

impl PatientIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the patient id for `mapping_id`. Returns `None` if the
    /// mapping has not yet been observed ("pending"); callers that cannot
    /// tolerate a pending result should consult `ExtractorQueue::stalling_queue`
    /// instead of retrying this lookup directly.
    pub fn get_patient_id(&self, mapping_id: MappingId) -> Option<PatientId> {
        self.inner.lock().unwrap().get(&mapping_id).copied()
    }

    pub fn set_patient_id(&self, mapping_id: MappingId, patient_id: PatientId) {
        self.inner.lock().unwrap().insert(mapping_id, patient_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unknown_mapping_is_pending() {
        let r = PatientIdRegistry::new();
        assert_eq!(r.get_patient_id(MappingId(1)), None);
    }

    #[test]
    fn resolves_after_set() {
        let r = PatientIdRegistry::new();
        r.set_patient_id(MappingId(1), PatientId(42));
        assert_eq!(r.get_patient_id(MappingId(1)), Some(PatientId(42)));
    }
}
