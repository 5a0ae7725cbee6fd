use std::collections::BTreeMap;

use crate::hash::CanonicalBytes;
use crate::timestamp::Timestamp;

/// Opaque remainder of a database row once its timestamp and routing key have
/// been pulled out. Values are pre-stringified by the (out-of-scope) parser,
/// which keeps every concrete row type `Eq + Hash` without relying on
/// float-bearing JSON, since a handful of warehouse columns are floating
/// point and `serde_json::Value` does not implement `Hash`.
pub type Fields = BTreeMap<String, String>;

/// A clinical-database mapping identifier: the key shared by WaveSample,
/// NumericValue, EnumerationValue, Alert, and PatientMapping rows before a
/// patient association is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct MappingId(pub i64);

/// A resolved patient identifier; also the dispatcher channel for
/// patient-id-keyed queues and for mapping-id-keyed queues once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct PatientId(pub i64);

macro_rules! row_struct {
    ($name:ident { $($field:ident : $ty:ty),* $(,)? }) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            $(pub $field: $ty,)*
            pub timestamp: Timestamp,
            pub fields: Fields,
        }

        impl CanonicalBytes for $name {
            fn canonical_bytes(&self) -> Vec<u8> {
                // A deterministic textual projection: field order is fixed by
                // declaration, `fields` is already sorted (BTreeMap).
                let mut out = format!("{}|{}", stringify!($name), self.timestamp);
                $(
                    out.push('|');
                    out.push_str(&format!("{:?}", self.$field));
                )*
                for (k, v) in &self.fields {
                    out.push('|');
                    out.push_str(k);
                    out.push('=');
                    out.push_str(v);
                }
                out.into_bytes()
            }
        }
    };
}

row_struct!(WaveSampleRow { mapping_id: MappingId });
row_struct!(NumericValueRow { mapping_id: MappingId });
row_struct!(EnumerationValueRow { mapping_id: MappingId });
row_struct!(AlertRow { mapping_id: MappingId });
row_struct!(PatientMappingRow {
    mapping_id: MappingId,
    patient_id: PatientId,
});
row_struct!(PatientBasicInfoRow { patient_id: PatientId });
row_struct!(PatientDateAttributeRow { patient_id: PatientId });
row_struct!(PatientStringAttributeRow { patient_id: PatientId });
row_struct!(BedTagRow {});

/// The sum of every message shape this crate's nine concrete queues can
/// produce. The core treats each payload as opaque beyond timestamp, routing
/// key, and TTL; see `QueueKind` for how those are derived per variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Message {
    WaveSample(WaveSampleRow),
    NumericValue(NumericValueRow),
    EnumerationValue(EnumerationValueRow),
    Alert(AlertRow),
    PatientMapping(PatientMappingRow),
    PatientBasicInfo(PatientBasicInfoRow),
    PatientDateAttribute(PatientDateAttributeRow),
    PatientStringAttribute(PatientStringAttributeRow),
    BedTag(BedTagRow),
}

impl Message {
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Message::WaveSample(r) => r.timestamp,
            Message::NumericValue(r) => r.timestamp,
            Message::EnumerationValue(r) => r.timestamp,
            Message::Alert(r) => r.timestamp,
            Message::PatientMapping(r) => r.timestamp,
            Message::PatientBasicInfo(r) => r.timestamp,
            Message::PatientDateAttribute(r) => r.timestamp,
            Message::PatientStringAttribute(r) => r.timestamp,
            Message::BedTag(r) => r.timestamp,
        }
    }

    pub fn mapping_id(&self) -> Option<MappingId> {
        match self {
            Message::WaveSample(r) => Some(r.mapping_id),
            Message::NumericValue(r) => Some(r.mapping_id),
            Message::EnumerationValue(r) => Some(r.mapping_id),
            Message::Alert(r) => Some(r.mapping_id),
            Message::PatientMapping(r) => Some(r.mapping_id),
            _ => None,
        }
    }
}

impl CanonicalBytes for Message {
    fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Message::WaveSample(r) => r.canonical_bytes(),
            Message::NumericValue(r) => r.canonical_bytes(),
            Message::EnumerationValue(r) => r.canonical_bytes(),
            Message::Alert(r) => r.canonical_bytes(),
            Message::PatientMapping(r) => r.canonical_bytes(),
            Message::PatientBasicInfo(r) => r.canonical_bytes(),
            Message::PatientDateAttribute(r) => r.canonical_bytes(),
            Message::PatientStringAttribute(r) => r.canonical_bytes(),
            Message::BedTag(r) => r.canonical_bytes(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn row(ts: &str, mapping_id: i64) -> WaveSampleRow {
        WaveSampleRow {
            mapping_id: MappingId(mapping_id),
            timestamp: ts.parse().unwrap(),
            fields: Fields::new(),
        }
    }

    #[test]
    fn equal_rows_hash_equal() {
        let a = row("2024-01-01T00:00:00Z", 1);
        let b = row("2024-01-01T00:00:00Z", 1);
        assert_eq!(a, b);

        let mut ha = DefaultHasher::new();
        a.hash(&mut ha);
        let mut hb = DefaultHasher::new();
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn distinct_rows_have_distinct_hashes() {
        let a = row("2024-01-01T00:00:00Z", 1);
        let b = row("2024-01-01T00:00:00Z", 2);
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
