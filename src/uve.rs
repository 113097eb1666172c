//! UVE cache: latest-value records per registered type, with the
//! sequence-number sync protocol.
//!
//! Each registered UVE type owns a map keyed by `(table, key)` holding the
//! merged latest value, its sequence number, and an update count. Deletes
//! are tombstones: the entry stays in the cache (so the collector can learn
//! about the deletion on resync) until a non-deleted submission with the
//! same key replaces it.
//!
//! On a fresh `Established` session the collector sends its last-seen seqno
//! per type; every cached entry strictly newer than that baseline is
//! replayed with the sync hint and its original seqno.
//!
//! The registered type set is fixed at construction; submissions against an
//! unknown type are validation failures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use beacon_protocol::UvePayload;
use tracing::{debug, error};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A registered UVE type: its wire name and payload shape.
#[derive(Debug, Clone)]
pub struct UveTypeDesc {
    pub type_name: String,
    pub dynamic: bool,
}

impl UveTypeDesc {
    pub fn new(type_name: impl Into<String>) -> Self {
        UveTypeDesc {
            type_name: type_name.into(),
            dynamic: false,
        }
    }

    pub fn dynamic(type_name: impl Into<String>) -> Self {
        UveTypeDesc {
            type_name: type_name.into(),
            dynamic: true,
        }
    }
}

/// One cached record.
#[derive(Debug, Clone)]
pub struct UveEntry {
    pub data: UvePayload,
    pub seqno: u64,
    pub update_count: u64,
}

#[derive(Debug)]
struct PerTypeMap {
    dynamic: bool,
    /// `(table, key) -> entry`; `table` is empty for the default table.
    entries: HashMap<(String, String), UveEntry>,
    /// Highest seqno ever assigned to this type.
    last_seqno: u64,
}

// ---------------------------------------------------------------------------
// UveCache
// ---------------------------------------------------------------------------

/// Shared cache over all registered types.
#[derive(Debug, Clone)]
pub struct UveCache {
    types: Arc<Mutex<HashMap<String, PerTypeMap>>>,
}

impl UveCache {
    /// Build the registry from the type descriptors collected at init. The
    /// type set is immutable afterwards.
    pub fn new(descriptors: Vec<UveTypeDesc>) -> Self {
        let mut types = HashMap::new();
        for desc in descriptors {
            if types
                .insert(
                    desc.type_name.clone(),
                    PerTypeMap {
                        dynamic: desc.dynamic,
                        entries: HashMap::new(),
                        last_seqno: 0,
                    },
                )
                .is_some()
            {
                error!(type_name = %desc.type_name, "UVE type registered twice");
            }
        }
        UveCache {
            types: Arc::new(Mutex::new(types)),
        }
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.lock().expect("uve lock").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.lock().expect("uve lock").contains_key(type_name)
    }

    pub fn is_dynamic(&self, type_name: &str) -> Option<bool> {
        self.types
            .lock()
            .expect("uve lock")
            .get(type_name)
            .map(|m| m.dynamic)
    }

    /// Apply a fresh (non-replay) submission to the cache under `seqno`.
    /// Returns false when the type is unregistered.
    pub fn update(&self, type_name: &str, incoming: &UvePayload, seqno: u64) -> bool {
        let mut types = self.types.lock().expect("uve lock");
        let Some(per_type) = types.get_mut(type_name) else {
            error!(type_name, "submission for unregistered UVE type");
            return false;
        };
        per_type.last_seqno = seqno;
        let key = (incoming.table().to_owned(), incoming.name().to_owned());
        match per_type.entries.get_mut(&key) {
            None => {
                debug!(type_name, key = %key.1, seqno, "adding UVE entry");
                per_type.entries.insert(
                    key,
                    UveEntry {
                        data: incoming.clone(),
                        seqno,
                        update_count: 0,
                    },
                );
            }
            Some(entry) if entry.data.deleted() => {
                if incoming.deleted() {
                    // Duplicate delete: refresh the seqno only.
                    error!(type_name, key = %key.1, "duplicate UVE delete");
                    entry.seqno = seqno;
                } else {
                    // A deleted entry is replaced outright by a re-add.
                    debug!(type_name, key = %key.1, seqno, "re-adding deleted UVE entry");
                    *entry = UveEntry {
                        data: incoming.clone(),
                        seqno,
                        update_count: 0,
                    };
                }
            }
            Some(entry) => {
                entry.data.merge_from(incoming);
                entry.seqno = seqno;
                entry.update_count += 1;
            }
        }
        true
    }

    /// Replay every entry whose seqno is strictly newer than the per-type
    /// baselines in `server_seqnos` (missing type = baseline 0). `emit` is
    /// called with `(type_name, entry)`; delivery is the caller's problem.
    /// Returns the number of entries emitted.
    pub fn sync(
        &self,
        server_seqnos: &HashMap<String, u64>,
        mut emit: impl FnMut(&str, &UveEntry),
    ) -> usize {
        let types = self.types.lock().expect("uve lock");
        let mut count = 0;
        for (type_name, per_type) in types.iter() {
            let baseline = server_seqnos.get(type_name).copied().unwrap_or(0);
            for entry in per_type.entries.values() {
                if entry.seqno > baseline {
                    debug!(type_name, key = entry.data.name(), seqno = entry.seqno, "sync replay");
                    emit(type_name, entry);
                    count += 1;
                }
            }
        }
        count
    }

    /// Replay one type's whole cache (introspect dump). Returns the count,
    /// or `None` for an unregistered type.
    pub fn sync_type(
        &self,
        type_name: &str,
        mut emit: impl FnMut(&str, &UveEntry),
    ) -> Option<usize> {
        let types = self.types.lock().expect("uve lock");
        let per_type = types.get(type_name)?;
        let mut count = 0;
        for entry in per_type.entries.values() {
            emit(type_name, entry);
            count += 1;
        }
        Some(count)
    }

    /// Snapshot of one type's entries, ordered by `(table, key)`.
    pub fn dump_type(&self, type_name: &str) -> Option<Vec<UveEntry>> {
        let types = self.types.lock().expect("uve lock");
        let per_type = types.get(type_name)?;
        let mut keyed: Vec<_> = per_type.entries.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        Some(keyed.into_iter().map(|(_, entry)| entry.clone()).collect())
    }

    /// `(type_name, dynamic, last assigned seqno)` for every registered
    /// type, sorted by name.
    pub fn type_seqnos(&self) -> Vec<(String, bool, u64)> {
        let types = self.types.lock().expect("uve lock");
        let mut out: Vec<_> = types
            .iter()
            .map(|(name, per_type)| (name.clone(), per_type.dynamic, per_type.last_seqno))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::{UveCache, UveTypeDesc};
    use beacon_protocol::{DynamicUveData, UveData, UvePayload};
    use std::collections::HashMap;

    fn data(name: &str, attrs: &[(&str, &str)], deleted: bool) -> UvePayload {
        let mut payload = UveData::new(name);
        payload.deleted = deleted;
        for (key, value) in attrs {
            payload.attrs.insert((*key).to_owned(), (*value).to_owned());
        }
        UvePayload::Data(payload)
    }

    fn cache() -> UveCache {
        UveCache::new(vec![UveTypeDesc::new("UVETest")])
    }

    #[test]
    fn submissions_merge_and_tombstones_are_kept() {
        let cache = cache();
        assert!(cache.update("UVETest", &data("uve1", &[], false), 1));
        assert!(cache.update("UVETest", &data("uve1", &[("xyz", "345")], false), 2));
        assert!(cache.update("UVETest", &data("uve2", &[("xyz", "12")], false), 3));
        assert!(cache.update("UVETest", &data("uve2", &[], true), 4));

        let entries = cache.dump_type("UVETest").unwrap();
        assert_eq!(entries.len(), 2);
        let uve1 = entries.iter().find(|e| e.data.name() == "uve1").unwrap();
        assert_eq!(uve1.seqno, 2);
        assert_eq!(uve1.update_count, 1);
        match &uve1.data {
            UvePayload::Data(d) => assert_eq!(d.attrs.get("xyz").map(String::as_str), Some("345")),
            UvePayload::Dynamic(_) => panic!("wrong payload shape"),
        }
        let uve2 = entries.iter().find(|e| e.data.name() == "uve2").unwrap();
        assert_eq!(uve2.seqno, 4);
        assert!(uve2.data.deleted());
    }

    #[test]
    fn sync_replays_entries_newer_than_the_baseline() {
        let cache = cache();
        cache.update("UVETest", &data("uve1", &[], false), 1);
        cache.update("UVETest", &data("uve1", &[("xyz", "345")], false), 2);
        cache.update("UVETest", &data("uve2", &[("xyz", "12")], false), 3);
        cache.update("UVETest", &data("uve2", &[], true), 4);

        // Baseline 0: both entries replay with their original seqnos.
        let mut seqnos: Vec<u64> = Vec::new();
        let count = cache.sync(&HashMap::from([("UVETest".to_owned(), 0)]), |_, entry| {
            seqnos.push(entry.seqno);
        });
        assert_eq!(count, 2);
        seqnos.sort_unstable();
        assert_eq!(seqnos, vec![2, 4]);

        // Baseline 2: only the tombstone is newer.
        let mut replayed = Vec::new();
        cache.sync(&HashMap::from([("UVETest".to_owned(), 2)]), |_, entry| {
            replayed.push((entry.data.name().to_owned(), entry.seqno));
        });
        assert_eq!(replayed, vec![("uve2".to_owned(), 4)]);

        // A type missing from the server map is treated as baseline 0.
        let count = cache.sync(&HashMap::new(), |_, _| {});
        assert_eq!(count, 2);
    }

    #[test]
    fn duplicate_delete_updates_seqno_without_counting_an_update() {
        let cache = cache();
        cache.update("UVETest", &data("uve1", &[], false), 1);
        cache.update("UVETest", &data("uve1", &[], true), 2);
        cache.update("UVETest", &data("uve1", &[], true), 3);

        let entries = cache.dump_type("UVETest").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].seqno, 3);
        assert!(entries[0].data.deleted());
        assert_eq!(entries[0].update_count, 0);
    }

    #[test]
    fn re_add_replaces_a_tombstone() {
        let cache = cache();
        cache.update("UVETest", &data("uve1", &[("a", "1")], false), 1);
        cache.update("UVETest", &data("uve1", &[], true), 2);
        cache.update("UVETest", &data("uve1", &[("b", "2")], false), 3);

        let entries = cache.dump_type("UVETest").unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].data.deleted());
        match &entries[0].data {
            UvePayload::Data(d) => {
                // Replacement, not merge: the pre-delete attribute is gone.
                assert!(!d.attrs.contains_key("a"));
                assert_eq!(d.attrs.get("b").map(String::as_str), Some("2"));
            }
            UvePayload::Dynamic(_) => panic!("wrong payload shape"),
        }
    }

    #[test]
    fn entries_with_different_tables_are_distinct() {
        let cache = cache();
        let mut in_table = UveData::new("node1");
        in_table.table = "ObjectCollectorInfo".to_owned();
        cache.update("UVETest", &data("node1", &[], false), 1);
        cache.update("UVETest", &UvePayload::Data(in_table), 2);
        assert_eq!(cache.dump_type("UVETest").unwrap().len(), 2);
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let cache = cache();
        assert!(!cache.update("NoSuchUVE", &data("x", &[], false), 1));
        assert!(cache.dump_type("NoSuchUVE").is_none());
    }

    #[test]
    fn seqno_is_strictly_increasing_per_entry() {
        let cache = cache();
        let mut last = 0;
        for seqno in 1..=10 {
            cache.update("UVETest", &data("uve1", &[("n", "v")], seqno % 4 == 0), seqno);
            let entries = cache.dump_type("UVETest").unwrap();
            assert!(entries[0].seqno > last);
            last = entries[0].seqno;
        }
    }

    #[test]
    fn dynamic_type_replaces_element_maps() {
        let cache = UveCache::new(vec![UveTypeDesc::dynamic("ConfigUVE")]);
        let first = UvePayload::Dynamic(DynamicUveData {
            name: "node1".to_owned(),
            table: String::new(),
            deleted: false,
            elements: [("log_level".to_owned(), "info".to_owned())].into(),
        });
        let second = UvePayload::Dynamic(DynamicUveData {
            name: "node1".to_owned(),
            table: String::new(),
            deleted: false,
            elements: [("log_local".to_owned(), "true".to_owned())].into(),
        });
        cache.update("ConfigUVE", &first, 1);
        cache.update("ConfigUVE", &second, 2);
        let entries = cache.dump_type("ConfigUVE").unwrap();
        match &entries[0].data {
            UvePayload::Dynamic(d) => {
                assert_eq!(d.elements.len(), 1);
                assert!(d.elements.contains_key("log_local"));
            }
            UvePayload::Data(_) => panic!("wrong payload shape"),
        }
    }
}
