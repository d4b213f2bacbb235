//! Persistent state store for VM instance declarations.
//!
//! Backed by redb for ACID transactions. Three tables are kept in step
//! inside every write transaction:
//!
//! - `instances`: id -> JSON-serialized [`Instance`]
//! - `macs`: mac address -> owning instance id
//! - `pids`: process id -> owning instance id
//!
//! The secondary tables enforce global uniqueness of `mac` and `pid`: a
//! write that would take a key owned by another instance is rejected
//! atomically with [`Error::ConstraintViolation`], and a write that
//! changes an instance's own keys releases the old entries in the same
//! transaction.

use crate::error::{Error, Result};
use crate::instance::{Instance, VmState};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

/// Table of instance records (id -> JSON-serialized Instance).
const INSTANCES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Secondary index: MAC address -> instance id.
const MACS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("macs");

/// Secondary index: process id -> instance id.
const PIDS_TABLE: TableDefinition<i32, &str> = TableDefinition::new("pids");

/// Thread-safe handle to the instance state store.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open the store at a specific path, creating parent directories and
    /// tables as needed.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::database("open", format!("failed to create store directory: {}", e))
            })?;
        }

        let db = Database::create(path)
            .map_err(|e| Error::database("open", format!("failed to open store: {}", e)))?;

        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        Ok(store)
    }

    /// Create all tables so later read transactions never race table creation.
    fn init_tables(&self) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("init", e.to_string()))?;

        write_txn
            .open_table(INSTANCES_TABLE)
            .map_err(|e| Error::database("init", e.to_string()))?;
        write_txn
            .open_table(MACS_TABLE)
            .map_err(|e| Error::database("init", e.to_string()))?;
        write_txn
            .open_table(PIDS_TABLE)
            .map_err(|e| Error::database("init", e.to_string()))?;

        write_txn
            .commit()
            .map_err(|e| Error::database("init", e.to_string()))?;

        Ok(())
    }

    /// Get an instance by id.
    pub fn get(&self, id: &str) -> Result<Instance> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("get", e.to_string()))?;
        let table = read_txn
            .open_table(INSTANCES_TABLE)
            .map_err(|e| Error::database("get", e.to_string()))?;

        match table
            .get(id)
            .map_err(|e| Error::database("get", e.to_string()))?
        {
            Some(guard) => decode_instance(guard.value()),
            None => Err(Error::not_found(id)),
        }
    }

    /// List all instances. The order is unspecified.
    pub fn list(&self) -> Result<Vec<Instance>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("list", e.to_string()))?;
        let table = read_txn
            .open_table(INSTANCES_TABLE)
            .map_err(|e| Error::database("list", e.to_string()))?;

        let mut instances = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| Error::database("list", e.to_string()))?
        {
            let (_, value) = entry.map_err(|e| Error::database("list", e.to_string()))?;
            instances.push(decode_instance(value.value())?);
        }

        Ok(instances)
    }

    /// Check whether a MAC address is already owned by any instance.
    pub fn mac_in_use(&self, mac: &str) -> Result<bool> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::database("mac lookup", e.to_string()))?;
        let table = read_txn
            .open_table(MACS_TABLE)
            .map_err(|e| Error::database("mac lookup", e.to_string()))?;
        Ok(table
            .get(mac)
            .map_err(|e| Error::database("mac lookup", e.to_string()))?
            .is_some())
    }

    /// Insert or overwrite an instance record.
    ///
    /// Required-field validation runs before any write. A `mac` or `pid`
    /// owned by a different instance rejects the whole write with
    /// [`Error::ConstraintViolation`]; keys the instance already owns are
    /// fine. Secondary keys the previous revision held but the new one
    /// does not are released in the same transaction.
    pub fn update(&self, instance: &Instance) -> Result<Instance> {
        instance.validate()?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("update", e.to_string()))?;
        {
            let mut instances = write_txn
                .open_table(INSTANCES_TABLE)
                .map_err(|e| Error::database("update", e.to_string()))?;
            let mut macs = write_txn
                .open_table(MACS_TABLE)
                .map_err(|e| Error::database("update", e.to_string()))?;
            let mut pids = write_txn
                .open_table(PIDS_TABLE)
                .map_err(|e| Error::database("update", e.to_string()))?;

            // Reject writes that would take another instance's keys. The
            // transaction is dropped without commit, so nothing mutates.
            if let Some(owner) = macs
                .get(instance.mac.as_str())
                .map_err(|e| Error::database("update", e.to_string()))?
            {
                if owner.value() != instance.id {
                    return Err(Error::constraint(format!(
                        "mac {} already owned by instance {}",
                        instance.mac,
                        owner.value()
                    )));
                }
            }
            if let Some(pid) = instance.pid {
                if let Some(owner) = pids
                    .get(pid)
                    .map_err(|e| Error::database("update", e.to_string()))?
                {
                    if owner.value() != instance.id {
                        return Err(Error::constraint(format!(
                            "pid {} already owned by instance {}",
                            pid,
                            owner.value()
                        )));
                    }
                }
            }

            // Release the secondary keys the previous revision held before
            // writing the new ones.
            let previous = match instances
                .get(instance.id.as_str())
                .map_err(|e| Error::database("update", e.to_string()))?
            {
                Some(guard) => Some(decode_instance(guard.value())?),
                None => None,
            };
            if let Some(prev) = previous {
                if prev.mac != instance.mac {
                    macs.remove(prev.mac.as_str())
                        .map_err(|e| Error::database("update", e.to_string()))?;
                }
                if let Some(prev_pid) = prev.pid {
                    if instance.pid != Some(prev_pid) {
                        pids.remove(prev_pid)
                            .map_err(|e| Error::database("update", e.to_string()))?;
                    }
                }
            }

            let payload = serde_json::to_vec(instance)
                .map_err(|e| Error::database("update", format!("serialize instance: {}", e)))?;
            instances
                .insert(instance.id.as_str(), payload.as_slice())
                .map_err(|e| Error::database("update", e.to_string()))?;
            macs.insert(instance.mac.as_str(), instance.id.as_str())
                .map_err(|e| Error::database("update", e.to_string()))?;
            if let Some(pid) = instance.pid {
                pids.insert(pid, instance.id.as_str())
                    .map_err(|e| Error::database("update", e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| Error::database("update", e.to_string()))?;

        Ok(instance.clone())
    }

    /// Remove an instance and its secondary keys.
    ///
    /// Only permitted while the instance is `Stopped`. A missing or
    /// non-stopped instance yields [`Error::NotRemoved`] and leaves the
    /// store unchanged.
    pub fn remove(&self, id: &str) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::database("remove", e.to_string()))?;
        {
            let mut instances = write_txn
                .open_table(INSTANCES_TABLE)
                .map_err(|e| Error::database("remove", e.to_string()))?;
            let mut macs = write_txn
                .open_table(MACS_TABLE)
                .map_err(|e| Error::database("remove", e.to_string()))?;
            let mut pids = write_txn
                .open_table(PIDS_TABLE)
                .map_err(|e| Error::database("remove", e.to_string()))?;

            let existing = match instances
                .get(id)
                .map_err(|e| Error::database("remove", e.to_string()))?
            {
                Some(guard) => decode_instance(guard.value())?,
                None => return Err(Error::not_removed(id)),
            };
            if existing.state != VmState::Stopped {
                return Err(Error::not_removed(id));
            }

            instances
                .remove(id)
                .map_err(|e| Error::database("remove", e.to_string()))?;
            macs.remove(existing.mac.as_str())
                .map_err(|e| Error::database("remove", e.to_string()))?;
            if let Some(pid) = existing.pid {
                pids.remove(pid)
                    .map_err(|e| Error::database("remove", e.to_string()))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| Error::database("remove", e.to_string()))?;

        Ok(())
    }
}

fn decode_instance(bytes: &[u8]) -> Result<Instance> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::database("decode", format!("deserialize instance: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Hardware;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.redb");
        let store = StateStore::open_at(&path).unwrap();
        (dir, store)
    }

    fn instance(id: &str, mac: &str, pid: Option<i32>) -> Instance {
        Instance {
            id: id.to_string(),
            image_path: PathBuf::from(format!("/instances/{}/image", id)),
            hardware: Hardware {
                cpus: 2,
                memory: "1G".to_string(),
                disk: "10G".to_string(),
            },
            mac: mac.to_string(),
            state: VmState::Stopped,
            pid,
        }
    }

    #[test]
    fn test_update_round_trip() {
        let (_dir, store) = temp_store();
        let inst = instance("vm1", "52:54:00:00:00:01", None);

        store.update(&inst).unwrap();
        assert_eq!(store.get("vm1").unwrap(), inst);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.get("nope").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_update_rejects_incomplete_record() {
        let (_dir, store) = temp_store();
        let mut inst = instance("vm1", "52:54:00:00:00:01", None);
        inst.hardware.memory = String::new();

        assert!(matches!(
            store.update(&inst).unwrap_err(),
            Error::ConstraintViolation(_)
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_mac_uniqueness_rejection() {
        let (_dir, store) = temp_store();
        store
            .update(&instance("a", "aa:bb:cc:dd:ee:ff", None))
            .unwrap();

        let err = store
            .update(&instance("b", "aa:bb:cc:dd:ee:ff", None))
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");
    }

    #[test]
    fn test_pid_uniqueness_rejection() {
        let (_dir, store) = temp_store();
        let mut a = instance("a", "52:54:00:00:00:01", Some(42));
        a.state = VmState::Running;
        store.update(&a).unwrap();

        let mut b = instance("b", "52:54:00:00:00:02", Some(42));
        b.state = VmState::Running;
        assert!(matches!(
            store.update(&b).unwrap_err(),
            Error::ConstraintViolation(_)
        ));
    }

    #[test]
    fn test_same_instance_keeps_its_own_keys() {
        let (_dir, store) = temp_store();
        let mut inst = instance("a", "52:54:00:00:00:01", Some(42));
        inst.state = VmState::Running;
        store.update(&inst).unwrap();

        // Re-writing the same record with the same mac/pid must succeed.
        store.update(&inst).unwrap();
        assert_eq!(store.get("a").unwrap(), inst);
    }

    #[test]
    fn test_secondary_keys_released_on_change() {
        let (_dir, store) = temp_store();
        let mut a = instance("a", "52:54:00:00:00:01", Some(42));
        a.state = VmState::Running;
        store.update(&a).unwrap();

        // Move instance a to a new mac and pid.
        a.mac = "52:54:00:00:00:99".to_string();
        a.pid = Some(43);
        store.update(&a).unwrap();

        // The old keys are free for another instance now.
        let mut b = instance("b", "52:54:00:00:00:01", Some(42));
        b.state = VmState::Running;
        store.update(&b).unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_remove_guard() {
        let (_dir, store) = temp_store();
        let mut inst = instance("a", "52:54:00:00:00:01", Some(42));
        inst.state = VmState::Running;
        store.update(&inst).unwrap();

        // Running instances cannot be removed.
        assert!(matches!(
            store.remove("a").unwrap_err(),
            Error::NotRemoved { .. }
        ));
        assert!(store.get("a").is_ok());

        // After stopping (and clearing the pid) removal succeeds.
        inst.state = VmState::Stopped;
        inst.pid = None;
        store.update(&inst).unwrap();
        store.remove("a").unwrap();
        assert!(matches!(
            store.get("a").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_remove_missing_is_not_removed() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.remove("nope").unwrap_err(),
            Error::NotRemoved { .. }
        ));
    }

    #[test]
    fn test_remove_releases_secondary_keys() {
        let (_dir, store) = temp_store();
        store
            .update(&instance("a", "52:54:00:00:00:01", None))
            .unwrap();
        store.remove("a").unwrap();

        // The mac is free again.
        store
            .update(&instance("b", "52:54:00:00:00:01", None))
            .unwrap();
        assert!(store.mac_in_use("52:54:00:00:00:01").unwrap());
    }

    #[test]
    fn test_no_duplicate_keys_across_update_sequences() {
        let (_dir, store) = temp_store();

        // Interleave updates, key moves, and rejected writes, then check
        // the global invariant on the surviving set.
        store
            .update(&instance("a", "52:54:00:00:00:01", None))
            .unwrap();
        store
            .update(&instance("b", "52:54:00:00:00:02", None))
            .unwrap();
        let _ = store.update(&instance("c", "52:54:00:00:00:01", None));
        let mut b = instance("b", "52:54:00:00:00:03", Some(7));
        b.state = VmState::Running;
        store.update(&b).unwrap();
        let _ = store.update(&instance("d", "52:54:00:00:00:03", Some(7)));
        store
            .update(&instance("e", "52:54:00:00:00:02", None))
            .unwrap();

        let listed = store.list().unwrap();
        let mut macs: Vec<_> = listed.iter().map(|i| i.mac.clone()).collect();
        macs.sort();
        macs.dedup();
        assert_eq!(macs.len(), listed.len(), "macs must be unique");

        let mut pids: Vec<_> = listed.iter().filter_map(|i| i.pid).collect();
        pids.sort();
        pids.dedup();
        assert_eq!(
            pids.len(),
            listed.iter().filter(|i| i.pid.is_some()).count(),
            "pids must be unique"
        );
    }

    #[test]
    fn test_mac_in_use() {
        let (_dir, store) = temp_store();
        assert!(!store.mac_in_use("52:54:00:00:00:01").unwrap());
        store
            .update(&instance("a", "52:54:00:00:00:01", None))
            .unwrap();
        assert!(store.mac_in_use("52:54:00:00:00:01").unwrap());
    }
}
