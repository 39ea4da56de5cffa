//! Immutable forensic audit trail.
//!
//! Tracks WHO changed WHAT, WHEN, and WHY. Entries for one entity form a hash
//! chain: `hash_signature = SHA-256(previous_hash || canonical(record))`, so
//! recomputing the chain reproduces every signature. Entries are never
//! updated or deleted.

use crate::errors::{EngineError, EngineResult};
use crate::models::{new_id, AuditLogEntry};
use crate::store::db::ForensicStore;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};

/// Fields of a change being recorded.
#[derive(Debug, Clone, Default)]
pub struct ChangeRecord {
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by_user_id: Option<String>,
    pub change_reason: Option<String>,
}

impl ChangeRecord {
    pub fn new(entity_type: &str, entity_id: &str, action: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            ..Default::default()
        }
    }

    pub fn field(mut self, name: &str, old: Option<&str>, new: Option<&str>) -> Self {
        self.field_name = Some(name.to_string());
        self.old_value = old.map(|s| s.to_string());
        self.new_value = new.map(|s| s.to_string());
        self
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.change_reason = Some(reason.to_string());
        self
    }

    pub fn by_user(mut self, user_id: &str) -> Self {
        self.changed_by_user_id = Some(user_id.to_string());
        self
    }
}

pub struct AuditLogger;

impl AuditLogger {
    /// Canonical serialization of a record for hashing. Field order is fixed;
    /// absent fields serialize as an empty slot.
    fn canonical(entry: &AuditLogEntry) -> String {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}",
            entry.entity_type,
            entry.entity_id,
            entry.action,
            opt(&entry.field_name),
            opt(&entry.old_value),
            opt(&entry.new_value),
            opt(&entry.changed_by_user_id),
            opt(&entry.change_reason),
            entry.timestamp.to_rfc3339(),
        )
    }

    pub fn compute_signature(previous_hash: Option<&str>, entry: &AuditLogEntry) -> String {
        let mut hasher = Sha256::new();
        hasher.update(previous_hash.unwrap_or("").as_bytes());
        hasher.update(Self::canonical(entry).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Append a chain entry on an already-held connection (for use inside a
    /// store transaction).
    pub fn log_change_on(conn: &Connection, record: ChangeRecord) -> EngineResult<AuditLogEntry> {
        let (previous_hash, last_seq): (Option<String>, i64) = {
            let mut stmt = conn.prepare(
                "SELECT hash_signature, seq FROM audit_log
                 WHERE entity_id = ?1 ORDER BY seq DESC LIMIT 1",
            )?;
            let mut rows = stmt.query_map(params![record.entity_id], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, i64>(1)?))
            })?;
            match rows.next().transpose()? {
                Some((hash, seq)) => (hash, seq),
                None => (None, 0),
            }
        };

        let mut entry = AuditLogEntry {
            id: new_id(),
            entity_type: record.entity_type,
            entity_id: record.entity_id,
            action: record.action,
            field_name: record.field_name,
            old_value: record.old_value,
            new_value: record.new_value,
            changed_by_user_id: record.changed_by_user_id,
            change_reason: record.change_reason,
            previous_hash: previous_hash.clone(),
            hash_signature: None,
            timestamp: Utc::now(),
        };
        entry.hash_signature = Some(Self::compute_signature(previous_hash.as_deref(), &entry));

        conn.execute(
            "INSERT INTO audit_log (id, entity_type, entity_id, action, field_name, old_value,
                new_value, changed_by_user_id, change_reason, previous_hash, hash_signature,
                timestamp, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.id,
                entry.entity_type,
                entry.entity_id,
                entry.action,
                entry.field_name,
                entry.old_value,
                entry.new_value,
                entry.changed_by_user_id,
                entry.change_reason,
                entry.previous_hash,
                entry.hash_signature,
                entry.timestamp.to_rfc3339(),
                last_seq + 1,
            ],
        )?;
        Ok(entry)
    }

    pub fn log_change(store: &ForensicStore, record: ChangeRecord) -> EngineResult<AuditLogEntry> {
        store.with_conn(|conn| Self::log_change_on(conn, record))
    }

    pub fn entries_for(store: &ForensicStore, entity_id: &str) -> EngineResult<Vec<AuditLogEntry>> {
        store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, entity_type, entity_id, action, field_name, old_value, new_value,
                    changed_by_user_id, change_reason, previous_hash, hash_signature, timestamp
                 FROM audit_log WHERE entity_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![entity_id], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    entity_type: row.get(1)?,
                    entity_id: row.get(2)?,
                    action: row.get(3)?,
                    field_name: row.get(4)?,
                    old_value: row.get(5)?,
                    new_value: row.get(6)?,
                    changed_by_user_id: row.get(7)?,
                    change_reason: row.get(8)?,
                    previous_hash: row.get(9)?,
                    hash_signature: row.get(10)?,
                    timestamp: DateTime::parse_from_rfc3339(&row.get::<_, String>(11)?)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Recompute the chain for one entity and compare against the stored
    /// signatures. A mismatch is an integrity violation.
    pub fn verify_chain(store: &ForensicStore, entity_id: &str) -> EngineResult<()> {
        let entries = Self::entries_for(store, entity_id)?;
        let mut previous: Option<String> = None;
        for entry in entries {
            if entry.previous_hash != previous {
                return Err(EngineError::Permanent(format!(
                    "audit chain broken at {}: previous-hash link mismatch",
                    entry.id
                )));
            }
            let recomputed = Self::compute_signature(previous.as_deref(), &entry);
            if Some(&recomputed) != entry.hash_signature.as_ref() {
                return Err(EngineError::Permanent(format!(
                    "audit chain broken at {}: signature mismatch",
                    entry.id
                )));
            }
            previous = entry.hash_signature;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::ForensicStore;

    #[test]
    fn chain_links_and_verifies() {
        let store = ForensicStore::open_in_memory().unwrap();
        AuditLogger::log_change(
            &store,
            ChangeRecord::new("Transaction", "tx-1", "FORENSIC_FLAG")
                .field("status", Some("pending"), Some("locked"))
                .reason("Evidence Gap"),
        )
        .unwrap();
        AuditLogger::log_change(
            &store,
            ChangeRecord::new("Transaction", "tx-1", "STATUS_CHANGE")
                .field("status", Some("locked"), Some("matched")),
        )
        .unwrap();

        let entries = AuditLogger::entries_for(&store, "tx-1").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].previous_hash.is_none());
        assert_eq!(entries[1].previous_hash, entries[0].hash_signature);
        AuditLogger::verify_chain(&store, "tx-1").unwrap();
    }

    #[test]
    fn signature_is_deterministic() {
        let entry = AuditLogEntry {
            id: "fixed".into(),
            entity_type: "Case".into(),
            entity_id: "c-1".into(),
            action: "SEAL".into(),
            field_name: None,
            old_value: None,
            new_value: Some("sealed".into()),
            changed_by_user_id: Some("investigator-1".into()),
            change_reason: None,
            previous_hash: None,
            hash_signature: None,
            timestamp: DateTime::parse_from_rfc3339("2024-01-15T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let a = AuditLogger::compute_signature(None, &entry);
        let b = AuditLogger::compute_signature(None, &entry);
        assert_eq!(a, b);
        let chained = AuditLogger::compute_signature(Some(&a), &entry);
        assert_ne!(a, chained);
    }

    #[test]
    fn chains_are_per_entity() {
        let store = ForensicStore::open_in_memory().unwrap();
        AuditLogger::log_change(&store, ChangeRecord::new("Transaction", "tx-a", "CREATE"))
            .unwrap();
        AuditLogger::log_change(&store, ChangeRecord::new("Transaction", "tx-b", "CREATE"))
            .unwrap();
        let a = AuditLogger::entries_for(&store, "tx-a").unwrap();
        let b = AuditLogger::entries_for(&store, "tx-b").unwrap();
        assert!(a[0].previous_hash.is_none());
        assert!(b[0].previous_hash.is_none());
    }
}
