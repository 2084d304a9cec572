use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::entitlements::UserEntitlement;
use crate::errors::StateError;

/// Database handle wrapped in Arc for sharing across tasks.
pub type DbHandle = Arc<Database>;

const ENTITLEMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("entitlements");

/// Opens the redb database at the specified path, creating it (and any
/// missing parent directories) if it doesn't exist.
pub fn open_db(path: impl AsRef<Path>) -> Result<DbHandle, StateError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StateError::Database(format!("create db directory: {e}")))?;
        }
    }
    let db = Database::create(path).map_err(|e| StateError::Database(e.to_string()))?;
    Ok(Arc::new(db))
}

/// Writes a single entitlement record, bincode-encoded, keyed by user id.
pub fn store_entitlement(db: &Database, record: &UserEntitlement) -> Result<(), StateError> {
    let bytes = bincode::serialize(record).map_err(|e| StateError::Database(e.to_string()))?;
    let write_txn = db
        .begin_write()
        .map_err(|e| StateError::Database(e.to_string()))?;
    {
        let mut table = write_txn
            .open_table(ENTITLEMENTS)
            .map_err(|e| StateError::Database(e.to_string()))?;
        table
            .insert(record.user_id.as_str(), bytes.as_slice())
            .map_err(|e| StateError::Database(e.to_string()))?;
    }
    write_txn
        .commit()
        .map_err(|e| StateError::Database(e.to_string()))?;
    Ok(())
}

/// Loads every entitlement record. Used once at startup to warm the
/// in-memory state.
pub fn load_entitlements(db: &Database) -> Result<Vec<UserEntitlement>, StateError> {
    let read_txn = db
        .begin_read()
        .map_err(|e| StateError::Database(e.to_string()))?;
    let table = match read_txn.open_table(ENTITLEMENTS) {
        Ok(table) => table,
        // First run: no writes have happened yet.
        Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(StateError::Database(e.to_string())),
    };

    let mut records = Vec::new();
    for entry in table.iter().map_err(|e| StateError::Database(e.to_string()))? {
        let (_key, value) = entry.map_err(|e| StateError::Database(e.to_string()))?;
        let record: UserEntitlement = bincode::deserialize(value.value())
            .map_err(|e| StateError::Database(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn round_trips_records_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entitlements.redb");

        let now = Utc::now();
        let mut record = UserEntitlement::new("user-1".to_string(), now);
        record.usage_today = 3;

        {
            let db = open_db(&path).unwrap();
            store_entitlement(&db, &record).unwrap();
        }

        let db = open_db(&path).unwrap();
        let loaded = load_entitlements(&db).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], record);
    }

    #[test]
    fn empty_database_loads_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path().join("fresh.redb")).unwrap();
        assert!(load_entitlements(&db).unwrap().is_empty());
    }
}
