//! Transfer record database operations

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::error::Result;
use crate::types::{ContentId, TransferRecord, TransferStatus};

const RECORD_COLUMNS: &str = "content_id, name, status, total_length, bytes_downloaded, \
     bytes_uploaded, download_path, added_at, completed_at, error_message, descriptor";

/// Counter and status update written by a reconciliation sweep
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub id: ContentId,
    pub status: TransferStatus,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub error_message: Option<String>,
    /// Only applied when the record has no completion time yet
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of one sweep transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub written: usize,
    pub missing: usize,
    pub failed: usize,
}

/// Records read back at startup
#[derive(Debug, Default)]
pub struct RecoveryScan {
    pub records: Vec<TransferRecord>,
    pub unreadable: usize,
}

/// Transfer record database operations
pub struct TransfersDb;

impl TransfersDb {
    /// Insert or replace a record
    pub fn save(db: &Database, record: &TransferRecord) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO transfers
                (content_id, name, status, total_length, bytes_downloaded, bytes_uploaded,
                 download_path, added_at, completed_at, error_message, descriptor)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                "#,
                params![
                    record.id.to_hex(),
                    record.name,
                    record.status.to_string(),
                    record.total_length as i64,
                    record.bytes_downloaded as i64,
                    record.bytes_uploaded as i64,
                    record.download_path,
                    record.added_at.to_rfc3339(),
                    record.completed_at.map(|t| t.to_rfc3339()),
                    record.error_message,
                    record.descriptor_blob,
                ],
            )?;
            Ok(())
        })
    }

    /// Get a record by content id
    pub fn get(db: &Database, id: &ContentId) -> Result<Option<TransferRecord>> {
        db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM transfers WHERE content_id = ?1", RECORD_COLUMNS),
                params![id.to_hex()],
                row_to_record,
            )
            .optional()
        })
    }

    /// Every readable record, oldest first. Rows that cannot be decoded are
    /// logged and counted instead of failing the whole read.
    pub fn scan_for_recovery(db: &Database) -> Result<RecoveryScan> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transfers ORDER BY added_at ASC",
                RECORD_COLUMNS
            ))?;
            let mut scan = RecoveryScan::default();
            for row in stmt.query_map([], row_to_record)? {
                match row {
                    Ok(record) => scan.records.push(record),
                    Err(e) => {
                        log::warn!("Skipping unreadable transfer record: {}", e);
                        scan.unreadable += 1;
                    }
                }
            }
            Ok(scan)
        })
    }

    /// Records that have not completed yet
    pub fn list_incomplete(db: &Database) -> Result<Vec<TransferRecord>> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transfers WHERE completed_at IS NULL ORDER BY added_at ASC",
                RECORD_COLUMNS
            ))?;
            let records = stmt
                .query_map([], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// Completed records, newest first (history)
    pub fn list_completed(db: &Database, limit: i64) -> Result<Vec<TransferRecord>> {
        db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transfers WHERE completed_at IS NOT NULL \
                 ORDER BY completed_at DESC LIMIT ?1",
                RECORD_COLUMNS
            ))?;
            let records = stmt
                .query_map(params![limit], row_to_record)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    /// Update status and error message. Returns false when no record matched.
    pub fn update_status(
        db: &Database,
        id: &ContentId,
        status: TransferStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE transfers SET status = ?1, error_message = ?2 WHERE content_id = ?3",
                params![status.to_string(), error_message, id.to_hex()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Write a whole reconciliation sweep in one transaction.
    ///
    /// A row that fails is logged and skipped; the remaining rows still commit.
    pub fn apply_sweep(db: &Database, updates: &[ProgressUpdate]) -> Result<SweepOutcome> {
        db.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut outcome = SweepOutcome::default();

            {
                let mut stmt = tx.prepare(
                    r#"
                    UPDATE transfers
                    SET status = ?1, bytes_downloaded = ?2, bytes_uploaded = ?3,
                        error_message = ?4, completed_at = COALESCE(completed_at, ?5)
                    WHERE content_id = ?6
                    "#,
                )?;

                for update in updates {
                    let result = stmt.execute(params![
                        update.status.to_string(),
                        update.bytes_downloaded as i64,
                        update.bytes_uploaded as i64,
                        update.error_message,
                        update.completed_at.map(|t| t.to_rfc3339()),
                        update.id.to_hex(),
                    ]);
                    match result {
                        Ok(0) => {
                            log::debug!("No persisted record for transfer {}", update.id);
                            outcome.missing += 1;
                        }
                        Ok(_) => outcome.written += 1,
                        Err(e) => {
                            log::warn!("Failed to persist progress for {}: {}", update.id, e);
                            outcome.failed += 1;
                        }
                    }
                }
            }

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Delete a record. Returns false when nothing was deleted.
    pub fn delete(db: &Database, id: &ContentId) -> Result<bool> {
        db.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM transfers WHERE content_id = ?1",
                params![id.to_hex()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Clear all completed records
    pub fn clear_history(db: &Database) -> Result<usize> {
        db.with_conn(|conn| {
            conn.execute("DELETE FROM transfers WHERE completed_at IS NOT NULL", [])
        })
    }

    pub fn count(db: &Database) -> Result<i64> {
        db.with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0)))
    }
}

fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<TransferRecord> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(2)?;
    let added_at: String = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;

    let id = id_str
        .parse::<ContentId>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    Ok(TransferRecord {
        id,
        name: row.get(1)?,
        status: TransferStatus::from(status_str.as_str()),
        total_length: row.get::<_, i64>(3)? as u64,
        bytes_downloaded: row.get::<_, i64>(4)? as u64,
        bytes_uploaded: row.get::<_, i64>(5)? as u64,
        download_path: row.get(6)?,
        added_at: parse_timestamp(7, added_at)?,
        completed_at: completed_at.map(|t| parse_timestamp(8, t)).transpose()?,
        error_message: row.get(9)?,
        descriptor_blob: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::record;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_save_and_get() {
        let db = db();
        let rec = record("test.txt", 1024);
        TransfersDb::save(&db, &rec).unwrap();

        let loaded = TransfersDb::get(&db, &rec.id).unwrap().unwrap();
        assert_eq!(loaded.name, "test.txt");
        assert_eq!(loaded.total_length, 1024);
        assert_eq!(loaded.descriptor_blob, rec.descriptor_blob);
        assert_eq!(loaded.added_at.timestamp(), rec.added_at.timestamp());
        assert!(loaded.completed_at.is_none());
        assert_eq!(TransfersDb::count(&db).unwrap(), 1);
    }

    #[test]
    fn test_save_replaces() {
        let db = db();
        let mut rec = record("a", 10);
        TransfersDb::save(&db, &rec).unwrap();
        rec.bytes_downloaded = 5;
        TransfersDb::save(&db, &rec).unwrap();
        assert_eq!(TransfersDb::count(&db).unwrap(), 1);
        assert_eq!(TransfersDb::get(&db, &rec.id).unwrap().unwrap().bytes_downloaded, 5);
    }

    #[test]
    fn test_unknown_status_reads_as_stopped() {
        let db = db();
        let rec = record("a", 10);
        TransfersDb::save(&db, &rec).unwrap();
        db.with_conn(|conn| conn.execute("UPDATE transfers SET status = 'paused'", []))
            .unwrap();
        let loaded = TransfersDb::get(&db, &rec.id).unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Stopped);
    }

    #[test]
    fn test_sweep_keeps_first_completion_timestamp() {
        let db = db();
        let rec = record("a", 10);
        TransfersDb::save(&db, &rec).unwrap();

        let first = Utc::now() - chrono::Duration::hours(1);
        for completed_at in [first, Utc::now()] {
            let outcome = TransfersDb::apply_sweep(
                &db,
                &[ProgressUpdate {
                    id: rec.id,
                    status: TransferStatus::Seeding,
                    bytes_downloaded: 10,
                    bytes_uploaded: 0,
                    error_message: None,
                    completed_at: Some(completed_at),
                }],
            )
            .unwrap();
            assert_eq!(outcome.written, 1);
        }

        let loaded = TransfersDb::get(&db, &rec.id).unwrap().unwrap();
        assert_eq!(loaded.completed_at.unwrap().timestamp(), first.timestamp());
        assert_eq!(loaded.bytes_downloaded, 10);

        assert_eq!(TransfersDb::list_completed(&db, 10).unwrap().len(), 1);
        assert!(TransfersDb::list_incomplete(&db).unwrap().is_empty());
        assert_eq!(TransfersDb::clear_history(&db).unwrap(), 1);
        assert_eq!(TransfersDb::count(&db).unwrap(), 0);
    }

    #[test]
    fn test_sweep_skips_failing_row() {
        let db = db();
        let good = record("good", 100);
        let bad = record("bad", 100);
        TransfersDb::save(&db, &good).unwrap();
        TransfersDb::save(&db, &bad).unwrap();
        let ghost = record("ghost", 100);

        let updates = vec![
            ProgressUpdate {
                id: bad.id,
                status: TransferStatus::Downloading,
                // Wraps to a negative integer and trips the CHECK constraint.
                bytes_downloaded: u64::MAX,
                bytes_uploaded: 0,
                error_message: None,
                completed_at: None,
            },
            ProgressUpdate {
                id: good.id,
                status: TransferStatus::Seeding,
                bytes_downloaded: 100,
                bytes_uploaded: 7,
                error_message: None,
                completed_at: Some(Utc::now()),
            },
            ProgressUpdate {
                id: ghost.id,
                status: TransferStatus::Downloading,
                bytes_downloaded: 1,
                bytes_uploaded: 0,
                error_message: None,
                completed_at: None,
            },
        ];

        let outcome = TransfersDb::apply_sweep(&db, &updates).unwrap();
        assert_eq!(
            outcome,
            SweepOutcome {
                written: 1,
                missing: 1,
                failed: 1
            }
        );

        let good = TransfersDb::get(&db, &good.id).unwrap().unwrap();
        assert_eq!(good.status, TransferStatus::Seeding);
        assert_eq!(good.bytes_uploaded, 7);
        assert!(good.completed_at.is_some());

        let bad = TransfersDb::get(&db, &bad.id).unwrap().unwrap();
        assert_eq!(bad.bytes_downloaded, 0);
    }

    #[test]
    fn test_scan_for_recovery_skips_unreadable_rows() {
        let db = db();
        let good = record("good", 10);
        let broken = record("broken", 10);
        TransfersDb::save(&db, &good).unwrap();
        TransfersDb::save(&db, &broken).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE transfers SET added_at = 'yesterday' WHERE content_id = ?1",
                params![broken.id.to_hex()],
            )
        })
        .unwrap();

        let scan = TransfersDb::scan_for_recovery(&db).unwrap();
        assert_eq!(scan.unreadable, 1);
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.records[0].id, good.id);
    }

    #[test]
    fn test_update_status_and_delete() {
        let db = db();
        let rec = record("a", 10);
        TransfersDb::save(&db, &rec).unwrap();

        assert!(TransfersDb::update_status(&db, &rec.id, TransferStatus::Error, Some("boom")).unwrap());
        let loaded = TransfersDb::get(&db, &rec.id).unwrap().unwrap();
        assert_eq!(loaded.status, TransferStatus::Error);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));

        assert!(TransfersDb::delete(&db, &rec.id).unwrap());
        assert!(!TransfersDb::delete(&db, &rec.id).unwrap());
        assert!(TransfersDb::get(&db, &rec.id).unwrap().is_none());
    }
}
