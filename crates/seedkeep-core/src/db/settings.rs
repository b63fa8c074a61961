//! Settings database operations
//!
//! Every value is stored as a JSON document under its own key.

use crate::db::Database;
use crate::error::Result;
use crate::types::Settings;
use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Settings database operations
pub struct SettingsDb;

impl SettingsDb {
    /// Load all settings from database, falling back to defaults per key
    pub fn load(db: &Database) -> Result<Settings> {
        let mut settings = Settings::default();

        let rows = db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        for (key, value) in rows {
            match key.as_str() {
                "download_path" => {
                    if let Some(path) = decode::<String>(&key, &value) {
                        settings.download_path = expand_home(path);
                    }
                }
                "delete_files_on_remove" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.delete_files_on_remove = v;
                    }
                }
                "magnet_timeout_secs" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.magnet_timeout_secs = v;
                    }
                }
                "reconcile_interval_secs" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.reconcile_interval_secs = v;
                    }
                }
                "policy_check_interval_secs" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.policy_check_interval_secs = v;
                    }
                }
                "snapshot_interval_secs" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.snapshot_interval_secs = v;
                    }
                }
                "list_batch_threshold" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.list_batch_threshold = v;
                    }
                }
                "registry_strategy" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.registry_strategy = v;
                    }
                }
                "network_policy" => {
                    if let Some(v) = decode(&key, &value) {
                        settings.network_policy = v;
                    }
                }
                _ => {}
            }
        }

        Ok(settings)
    }

    /// Save all settings
    pub fn save(db: &Database, settings: &Settings) -> Result<()> {
        Self::set_json(db, "download_path", &settings.download_path)?;
        Self::set_json(db, "delete_files_on_remove", &settings.delete_files_on_remove)?;
        Self::set_json(db, "magnet_timeout_secs", &settings.magnet_timeout_secs)?;
        Self::set_json(db, "reconcile_interval_secs", &settings.reconcile_interval_secs)?;
        Self::set_json(db, "policy_check_interval_secs", &settings.policy_check_interval_secs)?;
        Self::set_json(db, "snapshot_interval_secs", &settings.snapshot_interval_secs)?;
        Self::set_json(db, "list_batch_threshold", &settings.list_batch_threshold)?;
        Self::set_json(db, "registry_strategy", &settings.registry_strategy)?;
        Self::set_json(db, "network_policy", &settings.network_policy)?;
        Ok(())
    }

    /// Save a single raw JSON value
    pub fn set(db: &Database, key: &str, value: &str) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, CURRENT_TIMESTAMP)",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Get a single raw JSON value
    pub fn get(db: &Database, key: &str) -> Result<Option<String>> {
        db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn set_json<T: Serialize + ?Sized>(db: &Database, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        Self::set(db, key, &json)
    }

    pub fn get_json<T: DeserializeOwned>(db: &Database, key: &str) -> Result<Option<T>> {
        match Self::get(db, key)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn delete(db: &Database, key: &str) -> Result<()> {
        db.with_conn(|conn| {
            conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
            Ok(())
        })
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &str) -> Option<T> {
    match serde_json::from_str(value) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring malformed setting {}: {}", key, e);
            None
        }
    }
}

/// Expand a leading `~` to the home directory
fn expand_home(value: String) -> String {
    if let Some(rest) = value.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    } else if value == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    value
}
