use facegate_core::{Template, TemplateError};
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("template encryption failed")]
    EncryptionFailed,
    #[error("template decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid template blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("cannot create database directory: {0}")]
    Io(#[source] std::io::Error),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

impl StoreError {
    /// The stored template exists but cannot be turned back into a [`Template`].
    pub fn is_corrupt_template(&self) -> bool {
        matches!(
            self,
            StoreError::DecryptionFailed | StoreError::InvalidBlob(_) | StoreError::Template(_)
        )
    }
}

/// Enrollment profile metadata (no template data).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileInfo {
    pub id: String,
    pub identity: String,
    pub threshold: f32,
    pub is_active: bool,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    /// Time of the most recent verification attempt, RFC 3339.
    pub last_verification: Option<String>,
    pub needs_reenrollment: bool,
    pub accepted_captures: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl ProfileInfo {
    /// Percentage of attempts that verified, 0 when never attempted.
    pub fn success_rate(&self) -> f32 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.successful_attempts as f32 / self.total_attempts as f32 * 100.0
    }
}

/// A profile together with its sealed template.
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub info: ProfileInfo,
    sealed: Vec<u8>,
}

/// Audit row for an operator approval that bypassed biometric comparison.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverrideRecord {
    pub id: String,
    pub identity: String,
    pub operator: String,
    pub reason: String,
    pub created_at: String,
}

/// SQLite-backed enrollment profiles with AES-256-GCM sealed templates.
///
/// Templates are encrypted before storage with the identity as associated
/// data, so a blob copied onto another profile fails to open. A
/// per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct ProfileStore {
    conn: Connection,
    enc_key: [u8; KEY_LEN],
}

const PROFILE_COLUMNS: &str = "id, identity, threshold, is_active, total_attempts, successful_attempts,
     last_verification, needs_reenrollment, accepted_captures, created_at, updated_at";

impl ProfileStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; KEY_LEN]
        } else {
            let dir = db_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            std::fs::create_dir_all(dir).map_err(StoreError::Io)?;
            load_or_generate_key(&dir.join(".key"))?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS profiles (
                     id TEXT PRIMARY KEY,
                     identity TEXT NOT NULL UNIQUE,
                     template BLOB NOT NULL,
                     threshold REAL NOT NULL,
                     is_active INTEGER NOT NULL DEFAULT 1,
                     total_attempts INTEGER NOT NULL DEFAULT 0,
                     successful_attempts INTEGER NOT NULL DEFAULT 0,
                     last_verification TEXT,
                     needs_reenrollment INTEGER NOT NULL DEFAULT 0,
                     accepted_captures INTEGER NOT NULL DEFAULT 0,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS override_audit (
                     id TEXT PRIMARY KEY,
                     identity TEXT NOT NULL,
                     operator TEXT NOT NULL,
                     reason TEXT NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_override_identity ON override_audit(identity);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Profile metadata plus sealed template for `identity`.
    pub async fn get(&self, identity: &str) -> Result<Option<ProfileRecord>, StoreError> {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                let sql = format!("SELECT {PROFILE_COLUMNS}, template FROM profiles WHERE identity = ?1");
                let record = conn
                    .query_row(&sql, [&identity], |row| {
                        Ok(ProfileRecord {
                            info: profile_from_row(row)?,
                            sealed: row.get(11)?,
                        })
                    })
                    .optional()?;
                Ok(record)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn profile(&self, identity: &str) -> Result<Option<ProfileInfo>, StoreError> {
        Ok(self.get(identity).await?.map(|record| record.info))
    }

    /// Decrypt and decode the template of a fetched profile.
    pub fn template(&self, record: &ProfileRecord) -> Result<Template, StoreError> {
        let bytes = self.open_blob(&record.info.identity, &record.sealed)?;
        Ok(Template::decode(&bytes)?)
    }

    /// Create the profile for `identity`, or replace the template of the
    /// existing one. Counters survive a replacement; `needs_reenrollment`
    /// is cleared. Returns the profile id and whether it was created.
    pub async fn upsert_template(
        &self,
        identity: &str,
        template: &Template,
        default_threshold: f32,
    ) -> Result<(String, bool), StoreError> {
        // Encrypt before entering the SQLite closure
        let blob = self.seal(identity, &template.encode())?;
        let identity = identity.to_string();
        let accepted = u32::from(template.capture_count);
        let now = chrono::Utc::now().to_rfc3339();
        let new_id = uuid::Uuid::new_v4().to_string();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<String> = tx
                    .query_row("SELECT id FROM profiles WHERE identity = ?1", [&identity], |row| row.get(0))
                    .optional()?;
                let result = match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE profiles
                             SET template = ?2, accepted_captures = ?3, needs_reenrollment = 0, updated_at = ?4
                             WHERE identity = ?1",
                            rusqlite::params![identity, blob, accepted, now],
                        )?;
                        (id, false)
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO profiles (id, identity, template, threshold, accepted_captures, created_at, updated_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                            rusqlite::params![new_id, identity, blob, f64::from(default_threshold), accepted, now],
                        )?;
                        (new_id, true)
                    }
                };
                tx.commit()?;
                Ok(result)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count one verification attempt. Returns false when no such profile.
    pub async fn record_attempt(&self, identity: &str, success: bool) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE profiles
                     SET total_attempts = total_attempts + 1,
                         successful_attempts = successful_attempts + ?2,
                         last_verification = ?3,
                         updated_at = ?3
                     WHERE identity = ?1",
                    rusqlite::params![identity, i64::from(success), now],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn set_active(&self, identity: &str, active: bool) -> Result<bool, StoreError> {
        self.update_column(identity, "is_active", i64::from(active)).await
    }

    pub async fn set_threshold(&self, identity: &str, threshold: f32) -> Result<bool, StoreError> {
        self.update_column(identity, "threshold", f64::from(threshold)).await
    }

    pub async fn mark_needs_reenrollment(&self, identity: &str) -> Result<bool, StoreError> {
        self.update_column(identity, "needs_reenrollment", 1i64).await
    }

    async fn update_column<V>(&self, identity: &str, column: &'static str, value: V) -> Result<bool, StoreError>
    where
        V: rusqlite::ToSql + Send + 'static,
    {
        let identity = identity.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let sql = format!("UPDATE profiles SET {column} = ?2, updated_at = ?3 WHERE identity = ?1");
                let affected = conn.execute(&sql, rusqlite::params![identity, value, now])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Delete the profile. Its override audit trail is kept.
    pub async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM profiles WHERE identity = ?1", [&identity])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn list(&self) -> Result<Vec<ProfileInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY identity");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], profile_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 = conn.query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    pub async fn insert_override(
        &self,
        identity: &str,
        operator: &str,
        reason: &str,
    ) -> Result<OverrideRecord, StoreError> {
        let record = OverrideRecord {
            id: uuid::Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            operator: operator.to_string(),
            reason: reason.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let row = record.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO override_audit (id, identity, operator, reason, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![row.id, row.identity, row.operator, row.reason, row.created_at],
                )?;
                Ok(())
            })
            .await?;
        Ok(record)
    }

    /// Override audit trail for `identity`, oldest first.
    pub async fn list_overrides(&self, identity: &str) -> Result<Vec<OverrideRecord>, StoreError> {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, identity, operator, reason, created_at
                     FROM override_audit WHERE identity = ?1 ORDER BY created_at, rowid",
                )?;
                let rows = stmt.query_map([&identity], |row| {
                    Ok(OverrideRecord {
                        id: row.get(0)?,
                        identity: row.get(1)?,
                        operator: row.get(2)?,
                        reason: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.enc_key))
    }

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn seal(&self, identity: &str, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, Payload { msg: plaintext, aad: identity.as_bytes() })
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open_blob(&self, identity: &str, blob: &[u8]) -> Result<Vec<u8>, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher()
            .decrypt(Nonce::from_slice(nonce_bytes), Payload { msg: ciphertext, aad: identity.as_bytes() })
            .map_err(|_| StoreError::DecryptionFailed)
    }
}

#[cfg(test)]
impl ProfileStore {
    /// Replace the stored blob without sealing it.
    pub(crate) async fn overwrite_sealed(&self, identity: &str, blob: Vec<u8>) {
        let identity = identity.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE profiles SET template = ?2 WHERE identity = ?1",
                    rusqlite::params![identity, blob],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }
}

fn profile_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileInfo> {
    Ok(ProfileInfo {
        id: row.get(0)?,
        identity: row.get(1)?,
        threshold: row.get::<_, f64>(2)? as f32,
        is_active: row.get(3)?,
        total_attempts: row.get(4)?,
        successful_attempts: row.get(5)?,
        last_verification: row.get(6)?,
        needs_reenrollment: row.get(7)?,
        accepted_captures: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; KEY_LEN], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("encryption key file has wrong length ({} bytes, expected {KEY_LEN})", bytes.len()),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}
