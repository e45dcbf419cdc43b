use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use chrono::{DateTime, Utc};
use liveface_core::{Frame, FrameError, IdentityReference};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum IdentityStoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("identity image encryption failed")]
    EncryptionFailed,
    #[error("identity image decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid identity blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("stored identity image is unreadable: {0}")]
    Image(#[from] FrameError),
    #[error("stored enrolment time is invalid: {0}")]
    Timestamp(#[from] chrono::ParseError),
    #[error("stored identity digest does not match its image")]
    DigestMismatch,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed storage for the single active identity reference.
///
/// The image is encrypted with AES-256-GCM before storage. A per-installation
/// 32-byte key is generated at first use and stored at `{db_dir}/.key`
/// (mode 0600).
#[derive(Clone)]
pub struct IdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
}

/// Metadata about the stored reference (no image data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentityInfo {
    pub id: String,
    pub digest: String,
    pub enrolled_at: String,
}

impl IdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, IdentityStoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/liveface"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS identity_reference (
                     id TEXT PRIMARY KEY,
                     digest TEXT NOT NULL,
                     image BLOB NOT NULL,
                     enrolled_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// Persist `reference` as the active identity, replacing any previous one.
    /// Returns the generated row id.
    pub async fn save(&self, reference: &IdentityReference) -> Result<String, IdentityStoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let blob = self.encrypt_image(reference.frame.bytes())?;
        let digest = reference.digest.clone();
        let enrolled_at = reference.enrolled_at.to_rfc3339();

        let id_clone = id.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM identity_reference", [])?;
                tx.execute(
                    "INSERT INTO identity_reference (id, digest, image, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id_clone, digest, blob, enrolled_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        tracing::info!(id = %id, digest = %reference.digest, "identity reference persisted");
        Ok(id)
    }

    /// Load the active identity reference, if one was saved.
    pub async fn load(&self) -> Result<Option<IdentityReference>, IdentityStoreError> {
        let row: Option<(String, Vec<u8>, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT digest, image, enrolled_at FROM identity_reference
                     ORDER BY enrolled_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await?;

        let Some((digest, blob, enrolled_at)) = row else {
            return Ok(None);
        };

        let image = self.decrypt_image(&blob)?;
        let frame = Frame::decode(&image)?;
        let enrolled_at = DateTime::parse_from_rfc3339(&enrolled_at)?.with_timezone(&Utc);
        let reference = IdentityReference::with_enrolled_at(frame, enrolled_at);
        if reference.digest != digest {
            return Err(IdentityStoreError::DigestMismatch);
        }
        Ok(Some(reference))
    }

    /// Metadata of the active reference.
    pub async fn info(&self) -> Result<Option<IdentityInfo>, IdentityStoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, digest, enrolled_at FROM identity_reference
                     ORDER BY enrolled_at DESC LIMIT 1",
                )?;
                let mut rows = stmt.query_map([], |row| {
                    Ok(IdentityInfo {
                        id: row.get(0)?,
                        digest: row.get(1)?,
                        enrolled_at: row.get(2)?,
                    })
                })?;
                let first = rows.next().transpose()?;
                Ok(first)
            })
            .await
            .map_err(IdentityStoreError::from)
    }

    /// Remove the stored reference. Returns whether one existed.
    pub async fn clear(&self) -> Result<bool, IdentityStoreError> {
        self.conn
            .call(|conn| {
                let affected = conn.execute("DELETE FROM identity_reference", [])?;
                Ok(affected > 0)
            })
            .await
            .map_err(IdentityStoreError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_image(&self, plaintext: &[u8]) -> Result<Vec<u8>, IdentityStoreError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| IdentityStoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_image(&self, blob: &[u8]) -> Result<Vec<u8>, IdentityStoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(IdentityStoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| IdentityStoreError::DecryptionFailed)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], IdentityStoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(IdentityStoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            IdentityStoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(IdentityStoreError::KeyIo)?;
        f.write_all(&key).map_err(IdentityStoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
