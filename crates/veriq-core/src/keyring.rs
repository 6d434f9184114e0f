//! Append-only signing key table.
//!
//! Exactly one key is `active` at a time and only the active key keeps its
//! secret half. Rotation retires the active key (dropping its secret) and
//! generates a new one; retired keys stay resolvable so receipts signed
//! before a rotation keep verifying. Revocation is terminal and is reported
//! by verification rather than hidden.
//!
//! Key ids look like `k0003-20260105`: a table-wide sequence plus the
//! creation date.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use redb::{ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{PlatformError, Result};
use crate::store::{db_err, get_json, next_seq, put_json, Store, SIGNING_KEYS};

const KEY_SEQ: &str = "key_seq";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retired,
    Revoked,
}

/// Public view of a key table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub kid: String,
    /// Base64 of the 32-byte Ed25519 public key.
    pub public_key: String,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl KeyInfo {
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        let raw = B64
            .decode(&self.public_key)
            .map_err(|e| PlatformError::KeyMaterial(format!("{}: {e}", self.kid)))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| PlatformError::KeyMaterial(format!("{}: bad key length", self.kid)))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| PlatformError::KeyMaterial(format!("{}: {e}", self.kid)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKey {
    #[serde(flatten)]
    info: KeyInfo,
    /// Base64 secret; present only while the key is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

/// The key currently used for signing.
pub struct ActiveKey {
    pub kid: String,
    pub signing: SigningKey,
}

impl fmt::Debug for ActiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveKey")
            .field("kid", &self.kid)
            .field("signing", &"<redacted>")
            .finish()
    }
}

impl ActiveKey {
    /// Generate a throwaway key that is not recorded anywhere.
    pub fn ephemeral(kid: impl Into<String>) -> Self {
        Self {
            kid: kid.into(),
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn info(&self, created_at: DateTime<Utc>) -> KeyInfo {
        KeyInfo {
            kid: self.kid.clone(),
            public_key: B64.encode(self.signing.verifying_key().to_bytes()),
            status: KeyStatus::Active,
            created_at,
            retired_at: None,
            revoked_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Keyring {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl Keyring {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Return the active key, creating the first one if the table is empty
    /// or every key has been retired or revoked.
    pub fn ensure_active(&self) -> Result<KeyInfo> {
        if let Some(active) = self.find_active()? {
            return Ok(active.info);
        }
        let txn = self.store.write()?;
        // Re-check under the write lock in case another caller won the race.
        if let Some(active) = active_in(&txn)? {
            return Ok(active.info);
        }
        let info = self.generate(&txn)?;
        txn.commit().map_err(db_err)?;
        tracing::info!(kid = %info.kid, "created signing key");
        Ok(info)
    }

    /// Retire the active key and activate a freshly generated one.
    pub fn rotate(&self) -> Result<KeyInfo> {
        let now = self.clock.now();
        let txn = self.store.write()?;
        let previous = active_in(&txn)?;
        if let Some(mut old) = previous.clone() {
            old.info.status = KeyStatus::Retired;
            old.info.retired_at = Some(now);
            old.secret = None;
            let mut table = txn.open_table(SIGNING_KEYS).map_err(db_err)?;
            put_json(&mut table, &old.info.kid, &old)?;
        }
        let info = self.generate(&txn)?;
        txn.commit().map_err(db_err)?;
        tracing::info!(
            retired = previous.as_ref().map(|p| p.info.kid.as_str()).unwrap_or("-"),
            active = %info.kid,
            "rotated signing key"
        );
        Ok(info)
    }

    /// Mark `kid` revoked. Revoking the active key leaves no active key; the
    /// next signature creates a new one.
    pub fn revoke(&self, kid: &str) -> Result<KeyInfo> {
        let txn = self.store.write()?;
        let info = {
            let mut table = txn.open_table(SIGNING_KEYS).map_err(db_err)?;
            let mut stored: StoredKey = get_json(&table, kid)?
                .ok_or_else(|| PlatformError::KeyNotFound(kid.to_string()))?;
            if stored.info.status != KeyStatus::Revoked {
                stored.info.status = KeyStatus::Revoked;
                stored.info.revoked_at = Some(self.clock.now());
                stored.secret = None;
                put_json(&mut table, kid, &stored)?;
            }
            stored.info
        };
        txn.commit().map_err(db_err)?;
        tracing::warn!(kid, "revoked signing key");
        Ok(info)
    }

    /// Every key ever created, ordered by kid.
    pub fn list(&self) -> Result<Vec<KeyInfo>> {
        let rt = self.store.read()?;
        let table = rt.open_table(SIGNING_KEYS).map_err(db_err)?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let stored: StoredKey = crate::store::from_json(v.value())?;
            out.push(stored.info);
        }
        Ok(out)
    }

    /// Resolve any kid regardless of status.
    pub fn key_for(&self, kid: &str) -> Result<Option<KeyInfo>> {
        let rt = self.store.read()?;
        let table = rt.open_table(SIGNING_KEYS).map_err(db_err)?;
        Ok(get_json::<StoredKey, _>(&table, kid)?.map(|s| s.info))
    }

    /// The key to sign with right now.
    pub fn active_signer(&self) -> Result<ActiveKey> {
        let stored = match self.find_active()? {
            Some(s) => s,
            None => {
                self.ensure_active()?;
                self.find_active()?
                    .ok_or_else(|| PlatformError::Internal("no active signing key".into()))?
            }
        };
        let secret = stored
            .secret
            .as_deref()
            .ok_or_else(|| PlatformError::KeyMaterial(format!("{}: missing secret", stored.info.kid)))?;
        let raw = B64
            .decode(secret)
            .map_err(|e| PlatformError::KeyMaterial(format!("{}: {e}", stored.info.kid)))?;
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
            PlatformError::KeyMaterial(format!("{}: bad secret length", stored.info.kid))
        })?;
        Ok(ActiveKey {
            kid: stored.info.kid,
            signing: SigningKey::from_bytes(&bytes),
        })
    }

    fn find_active(&self) -> Result<Option<StoredKey>> {
        let rt = self.store.read()?;
        let table = rt.open_table(SIGNING_KEYS).map_err(db_err)?;
        for entry in table.iter().map_err(db_err)? {
            let (_, v) = entry.map_err(db_err)?;
            let stored: StoredKey = crate::store::from_json(v.value())?;
            if stored.info.status == KeyStatus::Active {
                return Ok(Some(stored));
            }
        }
        Ok(None)
    }

    fn generate(&self, txn: &WriteTransaction) -> Result<KeyInfo> {
        let now = self.clock.now();
        let seq = next_seq(txn, KEY_SEQ)?;
        let kid = format!("k{seq:04}-{}", now.format("%Y%m%d"));
        let signing = SigningKey::generate(&mut OsRng);
        let stored = StoredKey {
            info: ActiveKey {
                kid: kid.clone(),
                signing: signing.clone(),
            }
            .info(now),
            secret: Some(B64.encode(signing.to_bytes())),
        };
        let mut table = txn.open_table(SIGNING_KEYS).map_err(db_err)?;
        put_json(&mut table, &kid, &stored)?;
        Ok(stored.info)
    }
}

fn active_in(txn: &WriteTransaction) -> Result<Option<StoredKey>> {
    let table = txn.open_table(SIGNING_KEYS).map_err(db_err)?;
    for entry in table.iter().map_err(db_err)? {
        let (_, v) = entry.map_err(db_err)?;
        let stored: StoredKey = crate::store::from_json(v.value())?;
        if stored.info.status == KeyStatus::Active {
            return Ok(Some(stored));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use ed25519_dalek::{Signer, Verifier};
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, Keyring) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        (dir, Keyring::new(store, Arc::new(SystemClock)))
    }

    #[test]
    fn ensure_active_is_idempotent() {
        let (_dir, ring) = open_tmp();
        let a = ring.ensure_active().unwrap();
        let b = ring.ensure_active().unwrap();
        assert_eq!(a.kid, b.kid);
        assert!(a.kid.starts_with("k0001-"));
        assert_eq!(ring.list().unwrap().len(), 1);
    }

    #[test]
    fn rotation_retires_previous_key() {
        let (_dir, ring) = open_tmp();
        let first = ring.ensure_active().unwrap();
        let second = ring.rotate().unwrap();
        assert_ne!(first.kid, second.kid);

        let old = ring.key_for(&first.kid).unwrap().unwrap();
        assert_eq!(old.status, KeyStatus::Retired);
        assert!(old.retired_at.is_some());
        assert_eq!(ring.active_signer().unwrap().kid, second.kid);

        let statuses: Vec<KeyStatus> = ring.list().unwrap().iter().map(|k| k.status).collect();
        assert_eq!(statuses, vec![KeyStatus::Retired, KeyStatus::Active]);
    }

    #[test]
    fn active_signer_matches_published_public_key() {
        let (_dir, ring) = open_tmp();
        let signer = ring.active_signer().unwrap();
        let info = ring.key_for(&signer.kid).unwrap().unwrap();
        let sig = signer.signing.sign(b"payload");
        info.verifying_key().unwrap().verify(b"payload", &sig).unwrap();
    }

    #[test]
    fn revoking_active_key_forces_a_new_one() {
        let (_dir, ring) = open_tmp();
        let first = ring.ensure_active().unwrap();
        let revoked = ring.revoke(&first.kid).unwrap();
        assert_eq!(revoked.status, KeyStatus::Revoked);
        let next = ring.active_signer().unwrap();
        assert_ne!(next.kid, first.kid);
    }

    #[test]
    fn revoking_unknown_key_is_not_found() {
        let (_dir, ring) = open_tmp();
        assert!(matches!(
            ring.revoke("k9999-20200101"),
            Err(PlatformError::KeyNotFound(_))
        ));
    }

    #[test]
    fn retired_keys_drop_their_secret() {
        let (_dir, ring) = open_tmp();
        let first = ring.ensure_active().unwrap();
        ring.rotate().unwrap();
        let rt = ring.store.read().unwrap();
        let table = rt.open_table(SIGNING_KEYS).unwrap();
        let stored: StoredKey = get_json(&table, &first.kid).unwrap().unwrap();
        assert!(stored.secret.is_none());
    }
}
