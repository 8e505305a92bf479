//! Envelope encryption for hosted tenants.
//!
//! Each tenant gets a random data encryption key (DEK) at provisioning. The
//! DEK is wrapped with a key-encryption key (KEK) derived from the
//! server-held master secret and a client-held key share; the wrapped DEK
//! and a hash of the share are what gets stored. Reads unwrap the DEK on
//! demand and cache it in-process (LRU + TTL). Entry content is encrypted
//! with AES-256-GCM; one IV is stored per row and per-field nonces are
//! derived from it so the `(key, nonce)` pair is never reused across the
//! title/body/meta columns.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use dashmap::DashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use zeroize::Zeroizing;

use context_vault_core::entry::{EntryContent, EntryRecord, Meta};
use context_vault_core::{VaultError, VaultResult};

const DEK_CACHE_CAPACITY: usize = 64;
const DEK_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

fn crypto_err(msg: &str) -> VaultError {
    VaultError::Internal(format!("crypto: {msg}"))
}

// ---------------------------------------------------------------------------
// Key material
// ---------------------------------------------------------------------------

/// Stored per tenant: the wrapped DEK and the hash of the client share.
/// Never contains plaintext key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantKeys {
    pub wrapped_dek: Vec<u8>,
    pub dek_iv: Vec<u8>,
    pub share_hash: Vec<u8>,
}

fn derive_kek(master_secret: &[u8], client_share: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(b"context-vault/kek/v1");
    hasher.update((master_secret.len() as u64).to_le_bytes());
    hasher.update(master_secret);
    hasher.update(client_share);
    Zeroizing::new(hasher.finalize().into())
}

fn hash_share(client_share: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"context-vault/share/v1");
    hasher.update(client_share);
    hasher.finalize().to_vec()
}

/// Per-field nonce derived from the row IV; keeps one stored IV per row
/// while never reusing a `(key, nonce)` pair across columns.
fn field_nonce(iv: &[u8], label: &[u8]) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(b"context-vault/nonce/v1");
    hasher.update(iv);
    hasher.update(label);
    let digest = hasher.finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

struct CachedDek {
    key: Zeroizing<[u8; 32]>,
    unlocked_at: Instant,
}

// ---------------------------------------------------------------------------
// EnvelopeCrypto
// ---------------------------------------------------------------------------

pub struct EnvelopeCrypto {
    master_secret: Zeroizing<Vec<u8>>,
    keys: DashMap<String, TenantKeys>,
    dek_cache: Mutex<LruCache<String, CachedDek>>,
}

impl std::fmt::Debug for EnvelopeCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeCrypto").field("tenants", &self.keys.len()).finish_non_exhaustive()
    }
}

impl EnvelopeCrypto {
    pub fn new(master_secret: &[u8]) -> Self {
        Self {
            master_secret: Zeroizing::new(master_secret.to_vec()),
            keys: DashMap::new(),
            dek_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEK_CACHE_CAPACITY).unwrap(),
            )),
        }
    }

    /// Generate and wrap a fresh DEK for a new tenant. The returned
    /// [`TenantKeys`] is what the caller persists; it is also registered
    /// here for this process.
    pub fn provision_tenant(&self, user_id: &str, client_share: &[u8]) -> VaultResult<TenantKeys> {
        let dek = Aes256Gcm::generate_key(OsRng);
        let kek = derive_kek(&self.master_secret, client_share);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
        let dek_iv = Aes256Gcm::generate_nonce(OsRng);
        let wrapped_dek = cipher
            .encrypt(&dek_iv, dek.as_slice())
            .map_err(|_| crypto_err("DEK wrap failed"))?;

        let keys = TenantKeys {
            wrapped_dek,
            dek_iv: dek_iv.to_vec(),
            share_hash: hash_share(client_share),
        };
        self.keys.insert(user_id.to_string(), keys.clone());
        info!(user_id, "provisioned tenant encryption keys");
        Ok(keys)
    }

    /// Register previously-persisted key material for a tenant.
    pub fn register_tenant(&self, user_id: &str, keys: TenantKeys) {
        self.keys.insert(user_id.to_string(), keys);
    }

    /// Verify the client share and unwrap the DEK into the cache.
    pub fn unlock(&self, user_id: &str, client_share: &[u8]) -> VaultResult<()> {
        let keys = self
            .keys
            .get(user_id)
            .ok_or_else(|| crypto_err("tenant has no key material"))?;
        if keys.share_hash != hash_share(client_share) {
            return Err(crypto_err("client key share mismatch"));
        }
        let kek = derive_kek(&self.master_secret, client_share);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek.as_ref()));
        let nonce = Nonce::from_slice(&keys.dek_iv);
        let dek_bytes = cipher
            .decrypt(nonce, keys.wrapped_dek.as_slice())
            .map_err(|_| crypto_err("DEK unwrap failed"))?;
        let mut dek = Zeroizing::new([0u8; 32]);
        if dek_bytes.len() != 32 {
            return Err(crypto_err("unwrapped DEK has wrong length"));
        }
        dek.copy_from_slice(&dek_bytes);
        drop(Zeroizing::new(dek_bytes));

        self.dek_cache
            .lock()
            .unwrap()
            .put(user_id.to_string(), CachedDek { key: dek, unlocked_at: Instant::now() });
        debug!(user_id, "tenant DEK unlocked");
        Ok(())
    }

    /// Drop all cached and registered key material for a tenant.
    pub fn evict(&self, user_id: &str) {
        self.keys.remove(user_id);
        self.dek_cache.lock().unwrap().pop(user_id);
    }

    fn dek_for(&self, user_id: &str) -> VaultResult<Zeroizing<[u8; 32]>> {
        let mut cache = self.dek_cache.lock().unwrap();
        match cache.get(user_id) {
            Some(cached) if cached.unlocked_at.elapsed() < DEK_CACHE_TTL => {
                Ok(cached.key.clone())
            }
            Some(_) => {
                cache.pop(user_id);
                Err(crypto_err("tenant DEK expired, unlock again"))
            }
            None => Err(crypto_err("tenant is locked")),
        }
    }

    // -----------------------------------------------------------------------
    // Entry content
    // -----------------------------------------------------------------------

    pub fn encrypt_content(
        &self,
        user_id: &str,
        title: Option<&str>,
        body: &str,
        meta: Option<&Meta>,
    ) -> VaultResult<EntryContent> {
        let dek = self.dek_for(user_id)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(dek.as_ref()));
        let iv = Aes256Gcm::generate_nonce(OsRng).to_vec();

        let body_ct = cipher
            .encrypt(Nonce::from_slice(&field_nonce(&iv, b"body")), body.as_bytes())
            .map_err(|_| crypto_err("body encrypt failed"))?;
        let title_ct = match title {
            Some(t) => Some(
                cipher
                    .encrypt(Nonce::from_slice(&field_nonce(&iv, b"title")), t.as_bytes())
                    .map_err(|_| crypto_err("title encrypt failed"))?,
            ),
            None => None,
        };
        let meta_ct = match meta {
            Some(m) => {
                let json = serde_json::to_vec(m)
                    .map_err(|e| crypto_err(&format!("meta serialize: {e}")))?;
                Some(
                    cipher
                        .encrypt(Nonce::from_slice(&field_nonce(&iv, b"meta")), json.as_slice())
                        .map_err(|_| crypto_err("meta encrypt failed"))?,
                )
            }
            None => None,
        };

        Ok(EntryContent::Encrypted { title: title_ct, body: body_ct, meta: meta_ct, iv })
    }

    /// Decrypt a record's content in place. Plaintext records pass through.
    pub fn decrypt_record(&self, mut rec: EntryRecord) -> VaultResult<EntryRecord> {
        let EntryContent::Encrypted { title, body, meta, iv } = &rec.content else {
            return Ok(rec);
        };
        let user_id = rec
            .user_id
            .as_deref()
            .ok_or_else(|| crypto_err("encrypted record without a tenant"))?;
        let dek = self.dek_for(user_id)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(dek.as_ref()));

        let body_pt = cipher
            .decrypt(Nonce::from_slice(&field_nonce(iv, b"body")), body.as_slice())
            .map_err(|_| crypto_err("body decrypt failed"))?;
        let body_pt =
            String::from_utf8(body_pt).map_err(|_| crypto_err("body is not UTF-8"))?;
        let title_pt = match title {
            Some(ct) => Some(
                String::from_utf8(
                    cipher
                        .decrypt(Nonce::from_slice(&field_nonce(iv, b"title")), ct.as_slice())
                        .map_err(|_| crypto_err("title decrypt failed"))?,
                )
                .map_err(|_| crypto_err("title is not UTF-8"))?,
            ),
            None => None,
        };
        let meta_pt = match meta {
            Some(ct) => {
                let json = cipher
                    .decrypt(Nonce::from_slice(&field_nonce(iv, b"meta")), ct.as_slice())
                    .map_err(|_| crypto_err("meta decrypt failed"))?;
                Some(
                    serde_json::from_slice::<Meta>(&json)
                        .map_err(|e| crypto_err(&format!("meta parse: {e}")))?,
                )
            }
            None => None,
        };

        rec.content = EntryContent::Plain { title: title_pt, body: body_pt, meta: meta_pt };
        Ok(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use context_vault_core::entry::new_entry_id;
    use context_vault_core::kind::Category;
    use std::path::PathBuf;

    fn crypto() -> EnvelopeCrypto {
        let c = EnvelopeCrypto::new(b"master-secret-material");
        c.provision_tenant("u1", b"client-share").unwrap();
        c.unlock("u1", b"client-share").unwrap();
        c
    }

    fn encrypted_record(c: &EnvelopeCrypto, body: &str) -> EntryRecord {
        let content = c.encrypt_content("u1", Some("Title"), body, None).unwrap();
        EntryRecord {
            id: new_entry_id(),
            kind: "insight".into(),
            category: Category::Knowledge,
            content,
            tags: vec![],
            source: None,
            identity_key: None,
            expires_at: None,
            file_path: PathBuf::from("/x.md"),
            created_at: Utc::now(),
            user_id: Some("u1".into()),
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let c = crypto();
        let rec = encrypted_record(&c, "secret body text");
        assert!(rec.content.is_encrypted());
        let plain = c.decrypt_record(rec).unwrap();
        match plain.content {
            EntryContent::Plain { title, body, meta } => {
                assert_eq!(title.as_deref(), Some("Title"));
                assert_eq!(body, "secret body text");
                assert_eq!(meta, None);
            }
            _ => panic!("expected plaintext after decrypt"),
        }
    }

    #[test]
    fn wrong_share_rejected() {
        let c = EnvelopeCrypto::new(b"master");
        c.provision_tenant("u1", b"right-share").unwrap();
        assert!(c.unlock("u1", b"wrong-share").is_err());
    }

    #[test]
    fn locked_tenant_cannot_encrypt() {
        let c = EnvelopeCrypto::new(b"master");
        c.provision_tenant("u1", b"share").unwrap();
        // No unlock.
        assert!(c.encrypt_content("u1", None, "x", None).is_err());
    }

    #[test]
    fn eviction_locks_tenant() {
        let c = crypto();
        assert!(c.encrypt_content("u1", None, "x", None).is_ok());
        c.evict("u1");
        assert!(c.encrypt_content("u1", None, "x", None).is_err());
    }

    #[test]
    fn reprovision_changes_wrapping_not_behavior() {
        let c = EnvelopeCrypto::new(b"master");
        let k1 = c.provision_tenant("u1", b"share").unwrap();
        let k2 = c.provision_tenant("u1", b"share").unwrap();
        assert_ne!(k1.wrapped_dek, k2.wrapped_dek);
        c.unlock("u1", b"share").unwrap();
        let rec = encrypted_record(&c, "body");
        assert!(c.decrypt_record(rec).is_ok());
    }

    #[test]
    fn distinct_ivs_per_row() {
        let c = crypto();
        let a = encrypted_record(&c, "same body");
        let b = encrypted_record(&c, "same body");
        let (EntryContent::Encrypted { iv: iv_a, body: ct_a, .. },
             EntryContent::Encrypted { iv: iv_b, body: ct_b, .. }) = (&a.content, &b.content)
        else {
            panic!("expected encrypted content");
        };
        assert_ne!(iv_a, iv_b);
        assert_ne!(ct_a, ct_b);
    }
}
