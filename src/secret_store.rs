// =============================================================================
// Secret Store — envelope-encrypted per-account venue credentials
// =============================================================================
//
// Two-layer envelope: the payload (the agent-wallet private key) is encrypted
// with a fresh 256-bit data key (DEK) per envelope; the DEK is encrypted with
// the process-wide master key. Rotating the master key therefore rewrites only
// the small DEK ciphertext per record, never the payloads.
//
// AES-256-GCM binds a 128-bit authentication tag to both ciphertexts; any
// altered envelope byte fails authentication on open.
//
// The plaintext never crosses the store boundary: callers receive either a
// short-lived zeroed-on-drop guard or an `AgentSigner` that internalises the
// key material.
// =============================================================================

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Context, Result};
use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::error::EngineError;
use crate::store::Store;
use crate::venue::signer::AgentSigner;

/// GCM nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;
/// Master / data key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

// =============================================================================
// Envelope
// =============================================================================

/// A sealed secret: payload ciphertext + DEK ciphertext, each with its own
/// nonce. Both ciphertexts carry their GCM tag inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretEnvelope {
    pub encrypted_payload: Vec<u8>,
    pub payload_iv: Vec<u8>,
    pub encrypted_dek: Vec<u8>,
    pub dek_iv: Vec<u8>,
}

/// Encrypt `plaintext` under a freshly generated DEK, then encrypt the DEK
/// under `master`.
pub fn seal(master: &Key<Aes256Gcm>, plaintext: &[u8]) -> Result<SecretEnvelope> {
    let mut dek_key = Aes256Gcm::generate_key(OsRng);

    let payload_cipher = Aes256Gcm::new(&dek_key);
    let payload_iv = Aes256Gcm::generate_nonce(&mut OsRng);
    let encrypted_payload = payload_cipher
        .encrypt(&payload_iv, plaintext)
        .map_err(|_| anyhow!("payload encryption failed"))?;

    let master_cipher = Aes256Gcm::new(master);
    let dek_iv = Aes256Gcm::generate_nonce(&mut OsRng);
    let encrypted_dek = master_cipher
        .encrypt(&dek_iv, dek_key.as_slice())
        .map_err(|_| anyhow!("DEK encryption failed"))?;

    dek_key.as_mut_slice().zeroize();

    Ok(SecretEnvelope {
        encrypted_payload,
        payload_iv: payload_iv.to_vec(),
        encrypted_dek,
        dek_iv: dek_iv.to_vec(),
    })
}

/// Decrypt an envelope back to its plaintext. Fails if any byte of either
/// ciphertext, either nonce, or the master key is wrong.
pub fn open(master: &Key<Aes256Gcm>, envelope: &SecretEnvelope) -> Result<Zeroizing<Vec<u8>>> {
    if envelope.payload_iv.len() != NONCE_LEN || envelope.dek_iv.len() != NONCE_LEN {
        return Err(anyhow!("envelope nonce has invalid length"));
    }

    let master_cipher = Aes256Gcm::new(master);
    let dek_nonce = Nonce::from_slice(&envelope.dek_iv);
    let mut dek_bytes = Zeroizing::new(
        master_cipher
            .decrypt(dek_nonce, envelope.encrypted_dek.as_slice())
            .map_err(|_| anyhow!("DEK authentication failed"))?,
    );

    if dek_bytes.len() != KEY_LEN {
        return Err(anyhow!("decrypted DEK has invalid length"));
    }

    let payload_cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&dek_bytes));
    let payload_nonce = Nonce::from_slice(&envelope.payload_iv);
    let plaintext = payload_cipher
        .decrypt(payload_nonce, envelope.encrypted_payload.as_slice())
        .map_err(|_| anyhow!("payload authentication failed"))?;

    dek_bytes.zeroize();
    Ok(Zeroizing::new(plaintext))
}

// =============================================================================
// SecretStore
// =============================================================================

/// Process-wide secret store. Holds the master key (read-only after startup)
/// and persists envelopes through the SQLite store.
pub struct SecretStore {
    master: Key<Aes256Gcm>,
    db: Arc<Store>,
}

impl SecretStore {
    /// Build the store from the `MERIDIAN_MASTER_KEY` environment variable
    /// (64 hex characters). A missing or malformed key is fatal.
    pub fn from_env(db: Arc<Store>) -> Result<Self> {
        let hex_key = std::env::var("MERIDIAN_MASTER_KEY")
            .context("MERIDIAN_MASTER_KEY is not set — refusing to start without a master key")?;

        let mut bytes = Zeroizing::new(
            hex::decode(hex_key.trim()).context("MERIDIAN_MASTER_KEY is not valid hex")?,
        );
        if bytes.len() != KEY_LEN {
            return Err(anyhow!(
                "MERIDIAN_MASTER_KEY must be {} bytes (64 hex chars), got {}",
                KEY_LEN,
                bytes.len()
            ));
        }

        let master = *Key::<Aes256Gcm>::from_slice(&bytes);
        bytes.zeroize();

        let store = Self { master, db };
        store.self_test()?;
        info!("secret store initialised, roundtrip self-test passed");
        Ok(store)
    }

    #[cfg(test)]
    pub fn with_key(master: [u8; KEY_LEN], db: Arc<Store>) -> Self {
        Self {
            master: *Key::<Aes256Gcm>::from_slice(&master),
            db,
        }
    }

    /// Startup roundtrip self-test: seal and open a probe value.
    pub fn self_test(&self) -> Result<()> {
        let probe = b"meridian-secret-store-self-test";
        let envelope = seal(&self.master, probe)?;
        let recovered = open(&self.master, &envelope)?;
        if recovered.as_slice() != probe {
            return Err(anyhow!("secret store self-test roundtrip mismatch"));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Agent-wallet key envelopes
    // -------------------------------------------------------------------------

    /// Seal and persist the agent-wallet private key for an account. Replaces
    /// any existing envelope atomically.
    pub fn put(&self, account_id: &str, plaintext: &str) -> Result<()> {
        let envelope = seal(&self.master, plaintext.as_bytes())?;
        self.db.put_secret_envelope(account_id, &envelope)?;
        info!(account_id, "agent credentials stored");
        Ok(())
    }

    pub fn has(&self, account_id: &str) -> Result<bool> {
        self.db.has_secret_envelope(account_id)
    }

    pub fn delete(&self, account_id: &str) -> Result<()> {
        self.db.delete_secret_envelope(account_id)?;
        info!(account_id, "agent credentials deleted");
        Ok(())
    }

    /// Decrypt the account's agent key and hand back a signer that has
    /// internalised it. The intermediate plaintext is zeroed before return.
    pub fn signer(&self, account_id: &str) -> Result<AgentSigner, EngineError> {
        let envelope = self
            .db
            .get_secret_envelope(account_id)
            .map_err(|e| EngineError::Invariant(format!("secret lookup failed: {e}")))?
            .ok_or_else(|| {
                EngineError::NeedsCredentials(format!("no agent key stored for {account_id}"))
            })?;

        let plaintext = open(&self.master, &envelope).map_err(|e| {
            warn!(account_id, error = %e, "agent key envelope failed to open");
            EngineError::NeedsCredentials(format!("agent key unreadable for {account_id}"))
        })?;

        let key_hex = Zeroizing::new(String::from_utf8_lossy(&plaintext).into_owned());
        AgentSigner::from_hex(&key_hex)
            .map_err(|e| EngineError::NeedsCredentials(format!("invalid agent key: {e}")))
    }

    // -------------------------------------------------------------------------
    // Generic value envelopes (reasoning-provider personal API keys)
    // -------------------------------------------------------------------------

    pub fn seal_value(&self, plaintext: &str) -> Result<SecretEnvelope> {
        seal(&self.master, plaintext.as_bytes())
    }

    pub fn open_value(&self, envelope: &SecretEnvelope) -> Result<Zeroizing<String>> {
        let bytes = open(&self.master, envelope)?;
        Ok(Zeroizing::new(
            String::from_utf8(bytes.to_vec()).context("decrypted value is not UTF-8")?,
        ))
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("master", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> Key<Aes256Gcm> {
        *Key::<Aes256Gcm>::from_slice(&[7u8; KEY_LEN])
    }

    #[test]
    fn seal_open_roundtrip() {
        let master = test_key();
        let envelope = seal(&master, b"0xdeadbeef-private-key").unwrap();
        let plain = open(&master, &envelope).unwrap();
        assert_eq!(plain.as_slice(), b"0xdeadbeef-private-key");
    }

    #[test]
    fn envelopes_are_unique_per_seal() {
        // Fresh DEK + fresh nonces every time: two seals of the same plaintext
        // must not produce identical ciphertext.
        let master = test_key();
        let a = seal(&master, b"same").unwrap();
        let b = seal(&master, b"same").unwrap();
        assert_ne!(a.encrypted_payload, b.encrypted_payload);
        assert_ne!(a.encrypted_dek, b.encrypted_dek);
    }

    #[test]
    fn wrong_master_key_fails() {
        let envelope = seal(&test_key(), b"secret").unwrap();
        let other = *Key::<Aes256Gcm>::from_slice(&[8u8; KEY_LEN]);
        assert!(open(&other, &envelope).is_err());
    }

    #[test]
    fn tampered_payload_fails_authentication() {
        let master = test_key();
        let mut envelope = seal(&master, b"secret").unwrap();
        let last = envelope.encrypted_payload.len() - 1;
        envelope.encrypted_payload[last] ^= 0x01;
        assert!(open(&master, &envelope).is_err());
    }

    #[test]
    fn tampered_dek_fails_authentication() {
        let master = test_key();
        let mut envelope = seal(&master, b"secret").unwrap();
        envelope.encrypted_dek[0] ^= 0x80;
        assert!(open(&master, &envelope).is_err());
    }

    #[test]
    fn tampered_nonce_fails() {
        let master = test_key();
        let mut envelope = seal(&master, b"secret").unwrap();
        envelope.payload_iv[0] ^= 0x01;
        assert!(open(&master, &envelope).is_err());
    }

    #[test]
    fn truncated_nonce_rejected() {
        let master = test_key();
        let mut envelope = seal(&master, b"secret").unwrap();
        envelope.dek_iv.pop();
        assert!(open(&master, &envelope).is_err());
    }
}
