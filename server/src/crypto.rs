use std::sync::Arc;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Prefix marking a sealed column value. Values without it are plaintext
/// (written while no key was configured) and pass through untouched.
const SEALED_PREFIX: &str = "enc:";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("master key must be {0} hex-encoded bytes")]
    BadKeyLength(usize),
    #[error("master key is not valid hex")]
    BadKeyEncoding(#[from] hex::FromHexError),
    #[error("sealed value present but no master key is configured")]
    NoKey,
    #[error("sealed value is corrupt")]
    Corrupt,
}

/// Symmetric column encryptor, initialised once from configuration and
/// handed to repositories by injection. AES-256-GCM with a random
/// per-value nonce; stored form is `enc:` + hex(nonce || ciphertext).
#[derive(Clone)]
pub struct Encryptor {
    key: Option<Arc<LessSafeKey>>,
    rng: SystemRandom,
}

impl Encryptor {
    pub fn from_hex_key(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key)?;
        let unbound = UnboundKey::new(&AES_256_GCM, &bytes)
            .map_err(|_| CryptoError::BadKeyLength(AES_256_GCM.key_len()))?;

        Ok(Self {
            key: Some(Arc::new(LessSafeKey::new(unbound))),
            rng: SystemRandom::new(),
        })
    }

    /// An encryptor that stores everything as plaintext.
    pub fn disabled() -> Self {
        Self {
            key: None,
            rng: SystemRandom::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let Some(key) = self.key.as_ref() else {
            return Ok(plaintext.to_string());
        };

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Corrupt)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Corrupt)?;

        let mut stored = nonce_bytes.to_vec();
        stored.extend_from_slice(&in_out);

        Ok(format!("{SEALED_PREFIX}{}", hex::encode(stored)))
    }

    pub fn open(&self, stored: &str) -> Result<String, CryptoError> {
        let Some(sealed) = stored.strip_prefix(SEALED_PREFIX) else {
            return Ok(stored.to_string());
        };
        let key = self.key.as_ref().ok_or(CryptoError::NoKey)?;

        let bytes = hex::decode(sealed).map_err(|_| CryptoError::Corrupt)?;
        if bytes.len() < NONCE_LEN {
            return Err(CryptoError::Corrupt);
        }
        let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Corrupt)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Corrupt)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0f1e2d3c4b5a69788796a5b4c3d2e1f00112233445566778899aabbccddeeff0";

    #[test]
    fn seals_and_opens() {
        let enc = Encryptor::from_hex_key(KEY).unwrap();
        let sealed = enc.seal(r#"{"DB_PASSWORD":"hunter2"}"#).unwrap();

        assert!(sealed.starts_with(SEALED_PREFIX));
        assert!(!sealed.contains("hunter2"));
        assert_eq!(enc.open(&sealed).unwrap(), r#"{"DB_PASSWORD":"hunter2"}"#);
    }

    #[test]
    fn nonces_are_fresh() {
        let enc = Encryptor::from_hex_key(KEY).unwrap();
        assert_ne!(enc.seal("same").unwrap(), enc.seal("same").unwrap());
    }

    #[test]
    fn disabled_passes_through() {
        let enc = Encryptor::disabled();
        assert_eq!(enc.seal("plain").unwrap(), "plain");
        assert_eq!(enc.open("plain").unwrap(), "plain");
    }

    #[test]
    fn plaintext_rows_survive_enabling_encryption() {
        let enc = Encryptor::from_hex_key(KEY).unwrap();
        assert_eq!(enc.open("legacy-plaintext").unwrap(), "legacy-plaintext");
    }

    #[test]
    fn sealed_without_key_is_an_error() {
        let enc = Encryptor::from_hex_key(KEY).unwrap();
        let sealed = enc.seal("secret").unwrap();
        assert!(matches!(
            Encryptor::disabled().open(&sealed),
            Err(CryptoError::NoKey)
        ));
    }

    #[test]
    fn rejects_short_keys() {
        assert!(Encryptor::from_hex_key("abcd").is_err());
    }
}
