use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{KEY_ID_LENGTH, KEY_SECRET_LENGTH};

/// Prefix carried by every key this control plane issues.
pub const KEY_PREFIX: &str = "rw_prod_";

/// The unreserved URL-safe alphabet used for all opaque identifiers
/// (key ids, secrets, magic-link tokens, job ids).
pub const TOKEN_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Sample `len` characters from [`TOKEN_ALPHABET`] using the thread RNG.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

fn in_alphabet(s: &str) -> bool {
    s.bytes().all(|b| TOKEN_ALPHABET.contains(&b))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed api key")]
pub struct KeyFormatError;

/// An API key as presented on the wire: `rw_prod_{key_id}.{secret}`.
///
/// Holding a `PresentedKey` only proves the header was well formed; the
/// secret still has to be verified against the stored hash.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PresentedKey {
    key_id: String,
    secret: String,
}

impl PresentedKey {
    pub fn new(key_id: String, secret: String) -> Self {
        Self { key_id, secret }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl FromStr for PresentedKey {
    type Err = KeyFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(KEY_PREFIX).ok_or(KeyFormatError)?;
        let (key_id, secret) = rest.split_once('.').ok_or(KeyFormatError)?;

        if key_id.len() != KEY_ID_LENGTH
            || secret.len() != KEY_SECRET_LENGTH
            || !in_alphabet(key_id)
            || !in_alphabet(secret)
        {
            return Err(KeyFormatError);
        }

        Ok(Self {
            key_id: key_id.to_string(),
            secret: secret.to_string(),
        })
    }
}

impl Display for PresentedKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{KEY_PREFIX}{}.{}", self.key_id, self.secret)
    }
}

// Never leak the secret through debug output.
impl std::fmt::Debug for PresentedKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PresentedKey({}{}.****)", KEY_PREFIX, self.key_id)
    }
}

impl TryFrom<String> for PresentedKey {
    type Error = KeyFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PresentedKey> for String {
    fn from(key: PresentedKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JOB_ID_LENGTH, MAGIC_TOKEN_LENGTH};

    #[test]
    fn random_tokens_stay_in_alphabet() {
        for len in [JOB_ID_LENGTH, MAGIC_TOKEN_LENGTH, KEY_SECRET_LENGTH] {
            let token = random_token(len);
            assert_eq!(token.len(), len);
            assert!(in_alphabet(&token));
        }
    }

    #[test]
    fn parses_wellformed_key() {
        let raw = format!("rw_prod_{}.{}", "a".repeat(16), "b".repeat(32));
        let key: PresentedKey = raw.parse().unwrap();
        assert_eq!(key.key_id(), "a".repeat(16));
        assert_eq!(key.to_string(), raw);
    }

    #[test]
    fn rejects_bad_shapes() {
        let long_id = format!("rw_prod_{}.{}", "a".repeat(17), "b".repeat(32));
        let bad_char = format!("rw_prod_{}.{}", "a".repeat(16), format!("{}!", "b".repeat(31)));
        for raw in [
            "",
            "rw_prod_short.secret",
            "wrong_prefix_aaaaaaaaaaaaaaaa.bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            long_id.as_str(),
            bad_char.as_str(),
        ] {
            assert!(raw.parse::<PresentedKey>().is_err(), "accepted {raw:?}");
        }
    }
}
