pub mod key;
pub mod models;
pub mod scope;

pub use key::PresentedKey;
pub use scope::Scope;

/// Length of the public half of an API key.
pub const KEY_ID_LENGTH: usize = 16;
/// Length of the secret half of an API key.
pub const KEY_SECRET_LENGTH: usize = 32;
/// Length of a magic-link token.
pub const MAGIC_TOKEN_LENGTH: usize = 32;
/// Length of the job handle returned by deployment creation.
pub const JOB_ID_LENGTH: usize = 16;

/// Minutes a magic link stays redeemable after issuance.
pub const MAGIC_LINK_TTL_MINUTES: i64 = 15;
