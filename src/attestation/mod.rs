//! Attestation capability consumed by the interceptor and pin validator
//!
//! The attestation engine itself (device integrity measurement, token
//! signing, enclave bridging) lives outside this crate. Everything here talks
//! to it through [`AttestationClient`], a narrow synchronous interface:
//!
//! - Every call blocks until the engine answers; the engine owns its own
//!   timeouts and retries.
//! - A call can fail at the bridge level, which is reported as
//!   [`BridgeError`] and is distinct from any [`FetchStatus`] it returns.
//! - Implementations must be safe to call from many threads at once.

pub mod types;

#[cfg(test)]
pub(crate) mod mock;

pub use types::{FetchResult, FetchStatus, PolicyClass};

pub use crate::error::BridgeError;

/// Result of a bridge call into the attestation engine
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Pin type requested when no other is given
pub const DEFAULT_PIN_TYPE: &str = "public-key-sha256";

/// Secure string key used by precheck; it does not need to exist
pub const PRECHECK_KEY: &str = "precheck-dummy-key";

/// URL whose token is fetched by the background warm-up
pub const PREFETCH_URL: &str = "approov.io";

/// Synchronous query interface of the attestation engine
pub trait AttestationClient: Send + Sync {
    /// Initialize the engine with an account configuration string
    fn initialize(&self, config: &str) -> BridgeResult<()>;

    /// Fetch an attestation token for the given URL
    fn fetch_token(&self, url: &str) -> BridgeResult<FetchResult>;

    /// Look up (or define, when `new_def` is given) a secure string
    fn fetch_secure_string(&self, key: &str, new_def: Option<&str>) -> BridgeResult<FetchResult>;

    /// Fetch a JWT carrying the given JSON claims
    fn fetch_custom_jwt(&self, payload: &str) -> BridgeResult<FetchResult>;

    /// Current pin set as JSON: host (or `*`) to list of base64 pins
    fn get_pins_json(&self, pin_type: &str) -> BridgeResult<String>;

    /// Hash `data` and bind it into subsequently fetched tokens
    fn set_data_hash_in_token(&self, data: &str);

    fn get_device_id(&self) -> Option<String>;

    fn get_message_signature(&self, message: &str) -> Option<String>;

    /// Development key that forces attestation to pass in test builds
    fn set_dev_key(&self, dev_key: &str);

    /// Report an integration property to the engine
    fn set_user_property(&self, _property: &str) {}
}
