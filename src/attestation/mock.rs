//! Scripted in-memory attestation engine for tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{AttestationClient, BridgeError, BridgeResult, FetchResult, FetchStatus};

/// Returns queued answers and records every call it receives
pub(crate) struct MockAttestation {
    token: Mutex<BridgeResult<FetchResult>>,
    secure_strings: Mutex<HashMap<String, FetchResult>>,
    custom_jwt: Mutex<BridgeResult<FetchResult>>,
    pins: Mutex<BridgeResult<String>>,
    device_id: Mutex<Option<String>>,
    init_failure: Mutex<Option<String>>,
    pub token_calls: AtomicUsize,
    pub pin_calls: AtomicUsize,
    pub init_calls: AtomicUsize,
    pub token_urls: Mutex<Vec<String>>,
    pub secure_keys: Mutex<Vec<String>>,
    pub data_hashes: Mutex<Vec<String>>,
    pub user_properties: Mutex<Vec<String>>,
    pub dev_keys: Mutex<Vec<String>>,
}

impl MockAttestation {
    pub fn new() -> Self {
        Self {
            token: Mutex::new(Ok(FetchResult::token("header.claims.sig"))),
            secure_strings: Mutex::new(HashMap::new()),
            custom_jwt: Mutex::new(Ok(FetchResult::token("jwt.claims.sig"))),
            pins: Mutex::new(Ok("{}".to_string())),
            device_id: Mutex::new(Some("device-1".to_string())),
            init_failure: Mutex::new(None),
            token_calls: AtomicUsize::new(0),
            pin_calls: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            token_urls: Mutex::new(Vec::new()),
            secure_keys: Mutex::new(Vec::new()),
            data_hashes: Mutex::new(Vec::new()),
            user_properties: Mutex::new(Vec::new()),
            dev_keys: Mutex::new(Vec::new()),
        }
    }

    pub fn with_token_result(self, result: BridgeResult<FetchResult>) -> Self {
        *self.token.lock() = result;
        self
    }

    pub fn with_token_status(self, status: FetchStatus) -> Self {
        self.with_token_result(Ok(FetchResult::with_status(status)))
    }

    pub fn with_secure_string(self, key: &str, result: FetchResult) -> Self {
        self.secure_strings.lock().insert(key.to_string(), result);
        self
    }

    pub fn with_custom_jwt(self, result: BridgeResult<FetchResult>) -> Self {
        *self.custom_jwt.lock() = result;
        self
    }

    pub fn with_pins(self, pins: BridgeResult<String>) -> Self {
        *self.pins.lock() = pins;
        self
    }

    pub fn with_device_id(self, device_id: Option<&str>) -> Self {
        *self.device_id.lock() = device_id.map(str::to_string);
        self
    }

    pub fn with_init_failure(self, message: &str) -> Self {
        *self.init_failure.lock() = Some(message.to_string());
        self
    }

    pub fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }
}

impl AttestationClient for MockAttestation {
    fn initialize(&self, _config: &str) -> BridgeResult<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        match self.init_failure.lock().as_ref() {
            Some(message) => Err(BridgeError(message.clone())),
            None => Ok(()),
        }
    }

    fn fetch_token(&self, url: &str) -> BridgeResult<FetchResult> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        self.token_urls.lock().push(url.to_string());
        self.token.lock().clone()
    }

    fn fetch_secure_string(&self, key: &str, _new_def: Option<&str>) -> BridgeResult<FetchResult> {
        self.secure_keys.lock().push(key.to_string());
        Ok(self
            .secure_strings
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| FetchResult::with_status(FetchStatus::UnknownKey)))
    }

    fn fetch_custom_jwt(&self, _payload: &str) -> BridgeResult<FetchResult> {
        self.custom_jwt.lock().clone()
    }

    fn get_pins_json(&self, _pin_type: &str) -> BridgeResult<String> {
        self.pin_calls.fetch_add(1, Ordering::SeqCst);
        self.pins.lock().clone()
    }

    fn set_data_hash_in_token(&self, data: &str) {
        self.data_hashes.lock().push(data.to_string());
    }

    fn get_device_id(&self) -> Option<String> {
        self.device_id.lock().clone()
    }

    fn get_message_signature(&self, message: &str) -> Option<String> {
        Some(format!("sig:{}", message))
    }

    fn set_dev_key(&self, dev_key: &str) {
        self.dev_keys.lock().push(dev_key.to_string());
    }

    fn set_user_property(&self, property: &str) {
        self.user_properties.lock().push(property.to_string());
    }
}
