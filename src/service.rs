//! Public operations of the attestation service

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::attestation::{
    AttestationClient, FetchResult, FetchStatus, DEFAULT_PIN_TYPE, PRECHECK_KEY, PREFETCH_URL,
};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::interceptor::Interceptor;
use crate::request::OutboundRequest;
use crate::tls::PinValidator;

/// Reported to the attestation engine after initialization
const USER_PROPERTY: &str = "approov-service-rust";

/// Entry point owning the attestation engine handle and the shared rules
///
/// Cheap to clone; clones share configuration and initialization state.
#[derive(Clone)]
pub struct ApproovService {
    client: Arc<dyn AttestationClient>,
    config: Arc<ServiceConfig>,
    interceptor: Interceptor,
    /// Config string used for the successful initialization, if any
    initialized_with: Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for ApproovService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApproovService")
            .field("config", &self.config)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl ApproovService {
    pub fn new(client: Arc<dyn AttestationClient>) -> Self {
        Self::with_config(client, Arc::new(ServiceConfig::new()))
    }

    pub fn with_config(client: Arc<dyn AttestationClient>, config: Arc<ServiceConfig>) -> Self {
        let interceptor = Interceptor::new(Arc::clone(&client), Arc::clone(&config));
        Self {
            client,
            config,
            interceptor,
            initialized_with: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    /// Validator for TLS handshakes, sharing this service's engine handle
    pub fn pin_validator(&self) -> PinValidator {
        PinValidator::new(Arc::clone(&self.client))
    }

    /// Initialize the attestation engine
    ///
    /// Repeating the call with the same config is a no-op; a different
    /// config is a configuration error.
    pub fn initialize(&self, config: &str) -> Result<()> {
        let mut initialized_with = self.initialized_with.lock();
        if let Some(used) = initialized_with.as_deref() {
            if used != config {
                return Err(Error::Configuration(
                    "Already initialized with a different config".into(),
                ));
            }
            return Ok(());
        }

        self.client
            .initialize(config)
            .map_err(|e| Error::Initialization(e.to_string()))?;
        *initialized_with = Some(config.to_string());
        info!("Attestation engine initialized");

        self.client.set_user_property(USER_PROPERTY);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized_with.lock().is_some()
    }

    /// Warm up the token cache in the background
    ///
    /// Never blocks the caller; the result and any error are discarded.
    pub fn prefetch(&self) {
        if !self.is_initialized() {
            return;
        }

        let client = Arc::clone(&self.client);
        let warm_up = move || match client.fetch_token(PREFETCH_URL) {
            Ok(result) => debug!(status = %result.status, "Prefetch finished"),
            Err(e) => debug!(error = %e, "Prefetch failed"),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(warm_up);
            }
            Err(_) => {
                std::thread::spawn(warm_up);
            }
        }
    }

    /// Annotate an outbound request; requests pass unchanged until the
    /// service is initialized
    pub fn intercept(&self, request: OutboundRequest) -> Result<OutboundRequest> {
        if !self.is_initialized() {
            return Ok(request);
        }
        self.interceptor.intercept(request)
    }

    /// Run [`ApproovService::intercept`] on the blocking pool so the
    /// attestation calls never stall the async runtime
    pub async fn intercept_async(&self, request: OutboundRequest) -> Result<OutboundRequest> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.intercept(request))
            .await
            .map_err(|e| Error::Permanent(format!("Interception task failed: {}", e)))?
    }

    /// Fetch a token for `url` outside of request interception
    ///
    /// The token must not be cached by the caller.
    pub fn fetch_token(&self, url: &str) -> Result<String> {
        let result = self
            .client
            .fetch_token(url)
            .map_err(|e| Error::Permanent(format!("FetchToken: {}", e)))?;
        info!(url, status = %result.status, "FetchToken");

        match result.status {
            FetchStatus::Success => result
                .token
                .ok_or_else(|| Error::Permanent("FetchToken: token is missing".into())),
            status if status.is_retryable() => {
                Err(Error::retry("FetchToken: networking error, retry needed"))
            }
            status => Err(Error::Permanent(format!("FetchToken: {}", status))),
        }
    }

    /// Look up a secure string, or define it when `new_def` is given
    ///
    /// The value must not be cached by the caller.
    pub fn fetch_secure_string(&self, key: &str, new_def: Option<&str>) -> Result<String> {
        let kind = if new_def.is_some() { "definition" } else { "lookup" };
        let result = self
            .client
            .fetch_secure_string(key, new_def)
            .map_err(|e| Error::Permanent(format!("FetchSecureString: {}", e)))?;
        info!(kind, status = %result.status, "FetchSecureString");

        match result.status {
            FetchStatus::Disabled => Err(Error::Configuration(
                "FetchSecureString: secure string feature is disabled".into(),
            )),
            FetchStatus::UnknownKey => Err(Error::Configuration(
                "FetchSecureString: secure string unknown key".into(),
            )),
            _ => {
                let result = check_fetch(result, "FetchSecureString")?;
                result.secure_string.ok_or_else(|| {
                    Error::Permanent("FetchSecureString: secure string is missing".into())
                })
            }
        }
    }

    /// Fetch a JWT carrying the given JSON claims
    pub fn fetch_custom_jwt(&self, payload: &str) -> Result<String> {
        serde_json::from_str::<serde_json::Value>(payload)
            .map_err(|e| Error::Permanent(format!("FetchCustomJWT: malformed JSON: {}", e)))?;

        let result = self
            .client
            .fetch_custom_jwt(payload)
            .map_err(|e| Error::Permanent(format!("FetchCustomJWT: {}", e)))?;
        info!(status = %result.status, "FetchCustomJWT");

        if result.status == FetchStatus::Disabled {
            return Err(Error::Configuration(
                "FetchCustomJWT: feature not enabled".into(),
            ));
        }
        let result = check_fetch(result, "FetchCustomJWT")?;
        result
            .token
            .ok_or_else(|| Error::Permanent("FetchCustomJWT: token is missing".into()))
    }

    /// Surface attestation rejection or network failure without needing a
    /// real secure string key
    pub fn precheck(&self) -> Result<()> {
        let result = self
            .client
            .fetch_secure_string(PRECHECK_KEY, None)
            .map_err(|e| Error::Permanent(format!("Precheck: {}", e)))?;

        if result.status != FetchStatus::UnknownKey {
            check_fetch(result, "Precheck")?;
        }
        info!("Precheck passed");
        Ok(())
    }

    pub fn get_device_id(&self) -> Result<String> {
        self.client.get_device_id().ok_or_else(|| {
            warn!("Device ID unavailable");
            Error::Permanent("DeviceID: not available".into())
        })
    }

    /// Bind a hash of `data` into subsequently fetched tokens
    pub fn set_data_hash_in_token(&self, data: &str) {
        debug!("SetDataHashInToken");
        self.client.set_data_hash_in_token(data);
    }

    pub fn get_message_signature(&self, message: &str) -> Option<String> {
        debug!("GetMessageSignature");
        self.client.get_message_signature(message)
    }

    /// Current pin set as JSON, for the given pin type or the default
    pub fn get_pins_json(&self, pin_type: Option<&str>) -> Result<String> {
        self.client
            .get_pins_json(pin_type.unwrap_or(DEFAULT_PIN_TYPE))
            .map_err(|e| Error::Permanent(format!("GetPinsJSON: {}", e)))
    }

    /// Force attestation to pass; development builds only
    pub fn set_dev_key(&self, dev_key: &str) {
        warn!("Development key set");
        self.client.set_dev_key(dev_key);
    }

    pub fn set_token_header(&self, header: &str, prefix: &str) -> Result<()> {
        self.config.set_token_header(header, prefix)
    }

    pub fn set_binding_header(&self, header: Option<&str>) -> Result<()> {
        self.config.set_binding_header(header)
    }

    pub fn set_proceed_on_network_fail(&self, proceed: bool) {
        self.config.set_proceed_on_network_fail(proceed)
    }

    pub fn add_exclusion_url_regex(&self, pattern: &str) -> Result<()> {
        self.config.add_exclusion_url_regex(pattern)
    }

    pub fn remove_exclusion_url_regex(&self, pattern: &str) {
        self.config.remove_exclusion_url_regex(pattern)
    }

    pub fn add_substitution_header(&self, header: &str, prefix: Option<&str>) -> Result<()> {
        self.config.add_substitution_header(header, prefix)
    }

    pub fn remove_substitution_header(&self, header: &str) {
        self.config.remove_substitution_header(header)
    }

    pub fn add_substitution_query_param(&self, pattern: &str) -> Result<()> {
        self.config.add_substitution_query_param(pattern)
    }

    pub fn remove_substitution_query_param(&self, pattern: &str) {
        self.config.remove_substitution_query_param(pattern)
    }
}

/// Map a non-success fetch status to the matching error
fn check_fetch(result: FetchResult, context: &str) -> Result<FetchResult> {
    match result.status {
        FetchStatus::Success => Ok(result),
        FetchStatus::Rejected => Err(Error::rejection(
            format!("{}: rejected", context),
            result.arc.as_deref(),
            result.rejection_reasons.as_deref(),
        )),
        status if status.is_retryable() => Err(Error::retry(format!(
            "{}: network issue, retry needed",
            context
        ))),
        status => Err(Error::Permanent(format!("{}: {}", context, status))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::mock::MockAttestation;
    use crate::error::BridgeError;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn new_service(mock: MockAttestation) -> (Arc<MockAttestation>, ApproovService) {
        let mock = Arc::new(mock);
        (mock.clone(), ApproovService::new(mock))
    }

    #[test]
    fn test_initialize_is_idempotent_for_same_config() {
        let (mock, service) = new_service(MockAttestation::new());
        service.initialize("config-a").unwrap();
        service.initialize("config-a").unwrap();

        assert!(service.is_initialized());
        assert_eq!(mock.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.user_properties.lock().as_slice(), [USER_PROPERTY.to_string()]);

        assert!(matches!(
            service.initialize("config-b"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_initialize_failure() {
        let (_, service) = new_service(MockAttestation::new().with_init_failure("bad config"));
        assert!(matches!(
            service.initialize("config-a"),
            Err(Error::Initialization(_))
        ));
        assert!(!service.is_initialized());
    }

    #[test]
    fn test_intercept_before_initialize_is_a_no_op() {
        let (mock, service) = new_service(MockAttestation::new());
        let request = service
            .intercept(OutboundRequest::new("https://api.example.com/"))
            .unwrap();
        assert!(request.headers.is_empty());
        assert_eq!(mock.token_calls(), 0);

        service.initialize("config").unwrap();
        let request = service
            .intercept(OutboundRequest::new("https://api.example.com/"))
            .unwrap();
        assert!(request.headers.contains_key("approov-token"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_intercept_async_runs_on_blocking_pool() {
        let (_, service) = new_service(MockAttestation::new());
        service.initialize("config").unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let service = service.clone();
                tokio::spawn(async move {
                    service
                        .intercept_async(OutboundRequest::new(format!(
                            "https://api.example.com/{i}"
                        )))
                        .await
                })
            })
            .collect();
        for handle in handles {
            let request = handle.await.unwrap().unwrap();
            assert!(request.headers.contains_key("approov-token"));
        }
    }

    #[test]
    fn test_prefetch_without_runtime() {
        let (mock, service) = new_service(MockAttestation::new());
        service.prefetch();
        assert_eq!(mock.token_calls(), 0);

        service.initialize("config").unwrap();
        service.prefetch();
        for _ in 0..100 {
            if mock.token_calls() == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(mock.token_urls.lock().as_slice(), [PREFETCH_URL.to_string()]);
    }

    #[tokio::test]
    async fn test_prefetch_ignores_failures() {
        let (mock, service) = new_service(
            MockAttestation::new().with_token_result(Err(BridgeError("offline".into()))),
        );
        service.initialize("config").unwrap();
        service.prefetch();
        for _ in 0..100 {
            if mock.token_calls() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mock.token_calls(), 1);
    }

    #[test]
    fn test_fetch_token() {
        let (_, service) = new_service(MockAttestation::new());
        assert_eq!(service.fetch_token("https://api.example.com").unwrap(), "header.claims.sig");

        let (_, service) = new_service(MockAttestation::new().with_token_status(FetchStatus::NoNetwork));
        assert!(service.fetch_token("https://api.example.com").unwrap_err().is_retryable());

        let (_, service) =
            new_service(MockAttestation::new().with_token_status(FetchStatus::UnprotectedUrl));
        assert!(matches!(
            service.fetch_token("https://api.example.com"),
            Err(Error::Permanent(_))
        ));
    }

    #[test]
    fn test_fetch_secure_string() {
        let (_, service) = new_service(
            MockAttestation::new()
                .with_secure_string("key", FetchResult::secure_string("value"))
                .with_secure_string("off", FetchResult::with_status(FetchStatus::Disabled))
                .with_secure_string("net", FetchResult::with_status(FetchStatus::MitmDetected))
                .with_secure_string("bad", FetchResult::with_status(FetchStatus::BadKey))
                .with_secure_string("empty", FetchResult::with_status(FetchStatus::Success)),
        );

        assert_eq!(service.fetch_secure_string("key", None).unwrap(), "value");
        assert!(matches!(
            service.fetch_secure_string("missing", None),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            service.fetch_secure_string("off", None),
            Err(Error::Configuration(_))
        ));
        assert!(service.fetch_secure_string("net", None).unwrap_err().is_retryable());
        assert!(matches!(
            service.fetch_secure_string("bad", None),
            Err(Error::Permanent(_))
        ));
        assert!(matches!(
            service.fetch_secure_string("empty", None),
            Err(Error::Permanent(_))
        ));
    }

    #[test]
    fn test_secure_string_rejection_is_surfaced() {
        let (_, service) = new_service(
            MockAttestation::new()
                .with_secure_string("key", FetchResult::rejected("123", "device-failure")),
        );
        match service.fetch_secure_string("key", Some("new")) {
            Err(Error::Rejection { arc, reasons, .. }) => {
                assert_eq!(arc, "123");
                assert_eq!(reasons, "device-failure");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_fetch_custom_jwt() {
        let (_, service) = new_service(MockAttestation::new());
        assert_eq!(service.fetch_custom_jwt(r#"{"sub":"me"}"#).unwrap(), "jwt.claims.sig");
        assert!(matches!(
            service.fetch_custom_jwt("{not json"),
            Err(Error::Permanent(_))
        ));

        let (_, service) = new_service(
            MockAttestation::new()
                .with_custom_jwt(Ok(FetchResult::with_status(FetchStatus::Disabled))),
        );
        assert!(matches!(
            service.fetch_custom_jwt("{}"),
            Err(Error::Configuration(_))
        ));

        let (_, service) = new_service(
            MockAttestation::new().with_custom_jwt(Ok(FetchResult::rejected("7", "root"))),
        );
        assert_eq!(service.fetch_custom_jwt("{}").unwrap_err().rejection_arc(), Some("7"));

        let (_, service) =
            new_service(MockAttestation::new().with_custom_jwt(Err(BridgeError("jni".into()))));
        assert!(matches!(
            service.fetch_custom_jwt("{}"),
            Err(Error::Permanent(_))
        ));
    }

    #[test]
    fn test_precheck() {
        let (mock, service) = new_service(MockAttestation::new());
        service.precheck().unwrap();
        assert_eq!(mock.secure_keys.lock().as_slice(), [PRECHECK_KEY.to_string()]);

        let (_, service) = new_service(
            MockAttestation::new()
                .with_secure_string(PRECHECK_KEY, FetchResult::rejected("123", "device-failure")),
        );
        assert_eq!(service.precheck().unwrap_err().rejection_arc(), Some("123"));

        let (_, service) = new_service(MockAttestation::new().with_secure_string(
            PRECHECK_KEY,
            FetchResult::with_status(FetchStatus::PoorNetwork),
        ));
        assert!(service.precheck().unwrap_err().is_retryable());

        let (_, service) = new_service(MockAttestation::new().with_secure_string(
            PRECHECK_KEY,
            FetchResult::with_status(FetchStatus::NotInitialized),
        ));
        assert!(matches!(service.precheck(), Err(Error::Permanent(_))));
    }

    #[test]
    fn test_engine_passthroughs() {
        let (mock, service) = new_service(MockAttestation::new());
        assert_eq!(service.get_device_id().unwrap(), "device-1");
        assert_eq!(service.get_message_signature("m").as_deref(), Some("sig:m"));
        assert_eq!(service.get_pins_json(None).unwrap(), "{}");
        service.set_data_hash_in_token("payload");
        service.set_dev_key("dev");
        assert_eq!(mock.data_hashes.lock().as_slice(), ["payload".to_string()]);
        assert_eq!(mock.dev_keys.lock().as_slice(), ["dev".to_string()]);

        let (_, service) = new_service(MockAttestation::new().with_device_id(None));
        assert!(matches!(service.get_device_id(), Err(Error::Permanent(_))));
    }

    #[test]
    fn test_rule_updates_visible_to_next_request() {
        let (mock, service) = new_service(MockAttestation::new());
        service.initialize("config").unwrap();

        service.add_exclusion_url_regex("^https://api").unwrap();
        service.intercept(OutboundRequest::new("https://api.example.com/")).unwrap();
        assert_eq!(mock.token_calls(), 0);

        service.remove_exclusion_url_regex("^https://api");
        service.intercept(OutboundRequest::new("https://api.example.com/")).unwrap();
        assert_eq!(mock.token_calls(), 1);
    }
}
