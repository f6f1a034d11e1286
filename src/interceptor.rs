//! Request interception
//!
//! Before a request leaves the application the interceptor:
//! 1. Resolves the absolute URL and skips excluded URLs
//! 2. Binds the binding header value into the next token
//! 3. Fetches a token and writes the token header
//! 4. Substitutes secure strings into headers and query parameters
//!
//! All attestation calls block, so `intercept` must run on its own worker
//! (see [`crate::ApproovService::intercept_async`]).

use std::ops::Range;
use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue};
use tracing::{debug, info};

use crate::attestation::{AttestationClient, BridgeResult, FetchResult, FetchStatus, PolicyClass};
use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::request::OutboundRequest;

/// Adds attestation tokens and secure strings to outbound requests
#[derive(Clone)]
pub struct Interceptor {
    client: Arc<dyn AttestationClient>,
    config: Arc<ServiceConfig>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Interceptor {
    pub fn new(client: Arc<dyn AttestationClient>, config: Arc<ServiceConfig>) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    /// Annotate `request` with a token and perform substitutions
    pub fn intercept(&self, mut request: OutboundRequest) -> Result<OutboundRequest> {
        // 1. Resolve the full URL
        let url = request.resolve_url()?.to_string();

        // 2. Excluded URLs pass through untouched
        if self.config.is_url_excluded(&url) {
            debug!(url = %url, "URL excluded from attestation");
            return Ok(request);
        }

        // 3. Bind the binding header value into the token
        let merged = request.merged_headers();
        if let Some(binding_header) = self.config.binding_header() {
            let value = binding_value(&merged, &binding_header)?;
            self.client.set_data_hash_in_token(value);
            debug!(header = %binding_header, "Binding header set");
        }

        // 4. Fetch the token
        let result = self
            .client
            .fetch_token(&url)
            .map_err(|e| Error::Permanent(format!("Token fetch for {} failed: {}", url, e)))?;
        info!(url = %url, status = %result.status, token = %result.loggable_token, "Token fetched");

        // 5. Act on the status
        match result.status {
            FetchStatus::Success => {
                let token = result.token.as_deref().ok_or_else(|| {
                    Error::Permanent("Token fetch succeeded without a token".into())
                })?;
                let token_header = self.config.token_header();
                let value = HeaderValue::from_str(&format!("{}{}", token_header.prefix, token))?;
                request.headers.remove(&token_header.name);
                request.headers.insert(token_header.name, value);
            }
            status if status.is_retryable() => {
                if !self.config.proceed_on_network_fail() {
                    return Err(Error::retry(format!(
                        "Retry attempt needed: {}",
                        result.loggable_token
                    )));
                }
                info!(url = %url, status = %status, "Proceeding without token after network failure");
            }
            FetchStatus::UnknownUrl | FetchStatus::UnprotectedUrl | FetchStatus::NoApproovService => {
                debug!(url = %url, status = %result.status, "Continuing without token");
            }
            status => {
                return Err(Error::Permanent(format!(
                    "Unexpected token fetch status {}",
                    status
                )))
            }
        }

        // 6. Substitutions only run on attested or deliberately unprotected
        // channels
        if !matches!(
            result.status,
            FetchStatus::Success | FetchStatus::UnprotectedUrl
        ) {
            return Ok(request);
        }

        // 7. Header substitution
        self.substitute_headers(&mut request, &merged)?;

        // 8. Query parameter substitution
        self.substitute_query_params(&mut request, url)?;

        Ok(request)
    }

    fn substitute_headers(
        &self,
        request: &mut OutboundRequest,
        merged: &reqwest::header::HeaderMap,
    ) -> Result<()> {
        for (header, prefix) in self.config.substitution_headers() {
            let Some(value) = merged.get(&header).and_then(|v| v.to_str().ok()) else {
                continue;
            };
            let Some(key) = value.strip_prefix(prefix.as_str()).filter(|k| !k.is_empty()) else {
                continue;
            };

            let result = self.client.fetch_secure_string(key, None);
            if let Some(secure) = self.substitution_value(result, "Header substitution")? {
                debug!(header = %header, "Substituting header");
                let value = HeaderValue::from_str(&format!("{}{}", prefix, secure))?;
                request.headers.insert(header, value);
            }
        }
        Ok(())
    }

    fn substitute_query_params(&self, request: &mut OutboundRequest, mut url: String) -> Result<()> {
        for regex in self.config.substitution_query_params() {
            // Group 0 is the whole match; exactly one capture group is expected
            if regex.captures_len() != 2 {
                debug!(pattern = %regex, "Skipping query pattern without exactly one capture group");
                continue;
            }

            // Captured keys with their byte ranges in the current URL
            let keys: Vec<(Range<usize>, String)> = regex
                .captures_iter(&url)
                .filter_map(|captures| captures.get(1))
                .filter(|key| !key.is_empty())
                .map(|key| (key.range(), key.as_str().to_string()))
                .collect();

            let mut replacements = Vec::with_capacity(keys.len());
            for (range, key) in keys {
                let result = self.client.fetch_secure_string(&key, None);
                if let Some(secure) = self.substitution_value(result, "Query parameter substitution")? {
                    replacements.push((range, secure));
                }
            }
            if replacements.is_empty() {
                continue;
            }

            // Right to left, so earlier ranges stay valid
            for (range, secure) in replacements.into_iter().rev() {
                url.replace_range(range, &secure);
            }
            debug!(pattern = %regex, "Substituted query parameter");
            request.uri = Some(url.clone());
        }
        Ok(())
    }

    /// Interpret a secure string fetch made during substitution. `None`
    /// means the value is left as it is.
    fn substitution_value(
        &self,
        result: BridgeResult<FetchResult>,
        context: &str,
    ) -> Result<Option<String>> {
        let result = result.map_err(|e| Error::Permanent(format!("{}: {}", context, e)))?;
        debug!(status = %result.status, "{}", context);

        match result.policy_class() {
            PolicyClass::SuccessLike if result.status == FetchStatus::Success => {
                result.secure_string.map(Some).ok_or_else(|| {
                    Error::Permanent(format!("{}: secure string missing from result", context))
                })
            }
            PolicyClass::Rejection => Err(Error::rejection(
                format!("{}: rejected", context),
                result.arc.as_deref(),
                result.rejection_reasons.as_deref(),
            )),
            PolicyClass::Retryable => {
                if self.config.proceed_on_network_fail() {
                    Ok(None)
                } else {
                    Err(Error::retry(format!("{}: network issue, retry needed", context)))
                }
            }
            _ if result.status == FetchStatus::UnknownKey => Ok(None),
            _ => Err(Error::Permanent(format!("{}: {}", context, result.status))),
        }
    }
}

/// The single value of the binding header
fn binding_value<'a>(
    headers: &'a reqwest::header::HeaderMap,
    name: &HeaderName,
) -> Result<&'a str> {
    let mut values = headers.get_all(name).iter();
    match (values.next(), values.next()) {
        (Some(value), None) => value.to_str().map_err(|_| {
            Error::Configuration(format!("Binding header {} value is not valid text", name))
        }),
        (None, _) => Err(Error::Configuration(format!(
            "Missing token binding header: {}",
            name
        ))),
        (Some(_), Some(_)) => Err(Error::Configuration(format!(
            "Only one value can be used as binding header, detected {}",
            headers.get_all(name).iter().count()
        ))),
    }
}
