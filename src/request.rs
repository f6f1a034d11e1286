//! Mutable view of an outbound request

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{Error, Result};

/// The parts of an outbound request the interceptor may read or change
///
/// The interceptor only adds or replaces headers and may replace `uri`.
/// `default_headers` are the client-wide headers sent with every request;
/// they are read for binding and substitution but never modified.
#[derive(Debug, Clone, Default)]
pub struct OutboundRequest {
    pub base_address: Option<Url>,
    /// Absolute URL, or a path relative to `base_address`
    pub uri: Option<String>,
    pub headers: HeaderMap,
    pub default_headers: HeaderMap,
}

impl OutboundRequest {
    /// Request for an absolute URL
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    pub fn with_base_address(mut self, base_address: Url) -> Self {
        self.base_address = Some(base_address);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_default_headers(mut self, default_headers: HeaderMap) -> Self {
        self.default_headers = default_headers;
        self
    }

    /// Resolve the absolute URL the request will be sent to
    pub fn resolve_url(&self) -> Result<Url> {
        match (&self.base_address, &self.uri) {
            (Some(base), Some(uri)) => Ok(base.join(uri)?),
            (Some(base), None) => Ok(base.clone()),
            (None, Some(uri)) => Url::parse(uri).map_err(|e| {
                Error::Configuration(format!(
                    "Request URI {:?} is not absolute and no base address is set: {}",
                    uri, e
                ))
            }),
            (None, None) => Err(Error::Configuration(
                "Must set a base address or a request URI".into(),
            )),
        }
    }

    /// Request headers followed by the default headers
    pub fn merged_headers(&self) -> HeaderMap {
        let mut merged = self.headers.clone();
        for (name, value) in &self.default_headers {
            merged.append(name.clone(), value.clone());
        }
        merged
    }

    /// Headers as they go on the wire: request headers replace default
    /// headers of the same name
    pub fn effective_headers(&self) -> HeaderMap {
        let mut headers = self.default_headers.clone();
        for name in self.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }
        headers
    }
}
