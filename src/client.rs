//! HTTP client with request attestation and TLS public key pinning
//!
//! Every request passes through the service interceptor before it is sent,
//! and every connection is checked against the dynamic pin set during the
//! handshake.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::request::OutboundRequest;
use crate::service::ApproovService;
use crate::tls;

/// Pinned HTTP client that attaches attestation tokens to its requests
///
/// Relative request URIs are resolved against the base address, and the
/// default headers go out with every request unless the request sets a
/// header of the same name.
#[derive(Debug, Clone)]
pub struct AttestedClient {
    service: ApproovService,
    base_address: Option<Url>,
    default_headers: HeaderMap,
    http: reqwest::Client,
}

impl AttestedClient {
    /// Create a client trusting the bundled web PKI roots
    pub fn new(service: ApproovService) -> Result<Self> {
        let http = tls::create_pinned_client(service.pin_validator())?;
        Ok(Self::with_http_client(service, http))
    }

    /// Use a caller-built client
    ///
    /// Pinning only applies if `http` was built with a
    /// [`PinnedCertVerifier`](crate::tls::PinnedCertVerifier).
    pub fn with_http_client(service: ApproovService, http: reqwest::Client) -> Self {
        Self {
            service,
            base_address: None,
            default_headers: HeaderMap::new(),
            http,
        }
    }

    pub fn with_base_address(mut self, base_address: Url) -> Self {
        self.base_address = Some(base_address);
        self
    }

    /// Add a header sent with every request
    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.append(name, value);
        self
    }

    pub fn base_address(&self) -> Option<&Url> {
        self.base_address.as_ref()
    }

    pub fn default_headers(&self) -> &HeaderMap {
        &self.default_headers
    }

    pub fn service(&self) -> &ApproovService {
        &self.service
    }

    /// Build the request view the interceptor sees
    fn outbound(&self, uri: &str, headers: HeaderMap) -> OutboundRequest {
        OutboundRequest {
            base_address: self.base_address.clone(),
            uri: Some(uri.to_string()),
            headers,
            default_headers: self.default_headers.clone(),
        }
    }

    /// Annotate and send a request
    ///
    /// Non-success HTTP statuses are returned as responses; only
    /// interception, transport and pinning failures are errors.
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        headers: HeaderMap,
        body: Option<Vec<u8>>,
    ) -> Result<Response> {
        let request = self
            .service
            .intercept_async(self.outbound(uri, headers))
            .await?;
        let url = request.resolve_url()?;
        debug!(%method, %url, "Sending request");

        let mut builder = self
            .http
            .request(method, url)
            .headers(request.effective_headers());
        if let Some(body) = body {
            builder = builder.body(body);
        }
        Ok(builder.send().await?)
    }

    pub async fn get(&self, uri: &str) -> Result<Response> {
        self.send(Method::GET, uri, HeaderMap::new(), None).await
    }

    /// GET and decode a JSON body, failing on non-success statuses
    pub async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> Result<T> {
        let response = self.get(uri).await?;
        read_json(response).await
    }

    /// POST a JSON body and decode the JSON reply
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(&self, uri: &str, body: &B) -> Result<T> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::to_vec(body)?;
        let response = self.send(Method::POST, uri, headers, Some(body)).await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Api { status, message: body });
    }
    Ok(response.json().await?)
}
