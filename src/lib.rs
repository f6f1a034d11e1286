//! # Approov Service for Rust
//!
//! Client-side request attestation with dynamic TLS public key pinning.
//!
//! ## Request Interception
//!
//! Every outbound request goes through [`ApproovService::intercept`]:
//! - Requests matching an exclusion pattern pass through untouched
//! - The optional binding header value is hashed into the next token
//! - A token is fetched for the request URL and written to the token header
//! - Header values and query parameters that name a secret are replaced with
//!   the secure string fetched for them
//!
//! How each fetch status is handled (continue, retry, reject, fail) is
//! decided by [`FetchStatus::policy_class`].
//!
//! ## TLS Public Key Pinning
//!
//! [`PinnedCertVerifier`] runs the normal web PKI checks and then requires
//! one certificate of the verified path, or its trust anchor, to match a pin
//! for the host:
//! - Pins are base64 SHA-256 digests of the certificate SubjectPublicKeyInfo
//! - The pin set is fetched from the attestation engine on every handshake
//! - Hosts without pins fall back to the `"*"` entry, and hosts with no pins
//!   at all are not pinned
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use approov_service::{ApproovService, AttestedClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = ApproovService::new(Arc::new(engine));
//!     service.initialize("<config>")?;
//!     service.add_substitution_header("Api-Key", None)?;
//!
//!     // Connections made by this client are pinned
//!     let client = AttestedClient::new(service)?
//!         .with_base_address("https://api.example.com/".parse()?);
//!     let response = client.get("shapes").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod client;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod request;
pub mod service;
pub mod tls;

pub use attestation::{AttestationClient, FetchResult, FetchStatus, PolicyClass};
pub use client::AttestedClient;
pub use config::{ServiceConfig, ServiceSettings};
pub use error::{BridgeError, Error, Result};
pub use interceptor::Interceptor;
pub use request::OutboundRequest;
pub use service::ApproovService;
pub use tls::{ChainBuilder, ChainElement, PinSet, PinValidator, PinnedCertVerifier, VerifiedChain};
