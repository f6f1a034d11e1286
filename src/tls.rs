//! TLS public key pinning
//!
//! Pins are base64-encoded SHA-256 hashes of a certificate's full SPKI
//! (SubjectPublicKeyInfo) DER encoding. The pin set is fetched from the
//! attestation engine on every handshake so that pin updates take effect
//! on the next connection.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use der::{Decode, Encode};
use rustls::pki_types::{CertificateDer, ServerName, SignatureVerificationAlgorithm, TrustAnchor, UnixTime};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};
use x509_cert::der::oid::db::{rfc5912, rfc8410};
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::Certificate;

use crate::attestation::{AttestationClient, DEFAULT_PIN_TYPE};
use crate::error::{Error, Result};

/// Host entry whose pins apply to hosts with no pins of their own
pub const WILDCARD_HOST: &str = "*";

fn base64_sha256(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(data))
}

/// DER encoding of `spki` if its key algorithm is one we pin (RSA, EC,
/// Ed25519, Ed448)
fn supported_key_info(spki: &SubjectPublicKeyInfoOwned) -> Result<Vec<u8>> {
    let algorithm = spki.algorithm.oid;
    let supported = [
        rfc5912::RSA_ENCRYPTION,
        rfc5912::ID_EC_PUBLIC_KEY,
        rfc8410::ID_ED_25519,
        rfc8410::ID_ED_448,
    ];
    if !supported.contains(&algorithm) {
        return Err(Error::Tls(format!(
            "Unsupported public key algorithm: {}",
            algorithm
        )));
    }

    spki.to_der()
        .map_err(|e| Error::Tls(format!("Failed to encode SPKI: {}", e)))
}

/// Extract the DER-encoded SPKI of a certificate
///
/// Fails when the certificate cannot be parsed or its key algorithm is not
/// one we pin.
pub fn public_key_info(cert_der: &[u8]) -> Result<Vec<u8>> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| Error::Tls(format!("Failed to parse certificate: {}", e)))?;
    supported_key_info(&cert.tbs_certificate.subject_public_key_info)
}

/// Compute the pin of a certificate's public key
pub fn public_key_pin(cert_der: &[u8]) -> Result<String> {
    public_key_info(cert_der).map(|spki| base64_sha256(&spki))
}

/// Allowed public key pins per host, as published by the attestation engine
///
/// Entries that are not arrays count as absent, and non-string array
/// members are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "HashMap<String, serde_json::Value>")]
pub struct PinSet {
    hosts: HashMap<String, Vec<String>>,
}

impl From<HashMap<String, serde_json::Value>> for PinSet {
    fn from(entries: HashMap<String, serde_json::Value>) -> Self {
        let hosts = entries
            .into_iter()
            .filter_map(|(host, value)| match value {
                serde_json::Value::Array(pins) => Some((
                    host,
                    pins.into_iter()
                        .filter_map(|pin| match pin {
                            serde_json::Value::String(pin) => Some(pin),
                            _ => None,
                        })
                        .collect(),
                )),
                _ => None,
            })
            .collect();
        Self { hosts }
    }
}

impl PinSet {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Pins for `host`, falling back to the wildcard entry when the host is
    /// absent or has an empty list. An empty result means the host is not
    /// pinned.
    pub fn pins_for_host(&self, host: &str) -> &[String] {
        match self.hosts.get(host) {
            Some(pins) if !pins.is_empty() => pins,
            _ => self
                .hosts
                .get(WILDCARD_HOST)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        }
    }
}

/// One link of the certificate path a pin check runs over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainElement {
    Certificate(CertificateDer<'static>),
    /// DER-encoded SPKI of the trust anchor ending the path
    TrustAnchor(Vec<u8>),
}

impl ChainElement {
    /// Trust anchors hold only the contents of their SPKI sequence
    pub fn trust_anchor(anchor: &TrustAnchor<'_>) -> Result<Self> {
        let spki = der::asn1::AnyRef::new(
            der::Tag::Sequence,
            anchor.subject_public_key_info.as_ref(),
        )
        .and_then(|any| any.to_der())
        .map_err(|e| Error::Tls(format!("Failed to encode trust anchor SPKI: {}", e)))?;
        Ok(ChainElement::TrustAnchor(spki))
    }

    /// DER-encoded SPKI of this element, if its key algorithm is pinnable
    pub fn public_key_info(&self) -> Result<Vec<u8>> {
        match self {
            ChainElement::Certificate(cert) => public_key_info(cert.as_ref()),
            ChainElement::TrustAnchor(spki) => {
                let spki = SubjectPublicKeyInfoOwned::from_der(spki)
                    .map_err(|e| Error::Tls(format!("Failed to parse trust anchor SPKI: {}", e)))?;
                supported_key_info(&spki)
            }
        }
    }

    /// Hash of the raw element, for logging
    fn fingerprint(&self) -> String {
        match self {
            ChainElement::Certificate(cert) => base64_sha256(cert.as_ref()),
            ChainElement::TrustAnchor(spki) => base64_sha256(spki),
        }
    }
}

/// Builds the certificate path a pin check runs over
pub trait ChainBuilder: Send + Sync {
    /// Return the path in leaf-to-root order. An error means no trusted path
    /// could be built, which is a validator malfunction once base validation
    /// has passed.
    fn build_chain(
        &self,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<Vec<ChainElement>>;
}

fn web_pki_roots() -> rustls::RootCertStore {
    rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

/// Builds the verified path from the leaf to a trusted root
///
/// Presented certificates that are not part of the path are dropped, and
/// the path always ends with its trust anchor, whether or not the server
/// sent the root.
#[derive(Clone)]
pub struct VerifiedChain {
    roots: Arc<rustls::RootCertStore>,
    algorithms: &'static [&'static dyn SignatureVerificationAlgorithm],
}

impl std::fmt::Debug for VerifiedChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifiedChain")
            .field("roots", &self.roots.len())
            .finish_non_exhaustive()
    }
}

impl VerifiedChain {
    pub fn new(roots: Arc<rustls::RootCertStore>) -> Self {
        Self {
            roots,
            algorithms: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .all,
        }
    }

    /// Paths ending at the bundled web PKI roots
    pub fn web_pki() -> Self {
        Self::new(Arc::new(web_pki_roots()))
    }
}

impl ChainBuilder for VerifiedChain {
    fn build_chain(
        &self,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<Vec<ChainElement>> {
        let end_entity = webpki::EndEntityCert::try_from(leaf)
            .map_err(|e| Error::Tls(format!("Failed to parse leaf certificate: {}", e)))?;
        let path = end_entity
            .verify_for_usage(
                self.algorithms,
                &self.roots.roots,
                intermediates,
                now,
                webpki::KeyUsage::server_auth(),
                None,
                None,
            )
            .map_err(|e| Error::Tls(format!("Failed to build certificate chain: {}", e)))?;

        let mut chain = vec![ChainElement::Certificate(leaf.clone().into_owned())];
        chain.extend(
            path.intermediate_certificates()
                .map(|cert| ChainElement::Certificate(cert.der().into_owned())),
        );
        chain.push(ChainElement::trust_anchor(path.anchor())?);
        Ok(chain)
    }
}

/// Decides whether a handshake may proceed based on the current pin set
#[derive(Clone)]
pub struct PinValidator {
    client: Arc<dyn AttestationClient>,
    chain_builder: Arc<dyn ChainBuilder>,
    pin_type: String,
}

impl std::fmt::Debug for PinValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinValidator")
            .field("pin_type", &self.pin_type)
            .finish_non_exhaustive()
    }
}

impl PinValidator {
    /// Validator building paths to the bundled web PKI roots
    pub fn new(client: Arc<dyn AttestationClient>) -> Self {
        Self::with_chain_builder(client, Arc::new(VerifiedChain::web_pki()))
    }

    pub fn with_chain_builder(
        client: Arc<dyn AttestationClient>,
        chain_builder: Arc<dyn ChainBuilder>,
    ) -> Self {
        Self {
            client,
            chain_builder,
            pin_type: DEFAULT_PIN_TYPE.to_string(),
        }
    }

    /// Fetch and parse the current pin set
    pub fn current_pins(&self) -> Result<PinSet> {
        let json = self.client.get_pins_json(&self.pin_type).map_err(|e| {
            Error::Permanent(format!("Unable to obtain pins from attestation engine: {}", e))
        })?;
        PinSet::from_json(&json)
            .map_err(|e| Error::Permanent(format!("Unable to parse pin set: {}", e)))
    }

    /// Validate a server certificate chain for `host`
    ///
    /// Returns `Ok(false)` to reject the handshake. Errors are reserved for
    /// validator malfunction: the chain could not be built or the pin set
    /// could not be obtained.
    pub fn validate(
        &self,
        host: &str,
        leaf: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
        tls_error: bool,
    ) -> Result<bool> {
        // 1. Pinning only ever tightens base certificate validation
        if tls_error {
            debug!(host, "Rejecting handshake with prior TLS validation error");
            return Ok(false);
        }

        // 2. Build the verified path
        let chain = self.chain_builder.build_chain(leaf, intermediates, now)?;
        if chain.is_empty() {
            warn!(host, "Empty certificate chain");
        }

        // 3. Fetch the current pins
        let pin_set = self.current_pins()?;

        // 4. Resolve pins for this host
        let pins = pin_set.pins_for_host(host);
        if pins.is_empty() {
            info!(host, "Host not pinned");
            return Ok(true);
        }

        // 5. Match any element of the path against the pins
        for element in &chain {
            let pin = match element.public_key_info() {
                Ok(spki) => base64_sha256(&spki),
                Err(e) => {
                    warn!(
                        host,
                        cert_hash = %element.fingerprint(),
                        error = %e,
                        "Failed to extract public key from certificate"
                    );
                    continue;
                }
            };

            if pins.iter().any(|candidate| *candidate == pin) {
                info!(host, pin = %pin, pins = pins.len(), "Matched public key pin");
                return Ok(true);
            }
        }

        warn!(host, pins = pins.len(), "No matching public key pins");
        Ok(false)
    }
}

/// Custom certificate verifier enforcing the dynamic pin set
///
/// This verifier:
/// 1. First validates the certificate chain normally (CA signatures, expiry, etc.)
/// 2. Then requires some certificate of the verified path, or its trust
///    anchor, to match a pin for the host
///
/// The pin set is fetched from the attestation engine during the handshake.
/// On a multi-threaded tokio runtime that call runs under `block_in_place`;
/// on a current-thread runtime it blocks the runtime thread, so engines used
/// there must answer `get_pins_json` without waiting on the network.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    validator: PinValidator,
    /// Standard certificate verifier for chain validation
    inner: Arc<rustls::client::WebPkiServerVerifier>,
}

fn ensure_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Run a blocking engine call without stalling other tasks on this worker
fn off_runtime<T>(call: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(call)
        }
        _ => call(),
    }
}

impl PinnedCertVerifier {
    /// Create a verifier trusting the bundled web PKI roots
    pub fn new(validator: PinValidator) -> Result<Self> {
        Self::with_roots(web_pki_roots(), validator)
    }

    /// Create a verifier trusting the given roots
    ///
    /// The validator's paths are built over the same roots, replacing any
    /// chain builder it was created with.
    pub fn with_roots(root_store: rustls::RootCertStore, validator: PinValidator) -> Result<Self> {
        ensure_crypto_provider();

        let roots = Arc::new(root_store);
        let inner = rustls::client::WebPkiServerVerifier::builder(Arc::clone(&roots))
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build verifier: {}", e)))?;
        let validator = PinValidator {
            chain_builder: Arc::new(VerifiedChain::new(roots)),
            ..validator
        };

        Ok(Self { validator, inner })
    }
}

fn host_of(server_name: &ServerName<'_>) -> std::result::Result<String, rustls::Error> {
    match server_name {
        ServerName::DnsName(name) => Ok(name.as_ref().to_ascii_lowercase()),
        ServerName::IpAddress(ip) => Ok(std::net::IpAddr::from(*ip).to_string()),
        _ => Err(rustls::Error::General("Unsupported server name".into())),
    }
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let host = host_of(server_name)?;

        // Standard certificate chain validation first
        let base = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let accepted = off_runtime(|| {
            self.validator
                .validate(&host, end_entity, intermediates, now, base.is_err())
        })
        .map_err(|e| rustls::Error::General(format!("Pin validation failed: {}", e)))?;

        let verified = base?;
        if !accepted {
            return Err(rustls::Error::General(
                Error::PinValidation { host }.to_string(),
            ));
        }

        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Create a reqwest client whose handshakes are checked against the pin set
pub fn create_pinned_client(validator: PinValidator) -> Result<reqwest::Client> {
    let verifier = PinnedCertVerifier::new(validator)?;
    pinned_client_builder(verifier)
        .build()
        .map_err(|e| Error::Tls(format!("Failed to build HTTP client: {}", e)))
}

fn pinned_client_builder(verifier: PinnedCertVerifier) -> reqwest::ClientBuilder {
    ensure_crypto_provider();

    // Build rustls config with our custom verifier
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    reqwest::Client::builder().use_preconfigured_tls(config)
}
