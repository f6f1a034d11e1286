//! Check that dynamic pinning accepts a matching pin and rejects a wrong one
//!
//! Usage: cargo run --example pinned_client -- [https://host/path]

use std::sync::Arc;

use approov_service::attestation::BridgeResult;
use approov_service::tls::public_key_pin;
use approov_service::{ApproovService, AttestationClient, AttestedClient, FetchResult, FetchStatus};
use parking_lot::RwLock;

/// Engine answering from a fixed pin set; every URL is unprotected
struct StaticEngine {
    pins: RwLock<String>,
}

impl AttestationClient for StaticEngine {
    fn initialize(&self, _config: &str) -> BridgeResult<()> {
        Ok(())
    }

    fn fetch_token(&self, _url: &str) -> BridgeResult<FetchResult> {
        Ok(FetchResult::with_status(FetchStatus::UnprotectedUrl))
    }

    fn fetch_secure_string(&self, _key: &str, _new_def: Option<&str>) -> BridgeResult<FetchResult> {
        Ok(FetchResult::with_status(FetchStatus::UnknownKey))
    }

    fn fetch_custom_jwt(&self, _payload: &str) -> BridgeResult<FetchResult> {
        Ok(FetchResult::with_status(FetchStatus::Disabled))
    }

    fn get_pins_json(&self, _pin_type: &str) -> BridgeResult<String> {
        Ok(self.pins.read().clone())
    }

    fn set_data_hash_in_token(&self, _data: &str) {}

    fn get_device_id(&self) -> Option<String> {
        None
    }

    fn get_message_signature(&self, _message: &str) -> Option<String> {
        None
    }

    fn set_dev_key(&self, _dev_key: &str) {}
}

/// Pin of the leaf certificate the server presents, fetched without pinning
async fn leaf_pin(host: &str) -> Result<String, Box<dyn std::error::Error>> {
    use rustls::pki_types::ServerName;
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let stream = TcpStream::connect((host, 443)).await?;
    let server_name = ServerName::try_from(host.to_string())?;
    let tls = TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await?;
    let (_, conn) = tls.get_ref();
    let leaf = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or("No peer certificates")?;
    Ok(public_key_pin(leaf.as_ref())?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "https://www.rust-lang.org/".to_string());
    let url = url::Url::parse(&target)?;
    let host = url.host_str().ok_or("URL has no host")?.to_string();

    println!("═══ Dynamic Pinning Test: {} ═══\n", host);

    let engine = Arc::new(StaticEngine {
        pins: RwLock::new("{}".to_string()),
    });
    let service = ApproovService::new(engine.clone());
    service.initialize("demo")?;
    let client = AttestedClient::new(service)?;

    // Test 1: a pin no certificate can match
    println!("Test 1: Request with WRONG pin");
    *engine.pins.write() = serde_json::json!({ &host: ["AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="] }).to_string();
    match client.get(url.as_str()).await {
        Ok(resp) => println!("   ❌ FAIL: Request succeeded ({}) with wrong pin\n", resp.status()),
        Err(e) => println!("   ✅ PASS: Request rejected: {}\n", e),
    }

    // Test 2: the pin of the presented leaf
    println!("Test 2: Request with CORRECT pin");
    let pin = leaf_pin(&host).await?;
    println!("   Leaf pin: {}", pin);
    *engine.pins.write() = serde_json::json!({ &host: [pin] }).to_string();
    match client.get(url.as_str()).await {
        Ok(resp) => println!("   ✅ PASS: Request succeeded ({})\n", resp.status()),
        Err(e) => println!("   ❌ FAIL: Request failed with correct pin: {:?}\n", e),
    }

    Ok(())
}
