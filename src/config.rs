//! Shared configuration store
//!
//! Every rule category sits behind its own lock, so updating one category
//! never blocks readers of another. Locks are only held while a rule set is
//! read or copied; callers iterate the returned snapshots without holding
//! any lock, and never across a blocking attestation call.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use regex::Regex;
use reqwest::header::HeaderName;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Header carrying the attestation token unless configured otherwise
pub const DEFAULT_TOKEN_HEADER: &str = "Approov-Token";

/// Serializable description of the full rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSettings {
    pub token_header: String,
    pub token_prefix: String,
    pub binding_header: Option<String>,
    pub proceed_on_network_fail: bool,
    pub exclusion_url_regexes: Vec<String>,
    /// Header name to required value prefix (may be empty)
    pub substitution_headers: BTreeMap<String, String>,
    pub substitution_query_params: Vec<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            token_header: DEFAULT_TOKEN_HEADER.to_string(),
            token_prefix: String::new(),
            binding_header: None,
            proceed_on_network_fail: false,
            exclusion_url_regexes: Vec::new(),
            substitution_headers: BTreeMap::new(),
            substitution_query_params: Vec::new(),
        }
    }
}

impl ServiceSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Name and value prefix of the token header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    pub name: HeaderName,
    pub prefix: String,
}

impl Default for TokenHeader {
    fn default() -> Self {
        Self {
            name: HeaderName::from_static("approov-token"),
            prefix: String::new(),
        }
    }
}

/// Process-wide rules consulted by the interceptor
#[derive(Debug, Default)]
pub struct ServiceConfig {
    token_header: RwLock<TokenHeader>,
    binding_header: RwLock<Option<HeaderName>>,
    proceed_on_network_fail: AtomicBool,
    exclusions: RwLock<BTreeMap<String, Regex>>,
    substitution_headers: RwLock<HashMap<HeaderName, String>>,
    substitution_query_params: RwLock<BTreeMap<String, Regex>>,
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| Error::Configuration(format!("Invalid header name {:?}: {}", name, e)))
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::Configuration(format!("Invalid regex {:?}: {}", pattern, e)))
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from settings, validating every rule
    pub fn from_settings(settings: &ServiceSettings) -> Result<Self> {
        let config = Self::new();
        config.apply(settings)?;
        Ok(config)
    }

    /// Replace the live rule set. Nothing is changed if any rule is invalid.
    pub fn apply(&self, settings: &ServiceSettings) -> Result<()> {
        let token_header = TokenHeader {
            name: header_name(&settings.token_header)?,
            prefix: settings.token_prefix.clone(),
        };
        let binding_header = settings
            .binding_header
            .as_deref()
            .map(header_name)
            .transpose()?;
        let exclusions = settings
            .exclusion_url_regexes
            .iter()
            .map(|p| compile(p).map(|regex| (p.clone(), regex)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let headers = settings
            .substitution_headers
            .iter()
            .map(|(name, prefix)| header_name(name).map(|name| (name, prefix.clone())))
            .collect::<Result<HashMap<_, _>>>()?;
        let query_params = settings
            .substitution_query_params
            .iter()
            .map(|p| compile(p).map(|regex| (p.clone(), regex)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        *self.token_header.write() = token_header;
        *self.binding_header.write() = binding_header;
        self.set_proceed_on_network_fail(settings.proceed_on_network_fail);
        *self.exclusions.write() = exclusions;
        *self.substitution_headers.write() = headers;
        *self.substitution_query_params.write() = query_params;
        Ok(())
    }

    /// Export the live rule set
    pub fn snapshot(&self) -> ServiceSettings {
        let token_header = self.token_header();
        ServiceSettings {
            token_header: token_header.name.as_str().to_string(),
            token_prefix: token_header.prefix,
            binding_header: self.binding_header().map(|h| h.as_str().to_string()),
            proceed_on_network_fail: self.proceed_on_network_fail(),
            exclusion_url_regexes: self.exclusions.read().keys().cloned().collect(),
            substitution_headers: self
                .substitution_headers
                .read()
                .iter()
                .map(|(name, prefix)| (name.as_str().to_string(), prefix.clone()))
                .collect(),
            substitution_query_params: self
                .substitution_query_params
                .read()
                .keys()
                .cloned()
                .collect(),
        }
    }

    pub fn token_header(&self) -> TokenHeader {
        self.token_header.read().clone()
    }

    /// Set the header the token is written to and the prefix put before it
    pub fn set_token_header(&self, name: &str, prefix: &str) -> Result<()> {
        let name = header_name(name)?;
        *self.token_header.write() = TokenHeader {
            name,
            prefix: prefix.to_string(),
        };
        Ok(())
    }

    pub fn binding_header(&self) -> Option<HeaderName> {
        self.binding_header.read().clone()
    }

    /// Set (or clear with `None`) the header whose value is bound into tokens
    pub fn set_binding_header(&self, name: Option<&str>) -> Result<()> {
        let name = name.map(header_name).transpose()?;
        *self.binding_header.write() = name;
        Ok(())
    }

    pub fn proceed_on_network_fail(&self) -> bool {
        self.proceed_on_network_fail.load(Ordering::SeqCst)
    }

    /// Let requests continue without a token (or substitution) when the
    /// attestation engine reports a network problem
    pub fn set_proceed_on_network_fail(&self, proceed: bool) {
        self.proceed_on_network_fail.store(proceed, Ordering::SeqCst);
    }

    pub fn add_exclusion_url_regex(&self, pattern: &str) -> Result<()> {
        let regex = compile(pattern)?;
        self.exclusions.write().insert(pattern.to_string(), regex);
        Ok(())
    }

    pub fn remove_exclusion_url_regex(&self, pattern: &str) {
        self.exclusions.write().remove(pattern);
    }

    /// Whether any exclusion pattern matches the full URL
    pub fn is_url_excluded(&self, url: &str) -> bool {
        self.exclusions.read().values().any(|regex| regex.is_match(url))
    }

    /// Substitute the value of `header` when it starts with `prefix`.
    /// `None` means an empty prefix.
    pub fn add_substitution_header(&self, header: &str, prefix: Option<&str>) -> Result<()> {
        let name = header_name(header)?;
        self.substitution_headers
            .write()
            .insert(name, prefix.unwrap_or_default().to_string());
        Ok(())
    }

    pub fn remove_substitution_header(&self, header: &str) {
        if let Ok(name) = header_name(header) {
            self.substitution_headers.write().remove(&name);
        }
    }

    /// Copy of the header substitution rules
    pub fn substitution_headers(&self) -> Vec<(HeaderName, String)> {
        self.substitution_headers
            .read()
            .iter()
            .map(|(name, prefix)| (name.clone(), prefix.clone()))
            .collect()
    }

    /// Add a regex whose single capture group marks a substitutable value
    /// in the URL
    pub fn add_substitution_query_param(&self, pattern: &str) -> Result<()> {
        let regex = compile(pattern)?;
        self.substitution_query_params
            .write()
            .insert(pattern.to_string(), regex);
        Ok(())
    }

    pub fn remove_substitution_query_param(&self, pattern: &str) {
        self.substitution_query_params.write().remove(pattern);
    }

    /// Copy of the query parameter substitution patterns
    pub fn substitution_query_params(&self) -> Vec<Regex> {
        self.substitution_query_params.read().values().cloned().collect()
    }
}
