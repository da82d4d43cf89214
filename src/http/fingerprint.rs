use std::collections::BTreeMap;
use std::sync::Arc;
use anyhow::{Result, Context};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::debug;

use crate::config::{BrowserFingerprint, HttpSettings};
use crate::crawler::registry::Registry;

/// Name of the generator drawing a single `User-Agent` header
pub const RANDOM_USER_AGENT: &str = "random_user_agent";

/// Name of the generator drawing a full browser header set
pub const FINGERPRINT: &str = "fingerprint";

/// Desktop browser user agents for the `random_user_agent` generator
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

/// Pick one of the built-in user agents
pub fn random_user_agent() -> &'static str {
    USER_AGENTS.choose(&mut thread_rng()).copied().unwrap_or(USER_AGENTS[0])
}

/// Browser fingerprint picker turning configured fingerprints into request headers
#[derive(Debug, Clone)]
pub struct FingerprintManager {
    /// Available fingerprints to use
    fingerprints: Vec<BrowserFingerprint>,
}

impl FingerprintManager {
    /// Create a new fingerprint manager with the given fingerprints
    pub fn new(fingerprints: Vec<BrowserFingerprint>) -> Self {
        Self { fingerprints }
    }

    /// Select a random fingerprint
    pub fn random_fingerprint(&self) -> Result<&BrowserFingerprint> {
        self.fingerprints
            .choose(&mut thread_rng())
            .context("No fingerprints available")
    }

    /// Full header set a browser with this fingerprint would send
    pub fn headers_for(fingerprint: &BrowserFingerprint) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert("User-Agent".to_string(), fingerprint.user_agent.clone());
        headers.insert("Accept-Language".to_string(), fingerprint.accept_language.clone());

        // Add standard headers
        headers.insert("Accept".to_string(), "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string());
        headers.insert("Accept-Encoding".to_string(), "gzip, deflate, br".to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());

        // Configured extras override the defaults
        for (key, value) in &fingerprint.extra_headers {
            headers.insert(key.clone(), value.clone());
        }

        headers
    }

    /// Headers of a random fingerprint, or a lone random user agent when none are configured
    pub fn random_headers(&self) -> BTreeMap<String, String> {
        match self.random_fingerprint() {
            Ok(fingerprint) => {
                debug!("Using fingerprint: {}", fingerprint.name);
                Self::headers_for(fingerprint)
            }
            Err(_) => user_agent_headers(),
        }
    }
}

fn user_agent_headers() -> BTreeMap<String, String> {
    BTreeMap::from([("User-Agent".to_string(), random_user_agent().to_string())])
}

/// Register the built-in header generators
pub fn register_builtin(registry: &mut Registry, settings: &HttpSettings) {
    registry.register_header_generator(RANDOM_USER_AGENT, user_agent_headers);

    let manager = Arc::new(FingerprintManager::new(settings.fingerprints.clone()));
    registry.register_header_generator(FINGERPRINT, move || manager.random_headers());
}
