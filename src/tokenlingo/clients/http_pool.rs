//! HTTP Client Pool for maintaining persistent connections per base URL.
//!
//! Each vendor base URL gets its own `reqwest::Client` so connections, DNS lookups and TLS
//! sessions are reused across turns.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Global HTTP client pool, lazily initialized on first access.
static HTTP_CLIENT_POOL: Lazy<Mutex<HashMap<String, reqwest::Client>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Get or create a shared HTTP client for the given base URL.
///
/// Falls back to a default client if the pooled builder fails or the pool lock is poisoned.
pub fn get_http_client(base_url: &str) -> reqwest::Client {
    let mut pool = match HTTP_CLIENT_POOL.lock() {
        Ok(pool) => pool,
        Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(client) = pool.get(base_url) {
        return client.clone();
    }

    let client = reqwest::ClientBuilder::new()
        // Keep idle connections alive for 90 seconds
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .pool_max_idle_per_host(10)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|err| {
            log::warn!(
                "tokenlingo::clients::http_pool: falling back to default client for {}: {}",
                base_url,
                err
            );
            reqwest::Client::new()
        });

    pool.insert(base_url.to_string(), client.clone());
    client
}
