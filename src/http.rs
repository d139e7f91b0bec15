//! Shared HTTP client construction.

use std::time::Duration;

/// Build the process-wide HTTP client.
///
/// One pool shared by every component: 5 idle connections per host, 15 s
/// connect / 60 s read timeouts, identity encoding, redirects followed.
/// `reqwest::Client` is an `Arc` internally, so cloning it hands out the
/// same pool.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(5)
        .connect_timeout(Duration::from_secs(15))
        .read_timeout(Duration::from_secs(60))
        .build()
        .expect("Failed to create HTTP client")
}
