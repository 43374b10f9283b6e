//! Common test utilities for HTTP-level tests against a mocked batch service

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use batch_transfer::config::RetryConfig;
use batch_transfer::{Config, HttpTransport, StaticTokenSupplier};
use wiremock::{MockServer, Request};

/// Bearer token handed out by the test token supplier
pub const TOKEN: &str = "test-token";

/// Deterministic, non-repeating-per-block test content
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Config pointing at the mock server: 1 KiB blocks, two uploads in flight, no retries
pub fn config(server: &MockServer) -> Config {
    let mut config = Config::for_service(server.uri());
    config.service.auth_resource = "batch-files".into();
    config.upload.block_size_kib = Some(1);
    config.upload.max_parallel_blocks = 2;
    config.retry.max_attempts = 0;
    config
}

/// Fast retries without jitter
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: std::time::Duration::from_millis(10),
        max_delay: std::time::Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Plain HTTP transport authenticated with [`TOKEN`]
pub fn transport(server: &MockServer) -> Arc<HttpTransport> {
    Arc::new(
        HttpTransport::new(&config(server).service, Arc::new(StaticTokenSupplier::new(TOKEN)))
            .expect("transport should build"),
    )
}

/// Value of a header on a received request
pub fn header<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}

/// Requests the server received for a path
pub async fn requests_to(server: &MockServer, path: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == path)
        .collect()
}
