//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use userdir::clock::ManualClock;
use userdir::config::ServiceConfig;
use userdir::directory::MemoryDirectory;
use userdir::http::{AppState, HttpServer};
use userdir::kv::{KvClient, MemoryBackend};
use userdir::lifecycle::startup::{build_state, KV_BREAKER};
use userdir::lifecycle::Shutdown;
use userdir::resilience::{Breaker, BreakerConfig};

/// Start of a 60s window, so bucket boundaries are predictable.
pub const EPOCH: Duration = Duration::from_secs(1_700_000_040);

/// A running server over in-memory dependencies the test can poke.
pub struct TestApp {
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub clock: Arc<ManualClock>,
    pub kv: Arc<MemoryBackend>,
    pub directory: MemoryDirectory,
    pub state: AppState,
    pub shutdown: Shutdown,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("server unreachable")
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(|_| {}).await
}

/// Start the app with defaults adjusted by `tweak`.
pub async fn spawn_app_with(tweak: impl FnOnce(&mut ServiceConfig)) -> TestApp {
    let mut config = ServiceConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    tweak(&mut config);
    let config = Arc::new(config);

    let clock = Arc::new(ManualClock::new(EPOCH));
    let kv = Arc::new(MemoryBackend::new(clock.clone()));
    let kv_client = KvClient::new(
        kv.clone(),
        Arc::new(Breaker::new(KV_BREAKER, BreakerConfig::from(&config.breakers.kv))),
    );
    let directory = MemoryDirectory::seeded();

    let state = build_state(config, clock.clone(), kv_client, Arc::new(directory.clone()))
        .expect("valid test config");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let server = HttpServer::new(state.clone());
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap();

    TestApp {
        addr,
        client,
        clock,
        kv,
        directory,
        state,
        shutdown,
    }
}

/// Limiter tuned to the two-per-minute scenarios.
pub fn two_per_minute(config: &mut ServiceConfig) {
    config.limiter.limit_per_minute = 2;
    config.limiter.window_interval_secs = 60;
    config.limiter.bucket_interval_secs = 5;
    config.limiter.write_headers = true;
}

pub fn header(res: &reqwest::Response, name: &str) -> Option<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
