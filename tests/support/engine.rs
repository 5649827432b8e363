//! Engine fixtures: a temp-dir cache, a switchable link probe, and a
//! channel sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{
    CacheLayer, ConnectivityProbe, Delivery, EngineConfig, RequestEngine, TransportClient,
};
use tempfile::TempDir;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Link-state probe the test can flip.
#[derive(Debug)]
pub struct SwitchProbe {
    link_up: AtomicBool,
    pings: AtomicUsize,
}

impl SwitchProbe {
    pub fn new(link_up: bool) -> Self {
        Self {
            link_up: AtomicBool::new(link_up),
            pings: AtomicUsize::new(0),
        }
    }

    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for SwitchProbe {
    fn link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> bool {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.link_up()
    }
}

/// Engine plus the temp directory its cache lives in.
pub struct TestEngine {
    pub engine: RequestEngine,
    pub probe: Arc<SwitchProbe>,
    pub dir: TempDir,
}

/// Config with short timeouts, suited to mock servers.
pub fn test_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        cache_dir: dir.path().to_path_buf(),
        read_timeout_ms: 2_000,
        connect_timeout_ms: 2_000,
        retry_count: 0,
        retry_interval_ms: 10,
        ..EngineConfig::default()
    }
}

/// Builds an engine over a persistent cache in a fresh temp dir.
pub async fn test_engine() -> TestEngine {
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(&dir);
    test_engine_with(dir, config).await
}

pub async fn test_engine_with(dir: TempDir, config: EngineConfig) -> TestEngine {
    let cache = CacheLayer::open(dir.path(), config.memory_cache_capacity)
        .await
        .expect("open cache");
    let transport =
        TransportClient::with_max_redirects(config.connect_timeout(), config.max_redirects)
            .expect("client");
    let probe = Arc::new(SwitchProbe::new(true));
    let engine = RequestEngine::new(config, Arc::new(cache), transport, probe.clone())
        .expect("engine");
    TestEngine { engine, probe, dir }
}

pub fn channel_sink() -> (Arc<UnboundedSender<Delivery>>, UnboundedReceiver<Delivery>) {
    let (tx, rx) = unbounded_channel();
    (Arc::new(tx), rx)
}

/// Waits for the next delivery, failing the test after five seconds.
pub async fn next_delivery(rx: &mut UnboundedReceiver<Delivery>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("sink closed")
}
