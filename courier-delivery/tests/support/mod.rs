//! Shared fixtures for the delivery integration suites.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::{HashSet, VecDeque},
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_delivery::{
    DeliveryConfig, DeliveryManager, DnsError, Expiry, MailResolver, MailServer, Pipeline,
    RetryPolicy, StaticResolver, Transcript, Transport, TransportError,
};
use courier_spool::{MailId, MemoryMessageStore, MemoryQueueStore, MessageStore, QueueStore};
use parking_lot::Mutex;

pub const DOMAIN: &str = "example.com";

pub fn server(host: &str, priority: u16) -> MailServer {
    MailServer::new(host.to_string(), priority, 25)
}

/// Routes [`DOMAIN`] to one server, or to the given servers.
pub fn resolver(servers: Vec<MailServer>) -> Arc<StaticResolver> {
    Arc::new(StaticResolver::new().route(DOMAIN, servers))
}

/// Small timeouts, no default expiry, retries immediately eligible.
pub fn config() -> DeliveryConfig {
    DeliveryConfig {
        max_workers: 4,
        borrow_timeout_ms: 50,
        idle_wait_secs: 1,
        worker_idle_wait_secs: 1,
        sweep_interval_secs: 3600,
        shutdown_grace_secs: 1,
        default_expiry_secs: None,
        retry: RetryPolicy {
            max_attempts: 5,
            base_retry_delay_secs: 0,
            max_retry_delay_secs: 0,
            retry_jitter_factor: 0.0,
        },
        ..DeliveryConfig::default()
    }
}

/// As [`config`], but a requeued entry waits an hour.
pub fn slow_retry_config() -> DeliveryConfig {
    let mut config = config();
    config.retry.base_retry_delay_secs = 3600;
    config.retry.max_retry_delay_secs = 3600;
    config
}

pub fn recipients(addresses: &[&str]) -> Vec<String> {
    addresses.iter().map(ToString::to_string).collect()
}

/// A transport answering from a script, then accepting everything.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Transcript, TransportError>>>,
    calls: Mutex<Vec<(String, String)>>,
    delay: Option<Duration>,
    in_flight: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes at least `delay`.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn then(self, response: Result<Transcript, TransportError>) -> Self {
        self.script.lock().push_back(response);
        self
    }

    /// `(host, recipient)` per call, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    /// Times a recipient was being sent to by two callers at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

pub fn connection_refused() -> Result<Transcript, TransportError> {
    Err(TransportError::Connection("connection refused".to_string()))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        target: &MailServer,
        recipient: &str,
        _body: &[u8],
    ) -> Result<Transcript, TransportError> {
        self.calls
            .lock()
            .push((target.host.clone(), recipient.to_string()));

        if !self.in_flight.lock().insert(recipient.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.lock().remove(recipient);

        self.script.lock().pop_front().unwrap_or_else(|| {
            Ok(Transcript::new(
                "250 2.0.0 Ok: queued",
                format!("RCPT TO:<{recipient}>\n250 2.0.0 Ok: queued"),
            ))
        })
    }
}

/// Answers with no servers for the first `failures` lookups.
#[derive(Debug)]
pub struct FlakyResolver {
    failures: AtomicUsize,
    servers: Arc<Vec<MailServer>>,
    lookups: AtomicUsize,
}

impl FlakyResolver {
    pub fn new(failures: usize, servers: Vec<MailServer>) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            servers: Arc::new(servers),
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailResolver for FlakyResolver {
    async fn resolve(&self, _domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();

        if failing {
            Ok(Arc::new(Vec::new()))
        } else {
            Ok(Arc::clone(&self.servers))
        }
    }
}

/// A manager over fresh in-memory stores, with handles on both stores.
pub struct Harness {
    pub manager: DeliveryManager,
    pub queue: Arc<MemoryQueueStore>,
    pub messages: Arc<MemoryMessageStore>,
}

impl Harness {
    pub fn new(
        config: DeliveryConfig,
        resolver: Arc<dyn MailResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_messages(config, resolver, transport, MemoryMessageStore::new())
    }

    pub fn with_messages(
        config: DeliveryConfig,
        resolver: Arc<dyn MailResolver>,
        transport: Arc<dyn Transport>,
        messages: MemoryMessageStore,
    ) -> Self {
        let queue = Arc::new(MemoryQueueStore::new());
        let messages = Arc::new(messages);

        let manager = DeliveryManager::new(
            config,
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&messages) as Arc<dyn MessageStore>,
            Pipeline::standard(resolver, transport),
        );

        Self {
            manager,
            queue,
            messages,
        }
    }

    pub fn with_pipeline(config: DeliveryConfig, pipeline: Pipeline) -> Self {
        let queue = Arc::new(MemoryQueueStore::new());
        let messages = Arc::new(MemoryMessageStore::new());

        let manager = DeliveryManager::new(
            config,
            Arc::clone(&queue) as Arc<dyn QueueStore>,
            Arc::clone(&messages) as Arc<dyn MessageStore>,
            pipeline,
        );

        Self {
            manager,
            queue,
            messages,
        }
    }

    pub async fn submit(&self, addresses: &[&str]) -> MailId {
        self.manager
            .submit(
                b"Subject: test\r\n\r\nHello".as_slice(),
                &recipients(addresses),
                Expiry::Never,
            )
            .await
            .unwrap()
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
