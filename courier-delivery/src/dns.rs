//! Mail exchanger resolution.
//!
//! [`DnsResolver`] looks up MX records and falls back to A/AAAA records when a
//! domain publishes none (RFC 5321 section 5.1). Answers are cached in a
//! `DashMap` for the record TTL, clamped to the configured bounds.
//!
//! [`StaticResolver`] serves fixed routes, optionally falling through to
//! another resolver for domains it does not know.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use courier_common::internal;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DnsError {
    /// Neither MX nor A/AAAA records exist for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides the record TTL for every cached answer when set
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Lower bound on the cache TTL (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Upper bound on the cache TTL (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,

    /// Port the resolved exchangers are contacted on (default: 25)
    #[serde(default = "default_port")]
    pub port: u16,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

const fn default_port() -> u16 {
    25
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
            port: default_port(),
        }
    }
}

/// A delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX preference, lower is tried first. 0 for A/AAAA fallback.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub const fn new(host: String, priority: u16, port: u16) -> Self {
        Self {
            host,
            priority,
            port,
        }
    }

    /// `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resolves a recipient domain to its mail exchangers, most preferred first.
#[async_trait]
pub trait MailResolver: Send + Sync + Debug {
    /// # Errors
    /// [`DnsError::NoMailServers`] when the domain has no usable targets, or
    /// the lookup failure.
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// Caching resolver backed by hickory.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Resolver using the system configuration.
    ///
    /// # Errors
    /// If the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    /// Resolver using explicit name servers.
    #[must_use]
    pub fn with_resolver_config(resolver_config: ResolverConfig, config: DnsConfig) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            resolver,
            cache: DashMap::new(),
            config,
        }
    }

    /// Number of cached domains, including expired ones not yet replaced.
    #[must_use]
    pub fn cached_domains(&self) -> usize {
        self.cache.len()
    }

    fn cache_ttl(&self, record_ttl: u32) -> u64 {
        self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(record_ttl).clamp(
                self.config.min_cache_ttl_secs,
                self.config.max_cache_ttl_secs,
            )
        })
    }

    async fn lookup(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let min_ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let mut servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        MailServer::new(
                            mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                            mx.preference(),
                            self.config.port,
                        )
                    })
                    .collect();

                if servers.is_empty() {
                    return self.fallback_to_a_aaaa(domain).await;
                }

                servers.sort_by_key(|server| server.priority);
                Ok((servers, min_ttl))
            }
            Err(err) if err.is_no_records_found() => {
                debug!(%domain, "No MX records, falling back to A/AAAA");
                self.fallback_to_a_aaaa(domain).await
            }
            Err(err) => {
                warn!(%domain, error = %err, "MX lookup failed");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    async fn fallback_to_a_aaaa(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(ip_lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let min_ttl = ip_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(|record| record.ttl())
                    .min()
                    .unwrap_or(300);

                let servers: Vec<MailServer> = ip_lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, self.config.port))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok((servers, min_ttl))
                }
            }
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!(%domain, error = %err, "A/AAAA lookup failed");
                Err(DnsError::LookupFailed(err))
            }
        }
    }
}

#[async_trait]
impl MailResolver for DnsResolver {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        let key = domain.to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&key)
            && cached.expires_at > Instant::now()
        {
            return Ok(Arc::clone(&cached.servers));
        }

        let (servers, record_ttl) = self.lookup(&key).await?;
        let servers = Arc::new(servers);
        let cache_ttl = self.cache_ttl(record_ttl);

        self.cache.insert(
            key,
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + Duration::from_secs(cache_ttl),
            },
        );

        internal!(
            level = DEBUG,
            "Resolved {} mail server(s) for {domain}, cached for {cache_ttl}s",
            servers.len()
        );
        Ok(servers)
    }
}

/// Fixed routes per domain, for smart hosts, MX overrides and tests.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    routes: HashMap<String, Arc<Vec<MailServer>>>,
    fallback: Option<Arc<dyn MailResolver>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `domain` to `servers`, sorted by priority.
    #[must_use]
    pub fn route(mut self, domain: &str, mut servers: Vec<MailServer>) -> Self {
        servers.sort_by_key(|server| server.priority);
        self.routes
            .insert(domain.to_ascii_lowercase(), Arc::new(servers));
        self
    }

    /// Resolver consulted for domains without a route.
    #[must_use]
    pub fn fallback(mut self, resolver: Arc<dyn MailResolver>) -> Self {
        self.fallback = Some(resolver);
        self
    }
}

#[async_trait]
impl MailResolver for StaticResolver {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        if let Some(servers) = self.routes.get(&domain.to_ascii_lowercase()) {
            if servers.is_empty() {
                return Err(DnsError::NoMailServers(domain.to_string()));
            }
            return Ok(Arc::clone(servers));
        }

        match &self.fallback {
            Some(resolver) => resolver.resolve(domain).await,
            None => Err(DnsError::NoMailServers(domain.to_string())),
        }
    }
}
