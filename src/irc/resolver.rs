//! Endpoint selection by active health probing.
//!
//! A candidate is drawn uniformly at random from the pool of its service
//! class, skipping anything already marked unavailable, and probed with a
//! raw TCP connect. A failed probe marks the candidate unavailable; the
//! first success clears the set. When every candidate has failed, the set is
//! cleared and probing resumes after a cooldown, unless a connection came
//! up in the meantime.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ClientError;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const UNAVAILABLE_COOLDOWN: Duration = Duration::from_secs(60);
pub const DEFAULT_PORT: u16 = 443;

const CHAT_HOSTS: &[&str] = &[
    "192.16.64.11",
    "192.16.64.144",
    "192.16.64.145",
    "192.16.64.146",
    "192.16.64.152",
    "192.16.64.155",
    "192.16.64.37",
    "192.16.64.45",
    "192.16.64.51",
    "192.16.71.237",
    "199.9.248.236",
    "199.9.251.168",
];

const EVENTS_HOSTS: &[&str] = &[
    "192.16.64.143",
    "192.16.64.150",
    "192.16.71.221",
    "192.16.71.236",
    "199.9.252.54",
];

const GROUPS_HOSTS: &[&str] = &[
    "199.9.248.232",
    "199.9.248.248",
    "199.9.253.119",
    "199.9.253.120",
];

/// Pool a server belongs to. Unknown names deserialize as `Chat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceClass {
    Events,
    Groups,
    #[default]
    #[serde(other)]
    Chat,
}

impl ServiceClass {
    /// Ports the class listens on.
    pub fn ports(self) -> &'static [u16] {
        match self {
            ServiceClass::Chat => &[80, 443, 6667],
            ServiceClass::Events | ServiceClass::Groups => &[80, 443],
        }
    }

    /// The requested port if the class serves it, otherwise 443.
    pub fn normalize_port(self, port: Option<u16>) -> u16 {
        match port {
            Some(port) if self.ports().contains(&port) => port,
            _ => DEFAULT_PORT,
        }
    }

    fn default_hosts(self) -> &'static [&'static str] {
        match self {
            ServiceClass::Chat => CHAT_HOSTS,
            ServiceClass::Events => EVENTS_HOSTS,
            ServiceClass::Groups => GROUPS_HOSTS,
        }
    }
}

/// A server address. Immutable once drawn from the pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub class: ServiceClass,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Outcome of probing one candidate.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub endpoint: Endpoint,
    pub latency: Result<Duration, ClientError>,
}

/// Measures reachability of an endpoint.
pub trait Prober: Send + Sync {
    fn probe(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> impl Future<Output = Result<Duration, ClientError>> + Send;
}

/// Probes by opening and immediately dropping a TCP connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

impl Prober for TcpProber {
    async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let addr = (endpoint.address.as_str(), endpoint.port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(started.elapsed()),
            Ok(Err(e)) => Err(ClientError::from_io(&e)),
            Err(_) => Err(ClientError::Transport("Request timeout.".into())),
        }
    }
}

pub struct EndpointResolver<P = TcpProber> {
    prober: P,
    pools: HashMap<ServiceClass, Vec<String>>,
    unavailable: HashSet<String>,
    probe_timeout: Duration,
    cooldown: Duration,
}

impl EndpointResolver<TcpProber> {
    pub fn new(probe_timeout: Duration) -> Self {
        Self::with_prober(TcpProber, probe_timeout)
    }
}

impl<P: Prober> EndpointResolver<P> {
    pub fn with_prober(prober: P, probe_timeout: Duration) -> Self {
        let pools = [ServiceClass::Chat, ServiceClass::Events, ServiceClass::Groups]
            .into_iter()
            .map(|class| {
                let hosts = class.default_hosts().iter().map(|h| h.to_string()).collect();
                (class, hosts)
            })
            .collect();
        Self {
            prober,
            pools,
            unavailable: HashSet::new(),
            probe_timeout,
            cooldown: UNAVAILABLE_COOLDOWN,
        }
    }

    /// Replace the candidate list of one class.
    pub fn set_pool(&mut self, class: ServiceClass, hosts: Vec<String>) {
        self.pools.insert(class, hosts);
    }

    pub fn set_cooldown(&mut self, cooldown: Duration) {
        self.cooldown = cooldown;
    }

    pub fn is_unavailable(&self, address: &str) -> bool {
        self.unavailable.contains(address)
    }

    /// Pick a usable endpoint for `class`.
    ///
    /// A preferred address is trusted and returned without probing. Returns
    /// `None` when the pool is empty, or when all candidates failed and the
    /// client became connected during the cooldown.
    pub async fn resolve(
        &mut self,
        class: ServiceClass,
        preferred_address: Option<&str>,
        preferred_port: Option<u16>,
        connected: &AtomicBool,
    ) -> Option<Endpoint> {
        if let Some(address) = preferred_address {
            return Some(Endpoint {
                address: address.to_string(),
                port: preferred_port.unwrap_or(DEFAULT_PORT),
                class,
            });
        }

        let port = class.normalize_port(preferred_port);
        let pool = self.pools.get(&class).cloned().unwrap_or_default();
        if pool.is_empty() {
            error!(?class, "No candidate servers configured");
            return None;
        }

        info!(?class, port, "Searching for a server..");
        loop {
            let candidates: Vec<&String> =
                pool.iter().filter(|h| !self.unavailable.contains(*h)).collect();

            if candidates.is_empty() {
                self.unavailable.clear();
                error!(
                    "No servers available at this time, retrying in {} seconds..",
                    self.cooldown.as_secs()
                );
                tokio::time::sleep(self.cooldown).await;
                if connected.load(Ordering::SeqCst) {
                    debug!("Connected during cooldown, abandoning probe round");
                    return None;
                }
                continue;
            }

            let index = rand::rng().random_range(0..candidates.len());
            let endpoint = Endpoint {
                address: candidates[index].clone(),
                port,
                class,
            };

            let result = ProbeResult {
                latency: self.prober.probe(&endpoint, self.probe_timeout).await,
                endpoint,
            };
            match result.latency {
                Ok(rtt) => {
                    debug!(endpoint = %result.endpoint, ?rtt, "Probe succeeded");
                    self.unavailable.clear();
                    return Some(result.endpoint);
                }
                Err(e) => {
                    warn!(endpoint = %result.endpoint, error = %e, "Probe failed");
                    self.unavailable.insert(result.endpoint.address);
                }
            }
        }
    }
}
