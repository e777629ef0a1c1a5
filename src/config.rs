use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::Result;
use log::warn;

use crate::ip_addr::IpAddress;

// Default configuration constants
pub(crate) const DEFAULT_PORT: u16 = 9999;
pub(crate) const DEFAULT_HEARTBEAT_MILLIS: u32 = 500;
pub(crate) const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 100;
pub(crate) const MAX_RETRY_DELAY: u64 = 60; // in secs
pub(crate) const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Hard ceiling on a single datagram. Messages that would encode past this
/// are rejected rather than fragmented.
pub(crate) const MAX_DATAGRAM_BYTES: usize = 512;

/// Largest user broadcast payload accepted for queuing.
pub(crate) const MAX_BROADCAST_BYTES: usize = 200;

/// Upper bound on member records per datagram, marker included. Sized so a
/// full datagram (12-byte header, records at 11 bytes each, broadcast flag,
/// 12-byte broadcast header plus [`MAX_BROADCAST_BYTES`]) stays within
/// [`MAX_DATAGRAM_BYTES`].
pub(crate) const MAX_PIGGYBACK_MEMBERS: usize = 26;

// A scalar used to size both the piggyback fan-out and the emit counters.
pub(crate) const LAMBDA: f64 = 2.5;

// How many standard deviations beyond the mean PING/ACK response time we
// allow before timing out an ACK.
pub(crate) const TIMEOUT_TOLERANCE_SIGMAS: f64 = 3.0;

pub(crate) const TIMEOUT_SWEEP_MILLIS: u64 = 100;
pub(crate) const MAX_DEAD_NODE_RETRIES: u32 = 10;

pub(crate) const RTT_WINDOW_CAPACITY: usize = 150;
pub(crate) const RTT_SEED_MILLIS: u32 = 50;
pub(crate) const RTT_FLOOR_MILLIS: u32 = 10;

/// Once a queued broadcast's emit counter ages below this, it is dropped.
pub(crate) const BROADCAST_REMOVAL_FLOOR: i16 = -8;

/// Main configuration for a cluster endpoint.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// IPv4 address this endpoint binds and advertises.
    pub(crate) listen_ip: Ipv4Addr,

    /// UDP port to bind. Port 0 asks the kernel for a free port; the
    /// endpoint advertises whatever was actually bound.
    pub(crate) listen_port: u16,

    /// Inter-probe period in milliseconds.
    pub(crate) heartbeat_millis: u32,

    /// Peers to contact at startup, as `host[:port]` strings.
    pub(crate) initial_hosts: Vec<String>,

    /// Minimum severity the logging sink should emit.
    pub(crate) log_threshold: log::LevelFilter,
}

impl ClusterConfig {
    pub fn listen_ip(&self) -> Ipv4Addr {
        self.listen_ip
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn heartbeat_millis(&self) -> u32 {
        self.heartbeat_millis
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.heartbeat_millis))
    }

    pub fn initial_hosts(&self) -> &[String] {
        &self.initial_hosts
    }

    pub fn log_threshold(&self) -> log::LevelFilter {
        self.log_threshold
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfigBuilder {
    listen_ip: Option<Ipv4Addr>,
    listen_port: u16,
    heartbeat_millis: u32,
    initial_hosts: Vec<String>,
    log_threshold: log::LevelFilter,
}

impl Default for ClusterConfigBuilder {
    fn default() -> Self {
        Self {
            listen_ip: None,
            listen_port: DEFAULT_PORT,
            heartbeat_millis: DEFAULT_HEARTBEAT_MILLIS,
            initial_hosts: Vec::new(),
            log_threshold: log::LevelFilter::Info,
        }
    }
}

impl ClusterConfigBuilder {
    /// Creates a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bind address explicitly. When unset, the first non-loopback
    /// non-docker IPv4 interface is used, falling back to 127.0.0.1.
    pub fn addr(mut self, addr: impl Into<IpAddress>) -> Self {
        self.listen_ip = Some(addr.into().0);
        self
    }

    /// Sets the UDP bind port.
    pub fn port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    /// Sets the inter-probe period in milliseconds.
    pub fn heartbeat_millis(mut self, millis: u32) -> Self {
        self.heartbeat_millis = millis;
        self
    }

    /// Adds a peer to contact at startup, as `host[:port]`.
    pub fn initial_host(mut self, host: impl Into<String>) -> Self {
        self.initial_hosts.push(host.into());
        self
    }

    pub fn log_threshold(mut self, threshold: log::LevelFilter) -> Self {
        self.log_threshold = threshold;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.heartbeat_millis == 0 {
            anyhow::bail!("heartbeat period is not set");
        }
        Ok(())
    }

    /// Validates the configuration and produces a [`ClusterConfig`].
    pub fn build(mut self) -> Result<ClusterConfig> {
        self.fill();
        self.validate()?;

        Ok(ClusterConfig {
            listen_ip: self.listen_ip.unwrap(),
            listen_port: self.listen_port,
            heartbeat_millis: self.heartbeat_millis,
            initial_hosts: self.initial_hosts,
            log_threshold: self.log_threshold,
        })
    }

    fn fill(&mut self) {
        if self.listen_ip.is_none() {
            let ip = match IpAddress::find_system_ip() {
                Ok(ip) => ip,
                Err(_) => {
                    warn!("Could not resolve host IP. Using 127.0.0.1");
                    Ipv4Addr::LOCALHOST
                }
            };
            self.listen_ip = Some(ip);
        }
    }
}
