use anyhow::{bail, Context, Result};
use log::warn;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::{fs, path::Path};

use crate::wire::{KEY_MAX, MAX_PEER_AD};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub node: Node,
    #[serde(default)]
    pub timing: Timing,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Node {
    #[serde(default = "default_listen")]
    pub listen: SocketAddrV4,
    #[serde(default)]
    pub bootstrap: Option<SocketAddrV4>,
    #[serde(default)]
    pub search_key: Option<String>,
    #[serde(default)]
    pub kv_file: Option<PathBuf>,
    #[serde(default = "default_peer_ad")]
    pub max_peer_ad: usize,
    #[serde(default = "default_neighbor_target")]
    pub neighbor_target: usize,
    #[serde(default = "default_true")]
    pub auto_join: bool,
    /// Address written into outgoing headers when listening on 0.0.0.0.
    #[serde(default)]
    pub advertise_ip: Option<Ipv4Addr>,
}

/// All intervals in milliseconds.
#[derive(Debug, Deserialize, Clone)]
pub struct Timing {
    #[serde(default = "default_tick")]
    pub tick_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_probe")]
    pub probe_ms: u64,
    #[serde(default = "default_query")]
    pub query_ms: u64,
    #[serde(default = "default_zombie")]
    pub zombie_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retention")]
    pub retention_ms: u64,
}

fn default_listen() -> SocketAddrV4 { SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 10001) }
fn default_peer_ad() -> usize { MAX_PEER_AD }
fn default_neighbor_target() -> usize { 8 }
fn default_true() -> bool { true }
fn default_tick() -> u64 { 3_000 }
fn default_heartbeat() -> u64 { 5_000 }
fn default_probe() -> u64 { 8_000 }
fn default_query() -> u64 { 10_000 }
fn default_zombie() -> u64 { 30_000 }
fn default_connect_timeout() -> u64 { 2_000 }
fn default_retention() -> u64 { 10_000 }

impl Default for Node {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bootstrap: None,
            search_key: None,
            kv_file: None,
            max_peer_ad: default_peer_ad(),
            neighbor_target: default_neighbor_target(),
            auto_join: true,
            advertise_ip: None,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick_ms: default_tick(),
            heartbeat_ms: default_heartbeat(),
            probe_ms: default_probe(),
            query_ms: default_query(),
            zombie_ms: default_zombie(),
            connect_timeout_ms: default_connect_timeout(),
            retention_ms: default_retention(),
        }
    }
}

impl Config {
    /// Fix up recoverable values and refuse the rest.
    pub fn validate(mut self) -> Result<Config> {
        if !(1..=MAX_PEER_AD).contains(&self.node.max_peer_ad) {
            warn!(
                "⚠️  max_peer_ad {} out of range 1..={}, using {}",
                self.node.max_peer_ad, MAX_PEER_AD, MAX_PEER_AD
            );
            self.node.max_peer_ad = MAX_PEER_AD;
        }
        if let Some(key) = &self.node.search_key {
            if key.is_empty() || key.len() > KEY_MAX {
                bail!("search key must be 1..={} bytes, got {}", KEY_MAX, key.len());
            }
        }
        if self.node.neighbor_target == 0 {
            bail!("neighbor_target must be at least 1");
        }
        let t = &self.timing;
        for (name, ms) in [
            ("tick_ms", t.tick_ms),
            ("heartbeat_ms", t.heartbeat_ms),
            ("zombie_ms", t.zombie_ms),
            ("connect_timeout_ms", t.connect_timeout_ms),
        ] {
            if ms == 0 {
                bail!("timing.{} must be greater than zero", name);
            }
        }
        Ok(self)
    }
}

/// Read the TOML file at `p` and deserialize into `Config`.
///
/// # Errors
/// * Returns an anyhow::Error if the file cannot be read or parsed.
pub fn load<P: AsRef<Path>>(p: P) -> Result<Config> {
    let text = fs::read_to_string(&p)
        .with_context(|| format!("🗂️  couldn't read config file {}", p.as_ref().display()))?;
    load_from_str(&text).with_context(|| format!("📝  invalid config file {}", p.as_ref().display()))
}

pub fn load_from_str(text: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(text).context("📝  invalid TOML in config")?;
    cfg.validate()
}
