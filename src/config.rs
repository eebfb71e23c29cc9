//! Daemon configuration. Every field is defaulted so an empty config file
//! (or none at all) yields a working driver; validation runs before any
//! socket is opened.

use std::fs::read_to_string;
use std::net::Ipv4Addr;

use clap::Parser;
use ipnetwork::Ipv4Network;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Where and how to reach the SAM bridge of the local I2P router.
#[derive(Debug, Clone, Deserialize)]
pub struct SamConfig {
	#[serde(default = "SamConfig::host")]
	pub host: String,
	#[serde(default = "SamConfig::port")]
	pub port: u16,
	/// connect / handshake deadline in seconds
	#[serde(default = "SamConfig::timeout_secs")]
	pub timeout_secs: u64,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
}

impl SamConfig {
	fn host() -> String {
		"127.0.0.1".to_string()
	}

	fn port() -> u16 {
		7656
	}

	fn timeout_secs() -> u64 {
		30
	}

	pub fn address(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	pub fn validate(&self) -> Result<()> {
		if self.host.trim().is_empty() {
			return Err(Error::InvalidConfig("SAM host must not be empty".to_string()));
		}
		if self.port == 0 {
			return Err(Error::InvalidConfig("SAM port must be non-zero".to_string()));
		}
		if self.timeout_secs == 0 {
			return Err(Error::InvalidConfig(
				"SAM timeout must be positive".to_string(),
			));
		}
		Ok(())
	}
}

impl Default for SamConfig {
	fn default() -> Self {
		Self {
			host: Self::host(),
			port: Self::port(),
			timeout_secs: Self::timeout_secs(),
			username: None,
			password: None,
		}
	}
}

/// Traffic policy knobs, see `filter::TrafficFilter`.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
	#[serde(default)]
	pub enable_allowlist: bool,
	#[serde(default)]
	pub enable_blocklist: bool,
	#[serde(default = "FilterConfig::yes")]
	pub log_traffic: bool,
	#[serde(default = "FilterConfig::yes")]
	pub log_non_i2p: bool,
	#[serde(default = "FilterConfig::max_log_entries")]
	pub max_log_entries: usize,
	#[serde(default = "FilterConfig::stats_retention_secs")]
	pub stats_retention_secs: u64,
}

impl FilterConfig {
	fn yes() -> bool {
		true
	}

	fn max_log_entries() -> usize {
		1000
	}

	fn stats_retention_secs() -> u64 {
		86400
	}

	pub fn validate(&self) -> Result<()> {
		if self.max_log_entries == 0 {
			return Err(Error::InvalidConfig(
				"max_log_entries must be positive".to_string(),
			));
		}
		Ok(())
	}
}

impl Default for FilterConfig {
	fn default() -> Self {
		Self {
			enable_allowlist: false,
			enable_blocklist: false,
			log_traffic: true,
			log_non_i2p: true,
			max_log_entries: Self::max_log_entries(),
			stats_retention_secs: Self::stats_retention_secs(),
		}
	}
}

/// Egress core addressing: the SOCKS front-end, the DNS responder and the
/// fallback container subnet used when a network is created without a pool.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
	#[serde(default = "ProxyConfig::container_subnet")]
	pub container_subnet: String,
	#[serde(default = "ProxyConfig::socks_port")]
	pub socks_port: u16,
	#[serde(default = "ProxyConfig::dns_port")]
	pub dns_port: u16,
	#[serde(default = "ProxyConfig::loopback")]
	pub socks_bind_addr: String,
	#[serde(default = "ProxyConfig::loopback")]
	pub dns_bind_addr: String,
}

impl ProxyConfig {
	fn container_subnet() -> String {
		"172.28.0.0/16".to_string()
	}

	fn socks_port() -> u16 {
		1080
	}

	fn dns_port() -> u16 {
		5354
	}

	fn loopback() -> String {
		"127.0.0.1".to_string()
	}

	pub fn subnet(&self) -> Result<Ipv4Network> {
		self.container_subnet
			.parse()
			.map_err(|_| Error::InvalidConfig(format!("bad subnet {}", self.container_subnet)))
	}

	pub fn validate(&self) -> Result<()> {
		self.subnet()?;
		if self.socks_port == 0 || self.dns_port == 0 {
			return Err(Error::InvalidConfig(
				"SOCKS and DNS ports must be non-zero".to_string(),
			));
		}
		for bind in [&self.socks_bind_addr, &self.dns_bind_addr] {
			if bind.parse::<Ipv4Addr>().is_err() {
				return Err(Error::InvalidConfig(format!("bad bind address {bind}")));
			}
		}
		Ok(())
	}
}

impl Default for ProxyConfig {
	fn default() -> Self {
		Self {
			container_subnet: Self::container_subnet(),
			socks_port: Self::socks_port(),
			dns_port: Self::dns_port(),
			socks_bind_addr: Self::loopback(),
			dns_bind_addr: Self::loopback(),
		}
	}
}

/// Tunnel geometry handed to the router via I2CP options. Zero-valued
/// numeric fields fall back to the defaults when overlaid.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelOptions {
	#[serde(default = "TunnelOptions::two")]
	pub inbound_tunnels: u8,
	#[serde(default = "TunnelOptions::two")]
	pub outbound_tunnels: u8,
	#[serde(default = "TunnelOptions::three")]
	pub inbound_length: u8,
	#[serde(default = "TunnelOptions::three")]
	pub outbound_length: u8,
	#[serde(default = "TunnelOptions::one")]
	pub inbound_backups: u8,
	#[serde(default = "TunnelOptions::one")]
	pub outbound_backups: u8,
	#[serde(default)]
	pub encrypt_leaseset: bool,
	#[serde(default = "TunnelOptions::yes")]
	pub close_idle: bool,
	#[serde(default = "TunnelOptions::close_idle_minutes")]
	pub close_idle_minutes: u32,
}

impl TunnelOptions {
	fn one() -> u8 {
		1
	}

	fn two() -> u8 {
		2
	}

	fn three() -> u8 {
		3
	}

	fn yes() -> bool {
		true
	}

	fn close_idle_minutes() -> u32 {
		10
	}

	/// Fills zero-valued numeric fields from `defaults`; booleans are taken
	/// as supplied.
	pub fn overlay(&self, defaults: &TunnelOptions) -> TunnelOptions {
		fn pick(v: u8, d: u8) -> u8 {
			if v == 0 {
				d
			} else {
				v
			}
		}
		TunnelOptions {
			inbound_tunnels: pick(self.inbound_tunnels, defaults.inbound_tunnels),
			outbound_tunnels: pick(self.outbound_tunnels, defaults.outbound_tunnels),
			inbound_length: pick(self.inbound_length, defaults.inbound_length),
			outbound_length: pick(self.outbound_length, defaults.outbound_length),
			inbound_backups: pick(self.inbound_backups, defaults.inbound_backups),
			outbound_backups: pick(self.outbound_backups, defaults.outbound_backups),
			encrypt_leaseset: self.encrypt_leaseset,
			close_idle: self.close_idle,
			close_idle_minutes: if self.close_idle_minutes == 0 {
				defaults.close_idle_minutes
			} else {
				self.close_idle_minutes
			},
		}
	}

	/// Renders the I2CP option string for SESSION CREATE / SESSION ADD.
	pub fn to_sam_options(&self) -> String {
		let mut options = String::new();
		options.push_str(&format!("inbound.quantity={} ", self.inbound_tunnels));
		options.push_str(&format!("outbound.quantity={} ", self.outbound_tunnels));
		options.push_str(&format!("inbound.length={} ", self.inbound_length));
		options.push_str(&format!("outbound.length={} ", self.outbound_length));
		options.push_str(&format!(
			"inbound.backupQuantity={} ",
			self.inbound_backups
		));
		options.push_str(&format!(
			"outbound.backupQuantity={} ",
			self.outbound_backups
		));
		options.push_str(&format!(
			"i2cp.encryptLeaseSet={} ",
			self.encrypt_leaseset
		));
		options.push_str(&format!("i2cp.closeOnIdle={} ", self.close_idle));
		options.push_str(&format!(
			"i2cp.closeIdleTime={}",
			u64::from(self.close_idle_minutes) * 60_000
		));
		options
	}

	/// Geometry for fresh primary sessions: a single tunnel each way until
	/// a sub-session asks for more.
	pub fn primary_defaults(&self) -> TunnelOptions {
		TunnelOptions {
			inbound_tunnels: 1,
			outbound_tunnels: 1,
			..self.clone()
		}
	}
}

impl Default for TunnelOptions {
	fn default() -> Self {
		Self {
			inbound_tunnels: Self::two(),
			outbound_tunnels: Self::two(),
			inbound_length: Self::three(),
			outbound_length: Self::three(),
			inbound_backups: Self::one(),
			outbound_backups: Self::one(),
			encrypt_leaseset: false,
			close_idle: true,
			close_idle_minutes: Self::close_idle_minutes(),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub enum LogLevel {
	Error,
	Warn,
	Info,
	Debug,
	Trace,
}

impl Default for LogLevel {
	fn default() -> Self {
		Self::Info
	}
}

impl LogLevel {
	pub fn as_filter(&self) -> log::LevelFilter {
		match *self {
			Self::Error => log::LevelFilter::Error,
			Self::Warn => log::LevelFilter::Warn,
			Self::Info => log::LevelFilter::Info,
			Self::Debug => log::LevelFilter::Debug,
			Self::Trace => log::LevelFilter::Trace,
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub sam: SamConfig,
	#[serde(default)]
	pub filter: FilterConfig,
	#[serde(default)]
	pub proxy: ProxyConfig,
	#[serde(default)]
	pub tunnel: TunnelOptions,
	#[serde(default = "Config::socket_path")]
	pub socket_path: String,
	#[serde(default)]
	pub log_level: LogLevel,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			sam: SamConfig::default(),
			filter: FilterConfig::default(),
			proxy: ProxyConfig::default(),
			tunnel: TunnelOptions::default(),
			socket_path: Self::socket_path(),
			log_level: LogLevel::default(),
		}
	}
}

#[derive(Parser)]
#[command(
	about = env!("CARGO_PKG_DESCRIPTION"),
	version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
	/// path to a JSON configuration file
	#[arg(long)]
	config: Option<String>,

	/// override the plugin socket path
	#[arg(long)]
	socket: Option<String>,
}

impl Config {
	fn socket_path() -> String {
		"/run/docker/plugins/i2p.sock".to_string()
	}

	/// Loads command line parameters; when a configuration file is given
	/// it is read as JSON, otherwise every default applies.
	pub fn load() -> Result<Config> {
		let cli = Cli::parse();
		let mut config = match cli.config {
			Some(path) => {
				let raw = read_to_string(&path)
					.map_err(|e| Error::InvalidConfig(format!("{path}: {e}")))?;
				serde_json::from_str(&raw)
					.map_err(|e| Error::InvalidConfig(format!("{path}: {e}")))?
			}
			None => Config::default(),
		};
		if let Some(socket) = cli.socket {
			config.socket_path = socket;
		}
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		self.sam.validate()?;
		self.filter.validate()?;
		self.proxy.validate()?;
		if self.socket_path.trim().is_empty() {
			return Err(Error::InvalidConfig("socket_path must not be empty".to_string()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_valid() {
		let config = Config::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.sam.address(), "127.0.0.1:7656");
		assert_eq!(config.proxy.socks_port, 1080);
		assert_eq!(config.socket_path, "/run/docker/plugins/i2p.sock");
	}

	#[test]
	fn empty_json_yields_defaults() {
		let config: Config = serde_json::from_str("{}").unwrap();
		assert!(config.validate().is_ok());
		assert_eq!(config.tunnel.inbound_tunnels, 2);
		assert_eq!(config.filter.max_log_entries, 1000);
	}

	#[test]
	fn sam_validation_rejects_bad_fields() {
		let mut sam = SamConfig::default();
		sam.host = " ".to_string();
		assert!(sam.validate().is_err());

		let mut sam = SamConfig::default();
		sam.port = 0;
		assert!(sam.validate().is_err());

		let mut sam = SamConfig::default();
		sam.timeout_secs = 0;
		assert!(sam.validate().is_err());
	}

	#[test]
	fn tunnel_overlay_fills_zeroes() {
		let defaults = TunnelOptions::default();
		let supplied: TunnelOptions = serde_json::from_str(
			r#"{"inbound_tunnels":4,"outbound_tunnels":0,"inbound_length":0}"#,
		)
		.unwrap();
		let merged = supplied.overlay(&defaults);
		assert_eq!(merged.inbound_tunnels, 4);
		assert_eq!(merged.outbound_tunnels, 2);
		assert_eq!(merged.inbound_length, 3);
	}

	#[test]
	fn sam_option_string_shape() {
		let opts = TunnelOptions::default();
		let s = opts.to_sam_options();
		assert!(s.contains("inbound.quantity=2"));
		assert!(s.contains("outbound.length=3"));
		assert!(s.contains("i2cp.closeOnIdle=true"));
		assert!(s.contains("i2cp.closeIdleTime=600000"));

		let primary = opts.primary_defaults();
		assert!(primary.to_sam_options().contains("inbound.quantity=1"));
	}
}
