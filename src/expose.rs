//! Service exposure: discovers which container ports to publish and how,
//! then either opens a server tunnel (publishing a `.b32.i2p` name) or
//! runs a local TCP/UDP forwarder. Exposures live exactly as long as the
//! container's last joined endpoint.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use log::{info, warn};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::forward::{TcpForwarder, UdpForwarder};
use crate::session::{TunnelConfig, TunnelKind, TunnelManager};

/// Container label prefix selecting per-port exposure.
pub const EXPOSE_LABEL_PREFIX: &str = "i2p.expose.";

/// Environment variable names understood as port declarations.
const PORT_ENV_NAMES: [&str; 6] = [
	"PORT",
	"HTTP_PORT",
	"HTTPS_PORT",
	"SERVICE_PORT",
	"APP_PORT",
	"SERVER_PORT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
	Tcp,
	Udp,
}

impl Protocol {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Tcp => "tcp",
			Self::Udp => "udp",
		}
	}

	fn parse(raw: &str) -> Option<Protocol> {
		match raw.to_ascii_lowercase().as_str() {
			"tcp" | "" => Some(Self::Tcp),
			"udp" => Some(Self::Udp),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExposureType {
	I2p,
	Ip,
}

impl ExposureType {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::I2p => "i2p",
			Self::Ip => "ip",
		}
	}

	/// Unknown values fall back to I2P exposure.
	pub fn parse(raw: &str) -> ExposureType {
		match raw.to_ascii_lowercase().as_str() {
			"ip" => Self::Ip,
			_ => Self::I2p,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedPort {
	pub port: u16,
	pub protocol: Protocol,
	pub service_name: String,
	pub exposure: ExposureType,
	/// forward target for IP exposures; empty means 127.0.0.1
	pub target_ip: Option<String>,
}

impl ExposedPort {
	fn dedup_key(&self) -> (u16, Protocol, ExposureType) {
		(self.port, self.protocol, self.exposure)
	}
}

fn parse_port_spec(spec: &str) -> Option<(u16, Protocol)> {
	let (port, proto) = match spec.split_once('/') {
		Some((p, proto)) => (p, proto),
		None => (spec, "tcp"),
	};
	let port: u16 = port.trim().parse().ok().filter(|p| *p > 0)?;
	Some((port, Protocol::parse(proto)?))
}

/// Merges the four discovery sources (explicit exposed ports, port-map
/// entries, well-known env names, `i2p.expose.*` labels) and
/// deduplicates on `(port, protocol, exposure type)`. The same port may
/// legitimately surface once per exposure type.
pub fn detect_ports(
	options: &serde_json::Map<String, Value>,
	default_exposure: ExposureType,
	allow_ip: bool,
) -> Vec<ExposedPort> {
	let mut seen: HashSet<(u16, Protocol, ExposureType)> = HashSet::new();
	let mut out: Vec<ExposedPort> = Vec::new();
	let mut push = |port: ExposedPort| {
		if seen.insert(port.dedup_key()) {
			out.push(port);
		}
	};

	let default_exposure = if default_exposure == ExposureType::Ip && !allow_ip {
		warn!("IP exposure disabled on this network, defaulting to i2p");
		ExposureType::I2p
	} else {
		default_exposure
	};

	// 1. explicit ExposedPorts entries of the form "<port>/<proto>"
	if let Some(Value::Object(map)) = options.get("ExposedPorts") {
		for spec in map.keys() {
			match parse_port_spec(spec) {
				Some((port, protocol)) => push(ExposedPort {
					port,
					protocol,
					service_name: format!("exposed-{port}"),
					exposure: default_exposure,
					target_ip: None,
				}),
				None => warn!("skipping unparseable exposed port {spec:?}"),
			}
		}
	}

	// 2. port-map entries with numeric or string ContainerPort
	if let Some(Value::Array(maps)) = options.get("PortMap") {
		for entry in maps {
			let port = match entry.get("ContainerPort") {
				Some(Value::Number(n)) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
				Some(Value::String(s)) => s.trim().parse().ok(),
				_ => None,
			};
			let protocol = entry
				.get("Protocol")
				.and_then(Value::as_str)
				.map_or(Some(Protocol::Tcp), Protocol::parse);
			match (port.filter(|p| *p > 0), protocol) {
				(Some(port), Some(protocol)) => push(ExposedPort {
					port,
					protocol,
					service_name: format!("mapped-{port}"),
					exposure: default_exposure,
					target_ip: None,
				}),
				_ => warn!("skipping unparseable port-map entry {entry}"),
			}
		}
	}

	// 3. PORT-style environment declarations
	if let Some(Value::Array(env)) = options.get("Env") {
		for entry in env {
			let Some((name, value)) = entry.as_str().and_then(|e| e.split_once('=')) else {
				continue;
			};
			if !PORT_ENV_NAMES.contains(&name) {
				continue;
			}
			match value.trim().parse::<u16>().ok().filter(|p| *p > 0) {
				Some(port) => {
					let service_name = match name.strip_suffix("_PORT") {
						Some(prefix) => prefix.to_ascii_lowercase(),
						None => "default".to_string(),
					};
					push(ExposedPort {
						port,
						protocol: Protocol::Tcp,
						service_name,
						exposure: default_exposure,
						target_ip: None,
					});
				}
				None => warn!("skipping env port {name}={value}"),
			}
		}
	}

	// 4. i2p.expose.<port> labels
	if let Some(Value::Object(labels)) = options.get("Labels") {
		for (key, value) in labels {
			let Some(port_str) = key.strip_prefix(EXPOSE_LABEL_PREFIX) else {
				continue;
			};
			let Some(port) = port_str.parse::<u16>().ok().filter(|p| *p > 0) else {
				warn!("skipping label {key}: bad port");
				continue;
			};
			let Some(value) = value.as_str() else {
				warn!("skipping label {key}: non-string value");
				continue;
			};

			let (exposure, target_ip) = match value.split_once(':') {
				None => (ExposureType::parse(value), None),
				Some((kind, target)) => {
					if target.parse::<Ipv4Addr>().is_err() {
						warn!("skipping label {key}: bad target IP {target:?}");
						continue;
					}
					(ExposureType::parse(kind), Some(target.to_string()))
				}
			};
			if exposure == ExposureType::Ip && !allow_ip {
				warn!("skipping label {key}: IP exposure disabled on this network");
				continue;
			}
			push(ExposedPort {
				port,
				protocol: Protocol::Tcp,
				service_name: format!("labeled-{port}"),
				exposure,
				target_ip,
			});
		}
	}

	out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureKind {
	I2pTunnel,
	LocalForwarder,
}

enum Forwarder {
	Tcp(TcpForwarder),
	Udp(UdpForwarder),
}

impl Forwarder {
	fn stop(&mut self) {
		match self {
			Self::Tcp(f) => f.stop(),
			Self::Udp(f) => f.stop(),
		}
	}
}

pub struct ServiceExposure {
	pub container_id: String,
	pub port: ExposedPort,
	pub kind: ExposureKind,
	/// `.b32.i2p` name for tunnel exposures, `ip:port` for forwarders
	pub destination: String,
	pub tunnel_name: Option<String>,
	forwarder: Mutex<Option<Forwarder>>,
}

pub struct ExposureManager {
	tunnels: Arc<TunnelManager>,
	exposures: DashMap<String, Vec<Arc<ServiceExposure>>>,
}

fn short_id(raw: &str) -> String {
	raw.chars().take(12).collect()
}

impl ExposureManager {
	pub fn new(tunnels: Arc<TunnelManager>) -> ExposureManager {
		ExposureManager {
			tunnels,
			exposures: DashMap::new(),
		}
	}

	/// Publishes every detected port. A failure rolls back the exposures
	/// already created by this call and propagates.
	pub fn expose(
		&self,
		container_id: &str,
		container_ip: Ipv4Addr,
		ports: &[ExposedPort],
	) -> Result<Vec<Arc<ServiceExposure>>> {
		let mut created: Vec<Arc<ServiceExposure>> = Vec::new();
		for port in ports {
			match self.expose_one(container_id, container_ip, port) {
				Ok(exposure) => created.push(Arc::new(exposure)),
				Err(e) => {
					for exposure in &created {
						self.close_exposure(exposure);
					}
					return Err(e);
				}
			}
		}
		self.exposures
			.entry(container_id.to_string())
			.or_default()
			.extend(created.iter().cloned());
		Ok(created)
	}

	fn expose_one(
		&self,
		container_id: &str,
		container_ip: Ipv4Addr,
		port: &ExposedPort,
	) -> Result<ServiceExposure> {
		match port.exposure {
			ExposureType::I2p => {
				let tunnel_name = format!(
					"svc-{}-{}-{}",
					short_id(container_id),
					port.port,
					port.protocol.as_str()
				);
				let tunnel = self.tunnels.create_tunnel(TunnelConfig {
					name: tunnel_name.clone(),
					container_id: container_id.to_string(),
					kind: TunnelKind::Server,
					local_host: container_ip.to_string(),
					local_port: port.port,
					destination: None,
					options: None,
				})?;
				let destination = tunnel.published_destination()?;
				info!(
					"exposed {container_id} port {}/{} as {destination}",
					port.port,
					port.protocol.as_str()
				);
				Ok(ServiceExposure {
					container_id: container_id.to_string(),
					port: port.clone(),
					kind: ExposureKind::I2pTunnel,
					destination,
					tunnel_name: Some(tunnel_name),
					forwarder: Mutex::new(None),
				})
			}
			ExposureType::Ip => {
				let target_ip = match port.target_ip.as_deref() {
					None | Some("") => Ipv4Addr::LOCALHOST,
					Some(raw) => raw
						.parse()
						.map_err(|_| Error::InvalidTargetIp(raw.to_string()))?,
				};
				let listen = SocketAddr::from((target_ip, port.port));
				let target = SocketAddr::from((container_ip, port.port));
				let forwarder = match port.protocol {
					Protocol::Tcp => {
						let mut f = TcpForwarder::new(listen, target);
						f.start()?;
						Forwarder::Tcp(f)
					}
					Protocol::Udp => {
						let mut f = UdpForwarder::new(listen, target);
						f.start()?;
						Forwarder::Udp(f)
					}
				};
				let destination = listen.to_string();
				info!(
					"exposed {container_id} port {}/{} at {destination}",
					port.port,
					port.protocol.as_str()
				);
				Ok(ServiceExposure {
					container_id: container_id.to_string(),
					port: port.clone(),
					kind: ExposureKind::LocalForwarder,
					destination,
					tunnel_name: None,
					forwarder: Mutex::new(Some(forwarder)),
				})
			}
		}
	}

	fn close_exposure(&self, exposure: &ServiceExposure) {
		if let Some(name) = &exposure.tunnel_name {
			if let Err(e) = self.tunnels.destroy_tunnel(name) {
				warn!("destroying tunnel {name}: {e}");
			}
		}
		if let Some(mut forwarder) = exposure.forwarder.lock().unwrap().take() {
			forwarder.stop();
		}
	}

	pub fn exposures_for(&self, container_id: &str) -> Vec<Arc<ServiceExposure>> {
		self.exposures
			.get(container_id)
			.map(|v| v.clone())
			.unwrap_or_default()
	}

	/// Removes every exposure of the container. Individual close errors
	/// are logged, never fatal.
	pub fn cleanup_container(&self, container_id: &str) {
		if let Some((_, exposures)) = self.exposures.remove(container_id) {
			for exposure in exposures {
				self.close_exposure(&exposure);
			}
			info!("cleaned up exposures for {container_id}");
		}
	}

	pub fn shutdown(&self) {
		let containers: Vec<String> =
			self.exposures.iter().map(|e| e.key().clone()).collect();
		for container_id in containers {
			self.cleanup_container(&container_id);
		}
	}
}
