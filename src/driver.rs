//! Top-level state: networks, endpoints, address assignment, and the
//! lifecycle of the egress core. Lock order is manager lock first, then
//! the per-network lock; read paths take read locks only.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};

use ipnetwork::Ipv4Network;
use log::{info, warn};
use serde_json::Value;

use crate::config::Config;
use crate::dns::{DnsResponder, NameCache};
use crate::error::{Error, Result};
use crate::expose::{detect_ports, ExposureManager, ExposureType};
use crate::filter::TrafficFilter;
use crate::firewall::{self, EgressFirewall};
use crate::ipam::IpPool;
use crate::session::{Tunnel, TunnelManager};
use crate::socks::SocksProxy;

/// Network options understood under `com.docker.network.generic`.
const OPT_EXPOSURE_DEFAULT: &str = "i2p.exposure.default";
const OPT_ALLOW_IP: &str = "i2p.exposure.allow_ip";
const OPT_TRANSPARENT: &str = "i2p.transparent";
const OPT_NETWORK_NAME: &str = "i2p.network.name";

#[derive(Debug, Clone)]
pub struct ExposurePolicy {
	pub default_exposure: ExposureType,
	pub allow_ip: bool,
}

fn parse_bool(raw: &str) -> bool {
	!matches!(
		raw.to_ascii_lowercase().as_str(),
		"false" | "no" | "0"
	)
}

fn generic_option<'a>(
	options: &'a serde_json::Map<String, Value>,
	key: &str,
) -> Option<&'a str> {
	options
		.get("com.docker.network.generic")
		.and_then(Value::as_object)
		.and_then(|generic| generic.get(key))
		.or_else(|| options.get(key))
		.and_then(Value::as_str)
}

impl ExposurePolicy {
	pub fn from_options(options: &serde_json::Map<String, Value>) -> ExposurePolicy {
		ExposurePolicy {
			default_exposure: generic_option(options, OPT_EXPOSURE_DEFAULT)
				.map(ExposureType::parse)
				.unwrap_or(ExposureType::I2p),
			allow_ip: generic_option(options, OPT_ALLOW_IP)
				.map(parse_bool)
				.unwrap_or(true),
		}
	}
}

/// The MAC is a pure function of the assigned IPv4.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
	let o = ip.octets();
	format!("02:42:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
}

pub struct Endpoint {
	pub id: String,
	pub network_id: String,
	pub container_id: Option<String>,
	pub address: Ipv4Addr,
	pub mac: String,
	/// discovery input saved from endpoint creation
	pub options: serde_json::Map<String, Value>,
	pub client_tunnels: HashMap<String, Arc<Tunnel>>,
	pub server_tunnels: HashMap<String, Arc<Tunnel>>,
}

struct Network {
	id: String,
	name: String,
	policy: ExposurePolicy,
	transparent: bool,
	pool: IpPool,
	endpoints: HashMap<String, Endpoint>,
}

struct EgressCore {
	firewall: EgressFirewall,
	dns: DnsResponder,
	socks: SocksProxy,
}

pub struct NetworkManager {
	config: Config,
	tunnels: Arc<TunnelManager>,
	exposures: ExposureManager,
	filter: Arc<TrafficFilter>,
	names: Arc<NameCache>,
	networks: RwLock<HashMap<String, Arc<RwLock<Network>>>>,
	egress: Mutex<Option<EgressCore>>,
}

impl NetworkManager {
	pub fn new(config: Config) -> NetworkManager {
		let filter = Arc::new(TrafficFilter::new(config.filter.clone()));
		let tunnels = Arc::new(TunnelManager::new(&config.sam, config.tunnel.clone()));
		let exposures = ExposureManager::new(tunnels.clone());
		NetworkManager {
			config,
			tunnels,
			exposures,
			filter,
			names: Arc::new(NameCache::new()),
			networks: RwLock::new(HashMap::new()),
			egress: Mutex::new(None),
		}
	}

	pub fn filter(&self) -> Arc<TrafficFilter> {
		self.filter.clone()
	}

	fn parse_pool(
		&self,
		pool: Option<&str>,
		gateway: Option<&str>,
	) -> Result<(Ipv4Network, Ipv4Addr)> {
		let subnet: Ipv4Network = match pool {
			Some(raw) => raw
				.parse()
				.map_err(|_| Error::InvalidConfig(format!("bad pool {raw}")))?,
			None => self.config.proxy.subnet()?,
		};
		let gateway: Ipv4Addr = match gateway {
			// gateways arrive in CIDR notation
			Some(raw) => {
				let host = raw.split('/').next().unwrap_or(raw);
				host.parse()
					.map_err(|_| Error::InvalidConfig(format!("bad gateway {raw}")))?
			}
			None => Ipv4Addr::from(u32::from(subnet.network()) + 1),
		};
		Ok((subnet, gateway))
	}

	/// Creates a network; the first transparent network arms the egress
	/// core (DNS responder, SOCKS front-end, packet-filter program).
	pub fn create_network(
		&self,
		id: &str,
		options: &serde_json::Map<String, Value>,
		pool: Option<&str>,
		gateway: Option<&str>,
	) -> Result<()> {
		let mut networks = self.networks.write().unwrap();
		if networks.contains_key(id) {
			return Err(Error::DuplicateNetwork(id.to_string()));
		}

		let (subnet, gateway) = self.parse_pool(pool, gateway)?;
		let policy = ExposurePolicy::from_options(options);
		let transparent = generic_option(options, OPT_TRANSPARENT)
			.map(parse_bool)
			.unwrap_or(true);
		let name = generic_option(options, OPT_NETWORK_NAME)
			.map(str::to_string)
			.unwrap_or_else(|| id.chars().take(12).collect());

		let pool = IpPool::new(subnet, gateway)?;
		if transparent {
			self.start_egress(subnet)?;
		}

		let network = Network {
			id: id.to_string(),
			name: name.clone(),
			policy,
			transparent,
			pool,
			endpoints: HashMap::new(),
		};
		networks.insert(id.to_string(), Arc::new(RwLock::new(network)));
		info!("created network {name} ({id}) on {subnet}, gateway {gateway}");
		Ok(())
	}

	fn start_egress(&self, subnet: Ipv4Network) -> Result<()> {
		let mut egress = self.egress.lock().unwrap();
		if egress.is_some() {
			return Ok(());
		}
		if !firewall::is_available() {
			return Err(Error::FirewallUnavailable(
				"iptables missing or not permitted".to_string(),
			));
		}

		let proxy = &self.config.proxy;
		let dns_bind: Ipv4Addr = proxy.dns_bind_addr.parse().unwrap_or(Ipv4Addr::LOCALHOST);
		let socks_bind: Ipv4Addr = proxy
			.socks_bind_addr
			.parse()
			.unwrap_or(Ipv4Addr::LOCALHOST);

		let mut dns = DnsResponder::new(
			SocketAddr::from((dns_bind, proxy.dns_port)),
			self.names.clone(),
		);
		dns.start()?;

		let mut socks = SocksProxy::new(
			SocketAddr::from((socks_bind, proxy.socks_port)),
			self.tunnels.clone(),
			self.filter.clone(),
			self.names.clone(),
		);
		if let Err(e) = socks.start() {
			dns.stop();
			return Err(e);
		}

		let mut fw = EgressFirewall::new(subnet, proxy.socks_port, proxy.dns_port);
		if let Err(e) = fw.setup() {
			socks.stop();
			dns.stop();
			return Err(e);
		}

		*egress = Some(EgressCore {
			firewall: fw,
			dns,
			socks,
		});
		info!("egress core armed for {subnet}");
		Ok(())
	}

	fn stop_egress(&self) {
		let mut egress = self.egress.lock().unwrap();
		if let Some(mut core) = egress.take() {
			// rules first, so nothing routes into stopped services
			if let Err(e) = core.firewall.teardown() {
				warn!("egress rule teardown: {e}");
			}
			core.socks.stop();
			core.dns.stop();
			info!("egress core disarmed");
		}
	}

	pub fn egress_running(&self) -> bool {
		self.egress.lock().unwrap().is_some()
	}

	/// Deletes a network. The runtime contract is that it is already
	/// empty; leftovers are cleaned up defensively. The last transparent
	/// network disarms the egress core.
	pub fn delete_network(&self, id: &str) -> Result<()> {
		let mut networks = self.networks.write().unwrap();
		let network = networks
			.remove(id)
			.ok_or_else(|| Error::NoSuchNetwork(id.to_string()))?;

		// the network is out of the map, so nothing else can reach it
		let mut net = network.write().unwrap();
		let transparent = net.transparent;
		let name = net.name.clone();
		if !net.endpoints.is_empty() {
			warn!(
				"deleting network {} ({}) with {} endpoints still attached",
				net.name,
				net.id,
				net.endpoints.len()
			);
		}
		let leftovers: Vec<Endpoint> = net.endpoints.drain().map(|(_, ep)| ep).collect();
		for endpoint in &leftovers {
			net.pool.release(endpoint.address);
		}
		drop(net);
		for endpoint in leftovers {
			if let Some(container_id) = endpoint.container_id {
				self.exposures.cleanup_container(&container_id);
				if !referenced(&networks, &container_id) {
					if let Err(e) = self.tunnels.destroy_container_session(&container_id) {
						warn!("destroying session for {container_id}: {e}");
					}
				}
			}
		}

		let last_transparent = transparent
			&& !networks
				.values()
				.any(|n| n.read().unwrap().transparent);
		if last_transparent {
			self.stop_egress();
		}
		info!("deleted network {name} ({id})");
		Ok(())
	}

	pub fn create_endpoint(
		&self,
		network_id: &str,
		endpoint_id: &str,
		requested: Option<Ipv4Addr>,
		options: serde_json::Map<String, Value>,
	) -> Result<(Ipv4Addr, u8, String)> {
		let networks = self.networks.read().unwrap();
		let network = networks
			.get(network_id)
			.ok_or_else(|| Error::NoSuchNetwork(network_id.to_string()))?;
		let mut net = network.write().unwrap();
		if net.endpoints.contains_key(endpoint_id) {
			return Err(Error::DuplicateEndpoint(endpoint_id.to_string()));
		}

		let address = match requested {
			Some(ip) => {
				net.pool.allocate_specific(ip)?;
				ip
			}
			None => net.pool.allocate()?,
		};
		let mac = mac_for_ip(address);
		let prefix = net.pool.subnet().prefix();

		net.endpoints.insert(
			endpoint_id.to_string(),
			Endpoint {
				id: endpoint_id.to_string(),
				network_id: network_id.to_string(),
				container_id: None,
				address,
				mac: mac.clone(),
				options,
				client_tunnels: HashMap::new(),
				server_tunnels: HashMap::new(),
			},
		);
		info!("created endpoint {endpoint_id} on {network_id}: {address} {mac}");
		Ok((address, prefix, mac))
	}

	pub fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
		let networks = self.networks.read().unwrap();
		let network = networks
			.get(network_id)
			.ok_or_else(|| Error::NoSuchNetwork(network_id.to_string()))?;
		let mut net = network.write().unwrap();
		let endpoint = net
			.endpoints
			.remove(endpoint_id)
			.ok_or_else(|| Error::NoSuchEndpoint(endpoint_id.to_string()))?;
		net.pool.release(endpoint.address);
		drop(net);

		if let Some(container_id) = endpoint.container_id {
			// the runtime should have sent Leave first
			warn!("deleting endpoint {endpoint_id} while still joined");
			self.release_container(&networks, &container_id);
		}
		info!("deleted endpoint {endpoint_id}");
		Ok(())
	}

	/// Binds the container to the endpoint and publishes its services.
	/// Returns the network gateway for the sandbox route.
	pub fn join(
		&self,
		network_id: &str,
		endpoint_id: &str,
		sandbox_key: &str,
		join_options: &serde_json::Map<String, Value>,
	) -> Result<Ipv4Addr> {
		let networks = self.networks.read().unwrap();
		let network = networks
			.get(network_id)
			.ok_or_else(|| Error::NoSuchNetwork(network_id.to_string()))?;
		let mut net = network.write().unwrap();
		let gateway = net.pool.gateway();
		let policy = net.policy.clone();
		let endpoint = net
			.endpoints
			.get_mut(endpoint_id)
			.ok_or_else(|| Error::NoSuchEndpoint(endpoint_id.to_string()))?;

		let container_id = container_id_from_sandbox(sandbox_key)
			.unwrap_or_else(|| endpoint_id.to_string());

		let mut discovery = endpoint.options.clone();
		for (key, value) in join_options {
			discovery.insert(key.clone(), value.clone());
		}
		let ports = detect_ports(&discovery, policy.default_exposure, policy.allow_ip);
		let created =
			self.exposures
				.expose(&container_id, endpoint.address, &ports)?;

		for exposure in &created {
			if let Some(name) = &exposure.tunnel_name {
				if let Some(tunnel) = self.tunnels.get_tunnel(name) {
					endpoint.server_tunnels.insert(name.clone(), tunnel);
				}
			}
		}
		endpoint.container_id = Some(container_id.clone());
		info!(
			"joined container {container_id} to {endpoint_id} ({} services)",
			created.len()
		);
		Ok(gateway)
	}

	/// Unbinds the container. When this was its last endpoint anywhere,
	/// the container's primary session is destroyed as well.
	pub fn leave(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
		let networks = self.networks.read().unwrap();
		let network = networks
			.get(network_id)
			.ok_or_else(|| Error::NoSuchNetwork(network_id.to_string()))?;
		let mut net = network.write().unwrap();
		let endpoint = net
			.endpoints
			.get_mut(endpoint_id)
			.ok_or_else(|| Error::NoSuchEndpoint(endpoint_id.to_string()))?;

		let Some(container_id) = endpoint.container_id.take() else {
			warn!("leave on endpoint {endpoint_id} that was never joined");
			return Ok(());
		};
		endpoint.client_tunnels.clear();
		endpoint.server_tunnels.clear();
		drop(net);

		self.release_container(&networks, &container_id);
		info!("container {container_id} left {endpoint_id}");
		Ok(())
	}

	/// Cleans up the container's exposures, and its session when no other
	/// endpoint still references it. Callers hold the manager lock and
	/// no per-network lock.
	fn release_container(
		&self,
		networks: &HashMap<String, Arc<RwLock<Network>>>,
		container_id: &str,
	) {
		self.exposures.cleanup_container(container_id);
		if !referenced(networks, container_id) {
			if let Err(e) = self.tunnels.destroy_container_session(container_id) {
				warn!("destroying session for {container_id}: {e}");
			}
		}
	}

	pub fn endpoint_info(
		&self,
		network_id: &str,
		endpoint_id: &str,
	) -> Result<serde_json::Map<String, Value>> {
		let networks = self.networks.read().unwrap();
		let network = networks
			.get(network_id)
			.ok_or_else(|| Error::NoSuchNetwork(network_id.to_string()))?;
		let net = network.read().unwrap();
		let endpoint = net
			.endpoints
			.get(endpoint_id)
			.ok_or_else(|| Error::NoSuchEndpoint(endpoint_id.to_string()))?;

		let mut value = serde_json::Map::new();
		value.insert(
			"Address".to_string(),
			Value::String(endpoint.address.to_string()),
		);
		value.insert(
			"MacAddress".to_string(),
			Value::String(endpoint.mac.clone()),
		);
		if let Some(container_id) = &endpoint.container_id {
			value.insert(
				"ContainerID".to_string(),
				Value::String(container_id.clone()),
			);
			let destinations: Vec<Value> = self
				.exposures
				.exposures_for(container_id)
				.iter()
				.map(|e| Value::String(e.destination.clone()))
				.collect();
			value.insert("Services".to_string(), Value::Array(destinations));
		}
		Ok(value)
	}

	pub fn network_gateway(&self, network_id: &str) -> Result<Ipv4Addr> {
		let networks = self.networks.read().unwrap();
		let network = networks
			.get(network_id)
			.ok_or_else(|| Error::NoSuchNetwork(network_id.to_string()))?;
		let net = network.read().unwrap();
		Ok(net.pool.gateway())
	}

	/// Reverse dependency order: egress rules stop taking traffic first,
	/// then the service exposures, then every container session.
	pub fn shutdown(&self) {
		self.stop_egress();
		self.exposures.shutdown();
		self.tunnels.shutdown();
		info!("network manager shut down");
	}
}

fn referenced(
	networks: &HashMap<String, Arc<RwLock<Network>>>,
	container_id: &str,
) -> bool {
	networks.values().any(|network| {
		let net = network.read().unwrap();
		net.endpoints
			.values()
			.any(|ep| ep.container_id.as_deref() == Some(container_id))
	})
}

fn container_id_from_sandbox(sandbox_key: &str) -> Option<String> {
	let tail = sandbox_key.rsplit('/').next()?.trim();
	if tail.is_empty() {
		None
	} else {
		Some(tail.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn opaque_network_options() -> serde_json::Map<String, Value> {
		// tests must not touch iptables
		json!({
			"com.docker.network.generic": {"i2p.transparent": "false"}
		})
		.as_object()
		.unwrap()
		.clone()
	}

	fn manager() -> NetworkManager {
		NetworkManager::new(Config::default())
	}

	#[test]
	fn mac_is_a_pure_function_of_ip() {
		assert_eq!(
			mac_for_ip("172.28.0.10".parse().unwrap()),
			"02:42:ac:1c:00:0a"
		);
		assert_eq!(
			mac_for_ip("192.168.201.2".parse().unwrap()),
			"02:42:c0:a8:c9:02"
		);
	}

	#[test]
	fn exposure_policy_parsing() {
		let options = json!({
			"com.docker.network.generic": {
				"i2p.exposure.default": "ip",
				"i2p.exposure.allow_ip": "no"
			}
		});
		let policy = ExposurePolicy::from_options(options.as_object().unwrap());
		assert_eq!(policy.default_exposure, ExposureType::Ip);
		assert!(!policy.allow_ip);

		// unknown values fall back to the defaults
		let options = json!({"i2p.exposure.default": "bogus"});
		let policy = ExposurePolicy::from_options(options.as_object().unwrap());
		assert_eq!(policy.default_exposure, ExposureType::I2p);
		assert!(policy.allow_ip);
	}

	#[test]
	fn network_lifecycle() {
		let m = manager();
		m.create_network("n1", &opaque_network_options(), Some("192.168.201.0/24"), Some("192.168.201.1/24"))
			.unwrap();
		assert!(matches!(
			m.create_network("n1", &opaque_network_options(), None, None),
			Err(Error::DuplicateNetwork(_))
		));
		assert!(matches!(
			m.delete_network("ghost"),
			Err(Error::NoSuchNetwork(_))
		));
		m.delete_network("n1").unwrap();
	}

	#[test]
	fn endpoint_lifecycle() {
		let m = manager();
		m.create_network("n1", &opaque_network_options(), Some("192.168.201.0/24"), Some("192.168.201.1/24"))
			.unwrap();

		let (address, prefix, mac) = m
			.create_endpoint("n1", "e1", None, serde_json::Map::new())
			.unwrap();
		assert_eq!(address, "192.168.201.2".parse::<Ipv4Addr>().unwrap());
		assert_eq!(prefix, 24);
		assert_eq!(mac, mac_for_ip(address));

		assert!(matches!(
			m.create_endpoint("n1", "e1", None, serde_json::Map::new()),
			Err(Error::DuplicateEndpoint(_))
		));

		// no ports declared, so join succeeds without a SAM router
		let gateway = m
			.join("n1", "e1", "/var/run/docker/netns/abc123", &serde_json::Map::new())
			.unwrap();
		assert_eq!(gateway, "192.168.201.1".parse::<Ipv4Addr>().unwrap());

		let info = m.endpoint_info("n1", "e1").unwrap();
		assert_eq!(
			info.get("ContainerID").and_then(Value::as_str),
			Some("abc123")
		);

		m.leave("n1", "e1").unwrap();
		m.delete_endpoint("n1", "e1").unwrap();
		m.delete_network("n1").unwrap();
	}

	#[test]
	fn specific_address_grants() {
		let m = manager();
		m.create_network("n1", &opaque_network_options(), Some("192.168.201.0/24"), Some("192.168.201.1/24"))
			.unwrap();
		let requested: Ipv4Addr = "192.168.201.50".parse().unwrap();
		let (address, _, _) = m
			.create_endpoint("n1", "e1", Some(requested), serde_json::Map::new())
			.unwrap();
		assert_eq!(address, requested);
		assert!(matches!(
			m.create_endpoint("n1", "e2", Some(requested), serde_json::Map::new()),
			Err(Error::AlreadyAllocated(_))
		));
	}

	#[test]
	fn released_addresses_are_reusable() {
		let m = manager();
		m.create_network("n1", &opaque_network_options(), Some("192.168.201.0/24"), Some("192.168.201.1/24"))
			.unwrap();
		let (address, _, _) = m
			.create_endpoint("n1", "e1", None, serde_json::Map::new())
			.unwrap();
		m.delete_endpoint("n1", "e1").unwrap();
		let (again, _, _) = m
			.create_endpoint("n1", "e2", Some(address), serde_json::Map::new())
			.unwrap();
		assert_eq!(address, again);
	}

	#[test]
	fn sandbox_key_derivation() {
		assert_eq!(
			container_id_from_sandbox("/var/run/docker/netns/abc123"),
			Some("abc123".to_string())
		);
		assert_eq!(container_id_from_sandbox(""), None);
		assert_eq!(container_id_from_sandbox("///"), None);
	}
}
