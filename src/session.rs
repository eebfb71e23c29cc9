//! "One SAM connection per container" isolation. The manager owns a
//! registry of primary sessions keyed by container id and a registry of
//! named stream sub-sessions (tunnels) opened under them. Creation paths
//! propagate errors; close paths log and continue.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};

use crate::addr;
use crate::config::{SamConfig, TunnelOptions};
use crate::error::{Error, Result};
use crate::sam::{self, DestinationKeys, PrimarySession, SamAuth, SamConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
	Client,
	Server,
}

impl TunnelKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Client => "client",
			Self::Server => "server",
		}
	}
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
	pub name: String,
	pub container_id: String,
	pub kind: TunnelKind,
	/// defaults to 127.0.0.1
	pub local_host: String,
	pub local_port: u16,
	/// remote destination, required for client tunnels
	pub destination: Option<String>,
	pub options: Option<TunnelOptions>,
}

impl TunnelConfig {
	fn validated(mut self) -> Result<TunnelConfig> {
		if self.name.trim().is_empty() {
			return Err(Error::InvalidTunnel("tunnel name must not be empty".to_string()));
		}
		if self.container_id.trim().is_empty() {
			return Err(Error::InvalidTunnel(
				"container id must not be empty".to_string(),
			));
		}
		if self.local_port == 0 {
			return Err(Error::InvalidTunnel("port must be in 1..65535".to_string()));
		}
		if self.local_host.trim().is_empty() {
			self.local_host = "127.0.0.1".to_string();
		}
		if self.kind == TunnelKind::Client
			&& self.destination.as_deref().map_or(true, str::is_empty)
		{
			return Err(Error::InvalidTunnel(
				"client tunnels need a destination".to_string(),
			));
		}
		Ok(self)
	}
}

/// The per-container SAM state: one control connection, one primary
/// session, one freshly minted keypair.
#[derive(Debug)]
pub struct ContainerSession {
	pub container_id: String,
	pub session_id: String,
	pub keys: DestinationKeys,
	/// full base64 destination shared by every sub-session
	pub destination: String,
	pub options: String,
	sam_addr: SocketAddr,
	auth: SamAuth,
	primary: Mutex<PrimarySession>,
}

impl ContainerSession {
	pub fn b32_address(&self) -> Result<String> {
		addr::b32_address(&self.destination)
	}

	pub fn sam_api(&self) -> SocketAddr {
		self.sam_addr
	}
}

/// A live stream sub-session. Client tunnels dial out through the SAM
/// bridge; server tunnels hold the STREAM FORWARD control connection that
/// keeps inbound delivery to the container alive.
#[derive(Debug)]
pub struct Tunnel {
	pub name: String,
	pub container_id: String,
	pub kind: TunnelKind,
	pub subsession_id: String,
	pub local_host: String,
	pub local_port: u16,
	pub destination: Option<String>,
	session: Arc<ContainerSession>,
	forward: Mutex<Option<SamConnection>>,
}

impl Tunnel {
	/// Dials the tunnel's remote destination, returning the data pipe.
	/// Only valid on client tunnels; server tunnels accept, they do not
	/// dial.
	pub fn open_stream(&self, timeout: Duration) -> Result<TcpStream> {
		match self.kind {
			TunnelKind::Client => {
				let dest = self
					.destination
					.as_deref()
					.ok_or_else(|| Error::InvalidTunnel("tunnel has no destination".to_string()))?;
				sam::open_stream(
					self.session.sam_api(),
					&self.session.auth,
					&self.subsession_id,
					dest,
					timeout,
				)
			}
			TunnelKind::Server => Err(Error::InvalidTunnel(
				"cannot dial through a server tunnel".to_string(),
			)),
		}
	}

	/// The address this tunnel publishes: the primary session's `.b32.i2p`
	/// name for servers, the configured remote for clients.
	pub fn published_destination(&self) -> Result<String> {
		match self.kind {
			TunnelKind::Server => self.session.b32_address(),
			TunnelKind::Client => self
				.destination
				.clone()
				.ok_or_else(|| Error::InvalidTunnel("tunnel has no destination".to_string())),
		}
	}

	fn close(&self) {
		if let Some(forward) = self.forward.lock().unwrap().take() {
			if let Err(e) = forward.shutdown() {
				debug!("closing forward socket for {}: {e}", self.name);
			}
		}
		let mut primary = self.session.primary.lock().unwrap();
		if let Err(e) = primary.remove_subsession(&self.subsession_id) {
			warn!("removing sub-session {}: {e}", self.subsession_id);
		}
	}
}

fn sanitize_id(raw: &str) -> String {
	raw.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
		.collect()
}

pub struct TunnelManager {
	sam_addr: String,
	auth: SamAuth,
	timeout: Duration,
	defaults: TunnelOptions,
	sessions: DashMap<String, Arc<ContainerSession>>,
	tunnels: DashMap<String, Arc<Tunnel>>,
	// serialises session and tunnel creation; lookups stay lock-free
	create_lock: Mutex<()>,
	counter: AtomicU64,
}

impl TunnelManager {
	pub fn new(sam: &SamConfig, defaults: TunnelOptions) -> TunnelManager {
		TunnelManager {
			sam_addr: sam.address(),
			auth: SamAuth {
				username: sam.username.clone(),
				password: sam.password.clone(),
			},
			timeout: Duration::from_secs(sam.timeout_secs),
			defaults,
			sessions: DashMap::new(),
			tunnels: DashMap::new(),
			create_lock: Mutex::new(()),
			counter: AtomicU64::new(0),
		}
	}

	pub fn sam_timeout(&self) -> Duration {
		self.timeout
	}

	/// Returns the container's primary session, creating it on first use.
	/// Repeated calls return the same `Arc` until the session is
	/// destroyed.
	pub fn get_or_create_session(&self, container_id: &str) -> Result<Arc<ContainerSession>> {
		if container_id.trim().is_empty() {
			return Err(Error::InvalidTunnel(
				"container id must not be empty".to_string(),
			));
		}
		if let Some(session) = self.sessions.get(container_id) {
			return Ok(session.clone());
		}

		let _guard = self.create_lock.lock().unwrap();
		if let Some(session) = self.sessions.get(container_id) {
			return Ok(session.clone());
		}

		let mut sam =
			SamConnection::connect_probed(self.sam_addr.as_str(), self.timeout, &self.auth)?;
		let keys = sam.generate_destination()?;
		let seq = self.counter.fetch_add(1, Ordering::SeqCst);
		let session_id = format!("cont_{}_{}", sanitize_id(container_id), seq);
		let options = self.defaults.primary_defaults().to_sam_options();
		let primary = PrimarySession::create(sam, &session_id, &keys, &options)?;

		let session = Arc::new(ContainerSession {
			container_id: container_id.to_string(),
			session_id,
			destination: primary.destination.clone(),
			keys,
			options,
			sam_addr: primary.sam_api(),
			auth: self.auth.clone(),
			primary: Mutex::new(primary),
		});
		self.sessions
			.insert(container_id.to_string(), session.clone());
		info!(
			"created primary session {} for container {}",
			session.session_id, container_id
		);
		Ok(session)
	}

	pub fn create_tunnel(&self, config: TunnelConfig) -> Result<Arc<Tunnel>> {
		let config = config.validated()?;
		if self.tunnels.contains_key(&config.name) {
			return Err(Error::DuplicateTunnel(config.name));
		}

		let session = self.get_or_create_session(&config.container_id)?;
		let _guard = self.create_lock.lock().unwrap();
		if self.tunnels.contains_key(&config.name) {
			return Err(Error::DuplicateTunnel(config.name));
		}

		let subsession_id = format!("{}-{}", sanitize_id(&config.name), config.kind.as_str());
		let options = config
			.options
			.as_ref()
			.map(|o| o.overlay(&self.defaults))
			.unwrap_or_else(|| self.defaults.clone());
		let extra = match config.kind {
			TunnelKind::Client => options.to_sam_options(),
			TunnelKind::Server => format!(
				"LISTEN_PORT={} {}",
				config.local_port,
				options.to_sam_options()
			),
		};

		{
			let mut primary = session.primary.lock().unwrap();
			primary
				.add_stream_subsession(&subsession_id, &extra)
				.map_err(|e| Error::TunnelCreateFailed(e.to_string()))?;
		}

		let forward = match config.kind {
			TunnelKind::Server => {
				match sam::stream_forward(
					session.sam_api(),
					&self.auth,
					&subsession_id,
					&config.local_host,
					config.local_port,
					self.timeout,
				) {
					Ok(conn) => Some(conn),
					Err(e) => {
						let mut primary = session.primary.lock().unwrap();
						if let Err(re) = primary.remove_subsession(&subsession_id) {
							warn!("undoing sub-session {subsession_id}: {re}");
						}
						return Err(Error::TunnelCreateFailed(e.to_string()));
					}
				}
			}
			TunnelKind::Client => None,
		};

		let tunnel = Arc::new(Tunnel {
			name: config.name.clone(),
			container_id: config.container_id,
			kind: config.kind,
			subsession_id,
			local_host: config.local_host,
			local_port: config.local_port,
			destination: config.destination,
			session,
			forward: Mutex::new(forward),
		});
		self.tunnels.insert(config.name.clone(), tunnel.clone());
		info!(
			"created {} tunnel {} ({})",
			tunnel.kind.as_str(),
			tunnel.name,
			tunnel.subsession_id
		);
		Ok(tunnel)
	}

	pub fn get_tunnel(&self, name: &str) -> Option<Arc<Tunnel>> {
		self.tunnels.get(name).map(|t| t.clone())
	}

	/// Closes the sub-session and forgets the tunnel. The owning primary
	/// session stays open; its lifetime is the container's.
	pub fn destroy_tunnel(&self, name: &str) -> Result<()> {
		let (_, tunnel) = self
			.tunnels
			.remove(name)
			.ok_or_else(|| Error::NoSuchTunnel(name.to_string()))?;
		tunnel.close();
		info!("destroyed tunnel {name}");
		Ok(())
	}

	/// Tears down every tunnel of the container, then the primary session
	/// and its SAM connection. Succeeds for unknown containers.
	pub fn destroy_container_session(&self, container_id: &str) -> Result<()> {
		let names: Vec<String> = self
			.tunnels
			.iter()
			.filter(|t| t.container_id == container_id)
			.map(|t| t.name.clone())
			.collect();
		for name in names {
			if let Err(e) = self.destroy_tunnel(&name) {
				warn!("destroying tunnel {name}: {e}");
			}
		}

		if let Some((_, session)) = self.sessions.remove(container_id) {
			let primary = session.primary.lock().unwrap();
			if let Err(e) = primary.close() {
				warn!(
					"closing primary session {}: {e}",
					session.session_id
				);
			}
			info!("destroyed container session {container_id}");
		}
		Ok(())
	}

	pub fn list_sessions(&self) -> Vec<String> {
		self.sessions.iter().map(|s| s.key().clone()).collect()
	}

	pub fn shutdown(&self) {
		for container_id in self.list_sessions() {
			if let Err(e) = self.destroy_container_session(&container_id) {
				warn!("shutting down session {container_id}: {e}");
			}
		}
	}
}
