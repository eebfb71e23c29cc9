//! SOCKS5 front-end (RFC 1928): no-auth only, CONNECT only. Every
//! accepted target must be an I2P name and pass the traffic policy; the
//! connection is then spliced onto a client tunnel from the tunnel
//! manager. IPv4 targets are mapped back to names through the DNS
//! responder's synthetic-address cache.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};

use crate::addr;
use crate::dns::NameCache;
use crate::error::{Error, Result};
use crate::filter::TrafficFilter;
use crate::forward::splice;
use crate::session::{TunnelConfig, TunnelKind, TunnelManager};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_RULESET: u8 = 0x02;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_COMMAND_UNSUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_UNSUPPORTED: u8 = 0x08;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Synthetic container id owning every proxy-created client tunnel, so
/// all SOCKS traffic shares one primary session.
const PROXY_CONTAINER: &str = "proxy-session";

pub struct SocksProxy {
	bind: SocketAddr,
	tunnels: Arc<TunnelManager>,
	filter: Arc<TrafficFilter>,
	names: Arc<NameCache>,
	running: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl SocksProxy {
	pub fn new(
		bind: SocketAddr,
		tunnels: Arc<TunnelManager>,
		filter: Arc<TrafficFilter>,
		names: Arc<NameCache>,
	) -> SocksProxy {
		SocksProxy {
			bind,
			tunnels,
			filter,
			names,
			running: Arc::new(AtomicBool::new(false)),
			handle: None,
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	pub fn start(&mut self) -> Result<()> {
		let listener = TcpListener::bind(self.bind)?;
		listener.set_nonblocking(true)?;
		info!("socks5 front-end listening on {}", self.bind);

		self.running.store(true, Ordering::SeqCst);
		let running = self.running.clone();
		let tunnels = self.tunnels.clone();
		let filter = self.filter.clone();
		let names = self.names.clone();
		self.handle = Some(thread::spawn(move || {
			while running.load(Ordering::SeqCst) {
				match listener.accept() {
					Ok((stream, peer)) => {
						let tunnels = tunnels.clone();
						let filter = filter.clone();
						let names = names.clone();
						thread::spawn(move || {
							stream.set_nonblocking(false).ok();
							if let Err(e) =
								handle_client(stream, peer, &tunnels, &filter, &names)
							{
								debug!("socks client {peer}: {e}");
							}
						});
					}
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						thread::sleep(POLL_INTERVAL);
					}
					Err(e) => {
						warn!("socks accept failed: {e}");
						thread::sleep(POLL_INTERVAL);
					}
				}
			}
		}));
		Ok(())
	}

	pub fn stop(&mut self) {
		self.running.store(false, Ordering::SeqCst);
		if let Some(handle) = self.handle.take() {
			if handle.join().is_err() {
				warn!("socks thread panicked during shutdown");
			}
		}
	}
}

fn reply(stream: &mut TcpStream, code: u8) {
	// BND.ADDR/BND.PORT are zeroed; nothing dials us back
	let msg = [SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
	let _ = stream.write_all(&msg);
}

fn handle_client(
	mut stream: TcpStream,
	peer: SocketAddr,
	tunnels: &TunnelManager,
	filter: &TrafficFilter,
	names: &NameCache,
) -> Result<()> {
	stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
	stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;

	// method negotiation
	let mut head = [0u8; 2];
	stream.read_exact(&mut head)?;
	if head[0] != SOCKS_VERSION {
		return Err(Error::SocksProtocol(format!(
			"unsupported version {}",
			head[0]
		)));
	}
	let mut methods = vec![0u8; head[1] as usize];
	stream.read_exact(&mut methods)?;
	if !methods.contains(&METHOD_NO_AUTH) {
		let _ = stream.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE]);
		return Err(Error::SocksProtocol(
			"no acceptable authentication method".to_string(),
		));
	}
	stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])?;

	// request
	let mut req = [0u8; 4];
	stream.read_exact(&mut req)?;
	if req[0] != SOCKS_VERSION {
		return Err(Error::SocksProtocol("bad request version".to_string()));
	}
	if req[1] != CMD_CONNECT {
		reply(&mut stream, REPLY_COMMAND_UNSUPPORTED);
		return Err(Error::SocksProtocol(format!("unsupported command {}", req[1])));
	}

	let host = match req[3] {
		ATYP_IPV4 => {
			let mut octets = [0u8; 4];
			stream.read_exact(&mut octets)?;
			let ip = Ipv4Addr::from(octets);
			match names.lookup(ip) {
				Some(name) => name,
				None => {
					// not one of our synthetic addresses, so not I2P
					reply(&mut stream, REPLY_RULESET);
					return Err(Error::SocksProtocol(format!(
						"connect to unknown address {ip}"
					)));
				}
			}
		}
		ATYP_DOMAIN => {
			let mut len = [0u8; 1];
			stream.read_exact(&mut len)?;
			let mut name = vec![0u8; len[0] as usize];
			stream.read_exact(&mut name)?;
			String::from_utf8_lossy(&name).to_string()
		}
		ATYP_IPV6 => {
			let mut skip = [0u8; 16];
			stream.read_exact(&mut skip)?;
			reply(&mut stream, REPLY_ADDRESS_UNSUPPORTED);
			return Err(Error::SocksProtocol(
				"IPv6 address type unsupported".to_string(),
			));
		}
		other => {
			reply(&mut stream, REPLY_ADDRESS_UNSUPPORTED);
			return Err(Error::SocksProtocol(format!("unknown address type {other}")));
		}
	};
	let mut port_buf = [0u8; 2];
	stream.read_exact(&mut port_buf)?;
	let port = BigEndian::read_u16(&port_buf);

	let host = host.trim_end_matches('.').to_ascii_lowercase();
	if !addr::is_i2p_hostname(&host) {
		reply(&mut stream, REPLY_RULESET);
		return Err(Error::SocksProtocol(format!("non-I2P target {host}")));
	}

	let target = format!("{host}:{port}");
	let decision = filter.should_allow_from(&target, "tcp", &peer.to_string());
	if !decision.allowed() {
		reply(&mut stream, REPLY_RULESET);
		debug!("socks target {target} denied: {}", decision.reason);
		return Ok(());
	}

	let tunnel_name = format!("client-{host}-{port}");
	let tunnel = match tunnels.get_tunnel(&tunnel_name) {
		Some(tunnel) => tunnel,
		None => {
			let config = TunnelConfig {
				name: tunnel_name.clone(),
				container_id: PROXY_CONTAINER.to_string(),
				kind: TunnelKind::Client,
				local_host: String::new(),
				local_port: port.max(1),
				destination: Some(host.clone()),
				options: None,
			};
			match tunnels.create_tunnel(config) {
				Ok(tunnel) => tunnel,
				// lost a race with another connection to the same target
				Err(Error::DuplicateTunnel(_)) => match tunnels.get_tunnel(&tunnel_name) {
					Some(tunnel) => tunnel,
					None => {
						reply(&mut stream, REPLY_HOST_UNREACHABLE);
						return Err(Error::TunnelCreateFailed(tunnel_name));
					}
				},
				Err(e) => {
					reply(&mut stream, REPLY_HOST_UNREACHABLE);
					return Err(e);
				}
			}
		}
	};

	let upstream = match tunnel.open_stream(DIAL_TIMEOUT) {
		Ok(upstream) => upstream,
		Err(e) => {
			reply(&mut stream, REPLY_HOST_UNREACHABLE);
			return Err(e);
		}
	};

	reply(&mut stream, REPLY_SUCCESS);
	debug!("socks {peer} -> {target}");

	// the handshake deadline does not apply to the data phase
	stream.set_read_timeout(None)?;
	stream.set_write_timeout(None)?;
	upstream.set_read_timeout(None)?;
	upstream.set_write_timeout(None)?;

	let bytes = splice(stream, upstream);
	filter.add_bytes(bytes);
	debug!("socks {peer} -> {target} closed after {bytes} bytes");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{FilterConfig, SamConfig, TunnelOptions};

	fn start_proxy(
		filter_cfg: FilterConfig,
	) -> (SocksProxy, SocketAddr, Arc<TrafficFilter>) {
		let tunnels = Arc::new(TunnelManager::new(
			&SamConfig::default(),
			TunnelOptions::default(),
		));
		let filter = Arc::new(TrafficFilter::new(filter_cfg));
		let names = Arc::new(NameCache::new());
		// grab an ephemeral port first
		let probe = TcpListener::bind("127.0.0.1:0").unwrap();
		let bind = probe.local_addr().unwrap();
		drop(probe);
		let mut proxy = SocksProxy::new(bind, tunnels, filter.clone(), names);
		proxy.start().unwrap();
		(proxy, bind, filter)
	}

	fn negotiate(bind: SocketAddr) -> TcpStream {
		let mut stream = TcpStream::connect(bind).unwrap();
		stream
			.set_read_timeout(Some(Duration::from_secs(5)))
			.unwrap();
		stream.write_all(&[5, 1, 0]).unwrap();
		let mut resp = [0u8; 2];
		stream.read_exact(&mut resp).unwrap();
		assert_eq!(resp, [5, 0]);
		stream
	}

	fn connect_domain(stream: &mut TcpStream, host: &str, port: u16) -> u8 {
		let mut req = vec![5, CMD_CONNECT, 0, ATYP_DOMAIN, host.len() as u8];
		req.extend_from_slice(host.as_bytes());
		req.extend_from_slice(&port.to_be_bytes());
		stream.write_all(&req).unwrap();
		let mut resp = [0u8; 10];
		stream.read_exact(&mut resp).unwrap();
		resp[1]
	}

	#[test]
	fn non_i2p_targets_get_ruleset_reply() {
		let (mut proxy, bind, _) = start_proxy(FilterConfig::default());
		let mut stream = negotiate(bind);
		assert_eq!(connect_domain(&mut stream, "example.com", 80), REPLY_RULESET);
		proxy.stop();
	}

	#[test]
	fn ipv6_targets_are_rejected() {
		let (mut proxy, bind, _) = start_proxy(FilterConfig::default());
		let mut stream = negotiate(bind);
		let mut req = vec![5, CMD_CONNECT, 0, ATYP_IPV6];
		req.extend_from_slice(&[0u8; 16]);
		req.extend_from_slice(&80u16.to_be_bytes());
		stream.write_all(&req).unwrap();
		let mut resp = [0u8; 10];
		stream.read_exact(&mut resp).unwrap();
		assert_eq!(resp[1], REPLY_ADDRESS_UNSUPPORTED);
		proxy.stop();
	}

	#[test]
	fn unknown_synthetic_address_is_refused() {
		let (mut proxy, bind, _) = start_proxy(FilterConfig::default());
		let mut stream = negotiate(bind);
		let mut req = vec![5, CMD_CONNECT, 0, ATYP_IPV4, 198, 18, 1, 1];
		req.extend_from_slice(&80u16.to_be_bytes());
		stream.write_all(&req).unwrap();
		let mut resp = [0u8; 10];
		stream.read_exact(&mut resp).unwrap();
		assert_eq!(resp[1], REPLY_RULESET);
		proxy.stop();
	}

	#[test]
	fn blocklisted_targets_are_denied() {
		let mut cfg = FilterConfig::default();
		cfg.enable_blocklist = true;
		let (mut proxy, bind, filter) = start_proxy(cfg);
		filter.add_block("blocked.i2p").unwrap();
		let mut stream = negotiate(bind);
		assert_eq!(
			connect_domain(&mut stream, "blocked.i2p", 80),
			REPLY_RULESET
		);
		assert_eq!(filter.stats().i2p_blocked, 1);
		proxy.stop();
	}

	#[test]
	fn auth_required_clients_are_turned_away() {
		let (mut proxy, bind, _) = start_proxy(FilterConfig::default());
		let mut stream = TcpStream::connect(bind).unwrap();
		stream
			.set_read_timeout(Some(Duration::from_secs(5)))
			.unwrap();
		// only username/password offered
		stream.write_all(&[5, 1, 2]).unwrap();
		let mut resp = [0u8; 2];
		stream.read_exact(&mut resp).unwrap();
		assert_eq!(resp, [5, METHOD_NONE_ACCEPTABLE]);
		proxy.stop();
	}
}
