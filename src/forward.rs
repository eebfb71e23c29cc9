//! Local forwarders for IP-exposed container ports: a TCP
//! accept-and-splice listener and a UDP datagram relay with a NAT-style
//! client table. Also home of the byte splice shared with the SOCKS
//! front-end.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// UDP has no connection to close; idle peers are evicted instead.
const UDP_NAT_IDLE: Duration = Duration::from_secs(60);

fn copy_half(mut from: TcpStream, mut to: TcpStream) -> u64 {
	let mut buf = [0u8; 16 * 1024];
	let mut total: u64 = 0;
	loop {
		match from.read(&mut buf) {
			Ok(0) => break,
			Ok(n) => {
				if to.write_all(&buf[..n]).is_err() {
					break;
				}
				total += n as u64;
			}
			Err(_) => break,
		}
	}
	// either side closing tears down both directions
	let _ = to.shutdown(Shutdown::Both);
	let _ = from.shutdown(Shutdown::Both);
	total
}

/// Splices bytes between two sockets until either side closes; returns
/// the total bytes moved in both directions.
pub fn splice(client: TcpStream, upstream: TcpStream) -> u64 {
	let (c_read, u_write) = match (client.try_clone(), upstream.try_clone()) {
		(Ok(c), Ok(u)) => (c, u),
		_ => return 0,
	};
	let up = thread::spawn(move || copy_half(c_read, u_write));
	let down = copy_half(upstream, client);
	down + up.join().unwrap_or(0)
}

/// Accepts on `listen` and splices every connection to `target`.
pub struct TcpForwarder {
	listen: SocketAddr,
	target: SocketAddr,
	running: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl TcpForwarder {
	pub fn new(listen: SocketAddr, target: SocketAddr) -> TcpForwarder {
		TcpForwarder {
			listen,
			target,
			running: Arc::new(AtomicBool::new(false)),
			handle: None,
		}
	}

	pub fn destination(&self) -> String {
		self.listen.to_string()
	}

	pub fn start(&mut self) -> Result<()> {
		let listener = TcpListener::bind(self.listen)?;
		listener.set_nonblocking(true)?;
		info!("tcp forwarder {} -> {}", self.listen, self.target);

		self.running.store(true, Ordering::SeqCst);
		let running = self.running.clone();
		let target = self.target;
		self.handle = Some(thread::spawn(move || {
			while running.load(Ordering::SeqCst) {
				match listener.accept() {
					Ok((stream, peer)) => {
						thread::spawn(move || {
							stream.set_nonblocking(false).ok();
							match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
								Ok(upstream) => {
									let n = splice(stream, upstream);
									debug!("tcp forward for {peer} moved {n} bytes");
								}
								Err(e) => {
									warn!("tcp forward to {target} failed: {e}");
								}
							}
						});
					}
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
						thread::sleep(POLL_INTERVAL);
					}
					Err(e) => {
						warn!("tcp forwarder accept failed: {e}");
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
				warn!("tcp forwarder thread panicked during shutdown");
			}
		}
	}
}

struct NatEntry {
	upstream: Arc<UdpSocket>,
	last_seen: Arc<Mutex<Instant>>,
	alive: Arc<AtomicBool>,
}

/// Relays datagrams from `listen` to `target`, answering each client from
/// the port it first spoke to. Entries idle for a minute are evicted.
pub struct UdpForwarder {
	listen: SocketAddr,
	target: SocketAddr,
	running: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl UdpForwarder {
	pub fn new(listen: SocketAddr, target: SocketAddr) -> UdpForwarder {
		UdpForwarder {
			listen,
			target,
			running: Arc::new(AtomicBool::new(false)),
			handle: None,
		}
	}

	pub fn destination(&self) -> String {
		self.listen.to_string()
	}

	pub fn start(&mut self) -> Result<()> {
		let socket = UdpSocket::bind(self.listen)?;
		socket.set_read_timeout(Some(Duration::from_secs(1)))?;
		info!("udp forwarder {} -> {}", self.listen, self.target);

		self.running.store(true, Ordering::SeqCst);
		let running = self.running.clone();
		let target = self.target;
		self.handle = Some(thread::spawn(move || {
			let mut table: HashMap<SocketAddr, NatEntry> = HashMap::new();
			let mut buf = [0u8; 64 * 1024];
			while running.load(Ordering::SeqCst) {
				table.retain(|peer, entry| {
					let stale = entry.last_seen.lock().unwrap().elapsed() > UDP_NAT_IDLE;
					if stale {
						debug!("evicting idle udp peer {peer}");
						entry.alive.store(false, Ordering::SeqCst);
					}
					!stale
				});

				let (n, peer) = match socket.recv_from(&mut buf) {
					Ok(recv) => recv,
					Err(e)
						if e.kind() == std::io::ErrorKind::WouldBlock
							|| e.kind() == std::io::ErrorKind::TimedOut =>
					{
						continue;
					}
					Err(e) => {
						warn!("udp forwarder receive failed: {e}");
						continue;
					}
				};

				if !table.contains_key(&peer) {
					match nat_entry(&socket, peer, target, running.clone()) {
						Ok(entry) => {
							table.insert(peer, entry);
						}
						Err(e) => {
							warn!("udp nat entry for {peer} failed: {e}");
							continue;
						}
					}
				}
				let entry = &table[&peer];
				*entry.last_seen.lock().unwrap() = Instant::now();
				if let Err(e) = entry.upstream.send(&buf[..n]) {
					warn!("udp forward to {target} failed: {e}");
				}
			}
			for entry in table.values() {
				entry.alive.store(false, Ordering::SeqCst);
			}
		}));
		Ok(())
	}

	pub fn stop(&mut self) {
		self.running.store(false, Ordering::SeqCst);
		if let Some(handle) = self.handle.take() {
			if handle.join().is_err() {
				warn!("udp forwarder thread panicked during shutdown");
			}
		}
	}
}

fn nat_entry(
	socket: &UdpSocket,
	peer: SocketAddr,
	target: SocketAddr,
	running: Arc<AtomicBool>,
) -> std::io::Result<NatEntry> {
	let upstream = Arc::new(UdpSocket::bind(("0.0.0.0", 0))?);
	upstream.connect(target)?;
	upstream.set_read_timeout(Some(Duration::from_secs(1)))?;

	let alive = Arc::new(AtomicBool::new(true));
	let last_seen = Arc::new(Mutex::new(Instant::now()));

	let back = socket.try_clone()?;
	let reader = upstream.clone();
	let reader_alive = alive.clone();
	let reader_seen = last_seen.clone();
	thread::spawn(move || {
		let mut buf = [0u8; 64 * 1024];
		while reader_alive.load(Ordering::SeqCst) && running.load(Ordering::SeqCst) {
			match reader.recv(&mut buf) {
				Ok(n) => {
					*reader_seen.lock().unwrap() = Instant::now();
					if back.send_to(&buf[..n], peer).is_err() {
						break;
					}
				}
				Err(e)
					if e.kind() == std::io::ErrorKind::WouldBlock
						|| e.kind() == std::io::ErrorKind::TimedOut => {}
				Err(_) => break,
			}
		}
	});

	Ok(NatEntry {
		upstream,
		last_seen,
		alive,
	})
}
