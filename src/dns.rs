//! Authoritative DNS responder for `.i2p` names. Answers mint stable
//! synthetic IPv4 addresses inside 198.18.0.0/15 (the RFC 2544 benchmark
//! range) so unmodified applications can resolve and connect; the SOCKS
//! front-end maps those addresses back to names via the shared cache.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use dashmap::DashMap;
use log::{debug, info, warn};

use crate::addr;
use crate::error::Result;

const DNS_TTL: u32 = 300;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

const QTYPE_A: u16 = 1;
const QTYPE_CNAME: u16 = 5;
const QTYPE_AAAA: u16 = 28;

const RCODE_NXDOMAIN: u16 = 3;
const RCODE_NOTIMP: u16 = 4;

/// 198.18.0.0
const SYNTHETIC_BASE: u32 = 0xC612_0000;
/// host span of a /15
const SYNTHETIC_SPAN: u32 = 1 << 17;

/// Reverse mapping from minted addresses back to the names they answer
/// for, shared with the SOCKS front-end.
#[derive(Default)]
pub struct NameCache {
	map: DashMap<Ipv4Addr, String>,
}

impl NameCache {
	pub fn new() -> NameCache {
		NameCache::default()
	}

	pub fn record(&self, ip: Ipv4Addr, name: &str) {
		self.map.insert(ip, name.to_string());
	}

	pub fn lookup(&self, ip: Ipv4Addr) -> Option<String> {
		self.map.get(&ip).map(|v| v.clone())
	}
}

/// DJB2-style hash of the lowercased name, mapped into 198.18.0.0/15.
/// The same name always yields the same address.
pub fn synthetic_ip(name: &str) -> Ipv4Addr {
	let name = name.trim_end_matches('.').to_ascii_lowercase();
	let mut hash: u32 = 5381;
	for b in name.bytes() {
		hash = hash.wrapping_mul(33).wrapping_add(u32::from(b));
	}
	Ipv4Addr::from(SYNTHETIC_BASE + (hash % SYNTHETIC_SPAN))
}

struct Question {
	name: String,
	qtype: u16,
	/// raw question section, echoed back verbatim
	raw: Vec<u8>,
}

fn parse_query(buf: &[u8]) -> Option<(u16, u16, Question)> {
	if buf.len() < 12 {
		return None;
	}
	let id = BigEndian::read_u16(&buf[0..2]);
	let flags = BigEndian::read_u16(&buf[2..4]);
	let qdcount = BigEndian::read_u16(&buf[4..6]);
	if qdcount == 0 {
		return None;
	}

	let mut pos = 12;
	let mut labels: Vec<String> = Vec::new();
	loop {
		let len = *buf.get(pos)? as usize;
		if len == 0 {
			pos += 1;
			break;
		}
		// no compression in a question we serve
		if len & 0xC0 != 0 {
			return None;
		}
		let label = buf.get(pos + 1..pos + 1 + len)?;
		labels.push(String::from_utf8_lossy(label).to_string());
		pos += 1 + len;
	}
	let qtype = BigEndian::read_u16(buf.get(pos..pos + 2)?);
	let raw = buf.get(12..pos + 4)?.to_vec();

	Some((
		id,
		flags,
		Question {
			name: labels.join("."),
			qtype,
			raw,
		},
	))
}

fn build_response(
	id: u16,
	query_flags: u16,
	question: &Question,
	rcode: u16,
	answer: Option<Ipv4Addr>,
) -> Vec<u8> {
	let mut out = Vec::with_capacity(12 + question.raw.len() + 16);
	let mut header = [0u8; 12];
	BigEndian::write_u16(&mut header[0..2], id);
	// QR + AA + RA, RD copied from the query
	let flags = 0x8480 | (query_flags & 0x0100) | rcode;
	BigEndian::write_u16(&mut header[2..4], flags);
	BigEndian::write_u16(&mut header[4..6], 1);
	BigEndian::write_u16(&mut header[6..8], u16::from(answer.is_some()));
	out.extend_from_slice(&header);
	out.extend_from_slice(&question.raw);

	if let Some(ip) = answer {
		let mut rr = [0u8; 16];
		// pointer to the question name at offset 12
		BigEndian::write_u16(&mut rr[0..2], 0xC00C);
		BigEndian::write_u16(&mut rr[2..4], QTYPE_A);
		BigEndian::write_u16(&mut rr[4..6], 1);
		BigEndian::write_u32(&mut rr[6..10], DNS_TTL);
		BigEndian::write_u16(&mut rr[10..12], 4);
		rr[12..16].copy_from_slice(&ip.octets());
		out.extend_from_slice(&rr);
	}
	out
}

/// Answers one wire-format query, or None when the packet is unparseable.
pub fn handle_query(buf: &[u8], cache: &NameCache) -> Option<Vec<u8>> {
	let (id, flags, question) = parse_query(buf)?;
	let host = question.name.trim_end_matches('.').to_ascii_lowercase();

	let response = match question.qtype {
		QTYPE_A if addr::is_i2p_hostname(&host) => {
			let ip = synthetic_ip(&host);
			cache.record(ip, &host);
			debug!("dns: {host} -> {ip}");
			build_response(id, flags, &question, 0, Some(ip))
		}
		QTYPE_AAAA | QTYPE_CNAME if addr::is_i2p_hostname(&host) => {
			// resolvable name, nothing of that type to say
			build_response(id, flags, &question, 0, None)
		}
		QTYPE_A | QTYPE_AAAA | QTYPE_CNAME => {
			build_response(id, flags, &question, RCODE_NXDOMAIN, None)
		}
		_ => build_response(id, flags, &question, RCODE_NOTIMP, None),
	};
	Some(response)
}

/// UDP and TCP servers bound to the same address, one thread per
/// transport. `stop` cancels both and joins them.
pub struct DnsResponder {
	bind: SocketAddr,
	cache: Arc<NameCache>,
	running: Arc<AtomicBool>,
	handles: Vec<JoinHandle<()>>,
}

impl DnsResponder {
	pub fn new(bind: SocketAddr, cache: Arc<NameCache>) -> DnsResponder {
		DnsResponder {
			bind,
			cache,
			running: Arc::new(AtomicBool::new(false)),
			handles: Vec::new(),
		}
	}

	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::SeqCst)
	}

	pub fn start(&mut self) -> Result<()> {
		let udp = UdpSocket::bind(self.bind)?;
		udp.set_read_timeout(Some(Duration::from_secs(1)))?;
		let tcp = TcpListener::bind(self.bind)?;
		tcp.set_nonblocking(true)?;
		info!("dns responder listening on {} (udp+tcp)", self.bind);

		self.running.store(true, Ordering::SeqCst);

		let running = self.running.clone();
		let cache = self.cache.clone();
		self.handles.push(thread::spawn(move || {
			udp_loop(udp, running, cache);
		}));

		let running = self.running.clone();
		let cache = self.cache.clone();
		self.handles.push(thread::spawn(move || {
			tcp_loop(tcp, running, cache);
		}));
		Ok(())
	}

	pub fn stop(&mut self) {
		self.running.store(false, Ordering::SeqCst);
		for handle in self.handles.drain(..) {
			if handle.join().is_err() {
				warn!("dns server thread panicked during shutdown");
			}
		}
	}
}

fn udp_loop(socket: UdpSocket, running: Arc<AtomicBool>, cache: Arc<NameCache>) {
	let mut buf = [0u8; 512];
	while running.load(Ordering::SeqCst) {
		match socket.recv_from(&mut buf) {
			Ok((n, peer)) => {
				if let Some(response) = handle_query(&buf[..n], &cache) {
					if let Err(e) = socket.send_to(&response, peer) {
						warn!("dns udp send to {peer} failed: {e}");
					}
				}
			}
			Err(e)
				if e.kind() == std::io::ErrorKind::WouldBlock
					|| e.kind() == std::io::ErrorKind::TimedOut => {}
			Err(e) => {
				warn!("dns udp receive failed: {e}");
			}
		}
	}
}

fn tcp_loop(listener: TcpListener, running: Arc<AtomicBool>, cache: Arc<NameCache>) {
	while running.load(Ordering::SeqCst) {
		match listener.accept() {
			Ok((stream, _)) => {
				let cache = cache.clone();
				thread::spawn(move || {
					if let Err(e) = handle_tcp_query(stream, &cache) {
						debug!("dns tcp query failed: {e}");
					}
				});
			}
			Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
				thread::sleep(Duration::from_millis(200));
			}
			Err(e) => {
				warn!("dns tcp accept failed: {e}");
				thread::sleep(Duration::from_millis(200));
			}
		}
	}
}

fn handle_tcp_query(mut stream: TcpStream, cache: &NameCache) -> std::io::Result<()> {
	stream.set_read_timeout(Some(IO_TIMEOUT))?;
	stream.set_write_timeout(Some(IO_TIMEOUT))?;

	let mut len_buf = [0u8; 2];
	stream.read_exact(&mut len_buf)?;
	let len = BigEndian::read_u16(&len_buf) as usize;
	let mut msg = vec![0u8; len];
	stream.read_exact(&mut msg)?;

	if let Some(response) = handle_query(&msg, cache) {
		let mut out = Vec::with_capacity(2 + response.len());
		BigEndian::write_u16(&mut len_buf, response.len() as u16);
		out.extend_from_slice(&len_buf);
		out.extend_from_slice(&response);
		stream.write_all(&out)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	fn query(name: &str, qtype: u16) -> Vec<u8> {
		let mut out = vec![0u8; 12];
		BigEndian::write_u16(&mut out[0..2], 0x1234);
		BigEndian::write_u16(&mut out[2..4], 0x0100);
		BigEndian::write_u16(&mut out[4..6], 1);
		for label in name.trim_end_matches('.').split('.') {
			out.push(label.len() as u8);
			out.extend_from_slice(label.as_bytes());
		}
		out.push(0);
		let mut tail = [0u8; 4];
		BigEndian::write_u16(&mut tail[0..2], qtype);
		BigEndian::write_u16(&mut tail[2..4], 1);
		out.extend_from_slice(&tail);
		out
	}

	fn rcode(response: &[u8]) -> u16 {
		BigEndian::read_u16(&response[2..4]) & 0x000F
	}

	fn answer_ip(response: &[u8]) -> Option<Ipv4Addr> {
		if BigEndian::read_u16(&response[6..8]) == 0 {
			return None;
		}
		let rdata = &response[response.len() - 4..];
		Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
	}

	fn in_benchmark_range(ip: Ipv4Addr) -> bool {
		let v = u32::from(ip);
		(SYNTHETIC_BASE..SYNTHETIC_BASE + SYNTHETIC_SPAN).contains(&v)
	}

	#[test]
	fn deterministic_answers() {
		let cache = NameCache::new();
		let a = handle_query(&query("example.i2p.", QTYPE_A), &cache).unwrap();
		let b = handle_query(&query("example.i2p.", QTYPE_A), &cache).unwrap();
		assert_eq!(rcode(&a), 0);
		assert_eq!(answer_ip(&a), answer_ip(&b));

		let c = handle_query(&query("different.i2p.", QTYPE_A), &cache).unwrap();
		assert_ne!(answer_ip(&a), answer_ip(&c));

		for response in [&a, &c] {
			assert!(in_benchmark_range(answer_ip(response).unwrap()));
		}
	}

	#[test]
	fn case_and_dot_insensitive() {
		let cache = NameCache::new();
		let a = handle_query(&query("Example.I2P.", QTYPE_A), &cache).unwrap();
		let b = handle_query(&query("example.i2p", QTYPE_A), &cache).unwrap();
		assert_eq!(answer_ip(&a), answer_ip(&b));
	}

	#[test]
	fn non_i2p_names_get_nxdomain() {
		let cache = NameCache::new();
		let r = handle_query(&query("example.com.", QTYPE_A), &cache).unwrap();
		assert_eq!(rcode(&r), RCODE_NXDOMAIN);
		assert_eq!(answer_ip(&r), None);
	}

	#[test]
	fn aaaa_and_cname_are_empty_for_i2p() {
		let cache = NameCache::new();
		for qtype in [QTYPE_AAAA, QTYPE_CNAME] {
			let r = handle_query(&query("example.i2p.", qtype), &cache).unwrap();
			assert_eq!(rcode(&r), 0);
			assert_eq!(answer_ip(&r), None);
		}
	}

	#[test]
	fn unsupported_qtypes_are_notimp() {
		let cache = NameCache::new();
		// MX
		let r = handle_query(&query("example.i2p.", 15), &cache).unwrap();
		assert_eq!(rcode(&r), RCODE_NOTIMP);
	}

	#[test]
	fn answers_populate_the_reverse_cache() {
		let cache = NameCache::new();
		let r = handle_query(&query("example.i2p.", QTYPE_A), &cache).unwrap();
		let ip = answer_ip(&r).unwrap();
		assert_eq!(cache.lookup(ip).as_deref(), Some("example.i2p"));
	}

	#[test]
	fn synthetic_ips_match_expected_values() {
		assert_eq!(synthetic_ip("example.i2p"), Ipv4Addr::new(198, 18, 41, 106));
		assert_eq!(
			synthetic_ip("different.i2p"),
			Ipv4Addr::new(198, 19, 75, 181)
		);
	}

	#[test]
	fn garbage_is_ignored() {
		let cache = NameCache::new();
		assert!(handle_query(&[0u8; 3], &cache).is_none());
		assert!(handle_query(&[0xFFu8; 24], &cache).is_none());
	}
}
