//! SAM v3 control channel. One `SamConnection` wraps one TCP connection to
//! the bridge; a `PrimarySession` owns the connection that carries a
//! `STYLE=PRIMARY` session and its stream sub-sessions.

use std::collections::HashMap;
use std::io::prelude::*;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use nom::IResult;

use crate::addr;
use crate::error::{Error, Result, SamError};
use crate::parsers::{
	sam_dest_reply, sam_hello, sam_naming_reply, sam_session_status, sam_stream_status,
};

pub static DEFAULT_SAM_API: &str = "127.0.0.1:7656";

static SAM_MIN: &str = "3.0";
// SESSION ADD / PRIMARY style needs 3.3
static SAM_MAX: &str = "3.3";

/// Signature type requested on DEST GENERATE.
static SIGNATURE_TYPE: &str = "EdDSA_SHA512_Ed25519";

/// A freshly minted destination keypair. The secret half is only ever fed
/// back into SESSION CREATE; nothing is persisted across restarts.
#[derive(Clone, Debug)]
pub struct DestinationKeys {
	pub public: String,
	pub secret: String,
}

/// Optional HELLO credentials (SAM 3.2 USER/PASSWORD).
#[derive(Clone, Debug, Default)]
pub struct SamAuth {
	pub username: Option<String>,
	pub password: Option<String>,
}

impl SamAuth {
	fn hello_suffix(&self) -> String {
		match (&self.username, &self.password) {
			(Some(user), Some(password)) => {
				format!(" USER=\"{user}\" PASSWORD=\"{password}\"")
			}
			_ => String::new(),
		}
	}
}

#[derive(Debug)]
pub struct SamConnection {
	conn: TcpStream,
	auth: SamAuth,
}

fn verify_response<'a>(vec: &'a [(&str, &str)]) -> Result<HashMap<String, String>> {
	let map: HashMap<&str, &str> = vec.iter().copied().collect();
	let res = *map.get("RESULT").unwrap_or(&"OK");
	let msg = *map.get("MESSAGE").unwrap_or(&"");
	let err = match res {
		"OK" => {
			return Ok(map
				.iter()
				.map(|(k, v)| (k.to_string(), v.to_string()))
				.collect())
		}
		"CANT_REACH_PEER" => SamError::CantReachPeer(msg.to_string()),
		"KEY_NOT_FOUND" => SamError::KeyNotFound(msg.to_string()),
		"PEER_NOT_FOUND" => SamError::PeerNotFound(msg.to_string()),
		"DUPLICATED_DEST" => SamError::DuplicatedDest(msg.to_string()),
		"DUPLICATED_ID" => SamError::DuplicatedId(msg.to_string()),
		"INVALID_KEY" => SamError::InvalidKey(msg.to_string()),
		"INVALID_ID" => SamError::InvalidId(msg.to_string()),
		"TIMEOUT" => SamError::Timeout(msg.to_string()),
		"I2P_ERROR" => SamError::I2p(msg.to_string()),
		_ => SamError::InvalidMessage(msg.to_string()),
	};
	Err(err.into())
}

impl SamConnection {
	/// Opens a TCP connection to the bridge and runs the HELLO handshake.
	/// TCP failures map to `UnreachableSam`, handshake failures to
	/// `VersionUnknown`.
	pub fn connect<A: ToSocketAddrs + std::fmt::Display>(
		addr: A,
		timeout: Duration,
		auth: &SamAuth,
	) -> Result<SamConnection> {
		let display = addr.to_string();
		let sock_addr = addr
			.to_socket_addrs()
			.map_err(|e| Error::UnreachableSam(display.clone(), e.to_string()))?
			.next()
			.ok_or_else(|| Error::UnreachableSam(display.clone(), "no address".to_string()))?;
		let tcp_stream = TcpStream::connect_timeout(&sock_addr, timeout)
			.map_err(|e| Error::UnreachableSam(display.clone(), e.to_string()))?;
		tcp_stream.set_read_timeout(Some(timeout)).ok();
		tcp_stream.set_write_timeout(Some(timeout)).ok();

		let mut socket = SamConnection {
			conn: tcp_stream,
			auth: auth.clone(),
		};
		socket
			.handshake()
			.map_err(|e| Error::VersionUnknown(e.to_string()))?;

		Ok(socket)
	}

	/// Like `connect`, but additionally verifies that the bridge answers
	/// naming requests end to end. Any transport or parse failure on the
	/// probe maps to `ResolverUnavailable`; a negative lookup result is
	/// still a working resolver.
	pub fn connect_probed<A: ToSocketAddrs + std::fmt::Display>(
		addr: A,
		timeout: Duration,
		auth: &SamAuth,
	) -> Result<SamConnection> {
		let mut socket = Self::connect(addr, timeout, auth)?;
		match socket.naming_lookup("ME") {
			Ok(_) => Ok(socket),
			Err(Error::Sam(SamError::Io(e))) => Err(Error::ResolverUnavailable(e)),
			Err(Error::Sam(SamError::MessageParsing)) => {
				Err(Error::ResolverUnavailable("unparseable reply".to_string()))
			}
			// the bridge answered; lookup misses are fine outside a session
			Err(_) => Ok(socket),
		}
	}

	pub fn send<F>(&mut self, msg: String, reply_parser: F) -> Result<HashMap<String, String>>
	where
		F: Fn(&str) -> IResult<&str, Vec<(&str, &str)>>,
	{
		debug!("-> {}", msg.trim_end());
		self.conn
			.write_all(msg.as_bytes())
			.map_err(SamError::from)?;

		let mut reader = BufReader::new(&self.conn);
		let mut buffer = String::new();
		reader.read_line(&mut buffer).map_err(SamError::from)?;
		debug!("<- {}", buffer.trim_end());

		let pairs = reply_parser(&buffer).map_err(SamError::from)?.1;
		verify_response(&pairs)
	}

	fn handshake(&mut self) -> Result<HashMap<String, String>> {
		let hello_msg = format!(
			"HELLO VERSION MIN={SAM_MIN} MAX={SAM_MAX}{} \n",
			self.auth.hello_suffix()
		);
		self.send(hello_msg, sam_hello)
	}

	pub fn naming_lookup(&mut self, name: &str) -> Result<String> {
		let naming_lookup_msg = format!("NAMING LOOKUP NAME={name} \n");
		let ret = self.send(naming_lookup_msg, sam_naming_reply)?;
		ret.get("VALUE")
			.cloned()
			.ok_or_else(|| SamError::InvalidMessage("missing VALUE".to_string()).into())
	}

	pub fn generate_destination(&mut self) -> Result<DestinationKeys> {
		let dest_gen_msg = format!("DEST GENERATE SIGNATURE_TYPE={SIGNATURE_TYPE} \n");
		let ret = self.send(dest_gen_msg, sam_dest_reply)?;
		match (ret.get("PUB"), ret.get("PRIV")) {
			(Some(public), Some(secret)) => Ok(DestinationKeys {
				public: public.clone(),
				secret: secret.clone(),
			}),
			_ => Err(SamError::InvalidMessage("missing PUB/PRIV".to_string()).into()),
		}
	}

	pub fn peer_addr(&self) -> Result<SocketAddr> {
		self.conn.peer_addr().map_err(|e| e.into())
	}

	pub fn set_read_timeout(&self, duration: Option<Duration>) -> std::io::Result<()> {
		self.conn.set_read_timeout(duration)
	}

	pub fn set_write_timeout(&self, duration: Option<Duration>) -> std::io::Result<()> {
		self.conn.set_write_timeout(duration)
	}

	pub fn shutdown(&self) -> Result<()> {
		self.conn.shutdown(Shutdown::Both).map_err(|e| e.into())
	}

	/// Consumes the control connection, yielding the raw socket. Used after
	/// STREAM CONNECT when the connection becomes the data pipe.
	pub fn into_stream(self) -> TcpStream {
		self.conn
	}
}

/// A `STYLE=PRIMARY` session and the control connection that owns it.
/// Dropping or shutting down the connection destroys the session and every
/// sub-session registered under it.
#[derive(Debug)]
pub struct PrimarySession {
	sam: SamConnection,
	pub id: String,
	/// Full base64 destination, as reported by `NAMING LOOKUP NAME=ME`.
	pub destination: String,
	sam_addr: SocketAddr,
}

impl PrimarySession {
	pub fn create(
		mut sam: SamConnection,
		id: &str,
		keys: &DestinationKeys,
		options: &str,
	) -> Result<PrimarySession> {
		let create_session_msg = format!(
			"SESSION CREATE STYLE=PRIMARY ID={id} DESTINATION={destination} {options}\n",
			destination = keys.secret,
		);
		sam.send(create_session_msg, sam_session_status)?;

		let destination = sam.naming_lookup("ME")?;
		let sam_addr = sam.peer_addr()?;

		Ok(PrimarySession {
			sam,
			id: id.to_string(),
			destination,
			sam_addr,
		})
	}

	/// Registers a named STREAM sub-session. `extra` carries per-style
	/// parameters such as `LISTEN_PORT=80` for server sides.
	pub fn add_stream_subsession(&mut self, id: &str, extra: &str) -> Result<()> {
		let add_session_msg = format!("SESSION ADD STYLE=STREAM ID={id} {extra}\n");
		self.sam.send(add_session_msg, sam_session_status)?;
		Ok(())
	}

	pub fn remove_subsession(&mut self, id: &str) -> Result<()> {
		let remove_session_msg = format!("SESSION REMOVE ID={id}\n");
		self.sam.send(remove_session_msg, sam_session_status)?;
		Ok(())
	}

	pub fn sam_api(&self) -> SocketAddr {
		self.sam_addr
	}

	/// The `.b32.i2p` name all server sub-sessions of this session publish.
	pub fn b32_address(&self) -> Result<String> {
		addr::b32_address(&self.destination)
	}

	pub fn close(&self) -> Result<()> {
		self.sam.shutdown()
	}
}

/// Dials `destination` through the given stream sub-session. Opens a fresh
/// control connection, resolves the name, issues STREAM CONNECT and hands
/// back the socket as the data pipe.
pub fn open_stream(
	sam_addr: SocketAddr,
	auth: &SamAuth,
	session_id: &str,
	destination: &str,
	timeout: Duration,
) -> Result<TcpStream> {
	let mut sam = SamConnection::connect(sam_addr, timeout, auth)?;
	let dest = sam.naming_lookup(destination)?;

	let stream_msg = format!(
		"STREAM CONNECT ID={session_id} DESTINATION={dest} SILENT=false\n"
	);
	sam.send(stream_msg, sam_stream_status)?;

	Ok(sam.into_stream())
}

/// Asks the router to deliver inbound streams for a sub-session straight to
/// `host:port`. The returned connection must be kept open for as long as the
/// forward should stay active.
pub fn stream_forward(
	sam_addr: SocketAddr,
	auth: &SamAuth,
	session_id: &str,
	host: &str,
	port: u16,
	timeout: Duration,
) -> Result<SamConnection> {
	let mut sam = SamConnection::connect(sam_addr, timeout, auth)?;
	let forward_msg =
		format!("STREAM FORWARD ID={session_id} PORT={port} HOST={host} SILENT=true\n");
	sam.send(forward_msg, sam_stream_status)?;
	// the socket now only signals liveness; never time out on it
	sam.set_read_timeout(None).ok();
	Ok(sam)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn verify_maps_results() {
		assert!(verify_response(&[("RESULT", "OK"), ("DESTINATION", "x")]).is_ok());
		assert!(matches!(
			verify_response(&[("RESULT", "DUPLICATED_ID")]),
			Err(Error::Sam(SamError::DuplicatedId(_)))
		));
		assert!(matches!(
			verify_response(&[("RESULT", "I2P_ERROR"), ("MESSAGE", "boom")]),
			Err(Error::Sam(SamError::I2p(m))) if m == "boom"
		));
		// missing RESULT counts as OK, like the bridge's terse replies
		assert!(verify_response(&[("PUB", "a"), ("PRIV", "b")]).is_ok());
	}

	#[test]
	fn hello_carries_credentials_only_when_complete() {
		let auth = SamAuth::default();
		assert_eq!(auth.hello_suffix(), "");
		let auth = SamAuth {
			username: Some("user".to_string()),
			password: None,
		};
		assert_eq!(auth.hello_suffix(), "");
		let auth = SamAuth {
			username: Some("user".to_string()),
			password: Some("secret".to_string()),
		};
		assert_eq!(auth.hello_suffix(), " USER=\"user\" PASSWORD=\"secret\"");
	}

	#[test]
	#[ignore = "requires a running I2P router with SAM enabled"]
	fn generate_destination_roundtrip() {
		let mut sam = SamConnection::connect(
			DEFAULT_SAM_API,
			Duration::from_secs(30),
			&SamAuth::default(),
		)
		.unwrap();
		let keys = sam.generate_destination().unwrap();
		assert!(!keys.public.is_empty());
		assert!(!keys.secret.is_empty());
	}
}
