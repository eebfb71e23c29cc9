use std::io;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use thiserror::Error as ThisError;

/// Kinds of SAM bridge errors, mapped from the RESULT field of SAM replies.
#[derive(Clone, Eq, PartialEq, Debug, ThisError)]
pub enum SamError {
	/// Wraps io errors on the control socket
	#[error("IO error talking to the SAM bridge (is the I2P router running?): {0}")]
	Io(String),
	/// Wraps nom parser errors
	#[error("Failed to parse a SAM reply")]
	MessageParsing,
	#[error("Invalid or unrecognized SAM reply: {0}")]
	InvalidMessage(String),
	#[error("Can't reach peer: {0}")]
	CantReachPeer(String),
	#[error("Destination key not found: {0}")]
	KeyNotFound(String),
	#[error("Peer not found: {0}")]
	PeerNotFound(String),
	#[error("Duplicate destination: {0}")]
	DuplicatedDest(String),
	#[error("Duplicate session id: {0}")]
	DuplicatedId(String),
	#[error("Invalid destination key: {0}")]
	InvalidKey(String),
	#[error("Invalid session id: {0}")]
	InvalidId(String),
	#[error("SAM timeout: {0}")]
	Timeout(String),
	#[error("I2P error: {0}")]
	I2p(String),
}

impl From<io::Error> for SamError {
	fn from(err: io::Error) -> SamError {
		Self::Io(err.to_string())
	}
}

impl<E> From<nom::Err<E>> for SamError {
	fn from(_err: nom::Err<E>) -> SamError {
		Self::MessageParsing
	}
}

/// Driver-level error taxonomy. Validation failures are synchronous and
/// never logged at error level; close/teardown paths log and suppress.
#[derive(Clone, Eq, PartialEq, Debug, ThisError)]
pub enum Error {
	// validation
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
	#[error("invalid tunnel configuration: {0}")]
	InvalidTunnel(String),
	#[error("invalid target IP: {0}")]
	InvalidTargetIp(String),
	#[error("invalid address: {0}")]
	BadAddressEncoding(String),

	// environment
	#[error("SAM bridge unreachable at {0}: {1}")]
	UnreachableSam(String, String),
	#[error("SAM version negotiation failed: {0}")]
	VersionUnknown(String),
	#[error("SAM resolver probe failed: {0}")]
	ResolverUnavailable(String),
	#[error("packet filter unavailable: {0}")]
	FirewallUnavailable(String),

	// conflicts
	#[error("duplicate tunnel name: {0}")]
	DuplicateTunnel(String),
	#[error("network already exists: {0}")]
	DuplicateNetwork(String),
	#[error("endpoint already exists: {0}")]
	DuplicateEndpoint(String),
	#[error("address {0} is already allocated")]
	AlreadyAllocated(Ipv4Addr),
	#[error("address {0} is outside subnet {1}")]
	OutOfRange(Ipv4Addr, Ipv4Network),
	#[error("egress filter rules are already installed")]
	FirewallBusy,

	// exhaustion
	#[error("address pool exhausted in {0}")]
	PoolExhausted(Ipv4Network),

	// lookups
	#[error("no such network: {0}")]
	NoSuchNetwork(String),
	#[error("no such endpoint: {0}")]
	NoSuchEndpoint(String),
	#[error("no such tunnel: {0}")]
	NoSuchTunnel(String),

	// remote failures
	#[error("tunnel creation failed: {0}")]
	TunnelCreateFailed(String),
	#[error("packet filter command failed: {0}")]
	FirewallCommand(String),
	#[error(transparent)]
	Sam(#[from] SamError),

	// protocol violations
	#[error("SOCKS protocol violation: {0}")]
	SocksProtocol(String),

	// transient
	#[error("IO error: {0}")]
	Io(String),
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Error {
		Self::Io(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, Error>;
