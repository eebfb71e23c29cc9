//! A container network driver that transparently routes container traffic
//! through the I2P anonymity network.
//!
//! The driver speaks the runtime's network-driver activation protocol on a
//! Unix socket, manages one SAM primary session per container, forces all
//! container egress through an internal DNS responder and SOCKS5 front-end
//! via packet-filter rules, and publishes selected container ports either
//! as I2P server tunnels (`.b32.i2p` names) or as local TCP/UDP
//! forwarders.

pub use crate::config::Config;
pub use crate::driver::NetworkManager;
pub use crate::error::{Error, Result, SamError};
pub use crate::rpc::RpcServer;

pub mod addr;
pub mod config;
pub mod dns;
pub mod driver;
pub mod error;
pub mod expose;
pub mod filter;
pub mod firewall;
pub mod forward;
pub mod ipam;
mod parsers;
pub mod rpc;
pub mod sam;
pub mod session;
pub mod socks;
