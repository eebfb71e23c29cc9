//! I2P address helpers: the custom base32/base64 alphabets used by I2P and
//! the derivation of `.b32.i2p` names from full base64 destinations.

use data_encoding::{Encoding, Specification};
use lazy_static::lazy_static;
use log::error;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const B32_EXT: &str = ".b32.i2p";
pub const I2P_EXT: &str = ".i2p";

/// Full length of a `.b32.i2p` hostname: 52 base32 chars plus the suffix.
pub const B32_ADDR_LEN: usize = 52 + B32_EXT.len();

lazy_static! {
	pub static ref BASE32_I2P: Encoding = {
		let mut spec = Specification::new();
		spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
		spec.padding = None;
		spec.encoding().unwrap()
	};
}

lazy_static! {
	pub static ref BASE64_I2P: Encoding = {
		let mut spec = Specification::new();
		spec.symbols
			.push_str("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~");
		spec.padding = Some('=');
		spec.encoding().unwrap()
	};
}

/// Derives the `.b32.i2p` hostname for a full base64 destination: the
/// lower-cased base32 encoding of the SHA-256 digest of the raw key
/// material, suffixed `.b32.i2p`.
pub fn b32_address(dest_b64: &str) -> Result<String> {
	let bin_data = BASE64_I2P.decode(dest_b64.as_bytes()).map_err(|e| {
		error!("base64 decoding error: {:?}", e);
		Error::BadAddressEncoding(dest_b64.to_string())
	})?;
	let mut hasher = Sha256::new();
	hasher.update(bin_data);
	let mut b32 = BASE32_I2P.encode(&hasher.finalize()[..]);
	b32.push_str(B32_EXT);
	Ok(b32)
}

/// True when `host` names an I2P destination: any `*.i2p` suffix, with the
/// additional length requirement for `.b32.i2p` forms. Case insensitive;
/// a trailing dot is ignored.
pub fn is_i2p_hostname(host: &str) -> bool {
	let host = host.trim_end_matches('.').to_ascii_lowercase();
	if host.ends_with(B32_EXT) {
		return host.len() == B32_ADDR_LEN;
	}
	host.ends_with(I2P_EXT) && host.len() > I2P_EXT.len()
}

/// Strips an optional `:port` suffix from a target string.
pub fn strip_port(target: &str) -> &str {
	match target.rsplit_once(':') {
		Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
		_ => target,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn b32_is_stable_and_well_formed() {
		// base64 of arbitrary key material in the I2P alphabet
		let dest = BASE64_I2P.encode(&[7u8; 96]);
		let a = b32_address(&dest).unwrap();
		let b = b32_address(&dest).unwrap();
		assert_eq!(a, b);
		assert_eq!(a.len(), B32_ADDR_LEN);
		assert!(a.ends_with(B32_EXT));
		assert!(is_i2p_hostname(&a));
	}

	#[test]
	fn b32_rejects_bad_encoding() {
		assert!(matches!(
			b32_address("not/base64!"),
			Err(Error::BadAddressEncoding(_))
		));
	}

	#[test]
	fn hostname_validation() {
		assert!(is_i2p_hostname("example.i2p"));
		assert!(is_i2p_hostname("EXAMPLE.I2P"));
		assert!(is_i2p_hostname("example.i2p."));
		assert!(!is_i2p_hostname("example.com"));
		assert!(!is_i2p_hostname(".i2p"));
		// b32 names must be exactly 60 chars
		let b32 = format!("{}{}", "a".repeat(52), B32_EXT);
		assert!(is_i2p_hostname(&b32));
		let short = format!("{}{}", "a".repeat(20), B32_EXT);
		assert!(!is_i2p_hostname(&short));
	}

	#[test]
	fn port_stripping() {
		assert_eq!(strip_port("example.i2p:80"), "example.i2p");
		assert_eq!(strip_port("example.i2p"), "example.i2p");
		assert_eq!(strip_port("a:b:80"), "a:b");
	}
}
