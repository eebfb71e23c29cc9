//! Allow/block policy for outbound targets, with decision counters and a
//! bounded ring of decision records. Decisions and list edits share one
//! lock, so a decision taken after a successful add observes that add.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use regex::Regex;
use serde::Serialize;

use crate::addr;
use crate::config::FilterConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
	Allow,
	Block,
}

impl FilterAction {
	fn as_str(&self) -> &'static str {
		match self {
			Self::Allow => "ALLOW",
			Self::Block => "BLOCK",
		}
	}
}

#[derive(Debug, Clone)]
pub struct FilterDecision {
	pub action: FilterAction,
	pub reason: String,
}

impl FilterDecision {
	pub fn allowed(&self) -> bool {
		self.action == FilterAction::Allow
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterEntry {
	pub ts: u64,
	pub action: String,
	pub protocol: String,
	pub src: String,
	pub dst: String,
	pub reason: String,
	pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterStats {
	pub i2p_allowed: u64,
	pub i2p_blocked: u64,
	pub non_i2p_blocked: u64,
	pub total_bytes: u64,
}

/// A validated pattern: literal hostname or compiled wildcard.
#[derive(Debug)]
enum Pattern {
	Literal,
	Wildcard(Regex),
}

#[derive(Debug, Default)]
struct FilterState {
	allow: HashMap<String, Pattern>,
	block: HashMap<String, Pattern>,
	log: VecDeque<FilterEntry>,
	stats: FilterStats,
}

pub struct TrafficFilter {
	cfg: FilterConfig,
	state: Mutex<FilterState>,
}

fn now_epoch() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

fn validate_pattern(pattern: &str) -> Result<(String, Pattern)> {
	let p = pattern.trim().to_ascii_lowercase();
	if p.is_empty() {
		return Err(Error::InvalidConfig("empty filter pattern".to_string()));
	}
	if p.contains('*') {
		let well_formed = p.ends_with(addr::I2P_EXT)
			&& p.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '*');
		if !well_formed {
			return Err(Error::InvalidConfig(format!("bad wildcard pattern {p}")));
		}
		let regex = p
			.split('*')
			.map(regex::escape)
			.collect::<Vec<_>>()
			.join(".*");
		let compiled = Regex::new(&format!("^{regex}$"))
			.map_err(|e| Error::InvalidConfig(format!("bad wildcard pattern {p}: {e}")))?;
		return Ok((p, Pattern::Wildcard(compiled)));
	}
	if !addr::is_i2p_hostname(&p) {
		return Err(Error::InvalidConfig(format!("not an I2P hostname: {p}")));
	}
	Ok((p, Pattern::Literal))
}

fn matches(set: &HashMap<String, Pattern>, host: &str) -> bool {
	set.iter().any(|(literal, pattern)| match pattern {
		Pattern::Literal => literal == host,
		Pattern::Wildcard(re) => re.is_match(host),
	})
}

impl TrafficFilter {
	pub fn new(cfg: FilterConfig) -> TrafficFilter {
		TrafficFilter {
			cfg,
			state: Mutex::new(FilterState::default()),
		}
	}

	pub fn add_allow(&self, pattern: &str) -> Result<()> {
		let (key, compiled) = validate_pattern(pattern)?;
		self.state.lock().unwrap().allow.insert(key, compiled);
		Ok(())
	}

	pub fn add_block(&self, pattern: &str) -> Result<()> {
		let (key, compiled) = validate_pattern(pattern)?;
		self.state.lock().unwrap().block.insert(key, compiled);
		Ok(())
	}

	pub fn remove_allow(&self, pattern: &str) -> bool {
		self.state
			.lock()
			.unwrap()
			.allow
			.remove(&pattern.trim().to_ascii_lowercase())
			.is_some()
	}

	pub fn remove_block(&self, pattern: &str) -> bool {
		self.state
			.lock()
			.unwrap()
			.block
			.remove(&pattern.trim().to_ascii_lowercase())
			.is_some()
	}

	pub fn should_allow(&self, target: &str, protocol: &str) -> FilterDecision {
		self.should_allow_from(target, protocol, "")
	}

	/// Policy order: non-I2P targets are always blocked; an enabled
	/// allowlist is authoritative; otherwise an enabled blocklist may
	/// veto; the default is allow.
	pub fn should_allow_from(&self, target: &str, protocol: &str, src: &str) -> FilterDecision {
		let host = addr::strip_port(target)
			.trim_end_matches('.')
			.to_ascii_lowercase();
		let mut state = self.state.lock().unwrap();

		let (decision, log_it) = if !addr::is_i2p_hostname(&host) {
			state.stats.non_i2p_blocked += 1;
			(
				FilterDecision {
					action: FilterAction::Block,
					reason: "non-I2P destination".to_string(),
				},
				self.cfg.log_non_i2p,
			)
		} else if self.cfg.enable_allowlist {
			if matches(&state.allow, &host) {
				state.stats.i2p_allowed += 1;
				(
					FilterDecision {
						action: FilterAction::Allow,
						reason: "allowed by allowlist".to_string(),
					},
					self.cfg.log_traffic,
				)
			} else {
				state.stats.i2p_blocked += 1;
				(
					FilterDecision {
						action: FilterAction::Block,
						reason: "not in allowlist".to_string(),
					},
					self.cfg.log_traffic,
				)
			}
		} else if self.cfg.enable_blocklist && matches(&state.block, &host) {
			state.stats.i2p_blocked += 1;
			(
				FilterDecision {
					action: FilterAction::Block,
					reason: "blocked by blocklist".to_string(),
				},
				self.cfg.log_traffic,
			)
		} else {
			state.stats.i2p_allowed += 1;
			(
				FilterDecision {
					action: FilterAction::Allow,
					reason: "allowed".to_string(),
				},
				self.cfg.log_traffic,
			)
		};

		if !decision.allowed() {
			debug!("blocked {protocol} {src} -> {host}: {}", decision.reason);
		}
		if log_it {
			let entry = FilterEntry {
				ts: now_epoch(),
				action: decision.action.as_str().to_string(),
				protocol: protocol.to_string(),
				src: src.to_string(),
				dst: host,
				reason: decision.reason.clone(),
				bytes: 0,
			};
			self.push_entry(&mut state, entry);
		}
		decision
	}

	fn push_entry(&self, state: &mut FilterState, entry: FilterEntry) {
		// age out before capacity, so a quiet ring still stays current
		let cutoff = entry.ts.saturating_sub(self.cfg.stats_retention_secs);
		while state.log.front().is_some_and(|e| e.ts < cutoff) {
			state.log.pop_front();
		}
		state.log.push_back(entry);
		while state.log.len() > self.cfg.max_log_entries {
			state.log.pop_front();
		}
	}

	pub fn add_bytes(&self, n: u64) {
		self.state.lock().unwrap().stats.total_bytes += n;
	}

	pub fn stats(&self) -> FilterStats {
		self.state.lock().unwrap().stats.clone()
	}

	pub fn entries(&self) -> Vec<FilterEntry> {
		self.state.lock().unwrap().log.iter().cloned().collect()
	}

	/// Resets every counter and replaces the ring with a single marker
	/// entry recording the reset itself.
	pub fn clear_stats(&self) {
		let mut state = self.state.lock().unwrap();
		state.stats = FilterStats::default();
		state.log.clear();
		state.log.push_back(FilterEntry {
			ts: now_epoch(),
			action: "ADMIN".to_string(),
			protocol: "SYSTEM".to_string(),
			src: String::new(),
			dst: String::new(),
			reason: "Statistics cleared".to_string(),
			bytes: 0,
		});
		warn!("traffic statistics cleared");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn filter(cfg: FilterConfig) -> TrafficFilter {
		TrafficFilter::new(cfg)
	}

	#[test]
	fn pattern_validation() {
		let f = filter(FilterConfig::default());
		assert!(f.add_allow("example.i2p").is_ok());
		assert!(f.add_allow("*.example.i2p").is_ok());
		assert!(f.add_allow("").is_err());
		assert!(f.add_allow("example.com").is_err());
		assert!(f.add_allow("*.example.com").is_err());
		// b32 names must be exactly 60 chars
		assert!(f.add_block(&format!("{}.b32.i2p", "a".repeat(52))).is_ok());
		assert!(f.add_block(&format!("{}.b32.i2p", "a".repeat(10))).is_err());
	}

	#[test]
	fn removal_is_case_insensitive_and_reported() {
		let mut cfg = FilterConfig::default();
		cfg.enable_blocklist = true;
		let f = filter(cfg);
		f.add_block("Blocked.i2p").unwrap();
		assert!(!f.should_allow("blocked.i2p", "tcp").allowed());
		assert!(f.remove_block("BLOCKED.i2p"));
		assert!(!f.remove_block("blocked.i2p"));
		assert!(f.should_allow("blocked.i2p", "tcp").allowed());
		assert!(!f.remove_allow("never-added.i2p"));
	}

	#[test]
	fn blocklist_precedence_scenario() {
		let mut cfg = FilterConfig::default();
		cfg.enable_blocklist = true;
		let f = filter(cfg);
		f.add_allow("allowed.i2p").unwrap();
		f.add_block("blocked.i2p").unwrap();

		assert!(f.should_allow("allowed.i2p:80", "tcp").allowed());
		let d = f.should_allow("blocked.i2p:80", "tcp");
		assert!(!d.allowed());
		assert_eq!(d.reason, "blocked by blocklist");
		let d = f.should_allow("example.com:80", "tcp");
		assert!(!d.allowed());
		assert_eq!(d.reason, "non-I2P destination");

		let stats = f.stats();
		assert_eq!(stats.i2p_allowed, 1);
		assert_eq!(stats.i2p_blocked, 1);
		assert_eq!(stats.non_i2p_blocked, 1);
	}

	#[test]
	fn doubly_listed_target_blocks_without_allowlist() {
		let mut cfg = FilterConfig::default();
		cfg.enable_blocklist = true;
		let f = filter(cfg);
		f.add_allow("both.i2p").unwrap();
		f.add_block("both.i2p").unwrap();
		assert!(!f.should_allow("both.i2p", "tcp").allowed());
	}

	#[test]
	fn allowlist_is_authoritative_when_enabled() {
		let mut cfg = FilterConfig::default();
		cfg.enable_allowlist = true;
		cfg.enable_blocklist = true;
		let f = filter(cfg);
		f.add_allow("both.i2p").unwrap();
		f.add_block("both.i2p").unwrap();
		// allowlist match returns first when both lists are enabled
		assert!(f.should_allow("both.i2p", "tcp").allowed());
		assert!(!f.should_allow("other.i2p", "tcp").allowed());
	}

	#[test]
	fn wildcards_match_case_insensitively() {
		let mut cfg = FilterConfig::default();
		cfg.enable_blocklist = true;
		let f = filter(cfg);
		f.add_block("*.bad.i2p").unwrap();
		assert!(!f.should_allow("Sub.BAD.i2p:4444", "tcp").allowed());
		assert!(f.should_allow("good.i2p", "tcp").allowed());
	}

	#[test]
	fn ring_is_bounded() {
		let mut cfg = FilterConfig::default();
		cfg.max_log_entries = 5;
		let f = filter(cfg);
		for i in 0..20 {
			f.should_allow(&format!("host{i}.i2p"), "tcp");
		}
		let entries = f.entries();
		assert_eq!(entries.len(), 5);
		assert_eq!(entries[0].dst, "host15.i2p");
		assert_eq!(entries[4].dst, "host19.i2p");
	}

	#[test]
	fn clear_stats_leaves_marker() {
		let f = filter(FilterConfig::default());
		f.should_allow("example.i2p", "tcp");
		f.add_bytes(42);
		f.clear_stats();
		let stats = f.stats();
		assert_eq!(stats.i2p_allowed, 0);
		assert_eq!(stats.total_bytes, 0);
		let entries = f.entries();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].action, "ADMIN");
		assert_eq!(entries[0].protocol, "SYSTEM");
		assert_eq!(entries[0].reason, "Statistics cleared");
	}
}
