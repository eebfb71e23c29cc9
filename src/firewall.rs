//! Generates and installs the iptables program that forces container
//! egress through the DNS responder and the SOCKS front-end. One program
//! per process; setup refuses to run twice. Setup failures roll back in
//! reverse order, teardown aggregates errors and never aborts early.

use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnetwork::Ipv4Network;
use log::{debug, info, warn};

use crate::error::{Error, Result};

const NAT_TABLE: &str = "nat";
const FILTER_TABLE: &str = "filter";
const NAT_CHAIN: &str = "I2P_REDIRECT";
const FILTER_CHAIN: &str = "I2P_FILTER";

static ARMED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleStep {
	NewChain {
		table: &'static str,
		chain: &'static str,
	},
	Append {
		table: &'static str,
		chain: &'static str,
		spec: Vec<String>,
	},
}

impl RuleStep {
	fn apply_args(&self) -> Vec<Vec<String>> {
		match self {
			Self::NewChain { table, chain } => {
				vec![vec![
					"-t".to_string(),
					table.to_string(),
					"-N".to_string(),
					chain.to_string(),
				]]
			}
			Self::Append { table, chain, spec } => {
				let mut args = vec![
					"-t".to_string(),
					table.to_string(),
					"-A".to_string(),
					chain.to_string(),
				];
				args.extend(spec.iter().cloned());
				vec![args]
			}
		}
	}

	fn revert_args(&self) -> Vec<Vec<String>> {
		match self {
			Self::NewChain { table, chain } => vec![
				vec![
					"-t".to_string(),
					table.to_string(),
					"-F".to_string(),
					chain.to_string(),
				],
				vec![
					"-t".to_string(),
					table.to_string(),
					"-X".to_string(),
					chain.to_string(),
				],
			],
			Self::Append { table, chain, spec } => {
				let mut args = vec![
					"-t".to_string(),
					table.to_string(),
					"-D".to_string(),
					chain.to_string(),
				];
				args.extend(spec.iter().cloned());
				vec![args]
			}
		}
	}
}

fn iptables(args: &[String]) -> Result<()> {
	debug!("iptables {}", args.join(" "));
	let output = Command::new("iptables")
		.args(args)
		.output()
		.map_err(|e| Error::FirewallCommand(format!("iptables: {e}")))?;
	if !output.status.success() {
		return Err(Error::FirewallCommand(format!(
			"iptables {} failed: {}",
			args.join(" "),
			String::from_utf8_lossy(&output.stderr).trim()
		)));
	}
	Ok(())
}

/// Checks both that the iptables CLI exists and that this process may
/// actually use it, by running a read-only listing.
pub fn is_available() -> bool {
	let present = Command::new("iptables")
		.arg("--version")
		.output()
		.map(|o| o.status.success())
		.unwrap_or(false);
	if !present {
		return false;
	}
	Command::new("iptables")
		.args(["-t", NAT_TABLE, "-L", "-n"])
		.output()
		.map(|o| o.status.success())
		.unwrap_or(false)
}

pub struct EgressFirewall {
	subnet: Ipv4Network,
	socks_port: u16,
	dns_port: u16,
	applied: Vec<RuleStep>,
}

impl EgressFirewall {
	pub fn new(subnet: Ipv4Network, socks_port: u16, dns_port: u16) -> EgressFirewall {
		EgressFirewall {
			subnet,
			socks_port,
			dns_port,
			applied: Vec::new(),
		}
	}

	/// The ordered rule program. Chains are created first, the OUTPUT
	/// hooks for the container subnet come last so no traffic hits a
	/// half-built chain.
	fn program(&self) -> Vec<RuleStep> {
		let subnet = self.subnet.to_string();
		let socks = self.socks_port.to_string();
		let dns = self.dns_port.to_string();
		let spec = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();

		vec![
			RuleStep::NewChain {
				table: NAT_TABLE,
				chain: NAT_CHAIN,
			},
			RuleStep::Append {
				table: NAT_TABLE,
				chain: NAT_CHAIN,
				spec: spec(&["-p", "udp", "--dport", "53", "-j", "REDIRECT", "--to-ports", &dns]),
			},
			RuleStep::Append {
				table: NAT_TABLE,
				chain: NAT_CHAIN,
				spec: spec(&["-p", "tcp", "--dport", "53", "-j", "REDIRECT", "--to-ports", &dns]),
			},
			RuleStep::Append {
				table: NAT_TABLE,
				chain: NAT_CHAIN,
				spec: spec(&[
					"-p", "tcp", "!", "--dport", &socks, "-j", "REDIRECT", "--to-ports", &socks,
				]),
			},
			RuleStep::NewChain {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
				spec: spec(&["-p", "tcp", "--dport", &socks, "-j", "ACCEPT"]),
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
				spec: spec(&["-p", "udp", "--dport", &dns, "-j", "ACCEPT"]),
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
				spec: spec(&["-p", "tcp", "--dport", &dns, "-j", "ACCEPT"]),
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
				spec: spec(&["-o", "lo", "-j", "ACCEPT"]),
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
				spec: spec(&["-d", &subnet, "-j", "ACCEPT"]),
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
				spec: spec(&[
					"-m",
					"limit",
					"--limit",
					"10/min",
					"-j",
					"LOG",
					"--log-prefix",
					"i2p-egress-drop: ",
				]),
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: FILTER_CHAIN,
				spec: spec(&["-j", "DROP"]),
			},
			RuleStep::Append {
				table: NAT_TABLE,
				chain: "OUTPUT",
				spec: spec(&["-s", &subnet, "-j", NAT_CHAIN]),
			},
			RuleStep::Append {
				table: FILTER_TABLE,
				chain: "OUTPUT",
				spec: spec(&["-s", &subnet, "-j", FILTER_CHAIN]),
			},
		]
	}

	pub fn is_installed(&self) -> bool {
		!self.applied.is_empty()
	}

	/// Applies the program in declared order. Any failure reverts the
	/// already-applied prefix in reverse and returns the original error.
	pub fn setup(&mut self) -> Result<()> {
		if ARMED.swap(true, Ordering::SeqCst) {
			return Err(Error::FirewallBusy);
		}
		if !is_available() {
			ARMED.store(false, Ordering::SeqCst);
			return Err(Error::FirewallUnavailable(
				"iptables missing or not permitted".to_string(),
			));
		}

		let steps = self.program();
		let mut done: Vec<RuleStep> = Vec::with_capacity(steps.len());
		for step in steps {
			let result = step
				.apply_args()
				.iter()
				.try_for_each(|args| iptables(args));
			if let Err(e) = result {
				warn!("egress rule setup failed, rolling back: {e}");
				for undo in done.iter().rev() {
					for args in undo.revert_args() {
						if let Err(re) = iptables(&args) {
							warn!("rollback step failed: {re}");
						}
					}
				}
				ARMED.store(false, Ordering::SeqCst);
				return Err(e);
			}
			done.push(step);
		}
		self.applied = done;
		info!(
			"egress filter installed for {} (socks {}, dns {})",
			self.subnet, self.socks_port, self.dns_port
		);
		Ok(())
	}

	/// Removes every installed rule in LIFO order. Individual failures
	/// are collected; the remaining steps still run.
	pub fn teardown(&mut self) -> Result<()> {
		let steps = std::mem::take(&mut self.applied);
		if steps.is_empty() {
			return Ok(());
		}
		let mut failures: Vec<String> = Vec::new();
		for step in steps.iter().rev() {
			for args in step.revert_args() {
				if let Err(e) = iptables(&args) {
					failures.push(e.to_string());
				}
			}
		}
		ARMED.store(false, Ordering::SeqCst);
		info!("egress filter removed for {}", self.subnet);
		if failures.is_empty() {
			Ok(())
		} else {
			Err(Error::FirewallCommand(failures.join("; ")))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn firewall() -> EgressFirewall {
		EgressFirewall::new("172.28.0.0/16".parse().unwrap(), 1080, 5354)
	}

	#[test]
	fn program_shape_and_order() {
		let fw = firewall();
		let steps = fw.program();

		// chains exist before anything is appended to them
		assert_eq!(
			steps[0],
			RuleStep::NewChain {
				table: NAT_TABLE,
				chain: NAT_CHAIN
			}
		);
		assert!(matches!(
			steps[4],
			RuleStep::NewChain {
				table: FILTER_TABLE,
				..
			}
		));

		// hooks into OUTPUT come last
		let hooks: Vec<_> = steps
			.iter()
			.filter(|s| matches!(s, RuleStep::Append { chain: "OUTPUT", .. }))
			.collect();
		assert_eq!(hooks.len(), 2);
		assert!(matches!(steps[steps.len() - 1], RuleStep::Append { chain: "OUTPUT", .. }));
		assert!(matches!(steps[steps.len() - 2], RuleStep::Append { chain: "OUTPUT", .. }));

		// the drop rule is the filter chain's tail
		let drop_pos = steps
			.iter()
			.position(|s| matches!(s, RuleStep::Append { spec, .. } if spec == &["-j", "DROP"]))
			.unwrap();
		assert_eq!(drop_pos, steps.len() - 3);
	}

	#[test]
	fn dns_and_socks_redirects_are_present() {
		let fw = firewall();
		let rendered: Vec<String> = fw
			.program()
			.iter()
			.flat_map(|s| s.apply_args())
			.map(|args| args.join(" "))
			.collect();
		assert!(rendered
			.iter()
			.any(|r| r.contains("-p udp --dport 53 -j REDIRECT --to-ports 5354")));
		assert!(rendered
			.iter()
			.any(|r| r.contains("-p tcp --dport 53 -j REDIRECT --to-ports 5354")));
		assert!(rendered
			.iter()
			.any(|r| r.contains("-p tcp ! --dport 1080 -j REDIRECT --to-ports 1080")));
		assert!(rendered
			.iter()
			.any(|r| r.contains("-s 172.28.0.0/16 -j I2P_REDIRECT")));
	}

	#[test]
	fn revert_mirrors_apply() {
		let step = RuleStep::Append {
			table: FILTER_TABLE,
			chain: FILTER_CHAIN,
			spec: vec!["-j".to_string(), "DROP".to_string()],
		};
		assert_eq!(
			step.revert_args(),
			vec![vec![
				"-t".to_string(),
				"filter".to_string(),
				"-D".to_string(),
				"I2P_FILTER".to_string(),
				"-j".to_string(),
				"DROP".to_string(),
			]]
		);

		let chain = RuleStep::NewChain {
			table: NAT_TABLE,
			chain: NAT_CHAIN,
		};
		// flush before delete
		let revert = chain.revert_args();
		assert_eq!(revert.len(), 2);
		assert!(revert[0].contains(&"-F".to_string()));
		assert!(revert[1].contains(&"-X".to_string()));
	}

	#[test]
	#[ignore = "requires iptables and CAP_NET_ADMIN"]
	fn setup_teardown_cycle() {
		let mut fw = firewall();
		fw.setup().unwrap();
		assert!(fw.is_installed());
		// a second program may not arm while the first is active
		let mut other = firewall();
		assert!(matches!(other.setup(), Err(Error::FirewallBusy)));
		fw.teardown().unwrap();
		assert!(!fw.is_installed());
	}
}
