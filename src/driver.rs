//! Runs the fixed, ordered list of probes against a single target and
//! reports one line per outcome, the way the command-line entry point's
//! subcommand dispatch reports its own results.
//!
//! Each scenario gets its own freshly bound harness rather than sharing one
//! across the whole run: bonding state lives on the target's side, keyed by
//! the requester's address, so reusing a harness would let an earlier
//! probe's ping silently bond later probes that are specifically testing
//! what happens *without* one.

use std::net::{IpAddr, SocketAddr};

use secp256k1::SecretKey;
use tracing::info;

use crate::endpoint::NetRestrict;
use crate::error::HarnessError;
use crate::probes::{self, Expected, Harness, ProbeReport};
use crate::types::NodeId;

pub struct DriverReport {
    pub results: Vec<ProbeReport>,
}

impl DriverReport {
    pub fn all_passed(&self) -> bool {
        self.results.iter().all(ProbeReport::passed)
    }
}

pub async fn run(bind_addr: SocketAddr, signer: SecretKey, target: SocketAddr) -> Result<DriverReport, HarnessError> {
    run_with(bind_addr, signer, target, None, None, NetRestrict::default()).await
}

/// `target_id`, when known, is threaded into the `ping` scenario alone: it's
/// the one probe that validates the replying peer really is the target we
/// dialed, rather than just checking the reply's shape.
pub async fn run_with(
    bind_addr: SocketAddr,
    signer: SecretKey,
    target: SocketAddr,
    target_id: Option<NodeId>,
    announce_ip: Option<IpAddr>,
    restrict: NetRestrict,
) -> Result<DriverReport, HarnessError> {
    let mut results = Vec::new();

    // Each scenario rebinds on an ephemeral port rather than `bind_addr`'s
    // configured one: reusing the same fixed port back-to-back would race
    // the previous harness's abort against the OS actually releasing it,
    // and a fresh port sidesteps that instead of hoping the race is won.
    let scenario_addr = SocketAddr::new(bind_addr.ip(), 0);

    macro_rules! run_scenario {
        ($probe:path) => {{
            let harness = Harness::bind_with(scenario_addr, signer.clone(), announce_ip, restrict.clone()).await?;
            let report = $probe(&harness, target).await;
            log_report(&report);
            let passed = report.passed();
            results.push(report);
            if !passed {
                return Ok(DriverReport { results });
            }
        }};
    }

    {
        let harness = Harness::bind_with(scenario_addr, signer.clone(), announce_ip, restrict.clone()).await?;
        let report = probes::ping(&harness, target, target_id).await;
        log_report(&report);
        let passed = report.passed();
        results.push(report);
        if !passed {
            return Ok(DriverReport { results });
        }
    }
    run_scenario!(probes::ping_wrong_from);
    run_scenario!(probes::ping_wrong_to);
    run_scenario!(probes::ping_extra_data);
    run_scenario!(probes::ping_extra_data_wrong_from);
    run_scenario!(probes::ping_wrong_packet_type);
    run_scenario!(probes::findnode_without_bond);
    run_scenario!(probes::ping_bonded_with_mangled_from);
    run_scenario!(probes::bonded_findnode);
    run_scenario!(probes::ping_past_expiration);
    run_scenario!(probes::findnode_past_expiration);

    Ok(DriverReport { results })
}

fn log_report(report: &ProbeReport) {
    let expected = match report.expected {
        Expected::Ok => "ok",
        Expected::Timeout => "timeout",
    };
    if report.passed() {
        info!("{:<32} PASS (expected {expected})", report.name);
    } else {
        info!(
            "{:<32} FAIL (expected {expected}, got {:?})",
            report.name, report.outcome
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_report_all_passed_is_vacuously_true_when_empty() {
        let report = DriverReport { results: vec![] };
        assert!(report.all_passed());
    }
}
