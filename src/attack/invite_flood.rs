//! `inviteflood` command lines.
//!
//! inviteflood floods a single destination port, so a plan with several
//! target ports becomes one generator per port, each sending `max_count`
//! INVITEs.

use super::{AttackPlan, GeneratorCommand};

/// inviteflood reads the delay as a signed 32 bit microsecond count.
const MAX_DELAY_US: u128 = i32::MAX as u128;

/// Flood stage used when only a duration bounds the run.
const DURATION_BOUND_COUNT: u64 = u32::MAX as u64;

pub fn commands(plan: &AttackPlan) -> Vec<GeneratorCommand> {
    let mut ports = plan.target_ports.clone();
    ports.sort_unstable();
    ports.dedup();
    ports
        .into_iter()
        .map(|port| command_for_port(plan, port))
        .collect()
}

fn command_for_port(plan: &AttackPlan, port: u16) -> GeneratorCommand {
    let count = if plan.max_count == 0 {
        DURATION_BOUND_COUNT
    } else {
        plan.max_count
    };
    let target = plan.target.to_string();

    // interface, user, domain, flood target, flood stage
    let mut args = vec![
        plan.interface.clone(),
        plan.sip_user.clone(),
        target.clone(),
        target,
        count.to_string(),
    ];
    if let Some(source) = plan.source_ip {
        args.push("-i".to_string());
        args.push(source.to_string());
    }
    args.push("-S".to_string());
    args.push(plan.source_port.to_string());
    args.push("-D".to_string());
    args.push(port.to_string());

    let delay_us = plan.delay.as_micros();
    if delay_us > 0 {
        if delay_us > MAX_DELAY_US {
            tracing::warn!("Delay of {}us capped to {}us", delay_us, MAX_DELAY_US);
        }
        args.push("-s".to_string());
        args.push(delay_us.min(MAX_DELAY_US).to_string());
    }

    GeneratorCommand {
        program: plan.inviteflood_path.clone(),
        args,
    }
}
