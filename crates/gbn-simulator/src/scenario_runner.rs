use anyhow::{Context, anyhow};
use gbn_abstract::{EngineConfig, SimConfig, TestAction, TestAssertion, TestScenario};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::engine::{NodeId, Simulator};

/// Used when a scenario carries no `max_duration` assertion.
pub const DEFAULT_MAX_DURATION_MS: u64 = 10_000;

pub fn load_scenario(path: impl AsRef<Path>) -> anyhow::Result<TestScenario> {
    let content = fs::read_to_string(path.as_ref()).context("Failed to read scenario file")?;
    toml::from_str(&content).context("Failed to parse scenario")
}

/// Load, run and check a scenario file. Returns the finished simulator.
pub fn run_scenario(path: impl AsRef<Path>) -> anyhow::Result<Simulator> {
    run(&load_scenario(path)?)
}

pub fn run_scenario_str(text: &str) -> anyhow::Result<Simulator> {
    let scenario: TestScenario = toml::from_str(text).context("Failed to parse scenario")?;
    run(&scenario)
}

/// Build the simulator a scenario describes, without running it.
pub fn build(scenario: &TestScenario) -> anyhow::Result<Simulator> {
    let mut engine = EngineConfig::default();
    scenario.engine.apply_to(&mut engine);
    let mut config = SimConfig::default();
    scenario.config.apply_to(&mut config);

    let mut sim = Simulator::new(config, engine).context("Invalid scenario configuration")?;
    configure_actions(&mut sim, &scenario.actions);
    Ok(sim)
}

pub fn configure_actions(sim: &mut Simulator, actions: &[TestAction]) {
    for action in actions {
        match action {
            TestAction::AppSend { time, data } => {
                sim.schedule_app_send(*time, data.clone().into_bytes());
            }
            TestAction::AppSendBatch {
                time,
                count,
                prefix,
            } => {
                for i in 0..*count {
                    sim.schedule_app_send(*time, format!("{prefix}{i}").into_bytes());
                }
            }
            TestAction::DropNextData { seq } => {
                sim.add_drop_data_once(*seq);
            }
            TestAction::DropNextAck { seq } => {
                sim.add_drop_ack_once(*seq);
            }
        }
    }
}

pub fn run(scenario: &TestScenario) -> anyhow::Result<Simulator> {
    info!("Running Scenario: {}", scenario.name);
    if !scenario.description.is_empty() {
        info!("Description: {}", scenario.description);
    }

    let mut sim = build(scenario)?;

    let max_duration = scenario
        .assertions
        .iter()
        .find_map(|a| {
            if let TestAssertion::MaxDuration { ms } = a {
                Some(*ms)
            } else {
                None
            }
        })
        .unwrap_or(DEFAULT_MAX_DURATION_MS);

    if !sim.run_for(max_duration)? {
        return Err(anyhow!("Test timed out after {} ms", max_duration));
    }

    for assertion in &scenario.assertions {
        check(&sim, assertion)?;
    }

    info!(
        "Test Scenario Passed! ({} ms, {} data packets)",
        sim.current_time(),
        sim.sender_packet_count
    );
    Ok(sim)
}

fn check(sim: &Simulator, assertion: &TestAssertion) -> anyhow::Result<()> {
    let delivered = sim.delivered(NodeId::Receiver);
    let stats = sim.engine(NodeId::Sender).stats();

    match assertion {
        TestAssertion::DataDelivered { data } => {
            if !delivered.iter().any(|d| d == data.as_bytes()) {
                return Err(anyhow!(
                    "Assertion Failed: Data {:?} was not delivered",
                    data
                ));
            }
        }
        TestAssertion::DeliveredInOrder => {
            let sent = sim.sent(NodeId::Sender);
            if delivered != sent {
                let first_gap = sent
                    .iter()
                    .zip(delivered)
                    .position(|(s, d)| s != d)
                    .unwrap_or(sent.len().min(delivered.len()));
                return Err(anyhow!(
                    "Assertion Failed: delivered {} of {} payloads, diverging at index {}",
                    delivered.len(),
                    sent.len(),
                    first_gap
                ));
            }
        }
        TestAssertion::SenderPacketCount { min, max } => {
            in_range("Sender packet count", sim.sender_packet_count, *min, *max)?;
        }
        TestAssertion::MaxInFlight { max } => {
            if stats.max_in_flight > *max {
                return Err(anyhow!(
                    "Assertion Failed: {} packets were in flight, expected at most {}",
                    stats.max_in_flight,
                    max
                ));
            }
        }
        TestAssertion::FastRetransmits { min, max } => {
            in_range("Fast retransmits", stats.fast_retransmit_bursts, *min, *max)?;
        }
        TestAssertion::TimeoutRetransmits { min, max } => {
            in_range("Timeout retransmits", stats.timeout_bursts, *min, *max)?;
        }
        TestAssertion::MaxDuration { .. } => {} // Already checked
    }
    Ok(())
}

fn in_range<T>(what: &str, value: T, min: T, max: Option<T>) -> anyhow::Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if value < min {
        return Err(anyhow!(
            "Assertion Failed: {} was {}, expected min {}",
            what,
            value,
            min
        ));
    }
    if let Some(max) = max
        && value > max
    {
        return Err(anyhow!(
            "Assertion Failed: {} was {}, expected max {}",
            what,
            value,
            max
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn batch_action_expands_with_prefix() {
        let sim = run_scenario_str(
            r#"
            name = "batch"
            actions = [{ type = "app_send_batch", time = 0, count = 3, prefix = "m" }]
            assertions = [{ type = "delivered_in_order" }]
            "#,
        )
        .unwrap();
        assert_eq!(
            sim.delivered(NodeId::Receiver),
            &[
                Bytes::from_static(b"m0"),
                Bytes::from_static(b"m1"),
                Bytes::from_static(b"m2")
            ]
        );
    }

    #[test]
    fn failed_assertion_is_reported() {
        let err = run_scenario_str(
            r#"
            name = "too strict"
            actions = [{ type = "app_send", time = 0, data = "x" }]
            assertions = [{ type = "data_delivered", data = "y" }]
            "#,
        )
        .err()
        .expect("scenario should fail");
        assert!(err.to_string().contains("was not delivered"));
    }

    #[test]
    fn timeout_is_reported() {
        let err = run_scenario_str(
            r#"
            name = "unreachable"
            config = { loss_rate = 1.0 }
            actions = [{ type = "app_send", time = 0, data = "x" }]
            assertions = [{ type = "max_duration", ms = 2000 }]
            "#,
        )
        .err()
        .expect("scenario should fail");
        assert!(err.to_string().contains("timed out after 2000 ms"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = run_scenario_str(
            r#"
            name = "bad"
            engine = { window_size = 0 }
            actions = []
            "#,
        )
        .err()
        .expect("scenario should fail");
        assert!(format!("{err:#}").contains("window_size"));
    }
}
