use std::fmt;

use serde::Serialize;
use tracing::info;

use crate::commands::CommandKind;
use crate::completion::CompletionState;
use crate::correlator::{Correlator, DiscoveryRecord};
use crate::dispatcher::Targets;

const RULE: &str = "----------------------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Ok,
    Fail,
    Mute,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Ok => "OK",
            Outcome::Fail => "FAIL",
            Outcome::Mute => "MUTE",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceOutcome {
    pub device: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub command: CommandKind,
    pub broadcast: bool,
    pub messages_received: usize,
    pub outcomes: Vec<DeviceOutcome>,
    /// Present for discovery runs, even when no mote was found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered: Option<Vec<DiscoveryRecord>>,
    pub completion: CompletionState,
}

impl Report {
    /// Classifies every target, or every responder for broadcast runs.
    pub fn aggregate(correlator: &Correlator, targets: &Targets, completion: CompletionState) -> Self {
        let classify = |device: &str| match correlator.record(device) {
            Some(record) if record.success => Outcome::Ok,
            Some(_) => Outcome::Fail,
            None => Outcome::Mute,
        };
        let devices: &[String] = match targets {
            Targets::All => correlator.responders(),
            Targets::Devices(ids) => ids,
        };
        let outcomes = devices
            .iter()
            .map(|device| DeviceOutcome {
                device: device.clone(),
                outcome: classify(device),
            })
            .collect();

        Self {
            command: correlator.kind(),
            broadcast: targets.is_all(),
            messages_received: correlator.messages_received(),
            outcomes,
            discovered: match correlator.kind() {
                CommandKind::DiscoverMotes => Some(correlator.discovered().to_vec()),
                CommandKind::Program => None,
            },
            completion,
        }
    }

    pub fn devices_with(&self, outcome: Outcome) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == outcome)
            .map(|o| o.device.as_str())
            .collect()
    }

    pub fn discovered_motes(&self) -> &[DiscoveryRecord] {
        self.discovered.as_deref().unwrap_or_default()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.iter().filter(|o| o.outcome == outcome).count()
    }

    pub fn log(&self) {
        info!("{}", RULE);
        match self.command {
            CommandKind::Program => {
                info!(
                    "{} of {} motes reported with success",
                    self.count(Outcome::Ok),
                    self.messages_received
                );
                for outcome in [Outcome::Ok, Outcome::Fail, Outcome::Mute] {
                    for device in self.devices_with(outcome) {
                        info!("    {} {}", device, outcome);
                    }
                }
            }
            CommandKind::DiscoverMotes => {
                info!("Discovered {} motes", self.discovered_motes().len());
                for mote in self.discovered_motes() {
                    info!(
                        "    {} {} {} {}",
                        mote.eui64.as_deref().unwrap_or("None"),
                        mote.box_id,
                        mote.port,
                        u8::from(mote.bootloaded)
                    );
                }
                for device in self.devices_with(Outcome::Fail) {
                    info!("    box {} FAIL", device);
                }
                for device in self.devices_with(Outcome::Mute) {
                    info!("    box {} MUTE", device);
                }
            }
        }
        info!("{}", RULE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InboundMessage;
    use crate::topics::{compile, response_template, response_topic, DeviceType, DEVICE_FIELD};

    fn correlator(kind: CommandKind) -> Correlator {
        let (_, matcher) = compile(&response_template(kind.device_type(), kind.as_str()), DEVICE_FIELD).unwrap();
        Correlator::new(kind, matcher)
    }

    fn respond(c: &mut Correlator, device: &str, payload: &str) {
        let kind = c.kind();
        c.handle(&InboundMessage::new(
            response_topic(kind.device_type(), device, kind.as_str()),
            payload,
        ));
    }

    fn done(expected: usize, received: usize) -> CompletionState {
        CompletionState {
            expected,
            received,
            exhausted: received < expected,
        }
    }

    #[test]
    fn responded_and_silent_targets_are_classified() {
        let mut c = correlator(CommandKind::Program);
        respond(&mut c, "dev1", r#"{"success":true}"#);
        let targets = Targets::from_ids(["dev1", "dev2"]);
        let report = Report::aggregate(&c, &targets, done(2, 1));
        assert_eq!(report.devices_with(Outcome::Ok), ["dev1"]);
        assert_eq!(report.devices_with(Outcome::Mute), ["dev2"]);
        assert!(report.devices_with(Outcome::Fail).is_empty());
    }

    #[test]
    fn failed_response_is_fail() {
        let mut c = correlator(CommandKind::Program);
        respond(&mut c, "dev1", r#"{"success":false}"#);
        let report = Report::aggregate(&c, &Targets::from_ids(["dev1"]), done(1, 1));
        assert_eq!(report.devices_with(Outcome::Fail), ["dev1"]);
    }

    #[test]
    fn every_target_gets_exactly_one_outcome_in_order() {
        let mut c = correlator(CommandKind::Program);
        respond(&mut c, "c", r#"{"success":true}"#);
        respond(&mut c, "a", r#"{"success":false}"#);
        respond(&mut c, "stranger", r#"{"success":true}"#);
        let targets = Targets::from_ids(["a", "b", "c", "d"]);
        let report = Report::aggregate(&c, &targets, done(4, 3));

        let order: Vec<&str> = report.outcomes.iter().map(|o| o.device.as_str()).collect();
        assert_eq!(order, ["a", "b", "c", "d"]);
        assert_eq!(
            report.count(Outcome::Ok) + report.count(Outcome::Fail) + report.count(Outcome::Mute),
            4
        );
        assert_eq!(report.messages_received, 3);
    }

    #[test]
    fn broadcast_lists_responders_only() {
        let mut c = correlator(CommandKind::Program);
        respond(&mut c, "m2", r#"{"success":true}"#);
        respond(&mut c, "m1", r#"{"success":false}"#);
        let report = Report::aggregate(&c, &Targets::All, done(80, 2));
        assert!(report.broadcast);
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.outcomes[0].device, "m2");
        assert_eq!(report.count(Outcome::Mute), 0);
    }

    #[test]
    fn discovery_report_keeps_records_grouped_by_box() {
        let mut c = correlator(CommandKind::DiscoverMotes);
        respond(&mut c, "otbox01", r#"{"success":true,"returnVal":{"motes":[{"serialport":"p0","bootload_success":true}]}}"#);
        let report = Report::aggregate(&c, &Targets::from_ids(["otbox01", "otbox02"]), done(2, 1));
        assert_eq!(report.discovered_motes().len(), 1);
        assert_eq!(report.discovered_motes()[0].box_id, "otbox01");
        assert_eq!(report.devices_with(Outcome::Mute), ["otbox02"]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["command"], "discovermotes");
        assert_eq!(json["outcomes"][1]["outcome"], "MUTE");
        assert_eq!(json["discovered"][0]["box"], "otbox01");
    }

    #[test]
    fn empty_discovery_still_serializes_discovered() {
        let mut c = correlator(CommandKind::DiscoverMotes);
        respond(&mut c, "otbox01", r#"{"success":true,"returnVal":{"motes":[]}}"#);
        let report = Report::aggregate(&c, &Targets::All, done(14, 1));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["discovered"], serde_json::json!([]));

        let program = Report::aggregate(&correlator(CommandKind::Program), &Targets::All, done(80, 0));
        let json = serde_json::to_value(&program).unwrap();
        assert!(json.get("discovered").is_none());
    }
}
