//! Classifies inbound responses and records them per device.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::broker::InboundMessage;
use crate::commands::{CommandKind, DiscoverResponse, ProgramResponse};
use crate::topics::TopicMatcher;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    pub received: bool,
    pub success: bool,
    pub payload: Value,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryRecord {
    #[serde(rename = "box")]
    pub box_id: String,
    pub port: String,
    pub eui64: Option<String>,
    pub bootloaded: bool,
}

/// One expected response that arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseUnit {
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Accepted(ResponseUnit),
    /// Repeat from a device that already answered; its record is overwritten.
    Updated,
    /// Device reported an internal exception; not a response.
    Ignored,
    /// Unparseable payload or unexpected topic.
    Dropped,
}

/// Owns every record of a run; only the correlator task writes to it.
#[derive(Debug)]
pub struct Correlator {
    kind: CommandKind,
    matcher: TopicMatcher,
    records: HashMap<String, ResponseRecord>,
    responders: Vec<String>,
    discovered: Vec<DiscoveryRecord>,
    messages: usize,
}

impl Correlator {
    pub fn new(kind: CommandKind, matcher: TopicMatcher) -> Self {
        Self {
            kind,
            matcher,
            records: HashMap::new(),
            responders: Vec::new(),
            discovered: Vec::new(),
            messages: 0,
        }
    }

    pub fn handle(&mut self, message: &InboundMessage) -> Disposition {
        let topic = message.topic.as_str();
        let value: Value = match serde_json::from_slice(&message.payload) {
            Ok(v) => v,
            Err(err) => {
                warn!(%topic, %err, "Dropping unparseable response");
                return Disposition::Dropped;
            }
        };
        if value.get("exception").is_some() {
            debug!(%topic, "exception ignored");
            return Disposition::Ignored;
        }
        let device = match self.matcher.extract(topic) {
            Ok(d) => d,
            Err(err) => {
                warn!(%err, "Dropping response on unexpected topic");
                return Disposition::Dropped;
            }
        };
        debug!(%topic, payload = %value, "responded");

        let success = match self.kind {
            CommandKind::Program => match serde_json::from_value::<ProgramResponse>(value.clone()) {
                Ok(resp) => resp.success,
                Err(err) => {
                    warn!(%topic, %err, "Dropping malformed program response");
                    return Disposition::Dropped;
                }
            },
            CommandKind::DiscoverMotes => {
                match serde_json::from_value::<DiscoverResponse>(value.clone()) {
                    Ok(resp) => self.record_discovery(&device, resp),
                    Err(err) => {
                        warn!(%topic, %err, "Dropping malformed discovery response");
                        return Disposition::Dropped;
                    }
                }
            }
        };

        let first = !self.records.contains_key(&device);
        if first {
            self.responders.push(device.clone());
        }
        self.records.insert(
            device.clone(),
            ResponseRecord {
                received: true,
                success,
                payload: value,
                topic: topic.to_string(),
            },
        );
        self.messages += 1;
        if first {
            Disposition::Accepted(ResponseUnit { device })
        } else {
            debug!(%device, "repeated response, record overwritten");
            Disposition::Updated
        }
    }

    fn record_discovery(&mut self, box_id: &str, resp: DiscoverResponse) -> bool {
        if !resp.success {
            error!(box_id, "discover motes on box failed");
            return false;
        }
        for mote in resp.return_val.unwrap_or_default().motes {
            self.discovered.push(DiscoveryRecord {
                box_id: box_id.to_string(),
                port: mote.serialport,
                eui64: mote.eui64,
                bootloaded: mote.bootload_success,
            });
        }
        true
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn record(&self, device: &str) -> Option<&ResponseRecord> {
        self.records.get(device)
    }

    /// Devices that produced a record, in first-arrival order.
    pub fn responders(&self) -> &[String] {
        &self.responders
    }

    pub fn discovered(&self) -> &[DiscoveryRecord] {
        &self.discovered
    }

    /// Accepted responses, duplicates included.
    pub fn messages_received(&self) -> usize {
        self.messages
    }
}

/// Feeds inbound messages to `correlator` until `stop` fires or the broker goes away.
pub async fn correlate(
    mut correlator: Correlator,
    mut inbound: broadcast::Receiver<InboundMessage>,
    units: mpsc::UnboundedSender<ResponseUnit>,
    mut stop: oneshot::Receiver<()>,
) -> Correlator {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            received = inbound.recv() => match received {
                Ok(message) => {
                    if let Disposition::Accepted(unit) = correlator.handle(&message) {
                        // The controller may already be done waiting.
                        let _ = units.send(unit);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Correlator lagged behind inbound messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    correlator
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::{compile, response_template, response_topic, DeviceType, DEVICE_FIELD};

    fn correlator(kind: CommandKind) -> Correlator {
        let (_, matcher) = compile(&response_template(kind.device_type(), kind.as_str()), DEVICE_FIELD).unwrap();
        Correlator::new(kind, matcher)
    }

    fn program_resp(device: &str, payload: &str) -> InboundMessage {
        InboundMessage::new(response_topic(DeviceType::Mote, device, "program"), payload)
    }

    fn discover_resp(device: &str, payload: &str) -> InboundMessage {
        InboundMessage::new(response_topic(DeviceType::Box, device, "discovermotes"), payload)
    }

    #[test]
    fn program_success_and_failure_are_recorded() {
        let mut c = correlator(CommandKind::Program);
        assert_eq!(
            c.handle(&program_resp("dev1", r#"{"success":true}"#)),
            Disposition::Accepted(ResponseUnit { device: "dev1".into() })
        );
        c.handle(&program_resp("dev2", r#"{"success":false,"returnVal":{}}"#));
        assert!(c.record("dev1").unwrap().success);
        assert!(!c.record("dev2").unwrap().success);
        assert_eq!(c.record("dev2").unwrap().topic, response_topic(DeviceType::Mote, "dev2", "program"));
        assert_eq!(c.messages_received(), 2);
    }

    #[test]
    fn exception_is_ignored_and_later_response_counts() {
        let mut c = correlator(CommandKind::Program);
        assert_eq!(c.handle(&program_resp("dev1", r#"{"exception":"SerialException"}"#)), Disposition::Ignored);
        assert!(c.record("dev1").is_none());
        assert_eq!(c.messages_received(), 0);

        assert!(matches!(c.handle(&program_resp("dev1", r#"{"success":true}"#)), Disposition::Accepted(_)));
        assert!(c.record("dev1").unwrap().success);
    }

    #[test]
    fn unparseable_and_mismatched_messages_are_dropped() {
        let mut c = correlator(CommandKind::Program);
        assert_eq!(c.handle(&program_resp("dev1", "not json")), Disposition::Dropped);
        assert_eq!(c.handle(&program_resp("dev1", r#"{"returnVal":1}"#)), Disposition::Dropped);
        assert_eq!(c.handle(&program_resp("dev1", "[1,2]")), Disposition::Dropped);
        assert_eq!(
            c.handle(&InboundMessage::new("opentestbed/deviceType/mote/deviceId/dev1/cmd/program", r#"{"success":true}"#)),
            Disposition::Dropped
        );
        assert!(c.responders().is_empty());
    }

    #[test]
    fn later_response_overwrites_earlier_one() {
        let mut c = correlator(CommandKind::Program);
        assert!(matches!(c.handle(&program_resp("dev1", r#"{"success":false}"#)), Disposition::Accepted(_)));
        assert_eq!(c.handle(&program_resp("dev1", r#"{"success":true}"#)), Disposition::Updated);
        assert!(c.record("dev1").unwrap().success);
        assert_eq!(c.responders(), ["dev1"]);
        assert_eq!(c.messages_received(), 2);
    }

    #[test]
    fn discovery_appends_one_record_per_mote() {
        let mut c = correlator(CommandKind::DiscoverMotes);
        c.handle(&discover_resp(
            "otbox01",
            r#"{"success":true,"returnVal":{"motes":[
                {"EUI64":"00-12-4b-00-14-b5-b4-98","serialport":"/dev/ttyUSB1","bootload_success":true},
                {"serialport":"/dev/ttyUSB3","bootload_success":false}]}}"#,
        ));
        assert_eq!(
            c.discovered(),
            [
                DiscoveryRecord {
                    box_id: "otbox01".into(),
                    port: "/dev/ttyUSB1".into(),
                    eui64: Some("00-12-4b-00-14-b5-b4-98".into()),
                    bootloaded: true,
                },
                DiscoveryRecord {
                    box_id: "otbox01".into(),
                    port: "/dev/ttyUSB3".into(),
                    eui64: None,
                    bootloaded: false,
                },
            ]
        );
        assert!(c.record("otbox01").unwrap().success);
    }

    #[test]
    fn failed_discovery_counts_as_response_without_motes() {
        let mut c = correlator(CommandKind::DiscoverMotes);
        let disposition = c.handle(&discover_resp("otbox02", r#"{"success":false}"#));
        assert!(matches!(disposition, Disposition::Accepted(_)));
        assert!(c.discovered().is_empty());
        assert!(!c.record("otbox02").unwrap().success);
    }

    #[test]
    fn duplicate_discovery_is_not_deduplicated() {
        let mut c = correlator(CommandKind::DiscoverMotes);
        let payload = r#"{"success":true,"returnVal":{"motes":[{"serialport":"/dev/ttyUSB0","bootload_success":true}]}}"#;
        c.handle(&discover_resp("otbox01", payload));
        c.handle(&discover_resp("otbox01", payload));
        assert_eq!(c.discovered().len(), 2);
    }

    #[tokio::test]
    async fn task_signals_accepted_responses_and_returns_records() {
        let (tx, rx) = broadcast::channel(16);
        let (units_tx, mut units_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(correlate(correlator(CommandKind::Program), rx, units_tx, stop_rx));

        tx.send(program_resp("dev1", r#"{"exception":"boom"}"#)).unwrap();
        tx.send(program_resp("dev1", r#"{"success":true}"#)).unwrap();
        assert_eq!(units_rx.recv().await.unwrap().device, "dev1");

        tx.send(program_resp("dev1", r#"{"success":false}"#)).unwrap();
        tx.send(program_resp("dev2", r#"{"success":true}"#)).unwrap();
        assert_eq!(units_rx.recv().await.unwrap().device, "dev2");

        stop_tx.send(()).unwrap();
        let c = task.await.unwrap();
        assert_eq!(c.messages_received(), 3);
        assert!(units_rx.try_recv().is_err());
    }
}
