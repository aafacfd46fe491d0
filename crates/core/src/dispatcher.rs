//! Turns a command and a target set into subscriptions and publishes.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::broker::{Broker, BrokerError};
use crate::commands::{Command, CommandError, CommandKind};
use crate::config::FleetConfig;
use crate::topics::{
    command_topic, response_template, DeviceType, TopicError, TopicMatcher, TopicTemplate,
    BROADCAST_ID, DEVICE_FIELD,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
    /// Every unit of the fleet; the remote side fans the command out.
    All,
    Devices(Vec<String>),
}

impl Targets {
    /// Any literal `all` among the ids selects the whole fleet.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = ids.into_iter().map(Into::into).collect();
        if ids.is_empty() || ids.iter().any(|id| id == BROADCAST_ID) {
            Targets::All
        } else {
            Targets::Devices(ids)
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Targets::All)
    }

    /// One unit per distinct device; repeated ids share a single response.
    pub fn expected_units(&self, fleet_size: usize) -> usize {
        match self {
            Targets::All => fleet_size,
            Targets::Devices(ids) => ids.iter().collect::<HashSet<_>>().len(),
        }
    }

    /// Ids listed more than once, in first-repeat order.
    pub fn duplicates(&self) -> Vec<&str> {
        let Targets::Devices(ids) = self else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut dups = Vec::new();
        for id in ids {
            if !seen.insert(id.as_str()) && !dups.contains(&id.as_str()) {
                dups.push(id.as_str());
            }
        }
        dups
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error("invalid device id '{0}'")]
    InvalidDevice(String),
}

#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Everything a run will put on the wire, computed before connecting.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub kind: CommandKind,
    pub device_type: DeviceType,
    pub subscriptions: Vec<String>,
    pub publications: Vec<Publication>,
    pub expected_units: usize,
    pub matcher: TopicMatcher,
}

impl DispatchPlan {
    pub fn new(command: &Command, targets: &Targets, fleet: &FleetConfig) -> Result<Self, PlanError> {
        let kind = command.kind();
        let device_type = kind.device_type();
        let template = TopicTemplate::parse(&response_template(device_type, kind.as_str()))?;
        let matcher = template.matcher(DEVICE_FIELD)?;

        let (subscriptions, publications) = match targets {
            Targets::All => {
                let publication = Publication {
                    topic: command_topic(device_type, BROADCAST_ID, kind.as_str()),
                    payload: command.build_payload(BROADCAST_ID)?,
                };
                (vec![template.subscribe_topic().to_string()], vec![publication])
            }
            Targets::Devices(ids) => {
                let mut subscriptions: Vec<String> = Vec::with_capacity(ids.len());
                let mut publications = Vec::with_capacity(ids.len());
                for id in ids {
                    if id.is_empty() || id.contains(['/', '+', '#']) {
                        return Err(PlanError::InvalidDevice(id.clone()));
                    }
                    let response = template.render(&[(DEVICE_FIELD, id.as_str())])?;
                    if !subscriptions.contains(&response) {
                        subscriptions.push(response);
                    }
                    publications.push(Publication {
                        topic: command_topic(device_type, id, kind.as_str()),
                        payload: command.build_payload(id)?,
                    });
                }
                (subscriptions, publications)
            }
        };

        Ok(Self {
            kind,
            device_type,
            subscriptions,
            publications,
            expected_units: targets.expected_units(fleet.size_of(device_type)),
            matcher,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRun {
    pub expected_units: usize,
    pub published: usize,
}

pub struct Dispatcher<'a, B: Broker + ?Sized> {
    broker: &'a B,
    subscribe_timeout: Duration,
}

impl<'a, B: Broker + ?Sized> Dispatcher<'a, B> {
    pub fn new(broker: &'a B, subscribe_timeout: Duration) -> Self {
        Self {
            broker,
            subscribe_timeout,
        }
    }

    /// Subscribes to every response topic, waits for the acknowledgement, then publishes.
    pub async fn dispatch(&self, plan: &DispatchPlan) -> Result<PendingRun, BrokerError> {
        for topic in &plan.subscriptions {
            debug!(%topic, "Subscribing");
        }
        match tokio::time::timeout(self.subscribe_timeout, self.broker.subscribe(&plan.subscriptions)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BrokerError::SubscribeTimeout {
                    topics: plan.subscriptions.clone(),
                    timeout: self.subscribe_timeout,
                })
            }
        }

        for publication in &plan.publications {
            debug!(topic = %publication.topic, "Publish");
            self.broker
                .publish(&publication.topic, publication.payload.clone())
                .await?;
        }
        info!(
            cmd = %plan.kind,
            published = plan.publications.len(),
            expected = plan.expected_units,
            "Command dispatched"
        );

        Ok(PendingRun {
            expected_units: plan.expected_units,
            published: plan.publications.len(),
        })
    }
}
