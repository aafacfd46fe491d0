pub mod broker;
pub mod commands;
pub mod completion;
pub mod config;
pub mod correlator;
pub mod dispatcher;
pub mod image;
pub mod report;
pub mod run;
pub mod topics;

#[cfg(test)]
pub(crate) mod testing;

pub use broker::{Broker, BrokerError, InboundMessage};
pub use commands::{Command, CommandError, CommandKind, FirmwareImage};
pub use completion::{CompletionDetector, CompletionState, Phase};
pub use config::{FleetConfig, RunConfig};
pub use correlator::{Correlator, DiscoveryRecord, Disposition, ResponseRecord, ResponseUnit};
pub use dispatcher::{DispatchPlan, Dispatcher, PendingRun, PlanError, Publication, Targets};
pub use image::is_flashable;
pub use report::{DeviceOutcome, Outcome, Report};
pub use run::{Orchestrator, RunContext, RunError};
pub use topics::*;
