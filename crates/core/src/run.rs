//! One command run, from plan to report.

use std::future::Future;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::broker::{Broker, BrokerError};
use crate::commands::Command;
use crate::completion::CompletionDetector;
use crate::config::RunConfig;
use crate::correlator::{correlate, Correlator, ResponseUnit};
use crate::dispatcher::{DispatchPlan, Dispatcher, PlanError, Targets};
use crate::report::Report;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("correlator task failed: {0}")]
    Correlator(#[from] JoinError),
    #[error("run interrupted")]
    Interrupted,
}

/// Everything fixed for the duration of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub command: Command,
    pub targets: Targets,
    pub config: RunConfig,
}

pub struct Orchestrator {
    ctx: RunContext,
    plan: DispatchPlan,
}

impl Orchestrator {
    /// Builds every payload up front so an unusable image fails before connecting.
    pub fn new(ctx: RunContext) -> Result<Self, RunError> {
        let plan = DispatchPlan::new(&ctx.command, &ctx.targets, &ctx.config.fleet)?;
        Ok(Self { ctx, plan })
    }

    pub fn plan(&self) -> &DispatchPlan {
        &self.plan
    }

    /// Runs the command and disconnects `broker` on every exit path.
    pub async fn run<B, S>(self, broker: &B, shutdown: S) -> Result<Report, RunError>
    where
        B: Broker + ?Sized,
        S: Future<Output = ()>,
    {
        let outcome = self.execute(broker, shutdown).await;
        if let Err(err) = broker.disconnect().await {
            warn!(%err, "Failed to disconnect from broker");
        }
        outcome
    }

    async fn execute<B, S>(&self, broker: &B, shutdown: S) -> Result<Report, RunError>
    where
        B: Broker + ?Sized,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        // Receiver exists before subscribing so no early response is missed.
        let (units_tx, mut units_rx) = mpsc::unbounded_channel();
        let task = CorrelatorTask::spawn(
            Correlator::new(self.plan.kind, self.plan.matcher.clone()),
            broker,
            units_tx,
        );

        let dispatcher = Dispatcher::new(broker, self.ctx.config.subscribe_timeout);
        let pending = tokio::select! {
            pending = dispatcher.dispatch(&self.plan) => pending?,
            _ = &mut shutdown => return Err(RunError::Interrupted),
        };

        let mut detector = CompletionDetector::new(pending.expected_units, self.ctx.config.response_timeout);
        let completion = tokio::select! {
            state = detector.run(&mut units_rx) => state,
            _ = &mut shutdown => {
                info!("Interrupted, stop waiting for responses");
                return Err(RunError::Interrupted);
            }
        };

        let correlator = task.finish().await?;
        Ok(Report::aggregate(&correlator, &self.ctx.targets, completion))
    }
}

/// Correlator task that is stopped however the run ends.
struct CorrelatorTask {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<Correlator>>,
}

impl CorrelatorTask {
    fn spawn<B: Broker + ?Sized>(
        correlator: Correlator,
        broker: &B,
        units: mpsc::UnboundedSender<ResponseUnit>,
    ) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(correlate(correlator, broker.inbound(), units, stop_rx));
        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    async fn finish(mut self) -> Result<Correlator, JoinError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.await,
            None => unreachable!("correlator task joined twice"),
        }
    }
}

impl Drop for CorrelatorTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
