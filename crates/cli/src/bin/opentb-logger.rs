use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use opentb_cli::args::LoggerArgs;
use opentb_cli::jsonl::{JsonlError, JsonlLog};
use opentb_cli::logging::init_tracing;
use opentb_cli::shutdown::shutdown_signal;
use opentb_mqtt::{MqttConfig, MqttService, QoS};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = LoggerArgs::parse();
    init_tracing(args.loglevel);

    if let Err(msg) = args.validate() {
        error!("{}", msg);
        return ExitCode::from(1);
    }

    let log = match JsonlLog::create(&args.log_directory, &args.logfile) {
        Ok(log) => log,
        Err(err) => {
            error!(%err, "Cannot create log file");
            return ExitCode::from(3);
        }
    };
    info!(path = %log.path().display(), "Logging to file");

    match record(args, log).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(2)
        }
    }
}

async fn record(args: LoggerArgs, mut log: JsonlLog) -> Result<()> {
    let mut config = MqttConfig::from_env().with_client_suffix("logger");
    if let Some(host) = args.broker {
        config.host = host;
    }
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
    info!(host = %config.host, port = config.port, "Connecting to broker");

    let mqtt = MqttService::connect(config).await?;
    let outcome = async {
        mqtt.wait_connected(connect_timeout).await?;
        let mut messages = mqtt.messages();
        mqtt.subscribe_acked(std::slice::from_ref(&args.topic), QoS::AtMostOnce)
            .await
            .with_context(|| format!("subscribing to {}", args.topic))?;
        info!(topic = %args.topic, "Recording");

        let deadline = (args.runtime > 0.0).then(|| Instant::now() + Duration::from_secs_f64(args.runtime));
        let runtime_elapsed = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(runtime_elapsed);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        let mut written = 0usize;
        loop {
            tokio::select! {
                msg = messages.recv() => match msg {
                    Ok(msg) => match log.append(&msg.payload) {
                        Ok(()) => {
                            written += 1;
                            debug!(topic = %msg.topic, "Recorded message");
                        }
                        Err(JsonlError::Json(err)) => {
                            warn!(topic = %msg.topic, %err, "Skipping payload that is not JSON");
                        }
                        Err(err) => return Err(anyhow::Error::from(err)),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Logger fell behind, messages lost"),
                    Err(RecvError::Closed) => break,
                },
                _ = &mut runtime_elapsed => {
                    info!("Runtime elapsed");
                    break;
                }
                _ = &mut shutdown => {
                    info!("Interrupted");
                    break;
                }
            }
        }
        info!(written, "Stopped recording");
        Ok::<_, anyhow::Error>(())
    }
    .await;

    if let Err(err) = mqtt.disconnect().await {
        warn!(%err, "Failed to disconnect from broker");
    }
    outcome
}
