use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use opentb_cli::args::Args;
use opentb_cli::logging::init_tracing;
use opentb_cli::shutdown::shutdown_signal;
use opentb_core::{
    BrokerError, Command, CommandKind, FirmwareImage, Orchestrator, RunConfig,
    RunContext, RunError, Targets,
};
use opentb_mqtt::{MqttConfig, MqttError, MqttService};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let args = Args::parse();
    init_tracing(args.loglevel);

    if let Err(msg) = args.validate() {
        error!("{}", msg);
        return ExitCode::from(1);
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            if code != 130 {
                error!("{:#}", err);
            }
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let targets = Targets::from_ids(args.devices.iter().cloned());
    let duplicates = targets.duplicates();
    if !duplicates.is_empty() {
        warn!(?duplicates, "Device ids listed more than once");
    }

    let kind = CommandKind::from(args.cmd);
    let command = match (kind, &args.hexfile) {
        (CommandKind::Program, Some(path)) => {
            info!(board = ?args.board, hexfile = %path.display(), "Loading firmware image");
            Command::Program(FirmwareImage::load(path)?)
        }
        (CommandKind::Program, None) => anyhow::bail!("a hexfile is required for the 'program' command"),
        (CommandKind::DiscoverMotes, _) => Command::DiscoverMotes,
    };

    let mut config = RunConfig::from_env();
    if let Some(secs) = args.timeout {
        config.response_timeout = Duration::from_secs(secs);
    }

    let orchestrator = Orchestrator::new(RunContext {
        command,
        targets,
        config,
    })?;
    let plan = orchestrator.plan();
    info!(
        cmd = %plan.kind,
        publications = plan.publications.len(),
        expected = plan.expected_units,
        "Command prepared"
    );

    let mut mqtt_config = MqttConfig::from_env();
    if let Some(host) = args.broker {
        mqtt_config.host = host;
    }
    if let Some(port) = args.port {
        mqtt_config.port = port;
    }
    let connect_timeout = Duration::from_secs(mqtt_config.connect_timeout_secs);
    info!(host = %mqtt_config.host, port = mqtt_config.port, "Connecting to broker");

    let mqtt = MqttService::connect(mqtt_config).await?;
    let connected = tokio::select! {
        res = mqtt.wait_connected(connect_timeout) => res.map_err(anyhow::Error::from),
        _ = shutdown_signal() => Err(RunError::Interrupted.into()),
    };
    if let Err(err) = connected {
        if let Err(disconnect_err) = mqtt.disconnect().await {
            warn!(%disconnect_err, "Failed to disconnect from broker");
        }
        return Err(err);
    }

    let report = orchestrator.run(&mqtt, shutdown_signal()).await?;
    report.log();
    if args.json {
        let json = serde_json::to_string_pretty(&report).context("serializing report")?;
        println!("{}", json);
    }
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(err) = err.downcast_ref::<RunError>() {
        return match err {
            RunError::Interrupted => 130,
            RunError::Broker(_) => 2,
            RunError::Plan(_) | RunError::Correlator(_) => 1,
        };
    }
    if err.downcast_ref::<MqttError>().is_some() || err.downcast_ref::<BrokerError>().is_some() {
        return 2;
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentb_core::CommandError;

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(exit_code(&RunError::Interrupted.into()), 130);
        assert_eq!(exit_code(&MqttError::ConnectTimeout(Duration::from_secs(1)).into()), 2);
        let subscribe = BrokerError::SubscribeTimeout {
            topics: vec!["t".into()],
            timeout: Duration::from_secs(10),
        };
        assert_eq!(exit_code(&RunError::Broker(subscribe).into()), 2);
        assert_eq!(exit_code(&CommandError::ImageNotFlashable("main.ihex".into()).into()), 1);
    }
}
