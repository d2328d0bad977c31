use std::{path::PathBuf, process, sync::Arc, time::Duration};

use structopt::StructOpt;
use tokio::{signal, time};
use tracing_subscriber::*;

use nebula_node::{
    recorder::{run_recorder_service, RecordService},
    round::RoundDriver,
    settings::Settings,
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Nebula node")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let Settings {
        node: node_settings,
        selector: selector_settings,
        aggregator: aggregator_settings,
        simulation: simulation_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let (record_service, recorder) = RecordService::new();
    let records_handle = tokio::spawn(run_recorder_service(record_service));

    let mut driver = RoundDriver::from_settings(
        &node_settings,
        selector_settings,
        &aggregator_settings,
        &simulation_settings,
        Arc::new(recorder),
    )
    .unwrap_or_else(|err| {
        error!("failed to initialize the node: {}", err);
        process::exit(1);
    });
    let rounds = node_settings.rounds;
    let mut interval = time::interval(Duration::from_millis(node_settings.round_interval));

    let run = async {
        let mut round = 0;
        while rounds == 0 || round < rounds {
            interval.tick().await;
            match driver.run_round(round) {
                Ok(aggregated) => info!(
                    "round {} aggregated with {} ({})",
                    round, aggregated.strategy, aggregated.route,
                ),
                Err(err) => warn!("skipping round {}: {}", round, err),
            }
            round += 1;
        }
    };

    tokio::select! {
        _ = run => {
            info!("shutting down: all rounds completed");
        }
        _ = signal::ctrl_c() => {
            warn!("shutting down: interrupted");
        }
    }

    // The driver owns the last recorder, dropping it lets the record service drain and finish.
    drop(driver);
    match records_handle.await {
        Ok(handled) => debug!("record service handled {} records", handled),
        Err(err) => error!("record service failed: {}", err),
    }
}
