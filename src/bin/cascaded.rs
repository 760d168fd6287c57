//! cascaded - event confirmation daemon
//!
//! This daemon:
//! 1. Reads frames from the configured sources
//! 2. Turns scene changes into debounced triggers, one in flight per source
//! 3. Runs each trigger through the configured confirmation stages
//! 4. Delivers confirmed events to the log sink (and MQTT when configured)
//! 5. Records every terminal outcome, confirmed or not

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use cascade_kernel::{
    config::CascadeConfig, notify::MqttSink, stages, FanoutObserver, FrameSource,
    JsonLinesObserver, LogObserver, LogSink, NotificationSink, Pipeline, SyntheticSource,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cascading event confirmation daemon")]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CASCADE_CONFIG")]
    config: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long, env = "CASCADE_RUN_FOR_SECS")]
    run_for_secs: Option<u64>,

    /// Append every outcome as JSON lines to this file.
    #[arg(long, env = "CASCADE_OUTCOME_LOG")]
    outcome_log: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CascadeConfig::load_from(args.config.as_deref())?;
    if let Some(path) = args.outcome_log {
        config.outcome_log = Some(path);
    }

    let sources = config
        .sources
        .iter()
        .map(|s| {
            let source = SyntheticSource::new(s.synthetic())
                .with_context(|| format!("open source {}", s.id))?;
            Ok(Box::new(source) as Box<dyn FrameSource>)
        })
        .collect::<Result<Vec<_>>>()?;

    let cascade_stages = stages::build_stages(&config.stages)?;
    log::info!(
        "cascade stages: [{}]",
        config
            .stages
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink::default())];
    if let Some(mqtt) = &config.mqtt {
        sinks.push(Arc::new(MqttSink::connect(mqtt)?));
    }

    let mut observer = FanoutObserver::new().with(Arc::new(LogObserver));
    if let Some(path) = &config.outcome_log {
        observer = observer.with(Arc::new(JsonLinesObserver::append_to(path)?));
        log::info!("recording outcomes to {}", path.display());
    }

    let handle = Pipeline::start(
        config.pipeline_settings(),
        sources,
        cascade_stages,
        sinks,
        Arc::new(observer),
    )?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    match args.run_for_secs {
        Some(secs) => {
            log::info!("cascaded running for {}s", secs);
            let _ = rx.recv_timeout(Duration::from_secs(secs));
        }
        None => {
            log::info!("cascaded waiting for shutdown signal (Ctrl-C)...");
            let _ = rx.recv();
        }
    }

    log::info!("shutdown signal received, draining cascades...");
    let report = handle.shutdown(config.shutdown_grace);
    if !report.is_clean() {
        log::warn!(
            "shutdown was not clean: undispatched={} detached_threads={}",
            report.undispatched,
            report.detached_threads
        );
    }
    Ok(())
}
