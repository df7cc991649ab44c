//! memd-config-watch - stream cluster configuration over HTTP
//!
//! Connects to the management service of the given hosts, follows the
//! bucket's configuration stream and logs every new generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tracing::{error, info, trace, warn, Level};
use tracing_subscriber::FmtSubscriber;

use memd_engine::cluster::{ConfigMonitor, ConfigOrigin, Confmon, MonitorEvent, RefreshPolicy};
use memd_engine::config::{CliArgs, EngineSettings};
use memd_engine::io::{MioReactor, Transport};
use memd_engine::provider::{HttpProvider, ProviderEnv};

/// Poll interval while no timer is armed
const IDLE_POLL: Duration = Duration::from_millis(500);

fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else if verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

struct WatchEnv {
    reactor: MioReactor,
    monitor: Confmon,
}

impl ProviderEnv for WatchEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn transport(&mut self) -> &mut dyn Transport {
        &mut self.reactor
    }

    fn monitor(&mut self) -> &mut dyn ConfigMonitor {
        &mut self.monitor
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse_args();
    args.validate().map_err(|e| anyhow!(e))?;
    setup_logging(args.verbose, args.quiet)?;

    let settings = Arc::new(
        EngineSettings::from_cli(&args).map_err(|e| anyhow!("Configuration error: {}", e))?,
    );
    let nodes = settings.bootstrap_hosts()?;
    info!(
        "memd-config-watch v{}: bucket {} via {} host(s)",
        env!("CARGO_PKG_VERSION"),
        settings.bucket,
        nodes.len()
    );

    let mut env = WatchEnv {
        reactor: MioReactor::new()?,
        monitor: Confmon::new(settings.refresh_throttle(), settings.refresh_error_threshold),
    };
    env.monitor.set_current_provider(ConfigOrigin::Http);

    let mut provider = HttpProvider::new(Arc::clone(&settings));
    provider.configure_nodes(&nodes);

    env.monitor.request_refresh(Instant::now(), RefreshPolicy::Always);
    provider.refresh(&mut env);

    let mut seen = 0u64;
    loop {
        let timeout = provider
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_POLL);

        for event in env.reactor.poll(timeout)? {
            if let Some(other) = provider.handle_event(&mut env, event) {
                trace!("Dropping event without owner: {:?}", other);
            }
        }
        provider.on_timer(&mut env);

        for event in env.monitor.take_events() {
            match event {
                MonitorEvent::NewConfig(doc) => {
                    seen += 1;
                    info!(
                        "Generation {}: rev {} with {} data servers and {} vbuckets",
                        doc.generation,
                        doc.rev(),
                        doc.config.num_data_servers(),
                        doc.config.num_vbuckets()
                    );
                    provider.config_updated(&doc);
                    if args.dump {
                        println!("{}", provider.dump());
                    }
                    if args.count.is_some_and(|n| seen >= n) {
                        provider.close(&mut env);
                        return Ok(());
                    }
                }
                MonitorEvent::ProviderFailed(origin, err) => {
                    if provider.next_deadline().is_none() {
                        provider.close(&mut env);
                        return Err(anyhow!("{} provider failed: {}", origin, err));
                    }
                    warn!("{} provider failed ({}); retrying", origin, err);
                }
            }
        }
    }
}

fn main() {
    if let Err(e) = run() {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
