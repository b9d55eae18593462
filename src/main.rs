use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use snmp_lld_agent::config::{self, Config};
use snmp_lld_agent::instance::Instance;
use snmp_lld_agent::storage::SampleList;

#[derive(Parser, Debug)]
#[command(name = "snmp-lld-agent", about = "SNMP poller with Zabbix template and discovery support")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/snmp-lld-agent/config.toml")]
    config: String,

    /// Validate config and templates, then exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    /// Run one discovery round and one poll, print the samples and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("snmp-lld-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&cli.config)?;

    if cli.check {
        let sink = SampleList::new(&config.output);
        for (i, inst) in config.instances.iter().enumerate() {
            let instance = Instance::new(inst.clone(), sink.clone())
                .with_context(|| format!("instance {}", i))?;
            let (items, rules) = instance
                .template()
                .map(|t| (t.items.len(), t.discovery_rules.len()))
                .unwrap_or_default();
            println!(
                "instance {}: {} agents, {} template items, {} discovery rules",
                i,
                instance.connections().agents().len(),
                items,
                rules
            );
        }
        println!("Configuration is valid.");
        return Ok(());
    }

    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.agent.hostname,
        instances = config.instances.len(),
        "Starting SNMP LLD agent"
    );

    let result = if cli.once { run_once(config).await } else { run(config).await };
    if let Err(e) = result {
        error!(error = %e, "Agent terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &config::Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    // Samples go to stdout; logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    match config.agent.log_format.as_str() {
        "json" => builder.json().init(),
        _ => builder.init(),
    }

    Ok(())
}

fn build_instances(config: &Config, sink: &SampleList) -> Result<Vec<Instance>> {
    config
        .instances
        .iter()
        .enumerate()
        .map(|(i, inst)| {
            Instance::new(inst.clone(), sink.clone()).with_context(|| format!("instance {}", i))
        })
        .collect()
}

/// Write drained samples as JSON lines to stdout.
fn write_samples(sink: &SampleList) -> Result<usize> {
    let samples = sink.drain();
    if samples.is_empty() {
        return Ok(0);
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for sample in &samples {
        serde_json::to_writer(&mut out, sample)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(samples.len())
}

async fn run_once(config: Config) -> Result<()> {
    let sink = SampleList::new(&config.output);
    let instances = build_instances(&config, &sink)?;

    for instance in &instances {
        let stats = instance.run_once().await;
        info!(
            polled = stats.polled,
            samples = stats.samples,
            errors = stats.errors,
            "Poll finished"
        );
        instance.stop().await;
    }

    write_samples(&sink)?;
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let sink = SampleList::new(&config.output);
    let instances = build_instances(&config, &sink)?;

    for instance in &instances {
        instance.start().await;
    }

    // Spawn output writer
    let cancel = CancellationToken::new();
    let writer = {
        let sink = sink.clone();
        let cancel = cancel.clone();
        let period = config.output.flush_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = write_samples(&sink) {
                            error!(error = %e, "Failed to write samples");
                        }
                        let dropped = sink.dropped();
                        if dropped > 0 {
                            tracing::debug!(dropped, "Samples dropped by the output buffer");
                        }
                    }
                }
            }
        })
    };

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, exiting");

    for instance in &instances {
        instance.stop().await;
    }
    cancel.cancel();
    if let Err(e) = writer.await {
        error!(error = %e, "Output writer panicked");
    }
    write_samples(&sink)?;

    Ok(())
}
