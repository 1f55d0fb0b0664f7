use anyhow::Context;
use clap::Parser;
use log::info;
use sim_uart_pipeline::{
    link_channel, LinePoller, Pipeline, PipelineConfig, SmallestDivisorProcessor,
    VirtualSerialTransport,
};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;

/// Simulated device: numbers in on U2, smallest divisors of composites out on U3
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address both lines listen on
    #[arg(long)]
    host: Option<IpAddr>,

    #[arg(long)]
    ingest_port: Option<u16>,

    #[arg(long)]
    output_port: Option<u16>,

    /// Depth of the ingest -> compute queue
    #[arg(long)]
    queue_capacity: Option<usize>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(host) = self.host {
            config.bind_host = host;
        }
        if let Some(port) = self.ingest_port {
            config.ingest_port = port;
        }
        if let Some(port) = self.output_port {
            config.output_port = port;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(buf, "[{} {}] {}", ts, record.level(), record.args())
        })
        .init();

    let config = Args::parse().into_config()?;

    let (events_tx, events_rx) = link_channel();
    let ingest = VirtualSerialTransport::open("U2", config.ingest_addr(), Some(events_tx.clone()))
        .context("opening ingest line")?;
    let output = VirtualSerialTransport::open("U3", config.output_addr(), Some(events_tx))
        .context("opening output line")?;

    let pipeline = Pipeline::new(
        ingest.clone(),
        output.clone(),
        SmallestDivisorProcessor,
        config.clone(),
    )?;
    pipeline.start(events_rx)?;

    // Lowest priority, spawned last
    let poller = LinePoller::new(vec![ingest.clone(), output.clone()], config.poll_interval).spawn();

    info!("waiting for peers, Ctrl+C to quit");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;

    info!("shutting down");
    poller.abort();
    pipeline.stop();
    ingest.close();
    output.close();

    let counters = pipeline.counters();
    info!(
        "final counts: composite {}, prime {}, total {}",
        counters.composite,
        counters.prime,
        counters.total()
    );
    Ok(())
}
