use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use sim_uart_pipeline::ring_buffer::SerialSetup;
use sim_uart_pipeline::{
    link_channel, LinePoller, LinkEvent, RingBuffer, RingBufferedLine, RingEvent,
    VirtualSerialTransport,
};
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;

/// Echo device on one ring-buffered line, logging every ring notification
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    #[arg(long, default_value_t = 52001)]
    port: u16,

    #[arg(long, default_value_t = 256)]
    read_capacity: usize,

    #[arg(long, default_value_t = 256)]
    write_capacity: usize,

    /// Unread bytes that wake the echo loop
    #[arg(long, default_value_t = 4)]
    read_threshold: usize,

    /// Re-arm the read notification automatically
    #[arg(long)]
    persistent: bool,

    /// Service cadence in milliseconds
    #[arg(long, default_value_t = 1)]
    service_ms: u64,
}

fn apply_thresholds(
    ring: &mut RingBuffer,
    read_threshold: usize,
    write_threshold: usize,
) -> anyhow::Result<()> {
    if !ring.serial_setup(SerialSetup::default()) {
        anyhow::bail!("line setup {:?} rejected", SerialSetup::default());
    }
    if !ring.read_threshold_set(read_threshold) {
        anyhow::bail!(
            "read threshold {} does not fit a {} byte ring",
            read_threshold,
            ring.read_buffer_size()
        );
    }
    if !ring.write_threshold_set(write_threshold) {
        anyhow::bail!(
            "write threshold {} does not fit a {} byte ring",
            write_threshold,
            ring.write_buffer_size()
        );
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(buf, "[{} {}] {}", ts, record.level(), record.args())
        })
        .init();

    let args = Args::parse();
    let (events_tx, mut events_rx) = link_channel();
    let addr = SocketAddr::new(args.host, args.port);
    let transport =
        VirtualSerialTransport::open("U1", addr, Some(events_tx)).context("opening line")?;

    let line = Arc::new(RingBufferedLine::new(
        transport.clone(),
        args.read_capacity,
        args.write_capacity,
    ));

    let wake = Arc::new(Notify::new());
    let reader_wake = wake.clone();
    line.register_read_callback(
        Arc::new(move |event: RingEvent, context: usize| {
            info!("read notification {:?} (context {})", event, context);
            reader_wake.notify_one();
        }),
        1,
    );
    line.register_write_callback(
        Arc::new(|event: RingEvent, context: usize| {
            info!("write notification {:?} (context {})", event, context);
        }),
        2,
    );

    let read_threshold = args.read_threshold;
    let write_threshold = args.write_capacity / 2;
    let persistent = args.persistent;
    line.configure(|ring| apply_thresholds(ring, read_threshold, write_threshold))?;
    line.configure(|ring| {
        ring.read_notification_enable(true, persistent);
        ring.write_notification_enable(true, true);
    });

    let poller = LinePoller::new(vec![transport.clone()], Duration::from_millis(100)).spawn();

    let service_line = line.clone();
    let service_interval = Duration::from_millis(args.service_ms);
    let service = tokio::spawn(async move {
        loop {
            service_line.service().await;
            sleep(service_interval).await;
        }
    });

    info!("echo device ready on {}, Ctrl+C to quit", addr);
    let mut chunk = vec![0u8; args.read_capacity];
    loop {
        tokio::select! {
            _ = wake.notified() => {
                let read = line.read(&mut chunk);
                let queued = line.write(&chunk[..read]);
                if queued < read {
                    warn!("write ring full, dropped {} echoed byte(s)", read - queued);
                }
                if !persistent {
                    line.configure(|ring| ring.read_notification_enable(true, false));
                }
            }
            Some(event) = events_rx.recv() => match event {
                LinkEvent::Connected { line } => info!("{}: peer connected", line),
                LinkEvent::Disconnected { line } => info!("{}: peer disconnected", line),
            },
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                break;
            }
        }
    }

    service.abort();
    poller.abort();
    transport.close();
    Ok(())
}
