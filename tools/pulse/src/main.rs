//! Pulse - STTP command-line companion
//!
//! Attaches a subscriber to a running publisher and prints measurements, or
//! runs a self-contained demo publisher that emits synthetic telemetry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use sttp_core::{DataSet, Measurement, StateFlags, Ticks};
use sttp_transport::{
    DataPublisher, DataSubscriber, ErrorKind, PublisherConfig, SubscriberConfig,
    SubscriberListener, SubscriptionInfo, UdpDataChannel,
};

#[derive(Parser)]
#[command(name = "pulse", about = "STTP subscriber/publisher command-line tool")]
struct Cli {
    /// Optional YAML configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to a publisher and print measurements
    Listen {
        /// Publisher endpoint
        #[arg(default_value = "127.0.0.1:7175")]
        endpoint: String,

        /// Subscription filter expression
        #[arg(long, default_value = "FILTER ActiveMeasurements WHERE True")]
        filter: String,

        /// Enable payload compression
        #[arg(long)]
        compress: bool,

        /// Request a UDP data channel on this local port (0 = ephemeral)
        #[arg(long)]
        udp: Option<u16>,

        /// Encrypt the UDP data channel
        #[arg(long)]
        encrypt: bool,
    },

    /// Run a demo publisher emitting synthetic telemetry
    Demo {
        /// Listen endpoint
        #[arg(default_value = "127.0.0.1:7175")]
        endpoint: String,

        /// Number of synthetic signals
        #[arg(long, default_value_t = 10)]
        signals: usize,

        /// Publish rate in frames per second
        #[arg(long, default_value_t = 30)]
        rate: u64,
    },
}

struct ConsoleListener;

impl SubscriberListener for ConsoleListener {
    fn status_message(&self, message: &str) {
        info!("{}", message);
    }

    fn error_message(&self, kind: ErrorKind, message: &str) {
        tracing::error!("[{}] {}", kind, message);
    }

    fn connection_terminated(&self) {
        tracing::warn!("connection terminated");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    common::logging::init("info").ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Listen {
            endpoint,
            filter,
            compress,
            udp,
            encrypt,
        } => listen(cli.config.as_deref(), endpoint, filter, compress, udp, encrypt).await,
        Command::Demo {
            endpoint,
            signals,
            rate,
        } => demo(endpoint, signals, rate).await,
    }
}

async fn listen(
    config_file: Option<&str>,
    endpoint: String,
    filter: String,
    compress: bool,
    udp: Option<u16>,
    encrypt: bool,
) -> Result<()> {
    let mut config = match config_file {
        Some(path) => SubscriberConfig::from_yaml_file(path)
            .with_context(|| format!("loading subscriber config from {path}"))?,
        None => SubscriberConfig::default(),
    };
    if compress {
        config.compress_payload_data = true;
    }
    if let Some(port) = udp {
        config.udp_data_channel = Some(UdpDataChannel {
            port,
            interface: None,
            encrypt,
        });
    }

    let (subscriber, mut reader) = DataSubscriber::with_listener(config, Arc::new(ConsoleListener));
    subscriber
        .connect(endpoint.clone())
        .context("starting subscriber")?;
    subscriber
        .subscribe(SubscriptionInfo::new(filter))
        .await
        .context("subscribing")?;
    info!("listening to {}", endpoint);

    tokio::select! {
        reason = common::shutdown::wait_for_shutdown() => {
            info!("{} signal received, closing subscription", reason);
        }
        _ = async {
            while let Some(m) = reader.next().await {
                println!("{}  {}  {:>14.6}  0x{:08X}", m.timestamp, m.signal_id, m.value, m.flags.0);
            }
        } => {
            tracing::warn!("measurement stream ended");
        }
    }

    let stats = subscriber.stats();
    info!(
        "received {} measurement(s), {} byte(s)",
        stats.total_measurements, stats.total_bytes
    );
    subscriber.disconnect().await;
    Ok(())
}

async fn demo(endpoint: String, signal_count: usize, rate: u64) -> Result<()> {
    let signals: Vec<Uuid> = (0..signal_count).map(|_| Uuid::new_v4()).collect();
    let entries: Vec<(Uuid, String, &str)> = signals
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, format!("DEMO:SIG{i}"), if i % 2 == 0 { "FREQ" } else { "VPHM" }))
        .collect();

    let publisher = DataPublisher::new(PublisherConfig::default());
    publisher.define_metadata(DataSet::with_active_measurements(
        entries.iter().map(|(id, tag, kind)| (*id, tag.as_str(), *kind)),
    ));
    let addr = publisher
        .start(&endpoint)
        .await
        .context("starting publisher")?;
    info!("demo publisher on {} with {} signal(s)", addr, signal_count);

    let period = Duration::from_millis(1000 / rate.max(1));
    let mut ticker = tokio::time::interval(period);
    let mut phase = 0.0f64;
    let stop = CancellationToken::new();
    common::shutdown::cancel_on_shutdown(stop.clone());

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                phase += 0.05;
                let now = Ticks::now();
                let batch: Vec<Measurement> = signals
                    .iter()
                    .enumerate()
                    .map(|(i, id)| {
                        let value = 60.0 + (phase + i as f64).sin() * 0.05
                            + rand::random::<f64>() * 0.001;
                        Measurement::new(*id, value, now).with_flags(StateFlags::NORMAL)
                    })
                    .collect();
                publisher.publish(&batch);
            }
        }
    }

    publisher.stop().await;
    Ok(())
}
