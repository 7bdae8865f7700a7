//! # VXI-11 Instrument Simulator
//!
//! Serves simulated SCPI instruments over VXI-11 so that instrument control software can
//! be exercised without hardware.
//!
//! ## Overview
//!
//! The simulator answers portmapper queries and the core channel on one port and the
//! abort channel on a second one, using [`vxi11_server`](https://docs.rs/vxi11-server/).
//! Two backends are available:
//!
//! - `generic`: identity, reset, error queue, echo, waveform blocks and numeric lists
//! - `silent`: accepts every command and never answers, for timeout and abort testing
pub mod backends;

use std::error::Error;
use std::net::{IpAddr, SocketAddr};

use clap::Parser;
use env_logger::Env;
use tokio_util::sync::CancellationToken;
use vxi11_server::{
    Instrument,
    server::{Config, Server},
};

use crate::backends::{
    generic::{DEFAULT_SAMPLES, GenericInstrument, Identity},
    silent::SilentInstrument,
};

#[derive(Parser, Eq, PartialEq, Clone)]
enum Backend {
    /// A generic SCPI instrument
    Generic {
        #[arg(long, default_value = "VXI11-RS")]
        manufacturer: String,
        #[arg(long, default_value = "SIM-1")]
        model: String,
        #[arg(long, default_value = "0001")]
        serial: String,
        #[arg(long, default_value = env!("CARGO_PKG_VERSION"))]
        firmware: String,
        #[arg(
            short,
            long,
            help = "Number of samples in waveform blocks and lists",
            default_value = "1000"
        )]
        samples: usize,
    },
    /// An instrument that never answers
    Silent,
}

#[derive(Parser)]
#[command(about = "Simulated SCPI instruments served over VXI-11", long_about=None)]
struct Args {
    #[arg(short, long, default_value = "111")]
    port: u16,

    #[arg(short, long, default_value = "127.0.0.1")]
    ip: IpAddr,

    #[arg(short, long, help = "Device names accepted by create_link", default_value = "inst0")]
    device: Vec<String>,

    #[arg(long, help = "Port of the abort channel, 0 for any", default_value = "0")]
    abort_port: u16,

    #[arg(long, help = "Largest accepted write in bytes", default_value = "1048576")]
    max_recv_size: u32,

    #[clap(subcommand)]
    backend: Option<Backend>,
}

async fn run<T: Instrument>(server: Server<T>, addr: SocketAddr) -> Result<(), Box<dyn Error>> {
    let shutdown = CancellationToken::new();
    let listening = server.bind(addr).await?;
    log::info!(
        "Simulator ready at {} (abort channel at {})",
        listening.local_addr()?,
        listening.abort_addr()?
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Received Ctrl-C, shutting down"),
            Err(e) => log::error!("Cannot listen for Ctrl-C: {}", e),
        }
        signal.cancel();
    });

    listening.serve(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    log::info!("Starting VXI-11 simulator");

    let args = Args::parse();
    log::debug!("Parsed arguments: ip={}, port={}", args.ip, args.port);

    let config = Config {
        devices: args.device,
        max_recv_size: args.max_recv_size,
        abort_port: args.abort_port,
        ..Config::default()
    };
    log::debug!(
        "Server config: devices={:?}, max_recv_size={}",
        config.devices,
        config.max_recv_size
    );

    let addr = SocketAddr::new(args.ip, args.port);
    log::info!("Binding to address: {}", addr);

    let (identity, samples) = match args.backend {
        Some(Backend::Silent) => {
            log::info!("Simulating a silent instrument");
            return run(Server::new(|_device: &str| SilentInstrument, config), addr).await;
        }
        Some(Backend::Generic {
            manufacturer,
            model,
            serial,
            firmware,
            samples,
        }) => (
            Identity {
                manufacturer,
                model,
                serial,
                firmware,
            },
            samples,
        ),
        None => (Identity::default(), DEFAULT_SAMPLES),
    };

    log::info!("Simulating {} {}", identity.manufacturer, identity.model);
    let server = Server::new(
        move |_device: &str| GenericInstrument::new(identity.clone(), samples),
        config,
    );
    run(server, addr).await
}
