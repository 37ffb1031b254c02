use std::{
    net::SocketAddr,
    path::PathBuf,
    time::{Duration, Instant},
};

use clap::Parser;
use common::DatapathEvent;
use server::{
    Controller, ControllerConfig, ControllerError, ControllerResult,
    udp::{ClientSocket, DatapathSocket},
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Monitoring and spanning-tree controller
#[derive(Parser)]
#[command(name = "canopyd")]
#[command(about = "Switch monitoring and flood-port controller", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "CANOPY_CONFIG")]
    config: Option<PathBuf>,

    /// Address for control-plane clients
    #[arg(long, env = "CANOPY_CLIENT_ADDR")]
    client_addr: Option<SocketAddr>,

    /// Address for datapath agents
    #[arg(long, env = "CANOPY_DATAPATH_ADDR")]
    datapath_addr: Option<SocketAddr>,

    /// Log level
    #[arg(long, env = "CANOPY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "CANOPY_LOG_JSON")]
    log_json: bool,
}

fn main() -> ControllerResult<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());
    if cli.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = match &cli.config {
        Some(path) => ControllerConfig::load(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(addr) = cli.client_addr {
        config.listen.client_addr = addr;
    }
    if let Some(addr) = cli.datapath_addr {
        config.listen.datapath_addr = addr;
    }

    let clients = ClientSocket::bind(config.listen.client_addr)?;
    let mut datapaths = DatapathSocket::bind(config.listen.datapath_addr)?;
    info!(
        clients = %clients.local_addr()?,
        datapaths = %datapaths.local_addr()?,
        "Controller listening"
    );

    let mut controller = Controller::new(config);
    controller.start(Instant::now());
    run(&mut controller, &clients, &mut datapaths)
}

fn run(
    controller: &mut Controller,
    clients: &ClientSocket,
    datapaths: &mut DatapathSocket,
) -> ControllerResult<()> {
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let mut busy = false;

        loop {
            let (event, src) = match datapaths.recv_event(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(ControllerError::Codec(err)) => {
                    warn!(error = %err, "Dropped undecodable datapath frame");
                    busy = true;
                    continue;
                }
                Err(err) => {
                    warn!(error = %err, "Datapath socket error");
                    break;
                }
            };
            busy = true;

            let departed = match &event {
                DatapathEvent::SwitchJoined { dpid, .. } => {
                    datapaths.register(*dpid, src);
                    None
                }
                DatapathEvent::SwitchLeft { dpid } => Some(*dpid),
                _ => None,
            };
            controller.handle_datapath_event(datapaths, event, Instant::now());
            if let Some(dpid) = departed {
                datapaths.forget(dpid);
            }
        }

        loop {
            let (len, src) = match clients.recv(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "Client socket error");
                    break;
                }
            };
            busy = true;
            controller.handle_client_bytes(datapaths, src, &buf[..len], Instant::now());
        }

        controller.run_due(datapaths, Instant::now());

        for (addr, message) in controller.drain_outbox() {
            if let Err(err) = clients.send(addr, &message) {
                warn!(client = %addr, error = %err, "Dropping unreachable client");
                controller.drop_client(addr);
            }
        }

        if !busy {
            let now = Instant::now();
            let sleep = controller
                .next_wakeup()
                .map_or(MAX_IDLE_SLEEP, |due| due.saturating_duration_since(now))
                .min(MAX_IDLE_SLEEP);
            std::thread::sleep(sleep);
        }
    }
}
