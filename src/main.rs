mod config;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{AppConfig, DEFAULT_CONFIG_PATH};
use isoworld_client::{ClientEvent, GameClient};
use isoworld_core::SimulationClock;
use isoworld_net::QuicServerTransport;
use isoworld_server::{GameServer, PlayerEvent};
use isoworld_world::{generate_terrain, TileGrid};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "isoworld", version, about = "Isometric tile world with multiplayer sync")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a dedicated server.
    Serve(ServeArgs),
    /// Join a server and download its world.
    Join(JoinArgs),
    /// Run a server and join it from this process.
    Host {
        #[command(flatten)]
        serve: ServeArgs,
        /// Display name for the local player.
        #[arg(long)]
        player: Option<String>,
    },
    /// Write the effective configuration to the config path.
    InitConfig,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    depth: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    seed: Option<u32>,
    /// Stop after this many seconds.
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct JoinArgs {
    /// Server address, e.g. 127.0.0.1:14242.
    #[arg(long)]
    address: Option<SocketAddr>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Give up if the world has not arrived after this many seconds.
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting isoworld v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut config = AppConfig::load_from_path(&cli.config);

    match cli.command {
        Command::Serve(args) => {
            args.apply(&mut config);
            serve(&config, args.duration_secs.map(Duration::from_secs))
        }
        Command::Join(args) => {
            args.apply(&mut config);
            let address: SocketAddr = config
                .client
                .server_address
                .parse()
                .with_context(|| format!("Invalid address {}", config.client.server_address))?;
            join(&config, address, Duration::from_secs(args.timeout_secs)).map(|_| ())
        }
        Command::Host { serve, player } => {
            serve.apply(&mut config);
            if let Some(player) = player {
                config.client.name = player;
            }
            host(&config, serve.duration_secs.map(Duration::from_secs))
        }
        Command::InitConfig => {
            config.save_to_path(&cli.config)?;
            info!("Wrote {}", cli.config.display());
            Ok(())
        }
    }
}

impl ServeArgs {
    fn apply(&self, config: &mut AppConfig) {
        let server = &mut config.server;
        if let Some(port) = self.port {
            server.port = port;
        }
        if let Some(password) = &self.password {
            server.password = Some(password.clone());
            config.client.password = password.clone();
        }
        if let Some(name) = &self.name {
            server.name = name.clone();
        }
        if let Some(width) = self.width {
            server.world_width = width;
        }
        if let Some(depth) = self.depth {
            server.world_depth = depth;
        }
        if let Some(height) = self.height {
            server.world_height = height;
        }
        if let Some(seed) = self.seed {
            server.seed = seed;
        }
    }
}

impl JoinArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(address) = self.address {
            config.client.server_address = address.to_string();
        }
        if let Some(name) = &self.name {
            config.client.name = name.clone();
        }
        if let Some(password) = &self.password {
            config.client.password = password.clone();
        }
    }
}

fn build_server(config: &AppConfig) -> Result<GameServer> {
    let dims = config.server.world_dims()?;
    let grid = generate_terrain(dims, &config.server.terrain());
    info!(world = %dims, occupied = grid.occupied_count(), "world generated");

    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.server.port));
    let mut server = GameServer::new(
        config.server.settings(),
        grid,
        QuicServerTransport::new(bind),
    )?;
    server.start()?;
    Ok(server)
}

fn log_player_events(server: &mut GameServer) {
    for event in server.drain_player_events() {
        match event {
            PlayerEvent::Joined(player) => info!(id = player.id, name = %player.name, "+ joined"),
            PlayerEvent::Left(player) => info!(id = player.id, name = %player.name, "- left"),
        }
    }
}

fn serve(config: &AppConfig, duration: Option<Duration>) -> Result<()> {
    let mut server = build_server(config)?;
    let started = Instant::now();
    let mut clock = SimulationClock::new(config.server.tick_rate);

    while duration.map_or(true, |limit| started.elapsed() < limit) {
        let idle = clock.run_due(|_| {
            server.update();
        });
        log_player_events(&mut server);
        std::thread::sleep(idle);
    }

    server.shutdown("Server shutting down");
    Ok(())
}

fn join(config: &AppConfig, address: SocketAddr, timeout: Duration) -> Result<TileGrid> {
    let mut client = GameClient::quic()?;
    client.connect(address, &config.client.password, &config.client.name)?;

    let started = Instant::now();
    let mut clock = SimulationClock::new(config.server.tick_rate);
    let world = 'session: loop {
        if started.elapsed() > timeout {
            client.disconnect();
            bail!("Timed out waiting for the world from {address}");
        }
        let mut events = Vec::new();
        let idle = clock.run_due(|_| events.extend(client.update()));
        for event in events {
            match event {
                ClientEvent::Connected => info!(%address, "joined"),
                ClientEvent::WorldInfo(info) => info!(
                    server = %info.server_name,
                    size = format!("{}x{}x{}", info.width, info.depth, info.height),
                    players = info.player_count,
                    "downloading world"
                ),
                ClientEvent::DownloadProgress {
                    received_cells,
                    total_cells,
                } => debug!(received_cells, total_cells, "download progress"),
                ClientEvent::WorldReady => {
                    if let Some(world) = client.take_world() {
                        break 'session world;
                    }
                }
                ClientEvent::Disconnected { reason } => {
                    bail!("Disconnected from {address}: {reason}");
                }
            }
        }
        std::thread::sleep(idle);
    };

    info!(occupied = world.occupied_count(), "world ready");
    client.disconnect();
    let _ = client.update();
    client.shutdown("Client exiting");
    Ok(world)
}

fn host(config: &AppConfig, duration: Option<Duration>) -> Result<()> {
    let mut server = build_server(config)?;
    let address = server
        .local_addr()
        .map(|addr| SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port())))
        .context("Server has no local address")?;

    let mut client = GameClient::quic()?;
    client.connect(address, &config.client.password, &config.client.name)?;

    let started = Instant::now();
    let mut clock = SimulationClock::new(config.server.tick_rate);
    while duration.map_or(true, |limit| started.elapsed() < limit) {
        let mut events = Vec::new();
        let idle = clock.run_due(|_| {
            server.update();
            events.extend(client.update());
        });
        log_player_events(&mut server);
        for event in events {
            match event {
                ClientEvent::WorldReady => {
                    let matches = client.world() == Some(server.grid());
                    info!(matches, "local client received the world");
                }
                ClientEvent::Disconnected { reason } => {
                    warn!(%reason, "local client disconnected");
                }
                _ => {}
            }
        }
        std::thread::sleep(idle);
    }

    client.shutdown("Host exiting");
    server.shutdown("Server shutting down");
    Ok(())
}
