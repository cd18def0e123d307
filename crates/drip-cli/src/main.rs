//! drip command-line interface.
//!
//! `drip server` runs the public-facing relay; `drip http|https|tcp <port>`
//! exposes a local service through it; `drip config` manages the saved
//! server address and token.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use drip_client::{
    ClientConfig, ConfigManager, ReconnectPolicy, TunnelClient, TunnelClientConfig, TunnelRecord,
    TunnelStore,
};
use drip_proto::TunnelType;
use drip_server::{Server, ServerConfig};

/// Expose local servers through a self-hosted reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "drip")]
#[command(about = "Self-hosted reverse tunnels over TLS", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public-facing tunnel server
    Server(ServerArgs),

    /// Expose a local HTTP server
    Http(TunnelArgs),

    /// Expose a local HTTPS server (TLS passthrough, routed by SNI)
    Https(TunnelArgs),

    /// Expose a local TCP service on a server-allocated public port
    Tcp(TunnelArgs),

    /// Manage saved configuration (server, token)
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// List tunnels recorded by this machine
    List,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Public base domain (tunnels live at <subdomain>.<domain>)
    #[arg(long, default_value = "localhost")]
    domain: String,

    /// Control-link listener address
    #[arg(long, default_value = "0.0.0.0:7000")]
    control_addr: String,

    /// Public HTTP listener address
    #[arg(long, default_value = "0.0.0.0:8080")]
    public_addr: String,

    /// SNI passthrough address for https tunnels (disabled when omitted)
    #[arg(long)]
    sni_addr: Option<String>,

    /// TLS certificate file (PEM); enables TLS on control and public listeners
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Shared secret clients must present
    #[arg(long, env = "DRIP_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Public port range for tcp tunnels, e.g. "10000-11000"
    #[arg(long)]
    tcp_port_range: Option<String>,

    /// Additional reserved subdomain labels (repeatable)
    #[arg(long = "reserve")]
    reserved: Vec<String>,
}

#[derive(Args, Debug)]
struct TunnelArgs {
    /// Local port to expose
    port: u16,

    /// Custom subdomain (optional)
    #[arg(short = 'n', long)]
    subdomain: Option<String>,

    /// Local address to forward to
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Server control address (host:port); defaults to the saved config
    #[arg(short, long, env = "DRIP_SERVER")]
    server: Option<String>,

    /// Auth token; defaults to the saved config
    #[arg(short, long, env = "DRIP_TOKEN")]
    token: Option<String>,

    /// Skip TLS certificate verification (self-signed servers)
    #[arg(long)]
    insecure: bool,

    /// Use a plaintext control link (testing only)
    #[arg(long)]
    no_tls: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Save server address and token
    Set {
        #[arg(long)]
        server: String,
        #[arg(long)]
        token: String,
        /// Connect without TLS (testing only)
        #[arg(long)]
        no_tls: bool,
    },
    /// Print the current configuration
    Show,
    /// Delete the configuration file
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Http(args) => run_tunnel(TunnelType::Http, args).await,
        Commands::Https(args) => run_tunnel(TunnelType::Https, args).await,
        Commands::Tcp(args) => run_tunnel(TunnelType::Tcp, args).await,
        Commands::Config { action } => run_config(action),
        Commands::List => run_list(),
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let control_addr: SocketAddr = args
        .control_addr
        .parse()
        .context("invalid --control-addr")?;
    let public_addr: SocketAddr = args.public_addr.parse().context("invalid --public-addr")?;
    let sni_addr = args
        .sni_addr
        .as_deref()
        .map(|addr| addr.parse::<SocketAddr>().context("invalid --sni-addr"))
        .transpose()?;
    let tcp_port_range = args
        .tcp_port_range
        .as_deref()
        .map(parse_port_range)
        .transpose()?;

    if args.auth_token.is_none() {
        warn!("no --auth-token configured, any client can register");
    }

    let config = ServerConfig {
        domain: args.domain,
        control_addr,
        public_addr,
        sni_addr,
        tls_cert: args.tls_cert,
        tls_key: args.tls_key,
        auth_token: args.auth_token,
        tcp_port_range,
        reserved_subdomains: args.reserved,
        ..Default::default()
    };

    let server = Server::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    server.run(shutdown_rx).await?;
    Ok(())
}

async fn run_tunnel(tunnel_type: TunnelType, args: TunnelArgs) -> Result<()> {
    let (server_addr, token, tls) = resolve_connection(&args)?;

    let config = TunnelClientConfig {
        server_addr: server_addr.clone(),
        token,
        tunnel_type,
        subdomain: args.subdomain,
        local_host: args.address,
        local_port: args.port,
        tls,
        insecure: args.insecure,
        reconnect: ReconnectPolicy {
            interval: Duration::from_secs(3),
            max_attempts: 5,
        },
    };

    let store = TunnelStore::open().ok();
    let client = TunnelClient::new(config);

    let mut recorded: Option<String> = None;
    let run = client.run(|info| {
        println!("tunnel up: {}", info.url);
        if let Some(store) = &store {
            let record = TunnelRecord::new(
                tunnel_type,
                args.port,
                &info.subdomain,
                &server_addr,
                &info.url,
            );
            if store.write(&record).is_ok() {
                recorded = Some(info.subdomain.clone());
            }
        }
    });

    let result = tokio::select! {
        result = run => result.map_err(anyhow::Error::from),
        _ = signal::ctrl_c() => {
            info!("interrupted, closing tunnel");
            Ok(())
        }
    };

    if let (Some(store), Some(subdomain)) = (&store, &recorded) {
        let _ = store.remove(subdomain);
    }
    result
}

fn resolve_connection(args: &TunnelArgs) -> Result<(String, String, bool)> {
    if let Some(server) = &args.server {
        let token = args.token.clone().unwrap_or_default();
        return Ok((server.clone(), token, !args.no_tls));
    }

    let config = ConfigManager::load().context("failed to load config")?;
    if config.server.is_empty() {
        bail!(
            "no server configured.\n\nRun 'drip config set --server HOST:PORT --token TOKEN' first,\nor pass --server and --token explicitly."
        );
    }
    let token = args.token.clone().unwrap_or(config.token);
    let tls = if args.no_tls { false } else { config.tls };
    Ok((config.server, token, tls))
}

fn run_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set {
            server,
            token,
            no_tls,
        } => {
            ConfigManager::save(&ClientConfig {
                server,
                token,
                tls: !no_tls,
            })?;
            println!("configuration saved");
        }
        ConfigAction::Show => {
            if !ConfigManager::exists() {
                println!("no configuration file");
                return Ok(());
            }
            let config = ConfigManager::load()?;
            println!("server: {}", config.server);
            println!(
                "token:  {}",
                if config.token.is_empty() { "(none)" } else { "(set)" }
            );
            println!("tls:    {}", config.tls);
        }
        ConfigAction::Reset => {
            ConfigManager::reset()?;
            println!("configuration removed");
        }
    }
    Ok(())
}

fn run_list() -> Result<()> {
    let store = TunnelStore::open()?;
    let records = store.list();
    if records.is_empty() {
        println!("no recorded tunnels");
        return Ok(());
    }
    for record in records {
        println!(
            "{}\t{}\tlocal:{}\tpid:{}\t{}",
            record.subdomain, record.tunnel_type, record.port, record.pid, record.url
        );
    }
    Ok(())
}

fn parse_port_range(raw: &str) -> Result<(u16, u16)> {
    let (start, end) = raw
        .split_once('-')
        .context("port range must look like 10000-11000")?;
    let start: u16 = start.trim().parse().context("invalid range start")?;
    let end: u16 = end.trim().parse().context("invalid range end")?;
    if end < start {
        bail!("port range end must not be below start");
    }
    Ok((start, end))
}
