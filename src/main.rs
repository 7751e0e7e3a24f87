use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use leasepool::{
    ClientAgent, ClientId, Config, LeaseServer, LeaseTable, MemoryLeaseStore, Negotiator, Result,
    UdpTransport, http,
};

#[derive(Parser)]
#[command(name = "leasepool")]
#[command(author, version, about = "Address lease server and client", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum TransportKind {
    /// Binary messages over UDP
    #[default]
    Udp,
    /// JSON over HTTP
    Http,
    /// Both transports sharing one lease table
    Both,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the lease server
    Serve {
        #[arg(short, long, value_enum, default_value_t)]
        transport: TransportKind,
    },
    /// Negotiate and keep a lease over UDP
    Client {
        /// Server address (defaults to broadcast)
        #[arg(long)]
        server: Option<SocketAddr>,
        /// Local address to bind
        #[arg(long)]
        bind: Option<SocketAddr>,
        /// Hardware address, e.g. 02:00:00:00:00:01 (random if omitted)
        #[arg(long)]
        mac: Option<String>,
        /// Acquire one lease, print it and exit
        #[arg(long)]
        once: bool,
    },
    ShowConfig,
    ListLeases,
    SweepLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Serve {
        transport: TransportKind::default(),
    }) {
        Commands::Serve { transport } => {
            info!("Starting lease server with config: {:?}", cli.config);
            let table = open_table(config).await?;
            let negotiator = Arc::new(Negotiator::new(Arc::clone(&table)));

            if let Some(seconds) = table.config().sweep_interval_seconds {
                let negotiator = Arc::clone(&negotiator);
                tokio::spawn(async move {
                    negotiator.maintain(Duration::from_secs(seconds)).await;
                });
            }

            tokio::select! {
                result = serve(negotiator, transport) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    if let Err(error) = table.flush().await {
                        error!("Failed to save leases on shutdown: {}", error);
                    }
                    Ok(())
                }
            }
        }
        Commands::Client {
            server,
            bind,
            mac,
            once,
        } => {
            let hardware_address = match mac {
                Some(text) => {
                    let Ok(id) = text.parse::<ClientId>();
                    id.as_bytes().to_vec()
                }
                None => random_hardware_address(),
            };

            let transport = UdpTransport::bind(
                bind.unwrap_or_else(UdpTransport::default_bind),
                server.unwrap_or_else(UdpTransport::default_server),
            )?;
            let agent = ClientAgent::new(transport, hardware_address);

            if once {
                let lease = agent.acquire().await?;
                println!("Address:     {}", lease.address);
                if let Some(mask) = lease.subnet_mask {
                    println!("Subnet mask: {}", mask);
                }
                if let Some(router) = lease.router {
                    println!("Router:      {}", router);
                }
                if !lease.dns_servers.is_empty() {
                    let dns: Vec<String> =
                        lease.dns_servers.iter().map(ToString::to_string).collect();
                    println!("DNS:         {}", dns.join(", "));
                }
                println!("Lease:       {}s", lease.lease_duration.as_secs());
                return Ok(());
            }

            tokio::select! {
                result = agent.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping client...");
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let table = open_table(config).await?;
            let leases = table.leases().await?;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<24} {:<16} {:<24} {:<10}",
                    "Client ID", "Address", "Expires At", "Remaining"
                );
                println!("{}", "-".repeat(76));

                for lease in leases {
                    let remaining = lease.remaining_seconds();
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };

                    println!(
                        "{:<24} {:<16} {:<24} {:<10}",
                        lease.client_id.to_string(),
                        lease.address.to_string(),
                        lease.expires_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        remaining_str
                    );
                }
            }

            Ok(())
        }
        Commands::SweepLeases => {
            let table = open_table(config).await?;
            let count = table.sweep_expired(Utc::now()).await?;
            table.flush().await?;
            println!("Reclaimed {} expired lease(s).", count);
            Ok(())
        }
    }
}

async fn open_table(config: Config) -> Result<Arc<LeaseTable>> {
    let store = match &config.leases_file {
        Some(path) => MemoryLeaseStore::open(path, config.allocation).await?,
        None => MemoryLeaseStore::new(config.allocation),
    };
    let table = LeaseTable::new(Arc::new(config), Arc::new(store)).await?;
    Ok(Arc::new(table))
}

async fn serve(negotiator: Arc<Negotiator>, transport: TransportKind) -> Result<()> {
    let http_listen = negotiator.config().http_listen;

    match transport {
        TransportKind::Udp => LeaseServer::new(negotiator)?.run().await,
        TransportKind::Http => http::serve(negotiator, http_listen).await,
        TransportKind::Both => {
            let server = LeaseServer::new(Arc::clone(&negotiator))?;
            tokio::try_join!(server.run(), http::serve(negotiator, http_listen))?;
            Ok(())
        }
    }
}

/// Locally administered unicast address.
fn random_hardware_address() -> Vec<u8> {
    let tail: [u8; 5] = rand::random();
    let mut address = vec![0x02];
    address.extend_from_slice(&tail);
    address
}
