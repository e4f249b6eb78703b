use std::path::PathBuf;

use chrono::DateTime;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rangelease::{Config, HardwareAddress, LeaseService, Result};

#[derive(Parser)]
#[command(name = "rangelease")]
#[command(author, version, about = "IPv4 DHCP lease allocation engine", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Positional configuration instead of a config file:
    /// <leases file> <range start> <range end> <lease time> [excluded,addresses]
    #[arg(long, num_args = 4..=5, value_name = "ARG", conflicts_with = "config")]
    args: Option<Vec<String>>,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    ShowConfig,
    ListLeases,
    Request {
        #[arg(long)]
        mac: HardwareAddress,

        #[arg(long, default_value = "")]
        hostname: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = match &cli.args {
        Some(args) => Config::from_args(args.as_slice())?,
        None => Config::load_or_create(&cli.config)?,
    };

    match cli.command.unwrap_or(Commands::ListLeases) {
        Commands::ShowConfig => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            let service = LeaseService::open(&config).await?;
            let leases = service.leases().await;

            if leases.is_empty() {
                println!("No leases.");
            } else {
                println!(
                    "{:<20} {:<16} {:<24} {:<10} {}",
                    "MAC Address", "IP Address", "Expires At", "Remaining", "Hostname"
                );
                println!("{}", "-".repeat(84));

                for lease in leases {
                    let remaining = lease.remaining_seconds();
                    let remaining_str = if remaining > 0 {
                        format!("{}s", remaining)
                    } else {
                        "expired".to_string()
                    };
                    let expires_str = DateTime::from_timestamp(lease.expires_at, 0)
                        .map(|expires| expires.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                        .unwrap_or_else(|| lease.expires_at.to_string());

                    println!(
                        "{:<20} {:<16} {:<24} {:<10} {}",
                        lease.hardware_address, lease.ip, expires_str, remaining_str, lease.hostname
                    );
                }
            }

            println!(
                "{} of {} addresses free in {}",
                service.free_count().await,
                service.range().len(),
                service.range()
            );
            Ok(())
        }
        Commands::Request { mac, hostname } => {
            let service = LeaseService::open(&config).await?;
            let assignment = service.handle_request(mac, &hostname).await?;
            info!("Leased {} to {}", assignment.ip, mac);
            println!(
                "{} {} lease-time={}s",
                mac, assignment.ip, assignment.lease_time_seconds
            );
            Ok(())
        }
    }
}
