use clap::{Parser, Subcommand};
use registry_cli::registry::{Delta, Instance, Lease, RegistryClient};
use registry_cli::TlsMode;
use std::collections::BTreeMap;

#[derive(Parser)]
#[command(name = "registry-cli")]
#[command(about = "CLI for operating service registry nodes", long_about = None)]
struct Cli {
    /// Registry node URL
    #[arg(long, global = true, default_value = "http://localhost:8761")]
    url: String,
    /// TLS mode (none or self-signed)
    #[arg(long, global = true, value_enum, default_value = "none")]
    tls: TlsMode,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every application and its instances
    Apps {
        /// Include instances that are not UP
        #[arg(long)]
        all: bool,
    },
    /// Show the instances of one application
    App {
        name: String,
        /// Include instances that are not UP
        #[arg(long)]
        all: bool,
    },
    /// Show the changes since a registry version
    Delta {
        #[arg(long)]
        since: u64,
    },
    /// Register an instance
    Register {
        /// Application name
        #[arg(short, long)]
        app: String,
        /// Host or IP address the instance listens on
        #[arg(long)]
        host: String,
        #[arg(short, long)]
        port: u16,
        /// Instance id, defaults to host:port
        #[arg(long)]
        id: Option<String>,
        /// Initial status
        #[arg(long, default_value = "UP")]
        status: String,
        /// Attribute as key=value (can be specified multiple times)
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
    },
    /// Renew an instance's lease
    Renew { app: String, id: String },
    /// Cancel an instance's lease
    Cancel { app: String, id: String },
    /// Override an instance's status (UP, DOWN, STARTING, OUT_OF_SERVICE, UNKNOWN)
    SetStatus {
        app: String,
        id: String,
        status: String,
    },
    /// Show the node's health, renewal rates and peers
    Status,
    /// Make the node re-read its configuration
    Refresh,
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {}", raw)),
    }
}

fn print_lease(lease: &Lease) {
    let instance = &lease.instance;
    println!(
        "  - {} {}:{} [{}] v{}",
        instance.instance_id, instance.host, instance.port, instance.status, lease.version
    );
    for (k, v) in &instance.attributes {
        println!("      {}={}", k, v);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = RegistryClient::with_tls(cli.url, cli.tls);

    match cli.command {
        Commands::Apps { all } => {
            let snapshot = client.list_apps(all).await?;
            println!("Registry version {}", snapshot.version);
            if snapshot.applications.is_empty() {
                println!("No applications registered");
            }
            for (app, leases) in &snapshot.applications {
                println!("{} ({} instances)", app, leases.len());
                for lease in leases {
                    print_lease(lease);
                }
            }
        }
        Commands::App { name, all } => {
            let leases = client.get_app(&name, all).await?;
            if leases.is_empty() {
                println!("No instances of {}", name);
            } else {
                println!("{}:", name);
                for lease in &leases {
                    print_lease(lease);
                }
            }
        }
        Commands::Delta { since } => match client.delta(since).await? {
            Delta::Delta {
                current_version,
                mutations,
            } => {
                println!("{} changes, now at version {}", mutations.len(), current_version);
                for m in mutations {
                    println!(
                        "  #{} {} {}/{} v{}",
                        m.global_version, m.kind, m.app, m.instance_id, m.version
                    );
                }
            }
            Delta::TooStale { current_version } => {
                println!(
                    "Version {} is no longer covered, fetch everything (current version {})",
                    since, current_version
                );
            }
        },
        Commands::Register {
            app,
            host,
            port,
            id,
            status,
            attributes,
        } => {
            let instance = Instance {
                instance_id: id.unwrap_or_else(|| format!("{}:{}", host, port)),
                app,
                host,
                port,
                secure_port: None,
                status: status.to_ascii_uppercase(),
                attributes: attributes.into_iter().collect::<BTreeMap<_, _>>(),
            };
            client.register(&instance).await?;
            println!("✓ Registered {}/{}", instance.app, instance.instance_id);
        }
        Commands::Renew { app, id } => {
            let lease = client.renew(&app, &id).await?;
            println!("✓ Renewed {}/{} (version {})", app, id, lease.version);
        }
        Commands::Cancel { app, id } => {
            client.cancel(&app, &id).await?;
            println!("✓ Cancelled {}/{}", app, id);
        }
        Commands::SetStatus { app, id, status } => {
            let lease = client.set_status(&app, &id, &status).await?;
            println!(
                "✓ {}/{} is now {} (version {})",
                app, id, lease.instance.status, lease.version
            );
        }
        Commands::Status => {
            let status = client.node_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Refresh => {
            let result = client.refresh().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
