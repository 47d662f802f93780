use std::io::{self, Write};
use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use opsdesk::prelude::*;
use tracing::Level;

#[derive(Parser)]
#[command(name = "opsdesk")]
#[command(version)]
#[command(about = "Self-service portal for EC2 instances, S3 buckets and Route 53 zones")]
struct Cli {
    /// AWS region override (defaults to the environment chain)
    #[arg(long, global = true)]
    region: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage EC2 instances (create, list, start, stop, delete, update)
    #[command(subcommand)]
    Compute(ComputeCmd),
    /// Manage S3 buckets (create, list, delete, upload)
    #[command(subcommand)]
    Storage(StorageCmd),
    /// Manage Route 53 zones and records
    #[command(subcommand)]
    Dns(DnsCmd),
}

#[derive(Subcommand)]
enum ComputeCmd {
    /// Provision a new instance
    Create {
        /// Name tag for the server
        #[arg(long)]
        name: String,
        /// Operating system label (amazon-linux | ubuntu)
        #[arg(long, default_value = "amazon-linux")]
        os: String,
        /// Instance type (t3.micro | t2.small)
        #[arg(long = "type", default_value = "t3.micro")]
        instance_type: String,
    },
    /// List instances created by this tool
    List,
    /// Start a stopped instance
    Start {
        #[arg(long)]
        id: String,
    },
    /// Stop a running instance
    Stop {
        #[arg(long)]
        id: String,
    },
    /// Terminate an instance (irreversible)
    Delete {
        #[arg(long)]
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Resize a stopped instance
    Update {
        #[arg(long)]
        id: String,
        /// New instance type
        #[arg(long = "type")]
        instance_type: String,
    },
}

#[derive(Subcommand)]
enum StorageCmd {
    /// Create a bucket (private unless --public)
    Create {
        /// Globally unique bucket name
        #[arg(long)]
        name: String,
        /// Remove the public-access block (requires confirmation)
        #[arg(long)]
        public: bool,
        /// Skip confirmation prompts
        #[arg(long)]
        yes: bool,
    },
    /// List buckets created by this tool
    List,
    /// Delete a bucket (must be empty)
    Delete {
        #[arg(long)]
        name: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Upload a file to a managed bucket
    Upload {
        #[arg(long)]
        bucket: String,
        /// Path to the local file
        #[arg(long)]
        file: String,
        /// Object key (defaults to the file name)
        #[arg(long)]
        key: Option<String>,
    },
}

#[derive(Subcommand)]
enum DnsCmd {
    /// Create a hosted zone
    CreateZone {
        /// Domain name
        #[arg(long)]
        name: String,
    },
    /// List hosted zones created by this tool
    ListZones,
    /// Create (upsert) an A record in a managed zone
    Create {
        /// Hosted zone id (from list-zones)
        #[arg(long)]
        zone: String,
        /// Full record name, e.g. web.example.com
        #[arg(long)]
        name: String,
        /// Target IP address
        #[arg(long)]
        ip: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    let config = load_config(cli.region.clone()).await;

    match cli.command {
        Commands::Compute(cmd) => compute(cmd, &config).await,
        Commands::Storage(cmd) => storage(cmd, &config).await,
        Commands::Dns(cmd) => dns(cmd, &config).await,
    }
}

async fn compute(cmd: ComputeCmd, config: &aws_config::SdkConfig) -> anyhow::Result<()> {
    let manager = ComputeManager::new(config);
    match cmd {
        ComputeCmd::Create {
            name,
            os,
            instance_type,
        } => {
            let os: OsImage = os
                .parse()
                .map_err(|_| anyhow::anyhow!("unknown OS label '{os}' (amazon-linux | ubuntu)"))?;
            println!(
                "{}",
                format!("Provisioning {os} instance ({instance_type})...")
                    .blue()
                    .bold()
            );
            let spec = LaunchSpec {
                name,
                os,
                instance_type,
            };
            match manager.create(&spec).await {
                Ok(id) => println!("{} created instance {}", "SUCCESS:".green().bold(), id.bold()),
                Err(e) => fail(&e),
            }
        }
        ComputeCmd::List => match manager.list().await {
            Ok(instances) => print_instances(&instances),
            Err(e) => fail(&e),
        },
        ComputeCmd::Start { id } => {
            println!("Starting {id}...");
            match manager.start(&id).await {
                Ok(()) => println!("{}", format!("Start signal sent to {id}").green()),
                Err(e) => fail(&e),
            }
        }
        ComputeCmd::Stop { id } => {
            println!("Stopping {id}...");
            match manager.stop(&id).await {
                Ok(()) => println!("{}", format!("Stop signal sent to {id}").green()),
                Err(e) => fail(&e),
            }
        }
        ComputeCmd::Delete { id, yes } => {
            if !yes && !confirm("Permanently terminate this instance?")? {
                println!("Aborted.");
                return Ok(());
            }
            println!("{}", format!("Terminating {id}...").red().bold());
            match manager.terminate(&id).await {
                Ok(()) => println!("{}", format!("Instance {id} terminated.").green()),
                Err(e) => fail(&e),
            }
        }
        ComputeCmd::Update { id, instance_type } => {
            println!("Resizing {id} to {instance_type}...");
            match manager.resize(&id, &instance_type).await {
                Ok(()) => println!("{}", "Instance resized.".green()),
                Err(e) => fail(&e),
            }
        }
    }
    Ok(())
}

async fn storage(cmd: StorageCmd, config: &aws_config::SdkConfig) -> anyhow::Result<()> {
    let manager = StorageManager::new(config);
    match cmd {
        StorageCmd::Create { name, public, yes } => {
            if public && !yes {
                println!(
                    "{}",
                    format!("WARNING: bucket '{name}' will be PUBLIC!").red().bold()
                );
                if !confirm("Are you sure you want to proceed?")? {
                    println!("Aborted.");
                    return Ok(());
                }
            }
            println!("{}", format!("Creating bucket {name}...").blue().bold());
            match manager.create(&name, public).await {
                Ok(()) => {
                    let posture = if public { "public".red() } else { "private".green() };
                    println!("{} bucket created ({posture})", "SUCCESS:".green().bold());
                }
                Err(e) => fail(&e),
            }
        }
        StorageCmd::List => match manager.list().await {
            Ok(buckets) => print_buckets(&buckets),
            Err(e) => fail(&e),
        },
        StorageCmd::Delete { name, yes } => {
            if !yes && !confirm("Permanently delete this bucket?")? {
                println!("Aborted.");
                return Ok(());
            }
            println!("{}", format!("Deleting bucket {name}...").red().bold());
            match manager.delete(&name).await {
                Ok(()) => println!("{}", format!("Bucket {name} deleted.").green()),
                Err(e) => fail(&e),
            }
        }
        StorageCmd::Upload { bucket, file, key } => {
            let key = key.unwrap_or_else(|| {
                Path::new(&file)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.clone())
            });
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("could not read '{file}'"))?;
            println!("Uploading {} to {}...", file.bold(), bucket.bold());
            match manager.upload(&bucket, &key, body).await {
                Ok(()) => println!("{} uploaded as {key}", "SUCCESS:".green().bold()),
                Err(e) => fail(&e),
            }
        }
    }
    Ok(())
}

async fn dns(cmd: DnsCmd, config: &aws_config::SdkConfig) -> anyhow::Result<()> {
    let manager = DnsManager::new(config);
    match cmd {
        DnsCmd::CreateZone { name } => {
            println!("{}", format!("Creating hosted zone {name}...").blue().bold());
            match manager.create_zone(&name).await {
                Ok(zone) => {
                    println!("{} zone created", "SUCCESS:".green().bold());
                    println!("Zone ID: {}", zone.id.cyan());
                }
                Err(e) => fail(&e),
            }
        }
        DnsCmd::ListZones => match manager.list_zones().await {
            Ok(zones) => print_zones(&zones),
            Err(e) => fail(&e),
        },
        DnsCmd::Create { zone, name, ip } => {
            println!("{}", format!("Pointing {name} -> {ip}...").blue().bold());
            match manager.create_record(&zone, &name, &ip).await {
                Ok(()) => println!("{} DNS record created/updated", "SUCCESS:".green().bold()),
                Err(e) => fail(&e),
            }
        }
    }
    Ok(())
}

fn fail(err: &OpError) {
    eprintln!("{} {err}", "FAILED:".red().bold());
    std::process::exit(1);
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    let answer = answer.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn print_instances(instances: &[Instance]) {
    if instances.is_empty() {
        println!(
            "{}",
            format!(
                "No instances found with tag {}={}",
                opsdesk::tags::MARKER_KEY,
                opsdesk::tags::MARKER_VALUE
            )
            .yellow()
        );
        return;
    }
    println!(
        "{:<20} {:<16} {:<10} {:<12} {}",
        "ID".bold(),
        "NAME".bold(),
        "TYPE".bold(),
        "STATE".bold(),
        "PUBLIC IP".bold()
    );
    for instance in instances {
        let state = instance.state.to_string();
        let state = match instance.state {
            InstanceState::Running => state.green(),
            InstanceState::Pending | InstanceState::Stopping => state.yellow(),
            _ => state.red(),
        };
        println!(
            "{:<20} {:<16} {:<10} {:<12} {}",
            instance.id,
            instance.name.as_deref().unwrap_or("-"),
            instance.instance_type,
            state,
            instance.public_ip.as_deref().unwrap_or("-")
        );
    }
}

fn print_buckets(buckets: &[Bucket]) {
    if buckets.is_empty() {
        println!("{}", "No managed buckets found.".yellow());
        return;
    }
    println!("{:<40} {}", "NAME".bold(), "CREATED".bold());
    for bucket in buckets {
        let created = bucket
            .created
            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<40} {}", bucket.name.cyan(), created);
    }
}

fn print_zones(zones: &[HostedZone]) {
    if zones.is_empty() {
        println!("{}", "No managed hosted zones found.".yellow());
        return;
    }
    println!(
        "{:<18} {:<30} {}",
        "ZONE ID".bold(),
        "DOMAIN".bold(),
        "RECORDS".bold()
    );
    for zone in zones {
        println!("{:<18} {:<30} {}", zone.id.cyan(), zone.name.green(), zone.record_count);
    }
}
