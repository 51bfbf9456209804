use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use ipnet::{IpNet, Ipv6Net};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use dhcpscope::{
    AllocationEngine, ClientId, Config, Error, Family, MemoryStore, PdPool, Pool, PoolTemplate,
    Reservation, ReservedPdPool, ReservedPool, Result, StaticRegistry, Subnet, TcpAgentClient,
};

#[derive(Parser)]
#[command(name = "dhcpscope")]
#[command(
    author,
    version,
    about = "DHCP address-space allocation and propagation engine",
    long_about = None
)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    ShowConfig,
    ListSubnets,
    /// Show a subnet and all of its children
    ShowSubnet {
        id: Uuid,
    },
    CreateSubnet {
        prefix: IpNet,
        /// Pinned sentry node (repeatable)
        #[arg(long = "node")]
        nodes: Vec<String>,
        #[arg(long, default_value = "")]
        comment: String,
    },
    CreatePool {
        subnet: Uuid,
        begin: IpAddr,
        end: IpAddr,
    },
    CreateReservedPool {
        subnet: Uuid,
        begin: IpAddr,
        end: IpAddr,
    },
    CreateReservation {
        subnet: Uuid,
        #[arg(long = "address")]
        addresses: Vec<IpAddr>,
        #[arg(long = "prefix")]
        prefixes: Vec<Ipv6Net>,
        #[arg(long)]
        hw_address: Option<String>,
        #[arg(long)]
        duid: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
    },
    CreatePdPool {
        subnet: Uuid,
        prefix: Ipv6Net,
        delegated_len: u8,
    },
    CreateReservedPdPool {
        subnet: Uuid,
        prefix: Ipv6Net,
        delegated_len: u8,
    },
    /// Delete an entity of the given kind
    Delete {
        kind: KindArg,
        id: Uuid,
    },
    CreateTemplate {
        name: String,
        family: FamilyArg,
        begin_offset: u64,
        capacity: u64,
    },
    ListTemplates,
    DeleteTemplate {
        name: String,
    },
    /// Dry-run a template against a subnet
    ValidateTemplate {
        name: String,
        subnet: Uuid,
    },
    ApplyTemplate {
        name: String,
        subnet: Uuid,
    },
    PendingRollbacks,
    ResolveRollback {
        id: Uuid,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Subnet,
    Pool,
    ReservedPool,
    Reservation,
    PdPool,
    ReservedPdPool,
}

#[derive(Clone, Copy, ValueEnum)]
enum FamilyArg {
    V4,
    V6,
}

impl From<FamilyArg> for Family {
    fn from(family: FamilyArg) -> Self {
        match family {
            FamilyArg::V4 => Family::V4,
            FamilyArg::V6 => Family::V6,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    let command = cli.command.unwrap_or(Commands::ListSubnets);

    info!("Using store {}", config.store_file);
    let store = MemoryStore::open(&config.store_file).await?;
    let agent = TcpAgentClient::new(&config.agent);
    let registry = StaticRegistry::new(
        config.registry.service.clone(),
        config.registry.instances.clone(),
    );
    let engine =
        AllocationEngine::new(config, Arc::new(store), Arc::new(agent), Arc::new(registry));

    if let Err(err) = run(&engine, command).await {
        error!("{} (retryable: {})", err, err.is_retryable());
        return Err(err);
    }
    Ok(())
}

async fn run(engine: &AllocationEngine, command: Commands) -> Result<()> {
    match command {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(engine.config())?);
        }
        Commands::ListSubnets => {
            let subnets = engine.list_subnets().await?;
            if subnets.is_empty() {
                println!("No subnets.");
            } else {
                println!("{:<38} {:<26} {:<12} {:<20}", "ID", "Prefix", "Capacity", "Sentries");
                println!("{}", "-".repeat(96));
                for subnet in subnets {
                    println!(
                        "{:<38} {:<26} {:<12} {:<20}",
                        subnet.id,
                        subnet.prefix.to_string(),
                        subnet.capacity.to_string(),
                        subnet.nodes.join(",")
                    );
                }
            }
        }
        Commands::ShowSubnet { id } => {
            let subnet = engine.get_subnet(id).await?;
            println!("{}", serde_json::to_string_pretty(&subnet)?);
            for pool in engine.list_pools(id).await? {
                println!(
                    "pool              {} {:<34} capacity {}",
                    pool.id,
                    pool.range().to_string(),
                    pool.capacity
                );
            }
            for pool in engine.list_reserved_pools(id).await? {
                println!(
                    "reserved pool     {} {:<34} capacity {}",
                    pool.id,
                    pool.range().to_string(),
                    pool.capacity
                );
            }
            for reservation in engine.list_reservations(id).await? {
                let bound: Vec<String> = reservation
                    .addresses
                    .iter()
                    .map(ToString::to_string)
                    .chain(reservation.prefixes.iter().map(ToString::to_string))
                    .collect();
                println!(
                    "reservation       {} {:<34} client {}",
                    reservation.id,
                    bound.join(","),
                    reservation.client_key().unwrap_or("-")
                );
            }
            for pool in engine.list_pd_pools(id).await? {
                println!(
                    "pd-pool           {} {:<34} capacity {}",
                    pool.id,
                    format!("{} /{}", pool.prefix, pool.delegated_len),
                    pool.capacity
                );
            }
            for pool in engine.list_reserved_pd_pools(id).await? {
                println!(
                    "reserved pd-pool  {} {:<34} capacity {}",
                    pool.id,
                    format!("{} /{}", pool.prefix, pool.delegated_len),
                    pool.capacity
                );
            }
        }
        Commands::CreateSubnet {
            prefix,
            nodes,
            comment,
        } => {
            let lifetimes = engine.config().defaults.lifetimes(Family::of_net(&prefix));
            let mut subnet = Subnet::new(prefix, lifetimes)?.with_nodes(nodes);
            subnet.comment = comment;
            let subnet = engine.create_subnet(subnet).await?;
            println!("Created subnet {} ({})", subnet.prefix, subnet.id);
        }
        Commands::CreatePool { subnet, begin, end } => {
            let pool = engine.create_pool(Pool::new(subnet, begin, end)?).await?;
            println!("Created pool {} ({}) capacity {}", pool.range(), pool.id, pool.capacity);
        }
        Commands::CreateReservedPool { subnet, begin, end } => {
            let pool = engine
                .create_reserved_pool(ReservedPool::new(subnet, begin, end)?)
                .await?;
            println!(
                "Created reserved pool {} ({}) capacity {}",
                pool.range(),
                pool.id,
                pool.capacity
            );
        }
        Commands::CreateReservation {
            subnet,
            addresses,
            prefixes,
            hw_address,
            duid,
            hostname,
        } => {
            let mut reservation = build_reservation(subnet, addresses, prefixes, hw_address, duid)?;
            reservation.hostname = hostname;
            let reservation = engine.create_reservation(reservation).await?;
            println!("Created reservation {} capacity {}", reservation.id, reservation.capacity);
        }
        Commands::CreatePdPool {
            subnet,
            prefix,
            delegated_len,
        } => {
            let pool = engine
                .create_pd_pool(PdPool::new(subnet, prefix, delegated_len)?)
                .await?;
            println!("Created pd-pool {} ({}) capacity {}", pool.prefix, pool.id, pool.capacity);
        }
        Commands::CreateReservedPdPool {
            subnet,
            prefix,
            delegated_len,
        } => {
            let pool = engine
                .create_reserved_pd_pool(ReservedPdPool::new(subnet, prefix, delegated_len)?)
                .await?;
            println!(
                "Created reserved pd-pool {} ({}) capacity {}",
                pool.prefix, pool.id, pool.capacity
            );
        }
        Commands::Delete { kind, id } => {
            match kind {
                KindArg::Subnet => engine.delete_subnet(id).await?,
                KindArg::Pool => engine.delete_pool(id).await?,
                KindArg::ReservedPool => engine.delete_reserved_pool(id).await?,
                KindArg::Reservation => engine.delete_reservation(id).await?,
                KindArg::PdPool => engine.delete_pd_pool(id).await?,
                KindArg::ReservedPdPool => engine.delete_reserved_pd_pool(id).await?,
            }
            println!("Deleted {}", id);
        }
        Commands::CreateTemplate {
            name,
            family,
            begin_offset,
            capacity,
        } => {
            let template = engine
                .create_template(PoolTemplate {
                    name,
                    family: family.into(),
                    begin_offset,
                    capacity,
                    domain_servers: Vec::new(),
                    comment: String::new(),
                })
                .await?;
            println!("Created template {}", template.name);
        }
        Commands::ListTemplates => {
            let templates = engine.list_templates().await?;
            if templates.is_empty() {
                println!("No templates.");
            }
            for template in templates {
                println!(
                    "{:<20} {:<4} offset {:<10} size {}",
                    template.name,
                    template.family.to_string(),
                    template.begin_offset,
                    template.capacity
                );
            }
        }
        Commands::DeleteTemplate { name } => {
            engine.delete_template(&name).await?;
            println!("Deleted template {}", name);
        }
        Commands::ValidateTemplate { name, subnet } => {
            let pool = engine.validate_template(&name, subnet).await?;
            println!(
                "Template {} fits: would create pool {} with capacity {}",
                name,
                pool.range(),
                pool.capacity
            );
        }
        Commands::ApplyTemplate { name, subnet } => {
            let pool = engine.create_pool_from_template(&name, subnet).await?;
            println!("Created pool {} ({}) capacity {}", pool.range(), pool.id, pool.capacity);
        }
        Commands::PendingRollbacks => {
            let records = engine.pending_rollbacks().await?;
            if records.is_empty() {
                println!("No pending rollbacks.");
            } else {
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
        }
        Commands::ResolveRollback { id } => {
            engine.resolve_rollback(id).await?;
            println!("Marked {} resolved.", id);
        }
    }
    Ok(())
}

fn build_reservation(
    subnet: Uuid,
    addresses: Vec<IpAddr>,
    prefixes: Vec<Ipv6Net>,
    hw_address: Option<String>,
    duid: Option<String>,
) -> Result<Reservation> {
    if let [IpAddr::V4(address)] = addresses.as_slice()
        && prefixes.is_empty()
    {
        let hw_address = hw_address
            .ok_or_else(|| Error::Validation("IPv4 reservations need --hw-address".to_string()))?;
        return Reservation::v4(subnet, &hw_address, *address);
    }

    let client = match (duid, hw_address) {
        (Some(duid), _) => ClientId::Duid(duid),
        (None, Some(hw_address)) => ClientId::HwAddress(hw_address),
        (None, None) => {
            return Err(Error::Validation(
                "reservations need --duid or --hw-address".to_string(),
            ));
        }
    };
    Reservation::v6(subnet, client, addresses, prefixes)
}
