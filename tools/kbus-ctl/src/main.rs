//! kbus-ctl - CLI tool for kbus topologies
//!
//! Commands:
//! - `kbus-ctl topology <file>` - Build a topology from TOML and print it
//! - `kbus-ctl ping` - Run an echo/broadcast smoke test over real threads
//! - `kbus-ctl info` - Show version and default limits

mod topology;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use colored::Colorize;
use kbus::{Bus, BusConfig, BusError, BusFlags, Connection, Credentials, Destination, Limits, Mode, Subsystem};
use log::{debug, info};

use topology::Topology;

/// Well-known name claimed by the echo service in `ping`
const ECHO_NAME: &str = "org.kbus.Echo";

#[derive(Parser)]
#[command(name = "kbus-ctl")]
#[command(version)]
#[command(about = "kbus - in-process message bus control tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a topology file and print the resulting tree
    Topology {
        /// Path to the topology TOML
        file: PathBuf,
    },

    /// Run the echo and broadcast smoke test
    Ping {
        /// Number of client threads
        #[arg(short, long, default_value_t = 4)]
        peers: usize,

        /// Round trips per client
        #[arg(short, long, default_value_t = 100)]
        rounds: u32,

        /// Topology file to take limits from
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show version and default limits
    Info,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Topology { file } => {
            show_topology(&file)?;
        }

        Commands::Ping {
            peers,
            rounds,
            config,
        } => {
            let limits = match config {
                Some(path) => Topology::load(&path)?.limits,
                None => Limits::default(),
            };
            run_ping(peers, rounds, limits)?;
        }

        Commands::Info => {
            show_info();
        }
    }

    Ok(())
}

fn show_topology(file: &Path) -> anyhow::Result<()> {
    println!("{} Building topology {}", "📦".green(), file.display().to_string().bold());

    let topology = Topology::load(file)?;
    let subsystem = topology.build()?;
    print!("{}", topology::render(&subsystem));

    println!(
        "\n{} {} namespaces, {} majors in use",
        "✅".green(),
        subsystem.namespace_names().len() + 1,
        subsystem.majors_in_use()
    );
    Ok(())
}

fn run_ping(peers: usize, rounds: u32, limits: Limits) -> anyhow::Result<()> {
    println!(
        "{} Ping: {} peers x {} rounds",
        "🚀".green(),
        peers,
        rounds
    );

    let subsystem = Subsystem::with_config(BusConfig { limits });
    let bus = Bus::create(subsystem.root(), "system", Mode::WORLD, BusFlags::empty(), 0, 0)?;
    let endpoint = bus.default_endpoint()?;
    let creds = Credentials::new(1000, 1000);

    let server = Connection::attach(&endpoint, creds)?;
    server.hello()?;
    server.set_name(ECHO_NAME)?;
    let echo = {
        let server = Arc::clone(&server);
        thread::spawn(move || echo_loop(&server))
    };

    let start = Instant::now();
    let clients: Vec<_> = (0..peers)
        .map(|_| {
            let conn = Connection::attach(&endpoint, creds)?;
            conn.hello()?;
            Ok(conn)
        })
        .collect::<Result<_, BusError>>()?;

    let workers: Vec<_> = clients
        .iter()
        .map(|conn| {
            let conn = Arc::clone(conn);
            thread::spawn(move || ping_rounds(&conn, rounds))
        })
        .collect();

    let mut completed = 0u64;
    for worker in workers {
        completed += worker
            .join()
            .map_err(|_| anyhow::anyhow!("client thread panicked"))??;
    }
    let elapsed = start.elapsed();
    println!(
        "  {} round trips in {:.2?} ({:.0}/s)",
        completed,
        elapsed,
        completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    // Everyone except the announcer sees the broadcast once
    let announcer = Connection::attach(&endpoint, creds)?;
    announcer.hello()?;
    announcer.send(Destination::Broadcast, b"goodbye".to_vec())?;
    let mut seen = 0;
    for conn in &clients {
        let msg = conn.receive_timeout(Duration::from_secs(5))?;
        if msg.payload() == Some(&b"goodbye"[..]) {
            seen += 1;
        }
    }
    println!("  broadcast reached {}/{} clients", seen, clients.len());

    bus.disconnect();
    let served = echo
        .join()
        .map_err(|_| anyhow::anyhow!("echo thread panicked"))??;
    debug!("echo service handled {} messages", served);

    if seen != clients.len() {
        anyhow::bail!("broadcast reached {} of {} clients", seen, clients.len());
    }
    println!("{} Ping complete", "✅".green());
    Ok(())
}

/// Echo every payload back to its sender until the bus goes away
fn echo_loop(server: &Connection) -> anyhow::Result<u64> {
    let mut served = 0;
    loop {
        let msg = match server.receive() {
            Ok(msg) => msg,
            Err(err) if err.is_disconnect() => return Ok(served),
            Err(err) => return Err(err.into()),
        };
        let Some(payload) = msg.payload() else {
            continue;
        };
        match server.send(Destination::Id(msg.sender()), payload.to_vec()) {
            Ok(_) => served += 1,
            // The sender may already be gone; broadcasts are echoed too
            Err(BusError::DestinationNotFound(_)) => {}
            Err(err) if err.is_disconnect() => return Ok(served),
            Err(err) => return Err(err.into()),
        }
    }
}

fn ping_rounds(conn: &Connection, rounds: u32) -> anyhow::Result<u64> {
    for round in 0..rounds {
        let payload = round.to_le_bytes().to_vec();
        conn.send(Destination::Name(ECHO_NAME.to_string()), payload.clone())?;
        let reply = conn.receive_timeout(Duration::from_secs(5))?;
        if reply.payload() != Some(payload.as_slice()) {
            anyhow::bail!("connection {} got a mismatched echo in round {}", conn.id(), round);
        }
    }
    info!("connection {} finished {} rounds", conn.id(), rounds);
    Ok(rounds as u64)
}

fn show_info() {
    let limits = Limits::default();
    println!("{}", "kbus - in-process message bus".bold().green());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("\n{}", "Default limits".italic());
    println!("  max_queued_messages       {}", limits.max_queued_messages);
    println!("  endpoint_backlog          {}", limits.endpoint_backlog);
    println!("  max_payload               {}", limits.max_payload);
    println!("  max_names_per_connection  {}", limits.max_names_per_connection);
    println!("\nCommands:");
    println!("  kbus-ctl topology <file>   Build and print a topology");
    println!("  kbus-ctl ping              Run the smoke test");
}
