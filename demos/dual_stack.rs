use std::collections::HashMap;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use dhtboot::config::{parse_port_segments, DEFAULT_ENTRY_POINT_PORT, DEFAULT_LISTEN_PORTS};
use dhtboot::{Command, Config, DhtSetup, EntryPoint, Family, Host, Trigger, AF_INET, AF_INET6};

use clap::Parser;

use tracing::Level;
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Candidate UDP ports, like `6881-6889,6999`
    #[arg(long, default_value = DEFAULT_LISTEN_PORTS)]
    ports: String,
    /// Directory of the dht.dat and dht6.dat state files
    #[arg(long, default_value = ".")]
    state_dir: PathBuf,
    /// IPv4 entry point host
    #[arg(long)]
    entry_point: Option<String>,
    /// IPv6 entry point host
    #[arg(long)]
    entry_point6: Option<String>,
    /// Port of the entry points
    #[arg(long, default_value_t = DEFAULT_ENTRY_POINT_PORT)]
    entry_point_port: u16,
    /// How long to run before saving and exiting, in seconds
    #[arg(long, default_value_t = 60)]
    seconds: u64,
}

fn main() {
    tracing_subscriber::fmt()
        // Switch to TRACE to see every datagram
        .with_max_level(Level::DEBUG)
        .init();

    let cli = Cli::parse();

    let mut config = Config::default()
        .with_listen_ports(parse_port_segments(&cli.ports).expect("Expected port segments"))
        .with_state_file(Family::Ipv4, cli.state_dir.join("dht.dat"))
        .with_state_file(Family::Ipv6, cli.state_dir.join("dht6.dat"));
    if let Some(host) = cli.entry_point {
        config = config.with_entry_point(Family::Ipv4, EntryPoint::new(host, cli.entry_point_port));
    }
    if let Some(host) = cli.entry_point6 {
        config = config.with_entry_point(Family::Ipv6, EntryPoint::new(host, cli.entry_point_port));
    }

    let mut host = Host::new(config);

    let mut commands = DhtSetup::setup(&mut host, AF_INET);
    commands.extend(DhtSetup::setup(&mut host, AF_INET6));

    println!(
        "DHT running on UDP port {} with {} commands (IPv4: {:?}, IPv6: {:?})",
        host.udp_port(),
        commands.len(),
        host.dht().state(Family::Ipv4),
        host.dht().state(Family::Ipv6),
    );

    run(&mut commands, Duration::from_secs(cli.seconds));

    for command in commands.iter_mut() {
        if let Err(error) = command.shutdown() {
            println!("Command {} failed to shut down: {}", command.cuid(), error);
        }
    }

    for family in Family::ALL {
        if let Some(stack) = host.dht().get(family) {
            let routing_table = dhtboot::common::lock(stack.routing_table());
            println!("{family}: {} nodes in the routing table", routing_table.size());
        }
    }
}

/// A minimal host run loop.
fn run(commands: &mut Vec<Box<dyn Command>>, duration: Duration) {
    let start = Instant::now();
    let mut last_run: HashMap<u64, Instant> = commands
        .iter()
        .map(|command| (command.cuid(), start))
        .collect();

    while start.elapsed() < duration {
        let now = Instant::now();

        commands.retain_mut(|command| {
            let due = match command.trigger() {
                Trigger::Readiness | Trigger::Immediate | Trigger::Once => true,
                Trigger::Interval(interval) => last_run
                    .get(&command.cuid())
                    .map_or(true, |last| now.duration_since(*last) >= interval),
            };
            if !due {
                return true;
            }

            if let Err(error) = command.execute() {
                println!("Command {} failed: {}", command.cuid(), error);
            }
            last_run.insert(command.cuid(), now);

            !matches!(command.trigger(), Trigger::Immediate | Trigger::Once)
        });

        thread::sleep(Duration::from_millis(50));
    }
}
