use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use zwave_core::{
    Driver, DriverConfig, DriverHandle, LogLevel, Notification, NotificationCode,
    NotificationType, ShutdownReport, SimNode, SimulatedController, TracingWatcher, ValueId,
    ValuePayload,
};
use zwave_core::protocol::COMMAND_CLASS_CONFIGURATION;

const DEFAULT_PORT: &str = "/dev/ttyACM0";

#[derive(Parser, Debug)]
#[command(author, version, about = "Z-Wave controller tool", long_about = None)]
struct Args {
    /// Controller port (`/dev/ttyACM0`, `COM3`, or `VID:PID` for raw USB)
    #[arg(default_value = DEFAULT_PORT)]
    port: String,

    /// Controller interface: serial, hid or auto
    #[arg(long)]
    interface: Option<String>,

    /// TOML driver configuration
    #[arg(long)]
    config: Option<String>,

    /// Option override, repeatable (`--set poll_interval_ms=5000`)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    overrides: Vec<String>,

    /// Run against a simulated controller with a switch, a dimmer and a sensor
    #[arg(long)]
    simulate: bool,

    /// Seconds to wait for the network interview
    #[arg(long, default_value_t = 10)]
    settle: u64,

    /// Log level name (overrides the configured one)
    #[arg(long)]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print notifications as they arrive
    Monitor {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// List nodes and their values
    Nodes,
    /// Write a value
    Set {
        node: u8,
        /// Command class id, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_byte)]
        command_class: u8,
        index: u8,
        value: String,
        #[arg(long, default_value_t = 1)]
        instance: u8,
    },
    /// Read or write a configuration parameter
    Config {
        node: u8,
        param: u8,
        /// New value; reads the parameter when omitted
        #[arg(long)]
        value: Option<i32>,
        /// Parameter size in bytes (1, 2 or 4)
        #[arg(long, default_value_t = 1)]
        size: u8,
    },
}

fn parse_byte(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| e.to_string())
}

fn load_config(args: &Args) -> Result<DriverConfig> {
    let mut config = match &args.config {
        Some(path) => DriverConfig::load_from_file(path)?,
        None => DriverConfig::new(&args.port),
    };
    if args.port != DEFAULT_PORT {
        config.port = args.port.clone();
    }
    if let Some(interface) = &args.interface {
        config.set_option("interface", interface)?;
    }
    for entry in &args.overrides {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("Expected NAME=VALUE, got {}", entry))?;
        config.set_option(name.trim(), value)?;
    }
    if let Some(level) = &args.log_level {
        config.set_option("log_level", level)?;
    }
    if args.verbose {
        config.log_level = LogLevel::Debug;
    }
    Ok(config)
}

fn start(args: &Args, config: DriverConfig) -> Result<(DriverHandle, JoinHandle<ShutdownReport>)> {
    if args.simulate {
        let sim = SimulatedController::new(0x00C0_FFEE);
        sim.add_node(SimNode::switch(2));
        sim.add_node(SimNode::dimmer(3));
        sim.add_node(SimNode::sensor(4));
        info!("Using simulated controller");
        Ok(Driver::new(config, sim.transport()).spawn()?)
    } else {
        let driver = Driver::open(config).context("Failed to open controller")?;
        Ok(driver.spawn()?)
    }
}

/// Forward notifications of the listed kinds to a channel.
fn subscribe(handle: &DriverHandle, kinds: &'static [NotificationType]) -> Receiver<Notification> {
    let (tx, rx) = mpsc::channel();
    handle.add_watcher(Arc::new(move |n: &Notification| {
        if kinds.contains(&n.kind) {
            let _ = tx.send(n.clone());
        }
    }));
    rx
}

fn wait_for_interview(handle: &DriverHandle, rx: &Receiver<Notification>, settle: Duration) {
    if handle.status().is_ok_and(|status| status.all_queried) {
        return;
    }
    let deadline = Instant::now() + settle;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match rx.recv_timeout(left) {
            Ok(n) if n.kind == NotificationType::DriverFailed => return,
            Ok(n) => {
                info!(kind = %n.kind, "Network interview settled");
                return;
            }
            Err(_) => break,
        }
    }
    warn!("Network interview still running");
}

/// Block until transaction `id` completes or is dropped.
fn wait_for(rx: &Receiver<Notification>, id: u64, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        let n = rx.recv_timeout(left).context("No answer from driver")?;
        if n.transaction() != Some(id) {
            continue;
        }
        return match n.code {
            Some(NotificationCode::MsgComplete) => Ok(()),
            _ => bail!("Transaction {} failed: {}", id, n),
        };
    }
    bail!("Transaction {} did not finish in time", id)
}

fn print_nodes(handle: &DriverHandle) -> Result<()> {
    let status = handle.status()?;
    println!(
        "Home {:08X}, controller node {}, {} nodes ({})",
        status.home_id, status.controller_node_id, status.nodes, status.state
    );
    for node_id in handle.node_ids()? {
        let Some(node) = handle.node_info(node_id)? else {
            continue;
        };
        println!(
            "Node {:3}  {:<8}  {:<22}  {} {}",
            node.node_id, node.liveness, node.stage, node.manufacturer_name, node.product_name
        );
        for value in handle.node_values(node_id)? {
            println!(
                "    {:<24}  {:<28}  {} {}",
                value.id.to_string(),
                value.label,
                value.payload(),
                value.units
            );
        }
    }
    Ok(())
}

fn run(args: &Args, handle: &DriverHandle) -> Result<()> {
    const SETTLED: &[NotificationType] = &[
        NotificationType::DriverFailed,
        NotificationType::AwakeNodesQueried,
        NotificationType::AllNodesQueried,
        NotificationType::AllNodesQueriedSomeDead,
    ];
    const RESULTS: &[NotificationType] = &[NotificationType::Notification];

    let interview = subscribe(handle, SETTLED);
    let results = subscribe(handle, RESULTS);

    match &args.command {
        Command::Monitor { seconds } => {
            handle.add_watcher(Arc::new(|n: &Notification| println!("{}", n)));
            match seconds {
                Some(secs) => thread::sleep(Duration::from_secs(*secs)),
                None => loop {
                    thread::sleep(Duration::from_secs(1));
                    if handle.status().is_err() {
                        break;
                    }
                },
            }
        }
        Command::Nodes => {
            wait_for_interview(handle, &interview, Duration::from_secs(args.settle));
            print_nodes(handle)?;
        }
        Command::Set {
            node,
            command_class,
            index,
            value,
            instance,
        } => {
            wait_for_interview(handle, &interview, Duration::from_secs(args.settle));
            let id = ValueId::new(*node, *command_class, *instance, *index);
            let current = handle.get_value(id)?;
            let payload = ValuePayload::parse(current.value_type(), value).ok_or_else(|| {
                anyhow!("{:?} is not a valid {} value", value, current.value_type())
            })?;
            let tx = handle.set_value(id, payload)?;
            wait_for(&results, tx, Duration::from_secs(args.settle))?;
            println!("{} = {}", id, value);
        }
        Command::Config {
            node,
            param,
            value,
            size,
        } => {
            wait_for_interview(handle, &interview, Duration::from_secs(args.settle));
            let tx = match value {
                Some(value) => handle.set_config_param(*node, *param, *value, *size)?,
                None => handle.request_config_param(*node, *param)?,
            };
            wait_for(&results, tx, Duration::from_secs(args.settle))?;

            // A write is followed by a Get whose report lands a little later.
            let id = ValueId::new(*node, COMMAND_CLASS_CONFIGURATION, 1, *param);
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                let current = handle.get_value(id);
                let settled = match (&current, value) {
                    (Ok(v), Some(want)) => v.payload() == &ValuePayload::Int(*want),
                    (Ok(_), None) => true,
                    (Err(_), _) => false,
                };
                if settled || Instant::now() >= deadline {
                    match current {
                        Ok(v) => println!("Parameter {} = {}", param, v.payload()),
                        Err(e) => warn!(param, error = %e, "Parameter not reported"),
                    }
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(config.log_level.to_level_filter().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!(port = %config.port, "Starting Z-Wave driver...");

    let (handle, thread) = match start(&args, config) {
        Ok(started) => started,
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    };
    handle.add_watcher(Arc::new(TracingWatcher));

    let outcome = run(&args, &handle);
    handle.shutdown();
    match thread.join() {
        Ok(report) => info!(
            completed = report.completed.len(),
            timed_out = report.timed_out.len(),
            cancelled = report.cancelled.len(),
            "Driver stopped"
        ),
        Err(_) => error!("Driver thread panicked"),
    }

    if let Err(e) = outcome {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
