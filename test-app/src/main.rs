// nikobus-cli -- command-line tool for exercising a Nikobus PC-Link, either
// on real hardware or against a mock transport.
//
// Usage:
//   nikobus-cli ports
//   nikobus-cli --port /dev/ttyUSB0 status
//   nikobus-cli --port /dev/ttyUSB0 request 6C0E --group both
//   nikobus-cli --port /dev/ttyUSB0 send '$10120E6C' --checksum --ack '$1C0E6C'
//   nikobus-cli --port /dev/ttyUSB0 press 0D1C2A
//   nikobus-cli --port /dev/ttyUSB0 -v monitor --duration 60
//   nikobus-cli --mock request 6C0E

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use nikobus::transport::{available_ports, DEFAULT_BAUD_RATE};
use nikobus::{
    protocol, Address, BusEvent, ChannelGroup, Command, CommandKind, Engine, EngineBuilder,
    EventSink, Frame, FrameFilter, FrameListener, Module, ModuleKind, ModuleRegistry,
    ProtocolEngine,
};
use nikobus_test_harness::MockTransport;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// nikobus-cli -- talk to a Nikobus installation through a PC-Link.
#[derive(Parser)]
#[command(name = "nikobus-cli", version, about)]
struct Cli {
    /// Serial port path (e.g. /dev/ttyUSB0, COM3).
    /// Required for every command except `ports` unless --mock is used.
    #[arg(long)]
    port: Option<String>,

    /// Baud rate of the PC-Link.
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Use a mock transport instead of a real serial port.
    /// Status requests are answered with all outputs off.
    #[arg(long)]
    mock: bool,

    /// Skip the PC-Link initialisation sequence after opening the port.
    #[arg(long)]
    no_handshake: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    /// RUST_LOG takes precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// List serial ports on this machine.
    Ports,

    /// Connect and print the connection status.
    Status,

    /// Request the output levels of a module.
    Request {
        /// Module address (4 hex digits, e.g. 6C0E).
        address: String,

        /// Which channel group(s) to read.
        #[arg(long, default_value = "both", value_enum)]
        group: GroupArg,

        /// Module kind, for display only.
        #[arg(long, default_value = "switch")]
        kind: String,

        /// Seconds to wait for the reply.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Send a raw frame.
    Send {
        /// Frame text without the trailing carriage return.
        payload: String,

        /// Append the CRC-16 and CRC-8 checksums to the payload.
        #[arg(long)]
        checksum: bool,

        /// Wait for a frame starting with this pattern.
        #[arg(long)]
        ack: Option<String>,

        /// Retries when no acknowledgement arrives.
        #[arg(long, default_value_t = 3)]
        retries: u32,
    },

    /// Simulate a button press.
    Press {
        /// Button address (6 hex digits, e.g. 0D1C2A).
        address: String,
    },

    /// Print every frame and bus event in real time.
    Monitor {
        /// Duration in seconds (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum GroupArg {
    One,
    Two,
    Both,
}

impl GroupArg {
    fn channels(self) -> &'static [u8] {
        match self {
            GroupArg::One => &[1],
            GroupArg::Two => &[7],
            GroupArg::Both => &[1, 7],
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn parse_address(text: &str, digits: usize) -> Result<Address> {
    let address: Address = text
        .parse()
        .with_context(|| format!("invalid address {text:?}"))?;
    if address.as_str().len() != digits {
        bail!("address {address} must have {digits} hex digits");
    }
    Ok(address)
}

/// Sink that prints every posted level.
struct PrintSink;

impl EventSink for PrintSink {
    fn post_update(&self, item: &str, value: u8) {
        println!("  {item:<12} 0x{value:02X}");
    }
}

/// Listener that prints every frame seen on the bus.
struct PrintFrames;

impl FrameListener for PrintFrames {
    fn name(&self) -> &str {
        "cli-monitor"
    }

    fn on_frame(&self, frame: &Frame) {
        println!("<< {frame}");
    }
}

/// Canned status reply with every output off.
fn mock_status_reply(address: &Address) -> Result<Vec<u8>> {
    let body = format!("{}000000000000", protocol::status_ack_pattern(address));
    let mut reply = protocol::append_checksum(&body)?.into_bytes();
    reply.push(protocol::TERMINATOR);
    Ok(reply)
}

fn build_engine(
    cli: &Cli,
    modules: Arc<ModuleRegistry>,
    mock_replies: &[(&[u8], Vec<u8>)],
) -> Result<Engine> {
    let builder = EngineBuilder::new()
        .baud_rate(cli.baud)
        .handshake(!cli.no_handshake && !cli.mock)
        .refresh_interval(Duration::ZERO)
        .event_sink(Arc::new(PrintSink))
        .modules(modules);

    if cli.mock {
        let mock = MockTransport::new();
        for (request, reply) in mock_replies {
            mock.reply_to(request, reply);
        }
        return builder
            .build_with_transport(Arc::new(mock))
            .context("failed to build engine with mock transport");
    }

    let port = cli
        .port
        .as_deref()
        .context("--port is required when not using --mock")?;
    builder
        .serial_port(port)
        .build()
        .context("failed to build engine")
}

async fn open(engine: &Engine) -> Result<()> {
    engine.start().await;
    engine
        .connect()
        .await
        .with_context(|| format!("failed to open {}", engine.transport().port_name()))?;
    println!("{}", engine.connection_status());
    Ok(())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_ports() -> Result<()> {
    let ports = available_ports().context("failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let engine = build_engine(cli, Arc::new(ModuleRegistry::new()), &[])?;
    println!("{}", engine.connection_status());
    let result = open(&engine).await;
    engine.stop().await;
    result
}

async fn cmd_request(
    cli: &Cli,
    address: &str,
    group: GroupArg,
    kind: &str,
    timeout: u64,
) -> Result<()> {
    let address = parse_address(address, 4)?;
    let kind: ModuleKind = kind.parse().context("invalid module kind")?;

    let mut module = Module::new(address.clone(), kind);
    for &first in group.channels() {
        for channel in first..first + ChannelGroup::SIZE as u8 {
            module = module.with_channel(channel, format!("output-{channel}"))?;
        }
    }
    let expected = module.groups().len();
    let modules = Arc::new(ModuleRegistry::new());
    modules.add(module);

    let reply = mock_status_reply(&address)?;
    let engine = build_engine(
        cli,
        modules,
        &[(&b"$1012"[..], reply.clone()), (&b"$1017"[..], reply)],
    )?;
    let mut events = engine.subscribe();
    open(&engine).await?;

    if !engine.schedule_status_update_request(&address, false)? {
        println!("Request for {address} already pending.");
    }
    println!("Module {address} ({kind})");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
    let mut received = 0;
    while received < expected {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(BusEvent::ModuleStatus {
                address: from,
                group,
                levels,
            })) if from == address => {
                info!(%group, ?levels, "status received");
                received += 1;
            }
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) => break,
            Err(_) => {
                engine.stop().await;
                bail!("no status reply from {address} within {timeout}s");
            }
        }
    }

    engine.stop().await;
    Ok(())
}

async fn cmd_send(
    cli: &Cli,
    payload: &str,
    checksum: bool,
    ack: Option<&str>,
    retries: u32,
) -> Result<()> {
    let payload = if checksum {
        protocol::append_checksum(payload)?
    } else {
        payload.to_string()
    };
    let mut command = Command::new(Address::controller(), CommandKind::Raw, payload.as_str())
        .with_max_retry_count(retries);
    if let Some(pattern) = ack {
        command = command.with_ack(pattern);
    }

    let engine = build_engine(cli, Arc::new(ModuleRegistry::new()), &[])?;
    open(&engine).await?;
    println!(">> {payload}");

    let result = if command.ack().is_some() {
        engine.send_and_wait(command).await.map(|frame| {
            println!("<< {frame}");
        })
    } else {
        engine.send(command).await
    };
    engine.stop().await;
    result.context("send failed")
}

async fn cmd_press(cli: &Cli, address: &str) -> Result<()> {
    let address = parse_address(address, 6)?;
    let command = protocol::button_press(&address)?;

    let engine = build_engine(cli, Arc::new(ModuleRegistry::new()), &[])?;
    open(&engine).await?;
    println!(">> {}", command.payload());
    let result = engine.send(command).await;
    engine.stop().await;
    result.context("button press failed")
}

async fn cmd_monitor(cli: &Cli, duration: u64) -> Result<()> {
    let engine = build_engine(cli, Arc::new(ModuleRegistry::new()), &[])?;
    engine.register(Arc::new(PrintFrames), FrameFilter::All);
    let mut events = engine.subscribe();
    open(&engine).await?;

    if duration == 0 {
        println!("Monitoring bus (Ctrl-C to stop)...\n");
    } else {
        println!("Monitoring bus for {duration} seconds...\n");
    }

    let stop = async {
        if duration == 0 {
            let _ = tokio::signal::ctrl_c().await;
        } else {
            tokio::time::sleep(Duration::from_secs(duration)).await;
        }
    };
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            event = events.recv() => match event {
                Ok(BusEvent::ButtonPressed { address }) => println!("   button {address}"),
                Ok(event) => println!("   {event:?}"),
                Err(RecvError::Lagged(n)) => println!("   (missed {n} events)"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.unregister_named("cli-monitor");
    engine.stop().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        CliCommand::Ports => cmd_ports(),
        CliCommand::Status => cmd_status(&cli).await,
        CliCommand::Request {
            address,
            group,
            kind,
            timeout,
        } => cmd_request(&cli, address, *group, kind, *timeout).await,
        CliCommand::Send {
            payload,
            checksum,
            ack,
            retries,
        } => cmd_send(&cli, payload, *checksum, ack.as_deref(), *retries).await,
        CliCommand::Press { address } => cmd_press(&cli, address).await,
        CliCommand::Monitor { duration } => cmd_monitor(&cli, *duration).await,
    }
}
