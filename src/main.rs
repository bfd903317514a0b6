//! Sensorgate - sensor gateway reader
//!
//! Reads framed packets from the gateway's serial link (or a capture file),
//! tracks packet loss per sensor and hands reconstructed samples to the
//! configured consumers.

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use sensorgate_core::cli::{print_exit_codes, CliResult};
use sensorgate_core::config::{config_file, ConfigError, GatewayConfig};
use sensorgate_core::core::channel::{BackpressurePolicy, Record, SampleChannel, SampleStream};
use sensorgate_core::core::protocol::{
    encode_heartbeat, encode_readings, to_fixed_point, DecodeError, Decoded, PacketDecoder,
    Payload, StreamAssembler,
};
use sensorgate_core::core::reader::{GatewayReader, ReaderHandle};
use sensorgate_core::core::report::{format_report, spawn_stats_reporter};
use sensorgate_core::core::sink::{spawn_sink_consumer, FileSink, RecordFormat};
use sensorgate_core::core::stop::StopSignal;
use sensorgate_core::core::transport::{list_ports, ReplayTransport, SerialTransport};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// CLI output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Human-readable text
    Text,
    /// JSON format for scripting
    Json,
}

/// Sensorgate CLI
#[derive(Parser, Debug)]
#[command(
    name = "sensorgate",
    version,
    about = "Packet framing, decoding and loss accounting for a serial sensor gateway",
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "SENSORGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output (repeat for trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log as JSON
    #[arg(long, global = true)]
    log_json: bool,

    /// Also write a daily rolling log file into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Read the gateway until stopped
    Run(RunArgs),

    /// List available serial ports
    ListPorts,

    /// Decode a hex-encoded byte capture and print its packets
    Decode {
        /// Hex bytes (spaces allowed)
        hex: String,
    },

    /// Write a synthetic capture for replay
    Encode(EncodeArgs),

    /// Print the effective configuration as TOML
    Config {
        /// Write it to the config file as well
        #[arg(long)]
        save: bool,
    },

    /// Show exit codes
    ExitCodes,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Serial port (overrides config)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides config)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Replay a raw capture file instead of opening the serial port
    #[arg(long, conflicts_with_all = ["port", "baud"])]
    replay: Option<PathBuf>,

    /// Delay between replay reads in milliseconds
    #[arg(long, requires = "replay")]
    pace_ms: Option<u64>,

    /// Append records to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Record file format
    #[arg(long, value_enum)]
    output_format: Option<RecordFormatArg>,

    /// Print samples as they arrive
    #[arg(long)]
    live: bool,

    /// Full-queue policy for consumers
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Seconds between loss reports (0 disables)
    #[arg(long)]
    report_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct EncodeArgs {
    /// Destination file
    #[arg(short, long)]
    output: PathBuf,

    /// Readings packets to generate
    #[arg(short = 'n', long, default_value_t = 10)]
    packets: u32,

    /// Sensor id
    #[arg(short, long, default_value_t = 0)]
    sensor: u8,

    /// First sequence id
    #[arg(long, default_value_t = 0)]
    start_seq: u8,

    /// Meat probe temperature in degrees
    #[arg(long, default_value_t = 20.0)]
    meat: f32,

    /// Fire probe temperature in degrees
    #[arg(long, default_value_t = 0.0)]
    fire: f32,

    /// Readings per packet
    #[arg(long, default_value_t = 5)]
    batch: usize,

    /// Sequence ids to leave out, simulating radio loss
    #[arg(long, value_delimiter = ',')]
    skip: Vec<u8>,

    /// Insert a heartbeat after every N packets (0 disables)
    #[arg(long, default_value_t = 0)]
    heartbeat_every: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RecordFormatArg {
    Csv,
    Jsonl,
}

impl From<RecordFormatArg> for RecordFormat {
    fn from(arg: RecordFormatArg) -> Self {
        match arg {
            RecordFormatArg::Csv => Self::Csv,
            RecordFormatArg::Jsonl => Self::JsonLines,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Block,
    DropOldest,
}

impl From<PolicyArg> for BackpressurePolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Block => Self::Block,
            PolicyArg::DropOldest => Self::DropOldest,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let result = CliResult::from(&err);
            error!(code = result.code(), "{err:#}");
            if !cli.quiet {
                eprintln!("Error: {}", result.message().unwrap_or("unknown error"));
            }
            result.to_exit_code()
        }
    }
}

fn execute(cli: &Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => GatewayConfig::load_from(path)?,
        None => GatewayConfig::load()?,
    };
    let _guard = init_tracing(cli, &config)?;

    match &cli.command {
        Commands::Run(args) => run(cli, config, args),
        Commands::ListPorts => show_ports(cli),
        Commands::Decode { hex } => decode(cli, &config, hex),
        Commands::Encode(args) => encode(cli, args),
        Commands::Config { save } => show_config(cli, &config, *save),
        Commands::ExitCodes => {
            print_exit_codes();
            Ok(())
        }
    }
}

fn init_tracing(cli: &Cli, config: &GatewayConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => config.logging.level.as_str(),
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let directory = cli.log_dir.clone().or_else(|| config.logging.directory.clone());
    let (writer, guard) = match &directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "sensorgate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(directory.is_none())
        .with_thread_names(true);

    let installed = if cli.log_json || config.logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!(e))?;

    Ok(guard)
}

fn run(cli: &Cli, mut config: GatewayConfig, args: &RunArgs) -> anyhow::Result<()> {
    if let Some(port) = &args.port {
        config.serial.port.clone_from(port);
    }
    if let Some(baud) = args.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(path) = &args.output {
        config.output.path = Some(path.clone());
    }
    if let Some(format) = args.output_format {
        config.output.format = format.into();
    }
    if let Some(policy) = args.policy {
        config.channel.policy = policy.into();
    }
    if let Some(secs) = args.report_secs {
        config.stats.report_interval_secs = secs;
    }
    config.validate()?;

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.request_stop()).context("installing Ctrl+C handler")?;
    }

    let channel = SampleChannel::new(config.channel_config());
    let mut sinks = Vec::new();
    if let Some(path) = &config.output.path {
        let sink = FileSink::open(path, config.output.format)
            .with_context(|| format!("opening {}", path.display()))?
            .flush_every(config.output.flush_every);
        sinks.push(spawn_sink_consumer(channel.subscribe("file"), sink)?);
    }
    let live = if args.live {
        Some(spawn_live_display(channel.subscribe("live"), cli.format)?)
    } else {
        None
    };

    let reader = spawn_reader(args, &config, channel.clone(), stop.clone()).map_err(|e| {
        // Let the consumers already subscribed see the end of the stream.
        channel.close();
        e
    })?;
    let monitor = reader.loss_monitor().clone();

    let reporter = match config.report_interval() {
        Some(interval) => Some(spawn_stats_reporter(
            monitor.clone(),
            channel.clone(),
            interval,
            stop.clone(),
        )?),
        None => None,
    };

    if !cli.quiet {
        eprintln!("Reading gateway. Press Ctrl+C to exit.");
    }

    let outcome = reader.join();
    // The reader has closed the channel; consumers drain and finish.
    stop.request_stop();

    let mut sink_failure = None;
    for handle in sinks {
        match handle.join() {
            Ok(Ok(records)) => info!(records, "File sink finished"),
            Ok(Err(e)) => sink_failure = Some(anyhow::Error::new(e)),
            Err(_) => warn!("Sink thread panicked"),
        }
    }
    join_quietly(live, "live display");
    join_quietly(reporter, "stats reporter");

    let summary = format_report(&monitor.snapshot(), channel.dropped(), chrono::Local::now());
    if !cli.quiet {
        eprintln!("{summary}");
    }

    let stats = outcome?;
    info!(
        bytes = stats.bytes_read,
        packets = stats.packets_decoded,
        decode_errors = stats.decode_errors,
        resyncs = stats.resyncs,
        frames = stats.framing.frames_extracted,
        discarded = stats.framing.bytes_discarded,
        "Run complete"
    );
    sink_failure.map_or(Ok(()), Err)
}

fn spawn_reader(
    args: &RunArgs,
    config: &GatewayConfig,
    channel: SampleChannel,
    stop: StopSignal,
) -> anyhow::Result<ReaderHandle> {
    let options = config.reader_options();
    let handle = match &args.replay {
        Some(path) => {
            let mut transport = ReplayTransport::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            if let Some(ms) = args.pace_ms {
                transport = transport.paced(Duration::from_millis(ms));
            }
            GatewayReader::new(transport, options, channel, stop).spawn()?
        }
        None => {
            let transport = SerialTransport::open(config.serial.clone())
                .with_context(|| format!("opening {}", config.serial.port))?;
            GatewayReader::new(transport, options, channel, stop).spawn()?
        }
    };
    Ok(handle)
}

fn join_quietly<T>(handle: Option<JoinHandle<T>>, what: &str) {
    if let Some(handle) = handle {
        if handle.join().is_err() {
            warn!(thread = what, "Thread panicked");
        }
    }
}

fn spawn_live_display(stream: SampleStream, format: OutputFormat) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("live-display".into())
        .spawn(move || {
            let stdout = std::io::stdout();
            for record in stream.iter() {
                let mut out = stdout.lock();
                let written = match (&record, format) {
                    (_, OutputFormat::Json) => serde_json::to_string(&record)
                        .map_err(std::io::Error::from)
                        .and_then(|line| writeln!(out, "{line}")),
                    (Record::Sample(s), OutputFormat::Text) => writeln!(
                        out,
                        "{}  sensor {:>3}  #{:<3} [{}]  meat {:>6.1}  fire {:>6.1}",
                        s.timestamp.format("%H:%M:%S"),
                        s.sensor_id,
                        s.packet_id,
                        s.reading_index,
                        s.meat_temp,
                        s.fire_temp
                    ),
                    (Record::Heartbeat(h), OutputFormat::Text) => writeln!(
                        out,
                        "{}  heartbeat #{}: {}",
                        h.timestamp.format("%H:%M:%S"),
                        h.sequence_id,
                        h.text
                    ),
                };
                if written.is_err() {
                    // stdout closed (e.g. piped into head)
                    break;
                }
            }
        })
}

fn show_ports(cli: &Cli) -> anyhow::Result<()> {
    let ports = list_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": format!("{:?}", p.port_type)
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            for port in &ports {
                println!("  {} [{:?}]", port.port_name, port.port_type);
            }
        }
    }

    Ok(())
}

fn decode(cli: &Cli, config: &GatewayConfig, data: &str) -> anyhow::Result<()> {
    let cleaned: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(cleaned)?;

    let mut assembler = StreamAssembler::new(config.protocol.max_frame_len);
    let decoder = PacketDecoder::new(config.decoder_config());
    assembler.feed(&bytes);

    let mut decoded = 0usize;
    let mut last_error: Option<DecodeError> = None;
    while let Some(body) = assembler.try_extract_packet() {
        match decoder.decode_frame(&body) {
            Ok(Decoded { packet, skipped }) => {
                decoded += 1;
                if skipped > 0 && !cli.quiet {
                    eprintln!("skipped {skipped} byte(s) of a truncated frame");
                }
                match cli.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string(&packet)?),
                    OutputFormat::Text => match &packet.payload {
                        Payload::Heartbeat(text) => {
                            println!("#{:<3} heartbeat: {text}", packet.sequence_id);
                        }
                        Payload::Readings(readings) => {
                            let temps: Vec<String> = readings
                                .iter()
                                .map(|r| format!("{:.1}/{:.1}", r.meat_temp, r.fire_temp))
                                .collect();
                            println!(
                                "#{:<3} sensor {:>3}: {}",
                                packet.sequence_id,
                                packet.sensor_id,
                                temps.join("  ")
                            );
                        }
                    },
                }
            }
            Err(e) => {
                if !cli.quiet {
                    eprintln!("{} ({})", e, hex::encode(&body));
                }
                last_error = Some(e);
            }
        }
    }

    let stats = assembler.stats();
    if !cli.quiet {
        eprintln!(
            "{decoded} packet(s), {} byte(s) discarded, {} byte(s) incomplete",
            stats.bytes_discarded,
            assembler.buffered()
        );
    }

    match last_error {
        Some(e) if decoded == 0 => Err(e.into()),
        _ => Ok(()),
    }
}

fn encode(cli: &Cli, args: &EncodeArgs) -> anyhow::Result<()> {
    let pairs = vec![(to_fixed_point(args.meat), to_fixed_point(args.fire)); args.batch];
    let mut capture = Vec::new();
    let mut sequence = args.start_seq;
    let mut written = 0u32;
    let mut heartbeat_seq = 0u8;

    for n in 1..=args.packets {
        if !args.skip.contains(&sequence) {
            capture.extend(encode_readings(sequence, args.sensor, &pairs));
            written += 1;
        }
        sequence = sequence.wrapping_add(1);

        if args.heartbeat_every > 0 && n % args.heartbeat_every == 0 {
            capture.extend(encode_heartbeat(heartbeat_seq, "sensorgate encode"));
            heartbeat_seq = heartbeat_seq.wrapping_add(1);
        }
    }

    std::fs::write(&args.output, &capture)
        .with_context(|| format!("writing {}", args.output.display()))?;
    if !cli.quiet {
        println!(
            "Wrote {} readings packet(s), {} byte(s) to {}",
            written,
            capture.len(),
            args.output.display()
        );
    }
    Ok(())
}

fn show_config(cli: &Cli, config: &GatewayConfig, save: bool) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    if save {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => config_file().ok_or(ConfigError::NoConfigDir)?,
        };
        config.save(&path)?;
        if !cli.quiet {
            eprintln!("Saved to {}", path.display());
        }
    }
    Ok(())
}
