//! Convert DTrace stack samples to a Spall or Chrome JSON trace.
//!
//! This binary reads aggregated DTrace stack output and rebuilds the call
//! intervals it implies, writing them in the Spall format (or as
//! `chrome://tracing` JSON with `--json`).
//!
//! # Usage
//!
//! ```bash
//! dtrace -x ustackframes=100 -n 'profile-997 { @[pid, tid, ustack()] = count(); }' \
//!     | dtrace2spall --fields pid,tid --freq 997 -o profile.spall
//! dtrace2spall dtrace.out --json -o profile.json
//! some_pipeline | dtrace2spall --passthrough -o profile.spall | next_stage
//! ```

use clap::Parser;
use dtrace2spall::convert::{ConverterConfig, DtraceConverter, OutputTarget};
use dtrace2spall::stream::Field;
use spall_trace::{TraceFormat, TraceWriter};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "dtrace2spall")]
#[command(about = "Convert DTrace stack samples to a Spall or Chrome JSON trace")]
#[command(version)]
struct Args {
    /// Input file with DTrace stack output (defaults to stdin)
    input: Option<PathBuf>,

    /// The frequency of profile sampling, in Hz
    #[arg(short, long, default_value_t = 1000, value_parser = clap::value_parser!(u32).range(1..))]
    freq: u32,

    /// The file to write the results to. Use "-" for stdout
    #[arg(short, long, default_value = "-")]
    out: String,

    /// Fields preceding each stack. Valid fields: pid, tid. Any other name
    /// is ignored (consider using "-" for such fields)
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    /// Pass the input through to stdout, making this tool invisible to
    /// pipelines. Requires --out
    #[arg(long)]
    passthrough: bool,

    /// Output chrome://tracing JSON instead of the Spall format
    #[arg(long)]
    json: bool,
}

impl From<Args> for ConverterConfig {
    fn from(args: Args) -> Self {
        ConverterConfig {
            fields: args.fields.iter().map(|f| Field::from(f.as_str())).collect(),
            frequency_hz: args.freq,
            passthrough: args.passthrough,
            format: if args.json {
                TraceFormat::Json
            } else {
                TraceFormat::Spall
            },
            output: OutputTarget::from_arg(&args.out),
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let input_path = args.input.clone().filter(|p| p.as_os_str() != "-");
    let config = ConverterConfig::from(args);
    config.validate()?;

    // Open input
    let reader: Box<dyn BufRead> = match &input_path {
        Some(path) => {
            let file = File::open(path).map_err(|e| {
                format!("Failed to open input file '{}': {}", path.display(), e)
            })?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(io::stdin().lock()),
    };

    // Create output
    let output: Box<dyn Write> = match &config.output {
        OutputTarget::Stdout => Box::new(io::stdout().lock()),
        OutputTarget::File(path) => {
            let file = File::create(path).map_err(|e| {
                format!("Failed to create output file '{}': {}", path.display(), e)
            })?;
            Box::new(file)
        }
    };
    let mut sink = TraceWriter::new(config.format, BufWriter::new(output), config.timestamp_unit());

    let mut stdout;
    let echo: Option<&mut dyn Write> = if config.passthrough {
        stdout = io::stdout().lock();
        Some(&mut stdout)
    } else {
        None
    };

    let mut converter = DtraceConverter::with_config(&config);
    converter.convert(reader, &mut sink, echo)?;

    sink.into_inner().flush()?;

    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}
