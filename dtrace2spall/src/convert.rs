//! Convert DTrace stack samples into an interval trace.
//!
//! Lines are read one at a time and each completed sample is diffed and
//! written before the next line is read, so memory use does not grow with
//! the length of the input.
//!
//! # Example
//!
//! ```no_run
//! use dtrace2spall::convert::{ConverterConfig, DtraceConverter};
//! use spall_trace::{TraceFormat, TraceWriter};
//! use std::fs::File;
//! use std::io::{BufReader, BufWriter};
//!
//! let config = ConverterConfig::default();
//! let input = BufReader::new(File::open("dtrace.out").unwrap());
//! let output = BufWriter::new(File::create("profile.spall").unwrap());
//! let mut sink = TraceWriter::new(TraceFormat::Spall, output, config.timestamp_unit());
//!
//! let mut converter = DtraceConverter::with_config(&config);
//! converter.convert(input, &mut sink, None).unwrap();
//! ```

use crate::reconstruct::StackReconstructor;
use crate::stream::{Field, FrameStreamParser};
use log::{error, info};
use spall_trace::{EventSink, TimestampUnit, TraceFormat, WriteError};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while converting DTrace output.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("trace write error: {0}")]
    Write(#[from] WriteError),

    #[error(
        "line {line}: Expected {expected} fields but got {actual}. Problematic line:\n{text}"
    )]
    FieldCount {
        line: usize,
        expected: usize,
        actual: usize,
        text: String,
    },

    #[error("line {line}: \"{token}\" is not a valid {field}.")]
    InvalidField {
        line: usize,
        field: &'static str,
        token: String,
    },

    #[error("line {line}: '{value}' is not a valid sample count")]
    InvalidCount { line: usize, value: String },

    #[error("--passthrough requires the use of --out (because --passthrough needs stdout)")]
    PassthroughNeedsOut,

    #[error("sampling frequency must be at least 1 Hz")]
    ZeroFrequency,
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Where the trace is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    Stdout,
    File(PathBuf),
}

impl OutputTarget {
    /// Interpret a command-line path, where `-` means standard output.
    pub fn from_arg(arg: &str) -> Self {
        if arg.is_empty() || arg == "-" {
            OutputTarget::Stdout
        } else {
            OutputTarget::File(PathBuf::from(arg))
        }
    }
}

/// Configuration for the converter.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Meaning of the tokens on each sample's header line. Empty when
    /// samples have no header line.
    pub fields: Vec<Field>,
    /// Sampling frequency in Hz, used to turn sample counts into time.
    pub frequency_hz: u32,
    /// Echo every input line to standard output.
    pub passthrough: bool,
    pub format: TraceFormat,
    pub output: OutputTarget,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            frequency_hz: 1000,
            passthrough: false,
            format: TraceFormat::Spall,
            output: OutputTarget::Stdout,
        }
    }
}

impl ConverterConfig {
    /// Reject settings that cannot work before any input is read.
    pub fn validate(&self) -> Result<()> {
        if self.passthrough && self.output == OutputTarget::Stdout {
            return Err(ConvertError::PassthroughNeedsOut);
        }
        if self.frequency_hz == 0 {
            return Err(ConvertError::ZeroFrequency);
        }
        Ok(())
    }

    pub fn timestamp_unit(&self) -> TimestampUnit {
        TimestampUnit::from_frequency(self.frequency_hz)
    }
}

/// Totals for one conversion run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertStats {
    pub lines: usize,
    pub samples: u64,
    pub begins: u64,
    pub ends: u64,
    pub threads: usize,
    /// Synthetic clock at the end of the run, in samples.
    pub final_clock: u64,
    /// False when reading stopped early on an input error.
    pub input_complete: bool,
}

/// Converter from DTrace stack samples to interval events.
pub struct DtraceConverter {
    parser: FrameStreamParser,
    reconstructor: StackReconstructor,
}

impl DtraceConverter {
    /// Create a converter for samples with the given header fields.
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            parser: FrameStreamParser::new(fields),
            reconstructor: StackReconstructor::new(),
        }
    }

    /// Create a converter from a full configuration.
    pub fn with_config(config: &ConverterConfig) -> Self {
        Self::new(config.fields.clone())
    }

    /// Read samples from `reader` until end of input and write the
    /// resulting events to `sink`, framed by its header and footer.
    ///
    /// Lines are taken as bytes. Anything that is not valid UTF-8 is
    /// replaced with U+FFFD before parsing, and `echo` (when given) receives
    /// the raw bytes unchanged. An I/O error ends the input early: it is
    /// logged, open frames are still closed and the footer is still written.
    pub fn convert<R: BufRead, S: EventSink>(
        &mut self,
        mut reader: R,
        sink: &mut S,
        mut echo: Option<&mut dyn Write>,
    ) -> Result<ConvertStats> {
        sink.header()?;

        let mut input_complete = true;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!("reading input after line {}: {}", self.parser.line_num(), e);
                    input_complete = false;
                    break;
                }
            }
            let raw = trim_line_ending(&buf);

            if let Some(echo) = echo.as_deref_mut() {
                echo.write_all(raw)?;
                echo.write_all(b"\n")?;
            }

            let line = String::from_utf8_lossy(raw);
            let reconstructor = &mut self.reconstructor;
            self.parser.push_line(&line, |sample| {
                reconstructor
                    .apply(sample, sink)
                    .map_err(ConvertError::from)
            })?;
        }

        if let Some(echo) = echo.as_deref_mut() {
            echo.flush()?;
        }

        self.reconstructor.finish(sink)?;
        sink.footer()?;

        let stats = self.stats(input_complete);
        info!(
            "converted {} samples on {} threads into {} intervals ({} samples of synthetic time)",
            stats.samples, stats.threads, stats.begins, stats.final_clock
        );
        Ok(stats)
    }

    fn stats(&self, input_complete: bool) -> ConvertStats {
        ConvertStats {
            lines: self.parser.line_num(),
            samples: self.reconstructor.samples(),
            begins: self.reconstructor.begins(),
            ends: self.reconstructor.ends(),
            threads: self.reconstructor.thread_count(),
            final_clock: self.reconstructor.now(),
            input_complete,
        }
    }
}

/// Strip a trailing `\n` or `\r\n`.
fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
