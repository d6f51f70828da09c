//! Convert sampled DTrace stacks into interval traces.
//!
//! DTrace aggregations only record how often each call stack was seen. This
//! crate turns a stream of such samples into Begin/End interval events, as
//! if the calls had been instrumented, and writes them as a Spall or Chrome
//! JSON trace through [`spall_trace`].
//!
//! # Modules
//!
//! - [`symbol`] - Frame label cleanup
//! - [`stream`] - Line parser producing samples
//! - [`reconstruct`] - Stack diffing into interval events
//! - [`convert`] - End-to-end conversion and configuration
//!
//! # Example
//!
//! ```no_run
//! use dtrace2spall::convert::DtraceConverter;
//! use dtrace2spall::stream::Field;
//! use spall_trace::{JsonWriter, TimestampUnit};
//! use std::io::{self, BufWriter};
//!
//! let output = BufWriter::new(io::stdout());
//! let mut sink = JsonWriter::new(output, TimestampUnit::from_frequency(997));
//!
//! let mut converter = DtraceConverter::new(vec![Field::Pid, Field::Tid]);
//! converter.convert(io::stdin().lock(), &mut sink, None).unwrap();
//! ```

pub mod convert;
pub mod reconstruct;
pub mod stream;
pub mod symbol;

pub use convert::{ConvertError, ConverterConfig, DtraceConverter};

// Re-export spall_trace for convenience
pub use spall_trace;
