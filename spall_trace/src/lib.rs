//! Spall interval-trace writer and reader library.
//!
//! This library writes Begin/End interval events either as a binary Spall
//! trace or as a Chrome `chrome://tracing` JSON array, and reads binary Spall
//! traces back for validation.
//!
//! # Example
//!
//! ```no_run
//! use spall_trace::{EventSink, TimestampUnit, TraceFormat, TraceWriter};
//! use std::fs::File;
//! use std::io::BufWriter;
//!
//! let file = BufWriter::new(File::create("profile.spall").unwrap());
//! let mut writer = TraceWriter::new(TraceFormat::Spall, file, TimestampUnit::from_frequency(1000));
//!
//! writer.header().unwrap();
//! writer.begin("main", 1, 1, 5.0).unwrap();
//! writer.end(1, 1, 8.0).unwrap();
//! writer.footer().unwrap();
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use thiserror::Error;

/// Errors that can occur while writing a trace.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Spall encoding error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Result type for trace writing operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;

/// Errors that can occur while parsing a Spall trace.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic 0x{0:016x}, not a Spall file")]
    BadMagic(u64),

    #[error("unsupported Spall version {0}")]
    UnsupportedVersion(u64),

    #[error("reserved header field must be zero, found {0}")]
    NonZeroReserved(u64),

    #[error("unknown event type {kind} at byte offset {offset}")]
    UnknownEventType { kind: u8, offset: usize },

    #[error("truncated record at byte offset {0}")]
    Truncated(usize),
}

/// Result type for Spall parsing operations.
pub type Result<T> = std::result::Result<T, ParseError>;

// ============================================================================
// Format constants
// ============================================================================

pub const SPALL_MAGIC: u64 = 0x0BAD_F00D;
pub const SPALL_VERSION: u64 = 1;

const EVENT_STREAM_OVER: u8 = 2;
const EVENT_BEGIN: u8 = 3;
const EVENT_END: u8 = 4;

/// Longest name a Begin event can carry (its length is stored in one byte).
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// Encoded sizes of the fixed-width records below.
const HEADER_LEN: usize = 32;
const BEGIN_FIXED_LEN: usize = 20;
const END_LEN: usize = 17;

// Fixed parts of the Spall records. bincode's default options encode these
// with fixed-width little-endian integers and no padding, which is exactly
// the packed Spall layout.

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    magic: u64,
    version: u64,
    timestamp_unit: f64,
    must_be_0: u64,
}

/// Followed by `name_len` name bytes and `args_len` args bytes.
#[derive(Debug, Serialize, Deserialize)]
struct BeginEvent {
    kind: u8,
    category: u8,
    pid: u32,
    tid: u32,
    when: f64,
    name_len: u8,
    args_len: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct EndEvent {
    kind: u8,
    pid: u32,
    tid: u32,
    when: f64,
}

/// Category written for every JSON begin record.
pub const JSON_CATEGORY: &str = "dtrace";

// ============================================================================
// Timestamps
// ============================================================================

/// Number of microseconds represented by one trace timestamp unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestampUnit(f64);

impl TimestampUnit {
    /// Unit for a profile sampled at `hz` samples per second, so that one
    /// sample maps to `1_000_000 / hz` microseconds.
    pub fn from_frequency(hz: u32) -> Self {
        Self(1_000_000.0 / f64::from(hz))
    }

    /// Unit expressed directly in microseconds.
    pub fn from_micros(micros: f64) -> Self {
        Self(micros)
    }

    pub fn micros(self) -> f64 {
        self.0
    }

    /// Convert a timestamp in this unit to whole microseconds.
    pub fn to_micros(self, when: f64) -> i64 {
        (when * self.0).round() as i64
    }
}

// ============================================================================
// Event sink
// ============================================================================

/// Receiver of interval events.
///
/// `header` is called once before any event and `footer` once after the
/// last. Timestamps are in the sink's [`TimestampUnit`]. For a given
/// `(pid, tid)` every `end` closes the most recent unclosed `begin`.
pub trait EventSink {
    fn header(&mut self) -> WriteResult<()>;

    fn begin(&mut self, name: &str, pid: u32, tid: u32, when: f64) -> WriteResult<()>;

    fn end(&mut self, pid: u32, tid: u32, when: f64) -> WriteResult<()>;

    fn footer(&mut self) -> WriteResult<()>;
}

/// Output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    /// Binary Spall trace.
    Spall,
    /// Chrome tracing JSON array.
    Json,
}

/// One of the supported trace writers, picked once when output is opened.
pub enum TraceWriter<W: Write> {
    Spall(SpallWriter<W>),
    Json(JsonWriter<W>),
}

impl<W: Write> TraceWriter<W> {
    pub fn new(format: TraceFormat, writer: W, unit: TimestampUnit) -> Self {
        match format {
            TraceFormat::Spall => TraceWriter::Spall(SpallWriter::new(writer, unit)),
            TraceFormat::Json => TraceWriter::Json(JsonWriter::new(writer, unit)),
        }
    }

    /// Consume this writer and return the underlying writer.
    pub fn into_inner(self) -> W {
        match self {
            TraceWriter::Spall(w) => w.into_inner(),
            TraceWriter::Json(w) => w.into_inner(),
        }
    }
}

impl<W: Write> EventSink for TraceWriter<W> {
    fn header(&mut self) -> WriteResult<()> {
        match self {
            TraceWriter::Spall(w) => w.header(),
            TraceWriter::Json(w) => w.header(),
        }
    }

    fn begin(&mut self, name: &str, pid: u32, tid: u32, when: f64) -> WriteResult<()> {
        match self {
            TraceWriter::Spall(w) => w.begin(name, pid, tid, when),
            TraceWriter::Json(w) => w.begin(name, pid, tid, when),
        }
    }

    fn end(&mut self, pid: u32, tid: u32, when: f64) -> WriteResult<()> {
        match self {
            TraceWriter::Spall(w) => w.end(pid, tid, when),
            TraceWriter::Json(w) => w.end(pid, tid, when),
        }
    }

    fn footer(&mut self) -> WriteResult<()> {
        match self {
            TraceWriter::Spall(w) => w.footer(),
            TraceWriter::Json(w) => w.footer(),
        }
    }
}

// ============================================================================
// Spall writer
// ============================================================================

/// Writer for binary Spall traces.
///
/// Events are encoded little-endian and packed. The header records the
/// timestamp unit so `when` values are written as-is.
pub struct SpallWriter<W: Write> {
    writer: W,
    unit: TimestampUnit,
}

impl<W: Write> SpallWriter<W> {
    pub fn new(writer: W, unit: TimestampUnit) -> Self {
        Self { writer, unit }
    }

    /// Consume this writer and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> EventSink for SpallWriter<W> {
    fn header(&mut self) -> WriteResult<()> {
        let header = FileHeader {
            magic: SPALL_MAGIC,
            version: SPALL_VERSION,
            timestamp_unit: self.unit.micros(),
            must_be_0: 0,
        };
        bincode::serialize_into(&mut self.writer, &header)?;
        Ok(())
    }

    fn begin(&mut self, name: &str, pid: u32, tid: u32, when: f64) -> WriteResult<()> {
        let name = truncate_name(name);
        let event = BeginEvent {
            kind: EVENT_BEGIN,
            category: 0,
            pid,
            tid,
            when,
            name_len: name.len() as u8,
            args_len: 0,
        };
        bincode::serialize_into(&mut self.writer, &event)?;
        self.writer.write_all(name.as_bytes())?;
        Ok(())
    }

    fn end(&mut self, pid: u32, tid: u32, when: f64) -> WriteResult<()> {
        let event = EndEvent {
            kind: EVENT_END,
            pid,
            tid,
            when,
        };
        bincode::serialize_into(&mut self.writer, &event)?;
        Ok(())
    }

    fn footer(&mut self) -> WriteResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Cut `name` to at most [`MAX_NAME_LEN`] bytes without splitting a char.
fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ============================================================================
// JSON writer
// ============================================================================

#[derive(Serialize)]
struct BeginRecord<'a> {
    name: &'a str,
    cat: &'a str,
    ph: &'a str,
    ts: i64,
    pid: u32,
    tid: u32,
}

#[derive(Serialize)]
struct EndRecord<'a> {
    ph: &'a str,
    ts: i64,
    pid: u32,
    tid: u32,
}

/// Writer for Chrome tracing JSON arrays.
///
/// Timestamps are converted to integer microseconds on output.
pub struct JsonWriter<W: Write> {
    writer: W,
    unit: TimestampUnit,
    did_event: bool,
}

impl<W: Write> JsonWriter<W> {
    pub fn new(writer: W, unit: TimestampUnit) -> Self {
        Self {
            writer,
            unit,
            did_event: false,
        }
    }

    /// Consume this writer and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_record<T: Serialize>(&mut self, record: &T) -> WriteResult<()> {
        if self.did_event {
            self.writer.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut self.writer, record)?;
        self.did_event = true;
        Ok(())
    }
}

impl<W: Write> EventSink for JsonWriter<W> {
    fn header(&mut self) -> WriteResult<()> {
        self.writer.write_all(b"[\n")?;
        Ok(())
    }

    fn begin(&mut self, name: &str, pid: u32, tid: u32, when: f64) -> WriteResult<()> {
        let record = BeginRecord {
            name,
            cat: JSON_CATEGORY,
            ph: "B",
            ts: self.unit.to_micros(when),
            pid,
            tid,
        };
        self.write_record(&record)
    }

    fn end(&mut self, pid: u32, tid: u32, when: f64) -> WriteResult<()> {
        let record = EndRecord {
            ph: "E",
            ts: self.unit.to_micros(when),
            pid,
            tid,
        };
        self.write_record(&record)
    }

    fn footer(&mut self) -> WriteResult<()> {
        self.writer.write_all(b"\n]\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// Spall reader
// ============================================================================

/// A single event read back from a Spall trace.
#[derive(Debug, Clone, PartialEq)]
pub enum SpallEvent {
    Begin {
        name: String,
        args: String,
        category: u8,
        pid: u32,
        tid: u32,
        when: f64,
    },
    End {
        pid: u32,
        tid: u32,
        when: f64,
    },
}

impl SpallEvent {
    /// The `(pid, tid)` pair this event belongs to.
    pub fn thread(&self) -> (u32, u32) {
        match *self {
            SpallEvent::Begin { pid, tid, .. } | SpallEvent::End { pid, tid, .. } => (pid, tid),
        }
    }

    pub fn when(&self) -> f64 {
        match *self {
            SpallEvent::Begin { when, .. } | SpallEvent::End { when, .. } => when,
        }
    }
}

/// A parsed Spall trace.
#[derive(Debug, Clone)]
pub struct SpallFile {
    /// Microseconds per timestamp unit, from the header.
    pub unit: TimestampUnit,
    /// Events in file order.
    pub events: Vec<SpallEvent>,
}

impl SpallFile {
    /// Parse a Spall trace from any `Read`-able source.
    pub fn parse<R: Read>(mut reader: R) -> Result<Self> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;

        let header: FileHeader = decode(&data, 0)?;
        if header.magic != SPALL_MAGIC {
            return Err(ParseError::BadMagic(header.magic));
        }
        if header.version != SPALL_VERSION {
            return Err(ParseError::UnsupportedVersion(header.version));
        }
        if header.must_be_0 != 0 {
            return Err(ParseError::NonZeroReserved(header.must_be_0));
        }

        let mut events = Vec::new();
        let mut offset = HEADER_LEN;
        while let Some(&kind) = data.get(offset) {
            match kind {
                EVENT_STREAM_OVER => break,
                EVENT_BEGIN => {
                    let begin: BeginEvent = decode(&data, offset)?;
                    let name_start = offset + BEGIN_FIXED_LEN;
                    let args_start = name_start + usize::from(begin.name_len);
                    let next = args_start + usize::from(begin.args_len);
                    let text = data
                        .get(name_start..next)
                        .ok_or(ParseError::Truncated(offset))?;
                    let (name, args) = text.split_at(usize::from(begin.name_len));
                    events.push(SpallEvent::Begin {
                        name: String::from_utf8_lossy(name).into_owned(),
                        args: String::from_utf8_lossy(args).into_owned(),
                        category: begin.category,
                        pid: begin.pid,
                        tid: begin.tid,
                        when: begin.when,
                    });
                    offset = next;
                }
                EVENT_END => {
                    let end: EndEvent = decode(&data, offset)?;
                    events.push(SpallEvent::End {
                        pid: end.pid,
                        tid: end.tid,
                        when: end.when,
                    });
                    offset += END_LEN;
                }
                other => {
                    return Err(ParseError::UnknownEventType {
                        kind: other,
                        offset,
                    });
                }
            }
        }

        Ok(SpallFile {
            unit: TimestampUnit::from_micros(header.timestamp_unit),
            events,
        })
    }

    /// Number of Begin events.
    pub fn begin_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, SpallEvent::Begin { .. }))
            .count()
    }

    /// Number of End events.
    pub fn end_count(&self) -> usize {
        self.events.len() - self.begin_count()
    }

    /// All `(pid, tid)` pairs that appear in the trace.
    pub fn threads(&self) -> BTreeSet<(u32, u32)> {
        self.events.iter().map(SpallEvent::thread).collect()
    }

    /// Threads whose events do not form a balanced Begin/End sequence,
    /// either because an End arrives with nothing open or because frames are
    /// still open at the end of the trace.
    pub fn unbalanced_threads(&self) -> Vec<(u32, u32)> {
        let mut depth: BTreeMap<(u32, u32), Option<usize>> = BTreeMap::new();
        for event in &self.events {
            let entry = depth.entry(event.thread()).or_insert(Some(0));
            *entry = match (event, *entry) {
                (_, None) => None,
                (SpallEvent::Begin { .. }, Some(d)) => Some(d + 1),
                (SpallEvent::End { .. }, Some(d)) => d.checked_sub(1),
            };
        }
        depth
            .into_iter()
            .filter(|(_, d)| *d != Some(0))
            .map(|(thread, _)| thread)
            .collect()
    }
}

/// Decode the fixed-width record starting at `offset`. Running out of bytes
/// is the only way these records can fail to decode.
fn decode<T: DeserializeOwned>(data: &[u8], offset: usize) -> Result<T> {
    let bytes = data.get(offset..).unwrap_or_default();
    bincode::deserialize(bytes).map_err(|_| ParseError::Truncated(offset))
}
