//! Parse DTrace aggregated stack output into samples.
//!
//! The input is the text DTrace prints for an aggregation such as
//! `@[pid, tid, ustack()] = count();`. Each sample is an optional header
//! line holding the key fields, one line per stack frame (innermost first),
//! and a line holding only the sample count. Samples are separated by
//! blank lines.
//!
//! ```text
//!   1  4242  7
//!
//!               libsystem_c.dylib`malloc+0x1a
//!               myapp`process_data+0x45
//!               myapp`main+0x89
//!               123
//! ```

use crate::convert::{ConvertError, Result};
use crate::symbol;
use log::debug;

/// Meaning of one whitespace-separated token on a sample's header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Pid,
    Tid,
    /// Any other name; the token is skipped.
    Ignored(String),
}

impl From<&str> for Field {
    fn from(name: &str) -> Self {
        match name {
            "pid" => Field::Pid,
            "tid" => Field::Tid,
            other => Field::Ignored(other.to_string()),
        }
    }
}

/// Identity of one independent call-stack timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadKey {
    pub pid: u32,
    pub tid: u32,
}

impl ThreadKey {
    pub fn new(pid: u32, tid: u32) -> Self {
        Self { pid, tid }
    }
}

/// One parsed sample.
///
/// `frames` are in input order, innermost first.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub key: ThreadKey,
    pub frames: &'a [String],
    pub count: u64,
}

impl<'a> Sample<'a> {
    /// Frame names from the outermost caller down to the sampled function.
    pub fn outermost_first(&self) -> impl Iterator<Item = &'a str> + use<'a> {
        self.frames.iter().rev().map(String::as_str)
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Waiting for the header line or the first frame of a stack.
    ExpectingNewFrame,
    /// Collecting frames until the count line ends the sample.
    InFrame,
}

/// Line-at-a-time parser for DTrace stack samples.
pub struct FrameStreamParser {
    fields: Vec<Field>,
    state: ParseState,
    key: ThreadKey,
    /// Normalized frames of the sample being read, innermost first.
    frames: Vec<String>,
    line_num: usize,
}

impl FrameStreamParser {
    /// Create a parser. An empty `fields` list means samples have no header
    /// line and start directly with their first frame.
    pub fn new(fields: Vec<Field>) -> Self {
        Self {
            fields,
            state: ParseState::ExpectingNewFrame,
            key: ThreadKey::default(),
            frames: Vec::new(),
            line_num: 0,
        }
    }

    /// Number of lines consumed so far.
    pub fn line_num(&self) -> usize {
        self.line_num
    }

    /// Feed one input line. When the line completes a sample, `on_sample`
    /// is called with it before the parser resets for the next one.
    pub fn push_line<F>(&mut self, line: &str, on_sample: F) -> Result<()>
    where
        F: FnOnce(&Sample<'_>) -> Result<()>,
    {
        self.line_num += 1;
        let line = line.trim();

        if line.is_empty() {
            if self.state == ParseState::InFrame && !self.frames.is_empty() {
                debug!(
                    "line {}: dropping sample with {} frames and no count",
                    self.line_num,
                    self.frames.len()
                );
            }
            self.reset();
            return Ok(());
        }

        match self.state {
            ParseState::ExpectingNewFrame => {
                if self.fields.is_empty() {
                    self.push_frame(line);
                } else {
                    self.parse_fields(line)?;
                }
                self.state = ParseState::InFrame;
            }
            ParseState::InFrame if is_count(line) => {
                let count = line.parse::<u64>().map_err(|_| ConvertError::InvalidCount {
                    line: self.line_num,
                    value: line.to_string(),
                })?;
                let sample = Sample {
                    key: self.key,
                    frames: &self.frames,
                    count,
                };
                let result = on_sample(&sample);
                self.reset();
                result?;
            }
            ParseState::InFrame => self.push_frame(line),
        }

        Ok(())
    }

    fn push_frame(&mut self, raw: &str) {
        self.frames.push(symbol::normalize(raw));
    }

    /// Parse a header line according to the configured fields.
    fn parse_fields(&mut self, line: &str) -> Result<()> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != self.fields.len() {
            return Err(ConvertError::FieldCount {
                line: self.line_num,
                expected: self.fields.len(),
                actual: tokens.len(),
                text: line.to_string(),
            });
        }

        for (field, token) in self.fields.iter().zip(tokens) {
            match field {
                Field::Pid => self.key.pid = parse_id(token, "pid", self.line_num)?,
                Field::Tid => self.key.tid = parse_id(token, "tid", self.line_num)?,
                Field::Ignored(_) => {}
            }
        }

        Ok(())
    }

    /// Clear the sample in progress, keeping the frame buffer's allocation.
    fn reset(&mut self) {
        self.frames.clear();
        self.key = ThreadKey::default();
        self.state = ParseState::ExpectingNewFrame;
    }
}

fn is_count(line: &str) -> bool {
    line.bytes().all(|b| b.is_ascii_digit())
}

fn parse_id(token: &str, field: &'static str, line: usize) -> Result<u32> {
    let invalid = || ConvertError::InvalidField {
        line,
        field,
        token: token.to_string(),
    };
    if !is_count(token) {
        return Err(invalid());
    }
    token.parse().map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Owned {
        key: ThreadKey,
        frames: Vec<String>,
        count: u64,
    }

    fn parse_all(fields: &[&str], input: &str) -> Result<Vec<Owned>> {
        let mut parser = FrameStreamParser::new(fields.iter().map(|f| Field::from(*f)).collect());
        let mut samples = Vec::new();
        for line in input.lines() {
            parser.push_line(line, |sample| {
                samples.push(Owned {
                    key: sample.key,
                    frames: sample.outermost_first().map(str::to_string).collect(),
                    count: sample.count,
                });
                Ok(())
            })?;
        }
        Ok(samples)
    }

    const SAMPLE_DTRACE_OUTPUT: &str = r#"
              libsystem_c.dylib`malloc+0x1a
              myapp`process_data+0x45
              myapp`main+0x89
              123

              libsystem_c.dylib`free+0x10
              myapp`cleanup+0x32
              myapp`main+0x112
              456
"#;

    #[test]
    fn parse_stacks_without_fields() {
        let samples = parse_all(&[], SAMPLE_DTRACE_OUTPUT).unwrap();

        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].key, ThreadKey::default());
        assert_eq!(
            samples[0].frames,
            vec![
                "myapp`main",
                "myapp`process_data",
                "libsystem_c.dylib`malloc"
            ]
        );
        assert_eq!(samples[0].count, 123);
        assert_eq!(
            samples[1].frames,
            vec!["myapp`main", "myapp`cleanup", "libsystem_c.dylib`free"]
        );
        assert_eq!(samples[1].count, 456);
    }

    #[test]
    fn parse_fields_header() {
        let input = "123 42 7\n  myapp`work+0x4\n  myapp`main+0x10\n  9\n";
        let samples = parse_all(&["-", "pid", "tid"], input).unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].key, ThreadKey::new(42, 7));
        assert_eq!(samples[0].frames, vec!["myapp`main", "myapp`work"]);
        assert_eq!(samples[0].count, 9);
    }

    #[test]
    fn key_resets_between_samples() {
        let input = "5 6\n  a\n  1\n\n0 8\n  b\n  2\n";
        let samples = parse_all(&["-", "tid"], input).unwrap();

        assert_eq!(samples[0].key, ThreadKey::new(0, 6));
        assert_eq!(samples[1].key, ThreadKey::new(0, 8));

        let samples = parse_all(&["pid"], "5\n  a\n  1\n").unwrap();
        assert_eq!(samples[0].key, ThreadKey::new(5, 0));
    }

    #[test]
    fn each_sample_needs_its_own_header() {
        let input = "5 6\n  a\n  1\n\n  b\n  2\n";
        let samples = parse_all(&["pid", "tid"], input);

        // The second header line "b" has one token, not two.
        assert!(matches!(
            samples,
            Err(ConvertError::FieldCount {
                line: 5,
                expected: 2,
                actual: 1,
                ..
            })
        ));
    }

    #[test]
    fn field_count_mismatch() {
        let result = parse_all(&["pid", "tid"], "1 2 3\n  main\n  1\n");

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            ConvertError::FieldCount {
                line: 1,
                expected: 2,
                actual: 3,
                ..
            }
        ));
        assert!(err.to_string().contains("Expected 2 fields but got 3."));
        assert!(err.to_string().contains("1 2 3"));
    }

    #[test]
    fn invalid_pid_names_token() {
        let result = parse_all(&["pid", "tid"], "abc 2\n  main\n  1\n");

        let err = result.unwrap_err();
        assert!(matches!(
            &err,
            ConvertError::InvalidField { field: "pid", token, .. } if token == "abc"
        ));
        assert_eq!(err.to_string(), "line 1: \"abc\" is not a valid pid.");
    }

    #[test]
    fn out_of_range_tid_is_invalid() {
        let result = parse_all(&["pid", "tid"], "1 4294967296\n  main\n  1\n");

        assert!(matches!(
            result,
            Err(ConvertError::InvalidField { field: "tid", .. })
        ));
    }

    #[test]
    fn signed_ids_are_invalid() {
        let result = parse_all(&["pid"], "+5\n  main\n  1\n");

        assert!(matches!(
            result,
            Err(ConvertError::InvalidField { field: "pid", .. })
        ));
    }

    #[test]
    fn overflowing_count_is_invalid() {
        let result = parse_all(&[], "main\n99999999999999999999999\n");

        assert!(matches!(
            result,
            Err(ConvertError::InvalidCount { line: 2, .. })
        ));
    }

    #[test]
    fn numeric_first_frame_is_a_frame() {
        let samples = parse_all(&[], "12345\n  7\n").unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].frames, vec!["12345"]);
        assert_eq!(samples[0].count, 7);
    }

    #[test]
    fn header_then_count_gives_empty_stack() {
        let samples = parse_all(&["pid"], "3\n10\n").unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].key, ThreadKey::new(3, 0));
        assert!(samples[0].frames.is_empty());
        assert_eq!(samples[0].count, 10);
    }

    #[test]
    fn blank_line_drops_unterminated_sample() {
        let input = "  lost`frame\n\n  kept`frame\n  4\n";
        let samples = parse_all(&[], input).unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].frames, vec!["kept`frame"]);
        assert_eq!(samples[0].count, 4);
    }

    #[test]
    fn trailing_partial_sample_is_ignored() {
        let samples = parse_all(&[], "  a\n  1\n\n  b\n").unwrap();

        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn unrecognized_fields_are_ignored() {
        let samples = parse_all(&["cpu", "tid", "execname"], "3 99 myapp\n  main\n  1\n").unwrap();

        assert_eq!(samples[0].key, ThreadKey::new(0, 99));
    }

    #[test]
    fn field_from_name() {
        assert_eq!(Field::from("pid"), Field::Pid);
        assert_eq!(Field::from("tid"), Field::Tid);
        assert_eq!(Field::from("-"), Field::Ignored("-".to_string()));
    }

    #[test]
    fn callback_error_still_resets() {
        let mut parser = FrameStreamParser::new(Vec::new());
        parser.push_line("a", |_| Ok(())).unwrap();
        let result = parser.push_line("1", |_| Err(ConvertError::PassthroughNeedsOut));
        assert!(result.is_err());

        let mut depth = None;
        parser.push_line("b", |_| Ok(())).unwrap();
        parser
            .push_line("2", |sample| {
                depth = Some(sample.depth());
                Ok(())
            })
            .unwrap();
        assert_eq!(depth, Some(1));
        assert_eq!(parser.line_num(), 4);
    }
}
