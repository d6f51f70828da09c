//! Rebuild Begin/End interval events from sampled stacks.
//!
//! Samples carry only a snapshot of the call stack. For each thread the
//! reconstructor remembers the last stack it emitted and, on every new
//! sample, closes the frames that are no longer on the stack and opens the
//! new ones, starting from the first position where the two stacks differ.
//!
//! Time is synthetic: a single clock shared by all threads advances by each
//! sample's count before that sample's events are emitted.

use crate::stream::{Sample, ThreadKey};
use log::debug;
use spall_trace::{EventSink, WriteResult};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Per-run reconstruction state.
#[derive(Debug, Default)]
pub struct StackReconstructor {
    /// Synthetic clock, in samples.
    now: u64,
    /// Last emitted stack per thread, outermost frame first.
    threads: BTreeMap<ThreadKey, Vec<String>>,
    samples: u64,
    begins: u64,
    ends: u64,
}

impl StackReconstructor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by the sample's count and emit the events that turn
    /// the thread's previous stack into the sampled one.
    ///
    /// Frames are compared by position only: everything from the first
    /// differing position onward is closed, innermost first, and the rest of
    /// the sampled stack is opened, outermost first.
    pub fn apply<S: EventSink>(&mut self, sample: &Sample<'_>, sink: &mut S) -> WriteResult<()> {
        self.now = self.now.saturating_add(sample.count);
        self.samples += 1;

        let key = sample.key;
        let when = self.now as f64;

        let stack = match self.threads.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!("new timeline for pid {} tid {}", key.pid, key.tid);
                entry.insert(Vec::with_capacity(sample.depth()))
            }
        };

        let common = stack
            .iter()
            .zip(sample.outermost_first())
            .take_while(|(prev, curr)| prev.as_str() == *curr)
            .count();

        // Pop only after the sink accepted the end, so the remembered stack
        // always matches what was written.
        while stack.len() > common {
            sink.end(key.pid, key.tid, when)?;
            stack.pop();
            self.ends += 1;
        }

        for frame in sample.outermost_first().skip(common) {
            sink.begin(frame, key.pid, key.tid, when)?;
            stack.push(frame.to_string());
            self.begins += 1;
        }

        Ok(())
    }

    /// Close every frame still open on any thread at the current clock.
    pub fn finish<S: EventSink>(&mut self, sink: &mut S) -> WriteResult<()> {
        let when = self.now as f64;
        for (key, stack) in self.threads.iter_mut() {
            while !stack.is_empty() {
                sink.end(key.pid, key.tid, when)?;
                stack.pop();
                self.ends += 1;
            }
        }
        Ok(())
    }

    /// Current value of the synthetic clock.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Frames currently open on `key`, outermost first.
    pub fn open_frames(&self, key: ThreadKey) -> &[String] {
        self.threads.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn begins(&self) -> u64 {
        self.begins
    }

    pub fn ends(&self) -> u64 {
        self.ends
    }
}
