//! A thin capability wrapper letting `input_fn` forward hashes into
//! multiple sinks (an IBF bin, a HyperLogLog sketch, a deduping set) without
//! a virtual dispatch hierarchy.

use crate::sketch::Hyperloglog;

/// Where an [`InsertIterator`] forwards the values it receives.
enum Sink<'a> {
    /// Feeds a HyperLogLog sketch and a running element count.
    SketchAndCount {
        sketch: &'a mut Hyperloglog,
        count: &'a mut usize,
    },
    /// Collects values into an owned vector (used for the "fullest bin"
    /// local materialisation during build).
    Collect(&'a mut Vec<u64>),
}

/// A write-only capability: `it.push(hash)` forwards `hash` to whichever
/// sink this iterator was constructed over. Mirrors the reference
/// implementation's `insert_iterator`, which `input_fn` receives as its
/// second argument.
pub struct InsertIterator<'a> {
    sink: Sink<'a>,
}

impl<'a> InsertIterator<'a> {
    /// Builds an iterator that feeds a sketch and increments a count.
    pub fn for_sketch(sketch: &'a mut Hyperloglog, count: &'a mut usize) -> Self {
        Self {
            sink: Sink::SketchAndCount { sketch, count },
        }
    }

    /// Builds an iterator that collects values into `buffer`.
    pub fn for_collection(buffer: &'a mut Vec<u64>) -> Self {
        Self {
            sink: Sink::Collect(buffer),
        }
    }

    /// Forwards one hash value to the sink.
    pub fn push(&mut self, value: u64) {
        match &mut self.sink {
            Sink::SketchAndCount { sketch, count } => {
                sketch.add(value);
                **count += 1;
            }
            Sink::Collect(buffer) => buffer.push(value),
        }
    }
}
