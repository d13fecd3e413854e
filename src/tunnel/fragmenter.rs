//! Outbound write fragmentation
//!
//! Every byte that crosses the tunnel does so in fragments no larger than
//! the split threshold, so a single large write can neither exceed the
//! peer's content limit nor monopolize a poll response.

use super::{Completion, CompletionAggregator};
use bytes::Bytes;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Splits outbound buffers into bounded fragments
#[derive(Debug)]
pub struct WriteFragmenter {
    threshold: AtomicUsize,
}

impl WriteFragmenter {
    pub fn new(threshold: NonZeroUsize) -> Self {
        WriteFragmenter {
            threshold: AtomicUsize::new(threshold.get()),
        }
    }

    pub fn split_threshold(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.threshold.load(Ordering::Acquire)).unwrap_or(NonZeroUsize::MIN)
    }

    /// Change the fragment size; buffers already being flushed keep the old one
    pub fn set_split_threshold(&self, threshold: NonZeroUsize) {
        self.threshold.store(threshold.get(), Ordering::Release);
    }

    /// Drain `buffer` through `write` in threshold-sized fragments
    ///
    /// Fragments are passed to `write` in order. The returned completion
    /// succeeds once every fragment's completion has, and otherwise fails
    /// with the first fragment failure. An empty buffer succeeds at once.
    pub fn flush<F>(&self, buffer: &mut Bytes, mut write: F) -> Completion
    where
        F: FnMut(Bytes) -> Completion,
    {
        let threshold = self.split_threshold().get();
        let aggregator = CompletionAggregator::new(Completion::new());

        while !buffer.is_empty() {
            let fragment = buffer.split_to(buffer.len().min(threshold));
            aggregator.add(&write(fragment));
        }

        aggregator.finish()
    }
}
