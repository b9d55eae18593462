use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::OutputConfig;
use crate::types::Sample;

/// Thread-safe, bounded, append-only sample list.
///
/// Producers push observations; a single writer drains them periodically.
/// When the bound is reached the oldest samples are dropped.
#[derive(Clone)]
pub struct SampleList {
    inner: Arc<Mutex<SampleListInner>>,
}

struct SampleListInner {
    data: VecDeque<Sample>,
    capacity: usize,
    dropped: u64,
}

impl SampleList {
    pub fn new(config: &OutputConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SampleListInner {
                data: VecDeque::new(),
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    pub fn push(&self, sample: Sample) {
        let mut inner = self.inner.lock();
        if inner.data.len() >= inner.capacity {
            inner.data.pop_front();
            inner.dropped += 1;
        }
        inner.data.push_back(sample);
    }

    pub fn extend(&self, samples: impl IntoIterator<Item = Sample>) {
        for sample in samples {
            self.push(sample);
        }
    }

    /// Take every buffered sample, oldest first.
    pub fn drain(&self) -> Vec<Sample> {
        let mut inner = self.inner.lock();
        inner.data.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().data.is_empty()
    }

    /// Samples discarded because the list was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SampleValue, Tags};

    fn sample(v: i64) -> Sample {
        Sample::new("snmp_test", SampleValue::Int(v), Tags::new())
    }

    #[test]
    fn drain_returns_in_order() {
        let list = SampleList::with_capacity(10);
        list.extend((0..3).map(sample));
        let drained: Vec<_> = list.drain().into_iter().map(|s| s.value).collect();
        assert_eq!(drained, vec![SampleValue::Int(0), SampleValue::Int(1), SampleValue::Int(2)]);
        assert!(list.is_empty());
    }

    #[test]
    fn overflow_drops_oldest() {
        let list = SampleList::with_capacity(2);
        list.extend((0..5).map(sample));
        assert_eq!(list.len(), 2);
        assert_eq!(list.dropped(), 3);
        let drained: Vec<_> = list.drain().into_iter().map(|s| s.value).collect();
        assert_eq!(drained, vec![SampleValue::Int(3), SampleValue::Int(4)]);
    }
}
