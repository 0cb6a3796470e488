use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::value::Value;

/// Named lists accumulated from stream messages since the last tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Epoch(BTreeMap<String, Vec<Value>>);

impl Epoch {
    pub fn push(&mut self, key: &str, value: Value) {
        self.0.entry(key.to_string()).or_default().push(value);
    }

    pub fn series(&self, key: &str) -> Option<&[Value]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    pub fn series_value(&self, key: &str) -> Value {
        Value::List(self.0.get(key).cloned().unwrap_or_default())
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.values().map(|v| v.len()).sum()
    }
}

/// Frozen view handed to reducers at a tick boundary: the epoch just
/// captured plus the one before it.
#[derive(Debug, Clone, Default)]
pub struct EpochView {
    pub current: Epoch,
    pub previous: Option<Epoch>,
}

/// Two-slot ring buffer. Message appends go into the live slot; at each
/// tick `flip` freezes it and opens a fresh one. The lock is held only
/// across the append or the flip, never across I/O. At most two
/// consecutive epochs are retained so a reducer can reference the
/// previous one.
#[derive(Debug, Default)]
pub struct EpochBuffer {
    inner: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    live: Epoch,
    previous: Option<Epoch>,
}

impl EpochBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, key: &str, value: Value) {
        let mut slots = self.inner.lock().unwrap();
        slots.live.push(key, value);
    }

    pub fn apply<F: FnOnce(&mut Epoch)>(&self, f: F) {
        let mut slots = self.inner.lock().unwrap();
        f(&mut slots.live);
    }

    /// Freeze the live epoch for reduction and open a new one.
    pub fn flip(&self) -> EpochView {
        let mut slots = self.inner.lock().unwrap();
        let current = std::mem::take(&mut slots.live);
        let previous = slots.previous.replace(current.clone());
        EpochView { current, previous }
    }

    pub fn live_len(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flip_freezes_and_clears() {
        let buffer = EpochBuffer::new();
        buffer.append("bids", Value::Float(10.0));
        buffer.append("bids", Value::Float(12.0));
        buffer.append("asks", Value::Float(11.0));

        let view = buffer.flip();
        assert_eq!(view.current.series("bids").unwrap().len(), 2);
        assert_eq!(view.current.series("asks").unwrap().len(), 1);
        assert!(view.previous.is_none());

        // buffer is empty immediately after the flip
        assert_eq!(buffer.live_len(), 0);
    }

    #[test]
    fn retains_exactly_one_previous_epoch() {
        let buffer = EpochBuffer::new();
        buffer.append("n", Value::Int(1));
        buffer.flip();

        buffer.append("n", Value::Int(2));
        let view = buffer.flip();
        assert_eq!(view.current.series("n").unwrap(), &[Value::Int(2)]);
        assert_eq!(
            view.previous.unwrap().series("n").unwrap(),
            &[Value::Int(1)]
        );

        buffer.append("n", Value::Int(3));
        let view = buffer.flip();
        // the epoch holding 1 has been dropped
        assert_eq!(
            view.previous.unwrap().series("n").unwrap(),
            &[Value::Int(2)]
        );
    }

    #[test]
    fn empty_flip_yields_empty_epoch() {
        let buffer = EpochBuffer::new();
        let view = buffer.flip();
        assert!(view.current.is_empty());
    }
}
