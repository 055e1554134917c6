//! Protected-slab managed heap
//!
//! Heap entries are kept alive by explicit protect counts (the roots) and
//! by reachability from protected sequences. Collection is mark/sweep;
//! swept entries that carried a weak watcher are reported back to the
//! caller so notifications can be delivered outside the sweep.

use super::value::{CallableHandle, HeapRef, Value};
use rustc_hash::{FxHashMap, FxHashSet};

/// An object stored in the managed heap
pub enum HeapObject {
    /// UTF-8 string
    Str(String),
    /// Ordered sequence of values
    Seq(Vec<Value>),
    /// Raw byte buffer
    Bytes(Vec<u8>),
    /// Host-provided callable
    Callable(CallableHandle),
}

struct Entry {
    object: HeapObject,
    protect: u32,
    watched: bool,
    mark: bool,
}

/// Heap occupancy counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live entries
    pub live: usize,
    /// Number of entries with a nonzero protect count
    pub protected: usize,
}

/// The managed heap
#[derive(Default)]
pub struct Heap {
    entries: FxHashMap<u32, Entry>,
    next_id: u32,
}

impl Heap {
    /// Create an empty heap
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, object: HeapObject) -> HeapRef {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        self.entries.insert(
            id,
            Entry {
                object,
                protect: 1,
                watched: false,
                mark: false,
            },
        );
        HeapRef(id)
    }

    /// Allocate a string; the new entry starts with one protection
    pub fn alloc_str(&mut self, s: impl Into<String>) -> HeapRef {
        self.insert(HeapObject::Str(s.into()))
    }

    /// Allocate a sequence; the new entry starts with one protection
    pub fn alloc_seq(&mut self, values: Vec<Value>) -> HeapRef {
        self.insert(HeapObject::Seq(values))
    }

    /// Allocate a byte buffer; the new entry starts with one protection
    pub fn alloc_bytes(&mut self, bytes: Vec<u8>) -> HeapRef {
        self.insert(HeapObject::Bytes(bytes))
    }

    /// Allocate a callable; the new entry starts with one protection
    pub fn alloc_callable(&mut self, callable: CallableHandle) -> HeapRef {
        self.insert(HeapObject::Callable(callable))
    }

    /// Whether the handle refers to a live entry
    pub fn is_live(&self, r: HeapRef) -> bool {
        self.entries.contains_key(&r.0)
    }

    /// Add one protection to an entry
    pub fn protect(&mut self, r: HeapRef) {
        if let Some(entry) = self.entries.get_mut(&r.0) {
            entry.protect += 1;
        }
    }

    /// Remove one protection from an entry
    ///
    /// The entry is not freed here; it becomes eligible at the next
    /// collection unless still reachable.
    pub fn unprotect(&mut self, r: HeapRef) {
        if let Some(entry) = self.entries.get_mut(&r.0) {
            entry.protect = entry.protect.saturating_sub(1);
        }
    }

    /// Mark an entry as weakly watched
    pub fn watch(&mut self, r: HeapRef) {
        if let Some(entry) = self.entries.get_mut(&r.0) {
            entry.watched = true;
        }
    }

    /// Clear the weak watcher flag
    pub fn unwatch(&mut self, r: HeapRef) {
        if let Some(entry) = self.entries.get_mut(&r.0) {
            entry.watched = false;
        }
    }

    /// Read a string entry
    pub fn str_value(&self, r: HeapRef) -> Option<&str> {
        match self.entries.get(&r.0)?.object {
            HeapObject::Str(ref s) => Some(s),
            _ => None,
        }
    }

    /// Read a sequence entry
    pub fn seq(&self, r: HeapRef) -> Option<&[Value]> {
        match self.entries.get(&r.0)?.object {
            HeapObject::Seq(ref v) => Some(v),
            _ => None,
        }
    }

    /// Mutate a sequence entry
    pub fn seq_mut(&mut self, r: HeapRef) -> Option<&mut Vec<Value>> {
        match self.entries.get_mut(&r.0)?.object {
            HeapObject::Seq(ref mut v) => Some(v),
            _ => None,
        }
    }

    /// Read a byte-buffer entry
    pub fn bytes(&self, r: HeapRef) -> Option<&[u8]> {
        match self.entries.get(&r.0)?.object {
            HeapObject::Bytes(ref b) => Some(b),
            _ => None,
        }
    }

    /// Mutate a byte-buffer entry
    pub fn bytes_mut(&mut self, r: HeapRef) -> Option<&mut Vec<u8>> {
        match self.entries.get_mut(&r.0)?.object {
            HeapObject::Bytes(ref mut b) => Some(b),
            _ => None,
        }
    }

    /// Clone out a callable handle
    pub fn callable(&self, r: HeapRef) -> Option<CallableHandle> {
        match self.entries.get(&r.0)?.object {
            HeapObject::Callable(ref c) => Some(c.clone()),
            _ => None,
        }
    }

    /// Occupancy counters
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            live: self.entries.len(),
            protected: self.entries.values().filter(|e| e.protect > 0).count(),
        }
    }

    /// Collect unreachable entries
    ///
    /// Marks from every protected entry, traversing sequence children,
    /// then sweeps the rest. Returns the handles of swept entries that
    /// were weakly watched, in no particular order.
    pub fn collect(&mut self) -> Vec<HeapRef> {
        for entry in self.entries.values_mut() {
            entry.mark = false;
        }

        let roots: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.protect > 0)
            .map(|(id, _)| *id)
            .collect();

        let mut pending = roots;
        let mut visited = FxHashSet::default();
        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let children: Vec<u32> = match self.entries.get_mut(&id) {
                Some(entry) => {
                    entry.mark = true;
                    match &entry.object {
                        HeapObject::Seq(values) => values
                            .iter()
                            .filter_map(|v| v.heap_ref())
                            .map(|r| r.0)
                            .collect(),
                        _ => Vec::new(),
                    }
                }
                None => Vec::new(),
            };
            pending.extend(children);
        }

        let dead: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.mark)
            .map(|(id, _)| *id)
            .collect();

        let mut notified = Vec::new();
        for id in dead {
            if let Some(entry) = self.entries.remove(&id) {
                if entry.watched {
                    notified.push(HeapRef(id));
                }
            }
        }
        notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_collect_unprotected() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("kept");
        let b = heap.alloc_str("dropped");
        heap.unprotect(b);

        heap.collect();

        assert!(heap.is_live(a));
        assert!(!heap.is_live(b));
    }

    #[test]
    fn test_collect_traverses_sequences() {
        let mut heap = Heap::new();
        let inner = heap.alloc_str("inner");
        let seq = heap.alloc_seq(vec![Value::Str(inner)]);
        // The sequence root is the only protection left on inner.
        heap.unprotect(inner);

        heap.collect();
        assert!(heap.is_live(inner));

        heap.unprotect(seq);
        heap.collect();
        assert!(!heap.is_live(inner));
        assert!(!heap.is_live(seq));
    }

    #[test]
    fn test_collect_reports_watched() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("watched");
        heap.watch(a);
        heap.unprotect(a);

        let notified = heap.collect();
        assert_eq!(notified, vec![a]);

        // A second collection has nothing left to report.
        assert!(heap.collect().is_empty());
    }

    #[test]
    fn test_callable_clone_out() {
        let mut heap = Heap::new();
        let c = heap.alloc_callable(Arc::new(|_, _| Ok(Value::Number(3.0))));
        assert!(heap.callable(c).is_some());
        assert!(heap.str_value(c).is_none());
    }

    #[test]
    fn test_protect_counts_nest() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("x");
        heap.protect(a);
        heap.unprotect(a);
        heap.collect();
        assert!(heap.is_live(a));
        heap.unprotect(a);
        heap.collect();
        assert!(!heap.is_live(a));
    }
}
