//! Mark-sweep collection entry point.
//!
//! [`crate::heap::Heap::collect`] does the actual marking and sweeping; this
//! module is the place a caller (the VM's dispatch loop, or an embedder
//! forcing a collection) triggers it and gets the result logged.

use crate::heap::{GcStats, Heap};
use crate::value::Value;

/// Runs a full collection over `heap`, rooted at whatever `roots` yields.
/// Emits a `tracing` debug event with the before/after counts so an embedder
/// with logging enabled can watch collection pressure over a run.
pub fn run_gc<I: IntoIterator<Item = Value>>(heap: &mut Heap, roots: I) -> GcStats {
    let stats = heap.collect(roots);
    tracing::debug!(
        marked = stats.marked,
        swept = stats.swept,
        recycled = stats.recycled,
        "gc sweep complete"
    );
    stats
}

/// Runs a collection only if [`Heap::should_sweep`] says allocation pressure
/// warrants it. Returns `None` when no collection ran.
pub fn maybe_run_gc<I: IntoIterator<Item = Value>>(heap: &mut Heap, roots: I) -> Option<GcStats> {
    if heap.should_sweep() {
        Some(run_gc(heap, roots))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapObject;

    #[test]
    fn maybe_run_gc_skips_when_under_threshold() {
        let mut heap = Heap::new();
        heap.alloc_string("small");
        assert!(maybe_run_gc(&mut heap, std::iter::empty()).is_none());
    }

    #[test]
    fn maybe_run_gc_collects_past_threshold() {
        let mut heap = Heap::new();
        for i in 0..3000 {
            heap.alloc_string(format!("s{i}"));
        }
        let stats = maybe_run_gc(&mut heap, std::iter::empty());
        assert!(stats.is_some());
        assert!(stats.unwrap().swept > 0);
    }

    #[test]
    fn run_gc_respects_explicit_roots_over_pool_contents() {
        let mut heap = Heap::new();
        let kept = heap.alloc_string("kept");
        heap.alloc_string("dropped");
        run_gc(&mut heap, [Value::Heap(kept)]);
        assert!(matches!(heap.get(kept), Some(HeapObject::String(_))));
    }
}
