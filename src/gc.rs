use std::collections::HashSet;

use crate::objects::object::{Handle, HeapObject};
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_table::TableKey;
use crate::objects::object_upvalue::UpvalueLocation;
use crate::table::Table;
use crate::thread::Thread;
use crate::value::Value;

pub struct GarbageCollector {
    white_set: HashSet<Handle>,
    gray_set: HashSet<Handle>,
    black_set: HashSet<Handle>,
    stats: GCStats,
}

/// Aggregated GC statistics (does not include currently-live total bytes; VM tracks that).
#[derive(Default, Debug, Clone)]
pub struct GCStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GCStats {
    fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with gc_debug feature)
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => { } }
pub(crate) use gc_trace;

impl GarbageCollector {
    pub fn new() -> GarbageCollector {
        GarbageCollector {
            white_set: HashSet::new(),
            gray_set: HashSet::new(),
            black_set: HashSet::new(),
            stats: GCStats::default(),
        }
    }

    // Initialize the collector with all objects in white set
    pub fn prepare_collection(&mut self, manager: &ObjectManager) {
        self.reset();
        for handle in manager.iter_handles() {
            self.white_set.insert(handle);
        }
    }

    // Mark a single object as gray (moves from white to gray set)
    pub fn mark_handle(&mut self, handle: Handle) {
        if self.black_set.contains(&handle) {
            return;
        }
        if self.white_set.remove(&handle) {
            self.gray_set.insert(handle);
            gc_trace!("mark_handle enqueue gray slot={}", handle.index());
        }
    }

    // Mark a value (if it refers to a heap object)
    pub fn mark_value(&mut self, value: &Value) {
        if let Some(handle) = value.handle() {
            self.mark_handle(handle);
        }
    }

    // Process gray objects until none remain
    pub fn trace_references(&mut self, manager: &ObjectManager) {
        while !self.gray_set.is_empty() {
            let handle = *self.gray_set.iter().next().expect("gray set is non-empty");
            self.gray_set.remove(&handle);
            self.black_set.insert(handle);
            gc_trace!("trace gray -> black slot={}", handle.index());
            self.blacken_object(handle, manager);
        }
    }

    // Mark all references held by an object
    fn blacken_object(&mut self, handle: Handle, manager: &ObjectManager) {
        match manager.get(handle) {
            HeapObject::Table(table) => {
                for value in &table.array {
                    self.mark_value(value);
                }
                for (key, value) in &table.map {
                    match key {
                        TableKey::Str(h) | TableKey::Obj(h) => self.mark_handle(*h),
                        _ => {}
                    }
                    self.mark_value(value);
                }
                if let Some(meta) = table.metatable {
                    self.mark_handle(meta);
                }
            }
            HeapObject::Closure(closure) => {
                for upvalue in &closure.upvalues {
                    self.mark_handle(*upvalue);
                }
            }
            HeapObject::Upvalue(upvalue) => {
                if let UpvalueLocation::Closed(value) = &upvalue.location {
                    self.mark_value(value);
                }
            }
            HeapObject::NativeFunction(native) => {
                for value in &native.captured {
                    self.mark_value(value);
                }
            }
            HeapObject::Userdata(userdata) => {
                if let Some(meta) = userdata.metatable {
                    self.mark_handle(meta);
                }
            }
            HeapObject::String(_) => {}
        }
    }

    // Sweep phase - frees everything still white, returning bytes reclaimed
    pub fn sweep(&mut self, manager: &mut ObjectManager) -> usize {
        let mut freed_bytes = 0;
        for &handle in self.white_set.iter() {
            freed_bytes += manager.free(handle);
        }
        self.white_set.clear();
        gc_trace!("sweep freed_bytes={}", freed_bytes);
        freed_bytes
    }

    // Reset collector state
    pub fn reset(&mut self) {
        self.white_set.clear();
        self.gray_set.clear();
        self.black_set.clear();
    }

    // Mark roots provided by the VM: every thread's live stack window and
    // open upvalues, plus the global and intern tables.
    pub fn mark_roots(&mut self, threads: &[Thread], globals: &Table, intern_strings: &Table) {
        for thread in threads {
            let horizon = thread.live_top().min(thread.stack.len());
            for value in &thread.stack[0..horizon] {
                self.mark_value(value);
            }
            for &(_, upvalue) in &thread.open_upvalues {
                self.mark_handle(upvalue);
            }
        }

        for (_, value) in globals.iter() {
            self.mark_value(value);
        }
        for (_, value) in intern_strings.iter() {
            self.mark_value(value);
        }
    }

    /// Barrier hook invoked before a reference value is stored into an
    /// existing container. A no-op for this stop-the-world collector; the
    /// call sites are the contract an incremental collector would rely on.
    #[inline(always)]
    pub fn write_barrier(&mut self, _container: Handle, _value: &Value) {}

    /// Record a completed GC cycle (invoked by VM which knows bytes before/after & threshold)
    pub fn record_cycle(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.stats.record(before, freed, after, next_trigger);
        gc_trace!(
            "cycle summary cycles={} freed={} before={} after={} next_trigger={}",
            self.stats.cycles,
            freed,
            before,
            after,
            next_trigger
        );
    }

    pub fn stats(&self) -> &GCStats {
        &self.stats
    }
}

impl Default for GarbageCollector {
    fn default() -> Self {
        GarbageCollector::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_upvalue::UpvalueLocation;

    fn collect(
        gc: &mut GarbageCollector,
        manager: &mut ObjectManager,
        threads: &[Thread],
        globals: &Table,
        interns: &Table,
    ) -> usize {
        gc.prepare_collection(manager);
        gc.mark_roots(threads, globals, interns);
        gc.trace_references(manager);
        gc.sweep(manager)
    }

    #[test]
    fn gc_collects_unreachable_objects() {
        let mut manager = ObjectManager::new();
        // Roots: only keep first string
        let (keep, _) = manager.alloc_string("keep");
        let (_drop1, _) = manager.alloc_string("drop1");
        let (_drop2, _) = manager.alloc_string("drop2");
        let (_drop3, _) = manager.alloc_string("drop3");

        let mut thread = Thread::new();
        thread.push(Value::String(keep)).unwrap();

        let mut gc = GarbageCollector::new();
        let globals = Table::new();
        let interns = Table::new();
        let freed = collect(&mut gc, &mut manager, &[thread], &globals, &interns);
        assert!(freed > 0, "Expected some bytes to be freed");
        let remaining = manager.live_count();
        assert_eq!(remaining, 1, "Only the rooted object should remain (got {remaining})");
    }

    #[test]
    fn gc_preserves_reachable_closure_and_upvalue() {
        let mut manager = ObjectManager::new();
        let (captured, _) = manager.alloc_string("captured");
        let (upvalue, _) =
            manager.alloc_upvalue(UpvalueLocation::Closed(Value::String(captured)));
        let (closure, _) = manager.alloc_closure(0, vec![upvalue]);
        let (_unreachable, _) = manager.alloc_string("unreachable");

        let mut thread = Thread::new();
        thread.push(Value::Function(closure)).unwrap();

        let mut gc = GarbageCollector::new();
        let globals = Table::new();
        let interns = Table::new();
        collect(&mut gc, &mut manager, &[thread], &globals, &interns);
        assert_eq!(
            manager.live_count(),
            3,
            "Closure, upvalue and captured string should remain"
        );
    }

    #[test]
    fn gc_marks_through_table_keys_and_values() {
        let mut manager = ObjectManager::new();
        let (key, _) = manager.alloc_string("key");
        let (value, _) = manager.alloc_string("value");
        let (meta, _) = manager.alloc_table();
        let (table, _) = manager.alloc_table();
        {
            let t = manager.get_mut(table).as_table_mut();
            t.set(TableKey::Str(key), Value::String(value));
            t.metatable = Some(meta);
        }

        let mut thread = Thread::new();
        thread.push(Value::Table(table)).unwrap();

        let mut gc = GarbageCollector::new();
        let globals = Table::new();
        let interns = Table::new();
        collect(&mut gc, &mut manager, &[thread], &globals, &interns);
        assert_eq!(manager.live_count(), 4);
    }

    #[test]
    fn gc_roots_open_upvalues() {
        let mut manager = ObjectManager::new();
        let (upvalue, _) = manager.alloc_upvalue(UpvalueLocation::Open { thread: 0, slot: 0 });
        let mut thread = Thread::new();
        thread.open_upvalues.push((0, upvalue));

        let mut gc = GarbageCollector::new();
        let globals = Table::new();
        let interns = Table::new();
        collect(&mut gc, &mut manager, &[thread], &globals, &interns);
        assert_eq!(manager.live_count(), 1);
    }

    #[test]
    fn gc_stats_record_cycle() {
        let mut gc = GarbageCollector::new();
        assert_eq!(gc.stats().cycles, 0);
        gc.record_cycle(1000, 400, 600, 1200);
        assert_eq!(gc.stats().cycles, 1);
        assert_eq!(gc.stats().last_before_bytes, 1000);
        assert_eq!(gc.stats().last_freed_bytes, 400);
        assert_eq!(gc.stats().last_after_bytes, 600);
        assert_eq!(gc.stats().last_next_trigger_bytes, 1200);
        assert_eq!(gc.stats().total_freed_bytes, 400);
    }
}
