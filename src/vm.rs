use std::rc::Rc;

use phf::phf_map;
use strum_macros::Display;

use crate::call_frame::{CallInfo, FrameKind, RESULTS_ALL};
use crate::chunk::{Constant, OpCode, Prototype};
use crate::constants::{INITIAL_GC_THRESHOLD, MAX_META_CHAIN, MAX_NATIVE_NESTING, MIN_NATIVE_HEADROOM};
use crate::error::{ErrorKind, RuntimeError};
use crate::gc::GarbageCollector;
use crate::objects::object::{Handle, HeapObject};
use crate::objects::object_manager::ObjectManager;
use crate::objects::object_native_function::{NativeObject, NativeReturn};
use crate::objects::object_table::TableKey;
use crate::objects::object_upvalue::UpvalueLocation;
use crate::std_mod::{basics, coroutine, time::ClockTime};
use crate::table::Table;
use crate::thread::{Thread, ThreadStatus};
use crate::value::{format_value, Value};

/// Metamethod events the core dispatches on. The operation set is closed;
/// handlers are looked up by pre-interned key on a value's metatable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum MetaEvent {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Concat,
    Lt,
    Le,
    Index,
    NewIndex,
    Call,
}

const META_EVENT_COUNT: usize = 12;

impl MetaEvent {
    const ALL: [MetaEvent; META_EVENT_COUNT] = [
        MetaEvent::Add,
        MetaEvent::Sub,
        MetaEvent::Mul,
        MetaEvent::Div,
        MetaEvent::Mod,
        MetaEvent::Neg,
        MetaEvent::Concat,
        MetaEvent::Lt,
        MetaEvent::Le,
        MetaEvent::Index,
        MetaEvent::NewIndex,
        MetaEvent::Call,
    ];

    /// The metatable key a handler is stored under.
    pub fn key(self) -> &'static str {
        match self {
            MetaEvent::Add => "__add",
            MetaEvent::Sub => "__sub",
            MetaEvent::Mul => "__mul",
            MetaEvent::Div => "__div",
            MetaEvent::Mod => "__mod",
            MetaEvent::Neg => "__neg",
            MetaEvent::Concat => "__concat",
            MetaEvent::Lt => "__lt",
            MetaEvent::Le => "__le",
            MetaEvent::Index => "__index",
            MetaEvent::NewIndex => "__newindex",
            MetaEvent::Call => "__call",
        }
    }
}

static META_EVENTS: phf::Map<&'static str, MetaEvent> = phf_map! {
    "add" => MetaEvent::Add,
    "sub" => MetaEvent::Sub,
    "mul" => MetaEvent::Mul,
    "div" => MetaEvent::Div,
    "mod" => MetaEvent::Mod,
    "neg" => MetaEvent::Neg,
    "concat" => MetaEvent::Concat,
    "lt" => MetaEvent::Lt,
    "le" => MetaEvent::Le,
    "index" => MetaEvent::Index,
    "newindex" => MetaEvent::NewIndex,
    "call" => MetaEvent::Call,
};

/// Host-facing lookup of a metamethod event by its plain name.
pub fn meta_event(name: &str) -> Option<MetaEvent> {
    META_EVENTS.get(name).copied()
}

/// What `resume` hands back to the resumer. Errors inside the coroutine
/// are returned here, never raised through the resumer's own unwind chain.
#[derive(Debug)]
pub enum ResumeOutcome {
    Yielded(Vec<Value>),
    Returned(Vec<Value>),
    Errored(RuntimeError),
}

/// Outcome of the pre-call sequence.
enum PreCall {
    /// Interpreted callee: a frame was pushed, the dispatch loop continues
    /// inside it.
    Resumed,
    /// Native callee: it already ran and its results are in place.
    Done,
    /// Native callee requested a coroutine suspension.
    Yielded(Vec<Value>),
}

/// Why the dispatch loop handed control back.
enum DispatchSignal {
    Returned(Vec<Value>),
    Yielded(Vec<Value>),
}

enum CalleeKind {
    Script { proto: usize },
    Native,
}

/// What a native function sees: bounds-checked access to its argument
/// window plus re-entry into the VM.
pub struct NativeCtx<'vm> {
    vm: &'vm mut Vm,
    thread: usize,
    base: usize,
    arg_count: usize,
}

impl<'vm> NativeCtx<'vm> {
    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    /// Argument `i`; reads as nil past the supplied count.
    pub fn arg(&self, i: usize) -> Value {
        if i < self.arg_count {
            self.vm.threads[self.thread].stack[self.base + i]
        } else {
            Value::Nil
        }
    }

    pub fn checked_arg(&self, i: usize) -> Option<Value> {
        if i < self.arg_count {
            Some(self.vm.threads[self.thread].stack[self.base + i])
        } else {
            None
        }
    }

    pub fn args(&self) -> Vec<Value> {
        (0..self.arg_count).map(|i| self.arg(i)).collect()
    }

    /// Captured value `i` of the running native closure; nil past the end.
    pub fn captured(&self, i: usize) -> Value {
        let th = &self.vm.threads[self.thread];
        if let Some(frame) = th.frames.last() {
            if let FrameKind::Native { native } = frame.kind {
                return self
                    .vm
                    .heap
                    .get(native)
                    .as_native()
                    .captured
                    .get(i)
                    .copied()
                    .unwrap_or(Value::Nil);
            }
        }
        Value::Nil
    }

    pub fn vm(&mut self) -> &mut Vm {
        self.vm
    }

    pub fn vm_ref(&self) -> &Vm {
        self.vm
    }
}

/// The virtual machine: shared heap, globals and intern pool, plus every
/// execution thread. All interpreter state lives here; there are no
/// process-wide globals.
pub struct Vm {
    threads: Vec<Thread>,
    current: usize,
    protos: Vec<Prototype>,
    pub(crate) heap: ObjectManager,
    intern_strings: Table,
    globals: Table,
    gc: GarbageCollector,
    bytes_allocated: usize,
    next_gc_bytes: usize,
    heap_limit: Option<usize>,
    /// Re-entrant dispatch depth: bumped whenever the VM is entered again
    /// from inside a native function or metamethod handler. Yields are only
    /// legal at the nesting their thread was resumed at.
    nesting: usize,
    meta_keys: Vec<Handle>,
    panic_hook: Option<Box<dyn Fn(&RuntimeError)>>,
}

impl Vm {
    pub fn new() -> Vm {
        let mut main = Thread::new();
        main.status = ThreadStatus::Running;
        main.started = true;
        let mut vm = Vm {
            threads: vec![main],
            current: 0,
            protos: Vec::new(),
            heap: ObjectManager::new(),
            intern_strings: Table::new(),
            globals: Table::new(),
            gc: GarbageCollector::new(),
            bytes_allocated: 0,
            next_gc_bytes: INITIAL_GC_THRESHOLD,
            heap_limit: None,
            nesting: 0,
            meta_keys: Vec::with_capacity(META_EVENT_COUNT),
            panic_hook: None,
        };
        // Intern every metamethod key up front so metatable lookups never
        // allocate mid-instruction.
        for event in MetaEvent::ALL {
            let key = event.key();
            let (handle, _) = vm.heap.alloc_string(key);
            vm.intern_strings.insert(key.to_string(), Value::String(handle));
            vm.meta_keys.push(handle);
        }
        vm.bytes_allocated += vm.heap.drain_pending_bytes();
        vm
    }

    /// Register the built-in natives under their global names.
    pub fn setup_standards(&mut self) -> Result<(), RuntimeError> {
        self.add_native("clock", Some(0), ClockTime::new())?;
        self.add_native("print", None, basics::Print)?;
        self.add_native("type", Some(1), basics::TypeOf)?;
        self.add_native("error", Some(1), basics::ErrorFn)?;
        self.add_native("assert", None, basics::Assert)?;
        self.add_native("coroutine_create", Some(1), coroutine::Create)?;
        self.add_native("coroutine_resume", None, coroutine::Resume)?;
        self.add_native("coroutine_yield", None, coroutine::Yield)?;
        self.add_native("coroutine_status", Some(1), coroutine::Status)?;
        Ok(())
    }

    // ---- Prototypes and closures ----

    /// Add a compiled prototype to the read-only registry.
    pub fn register_proto(&mut self, proto: Prototype) -> usize {
        self.protos.push(proto);
        self.protos.len() - 1
    }

    /// Instantiate a closure over a registered prototype that captures
    /// nothing. Closures with upvalues come from the `Closure` instruction.
    pub fn closure_from_proto(&mut self, proto: usize) -> Result<Value, RuntimeError> {
        if proto >= self.protos.len() {
            return Err(RuntimeError::new(ErrorKind::Type, "unknown prototype"));
        }
        if !self.protos[proto].upvalues.is_empty() {
            return Err(RuntimeError::new(
                ErrorKind::Type,
                "prototype captures upvalues and cannot be instantiated directly",
            ));
        }
        let (handle, _) = self.heap.alloc_closure(proto, Vec::new());
        let value = Value::Function(handle);
        // Root ordering: the closure must be reachable before the
        // allocation is tracked, because tracking may trigger a collection.
        self.threads[self.current].push(value)?;
        self.sync_pending_allocations()?;
        self.threads[self.current].pop();
        Ok(value)
    }

    /// Register a native function and bind it to a global name.
    pub fn add_native(
        &mut self,
        name: &str,
        arity: Option<u8>,
        native: impl NativeObject + 'static,
    ) -> Result<Value, RuntimeError> {
        let value = self.new_native(name, arity, Vec::new(), native)?;
        self.globals.insert(name.to_string(), value);
        Ok(value)
    }

    /// Build a native closure without binding it to a global. The captured
    /// values travel with the function object and are readable through
    /// `NativeCtx::captured`.
    pub fn new_native(
        &mut self,
        name: &str,
        arity: Option<u8>,
        captured: Vec<Value>,
        native: impl NativeObject + 'static,
    ) -> Result<Value, RuntimeError> {
        let (handle, _) = self
            .heap
            .alloc_native_function(name.to_string(), arity, captured, native);
        let value = Value::Function(handle);
        self.threads[self.current].push(value)?;
        self.sync_pending_allocations()?;
        self.threads[self.current].pop();
        Ok(value)
    }

    // ---- Globals, strings, tables ----

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.find(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    /// Intern a string, returning the shared value for its content.
    pub fn intern(&mut self, content: &str) -> Result<Value, RuntimeError> {
        if let Some(value) = self.intern_strings.find(content) {
            return Ok(value);
        }
        let (handle, _) = self.heap.alloc_string(content);
        let value = Value::String(handle);
        // Root ordering: the intern table roots the new string before the
        // allocation is tracked.
        self.intern_strings.insert(content.to_string(), value);
        self.sync_pending_allocations()?;
        Ok(value)
    }

    pub fn new_table(&mut self) -> Result<Value, RuntimeError> {
        let (handle, _) = self.heap.alloc_table();
        let value = Value::Table(handle);
        self.threads[self.current].push(value)?;
        self.sync_pending_allocations()?;
        self.threads[self.current].pop();
        Ok(value)
    }

    /// Wrap an opaque host value. Behavior comes from its metatable.
    pub fn new_userdata(
        &mut self,
        data: std::rc::Rc<dyn std::any::Any>,
    ) -> Result<Value, RuntimeError> {
        let (handle, _) = self.heap.alloc_userdata(data);
        let value = Value::Userdata(handle);
        self.threads[self.current].push(value)?;
        self.sync_pending_allocations()?;
        self.threads[self.current].pop();
        Ok(value)
    }

    /// Recover the host value wrapped by `new_userdata`.
    pub fn userdata(&self, value: Value) -> Option<Rc<dyn std::any::Any>> {
        match value {
            Value::Userdata(handle) => Some(Rc::clone(&self.heap.get(handle).as_userdata().data)),
            _ => None,
        }
    }

    /// Raw table store (no metamethods), with the write barrier applied.
    pub fn table_set(&mut self, table: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
        match table {
            Value::Table(handle) => {
                let key = TableKey::from_value(&key)?;
                self.gc.write_barrier(handle, &value);
                self.heap.get_mut(handle).as_table_mut().set(key, value);
                Ok(())
            }
            other => Err(RuntimeError::new(
                ErrorKind::Type,
                format!("attempt to index a {} value", other.type_name()),
            )),
        }
    }

    /// Raw table read (no metamethods).
    pub fn table_get(&self, table: Value, key: Value) -> Result<Value, RuntimeError> {
        match table {
            Value::Table(handle) => {
                let key = TableKey::from_value(&key)?;
                Ok(self.heap.get(handle).as_table().get(&key))
            }
            other => Err(RuntimeError::new(
                ErrorKind::Type,
                format!("attempt to index a {} value", other.type_name()),
            )),
        }
    }

    pub fn set_metatable(&mut self, target: Value, meta: Value) -> Result<(), RuntimeError> {
        let meta_handle = match meta {
            Value::Table(handle) => Some(handle),
            Value::Nil => None,
            other => {
                return Err(RuntimeError::new(
                    ErrorKind::Type,
                    format!("metatable must be a table, got {}", other.type_name()),
                ))
            }
        };
        match target {
            Value::Table(handle) => {
                if let Some(m) = meta_handle {
                    self.gc.write_barrier(handle, &Value::Table(m));
                }
                match self.heap.get_mut(handle) {
                    HeapObject::Table(table) => table.metatable = meta_handle,
                    _ => return Err(RuntimeError::assertion("table handle mismatch")),
                }
                Ok(())
            }
            Value::Userdata(handle) => {
                match self.heap.get_mut(handle) {
                    HeapObject::Userdata(userdata) => userdata.metatable = meta_handle,
                    _ => return Err(RuntimeError::assertion("userdata handle mismatch")),
                }
                Ok(())
            }
            other => Err(RuntimeError::new(
                ErrorKind::Type,
                format!("cannot set a metatable on a {} value", other.type_name()),
            )),
        }
    }

    pub fn display_value(&self, value: &Value) -> String {
        if let Value::Function(handle) = value {
            if let HeapObject::Closure(closure) = self.heap.get(*handle) {
                let name = &self.protos[closure.proto].name;
                if name.is_empty() {
                    return "<script>".to_string();
                }
                return format!("<fn {}>", name);
            }
        }
        format_value(value, &self.heap)
    }

    // ---- Threads and host stack accessors ----

    pub fn create_thread(&mut self, func: Value) -> Result<usize, RuntimeError> {
        if !matches!(func, Value::Function(_)) {
            return Err(RuntimeError::new(
                ErrorKind::Type,
                format!("can only create a thread from a function, got {}", func.type_name()),
            ));
        }
        let mut thread = Thread::new();
        thread.stack[0] = func;
        thread.top = 1;
        self.threads.push(thread);
        Ok(self.threads.len() - 1)
    }

    pub fn current_thread(&self) -> usize {
        self.current
    }

    pub fn thread_status(&self, thread: usize) -> Option<ThreadStatus> {
        self.threads.get(thread).map(|t| t.status)
    }

    pub fn stack_push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.threads[self.current].push(value)
    }

    pub fn stack_pop(&mut self) -> Option<Value> {
        self.threads[self.current].pop()
    }

    pub fn stack_get(&self, index: usize) -> Option<Value> {
        self.threads[self.current].get(index)
    }

    pub fn set_panic_hook(&mut self, hook: Box<dyn Fn(&RuntimeError)>) {
        self.panic_hook = Some(hook);
    }

    pub fn set_heap_limit(&mut self, limit: Option<usize>) {
        self.heap_limit = limit;
    }

    pub fn gc_stats(&self) -> &crate::gc::GCStats {
        self.gc.stats()
    }

    // ---- Allocation accounting and collection ----

    fn track_allocation(&mut self, bytes: usize) -> Result<(), RuntimeError> {
        self.bytes_allocated += bytes;
        if self.bytes_allocated > self.next_gc_bytes {
            self.collect_garbage();
        }
        if let Some(limit) = self.heap_limit {
            if self.bytes_allocated > limit {
                return Err(RuntimeError::new(ErrorKind::Allocation, "out of memory"));
            }
        }
        Ok(())
    }

    fn sync_pending_allocations(&mut self) -> Result<(), RuntimeError> {
        let bytes = self.heap.drain_pending_bytes();
        if bytes > 0 {
            self.track_allocation(bytes)?;
        }
        Ok(())
    }

    pub fn collect_garbage(&mut self) {
        let before = self.bytes_allocated;
        self.gc.prepare_collection(&self.heap);
        self.gc.mark_roots(&self.threads, &self.globals, &self.intern_strings);
        self.gc.trace_references(&self.heap);
        let freed = self.gc.sweep(&mut self.heap);
        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed);
        self.next_gc_bytes = (self.bytes_allocated * 2).max(INITIAL_GC_THRESHOLD);
        self.gc.record_cycle(before, freed, self.bytes_allocated, self.next_gc_bytes);

        #[cfg(feature = "gc_debug")]
        eprintln!(
            "[gc] cycle done: freed={} bytes before={}KB after={}KB next_trigger={}KB",
            freed,
            before / 1024,
            self.bytes_allocated / 1024,
            self.next_gc_bytes / 1024
        );
    }

    // Test-only helper: lower the GC threshold to force cycles under small workloads.
    #[cfg(test)]
    fn set_gc_threshold(&mut self, threshold: usize) {
        self.next_gc_bytes = threshold;
    }

    // ---- Host call entry points ----

    /// Call a function on the current thread, unprotected: an error
    /// propagates to the caller with the thread state left as it failed.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        if self.nesting >= MAX_NATIVE_NESTING {
            return Err(RuntimeError::new(
                ErrorKind::StackOverflow,
                "native call nesting too deep",
            ));
        }
        self.nesting += 1;
        let outcome = self.call_body(callee, args);
        self.nesting -= 1;
        outcome
    }

    fn call_body(&mut self, callee: Value, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let tid = self.current;
        let func_slot = self.threads[tid].top;
        {
            let th = &mut self.threads[tid];
            th.ensure_stack(func_slot + 1 + args.len())?;
            th.stack[func_slot] = callee;
            for (i, v) in args.iter().enumerate() {
                th.stack[func_slot + 1 + i] = *v;
            }
            th.top = func_slot + 1 + args.len();
        }
        match self.precall(func_slot, args.len(), RESULTS_ALL)? {
            PreCall::Done => {
                let th = &mut self.threads[tid];
                let results = th.stack[func_slot..th.top].to_vec();
                th.top = func_slot;
                Ok(results)
            }
            PreCall::Resumed => {
                let entry = self.threads[self.current].frames.len();
                match self.run_dispatch(entry)? {
                    DispatchSignal::Returned(values) => Ok(values),
                    DispatchSignal::Yielded(_) => {
                        Err(RuntimeError::assertion("yield escaped a call boundary"))
                    }
                }
            }
            PreCall::Yielded(_) => Err(RuntimeError::assertion("yield escaped a call boundary")),
        }
    }

    /// Call with a recovery checkpoint: frame depth and stack top are
    /// recorded first and restored if the callee raises, so a failed call
    /// leaves no trace. Assertion failures are re-propagated, never caught.
    pub fn protected_call(
        &mut self,
        callee: Value,
        args: &[Value],
    ) -> Result<Vec<Value>, RuntimeError> {
        let tid = self.current;
        let saved_frames = self.threads[tid].frames.len();
        let saved_top = self.threads[tid].top;
        match self.call(callee, args) {
            Ok(results) => Ok(results),
            Err(error) if error.is_fatal() => Err(error),
            Err(error) => {
                self.close_upvalues(tid, saved_top);
                let th = &mut self.threads[tid];
                th.frames.truncate(saved_frames);
                th.top = saved_top;
                Err(error)
            }
        }
    }

    /// Unprotected top-level entry: a main-thread error is reported to the
    /// host panic hook before it surfaces.
    pub fn run(&mut self, callee: Value, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        match self.call(callee, args) {
            Ok(results) => Ok(results),
            Err(error) => {
                if self.current == 0 {
                    self.threads[0].status = ThreadStatus::Errored;
                    if let Some(hook) = &self.panic_hook {
                        hook(&error);
                    }
                }
                Err(error)
            }
        }
    }

    // ---- Coroutines ----

    /// Drive a suspended thread until it yields, returns or errors.
    /// Misuse (dead or non-suspended target) is returned to the resumer,
    /// never raised into its unwind chain.
    pub fn resume(&mut self, thread: usize, args: &[Value]) -> ResumeOutcome {
        if self.nesting >= MAX_NATIVE_NESTING {
            return ResumeOutcome::Errored(RuntimeError::new(
                ErrorKind::StackOverflow,
                "native call nesting too deep",
            ));
        }
        if thread >= self.threads.len() {
            return ResumeOutcome::Errored(RuntimeError::new(ErrorKind::Coroutine, "no such thread"));
        }
        match self.threads[thread].status {
            ThreadStatus::Suspended => {}
            ThreadStatus::Dead | ThreadStatus::Errored => {
                return ResumeOutcome::Errored(RuntimeError::new(
                    ErrorKind::Coroutine,
                    "cannot resume dead coroutine",
                ))
            }
            ThreadStatus::Running | ThreadStatus::Normal => {
                return ResumeOutcome::Errored(RuntimeError::new(
                    ErrorKind::Coroutine,
                    "cannot resume non-suspended coroutine",
                ))
            }
        }

        let resumer = self.current;
        self.threads[resumer].status = ThreadStatus::Normal;
        self.threads[thread].status = ThreadStatus::Running;
        self.current = thread;
        self.nesting += 1;
        self.threads[thread].resume_nesting = self.nesting;

        let outcome = self.resume_body(thread, args);

        self.nesting -= 1;
        self.current = resumer;
        self.threads[resumer].status = ThreadStatus::Running;

        match outcome {
            Ok(DispatchSignal::Yielded(values)) => {
                self.threads[thread].status = ThreadStatus::Suspended;
                ResumeOutcome::Yielded(values)
            }
            Ok(DispatchSignal::Returned(values)) => {
                self.threads[thread].status = ThreadStatus::Dead;
                ResumeOutcome::Returned(values)
            }
            Err(error) => {
                self.threads[thread].status = ThreadStatus::Errored;
                ResumeOutcome::Errored(error)
            }
        }
    }

    fn resume_body(&mut self, thread: usize, args: &[Value]) -> Result<DispatchSignal, RuntimeError> {
        if !self.threads[thread].started {
            // First resume: arguments become the body's call arguments.
            self.threads[thread].started = true;
            {
                let th = &mut self.threads[thread];
                th.ensure_stack(1 + args.len())?;
                for (i, v) in args.iter().enumerate() {
                    th.stack[1 + i] = *v;
                }
                th.top = 1 + args.len();
            }
            match self.precall(0, args.len(), RESULTS_ALL)? {
                PreCall::Resumed => self.run_dispatch(1),
                PreCall::Done => {
                    let th = &mut self.threads[thread];
                    let results = th.stack[0..th.top].to_vec();
                    th.top = 0;
                    Ok(DispatchSignal::Returned(results))
                }
                PreCall::Yielded(values) => Ok(DispatchSignal::Yielded(values)),
            }
        } else {
            // Re-entry after a yield: arguments become the yield's results.
            let (slot, expected) = self.threads[thread].pending_resume.take().ok_or_else(|| {
                RuntimeError::assertion("suspended thread has no pending resume point")
            })?;
            self.postcall_values(thread, slot, args, expected)?;
            if self.threads[thread].frames.is_empty() {
                // The thread body itself was a native that yielded; the
                // resume arguments complete it.
                let th = &mut self.threads[thread];
                let results = th.stack[0..th.top].to_vec();
                th.top = 0;
                return Ok(DispatchSignal::Returned(results));
            }
            self.run_dispatch(1)
        }
    }

    // ---- Call protocol ----

    /// Pre-call sequence: resolve the callee (following the `call`
    /// capability once), then either push an interpreted frame or run the
    /// native to completion.
    fn precall(&mut self, func_slot: usize, nargs: usize, expected: i32) -> Result<PreCall, RuntimeError> {
        let tid = self.current;
        let callee = self.threads[tid].stack[func_slot];
        if let Value::Function(handle) = callee {
            let kind = match self.heap.get(handle) {
                HeapObject::Closure(closure) => CalleeKind::Script { proto: closure.proto },
                HeapObject::NativeFunction(_) => CalleeKind::Native,
                _ => {
                    return Err(RuntimeError::assertion(
                        "function value does not refer to a callable object",
                    ))
                }
            };
            return match kind {
                CalleeKind::Script { proto } => {
                    self.precall_script(handle, proto, func_slot, nargs, expected)
                }
                CalleeKind::Native => self.precall_native(handle, func_slot, nargs, expected),
            };
        }

        // Not directly callable: look up the `call` capability.
        let handler = self.meta_handler(&callee, MetaEvent::Call).ok_or_else(|| {
            self.error_here(
                ErrorKind::NotCallable,
                format!("attempt to call a {} value", callee.type_name()),
            )
        })?;
        if !matches!(handler, Value::Function(_)) {
            return Err(self.error_here(ErrorKind::NotCallable, "'call' handler is not a function"));
        }
        // Insert the handler before the callee: the original callee becomes
        // the first argument.
        {
            let th = &mut self.threads[tid];
            let old_end = func_slot + 1 + nargs;
            th.ensure_stack(old_end + 1)?;
            let mut i = old_end;
            while i > func_slot {
                th.stack[i] = th.stack[i - 1];
                i -= 1;
            }
            th.stack[func_slot] = handler;
            if th.top < old_end + 1 {
                th.top = old_end + 1;
            }
        }
        self.precall(func_slot, nargs + 1, expected)
    }

    fn precall_script(
        &mut self,
        closure: Handle,
        proto: usize,
        func_slot: usize,
        nargs: usize,
        expected: i32,
    ) -> Result<PreCall, RuntimeError> {
        let tid = self.current;
        let (param_count, is_vararg, max_stack) = {
            let p = &self.protos[proto];
            (p.param_count as usize, p.is_vararg, p.max_stack_size as usize)
        };
        self.threads[tid]
            .check_frame_room()
            .map_err(|e| self.locate(e))?;

        let th = &mut self.threads[tid];
        let arg_base = func_slot + 1;
        let (base, vararg_base) = if is_vararg {
            // The window starts past every supplied argument; fixed
            // parameters are copied up and the overflow stays behind as the
            // vararg area.
            let base = arg_base + nargs;
            th.ensure_stack(base + max_stack)?;
            let fixed = param_count.min(nargs);
            for i in 0..fixed {
                th.stack[base + i] = th.stack[arg_base + i];
            }
            for i in fixed..max_stack {
                th.stack[base + i] = Value::Nil;
            }
            (base, Some(arg_base))
        } else {
            let base = arg_base;
            th.ensure_stack(base + max_stack)?;
            let supplied = param_count.min(nargs);
            for i in supplied..max_stack {
                th.stack[base + i] = Value::Nil;
            }
            (base, None)
        };

        let top = base + max_stack;
        let mut frame = CallInfo::script(proto, closure, func_slot, base, top, expected);
        frame.vararg_base = vararg_base;
        th.frames.push(frame);
        th.top = top;
        Ok(PreCall::Resumed)
    }

    fn precall_native(
        &mut self,
        handle: Handle,
        func_slot: usize,
        nargs: usize,
        expected: i32,
    ) -> Result<PreCall, RuntimeError> {
        let tid = self.current;
        let (arity, native) = {
            let n = self.heap.get(handle).as_native();
            (n.arity, Rc::clone(&n.native))
        };
        if let Some(arity) = arity {
            if nargs != arity as usize {
                return Err(self.error_here(
                    ErrorKind::Type,
                    format!("Expected {} arguments but got {}.", arity, nargs),
                ));
            }
        }
        self.threads[tid]
            .check_frame_room()
            .map_err(|e| self.locate(e))?;

        let base = func_slot + 1;
        let frame_depth = self.threads[tid].frames.len();
        {
            let th = &mut self.threads[tid];
            th.ensure_stack(base + nargs + MIN_NATIVE_HEADROOM)?;
            th.frames.push(CallInfo::native(handle, func_slot, base, base + nargs, expected));
        }

        let outcome = {
            let mut ctx = NativeCtx {
                vm: self,
                thread: tid,
                base,
                arg_count: nargs,
            };
            native.invoke(&mut ctx)
        };

        match outcome {
            Err(error) => {
                // The native may have left re-entrant frames behind; drop
                // everything from its own frame up.
                self.threads[tid].frames.truncate(frame_depth);
                Err(self.locate(error))
            }
            Ok(NativeReturn::Values(values)) => {
                self.threads[tid].frames.pop();
                self.postcall_values(tid, func_slot, &values, expected)?;
                Ok(PreCall::Done)
            }
            Ok(NativeReturn::Yield(values)) => {
                self.threads[tid].frames.pop();
                if tid == 0 {
                    return Err(self.error_here(
                        ErrorKind::YieldAcrossBoundary,
                        "attempt to yield from outside a coroutine",
                    ));
                }
                if self.nesting != self.threads[tid].resume_nesting {
                    return Err(self.error_here(
                        ErrorKind::YieldAcrossBoundary,
                        "attempt to yield across a native call boundary",
                    ));
                }
                self.threads[tid].pending_resume = Some((func_slot, expected));
                Ok(PreCall::Yielded(values))
            }
        }
    }

    /// Post-call for results that live outside the stack: copy them into
    /// the slot the callee occupied, truncating or nil-padding to the
    /// expected count (`RESULTS_ALL` keeps everything and moves the top).
    fn postcall_values(
        &mut self,
        tid: usize,
        slot: usize,
        values: &[Value],
        expected: i32,
    ) -> Result<(), RuntimeError> {
        let th = &mut self.threads[tid];
        if expected == RESULTS_ALL {
            th.ensure_stack(slot + values.len())?;
            for (i, v) in values.iter().enumerate() {
                th.stack[slot + i] = *v;
            }
            th.top = slot + values.len();
        } else {
            let want = expected as usize;
            th.ensure_stack(slot + want)?;
            for i in 0..want {
                th.stack[slot + i] = values.get(i).copied().unwrap_or(Value::Nil);
            }
            let caller_top = th.frames.last().map(|f| f.top).unwrap_or(slot + want);
            th.top = caller_top.max(slot + want);
        }
        Ok(())
    }

    /// Frame teardown for an interpreted return. Results move from
    /// `ret_start` into the callee slot. Returns the result list when the
    /// frame at `entry_depth` returns, handing control back to the host.
    fn do_return(
        &mut self,
        entry_depth: usize,
        ret_start: usize,
        count: usize,
    ) -> Result<Option<Vec<Value>>, RuntimeError> {
        let tid = self.current;
        let frame_base = self.threads[tid].current_frame().base;
        self.close_upvalues(tid, frame_base);

        let frame = self.threads[tid].current_frame().clone();
        if self.threads[tid].frames.len() == entry_depth {
            let th = &mut self.threads[tid];
            let results = th.stack[ret_start..ret_start + count].to_vec();
            th.frames.pop();
            th.top = frame.func_slot;
            return Ok(Some(results));
        }

        let th = &mut self.threads[tid];
        th.frames.pop();
        let caller_top = th.current_frame().top;
        let dest = frame.func_slot;
        if frame.expected_results == RESULTS_ALL {
            for i in 0..count {
                th.stack[dest + i] = th.stack[ret_start + i];
            }
            th.top = dest + count;
        } else {
            let want = frame.expected_results as usize;
            th.ensure_stack(dest + want)?;
            for i in 0..want {
                th.stack[dest + i] = if i < count {
                    th.stack[ret_start + i]
                } else {
                    Value::Nil
                };
            }
            th.top = caller_top.max(dest + want);
        }
        Ok(None)
    }

    // ---- Tail calls ----

    /// Reuse the current frame for the callee: upvalues over the dying
    /// window are closed first, then callee and arguments slide down and
    /// the frame is rebuilt in place. The interpreter's own recursion depth
    /// does not grow, no matter how long the chain.
    fn tailcall_script(
        &mut self,
        closure: Handle,
        proto: usize,
        func_slot: usize,
        nargs: usize,
    ) -> Result<(), RuntimeError> {
        let tid = self.current;
        let (param_count, is_vararg, max_stack) = {
            let p = &self.protos[proto];
            (p.param_count as usize, p.is_vararg, p.max_stack_size as usize)
        };

        let old_base = self.threads[tid].current_frame().base;
        self.close_upvalues(tid, old_base);

        let th = &mut self.threads[tid];
        let dest = th.current_frame().func_slot;
        th.stack[dest] = th.stack[func_slot];
        for i in 0..nargs {
            th.stack[dest + 1 + i] = th.stack[func_slot + 1 + i];
        }

        let arg_base = dest + 1;
        let (base, vararg_base) = if is_vararg {
            let base = arg_base + nargs;
            th.ensure_stack(base + max_stack)?;
            let fixed = param_count.min(nargs);
            for i in 0..fixed {
                th.stack[base + i] = th.stack[arg_base + i];
            }
            for i in fixed..max_stack {
                th.stack[base + i] = Value::Nil;
            }
            (base, Some(arg_base))
        } else {
            let base = arg_base;
            th.ensure_stack(base + max_stack)?;
            let supplied = param_count.min(nargs);
            for i in supplied..max_stack {
                th.stack[base + i] = Value::Nil;
            }
            (base, None)
        };

        let top = base + max_stack;
        let frame = th.current_frame_mut();
        frame.kind = FrameKind::Script { proto, closure };
        frame.base = base;
        frame.top = top;
        frame.saved_pc = 0;
        frame.vararg_base = vararg_base;
        frame.tail_calls += 1;
        // func_slot and expected_results stay: the reused frame still
        // answers to the original caller.
        th.top = top;
        Ok(())
    }

    // ---- Upvalues ----

    fn find_or_create_open_upvalue(&mut self, tid: usize, slot: usize) -> Result<Handle, RuntimeError> {
        for &(s, handle) in &self.threads[tid].open_upvalues {
            if s == slot {
                return Ok(handle);
            }
        }
        let (handle, _) = self
            .heap
            .alloc_upvalue(UpvalueLocation::Open { thread: tid, slot });
        // Root ordering: the open-upvalue list is a root set; insert before
        // tracking the allocation.
        let list = &mut self.threads[tid].open_upvalues;
        list.push((slot, handle));
        list.sort_by(|a, b| b.0.cmp(&a.0));
        self.sync_pending_allocations()?;
        Ok(handle)
    }

    /// Close every open upvalue at or above `level`: the current value is
    /// promoted into the upvalue object, which outlives the frame.
    fn close_upvalues(&mut self, tid: usize, level: usize) {
        let mut i = 0;
        while i < self.threads[tid].open_upvalues.len() {
            let (slot, handle) = self.threads[tid].open_upvalues[i];
            if slot >= level {
                let value = self.threads[tid].stack[slot];
                self.gc.write_barrier(handle, &value);
                self.heap.get_mut(handle).as_upvalue_mut().location = UpvalueLocation::Closed(value);
                self.threads[tid].open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn read_upvalue(&self, handle: Handle) -> Value {
        match self.heap.get(handle).as_upvalue().location {
            UpvalueLocation::Open { thread, slot } => self.threads[thread].stack[slot],
            UpvalueLocation::Closed(value) => value,
        }
    }

    fn write_upvalue(&mut self, handle: Handle, value: Value) {
        match self.heap.get(handle).as_upvalue().location {
            UpvalueLocation::Open { thread, slot } => self.threads[thread].stack[slot] = value,
            UpvalueLocation::Closed(_) => {
                self.gc.write_barrier(handle, &value);
                self.heap.get_mut(handle).as_upvalue_mut().location = UpvalueLocation::Closed(value);
            }
        }
    }

    fn upvalue_handle(&self, tid: usize, index: usize) -> Result<Handle, RuntimeError> {
        let frame = self.threads[tid].current_frame();
        let FrameKind::Script { closure, .. } = frame.kind else {
            return Err(RuntimeError::assertion("upvalue access outside a script frame"));
        };
        self.heap
            .get(closure)
            .as_closure()
            .upvalues
            .get(index)
            .copied()
            .ok_or_else(|| RuntimeError::assertion("upvalue index out of range"))
    }

    // ---- Metamethods ----

    fn meta_handler(&self, value: &Value, event: MetaEvent) -> Option<Value> {
        let meta = match value {
            Value::Table(handle) => self.heap.get(*handle).as_table().metatable,
            Value::Userdata(handle) => self.heap.get(*handle).as_userdata().metatable,
            _ => None,
        }?;
        let key = TableKey::Str(self.meta_keys[event as usize]);
        let handler = self.heap.get(meta).as_table().get(&key);
        if handler.is_nil() {
            None
        } else {
            Some(handler)
        }
    }

    // ---- Operator semantics ----

    fn arith_number(op: OpCode, x: f64, y: f64) -> f64 {
        match op {
            OpCode::Add => x + y,
            OpCode::Subtract => x - y,
            OpCode::Multiply => x * y,
            OpCode::Divide => x / y,
            OpCode::Modulo => x - (x / y).floor() * y,
            _ => unreachable!("not an arithmetic opcode"),
        }
    }

    fn arith_event(op: OpCode) -> MetaEvent {
        match op {
            OpCode::Add => MetaEvent::Add,
            OpCode::Subtract => MetaEvent::Sub,
            OpCode::Multiply => MetaEvent::Mul,
            OpCode::Divide => MetaEvent::Div,
            OpCode::Modulo => MetaEvent::Mod,
            _ => unreachable!("not an arithmetic opcode"),
        }
    }

    /// Arithmetic slow path: must agree with the fast path on plain
    /// numbers, otherwise dispatch the metamethod event.
    fn arith_slow(&mut self, op: OpCode, vb: Value, vc: Value) -> Result<Value, RuntimeError> {
        if let (Value::Number(x), Value::Number(y)) = (vb, vc) {
            return Ok(Value::Number(Self::arith_number(op, x, y)));
        }
        let event = Self::arith_event(op);
        let handler = self
            .meta_handler(&vb, event)
            .or_else(|| self.meta_handler(&vc, event))
            .ok_or_else(|| {
                let offender = if vb.is_number() { &vc } else { &vb };
                self.error_here(
                    ErrorKind::Type,
                    format!("attempt to perform arithmetic on a {} value", offender.type_name()),
                )
            })?;
        let results = self.call(handler, &[vb, vc])?;
        Ok(results.first().copied().unwrap_or(Value::Nil))
    }

    fn negate_slow(&mut self, value: Value) -> Result<Value, RuntimeError> {
        if let Value::Number(n) = value {
            return Ok(Value::Number(-n));
        }
        let handler = self.meta_handler(&value, MetaEvent::Neg).ok_or_else(|| {
            self.error_here(ErrorKind::Type, "Operand must be a number.")
        })?;
        let results = self.call(handler, &[value])?;
        Ok(results.first().copied().unwrap_or(Value::Nil))
    }

    fn compare_slow(&mut self, op: OpCode, vb: Value, vc: Value) -> Result<bool, RuntimeError> {
        let event = match op {
            OpCode::Less => MetaEvent::Lt,
            OpCode::LessEqual => MetaEvent::Le,
            _ => return Err(RuntimeError::assertion("not a comparison opcode")),
        };
        let handler = self
            .meta_handler(&vb, event)
            .or_else(|| self.meta_handler(&vc, event))
            .ok_or_else(|| {
                self.error_here(
                    ErrorKind::Type,
                    format!(
                        "attempt to compare {} with {}",
                        vb.type_name(),
                        vc.type_name()
                    ),
                )
            })?;
        let results = self.call(handler, &[vb, vc])?;
        Ok(!results.first().copied().unwrap_or(Value::Nil).is_falsey())
    }

    fn concat_values(&mut self, vb: Value, vc: Value) -> Result<Value, RuntimeError> {
        let coerce = |vm: &Vm, v: &Value| -> Option<String> {
            match v {
                Value::String(h) => Some(vm.heap.get(*h).as_string().content.clone()),
                Value::Number(n) => Some(crate::value::format_number(*n)),
                _ => None,
            }
        };
        if let (Some(left), Some(right)) = (coerce(self, &vb), coerce(self, &vc)) {
            let mut combined = String::with_capacity(left.len() + right.len());
            combined.push_str(&left);
            combined.push_str(&right);
            return self.intern(&combined);
        }
        let handler = self
            .meta_handler(&vb, MetaEvent::Concat)
            .or_else(|| self.meta_handler(&vc, MetaEvent::Concat))
            .ok_or_else(|| {
                let offender = if matches!(vb, Value::String(_) | Value::Number(_)) {
                    &vc
                } else {
                    &vb
                };
                self.error_here(
                    ErrorKind::Type,
                    format!("attempt to concatenate a {} value", offender.type_name()),
                )
            })?;
        let results = self.call(handler, &[vb, vc])?;
        Ok(results.first().copied().unwrap_or(Value::Nil))
    }

    /// Indexed read with the `index` capability chain: raw table hit
    /// first, then a function handler or a fallback object, bounded by
    /// `MAX_META_CHAIN`.
    fn index_get(&mut self, receiver: Value, key: Value) -> Result<Value, RuntimeError> {
        let mut current = receiver;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(handle) = current {
                let table_key = TableKey::from_value(&key).map_err(|e| self.locate(e))?;
                let raw = self.heap.get(handle).as_table().get(&table_key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match self.meta_handler(&current, MetaEvent::Index) {
                    None => return Ok(Value::Nil),
                    Some(handler @ Value::Function(_)) => {
                        let results = self.call(handler, &[current, key])?;
                        return Ok(results.first().copied().unwrap_or(Value::Nil));
                    }
                    Some(next) => current = next,
                }
            } else {
                match self.meta_handler(&current, MetaEvent::Index) {
                    Some(handler @ Value::Function(_)) => {
                        let results = self.call(handler, &[current, key])?;
                        return Ok(results.first().copied().unwrap_or(Value::Nil));
                    }
                    Some(next) => current = next,
                    None => {
                        return Err(self.error_here(
                            ErrorKind::Type,
                            format!("attempt to index a {} value", current.type_name()),
                        ))
                    }
                }
            }
        }
        Err(self.error_here(ErrorKind::Type, "'index' chain too long; possible loop"))
    }

    /// Indexed store with the `newindex` capability chain: a raw hit on an
    /// existing key writes through directly; otherwise a function handler
    /// receives `(receiver, key, value)` or a fallback object takes the
    /// store, bounded by `MAX_META_CHAIN`.
    fn index_set(&mut self, receiver: Value, key: Value, value: Value) -> Result<(), RuntimeError> {
        let mut current = receiver;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(handle) = current {
                let table_key = TableKey::from_value(&key).map_err(|e| self.locate(e))?;
                let present = !self.heap.get(handle).as_table().get(&table_key).is_nil();
                if present {
                    self.gc.write_barrier(handle, &value);
                    self.heap.get_mut(handle).as_table_mut().set(table_key, value);
                    return Ok(());
                }
                match self.meta_handler(&current, MetaEvent::NewIndex) {
                    None => {
                        self.gc.write_barrier(handle, &value);
                        self.heap.get_mut(handle).as_table_mut().set(table_key, value);
                        return Ok(());
                    }
                    Some(handler @ Value::Function(_)) => {
                        self.call(handler, &[current, key, value])?;
                        return Ok(());
                    }
                    Some(next) => current = next,
                }
            } else {
                match self.meta_handler(&current, MetaEvent::NewIndex) {
                    Some(handler @ Value::Function(_)) => {
                        self.call(handler, &[current, key, value])?;
                        return Ok(());
                    }
                    Some(next) => current = next,
                    None => {
                        return Err(self.error_here(
                            ErrorKind::Type,
                            format!("attempt to index a {} value", current.type_name()),
                        ))
                    }
                }
            }
        }
        Err(self.error_here(ErrorKind::Type, "'newindex' chain too long; possible loop"))
    }

    // ---- Constants ----

    fn constant_value(&mut self, proto: usize, index: usize) -> Result<Value, RuntimeError> {
        let constant = self.protos[proto]
            .chunk
            .constants
            .get(index)
            .cloned()
            .ok_or_else(|| RuntimeError::assertion("constant index out of range"))?;
        Ok(match constant {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(b),
            Constant::Number(n) => Value::Number(n),
            Constant::Str(s) => self.intern(&s)?,
        })
    }

    fn constant_str(&self, proto: usize, index: usize) -> Result<String, RuntimeError> {
        match self.protos[proto].chunk.constants.get(index) {
            Some(Constant::Str(s)) => Ok(s.clone()),
            _ => Err(RuntimeError::assertion("name constant is not a string")),
        }
    }

    // ---- Error helpers ----

    /// Attach the current source line to an error, when one is known.
    fn locate(&self, error: RuntimeError) -> RuntimeError {
        if error.line.is_some() {
            return error;
        }
        let th = &self.threads[self.current];
        for frame in th.frames.iter().rev() {
            if let FrameKind::Script { proto, .. } = frame.kind {
                let pc = frame.saved_pc.saturating_sub(1);
                if let Some(line) = self.protos[proto].chunk.line_of(pc) {
                    return error.with_line(line);
                }
            }
        }
        error
    }

    fn error_here(&self, kind: ErrorKind, message: impl Into<String>) -> RuntimeError {
        self.locate(RuntimeError::new(kind, message))
    }

    // ---- Dispatch loop ----

    /// Fetch/decode/execute until the frame at `entry_depth` returns or the
    /// running thread yields. Interpreted calls push a frame and continue
    /// in this same loop; native recursion only happens for metamethod
    /// handlers and host re-entry.
    fn run_dispatch(&mut self, entry_depth: usize) -> Result<DispatchSignal, RuntimeError> {
        loop {
            let tid = self.current;
            let (instruction, base, proto_idx) = {
                let th = &self.threads[tid];
                let frame = th.frames.last().ok_or_else(|| {
                    RuntimeError::assertion("dispatch loop ran with an empty frame chain")
                })?;
                let FrameKind::Script { proto, .. } = frame.kind else {
                    return Err(RuntimeError::assertion("dispatch loop entered a native frame"));
                };
                let chunk = &self.protos[proto].chunk;
                let instruction = if frame.saved_pc < chunk.len() {
                    Some(chunk.code[frame.saved_pc])
                } else {
                    None
                };
                (instruction, frame.base, proto)
            };

            let Some(inst) = instruction else {
                // Fell off the end of the code: return with no results.
                if let Some(results) = self.do_return(entry_depth, base, 0)? {
                    return Ok(DispatchSignal::Returned(results));
                }
                continue;
            };

            #[cfg(feature = "debug_trace_execution")]
            {
                let frame = self.threads[tid].current_frame();
                crate::debug::disassemble_instruction(&self.protos[proto_idx].chunk, frame.saved_pc);
            }

            self.threads[tid].current_frame_mut().saved_pc += 1;
            let a = inst.a as usize;

            match inst.op {
                OpCode::Move => {
                    let th = &mut self.threads[tid];
                    let value = th.stack[base + inst.b as usize];
                    th.stack[base + a] = value;
                }
                OpCode::LoadConst => {
                    let value = self.constant_value(proto_idx, inst.bx())?;
                    self.threads[tid].stack[base + a] = value;
                }
                OpCode::LoadNil => {
                    let th = &mut self.threads[tid];
                    for i in 0..=inst.b as usize {
                        th.stack[base + a + i] = Value::Nil;
                    }
                }
                OpCode::LoadTrue => {
                    self.threads[tid].stack[base + a] = Value::Bool(true);
                }
                OpCode::LoadFalse => {
                    self.threads[tid].stack[base + a] = Value::Bool(false);
                }
                OpCode::DefineGlobal => {
                    let name = self.constant_str(proto_idx, inst.bx())?;
                    let value = self.threads[tid].stack[base + a];
                    self.globals.insert(name, value);
                }
                OpCode::GetGlobal => {
                    let name = self.constant_str(proto_idx, inst.bx())?;
                    let value = self.globals.find(&name).ok_or_else(|| {
                        self.error_here(
                            ErrorKind::Index,
                            format!("Undefined global variable {}.", name),
                        )
                    })?;
                    self.threads[tid].stack[base + a] = value;
                }
                OpCode::SetGlobal => {
                    let name = self.constant_str(proto_idx, inst.bx())?;
                    if self.globals.find(&name).is_none() {
                        return Err(self.error_here(
                            ErrorKind::Index,
                            format!("Undefined global variable {}.", name),
                        ));
                    }
                    let value = self.threads[tid].stack[base + a];
                    self.globals.insert(name, value);
                }
                OpCode::GetUpvalue => {
                    let handle = self.upvalue_handle(tid, inst.b as usize)?;
                    let value = self.read_upvalue(handle);
                    self.threads[tid].stack[base + a] = value;
                }
                OpCode::SetUpvalue => {
                    let handle = self.upvalue_handle(tid, inst.b as usize)?;
                    let value = self.threads[tid].stack[base + a];
                    self.write_upvalue(handle, value);
                }
                OpCode::CloseUpvalues => {
                    self.close_upvalues(tid, base + a);
                }
                OpCode::NewTable => {
                    let (handle, _) = self.heap.alloc_table();
                    // Root ordering: the table lands on the stack before its
                    // bytes are tracked.
                    self.threads[tid].stack[base + a] = Value::Table(handle);
                    self.sync_pending_allocations()?;
                }
                OpCode::GetIndex => {
                    let th = &self.threads[tid];
                    let receiver = th.stack[base + inst.b as usize];
                    let key = th.stack[base + inst.c as usize];
                    let value = self.index_get(receiver, key)?;
                    self.threads[tid].stack[base + a] = value;
                }
                OpCode::SetIndex => {
                    let th = &self.threads[tid];
                    let receiver = th.stack[base + a];
                    let key = th.stack[base + inst.b as usize];
                    let value = th.stack[base + inst.c as usize];
                    self.index_set(receiver, key, value)?;
                }
                OpCode::Add
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide
                | OpCode::Modulo => {
                    let th = &self.threads[tid];
                    let vb = th.stack[base + inst.b as usize];
                    let vc = th.stack[base + inst.c as usize];
                    let result = if let (Value::Number(x), Value::Number(y)) = (vb, vc) {
                        // Fast path: both operands already numbers.
                        Value::Number(Self::arith_number(inst.op, x, y))
                    } else {
                        self.arith_slow(inst.op, vb, vc)?
                    };
                    self.threads[tid].stack[base + a] = result;
                }
                OpCode::Negate => {
                    let value = self.threads[tid].stack[base + inst.b as usize];
                    let result = match value {
                        Value::Number(n) => Value::Number(-n),
                        _ => self.negate_slow(value)?,
                    };
                    self.threads[tid].stack[base + a] = result;
                }
                OpCode::Not => {
                    let th = &mut self.threads[tid];
                    let value = th.stack[base + inst.b as usize];
                    th.stack[base + a] = Value::Bool(value.is_falsey());
                }
                OpCode::Concat => {
                    let th = &self.threads[tid];
                    let vb = th.stack[base + inst.b as usize];
                    let vc = th.stack[base + inst.c as usize];
                    let result = self.concat_values(vb, vc)?;
                    self.threads[tid].stack[base + a] = result;
                }
                OpCode::Equal => {
                    let th = &mut self.threads[tid];
                    let vb = th.stack[base + inst.b as usize];
                    let vc = th.stack[base + inst.c as usize];
                    th.stack[base + a] = Value::Bool(vb == vc);
                }
                OpCode::Less | OpCode::LessEqual => {
                    let th = &self.threads[tid];
                    let vb = th.stack[base + inst.b as usize];
                    let vc = th.stack[base + inst.c as usize];
                    let result = match (vb, vc) {
                        (Value::Number(x), Value::Number(y)) => {
                            if inst.op == OpCode::Less {
                                x < y
                            } else {
                                x <= y
                            }
                        }
                        (Value::String(h1), Value::String(h2)) => {
                            let left = &self.heap.get(h1).as_string().content;
                            let right = &self.heap.get(h2).as_string().content;
                            if inst.op == OpCode::Less {
                                left < right
                            } else {
                                left <= right
                            }
                        }
                        _ => self.compare_slow(inst.op, vb, vc)?,
                    };
                    self.threads[tid].stack[base + a] = Value::Bool(result);
                }
                OpCode::Jump => {
                    self.jump(tid, inst.sbx())?;
                }
                OpCode::JumpIfFalse => {
                    let condition = self.threads[tid].stack[base + a];
                    if condition.is_falsey() {
                        self.jump(tid, inst.sbx())?;
                    }
                }
                OpCode::JumpIfTrue => {
                    let condition = self.threads[tid].stack[base + a];
                    if !condition.is_falsey() {
                        self.jump(tid, inst.sbx())?;
                    }
                }
                OpCode::Call => {
                    let func_slot = base + a;
                    let th = &self.threads[tid];
                    let nargs = if inst.b == 0 {
                        th.top.saturating_sub(func_slot + 1)
                    } else {
                        inst.b as usize - 1
                    };
                    let expected = if inst.c == 0 { RESULTS_ALL } else { inst.c as i32 - 1 };
                    match self.precall(func_slot, nargs, expected)? {
                        PreCall::Resumed | PreCall::Done => {}
                        PreCall::Yielded(values) => return Ok(DispatchSignal::Yielded(values)),
                    }
                }
                OpCode::TailCall => {
                    let func_slot = base + a;
                    let th = &self.threads[tid];
                    let mut nargs = if inst.b == 0 {
                        th.top.saturating_sub(func_slot + 1)
                    } else {
                        inst.b as usize - 1
                    };
                    let mut callee = th.stack[func_slot];

                    if !matches!(callee, Value::Function(_)) {
                        // Follow the `call` capability once, exactly like an
                        // ordinary call.
                        let handler =
                            self.meta_handler(&callee, MetaEvent::Call).ok_or_else(|| {
                                self.error_here(
                                    ErrorKind::NotCallable,
                                    format!("attempt to call a {} value", callee.type_name()),
                                )
                            })?;
                        if !matches!(handler, Value::Function(_)) {
                            return Err(self.error_here(
                                ErrorKind::NotCallable,
                                "'call' handler is not a function",
                            ));
                        }
                        let th = &mut self.threads[tid];
                        let old_end = func_slot + 1 + nargs;
                        th.ensure_stack(old_end + 1)?;
                        let mut i = old_end;
                        while i > func_slot {
                            th.stack[i] = th.stack[i - 1];
                            i -= 1;
                        }
                        th.stack[func_slot] = handler;
                        if th.top < old_end + 1 {
                            th.top = old_end + 1;
                        }
                        callee = handler;
                        nargs += 1;
                    }

                    let handle = match callee {
                        Value::Function(h) => h,
                        _ => return Err(RuntimeError::assertion("tail callee is not a function")),
                    };
                    let kind = match self.heap.get(handle) {
                        HeapObject::Closure(closure) => CalleeKind::Script { proto: closure.proto },
                        HeapObject::NativeFunction(_) => CalleeKind::Native,
                        _ => {
                            return Err(RuntimeError::assertion(
                                "function value does not refer to a callable object",
                            ))
                        }
                    };
                    match kind {
                        CalleeKind::Script { proto } => {
                            self.tailcall_script(handle, proto, func_slot, nargs)?;
                        }
                        CalleeKind::Native => {
                            // Native frames never collapse: run the call
                            // normally; the following Return instruction
                            // forwards every result.
                            match self.precall_native(handle, func_slot, nargs, RESULTS_ALL)? {
                                PreCall::Done => {}
                                PreCall::Yielded(values) => {
                                    return Ok(DispatchSignal::Yielded(values))
                                }
                                PreCall::Resumed => {
                                    return Err(RuntimeError::assertion(
                                        "native precall resumed an interpreted frame",
                                    ))
                                }
                            }
                        }
                    }
                }
                OpCode::Return => {
                    let ret_start = base + a;
                    let count = if inst.b == 0 {
                        self.threads[tid].top.saturating_sub(ret_start)
                    } else {
                        inst.b as usize - 1
                    };
                    if let Some(results) = self.do_return(entry_depth, ret_start, count)? {
                        return Ok(DispatchSignal::Returned(results));
                    }
                }
                OpCode::Vararg => {
                    let (vararg_start, available) = {
                        let frame = self.threads[tid].current_frame();
                        match frame.vararg_base {
                            Some(vararg_base) => {
                                let params = self.protos[proto_idx].param_count as usize;
                                let start = vararg_base + params;
                                (start, frame.base.saturating_sub(start))
                            }
                            None => (0, 0),
                        }
                    };
                    let wanted = if inst.c == 0 { available } else { inst.c as usize - 1 };
                    let th = &mut self.threads[tid];
                    th.ensure_stack(base + a + wanted)?;
                    for i in 0..wanted {
                        th.stack[base + a + i] = if i < available {
                            th.stack[vararg_start + i]
                        } else {
                            Value::Nil
                        };
                    }
                    if inst.c == 0 {
                        th.top = base + a + wanted;
                    }
                }
                OpCode::Closure => {
                    let child = {
                        let p = &self.protos[proto_idx];
                        *p.children.get(inst.bx()).ok_or_else(|| {
                            RuntimeError::assertion("child prototype index out of range")
                        })?
                    };
                    let descriptors = self.protos[child].upvalues.clone();
                    let parent_closure = {
                        let FrameKind::Script { closure, .. } =
                            self.threads[tid].current_frame().kind
                        else {
                            return Err(RuntimeError::assertion(
                                "closure instruction outside a script frame",
                            ));
                        };
                        closure
                    };
                    let mut upvalues = Vec::with_capacity(descriptors.len());
                    for descriptor in &descriptors {
                        let handle = if descriptor.in_stack {
                            self.find_or_create_open_upvalue(tid, base + descriptor.index as usize)?
                        } else {
                            self.heap
                                .get(parent_closure)
                                .as_closure()
                                .upvalues
                                .get(descriptor.index as usize)
                                .copied()
                                .ok_or_else(|| {
                                    RuntimeError::assertion("upvalue index out of range")
                                })?
                        };
                        upvalues.push(handle);
                    }
                    let (handle, _) = self.heap.alloc_closure(child, upvalues);
                    // Root ordering: the closure lands on the stack before
                    // its bytes are tracked.
                    self.threads[tid].stack[base + a] = Value::Function(handle);
                    self.sync_pending_allocations()?;
                }
            }
        }
    }

    fn jump(&mut self, tid: usize, offset: i32) -> Result<(), RuntimeError> {
        let frame = self.threads[tid].current_frame_mut();
        let target = frame.saved_pc as i64 + offset as i64;
        if target < 0 {
            return Err(RuntimeError::assertion("jump before start of code"));
        }
        frame.saved_pc = target as usize;
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}
