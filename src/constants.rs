/// Upper bound on the number of frames in one thread's call chain.
pub const MAX_FRAMES_SIZE: usize = 1024;

/// Hard ceiling on one thread's register stack. Growth past this point is
/// a stack overflow, not a reallocation.
pub const STACK_LIMIT: usize = 1 << 20;

pub const INITIAL_STACK_SIZE: usize = 256;

/// Free slots guaranteed above a native function's argument window.
pub const MIN_NATIVE_HEADROOM: usize = 20;

/// Upper bound on re-entrant dispatch-loop nesting (metamethod handlers,
/// natives calling back into the VM, nested resumes).
pub const MAX_NATIVE_NESTING: usize = 200;

/// Cap on chained `index` metamethod hops before the lookup is rejected.
pub const MAX_META_CHAIN: usize = 32;

pub const INITIAL_GC_THRESHOLD: usize = 1024 * 1024; // 1MB
