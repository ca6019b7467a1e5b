use std::rc::Rc;

use crate::error::RuntimeError;
use crate::value::Value;
use crate::vm::NativeCtx;

/// What a native function hands back to the call protocol: ordinary
/// results, or a request to suspend the running coroutine with the given
/// values.
pub enum NativeReturn {
    Values(Vec<Value>),
    Yield(Vec<Value>),
}

/// A host function callable from script code. It gets bounds-checked
/// access to its argument window and may re-enter the VM through the
/// context (calls, protected calls, resumes).
///
/// Values returned from a re-entrant call are plain copies, not roots:
/// put them back on a stack (or in a container) before doing anything
/// that can allocate, or a collection may free what they refer to.
pub trait NativeObject {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError>;
}

/// The native flavor of a closure: a function pointer object plus a
/// captured-value array, call-compatible with interpreted closures. The
/// captured values are fixed at creation and read back through
/// `NativeCtx::captured`.
pub struct ObjectNativeFunction {
    pub name: String,
    /// `None` accepts any argument count.
    pub arity: Option<u8>,
    pub captured: Vec<Value>,
    pub native: Rc<dyn NativeObject>,
}

impl ObjectNativeFunction {
    pub fn new(
        name: String,
        arity: Option<u8>,
        captured: Vec<Value>,
        native: impl NativeObject + 'static,
    ) -> ObjectNativeFunction {
        ObjectNativeFunction {
            name,
            arity,
            captured,
            native: Rc::new(native),
        }
    }
}
