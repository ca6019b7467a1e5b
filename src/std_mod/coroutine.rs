use crate::error::{ErrorKind, RuntimeError};
use crate::objects::object_native_function::{NativeObject, NativeReturn};
use crate::thread::ThreadStatus;
use crate::value::Value;
use crate::vm::{NativeCtx, ResumeOutcome};

/// `coroutine_create(f)`: wraps a function in a fresh suspended thread.
pub struct Create;

impl NativeObject for Create {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let func = ctx.arg(0);
        let id = ctx.vm().create_thread(func)?;
        Ok(NativeReturn::Values(vec![Value::Thread(id)]))
    }
}

/// `coroutine_resume(co, ...)`: drives a thread until it yields, returns
/// or errors. Errors come back as `(false, error_value)`, never raised.
pub struct Resume;

impl NativeObject for Resume {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let target = match ctx.arg(0) {
            Value::Thread(id) => id,
            other => {
                return Err(RuntimeError::new(
                    ErrorKind::Type,
                    format!("cannot resume a {} value", other.type_name()),
                ))
            }
        };
        let args: Vec<Value> = (1..ctx.arg_count()).map(|i| ctx.arg(i)).collect();
        let mut results = Vec::new();
        match ctx.vm().resume(target, &args) {
            ResumeOutcome::Yielded(values) | ResumeOutcome::Returned(values) => {
                results.push(Value::Bool(true));
                results.extend(values);
            }
            ResumeOutcome::Errored(error) => {
                if error.is_fatal() {
                    return Err(error);
                }
                results.push(Value::Bool(false));
                let message = error.to_string();
                let value = match error.payload {
                    Some(payload) => payload,
                    None => ctx.vm().intern(&message)?,
                };
                results.push(value);
            }
        }
        Ok(NativeReturn::Values(results))
    }
}

/// `coroutine_yield(...)`: suspends the running thread, handing the
/// arguments to the resumer.
pub struct Yield;

impl NativeObject for Yield {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        Ok(NativeReturn::Yield(ctx.args()))
    }
}

/// `coroutine_status(co)`: one of "suspended", "running", "normal", "dead".
pub struct Status;

impl NativeObject for Status {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let target = match ctx.arg(0) {
            Value::Thread(id) => id,
            other => {
                return Err(RuntimeError::new(
                    ErrorKind::Type,
                    format!("cannot query status of a {} value", other.type_name()),
                ))
            }
        };
        let status = ctx.vm_ref().thread_status(target).ok_or_else(|| {
            RuntimeError::new(ErrorKind::Coroutine, "no such thread")
        })?;
        let name = match status {
            ThreadStatus::Suspended => "suspended",
            ThreadStatus::Running => "running",
            ThreadStatus::Normal => "normal",
            ThreadStatus::Dead | ThreadStatus::Errored => "dead",
        };
        let value = ctx.vm().intern(name)?;
        Ok(NativeReturn::Values(vec![value]))
    }
}
