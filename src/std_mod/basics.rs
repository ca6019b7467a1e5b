use crate::error::RuntimeError;
use crate::objects::object_native_function::{NativeObject, NativeReturn};
use crate::value::Value;
use crate::vm::NativeCtx;

/// `print(...)`: writes each argument separated by a tab.
pub struct Print;

impl NativeObject for Print {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let mut parts = Vec::with_capacity(ctx.arg_count());
        for i in 0..ctx.arg_count() {
            let value = ctx.arg(i);
            parts.push(ctx.vm_ref().display_value(&value));
        }
        println!("{}", parts.join("\t"));
        Ok(NativeReturn::Values(vec![]))
    }
}

/// `type(v)`: the type name of its argument as a string.
pub struct TypeOf;

impl NativeObject for TypeOf {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let name = ctx.arg(0).type_name();
        let value = ctx.vm().intern(name)?;
        Ok(NativeReturn::Values(vec![value]))
    }
}

/// `error(v)`: raises a user error carrying `v` as its payload.
pub struct ErrorFn;

impl NativeObject for ErrorFn {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let payload = ctx.arg(0);
        let message = ctx.vm_ref().display_value(&payload);
        Err(RuntimeError::user(payload, message))
    }
}

/// `assert(v, message?)`: raises unless `v` is truthy; passes all
/// arguments through otherwise.
pub struct Assert;

impl NativeObject for Assert {
    fn invoke(&self, ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let condition = ctx.arg(0);
        if condition.is_falsey() {
            let message = match ctx.checked_arg(1) {
                Some(v) => ctx.vm_ref().display_value(&v),
                None => "assertion failed!".to_string(),
            };
            let payload = ctx.checked_arg(1).unwrap_or(Value::Nil);
            return Err(RuntimeError::user(payload, message));
        }
        Ok(NativeReturn::Values(ctx.args()))
    }
}
