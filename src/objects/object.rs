use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::objects::object_string::ObjectString;
use crate::objects::object_table::ObjectTable;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::objects::object_userdata::ObjectUserdata;

/// Opaque index into the object arena. The core never holds raw pointers
/// to heap objects; handles are re-resolved on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub(crate) fn from_index(index: usize) -> Handle {
        Handle(index as u32)
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    ObjString,
    ObjTable,
    ObjClosure,
    ObjNativeFunction,
    ObjUpvalue,
    ObjUserdata,
}

/// All collector-owned object kinds. The discriminant is the type tag; the
/// payload is the object itself.
pub enum HeapObject {
    String(ObjectString),
    Table(ObjectTable),
    Closure(ObjectClosure),
    NativeFunction(ObjectNativeFunction),
    Upvalue(ObjectUpvalue),
    Userdata(ObjectUserdata),
}

impl HeapObject {
    pub fn obj_type(&self) -> ObjectType {
        match self {
            HeapObject::String(_) => ObjectType::ObjString,
            HeapObject::Table(_) => ObjectType::ObjTable,
            HeapObject::Closure(_) => ObjectType::ObjClosure,
            HeapObject::NativeFunction(_) => ObjectType::ObjNativeFunction,
            HeapObject::Upvalue(_) => ObjectType::ObjUpvalue,
            HeapObject::Userdata(_) => ObjectType::ObjUserdata,
        }
    }

    /// Rough byte cost of this object, counted for the GC trigger.
    pub fn deep_size(&self) -> usize {
        let base = std::mem::size_of::<HeapObject>();
        base + match self {
            HeapObject::String(s) => s.content.capacity(),
            HeapObject::Table(t) => t.payload_size(),
            HeapObject::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<Handle>(),
            HeapObject::NativeFunction(n) => {
                n.name.capacity() + n.captured.capacity() * std::mem::size_of::<crate::value::Value>()
            }
            HeapObject::Upvalue(_) => 0,
            HeapObject::Userdata(_) => 0,
        }
    }

    // Typed accessors. Tag confusion here means the caller corrupted the
    // value/object mapping, which is a core bug, not a script error.

    pub fn as_string(&self) -> &ObjectString {
        match self {
            HeapObject::String(s) => s,
            _ => panic!("heap object is not a string"),
        }
    }

    pub fn as_table(&self) -> &ObjectTable {
        match self {
            HeapObject::Table(t) => t,
            _ => panic!("heap object is not a table"),
        }
    }

    pub fn as_table_mut(&mut self) -> &mut ObjectTable {
        match self {
            HeapObject::Table(t) => t,
            _ => panic!("heap object is not a table"),
        }
    }

    pub fn as_closure(&self) -> &ObjectClosure {
        match self {
            HeapObject::Closure(c) => c,
            _ => panic!("heap object is not a closure"),
        }
    }

    pub fn as_native(&self) -> &ObjectNativeFunction {
        match self {
            HeapObject::NativeFunction(n) => n,
            _ => panic!("heap object is not a native function"),
        }
    }

    pub fn as_upvalue(&self) -> &ObjectUpvalue {
        match self {
            HeapObject::Upvalue(u) => u,
            _ => panic!("heap object is not an upvalue"),
        }
    }

    pub fn as_upvalue_mut(&mut self) -> &mut ObjectUpvalue {
        match self {
            HeapObject::Upvalue(u) => u,
            _ => panic!("heap object is not an upvalue"),
        }
    }

    pub fn as_userdata(&self) -> &ObjectUserdata {
        match self {
            HeapObject::Userdata(u) => u,
            _ => panic!("heap object is not userdata"),
        }
    }
}
