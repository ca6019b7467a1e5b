pub mod call_frame;
pub mod chunk;
pub mod constants;
pub mod debug;
pub mod error;
pub mod gc;
pub mod objects;
pub mod std_mod;
pub mod table;
pub mod thread;
pub mod value;
pub mod vm;

pub use call_frame::{CallInfo, FrameKind, RESULTS_ALL};
pub use chunk::{Chunk, Constant, Instruction, OpCode, Prototype, UpvalueDesc};
pub use error::{ErrorKind, RuntimeError};
pub use objects::object_native_function::{NativeObject, NativeReturn};
pub use thread::ThreadStatus;
pub use value::Value;
pub use vm::{meta_event, MetaEvent, NativeCtx, ResumeOutcome, Vm};
