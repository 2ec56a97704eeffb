//! Virtual machine for the Vesper scripting language.

mod builtins;
mod context;
mod error;
mod frame;
mod observer;
mod value;
mod vm;

pub use builtins::{attr_candidates, builtin_globals, lookup_method};
pub use context::{CancelHandle, ExecContext};
pub use error::VmError;
pub use frame::{Frame, Locals, HEAP_RESERVE, INLINE_SLOTS};
pub use observer::{
    CallEvent, ObserveMode, Observer, ObserverConfig, ReturnEvent, StepEvent,
};
pub use value::{
    Builtin, BuiltinFn, Closure, ErrorValue, HostContext, HostObject, MapValue, Partial,
    TypeRegistry, Value,
};
pub use vm::{Vm, VmOptions, DEFAULT_CHECK_INTERVAL, DEFAULT_FRAME_LIMIT, MAX_ARGS};
