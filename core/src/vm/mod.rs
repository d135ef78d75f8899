//! The execution engine: control frames over a contiguous value stack, lazy
//! promotion of captured scopes to heap environments, a native invocation
//! layer bounded by sentinel frames, and a unified unwind protocol for
//! `return`/`break`/`next`/`redo`/`retry`/`raise` driven by per-iseq catch
//! tables.

pub mod context;
pub mod dispatch;
pub mod env;
pub mod frame;
mod guards;
pub mod hooks;
pub mod invoke;
pub mod proc;
pub mod unwind;


pub use context::{ExecContext, SvarKey, Vm, VmOptions};
pub use env::{Binding, Environment};
pub use frame::{ControlFrame, FrameKind, ScopeRef};
pub use hooks::{TraceEvent, TraceEventKind, TraceHook};
pub use proc::{Block, BlockRef, ProcObject};
pub use unwind::{TagKind, UnwindSignal};
