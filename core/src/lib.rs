//! ruvm-core: a stack-based bytecode virtual machine.
//!
//! Programs are [`iseq::Iseq`] trees, built directly or lowered from the
//! serializable [`iseq::IseqDef`] form. An [`vm::ExecContext`] runs them:
//!
//! ```
//! use ruvm_core::insn::Insn;
//! use ruvm_core::iseq::{Iseq, IseqKind, Params};
//! use ruvm_core::val::Val;
//! use ruvm_core::vm::{ExecContext, Vm};
//!
//! let iseq = Iseq::new(
//!     "main",
//!     IseqKind::Top,
//!     vec![],
//!     Params::default(),
//!     vec![Insn::PushConst(0), Insn::PushConst(1), Insn::OptPlus, Insn::Leave],
//!     vec![Val::Int(40), Val::Int(2)],
//!     vec![],
//! );
//! let vm = Vm::new();
//! let mut ctx = ExecContext::new(&vm);
//! assert_eq!(ctx.eval(&iseq).unwrap(), Val::Int(42));
//! ```

pub mod insn;
pub mod iseq;
pub mod val;
pub mod vm;

pub use insn::{Insn, ThrowKind};
pub use iseq::{CatchEntry, CatchKind, Iseq, IseqDef, IseqKind, Params};
pub use val::{ErrorValue, JumpError, UncaughtError, Val};
pub use vm::{Binding, ExecContext, Vm, VmOptions};
