use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of non-local transfer a `Throw` instruction initiates.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrowKind {
    Return,
    Break,
    Next,
    Redo,
    Retry,
    Raise,
    /// Unrescuable raise. Only ensure bodies run on the way out.
    Fatal,
    /// Re-raise the pending value an ensure body received as its argument.
    Rethrow,
}

/// One bytecode instruction.
///
/// Operand conventions:
/// - `bidx` addresses a local slot backwards from the frame's scope pointer
///   (slot 1 sits next to the scope-link slot).
/// - `level` counts hops along the lexical scope chain, 0 = current scope.
/// - `iseq`/`block` index the owning iseq's constant pool and must refer to
///   `Val::Iseq` entries.
/// - Jump targets are absolute instruction indices.
#[derive(Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Insn {
    PushNil,
    PushSelf,
    PushConst(u16),
    Pop,
    Dup,
    GetLocal { bidx: u16, level: u16 },
    SetLocal { bidx: u16, level: u16 },
    Jump(u32),
    BranchUnless(u32),
    OptPlus,
    OptMinus,
    OptLt,
    OptEq,
    Send { iseq: u16, argc: u8, block: Option<u16> },
    InvokeBlock { argc: u8 },
    NewProc { iseq: u16, lambda: bool },
    InvokeProc { argc: u8 },
    Throw(ThrowKind),
    Leave,
    Nop,
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::PushNil => write!(f, "push_nil"),
            Insn::PushSelf => write!(f, "push_self"),
            Insn::PushConst(k) => write!(f, "push_const {k}"),
            Insn::Pop => write!(f, "pop"),
            Insn::Dup => write!(f, "dup"),
            Insn::GetLocal { bidx, level } => write!(f, "get_local {bidx}, {level}"),
            Insn::SetLocal { bidx, level } => write!(f, "set_local {bidx}, {level}"),
            Insn::Jump(dst) => write!(f, "jump {dst}"),
            Insn::BranchUnless(dst) => write!(f, "branch_unless {dst}"),
            Insn::OptPlus => write!(f, "opt_plus"),
            Insn::OptMinus => write!(f, "opt_minus"),
            Insn::OptLt => write!(f, "opt_lt"),
            Insn::OptEq => write!(f, "opt_eq"),
            Insn::Send { iseq, argc, block } => match block {
                Some(b) => write!(f, "send {iseq}, {argc}, block={b}"),
                None => write!(f, "send {iseq}, {argc}"),
            },
            Insn::InvokeBlock { argc } => write!(f, "invoke_block {argc}"),
            Insn::NewProc { iseq, lambda } => {
                if *lambda {
                    write!(f, "new_proc {iseq}, lambda")
                } else {
                    write!(f, "new_proc {iseq}")
                }
            }
            Insn::InvokeProc { argc } => write!(f, "invoke_proc {argc}"),
            Insn::Throw(kind) => write!(f, "throw {kind:?}"),
            Insn::Leave => write!(f, "leave"),
            Insn::Nop => write!(f, "nop"),
        }
    }
}
