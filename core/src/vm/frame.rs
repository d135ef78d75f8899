use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::iseq::Iseq;
use crate::val::Val;
use crate::vm::env::Environment;

/// What kind of activation a control frame represents.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameKind {
    Method,
    Block,
    /// A block invoked with strict argument semantics through a lambda proc.
    Lambda,
    Class,
    Top,
    Eval,
    /// Native code running with a frame for diagnostics and hooks.
    Native,
    /// Sentinel pushed at every native re-entry; the boundary the execution
    /// loop returns across and unwinds stop at.
    Finish,
}

impl FrameKind {
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Method => "method",
            FrameKind::Block => "block",
            FrameKind::Lambda => "lambda",
            FrameKind::Class => "class",
            FrameKind::Top => "top",
            FrameKind::Eval => "eval",
            FrameKind::Native => "native",
            FrameKind::Finish => "finish",
        }
    }
}

/// A reference to a local-variable scope: either a live region on the value
/// stack (identified by the index of its scope-link slot) or a heap
/// environment it was promoted to.
#[derive(Clone)]
pub enum ScopeRef {
    Stack(usize),
    Env(Rc<Environment>),
}

impl ScopeRef {
    pub fn is_heap(&self) -> bool {
        matches!(self, ScopeRef::Env(_))
    }

    pub fn as_env(&self) -> Option<&Rc<Environment>> {
        match self {
            ScopeRef::Env(e) => Some(e),
            ScopeRef::Stack(_) => None,
        }
    }

    /// Read the slot `bidx` positions below the scope-link slot.
    pub fn get(&self, stack: &[Val], bidx: u16) -> Val {
        match self {
            ScopeRef::Stack(link) => stack[link - bidx as usize].clone(),
            ScopeRef::Env(env) => env.get_back(bidx),
        }
    }

    pub fn set(&self, stack: &mut [Val], bidx: u16, val: Val) {
        match self {
            ScopeRef::Stack(link) => stack[link - bidx as usize] = val,
            ScopeRef::Env(env) => env.set_back(bidx, val),
        }
    }

    /// Content of the scope-link slot itself.
    pub fn link(&self, stack: &[Val]) -> Val {
        match self {
            ScopeRef::Stack(link) => stack[*link].clone(),
            ScopeRef::Env(env) => env.link(),
        }
    }

    pub fn set_link(&self, stack: &mut [Val], val: Val) {
        match self {
            ScopeRef::Stack(link) => stack[*link] = val,
            ScopeRef::Env(env) => env.set_link(val),
        }
    }
}

impl PartialEq for ScopeRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScopeRef::Stack(a), ScopeRef::Stack(b)) => a == b,
            (ScopeRef::Env(a), ScopeRef::Env(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for ScopeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeRef::Stack(i) => write!(f, "stack@{i}"),
            ScopeRef::Env(e) => write!(f, "env@{:p}", Rc::as_ptr(e)),
        }
    }
}

/// One activation record. Frames live in the context's frame arena and are
/// addressed by index; the newest frame is the current one.
pub struct ControlFrame {
    /// Next instruction index. `None` for native and finish frames, which
    /// the execution loop never fetches from.
    pub pc: Option<usize>,
    /// Top of this frame's operand region on the value stack.
    pub sp: usize,
    /// Base of the operand region, just above the scope-link slot.
    pub bp: usize,
    pub iseq: Option<Arc<Iseq>>,
    pub kind: FrameKind,
    pub self_val: Val,
    /// Method-level scope, shared across every block frame nested under the
    /// same method activation.
    pub lfp: ScopeRef,
    /// Innermost scope of this frame, the head of its lexical chain.
    pub dfp: ScopeRef,
    /// Name of the running native method, for diagnostics and return hooks.
    pub native_name: Option<Arc<str>>,
}

impl ControlFrame {
    /// A frame executing real bytecode, as opposed to native and sentinel
    /// frames. Only these participate in catch-table lookups.
    pub fn is_normal(&self) -> bool {
        self.pc.is_some() && self.iseq.is_some()
    }

    /// A frame is method-level when its innermost scope is the method scope
    /// itself, i.e. it was pushed without a lexical parent.
    pub fn is_method_level(&self) -> bool {
        self.lfp == self.dfp
    }
}

impl fmt::Debug for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.iseq.as_ref().map(|i| &*i.name).unwrap_or("<none>");
        write!(
            f,
            "{} {} pc={:?} sp={} bp={} dfp={:?}",
            self.kind.name(),
            name,
            self.pc,
            self.sp,
            self.bp,
            self.dfp,
        )
    }
}
