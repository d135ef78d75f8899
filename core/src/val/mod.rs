use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::iseq::Iseq;
use crate::vm::frame::ScopeRef;
use crate::vm::proc::{BlockRef, ProcObject};
use crate::vm::unwind::UnwindSignal;

static SYMBOLS: Lazy<Mutex<FxHashMap<String, Arc<str>>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// Intern a name so repeated lookups share one allocation.
pub fn intern(name: &str) -> Arc<str> {
    let mut table = SYMBOLS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(s) = table.get(name) {
        return s.clone();
    }
    let s: Arc<str> = Arc::from(name);
    table.insert(name.to_string(), s.clone());
    s
}

/// A runtime value. The last three variants are engine-internal: they only
/// ever live in reserved stack slots (block register, scope link, pending
/// unwind handed to an ensure body) and are never produced by user bytecode.
#[derive(Clone)]
pub enum Val {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Sym(Arc<str>),
    Array(Rc<RefCell<Vec<Val>>>),
    Proc(Rc<ProcObject>),
    Error(Rc<ErrorValue>),
    Iseq(Arc<Iseq>),
    Block(BlockRef),
    Scope(ScopeRef),
    Throw(Rc<UnwindSignal>),
}

impl Val {
    pub fn str(s: &str) -> Self {
        Val::Str(intern(s))
    }

    pub fn sym(s: &str) -> Self {
        Val::Sym(intern(s))
    }

    pub fn array(items: Vec<Val>) -> Self {
        Val::Array(Rc::new(RefCell::new(items)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Val::Nil)
    }

    /// Only nil and false are falsy.
    pub fn truthy(&self) -> bool {
        !matches!(self, Val::Nil | Val::Bool(false))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Val::Nil => "nil",
            Val::Bool(_) => "bool",
            Val::Int(_) => "int",
            Val::Float(_) => "float",
            Val::Str(_) => "string",
            Val::Sym(_) => "symbol",
            Val::Array(_) => "array",
            Val::Proc(_) => "proc",
            Val::Error(_) => "error",
            Val::Iseq(_) => "iseq",
            Val::Block(_) => "block",
            Val::Scope(_) => "scope",
            Val::Throw(_) => "throw",
        }
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Val::Nil, Val::Nil) => true,
            (Val::Bool(a), Val::Bool(b)) => a == b,
            (Val::Int(a), Val::Int(b)) => a == b,
            (Val::Float(a), Val::Float(b)) => a == b,
            (Val::Str(a), Val::Str(b)) => a == b,
            (Val::Sym(a), Val::Sym(b)) => Arc::ptr_eq(a, b) || a == b,
            (Val::Array(a), Val::Array(b)) => {
                Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow()
            }
            (Val::Proc(a), Val::Proc(b)) => Rc::ptr_eq(a, b),
            (Val::Error(a), Val::Error(b)) => Rc::ptr_eq(a, b),
            (Val::Iseq(a), Val::Iseq(b)) => Arc::ptr_eq(a, b),
            (Val::Block(a), Val::Block(b)) => Rc::ptr_eq(a, b),
            (Val::Scope(a), Val::Scope(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Nil => write!(f, "nil"),
            Val::Bool(b) => write!(f, "{b}"),
            Val::Int(i) => write!(f, "{i}"),
            Val::Float(x) => write!(f, "{x}"),
            Val::Str(s) => write!(f, "{s}"),
            Val::Sym(s) => write!(f, ":{s}"),
            Val::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Val::Proc(p) => {
                if p.is_lambda {
                    write!(f, "#<Proc (lambda)>")
                } else {
                    write!(f, "#<Proc>")
                }
            }
            Val::Error(e) => write!(f, "#<{}: {}>", e.name, e.message),
            Val::Iseq(iseq) => write!(f, "#<Iseq {}>", iseq.name),
            Val::Block(_) => write!(f, "#<Block>"),
            Val::Scope(_) => write!(f, "#<Scope>"),
            Val::Throw(_) => write!(f, "#<Throw>"),
        }
    }
}

impl fmt::Debug for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Val::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other}"),
        }
    }
}

/// An exception-like value raised inside the VM. `exit_value` and `reason`
/// are only meaningful for jump errors (`break`/`return` escaping their
/// defining scope) and mirror the payload the jump carried.
#[derive(Debug)]
pub struct ErrorValue {
    pub name: Arc<str>,
    pub message: String,
    pub exit_value: Val,
    pub reason: Option<&'static str>,
}

impl ErrorValue {
    pub fn new(name: &str, message: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            name: intern(name),
            message: message.into(),
            exit_value: Val::Nil,
            reason: None,
        })
    }

    pub fn local_jump(
        message: impl Into<String>,
        exit_value: Val,
        reason: &'static str,
    ) -> Rc<Self> {
        Rc::new(Self {
            name: intern("LocalJumpError"),
            message: message.into(),
            exit_value,
            reason: Some(reason),
        })
    }

    pub fn argument(message: impl Into<String>) -> Rc<Self> {
        Self::new("ArgumentError", message)
    }

    pub fn type_err(message: impl Into<String>) -> Rc<Self> {
        Self::new("TypeError", message)
    }

    pub fn runtime(message: impl Into<String>) -> Rc<Self> {
        Self::new("RuntimeError", message)
    }
}

/// A non-local jump that escaped every live frame and reached native code.
#[derive(Debug)]
pub struct JumpError {
    pub reason: &'static str,
    pub message: String,
}

impl JumpError {
    pub(crate) fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for JumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JumpError {}

/// A raised error that no rescue clause caught before the native boundary.
#[derive(Debug)]
pub struct UncaughtError {
    pub name: String,
    pub message: String,
}

impl fmt::Display for UncaughtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for UncaughtError {}
