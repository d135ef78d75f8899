use std::sync::{Arc, Weak};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

use crate::insn::Insn;
use crate::val::{Val, intern};

/// Where an iseq sits in the program structure. Frames pushed for it carry
/// a matching frame kind; the unwind machinery keys some decisions on it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IseqKind {
    Top,
    Method,
    Block,
    Class,
    Eval,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatchKind {
    Rescue,
    Ensure,
    Retry,
    Break,
    Next,
    Redo,
}

/// One catch-table row. `start`/`end` delimit the covered instruction range
/// as a half-open interval `[start, end)`. `Rescue` and `Ensure` rows carry a
/// handler iseq to splice in; the jump rows only redirect the faulting frame
/// to `cont` with its operand stack cut back to `sp` slots above the base.
#[derive(Clone, Debug)]
pub struct CatchEntry {
    pub kind: CatchKind,
    pub start: u32,
    pub end: u32,
    pub iseq: Option<Arc<Iseq>>,
    pub cont: u32,
    pub sp: u32,
}

impl CatchEntry {
    /// `epc` is the instruction index one past the faulting instruction, so
    /// a fault at `start` itself is covered and one at `end` is not.
    pub fn covers(&self, epc: usize) -> bool {
        (self.start as usize) < epc && epc <= self.end as usize
    }
}

/// Parameter shape. Slots are bound in declaration order: required args,
/// then optionals, then the rest array, then the block argument.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Params {
    #[serde(default)]
    pub required: u16,
    /// Entry points for optional defaults. When non-empty it holds
    /// `optional_count + 1` pcs; binding `k` optionals starts at entry `k`.
    #[serde(default)]
    pub opt_entries: Vec<u32>,
    #[serde(default)]
    pub rest: bool,
    #[serde(default)]
    pub block: bool,
}

impl Params {
    pub fn optional_count(&self) -> usize {
        self.opt_entries.len().saturating_sub(1)
    }

    /// Local slots consumed by bound arguments.
    pub fn slot_count(&self) -> usize {
        self.required as usize
            + self.optional_count()
            + self.rest as usize
            + self.block as usize
    }
}

/// A compiled instruction sequence. Immutable once built; shared via `Arc`
/// between frames, closures and constant pools.
#[derive(Debug)]
pub struct Iseq {
    pub name: Arc<str>,
    pub kind: IseqKind,
    /// Local slots a frame of this iseq allocates, user locals plus the one
    /// reserved slot for special variables. The scope-link slot is extra.
    pub local_count: u16,
    pub locals: Vec<Arc<str>>,
    pub params: Params,
    pub stack_max: u16,
    pub code: Vec<Insn>,
    pub consts: Vec<Val>,
    pub catch_table: Vec<CatchEntry>,
    /// Lexically enclosing iseq. Weak so the child pool entry does not keep
    /// a reference cycle with its parent; gone once the parent is dropped.
    parent: Option<Weak<Iseq>>,
    /// Source line per instruction, empty when unknown.
    pub lines: Vec<u32>,
}

/// Bottom slot of every local region, reserved for special variables.
pub const SVAR_BIDX: u16 = 1;

impl Iseq {
    pub fn new(
        name: &str,
        kind: IseqKind,
        locals: Vec<&str>,
        params: Params,
        code: Vec<Insn>,
        consts: Vec<Val>,
        catch_table: Vec<CatchEntry>,
    ) -> Arc<Self> {
        let local_count = locals.len() as u16 + 1;
        Arc::new(Self {
            name: intern(name),
            kind,
            local_count,
            locals: locals.into_iter().map(intern).collect(),
            params,
            stack_max: 16,
            code,
            consts,
            catch_table,
            parent: None,
            lines: Vec::new(),
        })
    }

    pub fn parent(&self) -> Option<Arc<Iseq>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Back-index of the declared local at position `j`. Slot 0 of the
    /// declaration order sits deepest in the frame's local region.
    pub fn local_bidx(&self, j: usize) -> u16 {
        debug_assert!(j < self.locals.len());
        self.local_count - j as u16
    }

    pub fn line_for(&self, pc: usize) -> Option<u32> {
        self.lines.get(pc).copied()
    }
}

/// Serializable form of an iseq, as produced by a compiler front end or
/// written by hand in JSON. Lowered into the runtime form by [`Iseq::from_def`].
#[derive(Debug, Serialize, Deserialize)]
pub struct IseqDef {
    pub name: String,
    pub kind: IseqKind,
    #[serde(default)]
    pub locals: Vec<String>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub stack_max: Option<u16>,
    pub code: Vec<Insn>,
    #[serde(default)]
    pub consts: Vec<ConstDef>,
    #[serde(default)]
    pub catch_table: Vec<CatchEntryDef>,
    #[serde(default)]
    pub lines: Vec<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstDef {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Sym(String),
    Iseq(Box<IseqDef>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CatchEntryDef {
    pub kind: CatchKind,
    pub start: u32,
    pub end: u32,
    #[serde(default)]
    pub iseq: Option<Box<IseqDef>>,
    pub cont: u32,
    #[serde(default)]
    pub sp: u32,
}

impl Iseq {
    /// Lower a definition into the runtime form, recursively lowering nested
    /// iseqs in the constant pool and catch table. Nested sequences get a
    /// `parent` link back to the enclosing one.
    pub fn from_def(def: &IseqDef) -> Result<Arc<Self>> {
        Self::lower(def, None)
    }

    fn lower(def: &IseqDef, parent: Option<Weak<Iseq>>) -> Result<Arc<Self>> {
        ensure!(
            def.params.slot_count() <= def.locals.len(),
            "iseq {}: {} parameter slots but only {} locals",
            def.name,
            def.params.slot_count(),
            def.locals.len()
        );

        let mut child_err = None;
        let iseq = Arc::new_cyclic(|weak: &Weak<Iseq>| {
            let mut consts = Vec::with_capacity(def.consts.len());
            let mut catch_table = Vec::with_capacity(def.catch_table.len());
            let mut push_err = |e: anyhow::Error| {
                if child_err.is_none() {
                    child_err = Some(e.context(format!("in iseq {}", def.name)));
                }
            };

            for c in &def.consts {
                match c {
                    ConstDef::Nil => consts.push(Val::Nil),
                    ConstDef::Bool(b) => consts.push(Val::Bool(*b)),
                    ConstDef::Int(i) => consts.push(Val::Int(*i)),
                    ConstDef::Float(x) => consts.push(Val::Float(*x)),
                    ConstDef::Str(s) => consts.push(Val::str(s)),
                    ConstDef::Sym(s) => consts.push(Val::sym(s)),
                    ConstDef::Iseq(child) => match Self::lower(child, Some(weak.clone())) {
                        Ok(c) => consts.push(Val::Iseq(c)),
                        Err(e) => push_err(e),
                    },
                }
            }

            for e in &def.catch_table {
                let handler = match &e.iseq {
                    Some(h) => match Self::lower(h, Some(weak.clone())) {
                        Ok(h) => Some(h),
                        Err(err) => {
                            push_err(err);
                            None
                        }
                    },
                    None => None,
                };
                catch_table.push(CatchEntry {
                    kind: e.kind,
                    start: e.start,
                    end: e.end,
                    iseq: handler,
                    cont: e.cont,
                    sp: e.sp,
                });
            }

            Self {
                name: intern(&def.name),
                kind: def.kind,
                local_count: def.locals.len() as u16 + 1,
                locals: def.locals.iter().map(|s| intern(s)).collect(),
                params: def.params.clone(),
                stack_max: def.stack_max.unwrap_or(16),
                code: def.code.clone(),
                consts,
                catch_table,
                parent,
                lines: def.lines.clone(),
            }
        });
        if let Some(e) = child_err {
            return Err(e);
        }
        validate(&iseq, def).with_context(|| format!("in iseq {}", def.name))?;
        Ok(iseq)
    }
}

fn validate(iseq: &Iseq, def: &IseqDef) -> Result<()> {
    let len = iseq.code.len();
    for (e, d) in iseq.catch_table.iter().zip(&def.catch_table) {
        ensure!(
            e.start <= e.end && e.end as usize <= len,
            "catch range {}..{} out of bounds",
            e.start,
            e.end
        );
        if matches!(e.kind, CatchKind::Rescue | CatchKind::Ensure) && d.iseq.is_none() {
            bail!("{:?} catch entry needs a handler iseq", e.kind);
        }
    }
    for (pc, insn) in iseq.code.iter().enumerate() {
        match *insn {
            Insn::Jump(dst) | Insn::BranchUnless(dst) => {
                ensure!((dst as usize) < len, "pc {pc}: jump target {dst} out of range");
            }
            Insn::PushConst(k) => {
                ensure!((k as usize) < iseq.consts.len(), "pc {pc}: const {k} out of range");
            }
            Insn::Send { iseq: k, block, .. } => {
                check_iseq_const(iseq, pc, k)?;
                if let Some(b) = block {
                    check_iseq_const(iseq, pc, b)?;
                }
            }
            Insn::NewProc { iseq: k, .. } => check_iseq_const(iseq, pc, k)?,
            _ => {}
        }
    }
    Ok(())
}

fn check_iseq_const(iseq: &Iseq, pc: usize, k: u16) -> Result<()> {
    match iseq.consts.get(k as usize) {
        Some(Val::Iseq(_)) => Ok(()),
        Some(other) => bail!("pc {pc}: const {k} is {}, not an iseq", other.type_name()),
        None => bail!("pc {pc}: const {k} out of range"),
    }
}
