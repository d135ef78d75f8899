use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use crate::iseq::Iseq;
use crate::val::Val;
use crate::vm::context::ExecContext;
use crate::vm::env::{Environment, make_env};
use crate::vm::frame::ScopeRef;

pub type BlockRef = Rc<RefCell<Block>>;

/// A block descriptor: the code of a block literal together with the frame
/// state it closes over. Lives on the value stack (in a frame's scope-link
/// slot) while the block is merely passed, and inside a [`ProcObject`] once
/// materialized.
#[derive(Clone)]
pub struct Block {
    pub self_val: Val,
    pub lfp: ScopeRef,
    pub dfp: ScopeRef,
    /// `None` for synthetic blocks such as environment snapshots.
    pub iseq: Option<Arc<Iseq>>,
    /// The proc this block was materialized into, if any. At most one proc
    /// is ever created per block.
    pub proc: Option<Rc<ProcObject>>,
}

impl Block {
    pub fn new(self_val: Val, lfp: ScopeRef, dfp: ScopeRef, iseq: Arc<Iseq>) -> BlockRef {
        Rc::new(RefCell::new(Block {
            self_val,
            lfp,
            dfp,
            iseq: Some(iseq),
            proc: None,
        }))
    }

    pub fn is_lambda(&self) -> bool {
        self.proc.as_ref().is_some_and(|p| p.is_lambda)
    }
}

/// A first-class closure. Owns the heap environment of its defining scope,
/// so invoking it remains valid after the defining frames have returned.
pub struct ProcObject {
    pub block: Block,
    pub envval: Rc<Environment>,
    pub is_lambda: bool,
    pub safe_level: u8,
}

impl ProcObject {
    /// Visit every value this proc keeps alive: the captured receiver and
    /// the promoted scope chain it owns.
    pub fn visit_refs(&self, f: &mut dyn FnMut(&Val)) {
        f(&self.block.self_val);
        self.envval.visit_refs(f);
        if let ScopeRef::Env(env) = &self.block.lfp {
            if !Rc::ptr_eq(env, &self.envval) {
                env.visit_refs(f);
            }
        }
    }
}

/// Materialize `block` into a proc, reusing the cached one if it already
/// was. This is the entry point for handing a passed block to user code.
pub(crate) fn make_proc_from_block(ctx: &mut ExecContext, block: &BlockRef) -> Rc<ProcObject> {
    if let Some(p) = block.borrow().proc.clone() {
        return p;
    }
    make_proc(ctx, block, false)
}

/// Materialize `block` into a fresh proc. The defining scope chain is
/// promoted to the heap, and any block the owning frame itself received is
/// materialized first so the captured chain never references stack state.
pub(crate) fn make_proc(ctx: &mut ExecContext, block: &BlockRef, is_lambda: bool) -> Rc<ProcObject> {
    if block.borrow().proc.is_some() {
        ctx.vm_bug("proc already materialized for this block");
    }

    let dfp = ctx.normalize_scope(block.borrow().dfp.clone());
    let env = match ctx.frame_owning_scope(&dfp) {
        Some(owner) => {
            let passed = match ctx.frames[owner].lfp.link(&ctx.stack) {
                Val::Block(inner) => Some(inner),
                _ => None,
            };
            if let Some(inner) = passed {
                if !Rc::ptr_eq(&inner, block) {
                    make_proc_from_block(ctx, &inner);
                }
            }
            make_env(ctx, owner)
        }
        None => match &dfp {
            // The defining frame already returned; its scope must have been
            // promoted when this block's proc chain was captured.
            ScopeRef::Env(e) => e.clone(),
            ScopeRef::Stack(_) => ctx.vm_bug("block scope is not on any live frame"),
        },
    };

    let mut b = block.borrow_mut();
    b.dfp = ctx.normalize_scope(b.dfp.clone());
    b.lfp = ctx.normalize_scope(b.lfp.clone());
    debug_assert!(b.dfp.is_heap());
    trace!(lambda = is_lambda, "materialized proc");

    let proc = Rc::new(ProcObject {
        block: Block {
            proc: None,
            ..b.clone()
        },
        envval: env,
        is_lambda,
        safe_level: ctx.safe_level(),
    });
    b.proc = Some(proc.clone());
    proc
}
