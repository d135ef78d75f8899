use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::trace;

use crate::val::Val;
use crate::vm::context::ExecContext;
use crate::vm::frame::{FrameKind, ScopeRef};
use crate::vm::proc::Block;

/// A local-variable scope promoted off the value stack. Holds the frame's
/// local region plus its scope-link slot, and keeps the lexical parent alive
/// through `prev`.
pub struct Environment {
    /// `local_count` local slots followed by the scope-link slot.
    buf: RefCell<Vec<Val>>,
    local_count: usize,
    prev: RefCell<Option<Rc<Environment>>>,
    /// Snapshot of the promoted frame, enough to re-enter this scope later
    /// through a binding.
    snapshot: RefCell<Block>,
}

impl Environment {
    pub fn local_count(&self) -> usize {
        self.local_count
    }

    pub fn get_back(&self, bidx: u16) -> Val {
        self.buf.borrow()[self.local_count - bidx as usize].clone()
    }

    pub fn set_back(&self, bidx: u16, val: Val) {
        self.buf.borrow_mut()[self.local_count - bidx as usize] = val;
    }

    pub fn link(&self) -> Val {
        self.buf.borrow()[self.local_count].clone()
    }

    pub fn set_link(&self, val: Val) {
        self.buf.borrow_mut()[self.local_count] = val;
    }

    pub fn prev(&self) -> Option<Rc<Environment>> {
        self.prev.borrow().clone()
    }

    pub(crate) fn snapshot(&self) -> Block {
        self.snapshot.borrow().clone()
    }

    /// Visit every value this environment keeps alive.
    pub fn visit_refs(&self, f: &mut dyn FnMut(&Val)) {
        for v in self.buf.borrow().iter() {
            f(v);
        }
        if let Some(prev) = self.prev.borrow().as_ref() {
            prev.visit_refs(f);
        }
    }
}

/// Promote the scope of the frame at `idx` to the heap, recursively promoting
/// its lexical parents first. Idempotent: an already promoted frame returns
/// its existing environment.
pub(crate) fn make_env(ctx: &mut ExecContext, idx: usize) -> Rc<Environment> {
    let idx = if ctx.frames[idx].kind == FrameKind::Finish {
        if idx == 0 {
            ctx.vm_bug("finish frame with no caller");
        }
        idx - 1
    } else {
        idx
    };
    make_env_each(ctx, idx)
}

fn make_env_each(ctx: &mut ExecContext, idx: usize) -> Rc<Environment> {
    if let ScopeRef::Env(env) = &ctx.frames[idx].dfp {
        return env.clone();
    }
    let ScopeRef::Stack(link) = ctx.frames[idx].dfp else {
        unreachable!()
    };

    // Promote the lexical parent first so the copied link slot already holds
    // a heap reference.
    if !ctx.frames[idx].is_method_level() {
        match ctx.stack[link].clone() {
            Val::Scope(ScopeRef::Env(_)) => {}
            Val::Scope(parent @ ScopeRef::Stack(_)) => {
                let Some(owner) = ctx.frame_owning_scope(&parent) else {
                    ctx.vm_bug("scope link does not match any live frame");
                };
                make_env_each(ctx, owner);
                // The parent's promotion redirected our link slot; adopt its
                // method scope as ours.
                ctx.frames[idx].lfp = ctx.frames[owner].lfp.clone();
            }
            _ => ctx.vm_bug("scope link slot holds a non-scope value"),
        }
    }

    let frame = &ctx.frames[idx];
    let local_count = match &frame.iseq {
        Some(iseq) => iseq.local_count as usize,
        None => 1,
    };
    trace!(
        frame = ?frame,
        local_count,
        "promoting scope to heap"
    );
    let base = link - local_count;
    let buf = ctx.stack[base..=link].to_vec();
    let prev = match &buf[local_count] {
        Val::Scope(ScopeRef::Env(e)) => Some(e.clone()),
        _ => None,
    };
    let env = Rc::new(Environment {
        buf: RefCell::new(buf),
        local_count,
        prev: RefCell::new(prev),
        snapshot: RefCell::new(Block {
            self_val: Val::Nil,
            lfp: ScopeRef::Stack(link),
            dfp: ScopeRef::Stack(link),
            iseq: None,
            proc: None,
        }),
    });
    let heap = ScopeRef::Env(env.clone());

    // Mark the vacated slot so every stale stack reference to this scope can
    // be redirected, then rewrite the live aliases.
    ctx.stack[link] = Val::Scope(heap.clone());
    ctx.rewrite_scope_refs(link, &heap);

    let frame = &ctx.frames[idx];
    *env.snapshot.borrow_mut() = Block {
        self_val: frame.self_val.clone(),
        lfp: frame.lfp.clone(),
        dfp: heap,
        iseq: if frame.is_normal() { frame.iseq.clone() } else { None },
        proc: None,
    };
    env
}

/// A reified scope chain, created from a live frame and usable after that
/// frame has returned.
pub struct Binding {
    pub(crate) env: Rc<Environment>,
}

impl Binding {
    /// Names of every local visible through this binding, innermost first.
    pub fn local_variables(&self) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = Vec::new();
        let mut env = Some(self.env.clone());
        while let Some(e) = env {
            if let Some(iseq) = &e.snapshot.borrow().iseq {
                for name in &iseq.locals {
                    if !names.iter().any(|n| Arc::ptr_eq(n, name) || n == name) {
                        names.push(name.clone());
                    }
                }
            }
            env = e.prev();
        }
        names
    }

    pub fn get(&self, name: &str) -> Option<Val> {
        self.slot(name).map(|(env, bidx)| env.get_back(bidx))
    }

    /// Returns false when no scope in the chain declares `name`.
    pub fn set(&self, name: &str, val: Val) -> bool {
        match self.slot(name) {
            Some((env, bidx)) => {
                env.set_back(bidx, val);
                true
            }
            None => false,
        }
    }

    fn slot(&self, name: &str) -> Option<(Rc<Environment>, u16)> {
        let mut env = Some(self.env.clone());
        while let Some(e) = env {
            let snap = e.snapshot.borrow();
            if let Some(iseq) = &snap.iseq {
                if let Some(j) = iseq.locals.iter().position(|n| &**n == name) {
                    let bidx = iseq.local_bidx(j);
                    drop(snap);
                    return Some((e, bidx));
                }
            }
            drop(snap);
            env = e.prev();
        }
        None
    }
}
