use std::rc::Rc;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::debug;

use crate::iseq::{Iseq, IseqKind};
use crate::val::{ErrorValue, Val};
use crate::vm::context::ExecContext;
use crate::vm::dispatch::bind_args;
use crate::vm::env::{Binding, make_env};
use crate::vm::frame::FrameKind;
use crate::vm::guards::SafeLevelGuard;
use crate::vm::proc::{Block, BlockRef, ProcObject, make_proc_from_block};
use crate::vm::unwind::{UnwindSignal, boundary_error, vm_exec};

/// Push the sentinel frame marking a native re-entry. The caller's passed
/// block, if any, is carried in the sentinel's link slot so environment
/// promotion across the boundary stays well formed.
pub(crate) fn set_finish_frame(ctx: &mut ExecContext) {
    let sp = ctx.top_sp();
    let specval = if ctx.frame_depth() == 0 {
        Val::Nil
    } else {
        ctx.cfp().lfp.link(&ctx.stack)
    };
    ctx.push_frame(None, FrameKind::Finish, Val::Nil, specval, None, None, sp, 1);
}

/// Invoke block code from native context: sentinel, argument binding, block
/// frame, then the execution loop until that frame finishes.
pub(crate) fn invoke_block(
    ctx: &mut ExecContext,
    blk: &Block,
    self_val: Val,
    args: Vec<Val>,
    lambda: bool,
    block_arg: Option<BlockRef>,
) -> Result<Val, UnwindSignal> {
    let Some(iseq) = blk.iseq.clone() else {
        return Ok(Val::Nil);
    };
    set_finish_frame(ctx);
    let block_val = block_arg.map(|b| Val::Proc(make_proc_from_block(ctx, &b)));

    let (bound, entry_pc) = match bind_args(&iseq, args, lambda, block_val) {
        Ok(ok) => ok,
        Err(e) => {
            // The frame that would consume the sentinel never runs.
            ctx.pop_frame();
            return Err(UnwindSignal::raise(e));
        }
    };
    let base = ctx.top_sp();
    let local_count = iseq.local_count as usize;
    if base + local_count + 1 + iseq.stack_max as usize > ctx.stack.len() {
        ctx.vm_bug("value stack overflow");
    }
    let n = bound.len();
    for (i, v) in bound.into_iter().enumerate() {
        ctx.stack[base + i] = v;
    }
    let kind = if lambda { FrameKind::Lambda } else { FrameKind::Block };
    ctx.push_frame(
        Some(iseq),
        kind,
        self_val,
        Val::Scope(blk.dfp.clone()),
        Some(blk.lfp.clone()),
        Some(entry_pc),
        base + n,
        local_count - n,
    );
    vm_exec(ctx)
}

/// `yield`: invoke the block passed to the current method scope.
pub(crate) fn yield_block(ctx: &mut ExecContext, args: Vec<Val>) -> Result<Val, UnwindSignal> {
    let block = match ctx.cfp().lfp.link(&ctx.stack) {
        Val::Block(b) => b,
        _ => {
            return Err(UnwindSignal::raise(ErrorValue::local_jump(
                "no block given",
                Val::Nil,
                "noreason",
            )));
        }
    };
    let blk = block.borrow().clone();
    let lambda = blk.is_lambda();
    let self_val = blk.self_val.clone();
    invoke_block(ctx, &blk, self_val, args, lambda, None)
}

/// Invoke a materialized proc. Runs under the proc's captured safe level,
/// restored on both normal return and unwind.
pub(crate) fn invoke_proc(
    ctx: &mut ExecContext,
    proc: &Rc<ProcObject>,
    args: Vec<Val>,
    block_arg: Option<BlockRef>,
) -> Result<Val, UnwindSignal> {
    let _guard = SafeLevelGuard::enter(ctx, proc.safe_level);
    let self_val = proc.block.self_val.clone();
    invoke_block(ctx, &proc.block, self_val, args, proc.is_lambda, block_arg)
}

impl ExecContext {
    /// Evaluate a top-level instruction sequence to its result value.
    pub fn eval(&mut self, iseq: &Arc<Iseq>) -> Result<Val> {
        self.eval_with_self(iseq, Val::Nil)
    }

    pub fn eval_with_self(&mut self, iseq: &Arc<Iseq>, self_val: Val) -> Result<Val> {
        if iseq.kind != IseqKind::Top {
            bail!("not a top-level instruction sequence: {}", iseq.name);
        }
        debug!(name = &*iseq.name, "evaluating top-level iseq");
        set_finish_frame(self);
        let sp = self.top_sp();
        self.push_frame(
            Some(iseq.clone()),
            FrameKind::Top,
            self_val,
            Val::Nil,
            None,
            Some(0),
            sp,
            iseq.local_count as usize,
        );
        vm_exec(self).map_err(boundary_error)
    }

    /// Call a proc from native code.
    pub fn call_proc(&mut self, proc: &Rc<ProcObject>, args: Vec<Val>) -> Result<Val> {
        invoke_proc(self, proc, args, None).map_err(boundary_error)
    }

    /// Call a proc, passing another proc as its block argument.
    pub fn call_proc_with_block(
        &mut self,
        proc: &Rc<ProcObject>,
        args: Vec<Val>,
        block: &Rc<ProcObject>,
    ) -> Result<Val> {
        let block_ref = block_of_proc(block);
        invoke_proc(self, proc, args, Some(block_ref)).map_err(boundary_error)
    }

    /// Capture the nearest bytecode frame's scope chain as a binding. The
    /// chain is promoted to the heap and stays usable after the frame
    /// returns. `None` when no bytecode frame is live.
    pub fn make_binding(&mut self) -> Option<Binding> {
        let idx = self.nearest_iseq_frame(self.frame_depth().checked_sub(1)?)?;
        let env = make_env(self, idx);
        Some(Binding { env })
    }

    /// Evaluate an eval-kind iseq inside the scopes a binding captured.
    pub fn eval_binding(&mut self, binding: &Binding, iseq: &Arc<Iseq>) -> Result<Val> {
        if iseq.kind != IseqKind::Eval {
            bail!("not an eval instruction sequence: {}", iseq.name);
        }
        let snap = binding.env.snapshot();
        set_finish_frame(self);
        let sp = self.top_sp();
        self.push_frame(
            Some(iseq.clone()),
            FrameKind::Eval,
            snap.self_val,
            Val::Scope(snap.dfp),
            Some(snap.lfp),
            Some(0),
            sp,
            iseq.local_count as usize,
        );
        vm_exec(self).map_err(boundary_error)
    }
}

/// View a proc as a block descriptor again, keeping the materialization
/// cache pointed at the proc itself.
pub(crate) fn block_of_proc(proc: &Rc<ProcObject>) -> BlockRef {
    let mut blk = proc.block.clone();
    blk.proc = Some(proc.clone());
    Rc::new(std::cell::RefCell::new(blk))
}
