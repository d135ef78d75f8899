use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::insn::ThrowKind;
use crate::iseq::{CatchEntry, CatchKind};
use crate::val::{ErrorValue, JumpError, UncaughtError, Val};
use crate::vm::context::ExecContext;
use crate::vm::dispatch::{CoreEvent, run_core};
use crate::vm::frame::{ControlFrame, FrameKind, ScopeRef};
use crate::vm::hooks::{TraceEvent, TraceEventKind};

/// The kind of transfer an in-flight unwind performs.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TagKind {
    Return,
    Break,
    Next,
    Redo,
    Retry,
    Raise,
    Fatal,
}

/// An unwind in flight. Travels up the frame stack inside the execution
/// loop and across native re-entries as an `Err` value; never a panic.
#[derive(Clone)]
pub struct UnwindSignal {
    pub kind: TagKind,
    pub payload: Val,
    /// Scope of the frame this transfer targets, for `return` and `break`.
    /// `None` means the target is found by catch-table search alone.
    pub catch_point: Option<ScopeRef>,
    /// Ensure entries already run on this pass, as (frame index, table
    /// index) pairs. Keeps reclassified unwinds from running one twice.
    spliced: Vec<(usize, usize)>,
}

impl UnwindSignal {
    pub(crate) fn new(kind: TagKind, payload: Val, catch_point: Option<ScopeRef>) -> Self {
        Self {
            kind,
            payload,
            catch_point,
            spliced: Vec::new(),
        }
    }

    pub(crate) fn raise(err: Rc<ErrorValue>) -> Self {
        Self::new(TagKind::Raise, Val::Error(err), None)
    }
}

impl fmt::Debug for UnwindSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}({:?}) -> {:?}",
            self.kind, self.payload, self.catch_point
        )
    }
}

/// Execution-loop states. `Running` executes bytecode until it finishes or
/// signals; `Unwinding` walks one frame of the unwind per step;
/// `HandlerDispatch` splices a rescue or ensure handler in.
enum VmState {
    Running,
    Unwinding(UnwindSignal),
    HandlerDispatch {
        sig: UnwindSignal,
        entry_idx: usize,
    },
    Finished(Val),
}

/// Run bytecode starting at the newest frame until the activation that
/// entered here finishes. An unwind no frame of this activation handles is
/// returned as `Err` for the native caller to propagate or translate.
pub(crate) fn vm_exec(ctx: &mut ExecContext) -> Result<Val, UnwindSignal> {
    let mut state = VmState::Running;
    loop {
        state = match state {
            VmState::Running => match run_core(ctx) {
                CoreEvent::Finished(val) => VmState::Finished(val),
                CoreEvent::Signal(sig) => VmState::Unwinding(sig),
            },
            VmState::Unwinding(sig) => step_unwind(ctx, sig)?,
            VmState::HandlerDispatch { sig, entry_idx } => {
                enter_handler(ctx, sig, entry_idx);
                VmState::Running
            }
            VmState::Finished(val) => return Ok(val),
        };
    }
}

/// Process the unwind at the current frame: stop it here, splice a handler,
/// or pop the frame and keep going. Reaching this activation's sentinel
/// hands the signal to the native caller.
fn step_unwind(ctx: &mut ExecContext, mut sig: UnwindSignal) -> Result<VmState, UnwindSignal> {
    // Frames without a live pc cannot handle anything; pop them with their
    // exit hooks. The sentinel ends this activation's part of the unwind.
    loop {
        let frame = ctx.cfp();
        if frame.is_normal() {
            break;
        }
        if frame.kind == FrameKind::Finish {
            ctx.pop_frame();
            return Err(sig);
        }
        let frame = ctx.pop_frame();
        fire_exit_hook(ctx, &frame);
        if ctx.frames.is_empty() {
            ctx.vm_bug("unwind escaped every frame");
        }
    }

    trace!(sig = ?sig, frame = ?ctx.cfp(), "unwinding");
    let frame_idx = ctx.frames.len() - 1;
    let cfp_dfp = ctx.cfp().dfp.clone();
    let cp_here = sig
        .catch_point
        .as_ref()
        .is_some_and(|cp| ctx.normalize_scope(cp.clone()) == cfp_dfp);

    if cp_here && sig.kind == TagKind::Break {
        // The frame that pushed the broken-out-of block: resume it with the
        // break value as the pending call result.
        let sp = ctx.cfp().sp;
        ctx.stack[sp] = sig.payload;
        ctx.cfp_mut().sp = sp + 1;
        return Ok(VmState::Running);
    }

    let mut outermost_return = false;
    if cp_here && sig.kind == TagKind::Return {
        if is_outermost_return(ctx) {
            outermost_return = true;
        } else {
            // The returning frame was entered from bytecode, not from a
            // native re-entry: its caller resumes with the value, which is
            // exactly a break targeting the caller.
            let caller_dfp = ctx.frames[frame_idx - 1].dfp.clone();
            debug!("reclassifying return into break targeting the caller");
            sig.kind = TagKind::Break;
            sig.catch_point = Some(caller_dfp);
        }
    }

    // Catch-table scan. Ensure entries are eligible for every kind; what
    // else is depends on the transfer.
    let want = match sig.kind {
        TagKind::Raise => Some(CatchKind::Rescue),
        TagKind::Retry => Some(CatchKind::Retry),
        TagKind::Next => Some(CatchKind::Next),
        TagKind::Redo => Some(CatchKind::Redo),
        TagKind::Break if sig.catch_point.is_none() => Some(CatchKind::Break),
        _ => None,
    };
    let epc = match ctx.cfp().pc {
        Some(pc) => pc,
        None => ctx.vm_bug("unwinding a frame without a pc"),
    };
    let iseq = ctx.cfp().iseq.clone().unwrap_or_else(|| ctx.vm_bug("unwinding a frame without an iseq"));
    let spliced_here: Vec<usize> = sig
        .spliced
        .iter()
        .filter(|(f, _)| *f == frame_idx)
        .map(|(_, e)| *e)
        .collect();
    let retry_cp_here = sig.kind == TagKind::Retry && cp_here;

    match find_handler(&iseq.catch_table, epc, want, retry_cp_here, &spliced_here) {
        Some(Handler::Enter(entry_idx, _)) => {
            return Ok(VmState::HandlerDispatch { sig, entry_idx });
        }
        Some(Handler::Restart(_, entry)) => {
            let frame = ctx.cfp_mut();
            frame.pc = Some(entry.cont as usize);
            if entry.kind != CatchKind::Retry {
                frame.sp = frame.bp + entry.sp as usize;
            }
            if entry.kind == CatchKind::Break {
                let sp = frame.sp;
                frame.sp += 1;
                ctx.stack[sp] = sig.payload;
            }
            return Ok(VmState::Running);
        }
        None => {}
    }

    if outermost_return {
        // The value crosses back into native code; its frame and the
        // sentinel both end here.
        let val = sig.payload;
        ctx.pop_frame();
        let sentinel = ctx.pop_frame();
        debug_assert_eq!(sentinel.kind, FrameKind::Finish);
        return Ok(VmState::Finished(val));
    }

    // Nothing in this frame handles the transfer: pop and keep unwinding.
    let frame = ctx.pop_frame();
    fire_exit_hook(ctx, &frame);
    if ctx.frames.is_empty() {
        ctx.vm_bug("unwind escaped every frame");
    }
    Ok(VmState::Unwinding(sig))
}

/// A `return` is outermost when the frame below the returning one is this
/// activation's sentinel, i.e. the method was entered directly from native
/// code rather than from bytecode.
pub(crate) fn is_outermost_return(ctx: &ExecContext) -> bool {
    let n = ctx.frames.len();
    n >= 2 && caller_is_sentinel(&ctx.frames[n - 2])
}

pub(crate) fn caller_is_sentinel(caller: &ControlFrame) -> bool {
    caller.kind == FrameKind::Finish
}

pub(crate) enum Handler<'a> {
    /// Push the entry's handler iseq over the faulting frame.
    Enter(usize, &'a CatchEntry),
    /// Redirect the faulting frame itself and resume it.
    Restart(usize, &'a CatchEntry),
}

/// Scan a catch table for the first entry covering `epc` that can take the
/// transfer. Ensure entries are always eligible unless already run on this
/// pass; `want` names the one other eligible kind, with retry entries
/// additionally requiring the catch point to be this very frame.
pub(crate) fn find_handler<'a>(
    table: &'a [CatchEntry],
    epc: usize,
    want: Option<CatchKind>,
    retry_cp_here: bool,
    spliced: &[usize],
) -> Option<Handler<'a>> {
    for (i, entry) in table.iter().enumerate() {
        if !entry.covers(epc) {
            continue;
        }
        if entry.kind == CatchKind::Ensure {
            if !spliced.contains(&i) {
                return Some(Handler::Enter(i, entry));
            }
            continue;
        }
        if want != Some(entry.kind) {
            continue;
        }
        match entry.kind {
            CatchKind::Rescue => return Some(Handler::Enter(i, entry)),
            CatchKind::Retry => {
                if retry_cp_here {
                    return Some(Handler::Restart(i, entry));
                }
            }
            CatchKind::Break | CatchKind::Next | CatchKind::Redo => {
                return Some(Handler::Restart(i, entry));
            }
            CatchKind::Ensure => unreachable!(),
        }
    }
    None
}

/// Splice a rescue or ensure handler over the faulting frame. The frame is
/// redirected to the entry's continuation first, so anything escaping the
/// handler propagates past this entry instead of re-entering it. The handler
/// runs as a block frame in the faulting frame's scope, with the pending
/// error (for rescue bodies) or the reified signal (for ensure bodies) bound
/// to its first local.
fn enter_handler(ctx: &mut ExecContext, mut sig: UnwindSignal, entry_idx: usize) {
    let frame_idx = ctx.frames.len() - 1;
    let (handler, cont, sp_off, is_ensure) = {
        let iseq = ctx.cfp().iseq.as_ref().unwrap_or_else(|| ctx.vm_bug("handler dispatch without an iseq"));
        let entry = &iseq.catch_table[entry_idx];
        let handler = entry
            .iseq
            .clone()
            .unwrap_or_else(|| ctx.vm_bug("catch entry has no handler iseq"));
        (
            handler,
            entry.cont as usize,
            entry.sp as usize,
            entry.kind == CatchKind::Ensure,
        )
    };
    debug!(handler = &*handler.name, is_ensure, "entering handler");

    let (self_val, lfp, dfp, base) = {
        let frame = ctx.cfp_mut();
        frame.pc = Some(cont);
        frame.sp = frame.bp + sp_off;
        (
            frame.self_val.clone(),
            frame.lfp.clone(),
            frame.dfp.clone(),
            frame.sp,
        )
    };

    if is_ensure {
        sig.spliced.push((frame_idx, entry_idx));
    }
    // Rescue bodies get the raised error itself. Ensure bodies always get
    // the reified signal, so a rethrow resumes the transfer with its kind
    // and its record of already-run entries intact.
    let err_val = if is_ensure {
        Val::Throw(Rc::new(sig))
    } else {
        sig.payload
    };

    let locals = handler.local_count as usize;
    if base + locals + 1 + handler.stack_max as usize > ctx.stack.len() {
        ctx.vm_bug("value stack overflow in handler dispatch");
    }
    ctx.stack[base] = err_val;
    ctx.push_frame(
        Some(handler),
        FrameKind::Block,
        self_val,
        Val::Scope(dfp),
        Some(lfp),
        Some(0),
        base + 1,
        locals - 1,
    );
}

fn fire_exit_hook(ctx: &ExecContext, frame: &ControlFrame) {
    // Block, lambda, top and eval frames report here too, so spliced
    // handler bodies and top-level unwinds stay visible to tracers.
    let kind = match frame.kind {
        FrameKind::Method | FrameKind::Block | FrameKind::Lambda => TraceEventKind::Return,
        FrameKind::Class | FrameKind::Top | FrameKind::Eval => TraceEventKind::End,
        FrameKind::Native => TraceEventKind::CReturn,
        FrameKind::Finish => return,
    };
    let name = frame
        .iseq
        .as_ref()
        .map(|i| i.name.clone())
        .or_else(|| frame.native_name.clone());
    ctx.vm().fire(&TraceEvent {
        kind,
        self_val: frame.self_val.clone(),
        name,
    });
}

/// Construct the signal for a `throw` instruction executed in the current
/// frame. Orphaned `return`/`break`/`retry`, whose target scope no longer
/// has a live frame, degrade here into a `LocalJumpError` raise.
pub(crate) fn throw_signal(ctx: &mut ExecContext, kind: ThrowKind, payload: Val) -> UnwindSignal {
    match kind {
        ThrowKind::Return => {
            let cfp = ctx.cfp();
            let target = if cfp.kind == FrameKind::Lambda {
                cfp.dfp.clone()
            } else {
                cfp.lfp.clone()
            };
            let target = ctx.normalize_scope(target);
            if ctx.frame_owning_scope(&target).is_none() {
                return orphan_jump("unexpected return", payload, "return");
            }
            UnwindSignal::new(TagKind::Return, payload, Some(target))
        }
        ThrowKind::Break => {
            if ctx.cfp().is_method_level() {
                // break out of a loop in this very frame, found by table
                return UnwindSignal::new(TagKind::Break, payload, None);
            }
            match parent_scope(ctx) {
                Some(target) if ctx.frame_owning_scope(&target).is_some() => {
                    UnwindSignal::new(TagKind::Break, payload, Some(target))
                }
                _ => orphan_jump("break from proc-closure", payload, "break"),
            }
        }
        ThrowKind::Next => UnwindSignal::new(TagKind::Next, payload, None),
        ThrowKind::Redo => UnwindSignal::new(TagKind::Redo, Val::Nil, None),
        ThrowKind::Retry => match parent_scope(ctx) {
            Some(target) if ctx.frame_owning_scope(&target).is_some() => {
                UnwindSignal::new(TagKind::Retry, Val::Nil, Some(target))
            }
            _ => orphan_jump("retry outside of rescue clause", Val::Nil, "retry"),
        },
        ThrowKind::Raise => UnwindSignal::new(TagKind::Raise, payload, None),
        ThrowKind::Fatal => UnwindSignal::new(TagKind::Fatal, payload, None),
        ThrowKind::Rethrow => match payload {
            // Resume the signal an ensure body was entered with, keeping its
            // record of already-run handlers.
            Val::Throw(sig) => (*sig).clone(),
            err => UnwindSignal::new(TagKind::Raise, err, None),
        },
    }
}

fn parent_scope(ctx: &ExecContext) -> Option<ScopeRef> {
    match ctx.cfp().dfp.link(&ctx.stack) {
        Val::Scope(s) => Some(ctx.normalize_scope(s)),
        _ => None,
    }
}

fn orphan_jump(message: &str, payload: Val, reason: &'static str) -> UnwindSignal {
    UnwindSignal::raise(ErrorValue::local_jump(message, payload, reason))
}

/// Translate a signal that reached native code into a public error value.
pub(crate) fn boundary_error(sig: UnwindSignal) -> anyhow::Error {
    match sig.kind {
        TagKind::Raise | TagKind::Fatal => match sig.payload {
            Val::Error(e) => anyhow::Error::new(UncaughtError {
                name: e.name.to_string(),
                message: e.message.clone(),
            }),
            other => anyhow::Error::new(UncaughtError {
                name: "RuntimeError".to_string(),
                message: other.to_string(),
            }),
        },
        TagKind::Return => anyhow::Error::new(JumpError::new("return", "unexpected return")),
        TagKind::Break => anyhow::Error::new(JumpError::new("break", "unexpected break")),
        TagKind::Next => anyhow::Error::new(JumpError::new("next", "unexpected next")),
        TagKind::Redo => anyhow::Error::new(JumpError::new("redo", "unexpected redo")),
        TagKind::Retry => {
            anyhow::Error::new(JumpError::new("retry", "retry outside of rescue clause"))
        }
    }
}
