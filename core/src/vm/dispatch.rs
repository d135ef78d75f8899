use std::rc::Rc;
use std::sync::Arc;

use crate::insn::Insn;
use crate::iseq::{Iseq, IseqKind};
use crate::val::{ErrorValue, Val};
use crate::vm::context::ExecContext;
use crate::vm::frame::FrameKind;
use crate::vm::invoke;
use crate::vm::proc::{Block, make_proc, make_proc_from_block};
use crate::vm::unwind::{UnwindSignal, throw_signal};

/// How one `run_core` activation ended: the activation's sentinel was
/// reached with a result, or a non-local transfer started.
pub(crate) enum CoreEvent {
    Finished(Val),
    Signal(UnwindSignal),
}

fn push(ctx: &mut ExecContext, val: Val) {
    let sp = ctx.cfp().sp;
    ctx.stack[sp] = val;
    ctx.cfp_mut().sp = sp + 1;
}

fn pop(ctx: &mut ExecContext) -> Val {
    let frame = ctx.cfp_mut();
    debug_assert!(frame.sp > frame.bp, "operand stack underflow");
    frame.sp -= 1;
    let sp = frame.sp;
    std::mem::replace(&mut ctx.stack[sp], Val::Nil)
}

fn raise(err: Rc<ErrorValue>) -> CoreEvent {
    CoreEvent::Signal(UnwindSignal::raise(err))
}

/// Execute bytecode from the current frame until it leaves into a sentinel
/// frame or a transfer signals out. Frames pushed by `Send` run in this same
/// loop; block and proc invocations re-enter through the invocation layer.
pub(crate) fn run_core(ctx: &mut ExecContext) -> CoreEvent {
    loop {
        let (pc, iseq) = {
            let frame = ctx.cfp();
            let Some(pc) = frame.pc else {
                ctx.vm_bug("executing a frame without a pc");
            };
            let Some(iseq) = frame.iseq.clone() else {
                ctx.vm_bug("executing a frame without an iseq");
            };
            (pc, iseq)
        };
        let Some(&insn) = iseq.code.get(pc) else {
            ctx.vm_bug("pc ran off the end of the iseq");
        };
        ctx.cfp_mut().pc = Some(pc + 1);

        match insn {
            Insn::Nop => {}
            Insn::PushNil => push(ctx, Val::Nil),
            Insn::PushSelf => {
                let v = ctx.cfp().self_val.clone();
                push(ctx, v);
            }
            Insn::PushConst(k) => {
                let v = iseq.consts[k as usize].clone();
                push(ctx, v);
            }
            Insn::Pop => {
                pop(ctx);
            }
            Insn::Dup => {
                let v = ctx.stack[ctx.cfp().sp - 1].clone();
                push(ctx, v);
            }
            Insn::GetLocal { bidx, level } => {
                let scope = walk_scope(ctx, level);
                let v = scope.get(&ctx.stack, bidx);
                push(ctx, v);
            }
            Insn::SetLocal { bidx, level } => {
                let v = pop(ctx);
                let scope = walk_scope(ctx, level);
                scope.set(&mut ctx.stack, bidx, v);
            }
            Insn::Jump(dst) => {
                ctx.cfp_mut().pc = Some(dst as usize);
            }
            Insn::BranchUnless(dst) => {
                if !pop(ctx).truthy() {
                    ctx.cfp_mut().pc = Some(dst as usize);
                }
            }
            Insn::OptPlus | Insn::OptMinus | Insn::OptLt => {
                let b = pop(ctx);
                let a = pop(ctx);
                match arith(a, b, insn) {
                    Ok(v) => push(ctx, v),
                    Err(e) => return raise(e),
                }
            }
            Insn::OptEq => {
                let b = pop(ctx);
                let a = pop(ctx);
                push(ctx, Val::Bool(a == b));
            }
            Insn::Send { iseq: k, argc, block } => {
                if let Some(ev) = send(ctx, &iseq, k, argc as usize, block) {
                    return ev;
                }
            }
            Insn::InvokeBlock { argc } => {
                let args = pop_args(ctx, argc as usize);
                match invoke::yield_block(ctx, args) {
                    Ok(v) => push(ctx, v),
                    Err(sig) => return CoreEvent::Signal(sig),
                }
            }
            Insn::NewProc { iseq: k, lambda } => {
                let Val::Iseq(block_iseq) = &iseq.consts[k as usize] else {
                    ctx.vm_bug("new_proc operand is not an iseq");
                };
                let cfp = ctx.cfp();
                let block = Block::new(
                    cfp.self_val.clone(),
                    cfp.lfp.clone(),
                    cfp.dfp.clone(),
                    block_iseq.clone(),
                );
                let proc = make_proc(ctx, &block, lambda);
                push(ctx, Val::Proc(proc));
            }
            Insn::InvokeProc { argc } => {
                let args = pop_args(ctx, argc as usize);
                let callee = pop(ctx);
                let Val::Proc(proc) = callee else {
                    return raise(ErrorValue::type_err(format!(
                        "cannot invoke a {}",
                        callee.type_name()
                    )));
                };
                match invoke::invoke_proc(ctx, &proc, args, None) {
                    Ok(v) => push(ctx, v),
                    Err(sig) => return CoreEvent::Signal(sig),
                }
            }
            Insn::Throw(kind) => {
                let payload = pop(ctx);
                let sig = throw_signal(ctx, kind, payload);
                return CoreEvent::Signal(sig);
            }
            Insn::Leave => {
                let val = pop(ctx);
                ctx.pop_frame();
                if ctx.frames.is_empty() {
                    ctx.vm_bug("leave with no caller frame");
                }
                if ctx.cfp().kind == FrameKind::Finish {
                    ctx.pop_frame();
                    return CoreEvent::Finished(val);
                }
                push(ctx, val);
            }
        }
    }
}

/// Resolve `level` hops of the lexical scope chain from the current frame,
/// following heap markers left by promotions along the way.
fn walk_scope(ctx: &ExecContext, level: u16) -> crate::vm::frame::ScopeRef {
    let mut scope = ctx.cfp().dfp.clone();
    for _ in 0..level {
        match scope.link(&ctx.stack) {
            Val::Scope(parent) => scope = ctx.normalize_scope(parent),
            _ => ctx.vm_bug("lexical scope chain shorter than access level"),
        }
    }
    scope
}

fn pop_args(ctx: &mut ExecContext, argc: usize) -> Vec<Val> {
    let base = ctx.cfp().sp - argc;
    let args = ctx.stack[base..base + argc].to_vec();
    ctx.cfp_mut().sp = base;
    args
}

fn arith(a: Val, b: Val, insn: Insn) -> Result<Val, Rc<ErrorValue>> {
    match (insn, a, b) {
        (Insn::OptPlus, Val::Int(a), Val::Int(b)) => match a.checked_add(b) {
            Some(v) => Ok(Val::Int(v)),
            None => Err(ErrorValue::new("RangeError", "integer overflow")),
        },
        (Insn::OptPlus, Val::Float(a), Val::Float(b)) => Ok(Val::Float(a + b)),
        (Insn::OptPlus, Val::Int(a), Val::Float(b)) => Ok(Val::Float(a as f64 + b)),
        (Insn::OptPlus, Val::Float(a), Val::Int(b)) => Ok(Val::Float(a + b as f64)),
        (Insn::OptPlus, Val::Str(a), Val::Str(b)) => {
            Ok(Val::Str(crate::val::intern(&format!("{a}{b}"))))
        }
        (Insn::OptMinus, Val::Int(a), Val::Int(b)) => match a.checked_sub(b) {
            Some(v) => Ok(Val::Int(v)),
            None => Err(ErrorValue::new("RangeError", "integer overflow")),
        },
        (Insn::OptMinus, Val::Float(a), Val::Float(b)) => Ok(Val::Float(a - b)),
        (Insn::OptMinus, Val::Int(a), Val::Float(b)) => Ok(Val::Float(a as f64 - b)),
        (Insn::OptMinus, Val::Float(a), Val::Int(b)) => Ok(Val::Float(a - b as f64)),
        (Insn::OptLt, Val::Int(a), Val::Int(b)) => Ok(Val::Bool(a < b)),
        (Insn::OptLt, Val::Float(a), Val::Float(b)) => Ok(Val::Bool(a < b)),
        (Insn::OptLt, Val::Int(a), Val::Float(b)) => Ok(Val::Bool((a as f64) < b)),
        (Insn::OptLt, Val::Float(a), Val::Int(b)) => Ok(Val::Bool(a < b as f64)),
        (op, a, b) => Err(ErrorValue::type_err(format!(
            "{op:?} not supported between {} and {}",
            a.type_name(),
            b.type_name()
        ))),
    }
}

/// Push a method (or class body) frame for a `send`. The arguments already
/// sit on the caller's stack and become the callee's leading locals in
/// place. Returns a core event only when the send cannot proceed.
fn send(
    ctx: &mut ExecContext,
    caller_iseq: &Arc<Iseq>,
    k: u16,
    argc: usize,
    block_k: Option<u16>,
) -> Option<CoreEvent> {
    let Val::Iseq(callee) = &caller_iseq.consts[k as usize] else {
        ctx.vm_bug("send operand is not an iseq");
    };
    let callee = callee.clone();
    let kind = match callee.kind {
        IseqKind::Method => FrameKind::Method,
        IseqKind::Class => FrameKind::Class,
        other => ctx.vm_bug(&format!("send cannot enter a {other:?} iseq")),
    };

    let base = ctx.cfp().sp - argc;
    let args = ctx.stack[base..base + argc].to_vec();
    ctx.cfp_mut().sp = base;

    let (self_val, specval) = {
        let cfp = ctx.cfp();
        let specval = match block_k {
            Some(bk) => {
                let Val::Iseq(block_iseq) = &caller_iseq.consts[bk as usize] else {
                    ctx.vm_bug("send block operand is not an iseq");
                };
                Val::Block(Block::new(
                    cfp.self_val.clone(),
                    cfp.lfp.clone(),
                    cfp.dfp.clone(),
                    block_iseq.clone(),
                ))
            }
            None => Val::Nil,
        };
        (cfp.self_val.clone(), specval)
    };

    // A callee that declares a block parameter gets the carried block as a
    // proc, materialized from the same descriptor the link slot will hold.
    let block_arg = match (&specval, callee.params.block) {
        (Val::Block(b), true) => {
            let b = b.clone();
            Some(Val::Proc(make_proc_from_block(ctx, &b)))
        }
        _ => None,
    };
    let (bound, entry_pc) = match bind_args(&callee, args, true, block_arg) {
        Ok(ok) => ok,
        Err(e) => return Some(raise(e)),
    };
    let n = bound.len();
    for (i, v) in bound.into_iter().enumerate() {
        ctx.stack[base + i] = v;
    }
    ctx.push_frame(
        Some(callee.clone()),
        kind,
        self_val,
        specval,
        None,
        Some(entry_pc),
        base + n,
        callee.local_count as usize - n,
    );
    None
}

/// Bind call arguments to parameter slots. Strict binding (methods and
/// lambdas) rejects arity mismatches with an `ArgumentError`; lenient
/// binding (blocks) splats a lone array argument across multiple
/// parameters, pads missing ones with nil and drops extras. Returns the
/// bound slot values and the entry pc selected by how many optional
/// parameters were filled from arguments.
pub(crate) fn bind_args(
    iseq: &Iseq,
    mut args: Vec<Val>,
    strict: bool,
    block_arg: Option<Val>,
) -> Result<(Vec<Val>, usize), Rc<ErrorValue>> {
    let params = &iseq.params;
    let req = params.required as usize;
    let opt = params.optional_count();

    if !strict && args.len() == 1 && (req + opt > 1 || params.rest) {
        if let Val::Array(items) = &args[0] {
            let items = items.borrow().clone();
            args = items;
        }
    }
    let given = args.len();
    if given < req {
        if strict {
            return Err(ErrorValue::argument(format!(
                "wrong number of arguments (given {given}, expected {})",
                expected_arity(req, opt, params.rest),
            )));
        }
        args.resize(req, Val::Nil);
    }

    let mut out = Vec::with_capacity(params.slot_count());
    let mut rest: Vec<Val> = args.split_off(req.min(args.len()));
    out.append(&mut args);
    let opt_filled = rest.len().min(opt);
    out.extend(rest.drain(..opt_filled));
    for _ in opt_filled..opt {
        out.push(Val::Nil);
    }
    if params.rest {
        out.push(Val::array(std::mem::take(&mut rest)));
    } else if !rest.is_empty() && strict {
        return Err(ErrorValue::argument(format!(
            "wrong number of arguments (given {given}, expected {})",
            expected_arity(req, opt, params.rest),
        )));
    }
    if params.block {
        out.push(block_arg.unwrap_or(Val::Nil));
    }

    let entry_pc = if params.opt_entries.is_empty() {
        0
    } else {
        params.opt_entries[opt_filled] as usize
    };
    Ok((out, entry_pc))
}

fn expected_arity(req: usize, opt: usize, rest: bool) -> String {
    if rest {
        format!("{req}+")
    } else if opt > 0 {
        format!("{req}..{}", req + opt)
    } else {
        req.to_string()
    }
}
