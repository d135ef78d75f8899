use super::*;
use crate::vm::frame::FrameKind;
use crate::vm::proc::{Block, make_proc, make_proc_from_block};
use std::rc::Rc;

#[test]
fn proc_outlives_its_defining_frame() {
    // def mk; x = 5; proc { x }; end
    // mk.call
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::GetLocal { bidx: 2, level: 1 }, Insn::Leave],
        vec![],
        vec![],
    );
    let mk = Iseq::new(
        "mk",
        IseqKind::Method,
        vec!["x"],
        Params::default(),
        vec![
            Insn::PushConst(0),
            Insn::SetLocal { bidx: 2, level: 0 },
            Insn::NewProc { iseq: 1, lambda: false },
            Insn::Leave,
        ],
        vec![Val::Int(5), Val::Iseq(blk)],
        vec![],
    );
    let result = run(
        vec![
            Insn::Send { iseq: 0, argc: 0, block: None },
            Insn::InvokeProc { argc: 0 },
            Insn::Leave,
        ],
        vec![Val::Iseq(mk)],
    );
    assert_eq!(result, Val::Int(5));
}

#[test]
fn proc_exposes_its_captured_values() {
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::GetLocal { bidx: 2, level: 1 }, Insn::Leave],
        vec![],
        vec![],
    );
    let mk = Iseq::new(
        "mk",
        IseqKind::Method,
        vec!["x"],
        Params::default(),
        vec![
            Insn::PushConst(0),
            Insn::SetLocal { bidx: 2, level: 0 },
            Insn::NewProc { iseq: 1, lambda: false },
            Insn::Leave,
        ],
        vec![Val::Int(5), Val::Iseq(blk)],
        vec![],
    );
    let main = top(
        vec![Insn::Send { iseq: 0, argc: 0, block: None }, Insn::Leave],
        vec![Val::Iseq(mk)],
    );
    let p = match new_ctx().eval(&main).unwrap() {
        Val::Proc(p) => p,
        other => panic!("expected a proc, got {other}"),
    };
    // the defining frame is gone; the captured local is reachable only
    // through the proc's promoted environment
    let mut found = false;
    p.visit_refs(&mut |v| {
        if *v == Val::Int(5) {
            found = true;
        }
    });
    assert!(found);
}

#[test]
fn block_writes_its_outer_local() {
    // x = 1; m { x = x + 1 }; x
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![
            Insn::GetLocal { bidx: 2, level: 1 },
            Insn::PushConst(0),
            Insn::OptPlus,
            Insn::SetLocal { bidx: 2, level: 1 },
            Insn::PushNil,
            Insn::Leave,
        ],
        vec![Val::Int(1)],
        vec![],
    );
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::InvokeBlock { argc: 0 }, Insn::Leave],
        vec![],
        vec![],
    );
    let main = Iseq::new(
        "main",
        IseqKind::Top,
        vec!["x"],
        Params::default(),
        vec![
            Insn::PushConst(1),
            Insn::SetLocal { bidx: 2, level: 0 },
            Insn::Send { iseq: 0, argc: 0, block: Some(2) },
            Insn::Pop,
            Insn::GetLocal { bidx: 2, level: 0 },
            Insn::Leave,
        ],
        vec![Val::Iseq(m), Val::Int(1), Val::Iseq(blk)],
        vec![],
    );
    let result = new_ctx().eval(&main).unwrap();
    assert_eq!(result, Val::Int(2));
}

#[test]
fn lambda_binds_arguments_strictly() {
    let blk = Iseq::new(
        "lam",
        IseqKind::Block,
        vec!["a"],
        req(1),
        vec![Insn::GetLocal { bidx: 2, level: 0 }, Insn::Leave],
        vec![],
        vec![],
    );
    let main = top(
        vec![
            Insn::NewProc { iseq: 0, lambda: true },
            Insn::InvokeProc { argc: 0 },
            Insn::Leave,
        ],
        vec![Val::Iseq(blk)],
    );
    let err = run_err(&main);
    assert_eq!(uncaught_name(&err), "ArgumentError");
}

#[test]
fn return_from_lambda_is_the_lambda_value() {
    let blk = Iseq::new(
        "lam",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::Throw(ThrowKind::Return), Insn::PushNil, Insn::Leave],
        vec![Val::Int(7)],
        vec![],
    );
    let result = run(
        vec![
            Insn::NewProc { iseq: 0, lambda: true },
            Insn::InvokeProc { argc: 0 },
            Insn::Leave,
        ],
        vec![Val::Iseq(blk)],
    );
    assert_eq!(result, Val::Int(7));
}

#[test]
fn break_from_a_dead_creator_is_a_local_jump_error() {
    // def mk; proc { break 9 }; end
    // mk.call: the frame the break targets is gone
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::Throw(ThrowKind::Break), Insn::PushNil, Insn::Leave],
        vec![Val::Int(9)],
        vec![],
    );
    let mk = Iseq::new(
        "mk",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::NewProc { iseq: 0, lambda: false }, Insn::Leave],
        vec![Val::Iseq(blk)],
        vec![],
    );
    let main = top(
        vec![
            Insn::Send { iseq: 0, argc: 0, block: None },
            Insn::InvokeProc { argc: 0 },
            Insn::Leave,
        ],
        vec![Val::Iseq(mk)],
    );
    let err = run_err(&main);
    assert_eq!(uncaught_name(&err), "LocalJumpError");
    assert!(err.to_string().contains("break from proc-closure"));
}

#[test]
fn break_still_targets_its_creator_after_promotion() {
    // m { proc {}; break 4 }: the proc forces the block scope (and the
    // enclosing one) onto the heap before the break travels
    let inner = Iseq::new(
        "inner",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushNil, Insn::Leave],
        vec![],
        vec![],
    );
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![
            Insn::NewProc { iseq: 0, lambda: false },
            Insn::Pop,
            Insn::PushConst(1),
            Insn::Throw(ThrowKind::Break),
            Insn::PushNil,
            Insn::Leave,
        ],
        vec![Val::Iseq(inner), Val::Int(4)],
        vec![],
    );
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::InvokeBlock { argc: 0 }, Insn::Leave],
        vec![],
        vec![],
    );
    let result = run(
        vec![Insn::Send { iseq: 0, argc: 0, block: Some(1) }, Insn::Leave],
        vec![Val::Iseq(m), Val::Iseq(blk)],
    );
    assert_eq!(result, Val::Int(4));
}

#[test]
fn return_from_block_returns_from_its_method() {
    // def m; each { return 99 }; 1; end
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::Throw(ThrowKind::Return)],
        vec![Val::Int(99)],
        vec![],
    );
    let each = Iseq::new(
        "each",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::InvokeBlock { argc: 0 }, Insn::Leave],
        vec![],
        vec![],
    );
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![
            Insn::Send { iseq: 0, argc: 0, block: Some(1) },
            Insn::Pop,
            Insn::PushConst(2),
            Insn::Leave,
        ],
        vec![Val::Iseq(each), Val::Iseq(blk), Val::Int(1)],
        vec![],
    );
    let result = run(
        vec![Insn::Send { iseq: 0, argc: 0, block: None }, Insn::Leave],
        vec![Val::Iseq(m)],
    );
    assert_eq!(result, Val::Int(99));
}

fn ctx_with_live_frame() -> (ExecContext, Arc<Iseq>) {
    let main = Iseq::new(
        "main",
        IseqKind::Top,
        vec![],
        Params::default(),
        vec![Insn::PushNil, Insn::Leave],
        vec![],
        vec![],
    );
    let mut ctx = new_ctx();
    ctx.push_frame(
        Some(main.clone()),
        FrameKind::Top,
        Val::Nil,
        Val::Nil,
        None,
        Some(0),
        0,
        main.local_count as usize,
    );
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushNil, Insn::Leave],
        vec![],
        vec![],
    );
    (ctx, blk)
}

#[test]
fn materialization_is_cached_per_block() {
    let (mut ctx, blk) = ctx_with_live_frame();
    let (self_val, lfp, dfp) = {
        let f = ctx.cfp();
        (f.self_val.clone(), f.lfp.clone(), f.dfp.clone())
    };
    let block = Block::new(self_val, lfp, dfp, blk);
    let first = make_proc(&mut ctx, &block, false);
    let again = make_proc_from_block(&mut ctx, &block);
    assert!(Rc::ptr_eq(&first, &again));
    assert!(first.block.dfp.is_heap());
}

#[test]
#[should_panic(expected = "proc already materialized")]
fn materializing_twice_is_a_bug() {
    let (mut ctx, blk) = ctx_with_live_frame();
    let (self_val, lfp, dfp) = {
        let f = ctx.cfp();
        (f.self_val.clone(), f.lfp.clone(), f.dfp.clone())
    };
    let block = Block::new(self_val, lfp, dfp, blk);
    make_proc(&mut ctx, &block, false);
    make_proc(&mut ctx, &block, true);
}
