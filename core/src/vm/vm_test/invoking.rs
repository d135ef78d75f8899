use super::*;
use crate::vm::frame::FrameKind;

#[test]
fn yield_without_a_block_is_a_local_jump_error() {
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::InvokeBlock { argc: 0 }, Insn::Leave],
        vec![],
        vec![],
    );
    let main = top(
        vec![Insn::Send { iseq: 0, argc: 0, block: None }, Insn::Leave],
        vec![Val::Iseq(m)],
    );
    let err = run_err(&main);
    assert_eq!(uncaught_name(&err), "LocalJumpError");
    assert!(err.to_string().contains("no block given"));
}

fn second_param_block() -> Arc<Iseq> {
    // { |a, b| b }
    Iseq::new(
        "blk",
        IseqKind::Block,
        vec!["a", "b"],
        req(2),
        vec![Insn::GetLocal { bidx: 2, level: 0 }, Insn::Leave],
        vec![],
        vec![],
    )
}

#[test]
fn yield_splats_a_lone_array_across_block_params() {
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::InvokeBlock { argc: 1 }, Insn::Leave],
        vec![Val::array(vec![Val::Int(1), Val::Int(2)])],
        vec![],
    );
    let result = run(
        vec![Insn::Send { iseq: 0, argc: 0, block: Some(1) }, Insn::Leave],
        vec![Val::Iseq(m), Val::Iseq(second_param_block())],
    );
    assert_eq!(result, Val::Int(2));
}

#[test]
fn yield_pads_missing_block_params_with_nil() {
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::InvokeBlock { argc: 1 }, Insn::Leave],
        vec![Val::Int(5)],
        vec![],
    );
    let result = run(
        vec![Insn::Send { iseq: 0, argc: 0, block: Some(1) }, Insn::Leave],
        vec![Val::Iseq(m), Val::Iseq(second_param_block())],
    );
    assert_eq!(result, Val::Nil);
}

#[test]
fn eval_rejects_a_non_top_iseq() {
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec![],
        Params::default(),
        vec![Insn::PushNil, Insn::Leave],
        vec![],
        vec![],
    );
    let err = new_ctx().eval(&m).unwrap_err();
    assert!(err.to_string().contains("not a top-level instruction sequence"));
}

fn proc_from(ctx: &mut ExecContext, iseq: Arc<Iseq>, lambda: bool) -> std::rc::Rc<crate::vm::proc::ProcObject> {
    let main = top(
        vec![Insn::NewProc { iseq: 0, lambda }, Insn::Leave],
        vec![Val::Iseq(iseq)],
    );
    match ctx.eval(&main).unwrap() {
        Val::Proc(p) => p,
        other => panic!("expected a proc, got {other}"),
    }
}

#[test]
fn call_proc_from_native_code() {
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec!["a"],
        req(1),
        vec![Insn::GetLocal { bidx: 2, level: 0 }, Insn::PushConst(0), Insn::OptPlus, Insn::Leave],
        vec![Val::Int(1)],
        vec![],
    );
    let mut ctx = new_ctx();
    let p = proc_from(&mut ctx, blk, false);
    let result = ctx.call_proc(&p, vec![Val::Int(41)]).unwrap();
    assert_eq!(result, Val::Int(42));
    assert_eq!(ctx.frame_depth(), 0);
}

#[test]
fn call_proc_with_a_block_argument() {
    // { |&b| b.call }
    let taker = Iseq::new(
        "taker",
        IseqKind::Block,
        vec!["b"],
        Params { block: true, ..Params::default() },
        vec![
            Insn::GetLocal { bidx: 2, level: 0 },
            Insn::InvokeProc { argc: 0 },
            Insn::Leave,
        ],
        vec![],
        vec![],
    );
    let given = Iseq::new(
        "given",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::Leave],
        vec![Val::Int(11)],
        vec![],
    );
    let mut ctx = new_ctx();
    let taker = proc_from(&mut ctx, taker, false);
    let given = proc_from(&mut ctx, given, false);
    let result = ctx.call_proc_with_block(&taker, vec![], &given).unwrap();
    assert_eq!(result, Val::Int(11));
}

#[test]
fn send_binds_a_declared_block_parameter() {
    // def m(&b) = b.call; m { 11 }
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec!["b"],
        Params { block: true, ..Params::default() },
        vec![
            Insn::GetLocal { bidx: 2, level: 0 },
            Insn::InvokeProc { argc: 0 },
            Insn::Leave,
        ],
        vec![],
        vec![],
    );
    let given = Iseq::new(
        "given",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::Leave],
        vec![Val::Int(11)],
        vec![],
    );
    let result = run(
        vec![Insn::Send { iseq: 0, argc: 0, block: Some(1) }, Insn::Leave],
        vec![Val::Iseq(m), Val::Iseq(given)],
    );
    assert_eq!(result, Val::Int(11));
}

#[test]
fn send_without_a_block_binds_the_block_parameter_to_nil() {
    let m = Iseq::new(
        "m",
        IseqKind::Method,
        vec!["b"],
        Params { block: true, ..Params::default() },
        vec![Insn::GetLocal { bidx: 2, level: 0 }, Insn::Leave],
        vec![],
        vec![],
    );
    let result = run(
        vec![Insn::Send { iseq: 0, argc: 0, block: None }, Insn::Leave],
        vec![Val::Iseq(m)],
    );
    assert_eq!(result, Val::Nil);
}

#[test]
fn proc_invocation_restores_the_safe_level_on_unwind() {
    let blk = Iseq::new(
        "blk",
        IseqKind::Block,
        vec![],
        Params::default(),
        vec![Insn::PushConst(0), Insn::Throw(ThrowKind::Raise)],
        vec![Val::str("nope")],
        vec![],
    );
    let mut ctx = new_ctx();
    ctx.set_safe_level(2);
    let p = proc_from(&mut ctx, blk, false);
    assert_eq!(p.safe_level, 2);
    ctx.set_safe_level(0);
    let err = ctx.call_proc(&p, vec![]).unwrap_err();
    assert_eq!(uncaught_name(&err), "RuntimeError");
    assert_eq!(ctx.safe_level(), 0);
    assert_eq!(ctx.frame_depth(), 0);
}

#[test]
fn make_binding_needs_a_live_frame() {
    assert!(new_ctx().make_binding().is_none());
}

#[test]
fn eval_binding_runs_inside_the_captured_scope() {
    let main = Iseq::new(
        "main",
        IseqKind::Top,
        vec!["x"],
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
    let x = main.local_bidx(0);
    let dfp = ctx.cfp().dfp.clone();
    dfp.set(&mut ctx.stack, x, Val::Int(3));
    let binding = ctx.make_binding().unwrap();
    ctx.pop_frame();

    let ev = Iseq::new(
        "eval",
        IseqKind::Eval,
        vec![],
        Params::default(),
        vec![Insn::GetLocal { bidx: 2, level: 1 }, Insn::Leave],
        vec![],
        vec![],
    );
    let result = ctx.eval_binding(&binding, &ev).unwrap();
    assert_eq!(result, Val::Int(3));
    assert_eq!(ctx.frame_depth(), 0);

    // a top-level iseq is not an eval body
    assert!(ctx.eval_binding(&binding, &main).is_err());
}
