use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, error};

use crate::iseq::{Iseq, SVAR_BIDX};
use crate::val::Val;
use crate::vm::frame::{ControlFrame, FrameKind, ScopeRef};
use crate::vm::hooks::{TraceEvent, TraceEventKind, TraceHook};

#[derive(Clone, Copy, Debug)]
pub struct VmOptions {
    /// Value stack slots per execution context.
    pub stack_size: usize,
    /// Maximum control-frame depth.
    pub frame_max: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            stack_size: 4096,
            frame_max: 1024,
        }
    }
}

/// Shared virtual machine state: configuration and trace hooks. Execution
/// runs through an [`ExecContext`] holding a handle to this.
pub struct Vm {
    options: VmOptions,
    pub(crate) hooks: RefCell<Vec<TraceHook>>,
}

impl Vm {
    pub fn new() -> Rc<Self> {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Rc<Self> {
        Rc::new(Self {
            options,
            hooks: RefCell::new(Vec::new()),
        })
    }

    pub fn options(&self) -> &VmOptions {
        &self.options
    }
}

/// Special-variable slots, kept per method scope in the reserved local slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SvarKey {
    Backref = 0,
    LastLine = 1,
}

/// One execution context: a value stack, a control-frame arena and the
/// safe-level register threaded through native re-entries. Single-threaded;
/// cheap to create, one per running top-level evaluation.
pub struct ExecContext {
    vm: Rc<Vm>,
    pub(crate) stack: Vec<Val>,
    pub(crate) frames: Vec<ControlFrame>,
    safe_level: u8,
}

impl ExecContext {
    pub fn new(vm: &Rc<Vm>) -> Self {
        Self {
            vm: vm.clone(),
            stack: vec![Val::Nil; vm.options.stack_size],
            frames: Vec::with_capacity(64),
            safe_level: 0,
        }
    }

    pub fn vm(&self) -> &Rc<Vm> {
        &self.vm
    }

    pub fn safe_level(&self) -> u8 {
        self.safe_level
    }

    pub fn set_safe_level(&mut self, level: u8) {
        self.safe_level = level;
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Stack index just above the newest frame's operand region, where the
    /// next frame starts.
    pub(crate) fn top_sp(&self) -> usize {
        self.frames.last().map(|f| f.sp).unwrap_or(0)
    }

    pub(crate) fn cfp(&self) -> &ControlFrame {
        match self.frames.last() {
            Some(f) => f,
            None => self.vm_bug("no current frame"),
        }
    }

    pub(crate) fn cfp_mut(&mut self) -> &mut ControlFrame {
        match self.frames.last_mut() {
            Some(f) => f,
            None => panic!("VM bug: no current frame"),
        }
    }

    /// Push a control frame whose local region starts at `sp`. Slots for
    /// `locals` locals are cleared, the scope-link slot is set to `specval`,
    /// and the operand region begins just above it. A frame with no `lfp`
    /// opens a method-level scope of its own.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn push_frame(
        &mut self,
        iseq: Option<Arc<Iseq>>,
        kind: FrameKind,
        self_val: Val,
        specval: Val,
        lfp: Option<ScopeRef>,
        pc: Option<usize>,
        sp: usize,
        locals: usize,
    ) -> usize {
        let reserve = iseq.as_ref().map(|i| i.stack_max as usize).unwrap_or(0);
        if sp + locals + 1 + reserve > self.stack.len() {
            self.vm_bug("value stack overflow");
        }
        if self.frames.len() >= self.vm.options.frame_max {
            self.vm_bug("control frame stack overflow");
        }
        for slot in &mut self.stack[sp..sp + locals] {
            *slot = Val::Nil;
        }
        let link = sp + locals;
        self.stack[link] = specval;
        let dfp = ScopeRef::Stack(link);
        let lfp = lfp.unwrap_or_else(|| dfp.clone());
        self.frames.push(ControlFrame {
            pc,
            sp: link + 1,
            bp: link + 1,
            iseq,
            kind,
            self_val,
            lfp,
            dfp,
            native_name: None,
        });
        self.frames.len() - 1
    }

    pub(crate) fn pop_frame(&mut self) -> ControlFrame {
        match self.frames.pop() {
            Some(f) => f,
            None => self.vm_bug("control frame stack underflow"),
        }
    }

    /// Nearest frame at or below `idx` with a live pc.
    pub(crate) fn nearest_normal_frame(&self, mut idx: usize) -> Option<usize> {
        loop {
            if self.frames[idx].pc.is_some() {
                return Some(idx);
            }
            idx = idx.checked_sub(1)?;
        }
    }

    /// Nearest frame at or below `idx` executing real bytecode.
    pub(crate) fn nearest_iseq_frame(&self, mut idx: usize) -> Option<usize> {
        loop {
            if self.frames[idx].is_normal() {
                return Some(idx);
            }
            idx = idx.checked_sub(1)?;
        }
    }

    /// Newest frame whose innermost scope is `scope`.
    pub(crate) fn frame_owning_scope(&self, scope: &ScopeRef) -> Option<usize> {
        self.frames.iter().rposition(|f| f.dfp == *scope)
    }

    /// Follow the heap marker left in a vacated link slot, so references
    /// taken before a promotion observe the promoted environment.
    pub(crate) fn normalize_scope(&self, scope: ScopeRef) -> ScopeRef {
        if let ScopeRef::Stack(link) = scope {
            if let Val::Scope(heap @ ScopeRef::Env(_)) = &self.stack[link] {
                return heap.clone();
            }
        }
        scope
    }

    /// Rewrite every live alias of the stack scope at `link` to `to`: frame
    /// scope pointers, link slots of dependent scopes, and block descriptors
    /// parked on the stack.
    pub(crate) fn rewrite_scope_refs(&mut self, link: usize, to: &ScopeRef) {
        let from = ScopeRef::Stack(link);
        for frame in &mut self.frames {
            if frame.lfp == from {
                frame.lfp = to.clone();
            }
            if frame.dfp == from {
                frame.dfp = to.clone();
            }
        }
        let top = self.top_sp();
        for slot in &mut self.stack[..top] {
            match slot {
                Val::Scope(s @ ScopeRef::Stack(_)) if *s == from => {
                    *s = to.clone();
                }
                Val::Block(block) => {
                    let mut b = block.borrow_mut();
                    if b.lfp == from {
                        b.lfp = to.clone();
                    }
                    if b.dfp == from {
                        b.dfp = to.clone();
                    }
                }
                _ => {}
            }
        }
    }

    fn svar_slot(&mut self) -> Option<ScopeRef> {
        let idx = self.nearest_normal_frame(self.frames.len().checked_sub(1)?)?;
        let lfp = self.frames[idx].lfp.clone();
        if lfp.get(&self.stack, SVAR_BIDX).is_nil() {
            lfp.set(
                &mut self.stack,
                SVAR_BIDX,
                Val::array(vec![Val::Nil, Val::Nil]),
            );
        }
        Some(lfp)
    }

    pub fn svar_get(&mut self, key: SvarKey) -> Val {
        let Some(lfp) = self.svar_slot() else {
            return Val::Nil;
        };
        match lfp.get(&self.stack, SVAR_BIDX) {
            Val::Array(items) => items.borrow()[key as usize].clone(),
            _ => Val::Nil,
        }
    }

    pub fn svar_set(&mut self, key: SvarKey, val: Val) {
        let Some(lfp) = self.svar_slot() else {
            return;
        };
        if let Val::Array(items) = lfp.get(&self.stack, SVAR_BIDX) {
            items.borrow_mut()[key as usize] = val;
        }
    }

    pub fn backref(&mut self) -> Val {
        self.svar_get(SvarKey::Backref)
    }

    pub fn set_backref(&mut self, val: Val) {
        self.svar_set(SvarKey::Backref, val);
    }

    pub fn lastline(&mut self) -> Val {
        self.svar_get(SvarKey::LastLine)
    }

    pub fn set_lastline(&mut self, val: Val) {
        self.svar_set(SvarKey::LastLine, val);
    }

    /// Human-readable call stack, newest frame first.
    pub fn backtrace(&self) -> Vec<String> {
        let mut out = Vec::new();
        for frame in self.frames.iter().rev() {
            match (&frame.iseq, frame.pc) {
                (Some(iseq), Some(pc)) => {
                    // pc has already advanced past the current instruction
                    match iseq.line_for(pc.saturating_sub(1)) {
                        Some(line) => out.push(format!("{}:{line}", iseq.name)),
                        None => out.push(iseq.name.to_string()),
                    }
                }
                _ => {
                    if let Some(name) = &frame.native_name {
                        out.push(format!("{name} (native)"));
                    }
                }
            }
        }
        out
    }

    /// Promote every live scope to the heap. Used before operations that
    /// capture the whole stack, such as continuation-style snapshots.
    pub fn stack_to_heap(&mut self) {
        debug!(frames = self.frames.len(), "promoting all scopes to heap");
        let mut idx = self.frames.len().checked_sub(1);
        while let Some(i) = idx {
            let Some(j) = self.nearest_iseq_frame(i) else {
                break;
            };
            crate::vm::env::make_env(self, j);
            idx = j.checked_sub(1);
        }
    }

    /// Visit every value reachable from this context: live stack slots,
    /// frame receivers and promoted environments.
    pub fn visit_refs(&self, f: &mut dyn FnMut(&Val)) {
        for slot in &self.stack[..self.top_sp()] {
            f(slot);
        }
        for frame in &self.frames {
            f(&frame.self_val);
            if let ScopeRef::Env(env) = &frame.dfp {
                env.visit_refs(f);
            }
        }
    }

    /// Run native code under a frame of its own, so backtraces and return
    /// hooks cover the native call.
    pub fn with_native_frame<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Self) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let sp = self.top_sp();
        let idx = self.push_frame(
            None,
            FrameKind::Native,
            Val::Nil,
            Val::Nil,
            None,
            None,
            sp,
            0,
        );
        let interned = crate::val::intern(name);
        self.frames[idx].native_name = Some(interned.clone());
        let result = f(self);
        let frame = self.pop_frame();
        self.vm.fire(&TraceEvent {
            kind: TraceEventKind::CReturn,
            self_val: frame.self_val,
            name: Some(interned),
        });
        result
    }

    /// Unrecoverable engine-invariant violation. Dumps the frame stack and
    /// aborts the process rather than continue on corrupted state.
    pub(crate) fn vm_bug(&self, msg: &str) -> ! {
        error!("VM bug: {msg}");
        for (i, frame) in self.frames.iter().enumerate().rev() {
            error!("  frame {i}: {frame:?}");
        }
        panic!("VM bug: {msg}");
    }
}
