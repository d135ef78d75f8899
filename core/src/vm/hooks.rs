use std::sync::Arc;

use tracing::trace;

use crate::val::Val;
use crate::vm::context::Vm;

/// Frame-exit events observable through trace hooks. `Return` fires when a
/// method or block frame is popped (including during an unwind), `End` when
/// a class or top-level frame finishes, `CReturn` when a native frame does.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceEventKind {
    Return,
    End,
    CReturn,
}

#[derive(Clone)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub self_val: Val,
    /// Iseq or native method name, when known.
    pub name: Option<Arc<str>>,
}

pub type TraceHook = Box<dyn FnMut(&TraceEvent)>;

impl Vm {
    pub fn add_trace_hook(&self, hook: TraceHook) {
        self.hooks.borrow_mut().push(hook);
    }

    pub(crate) fn fire(&self, event: &TraceEvent) {
        trace!(kind = ?event.kind, name = ?event.name, "trace event");
        for hook in self.hooks.borrow_mut().iter_mut() {
            hook(event);
        }
    }
}
