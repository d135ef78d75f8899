use crate::vm::context::ExecContext;

/// Restores the context's safe level when dropped, so proc invocations that
/// lower or raise it cannot leak the change past their own extent, whether
/// they return normally or unwind.
pub(crate) struct SafeLevelGuard {
    ctx: *mut ExecContext,
    prev: u8,
}

impl SafeLevelGuard {
    pub(crate) fn enter(ctx: &mut ExecContext, level: u8) -> Self {
        let prev = ctx.safe_level();
        ctx.set_safe_level(level);
        Self {
            ctx: ctx as *mut ExecContext,
            prev,
        }
    }
}

impl Drop for SafeLevelGuard {
    fn drop(&mut self) {
        // SAFETY: the guard never outlives the borrow of the context it was
        // created from, and the pointer is only dereferenced here, after any
        // nested borrows have ended.
        unsafe {
            (*self.ctx).set_safe_level(self.prev);
        }
    }
}
