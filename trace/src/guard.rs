use std::cell::Cell;

thread_local! {
    static IN_CAPTURE: Cell<bool> = const { Cell::new(false) };
}

/// Per-thread reentrancy guard for the capture pipeline.
///
/// Everything the pipeline does past this point is allowed to allocate:
/// nested hook invocations see the flag and call only the underlying
/// primitive, so recursion depth is bounded at 1.
pub(crate) struct ReentrancyGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ReentrancyGuard {
    /// Set the current thread's in-capture flag.
    ///
    /// Returns `None` when the thread is already inside the capture pipeline,
    /// or when its TLS is being torn down.
    pub fn enter() -> Option<Self> {
        IN_CAPTURE
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(ReentrancyGuard {
                        _not_send: std::marker::PhantomData,
                    })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_CAPTURE.try_with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_entry_is_rejected() {
        let outer = ReentrancyGuard::enter();
        assert!(outer.is_some());
        assert!(ReentrancyGuard::enter().is_none());
        drop(outer);
        assert!(ReentrancyGuard::enter().is_some());
    }

    #[test]
    fn guard_is_per_thread() {
        let _outer = ReentrancyGuard::enter().unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(ReentrancyGuard::enter().is_some());
            });
        });
    }
}
