use event_listener::{Event as EventLib, Listener};

/// A broadcast wake-up signal.
///
/// [`Event`] plays the role of a condition variable: the shared state it
/// guards lives elsewhere (usually behind a mutex) and waiters re-check that
/// state every time they wake. A waiter registers its listener *between* two
/// checks of the state, so a notification fired after the first check can
/// never be lost.
#[derive(Default)]
pub(crate) struct Event {
    event: EventLib,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wakes every task or thread currently waiting on this event.
    #[inline]
    pub(crate) fn notify_all(&self) {
        self.event.notify(usize::MAX);
    }

    /// Waits until `check` returns `Some`, re-evaluating it on every
    /// notification.
    pub(crate) async fn wait_until<T, F>(&self, mut check: F) -> T
    where
        F: FnMut() -> Option<T>,
    {
        loop {
            if let Some(value) = check() {
                return value;
            }

            // Actually wait for notification
            let listener = self.event.listen();

            if let Some(value) = check() {
                return value;
            }

            listener.await;
        }
    }

    /// Blocking twin of [`wait_until`](Self::wait_until) for callers outside
    /// of an async context.
    pub(crate) fn wait_until_blocking<T, F>(&self, mut check: F) -> T
    where
        F: FnMut() -> Option<T>,
    {
        loop {
            if let Some(value) = check() {
                return value;
            }

            let listener = self.event.listen();

            if let Some(value) = check() {
                return value;
            }

            listener.wait();
        }
    }
}
