//! Detects threads exiting.
//!
//! A thread that gets a transfer pool holds one guard per scheduler in thread local storage.
//! When the thread exits its thread locals are destroyed and each guard reports the thread to
//! its scheduler.
use std::cell::RefCell;
use std::thread::ThreadId;

use crossbeam_channel::Sender;

struct RetirementGuard {
    thread: ThreadId,
    sender: Sender<ThreadId>,
}

impl Drop for RetirementGuard {
    fn drop(&mut self) {
        // The scheduler may already be gone
        let _ = self.sender.send(self.thread);
    }
}

thread_local! {
    static GUARDS: RefCell<Vec<RetirementGuard>> = const { RefCell::new(Vec::new()) };
}

/// Reports the current thread on `sender` once it exits
pub(crate) fn arm(sender: &Sender<ThreadId>) {
    let guard = RetirementGuard {
        thread: std::thread::current().id(),
        sender: sender.clone(),
    };
    // Thread locals are already being torn down, so the thread is exiting right now
    if let Err(e) = GUARDS.try_with(|guards| guards.borrow_mut().push(guard)) {
        tracing::trace!("Thread exiting while arming retirement: {}", e);
    }
}
