use std::sync::{Mutex, MutexGuard};

/// Take a mutex even if a panicking thread poisoned it. Capture state is plain
/// data, so the last written value is still usable.
pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, context: &str) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(context, "mutex poisoned; recovering inner state");
        crate::log_debug(&format!("Mutex poisoned in {context}; recovering"));
        poisoned.into_inner()
    })
}
