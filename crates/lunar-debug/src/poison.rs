use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`. A lock poisoned by a panicking holder is taken over; the
/// session state it guards is always left consistent between statements.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!(target: "lunar.debug", context, "taking over a poisoned lock");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn recovers_after_a_panicking_holder() {
        let shared = Arc::new(Mutex::new(1));
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("holder panicked");
        })
        .join();

        assert!(shared.is_poisoned());
        *lock(&shared, "test") += 1;
        assert_eq!(*lock(&shared, "test"), 2);
    }
}
