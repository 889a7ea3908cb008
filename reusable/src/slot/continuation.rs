use std::fmt;
use std::task::Waker;

/// The code to run once a pooled future has a result.
///
/// A suspended state machine is resumed through its [`Waker`]; the waker of a pooled state box
/// re-polls the machine in place, so no allocation happens on resumption.
pub enum Continuation {
    /// Wake a task. This is what `.await` registers.
    Waker(Waker),
    /// Run an arbitrary callback.
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl Continuation {
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Continuation::Callback(Box::new(f))
    }

    /// Run the continuation on the current thread.
    pub fn invoke(self) {
        match self {
            Continuation::Waker(waker) => waker.wake(),
            Continuation::Callback(callback) => callback(),
        }
    }
}

impl From<Waker> for Continuation {
    fn from(waker: Waker) -> Self {
        Continuation::Waker(waker)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Continuation::Waker(waker) => f.debug_tuple("Waker").field(waker).finish(),
            Continuation::Callback(_) => f.write_str("Callback"),
        }
    }
}

// Replace a stored waker if needed. A stored callback is kept and `false` returned.
#[inline]
pub(super) fn replace_waker_ref(old: &mut Option<Continuation>, new: &Waker) -> bool {
    match old {
        Some(Continuation::Callback(_)) => return false,
        Some(Continuation::Waker(ref old_waker)) if old_waker.will_wake(new) => return true,
        _ => {}
    }
    *old = Some(Continuation::Waker(new.clone()));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_invoke_waker() {
        let (waker, count) = futures_test::task::new_count_waker();
        Continuation::from(waker).invoke();
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_invoke_callback() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        Continuation::from_fn(move || flag.store(true, Ordering::SeqCst)).invoke();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_replace_waker_keeps_equivalent() {
        let (waker, count) = futures_test::task::new_count_waker();
        let mut stored = Some(Continuation::Waker(waker.clone()));
        assert!(replace_waker_ref(&mut stored, &waker));
        stored.take().unwrap().invoke();
        assert_eq!(count.get(), 1);

        let (other, other_count) = futures_test::task::new_count_waker();
        let mut stored = Some(Continuation::Waker(waker));
        assert!(replace_waker_ref(&mut stored, &other));
        stored.take().unwrap().invoke();
        assert_eq!(count.get(), 1);
        assert_eq!(other_count.get(), 1);
    }

    #[test]
    fn test_replace_waker_keeps_callback() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let mut stored = Some(Continuation::from_fn(move || flag.store(true, Ordering::SeqCst)));
        let (waker, count) = futures_test::task::new_count_waker();
        assert!(!replace_waker_ref(&mut stored, &waker));
        stored.take().unwrap().invoke();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(count.get(), 0);
    }
}
