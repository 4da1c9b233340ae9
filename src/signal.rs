//! # Signal
//!
//! A named multicast hook a component exposes so other components (chiefly
//! the control engine) can observe its activity. Grounded on
//! `examples/original_source/src/include/vde3/signal.h` and `signal.c`.
//!
//! The C source attaches callbacks as raw `(fn ptr, fn ptr, void*)` triples
//! and dedupes on that triple. Rust has no portable way to compare two
//! trait-object closures for equality, so each attached observer is wrapped
//! once in an `Arc<Observer>` and the *identity of that Arc* (its pointer)
//! is the deduplication key — semantically the same "does this exact
//! subscription already exist" check, expressed with `Arc::ptr_eq` instead
//! of pointer-compared function pointers.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, Vde3Error};

/// Called with the signal's serialized argument on every `raise`.
pub trait Observer: Send + Sync {
    fn on_raise(&self, component: &str, signal: &str, info: &Value);
}

/// Called exactly once, when the component owning the signal is finalized,
/// for every callback still attached at that point.
pub trait Destroyer: Send + Sync {
    fn on_destroy(&self, component: &str, signal: &str);
}

impl<F: Fn(&str, &str, &Value) + Send + Sync> Observer for F {
    fn on_raise(&self, component: &str, signal: &str, info: &Value) {
        self(component, signal, info)
    }
}

impl<F: Fn(&str, &str) + Send + Sync> Destroyer for F {
    fn on_destroy(&self, component: &str, signal: &str) {
        self(component, signal)
    }
}

struct Callback {
    observer: Arc<dyn Observer>,
    destroyer: Arc<dyn Destroyer>,
}

/// A `(name, argument-description, callback-list)` signal.
pub struct Signal {
    name: String,
    description: String,
    callbacks: Vec<Callback>,
}

impl Signal {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Signal {
            name: name.into(),
            description: description.into(),
            callbacks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Attach an observer/destroyer pair. Fails with `AlreadyExists` if the
    /// exact same `(observer, destroyer)` Arc pair is already attached.
    pub fn attach(&mut self, observer: Arc<dyn Observer>, destroyer: Arc<dyn Destroyer>) -> Result<()> {
        let dup = self.callbacks.iter().any(|cb| {
            Arc::ptr_eq(&cb.observer, &observer) && Arc::ptr_eq(&cb.destroyer, &destroyer)
        });
        if dup {
            return Err(Vde3Error::AlreadyExists(format!(
                "callback already attached to signal {}",
                self.name
            )));
        }
        self.callbacks.push(Callback { observer, destroyer });
        Ok(())
    }

    /// Detach a previously attached `(observer, destroyer)` pair. No-op
    /// (returns `Ok`) if it was never attached, matching `vde_signal_detach`'s
    /// best-effort semantics.
    pub fn detach(&mut self, observer: &Arc<dyn Observer>, destroyer: &Arc<dyn Destroyer>) {
        self.callbacks
            .retain(|cb| !(Arc::ptr_eq(&cb.observer, observer) && Arc::ptr_eq(&cb.destroyer, destroyer)));
    }

    /// Raise the signal. Observers are invoked in attachment order, over a
    /// snapshot of the callback list:
    /// an observer that detaches itself mid-raise does not invalidate the
    /// walk, and only affects subsequent raises.
    pub fn raise(&self, component: &str, info: &Value) {
        let snapshot: Vec<Arc<dyn Observer>> = self.callbacks.iter().map(|cb| cb.observer.clone()).collect();
        for observer in snapshot {
            observer.on_raise(component, &self.name, info);
        }
    }

    /// Duplicate a signal for per-component registration from a shared
    /// module table. The callback list is intentionally *not* copied, so
    /// that two components of the same family never share subscribers.
    pub fn dup(&self) -> Signal {
        Signal {
            name: self.name.clone(),
            description: self.description.clone(),
            callbacks: Vec::new(),
        }
    }

    /// Run every destroy callback exactly once, then drop the list.
    pub fn fini(&mut self, component: &str) {
        for cb in self.callbacks.drain(..) {
            cb.destroyer.on_destroy(component, &self.name);
        }
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver(Arc<AtomicUsize>);
    impl Observer for CountingObserver {
        fn on_raise(&self, _c: &str, _s: &str, _i: &Value) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    struct NoopDestroyer;
    impl Destroyer for NoopDestroyer {
        fn on_destroy(&self, _c: &str, _s: &str) {}
    }

    #[test]
    fn attach_duplicate_triple_fails() {
        let mut sig = Signal::new("port_new", "fires when a port is attached");
        let obs: Arc<dyn Observer> = Arc::new(CountingObserver(Arc::new(AtomicUsize::new(0))));
        let destroy: Arc<dyn Destroyer> = Arc::new(NoopDestroyer);
        sig.attach(obs.clone(), destroy.clone()).unwrap();
        let err = sig.attach(obs, destroy).unwrap_err();
        assert!(matches!(err, Vde3Error::AlreadyExists(_)));
    }

    #[test]
    fn attach_then_detach_restores_prior_state() {
        let mut sig = Signal::new("port_new", "");
        let obs: Arc<dyn Observer> = Arc::new(CountingObserver(Arc::new(AtomicUsize::new(0))));
        let destroy: Arc<dyn Destroyer> = Arc::new(NoopDestroyer);
        assert_eq!(sig.callback_count(), 0);
        sig.attach(obs.clone(), destroy.clone()).unwrap();
        assert_eq!(sig.callback_count(), 1);
        sig.detach(&obs, &destroy);
        assert_eq!(sig.callback_count(), 0);
    }

    #[test]
    fn raise_invokes_observers_in_attachment_order() {
        let mut sig = Signal::new("x", "");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            let obs: Arc<dyn Observer> = Arc::new(move |_c: &str, _s: &str, _i: &Value| {
                order.lock().unwrap().push(i);
            });
            let destroy: Arc<dyn Destroyer> = Arc::new(|_c: &str, _s: &str| {});
            sig.attach(obs, destroy).unwrap();
        }
        sig.raise("hub0", &Value::Null);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn fini_calls_each_destroyer_exactly_once() {
        let mut sig = Signal::new("x", "");
        let calls = Arc::new(AtomicUsize::new(0));
        let obs: Arc<dyn Observer> = Arc::new(|_c: &str, _s: &str, _i: &Value| {});
        let calls_clone = calls.clone();
        let destroy: Arc<dyn Destroyer> = Arc::new(move |_c: &str, _s: &str| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        sig.attach(obs, destroy).unwrap();
        sig.fini("hub0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sig.callback_count(), 0);
    }

    #[test]
    fn dup_clears_callbacks_but_keeps_metadata() {
        let mut sig = Signal::new("port_new", "desc");
        let obs: Arc<dyn Observer> = Arc::new(|_c: &str, _s: &str, _i: &Value| {});
        let destroy: Arc<dyn Destroyer> = Arc::new(|_c: &str, _s: &str| {});
        sig.attach(obs, destroy).unwrap();
        let dup = sig.dup();
        assert_eq!(dup.name(), "port_new");
        assert_eq!(dup.description(), "desc");
        assert_eq!(dup.callback_count(), 0);
    }
}
