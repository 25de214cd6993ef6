use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, SessionError};

/// Lock shared bookkeeping, recovering from a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Closed flag that is also closed whenever an owner up the chain is.
///
/// Engine → handler → handle each hold a child of their owner's flag, so
/// closing an owner invalidates everything below it without touching it.
#[derive(Clone, Default)]
pub(crate) struct Liveness {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<Liveness>>,
}

impl Liveness {
    pub(crate) fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Close this level. Returns whether this call did it.
    pub(crate) fn close(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.flag.load(Ordering::Acquire)
            || self.parent.as_ref().is_some_and(|parent| parent.is_closed())
    }

    pub(crate) fn ensure_open(&self, what: &'static str) -> Result<()> {
        if self.is_closed() {
            Err(SessionError::Closed(what))
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Liveness").field(&self.is_closed()).finish()
    }
}

/// Local proxy for a resource that lives in the engine.
///
/// The id comes from the engine. Once closed, locally or because its owning
/// handler or engine closed, it never reopens.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    id: String,
    liveness: Liveness,
}

impl RemoteHandle {
    pub(crate) fn new(id: String, owner: &Liveness) -> Self {
        Self {
            id,
            liveness: owner.child(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.liveness.is_closed()
    }

    pub(crate) fn close(&self) -> bool {
        self.liveness.close()
    }

    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub(crate) fn ensure_open(&self, what: &'static str) -> Result<()> {
        self.liveness.ensure_open(what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closing_owner_invalidates_descendants() {
        let engine = Liveness::default();
        let handler = engine.child();
        let handle = RemoteHandle::new("p-1".to_string(), &handler);

        assert!(!handle.is_closed());
        assert!(handler.close());
        assert!(handle.is_closed());
        assert!(!engine.is_closed());
        assert!(matches!(handle.ensure_open("producer"), Err(SessionError::Closed("producer"))));
    }

    #[test]
    fn close_is_reported_once() {
        let handle = RemoteHandle::new("c-1".to_string(), &Liveness::default());
        assert!(handle.close());
        assert!(!handle.close());
        assert!(handle.is_closed());
    }

    #[test]
    fn closing_child_leaves_owner_open() {
        let engine = Liveness::default();
        let handle = RemoteHandle::new("d-1".to_string(), &engine);
        handle.close();
        assert!(!engine.is_closed());
        assert!(engine.ensure_open("engine").is_ok());
    }
}
