//! Non-owning back-references between the services of a DHT stack.
//!
//! A [crate::registry::FamilyStack] holds the only strong references to its
//! services. Services point at each other through [Link]s, which are injected
//! exactly once during wiring and stop resolving as soon as the stack is
//! dropped.

use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::{Error, Result};

/// A service with interior mutability, shared between the stack and its tasks.
pub type Shared<T> = Arc<Mutex<T>>;

/// Locks a shared service, recovering the guard if a previous holder panicked.
pub fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Write-once weak reference to a collaborator.
pub struct Link<T: ?Sized> {
    name: &'static str,
    slot: OnceLock<Weak<T>>,
}

impl<T: ?Sized> Link<T> {
    /// An unwired link, `name` is used in errors and logs.
    pub fn new(name: &'static str) -> Self {
        Link {
            name,
            slot: OnceLock::new(),
        }
    }

    /// A link already pointing at `target`.
    pub fn to(name: &'static str, target: &Arc<T>) -> Self {
        Link {
            name,
            slot: OnceLock::from(Arc::downgrade(target)),
        }
    }

    /// Points this link at `target`. Fails if the link was already wired.
    pub fn wire(&self, target: &Arc<T>) -> Result<()> {
        self.slot
            .set(Arc::downgrade(target))
            .map_err(|_| Error::AlreadyWired(self.name))
    }

    pub fn is_wired(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Fails with [Error::NotWired] if [Self::wire] was never called.
    pub fn ensure_wired(&self) -> Result<()> {
        if self.is_wired() {
            Ok(())
        } else {
            Err(Error::NotWired(self.name))
        }
    }

    /// Resolves the collaborator, failing with [Error::NotWired] if it is
    /// unwired or its owner is gone.
    pub fn require(&self) -> Result<Arc<T>> {
        self.get().ok_or(Error::NotWired(self.name))
    }

    /// Resolves the collaborator, `None` if unwired or if its owner is gone.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.get().and_then(Weak::upgrade)
    }
}

impl<T: ?Sized> Clone for Link<T> {
    fn clone(&self) -> Self {
        Link {
            name: self.name,
            slot: self.slot.get().cloned().map(OnceLock::from).unwrap_or_default(),
        }
    }
}

impl<T: ?Sized> Debug for Link<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match self.slot.get() {
            None => "unwired",
            Some(weak) if weak.strong_count() == 0 => "dangling",
            Some(_) => "wired",
        };

        write!(f, "Link({}: {})", self.name, state)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_once() {
        let target = Arc::new(42);
        let link = Link::new("answer");

        assert!(link.get().is_none());
        assert!(matches!(link.ensure_wired(), Err(Error::NotWired("answer"))));

        link.wire(&target).unwrap();
        assert_eq!(link.get().as_deref(), Some(&42));

        assert!(matches!(
            link.wire(&Arc::new(7)),
            Err(Error::AlreadyWired("answer"))
        ));
    }

    #[test]
    fn dangling_after_owner_dropped() {
        let target = Arc::new(String::from("routing table"));
        let link = Link::new("routing_table");
        link.wire(&target).unwrap();

        let cloned = link.clone();
        drop(target);

        assert!(link.is_wired());
        assert!(link.get().is_none());
        assert!(cloned.get().is_none());
        assert_eq!(format!("{:?}", link), "Link(routing_table: dangling)");
    }
}
