//! Save notifications shared between contexts.
//!
//! # Responsibility
//! - Carry the keys committed by one context's successful save.
//! - Fan notifications out to any number of subscribers without the
//!   publishing context knowing who they are.
//!
//! # Invariants
//! - A notification is only posted after the store reported a successful save.
//! - Dropped receivers are pruned on the next post.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one `ObjectContext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Payload posted after a context saved successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDidSave {
    /// Context that performed the save.
    pub source: ContextId,
    /// Keys whose records were written.
    pub saved_keys: BTreeSet<String>,
    /// Keys whose records were removed.
    pub deleted_keys: BTreeSet<String>,
}

impl ContextDidSave {
    pub fn is_empty(&self) -> bool {
        self.saved_keys.is_empty() && self.deleted_keys.is_empty()
    }
}

/// Publish/subscribe bus for [`ContextDidSave`] notifications.
///
/// Cloning yields another handle to the same subscriber list.
#[derive(Debug, Clone, Default)]
pub struct SaveNotifier {
    subscribers: Arc<Mutex<Vec<Sender<ContextDidSave>>>>,
}

impl SaveNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber; every later post is delivered to it.
    pub fn subscribe(&self) -> Receiver<ContextDidSave> {
        let (sender, receiver) = mpsc::channel();
        self.lock_subscribers().push(sender);
        receiver
    }

    /// Delivers `notification` to every live subscriber.
    ///
    /// Returns the number of subscribers reached.
    pub fn post(&self, notification: &ContextDidSave) -> usize {
        let mut subscribers = self.lock_subscribers();
        subscribers.retain(|sender| sender.send(notification.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, Vec<Sender<ContextDidSave>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextDidSave, ContextId, SaveNotifier};
    use std::collections::BTreeSet;

    fn notification(saved: &[&str]) -> ContextDidSave {
        ContextDidSave {
            source: ContextId::next(),
            saved_keys: saved.iter().map(|key| key.to_string()).collect(),
            deleted_keys: BTreeSet::new(),
        }
    }

    #[test]
    fn post_reaches_every_subscriber() {
        let notifier = SaveNotifier::new();
        let first = notifier.subscribe();
        let second = notifier.clone().subscribe();

        let note = notification(&["u1"]);
        assert_eq!(notifier.post(&note), 2);
        assert_eq!(first.try_recv().unwrap(), note);
        assert_eq!(second.try_recv().unwrap(), note);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let notifier = SaveNotifier::new();
        let kept = notifier.subscribe();
        drop(notifier.subscribe());

        assert_eq!(notifier.post(&notification(&["u1"])), 1);
        assert_eq!(notifier.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn context_ids_are_unique() {
        assert_ne!(ContextId::next(), ContextId::next());
    }
}
