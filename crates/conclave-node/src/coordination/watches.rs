//! One-shot watch bookkeeping shared by the backends.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use conclave_common::{EventType, WatchedEvent};

use super::Watcher;

/// What a watch was armed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// `exists` on a live node
    Exists,
    /// `get_data`
    Data,
    /// `get_children`
    Children,
}

impl WatchKind {
    /// Kinds notified by an event on the watched path
    fn triggered_by(event_type: EventType) -> &'static [WatchKind] {
        match event_type {
            EventType::NodeCreated => &[WatchKind::Exists],
            EventType::NodeDeleted => &[WatchKind::Exists, WatchKind::Data, WatchKind::Children],
            EventType::NodeDataChanged => &[WatchKind::Exists, WatchKind::Data],
            EventType::NodeChildrenChanged => &[WatchKind::Children],
        }
    }
}

/// Outstanding watches of one client session
#[derive(Default)]
pub struct WatchRegistry {
    watches: Mutex<HashMap<(String, WatchKind), Vec<Watcher>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, WatchKind), Vec<Watcher>>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm a watch; re-arming the same channel is a no-op
    pub fn arm(&self, path: &str, kind: WatchKind, watcher: Watcher) {
        let mut watches = self.lock();
        let entry = watches.entry((path.to_string(), kind)).or_default();
        if !entry.iter().any(|w| w.same_channel(&watcher)) {
            entry.push(watcher);
        }
    }

    /// Remove a watch armed by this channel
    pub fn disarm(&self, path: &str, kind: WatchKind, watcher: &Watcher) {
        let mut watches = self.lock();
        let key = (path.to_string(), kind);
        if let Some(entry) = watches.get_mut(&key) {
            entry.retain(|w| !w.same_channel(watcher));
            if entry.is_empty() {
                watches.remove(&key);
            }
        }
    }

    /// Fire and consume every watch the event concerns.
    ///
    /// Returns the number of channels notified. A channel armed under several
    /// kinds on the same path is notified once.
    pub fn trigger(&self, event: &WatchedEvent) -> usize {
        let fired: Vec<Watcher> = {
            let mut watches = self.lock();
            WatchKind::triggered_by(event.event_type)
                .iter()
                .filter_map(|kind| watches.remove(&(event.path.clone(), *kind)))
                .flatten()
                .collect()
        };

        let mut notified: Vec<&Watcher> = Vec::with_capacity(fired.len());
        for watcher in &fired {
            if notified.iter().any(|w| w.same_channel(watcher)) {
                continue;
            }
            // A dropped receiver means the component is gone
            let _ = watcher.send(event.clone());
            notified.push(watcher);
        }

        notified.len()
    }

    /// Drop every outstanding watch
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of armed (path, kind) pairs
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::watch_channel;

    #[test]
    fn test_watch_is_one_shot() {
        let registry = WatchRegistry::new();
        let (tx, mut rx) = watch_channel();

        registry.arm("/election/c_0000000001", WatchKind::Exists, tx);
        let event = WatchedEvent::new(EventType::NodeDeleted, "/election/c_0000000001");

        assert_eq!(registry.trigger(&event), 1);
        assert_eq!(rx.try_recv().unwrap(), event);

        // Consumed: a second deletion notice reaches nobody
        assert_eq!(registry.trigger(&event), 0);
        assert!(rx.try_recv().is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_same_channel_is_deduplicated() {
        let registry = WatchRegistry::new();
        let (tx, mut rx) = watch_channel();

        registry.arm("/service_registry", WatchKind::Children, tx.clone());
        registry.arm("/service_registry", WatchKind::Children, tx.clone());
        registry.arm("/service_registry", WatchKind::Exists, tx);

        let event = WatchedEvent::new(EventType::NodeDeleted, "/service_registry");
        assert_eq!(registry.trigger(&event), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_children_change_leaves_exists_watch() {
        let registry = WatchRegistry::new();
        let (tx, mut rx) = watch_channel();

        registry.arm("/election", WatchKind::Exists, tx);
        let event = WatchedEvent::new(EventType::NodeChildrenChanged, "/election");

        assert_eq!(registry.trigger(&event), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_disarm() {
        let registry = WatchRegistry::new();
        let (tx, _rx) = watch_channel();

        registry.arm("/a", WatchKind::Data, tx.clone());
        registry.disarm("/a", WatchKind::Data, &tx);
        assert!(registry.is_empty());
    }
}
