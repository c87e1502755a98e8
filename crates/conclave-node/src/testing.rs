//! Test doubles for coordination races.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use conclave_common::{CoordinationError, CreateMode, NodeStat, SessionState};
use tokio::sync::watch;

use crate::coordination::{Coordinator, MemoryCoordinator, MemoryEnsemble, Watcher};

/// Wraps a memory session, counting calls and injecting deletions by
/// another session at precise points.
pub struct InterceptCoordinator {
    inner: MemoryCoordinator,
    saboteur: MemoryCoordinator,
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub exists_calls: AtomicUsize,
    pub listings: AtomicUsize,
    /// Deleted right after the next `get_children` returns
    vanish_after_listing: Mutex<Option<String>>,
    /// Deleted right after `exists` reports it present
    vanish_after_exists: Mutex<Option<String>>,
    /// `exists` always reports this path absent
    hidden: Mutex<Option<String>>,
    /// Returned by the next `get_children` instead of a listing
    listing_failure: Mutex<Option<CoordinationError>>,
}

impl InterceptCoordinator {
    pub fn new(ensemble: &MemoryEnsemble) -> Self {
        Self {
            inner: ensemble.connect(),
            saboteur: ensemble.connect(),
            creates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            exists_calls: AtomicUsize::new(0),
            listings: AtomicUsize::new(0),
            vanish_after_listing: Mutex::new(None),
            vanish_after_exists: Mutex::new(None),
            hidden: Mutex::new(None),
            listing_failure: Mutex::new(None),
        }
    }

    pub fn vanish_after_listing(&self, path: &str) {
        *self.vanish_after_listing.lock().unwrap() = Some(path.to_string());
    }

    pub fn vanish_after_exists(&self, path: &str) {
        *self.vanish_after_exists.lock().unwrap() = Some(path.to_string());
    }

    pub fn fail_next_listing(&self, error: CoordinationError) {
        *self.listing_failure.lock().unwrap() = Some(error);
    }

    pub fn hide(&self, path: &str) {
        *self.hidden.lock().unwrap() = Some(path.to_string());
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn sabotage(&self, slot: &Mutex<Option<String>>, path: Option<&str>) {
        let victim = {
            let mut slot = slot.lock().unwrap();
            match (slot.as_deref(), path) {
                (Some(_), None) => slot.take(),
                (Some(v), Some(p)) if v == p => slot.take(),
                _ => None,
            }
        };
        if let Some(victim) = victim {
            let _ = self.saboteur.delete(&victim, None).await;
        }
    }
}

#[async_trait]
impl Coordinator for InterceptCoordinator {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create(path, data, mode).await
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(path, version).await
    }

    async fn exists(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Option<NodeStat>, CoordinationError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let hidden = self.hidden.lock().unwrap().as_deref() == Some(path);
        if hidden {
            return Ok(None);
        }
        let stat = self.inner.exists(path, watch).await?;
        if stat.is_some() {
            self.sabotage(&self.vanish_after_exists, Some(path)).await;
        }
        Ok(stat)
    }

    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<String>, CoordinationError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        let failure = self.listing_failure.lock().unwrap().take();
        if let Some(error) = failure {
            return Err(error);
        }
        let children = self.inner.get_children(path, watch).await?;
        self.sabotage(&self.vanish_after_listing, None).await;
        Ok(children)
    }

    async fn get_data(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<u8>, CoordinationError> {
        self.inner.get_data(path, watch).await
    }

    fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.inner.session_state()
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        self.inner.close().await
    }
}
