//! Ordered, best-effort release of acquired resources.
//!
//! Release actions are pushed as resources are acquired and run in reverse
//! on both the success and the failure path. A failing action never stops
//! the ones after it; all failures come back as one [`Error::Teardown`].

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, warn};

use crate::error::{ErrorList, Result};

type ReleaseFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type ReleaseFn = Box<dyn FnOnce() -> ReleaseFuture + Send>;

#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<(String, ReleaseFn)>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action for a resource that was just acquired
    pub fn push<F, Fut>(&mut self, name: impl Into<String>, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions
            .push((name.into(), Box::new(move || Box::pin(release()))));
    }

    /// Forget every action without running it, once ownership of the
    /// resources has moved elsewhere.
    pub fn disarm(&mut self) {
        self.actions.clear();
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run every action, newest first, collecting failures.
    pub async fn unwind(&mut self) -> Result<()> {
        let mut errors = ErrorList::new();
        while let Some((name, release)) = self.actions.pop() {
            debug!(step = %name, "releasing");
            if let Err(e) = release().await {
                warn!(step = %name, error = %e, "release failed, continuing");
                errors.extend_from(&name, e);
            }
        }
        errors.into_result()
    }
}

impl Drop for CleanupStack {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            let names: Vec<&str> = self.actions.iter().map(|(n, _)| n.as_str()).collect();
            warn!(pending = ?names, "cleanup stack dropped without unwinding");
        }
    }
}
