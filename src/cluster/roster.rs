//! Registry of a cluster's live members, with all-or-nothing batch launch.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, ErrorList, Result};

/// Something the roster can track and tear down.
#[async_trait]
pub trait Member: Send + Sync + 'static {
    fn member_id(&self) -> Uuid;
    async fn destroy(&self) -> Result<()>;
}

#[async_trait]
impl Member for crate::qemu::Machine {
    fn member_id(&self) -> Uuid {
        self.id()
    }

    async fn destroy(&self) -> Result<()> {
        crate::qemu::Machine::destroy(self).await
    }
}

pub struct Roster<M: Member> {
    members: Mutex<Vec<Arc<M>>>,
}

impl<M: Member> Default for Roster<M> {
    fn default() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }
}

impl<M: Member> Roster<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, member: Arc<M>) {
        debug!(member = %member.member_id(), "registered");
        self.members.lock().await.push(member);
    }

    pub async fn remove(&self, id: Uuid) -> Option<Arc<M>> {
        let mut members = self.members.lock().await;
        let pos = members.iter().position(|m| m.member_id() == id)?;
        Some(members.remove(pos))
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<M>> {
        self.members
            .lock()
            .await
            .iter()
            .find(|m| m.member_id() == id)
            .cloned()
    }

    /// Members in registration order
    pub async fn list(&self) -> Vec<Arc<M>> {
        self.members.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.lock().await.is_empty()
    }

    /// Unregister and destroy one member.
    pub async fn destroy_member(&self, id: Uuid) -> Result<()> {
        let member = self
            .remove(id)
            .await
            .ok_or_else(|| Error::NotFound(format!("member {}", id)))?;
        member.destroy().await
    }

    /// Destroy every member, newest first, collecting failures.
    pub async fn destroy_all(&self) -> Result<()> {
        let members: Vec<Arc<M>> = std::mem::take(&mut *self.members.lock().await);
        let mut errors = ErrorList::new();
        for member in members.into_iter().rev() {
            if let Err(e) = member.destroy().await {
                errors.extend_from(format!("member {}", member.member_id()), e);
            }
        }
        errors.into_result()
    }

    /// Launch one member per spec concurrently.
    ///
    /// Either every launch succeeds and all are registered, or none remain:
    /// successes are removed and destroyed again and the error of the
    /// lowest-indexed failed spec is returned.
    pub async fn launch_all<T, F, Fut>(&self, specs: Vec<T>, launch: F) -> Result<Vec<Arc<M>>>
    where
        T: Send + 'static,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<Arc<M>>> + Send + 'static,
    {
        let count = specs.len();
        let mut tasks = JoinSet::new();
        for (index, spec) in specs.into_iter().enumerate() {
            let fut = launch(spec);
            tasks.spawn(async move { (index, fut.await) });
        }

        let mut launched: Vec<Option<Arc<M>>> = (0..count).map(|_| None).collect();
        let mut failures: Vec<(usize, Error)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(member))) => {
                    self.register(member.clone()).await;
                    launched[index] = Some(member);
                }
                Ok((index, Err(e))) => failures.push((index, e)),
                Err(e) => {
                    failures.push((usize::MAX, Error::Resource(format!("launch task: {}", e))))
                }
            }
        }

        if failures.is_empty() {
            return Ok(launched.into_iter().flatten().collect());
        }

        failures.sort_by_key(|(index, _)| *index);
        warn!(
            failed = failures.len(),
            launched = launched.iter().flatten().count(),
            "batch launch failed, rolling back"
        );
        for member in launched.into_iter().flatten() {
            self.remove(member.member_id()).await;
            if let Err(e) = member.destroy().await {
                warn!(member = %member.member_id(), error = %e, "rollback destroy failed");
            }
        }
        let (_, first) = failures.swap_remove(0);
        Err(first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Fake {
        id: Uuid,
        destroyed: AtomicBool,
        fail_destroy: bool,
    }

    impl Fake {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Uuid::new_v4(),
                destroyed: AtomicBool::new(false),
                fail_destroy: false,
            })
        }
    }

    #[async_trait]
    impl Member for Fake {
        fn member_id(&self) -> Uuid {
            self.id
        }

        async fn destroy(&self) -> Result<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            if self.fail_destroy {
                return Err(Error::Resource("tap busy".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_remove() {
        let roster = Roster::new();
        let a = Fake::new();
        let b = Fake::new();
        roster.register(a.clone()).await;
        roster.register(b.clone()).await;
        assert_eq!(roster.len().await, 2);
        assert!(roster.get(a.id).await.is_some());

        roster.destroy_member(a.id).await.unwrap();
        assert!(a.destroyed.load(Ordering::SeqCst));
        assert!(roster.get(a.id).await.is_none());
        assert!(matches!(
            roster.destroy_member(a.id).await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(roster.list().await[0].id, b.id);
    }

    #[tokio::test]
    async fn test_launch_all_success() {
        let roster: Roster<Fake> = Roster::new();
        let members = roster
            .launch_all(vec![1, 2, 3], |_| async { Ok(Fake::new()) })
            .await
            .unwrap();
        assert_eq!(members.len(), 3);
        assert_eq!(roster.len().await, 3);
    }

    #[tokio::test]
    async fn test_launch_all_rolls_back_on_failure() {
        let roster: Roster<Fake> = Roster::new();
        let made = Arc::new(std::sync::Mutex::new(Vec::new()));

        let record = made.clone();
        let err = roster
            .launch_all(vec![0, 1, 2], move |n| {
                let record = record.clone();
                async move {
                    if n == 1 {
                        return Err(Error::NotFound("backing file /missing.qcow2".into()));
                    }
                    let member = Fake::new();
                    record.lock().unwrap().push(member.clone());
                    Ok(member)
                }
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("/missing.qcow2"));
        assert!(roster.is_empty().await);
        let made = made.lock().unwrap();
        assert_eq!(made.len(), 2);
        assert!(made.iter().all(|m| m.destroyed.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn test_launch_all_reports_lowest_index_error() {
        let roster: Roster<Fake> = Roster::new();
        let err = roster
            .launch_all(vec![0u64, 1, 2], |n| async move {
                // Later specs fail first
                tokio::time::sleep(std::time::Duration::from_millis(30 * (3 - n))).await;
                Err::<Arc<Fake>, _>(Error::Configuration(format!("spec {}", n)))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "configuration error: spec 0");
    }

    #[tokio::test]
    async fn test_destroy_all_collects_errors() {
        let roster = Roster::new();
        let ok = Fake::new();
        let bad = Arc::new(Fake {
            id: Uuid::new_v4(),
            destroyed: AtomicBool::new(false),
            fail_destroy: true,
        });
        roster.register(ok.clone()).await;
        roster.register(bad.clone()).await;

        let err = roster.destroy_all().await.unwrap_err();
        assert!(matches!(err, Error::Teardown(ref e) if e.len() == 1));
        assert!(ok.destroyed.load(Ordering::SeqCst));
        assert!(bad.destroyed.load(Ordering::SeqCst));
        assert!(roster.is_empty().await);
    }
}
