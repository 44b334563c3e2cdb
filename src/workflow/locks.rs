//! Per-project advisory locks.
//!
//! Phase creation and command execution for one project must never overlap.
//! Each project id maps to its own async mutex; holding the returned
//! `ProjectGuard` is the proof that the caller owns the project.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct ProjectLocks {
    locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

/// Exclusive ownership of one project until dropped.
pub struct ProjectGuard {
    project_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl ProjectGuard {
    pub fn project_id(&self) -> i64 {
        self.project_id
    }
}

impl std::fmt::Debug for ProjectGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectGuard")
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the project is free, then take it.
    pub async fn lock(&self, project_id: i64) -> ProjectGuard {
        let mutex = self.entry(project_id).await;
        let guard = mutex.lock_owned().await;
        ProjectGuard {
            project_id,
            _guard: guard,
        }
    }

    /// Take the project only if nobody holds it.
    #[cfg(test)]
    pub async fn try_lock(&self, project_id: i64) -> Option<ProjectGuard> {
        let mutex = self.entry(project_id).await;
        let guard = mutex.try_lock_owned().ok()?;
        Some(ProjectGuard {
            project_id,
            _guard: guard,
        })
    }

    async fn entry(&self, project_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_project_is_exclusive() {
        let locks = ProjectLocks::new();
        let guard = locks.lock(1).await;
        assert_eq!(guard.project_id(), 1);
        assert!(locks.try_lock(1).await.is_none());
        drop(guard);
        assert!(locks.try_lock(1).await.is_some());
    }

    #[tokio::test]
    async fn different_projects_do_not_block() {
        let locks = ProjectLocks::new();
        let _a = locks.lock(1).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(2)).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = ProjectLocks::new();
        let guard = locks.lock(7).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.lock(7).await.project_id() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.unwrap(), 7);
    }
}
