//! Persistence for admins and their votes.
//!
//! Votes are kept in insertion order: the order of first vote per
//! (admin, policy) pair decides ties. Overwriting a vote keeps its position.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admin {
    pub name: String,
    pub activated: bool,
}

/// One admin's vote on one policy. `value` is in canonical string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyManaged {
    pub admin: String,
    pub policy: String,
    pub value: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Returns `false` if the admin already existed.
    async fn insert_admin(&self, name: &str) -> Result<bool, StoreError>;

    /// Returns `false` if no such admin existed. Does not touch votes.
    async fn remove_admin(&self, name: &str) -> Result<bool, StoreError>;

    async fn admin(&self, name: &str) -> Result<Option<Admin>, StoreError>;

    /// Returns `false` if no such admin existed.
    async fn set_activated(&self, name: &str, activated: bool) -> Result<bool, StoreError>;

    async fn admins(&self) -> Result<Vec<Admin>, StoreError>;

    /// Record or overwrite a vote. Returns the previous value.
    async fn upsert_vote(
        &self,
        admin: &str,
        policy: &str,
        value: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Returns whether a vote was removed.
    async fn delete_vote(&self, admin: &str, policy: &str) -> Result<bool, StoreError>;

    /// Votes on `policy`, in insertion order.
    async fn votes_for(&self, policy: &str) -> Result<Vec<PolicyManaged>, StoreError>;

    async fn votes_by(&self, admin: &str) -> Result<Vec<PolicyManaged>, StoreError>;

    /// Returns the policies that lost a vote.
    async fn delete_votes_by(&self, admin: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    admins: Vec<Admin>,
    votes: Vec<PolicyManaged>,
}

/// Volatile store for tests and daemons started without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn insert_admin(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| {
            if s.admins.iter().any(|a| a.name == name) {
                return false;
            }
            s.admins.push(Admin {
                name: name.to_string(),
                activated: true,
            });
            true
        }))
    }

    async fn remove_admin(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| {
            let before = s.admins.len();
            s.admins.retain(|a| a.name != name);
            s.admins.len() != before
        }))
    }

    async fn admin(&self, name: &str) -> Result<Option<Admin>, StoreError> {
        Ok(self.with_state(|s| s.admins.iter().find(|a| a.name == name).cloned()))
    }

    async fn set_activated(&self, name: &str, activated: bool) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| match s.admins.iter_mut().find(|a| a.name == name) {
            Some(admin) => {
                admin.activated = activated;
                true
            }
            None => false,
        }))
    }

    async fn admins(&self) -> Result<Vec<Admin>, StoreError> {
        Ok(self.with_state(|s| s.admins.clone()))
    }

    async fn upsert_vote(
        &self,
        admin: &str,
        policy: &str,
        value: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.with_state(|s| {
            match s
                .votes
                .iter_mut()
                .find(|v| v.admin == admin && v.policy == policy)
            {
                Some(vote) => Some(std::mem::replace(&mut vote.value, value.to_string())),
                None => {
                    s.votes.push(PolicyManaged {
                        admin: admin.to_string(),
                        policy: policy.to_string(),
                        value: value.to_string(),
                    });
                    None
                }
            }
        }))
    }

    async fn delete_vote(&self, admin: &str, policy: &str) -> Result<bool, StoreError> {
        Ok(self.with_state(|s| {
            let before = s.votes.len();
            s.votes
                .retain(|v| !(v.admin == admin && v.policy == policy));
            s.votes.len() != before
        }))
    }

    async fn votes_for(&self, policy: &str) -> Result<Vec<PolicyManaged>, StoreError> {
        Ok(self.with_state(|s| {
            s.votes
                .iter()
                .filter(|v| v.policy == policy)
                .cloned()
                .collect()
        }))
    }

    async fn votes_by(&self, admin: &str) -> Result<Vec<PolicyManaged>, StoreError> {
        Ok(self.with_state(|s| {
            s.votes
                .iter()
                .filter(|v| v.admin == admin)
                .cloned()
                .collect()
        }))
    }

    async fn delete_votes_by(&self, admin: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.with_state(|s| {
            let policies = s
                .votes
                .iter()
                .filter(|v| v.admin == admin)
                .map(|v| v.policy.clone())
                .collect();
            s.votes.retain(|v| v.admin != admin);
            policies
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admins_are_unique_and_start_activated() {
        let store = MemoryStore::new();
        assert!(store.insert_admin("alice").await.unwrap());
        assert!(!store.insert_admin("alice").await.unwrap());

        let alice = store.admin("alice").await.unwrap().unwrap();
        assert!(alice.activated);
        assert!(store.set_activated("alice", false).await.unwrap());
        assert!(!store.admin("alice").await.unwrap().unwrap().activated);
        assert!(!store.set_activated("bob", true).await.unwrap());
    }

    #[tokio::test]
    async fn overwritten_vote_keeps_its_position() {
        let store = MemoryStore::new();
        store.upsert_vote("alice", "bluetooth", "I/5").await.unwrap();
        store.upsert_vote("bob", "bluetooth", "I/10").await.unwrap();
        let previous = store.upsert_vote("alice", "bluetooth", "I/7").await.unwrap();
        assert_eq!(previous.as_deref(), Some("I/5"));

        let votes = store.votes_for("bluetooth").await.unwrap();
        let order: Vec<_> = votes.iter().map(|v| (v.admin.as_str(), v.value.as_str())).collect();
        assert_eq!(order, vec![("alice", "I/7"), ("bob", "I/10")]);
    }

    #[tokio::test]
    async fn deleting_admin_votes_reports_policies() {
        let store = MemoryStore::new();
        store.upsert_vote("alice", "bluetooth", "I/5").await.unwrap();
        store.upsert_vote("alice", "camera", "I/0").await.unwrap();
        store.upsert_vote("bob", "camera", "I/1").await.unwrap();

        let mut touched = store.delete_votes_by("alice").await.unwrap();
        touched.sort();
        assert_eq!(touched, vec!["bluetooth", "camera"]);
        assert!(store.votes_by("alice").await.unwrap().is_empty());
        assert_eq!(store.votes_for("camera").await.unwrap().len(), 1);
    }
}
