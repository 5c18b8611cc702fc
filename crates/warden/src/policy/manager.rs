//! Aggregates administrators' votes into one effective value per policy.
//!
//! Every mutation takes the manager's write lock, updates the store, then
//! recomputes the affected policies. Policies whose effective value changed
//! are announced on the `changed` notification with (policy, value) once the
//! write lock is released, so a slow subscriber never stalls other mutations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::rmi::Notification;

use super::error::{PluginError, PolicyError};
use super::model::PolicyModel;
use super::provider::{LoadedProvider, ProviderLoader};
use super::store::{Admin, PolicyStore};
use super::value::PolicyValue;

pub const CHANGED_SIGNAL: &str = "PolicyManager::changed";

const MAX_ADMIN_LEN: usize = 255;

fn validate_admin(name: &str) -> Result<(), PolicyError> {
    if name.is_empty() || name.len() > MAX_ADMIN_LEN || name.chars().any(char::is_control) {
        return Err(PolicyError::InvalidAdmin(name.to_string()));
    }
    Ok(())
}

pub struct PolicyManager {
    index: DashMap<String, Arc<PolicyModel>>,
    store: Arc<dyn PolicyStore>,
    write_lock: tokio::sync::Mutex<()>,
    /// Orders change announcements; never held together with `write_lock`.
    publish_lock: tokio::sync::Mutex<()>,
    changed: Arc<Notification>,
    // Last: plugin libraries unload only after every model above is gone.
    providers: Mutex<Vec<LoadedProvider>>,
}

impl PolicyManager {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self {
            index: DashMap::new(),
            store,
            write_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
            changed: Arc::new(Notification::new(CHANGED_SIGNAL)),
            providers: Mutex::new(Vec::new()),
        }
    }

    /// Index every model of `loaded`. Fails without registering anything if a
    /// policy name is already taken.
    pub fn register(&self, loaded: LoadedProvider) -> Result<(), PolicyError> {
        let mut providers = self.providers.lock().unwrap_or_else(PoisonError::into_inner);
        let provider = loaded.provider();

        let mut seen = HashSet::new();
        for model in provider.models() {
            if self.index.contains_key(model.name()) || !seen.insert(model.name()) {
                return Err(PolicyError::Duplicate(model.name().to_string()));
            }
        }
        for model in provider.models() {
            self.index
                .insert(model.name().to_string(), Arc::clone(model));
        }

        tracing::info!(
            provider = provider.name(),
            policies = provider.models().len(),
            "Registered provider"
        );
        providers.push(loaded);
        Ok(())
    }

    /// Register everything `loader` yields. Conflicting providers are skipped.
    pub fn install(&self, loader: &dyn ProviderLoader) -> Result<usize, PluginError> {
        let mut registered = 0;
        for loaded in loader.load()? {
            let name = loaded.provider().name().to_string();
            match self.register(loaded) {
                Ok(()) => registered += 1,
                Err(e) => tracing::warn!(provider = %name, error = %e, "Skipping provider"),
            }
        }
        Ok(registered)
    }

    /// Rebuild every policy's cached value from the store.
    pub async fn load(&self) -> Result<(), PolicyError> {
        let _guard = self.write_lock.lock().await;
        let active = self.active_admins().await?;
        for model in self.models() {
            self.recompute(&model, &active).await?;
        }
        tracing::info!(policies = self.index.len(), admins = active.len(), "Policy state loaded");
        Ok(())
    }

    /// Returns `false` if the admin was already enrolled.
    pub async fn enroll(&self, admin: &str) -> Result<bool, PolicyError> {
        validate_admin(admin)?;
        let _guard = self.write_lock.lock().await;
        let added = self.store.insert_admin(admin).await?;
        if added {
            tracing::info!(admin, "Admin enrolled");
        } else {
            tracing::debug!(admin, "Admin already enrolled");
        }
        Ok(added)
    }

    /// Remove the admin and all their votes. Unknown admins are a no-op.
    pub async fn disenroll(&self, admin: &str) -> Result<bool, PolicyError> {
        let mut changed = Vec::new();
        let result = self.remove_admin(admin, &mut changed).await;
        self.publish(&changed).await;
        result
    }

    async fn remove_admin(
        &self,
        admin: &str,
        changed: &mut Vec<Arc<PolicyModel>>,
    ) -> Result<bool, PolicyError> {
        let _guard = self.write_lock.lock().await;
        if self.store.admin(admin).await?.is_none() {
            tracing::debug!(admin, "Disenroll of unknown admin ignored");
            return Ok(false);
        }

        let touched = self.store.delete_votes_by(admin).await?;
        self.store.remove_admin(admin).await?;
        tracing::info!(admin, policies = touched.len(), "Admin disenrolled");

        self.recompute_named(&touched, changed).await?;
        Ok(true)
    }

    pub async fn activate(&self, admin: &str) -> Result<(), PolicyError> {
        self.set_activated(admin, true).await
    }

    /// A deactivated admin stays enrolled but their votes stop counting.
    pub async fn deactivate(&self, admin: &str) -> Result<(), PolicyError> {
        self.set_activated(admin, false).await
    }

    async fn set_activated(&self, admin: &str, activated: bool) -> Result<(), PolicyError> {
        let mut changed = Vec::new();
        let result = self.update_activation(admin, activated, &mut changed).await;
        self.publish(&changed).await;
        result
    }

    async fn update_activation(
        &self,
        admin: &str,
        activated: bool,
        changed: &mut Vec<Arc<PolicyModel>>,
    ) -> Result<(), PolicyError> {
        let _guard = self.write_lock.lock().await;
        if !self.store.set_activated(admin, activated).await? {
            return Err(PolicyError::NotEnrolled(admin.to_string()));
        }
        tracing::info!(admin, activated, "Admin activation changed");

        let touched: Vec<String> = self
            .store
            .votes_by(admin)
            .await?
            .into_iter()
            .map(|vote| vote.policy)
            .collect();
        self.recompute_named(&touched, changed).await
    }

    /// Record `admin`'s vote on `policy` and recompute it.
    pub async fn set(
        &self,
        policy: &str,
        value: PolicyValue,
        admin: &str,
    ) -> Result<(), PolicyError> {
        let model = self.model(policy)?;
        let changed = self.record_vote(&model, value, admin).await?;
        if changed {
            self.publish(&[model]).await;
        }
        Ok(())
    }

    /// Returns whether the policy's effective value changed.
    async fn record_vote(
        &self,
        model: &Arc<PolicyModel>,
        value: PolicyValue,
        admin: &str,
    ) -> Result<bool, PolicyError> {
        let policy = model.name();
        if value.value_type() != model.value_type() {
            return Err(PolicyError::TypeMismatch {
                policy: policy.to_string(),
                expected: model.value_type(),
                found: value.value_type(),
            });
        }

        let _guard = self.write_lock.lock().await;
        let record = self
            .store
            .admin(admin)
            .await?
            .ok_or_else(|| PolicyError::NotEnrolled(admin.to_string()))?;
        if !record.activated {
            return Err(PolicyError::Deactivated(admin.to_string()));
        }

        let previous = self.store.upsert_vote(admin, policy, &value.dump()).await?;
        if let Err(e) = model.run_hook(&value) {
            tracing::warn!(policy, admin, %value, error = %e, "Vote rejected, rolling back");
            match previous {
                Some(previous) => {
                    self.store.upsert_vote(admin, policy, &previous).await?;
                }
                None => {
                    self.store.delete_vote(admin, policy).await?;
                }
            }
            return Err(e);
        }
        tracing::debug!(policy, admin, %value, "Vote recorded");

        let active = self.active_admins().await?;
        self.recompute(model, &active).await
    }

    /// Effective value: the strongest vote, or the initial value.
    pub fn get(&self, policy: &str) -> Result<PolicyValue, PolicyError> {
        Ok(self.model(policy)?.effective())
    }

    /// Every policy's effective value, sorted by name.
    pub fn get_all(&self) -> Vec<(String, PolicyValue)> {
        let mut all: Vec<_> = self
            .index
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().effective()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub async fn admins(&self) -> Result<Vec<Admin>, PolicyError> {
        Ok(self.store.admins().await?)
    }

    pub fn changed(&self) -> Arc<Notification> {
        Arc::clone(&self.changed)
    }

    fn model(&self, policy: &str) -> Result<Arc<PolicyModel>, PolicyError> {
        self.index
            .get(policy)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| PolicyError::UnknownPolicy(policy.to_string()))
    }

    fn models(&self) -> Vec<Arc<PolicyModel>> {
        self.index
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    async fn active_admins(&self) -> Result<HashSet<String>, PolicyError> {
        Ok(self
            .store
            .admins()
            .await?
            .into_iter()
            .filter(|admin| admin.activated)
            .map(|admin| admin.name)
            .collect())
    }

    /// Pushes every policy whose effective value changed onto `changed`.
    async fn recompute_named(
        &self,
        policies: &[String],
        changed: &mut Vec<Arc<PolicyModel>>,
    ) -> Result<(), PolicyError> {
        if policies.is_empty() {
            return Ok(());
        }
        let active = self.active_admins().await?;
        for policy in policies {
            match self.model(policy) {
                Ok(model) => {
                    if self.recompute(&model, &active).await? {
                        changed.push(model);
                    }
                }
                Err(_) => tracing::debug!(policy, "Skipping votes for unregistered policy"),
            }
        }
        Ok(())
    }

    /// Signal the current value of each changed policy. The value is read
    /// under the publish lock, so the last signal for a policy carries its
    /// latest value.
    async fn publish(&self, changed: &[Arc<PolicyModel>]) {
        if changed.is_empty() {
            return;
        }
        let _publishing = self.publish_lock.lock().await;
        for model in changed {
            let value = model.effective();
            if let Err(e) = self.changed.notify((model.name(), &value)).await {
                tracing::warn!(policy = model.name(), error = %e, "Change notification failed");
            }
        }
    }

    /// Caller holds the write lock. Returns whether the effective value changed.
    async fn recompute(
        &self,
        model: &PolicyModel,
        active: &HashSet<String>,
    ) -> Result<bool, PolicyError> {
        let votes = self.store.votes_for(model.name()).await?;
        let mut values = Vec::with_capacity(votes.len());
        for vote in votes {
            if !active.contains(&vote.admin) {
                continue;
            }
            match PolicyValue::parse(&vote.value) {
                Ok(value) if value.value_type() == model.value_type() => values.push(value),
                Ok(_) | Err(_) => tracing::warn!(
                    policy = model.name(),
                    admin = %vote.admin,
                    value = %vote.value,
                    "Ignoring unreadable vote"
                ),
            }
        }

        let winner = model.strongest(&values);
        let changed = model.set_current(winner);
        if changed {
            tracing::info!(policy = model.name(), value = %model.effective(), "Policy changed");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::provider::PolicyProvider;
    use crate::policy::store::MemoryStore;
    use crate::rmi::Subscriber;

    fn bluetooth() -> PolicyProvider {
        PolicyProvider::new("test")
            .with_model(PolicyModel::new("bluetooth", 1i64))
            .with_model(PolicyModel::new("wallpaper", "default"))
    }

    fn manager() -> PolicyManager {
        let manager = PolicyManager::new(Arc::new(MemoryStore::new()));
        manager.register(LoadedProvider::builtin(bluetooth())).unwrap();
        manager
    }

    #[tokio::test]
    async fn strongest_vote_wins_and_falls_back_on_disenroll() {
        let manager = manager();
        manager.enroll("a").await.unwrap();
        manager.enroll("b").await.unwrap();

        manager.set("bluetooth", PolicyValue::Int(5), "a").await.unwrap();
        manager.set("bluetooth", PolicyValue::Int(10), "b").await.unwrap();
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(10));

        manager.disenroll("b").await.unwrap();
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(5));

        manager.disenroll("a").await.unwrap();
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(1));
    }

    #[tokio::test]
    async fn enrollment_is_idempotent() {
        let manager = manager();
        assert!(manager.enroll("a").await.unwrap());
        assert!(!manager.enroll("a").await.unwrap());
        assert_eq!(manager.admins().await.unwrap().len(), 1);

        assert!(!manager.disenroll("ghost").await.unwrap());
        assert_eq!(manager.admins().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_admin_names_are_rejected() {
        let manager = manager();
        assert!(matches!(
            manager.enroll("").await,
            Err(PolicyError::InvalidAdmin(_))
        ));
        assert!(matches!(
            manager.enroll("bad\nname").await,
            Err(PolicyError::InvalidAdmin(_))
        ));
    }

    #[tokio::test]
    async fn set_validates_policy_admin_and_type() {
        let manager = manager();
        manager.enroll("a").await.unwrap();

        assert!(matches!(
            manager.set("wifi", PolicyValue::Int(1), "a").await,
            Err(PolicyError::UnknownPolicy(_))
        ));
        assert!(matches!(
            manager.set("bluetooth", PolicyValue::Int(1), "nobody").await,
            Err(PolicyError::NotEnrolled(_))
        ));
        assert!(matches!(
            manager.set("bluetooth", PolicyValue::from("on"), "a").await,
            Err(PolicyError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn string_policies_compare_lexicographically() {
        let manager = manager();
        manager.enroll("a").await.unwrap();
        manager.enroll("b").await.unwrap();
        assert_eq!(manager.get("wallpaper").unwrap(), PolicyValue::from("default"));

        manager.set("wallpaper", "beach".into(), "a").await.unwrap();
        manager.set("wallpaper", "alps".into(), "b").await.unwrap();
        assert_eq!(manager.get("wallpaper").unwrap(), PolicyValue::from("beach"));
    }

    #[tokio::test]
    async fn deactivated_admin_votes_stop_counting() {
        let manager = manager();
        manager.enroll("a").await.unwrap();
        manager.enroll("b").await.unwrap();
        manager.set("bluetooth", PolicyValue::Int(5), "a").await.unwrap();
        manager.set("bluetooth", PolicyValue::Int(10), "b").await.unwrap();

        manager.deactivate("b").await.unwrap();
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(5));
        assert!(matches!(
            manager.set("bluetooth", PolicyValue::Int(20), "b").await,
            Err(PolicyError::Deactivated(_))
        ));

        manager.activate("b").await.unwrap();
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(10));
        assert!(matches!(
            manager.activate("ghost").await,
            Err(PolicyError::NotEnrolled(_))
        ));
    }

    #[tokio::test]
    async fn rejected_value_rolls_back_vote() {
        let store = Arc::new(MemoryStore::new());
        let manager = PolicyManager::new(store.clone());
        let provider = PolicyProvider::new("strict").with_model(
            PolicyModel::new("camera", 0i64).on_changed(|value| match value.as_int() {
                Some(n) if n > 1 => Err(format!("{n} is not 0 or 1")),
                _ => Ok(()),
            }),
        );
        manager.register(LoadedProvider::builtin(provider)).unwrap();
        manager.enroll("a").await.unwrap();

        manager.set("camera", PolicyValue::Int(1), "a").await.unwrap();
        assert!(matches!(
            manager.set("camera", PolicyValue::Int(7), "a").await,
            Err(PolicyError::Rejected { .. })
        ));
        assert_eq!(manager.get("camera").unwrap(), PolicyValue::Int(1));
        let votes = store.votes_for("camera").await.unwrap();
        assert_eq!(votes[0].value, "I/1");
    }

    #[tokio::test]
    async fn duplicate_policy_names_are_rejected() {
        let manager = manager();
        let clash = PolicyProvider::new("clash")
            .with_model(PolicyModel::new("camera", 0i64))
            .with_model(PolicyModel::new("bluetooth", 0i64));
        assert!(matches!(
            manager.register(LoadedProvider::builtin(clash)),
            Err(PolicyError::Duplicate(name)) if name == "bluetooth"
        ));
        // Nothing from the conflicting provider was indexed.
        assert!(manager.get("camera").is_err());
    }

    #[tokio::test]
    async fn load_restores_votes_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.insert_admin("a").await.unwrap();
        store.upsert_vote("a", "bluetooth", "I/7").await.unwrap();
        store.upsert_vote("a", "retired", "I/3").await.unwrap();

        let manager = PolicyManager::new(store);
        manager.register(LoadedProvider::builtin(bluetooth())).unwrap();
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(1));

        manager.load().await.unwrap();
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(7));
    }

    #[tokio::test]
    async fn get_all_is_sorted() {
        let manager = manager();
        let names: Vec<_> = manager.get_all().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["bluetooth", "wallpaper"]);
    }

    #[tokio::test]
    async fn effective_changes_are_signalled() {
        let manager = manager();
        let (id, fd) = manager.changed().create_subscriber().await.unwrap();
        let mut subscriber = Subscriber::from_fd(id, CHANGED_SIGNAL, fd).unwrap();

        manager.enroll("a").await.unwrap();
        manager.set("bluetooth", PolicyValue::Int(3), "a").await.unwrap();
        // Same winner again: no signal.
        manager.set("bluetooth", PolicyValue::Int(3), "a").await.unwrap();
        manager.disenroll("a").await.unwrap();
        drop(manager);

        let first: Option<(String, PolicyValue)> = subscriber.recv().await.unwrap();
        assert_eq!(first, Some(("bluetooth".to_string(), PolicyValue::Int(3))));
        let second: Option<(String, PolicyValue)> = subscriber.recv().await.unwrap();
        assert_eq!(second, Some(("bluetooth".to_string(), PolicyValue::Int(1))));
        let end: Option<(String, PolicyValue)> = subscriber.recv().await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn tie_keeps_existing_winner() {
        let manager = PolicyManager::new(Arc::new(MemoryStore::new()));
        let provider = PolicyProvider::new("lengths").with_model(
            PolicyModel::new("motto", "-")
                .with_comparator(|a, b| a.to_string().len().cmp(&b.to_string().len())),
        );
        manager.register(LoadedProvider::builtin(provider)).unwrap();
        manager.enroll("a").await.unwrap();
        manager.enroll("b").await.unwrap();

        manager.set("motto", "xy".into(), "a").await.unwrap();
        manager.set("motto", "ab".into(), "b").await.unwrap();
        assert_eq!(manager.get("motto").unwrap(), PolicyValue::from("xy"));

        // a's weaker vote hands the win to b.
        manager.set("motto", "c".into(), "a").await.unwrap();
        assert_eq!(manager.get("motto").unwrap(), PolicyValue::from("ab"));

        // a's earlier-recorded vote only ties, so b keeps the win.
        manager.set("motto", "zz".into(), "a").await.unwrap();
        assert_eq!(manager.get("motto").unwrap(), PolicyValue::from("ab"));

        manager.set("motto", "zzz".into(), "a").await.unwrap();
        assert_eq!(manager.get("motto").unwrap(), PolicyValue::from("zzz"));
    }

    #[tokio::test]
    async fn pending_signal_does_not_block_mutations() {
        let manager = Arc::new(manager());
        let (id, fd) = manager.changed().create_subscriber().await.unwrap();
        let mut subscriber = Subscriber::from_fd(id, CHANGED_SIGNAL, fd).unwrap();
        manager.enroll("a").await.unwrap();

        let publishing = manager.publish_lock.lock().await;
        let setter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                manager
                    .set("bluetooth", PolicyValue::Int(8), "a")
                    .await
                    .unwrap()
            })
        };

        // The vote lands while its signal is still waiting to go out.
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while manager.get("bluetooth").unwrap() != PolicyValue::Int(8) {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), manager.enroll("b"))
            .await
            .unwrap()
            .unwrap();
        assert!(!setter.is_finished());

        drop(publishing);
        setter.await.unwrap();
        let got: Option<(String, PolicyValue)> = subscriber.recv().await.unwrap();
        assert_eq!(got, Some(("bluetooth".to_string(), PolicyValue::Int(8))));
    }

    #[tokio::test]
    async fn concurrent_admins_do_not_lose_updates() {
        let manager = Arc::new(manager());
        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8i64 {
            let manager = Arc::clone(&manager);
            tasks.spawn(async move {
                let admin = format!("admin-{n}");
                manager.enroll(&admin).await.unwrap();
                for m in 0..5i64 {
                    manager
                        .set("bluetooth", PolicyValue::Int(n * 10 + m), &admin)
                        .await
                        .unwrap();
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        assert_eq!(manager.admins().await.unwrap().len(), 8);
        assert_eq!(manager.get("bluetooth").unwrap(), PolicyValue::Int(74));
    }
}
