//! The policy manager exposed over RMI, and a typed client for it.

use std::path::Path;
use std::sync::Arc;

use crate::policy::{Admin, CHANGED_SIGNAL, PolicyError, PolicyManager, PolicyValue};
use crate::rmi::{Client, RmiError, Server, Subscriber};

/// Where the daemon listens unless told otherwise.
pub const DEFAULT_SOCKET: &str = "/run/warden/warden.sock";

pub const GET: &str = "PolicyManager::get";
pub const SET: &str = "PolicyManager::set";
pub const GET_ALL: &str = "PolicyManager::getAll";
pub const ENROLL: &str = "PolicyManager::enroll";
pub const DISENROLL: &str = "PolicyManager::disenroll";
pub const ACTIVATE: &str = "PolicyManager::activate";
pub const DEACTIVATE: &str = "PolicyManager::deactivate";
pub const ADMINS: &str = "PolicyManager::admins";

pub struct PolicyService;

impl PolicyService {
    /// Expose `manager`'s operations and its change notification on `server`.
    pub fn bind(server: &mut Server, manager: Arc<PolicyManager>) {
        let m = Arc::clone(&manager);
        server.expose(GET, move |(policy,): (String,)| {
            let m = Arc::clone(&m);
            async move { m.get(&policy) }
        });

        let m = Arc::clone(&manager);
        server.expose(
            SET,
            move |(policy, value, admin): (String, PolicyValue, String)| {
                let m = Arc::clone(&m);
                async move { m.set(&policy, value, &admin).await }
            },
        );

        let m = Arc::clone(&manager);
        server.expose(GET_ALL, move |(): ()| {
            let m = Arc::clone(&m);
            async move { Ok::<_, PolicyError>(m.get_all()) }
        });

        let m = Arc::clone(&manager);
        server.expose(ENROLL, move |(admin,): (String,)| {
            let m = Arc::clone(&m);
            async move { m.enroll(&admin).await }
        });

        let m = Arc::clone(&manager);
        server.expose(DISENROLL, move |(admin,): (String,)| {
            let m = Arc::clone(&m);
            async move { m.disenroll(&admin).await }
        });

        let m = Arc::clone(&manager);
        server.expose(ACTIVATE, move |(admin,): (String,)| {
            let m = Arc::clone(&m);
            async move { m.activate(&admin).await }
        });

        let m = Arc::clone(&manager);
        server.expose(DEACTIVATE, move |(admin,): (String,)| {
            let m = Arc::clone(&m);
            async move { m.deactivate(&admin).await }
        });

        let m = Arc::clone(&manager);
        server.expose(ADMINS, move |(): ()| {
            let m = Arc::clone(&m);
            async move {
                let admins = m.admins().await?;
                Ok::<_, PolicyError>(
                    admins
                        .into_iter()
                        .map(|admin| (admin.name, admin.activated))
                        .collect::<Vec<_>>(),
                )
            }
        });

        server.register_notification(manager.changed());
        tracing::debug!(signal = CHANGED_SIGNAL, "Policy service bound");
    }
}

/// Typed calls against a daemon running [`PolicyService`].
#[derive(Debug)]
pub struct PolicyClient {
    client: Client,
}

impl PolicyClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, RmiError> {
        Ok(Self::new(Client::connect(path).await?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn get(&self, policy: &str) -> Result<PolicyValue, RmiError> {
        self.client.invoke(GET, (policy,)).await
    }

    pub async fn set(&self, policy: &str, value: PolicyValue, admin: &str) -> Result<(), RmiError> {
        self.client.invoke(SET, (policy, value, admin)).await
    }

    pub async fn get_all(&self) -> Result<Vec<(String, PolicyValue)>, RmiError> {
        self.client.invoke(GET_ALL, ()).await
    }

    pub async fn enroll(&self, admin: &str) -> Result<bool, RmiError> {
        self.client.invoke(ENROLL, (admin,)).await
    }

    pub async fn disenroll(&self, admin: &str) -> Result<bool, RmiError> {
        self.client.invoke(DISENROLL, (admin,)).await
    }

    pub async fn activate(&self, admin: &str) -> Result<(), RmiError> {
        self.client.invoke(ACTIVATE, (admin,)).await
    }

    pub async fn deactivate(&self, admin: &str) -> Result<(), RmiError> {
        self.client.invoke(DEACTIVATE, (admin,)).await
    }

    pub async fn admins(&self) -> Result<Vec<Admin>, RmiError> {
        let rows: Vec<(String, bool)> = self.client.invoke(ADMINS, ()).await?;
        Ok(rows
            .into_iter()
            .map(|(name, activated)| Admin { name, activated })
            .collect())
    }

    /// Stream of (policy, value) change signals.
    pub async fn subscribe_changes(&self) -> Result<Subscriber, RmiError> {
        self.client.subscribe(CHANGED_SIGNAL).await
    }
}
