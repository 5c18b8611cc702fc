use std::path::PathBuf;

use warden::service::DEFAULT_SOCKET;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub socket: PathBuf,
    /// SQLite database for admins and votes. State is kept in memory when unset.
    pub database: Option<PathBuf>,
    /// Directory scanned for provider plugins. The built-in providers are used
    /// when unset.
    pub plugin_dir: Option<PathBuf>,
    /// Accept a listening socket passed by the service manager.
    pub socket_activation: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET),
            database: None,
            plugin_dir: None,
            socket_activation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_config_default() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket, PathBuf::from("/run/warden/warden.sock"));
        assert!(config.database.is_none());
        assert!(config.plugin_dir.is_none());
        assert!(config.socket_activation);
    }
}
