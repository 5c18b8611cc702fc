//! The `bluetooth` policy.
//!
//! Built as a shared object for the daemon's plugin directory and as an rlib
//! for daemons that link it in.

use warden::policy::{PolicyModel, PolicyProvider, PolicyValue};

pub const POLICY: &str = "bluetooth";

/// Enabled unless an administrator says otherwise.
pub const INITIAL: i64 = 1;

fn apply(value: &PolicyValue) -> Result<(), String> {
    match value.as_int() {
        Some(level) if level >= 0 => {
            tracing::info!(policy = POLICY, level, "Bluetooth policy applied");
            Ok(())
        }
        Some(level) => Err(format!("bluetooth level must not be negative, got {level}")),
        None => Err(format!("bluetooth level must be an integer, got {value}")),
    }
}

pub fn provider() -> PolicyProvider {
    PolicyProvider::new("bluetooth").with_model(PolicyModel::new(POLICY, INITIAL).on_changed(apply))
}

warden::declare_provider!(provider);
