use tracing::{event, Level};

/// Default site tag used for cloud registration when the environment
/// does not override it.
pub const DEFAULT_SITE_TAG: &str = "ContainerLab";

/// Initial-configuration values for one boot attempt.
///
/// Sourced once from the process environment (namespaced by the
/// appliance family's prefix) plus the caller-supplied hostname, and
/// immutable afterwards. An empty string means "omit this field from
/// the configuration script".
#[derive(Debug, Clone)]
pub struct ApplianceConfig {
    pub hostname: String,
    pub admin_password: String,
    pub registration_key: String,
    pub account_name: String,
    pub site_tag: String,
    pub portal_hostname: String,
}

fn env_or_default(prefix: &str, name: &str, default: &str) -> String {
    std::env::var(format!("{prefix}_{name}")).unwrap_or_else(|_| default.to_string())
}

impl ApplianceConfig {
    /// Snapshot the `<prefix>_*` configuration variables from the
    /// environment.
    pub fn from_env(prefix: &str, hostname: &str) -> ApplianceConfig {
        ApplianceConfig {
            hostname: hostname.to_string(),
            admin_password: env_or_default(prefix, "ADMIN_PASSWORD", ""),
            registration_key: env_or_default(prefix, "REGISTRATION_KEY", ""),
            account_name: env_or_default(prefix, "ACCOUNT_NAME", ""),
            site_tag: env_or_default(prefix, "SITE_TAG", DEFAULT_SITE_TAG),
            portal_hostname: env_or_default(prefix, "PORTAL_HOSTNAME", ""),
        }
    }

    /// Whether the scripted configuration dialogue should run at
    /// all. Presence of either credential variable is the gate; with
    /// neither set, the appliance is left at factory defaults.
    pub fn wants_configuration(&self) -> bool {
        if self.admin_password.is_empty() && self.registration_key.is_empty() {
            event!(
                Level::INFO,
                "No configuration environment variables set, skipping initial config"
            );
            false
        } else {
            true
        }
    }

    /// Registration requires both the key and the account name.
    /// Partial credentials are silently skipped, not an error.
    pub fn registration_credentials(&self) -> Option<(&str, &str)> {
        if self.registration_key.is_empty() || self.account_name.is_empty() {
            None
        } else {
            Some((&self.registration_key, &self.account_name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own env prefix: the test harness runs tests
    // concurrently in one process, and the environment is global.

    #[test]
    fn defaults_apply_when_env_unset() {
        let config = ApplianceConfig::from_env("VRLABTEST_UNSET", "ecos1");

        assert_eq!(config.hostname, "ecos1");
        assert_eq!(config.site_tag, DEFAULT_SITE_TAG);
        assert!(config.admin_password.is_empty());
        assert!(!config.wants_configuration());
        assert!(config.registration_credentials().is_none());
    }

    #[test]
    fn env_values_are_snapshotted() {
        std::env::set_var("VRLABTEST_SNAP_ADMIN_PASSWORD", "s3cret");
        std::env::set_var("VRLABTEST_SNAP_REGISTRATION_KEY", "key-1");
        std::env::set_var("VRLABTEST_SNAP_ACCOUNT_NAME", "acme");
        std::env::set_var("VRLABTEST_SNAP_SITE_TAG", "Lab42");

        let config = ApplianceConfig::from_env("VRLABTEST_SNAP", "vgw1");

        assert_eq!(config.admin_password, "s3cret");
        assert_eq!(config.site_tag, "Lab42");
        assert!(config.wants_configuration());
        assert_eq!(config.registration_credentials(), Some(("key-1", "acme")));
    }

    #[test]
    fn partial_registration_credentials_are_skipped() {
        std::env::set_var("VRLABTEST_PARTIAL_REGISTRATION_KEY", "key-only");

        let config = ApplianceConfig::from_env("VRLABTEST_PARTIAL", "ecos1");

        // The key alone still gates configuration on...
        assert!(config.wants_configuration());
        // ...but must not produce a registration command.
        assert!(config.registration_credentials().is_none());
    }
}
