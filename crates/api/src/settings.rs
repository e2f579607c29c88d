//! Process settings for the API binary.

use std::net::SocketAddr;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub bind_addr: SocketAddr,
    /// Postgres URL; required when `use_persistent_stores` is set.
    pub database_url: Option<String>,
    pub use_persistent_stores: bool,
    /// Bearer token for `/admin`. Unset disables the admin routes.
    pub admin_token: Option<String>,
    /// Bearer token for `/cron`. Unset disables the cron routes.
    pub cron_secret: Option<String>,
    /// Bearer token for `/payments`. Unset disables the payment routes.
    pub payments_secret: Option<String>,
    /// Spawn the reconciliation and cache audit schedules.
    pub run_background_jobs: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            database_url: None,
            use_persistent_stores: false,
            admin_token: None,
            cron_secret: None,
            payments_secret: None,
            run_background_jobs: true,
        }
    }
}

impl ApiSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let non_empty = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(addr) = non_empty("BIND_ADDR") {
            settings.bind_addr = addr
                .parse()
                .with_context(|| format!("BIND_ADDR is not a socket address: {addr}"))?;
        }
        if let Some(flag) = non_empty("USE_PERSISTENT_STORES") {
            settings.use_persistent_stores = flag
                .parse()
                .with_context(|| format!("USE_PERSISTENT_STORES must be true or false, got {flag}"))?;
        }
        if let Some(flag) = non_empty("RUN_BACKGROUND_JOBS") {
            settings.run_background_jobs = flag
                .parse()
                .with_context(|| format!("RUN_BACKGROUND_JOBS must be true or false, got {flag}"))?;
        }
        settings.database_url = non_empty("DATABASE_URL");
        settings.admin_token = non_empty("ADMIN_TOKEN");
        settings.cron_secret = non_empty("CRON_SECRET");
        settings.payments_secret = non_empty("PAYMENT_WEBHOOK_SECRET");

        if settings.use_persistent_stores && settings.database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when USE_PERSISTENT_STORES=true");
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(vars: &[(&str, &str)]) -> anyhow::Result<ApiSettings> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ApiSettings::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_in_memory_on_8080() {
        let settings = from_map(&[]).unwrap();
        assert_eq!(settings.bind_addr.port(), 8080);
        assert!(!settings.use_persistent_stores);
        assert!(settings.admin_token.is_none());
    }

    #[test]
    fn blank_tokens_count_as_unset() {
        let settings = from_map(&[
            ("ADMIN_TOKEN", "  "),
            ("CRON_SECRET", "s3cret"),
            ("PAYMENT_WEBHOOK_SECRET", ""),
        ])
        .unwrap();
        assert!(settings.admin_token.is_none());
        assert!(settings.payments_secret.is_none());
        assert_eq!(settings.cron_secret.as_deref(), Some("s3cret"));

        let settings = from_map(&[("PAYMENT_WEBHOOK_SECRET", "whsec_1")]).unwrap();
        assert_eq!(settings.payments_secret.as_deref(), Some("whsec_1"));
    }

    #[test]
    fn persistent_stores_need_a_database() {
        assert!(from_map(&[("USE_PERSISTENT_STORES", "true")]).is_err());
        let settings = from_map(&[("USE_PERSISTENT_STORES", "true"), ("DATABASE_URL", "postgres://x")]).unwrap();
        assert!(settings.use_persistent_stores);
    }

    #[test]
    fn rejects_bad_bind_addr() {
        assert!(from_map(&[("BIND_ADDR", "not-an-addr")]).is_err());
    }
}
