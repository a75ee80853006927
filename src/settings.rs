use std::time::Duration;

use config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::protocol::keepalive::{self, KeepAliveConfig};
use crate::protocol::localstatequery::{self, LocalStateQueryConfig};

/// Protocol version negotiated when none is configured. All local-state-query
/// features are available from this version on.
pub const DEFAULT_NODE_TO_CLIENT_VERSION: u16 = 11;

///
/// Node settings, read from a config file (`config.toml` by default). Every
/// key is optional and falls back to the protocol defaults.
///
/// ```toml
/// [keep_alive]
/// period_secs = 60
/// timeout_secs = 10
/// verify_cookie = true
///
/// [local_state_query]
/// version = 11
/// ```
///
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub keep_alive: KeepAliveSettings,
    pub local_state_query: LocalStateQuerySettings,
    pub node: NodeSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeepAliveSettings {
    pub period_secs: u64,
    pub timeout_secs: u64,
    pub cookie: Option<u16>,
    pub verify_cookie: bool,
}

impl Default for KeepAliveSettings {
    fn default() -> Self {
        KeepAliveSettings {
            period_secs: keepalive::DEFAULT_PERIOD.as_secs(),
            timeout_secs: keepalive::DEFAULT_TIMEOUT.as_secs(),
            cookie: None,
            verify_cookie: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LocalStateQuerySettings {
    pub version: u16,
    pub acquire_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for LocalStateQuerySettings {
    fn default() -> Self {
        LocalStateQuerySettings {
            version: DEFAULT_NODE_TO_CLIENT_VERSION,
            acquire_timeout_secs: localstatequery::DEFAULT_ACQUIRE_TIMEOUT.as_secs(),
            query_timeout_secs: localstatequery::DEFAULT_QUERY_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Default)]
#[serde(default)]
pub struct NodeSettings {
    /// Stop after this many seconds. Runs until ctrl-c when unset.
    pub run_secs: Option<u64>,
}

impl Settings {
    /// Load settings from `name`. A missing file yields the defaults.
    pub fn load(name: &str) -> crate::Result<Settings> {
        let mut config = Config::default();
        config.merge(File::with_name(name).required(false))?;
        Ok(config.try_into()?)
    }

    pub fn from_toml(toml: &str) -> crate::Result<Settings> {
        let mut config = Config::default();
        config.merge(File::from_str(toml, FileFormat::Toml))?;
        Ok(config.try_into()?)
    }

    pub fn keep_alive_config(&self) -> KeepAliveConfig {
        let mut config = KeepAliveConfig {
            period: Duration::from_secs(self.keep_alive.period_secs),
            timeout: Duration::from_secs(self.keep_alive.timeout_secs),
            verify_cookie: self.keep_alive.verify_cookie,
            ..KeepAliveConfig::default()
        };
        if let Some(cookie) = self.keep_alive.cookie {
            config = config.with_cookie(cookie);
        }
        config
    }

    /// Timeouts only. Callbacks are attached by the caller.
    pub fn local_state_query_config(&self) -> LocalStateQueryConfig {
        LocalStateQueryConfig {
            acquire_timeout: Duration::from_secs(self.local_state_query.acquire_timeout_secs),
            query_timeout: Duration::from_secs(self.local_state_query.query_timeout_secs),
            ..LocalStateQueryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.keep_alive.period_secs, 60);
        assert_eq!(settings.local_state_query.version, 11);
        assert_eq!(settings.node.run_secs, None);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let settings = Settings::load("does-not-exist/ouroboros").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let settings = Settings::from_toml(
            r#"
            [keep_alive]
            period_secs = 5
            cookie = 4660

            [local_state_query]
            version = 9

            [node]
            run_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(settings.keep_alive.period_secs, 5);
        assert_eq!(settings.keep_alive.timeout_secs, 10);
        assert_eq!(settings.keep_alive.cookie, Some(0x1234));
        assert!(settings.keep_alive.verify_cookie);
        assert_eq!(settings.local_state_query.version, 9);
        assert_eq!(settings.local_state_query.query_timeout_secs, 180);
        assert_eq!(settings.node.run_secs, Some(30));

        let keep_alive = settings.keep_alive_config();
        assert_eq!(keep_alive.period, Duration::from_secs(5));
        assert_eq!(keep_alive.timeout, Duration::from_secs(10));
        assert_eq!(keep_alive.cookie, Some(0x1234));
    }

    #[test]
    fn wrong_value_type_is_rejected() {
        assert!(Settings::from_toml("[keep_alive]\nverify_cookie = \"sometimes\"\n").is_err());
    }
}
