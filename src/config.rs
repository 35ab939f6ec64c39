//! Configuration file handling.
//!
//! The file is a small sectioned key=value document next to the plugin.
//! Unknown options and unknown sections are ignored; a missing or
//! malformed file falls back to the defaults so the bridge always comes
//! up.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use validator::Validate;

use arcbridge_core::BridgeConfig;

/// Name of the configuration file, looked up next to the working
/// directory unless overridden through `ARCBRIDGE_CONFIG`.
pub(crate) const CONFIG_FILE: &str = "arcbridge.toml";

#[derive(Debug, Deserialize, Validate, Clone, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) general: General,
    #[validate(nested)]
    pub(crate) server: Server,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct General {
    /// Master switch for the whole extension.
    pub(crate) enabled: bool,
    /// Attach to the combat telemetry stream.
    #[serde(rename = "arcDPS")]
    pub(crate) arcdps: bool,
    /// Attach to the extras module.
    pub(crate) extras: bool,
}

#[derive(Debug, Deserialize, Validate, Clone, PartialEq, Eq)]
#[serde(default)]
pub(crate) struct Server {
    #[serde(rename = "maxClients")]
    #[validate(range(min = 1, message = "at least one client slot is required"))]
    pub(crate) max_clients: usize,

    /// Idle probe interval in milliseconds.
    #[serde(rename = "clientTimeoutTimer")]
    #[validate(range(min = 1, message = "timeout must be non-zero"))]
    pub(crate) client_timeout_timer: u64,

    #[serde(rename = "msgQueueSize")]
    #[validate(range(min = 1, message = "queue must hold at least one message"))]
    pub(crate) msg_queue_size: usize,
}

impl Default for General {
    fn default() -> Self {
        General {
            enabled: true,
            arcdps: true,
            extras: true,
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        let defaults = BridgeConfig::default();
        Server {
            max_clients: defaults.max_clients,
            client_timeout_timer: defaults.client_timeout.as_millis() as u64,
            msg_queue_size: defaults.msg_queue_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            general: General::default(),
            server: Server::default(),
        }
    }
}

impl Config {
    /// The server tuning knobs for the core.
    pub(crate) fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            max_clients: self.server.max_clients,
            client_timeout: Duration::from_millis(self.server.client_timeout_timer),
            msg_queue_size: self.server.msg_queue_size,
        }
    }
}

/// Load the configuration, falling back to defaults on any problem.
pub(crate) fn load(path: &Path) -> Config {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::info!(
                "No config file at {:?} ({}), using default values",
                path,
                e
            );
            return Config::default();
        }
    };

    let config: Config = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Failed to parse {:?}: {}; using default values", path, e);
            return Config::default();
        }
    };

    if let Err(e) = config.validate() {
        log::warn!("Invalid values in {:?}: {}; using default values", path, e);
        return Config::default();
    }

    log::info!("Loaded config from {:?}", path);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(config.general.enabled);
        assert!(config.general.arcdps);
        assert!(config.general.extras);
        assert_eq!(config.server.max_clients, 32);
        assert_eq!(config.server.client_timeout_timer, 120_000);
        assert_eq!(config.server.msg_queue_size, 64);
    }

    #[test]
    fn recognized_options() {
        let config: Config = toml::from_str(
            r#"
            [general]
            enabled = true
            arcDPS = false
            extras = true

            [server]
            maxClients = 8
            clientTimeoutTimer = 5000
            msgQueueSize = 16
            "#,
        )
        .unwrap();

        assert!(!config.general.arcdps);
        assert_eq!(config.server.max_clients, 8);

        let bridge = config.bridge();
        assert_eq!(bridge.client_timeout, Duration::from_millis(5000));
        assert_eq!(bridge.msg_queue_size, 16);
    }

    #[test]
    fn unknown_options_and_sections_are_ignored() {
        let config: Config = toml::from_str(
            r#"
            [general]
            enabled = true
            futureOption = "whatever"

            [experimental]
            knob = 3
            "#,
        )
        .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_files_keep_defaults_for_the_rest() {
        let config: Config = toml::from_str("[server]\nmaxClients = 2\n").unwrap();
        assert_eq!(config.server.max_clients, 2);
        assert_eq!(config.server.msg_queue_size, 64);
        assert!(config.general.enabled);
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let path = std::env::temp_dir().join(format!(
            "arcbridge-config-test-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[server]\nmaxClients = 0\n").unwrap();
        let config = load(&path);
        assert_eq!(config, Config::default());
        let _ = std::fs::remove_file(&path);
    }
}
