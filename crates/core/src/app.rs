//! Process-wide shared state handed to the pipe server and the
//! host-callback adapters.

use std::sync::Mutex;
use std::time::Duration;

use crate::info::BridgeInfo;
use crate::msg::MessageIds;
use crate::squad::SquadModifyHandler;

/// Server tuning knobs, filled in from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Maximum number of simultaneously connected clients.
    pub max_clients: usize,
    /// Idle interval after which a silent client is probed for liveness.
    pub client_timeout: Duration,
    /// Bound of each per-client message queue; overflow is tail-dropped.
    pub msg_queue_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            max_clients: 32,
            client_timeout: Duration::from_millis(120_000),
            msg_queue_size: 64,
        }
    }
}

/// Everything the bridge shares between the host callbacks and the pipe
/// server: the squad roster, the published metadata and the message id
/// source.
#[derive(Debug, Default)]
pub struct ApplicationData {
    /// Server configuration, immutable after start.
    pub config: BridgeConfig,
    /// The squad roster behind its modify handler.
    pub squad: SquadModifyHandler,
    info: Mutex<BridgeInfo>,
    self_account: Mutex<String>,
    ids: MessageIds,
}

impl ApplicationData {
    /// State with the given configuration.
    pub fn new(config: BridgeConfig) -> Self {
        ApplicationData {
            config,
            ..Default::default()
        }
    }

    /// Next message id.
    pub fn next_id(&self) -> u64 {
        self.ids.next()
    }

    /// Copy of the current bridge metadata.
    pub fn info(&self) -> BridgeInfo {
        self.info.lock().unwrap().clone()
    }

    /// Apply `f` to the bridge metadata. When the result differs from the
    /// previous state, the validator is advanced and the new revision is
    /// returned for broadcasting.
    pub fn update_info<F>(&self, f: F) -> Option<(u64, BridgeInfo)>
    where
        F: FnOnce(&mut BridgeInfo),
    {
        let mut info = self.info.lock().unwrap();
        let before = info.clone();
        f(&mut info);
        if *info == before {
            return None;
        }
        info.validator = before.validator + 1;
        Some((info.validator, info.clone()))
    }

    /// Account name of the local player, empty until learned.
    pub fn self_account(&self) -> String {
        self.self_account.lock().unwrap().clone()
    }

    /// Remember the local player's account name.
    pub fn set_self_account(&self, account: &str) {
        let mut name = self.self_account.lock().unwrap();
        if name.as_str() != account {
            log::info!("Self account name: \"{}\"", account);
            *name = account.to_owned();
        }
    }

    /// Is `account` the local player?
    pub fn is_self(&self, account: &str) -> bool {
        !account.is_empty() && self.self_account.lock().unwrap().as_str() == account
    }
}
