//! The process-wide bridge instance: shared state, the pipe server and
//! the helpers both callback adapters use.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use arcbridge_core::info::BridgeInfo;
use arcbridge_core::msg::{timestamp_ms, Message, MessageCategory, MessageType, ProtocolMask};
use arcbridge_core::squad::{DeltaSource, PlayerInfoEntry, SquadDelta};
use arcbridge_core::{ApplicationData, MessageTracking, PipeHandler};

use crate::config::{self, Config};

/// Endpoint name of the pipe server.
#[cfg(windows)]
pub(crate) const PIPE_NAME: &str = r"\\.\pipe\arcdps-bridge";
#[cfg(unix)]
pub(crate) const PIPE_NAME: &str = "/tmp/arcdps-bridge.sock";

/// Character data learned from combat, kept so a player who drops out of
/// the roster and comes back is restored with known values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CharacterType {
    pub character_name: String,
    pub profession: u32,
    pub elite: u32,
}

pub(crate) struct Bridge {
    pub(crate) app: Arc<ApplicationData>,
    pub(crate) handler: PipeHandler,
    pub(crate) config: Config,
    character_types: Mutex<HashMap<String, CharacterType>>,
}

impl Bridge {
    /// Build the bridge from the configuration file and start the pipe
    /// server.
    pub(crate) fn load(arc_version: String) -> Arc<Bridge> {
        let path = std::env::var_os("ARCBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE));
        let config = config::load(&path);

        let app = Arc::new(ApplicationData::new(config.bridge()));
        // No clients yet; seed the info without broadcasting.
        app.update_info(|info| info.arc_version = arc_version);

        let handler = PipeHandler::new(PIPE_NAME, Arc::clone(&app));
        let bridge = Arc::new(Bridge {
            app,
            handler,
            config,
            character_types: Mutex::new(HashMap::new()),
        });

        if bridge.config.general.enabled {
            crate::RT.block_on(async {
                bridge.handler.start();
            });
            log::info!("Bridge service started on \"{}\"", PIPE_NAME);
        } else {
            log::info!("Bridge service is disabled by configs");
        }

        bridge
    }

    /// Stop the pipe server and drop every client.
    pub(crate) fn unload(&self) {
        crate::RT.block_on(self.handler.stop());
        log::info!("Bridge service stopped");
    }

    pub(crate) fn tracking(&self) -> &MessageTracking {
        self.handler.tracking()
    }

    /// Apply `f` to the bridge info; on an observable change the new
    /// revision is broadcast to every connected client.
    pub(crate) fn update_info<F>(&self, f: F)
    where
        F: FnOnce(&mut BridgeInfo),
    {
        if let Some((validator, info)) = self.app.update_info(f) {
            let msg = Message::from_payload(
                MessageType::BridgeInfo,
                self.app.next_id(),
                timestamp_ms(),
                ProtocolMask::ALL,
                &info,
            );
            self.handler.send_bridge_info(msg, validator);
        }
    }

    /// Build a squad delta message, if anyone subscribes to Squad.
    pub(crate) fn squad_delta(
        &self,
        mtype: MessageType,
        source: DeltaSource,
        entry: &PlayerInfoEntry,
    ) -> Option<Message> {
        let tracking = self.tracking();
        if !tracking.tracking_category(MessageCategory::Squad) {
            return None;
        }
        let protocols = tracking.protocols();
        if protocols.is_empty() {
            return None;
        }
        Some(Message::from_payload(
            mtype,
            self.app.next_id(),
            timestamp_ms(),
            protocols,
            &SquadDelta { source, entry },
        ))
    }

    /// Bridge over default configuration with an idle server, for
    /// adapter tests.
    #[cfg(test)]
    pub(crate) fn test_instance() -> Arc<Bridge> {
        let app = Arc::new(ApplicationData::default());
        let handler = PipeHandler::new("unused-test-endpoint", Arc::clone(&app));
        Arc::new(Bridge {
            app,
            handler,
            config: Config::default(),
            character_types: Mutex::new(HashMap::new()),
        })
    }

    /// Remember character data for `account`.
    pub(crate) fn cache_character(&self, account: &str, character: CharacterType) {
        let mut cache = self.character_types.lock().unwrap();
        cache.insert(account.to_owned(), character);
    }

    /// Character data previously learned for `account`.
    pub(crate) fn cached_character(&self, account: &str) -> Option<CharacterType> {
        let cache = self.character_types.lock().unwrap();
        cache.get(account).cloned()
    }

    /// Forget all cached character data (the squad dissolved).
    pub(crate) fn clear_character_cache(&self) {
        self.character_types.lock().unwrap().clear();
    }
}
