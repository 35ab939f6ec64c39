//! Serialization of composite squad mutations.
//!
//! Producers interleave writes from two callback streams. The handler
//! wraps the container with an outer lock so a whole
//! mutate-update-retry cycle is atomic with respect to other composite
//! operations; callers never see a validator conflict.

use std::sync::Mutex;

use super::{AddError, PlayerContainer, PlayerInfo, PlayerInfoEntry, UpdateResult};

/// Atomizes composite mutations of a [`PlayerContainer`].
#[derive(Debug, Default)]
pub struct SquadModifyHandler {
    squad: PlayerContainer,
    guard: Mutex<()>,
}

impl SquadModifyHandler {
    /// Read-side access to the underlying container (find, snapshots).
    pub fn container(&self) -> &PlayerContainer {
        &self.squad
    }

    /// Add `player`; `on_success` sees the freshly created entry,
    /// `on_failed` the reason.
    pub fn add_player<S, F>(&self, player: PlayerInfo, on_success: S, on_failed: F)
    where
        S: FnOnce(&PlayerInfoEntry),
        F: FnOnce(AddError),
    {
        let _guard = self.guard.lock().unwrap();

        match self.squad.add(player) {
            Ok(entry) => on_success(&entry),
            Err(err) => on_failed(err),
        }
    }

    /// Apply `mutate` to `existing` and store the result, retrying with
    /// the fresher entry on a validator conflict until the update lands.
    ///
    /// `on_success` fires on both `Success` and `Equal` with the final
    /// stored entry. A vanished entry ends the cycle silently.
    pub fn update_player<M, S>(&self, existing: PlayerInfoEntry, mut mutate: M, on_success: S)
    where
        M: FnMut(&mut PlayerInfo),
        S: FnOnce(&PlayerInfoEntry),
    {
        let _guard = self.guard.lock().unwrap();

        let mut entry = existing;
        loop {
            mutate(&mut entry.player);
            match self.squad.update(&entry) {
                UpdateResult::Success(updated) | UpdateResult::Equal(updated) => {
                    on_success(&updated);
                    return;
                }
                UpdateResult::ValidatorMismatch(fresher) => entry = fresher,
                UpdateResult::NotFound => return,
            }
        }
    }

    /// Remove the player with `account_name`; `on_success` sees the
    /// removed entry.
    pub fn remove_player<S>(&self, account_name: &str, on_success: S)
    where
        S: FnOnce(PlayerInfoEntry),
    {
        let _guard = self.guard.lock().unwrap();

        if let Some(entry) = self.squad.remove(account_name) {
            on_success(entry);
        }
    }

    /// Empty the roster.
    pub fn clear(&self) {
        let _guard = self.guard.lock().unwrap();
        self.squad.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squad::VALIDATOR_START;
    use std::sync::Arc;

    fn player(account: &str) -> PlayerInfo {
        PlayerInfo {
            account_name: account.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn add_reports_through_callbacks() {
        let handler = SquadModifyHandler::default();

        let mut added = None;
        handler.add_player(
            player("Acc.1"),
            |e| added = Some(e.clone()),
            |_| panic!("add must succeed"),
        );
        assert_eq!(added.unwrap().validator, VALIDATOR_START);

        let mut failed = None;
        handler.add_player(player("Acc.1"), |_| panic!("duplicate"), |e| failed = Some(e));
        assert_eq!(failed, Some(AddError::Exists));
    }

    #[test]
    fn update_retries_through_validator_conflicts() {
        let handler = SquadModifyHandler::default();
        let mut stale = None;
        handler.add_player(player("Acc.1"), |e| stale = Some(e.clone()), |_| {});
        let stale = stale.unwrap();

        // Another writer lands first: the stored validator moves on.
        let fresh = handler.container().find("Acc.1").unwrap();
        match handler.container().update(&fresh) {
            UpdateResult::Equal(_) => {}
            other => panic!("unexpected: {:?}", other),
        }

        // The stale caller still converges without seeing the conflict.
        let mut result = None;
        handler.update_player(
            stale,
            |p| p.subgroup = 3,
            |e| result = Some(e.clone()),
        );
        let result = result.unwrap();
        assert_eq!(result.player.subgroup, 3);
        assert_eq!(result.validator, VALIDATOR_START + 2);
    }

    #[test]
    fn update_fires_on_equal_too() {
        let handler = SquadModifyHandler::default();
        let mut entry = None;
        handler.add_player(player("Acc.1"), |e| entry = Some(e.clone()), |_| {});

        let mut called = false;
        handler.update_player(entry.unwrap(), |_| {}, |_| called = true);
        assert!(called);
    }

    #[test]
    fn update_of_missing_player_is_silent() {
        let handler = SquadModifyHandler::default();
        handler.update_player(
            PlayerInfoEntry {
                player: player("Ghost.1"),
                validator: 1,
            },
            |_| {},
            |_| panic!("must not fire"),
        );
    }

    #[test]
    fn remove_fires_only_when_present() {
        let handler = SquadModifyHandler::default();
        handler.add_player(player("Acc.1"), |_| {}, |_| {});

        let mut removed = None;
        handler.remove_player("Acc.1", |e| removed = Some(e));
        assert_eq!(removed.unwrap().player.account_name, "Acc.1");

        handler.remove_player("Acc.1", |_| panic!("already removed"));
    }

    #[test]
    fn concurrent_updates_converge() {
        let handler = Arc::new(SquadModifyHandler::default());
        handler.add_player(player("Acc.1"), |_| {}, |_| {});

        let mut joins = Vec::new();
        for i in 0..8u32 {
            let handler = Arc::clone(&handler);
            joins.push(std::thread::spawn(move || {
                let entry = handler.container().find("Acc.1").unwrap();
                handler.update_player(entry, |p| p.elite = i, |_| {});
            }));
        }
        for join in joins {
            join.join().unwrap();
        }

        // Eight updates landed: one add validator plus eight increments.
        let entry = handler.container().find("Acc.1").unwrap();
        assert_eq!(entry.validator, VALIDATOR_START + 8);
    }
}
