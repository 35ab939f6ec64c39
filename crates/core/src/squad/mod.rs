//! The squad roster: a bounded container of player entries with
//! optimistic-concurrency validators.
//!
//! Entries are synthesized from two independent callback streams (combat
//! and extras), which interleave on arbitrary host threads. The validator
//! scheme turns a concurrent overwrite into an explicit
//! [`UpdateResult::ValidatorMismatch`] instead of a silent lost update;
//! [`modify::SquadModifyHandler`] owns the retry.

pub mod modify;

pub use modify::SquadModifyHandler;

use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::msg::ser::{put_str, str_serial_size, ToSerial};
use crate::msg::{Encode, HEADER_BYTES};

/// Maximum number of roster slots.
pub const SQUAD_CAPACITY: usize = 65;

/// Validator value of a freshly created entry.
pub const VALIDATOR_START: u64 = 1;

/// Serialized size of a [`PlayerInfo`] without its two strings.
pub const PLAYER_INFO_PARTIAL_SIZE: usize = 8 + 4 + 4 + 1 + 1 + 3;

/// One squad member as the bridge knows them.
///
/// The account name is the identity key; it is non-empty for every entry
/// stored in the container. Subgroup is 0-based in both wire encodings.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    /// Account name, the identity key.
    #[serde(rename = "accountName")]
    pub account_name: String,
    /// Character name, learned from combat. Empty when unknown.
    #[serde(rename = "characterName", with = "empty_as_null")]
    pub character_name: String,
    /// Squad join time (seconds since the epoch), 0 when unknown.
    #[serde(rename = "joinTime")]
    pub join_time: i64,
    /// Profession, learned from combat. 0 when unknown.
    pub profession: u32,
    /// Elite specialization, learned from combat.
    pub elite: u32,
    /// Squad role, see [`crate::extras::user_role`].
    pub role: u8,
    /// Subgroup, 0-based.
    pub subgroup: u8,
    /// The player is in the same game instance as the local player.
    #[serde(rename = "inInstance")]
    pub in_instance: bool,
    /// This entry is the local player.
    #[serde(rename = "self")]
    pub is_self: bool,
    /// Ready-check state.
    #[serde(rename = "readyStatus")]
    pub ready_status: bool,
}

mod empty_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(s: &str, ser: S) -> Result<S::Ok, S::Error> {
        if s.is_empty() {
            ser.serialize_none()
        } else {
            ser.serialize_str(s)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
        Ok(Option::<String>::deserialize(de)?.unwrap_or_default())
    }
}

impl ToSerial for PlayerInfo {
    fn serial_size(&self) -> usize {
        str_serial_size(Some(&self.account_name))
            + str_serial_size(Some(&self.character_name))
            + PLAYER_INFO_PARTIAL_SIZE
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        put_str(buf, Some(&self.account_name));
        put_str(buf, Some(&self.character_name));
        buf.put_i64_le(self.join_time);
        buf.put_u32_le(self.profession);
        buf.put_u32_le(self.elite);
        buf.put_u8(self.role);
        buf.put_u8(self.subgroup);
        buf.put_u8(self.in_instance as u8);
        buf.put_u8(self.is_self as u8);
        buf.put_u8(self.ready_status as u8);
    }
}

/// A stored player plus its revision counter.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfoEntry {
    /// The player data.
    pub player: PlayerInfo,
    /// Revision of this entry, starts at [`VALIDATOR_START`].
    pub validator: u64,
}

impl ToSerial for PlayerInfoEntry {
    fn serial_size(&self) -> usize {
        self.player.serial_size() + 8
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        self.player.to_serial(buf);
        buf.put_u64_le(self.validator);
    }
}

impl Encode for PlayerInfoEntry {
    fn to_text(&self) -> Value {
        serde_json::to_value(self).expect("player entry is always representable as text")
    }
}

/// Why an add failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddError {
    /// An occupied slot already carries this account name.
    Exists,
    /// Every slot is occupied.
    Capacity,
}

/// Outcome of [`PlayerContainer::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// Stored; the echoed entry carries the incremented validator.
    Success(PlayerInfoEntry),
    /// The new player equals the stored one. The validator is still
    /// incremented and the echoed entry reflects that.
    Equal(PlayerInfoEntry),
    /// The caller's validator is stale; the echoed entry is the current
    /// stored one, suitable for a retry.
    ValidatorMismatch(PlayerInfoEntry),
    /// No entry with this account name.
    NotFound,
}

#[derive(Debug, Default, Clone)]
struct Slot {
    occupied: bool,
    entry: PlayerInfoEntry,
}

/// Fixed-capacity roster keyed by account name.
///
/// A single mutex guards the slot array for the duration of each
/// operation; operations are O(capacity) and never touch I/O.
#[derive(Debug)]
pub struct PlayerContainer {
    slots: Mutex<Vec<Slot>>,
}

impl Default for PlayerContainer {
    fn default() -> Self {
        PlayerContainer {
            slots: Mutex::new(vec![Slot::default(); SQUAD_CAPACITY]),
        }
    }
}

impl PlayerContainer {
    /// Store a new player with a fresh validator.
    pub fn add(&self, player: PlayerInfo) -> Result<PlayerInfoEntry, AddError> {
        let mut slots = self.slots.lock().unwrap();

        if slots
            .iter()
            .any(|s| s.occupied && s.entry.player.account_name == player.account_name)
        {
            log::warn!("Player \"{}\" already exists", player.account_name);
            return Err(AddError::Exists);
        }

        match slots.iter_mut().find(|s| !s.occupied) {
            Some(slot) => {
                log::info!("Added \"{}\" to squad", player.account_name);
                slot.entry = PlayerInfoEntry {
                    player,
                    validator: VALIDATOR_START,
                };
                slot.occupied = true;
                Ok(slot.entry.clone())
            }
            None => {
                log::error!(
                    "Squad is full ({} players), cannot add \"{}\"",
                    SQUAD_CAPACITY,
                    player.account_name
                );
                Err(AddError::Capacity)
            }
        }
    }

    /// Copy of the entry for `account_name`, if present.
    pub fn find(&self, account_name: &str) -> Option<PlayerInfoEntry> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .find(|s| s.occupied && s.entry.player.account_name == account_name)
            .map(|s| s.entry.clone())
    }

    /// First entry whose player satisfies the predicate.
    pub fn find_if<P: FnMut(&PlayerInfo) -> bool>(&self, mut pred: P) -> Option<PlayerInfoEntry> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .find(|s| s.occupied && pred(&s.entry.player))
            .map(|s| s.entry.clone())
    }

    /// Replace the stored entry if the caller's validator is current.
    ///
    /// Both `Success` and `Equal` outcomes advance the stored validator by
    /// exactly one.
    pub fn update(&self, entry: &PlayerInfoEntry) -> UpdateResult {
        let mut slots = self.slots.lock().unwrap();

        let slot = match slots
            .iter_mut()
            .find(|s| s.occupied && s.entry.player.account_name == entry.player.account_name)
        {
            Some(slot) => slot,
            None => {
                log::warn!(
                    "Cannot update \"{}\": not in squad",
                    entry.player.account_name
                );
                return UpdateResult::NotFound;
            }
        };

        if slot.entry.validator != entry.validator {
            log::debug!(
                "Validator mismatch for \"{}\": {} != {}",
                entry.player.account_name,
                slot.entry.validator,
                entry.validator
            );
            return UpdateResult::ValidatorMismatch(slot.entry.clone());
        }

        let equal = slot.entry.player == entry.player;
        if !equal {
            log::info!("Updated \"{}\" in squad", entry.player.account_name);
            slot.entry.player = entry.player.clone();
        }
        slot.entry.validator += 1;

        if equal {
            UpdateResult::Equal(slot.entry.clone())
        } else {
            UpdateResult::Success(slot.entry.clone())
        }
    }

    /// Free the slot for `account_name`, returning the removed entry.
    pub fn remove(&self, account_name: &str) -> Option<PlayerInfoEntry> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots
            .iter_mut()
            .find(|s| s.occupied && s.entry.player.account_name == account_name)?;

        log::info!("Removing \"{}\" from squad", account_name);
        slot.occupied = false;
        Some(std::mem::take(&mut slot.entry))
    }

    /// Free every slot.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            slot.occupied = false;
            slot.entry = PlayerInfoEntry::default();
        }
        log::info!("Cleared squad");
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        slots.iter().filter(|s| s.occupied).count()
    }

    /// True when no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Binary snapshot: `start_padding` leading bytes, the message header
    /// area, a u64 entry count, then every occupied entry in slot order.
    pub fn to_serial(&self, start_padding: usize) -> BytesMut {
        let slots = self.slots.lock().unwrap();
        let occupied: Vec<&Slot> = slots.iter().filter(|s| s.occupied).collect();

        let payload: usize = occupied.iter().map(|s| s.entry.serial_size()).sum();
        let mut buf = BytesMut::with_capacity(start_padding + HEADER_BYTES + 8 + payload);
        buf.put_bytes(0, start_padding + HEADER_BYTES);
        buf.put_u64_le(occupied.len() as u64);
        for slot in occupied {
            slot.entry.to_serial(&mut buf);
        }
        buf
    }

    /// Text snapshot: `{"members": [entry, …]}` in slot order.
    pub fn to_text(&self) -> Value {
        let slots = self.slots.lock().unwrap();
        let members: Vec<Value> = slots
            .iter()
            .filter(|s| s.occupied)
            .map(|s| s.entry.to_text())
            .collect();
        json!({ "members": members })
    }
}

/// Where a squad delta originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeltaSource {
    /// Synthesized from the combat telemetry stream.
    Combat = 1,
    /// Reported by the extras squad callback.
    Extras = 2,
}

impl DeltaSource {
    /// Wire name of the source.
    pub fn as_str(self) -> &'static str {
        match self {
            DeltaSource::Combat => "combat",
            DeltaSource::Extras => "extras",
        }
    }
}

/// Payload of `SquadAdd` / `SquadUpdate` / `SquadRemove` messages: the
/// affected entry plus which stream produced the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquadDelta<'a> {
    /// Originating stream.
    pub source: DeltaSource,
    /// The entry after the change (or as removed).
    pub entry: &'a PlayerInfoEntry,
}

impl ToSerial for SquadDelta<'_> {
    fn serial_size(&self) -> usize {
        1 + self.entry.serial_size()
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        buf.put_u8(self.source as u8);
        self.entry.to_serial(buf);
    }
}

impl Encode for SquadDelta<'_> {
    fn to_text(&self) -> Value {
        json!({
            "source": self.source.as_str(),
            "member": self.entry.to_text(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::de;
    use crate::msg::ser::to_serial_vec;
    use assert_matches::assert_matches;

    fn player(account: &str) -> PlayerInfo {
        PlayerInfo {
            account_name: account.to_owned(),
            character_name: "Character".to_owned(),
            join_time: 1,
            profession: 2,
            elite: 3,
            role: 4,
            subgroup: 5,
            ..Default::default()
        }
    }

    #[test]
    fn partial_size_is_pinned() {
        assert_eq!(PLAYER_INFO_PARTIAL_SIZE, 21);
        let p = player("AccountName");
        assert_eq!(p.serial_size(), PLAYER_INFO_PARTIAL_SIZE + 12 + 10);
    }

    #[test]
    fn entry_round_trip() {
        let entry = PlayerInfoEntry {
            player: player("AccountName"),
            validator: 7,
        };
        let buf = to_serial_vec(&entry);
        assert_eq!(buf.len(), entry.serial_size());

        let (rest, decoded) = de::player_entry(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn player_text_shape() {
        let mut p = player("AccountName");
        p.character_name.clear();
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["accountName"], "AccountName");
        assert!(value["characterName"].is_null());
        assert_eq!(value["subgroup"], 5);
        assert_eq!(value["self"], false);
    }

    #[test]
    fn add_rejects_duplicates_and_honors_capacity() {
        let squad = PlayerContainer::default();
        assert!(squad.add(player("One.1234")).is_ok());
        assert_matches!(squad.add(player("One.1234")), Err(AddError::Exists));

        for i in 1..SQUAD_CAPACITY {
            assert!(squad.add(player(&format!("Filler.{}", i))).is_ok());
        }
        assert_matches!(squad.add(player("Late.0001")), Err(AddError::Capacity));
        assert_eq!(squad.len(), SQUAD_CAPACITY);
    }

    #[test]
    fn update_validator_semantics() {
        let squad = PlayerContainer::default();
        let mut entry = squad.add(player("Acc.1000")).unwrap();
        assert_eq!(entry.validator, VALIDATOR_START);

        // Same data: Equal, but the validator still advances.
        assert_matches!(squad.update(&entry), UpdateResult::Equal(e) => {
            assert_eq!(e.validator, VALIDATOR_START + 1);
        });

        // Stale validator: mismatch echoes the stored entry.
        entry.player.subgroup = 9;
        assert_matches!(squad.update(&entry), UpdateResult::ValidatorMismatch(e) => {
            assert_eq!(e.validator, VALIDATOR_START + 1);
            entry = e;
        });

        // Fresh validator: success, advanced once more.
        entry.player.subgroup = 9;
        assert_matches!(squad.update(&entry), UpdateResult::Success(e) => {
            assert_eq!(e.validator, VALIDATOR_START + 2);
            assert_eq!(e.player.subgroup, 9);
        });

        assert_matches!(
            squad.update(&PlayerInfoEntry {
                player: player("Unknown.0000"),
                validator: 1,
            }),
            UpdateResult::NotFound
        );
    }

    #[test]
    fn occupied_slots_have_distinct_names() {
        let squad = PlayerContainer::default();
        for name in ["A.1", "B.2", "C.3"] {
            squad.add(player(name)).unwrap();
        }
        squad.remove("B.2").unwrap();
        squad.add(player("B.2")).unwrap();
        let entry = squad.find("B.2").unwrap();
        assert_matches!(squad.update(&entry), UpdateResult::Equal(_));

        let mut names = Vec::new();
        for name in ["A.1", "B.2", "C.3"] {
            let found = squad.find(name).unwrap();
            names.push(found.player.account_name);
        }
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);
        assert_eq!(squad.len(), 3);
    }

    #[test]
    fn remove_and_clear_reset_entries() {
        let squad = PlayerContainer::default();
        squad.add(player("Acc.1")).unwrap();
        squad.add(player("Acc.2")).unwrap();

        let removed = squad.remove("Acc.1").unwrap();
        assert_eq!(removed.player.account_name, "Acc.1");
        assert!(squad.remove("Acc.1").is_none());
        assert!(squad.find("Acc.1").is_none());

        squad.clear();
        assert!(squad.is_empty());
        assert!(squad.find("Acc.2").is_none());
    }

    #[test]
    fn find_if_matches_on_player_fields() {
        let squad = PlayerContainer::default();
        let mut self_player = player("Me.1000");
        self_player.is_self = true;
        squad.add(self_player).unwrap();
        squad.add(player("Other.2000")).unwrap();

        let found = squad.find_if(|p| p.is_self).unwrap();
        assert_eq!(found.player.account_name, "Me.1000");
        assert!(squad.find_if(|p| p.profession == 99).is_none());
    }

    #[test]
    fn snapshot_serial_layout() {
        let squad = PlayerContainer::default();
        squad.add(player("Acc.1")).unwrap();
        squad.add(player("Acc.2")).unwrap();

        for padding in [0usize, 5] {
            let buf = squad.to_serial(padding);
            let body = &buf[padding + HEADER_BYTES..];
            let (rest, entries) = de::squad_members(body).unwrap();
            assert!(rest.is_empty());
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].player.account_name, "Acc.1");
            assert_eq!(entries[1].player.account_name, "Acc.2");
        }
    }

    #[test]
    fn snapshot_text_members_in_slot_order() {
        let squad = PlayerContainer::default();
        squad.add(player("Acc.1")).unwrap();
        squad.add(player("Acc.2")).unwrap();
        squad.remove("Acc.1").unwrap();

        let text = squad.to_text();
        let members = text["members"].as_array().unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0]["player"]["accountName"], "Acc.2");
    }

    #[test]
    fn delta_round_trip() {
        let entry = PlayerInfoEntry {
            player: player("Acc.1"),
            validator: 3,
        };
        let delta = SquadDelta {
            source: DeltaSource::Combat,
            entry: &entry,
        };
        let buf = to_serial_vec(&delta);
        assert_eq!(buf[0], 1);
        let (rest, (source, decoded)) = de::squad_delta(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(source, 1);
        assert_eq!(decoded, entry);

        let text = delta.to_text();
        assert_eq!(text["source"], "combat");
        assert_eq!(text["member"]["validator"], 3);
    }
}
