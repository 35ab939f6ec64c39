//! Combat callback adapter: synthesizes squad entries from agent
//! tracking events and forwards combat telemetry to subscribers.

use arcbridge_core::combat::{Agent, CbtEvent, CombatEvent};
use arcbridge_core::msg::{timestamp_ms, Message, MessageCategory, MessageType};
use arcbridge_core::squad::{DeltaSource, PlayerInfo};

use crate::bridge::{Bridge, CharacterType};

/// Handle one combat callback invocation.
///
/// Errors never travel back to the host; everything is logged and
/// swallowed here.
pub(crate) fn process(
    bridge: &Bridge,
    ev: Option<CbtEvent>,
    src: Option<Agent>,
    dst: Option<Agent>,
    skill_name: Option<String>,
    id: u64,
    revision: u64,
) {
    let mut deltas = Vec::new();

    // Agent tracking notifications arrive without an event body.
    if ev.is_none() {
        if let (Some(src), Some(dst)) = (&src, &dst) {
            handle_agent_event(bridge, src, dst, &mut deltas);
        }
    }

    let tracking = bridge.tracking();
    let mut batch = deltas;
    if tracking.tracking_category(MessageCategory::Combat) {
        let protocols = tracking.protocols();
        if !protocols.is_empty() {
            let event = CombatEvent {
                id,
                revision,
                ev,
                src,
                dst,
                skill_name,
            };
            batch.push(Message::from_payload(
                MessageType::CombatEvent,
                bridge.app.next_id(),
                timestamp_ms(),
                protocols,
                &event,
            ));
        }
    }

    if !batch.is_empty() {
        bridge.handler.send_messages(batch);
    }
}

/// Agent add/remove bookkeeping: `src.elite == 0` marks a tracking
/// event; `src.prof` non-zero is an add, zero a remove. The destination
/// agent carries the account-level data.
fn handle_agent_event(bridge: &Bridge, src: &Agent, dst: &Agent, deltas: &mut Vec<Message>) {
    if src.elite != 0 {
        return;
    }

    let account = match dst.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_owned(),
        _ => return,
    };

    if src.prof != 0 {
        agent_added(bridge, src, dst, account, deltas);
    } else {
        agent_removed(bridge, account, deltas);
    }
}

fn agent_added(
    bridge: &Bridge,
    src: &Agent,
    dst: &Agent,
    account: String,
    deltas: &mut Vec<Message>,
) {
    let character = src.name.clone().unwrap_or_default();
    let is_self = dst.is_self != 0;
    if is_self {
        bridge.app.set_self_account(&account);
    }

    bridge.cache_character(
        &account,
        CharacterType {
            character_name: character.clone(),
            profession: dst.prof,
            elite: dst.elite,
        },
    );

    let squad = &bridge.app.squad;
    match squad.container().find(&account) {
        Some(existing) => {
            squad.update_player(
                existing,
                |player| {
                    player.character_name = character.clone();
                    player.profession = dst.prof;
                    player.elite = dst.elite;
                    player.subgroup = dst.team as u8;
                    player.in_instance = true;
                    if is_self {
                        player.is_self = true;
                    }
                },
                |entry| {
                    deltas.extend(bridge.squad_delta(
                        MessageType::SquadUpdate,
                        DeltaSource::Combat,
                        entry,
                    ));
                },
            );
        }
        None => {
            // Seen by combat before the extras roster mentioned them.
            let player = PlayerInfo {
                account_name: account,
                character_name: character,
                profession: dst.prof,
                elite: dst.elite,
                subgroup: dst.team as u8,
                in_instance: true,
                is_self,
                ..Default::default()
            };
            squad.add_player(
                player,
                |entry| {
                    deltas.extend(bridge.squad_delta(
                        MessageType::SquadAdd,
                        DeltaSource::Combat,
                        entry,
                    ));
                },
                |err| {
                    log::warn!("Could not add combat-tracked player: {:?}", err);
                },
            );
        }
    }
}

fn agent_removed(bridge: &Bridge, account: String, deltas: &mut Vec<Message>) {
    let squad = &bridge.app.squad;
    if let Some(existing) = squad.container().find(&account) {
        squad.update_player(
            existing,
            |player| {
                player.in_instance = false;
            },
            |entry| {
                deltas.extend(bridge.squad_delta(
                    MessageType::SquadUpdate,
                    DeltaSource::Combat,
                    entry,
                ));
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcbridge_core::msg::MessageProtocol;

    fn agent(name: &str, prof: u32, elite: u32, is_self: u32, team: u16) -> Agent {
        Agent {
            name: Some(name.to_owned()),
            id: 1,
            prof,
            elite,
            is_self,
            team,
        }
    }

    #[test]
    fn agent_add_introduces_combat_data() {
        let bridge = Bridge::test_instance();

        // Tracking event: no ev body, src carries the character, dst the
        // account-level data.
        let src = agent("Alice Character", 4, 0, 0, 0);
        let dst = agent(":Alice.1234", 4, 7, 0, 2);
        process(&bridge, None, Some(src), Some(dst), None, 2, 1);

        let entry = bridge.app.squad.container().find(":Alice.1234").unwrap();
        assert_eq!(entry.player.character_name, "Alice Character");
        assert_eq!(entry.player.profession, 4);
        assert_eq!(entry.player.elite, 7);
        assert_eq!(entry.player.subgroup, 2);
        assert!(entry.player.in_instance);

        // The same pairing again is an update, never a duplicate add.
        let src = agent("Alice Character", 4, 0, 0, 0);
        let dst = agent(":Alice.1234", 4, 7, 0, 3);
        process(&bridge, None, Some(src), Some(dst), None, 3, 1);
        let entry = bridge.app.squad.container().find(":Alice.1234").unwrap();
        assert_eq!(entry.player.subgroup, 3);
        assert_eq!(bridge.app.squad.container().len(), 1);
    }

    #[test]
    fn agent_remove_marks_out_of_instance() {
        let bridge = Bridge::test_instance();

        let src = agent("Bob Character", 9, 0, 0, 0);
        let dst = agent(":Bob.5678", 9, 0, 0, 1);
        process(&bridge, None, Some(src), Some(dst), None, 2, 1);

        // prof 0 on the source marks the agent leaving the instance.
        let src = agent("Bob Character", 0, 0, 0, 0);
        let dst = agent(":Bob.5678", 0, 0, 0, 0);
        process(&bridge, None, Some(src), Some(dst), None, 3, 1);

        let entry = bridge.app.squad.container().find(":Bob.5678").unwrap();
        assert!(!entry.player.in_instance);
        assert_eq!(entry.player.character_name, "Bob Character");
    }

    #[test]
    fn self_account_is_learned_from_combat() {
        let bridge = Bridge::test_instance();

        let src = agent("My Character", 2, 0, 0, 0);
        let dst = agent(":Me.0001", 2, 0, 1, 1);
        process(&bridge, None, Some(src), Some(dst), None, 2, 1);

        assert!(bridge.app.is_self(":Me.0001"));
        let entry = bridge.app.squad.container().find(":Me.0001").unwrap();
        assert!(entry.player.is_self);
    }

    #[test]
    fn elite_events_do_not_touch_the_roster() {
        let bridge = Bridge::test_instance();

        let src = agent("Someone", 4, 55, 0, 0);
        let dst = agent(":Some.1111", 4, 55, 0, 1);
        process(&bridge, None, Some(src), Some(dst), None, 2, 1);
        assert!(bridge.app.squad.container().is_empty());
    }

    #[test]
    fn delta_generation_follows_squad_tracking() {
        let bridge = Bridge::test_instance();
        bridge.app.squad.add_player(
            PlayerInfo {
                account_name: ":Acc.1".to_owned(),
                ..Default::default()
            },
            |_| {},
            |_| {},
        );
        let entry = bridge.app.squad.container().find(":Acc.1").unwrap();

        // Nobody subscribed: no delta is built at all.
        assert!(bridge
            .squad_delta(MessageType::SquadAdd, DeltaSource::Combat, &entry)
            .is_none());

        bridge.tracking().track_category(MessageCategory::Squad);
        bridge.tracking().use_protocol(MessageProtocol::Text);
        let msg = bridge
            .squad_delta(MessageType::SquadAdd, DeltaSource::Combat, &entry)
            .unwrap();
        assert!(msg.has_text());
        assert!(!msg.has_serial());
        let text: serde_json::Value = serde_json::from_str(msg.text().unwrap()).unwrap();
        assert_eq!(text["data"]["source"], "combat");
    }
}
