//! Extras callback adapter: squad roster maintenance plus language,
//! key bind and chat message forwarding.

use arcbridge_core::extras::{user_role, ChatMessage, KeyBindChanged, LanguageChanged, UserInfo};
use arcbridge_core::msg::{timestamp_ms, Encode, Message, MessageCategory, MessageType};
use arcbridge_core::squad::{DeltaSource, PlayerInfo};

use crate::bridge::Bridge;

/// Handle one batch of squad updates from the extras module.
pub(crate) fn squad_update(bridge: &Bridge, users: Vec<UserInfo>) {
    for user in users {
        let account = match user.account_name.as_deref() {
            Some(account) if !account.is_empty() => account.to_owned(),
            _ => continue,
        };

        let mut deltas = Vec::new();
        if user.role == user_role::NONE {
            player_left(bridge, &account, &mut deltas);
        } else {
            player_present(bridge, &account, &user, &mut deltas);
        }

        // The raw extras event goes out alongside the roster change.
        let tracking = bridge.tracking();
        if tracking.tracking_category(MessageCategory::Extras) {
            let protocols = tracking.protocols();
            if !protocols.is_empty() {
                deltas.push(Message::from_payload(
                    MessageType::ExtrasSquadUpdate,
                    bridge.app.next_id(),
                    timestamp_ms(),
                    protocols,
                    &user,
                ));
            }
        }

        if !deltas.is_empty() {
            bridge.handler.send_messages(deltas);
        }
    }
}

fn player_left(bridge: &Bridge, account: &str, deltas: &mut Vec<Message>) {
    bridge.app.squad.remove_player(account, |entry| {
        deltas.extend(bridge.squad_delta(MessageType::SquadRemove, DeltaSource::Extras, &entry));
    });

    if bridge.app.is_self(account) {
        // The local player left: the squad is gone for us.
        bridge.app.squad.clear();
        bridge.clear_character_cache();
    }
}

fn player_present(bridge: &Bridge, account: &str, user: &UserInfo, deltas: &mut Vec<Message>) {
    let squad = &bridge.app.squad;
    match squad.container().find(account) {
        Some(existing) => {
            // Combat usually knows more; only the squad-level fields are
            // taken from extras.
            squad.update_player(
                existing,
                |player| {
                    player.role = user.role;
                    player.subgroup = user.subgroup;
                    player.ready_status = user.ready_status;
                    if player.join_time == 0 {
                        player.join_time = user.join_time;
                    }
                },
                |entry| {
                    deltas.extend(bridge.squad_delta(
                        MessageType::SquadUpdate,
                        DeltaSource::Extras,
                        entry,
                    ));
                },
            );
        }
        None => {
            let mut player = PlayerInfo {
                account_name: account.to_owned(),
                join_time: user.join_time,
                role: user.role,
                subgroup: user.subgroup,
                ready_status: user.ready_status,
                is_self: bridge.app.is_self(account),
                ..Default::default()
            };

            // Restore combat-known data for returning players.
            if let Some(known) = bridge.cached_character(account) {
                player.character_name = known.character_name;
                player.profession = known.profession;
                player.elite = known.elite;
            }

            squad.add_player(
                player,
                |entry| {
                    deltas.extend(bridge.squad_delta(
                        MessageType::SquadAdd,
                        DeltaSource::Extras,
                        entry,
                    ));
                },
                |err| {
                    log::warn!("Could not add extras-tracked player: {:?}", err);
                },
            );
        }
    }
}

/// Forward a language change to Extras subscribers.
pub(crate) fn language_changed(bridge: &Bridge, language: i32) {
    forward(bridge, MessageType::ExtrasLanguageChanged, &LanguageChanged { language });
}

/// Forward a key bind change to Extras subscribers.
pub(crate) fn key_bind_changed(bridge: &Bridge, bind: KeyBindChanged) {
    forward(bridge, MessageType::ExtrasKeyBindChanged, &bind);
}

/// Forward a chat message to Extras subscribers.
pub(crate) fn chat_message(bridge: &Bridge, chat: ChatMessage) {
    forward(bridge, MessageType::ExtrasChatMessage, &chat);
}

fn forward<T: Encode>(bridge: &Bridge, mtype: MessageType, payload: &T) {
    let tracking = bridge.tracking();
    if !tracking.tracking_category(MessageCategory::Extras) {
        return;
    }
    let protocols = tracking.protocols();
    if protocols.is_empty() {
        return;
    }
    bridge.handler.send_message(Message::from_payload(
        mtype,
        bridge.app.next_id(),
        timestamp_ms(),
        protocols,
        payload,
    ));
}
