//! Binary protocol decoders.
//!
//! The bridge itself only ever writes the binary protocol; these parsers
//! exist for consumers reading the stream and as the round-trip half of
//! the encoder tests. Every parser is the exact inverse of the matching
//! `to_serial` implementation.

use nom::{
    bytes::complete::{take, take_till},
    combinator::map,
    number::complete::{le_i32, le_i64, le_u16, le_u32, le_u64, le_u8},
};

use crate::combat::{Agent, CbtEvent, CombatEvent};
use crate::extras::{ChatMessage, KeyBindChanged, LanguageChanged, SingleKey, UserInfo};
use crate::info::BridgeInfo;
use crate::squad::{PlayerInfo, PlayerInfoEntry};

type IResult<I, O, E = nom::error::VerboseError<I>> = Result<(I, O), nom::Err<E>>;

/// The decoded 18-byte binary message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Raw category value.
    pub category: u8,
    /// Raw type value.
    pub mtype: u8,
    /// Message id.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Parse the binary message header.
pub fn message_header(i: &[u8]) -> IResult<&[u8], MessageHeader> {
    let (i, category) = le_u8(i)?;
    let (i, mtype) = le_u8(i)?;
    let (i, id) = le_u64(i)?;
    let (i, timestamp) = le_u64(i)?;
    Ok((
        i,
        MessageHeader {
            category,
            mtype,
            id,
            timestamp,
        },
    ))
}

fn nul_string(i: &[u8]) -> IResult<&[u8], String> {
    let (i, bytes) = take_till(|b| b == 0)(i)?;
    let (i, _) = take(1usize)(i)?;
    Ok((i, String::from_utf8_lossy(bytes).into_owned()))
}

fn nul_str_opt(i: &[u8]) -> IResult<&[u8], Option<String>> {
    let (i, s) = nul_string(i)?;
    Ok((i, if s.is_empty() { None } else { Some(s) }))
}

fn boolean(i: &[u8]) -> IResult<&[u8], bool> {
    map(le_u8, |b| b != 0)(i)
}

/// Parse a combat event record.
pub fn cbt_event(i: &[u8]) -> IResult<&[u8], CbtEvent> {
    let (i, time) = le_u64(i)?;
    let (i, src_agent) = le_u64(i)?;
    let (i, dst_agent) = le_u64(i)?;
    let (i, value) = le_i32(i)?;
    let (i, buff_dmg) = le_i32(i)?;
    let (i, overstack_value) = le_u32(i)?;
    let (i, skillid) = le_u32(i)?;
    let (i, src_instid) = le_u16(i)?;
    let (i, dst_instid) = le_u16(i)?;
    let (i, src_master_instid) = le_u16(i)?;
    let (i, dst_master_instid) = le_u16(i)?;
    let (i, iff) = le_u8(i)?;
    let (i, buff) = le_u8(i)?;
    let (i, result) = le_u8(i)?;
    let (i, is_activation) = le_u8(i)?;
    let (i, is_buffremove) = le_u8(i)?;
    let (i, is_ninety) = le_u8(i)?;
    let (i, is_fifty) = le_u8(i)?;
    let (i, is_moving) = le_u8(i)?;
    let (i, is_statechange) = le_u8(i)?;
    let (i, is_flanking) = le_u8(i)?;
    let (i, is_shields) = le_u8(i)?;
    let (i, is_offcycle) = le_u8(i)?;

    Ok((
        i,
        CbtEvent {
            time,
            src_agent,
            dst_agent,
            value,
            buff_dmg,
            overstack_value,
            skillid,
            src_instid,
            dst_instid,
            src_master_instid,
            dst_master_instid,
            iff,
            buff,
            result,
            is_activation,
            is_buffremove,
            is_ninety,
            is_fifty,
            is_moving,
            is_statechange,
            is_flanking,
            is_shields,
            is_offcycle,
        },
    ))
}

/// Parse an agent record.
pub fn agent(i: &[u8]) -> IResult<&[u8], Agent> {
    let (i, name) = nul_str_opt(i)?;
    let (i, id) = le_u64(i)?;
    let (i, prof) = le_u32(i)?;
    let (i, elite) = le_u32(i)?;
    let (i, is_self) = le_u32(i)?;
    let (i, team) = le_u16(i)?;
    Ok((
        i,
        Agent {
            name,
            id,
            prof,
            elite,
            is_self,
            team,
        },
    ))
}

/// Parse the composite `CombatEvent` payload.
pub fn combat_event(i: &[u8]) -> IResult<&[u8], CombatEvent> {
    let (i, bits) = le_u8(i)?;
    let (i, ev) = if bits & 1 != 0 {
        map(cbt_event, Some)(i)?
    } else {
        (i, None)
    };
    let (i, src) = if bits & 2 != 0 {
        map(agent, Some)(i)?
    } else {
        (i, None)
    };
    let (i, dst) = if bits & 4 != 0 {
        map(agent, Some)(i)?
    } else {
        (i, None)
    };
    let (i, skill_name) = nul_str_opt(i)?;
    let (i, id) = le_u64(i)?;
    let (i, revision) = le_u64(i)?;

    Ok((
        i,
        CombatEvent {
            id,
            revision,
            ev,
            src,
            dst,
            skill_name,
        },
    ))
}

/// Parse an extras squad member record.
pub fn user_info(i: &[u8]) -> IResult<&[u8], UserInfo> {
    let (i, account_name) = nul_str_opt(i)?;
    let (i, join_time) = le_i64(i)?;
    let (i, role) = le_u8(i)?;
    let (i, subgroup) = le_u8(i)?;
    let (i, ready_status) = boolean(i)?;
    Ok((
        i,
        UserInfo {
            account_name,
            join_time,
            role,
            subgroup,
            ready_status,
        },
    ))
}

/// Parse a language change record.
pub fn language(i: &[u8]) -> IResult<&[u8], LanguageChanged> {
    map(le_i32, |language| LanguageChanged { language })(i)
}

/// Parse a key bind change record.
pub fn key_bind(i: &[u8]) -> IResult<&[u8], KeyBindChanged> {
    let (i, key_control) = le_i32(i)?;
    let (i, key_index) = le_u32(i)?;
    let (i, device_type) = le_i32(i)?;
    let (i, code) = le_i32(i)?;
    let (i, modifier) = le_i32(i)?;
    Ok((
        i,
        KeyBindChanged {
            key_control,
            key_index,
            single_key: SingleKey {
                device_type,
                code,
                modifier,
            },
        },
    ))
}

/// Parse a chat message record.
pub fn chat_message(i: &[u8]) -> IResult<&[u8], ChatMessage> {
    let (i, channel_id) = le_u32(i)?;
    let (i, channel_type) = le_u8(i)?;
    let (i, subgroup) = le_u8(i)?;
    let (i, is_broadcast) = le_u8(i)?;
    let (i, timestamp) = nul_str_opt(i)?;
    let (i, account_name) = nul_str_opt(i)?;
    let (i, character_name) = nul_str_opt(i)?;
    let (i, text) = nul_str_opt(i)?;
    Ok((
        i,
        ChatMessage {
            channel_id,
            channel_type,
            subgroup,
            is_broadcast,
            timestamp,
            account_name,
            character_name,
            text,
        },
    ))
}

/// Parse a squad roster player.
pub fn player_info(i: &[u8]) -> IResult<&[u8], PlayerInfo> {
    let (i, account_name) = nul_string(i)?;
    let (i, character_name) = nul_string(i)?;
    let (i, join_time) = le_i64(i)?;
    let (i, profession) = le_u32(i)?;
    let (i, elite) = le_u32(i)?;
    let (i, role) = le_u8(i)?;
    let (i, subgroup) = le_u8(i)?;
    let (i, in_instance) = boolean(i)?;
    let (i, is_self) = boolean(i)?;
    let (i, ready_status) = boolean(i)?;
    Ok((
        i,
        PlayerInfo {
            account_name,
            character_name,
            join_time,
            profession,
            elite,
            role,
            subgroup,
            in_instance,
            is_self,
            ready_status,
        },
    ))
}

/// Parse a roster entry (player plus validator).
pub fn player_entry(i: &[u8]) -> IResult<&[u8], PlayerInfoEntry> {
    let (i, player) = player_info(i)?;
    let (i, validator) = le_u64(i)?;
    Ok((i, PlayerInfoEntry { player, validator }))
}

/// Parse the body of a `SquadStatus` snapshot (u64 count, then entries).
pub fn squad_members(i: &[u8]) -> IResult<&[u8], Vec<PlayerInfoEntry>> {
    let (mut i, count) = le_u64(i)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (rest, entry) = player_entry(i)?;
        entries.push(entry);
        i = rest;
    }
    Ok((i, entries))
}

/// Parse the body of a squad delta message (source byte, then the entry).
pub fn squad_delta(i: &[u8]) -> IResult<&[u8], (u8, PlayerInfoEntry)> {
    let (i, source) = le_u8(i)?;
    let (i, entry) = player_entry(i)?;
    Ok((i, (source, entry)))
}

/// Parse a `BridgeInfo` body, returning the API version pair alongside it.
pub fn bridge_info(i: &[u8]) -> IResult<&[u8], (u32, u32, BridgeInfo)> {
    let (i, major) = le_u32(i)?;
    let (i, minor) = le_u32(i)?;
    let (i, validator) = le_u64(i)?;
    let (i, version) = nul_string(i)?;
    let (i, extras_version) = nul_string(i)?;
    let (i, arc_version) = nul_string(i)?;
    let (i, extras_info_version) = le_u32(i)?;
    let (i, arc_loaded) = boolean(i)?;
    let (i, extras_found) = boolean(i)?;
    let (i, extras_loaded) = boolean(i)?;
    Ok((
        i,
        (
            major,
            minor,
            BridgeInfo {
                version,
                extras_version,
                arc_version,
                validator,
                extras_info_version,
                arc_loaded,
                extras_found,
                extras_loaded,
            },
        ),
    ))
}

/// The payload of a decoded binary message.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedBody {
    /// Bridge metadata with its API version pair.
    BridgeInfo(u32, u32, BridgeInfo),
    /// Server-side goodbye, no payload.
    Closing,
    /// One combat event.
    CombatEvent(CombatEvent),
    /// Extras squad member record.
    ExtrasSquadUpdate(UserInfo),
    /// Language change.
    ExtrasLanguageChanged(LanguageChanged),
    /// Key bind change.
    ExtrasKeyBindChanged(KeyBindChanged),
    /// Chat message.
    ExtrasChatMessage(ChatMessage),
    /// Full roster snapshot.
    SquadStatus(Vec<PlayerInfoEntry>),
    /// Roster delta with its source byte.
    SquadAdd(u8, PlayerInfoEntry),
    /// Roster delta with its source byte.
    SquadUpdate(u8, PlayerInfoEntry),
    /// Roster delta with its source byte.
    SquadRemove(u8, PlayerInfoEntry),
}

fn decode_error<E: std::fmt::Debug>(what: &str, e: E) -> crate::Error {
    crate::Error::Decode(format!("{}: {:?}", what, e))
}

/// Decode one full binary frame into its header and typed payload.
///
/// This is the client-side entry point; the bridge itself only encodes.
pub fn decode_message(bytes: &[u8]) -> crate::Result<(MessageHeader, DecodedBody)> {
    let (body, header) = message_header(bytes).map_err(|e| decode_error("header", e))?;

    let decoded = match header.mtype {
        2 => {
            let (_, (major, minor, info)) =
                bridge_info(body).map_err(|e| decode_error("bridge info", e))?;
            DecodedBody::BridgeInfo(major, minor, info)
        }
        4 => DecodedBody::Closing,
        5 => {
            let (_, event) = combat_event(body).map_err(|e| decode_error("combat event", e))?;
            DecodedBody::CombatEvent(event)
        }
        6 => {
            let (_, info) = user_info(body).map_err(|e| decode_error("user info", e))?;
            DecodedBody::ExtrasSquadUpdate(info)
        }
        7 => {
            let (_, lang) = language(body).map_err(|e| decode_error("language", e))?;
            DecodedBody::ExtrasLanguageChanged(lang)
        }
        8 => {
            let (_, bind) = key_bind(body).map_err(|e| decode_error("key bind", e))?;
            DecodedBody::ExtrasKeyBindChanged(bind)
        }
        9 => {
            let (_, chat) = chat_message(body).map_err(|e| decode_error("chat message", e))?;
            DecodedBody::ExtrasChatMessage(chat)
        }
        10 => {
            let (_, members) =
                squad_members(body).map_err(|e| decode_error("squad status", e))?;
            DecodedBody::SquadStatus(members)
        }
        11 | 12 | 13 => {
            let (_, (source, entry)) =
                squad_delta(body).map_err(|e| decode_error("squad delta", e))?;
            match header.mtype {
                11 => DecodedBody::SquadAdd(source, entry),
                12 => DecodedBody::SquadUpdate(source, entry),
                _ => DecodedBody::SquadRemove(source, entry),
            }
        }
        other => {
            return Err(crate::Error::Decode(format!(
                "unexpected binary message type {}",
                other
            )))
        }
    };

    Ok((header, decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{serial_buffer, Message, MessageType, HEADER_BYTES};

    #[test]
    fn header_round_trip() {
        let msg = Message::new(MessageType::CombatEvent, 42, 1661000000000, Some(serial_buffer(0)), None);
        let serial = msg.serial().unwrap();
        let (rest, header) = message_header(serial).unwrap();
        assert!(rest.is_empty());
        assert_eq!(serial.len(), HEADER_BYTES);
        assert_eq!(header.category, 2);
        assert_eq!(header.mtype, 5);
        assert_eq!(header.id, 42);
        assert_eq!(header.timestamp, 1661000000000);
    }

    #[test]
    fn nul_strings() {
        let (rest, s) = nul_string(b"abc\0rest").unwrap();
        assert_eq!(s, "abc");
        assert_eq!(rest, b"rest");

        let (_, none) = nul_str_opt(b"\0").unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(message_header(&[1, 2, 3]).is_err());
        assert!(cbt_event(&[0u8; 10]).is_err());
    }

    #[test]
    fn decode_message_dispatches_on_type() {
        use crate::msg::ser::ToSerial;
        use crate::msg::ProtocolMask;

        let info = crate::extras::UserInfo {
            account_name: Some(":Acc.1234".to_owned()),
            join_time: 99,
            role: 3,
            subgroup: 1,
            ready_status: false,
        };
        let mut buf = serial_buffer(info.serial_size());
        info.to_serial(&mut buf);
        let msg = Message::new(MessageType::ExtrasSquadUpdate, 8, 9, Some(buf), None);

        let (header, body) = decode_message(msg.serial().unwrap()).unwrap();
        assert_eq!(header.mtype, 6);
        assert_eq!(header.id, 8);
        assert_eq!(body, DecodedBody::ExtrasSquadUpdate(info));

        let closing = Message::header_only(MessageType::Closing, 1, 2, ProtocolMask::ALL);
        let (_, body) = decode_message(closing.serial().unwrap()).unwrap();
        assert_eq!(body, DecodedBody::Closing);

        // Handshake messages never appear in binary framing.
        let bogus = Message::header_only(MessageType::Status, 1, 2, ProtocolMask::ALL);
        assert!(decode_message(bogus.serial().unwrap()).is_err());
    }
}
