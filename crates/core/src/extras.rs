//! Models and encoders for the extras callback stream.
//!
//! Field names in the text encoding follow the extras module's own naming
//! (PascalCase), since clients correlate these records with the upstream
//! definitions.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::msg::ser::{put_str, str_serial_size, ToSerial};
use crate::msg::Encode;

/// Squad roles a player can have, as reported by the extras module.
///
/// `None` doubles as "left the squad" in update callbacks.
pub mod user_role {
    /// Not in the squad (or just left it).
    pub const NONE: u8 = 0;
    /// Squad leader.
    pub const SQUAD_LEADER: u8 = 1;
    /// Lieutenant.
    pub const LIEUTENANT: u8 = 2;
    /// Regular member.
    pub const MEMBER: u8 = 3;
    /// Invited, not yet joined.
    pub const INVITED: u8 = 4;
    /// Applied to join.
    pub const APPLIED: u8 = 5;
}

/// Serialized size of a [`UserInfo`] without its account name string.
pub const USER_INFO_PARTIAL_SIZE: usize = 8 + 1 + 1 + 1;

/// One squad member record from the extras squad callback.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Account name. Absent in malformed host records.
    #[serde(rename = "AccountName")]
    pub account_name: Option<String>,
    /// Time the player joined the squad (seconds since the epoch).
    #[serde(rename = "JoinTime")]
    pub join_time: i64,
    /// Squad role, see [`user_role`].
    #[serde(rename = "Role")]
    pub role: u8,
    /// Subgroup the player is in.
    #[serde(rename = "Subgroup")]
    pub subgroup: u8,
    /// Ready-check state.
    #[serde(rename = "ReadyStatus")]
    pub ready_status: bool,
}

impl ToSerial for UserInfo {
    fn serial_size(&self) -> usize {
        str_serial_size(self.account_name.as_deref()) + USER_INFO_PARTIAL_SIZE
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        put_str(buf, self.account_name.as_deref());
        buf.put_i64_le(self.join_time);
        buf.put_u8(self.role);
        buf.put_u8(self.subgroup);
        buf.put_u8(self.ready_status as u8);
    }
}

impl Encode for UserInfo {
    fn to_text(&self) -> Value {
        serde_json::to_value(self).expect("user info is always representable as text")
    }
}

/// Serialized size of a [`LanguageChanged`] record.
pub const LANGUAGE_SERIAL_SIZE: usize = 4;

/// Game language change notification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageChanged {
    /// New language id, in the host's own enumeration.
    #[serde(rename = "Language")]
    pub language: i32,
}

impl ToSerial for LanguageChanged {
    fn serial_size(&self) -> usize {
        LANGUAGE_SERIAL_SIZE
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.language);
    }
}

impl Encode for LanguageChanged {
    fn to_text(&self) -> Value {
        serde_json::to_value(self).expect("language is always representable as text")
    }
}

/// Serialized size of a [`KeyBindChanged`] record.
pub const KEY_BIND_SERIAL_SIZE: usize = 4 + 4 + (3 * 4);

/// The physical key of a key binding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleKey {
    /// Input device (keyboard, mouse).
    #[serde(rename = "DeviceType")]
    pub device_type: i32,
    /// Device-specific key code.
    #[serde(rename = "Code")]
    pub code: i32,
    /// Modifier bits held together with the key.
    #[serde(rename = "Modifier")]
    pub modifier: i32,
}

/// Key binding change notification.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBindChanged {
    /// Which game control was rebound.
    #[serde(rename = "KeyControl")]
    pub key_control: i32,
    /// Index of the binding slot (primary or secondary).
    #[serde(rename = "KeyIndex")]
    pub key_index: u32,
    /// The new key.
    #[serde(rename = "SingleKey")]
    pub single_key: SingleKey,
}

impl ToSerial for KeyBindChanged {
    fn serial_size(&self) -> usize {
        KEY_BIND_SERIAL_SIZE
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.key_control);
        buf.put_u32_le(self.key_index);
        buf.put_i32_le(self.single_key.device_type);
        buf.put_i32_le(self.single_key.code);
        buf.put_i32_le(self.single_key.modifier);
    }
}

impl Encode for KeyBindChanged {
    fn to_text(&self) -> Value {
        serde_json::to_value(self).expect("key bind is always representable as text")
    }
}

/// Serialized size of a [`ChatMessage`] without its four strings.
pub const CHAT_MESSAGE_PARTIAL_SIZE: usize = 4 + (3 * 1);

/// One squad/party chat message from the extras chat callback.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Channel the message was sent on.
    #[serde(rename = "ChannelId")]
    pub channel_id: u32,
    /// Channel kind (party, squad).
    #[serde(rename = "Type")]
    pub channel_type: u8,
    /// Sender's subgroup.
    #[serde(rename = "Subgroup")]
    pub subgroup: u8,
    /// Non-zero when the message is a broadcast.
    #[serde(rename = "IsBroadcast")]
    pub is_broadcast: u8,
    /// ISO-8601 receive time as reported by the host.
    #[serde(rename = "Timestamp")]
    pub timestamp: Option<String>,
    /// Sender account name.
    #[serde(rename = "AccountName")]
    pub account_name: Option<String>,
    /// Sender character name.
    #[serde(rename = "CharacterName")]
    pub character_name: Option<String>,
    /// Message text.
    #[serde(rename = "Text")]
    pub text: Option<String>,
}

impl ToSerial for ChatMessage {
    fn serial_size(&self) -> usize {
        CHAT_MESSAGE_PARTIAL_SIZE
            + str_serial_size(self.timestamp.as_deref())
            + str_serial_size(self.account_name.as_deref())
            + str_serial_size(self.character_name.as_deref())
            + str_serial_size(self.text.as_deref())
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.channel_id);
        buf.put_u8(self.channel_type);
        buf.put_u8(self.subgroup);
        buf.put_u8(self.is_broadcast);
        put_str(buf, self.timestamp.as_deref());
        put_str(buf, self.account_name.as_deref());
        put_str(buf, self.character_name.as_deref());
        put_str(buf, self.text.as_deref());
    }
}

impl Encode for ChatMessage {
    fn to_text(&self) -> Value {
        serde_json::to_value(self).expect("chat message is always representable as text")
    }
}
