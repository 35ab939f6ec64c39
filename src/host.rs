//! `#[repr(C)]` mirrors of the host structs and the pointer-to-owned
//! conversions. Raw pointers do not leave this module; everything
//! upstream works on owned core types.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::ptr;

use arcbridge_core::combat::{Agent, CbtEvent};
use arcbridge_core::extras::{ChatMessage, KeyBindChanged, SingleKey, UserInfo};

/// Copy a NUL-terminated host string, if present.
pub(crate) unsafe fn opt_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

/// Copy a length-delimited host string, if present.
unsafe fn opt_sized_string(ptr: *const c_char, len: u64) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let bytes = std::slice::from_raw_parts(ptr as *const u8, len as usize);
    Some(String::from_utf8_lossy(bytes).into_owned())
}

/// Export table handed back to the combat host at init.
#[repr(C)]
pub(crate) struct ArcdpsExports {
    pub size: usize,
    pub sig: u32,
    pub imgui_version: u32,
    pub out_name: *const c_char,
    pub out_build: *const c_char,
    pub wnd_nofilter: *mut c_void,
    pub combat: *mut c_void,
    pub imgui: *mut c_void,
    pub options_end: *mut c_void,
    pub combat_local: *mut c_void,
    pub wnd_filter: *mut c_void,
    pub options_windows: *mut c_void,
}

impl ArcdpsExports {
    pub(crate) const fn zeroed() -> ArcdpsExports {
        ArcdpsExports {
            size: 0,
            sig: 0,
            imgui_version: 0,
            out_name: ptr::null(),
            out_build: ptr::null(),
            wnd_nofilter: ptr::null_mut(),
            combat: ptr::null_mut(),
            imgui: ptr::null_mut(),
            options_end: ptr::null_mut(),
            combat_local: ptr::null_mut(),
            wnd_filter: ptr::null_mut(),
            options_windows: ptr::null_mut(),
        }
    }
}

/// Raw combat event, layout dictated by the host ABI.
#[repr(C)]
pub(crate) struct RawCombatEvent {
    pub time: u64,
    pub src_agent: u64,
    pub dst_agent: u64,
    pub value: i32,
    pub buff_dmg: i32,
    pub overstack_value: u32,
    pub skillid: u32,
    pub src_instid: u16,
    pub dst_instid: u16,
    pub src_master_instid: u16,
    pub dst_master_instid: u16,
    pub iff: u8,
    pub buff: u8,
    pub result: u8,
    pub is_activation: u8,
    pub is_buffremove: u8,
    pub is_ninety: u8,
    pub is_fifty: u8,
    pub is_moving: u8,
    pub is_statechange: u8,
    pub is_flanking: u8,
    pub is_shields: u8,
    pub is_offcycle: u8,
    pub pad61: u8,
    pub pad62: u8,
    pub pad63: u8,
    pub pad64: u8,
}

pub(crate) unsafe fn cbt_event(raw: *const RawCombatEvent) -> Option<CbtEvent> {
    if raw.is_null() {
        return None;
    }
    let raw = &*raw;
    Some(CbtEvent {
        time: raw.time,
        src_agent: raw.src_agent,
        dst_agent: raw.dst_agent,
        value: raw.value,
        buff_dmg: raw.buff_dmg,
        overstack_value: raw.overstack_value,
        skillid: raw.skillid,
        src_instid: raw.src_instid,
        dst_instid: raw.dst_instid,
        src_master_instid: raw.src_master_instid,
        dst_master_instid: raw.dst_master_instid,
        iff: raw.iff,
        buff: raw.buff,
        result: raw.result,
        is_activation: raw.is_activation,
        is_buffremove: raw.is_buffremove,
        is_ninety: raw.is_ninety,
        is_fifty: raw.is_fifty,
        is_moving: raw.is_moving,
        is_statechange: raw.is_statechange,
        is_flanking: raw.is_flanking,
        is_shields: raw.is_shields,
        is_offcycle: raw.is_offcycle,
    })
}

/// Raw short agent, layout dictated by the host ABI.
#[repr(C)]
pub(crate) struct RawAgent {
    /// Valid only for the duration of the callback.
    pub name: *const c_char,
    pub id: usize,
    pub prof: u32,
    pub elite: u32,
    pub is_self: u32,
    pub team: u16,
}

pub(crate) unsafe fn agent(raw: *const RawAgent) -> Option<Agent> {
    if raw.is_null() {
        return None;
    }
    let raw = &*raw;
    Some(Agent {
        name: opt_string(raw.name),
        id: raw.id as u64,
        prof: raw.prof,
        elite: raw.elite,
        is_self: raw.is_self,
        team: raw.team,
    })
}

/// Announcement the extras module sends to its subscribers.
#[repr(C)]
pub(crate) struct ExtrasAddonInfo {
    pub api_version: u32,
    pub max_info_version: u32,
    pub string_version: *const c_char,
    pub self_account_name: *const c_char,
}

/// Raw squad member record from the extras squad callback.
#[repr(C)]
pub(crate) struct RawUserInfo {
    pub account_name: *const c_char,
    pub join_time: i64,
    pub role: u8,
    pub subgroup: u8,
    pub ready_status: bool,
}

pub(crate) unsafe fn user_info(raw: &RawUserInfo) -> UserInfo {
    UserInfo {
        account_name: opt_string(raw.account_name),
        join_time: raw.join_time,
        role: raw.role,
        subgroup: raw.subgroup,
        ready_status: raw.ready_status,
    }
}

/// Raw physical key description.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct RawKey {
    pub device_type: i32,
    pub code: i32,
    pub modifier: i32,
}

/// Raw key bind change, passed by value through the callback.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct RawKeyBindChanged {
    pub key_control: i32,
    pub key_index: u32,
    pub single_key: RawKey,
}

pub(crate) fn key_bind(raw: RawKeyBindChanged) -> KeyBindChanged {
    KeyBindChanged {
        key_control: raw.key_control,
        key_index: raw.key_index,
        single_key: SingleKey {
            device_type: raw.single_key.device_type,
            code: raw.single_key.code,
            modifier: raw.single_key.modifier,
        },
    }
}

/// Raw chat message record with length-delimited strings.
#[repr(C)]
pub(crate) struct RawChatMessageInfo {
    pub channel_id: u32,
    pub channel_type: u8,
    pub subgroup: u8,
    pub is_broadcast: u8,
    pub unused1: u8,
    pub timestamp: *const c_char,
    pub timestamp_length: u64,
    pub account_name: *const c_char,
    pub account_name_length: u64,
    pub character_name: *const c_char,
    pub character_name_length: u64,
    pub text: *const c_char,
    pub text_length: u64,
}

pub(crate) unsafe fn chat_message(raw: &RawChatMessageInfo) -> ChatMessage {
    ChatMessage {
        channel_id: raw.channel_id,
        channel_type: raw.channel_type,
        subgroup: raw.subgroup,
        is_broadcast: raw.is_broadcast,
        timestamp: opt_sized_string(raw.timestamp, raw.timestamp_length),
        account_name: opt_sized_string(raw.account_name, raw.account_name_length),
        character_name: opt_sized_string(raw.character_name, raw.character_name_length),
        text: opt_sized_string(raw.text, raw.text_length),
    }
}

pub(crate) type SquadUpdateCallback =
    unsafe extern "C" fn(updated_users: *const RawUserInfo, updated_users_count: u64);
pub(crate) type LanguageChangedCallback = unsafe extern "C" fn(new_language: i32);
pub(crate) type KeyBindChangedCallback =
    unsafe extern "C" fn(changed_key_bind: RawKeyBindChanged);
pub(crate) type ChatMessageCallback =
    unsafe extern "C" fn(chat_message: *const RawChatMessageInfo);

/// Subscriber registration, info version 1.
#[repr(C)]
pub(crate) struct ExtrasSubscriberInfoV1 {
    pub info_version: u32,
    pub subscriber_name: *const c_char,
    pub squad_update_callback: Option<SquadUpdateCallback>,
    pub language_changed_callback: Option<LanguageChangedCallback>,
    pub key_bind_changed_callback: Option<KeyBindChangedCallback>,
}

/// Subscriber registration, info version 2 (adds chat messages).
#[repr(C)]
pub(crate) struct ExtrasSubscriberInfoV2 {
    pub info_version: u32,
    pub subscriber_name: *const c_char,
    pub squad_update_callback: Option<SquadUpdateCallback>,
    pub language_changed_callback: Option<LanguageChangedCallback>,
    pub key_bind_changed_callback: Option<KeyBindChangedCallback>,
    pub chat_message_callback: Option<ChatMessageCallback>,
}
