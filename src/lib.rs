#![warn(clippy::todo)]
//!
//! # arcbridge
//!
//! In-process bridge exposing the host's combat telemetry and extras
//! callback streams to external consumers over a local pipe server.
//!
//! This crate is the host-facing shell: the exported plugin entry
//! points, the raw `#[repr(C)]` callback structs and the configuration
//! loader. Everything with real behavior lives in `arcbridge_core`; the
//! exported functions only convert pointers to owned values and route
//! them into the core.
//!
//! The host ABI requires plain free functions, so the one process-wide
//! bridge instance is parked in a global handle, set at plugin load and
//! cleared at unload.

mod bridge;
mod combat;
mod config;
mod extras;
mod host;

use std::os::raw::{c_char, c_void};
use std::sync::{Arc, Mutex};

use ctor::ctor;
use lazy_static::lazy_static;
use tokio::runtime::Runtime;

use bridge::Bridge;
use host::{
    ArcdpsExports, ExtrasAddonInfo, ExtrasSubscriberInfoV1, ExtrasSubscriberInfoV2,
    RawAgent, RawChatMessageInfo, RawCombatEvent, RawKeyBindChanged, RawUserInfo,
};

lazy_static! {
    static ref RT: Runtime = Runtime::new().expect("tokio runtime");
    static ref BRIDGE: Mutex<Option<Arc<Bridge>>> = Mutex::new(None);
}

#[ctor]
unsafe fn init_logging() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .try_init();
}

fn with_bridge<F: FnOnce(&Bridge)>(f: F) {
    let guard = BRIDGE.lock().unwrap();
    if let Some(bridge) = guard.as_ref() {
        f(bridge);
    }
}

/// Signature byte registered with the combat host.
const ARC_SIGNATURE: u32 = 0x1EB0_697;

const OUT_NAME: &[u8] = b"arcbridge\0";
const SUBSCRIBER_NAME: &[u8] = b"arcbridge\0";

lazy_static! {
    static ref OUT_BUILD: std::ffi::CString =
        std::ffi::CString::new(arcbridge_core::info::BRIDGE_VERSION).expect("version string");
}

struct ExportsCell(std::cell::UnsafeCell<ArcdpsExports>);

// The host writes nothing and reads after mod_init returns.
unsafe impl Sync for ExportsCell {}

static ARC_EXPORTS: ExportsCell = ExportsCell(std::cell::UnsafeCell::new(ArcdpsExports::zeroed()));

unsafe extern "C" fn mod_wnd(
    _h_wnd: *mut c_void,
    u_msg: u32,
    _w_param: usize,
    _l_param: isize,
) -> usize {
    u_msg as usize
}

/// Combat callback. May be invoked from arbitrary host threads.
unsafe extern "C" fn mod_combat(
    ev: *const RawCombatEvent,
    src: *const RawAgent,
    dst: *const RawAgent,
    skill_name: *const c_char,
    id: u64,
    revision: u64,
) -> usize {
    let ev = host::cbt_event(ev);
    let src = host::agent(src);
    let dst = host::agent(dst);
    let skill_name = host::opt_string(skill_name);

    with_bridge(|bridge| {
        combat::process(bridge, ev, src, dst, skill_name, id, revision);
    });
    0
}

unsafe extern "C" fn mod_init() -> *mut ArcdpsExports {
    let exports = &mut *ARC_EXPORTS.0.get();
    exports.size = std::mem::size_of::<ArcdpsExports>();
    exports.sig = ARC_SIGNATURE;
    exports.imgui_version = 18000;
    exports.out_name = OUT_NAME.as_ptr() as *const c_char;
    exports.out_build = OUT_BUILD.as_ptr();
    exports.wnd_nofilter = mod_wnd as usize as *mut c_void;
    exports.combat = mod_combat as usize as *mut c_void;

    with_bridge(|bridge| {
        if bridge.config.general.enabled && bridge.config.general.arcdps {
            log::info!("Combat telemetry is enabled");
            bridge.update_info(|info| info.arc_loaded = true);
        } else {
            log::info!("Combat telemetry is disabled by configs");
            exports.sig = 0;
        }
    });

    exports
}

unsafe extern "C" fn mod_release() -> usize {
    log::info!("Releasing bridge");
    let bridge = BRIDGE.lock().unwrap().take();
    if let Some(bridge) = bridge {
        bridge.update_info(|info| info.arc_loaded = false);
        bridge.unload();
    }
    0
}

/// Combat host entry point: called on client load with the host version
/// string; the returned address is invoked to obtain the export table.
///
/// # Safety
/// Called by the host with a valid NUL-terminated version string.
#[no_mangle]
pub unsafe extern "C" fn get_init_addr(
    arc_version: *const c_char,
    _imgui_context: *mut c_void,
    _dx_ptr: *mut c_void,
    _arc_dll: *mut c_void,
    _malloc_fn: *mut c_void,
    _free_fn: *mut c_void,
    _dx_version: u32,
) -> *mut c_void {
    let arc_version = host::opt_string(arc_version).unwrap_or_default();
    log::info!("Starting bridge service (combat host {})", arc_version);

    let bridge = Bridge::load(arc_version);
    *BRIDGE.lock().unwrap() = Some(bridge);

    mod_init as usize as *mut c_void
}

/// Combat host exit point; the returned address is invoked on unload.
///
/// # Safety
/// Called by the host on client exit.
#[no_mangle]
pub unsafe extern "C" fn get_release_addr() -> *mut c_void {
    mod_release as usize as *mut c_void
}

unsafe extern "C" fn squad_update_callback(users: *const RawUserInfo, count: u64) {
    if users.is_null() {
        return;
    }
    let raw = std::slice::from_raw_parts(users, count as usize);
    let users: Vec<_> = raw.iter().map(|u| host::user_info(u)).collect();

    with_bridge(|bridge| extras::squad_update(bridge, users));
}

unsafe extern "C" fn language_changed_callback(new_language: i32) {
    with_bridge(|bridge| extras::language_changed(bridge, new_language));
}

unsafe extern "C" fn key_bind_changed_callback(changed: RawKeyBindChanged) {
    let bind = host::key_bind(changed);
    with_bridge(|bridge| extras::key_bind_changed(bridge, bind));
}

unsafe extern "C" fn chat_message_callback(chat: *const RawChatMessageInfo) {
    if chat.is_null() {
        return;
    }
    let chat = host::chat_message(&*chat);
    with_bridge(|bridge| extras::chat_message(bridge, chat));
}

/// Extras module entry point: validates the announced API version and
/// registers the callbacks for the highest info version both sides
/// support.
///
/// # Safety
/// Called by the extras module with valid addon info and a subscriber
/// struct of the announced `max_info_version` layout.
#[no_mangle]
pub unsafe extern "C" fn arcdps_unofficial_extras_subscriber_init(
    extras_info: *const ExtrasAddonInfo,
    subscriber_info: *mut c_void,
) {
    if extras_info.is_null() || subscriber_info.is_null() {
        return;
    }
    let info = &*extras_info;

    let version = host::opt_string(info.string_version).unwrap_or_default();
    let self_account = host::opt_string(info.self_account_name).unwrap_or_default();
    let api_version = info.api_version;
    let max_info_version = info.max_info_version;

    with_bridge(|bridge| {
        if !bridge.config.general.enabled || !bridge.config.general.extras {
            log::info!("Extras module is disabled by configs");
            return;
        }

        if api_version != 2 {
            log::error!("Extras api version mismatch, expected 2 and got {}", api_version);
            return;
        }

        let info_version = if max_info_version >= 2 {
            let subscriber = &mut *(subscriber_info as *mut ExtrasSubscriberInfoV2);
            subscriber.info_version = 2;
            subscriber.subscriber_name = SUBSCRIBER_NAME.as_ptr() as *const c_char;
            subscriber.squad_update_callback = Some(squad_update_callback);
            subscriber.language_changed_callback = Some(language_changed_callback);
            subscriber.key_bind_changed_callback = Some(key_bind_changed_callback);
            subscriber.chat_message_callback = Some(chat_message_callback);
            2
        } else if max_info_version == 1 {
            let subscriber = &mut *(subscriber_info as *mut ExtrasSubscriberInfoV1);
            subscriber.info_version = 1;
            subscriber.subscriber_name = SUBSCRIBER_NAME.as_ptr() as *const c_char;
            subscriber.squad_update_callback = Some(squad_update_callback);
            subscriber.language_changed_callback = Some(language_changed_callback);
            subscriber.key_bind_changed_callback = Some(key_bind_changed_callback);
            1
        } else {
            log::error!("Extras info version {} is not supported", max_info_version);
            bridge.update_info(|i| i.extras_found = true);
            return;
        };

        log::info!("Extras module hooked (version {}, info version {})", version, info_version);
        if !self_account.is_empty() {
            bridge.app.set_self_account(&self_account);
        }

        bridge.update_info(|i| {
            i.extras_found = true;
            i.extras_loaded = true;
            i.extras_version = version.clone();
            i.extras_info_version = info_version;
        });
    });
}
