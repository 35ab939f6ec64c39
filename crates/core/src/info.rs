//! Bridge metadata published to clients.

use bytes::{BufMut, BytesMut};
use serde_json::{json, Value};

use crate::msg::ser::{put_str, str_serial_size, ToSerial};
use crate::msg::Encode;

/// Bridge build version, baked in at compile time.
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Major wire API version. Bumped on any binary layout or type value change.
pub const MAJOR_API_VERSION: u32 = 2;

/// Minor wire API version. Bumped on additive, compatible changes.
pub const MINOR_API_VERSION: u32 = 0;

/// Metadata describing the running bridge and its two event sources.
///
/// The `validator` increases on every observable change; clients use it to
/// deduplicate re-sent info messages. Held under a lock in
/// [`crate::app::ApplicationData`]; readers copy it out whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    /// Bridge build version string.
    pub version: String,
    /// Version string reported by the extras module. Empty until found.
    pub extras_version: String,
    /// Version string reported by the combat host. Empty until attached.
    pub arc_version: String,
    /// Revision counter, starts at 1.
    pub validator: u64,
    /// Extras callback info version in use (0 when extras is absent).
    pub extras_info_version: u32,
    /// Combat telemetry is attached and enabled.
    pub arc_loaded: bool,
    /// The extras module announced itself.
    pub extras_found: bool,
    /// The extras module is attached and enabled.
    pub extras_loaded: bool,
}

impl Default for BridgeInfo {
    fn default() -> Self {
        BridgeInfo {
            version: BRIDGE_VERSION.to_owned(),
            extras_version: String::new(),
            arc_version: String::new(),
            validator: 1,
            extras_info_version: 0,
            arc_loaded: false,
            extras_found: false,
            extras_loaded: false,
        }
    }
}

impl ToSerial for BridgeInfo {
    fn serial_size(&self) -> usize {
        4 + 4
            + 8
            + str_serial_size(Some(&self.version))
            + str_serial_size(Some(&self.extras_version))
            + str_serial_size(Some(&self.arc_version))
            + 4
            + 3
    }

    fn to_serial(&self, buf: &mut BytesMut) {
        // API version leads so clients can bail out before parsing further.
        buf.put_u32_le(MAJOR_API_VERSION);
        buf.put_u32_le(MINOR_API_VERSION);
        buf.put_u64_le(self.validator);
        put_str(buf, Some(&self.version));
        put_str(buf, Some(&self.extras_version));
        put_str(buf, Some(&self.arc_version));
        buf.put_u32_le(self.extras_info_version);
        buf.put_u8(self.arc_loaded as u8);
        buf.put_u8(self.extras_found as u8);
        buf.put_u8(self.extras_loaded as u8);
    }
}

impl Encode for BridgeInfo {
    fn to_text(&self) -> Value {
        let nullable = |s: &str| -> Value {
            if s.is_empty() {
                Value::Null
            } else {
                Value::String(s.to_owned())
            }
        };

        json!({
            "version": self.version,
            "extrasVersion": nullable(&self.extras_version),
            "arcVersion": nullable(&self.arc_version),
            "validator": self.validator,
            "extrasInfoVersion": self.extras_info_version,
            "arcLoaded": self.arc_loaded,
            "extrasFound": self.extras_found,
            "extrasLoaded": self.extras_loaded,
            "majorApiVersion": MAJOR_API_VERSION,
            "minorApiVersion": MINOR_API_VERSION,
        })
    }
}
