//! Reference counts of what connected clients are interested in.
//!
//! Producers consult these before doing encoding work. The counters are
//! lower bounds: a subscription is counted before its client is published
//! to fan-out, so a producer may encode for nobody but never skips work a
//! subscriber needs.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::msg::{MessageCategory, MessageProtocol, ProtocolMask};

/// Lock-free subscription and protocol usage counters.
#[derive(Debug, Default)]
pub struct MessageTracking {
    binary_users: AtomicUsize,
    text_users: AtomicUsize,
    // Combat, Extras, Squad.
    categories: [AtomicUsize; 3],
}

fn category_index(category: MessageCategory) -> Option<usize> {
    match category {
        MessageCategory::Info => None,
        MessageCategory::Combat => Some(0),
        MessageCategory::Extras => Some(1),
        MessageCategory::Squad => Some(2),
    }
}

impl MessageTracking {
    fn protocol_counter(&self, protocol: MessageProtocol) -> &AtomicUsize {
        match protocol {
            MessageProtocol::Binary => &self.binary_users,
            MessageProtocol::Text => &self.text_users,
        }
    }

    /// A client committed to `protocol`.
    pub fn use_protocol(&self, protocol: MessageProtocol) {
        self.protocol_counter(protocol).fetch_add(1, Ordering::AcqRel);
    }

    /// A client using `protocol` went away.
    pub fn unuse_protocol(&self, protocol: MessageProtocol) {
        self.protocol_counter(protocol).fetch_sub(1, Ordering::AcqRel);
    }

    /// Does any client want `protocol`?
    pub fn using_protocol(&self, protocol: MessageProtocol) -> bool {
        self.protocol_counter(protocol).load(Ordering::Acquire) > 0
    }

    /// Mask of all protocols currently in use.
    pub fn protocols(&self) -> ProtocolMask {
        let mut bits = 0;
        if self.using_protocol(MessageProtocol::Binary) {
            bits |= MessageProtocol::Binary.bit();
        }
        if self.using_protocol(MessageProtocol::Text) {
            bits |= MessageProtocol::Text.bit();
        }
        ProtocolMask::from_bits(bits)
    }

    /// A client subscribed to `category`.
    pub fn track_category(&self, category: MessageCategory) {
        if let Some(index) = category_index(category) {
            self.categories[index].fetch_add(1, Ordering::AcqRel);
        }
    }

    /// A client subscribed to `category` went away.
    pub fn untrack_category(&self, category: MessageCategory) {
        if let Some(index) = category_index(category) {
            self.categories[index].fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Does any client subscribe to `category`? Info is implicit and
    /// always reported as tracked.
    pub fn tracking_category(&self, category: MessageCategory) -> bool {
        match category_index(category) {
            Some(index) => self.categories[index].load(Ordering::Acquire) > 0,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_counts() {
        let tracking = MessageTracking::default();
        assert!(!tracking.using_protocol(MessageProtocol::Binary));
        assert!(tracking.protocols().is_empty());

        tracking.use_protocol(MessageProtocol::Binary);
        tracking.use_protocol(MessageProtocol::Binary);
        tracking.use_protocol(MessageProtocol::Text);
        assert!(tracking.using_protocol(MessageProtocol::Binary));
        assert!(tracking.protocols().contains(MessageProtocol::Text));

        tracking.unuse_protocol(MessageProtocol::Binary);
        assert!(tracking.using_protocol(MessageProtocol::Binary));
        tracking.unuse_protocol(MessageProtocol::Binary);
        assert!(!tracking.using_protocol(MessageProtocol::Binary));
    }

    #[test]
    fn category_counts() {
        let tracking = MessageTracking::default();
        assert!(!tracking.tracking_category(MessageCategory::Combat));
        assert!(tracking.tracking_category(MessageCategory::Info));

        tracking.track_category(MessageCategory::Squad);
        assert!(tracking.tracking_category(MessageCategory::Squad));
        assert!(!tracking.tracking_category(MessageCategory::Extras));

        tracking.untrack_category(MessageCategory::Squad);
        assert!(!tracking.tracking_category(MessageCategory::Squad));
    }
}
