//! Event path from the coordinator to one client
//!
//! The proxy turns coordinator notifications into [`SessionEvent`]s on the
//! client's channel and throttles vsync delivery. Once `watermark - 1`
//! vsyncs went out unacknowledged, the next one carries a cookie the client
//! must hand back through `AcknowledgeVsync`. At `max_unacked` delivery
//! stops and vsyncs queue in a small ring, oldest dropped first, until the
//! acknowledgement arrives.

use crate::display::DisplayInfo;
use crate::types::{ClientId, ConfigStamp, DisplayId, VsyncAckCookie};
use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use xxhash_rust::xxh64::xxh64;

/// Notification delivered to a client
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DisplaysChanged {
        added: Vec<DisplayInfo>,
        removed: Vec<DisplayId>,
    },
    Vsync {
        display_id: DisplayId,
        timestamp: u64,
        stamp: ConfigStamp,
        cookie: VsyncAckCookie,
    },
    OwnershipChanged(bool),
}

/// Vsync throttling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncLimits {
    pub ack_watermark: u64,
    pub max_unacked: u64,
    pub buffer_size: usize,
}

impl Default for VsyncLimits {
    fn default() -> Self {
        Self {
            ack_watermark: 300,
            max_unacked: 600,
            buffer_size: 10,
        }
    }
}

/// Session state mirrored outside the worker for the engine's callback
/// contexts and for diagnostics
#[derive(Debug, Default)]
pub struct ProxyFlags {
    vsync_enabled: Mutex<bool>,
    capture_active: Mutex<bool>,
    is_owner: AtomicBool,
}

impl ProxyFlags {
    pub fn vsync_enabled(&self) -> bool {
        *self.vsync_enabled.lock()
    }

    pub fn capture_active(&self) -> bool {
        *self.capture_active.lock()
    }

    pub fn set_capture_active(&self, active: bool) {
        *self.capture_active.lock() = active;
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy)]
struct BufferedVsync {
    display_id: DisplayId,
    timestamp: u64,
    stamp: ConfigStamp,
}

/// Controller-to-client stamp pair recorded at apply time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StampPair {
    controller: ConfigStamp,
    client: ConfigStamp,
}

pub struct SessionProxy {
    client: ClientId,
    events: mpsc::UnboundedSender<SessionEvent>,
    flags: Arc<ProxyFlags>,
    limits: VsyncLimits,
    stamp_pairs: VecDeque<StampPair>,
    sent_since_ack: u64,
    outstanding_cookie: VsyncAckCookie,
    cookie_sequence: u64,
    buffered: VecDeque<BufferedVsync>,
    dropped_vsyncs: u64,
}

impl SessionProxy {
    pub fn new(client: ClientId, events: mpsc::UnboundedSender<SessionEvent>, limits: VsyncLimits) -> Self {
        Self {
            client,
            events,
            flags: Arc::new(ProxyFlags::default()),
            limits,
            stamp_pairs: VecDeque::new(),
            sent_since_ack: 0,
            outstanding_cookie: VsyncAckCookie::INVALID,
            cookie_sequence: 0,
            buffered: VecDeque::new(),
            dropped_vsyncs: 0,
        }
    }

    pub fn flags(&self) -> Arc<ProxyFlags> {
        self.flags.clone()
    }

    fn send(&self, event: SessionEvent) -> bool {
        if self.events.send(event).is_err() {
            debug!("Client {} event channel closed", self.client);
            return false;
        }
        true
    }

    pub fn on_displays_changed(&self, added: Vec<DisplayInfo>, removed: Vec<DisplayId>) {
        self.send(SessionEvent::DisplaysChanged { added, removed });
    }

    pub fn on_ownership_change(&self, is_owner: bool) {
        self.flags.is_owner.store(is_owner, Ordering::Release);
        self.send(SessionEvent::OwnershipChanged(is_owner));
    }

    pub fn enable_vsync(&mut self, enable: bool) {
        *self.flags.vsync_enabled.lock() = enable;
        if !enable {
            self.buffered.clear();
        }
    }

    /// Remember that controller stamp `controller` carries this client's `client` stamp
    pub fn update_config_stamp_mapping(&mut self, controller: ConfigStamp, client: ConfigStamp) {
        debug_assert!(self
            .stamp_pairs
            .back()
            .map_or(true, |last| last.controller < controller));
        self.stamp_pairs.push_back(StampPair { controller, client });
    }

    /// Client stamp for `controller` if this session produced it.
    ///
    /// A match discards every older pair; the matched pair stays for
    /// vsyncs that report the same stamp again.
    pub fn owns_controller_stamp(&mut self, controller: ConfigStamp) -> Option<ConfigStamp> {
        let index = self.stamp_pairs.iter().position(|pair| pair.controller >= controller)?;
        let pair = self.stamp_pairs[index];
        if pair.controller != controller {
            return None;
        }
        self.stamp_pairs.drain(..index);
        Some(pair.client)
    }

    /// Forget every stamp pair, used when the session's state is wiped
    pub fn clear_stamp_mapping(&mut self) {
        self.stamp_pairs.clear();
    }

    /// Deliver a vsync carrying this client's stamp, subject to throttling
    pub fn on_display_vsync(&mut self, display_id: DisplayId, timestamp: u64, stamp: ConfigStamp) {
        if !self.flags.vsync_enabled() {
            return;
        }
        let vsync = BufferedVsync { display_id, timestamp, stamp };

        while self.sent_since_ack < self.limits.max_unacked {
            let Some(next) = self.buffered.pop_front() else {
                break;
            };
            self.deliver(next);
        }
        if self.sent_since_ack < self.limits.max_unacked {
            self.deliver(vsync);
            return;
        }

        if self.buffered.len() >= self.limits.buffer_size {
            self.buffered.pop_front();
            self.dropped_vsyncs += 1;
            warn!(
                "Client {} is not acknowledging vsyncs, dropped {} so far",
                self.client, self.dropped_vsyncs
            );
        }
        if self.limits.buffer_size > 0 {
            self.buffered.push_back(vsync);
        }
    }

    fn deliver(&mut self, vsync: BufferedVsync) {
        let mut cookie = VsyncAckCookie::INVALID;
        if self.sent_since_ack >= self.limits.ack_watermark.saturating_sub(1)
            && self.outstanding_cookie == VsyncAckCookie::INVALID
        {
            cookie = self.next_cookie();
            self.outstanding_cookie = cookie;
            trace!("Client {} must acknowledge vsync cookie {:#x}", self.client, cookie.0);
        }
        self.sent_since_ack += 1;
        self.send(SessionEvent::Vsync {
            display_id: vsync.display_id,
            timestamp: vsync.timestamp,
            stamp: vsync.stamp,
            cookie,
        });
    }

    fn next_cookie(&mut self) -> VsyncAckCookie {
        loop {
            self.cookie_sequence += 1;
            let value = xxh64(&self.cookie_sequence.to_le_bytes(), self.client.value());
            if value != 0 {
                return VsyncAckCookie(value);
            }
        }
    }

    pub fn acknowledge_vsync(&mut self, cookie: VsyncAckCookie) {
        if cookie == VsyncAckCookie::INVALID {
            return;
        }
        if cookie != self.outstanding_cookie {
            debug!("Client {} acknowledged stale vsync cookie {:#x}", self.client, cookie.0);
            return;
        }
        self.outstanding_cookie = VsyncAckCookie::INVALID;
        self.sent_since_ack = 0;
    }

    pub fn buffered_vsyncs(&self) -> usize {
        self.buffered.len()
    }

    pub fn set_capture_active(&self, active: bool) {
        self.flags.set_capture_active(active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(limits: VsyncLimits) -> (SessionProxy, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut proxy = SessionProxy::new(ClientId(1), tx, limits);
        proxy.enable_vsync(true);
        (proxy, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<(u64, VsyncAckCookie)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Vsync { timestamp, cookie, .. } = event {
                out.push((timestamp, cookie));
            }
        }
        out
    }

    #[test]
    fn stamp_matching_discards_older_pairs() {
        let (mut proxy, _rx) = proxy(VsyncLimits::default());
        proxy.update_config_stamp_mapping(ConfigStamp(2), ConfigStamp(1));
        proxy.update_config_stamp_mapping(ConfigStamp(5), ConfigStamp(2));

        assert_eq!(proxy.owns_controller_stamp(ConfigStamp(3)), None);
        assert_eq!(proxy.owns_controller_stamp(ConfigStamp(5)), Some(ConfigStamp(2)));
        assert_eq!(proxy.owns_controller_stamp(ConfigStamp(2)), None);
        assert_eq!(proxy.owns_controller_stamp(ConfigStamp(5)), Some(ConfigStamp(2)));
    }

    #[test]
    fn disabled_vsync_is_not_delivered() {
        let (mut proxy, mut rx) = proxy(VsyncLimits::default());
        proxy.enable_vsync(false);
        proxy.on_display_vsync(DisplayId(1), 1, ConfigStamp(1));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn cookie_requested_at_watermark() {
        let limits = VsyncLimits { ack_watermark: 3, max_unacked: 10, buffer_size: 4 };
        let (mut proxy, mut rx) = proxy(limits);
        for ts in 0..4 {
            proxy.on_display_vsync(DisplayId(1), ts, ConfigStamp(1));
        }
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].1, VsyncAckCookie::INVALID);
        assert_eq!(sent[1].1, VsyncAckCookie::INVALID);
        assert_ne!(sent[2].1, VsyncAckCookie::INVALID);
        assert_eq!(sent[3].1, VsyncAckCookie::INVALID);
    }

    #[test]
    fn buffered_vsyncs_flush_in_order_after_ack() {
        let limits = VsyncLimits { ack_watermark: 2, max_unacked: 3, buffer_size: 2 };
        let (mut proxy, mut rx) = proxy(limits);
        for ts in 0..6 {
            proxy.on_display_vsync(DisplayId(1), ts, ConfigStamp(1));
        }
        let sent = drain(&mut rx);
        assert_eq!(sent.iter().map(|(ts, _)| *ts).collect::<Vec<_>>(), vec![0, 1, 2]);
        let cookie = sent[1].1;
        assert_ne!(cookie, VsyncAckCookie::INVALID);
        // 3 was dropped when 5 arrived.
        assert_eq!(proxy.buffered_vsyncs(), 2);

        proxy.acknowledge_vsync(cookie);
        proxy.on_display_vsync(DisplayId(1), 6, ConfigStamp(1));
        let sent = drain(&mut rx);
        assert_eq!(sent.iter().map(|(ts, _)| *ts).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(proxy.buffered_vsyncs(), 0);
    }

    #[test]
    fn stale_cookie_is_ignored() {
        let limits = VsyncLimits { ack_watermark: 1, max_unacked: 1, buffer_size: 1 };
        let (mut proxy, mut rx) = proxy(limits);
        proxy.on_display_vsync(DisplayId(1), 0, ConfigStamp(1));
        let cookie = drain(&mut rx)[0].1;
        proxy.acknowledge_vsync(VsyncAckCookie(cookie.0.wrapping_add(1)));
        proxy.on_display_vsync(DisplayId(1), 1, ConfigStamp(1));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(proxy.buffered_vsyncs(), 1);
    }
}
