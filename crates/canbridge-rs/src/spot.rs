// crates/canbridge-rs/src/spot.rs

//! Streaming parameter telemetry: interleaves single-parameter reads and
//! coalesces the responses into one batch per interval window.

use crate::hal::CanInterface;
use crate::io::CanIo;
use crate::schema::{param_id_from_address, param_sdo_address};
use crate::sdo::frame::{SdoResponse, decode_response};
use crate::session::{DeviceSession, param_value_from_wire};
use log::{debug, info};
use std::collections::{BTreeMap, VecDeque};

/// Upper bound on subscribed parameter ids per stream.
pub const MAX_PARAM_IDS: usize = 32;
/// Interval clamp, in milliseconds.
pub const MIN_INTERVAL_MS: u64 = 100;
pub const MAX_INTERVAL_MS: u64 = 10_000;

pub struct SpotValueManager {
    active: bool,
    ids: Vec<u32>,
    interval_us: u64,
    queue: VecDeque<u32>,
    batch: BTreeMap<u32, f64>,
    latest: BTreeMap<u32, f64>,
    window_started_us: u64,
}

impl Default for SpotValueManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SpotValueManager {
    pub fn new() -> Self {
        SpotValueManager {
            active: false,
            ids: Vec::new(),
            interval_us: MAX_INTERVAL_MS * 1000,
            queue: VecDeque::new(),
            batch: BTreeMap::new(),
            latest: BTreeMap::new(),
            window_started_us: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The most recent value per parameter, kept across batches so the UI
    /// can render after a reload without waiting a full window.
    pub fn latest(&self) -> &BTreeMap<u32, f64> {
        &self.latest
    }

    pub fn start(&mut self, mut ids: Vec<u32>, interval_ms: u64) {
        ids.truncate(MAX_PARAM_IDS);
        ids.dedup();
        let interval_ms = interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS);
        info!(
            "spot values started: {} params every {} ms",
            ids.len(),
            interval_ms
        );
        self.ids = ids;
        self.interval_us = interval_ms * 1000;
        self.queue.clear();
        self.batch.clear();
        self.window_started_us = 0;
        self.active = true;
    }

    /// Stops the stream, handing back any batch still pending so it can be
    /// flushed to subscribers.
    pub fn stop(&mut self) -> Option<BTreeMap<u32, f64>> {
        if !self.active {
            return None;
        }
        info!("spot values stopped");
        self.active = false;
        self.ids.clear();
        self.queue.clear();
        self.latest.clear();
        let pending = core::mem::take(&mut self.batch);
        (!pending.is_empty()).then_some(pending)
    }

    /// One cooperative iteration: possibly roll the window (returning the
    /// finished batch), issue at most one read, consume at most one
    /// response.
    pub fn tick<I: CanInterface>(
        &mut self,
        io: &mut CanIo<I>,
        session: &mut DeviceSession,
        now_us: u64,
    ) -> Option<BTreeMap<u32, f64>> {
        if !self.active || self.ids.is_empty() {
            return None;
        }
        let Some(node) = session.connected_node() else {
            return None;
        };

        let mut flushed = None;
        if self.window_started_us == 0 {
            // First tick after start: open the window and queue all ids.
            self.queue.extend(self.ids.iter().copied());
            self.window_started_us = now_us.max(1);
        } else if now_us.saturating_sub(self.window_started_us) >= self.interval_us {
            if self.queue.is_empty() {
                if !self.batch.is_empty() {
                    flushed = Some(core::mem::take(&mut self.batch));
                }
                self.queue.extend(self.ids.iter().copied());
                self.window_started_us = now_us;
            } else {
                debug!(
                    "spot window overran with {} requests still queued",
                    self.queue.len()
                );
            }
        }

        // At most one in-flight request per iteration; a refused request
        // stays queued for the next pass.
        if let Some(&id) = self.queue.front()
            && session.can_send_parameter_request(now_us)
        {
            let (index, sub) = param_sdo_address(id);
            if io.request_element_nonblocking(node, index, sub) {
                session.mark_parameter_request_sent(now_us);
                self.queue.pop_front();
            }
        }

        // At most one response per iteration. Out-of-order responses are
        // fine, the parameter id is recovered from the address.
        if let Some(frame) = io.sdo_recv()
            && let SdoResponse::UploadExpedited { index, sub, value } = decode_response(&frame)
            && let Some(id) = param_id_from_address(index, sub)
            && self.ids.contains(&id)
        {
            let value = param_value_from_wire(value as i32);
            self.batch.insert(id, value);
            self.latest.insert(id, value);
        }

        flushed
    }
}
