// crates/canbridge-rs/src/interval.rs

//! Scheduled frame transmission: the user-defined interval list and the
//! bit-packed telemetry/command frame with its rolling counter and CRC.

use crate::crc::{CRC_INIT, crc32_words};
use crate::frame::CanFrame;
use crate::hal::CanInterface;
use crate::io::CanIo;
use log::{info, warn};

/// Interval clamp for scheduled frames, in milliseconds.
pub const MIN_INTERVAL_MS: u64 = 10;
pub const MAX_INTERVAL_MS: u64 = 10_000;

/// One scheduled frame. `id` is the primary key; adding a second entry
/// with the same id replaces the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalMessage {
    pub id: String,
    pub cob_id: u16,
    pub data: Vec<u8>,
    pub interval_ms: u64,
    last_sent_us: u64,
}

/// Fields of the bit-packed control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanIoConfig {
    /// 12 bits.
    pub pot: u16,
    /// 12 bits.
    pub pot2: u16,
    /// 6 bits of digital inputs.
    pub canio: u8,
    /// 14 bits.
    pub cruisespeed: u16,
    /// 8 bits.
    pub regenpreset: u8,
    /// When false, byte 7 stays zero (counter-only mode).
    pub use_crc: bool,
}

struct CanIoSlot {
    config: CanIoConfig,
    cob_id: u16,
    interval_ms: u64,
    ctr: u8,
    last_sent_us: u64,
}

/// Packs the two 32-bit halves of the control frame. The CRC byte of the
/// second half is zero; [`pack_canio_frame`] fills it in when enabled.
fn pack_halves(config: &CanIoConfig, ctr: u8) -> (u32, u32) {
    let ctr = u32::from(ctr & 0x3);
    let half0 = u32::from(config.pot & 0xFFF)
        | (u32::from(config.pot2 & 0xFFF) << 12)
        | (u32::from(config.canio & 0x3F) << 24)
        | (ctr << 30);
    let half1 = u32::from(config.cruisespeed & 0x3FFF)
        | (ctr << 14)
        | (u32::from(config.regenpreset) << 16);
    (half0, half1)
}

/// Builds the 8-byte control frame for one emission.
pub fn pack_canio_frame(config: &CanIoConfig, ctr: u8, cob_id: u16) -> CanFrame {
    let (half0, mut half1) = pack_halves(config, ctr);
    if config.use_crc {
        let crc = crc32_words(CRC_INIT, &[half0, half1]);
        half1 |= (crc & 0xFF) << 24;
    }
    let mut data = [0u8; 8];
    data[0..4].copy_from_slice(&half0.to_le_bytes());
    data[4..8].copy_from_slice(&half1.to_le_bytes());
    // cob_id comes from validated client input.
    CanFrame::new(cob_id, &data).unwrap()
}

pub struct IntervalTransmitter {
    messages: Vec<IntervalMessage>,
    canio: Option<CanIoSlot>,
}

impl Default for IntervalTransmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalTransmitter {
    pub fn new() -> Self {
        IntervalTransmitter {
            messages: Vec::new(),
            canio: None,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.canio.is_none()
    }

    /// Adds or replaces the scheduled frame with this id.
    pub fn upsert(&mut self, id: &str, cob_id: u16, data: Vec<u8>, interval_ms: u64) {
        let message = IntervalMessage {
            id: id.to_string(),
            cob_id,
            data,
            interval_ms: interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS),
            last_sent_us: 0,
        };
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        self.messages.len() != before
    }

    /// Drops every scheduled frame and the control slot.
    pub fn clear(&mut self) {
        if !self.is_empty() {
            info!("interval list cleared");
        }
        self.messages.clear();
        self.canio = None;
    }

    pub fn canio_active(&self) -> bool {
        self.canio.is_some()
    }

    /// Starts (or restarts) control frame emission. The counter begins at
    /// 1 on every start.
    pub fn canio_start(&mut self, cob_id: u16, interval_ms: u64, config: CanIoConfig) {
        self.canio = Some(CanIoSlot {
            config,
            cob_id,
            interval_ms: interval_ms.clamp(MIN_INTERVAL_MS, MAX_INTERVAL_MS),
            ctr: 1,
            last_sent_us: 0,
        });
    }

    /// Updates the control fields in place, keeping counter and schedule.
    pub fn canio_update(&mut self, config: CanIoConfig) -> bool {
        match self.canio.as_mut() {
            Some(slot) => {
                slot.config = config;
                true
            }
            None => false,
        }
    }

    pub fn canio_stop(&mut self) -> bool {
        self.canio.take().is_some()
    }

    /// Transmits every entry whose interval has elapsed.
    pub fn tick<I: CanInterface>(&mut self, io: &mut CanIo<I>, now_us: u64) {
        for message in &mut self.messages {
            if now_us.saturating_sub(message.last_sent_us) < message.interval_ms * 1000 {
                continue;
            }
            match CanFrame::new(message.cob_id, &message.data) {
                Ok(frame) => {
                    if io.tx_submit(frame).is_err() {
                        warn!("interval frame '{}' skipped: transmit queue full", message.id);
                    }
                }
                Err(_) => warn!("interval frame '{}' has an invalid payload", message.id),
            }
            message.last_sent_us = now_us;
        }

        if let Some(slot) = self.canio.as_mut()
            && now_us.saturating_sub(slot.last_sent_us) >= slot.interval_ms * 1000
        {
            let frame = pack_canio_frame(&slot.config, slot.ctr, slot.cob_id);
            if io.tx_submit(frame).is_err() {
                warn!("control frame skipped: transmit queue full");
            }
            slot.ctr = (slot.ctr + 1) & 0x3;
            slot.last_sent_us = now_us;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::crc::{CRC_INIT, crc32_word};
    use crate::testutil::MockCan;

    fn io() -> CanIo<MockCan> {
        let mut io = CanIo::new(MockCan::new());
        io.init_for_scanning(&GatewaySettings::default().can_settings())
            .unwrap();
        io
    }

    fn unpack_halves(frame: &CanFrame) -> (u32, u32) {
        let d = frame.padded();
        (
            u32::from_le_bytes(d[0..4].try_into().unwrap()),
            u32::from_le_bytes(d[4..8].try_into().unwrap()),
        )
    }

    #[test]
    fn canio_packing_round_trip_without_crc() {
        let config = CanIoConfig {
            pot: 0xABC,
            pot2: 0x123,
            canio: 0x1E,
            cruisespeed: 0x1FAB,
            regenpreset: 0x55,
            use_crc: false,
        };
        let frame = pack_canio_frame(&config, 2, 0x3F);
        let (half0, half1) = unpack_halves(&frame);

        assert_eq!(half0 & 0xFFF, 0xABC);
        assert_eq!((half0 >> 12) & 0xFFF, 0x123);
        assert_eq!((half0 >> 24) & 0x3F, 0x1E);
        assert_eq!(half0 >> 30, 2);
        assert_eq!(half1 & 0x3FFF, 0x1FAB);
        assert_eq!((half1 >> 14) & 0x3, 2);
        assert_eq!((half1 >> 16) & 0xFF, 0x55);
        assert_eq!(frame.padded()[7], 0, "counter-only mode leaves byte 7 zero");
    }

    #[test]
    fn canio_crc_is_low_byte_of_word_crc() {
        let config = CanIoConfig {
            pot: 0xABC,
            pot2: 0x123,
            canio: 0x1E,
            cruisespeed: 0x1FAB,
            regenpreset: 0x55,
            use_crc: true,
        };
        let frame = pack_canio_frame(&config, 2, 0x3F);
        let (half0, half1) = unpack_halves(&frame);
        let half1_without_crc = half1 & 0x00FF_FFFF;
        let expected = crc32_word(crc32_word(CRC_INIT, half0), half1_without_crc);
        assert_eq!(frame.padded()[7], (expected & 0xFF) as u8);
        // Everything below the CRC byte matches the counter-only layout.
        let plain = pack_canio_frame(&CanIoConfig { use_crc: false, ..config }, 2, 0x3F);
        assert_eq!(&frame.padded()[0..7], &plain.padded()[0..7]);
    }

    #[test]
    fn counter_starts_at_one_and_wraps_modulo_four() {
        let mut io = io();
        let mut tx = IntervalTransmitter::new();
        tx.canio_start(0x3F, 10, CanIoConfig::default());

        let mut counters = Vec::new();
        for step in 1..=6u64 {
            tx.tick(&mut io, step * 20_000);
            io.pump(step * 20_000);
            let frame = *io.interface().sent.last().unwrap();
            let (half0, _) = unpack_halves(&frame);
            counters.push(half0 >> 30);
        }
        assert_eq!(counters, vec![1, 2, 3, 0, 1, 2]);
    }

    #[test]
    fn upsert_replaces_entries_with_the_same_id() {
        let mut tx = IntervalTransmitter::new();
        tx.upsert("a", 0x100, vec![1], 100);
        tx.upsert("b", 0x200, vec![2], 100);
        tx.upsert("a", 0x300, vec![3], 200);
        assert_eq!(tx.len(), 2);
        let entry = tx.messages.iter().find(|m| m.id == "a").unwrap();
        assert_eq!(entry.cob_id, 0x300);
        assert_eq!(entry.interval_ms, 200);
    }

    #[test]
    fn interval_is_clamped_into_range() {
        let mut tx = IntervalTransmitter::new();
        tx.upsert("fast", 0x100, vec![], 1);
        tx.upsert("slow", 0x100, vec![], 99_999);
        assert_eq!(tx.messages[0].interval_ms, MIN_INTERVAL_MS);
        assert_eq!(tx.messages[1].interval_ms, MAX_INTERVAL_MS);
    }

    #[test]
    fn due_entries_transmit_and_restamp() {
        let mut io = io();
        let mut tx = IntervalTransmitter::new();
        tx.upsert("a", 0x100, vec![0xAA], 100);

        tx.tick(&mut io, 100_000); // due immediately
        tx.tick(&mut io, 150_000); // 50 ms later, not due
        tx.tick(&mut io, 200_000); // due again
        io.pump(200_000);
        assert_eq!(io.interface().sent.len(), 2);
    }

    #[test]
    fn remove_and_clear() {
        let mut tx = IntervalTransmitter::new();
        tx.upsert("a", 0x100, vec![], 100);
        tx.canio_start(0x3F, 100, CanIoConfig::default());
        assert!(tx.remove("a"));
        assert!(!tx.remove("a"));
        assert!(tx.canio_active());
        tx.clear();
        assert!(tx.is_empty());
        assert!(!tx.canio_active());
    }

    #[test]
    fn canio_update_mutates_in_place() {
        let mut tx = IntervalTransmitter::new();
        assert!(!tx.canio_update(CanIoConfig::default()));
        tx.canio_start(0x3F, 100, CanIoConfig::default());
        assert!(tx.canio_update(CanIoConfig { pot: 7, ..CanIoConfig::default() }));
        assert_eq!(tx.canio.as_ref().unwrap().config.pot, 7);
        assert_eq!(tx.canio.as_ref().unwrap().ctr, 1, "counter survives updates");
        assert!(tx.canio_stop());
        assert!(!tx.canio_stop());
    }
}
