// crates/canbridge-rs/src/firmware.rs

//! Remote firmware update over the vendor bootloader.
//!
//! The bootloader drives the exchange: every frame it sends on `0x7DE`
//! prompts the gateway for the next piece (magic echo, page count, 8-byte
//! data chunks, page CRC) on `0x7DD`. Pages are 1024 bytes; the CRC is
//! computed per page so a rejected page can be rewound and resent.

use crate::crc::{CRC_INIT, crc32_word};
use crate::frame::CanFrame;
use crate::hal::CanInterface;
use crate::io::CanIo;
use crate::types::COB_BOOT_COMMAND;
use log::{debug, info, warn};

/// Bytes per firmware page.
pub const PAGE_SIZE: usize = 1024;
/// Bytes sent per data prompt.
const CHUNK_SIZE: usize = 8;
/// First byte of the bootloader's hello frame.
const MAGIC: u8 = 0x33;
/// Grace period granted to bootloaders that announce an id below 1; they
/// drop the size exchange when it follows the echo too quickly.
const QUIRK_HOLD_US: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    #[default]
    Idle,
    SendMagic,
    SendSize,
    SendPage,
    CheckCrc,
    /// The device accepted the image and is rebooting; serial acquisition
    /// must be re-run before the session is usable again.
    RequestJson,
}

/// One-shot notifications produced while an update runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    Progress { percent: u8 },
    Done,
    Failed { reason: &'static str },
}

pub struct FirmwareUpdater {
    state: UpdateState,
    blob: Vec<u8>,
    total_pages: u32,
    current_page: u32,
    current_byte: usize,
    crc: u32,
    /// While set, the transition to `SendSize` waits for this deadline.
    quirk_hold_until_us: Option<u64>,
}

impl Default for FirmwareUpdater {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareUpdater {
    pub fn new() -> Self {
        FirmwareUpdater {
            state: UpdateState::Idle,
            blob: Vec::new(),
            total_pages: 0,
            current_page: 0,
            current_byte: 0,
            crc: CRC_INIT,
            quirk_hold_until_us: None,
        }
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// True while an exchange with the bootloader is running.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, UpdateState::Idle | UpdateState::RequestJson)
    }

    pub fn progress_percent(&self) -> u8 {
        if self.total_pages == 0 {
            return 0;
        }
        ((self.current_page * 100) / self.total_pages).min(100) as u8
    }

    /// Arms the updater with a firmware image. The caller is responsible
    /// for resetting the device into its bootloader first.
    pub fn begin(&mut self, blob: Vec<u8>) -> Result<(), &'static str> {
        if blob.is_empty() {
            return Err("empty firmware image");
        }
        self.total_pages = blob.len().div_ceil(PAGE_SIZE) as u32;
        info!(
            "firmware update armed: {} bytes, {} pages",
            blob.len(),
            self.total_pages
        );
        self.blob = blob;
        self.current_page = 0;
        self.current_byte = 0;
        self.crc = CRC_INIT;
        self.state = UpdateState::SendMagic;
        Ok(())
    }

    /// Drops any update in progress.
    pub fn cancel(&mut self) {
        if self.state != UpdateState::Idle {
            warn!("firmware update cancelled in state {:?}", self.state);
        }
        self.reset();
    }

    /// Acknowledges the terminal state after the dispatcher has scheduled
    /// the reconnect.
    pub fn finish(&mut self) {
        self.reset();
    }

    fn reset(&mut self) {
        self.state = UpdateState::Idle;
        self.blob = Vec::new();
        self.total_pages = 0;
        self.current_page = 0;
        self.current_byte = 0;
        self.crc = CRC_INIT;
        self.quirk_hold_until_us = None;
    }

    /// Clears an expired quirk hold. Called from the protocol loop so the
    /// delayed transition never blocks it.
    pub fn tick(&mut self, now_us: u64) {
        if let Some(deadline) = self.quirk_hold_until_us
            && now_us >= deadline
        {
            self.quirk_hold_until_us = None;
            self.state = UpdateState::SendSize;
        }
    }

    /// Handles one bootloader response frame. Ignores traffic while idle.
    pub fn handle_frame<I: CanInterface>(
        &mut self,
        frame: &CanFrame,
        io: &mut CanIo<I>,
        now_us: u64,
    ) -> Vec<UpdateEvent> {
        let mut events = Vec::new();
        let Some(&trigger) = frame.data().first() else {
            return events;
        };

        match (self.state, trigger) {
            (UpdateState::SendMagic, MAGIC) => {
                // The bootloader announces itself with its id bytes, which
                // it expects echoed back.
                let echo = &frame.data()[1..];
                self.send(io, echo);
                if frame.data().get(1).copied().unwrap_or(0) < 1 {
                    // Older bootloaders need a breather before the size
                    // prompt or they drop it; hold the transition and let
                    // tick() complete it.
                    self.quirk_hold_until_us = Some(now_us + QUIRK_HOLD_US);
                } else {
                    self.state = UpdateState::SendSize;
                }
            }
            (UpdateState::SendSize, b'S') => {
                self.send(io, &[self.total_pages as u8]);
                self.crc = CRC_INIT;
                self.state = UpdateState::SendPage;
            }
            (UpdateState::SendPage, b'P') => {
                let mut chunk = [0xFFu8; CHUNK_SIZE];
                for (i, byte) in chunk.iter_mut().enumerate() {
                    if let Some(b) = self.blob.get(self.current_byte + i) {
                        *byte = *b;
                    }
                }
                let half0 = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                let half1 = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
                self.crc = crc32_word(self.crc, half0);
                self.crc = crc32_word(self.crc, half1);
                self.current_byte += CHUNK_SIZE;
                self.send(io, &chunk);
            }
            (UpdateState::SendPage, b'C') => {
                let crc = self.crc;
                self.send(io, &crc.to_le_bytes());
                self.state = UpdateState::CheckCrc;
            }
            (UpdateState::CheckCrc, b'P') => {
                self.current_page += 1;
                self.crc = CRC_INIT;
                self.state = UpdateState::SendPage;
                debug!(
                    "page {}/{} accepted",
                    self.current_page, self.total_pages
                );
                events.push(UpdateEvent::Progress {
                    percent: self.progress_percent(),
                });
            }
            (UpdateState::CheckCrc, b'E') => {
                warn!("page {} rejected, resending", self.current_page);
                self.current_byte = self.current_page as usize * PAGE_SIZE;
                self.crc = CRC_INIT;
                self.state = UpdateState::SendPage;
            }
            (UpdateState::CheckCrc, b'D') => {
                info!("firmware image accepted, device is rebooting");
                self.current_page = self.total_pages;
                self.state = UpdateState::RequestJson;
                events.push(UpdateEvent::Progress { percent: 100 });
                events.push(UpdateEvent::Done);
            }
            (UpdateState::Idle, _) | (UpdateState::RequestJson, _) => {}
            (state, trigger) => {
                debug!(
                    "ignoring bootloader trigger {:#04X} in state {:?}",
                    trigger, state
                );
            }
        }
        events
    }

    fn send<I: CanInterface>(&self, io: &mut CanIo<I>, data: &[u8]) {
        match CanFrame::new(COB_BOOT_COMMAND, data) {
            Ok(frame) => {
                if io.tx_submit(frame).is_err() {
                    warn!("bootloader reply dropped: transmit queue full");
                }
            }
            Err(_) => warn!("bootloader reply dropped: payload too long"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;
    use crate::crc::crc32_words;
    use crate::testutil::MockCan;

    fn io() -> CanIo<MockCan> {
        let mut io = CanIo::new(MockCan::new());
        io.init_for_scanning(&GatewaySettings::default().can_settings())
            .unwrap();
        io
    }

    fn boot(data: &[u8]) -> CanFrame {
        CanFrame::new(0x7DE, data).unwrap()
    }

    fn drive(updater: &mut FirmwareUpdater, io: &mut CanIo<MockCan>, data: &[u8]) -> Vec<UpdateEvent> {
        let events = updater.handle_frame(&boot(data), io, 0);
        io.pump(0);
        events
    }

    #[test]
    fn page_count_rounds_up() {
        let mut updater = FirmwareUpdater::new();
        updater.begin(vec![0u8; 2050]).unwrap();
        assert_eq!(updater.total_pages, 3);
        updater.begin(vec![0u8; 1024]).unwrap();
        assert_eq!(updater.total_pages, 1);
        assert!(updater.begin(Vec::new()).is_err());
    }

    #[test]
    fn magic_is_echoed_and_size_is_page_count() {
        let mut io = io();
        let mut updater = FirmwareUpdater::new();
        updater.begin(vec![0xAB; 2050]).unwrap();

        drive(&mut updater, &mut io, &[MAGIC, 0x42, 0x43]);
        assert_eq!(updater.state(), UpdateState::SendSize);
        assert_eq!(io.interface().sent.last().unwrap().data(), &[0x42, 0x43]);

        drive(&mut updater, &mut io, b"S");
        assert_eq!(updater.state(), UpdateState::SendPage);
        assert_eq!(io.interface().sent.last().unwrap().data(), &[3]);
    }

    #[test]
    fn low_id_bootloaders_hold_before_the_size_exchange() {
        let mut io = io();
        let mut updater = FirmwareUpdater::new();
        updater.begin(vec![0xAB; 1024]).unwrap();

        let events = updater.handle_frame(&boot(&[MAGIC, 0]), &mut io, 1_000_000);
        io.pump(1_000_000);
        assert!(events.is_empty());
        assert_eq!(updater.state(), UpdateState::SendMagic, "transition is held");
        assert_eq!(io.interface().sent.last().unwrap().data(), &[0], "echo still goes out");

        updater.tick(1_050_000);
        assert_eq!(updater.state(), UpdateState::SendMagic, "hold not yet expired");
        updater.tick(1_100_000);
        assert_eq!(updater.state(), UpdateState::SendSize);

        // The size prompt now proceeds as usual.
        drive(&mut updater, &mut io, b"S");
        assert_eq!(updater.state(), UpdateState::SendPage);
        assert_eq!(io.interface().sent.last().unwrap().data(), &[1]);
    }

    #[test]
    fn each_page_feeds_exactly_1024_bytes_into_the_crc() {
        let blob: Vec<u8> = (0..2050u32).map(|i| i as u8).collect();
        let mut io = io();
        let mut updater = FirmwareUpdater::new();
        updater.begin(blob.clone()).unwrap();
        drive(&mut updater, &mut io, &[MAGIC, 1]);
        drive(&mut updater, &mut io, b"S");

        // First page: 128 chunk prompts, then the CRC prompt.
        for _ in 0..(PAGE_SIZE / CHUNK_SIZE) {
            drive(&mut updater, &mut io, b"P");
        }
        assert_eq!(updater.current_byte, PAGE_SIZE);

        drive(&mut updater, &mut io, b"C");
        assert_eq!(updater.state(), UpdateState::CheckCrc);

        let words: Vec<u32> = blob[..PAGE_SIZE]
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        let expected = crc32_words(CRC_INIT, &words);
        assert_eq!(
            io.interface().sent.last().unwrap().data(),
            expected.to_le_bytes()
        );
    }

    #[test]
    fn short_final_page_is_padded_with_ff() {
        let blob = vec![0x11u8; PAGE_SIZE + 4]; // 2 pages, second nearly empty
        let mut io = io();
        let mut updater = FirmwareUpdater::new();
        updater.begin(blob).unwrap();
        drive(&mut updater, &mut io, &[MAGIC, 1]);
        drive(&mut updater, &mut io, b"S");
        for _ in 0..(PAGE_SIZE / CHUNK_SIZE) {
            drive(&mut updater, &mut io, b"P");
        }
        drive(&mut updater, &mut io, b"C");
        drive(&mut updater, &mut io, b"P"); // page 0 accepted

        drive(&mut updater, &mut io, b"P"); // first chunk of page 1
        assert_eq!(
            io.interface().sent.last().unwrap().data(),
            &[0x11, 0x11, 0x11, 0x11, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn rejected_page_rewinds_to_page_start() {
        let blob = vec![0x22u8; PAGE_SIZE * 2];
        let mut io = io();
        let mut updater = FirmwareUpdater::new();
        updater.begin(blob).unwrap();
        drive(&mut updater, &mut io, &[MAGIC, 1]);
        drive(&mut updater, &mut io, b"S");
        for _ in 0..(PAGE_SIZE / CHUNK_SIZE) {
            drive(&mut updater, &mut io, b"P");
        }
        let first_crc_frame = {
            drive(&mut updater, &mut io, b"C");
            io.interface().sent.last().unwrap().data().to_vec()
        };

        drive(&mut updater, &mut io, b"E");
        assert_eq!(updater.current_byte, 0);
        assert_eq!(updater.state(), UpdateState::SendPage);

        // Resending the page reproduces the same CRC.
        for _ in 0..(PAGE_SIZE / CHUNK_SIZE) {
            drive(&mut updater, &mut io, b"P");
        }
        drive(&mut updater, &mut io, b"C");
        assert_eq!(io.interface().sent.last().unwrap().data(), first_crc_frame);
    }

    #[test]
    fn full_update_reports_progress_per_page_then_done() {
        let blob = vec![0x5Au8; 2050];
        let mut io = io();
        let mut updater = FirmwareUpdater::new();
        updater.begin(blob).unwrap();

        let mut events = Vec::new();
        events.extend(drive(&mut updater, &mut io, &[MAGIC, 1]));
        events.extend(drive(&mut updater, &mut io, b"S"));
        for page in 0..3 {
            for _ in 0..(PAGE_SIZE / CHUNK_SIZE) {
                events.extend(drive(&mut updater, &mut io, b"P"));
            }
            events.extend(drive(&mut updater, &mut io, b"C"));
            let ack: &[u8] = if page < 2 { b"P" } else { b"D" };
            events.extend(drive(&mut updater, &mut io, ack));
        }

        assert_eq!(
            events,
            vec![
                UpdateEvent::Progress { percent: 33 },
                UpdateEvent::Progress { percent: 66 },
                UpdateEvent::Progress { percent: 100 },
                UpdateEvent::Done,
            ]
        );
        assert_eq!(updater.state(), UpdateState::RequestJson);
        updater.finish();
        assert_eq!(updater.state(), UpdateState::Idle);
    }

    #[test]
    fn idle_updater_ignores_bootloader_traffic() {
        let mut io = io();
        let mut updater = FirmwareUpdater::new();
        assert!(drive(&mut updater, &mut io, b"P").is_empty());
        assert!(io.interface().sent.is_empty());
    }
}
