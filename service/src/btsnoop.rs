//! Append-only btsnoop capture of HCI traffic.
//!
//! File layout (everything big-endian): an 8-byte identification pattern
//! `btsnoop\0`, u32 version 1, u32 datalink 1002 (HCI UART), then one
//! 24-byte record header plus payload per packet. Record flag bit 0 is the
//! direction, 1 meaning controller-to-host. Timestamps are microseconds
//! shifted into the btsnoop 64-bit time base.
//!
//! The writer is shared with the transport thread, so it carries its own
//! lock; it is the one component allowed to touch state off the service
//! loop.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::error;

const BTSNOOP_MAGIC: &[u8; 8] = b"btsnoop\0";
const BTSNOOP_VERSION: u32 = 1;
const BTSNOOP_DATALINK_UART: u32 = 1002;

/// Offset from the Unix epoch (in microseconds) to the btsnoop epoch of
/// 0000-01-01, as used by every btsnoop producer and by hcidoc.
const BTSNOOP_EPOCH_DELTA_US: u64 = 0x00E0_3AB4_4A67_6000 - 946_684_800_000_000;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SnoopDirection {
    HostToController,
    ControllerToHost,
}

struct SnoopInner {
    file: Option<File>,
    dir: PathBuf,
}

pub struct BtsnoopLogger {
    inner: Mutex<SnoopInner>,
}

impl BtsnoopLogger {
    /// Creates a logger writing under `dir`. No file exists until
    /// [`BtsnoopLogger::create_new_file`] runs.
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        BtsnoopLogger {
            inner: Mutex::new(SnoopInner { file: None, dir: dir.into() }),
        }
    }

    /// Closes any current capture and opens a fresh timestamped file with
    /// the btsnoop header written. This is also the rotation entry point.
    pub fn create_new_file(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.file = None;

        create_dir_all(&inner.dir)?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let path = inner.dir.join(format!("snoop_{}.log", stamp));

        let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        file.write_all(BTSNOOP_MAGIC)?;
        file.write_all(&BTSNOOP_VERSION.to_be_bytes())?;
        file.write_all(&BTSNOOP_DATALINK_UART.to_be_bytes())?;

        inner.file = Some(file);
        Ok(())
    }

    pub fn close_file(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.take() {
            let _ = file.sync_all();
        }
    }

    /// Appends one HCI packet. A logger without an open file drops the
    /// packet silently.
    pub fn capture(&self, direction: SnoopDirection, packet: &[u8]) {
        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut inner = self.inner.lock().unwrap();
        if let Some(file) = inner.file.as_mut() {
            let record = encode_record(direction, packet, now_us);
            if let Err(e) = file.write_all(&record).and_then(|_| file.write_all(packet)) {
                error!("btsnoop write failed: {}", e);
                inner.file = None;
            }
        }
    }
}

fn encode_record(direction: SnoopDirection, packet: &[u8], unix_us: u64) -> [u8; 24] {
    let flags: u32 = match direction {
        SnoopDirection::HostToController => 0,
        SnoopDirection::ControllerToHost => 1,
    };
    let ts = unix_us.wrapping_add(BTSNOOP_EPOCH_DELTA_US);

    let mut hdr = [0u8; 24];
    hdr[0..4].copy_from_slice(&(packet.len() as u32).to_be_bytes());
    hdr[4..8].copy_from_slice(&(packet.len() as u32).to_be_bytes());
    hdr[8..12].copy_from_slice(&flags.to_be_bytes());
    hdr[12..16].copy_from_slice(&0u32.to_be_bytes());
    hdr[16..24].copy_from_slice(&ts.to_be_bytes());
    hdr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_record_layout() {
        let record = encode_record(SnoopDirection::ControllerToHost, &[1, 2, 3, 4], 1_000_000);
        assert_eq!(&record[0..4], &4u32.to_be_bytes());
        assert_eq!(&record[4..8], &4u32.to_be_bytes());
        assert_eq!(&record[8..12], &1u32.to_be_bytes());
        assert_eq!(&record[12..16], &0u32.to_be_bytes());
        let ts = u64::from_be_bytes(record[16..24].try_into().unwrap());
        assert_eq!(ts, 1_000_000 + BTSNOOP_EPOCH_DELTA_US);

        let record = encode_record(SnoopDirection::HostToController, &[], 0);
        assert_eq!(&record[8..12], &0u32.to_be_bytes());
    }

    #[test]
    fn test_header_and_rotation() {
        let dir = std::env::temp_dir().join(format!("btsnoop_test_{}", std::process::id()));
        let logger = BtsnoopLogger::new(&dir);
        logger.create_new_file().unwrap();
        logger.capture(SnoopDirection::HostToController, &[0x01, 0x03, 0x0c, 0x00]);
        logger.close_file();

        let entry = std::fs::read_dir(&dir).unwrap().next().unwrap().unwrap();
        let mut contents = Vec::new();
        File::open(entry.path()).unwrap().read_to_end(&mut contents).unwrap();

        assert_eq!(&contents[0..8], b"btsnoop\0");
        assert_eq!(&contents[8..12], &1u32.to_be_bytes());
        assert_eq!(&contents[12..16], &1002u32.to_be_bytes());
        // One record of 24 bytes header + 4 bytes payload.
        assert_eq!(contents.len(), 16 + 24 + 4);
        assert_eq!(&contents[40..44], &[0x01, 0x03, 0x0c, 0x00]);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
