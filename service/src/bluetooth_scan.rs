//! LE scan manager.
//!
//! Any number of application scanners share one radio scan: the first
//! scanner to start pushes parameters and starts the stack scan, the last
//! one to leave stops it. Each advertising report is then evaluated per
//! scanner against its filter, its duration/period reporting window, and a
//! fingerprint table of recently delivered payloads.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use num_derive::{FromPrimitive, ToPrimitive};
use tokio::sync::mpsc::Sender;

use bt_sal::le::{BleScanParams, BleScanResult, BleScanType, ScannerSal};
use bt_sal::types::{BleAddrType, BlePhy, BtStatus, RawAddress};

use crate::scan_record::ScanRecord;
use crate::utils::{payload_hash32, MonotonicClock};
use crate::Message;

const ADV_REPORT_DURATION_MS: u64 = 500;
const ADV_REPORT_PERIOD_MS: u64 = 5000;
/// Fingerprint slots per scanner.
const ADV_REPORT_SIZE: usize = 10;

/* Scan engine (interval, window) pairs in 0.625 ms slots. */
const SCAN_MODE_LOW_POWER_INTERVAL: u16 = 2048;
const SCAN_MODE_LOW_POWER_WINDOW: u16 = 512;
const SCAN_MODE_BALANCED_INTERVAL: u16 = 1024;
const SCAN_MODE_BALANCED_WINDOW: u16 = 512;
const SCAN_MODE_LOW_LATENCY_INTERVAL: u16 = 512;
const SCAN_MODE_LOW_LATENCY_WINDOW: u16 = 512;

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ScanStatus {
    Success = 0,
    RegNomem,
    Existed,
    StartFail,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BleScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

#[derive(Debug, Clone, Copy)]
pub struct BleScanSettings {
    pub scan_mode: BleScanMode,
    pub scan_type: BleScanType,
    pub scan_phy: BlePhy,
}

impl Default for BleScanSettings {
    fn default() -> Self {
        BleScanSettings {
            scan_mode: BleScanMode::LowPower,
            scan_type: BleScanType::Passive,
            scan_phy: BlePhy::Le1m,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub active: bool,
    pub duplicated: bool,
    pub duration_ms: u64,
    pub period_ms: u64,
    /// Positive match set against the 16-bit service-data UUID.
    pub uuids: Vec<u16>,
}

pub trait IScannerCallback: Send {
    fn on_scan_start_status(&mut self, status: ScanStatus);
    fn on_scan_result(&mut self, result: &BleScanResult);
    fn on_scan_stopped(&mut self);
}

pub enum ScannerActions {
    StartScan {
        settings: Option<BleScanSettings>,
        filter: Option<ScanFilter>,
        callbacks: Box<dyn IScannerCallback>,
    },
    StopScan(u8),
    ManagerStart,
    ManagerStop,
}

struct FingerprintSlot {
    hash: u32,
    timestamp_ms: u64,
}

struct Scanner {
    is_scanning: bool,
    filter: ScanFilter,
    callbacks: Box<dyn IScannerCallback>,
    /// Last delivery epoch per remote, driving the duration/period window.
    devices: HashMap<(RawAddress, BleAddrType), u64>,
    fingerprints: Vec<FingerprintSlot>,
}

pub struct ScanManager {
    started: bool,
    scanners: Vec<Option<Scanner>>,
    is_scanning: bool,
    clock: MonotonicClock,
    sal: Arc<dyn ScannerSal>,
    _tx: Sender<Message>,
}

fn setup_scan_parameters(settings: &BleScanSettings) -> BleScanParams {
    let (interval, window) = match settings.scan_mode {
        BleScanMode::LowPower => (SCAN_MODE_LOW_POWER_INTERVAL, SCAN_MODE_LOW_POWER_WINDOW),
        BleScanMode::Balanced => (SCAN_MODE_BALANCED_INTERVAL, SCAN_MODE_BALANCED_WINDOW),
        BleScanMode::LowLatency => (SCAN_MODE_LOW_LATENCY_INTERVAL, SCAN_MODE_LOW_LATENCY_WINDOW),
    };

    BleScanParams {
        scan_interval: interval,
        scan_window: window,
        scan_type: settings.scan_type,
        scan_phy: settings.scan_phy,
    }
}

/// Reporting-window decision for one (scanner, device) pair. Returns true
/// when the report falls inside the delivery window; a report past the
/// period refreshes the epoch.
fn match_duration(epoch: &mut u64, duration: u64, period: u64, now: u64) -> bool {
    let t1 = *epoch;
    let t2 = t1 + duration;
    let t3 = t1 + period;

    if now < t1 {
        // Clock went backwards relative to the stored epoch.
        *epoch = now;
        false
    } else if now < t2 {
        true
    } else if now < t3 {
        false
    } else {
        *epoch = now;
        true
    }
}

impl Scanner {
    fn matches_filter(&self, record: &ScanRecord) -> bool {
        self.filter.uuids.is_empty() || self.filter.uuids.contains(&record.uuid)
    }

    /// Payload-fingerprint dedup: an identical payload is delivered at
    /// most once per period window.
    fn fingerprint_admits(&mut self, payload: &[u8], now: u64) -> bool {
        let hash = payload_hash32(payload);
        let period = self.filter.period_ms;

        if let Some(slot) = self.fingerprints.iter_mut().find(|s| s.hash == hash) {
            if now < slot.timestamp_ms + period {
                return false;
            }
            slot.timestamp_ms = now;
            return true;
        }

        let has_room = self.fingerprints.len() < ADV_REPORT_SIZE;
        match self.fingerprints.iter_mut().find(|s| now >= s.timestamp_ms + period) {
            Some(slot) => {
                slot.hash = hash;
                slot.timestamp_ms = now;
            }
            None if has_room => {
                self.fingerprints.push(FingerprintSlot { hash, timestamp_ms: now });
            }
            // Table saturated with live entries: deliver untracked.
            None => {}
        }
        true
    }

    fn admit(&mut self, result: &BleScanResult, record: &ScanRecord, now: u64) -> bool {
        if !self.filter.active {
            return true;
        }

        let key = (result.addr, result.addr_type);
        let known = self.devices.contains_key(&key);
        if !known && !self.matches_filter(record) {
            return false;
        }

        let epoch = self.devices.entry(key).or_insert(now);
        if self.filter.duplicated {
            if !match_duration(epoch, self.filter.duration_ms, self.filter.period_ms, now) {
                return false;
            }
            if !self.fingerprint_admits(&result.adv_data, now) {
                return false;
            }
        }

        true
    }
}

impl ScanManager {
    pub fn new(sal: Arc<dyn ScannerSal>, tx: Sender<Message>, max_scanners: u32) -> Self {
        let mut scanners = Vec::new();
        scanners.resize_with(max_scanners as usize, || None);

        ScanManager {
            started: false,
            scanners,
            is_scanning: false,
            clock: MonotonicClock::new(),
            sal,
            _tx: tx,
        }
    }

    pub fn handle_actions(&mut self, action: ScannerActions) {
        match action {
            ScannerActions::StartScan { settings, filter, callbacks } => {
                self.start_scan(settings, filter, callbacks);
            }
            ScannerActions::StopScan(scanner_id) => self.stop_scan(scanner_id),
            ScannerActions::ManagerStart => self.manager_start(),
            ScannerActions::ManagerStop => self.manager_stop(),
        }
    }

    pub fn is_supported(&self) -> bool {
        true
    }

    pub fn manager_start(&mut self) {
        self.started = true;
        self.is_scanning = false;
        for slot in self.scanners.iter_mut() {
            *slot = None;
        }
    }

    pub fn manager_stop(&mut self) {
        if !self.started {
            return;
        }

        for slot in 0..self.scanners.len() {
            if self.scanners[slot].is_some() {
                self.unregister_scanner(slot as u8);
            }
        }
        self.started = false;
    }

    /// Registers a scanner and joins the shared radio scan. The scanner id
    /// is reported alongside the start status; None means no slot was
    /// taken.
    pub fn start_scan(
        &mut self,
        settings: Option<BleScanSettings>,
        filter: Option<ScanFilter>,
        mut callbacks: Box<dyn IScannerCallback>,
    ) -> Option<u8> {
        if !self.started {
            callbacks.on_scan_start_status(ScanStatus::StartFail);
            return None;
        }

        let slot = match self.scanners.iter().position(|s| s.is_none()) {
            Some(slot) => slot,
            None => {
                callbacks.on_scan_start_status(ScanStatus::RegNomem);
                return None;
            }
        };

        if !self.is_scanning {
            let params =
                settings.map(|s| setup_scan_parameters(&s)).unwrap_or_default();
            self.sal.le_set_scan_parameters(&params);
            if self.sal.le_start_scan() != BtStatus::Success {
                callbacks.on_scan_start_status(ScanStatus::StartFail);
                return None;
            }
            self.is_scanning = true;
        }

        let mut filter = filter.unwrap_or_default();
        if filter.active {
            filter.duration_ms = ADV_REPORT_DURATION_MS;
            filter.period_ms = ADV_REPORT_PERIOD_MS;
        }

        let mut scanner = Scanner {
            is_scanning: true,
            filter,
            callbacks,
            devices: HashMap::new(),
            fingerprints: Vec::new(),
        };
        scanner.callbacks.on_scan_start_status(ScanStatus::Success);
        self.scanners[slot] = Some(scanner);

        Some(slot as u8)
    }

    pub fn stop_scan(&mut self, scanner_id: u8) {
        if !self.started {
            return;
        }
        self.unregister_scanner(scanner_id);
    }

    fn unregister_scanner(&mut self, scanner_id: u8) {
        let slot = scanner_id as usize;
        let mut scanner = match self.scanners.get_mut(slot).and_then(|s| s.take()) {
            Some(scanner) => scanner,
            None => {
                debug!("scanner: stop for unknown id {}", scanner_id);
                return;
            }
        };

        scanner.is_scanning = false;
        scanner.callbacks.on_scan_stopped();

        if self.is_scanning && self.scanners.iter().all(|s| s.is_none()) {
            self.sal.le_stop_scan();
            self.is_scanning = false;
        }
    }

    pub fn on_scan_result(&mut self, result: BleScanResult) {
        let now = self.clock.now_ms();
        self.dispatch_result(&result, now);
    }

    fn dispatch_result(&mut self, result: &BleScanResult, now: u64) {
        if !self.started {
            return;
        }

        let record = ScanRecord::parse(&result.adv_data);
        for slot in self.scanners.iter_mut() {
            if let Some(scanner) = slot {
                if scanner.is_scanning && scanner.admit(result, &record, now) {
                    scanner.callbacks.on_scan_result(result);
                }
            }
        }
    }
}
