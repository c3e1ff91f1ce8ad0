//! LE advertising and scanning halves of the SAL.

use crate::types::{BleAddrType, BlePhy, BtStatus, RawAddress};

/// LE connection establishment parameters (units per the HCI spec:
/// intervals in 1.25 ms slots, timeout in 10 ms slots).
#[derive(Debug, Clone, Copy)]
pub struct BleConnectParams {
    pub min_interval: u16,
    pub max_interval: u16,
    pub latency: u16,
    pub timeout: u16,
}

impl Default for BleConnectParams {
    fn default() -> Self {
        BleConnectParams {
            min_interval: 0x18,
            max_interval: 0x28,
            latency: 0,
            timeout: 500,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BleAdvType {
    AdvInd,
    AdvDirectInd,
    AdvScanInd,
    AdvNonconnInd,
    ScanRsp,
}

impl Default for BleAdvType {
    fn default() -> Self {
        BleAdvType::AdvInd
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BleAdvFilterPolicy {
    WhitelistForNone,
    WhitelistForScan,
    WhitelistForConnection,
    WhitelistForAll,
}

impl Default for BleAdvFilterPolicy {
    fn default() -> Self {
        BleAdvFilterPolicy::WhitelistForNone
    }
}

/// Advertising set parameters. Intervals are in 0.625 ms slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct BleAdvParams {
    pub adv_type: BleAdvType,
    pub interval: u32,
    pub tx_power: i8,
    pub channel_map: u8,
    pub filter_policy: BleAdvFilterPolicy,
    pub own_addr_type: BleAddrType,
    pub peer_addr: RawAddress,
    pub peer_addr_type: BleAddrType,
}

/// Advertising set life-cycle as reported by the stack.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AdvState {
    Started,
    Stopped,
}

pub trait AdvertiserSal: Send + Sync {
    fn le_start_adv(
        &self,
        adv_id: u8,
        params: &BleAdvParams,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
    ) -> BtStatus;
    fn le_stop_adv(&self, adv_id: u8) -> BtStatus;
}

#[derive(Debug)]
pub enum AdvCallbacks {
    StateChanged(u8, AdvState),
}

pub struct AdvCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(AdvCallbacks) + Send>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BleScanType {
    Passive,
    Active,
}

impl Default for BleScanType {
    fn default() -> Self {
        BleScanType::Passive
    }
}

/// Raw scan engine parameters pushed to the stack. Interval/window are in
/// 0.625 ms slots.
#[derive(Debug, Clone, Copy)]
pub struct BleScanParams {
    pub scan_interval: u16,
    pub scan_window: u16,
    pub scan_type: BleScanType,
    pub scan_phy: BlePhy,
}

impl Default for BleScanParams {
    fn default() -> Self {
        BleScanParams {
            scan_interval: 100,
            scan_window: 100,
            scan_type: BleScanType::Passive,
            scan_phy: BlePhy::Le1m,
        }
    }
}

/// One advertising report as delivered by the stack.
#[derive(Debug, Clone)]
pub struct BleScanResult {
    pub addr: RawAddress,
    pub addr_type: BleAddrType,
    pub rssi: i8,
    pub adv_type: BleAdvType,
    pub adv_data: Vec<u8>,
}

pub trait ScannerSal: Send + Sync {
    fn le_set_scan_parameters(&self, params: &BleScanParams) -> BtStatus;
    fn le_start_scan(&self) -> BtStatus;
    fn le_stop_scan(&self) -> BtStatus;
}

#[derive(Debug)]
pub enum ScanCallbacks {
    StateChanged(u8),
    ResultUpdate(BleScanResult),
}

pub struct ScanCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(ScanCallbacks) + Send>,
}
