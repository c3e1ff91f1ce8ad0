//! Adapter half of the SAL: BR/EDR + LE controller control, discovery,
//! bonding, link management, and the upward adapter event surface.

use crate::le::BleConnectParams;
use crate::types::{
    BleAddrType, BlePhy, BondState, BtDiscoveryState, BtIoCapability, BtScanMode, BtScanType,
    BtStatus, BtTransport, ConnectionState, LinkKeyType, LinkMode, LinkRole, PairType, RawAddress,
    Uuid,
};

/// Stable record of a bonded BR/EDR peer as persisted and replayed into the
/// stack at enable time.
#[derive(Debug, Clone, Default)]
pub struct RemoteDeviceProperties {
    pub addr: RawAddress,
    pub name: String,
    pub alias: String,
    pub class_of_device: u32,
    pub device_type: u32,
    pub link_key: [u8; 16],
    pub link_key_type: u32,
}

/// Stable record of a bonded (or whitelisted) LE peer. The SMP key blob
/// carries the identity address in bytes 0..6 and the LTK in bytes 12..28.
#[derive(Debug, Clone)]
pub struct RemoteLeDeviceProperties {
    pub addr: RawAddress,
    pub addr_type: BleAddrType,
    pub smp_key: [u8; 28],
}

impl Default for RemoteLeDeviceProperties {
    fn default() -> Self {
        RemoteLeDeviceProperties {
            addr: RawAddress::default(),
            addr_type: BleAddrType::Public,
            smp_key: [0; 28],
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub addr: RawAddress,
    pub name: String,
    pub class_of_device: u32,
    pub rssi: i8,
}

#[derive(Debug, Clone)]
pub struct AclStateParams {
    pub addr: RawAddress,
    pub transport: BtTransport,
    pub addr_type: BleAddrType,
    pub connection_state: ConnectionState,
    pub status: BtStatus,
    pub hci_reason_code: u32,
}

/// Requested link power mode. `interval`/`attempt`/`timeout` are only
/// meaningful when `mode` is sniff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerMode {
    pub mode: LinkMode,
    pub max_interval: u16,
    pub min_interval: u16,
    pub attempt: u16,
    pub timeout: u16,
}

impl PowerMode {
    pub const ACTIVE: PowerMode = PowerMode {
        mode: LinkMode::Active,
        max_interval: 0,
        min_interval: 0,
        attempt: 0,
        timeout: 0,
    };
}

/// Controller life-phase events from the stack, folded by the framework
/// into adapter state machine inputs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StackState {
    BredrOn,
    BredrOff,
    BleOn,
    BleOff,
}

/// Downward adapter call surface. Every call returns a status the
/// framework propagates verbatim; completion detail arrives through
/// [`AdapterCallbacks`].
pub trait AdapterSal: Send + Sync {
    fn enable(&self) -> BtStatus;
    fn disable(&self) -> BtStatus;
    fn le_enable(&self) -> BtStatus;
    fn le_disable(&self) -> BtStatus;

    fn set_name(&self, name: &str) -> BtStatus;
    fn get_address(&self) -> RawAddress;
    fn set_io_capability(&self, cap: BtIoCapability) -> BtStatus;
    fn set_scan_mode(&self, mode: BtScanMode, bondable: bool) -> BtStatus;
    fn set_device_class(&self, cod: u32) -> BtStatus;
    fn set_inquiry_scan_parameters(
        &self,
        scan_type: BtScanType,
        interval: u16,
        window: u16,
    ) -> BtStatus;
    fn set_page_scan_parameters(
        &self,
        scan_type: BtScanType,
        interval: u16,
        window: u16,
    ) -> BtStatus;
    fn set_afh_channel_classification(
        &self,
        central_frequency: u16,
        band_width: u16,
        number: u16,
    ) -> BtStatus;

    fn start_discovery(&self, timeout_ms: u32) -> BtStatus;
    fn stop_discovery(&self) -> BtStatus;
    fn get_remote_name(&self, addr: &RawAddress) -> BtStatus;
    fn start_service_discovery(&self, addr: &RawAddress, uuid: Option<&Uuid>) -> BtStatus;
    fn get_remote_device_info(&self, addr: &RawAddress) -> Option<RemoteDeviceProperties>;

    fn connect(&self, addr: &RawAddress) -> BtStatus;
    fn disconnect(&self, addr: &RawAddress, reason: u8) -> BtStatus;
    fn acl_connection_reply(&self, addr: &RawAddress, accept: bool) -> BtStatus;
    fn get_acl_connection_handle(&self, addr: &RawAddress, transport: BtTransport) -> u16;

    fn create_bond(&self, addr: &RawAddress, transport: BtTransport) -> BtStatus;
    fn remove_bond(&self, addr: &RawAddress, transport: BtTransport) -> BtStatus;
    fn cancel_bond(&self, addr: &RawAddress) -> BtStatus;
    /// `reject_reason` 0 accepts; a non-zero HCI reason rejects.
    fn pair_reply(&self, addr: &RawAddress, reject_reason: u8) -> BtStatus;
    fn pin_reply(&self, addr: &RawAddress, accept: bool, pin: &[u8]) -> BtStatus;
    fn ssp_reply(
        &self,
        addr: &RawAddress,
        accept: bool,
        pair_type: PairType,
        passkey: u32,
    ) -> BtStatus;
    fn set_bonded_devices(&self, devices: &[RemoteDeviceProperties]) -> BtStatus;

    fn set_power_mode(&self, addr: &RawAddress, mode: &PowerMode) -> BtStatus;
    fn set_link_role(&self, addr: &RawAddress, role: LinkRole) -> BtStatus;
    fn set_link_policy(&self, addr: &RawAddress, policy: u16) -> BtStatus;

    fn le_connect(
        &self,
        addr: &RawAddress,
        addr_type: BleAddrType,
        params: &BleConnectParams,
    ) -> BtStatus;
    fn le_disconnect(&self, addr: &RawAddress) -> BtStatus;
    fn le_create_bond(&self, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus;
    fn le_remove_bond(&self, addr: &RawAddress) -> BtStatus;
    fn le_smp_reply(
        &self,
        addr: &RawAddress,
        accept: bool,
        pair_type: PairType,
        passkey: u32,
    ) -> BtStatus;
    fn le_add_white_list(&self, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus;
    fn le_remove_white_list(&self, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus;
    fn le_set_phy(&self, addr: &RawAddress, tx_phy: BlePhy, rx_phy: BlePhy) -> BtStatus;
    fn le_set_address(&self, addr: &RawAddress) -> BtStatus;
    /// Result arrives as [`AdapterCallbacks::LeAddrUpdate`].
    fn le_get_address(&self) -> BtStatus;
    fn le_set_public_identity(&self, addr: &RawAddress) -> BtStatus;
    fn le_set_static_identity(&self, addr: &RawAddress) -> BtStatus;
    fn le_set_io_capability(&self, cap: u32) -> BtStatus;
    fn le_set_appearance(&self, appearance: u16) -> BtStatus;
    fn le_set_bonded_devices(&self, devices: &[RemoteLeDeviceProperties]) -> BtStatus;
    fn le_set_legacy_tk(&self, addr: &RawAddress, tk_val: [u8; 16]) -> BtStatus;
    fn le_set_remote_oob_data(
        &self,
        addr: &RawAddress,
        c_val: [u8; 16],
        r_val: [u8; 16],
    ) -> BtStatus;
    /// Result arrives as [`AdapterCallbacks::LeOobDataGot`].
    fn le_get_local_oob_data(&self, addr: &RawAddress) -> BtStatus;
    fn le_enable_key_derivation(&self, brkey_to_lekey: bool, lekey_to_brkey: bool) -> BtStatus;
}

/// Upward adapter events. The stack binding invokes the dispatcher from a
/// stack thread; the framework re-posts each event onto the service loop.
#[derive(Debug)]
pub enum AdapterCallbacks {
    StackStateChanged(StackState),
    ScanModeChanged(BtScanMode),
    DiscoveryStateChanged(BtDiscoveryState),
    DeviceFound(DiscoveryResult),
    RemoteNameReceived(RawAddress, String),
    ConnectRequest(RawAddress, u32),
    ConnectionStateChanged(AclStateParams),
    PairRequest(RawAddress, bool, bool),
    PinRequest(RawAddress, u32, bool, Option<String>),
    SspRequest(RawAddress, BtTransport, u32, PairType, u32, Option<String>),
    BondStateChanged(RawAddress, BondState, BtTransport, BtStatus, bool),
    ServiceSearchDone(RawAddress, Vec<Uuid>),
    EncryptionStateChanged(RawAddress, bool, BtTransport),
    LinkKeyUpdate(RawAddress, [u8; 16], LinkKeyType),
    LinkKeyRemoved(RawAddress, BtStatus),
    LinkRoleChanged(RawAddress, LinkRole),
    LinkModeChanged(RawAddress, LinkMode, u16),
    LinkPolicyChanged(RawAddress, u16),
    LeAddrUpdate(RawAddress, BleAddrType),
    LePhyUpdate(RawAddress, BlePhy, BlePhy, BtStatus),
    WhitelistUpdate(RawAddress, bool, BtStatus),
    LeBondedDevicesUpdate(Vec<RemoteLeDeviceProperties>),
    LeOobDataGot(RawAddress, [u8; 16], [u8; 16]),
}

pub struct AdapterCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(AdapterCallbacks) + Send>,
}
