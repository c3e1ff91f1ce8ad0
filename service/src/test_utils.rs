//! Shared test double for the SAL traits.
//!
//! Records every downward call and lets a test program per-method return
//! statuses, so managers can be driven without a stack.

use std::collections::HashMap;
use std::sync::Mutex;

use bt_sal::adapter::{
    AdapterSal, PowerMode, RemoteDeviceProperties, RemoteLeDeviceProperties,
};
use bt_sal::gatt::{GattClientSal, GattElement, GattServerSal, GattWriteType};
use bt_sal::le::{
    AdvertiserSal, BleAdvParams, BleConnectParams, BleScanParams, ScannerSal,
};
use bt_sal::spp::SppSal;
use bt_sal::types::{
    BleAddrType, BlePhy, BtIoCapability, BtScanMode, BtScanType, BtStatus, BtTransport, LinkRole,
    PairType, RawAddress, Uuid,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SalCall {
    Enable,
    Disable,
    LeEnable,
    LeDisable,
    SetName(String),
    SetScanMode(BtScanMode, bool),
    SetDeviceClass(u32),
    StartDiscovery(u32),
    StopDiscovery,
    GetRemoteName(RawAddress),
    StartServiceDiscovery(RawAddress),
    Connect(RawAddress),
    Disconnect(RawAddress),
    AclConnectionReply(RawAddress, bool),
    CreateBond(RawAddress, BtTransport),
    RemoveBond(RawAddress, BtTransport),
    CancelBond(RawAddress),
    PairReply(RawAddress, u8),
    PinReply(RawAddress, bool),
    SspReply(RawAddress, bool, PairType, u32),
    SetBondedDevices(usize),
    SetPowerMode(RawAddress, PowerMode),
    SetLinkPolicy(RawAddress, u16),
    LeConnect(RawAddress, BleAddrType),
    LeDisconnect(RawAddress),
    LeSmpReply(RawAddress, bool, PairType, u32),
    LeAddWhiteList(RawAddress),
    LeRemoveWhiteList(RawAddress),
    LeGetAddress,
    LeSetBondedDevices(usize),
    LeStartAdv(u8, Vec<u8>, Vec<u8>),
    LeStopAdv(u8),
    LeSetScanParameters(u16, u16),
    LeStartScan,
    LeStopScan,
    GattcConnect(RawAddress, BleAddrType),
    GattcDisconnect(RawAddress),
    DiscoverAllServices(RawAddress),
    DiscoverServiceByUuid(RawAddress, Uuid),
    ReadElement(RawAddress, u16),
    WriteElement(RawAddress, u16, Vec<u8>, GattWriteType),
    RegisterNotifications(RawAddress, u16, u16, bool),
    SendMtuReq(RawAddress, u32),
    GattsEnable,
    GattsDisable,
    AddElements(Vec<u16>),
    RemoveElements(u16, u16),
    SendResponse(RawAddress, u32, Vec<u8>),
    SendNotification(RawAddress, u16, Vec<u8>),
    SendIndication(RawAddress, u16, Vec<u8>),
    SppListen(u8),
    SppUnlisten(u8),
    SppConnect(RawAddress, u8),
    SppDisconnect(RawAddress, u8),
    SppWrite(RawAddress, u8, Vec<u8>),
    Other(&'static str),
}

#[derive(Default)]
pub struct FakeSal {
    calls: Mutex<Vec<SalCall>>,
    returns: Mutex<HashMap<&'static str, BtStatus>>,
    local_addr: Mutex<RawAddress>,
}

impl FakeSal {
    pub fn new() -> Self {
        FakeSal::default()
    }

    pub fn set_return(&self, method: &'static str, status: BtStatus) {
        self.returns.lock().unwrap().insert(method, status);
    }

    pub fn calls(&self) -> Vec<SalCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn calls_of(&self, filter: impl Fn(&SalCall) -> bool) -> Vec<SalCall> {
        self.calls().into_iter().filter(|c| filter(c)).collect()
    }

    fn record(&self, method: &'static str, call: SalCall) -> BtStatus {
        self.calls.lock().unwrap().push(call);
        *self.returns.lock().unwrap().get(method).unwrap_or(&BtStatus::Success)
    }
}

impl AdapterSal for FakeSal {
    fn enable(&self) -> BtStatus {
        self.record("enable", SalCall::Enable)
    }

    fn disable(&self) -> BtStatus {
        self.record("disable", SalCall::Disable)
    }

    fn le_enable(&self) -> BtStatus {
        self.record("le_enable", SalCall::LeEnable)
    }

    fn le_disable(&self) -> BtStatus {
        self.record("le_disable", SalCall::LeDisable)
    }

    fn set_name(&self, name: &str) -> BtStatus {
        self.record("set_name", SalCall::SetName(name.into()))
    }

    fn get_address(&self) -> RawAddress {
        *self.local_addr.lock().unwrap()
    }

    fn set_io_capability(&self, _cap: BtIoCapability) -> BtStatus {
        self.record("set_io_capability", SalCall::Other("set_io_capability"))
    }

    fn set_scan_mode(&self, mode: BtScanMode, bondable: bool) -> BtStatus {
        self.record("set_scan_mode", SalCall::SetScanMode(mode, bondable))
    }

    fn set_device_class(&self, cod: u32) -> BtStatus {
        self.record("set_device_class", SalCall::SetDeviceClass(cod))
    }

    fn set_inquiry_scan_parameters(
        &self,
        _scan_type: BtScanType,
        _interval: u16,
        _window: u16,
    ) -> BtStatus {
        self.record("set_inquiry_scan_parameters", SalCall::Other("set_inquiry_scan_parameters"))
    }

    fn set_page_scan_parameters(
        &self,
        _scan_type: BtScanType,
        _interval: u16,
        _window: u16,
    ) -> BtStatus {
        self.record("set_page_scan_parameters", SalCall::Other("set_page_scan_parameters"))
    }

    fn set_afh_channel_classification(
        &self,
        _central_frequency: u16,
        _band_width: u16,
        _number: u16,
    ) -> BtStatus {
        self.record("set_afh_channel_classification", SalCall::Other("set_afh_channel_classification"))
    }

    fn start_discovery(&self, timeout_ms: u32) -> BtStatus {
        self.record("start_discovery", SalCall::StartDiscovery(timeout_ms))
    }

    fn stop_discovery(&self) -> BtStatus {
        self.record("stop_discovery", SalCall::StopDiscovery)
    }

    fn get_remote_name(&self, addr: &RawAddress) -> BtStatus {
        self.record("get_remote_name", SalCall::GetRemoteName(*addr))
    }

    fn start_service_discovery(&self, addr: &RawAddress, _uuid: Option<&Uuid>) -> BtStatus {
        self.record("start_service_discovery", SalCall::StartServiceDiscovery(*addr))
    }

    fn get_remote_device_info(&self, addr: &RawAddress) -> Option<RemoteDeviceProperties> {
        Some(RemoteDeviceProperties { addr: *addr, device_type: 1, ..Default::default() })
    }

    fn connect(&self, addr: &RawAddress) -> BtStatus {
        self.record("connect", SalCall::Connect(*addr))
    }

    fn disconnect(&self, addr: &RawAddress, _reason: u8) -> BtStatus {
        self.record("disconnect", SalCall::Disconnect(*addr))
    }

    fn acl_connection_reply(&self, addr: &RawAddress, accept: bool) -> BtStatus {
        self.record("acl_connection_reply", SalCall::AclConnectionReply(*addr, accept))
    }

    fn get_acl_connection_handle(&self, _addr: &RawAddress, _transport: BtTransport) -> u16 {
        0x0042
    }

    fn create_bond(&self, addr: &RawAddress, transport: BtTransport) -> BtStatus {
        self.record("create_bond", SalCall::CreateBond(*addr, transport))
    }

    fn remove_bond(&self, addr: &RawAddress, transport: BtTransport) -> BtStatus {
        self.record("remove_bond", SalCall::RemoveBond(*addr, transport))
    }

    fn cancel_bond(&self, addr: &RawAddress) -> BtStatus {
        self.record("cancel_bond", SalCall::CancelBond(*addr))
    }

    fn pair_reply(&self, addr: &RawAddress, reject_reason: u8) -> BtStatus {
        self.record("pair_reply", SalCall::PairReply(*addr, reject_reason))
    }

    fn pin_reply(&self, addr: &RawAddress, accept: bool, _pin: &[u8]) -> BtStatus {
        self.record("pin_reply", SalCall::PinReply(*addr, accept))
    }

    fn ssp_reply(
        &self,
        addr: &RawAddress,
        accept: bool,
        pair_type: PairType,
        passkey: u32,
    ) -> BtStatus {
        self.record("ssp_reply", SalCall::SspReply(*addr, accept, pair_type, passkey))
    }

    fn set_bonded_devices(&self, devices: &[RemoteDeviceProperties]) -> BtStatus {
        self.record("set_bonded_devices", SalCall::SetBondedDevices(devices.len()))
    }

    fn set_power_mode(&self, addr: &RawAddress, mode: &PowerMode) -> BtStatus {
        self.record("set_power_mode", SalCall::SetPowerMode(*addr, *mode))
    }

    fn set_link_role(&self, _addr: &RawAddress, _role: LinkRole) -> BtStatus {
        self.record("set_link_role", SalCall::Other("set_link_role"))
    }

    fn set_link_policy(&self, addr: &RawAddress, policy: u16) -> BtStatus {
        self.record("set_link_policy", SalCall::SetLinkPolicy(*addr, policy))
    }

    fn le_connect(
        &self,
        addr: &RawAddress,
        addr_type: BleAddrType,
        _params: &BleConnectParams,
    ) -> BtStatus {
        self.record("le_connect", SalCall::LeConnect(*addr, addr_type))
    }

    fn le_disconnect(&self, addr: &RawAddress) -> BtStatus {
        self.record("le_disconnect", SalCall::LeDisconnect(*addr))
    }

    fn le_create_bond(&self, addr: &RawAddress, _addr_type: BleAddrType) -> BtStatus {
        self.record("le_create_bond", SalCall::CreateBond(*addr, BtTransport::Le))
    }

    fn le_remove_bond(&self, addr: &RawAddress) -> BtStatus {
        self.record("le_remove_bond", SalCall::RemoveBond(*addr, BtTransport::Le))
    }

    fn le_smp_reply(
        &self,
        addr: &RawAddress,
        accept: bool,
        pair_type: PairType,
        passkey: u32,
    ) -> BtStatus {
        self.record("le_smp_reply", SalCall::LeSmpReply(*addr, accept, pair_type, passkey))
    }

    fn le_add_white_list(&self, addr: &RawAddress, _addr_type: BleAddrType) -> BtStatus {
        self.record("le_add_white_list", SalCall::LeAddWhiteList(*addr))
    }

    fn le_remove_white_list(&self, addr: &RawAddress, _addr_type: BleAddrType) -> BtStatus {
        self.record("le_remove_white_list", SalCall::LeRemoveWhiteList(*addr))
    }

    fn le_set_phy(&self, _addr: &RawAddress, _tx_phy: BlePhy, _rx_phy: BlePhy) -> BtStatus {
        self.record("le_set_phy", SalCall::Other("le_set_phy"))
    }

    fn le_set_address(&self, _addr: &RawAddress) -> BtStatus {
        self.record("le_set_address", SalCall::Other("le_set_address"))
    }

    fn le_get_address(&self) -> BtStatus {
        self.record("le_get_address", SalCall::LeGetAddress)
    }

    fn le_set_public_identity(&self, _addr: &RawAddress) -> BtStatus {
        self.record("le_set_public_identity", SalCall::Other("le_set_public_identity"))
    }

    fn le_set_static_identity(&self, _addr: &RawAddress) -> BtStatus {
        self.record("le_set_static_identity", SalCall::Other("le_set_static_identity"))
    }

    fn le_set_io_capability(&self, _cap: u32) -> BtStatus {
        self.record("le_set_io_capability", SalCall::Other("le_set_io_capability"))
    }

    fn le_set_appearance(&self, _appearance: u16) -> BtStatus {
        self.record("le_set_appearance", SalCall::Other("le_set_appearance"))
    }

    fn le_set_bonded_devices(&self, devices: &[RemoteLeDeviceProperties]) -> BtStatus {
        self.record("le_set_bonded_devices", SalCall::LeSetBondedDevices(devices.len()))
    }

    fn le_set_legacy_tk(&self, _addr: &RawAddress, _tk_val: [u8; 16]) -> BtStatus {
        self.record("le_set_legacy_tk", SalCall::Other("le_set_legacy_tk"))
    }

    fn le_set_remote_oob_data(
        &self,
        _addr: &RawAddress,
        _c_val: [u8; 16],
        _r_val: [u8; 16],
    ) -> BtStatus {
        self.record("le_set_remote_oob_data", SalCall::Other("le_set_remote_oob_data"))
    }

    fn le_get_local_oob_data(&self, _addr: &RawAddress) -> BtStatus {
        self.record("le_get_local_oob_data", SalCall::Other("le_get_local_oob_data"))
    }

    fn le_enable_key_derivation(&self, _brkey_to_lekey: bool, _lekey_to_brkey: bool) -> BtStatus {
        self.record("le_enable_key_derivation", SalCall::Other("le_enable_key_derivation"))
    }
}

impl AdvertiserSal for FakeSal {
    fn le_start_adv(
        &self,
        adv_id: u8,
        _params: &BleAdvParams,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
    ) -> BtStatus {
        self.record(
            "le_start_adv",
            SalCall::LeStartAdv(adv_id, adv_data.to_vec(), scan_rsp_data.to_vec()),
        )
    }

    fn le_stop_adv(&self, adv_id: u8) -> BtStatus {
        self.record("le_stop_adv", SalCall::LeStopAdv(adv_id))
    }
}

impl ScannerSal for FakeSal {
    fn le_set_scan_parameters(&self, params: &BleScanParams) -> BtStatus {
        self.record(
            "le_set_scan_parameters",
            SalCall::LeSetScanParameters(params.scan_interval, params.scan_window),
        )
    }

    fn le_start_scan(&self) -> BtStatus {
        self.record("le_start_scan", SalCall::LeStartScan)
    }

    fn le_stop_scan(&self) -> BtStatus {
        self.record("le_stop_scan", SalCall::LeStopScan)
    }
}

impl GattClientSal for FakeSal {
    fn connect(&self, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus {
        self.record("gatt_client_connect", SalCall::GattcConnect(*addr, addr_type))
    }

    fn disconnect(&self, addr: &RawAddress) -> BtStatus {
        self.record("gatt_client_disconnect", SalCall::GattcDisconnect(*addr))
    }

    fn discover_all_services(&self, addr: &RawAddress) -> BtStatus {
        self.record("discover_all_services", SalCall::DiscoverAllServices(*addr))
    }

    fn discover_service_by_uuid(&self, addr: &RawAddress, uuid: &Uuid) -> BtStatus {
        self.record("discover_service_by_uuid", SalCall::DiscoverServiceByUuid(*addr, *uuid))
    }

    fn read_element(&self, addr: &RawAddress, handle: u16) -> BtStatus {
        self.record("read_element", SalCall::ReadElement(*addr, handle))
    }

    fn write_element(
        &self,
        addr: &RawAddress,
        handle: u16,
        value: &[u8],
        write_type: GattWriteType,
    ) -> BtStatus {
        self.record(
            "write_element",
            SalCall::WriteElement(*addr, handle, value.to_vec(), write_type),
        )
    }

    fn register_notifications(
        &self,
        addr: &RawAddress,
        handle: u16,
        properties: u16,
        enable: bool,
    ) -> BtStatus {
        self.record(
            "register_notifications",
            SalCall::RegisterNotifications(*addr, handle, properties, enable),
        )
    }

    fn send_mtu_req(&self, addr: &RawAddress, mtu: u32) -> BtStatus {
        self.record("send_mtu_req", SalCall::SendMtuReq(*addr, mtu))
    }

    fn update_connection_parameter(
        &self,
        _addr: &RawAddress,
        _min_interval: u32,
        _max_interval: u32,
        _latency: u32,
        _timeout: u32,
        _min_ce_length: u32,
        _max_ce_length: u32,
    ) -> BtStatus {
        self.record("update_connection_parameter", SalCall::Other("update_connection_parameter"))
    }

    fn read_remote_rssi(&self, _addr: &RawAddress) -> BtStatus {
        self.record("read_remote_rssi", SalCall::Other("read_remote_rssi"))
    }

    fn read_phy(&self, _addr: &RawAddress) -> BtStatus {
        self.record("gatt_client_read_phy", SalCall::Other("gatt_client_read_phy"))
    }

    fn set_phy(&self, _addr: &RawAddress, _tx_phy: BlePhy, _rx_phy: BlePhy) -> BtStatus {
        self.record("gatt_client_set_phy", SalCall::Other("gatt_client_set_phy"))
    }
}

impl GattServerSal for FakeSal {
    fn enable(&self) -> BtStatus {
        self.record("gatt_server_enable", SalCall::GattsEnable)
    }

    fn disable(&self) -> BtStatus {
        self.record("gatt_server_disable", SalCall::GattsDisable)
    }

    fn add_elements(&self, elements: &[GattElement]) -> BtStatus {
        self.record(
            "add_elements",
            SalCall::AddElements(elements.iter().map(|e| e.handle).collect()),
        )
    }

    fn remove_elements(&self, start_handle: u16, count: u16) -> BtStatus {
        self.record("remove_elements", SalCall::RemoveElements(start_handle, count))
    }

    fn connect(&self, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus {
        self.record("gatt_server_connect", SalCall::GattcConnect(*addr, addr_type))
    }

    fn cancel_connection(&self, addr: &RawAddress) -> BtStatus {
        self.record("cancel_connection", SalCall::GattcDisconnect(*addr))
    }

    fn send_response(&self, addr: &RawAddress, request_id: u32, value: &[u8]) -> BtStatus {
        self.record("send_response", SalCall::SendResponse(*addr, request_id, value.to_vec()))
    }

    fn send_notification(&self, addr: &RawAddress, handle: u16, value: &[u8]) -> BtStatus {
        self.record("send_notification", SalCall::SendNotification(*addr, handle, value.to_vec()))
    }

    fn send_indication(&self, addr: &RawAddress, handle: u16, value: &[u8]) -> BtStatus {
        self.record("send_indication", SalCall::SendIndication(*addr, handle, value.to_vec()))
    }

    fn read_phy(&self, _addr: &RawAddress) -> BtStatus {
        self.record("gatt_server_read_phy", SalCall::Other("gatt_server_read_phy"))
    }

    fn set_phy(&self, _addr: &RawAddress, _tx_phy: BlePhy, _rx_phy: BlePhy) -> BtStatus {
        self.record("gatt_server_set_phy", SalCall::Other("gatt_server_set_phy"))
    }
}

impl SppSal for FakeSal {
    fn listen(&self, scn: u8, _uuid: &Uuid) -> BtStatus {
        self.record("spp_listen", SalCall::SppListen(scn))
    }

    fn unlisten(&self, scn: u8) -> BtStatus {
        self.record("spp_unlisten", SalCall::SppUnlisten(scn))
    }

    fn connect(&self, addr: &RawAddress, scn: u8, _uuid: &Uuid) -> BtStatus {
        self.record("spp_connect", SalCall::SppConnect(*addr, scn))
    }

    fn disconnect(&self, addr: &RawAddress, scn: u8) -> BtStatus {
        self.record("spp_disconnect", SalCall::SppDisconnect(*addr, scn))
    }

    fn write(&self, addr: &RawAddress, scn: u8, data: &[u8]) -> BtStatus {
        self.record("spp_write", SalCall::SppWrite(*addr, scn, data.to_vec()))
    }
}
