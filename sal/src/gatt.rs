//! GATT client and server halves of the SAL.

use crate::types::{
    BleAddrType, BlePhy, BtStatus, GattStatus, ProfileConnectionState, RawAddress, Uuid,
};

use num_derive::{FromPrimitive, ToPrimitive};

/// MTU ceiling the framework clamps exchange requests to.
pub const GATT_MAX_MTU_SIZE: u32 = 517;

/* Characteristic properties */
pub const GATT_PROP_BROADCAST: u16 = 0x01;
pub const GATT_PROP_READ: u16 = 0x02;
pub const GATT_PROP_WRITE_NR: u16 = 0x04;
pub const GATT_PROP_WRITE: u16 = 0x08;
pub const GATT_PROP_NOTIFY: u16 = 0x10;
pub const GATT_PROP_INDICATE: u16 = 0x20;
pub const GATT_PROP_SIGNED_WRITE: u16 = 0x40;
pub const GATT_PROP_EXTENDED_PROPS: u16 = 0x80;

/* Attribute permissions */
pub const GATT_PERM_READ: u16 = 0x01;
pub const GATT_PERM_WRITE: u16 = 0x02;
pub const GATT_PERM_ENCRYPT_REQUIRED: u16 = 0x04;
pub const GATT_PERM_AUTHEN_REQUIRED: u16 = 0x08;
pub const GATT_PERM_MITM_REQUIRED: u16 = 0x10;

/* Client characteristic configuration bits */
pub const GATT_CCC_NOTIFY: u16 = 0x0001;
pub const GATT_CCC_INDICATE: u16 = 0x0002;

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum GattAttrType {
    PrimaryService = 0,
    SecondaryService,
    IncludedService,
    Characteristic,
    Descriptor,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GattWriteType {
    NoRsp,
    Rsp,
}

/// One attribute as it crosses the SAL: discovery results on the client
/// side, element registration on the server side.
#[derive(Debug, Clone)]
pub struct GattElement {
    pub handle: u16,
    pub uuid: Uuid,
    pub attr_type: GattAttrType,
    pub properties: u16,
    pub permissions: u16,
}

pub trait GattClientSal: Send + Sync {
    fn connect(&self, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus;
    fn disconnect(&self, addr: &RawAddress) -> BtStatus;
    fn discover_all_services(&self, addr: &RawAddress) -> BtStatus;
    fn discover_service_by_uuid(&self, addr: &RawAddress, uuid: &Uuid) -> BtStatus;
    fn read_element(&self, addr: &RawAddress, handle: u16) -> BtStatus;
    fn write_element(
        &self,
        addr: &RawAddress,
        handle: u16,
        value: &[u8],
        write_type: GattWriteType,
    ) -> BtStatus;
    /// `properties` carries the notify/indicate bit being toggled.
    fn register_notifications(
        &self,
        addr: &RawAddress,
        handle: u16,
        properties: u16,
        enable: bool,
    ) -> BtStatus;
    fn send_mtu_req(&self, addr: &RawAddress, mtu: u32) -> BtStatus;
    fn update_connection_parameter(
        &self,
        addr: &RawAddress,
        min_interval: u32,
        max_interval: u32,
        latency: u32,
        timeout: u32,
        min_ce_length: u32,
        max_ce_length: u32,
    ) -> BtStatus;
    fn read_remote_rssi(&self, addr: &RawAddress) -> BtStatus;
    fn read_phy(&self, addr: &RawAddress) -> BtStatus;
    fn set_phy(&self, addr: &RawAddress, tx_phy: BlePhy, rx_phy: BlePhy) -> BtStatus;
}

#[derive(Debug)]
pub enum GattClientCallbacks {
    ConnectionStateChanged(RawAddress, ProfileConnectionState),
    ServiceDiscovered(RawAddress, Vec<GattElement>),
    DiscoverComplete(RawAddress, GattStatus),
    ElementRead(RawAddress, u16, Vec<u8>, GattStatus),
    ElementWritten(RawAddress, u16, GattStatus),
    ElementSubscribed(RawAddress, u16, GattStatus, bool),
    ElementChanged(RawAddress, u16, Vec<u8>),
    MtuChanged(RawAddress, u32, GattStatus),
    PhyRead(RawAddress, BlePhy, BlePhy),
    PhyUpdated(RawAddress, BlePhy, BlePhy, GattStatus),
    RssiRead(RawAddress, i32, GattStatus),
    ConnectionParameterUpdated(RawAddress, u16, u16, u16, BtStatus),
}

pub struct GattClientCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(GattClientCallbacks) + Send>,
}

pub trait GattServerSal: Send + Sync {
    fn enable(&self) -> BtStatus;
    fn disable(&self) -> BtStatus;
    fn add_elements(&self, elements: &[GattElement]) -> BtStatus;
    fn remove_elements(&self, start_handle: u16, count: u16) -> BtStatus;
    fn connect(&self, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus;
    fn cancel_connection(&self, addr: &RawAddress) -> BtStatus;
    fn send_response(&self, addr: &RawAddress, request_id: u32, value: &[u8]) -> BtStatus;
    fn send_notification(&self, addr: &RawAddress, handle: u16, value: &[u8]) -> BtStatus;
    fn send_indication(&self, addr: &RawAddress, handle: u16, value: &[u8]) -> BtStatus;
    fn read_phy(&self, addr: &RawAddress) -> BtStatus;
    fn set_phy(&self, addr: &RawAddress, tx_phy: BlePhy, rx_phy: BlePhy) -> BtStatus;
}

#[derive(Debug)]
pub enum GattServerCallbacks {
    ConnectionStateChanged(RawAddress, ProfileConnectionState),
    ElementsAdded(GattStatus, u16, u16),
    ElementsRemoved(GattStatus, u16, u16),
    ReadRequest(RawAddress, u32, u16),
    WriteRequest(RawAddress, u32, u16, Vec<u8>, u16),
    MtuChanged(RawAddress, u32),
    NotificationSent(RawAddress, u16, GattStatus),
    PhyRead(RawAddress, BlePhy, BlePhy),
    PhyUpdated(RawAddress, BlePhy, BlePhy, GattStatus),
    ConnectionParameterChanged(RawAddress, u16, u16, u16),
}

pub struct GattServerCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(GattServerCallbacks) + Send>,
}
