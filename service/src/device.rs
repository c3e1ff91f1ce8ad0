//! Per-remote device record kept by the adapter service.

use bt_sal::adapter::{RemoteDeviceProperties, RemoteLeDeviceProperties};
use bt_sal::types::{
    BleAddrType, BlePhy, BondState, BtDeviceType, BtTransport, ConnectionState, LinkKeyType,
    LinkRole, RawAddress, Uuid, LINK_POLICY_ENABLE_ROLE_SWITCH, LINK_POLICY_ENABLE_SNIFF,
};

pub const DFLAG_NAME_SET: u32 = 1 << 0;
pub const DFLAG_GET_RMT_NAME: u32 = 1 << 1;
pub const DFLAG_WHITELIST_ADDED: u32 = 1 << 2;
pub const DFLAG_LE_KEY_SET: u32 = 1 << 3;
pub const DFLAG_BOND_INITIATE_LOCAL: u32 = 1 << 4;

pub struct Device {
    addr: RawAddress,
    transport: BtTransport,
    addr_type: BleAddrType,
    name: String,
    alias: String,
    class_of_device: u32,
    rssi: i8,
    device_type: BtDeviceType,
    uuids: Vec<Uuid>,
    flags: u32,
    bond_state: BondState,
    connection_state: ConnectionState,
    acl_handle: Option<u16>,
    link_role: LinkRole,
    link_policy: u16,
    link_key: Option<[u8; 16]>,
    link_key_type: LinkKeyType,
    smp_key: Option<[u8; 28]>,
    identity_addr: Option<RawAddress>,
    le_tx_phy: BlePhy,
    le_rx_phy: BlePhy,
}

impl Device {
    pub fn new_bredr(addr: RawAddress) -> Self {
        Device::new(addr, BtTransport::Bredr, BleAddrType::Public)
    }

    pub fn new_le(addr: RawAddress, addr_type: BleAddrType) -> Self {
        Device::new(addr, BtTransport::Le, addr_type)
    }

    fn new(addr: RawAddress, transport: BtTransport, addr_type: BleAddrType) -> Self {
        Device {
            addr,
            transport,
            addr_type,
            name: String::new(),
            alias: String::new(),
            class_of_device: 0,
            rssi: 0,
            device_type: BtDeviceType::Unknown,
            uuids: Vec::new(),
            flags: 0,
            bond_state: BondState::None,
            connection_state: ConnectionState::Disconnected,
            acl_handle: None,
            link_role: LinkRole::Unknown,
            link_policy: LINK_POLICY_ENABLE_ROLE_SWITCH | LINK_POLICY_ENABLE_SNIFF,
            link_key: None,
            link_key_type: LinkKeyType::Combination,
            smp_key: None,
            identity_addr: None,
            le_tx_phy: BlePhy::Le1m,
            le_rx_phy: BlePhy::Le1m,
        }
    }

    pub fn addr(&self) -> &RawAddress {
        &self.addr
    }

    pub fn transport(&self) -> BtTransport {
        self.transport
    }

    pub fn addr_type(&self) -> BleAddrType {
        self.addr_type
    }

    pub fn set_addr_type(&mut self, addr_type: BleAddrType) {
        self.addr_type = addr_type;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true when the stored name actually changed.
    pub fn set_name(&mut self, name: &str) -> bool {
        if name.is_empty() || self.name == name {
            return false;
        }
        self.name = name.into();
        self.flags |= DFLAG_NAME_SET;
        true
    }

    pub fn alias(&self) -> &str {
        if self.alias.is_empty() {
            &self.name
        } else {
            &self.alias
        }
    }

    pub fn set_alias(&mut self, alias: &str) {
        self.alias = alias.into();
    }

    pub fn class_of_device(&self) -> u32 {
        self.class_of_device
    }

    pub fn set_class_of_device(&mut self, cod: u32) {
        if cod != 0 {
            self.class_of_device = cod;
        }
    }

    pub fn rssi(&self) -> i8 {
        self.rssi
    }

    pub fn set_rssi(&mut self, rssi: i8) {
        self.rssi = rssi;
    }

    pub fn device_type(&self) -> BtDeviceType {
        self.device_type
    }

    pub fn set_device_type(&mut self, device_type: BtDeviceType) {
        self.device_type = device_type;
    }

    pub fn uuids(&self) -> &[Uuid] {
        &self.uuids
    }

    pub fn set_uuids(&mut self, uuids: Vec<Uuid>) {
        self.uuids = uuids;
    }

    pub fn check_flag(&self, flags: u32) -> bool {
        (self.flags & flags) != 0
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags |= flags;
    }

    pub fn clear_flags(&mut self, flags: u32) {
        self.flags &= !flags;
    }

    pub fn bond_state(&self) -> BondState {
        self.bond_state
    }

    pub fn set_bond_state(&mut self, state: BondState) {
        self.bond_state = state;
    }

    pub fn is_bonded(&self) -> bool {
        self.bond_state == BondState::Bonded
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        if state == ConnectionState::Disconnected {
            self.acl_handle = None;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state.is_connected()
    }

    pub fn is_encrypted(&self) -> bool {
        self.connection_state.is_encrypted()
    }

    pub fn acl_handle(&self) -> Option<u16> {
        self.acl_handle
    }

    pub fn set_acl_handle(&mut self, handle: u16) {
        self.acl_handle = Some(handle);
    }

    pub fn link_role(&self) -> LinkRole {
        self.link_role
    }

    pub fn set_link_role(&mut self, role: LinkRole) {
        self.link_role = role;
    }

    pub fn link_policy(&self) -> u16 {
        self.link_policy
    }

    pub fn set_link_policy(&mut self, policy: u16) {
        self.link_policy = policy;
    }

    pub fn link_key(&self) -> Option<&[u8; 16]> {
        self.link_key.as_ref()
    }

    pub fn set_link_key(&mut self, key: [u8; 16], key_type: LinkKeyType) {
        self.link_key = Some(key);
        self.link_key_type = key_type;
    }

    pub fn delete_link_key(&mut self) {
        self.link_key = None;
    }

    pub fn link_key_type(&self) -> LinkKeyType {
        self.link_key_type
    }

    pub fn smp_key(&self) -> Option<&[u8; 28]> {
        self.smp_key.as_ref()
    }

    /// Stores the SMP blob; bytes 0..6 double as the identity address.
    pub fn set_smp_key(&mut self, key: [u8; 28]) {
        let mut identity = [0u8; 6];
        identity.copy_from_slice(&key[0..6]);
        self.identity_addr = Some(RawAddress::from(identity));
        self.smp_key = Some(key);
        self.flags |= DFLAG_LE_KEY_SET;
    }

    pub fn delete_smp_key(&mut self) {
        self.smp_key = None;
        self.identity_addr = None;
        self.flags &= !DFLAG_LE_KEY_SET;
    }

    pub fn identity_addr(&self) -> Option<&RawAddress> {
        self.identity_addr.as_ref()
    }

    pub fn le_phy(&self) -> (BlePhy, BlePhy) {
        (self.le_tx_phy, self.le_rx_phy)
    }

    pub fn set_le_phy(&mut self, tx_phy: BlePhy, rx_phy: BlePhy) {
        self.le_tx_phy = tx_phy;
        self.le_rx_phy = rx_phy;
    }

    /// Snapshot for the persistent bonded-device table.
    pub fn bredr_properties(&self) -> RemoteDeviceProperties {
        RemoteDeviceProperties {
            addr: self.addr,
            name: self.name.clone(),
            alias: self.alias.clone(),
            class_of_device: self.class_of_device,
            device_type: self.device_type as u32,
            link_key: self.link_key.unwrap_or([0; 16]),
            link_key_type: self.link_key_type as u32,
        }
    }

    pub fn le_properties(&self) -> RemoteLeDeviceProperties {
        RemoteLeDeviceProperties {
            addr: self.addr,
            addr_type: self.addr_type,
            smp_key: self.smp_key.unwrap_or([0; 28]),
        }
    }
}
