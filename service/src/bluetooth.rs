//! Adapter service: device tables, discovery, bonding and connection
//! pipelines, adapter properties, and the power state machine driver.
//!
//! Everything here runs on the dispatch loop. Stack events arrive through
//! [`Bluetooth::dispatch_sal_event`]; state machine inputs through
//! [`Bluetooth::step_state_machine`]; applications observe the adapter
//! through the registered [`IBluetoothCallback`] objects.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use log::{debug, info, warn};
use tokio::sync::mpsc::Sender;

use bt_sal::adapter::{
    AclStateParams, AdapterCallbacks, AdapterSal, DiscoveryResult, RemoteLeDeviceProperties,
    StackState,
};
use bt_sal::le::BleConnectParams;
use bt_sal::types::{
    cod_is_headset, BleAddrType, BlePhy, BondState, BtDeviceType, BtDiscoveryState,
    BtIoCapability, BtScanMode, BtScanType, BtStatus, BtTransport, ConnectionState, LinkKeyType,
    LinkRole, PairType, RawAddress, Uuid, BT_LOC_NAME_MAX_LEN,
    HCI_ERR_CONNECTION_TERMINATED_BY_LOCAL_HOST, HCI_ERR_PAIRING_NOT_ALLOWED,
    LINK_POLICY_ENABLE_ROLE_SWITCH,
};

use crate::adapter_state::{AdapterState, AdapterStateMachine, FsmEffect, FsmEvent};
use crate::bluetooth_adv::AdvertiserActions;
use crate::bluetooth_scan::ScannerActions;
use crate::callbacks::Callbacks;
use crate::config::Config;
use crate::device::{Device, DFLAG_GET_RMT_NAME, DFLAG_NAME_SET, DFLAG_WHITELIST_ADDED};
use crate::power_manager::PmActions;
use crate::storage::{AdapterStorage, Storage};
use crate::utils::Alarm;
use crate::{Message, RPCProxy};

/// Timeout window for every adapter state transition phase.
const ADAPTER_TRANSITION_TIMEOUT_MS: u64 = 8000;

/// Enable/disable selector: the whole stack or the LE half only.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SysSetOpt {
    All,
    BleOnly,
}

pub trait IBluetoothCallback: RPCProxy {
    fn on_adapter_state_changed(&mut self, state: AdapterState);
    fn on_discovery_state_changed(&mut self, state: BtDiscoveryState);
    fn on_discovery_result(&mut self, result: &DiscoveryResult);
    fn on_scan_mode_changed(&mut self, mode: BtScanMode);
    fn on_device_name_changed(&mut self, name: &str);
    fn on_pair_request(&mut self, addr: &RawAddress);
    fn on_pair_display(
        &mut self,
        addr: &RawAddress,
        transport: BtTransport,
        pair_type: PairType,
        passkey: u32,
    );
    fn on_connect_request(&mut self, addr: &RawAddress, cod: u32);
    fn on_connection_state_changed(
        &mut self,
        addr: &RawAddress,
        transport: BtTransport,
        state: ConnectionState,
    );
    fn on_bond_state_changed(
        &mut self,
        addr: &RawAddress,
        transport: BtTransport,
        state: BondState,
        is_ctkd: bool,
    );
    fn on_remote_name_changed(&mut self, addr: &RawAddress, name: &str);
    fn on_remote_alias_changed(&mut self, addr: &RawAddress, alias: &str);
    fn on_remote_uuids_changed(&mut self, addr: &RawAddress, uuids: &[Uuid]);
    fn on_le_sc_local_oob_data_got(&mut self, addr: &RawAddress, c_val: [u8; 16], r_val: [u8; 16]);
}

struct AdapterProperties {
    name: String,
    addr: RawAddress,
    class_of_device: u32,
    io_capability: BtIoCapability,
    scan_mode: BtScanMode,
    bondable: bool,
}

struct LeAdapterProperties {
    addr: RawAddress,
    addr_type: BleAddrType,
    le_io_capability: u32,
    le_appearance: u16,
}

pub struct Bluetooth {
    config: Config,
    sal: Arc<dyn AdapterSal>,
    tx: Sender<Message>,
    stm: AdapterStateMachine,
    state_alarm: Option<Alarm>,
    adapter_state: AdapterState,
    properties: AdapterProperties,
    le_properties: LeAdapterProperties,
    devices: HashMap<RawAddress, Device>,
    le_devices: HashMap<RawAddress, Device>,
    is_discovering: bool,
    callbacks: Callbacks<dyn IBluetoothCallback + Send>,
    storage: Storage,
}

impl Bluetooth {
    pub fn new(config: Config, sal: Arc<dyn AdapterSal>, tx: Sender<Message>) -> Self {
        let storage = Storage::new(config.storage_path.clone());
        let callbacks: Callbacks<dyn IBluetoothCallback + Send> = Callbacks::new(
            config.max_register_num,
            tx.clone(),
            Message::AdapterCallbackDisconnected,
        );

        Bluetooth {
            stm: AdapterStateMachine::new(config.bredr_support, config.ble_support),
            config,
            sal,
            tx,
            state_alarm: None,
            adapter_state: AdapterState::Off,
            properties: AdapterProperties {
                name: String::new(),
                addr: RawAddress::EMPTY,
                class_of_device: 0,
                io_capability: BtIoCapability::DisplayYesNo,
                scan_mode: BtScanMode::None,
                bondable: true,
            },
            le_properties: LeAdapterProperties {
                addr: RawAddress::EMPTY,
                addr_type: BleAddrType::Public,
                le_io_capability: 0,
                le_appearance: 0,
            },
            devices: HashMap::new(),
            le_devices: HashMap::new(),
            is_discovering: false,
            callbacks,
            storage,
        }
    }

    /* ---------------- callback registry ---------------- */

    pub fn register_callback(&mut self, callback: Box<dyn IBluetoothCallback + Send>) -> Option<u32> {
        self.callbacks.add_callback(callback)
    }

    pub fn unregister_callback(&mut self, id: u32) -> bool {
        self.callbacks.remove_callback(id)
    }

    pub fn callback_disconnected(&mut self, id: u32) {
        self.callbacks.remove_callback(id);
    }

    /* ---------------- device table ---------------- */

    fn find_device(&self, addr: &RawAddress, transport: BtTransport) -> Option<&Device> {
        match transport {
            BtTransport::Bredr => self.devices.get(addr),
            BtTransport::Le => self.le_devices.get(addr),
        }
    }

    fn find_device_mut(&mut self, addr: &RawAddress, transport: BtTransport) -> Option<&mut Device> {
        match transport {
            BtTransport::Bredr => self.devices.get_mut(addr),
            BtTransport::Le => self.le_devices.get_mut(addr),
        }
    }

    fn find_create_classic_device(&mut self, addr: &RawAddress) -> &mut Device {
        self.devices.entry(*addr).or_insert_with(|| Device::new_bredr(*addr))
    }

    fn find_create_le_device(&mut self, addr: &RawAddress, addr_type: BleAddrType) -> &mut Device {
        self.le_devices.entry(*addr).or_insert_with(|| Device::new_le(*addr, addr_type))
    }

    /// Drops a device table, synthesising the disconnect notification for
    /// anything that was not already disconnected.
    fn clear_devices(&mut self, transport: BtTransport) {
        let table = match transport {
            BtTransport::Bredr => &mut self.devices,
            BtTransport::Le => &mut self.le_devices,
        };

        let lost: Vec<RawAddress> = table
            .values()
            .filter(|d| d.connection_state() != ConnectionState::Disconnected)
            .map(|d| *d.addr())
            .collect();
        table.clear();

        for addr in lost {
            self.callbacks.for_all_callbacks(|cb| {
                cb.on_connection_state_changed(&addr, transport, ConnectionState::Disconnected);
            });
        }
    }

    /* ---------------- persistent state sync ---------------- */

    fn save_properties(&self) {
        self.storage.save_adapter_info(&AdapterStorage {
            name: self.properties.name.clone(),
            class_of_device: self.properties.class_of_device,
            io_capability: self.properties.io_capability,
            scan_mode: self.properties.scan_mode,
            bondable: self.properties.bondable,
        });
    }

    fn update_bonded_devices(&self) {
        let records = self
            .devices
            .values()
            .filter(|d| d.is_bonded())
            .map(|d| d.bredr_properties())
            .collect_vec();
        self.storage.save_bonded_devices(&records);
    }

    fn update_whitelist(&self) {
        let records = self
            .le_devices
            .values()
            .filter(|d| d.check_flag(DFLAG_WHITELIST_ADDED))
            .map(|d| d.le_properties())
            .collect_vec();
        self.storage.save_whitelist(&records);
    }

    /* ---------------- state machine driver ---------------- */

    pub fn get_state(&self) -> AdapterState {
        self.adapter_state
    }

    pub fn is_le_enabled(&self) -> bool {
        self.config.ble_support
            && matches!(
                self.adapter_state,
                AdapterState::BleOn
                    | AdapterState::TurningOn
                    | AdapterState::TurningOff
                    | AdapterState::On
            )
    }

    pub fn enable(&mut self, opt: SysSetOpt) -> BtStatus {
        if self.adapter_state == AdapterState::On {
            return BtStatus::Done;
        }

        let event = match opt {
            SysSetOpt::All => FsmEvent::SysTurnOn,
            SysSetOpt::BleOnly => FsmEvent::TurnOnBle,
        };
        self.step_state_machine(event);
        BtStatus::Success
    }

    pub fn disable(&mut self, opt: SysSetOpt) -> BtStatus {
        if self.adapter_state == AdapterState::Off {
            return BtStatus::Done;
        }

        let event = match opt {
            SysSetOpt::All => FsmEvent::SysTurnOff,
            SysSetOpt::BleOnly => FsmEvent::TurnOffBle,
        };
        self.step_state_machine(event);
        BtStatus::Success
    }

    pub fn step_state_machine(&mut self, event: FsmEvent) {
        let effects = self.stm.process_event(event);
        if effects.is_empty() {
            return;
        }

        // Progress voids any pending transition watchdog; effects re-arm
        // one where the new phase needs it.
        self.state_alarm = None;
        for effect in effects {
            self.apply_fsm_effect(effect);
        }
    }

    fn apply_fsm_effect(&mut self, effect: FsmEffect) {
        match effect {
            FsmEffect::Exited(AdapterState::TurningOff) => self.on_br_disabled(),
            FsmEffect::Exited(AdapterState::BleTurningOff) => self.on_le_disabled(),
            FsmEffect::Exited(_) => {}
            FsmEffect::Entered { prev, state } => self.enter_state(prev, state),
            FsmEffect::StartProfiles(transport) => {
                let timeout = match transport {
                    BtTransport::Bredr => FsmEvent::BredrProfileEnableTimeout,
                    BtTransport::Le => FsmEvent::BleProfileEnableTimeout,
                };
                self.arm_state_timeout(timeout);
                self.post(Message::StartupProfiles(transport));
            }
            FsmEffect::DisableStack => {
                self.arm_state_timeout(FsmEvent::BredrDisableTimeout);
                self.sal.disable();
            }
            FsmEffect::DisableLeStack => {
                self.arm_state_timeout(FsmEvent::BleDisableTimeout);
                self.sal.le_disable();
            }
        }
    }

    fn enter_state(&mut self, prev: Option<AdapterState>, state: AdapterState) {
        debug!("adapter: {:?} -> {:?}", prev, state);

        match state {
            AdapterState::Off => {
                if prev.is_some() {
                    self.notify_state_change(state);
                }
            }
            AdapterState::BleTurningOn => {
                self.arm_state_timeout(FsmEvent::BleEnableTimeout);
                if self.sal.le_enable() == BtStatus::Success {
                    self.notify_state_change(state);
                } else {
                    warn!("adapter: le_enable rejected by stack");
                }
            }
            AdapterState::BleOn => {
                self.notify_state_change(state);
                self.on_le_enabled();
            }
            AdapterState::TurningOn => {
                self.arm_state_timeout(FsmEvent::BredrEnableTimeout);
                if self.sal.enable() == BtStatus::Success {
                    self.notify_state_change(state);
                } else {
                    warn!("adapter: enable rejected by stack");
                }
            }
            AdapterState::On => {
                self.on_br_enabled();
                self.notify_state_change(state);
            }
            AdapterState::TurningOff => {
                self.arm_state_timeout(FsmEvent::BredrProfileDisableTimeout);
                self.post(Message::ShutdownProfiles(BtTransport::Bredr));
                self.notify_state_change(state);
            }
            AdapterState::BleTurningOff => {
                self.arm_state_timeout(FsmEvent::BleProfileDisableTimeout);
                self.post(Message::ShutdownProfiles(BtTransport::Le));
                self.notify_state_change(state);
            }
        }
    }

    fn arm_state_timeout(&mut self, event: FsmEvent) {
        self.state_alarm = Some(Alarm::start(
            self.tx.clone(),
            ADAPTER_TRANSITION_TIMEOUT_MS,
            move || Message::AdapterStateMachine(event),
        ));
    }

    fn notify_state_change(&mut self, state: AdapterState) {
        debug!("adapter: observable state {:?}", state);
        self.adapter_state = state;
        self.callbacks.for_all_callbacks(|cb| cb.on_adapter_state_changed(state));
    }

    /// BR/EDR controller came up: push the stored adapter identity down.
    fn on_br_enabled(&mut self) {
        self.sal.set_name(&self.properties.name);
        self.properties.addr = self.sal.get_address();
        self.sal.set_io_capability(self.properties.io_capability);
        self.sal.set_scan_mode(self.properties.scan_mode, self.properties.bondable);
        self.sal.set_device_class(self.properties.class_of_device);

        info!(
            "Adapter up: name {}, address {}, cod 0x{:06x}, scan mode {:?}, bondable {}",
            self.properties.name,
            self.properties.addr,
            self.properties.class_of_device,
            self.properties.scan_mode,
            self.properties.bondable
        );
    }

    fn on_br_disabled(&mut self) {
        self.clear_devices(BtTransport::Bredr);
    }

    /// LE life-phase entered: reload LE bond state and bring up the LE
    /// managers.
    fn on_le_enabled(&mut self) {
        self.sal.le_get_address();

        let bonded = self.storage.load_le_bonded_devices();
        for record in bonded.iter() {
            let device = self.find_create_le_device(&record.addr, record.addr_type);
            device.set_bond_state(BondState::Bonded);
            device.set_smp_key(record.smp_key);
        }
        if !bonded.is_empty() {
            self.sal.le_set_bonded_devices(&bonded);
        }

        for record in self.storage.load_whitelist() {
            let device = self.find_create_le_device(&record.addr, record.addr_type);
            device.set_flags(DFLAG_WHITELIST_ADDED);
            self.sal.le_add_white_list(&record.addr, record.addr_type);
        }

        if self.config.ble_adv {
            self.post(Message::AdvertiserActions(AdvertiserActions::ManagerStart));
        }
        if self.config.ble_scan {
            self.post(Message::ScannerActions(ScannerActions::ManagerStart));
        }
    }

    fn on_le_disabled(&mut self) {
        if self.config.ble_adv {
            self.post(Message::AdvertiserActions(AdvertiserActions::ManagerStop));
        }
        if self.config.ble_scan {
            self.post(Message::ScannerActions(ScannerActions::ManagerStop));
        }
        self.clear_devices(BtTransport::Le);
    }

    fn post(&self, message: Message) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(message).await;
        });
    }

    fn notify_pm(&self, action: PmActions) {
        self.post(Message::PmActions(action));
    }

    /* ---------------- stack events ---------------- */

    pub fn dispatch_sal_event(&mut self, event: AdapterCallbacks) {
        match event {
            AdapterCallbacks::StackStateChanged(state) => self.on_stack_state_changed(state),
            AdapterCallbacks::ScanModeChanged(mode) => {
                self.properties.scan_mode = mode;
                self.save_properties();
                self.callbacks.for_all_callbacks(|cb| cb.on_scan_mode_changed(mode));
            }
            AdapterCallbacks::DiscoveryStateChanged(state) => {
                self.is_discovering = state == BtDiscoveryState::Started;
                self.callbacks.for_all_callbacks(|cb| cb.on_discovery_state_changed(state));
            }
            AdapterCallbacks::DeviceFound(result) => self.on_device_found(result),
            AdapterCallbacks::RemoteNameReceived(addr, name) => {
                self.on_remote_name_received(&addr, &name)
            }
            AdapterCallbacks::ConnectRequest(addr, cod) => self.on_connect_request(&addr, cod),
            AdapterCallbacks::ConnectionStateChanged(params) => {
                self.on_connection_state_changed(params)
            }
            AdapterCallbacks::PairRequest(addr, local_initiate, is_bondable) => {
                self.on_pair_request(&addr, local_initiate, is_bondable)
            }
            AdapterCallbacks::PinRequest(addr, cod, min_16_digit, _name) => {
                self.on_pin_request(&addr, cod, min_16_digit)
            }
            AdapterCallbacks::SspRequest(addr, transport, cod, ssp_type, passkey, _name) => {
                self.on_ssp_request(&addr, transport, cod, ssp_type, passkey)
            }
            AdapterCallbacks::BondStateChanged(addr, state, transport, _status, is_ctkd) => {
                self.on_bond_state_changed(&addr, state, transport, is_ctkd)
            }
            AdapterCallbacks::ServiceSearchDone(addr, uuids) => {
                let known = match self.find_device_mut(&addr, BtTransport::Bredr) {
                    Some(device) => {
                        device.set_uuids(uuids.clone());
                        true
                    }
                    None => false,
                };
                if known {
                    self.callbacks.for_all_callbacks(|cb| cb.on_remote_uuids_changed(&addr, &uuids));
                }
            }
            AdapterCallbacks::EncryptionStateChanged(addr, encrypted, transport) => {
                self.on_encryption_state_changed(&addr, encrypted, transport)
            }
            AdapterCallbacks::LinkKeyUpdate(addr, key, key_type) => {
                self.on_link_key_update(&addr, key, key_type)
            }
            AdapterCallbacks::LinkKeyRemoved(addr, _status) => self.on_link_key_removed(&addr),
            AdapterCallbacks::LinkRoleChanged(addr, role) => self.on_link_role_changed(&addr, role),
            AdapterCallbacks::LinkModeChanged(addr, mode, interval) => {
                self.notify_pm(PmActions::LinkModeChanged(addr, mode, interval));
            }
            AdapterCallbacks::LinkPolicyChanged(addr, policy) => {
                if let Some(device) = self.find_device_mut(&addr, BtTransport::Bredr) {
                    device.set_link_policy(policy);
                }
            }
            AdapterCallbacks::LeAddrUpdate(addr, addr_type) => {
                self.le_properties.addr = addr;
                self.le_properties.addr_type = addr_type;
            }
            AdapterCallbacks::LePhyUpdate(addr, tx_phy, rx_phy, status) => {
                if status != BtStatus::Success {
                    warn!("adapter: phy update for {} failed: {:?}", addr, status);
                    return;
                }
                if let Some(device) = self.find_device_mut(&addr, BtTransport::Le) {
                    device.set_le_phy(tx_phy, rx_phy);
                }
            }
            AdapterCallbacks::WhitelistUpdate(addr, is_added, status) => {
                self.on_whitelist_update(&addr, is_added, status)
            }
            AdapterCallbacks::LeBondedDevicesUpdate(records) => {
                self.on_le_bonded_devices_update(records)
            }
            AdapterCallbacks::LeOobDataGot(addr, c_val, r_val) => {
                self.callbacks.for_all_callbacks(|cb| cb.on_le_sc_local_oob_data_got(&addr, c_val, r_val));
            }
        }
    }

    fn on_stack_state_changed(&mut self, state: StackState) {
        let event = match state {
            StackState::BredrOn => {
                // Adapter identity and bonded peers come back from storage
                // before the machine advances.
                let stored = self.storage.load_adapter_info();
                self.properties.name = stored.name;
                self.properties.class_of_device = stored.class_of_device;
                self.properties.io_capability = stored.io_capability;
                self.properties.scan_mode = stored.scan_mode;
                self.properties.bondable = stored.bondable;

                let bonded = self.storage.load_bonded_devices();
                for record in bonded.iter() {
                    let device = self.find_create_classic_device(&record.addr);
                    device.set_name(&record.name);
                    device.set_alias(&record.alias);
                    device.set_class_of_device(record.class_of_device);
                    device.set_link_key(record.link_key, link_key_type_of(record.link_key_type));
                    device.set_bond_state(BondState::Bonded);
                }
                if !bonded.is_empty() {
                    self.sal.set_bonded_devices(&bonded);
                }

                FsmEvent::BredrEnabled
            }
            StackState::BredrOff => FsmEvent::BredrDisabled,
            StackState::BleOn => FsmEvent::BleEnabled,
            StackState::BleOff => FsmEvent::BleDisabled,
        };

        self.step_state_machine(event);
    }

    fn on_device_found(&mut self, result: DiscoveryResult) {
        if !self.is_discovering {
            return;
        }

        let device = self.find_create_classic_device(&result.addr);
        device.set_name(&result.name);
        device.set_class_of_device(result.class_of_device);
        device.set_rssi(result.rssi);
        device.set_device_type(BtDeviceType::Bredr);

        self.callbacks.for_all_callbacks(|cb| cb.on_discovery_result(&result));
    }

    fn on_remote_name_received(&mut self, addr: &RawAddress, name: &str) {
        let device = self.find_create_classic_device(addr);
        let notify = device.set_name(name);
        device.clear_flags(DFLAG_GET_RMT_NAME);

        if notify {
            self.callbacks.for_all_callbacks(|cb| cb.on_remote_name_changed(addr, name));
        }
    }

    fn connected_count(&self) -> usize {
        self.devices.values().filter(|d| d.is_connected()).count()
    }

    fn on_connect_request(&mut self, addr: &RawAddress, cod: u32) {
        debug!("adapter: ACL connect request from {}", addr);

        let at_capacity = self.connected_count() >= self.config.max_acl_connections;
        let device = self.find_create_classic_device(addr);
        device.set_class_of_device(cod);

        if at_capacity {
            warn!("adapter: rejecting connect request, ACL table full");
            self.sal.acl_connection_reply(addr, false);
            return;
        }

        self.callbacks.for_all_callbacks(|cb| cb.on_connect_request(addr, cod));
    }

    fn on_connection_state_changed(&mut self, params: AclStateParams) {
        let addr = params.addr;
        debug!(
            "adapter: ACL {} {:?} state {:?} reason {}",
            addr, params.transport, params.connection_state, params.hci_reason_code
        );

        let mut request_name = false;
        match params.transport {
            BtTransport::Bredr => {
                let device = self.find_create_classic_device(&addr);
                if device.bond_state() == BondState::Bonding
                    && !device.check_flag(DFLAG_NAME_SET | DFLAG_GET_RMT_NAME)
                {
                    device.set_flags(DFLAG_GET_RMT_NAME);
                    request_name = true;
                }
            }
            BtTransport::Le => {
                self.find_create_le_device(&addr, params.addr_type);
            }
        }
        if request_name {
            self.sal.get_remote_name(&addr);
        }

        let connected = params.connection_state == ConnectionState::Connected;
        let acl_handle = if connected {
            Some(self.sal.get_acl_connection_handle(&addr, params.transport))
        } else {
            None
        };

        let device = match self.find_device_mut(&addr, params.transport) {
            Some(device) => device,
            None => return,
        };
        device.set_connection_state(params.connection_state);
        if let Some(handle) = acl_handle {
            device.set_acl_handle(handle);
        }

        if params.transport == BtTransport::Bredr {
            match params.connection_state {
                ConnectionState::Connected => self.notify_pm(PmActions::DeviceConnected(addr)),
                ConnectionState::Disconnected => {
                    self.notify_pm(PmActions::DeviceDisconnected(addr))
                }
                _ => {}
            }
        }

        let (transport, state) = (params.transport, params.connection_state);
        self.callbacks.for_all_callbacks(|cb| cb.on_connection_state_changed(&addr, transport, state));
    }

    fn on_pair_request(&mut self, addr: &RawAddress, local_initiate: bool, is_bondable: bool) {
        if !is_bondable || !self.properties.bondable {
            debug!("adapter: pairing not allowed for {}", addr);
            self.sal.pair_reply(addr, HCI_ERR_PAIRING_NOT_ALLOWED);
            return;
        }

        let device = self.find_create_classic_device(addr);
        if local_initiate {
            device.set_flags(crate::device::DFLAG_BOND_INITIATE_LOCAL);
        }

        self.callbacks.for_all_callbacks(|cb| cb.on_pair_request(addr));
    }

    fn on_pin_request(&mut self, addr: &RawAddress, _cod: u32, _min_16_digit: bool) {
        self.find_create_classic_device(addr);
        if self.get_remote_bond_state(addr, BtTransport::Bredr) == BondState::Canceling {
            debug!("adapter: rejecting pin request while canceling");
            self.sal.pin_reply(addr, false, &[]);
            return;
        }

        let mut request_name = false;
        if let Some(device) = self.find_device_mut(addr, BtTransport::Bredr) {
            if !device.check_flag(DFLAG_NAME_SET | DFLAG_GET_RMT_NAME) {
                device.set_flags(DFLAG_GET_RMT_NAME);
                request_name = true;
            }
            device.set_bond_state(BondState::Bonding);
        }
        if request_name {
            self.sal.get_remote_name(addr);
        }

        self.callbacks.for_all_callbacks(|cb| {
            cb.on_pair_display(addr, BtTransport::Bredr, PairType::PinCode, 0)
        });
    }

    fn on_ssp_request(
        &mut self,
        addr: &RawAddress,
        transport: BtTransport,
        _cod: u32,
        ssp_type: PairType,
        passkey: u32,
    ) {
        let canceling = match self.find_device(addr, transport) {
            Some(device) => device.bond_state() == BondState::Canceling,
            None => {
                warn!("adapter: ssp request for unknown {}", addr);
                return;
            }
        };

        if canceling {
            debug!("adapter: rejecting ssp request while canceling");
            match transport {
                BtTransport::Bredr => {
                    self.sal.ssp_reply(addr, false, ssp_type, 0);
                }
                BtTransport::Le => {
                    self.sal.le_smp_reply(addr, false, ssp_type, 0);
                }
            }
            return;
        }

        let mut request_name = false;
        if let Some(device) = self.find_device_mut(addr, transport) {
            if transport == BtTransport::Bredr
                && !device.check_flag(DFLAG_NAME_SET | DFLAG_GET_RMT_NAME)
            {
                device.set_flags(DFLAG_GET_RMT_NAME);
                request_name = true;
            }
            device.set_bond_state(BondState::Bonding);
        }
        if request_name {
            self.sal.get_remote_name(addr);
        }

        self.callbacks.for_all_callbacks(|cb| cb.on_pair_display(addr, transport, ssp_type, passkey));
    }

    fn on_bond_state_changed(
        &mut self,
        addr: &RawAddress,
        state: BondState,
        transport: BtTransport,
        is_ctkd: bool,
    ) {
        match transport {
            BtTransport::Bredr => {
                let info = if state == BondState::Bonded {
                    self.sal.get_remote_device_info(addr)
                } else {
                    None
                };

                let device = self.find_create_classic_device(addr);
                device.set_bond_state(state);
                if state == BondState::Bonded {
                    if let Some(info) = info {
                        device.set_device_type(device_type_of(info.device_type));
                    }
                    let connected = device.is_connected();
                    self.update_bonded_devices();
                    if connected {
                        self.sal.start_service_discovery(addr, None);
                    }
                }
            }
            BtTransport::Le => {
                let device = self.find_create_le_device(addr, BleAddrType::Public);
                device.set_bond_state(state);
                match state {
                    BondState::Bonded => device.set_device_type(BtDeviceType::Ble),
                    BondState::None => device.delete_smp_key(),
                    _ => {}
                }
            }
        }

        self.callbacks.for_all_callbacks(|cb| cb.on_bond_state_changed(addr, transport, state, is_ctkd));
    }

    fn on_encryption_state_changed(
        &mut self,
        addr: &RawAddress,
        encrypted: bool,
        transport: BtTransport,
    ) {
        let state = match (encrypted, transport) {
            (true, BtTransport::Bredr) => ConnectionState::EncryptedBredr,
            (true, BtTransport::Le) => ConnectionState::EncryptedLe,
            (false, _) => ConnectionState::Connected,
        };

        match transport {
            BtTransport::Bredr => {
                self.find_create_classic_device(addr).set_connection_state(state);
            }
            BtTransport::Le => {
                if let Some(device) = self.find_device_mut(addr, BtTransport::Le) {
                    device.set_connection_state(state);
                }
            }
        }
    }

    fn on_link_key_update(&mut self, addr: &RawAddress, key: [u8; 16], key_type: LinkKeyType) {
        let device = self.find_create_classic_device(addr);
        device.set_link_key(key, key_type);
        self.update_bonded_devices();
        info!("adapter: link key stored for {} (type {:?})", addr, key_type);
    }

    fn on_link_key_removed(&mut self, addr: &RawAddress) {
        let device = self.find_create_classic_device(addr);
        device.delete_link_key();
        if device.bond_state() == BondState::Bonded {
            device.set_bond_state(BondState::None);
        }
        self.update_bonded_devices();
    }

    fn on_link_role_changed(&mut self, addr: &RawAddress, role: LinkRole) {
        debug!("adapter: link role at {} now {:?}", addr, role);

        let mut disable_policy = None;
        if let Some(device) = self.find_device_mut(addr, BtTransport::Bredr) {
            device.set_link_role(role);
            if cod_is_headset(device.class_of_device()) && role == LinkRole::Master {
                let policy = device.link_policy() & !LINK_POLICY_ENABLE_ROLE_SWITCH;
                disable_policy = Some(policy);
            }
        }

        if let Some(policy) = disable_policy {
            debug!("adapter: disabling role switch at {}", addr);
            self.sal.set_link_policy(addr, policy);
        }
    }

    fn on_whitelist_update(&mut self, addr: &RawAddress, is_added: bool, status: BtStatus) {
        debug!("adapter: whitelist update {} added {} status {:?}", addr, is_added, status);

        if self.find_device(addr, BtTransport::Le).is_none() {
            // Stray entry for a device the table no longer knows.
            self.sal.le_remove_white_list(addr, BleAddrType::Public);
            return;
        }

        let device = match self.find_device_mut(addr, BtTransport::Le) {
            Some(device) => device,
            None => return,
        };

        if device.check_flag(DFLAG_WHITELIST_ADDED) && is_added && status == BtStatus::Success {
            return;
        }

        if is_added && status == BtStatus::Success {
            device.set_flags(DFLAG_WHITELIST_ADDED);
        } else {
            device.clear_flags(DFLAG_WHITELIST_ADDED);
        }

        self.update_whitelist();
    }

    fn on_le_bonded_devices_update(&mut self, records: Vec<RemoteLeDeviceProperties>) {
        for record in records.iter() {
            let device = match self.find_device_mut(&record.addr, BtTransport::Le) {
                Some(device) => device,
                None => continue,
            };
            device.set_addr_type(record.addr_type);
            device.set_smp_key(record.smp_key);
        }

        self.storage.save_le_bonded_devices(&records);
    }

    /* ---------------- properties ---------------- */

    pub fn get_address(&self) -> RawAddress {
        self.properties.addr
    }

    pub fn get_name(&self) -> String {
        self.properties.name.clone()
    }

    pub fn set_name(&mut self, name: &str) -> BtStatus {
        if name.is_empty() || name.len() > BT_LOC_NAME_MAX_LEN {
            return BtStatus::ParmInvalid;
        }
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }
        if self.properties.name == name {
            return BtStatus::Success;
        }

        let status = self.sal.set_name(name);
        if status != BtStatus::Success {
            return status;
        }

        self.properties.name = name.into();
        self.save_properties();
        self.callbacks.for_all_callbacks(|cb| cb.on_device_name_changed(name));
        BtStatus::Success
    }

    pub fn get_scan_mode(&self) -> BtScanMode {
        self.properties.scan_mode
    }

    pub fn set_scan_mode(&mut self, mode: BtScanMode, bondable: bool) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }
        if self.properties.scan_mode == mode && self.properties.bondable == bondable {
            return BtStatus::Success;
        }

        let status = self.sal.set_scan_mode(mode, bondable);
        if status != BtStatus::Success {
            return status;
        }

        self.properties.scan_mode = mode;
        self.properties.bondable = bondable;
        BtStatus::Success
    }

    pub fn get_device_class(&self) -> u32 {
        self.properties.class_of_device
    }

    pub fn set_device_class(&mut self, cod: u32) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }
        if self.properties.class_of_device == cod {
            return BtStatus::Success;
        }

        let status = self.sal.set_device_class(cod);
        if status != BtStatus::Success {
            return status;
        }

        self.properties.class_of_device = cod;
        self.save_properties();
        BtStatus::Success
    }

    pub fn get_io_capability(&self) -> BtIoCapability {
        self.properties.io_capability
    }

    pub fn set_io_capability(&mut self, cap: BtIoCapability) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }
        if self.properties.io_capability == cap {
            return BtStatus::Success;
        }

        let status = self.sal.set_io_capability(cap);
        if status != BtStatus::Success {
            return status;
        }

        self.properties.io_capability = cap;
        self.save_properties();
        BtStatus::Success
    }

    pub fn set_inquiry_scan_parameters(
        &mut self,
        scan_type: BtScanType,
        interval: u16,
        window: u16,
    ) -> BtStatus {
        self.sal.set_inquiry_scan_parameters(scan_type, interval, window)
    }

    pub fn set_page_scan_parameters(
        &mut self,
        scan_type: BtScanType,
        interval: u16,
        window: u16,
    ) -> BtStatus {
        self.sal.set_page_scan_parameters(scan_type, interval, window)
    }

    pub fn set_afh_channel_classification(
        &mut self,
        central_frequency: u16,
        band_width: u16,
        number: u16,
    ) -> BtStatus {
        self.sal.set_afh_channel_classification(central_frequency, band_width, number)
    }

    pub fn get_le_address(&self) -> (RawAddress, BleAddrType) {
        (self.le_properties.addr, self.le_properties.addr_type)
    }

    pub fn set_le_address(&mut self, addr: &RawAddress) -> BtStatus {
        self.sal.le_set_address(addr)
    }

    pub fn set_le_identity_address(&mut self, addr: &RawAddress, public: bool) -> BtStatus {
        if public {
            self.sal.le_set_public_identity(addr)
        } else {
            self.sal.le_set_static_identity(addr)
        }
    }

    pub fn get_le_io_capability(&self) -> u32 {
        self.le_properties.le_io_capability
    }

    pub fn set_le_io_capability(&mut self, cap: u32) -> BtStatus {
        self.le_properties.le_io_capability = cap;
        self.sal.le_set_io_capability(cap)
    }

    pub fn get_le_appearance(&self) -> u16 {
        self.le_properties.le_appearance
    }

    pub fn set_le_appearance(&mut self, appearance: u16) -> BtStatus {
        let status = self.sal.le_set_appearance(appearance);
        if status == BtStatus::Success {
            self.le_properties.le_appearance = appearance;
        }
        status
    }

    /* ---------------- remote device queries ---------------- */

    pub fn get_bonded_devices(&self, transport: BtTransport) -> Vec<RawAddress> {
        let table = match transport {
            BtTransport::Bredr => &self.devices,
            BtTransport::Le => &self.le_devices,
        };
        table.values().filter(|d| d.is_bonded()).map(|d| *d.addr()).sorted().collect()
    }

    pub fn get_connected_devices(&self, transport: BtTransport) -> Vec<RawAddress> {
        let table = match transport {
            BtTransport::Bredr => &self.devices,
            BtTransport::Le => &self.le_devices,
        };
        table.values().filter(|d| d.is_connected()).map(|d| *d.addr()).sorted().collect()
    }

    pub fn is_remote_connected(&self, addr: &RawAddress, transport: BtTransport) -> bool {
        self.find_device(addr, transport).map(|d| d.is_connected()).unwrap_or(false)
    }

    pub fn is_remote_encrypted(&self, addr: &RawAddress, transport: BtTransport) -> bool {
        self.find_device(addr, transport).map(|d| d.is_encrypted()).unwrap_or(false)
    }

    pub fn is_remote_bonded(&self, addr: &RawAddress, transport: BtTransport) -> bool {
        self.find_device(addr, transport).map(|d| d.is_bonded()).unwrap_or(false)
    }

    pub fn get_remote_bond_state(&self, addr: &RawAddress, transport: BtTransport) -> BondState {
        self.find_device(addr, transport).map(|d| d.bond_state()).unwrap_or(BondState::None)
    }

    pub fn get_remote_name(&self, addr: &RawAddress) -> Option<String> {
        self.find_device(addr, BtTransport::Bredr).map(|d| d.name().to_string())
    }

    pub fn get_remote_alias(&self, addr: &RawAddress) -> Option<String> {
        self.find_device(addr, BtTransport::Bredr).map(|d| d.alias().to_string())
    }

    pub fn set_remote_alias(&mut self, addr: &RawAddress, alias: &str) -> BtStatus {
        let found = match self.find_device_mut(addr, BtTransport::Bredr) {
            Some(device) => {
                device.set_alias(alias);
                true
            }
            None => false,
        };
        if !found {
            return BtStatus::DeviceNotFound;
        }

        self.callbacks.for_all_callbacks(|cb| cb.on_remote_alias_changed(addr, alias));
        BtStatus::Success
    }

    pub fn get_remote_device_class(&self, addr: &RawAddress) -> u32 {
        self.find_device(addr, BtTransport::Bredr).map(|d| d.class_of_device()).unwrap_or(0)
    }

    pub fn get_remote_uuids(&self, addr: &RawAddress) -> Vec<Uuid> {
        self.find_device(addr, BtTransport::Bredr).map(|d| d.uuids().to_vec()).unwrap_or_default()
    }

    pub fn get_remote_rssi(&self, addr: &RawAddress) -> i8 {
        self.find_device(addr, BtTransport::Bredr).map(|d| d.rssi()).unwrap_or(0)
    }

    pub fn get_remote_appearance(&self, _addr: &RawAddress) -> u16 {
        0
    }

    pub fn get_remote_device_type(&self, addr: &RawAddress) -> BtDeviceType {
        let bredr = self.find_device(addr, BtTransport::Bredr).is_some();
        let le = self.find_device(addr, BtTransport::Le).is_some();
        match (bredr, le) {
            (true, true) => BtDeviceType::Dual,
            (true, false) => BtDeviceType::Bredr,
            (false, true) => BtDeviceType::Ble,
            (false, false) => BtDeviceType::Unknown,
        }
    }

    pub fn get_remote_identity_address(&self, addr: &RawAddress) -> Option<RawAddress> {
        self.find_device(addr, BtTransport::Le).and_then(|d| d.identity_addr().copied())
    }

    /* ---------------- discovery ---------------- */

    pub fn is_discovering(&self) -> bool {
        self.is_discovering
    }

    pub fn start_discovery(&mut self, timeout_ms: u32) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }
        if self.is_discovering {
            return BtStatus::Fail;
        }

        let status = self.sal.start_discovery(timeout_ms);
        if status != BtStatus::Success {
            return status;
        }

        self.is_discovering = true;
        status
    }

    pub fn cancel_discovery(&mut self) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }
        if !self.is_discovering {
            return BtStatus::Fail;
        }

        let status = self.sal.stop_discovery();
        self.is_discovering = false;
        status
    }

    /* ---------------- connection pipeline ---------------- */

    pub fn connect(&mut self, addr: &RawAddress) -> BtStatus {
        self.find_create_classic_device(addr);
        if self.sal.connect(addr) != BtStatus::Success {
            return BtStatus::Fail;
        }

        self.find_create_classic_device(addr)
            .set_connection_state(ConnectionState::Connecting);
        BtStatus::Success
    }

    pub fn disconnect(&mut self, addr: &RawAddress) -> BtStatus {
        let device = match self.find_device(addr, BtTransport::Bredr) {
            Some(device) => device,
            None => return BtStatus::DeviceNotFound,
        };

        if matches!(
            device.connection_state(),
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return BtStatus::Busy;
        }

        if self.sal.disconnect(addr, HCI_ERR_CONNECTION_TERMINATED_BY_LOCAL_HOST)
            != BtStatus::Success
        {
            return BtStatus::Fail;
        }

        if let Some(device) = self.find_device_mut(addr, BtTransport::Bredr) {
            device.set_connection_state(ConnectionState::Disconnecting);
        }
        BtStatus::Success
    }

    pub fn le_connect(
        &mut self,
        addr: &RawAddress,
        addr_type: BleAddrType,
        params: &BleConnectParams,
    ) -> BtStatus {
        self.find_create_le_device(addr, addr_type);
        if self.sal.le_connect(addr, addr_type, params) != BtStatus::Success {
            return BtStatus::Fail;
        }

        self.find_create_le_device(addr, addr_type)
            .set_connection_state(ConnectionState::Connecting);
        BtStatus::Success
    }

    pub fn le_disconnect(&mut self, addr: &RawAddress) -> BtStatus {
        let device = match self.find_device(addr, BtTransport::Le) {
            Some(device) => device,
            None => return BtStatus::DeviceNotFound,
        };

        if matches!(
            device.connection_state(),
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return BtStatus::Busy;
        }

        if self.sal.le_disconnect(addr) != BtStatus::Success {
            return BtStatus::Fail;
        }

        if let Some(device) = self.find_device_mut(addr, BtTransport::Le) {
            device.set_connection_state(ConnectionState::Disconnecting);
        }
        BtStatus::Success
    }

    pub fn connect_request_reply(&mut self, addr: &RawAddress, accept: bool) -> BtStatus {
        if self.find_device(addr, BtTransport::Bredr).is_none() {
            return BtStatus::DeviceNotFound;
        }

        let status = self.sal.acl_connection_reply(addr, accept);
        if status == BtStatus::Success && accept {
            if let Some(device) = self.find_device_mut(addr, BtTransport::Bredr) {
                device.set_connection_state(ConnectionState::Connecting);
            }
        }
        status
    }

    pub fn le_set_phy(&mut self, addr: &RawAddress, tx_phy: BlePhy, rx_phy: BlePhy) -> BtStatus {
        if self.find_device(addr, BtTransport::Le).is_none() {
            return BtStatus::DeviceNotFound;
        }
        self.sal.le_set_phy(addr, tx_phy, rx_phy)
    }

    pub fn le_enable_key_derivation(
        &mut self,
        brkey_to_lekey: bool,
        lekey_to_brkey: bool,
    ) -> BtStatus {
        self.sal.le_enable_key_derivation(brkey_to_lekey, lekey_to_brkey)
    }

    pub fn le_add_whitelist(&mut self, addr: &RawAddress) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }

        let device = self.find_create_le_device(addr, BleAddrType::Public);
        if device.check_flag(DFLAG_WHITELIST_ADDED) {
            return BtStatus::Success;
        }
        let addr_type = device.addr_type();

        self.sal.le_add_white_list(addr, addr_type)
    }

    pub fn le_remove_whitelist(&mut self, addr: &RawAddress) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }

        let device = match self.find_device(addr, BtTransport::Le) {
            Some(device) => device,
            None => return BtStatus::DeviceNotFound,
        };
        if !device.check_flag(DFLAG_WHITELIST_ADDED) {
            return BtStatus::Success;
        }
        let addr_type = device.addr_type();

        self.sal.le_remove_white_list(addr, addr_type)
    }

    /* ---------------- bonding pipeline ---------------- */

    pub fn create_bond(&mut self, addr: &RawAddress, transport: BtTransport) -> BtStatus {
        if self.adapter_state != AdapterState::On {
            return BtStatus::NotReady;
        }

        if self.is_discovering {
            self.sal.stop_discovery();
        }

        let addr_type = match transport {
            BtTransport::Bredr => {
                self.find_create_classic_device(addr);
                BleAddrType::Public
            }
            BtTransport::Le => match self.find_device(addr, BtTransport::Le) {
                Some(device) => device.addr_type(),
                None => return BtStatus::DeviceNotFound,
            },
        };

        if self.get_remote_bond_state(addr, transport) != BondState::None {
            return BtStatus::Fail;
        }

        match transport {
            BtTransport::Bredr => self.sal.create_bond(addr, transport),
            BtTransport::Le => self.sal.le_create_bond(addr, addr_type),
        }
    }

    pub fn remove_bond(&mut self, addr: &RawAddress, transport: BtTransport) -> BtStatus {
        let bonded = self
            .find_device(addr, transport)
            .map(|d| d.bond_state() == BondState::Bonded)
            .unwrap_or(false);
        if !bonded {
            return BtStatus::Fail;
        }

        if let Some(device) = self.find_device_mut(addr, transport) {
            device.set_bond_state(BondState::None);
            if transport == BtTransport::Bredr {
                device.delete_link_key();
            }
        }

        match transport {
            BtTransport::Bredr => {
                self.sal.remove_bond(addr, transport);
                self.update_bonded_devices();
            }
            BtTransport::Le => {
                self.sal.le_remove_bond(addr);
            }
        }

        BtStatus::Success
    }

    pub fn cancel_bond(&mut self, addr: &RawAddress) -> BtStatus {
        let bonding = self
            .find_device(addr, BtTransport::Bredr)
            .map(|d| d.bond_state() == BondState::Bonding)
            .unwrap_or(false);
        if !bonding {
            return BtStatus::Fail;
        }

        let status = self.sal.cancel_bond(addr);
        if status == BtStatus::Success {
            if let Some(device) = self.find_device_mut(addr, BtTransport::Bredr) {
                device.set_bond_state(BondState::Canceling);
            }
        }
        status
    }

    pub fn pair_request_reply(&mut self, addr: &RawAddress, accept: bool) -> BtStatus {
        if self.find_device(addr, BtTransport::Bredr).is_none() {
            return BtStatus::DeviceNotFound;
        }

        let status =
            self.sal.pair_reply(addr, if accept { 0 } else { HCI_ERR_PAIRING_NOT_ALLOWED });
        if status == BtStatus::Success && accept {
            self.callbacks.for_all_callbacks(|cb| {
                cb.on_bond_state_changed(addr, BtTransport::Bredr, BondState::Bonding, false)
            });
        }
        status
    }

    pub fn set_pin_code(&mut self, addr: &RawAddress, accept: bool, pincode: &[u8]) -> BtStatus {
        let bonding = self
            .find_device(addr, BtTransport::Bredr)
            .map(|d| d.bond_state() == BondState::Bonding)
            .unwrap_or(false);
        if !bonding {
            return BtStatus::Fail;
        }

        self.sal.pin_reply(addr, accept, pincode)
    }

    pub fn set_pairing_confirmation(
        &mut self,
        addr: &RawAddress,
        transport: BtTransport,
        accept: bool,
    ) -> BtStatus {
        if self.get_remote_bond_state(addr, transport) != BondState::Bonding {
            return BtStatus::Fail;
        }

        match transport {
            BtTransport::Bredr => {
                self.sal.ssp_reply(addr, accept, PairType::PasskeyConfirmation, 0)
            }
            BtTransport::Le => self.sal.le_smp_reply(addr, accept, PairType::PasskeyConfirmation, 0),
        }
    }

    pub fn set_pass_key(
        &mut self,
        addr: &RawAddress,
        transport: BtTransport,
        accept: bool,
        passkey: u32,
    ) -> BtStatus {
        if self.get_remote_bond_state(addr, transport) != BondState::Bonding {
            return BtStatus::Fail;
        }

        match transport {
            BtTransport::Bredr => self.sal.ssp_reply(addr, accept, PairType::PasskeyEntry, passkey),
            BtTransport::Le => self.sal.le_smp_reply(addr, accept, PairType::PasskeyEntry, passkey),
        }
    }

    pub fn le_set_legacy_tk(&mut self, addr: &RawAddress, tk_val: [u8; 16]) -> BtStatus {
        if self.find_device(addr, BtTransport::Le).is_none() {
            return BtStatus::DeviceNotFound;
        }
        self.sal.le_set_legacy_tk(addr, tk_val)
    }

    pub fn le_set_remote_oob_data(
        &mut self,
        addr: &RawAddress,
        c_val: [u8; 16],
        r_val: [u8; 16],
    ) -> BtStatus {
        if self.find_device(addr, BtTransport::Le).is_none() {
            return BtStatus::DeviceNotFound;
        }
        self.sal.le_set_remote_oob_data(addr, c_val, r_val)
    }

    pub fn le_get_local_oob_data(&mut self, addr: &RawAddress) -> BtStatus {
        if self.find_device(addr, BtTransport::Le).is_none() {
            return BtStatus::DeviceNotFound;
        }
        self.sal.le_get_local_oob_data(addr)
    }

    pub fn switch_role(&mut self, addr: &RawAddress, role: LinkRole) -> BtStatus {
        if role == LinkRole::Unknown {
            return BtStatus::ParmInvalid;
        }

        let current = match self.find_device(addr, BtTransport::Bredr) {
            Some(device) => device.link_role(),
            None => return BtStatus::DeviceNotFound,
        };

        if current == role {
            return BtStatus::Success;
        }
        self.sal.set_link_role(addr, role)
    }
}

fn link_key_type_of(raw: u32) -> LinkKeyType {
    num_traits::FromPrimitive::from_u32(raw).unwrap_or(LinkKeyType::Combination)
}

fn device_type_of(raw: u32) -> BtDeviceType {
    num_traits::FromPrimitive::from_u32(raw).unwrap_or(BtDeviceType::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeSal, SalCall};
    use crate::Stack;
    use bt_sal::adapter::RemoteDeviceProperties;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        State(AdapterState),
        PairRequest,
        PairDisplay(PairType),
        ConnectRequest(RawAddress),
        Connection(BtTransport, ConnectionState),
        Bond(BtTransport, BondState),
        NameChanged(String),
    }

    #[derive(Clone, Default)]
    struct RecordingCallback {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl RecordingCallback {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn states(&self) -> Vec<AdapterState> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::State(s) => Some(s),
                    _ => None,
                })
                .collect()
        }
    }

    impl RPCProxy for RecordingCallback {}

    impl IBluetoothCallback for RecordingCallback {
        fn on_adapter_state_changed(&mut self, state: AdapterState) {
            self.events.lock().unwrap().push(Event::State(state));
        }
        fn on_discovery_state_changed(&mut self, _state: BtDiscoveryState) {}
        fn on_discovery_result(&mut self, _result: &DiscoveryResult) {}
        fn on_scan_mode_changed(&mut self, _mode: BtScanMode) {}
        fn on_device_name_changed(&mut self, name: &str) {
            self.events.lock().unwrap().push(Event::NameChanged(name.into()));
        }
        fn on_pair_request(&mut self, _addr: &RawAddress) {
            self.events.lock().unwrap().push(Event::PairRequest);
        }
        fn on_pair_display(
            &mut self,
            _addr: &RawAddress,
            _transport: BtTransport,
            pair_type: PairType,
            _passkey: u32,
        ) {
            self.events.lock().unwrap().push(Event::PairDisplay(pair_type));
        }
        fn on_connect_request(&mut self, addr: &RawAddress, _cod: u32) {
            self.events.lock().unwrap().push(Event::ConnectRequest(*addr));
        }
        fn on_connection_state_changed(
            &mut self,
            _addr: &RawAddress,
            transport: BtTransport,
            state: ConnectionState,
        ) {
            self.events.lock().unwrap().push(Event::Connection(transport, state));
        }
        fn on_bond_state_changed(
            &mut self,
            _addr: &RawAddress,
            transport: BtTransport,
            state: BondState,
            _is_ctkd: bool,
        ) {
            self.events.lock().unwrap().push(Event::Bond(transport, state));
        }
        fn on_remote_name_changed(&mut self, _addr: &RawAddress, _name: &str) {}
        fn on_remote_alias_changed(&mut self, _addr: &RawAddress, _alias: &str) {}
        fn on_remote_uuids_changed(&mut self, _addr: &RawAddress, _uuids: &[Uuid]) {}
        fn on_le_sc_local_oob_data_got(
            &mut self,
            _addr: &RawAddress,
            _c: [u8; 16],
            _r: [u8; 16],
        ) {
        }
    }

    fn addr() -> RawAddress {
        RawAddress::from([0xaa, 0xbb, 0xcc, 0x11, 0x22, 0x33])
    }

    fn test_config(tag: &str) -> Config {
        let dir = std::env::temp_dir().join(format!("btadapter_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Config { storage_path: dir.to_string_lossy().into_owned(), ..Default::default() }
    }

    fn new_bluetooth(config: Config, sal: Arc<FakeSal>) -> (Bluetooth, RecordingCallback) {
        let (tx, _rx) = Stack::create_channel();
        let mut bluetooth = Bluetooth::new(config, sal, tx);
        let callback = RecordingCallback::default();
        bluetooth.register_callback(Box::new(callback.clone())).unwrap();
        (bluetooth, callback)
    }

    fn bring_up(bluetooth: &mut Bluetooth) {
        bluetooth.enable(SysSetOpt::All);
        bluetooth.dispatch_sal_event(AdapterCallbacks::StackStateChanged(StackState::BleOn));
        bluetooth.step_state_machine(FsmEvent::BleProfileEnabled);
        bluetooth.dispatch_sal_event(AdapterCallbacks::StackStateChanged(StackState::BredrOn));
        bluetooth.step_state_machine(FsmEvent::BredrProfileEnabled);
    }

    fn connect_peer(bluetooth: &mut Bluetooth, peer: RawAddress) {
        bluetooth.dispatch_sal_event(AdapterCallbacks::ConnectionStateChanged(AclStateParams {
            addr: peer,
            transport: BtTransport::Bredr,
            addr_type: BleAddrType::Public,
            connection_state: ConnectionState::Connected,
            status: BtStatus::Success,
            hci_reason_code: 0,
        }));
    }

    #[tokio::test]
    async fn test_full_enable_state_sequence() {
        let sal = Arc::new(FakeSal::new());
        let config = test_config("enable");

        // Seed one bonded record per transport so the loads are visible.
        let storage = Storage::new(config.storage_path.clone());
        storage.save_bonded_devices(&[RemoteDeviceProperties {
            addr: addr(),
            name: "headset".into(),
            link_key: [1; 16],
            ..Default::default()
        }]);
        let mut le_record = RemoteLeDeviceProperties::default();
        le_record.addr = RawAddress::from([1, 1, 1, 1, 1, 1]);
        storage.save_le_bonded_devices(&[le_record]);

        let (mut bluetooth, callback) = new_bluetooth(config, sal.clone());
        bring_up(&mut bluetooth);

        assert_eq!(
            callback.states(),
            vec![
                AdapterState::BleTurningOn,
                AdapterState::BleOn,
                AdapterState::TurningOn,
                AdapterState::On,
            ]
        );
        assert_eq!(bluetooth.get_state(), AdapterState::On);

        let calls = sal.calls();
        assert!(calls.contains(&SalCall::LeEnable));
        assert!(calls.contains(&SalCall::Enable));
        assert!(calls.contains(&SalCall::LeGetAddress));
        assert_eq!(sal.calls_of(|c| matches!(c, SalCall::LeSetBondedDevices(1))).len(), 1);
        assert_eq!(sal.calls_of(|c| matches!(c, SalCall::SetBondedDevices(1))).len(), 1);
        // Identity pushed down once BR/EDR is up.
        assert!(calls.iter().any(|c| matches!(c, SalCall::SetName(_))));
        assert!(calls.iter().any(|c| matches!(c, SalCall::SetScanMode(..))));
        assert!(calls.iter().any(|c| matches!(c, SalCall::SetDeviceClass(_))));

        // The bonded peer came back from storage.
        assert!(bluetooth.is_remote_bonded(&addr(), BtTransport::Bredr));
    }

    #[tokio::test]
    async fn test_disable_clears_connected_devices() {
        let sal = Arc::new(FakeSal::new());
        let (mut bluetooth, callback) = new_bluetooth(test_config("disable"), sal.clone());
        bring_up(&mut bluetooth);
        connect_peer(&mut bluetooth, addr());

        bluetooth.disable(SysSetOpt::All);
        bluetooth.step_state_machine(FsmEvent::BredrProfileDisabled);
        bluetooth.dispatch_sal_event(AdapterCallbacks::StackStateChanged(StackState::BredrOff));
        bluetooth.step_state_machine(FsmEvent::BleProfileDisabled);
        bluetooth.dispatch_sal_event(AdapterCallbacks::StackStateChanged(StackState::BleOff));

        assert_eq!(bluetooth.get_state(), AdapterState::Off);
        assert!(sal.calls().contains(&SalCall::Disable));
        assert!(sal.calls().contains(&SalCall::LeDisable));
        // The still-connected peer got a synthesised disconnect.
        assert!(callback
            .events()
            .contains(&Event::Connection(BtTransport::Bredr, ConnectionState::Disconnected)));
    }

    #[tokio::test]
    async fn test_bonding_pipeline_reaches_bonded_once() {
        let sal = Arc::new(FakeSal::new());
        let (mut bluetooth, callback) = new_bluetooth(test_config("bond"), sal.clone());
        bring_up(&mut bluetooth);

        assert_eq!(bluetooth.create_bond(&addr(), BtTransport::Bredr), BtStatus::Success);
        assert!(sal.calls().contains(&SalCall::CreateBond(addr(), BtTransport::Bredr)));

        bluetooth.dispatch_sal_event(AdapterCallbacks::PairRequest(addr(), true, true));
        assert!(callback.events().contains(&Event::PairRequest));
        bluetooth.dispatch_sal_event(AdapterCallbacks::SspRequest(
            addr(),
            BtTransport::Bredr,
            0,
            PairType::PasskeyConfirmation,
            123456,
            None,
        ));

        // Mid-bonding retries are refused.
        assert_eq!(bluetooth.create_bond(&addr(), BtTransport::Bredr), BtStatus::Fail);

        bluetooth.dispatch_sal_event(AdapterCallbacks::LinkKeyUpdate(
            addr(),
            [7; 16],
            LinkKeyType::AuthenticatedP256,
        ));
        bluetooth.dispatch_sal_event(AdapterCallbacks::BondStateChanged(
            addr(),
            BondState::Bonded,
            BtTransport::Bredr,
            BtStatus::Success,
            false,
        ));

        assert!(bluetooth.is_remote_bonded(&addr(), BtTransport::Bredr));
        assert_eq!(bluetooth.get_bonded_devices(BtTransport::Bredr), vec![addr()]);
        let bonded_events: Vec<Event> = callback
            .events()
            .into_iter()
            .filter(|e| matches!(e, Event::Bond(BtTransport::Bredr, BondState::Bonded)))
            .collect();
        assert_eq!(bonded_events.len(), 1);

        // And once more: already bonded, no second run.
        assert_eq!(bluetooth.create_bond(&addr(), BtTransport::Bredr), BtStatus::Fail);

        // remove_bond drops the key, the state, and the stored record.
        assert_eq!(bluetooth.remove_bond(&addr(), BtTransport::Bredr), BtStatus::Success);
        assert!(sal.calls().contains(&SalCall::RemoveBond(addr(), BtTransport::Bredr)));
        assert!(!bluetooth.is_remote_bonded(&addr(), BtTransport::Bredr));
        assert!(Storage::new(bluetooth.config.storage_path.clone())
            .load_bonded_devices()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancel_bond_auto_rejects_requests() {
        let sal = Arc::new(FakeSal::new());
        let (mut bluetooth, _callback) = new_bluetooth(test_config("cancel"), sal.clone());
        bring_up(&mut bluetooth);

        bluetooth.create_bond(&addr(), BtTransport::Bredr);
        // Cancelling outside Bonding is refused.
        assert_eq!(bluetooth.cancel_bond(&addr()), BtStatus::Fail);

        bluetooth.dispatch_sal_event(AdapterCallbacks::PinRequest(addr(), 0, false, None));
        assert_eq!(
            bluetooth.get_remote_bond_state(&addr(), BtTransport::Bredr),
            BondState::Bonding
        );

        assert_eq!(bluetooth.cancel_bond(&addr()), BtStatus::Success);
        assert!(sal.calls().contains(&SalCall::CancelBond(addr())));

        // The next pin request is rejected without involving the app.
        sal.clear_calls();
        bluetooth.dispatch_sal_event(AdapterCallbacks::PinRequest(addr(), 0, false, None));
        assert!(sal.calls().contains(&SalCall::PinReply(addr(), false)));
    }

    #[tokio::test]
    async fn test_non_bondable_adapter_rejects_pairing() {
        let sal = Arc::new(FakeSal::new());
        let config = test_config("nobond");
        let storage = Storage::new(config.storage_path.clone());
        let mut info = crate::storage::AdapterStorage::default();
        info.bondable = false;
        storage.save_adapter_info(&info);

        let (mut bluetooth, callback) = new_bluetooth(config, sal.clone());
        bring_up(&mut bluetooth);

        bluetooth.dispatch_sal_event(AdapterCallbacks::PairRequest(addr(), false, true));
        assert!(sal.calls().contains(&SalCall::PairReply(addr(), HCI_ERR_PAIRING_NOT_ALLOWED)));
        assert!(!callback.events().contains(&Event::PairRequest));
    }

    #[tokio::test]
    async fn test_connect_request_admission_cap() {
        let sal = Arc::new(FakeSal::new());
        let mut config = test_config("cap");
        config.max_acl_connections = 1;
        let (mut bluetooth, callback) = new_bluetooth(config, sal.clone());
        bring_up(&mut bluetooth);

        let first = RawAddress::from([1, 0, 0, 0, 0, 1]);
        let second = RawAddress::from([2, 0, 0, 0, 0, 2]);

        bluetooth.dispatch_sal_event(AdapterCallbacks::ConnectRequest(first, 0x240404));
        assert!(callback.events().contains(&Event::ConnectRequest(first)));
        connect_peer(&mut bluetooth, first);

        bluetooth.dispatch_sal_event(AdapterCallbacks::ConnectRequest(second, 0x240404));
        assert!(sal.calls().contains(&SalCall::AclConnectionReply(second, false)));
        assert!(!callback.events().contains(&Event::ConnectRequest(second)));
    }

    #[tokio::test]
    async fn test_discovery_gating_and_results() {
        let sal = Arc::new(FakeSal::new());
        let (mut bluetooth, _callback) = new_bluetooth(test_config("disc"), sal.clone());

        // Not enabled yet.
        assert_eq!(bluetooth.start_discovery(10_000), BtStatus::NotReady);

        bring_up(&mut bluetooth);
        assert_eq!(bluetooth.start_discovery(10_000), BtStatus::Success);
        assert!(bluetooth.is_discovering());
        assert_eq!(bluetooth.start_discovery(10_000), BtStatus::Fail);

        // A result while discovering materialises a device record.
        bluetooth.dispatch_sal_event(AdapterCallbacks::DeviceFound(DiscoveryResult {
            addr: addr(),
            name: "found".into(),
            class_of_device: 0x5a020c,
            rssi: -60,
        }));
        assert_eq!(bluetooth.get_remote_name(&addr()).as_deref(), Some("found"));

        assert_eq!(bluetooth.cancel_discovery(), BtStatus::Success);
        assert!(!bluetooth.is_discovering());
        assert_eq!(bluetooth.cancel_discovery(), BtStatus::Fail);

        // create_bond cancels a running discovery first.
        bluetooth.start_discovery(10_000);
        sal.clear_calls();
        bluetooth.create_bond(&addr(), BtTransport::Bredr);
        assert!(sal.calls().contains(&SalCall::StopDiscovery));
    }

    #[tokio::test]
    async fn test_set_name_commits_and_notifies() {
        let sal = Arc::new(FakeSal::new());
        let (mut bluetooth, callback) = new_bluetooth(test_config("name"), sal.clone());

        assert_eq!(bluetooth.set_name("desk"), BtStatus::NotReady);

        bring_up(&mut bluetooth);
        assert_eq!(bluetooth.set_name("desk"), BtStatus::Success);
        assert_eq!(bluetooth.get_name(), "desk");
        assert!(callback.events().contains(&Event::NameChanged("desk".into())));

        // A failing SAL call leaves the property untouched.
        sal.set_return("set_name", BtStatus::Fail);
        assert_eq!(bluetooth.set_name("shelf"), BtStatus::Fail);
        assert_eq!(bluetooth.get_name(), "desk");
    }

    #[tokio::test]
    async fn test_role_change_disables_role_switch_for_headsets() {
        let sal = Arc::new(FakeSal::new());
        let (mut bluetooth, _callback) = new_bluetooth(test_config("role"), sal.clone());
        bring_up(&mut bluetooth);

        bluetooth.dispatch_sal_event(AdapterCallbacks::ConnectRequest(addr(), 0x240404));
        connect_peer(&mut bluetooth, addr());

        bluetooth.dispatch_sal_event(AdapterCallbacks::LinkRoleChanged(addr(), LinkRole::Master));
        let policies = sal.calls_of(|c| matches!(c, SalCall::SetLinkPolicy(..)));
        assert_eq!(policies.len(), 1);
        match policies[0] {
            SalCall::SetLinkPolicy(_, policy) => {
                assert_eq!(policy & LINK_POLICY_ENABLE_ROLE_SWITCH, 0)
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_whitelist_persistence() {
        let sal = Arc::new(FakeSal::new());
        let (mut bluetooth, _callback) = new_bluetooth(test_config("wl"), sal.clone());
        bring_up(&mut bluetooth);

        let peer = RawAddress::from([3, 3, 3, 3, 3, 3]);
        assert_eq!(bluetooth.le_add_whitelist(&peer), BtStatus::Success);
        assert!(sal.calls().contains(&SalCall::LeAddWhiteList(peer)));

        bluetooth.dispatch_sal_event(AdapterCallbacks::WhitelistUpdate(peer, true, BtStatus::Success));
        assert_eq!(
            Storage::new(bluetooth.config.storage_path.clone()).load_whitelist().len(),
            1
        );

        assert_eq!(bluetooth.le_remove_whitelist(&peer), BtStatus::Success);
        bluetooth.dispatch_sal_event(AdapterCallbacks::WhitelistUpdate(peer, false, BtStatus::Success));
        assert!(Storage::new(bluetooth.config.storage_path.clone()).load_whitelist().is_empty());
    }
}
