//! GATT client manager.
//!
//! Connections live in a fixed slot table; the slot id is the opaque
//! handle applications hold. Each connection caches the remote attribute
//! database as discovery reports it and keeps the subscribe state that
//! gates notification delivery.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};

use bt_sal::gatt::{
    GattAttrType, GattClientCallbacks, GattClientSal, GattElement, GattWriteType, GATT_CCC_INDICATE,
    GATT_CCC_NOTIFY, GATT_MAX_MTU_SIZE, GATT_PROP_INDICATE, GATT_PROP_NOTIFY,
};
use bt_sal::types::{
    BleAddrType, BlePhy, BtStatus, GattStatus, ProfileConnectionState, RawAddress, Uuid,
};

use crate::index_allocator::IndexAllocator;

/// Opaque token for one client connection slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GattcHandle(u32);

/// Read-only attribute view handed back from cache lookups.
#[derive(Debug, Clone)]
pub struct GattAttrDesc {
    pub handle: u16,
    pub uuid: Uuid,
    pub attr_type: GattAttrType,
    pub properties: u16,
}

pub trait IGattClientCallback: Send {
    fn on_connected(&mut self, addr: &RawAddress);
    fn on_disconnected(&mut self, addr: &RawAddress);
    fn on_discovered(&mut self, status: GattStatus, uuid: Option<Uuid>, start_handle: u16, end_handle: u16);
    fn on_read(&mut self, status: GattStatus, attr_handle: u16, value: &[u8]);
    fn on_written(&mut self, status: GattStatus, attr_handle: u16);
    fn on_subscribed(&mut self, status: GattStatus, attr_handle: u16, enable: bool);
    fn on_notified(&mut self, attr_handle: u16, value: &[u8]);
    fn on_mtu_updated(&mut self, status: GattStatus, mtu: u32);
    fn on_phy_read(&mut self, tx_phy: BlePhy, rx_phy: BlePhy);
    fn on_phy_updated(&mut self, status: GattStatus, tx_phy: BlePhy, rx_phy: BlePhy);
    fn on_rssi_read(&mut self, status: GattStatus, rssi: i32);
    fn on_conn_param_updated(&mut self, status: BtStatus, interval: u16, latency: u16, timeout: u16);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum GattcRequest {
    Read(u16),
    Write(u16),
    Subscribe(u16),
    ExchangeMtu,
    ReadPhy,
    UpdatePhy,
    ReadRssi,
}

struct CachedElement {
    element: GattElement,
    notify_enable: bool,
}

struct CachedService {
    uuid: Uuid,
    start_handle: u16,
    end_handle: u16,
    elements: Vec<CachedElement>,
}

struct GattcConnection {
    state: ProfileConnectionState,
    remote_addr: RawAddress,
    callbacks: Box<dyn IGattClientCallback>,
    services: Vec<CachedService>,
    pend_ops: VecDeque<GattcRequest>,
}

pub struct GattClientManager {
    started: bool,
    allocator: IndexAllocator,
    connections: Vec<Option<GattcConnection>>,
    sal: Arc<dyn GattClientSal>,
}

impl GattClientManager {
    pub fn new(sal: Arc<dyn GattClientSal>, max_connections: u32) -> Self {
        let mut connections = Vec::new();
        connections.resize_with(max_connections as usize, || None);

        GattClientManager {
            started: false,
            allocator: IndexAllocator::new(max_connections.saturating_sub(1)),
            connections,
            sal,
        }
    }

    pub fn startup(&mut self) -> bool {
        if self.started {
            return true;
        }

        self.started = true;
        true
    }

    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }

        for slot in 0..self.connections.len() {
            if self.connections[slot].is_some() {
                let _ = self.delete_connect(GattcHandle(slot as u32));
            }
        }
        self.started = false;
    }

    fn connection(&self, handle: GattcHandle) -> Option<&GattcConnection> {
        self.connections.get(handle.0 as usize).and_then(|c| c.as_ref())
    }

    fn connection_mut(&mut self, handle: GattcHandle) -> Option<&mut GattcConnection> {
        self.connections.get_mut(handle.0 as usize).and_then(|c| c.as_mut())
    }

    fn connection_by_addr_mut(&mut self, addr: &RawAddress) -> Option<&mut GattcConnection> {
        self.connections
            .iter_mut()
            .filter_map(|c| c.as_mut())
            .find(|c| c.remote_addr == *addr)
    }

    pub fn create_connect(
        &mut self,
        callbacks: Box<dyn IGattClientCallback>,
    ) -> Result<GattcHandle, BtStatus> {
        if !self.started {
            return Err(BtStatus::NotReady);
        }

        let slot = match self.allocator.alloc() {
            Some(slot) => slot,
            None => {
                warn!("gattc: connection table full");
                return Err(BtStatus::NoMem);
            }
        };

        self.connections[slot as usize] = Some(GattcConnection {
            state: ProfileConnectionState::Disconnected,
            remote_addr: RawAddress::EMPTY,
            callbacks,
            services: Vec::new(),
            pend_ops: VecDeque::new(),
        });

        Ok(GattcHandle(slot))
    }

    pub fn delete_connect(&mut self, handle: GattcHandle) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }

        let connection = match self.connections.get_mut(handle.0 as usize).and_then(|c| c.take()) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        if matches!(
            connection.state,
            ProfileConnectionState::Connecting | ProfileConnectionState::Connected
        ) {
            self.sal.disconnect(&connection.remote_addr);
        }
        self.allocator.free(handle.0);

        BtStatus::Success
    }

    pub fn connect(
        &mut self,
        handle: GattcHandle,
        addr: &RawAddress,
        addr_type: BleAddrType,
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        debug!("gattc: connect request to {}", addr);
        let status = sal.connect(addr, addr_type);
        if status == BtStatus::Success {
            connection.state = ProfileConnectionState::Connecting;
            connection.remote_addr = *addr;
        }

        status
    }

    pub fn disconnect(&mut self, handle: GattcHandle) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let status = sal.disconnect(&connection.remote_addr);
        if status == BtStatus::Success {
            connection.state = ProfileConnectionState::Disconnecting;
        }

        status
    }

    pub fn discover_service(&mut self, handle: GattcHandle, filter_uuid: Option<&Uuid>) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let connection = match self.connection(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        match filter_uuid {
            None => self.sal.discover_all_services(&connection.remote_addr),
            Some(uuid) => self.sal.discover_service_by_uuid(&connection.remote_addr, uuid),
        }
    }

    pub fn get_attribute_by_handle(
        &self,
        handle: GattcHandle,
        attr_handle: u16,
    ) -> Result<GattAttrDesc, BtStatus> {
        if !self.started {
            return Err(BtStatus::NotReady);
        }
        let connection = self.connection(handle).ok_or(BtStatus::ParmInvalid)?;

        find_element(&connection.services, attr_handle)
            .map(describe)
            .ok_or(BtStatus::NoResources)
    }

    pub fn get_attribute_by_uuid(
        &self,
        handle: GattcHandle,
        start_handle: u16,
        end_handle: u16,
        uuid: &Uuid,
    ) -> Result<GattAttrDesc, BtStatus> {
        if !self.started {
            return Err(BtStatus::NotReady);
        }
        let connection = self.connection(handle).ok_or(BtStatus::ParmInvalid)?;

        connection
            .services
            .iter()
            .filter(|s| s.end_handle >= start_handle && s.start_handle <= end_handle)
            .flat_map(|s| s.elements.iter())
            .find(|e| {
                e.element.handle >= start_handle
                    && e.element.handle <= end_handle
                    && e.element.uuid == *uuid
            })
            .map(describe)
            .ok_or(BtStatus::NoResources)
    }

    pub fn read(&mut self, handle: GattcHandle, attr_handle: u16) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let status = sal.read_element(&connection.remote_addr, attr_handle);
        if status == BtStatus::Success {
            connection.pend_ops.push_back(GattcRequest::Read(attr_handle));
        }
        status
    }

    pub fn write(
        &mut self,
        handle: GattcHandle,
        attr_handle: u16,
        value: &[u8],
    ) -> BtStatus {
        self.write_internal(handle, attr_handle, value, GattWriteType::Rsp)
    }

    pub fn write_without_response(
        &mut self,
        handle: GattcHandle,
        attr_handle: u16,
        value: &[u8],
    ) -> BtStatus {
        self.write_internal(handle, attr_handle, value, GattWriteType::NoRsp)
    }

    fn write_internal(
        &mut self,
        handle: GattcHandle,
        attr_handle: u16,
        value: &[u8],
        write_type: GattWriteType,
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let status = sal.write_element(&connection.remote_addr, attr_handle, value, write_type);
        if status == BtStatus::Success && write_type == GattWriteType::Rsp {
            connection.pend_ops.push_back(GattcRequest::Write(attr_handle));
        }
        status
    }

    pub fn subscribe(&mut self, handle: GattcHandle, attr_handle: u16, ccc_value: u16) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let element = match find_element(&connection.services, attr_handle) {
            Some(element) => element,
            None => return BtStatus::NotFound,
        };

        let properties = if ccc_value & GATT_CCC_NOTIFY != 0 {
            if element.element.properties & GATT_PROP_NOTIFY == 0 {
                return BtStatus::Unsupported;
            }
            GATT_PROP_NOTIFY
        } else if ccc_value & GATT_CCC_INDICATE != 0 {
            if element.element.properties & GATT_PROP_INDICATE == 0 {
                return BtStatus::Unsupported;
            }
            GATT_PROP_INDICATE
        } else {
            return BtStatus::ParmInvalid;
        };

        let status =
            sal.register_notifications(&connection.remote_addr, attr_handle, properties, true);
        if status == BtStatus::Success {
            connection.pend_ops.push_back(GattcRequest::Subscribe(attr_handle));
        }
        status
    }

    pub fn unsubscribe(&mut self, handle: GattcHandle, attr_handle: u16) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let element = match find_element(&connection.services, attr_handle) {
            Some(element) => element,
            None => return BtStatus::NotFound,
        };

        if element.element.properties & (GATT_PROP_NOTIFY | GATT_PROP_INDICATE) == 0 {
            return BtStatus::Unsupported;
        }

        let properties = element.element.properties;
        let status =
            sal.register_notifications(&connection.remote_addr, attr_handle, properties, false);
        if status == BtStatus::Success {
            connection.pend_ops.push_back(GattcRequest::Subscribe(attr_handle));
        }
        status
    }

    pub fn exchange_mtu(&mut self, handle: GattcHandle, mtu: u32) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let mtu = mtu.min(GATT_MAX_MTU_SIZE);
        let status = sal.send_mtu_req(&connection.remote_addr, mtu);
        if status == BtStatus::Success {
            connection.pend_ops.push_back(GattcRequest::ExchangeMtu);
        }
        status
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_connection_parameter(
        &mut self,
        handle: GattcHandle,
        min_interval: u32,
        max_interval: u32,
        latency: u32,
        timeout: u32,
        min_ce_length: u32,
        max_ce_length: u32,
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let connection = match self.connection(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        self.sal.update_connection_parameter(
            &connection.remote_addr,
            min_interval,
            max_interval,
            latency,
            timeout,
            min_ce_length,
            max_ce_length,
        )
    }

    pub fn read_phy(&mut self, handle: GattcHandle) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let status = sal.read_phy(&connection.remote_addr);
        if status == BtStatus::Success {
            connection.pend_ops.push_back(GattcRequest::ReadPhy);
        }
        status
    }

    pub fn update_phy(&mut self, handle: GattcHandle, tx_phy: BlePhy, rx_phy: BlePhy) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let status = sal.set_phy(&connection.remote_addr, tx_phy, rx_phy);
        if status == BtStatus::Success {
            connection.pend_ops.push_back(GattcRequest::UpdatePhy);
        }
        status
    }

    pub fn read_rssi(&mut self, handle: GattcHandle) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let connection = match self.connection_mut(handle) {
            Some(connection) => connection,
            None => return BtStatus::ParmInvalid,
        };

        let status = sal.read_remote_rssi(&connection.remote_addr);
        if status == BtStatus::Success {
            connection.pend_ops.push_back(GattcRequest::ReadRssi);
        }
        status
    }

    /// Stack event entry point; runs on the dispatch loop.
    pub fn dispatch_sal_event(&mut self, event: GattClientCallbacks) {
        if !self.started {
            return;
        }

        match event {
            GattClientCallbacks::ConnectionStateChanged(addr, state) => {
                self.on_connection_state_changed(&addr, state)
            }
            GattClientCallbacks::ServiceDiscovered(addr, elements) => {
                self.on_service_discovered(&addr, elements)
            }
            GattClientCallbacks::DiscoverComplete(addr, status) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    connection.callbacks.on_discovered(status, None, 0, 0);
                }
            }
            GattClientCallbacks::ElementRead(addr, attr_handle, value, status) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    pop_request(&mut connection.pend_ops, GattcRequest::Read(attr_handle));
                    connection.callbacks.on_read(status, attr_handle, &value);
                }
            }
            GattClientCallbacks::ElementWritten(addr, attr_handle, status) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    pop_request(&mut connection.pend_ops, GattcRequest::Write(attr_handle));
                    connection.callbacks.on_written(status, attr_handle);
                }
            }
            GattClientCallbacks::ElementSubscribed(addr, attr_handle, status, enable) => {
                self.on_element_subscribed(&addr, attr_handle, status, enable)
            }
            GattClientCallbacks::ElementChanged(addr, attr_handle, value) => {
                self.on_element_changed(&addr, attr_handle, &value)
            }
            GattClientCallbacks::MtuChanged(addr, mtu, status) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    pop_request(&mut connection.pend_ops, GattcRequest::ExchangeMtu);
                    connection.callbacks.on_mtu_updated(status, mtu);
                }
            }
            GattClientCallbacks::PhyRead(addr, tx_phy, rx_phy) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    pop_request(&mut connection.pend_ops, GattcRequest::ReadPhy);
                    connection.callbacks.on_phy_read(tx_phy, rx_phy);
                }
            }
            GattClientCallbacks::PhyUpdated(addr, tx_phy, rx_phy, status) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    pop_request(&mut connection.pend_ops, GattcRequest::UpdatePhy);
                    connection.callbacks.on_phy_updated(status, tx_phy, rx_phy);
                }
            }
            GattClientCallbacks::RssiRead(addr, rssi, status) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    pop_request(&mut connection.pend_ops, GattcRequest::ReadRssi);
                    connection.callbacks.on_rssi_read(status, rssi);
                }
            }
            GattClientCallbacks::ConnectionParameterUpdated(addr, interval, latency, timeout, status) => {
                if let Some(connection) = self.connection_by_addr_mut(&addr) {
                    connection.callbacks.on_conn_param_updated(status, interval, latency, timeout);
                }
            }
        }
    }

    fn on_connection_state_changed(&mut self, addr: &RawAddress, state: ProfileConnectionState) {
        let connection = match self.connection_by_addr_mut(addr) {
            Some(connection) => connection,
            None => {
                warn!("gattc: connection event for unknown {}", addr);
                return;
            }
        };

        debug!("gattc: {} connection state {:?}", addr, state);
        match state {
            ProfileConnectionState::Connected => {
                connection.state = state;
                connection.callbacks.on_connected(addr);
            }
            ProfileConnectionState::Disconnected => {
                connection.state = state;
                connection.callbacks.on_disconnected(addr);
                connection.remote_addr = RawAddress::EMPTY;
                connection.services.clear();
                connection.pend_ops.clear();
            }
            _ => {}
        }
    }

    fn on_service_discovered(&mut self, addr: &RawAddress, elements: Vec<GattElement>) {
        let connection = match self.connection_by_addr_mut(addr) {
            Some(connection) => connection,
            None => return,
        };
        let (first, last) = match (elements.first(), elements.last()) {
            (Some(first), Some(last)) => (first.handle, last.handle),
            _ => return,
        };

        // Re-discovery of a cached range replaces the old entry.
        connection
            .services
            .retain(|s| !(first >= s.start_handle && first <= s.end_handle));

        let service = CachedService {
            uuid: elements[0].uuid,
            start_handle: first,
            end_handle: last,
            elements: elements
                .into_iter()
                .map(|element| CachedElement { element, notify_enable: false })
                .collect(),
        };
        let (uuid, start, end) = (service.uuid, service.start_handle, service.end_handle);
        connection.services.push(service);

        connection.callbacks.on_discovered(GattStatus::Success, Some(uuid), start, end);
    }

    fn on_element_subscribed(
        &mut self,
        addr: &RawAddress,
        attr_handle: u16,
        status: GattStatus,
        enable: bool,
    ) {
        let connection = match self.connection_by_addr_mut(addr) {
            Some(connection) => connection,
            None => return,
        };
        pop_request(&mut connection.pend_ops, GattcRequest::Subscribe(attr_handle));

        match find_element_mut(&mut connection.services, attr_handle) {
            Some(element) => {
                if status == GattStatus::Success {
                    element.notify_enable = enable;
                }
                connection.callbacks.on_subscribed(status, attr_handle, enable);
            }
            None => {
                warn!("gattc: subscribe event with unknown element 0x{:04x}", attr_handle);
            }
        }
    }

    fn on_element_changed(&mut self, addr: &RawAddress, attr_handle: u16, value: &[u8]) {
        let connection = match self.connection_by_addr_mut(addr) {
            Some(connection) => connection,
            None => return,
        };

        let deliver = find_element(&connection.services, attr_handle)
            .map(|e| e.notify_enable)
            .unwrap_or(false);
        if deliver {
            connection.callbacks.on_notified(attr_handle, value);
        }
    }
}

fn find_element(services: &[CachedService], attr_handle: u16) -> Option<&CachedElement> {
    services
        .iter()
        .find(|s| attr_handle >= s.start_handle && attr_handle <= s.end_handle)?
        .elements
        .iter()
        .find(|e| e.element.handle == attr_handle)
}

fn find_element_mut(services: &mut [CachedService], attr_handle: u16) -> Option<&mut CachedElement> {
    services
        .iter_mut()
        .find(|s| attr_handle >= s.start_handle && attr_handle <= s.end_handle)?
        .elements
        .iter_mut()
        .find(|e| e.element.handle == attr_handle)
}

fn describe(element: &CachedElement) -> GattAttrDesc {
    GattAttrDesc {
        handle: element.element.handle,
        uuid: element.element.uuid,
        attr_type: element.element.attr_type,
        properties: element.element.properties,
    }
}

fn pop_request(pend_ops: &mut VecDeque<GattcRequest>, request: GattcRequest) {
    if let Some(position) = pend_ops.iter().position(|r| *r == request) {
        pend_ops.remove(position);
    }
}
