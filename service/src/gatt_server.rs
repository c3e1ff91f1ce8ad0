//! GATT server manager.
//!
//! Each registered service gets a 0x0100-aligned id; attribute handles are
//! namespaced as `service_id | local_handle` so the stack-side handle space
//! never collides between services, and application callbacks see the local
//! handle recovered with `element_id ^ service_id`. Elements marked
//! auto-response own a value buffer the manager answers from without
//! involving the application.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};

use bt_sal::gatt::{GattAttrType, GattElement, GattServerCallbacks, GattServerSal};
use bt_sal::types::{BleAddrType, BlePhy, BtStatus, GattStatus, ProfileConnectionState, RawAddress, Uuid};

const GATT_ELEMENT_GROUP_STEP: u16 = 0x0100;
const GATT_ELEMENT_GROUP_MAX: u16 = 0xff00;

/// Opaque token for one registered server service.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct GattsHandle(u16);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GattRspType {
    AutoRsp,
    AppRsp,
}

pub type GattReadCb = Box<dyn FnMut(&RawAddress, u16, u32) + Send>;
pub type GattWriteCb = Box<dyn FnMut(&RawAddress, u16, &[u8], u16) + Send>;

/// One attribute row as the application declares it; handles are local to
/// the table (0x00..=0xff).
pub struct GattAttrDb {
    pub handle: u16,
    pub uuid: Uuid,
    pub attr_type: GattAttrType,
    pub properties: u16,
    pub permissions: u16,
    pub rsp_type: GattRspType,
    pub read_cb: Option<GattReadCb>,
    pub write_cb: Option<GattWriteCb>,
    pub attr_length: u16,
    pub attr_value: Vec<u8>,
}

pub struct GattServiceDb {
    pub attr_db: Vec<GattAttrDb>,
}

pub trait IGattServerCallback: Send {
    fn on_connected(&mut self, addr: &RawAddress);
    fn on_disconnected(&mut self, addr: &RawAddress);
    fn on_attr_table_added(&mut self, status: GattStatus, attr_handle: u16);
    fn on_attr_table_removed(&mut self, status: GattStatus, attr_handle: u16);
    fn on_mtu_changed(&mut self, addr: &RawAddress, mtu: u32);
    fn on_notify_complete(&mut self, addr: &RawAddress, status: GattStatus, attr_handle: u16);
    fn on_phy_read(&mut self, addr: &RawAddress, tx_phy: BlePhy, rx_phy: BlePhy);
    fn on_phy_updated(&mut self, addr: &RawAddress, status: GattStatus, tx_phy: BlePhy, rx_phy: BlePhy);
    fn on_conn_param_changed(&mut self, addr: &RawAddress, interval: u16, latency: u16, timeout: u16);
}

struct ServerElement {
    element: GattElement,
    rsp_type: GattRspType,
    read_cb: Option<GattReadCb>,
    write_cb: Option<GattWriteCb>,
    attr_length: u16,
    attr_data: Option<Vec<u8>>,
}

struct AttributeTable {
    start_handle: u16,
    end_handle: u16,
    elements: Vec<ServerElement>,
}

struct GattsService {
    srv_id: u16,
    callbacks: Box<dyn IGattServerCallback>,
    tables: Vec<AttributeTable>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum GattsRequest {
    ReadPhy(u16),
    UpdatePhy(u16),
}

pub struct GattServerManager {
    started: bool,
    services: Vec<GattsService>,
    pend_ops: VecDeque<GattsRequest>,
    sal: Arc<dyn GattServerSal>,
}

fn group_id(element_id: u16) -> u16 {
    element_id & GATT_ELEMENT_GROUP_MAX
}

impl GattServerManager {
    pub fn new(sal: Arc<dyn GattServerSal>) -> Self {
        GattServerManager {
            started: false,
            services: Vec::new(),
            pend_ops: VecDeque::new(),
            sal,
        }
    }

    pub fn startup(&mut self) -> bool {
        if self.started {
            return true;
        }

        if self.sal.enable() != BtStatus::Success {
            return false;
        }
        self.started = true;
        true
    }

    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }

        self.services.clear();
        self.pend_ops.clear();
        self.started = false;
        self.sal.disable();
    }

    fn service(&self, handle: GattsHandle) -> Option<&GattsService> {
        self.services.iter().find(|s| s.srv_id == handle.0)
    }

    fn service_mut(&mut self, handle: GattsHandle) -> Option<&mut GattsService> {
        self.services.iter_mut().find(|s| s.srv_id == handle.0)
    }

    fn service_by_element_mut(&mut self, element_id: u16) -> Option<&mut GattsService> {
        let srv_id = group_id(element_id);
        self.services.iter_mut().find(|s| s.srv_id == srv_id)
    }

    fn generate_service_id(&self) -> Option<u16> {
        let mut id = GATT_ELEMENT_GROUP_STEP;
        while id < GATT_ELEMENT_GROUP_MAX {
            if !self.services.iter().any(|s| s.srv_id == id) {
                return Some(id);
            }
            id += GATT_ELEMENT_GROUP_STEP;
        }

        warn!("gatts: service id space exhausted");
        None
    }

    pub fn register_service(
        &mut self,
        callbacks: Box<dyn IGattServerCallback>,
    ) -> Result<GattsHandle, BtStatus> {
        if !self.started {
            return Err(BtStatus::NotReady);
        }

        let srv_id = self.generate_service_id().ok_or(BtStatus::NoMem)?;
        self.services.push(GattsService { srv_id, callbacks, tables: Vec::new() });

        Ok(GattsHandle(srv_id))
    }

    pub fn unregister_service(&mut self, handle: GattsHandle) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }

        let position = match self.services.iter().position(|s| s.srv_id == handle.0) {
            Some(position) => position,
            None => return BtStatus::ParmInvalid,
        };

        let service = self.services.remove(position);
        for table in service.tables.iter() {
            self.sal.remove_elements(table.start_handle, table.elements.len() as u16);
        }

        BtStatus::Success
    }

    pub fn connect(&mut self, handle: GattsHandle, addr: &RawAddress, addr_type: BleAddrType) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        if self.service(handle).is_none() {
            return BtStatus::ParmInvalid;
        }

        debug!("gatts: connect request to {}", addr);
        self.sal.connect(addr, addr_type)
    }

    pub fn disconnect(&mut self, handle: GattsHandle, addr: &RawAddress) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        if self.service(handle).is_none() {
            return BtStatus::ParmInvalid;
        }

        debug!("gatts: disconnect request to {}", addr);
        self.sal.cancel_connection(addr)
    }

    pub fn add_attr_table(&mut self, handle: GattsHandle, srv_db: GattServiceDb) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let srv_id = handle.0;
        let service = match self.service_mut(handle) {
            Some(service) => service,
            None => return BtStatus::ParmInvalid,
        };

        let first = match srv_db.attr_db.first() {
            Some(row) => row.handle,
            None => return BtStatus::ParmInvalid,
        };
        if find_table(&service.tables, srv_id + first).is_some() {
            return BtStatus::ParmInvalid;
        }

        let mut elements = Vec::with_capacity(srv_db.attr_db.len());
        for row in srv_db.attr_db.into_iter() {
            // Local handles are confined to the low byte of the group.
            if row.handle > 0x00ff {
                return BtStatus::ParmInvalid;
            }

            let attr_data = if row.rsp_type == GattRspType::AutoRsp && row.attr_length > 0 {
                let mut data = row.attr_value;
                data.resize(row.attr_length as usize, 0);
                Some(data)
            } else {
                None
            };

            elements.push(ServerElement {
                element: GattElement {
                    handle: srv_id + row.handle,
                    uuid: row.uuid,
                    attr_type: row.attr_type,
                    properties: row.properties,
                    permissions: row.permissions,
                },
                rsp_type: row.rsp_type,
                read_cb: row.read_cb,
                write_cb: row.write_cb,
                attr_length: row.attr_length,
                attr_data,
            });
        }

        let start_handle = elements.first().map(|e| e.element.handle).unwrap_or(0);
        let end_handle = elements.last().map(|e| e.element.handle).unwrap_or(0);
        let wire: Vec<GattElement> = elements.iter().map(|e| e.element.clone()).collect();

        let status = sal.add_elements(&wire);
        if status != BtStatus::Success {
            return status;
        }

        service.tables.push(AttributeTable { start_handle, end_handle, elements });
        BtStatus::Success
    }

    pub fn remove_attr_table(&mut self, handle: GattsHandle, attr_handle: u16) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let sal = self.sal.clone();
        let srv_id = handle.0;
        let service = match self.service_mut(handle) {
            Some(service) => service,
            None => return BtStatus::ParmInvalid,
        };

        match find_table(&service.tables, srv_id + attr_handle) {
            Some(table) => sal.remove_elements(table.start_handle, table.elements.len() as u16),
            None => BtStatus::ParmInvalid,
        }
    }

    pub fn set_attr_value(
        &mut self,
        handle: GattsHandle,
        attr_handle: u16,
        value: &[u8],
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let srv_id = handle.0;
        let service = match self.service_mut(handle) {
            Some(service) => service,
            None => return BtStatus::ParmInvalid,
        };

        let element = match find_element_mut(&mut service.tables, srv_id + attr_handle) {
            Some(element) => element,
            None => return BtStatus::ParmInvalid,
        };

        match element.attr_data.as_mut() {
            Some(data) => {
                let length = usize::from(element.attr_length).min(value.len());
                data[..length].copy_from_slice(&value[..length]);
                BtStatus::Success
            }
            None => BtStatus::NotFound,
        }
    }

    pub fn get_attr_value(
        &self,
        handle: GattsHandle,
        attr_handle: u16,
    ) -> Result<Vec<u8>, BtStatus> {
        if !self.started {
            return Err(BtStatus::NotReady);
        }
        let service = self.service(handle).ok_or(BtStatus::ParmInvalid)?;

        let element =
            find_element(&service.tables, handle.0 + attr_handle).ok_or(BtStatus::ParmInvalid)?;
        element.attr_data.clone().ok_or(BtStatus::NotFound)
    }

    pub fn response(
        &mut self,
        handle: GattsHandle,
        addr: &RawAddress,
        req_handle: u32,
        value: &[u8],
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        if self.service(handle).is_none() {
            return BtStatus::ParmInvalid;
        }

        self.sal.send_response(addr, req_handle, value)
    }

    pub fn notify(
        &mut self,
        handle: GattsHandle,
        addr: &RawAddress,
        attr_handle: u16,
        value: &[u8],
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        if self.service(handle).is_none() {
            return BtStatus::ParmInvalid;
        }

        self.sal.send_notification(addr, handle.0 + attr_handle, value)
    }

    pub fn indicate(
        &mut self,
        handle: GattsHandle,
        addr: &RawAddress,
        attr_handle: u16,
        value: &[u8],
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        if self.service(handle).is_none() {
            return BtStatus::ParmInvalid;
        }

        self.sal.send_indication(addr, handle.0 + attr_handle, value)
    }

    pub fn read_phy(&mut self, handle: GattsHandle, addr: &RawAddress) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        if self.service(handle).is_none() {
            return BtStatus::ParmInvalid;
        }

        let status = self.sal.read_phy(addr);
        if status == BtStatus::Success {
            self.pend_ops.push_back(GattsRequest::ReadPhy(handle.0));
        }
        status
    }

    pub fn update_phy(
        &mut self,
        handle: GattsHandle,
        addr: &RawAddress,
        tx_phy: BlePhy,
        rx_phy: BlePhy,
    ) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        if self.service(handle).is_none() {
            return BtStatus::ParmInvalid;
        }

        let status = self.sal.set_phy(addr, tx_phy, rx_phy);
        if status == BtStatus::Success {
            self.pend_ops.push_back(GattsRequest::UpdatePhy(handle.0));
        }
        status
    }

    /// Stack event entry point; runs on the dispatch loop.
    pub fn dispatch_sal_event(&mut self, event: GattServerCallbacks) {
        if !self.started {
            return;
        }

        match event {
            GattServerCallbacks::ConnectionStateChanged(addr, state) => {
                match state {
                    ProfileConnectionState::Connected => {
                        for service in self.services.iter_mut() {
                            service.callbacks.on_connected(&addr);
                        }
                    }
                    ProfileConnectionState::Disconnected => {
                        for service in self.services.iter_mut() {
                            service.callbacks.on_disconnected(&addr);
                        }
                    }
                    _ => {}
                }
            }
            GattServerCallbacks::ElementsAdded(status, element_id, _size) => {
                if let Some(service) = self.service_by_element_mut(element_id) {
                    let local = element_id ^ service.srv_id;
                    service.callbacks.on_attr_table_added(status, local);
                }
            }
            GattServerCallbacks::ElementsRemoved(status, element_id, _size) => {
                if let Some(service) = self.service_by_element_mut(element_id) {
                    let srv_id = service.srv_id;
                    service
                        .tables
                        .retain(|t| !(element_id >= t.start_handle && element_id <= t.end_handle));
                    service.callbacks.on_attr_table_removed(status, element_id ^ srv_id);
                }
            }
            GattServerCallbacks::ReadRequest(addr, request_id, element_id) => {
                self.on_read_request(&addr, request_id, element_id)
            }
            GattServerCallbacks::WriteRequest(addr, request_id, element_id, value, offset) => {
                self.on_write_request(&addr, request_id, element_id, &value, offset)
            }
            GattServerCallbacks::MtuChanged(addr, mtu) => {
                for service in self.services.iter_mut() {
                    service.callbacks.on_mtu_changed(&addr, mtu);
                }
            }
            GattServerCallbacks::NotificationSent(addr, element_id, status) => {
                if let Some(service) = self.service_by_element_mut(element_id) {
                    let local = element_id ^ service.srv_id;
                    service.callbacks.on_notify_complete(&addr, status, local);
                }
            }
            GattServerCallbacks::PhyRead(addr, tx_phy, rx_phy) => {
                if let Some(GattsRequest::ReadPhy(srv_id)) =
                    pop_request(&mut self.pend_ops, |r| matches!(r, GattsRequest::ReadPhy(_)))
                {
                    if let Some(service) = self.service_mut(GattsHandle(srv_id)) {
                        service.callbacks.on_phy_read(&addr, tx_phy, rx_phy);
                    }
                }
            }
            GattServerCallbacks::PhyUpdated(addr, tx_phy, rx_phy, status) => {
                if status == GattStatus::Success {
                    for service in self.services.iter_mut() {
                        service.callbacks.on_phy_updated(&addr, status, tx_phy, rx_phy);
                    }
                } else if let Some(GattsRequest::UpdatePhy(srv_id)) =
                    pop_request(&mut self.pend_ops, |r| matches!(r, GattsRequest::UpdatePhy(_)))
                {
                    if let Some(service) = self.service_mut(GattsHandle(srv_id)) {
                        service.callbacks.on_phy_updated(&addr, status, tx_phy, rx_phy);
                    }
                }
            }
            GattServerCallbacks::ConnectionParameterChanged(addr, interval, latency, timeout) => {
                for service in self.services.iter_mut() {
                    service.callbacks.on_conn_param_changed(&addr, interval, latency, timeout);
                }
            }
        }
    }

    fn on_read_request(&mut self, addr: &RawAddress, request_id: u32, element_id: u16) {
        let sal = self.sal.clone();
        let service = match self.service_by_element_mut(element_id) {
            Some(service) => service,
            None => return,
        };
        let srv_id = service.srv_id;

        let element = match find_element_mut(&mut service.tables, element_id) {
            Some(element) => element,
            None => return,
        };

        if element.rsp_type == GattRspType::AutoRsp {
            let data = element.attr_data.clone().unwrap_or_default();
            sal.send_response(addr, request_id, &data);
        } else if let Some(read_cb) = element.read_cb.as_mut() {
            read_cb(addr, element_id ^ srv_id, request_id);
        }
    }

    fn on_write_request(
        &mut self,
        addr: &RawAddress,
        request_id: u32,
        element_id: u16,
        value: &[u8],
        offset: u16,
    ) {
        let sal = self.sal.clone();
        let service = match self.service_by_element_mut(element_id) {
            Some(service) => service,
            None => return,
        };
        let srv_id = service.srv_id;

        let element = match find_element_mut(&mut service.tables, element_id) {
            Some(element) => element,
            None => return,
        };

        // The write is acknowledged before the application sees it.
        sal.send_response(addr, request_id, &[]);

        if element.rsp_type == GattRspType::AutoRsp {
            if let Some(data) = element.attr_data.as_mut() {
                let length = usize::from(element.attr_length).min(value.len());
                data[..length].copy_from_slice(&value[..length]);
            }
        } else if let Some(write_cb) = element.write_cb.as_mut() {
            write_cb(addr, element_id ^ srv_id, value, offset);
        }
    }
}

fn find_table(tables: &[AttributeTable], element_id: u16) -> Option<&AttributeTable> {
    tables.iter().find(|t| element_id >= t.start_handle && element_id <= t.end_handle)
}

fn find_element<'a>(tables: &'a [AttributeTable], element_id: u16) -> Option<&'a ServerElement> {
    tables
        .iter()
        .find(|t| element_id >= t.start_handle && element_id <= t.end_handle)?
        .elements
        .iter()
        .find(|e| e.element.handle == element_id)
}

fn find_element_mut<'a>(
    tables: &'a mut [AttributeTable],
    element_id: u16,
) -> Option<&'a mut ServerElement> {
    tables
        .iter_mut()
        .find(|t| element_id >= t.start_handle && element_id <= t.end_handle)?
        .elements
        .iter_mut()
        .find(|e| e.element.handle == element_id)
}

fn pop_request(
    pend_ops: &mut VecDeque<GattsRequest>,
    matcher: impl Fn(&GattsRequest) -> bool,
) -> Option<GattsRequest> {
    let position = pend_ops.iter().position(matcher)?;
    pend_ops.remove(position)
}
