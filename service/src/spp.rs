//! Serial Port Profile service, the template for BR/EDR profile managers.
//!
//! Ports are identified by their RFCOMM server channel (1..=28). A
//! connected port is bridged to a pseudo terminal: the application talks to
//! the slave side as a plain serial device while the framework pumps the
//! master side into the dispatch loop and forwards stack data back onto
//! it.

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::Arc;

use log::{debug, error, warn};
use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::unistd::{close, read, write};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

use bt_sal::spp::{SppCallbacks, SppSal};
use bt_sal::types::{BtStatus, ProfileConnectionState, RawAddress, Uuid};

use crate::index_allocator::IndexAllocator;
use crate::power_manager::{PmActions, PmState};
use crate::uuid::Profile;
use crate::Message;

pub const SPP_SCN_MIN: u8 = 1;
pub const SPP_SCN_MAX: u8 = 28;

/// Opaque token for one SPP port slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SppHandle(u32);

pub trait ISppCallback: Send {
    fn on_connection_state_changed(
        &mut self,
        addr: &RawAddress,
        scn: u8,
        state: ProfileConnectionState,
    );
    /// Reports the slave path of the PTY bridge once the port connects.
    fn on_pty_opened(&mut self, addr: &RawAddress, scn: u8, pty_path: &str);
}

pub enum SppActions {
    StartServer { scn: u8, uuid: Uuid, callbacks: Box<dyn ISppCallback> },
    StopServer(SppHandle),
    Connect { addr: RawAddress, scn: u8, uuid: Uuid, callbacks: Box<dyn ISppCallback> },
    Disconnect(SppHandle),
    /// Application bytes read off the PTY master by the pump task.
    PtyData(SppHandle, Vec<u8>),
    PtyClosed(SppHandle),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PortRole {
    Server,
    Client,
}

struct MasterFd(RawFd);

impl AsRawFd for MasterFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct PtyBridge {
    master_fd: RawFd,
    /// Keeps the slave end alive so the master never reports hangup while
    /// the application reopens its side.
    keeper_fd: RawFd,
    slave_path: String,
    pump: Option<JoinHandle<()>>,
}

impl PtyBridge {
    fn open() -> nix::Result<PtyBridge> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK)?;
        grantpt(&master)?;
        unlockpt(&master)?;
        let slave_path = ptsname_r(&master)?;
        let keeper_fd = open(
            slave_path.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY,
            Mode::empty(),
        )?;

        Ok(PtyBridge {
            master_fd: master.into_raw_fd(),
            keeper_fd,
            slave_path,
            pump: None,
        })
    }

    /// Pump task: master-side readability becomes loop messages until the
    /// port tears the bridge down.
    fn spawn_pump(&mut self, tx: Sender<Message>, handle: SppHandle) {
        let fd = self.master_fd;
        self.pump = Some(tokio::spawn(async move {
            let afd = match AsyncFd::new(MasterFd(fd)) {
                Ok(afd) => afd,
                Err(e) => {
                    error!("spp: pty watch failed: {}", e);
                    return;
                }
            };

            let mut buf = [0u8; 1024];
            loop {
                let mut guard = match afd.readable().await {
                    Ok(guard) => guard,
                    Err(_) => break,
                };

                match read(fd, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = buf[..n].to_vec();
                        if tx.send(Message::SppActions(SppActions::PtyData(handle, data))).await.is_err() {
                            return;
                        }
                    }
                    Err(nix::errno::Errno::EAGAIN) => {
                        guard.clear_ready();
                    }
                    Err(_) => break,
                }
            }

            let _ = tx.send(Message::SppActions(SppActions::PtyClosed(handle))).await;
        }));
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        let _ = close(self.master_fd);
        let _ = close(self.keeper_fd);
    }
}

struct SppPort {
    scn: u8,
    role: PortRole,
    state: ProfileConnectionState,
    addr: Option<RawAddress>,
    callbacks: Box<dyn ISppCallback>,
    pty: Option<PtyBridge>,
}

pub struct SppManager {
    started: bool,
    allocator: IndexAllocator,
    ports: HashMap<u32, SppPort>,
    sal: Arc<dyn SppSal>,
    tx: Sender<Message>,
}

impl SppManager {
    pub fn new(sal: Arc<dyn SppSal>, tx: Sender<Message>) -> Self {
        SppManager {
            started: false,
            allocator: IndexAllocator::new(u32::from(SPP_SCN_MAX) - 1),
            ports: HashMap::new(),
            sal,
            tx,
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

        let handles: Vec<u32> = self.ports.keys().cloned().collect();
        for id in handles {
            self.teardown_port(SppHandle(id), true);
        }
        self.started = false;
    }

    pub fn handle_actions(&mut self, action: SppActions) {
        match action {
            SppActions::StartServer { scn, uuid, callbacks } => {
                let _ = self.start_server(scn, &uuid, callbacks);
            }
            SppActions::StopServer(handle) => {
                self.stop_server(handle);
            }
            SppActions::Connect { addr, scn, uuid, callbacks } => {
                let _ = self.connect(&addr, scn, &uuid, callbacks);
            }
            SppActions::Disconnect(handle) => {
                self.disconnect(handle);
            }
            SppActions::PtyData(handle, data) => self.on_pty_data(handle, &data),
            SppActions::PtyClosed(handle) => self.on_pty_closed(handle),
        }
    }

    fn port_by_scn_mut(&mut self, scn: u8) -> Option<(SppHandle, &mut SppPort)> {
        self.ports
            .iter_mut()
            .find(|(_, p)| p.scn == scn)
            .map(|(id, p)| (SppHandle(*id), p))
    }

    pub fn start_server(
        &mut self,
        scn: u8,
        uuid: &Uuid,
        callbacks: Box<dyn ISppCallback>,
    ) -> Result<SppHandle, BtStatus> {
        if !self.started {
            return Err(BtStatus::NotReady);
        }
        if !(SPP_SCN_MIN..=SPP_SCN_MAX).contains(&scn) {
            return Err(BtStatus::ParmInvalid);
        }
        if self.ports.values().any(|p| p.scn == scn) {
            return Err(BtStatus::Busy);
        }

        let status = self.sal.listen(scn, uuid);
        if status != BtStatus::Success {
            return Err(status);
        }

        let id = self.allocator.alloc().ok_or(BtStatus::NoMem)?;
        self.ports.insert(
            id,
            SppPort {
                scn,
                role: PortRole::Server,
                state: ProfileConnectionState::Disconnected,
                addr: None,
                callbacks,
                pty: None,
            },
        );

        Ok(SppHandle(id))
    }

    pub fn stop_server(&mut self, handle: SppHandle) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let scn = match self.ports.get(&handle.0) {
            Some(port) if port.role == PortRole::Server => port.scn,
            _ => return BtStatus::ParmInvalid,
        };

        self.sal.unlisten(scn);
        self.teardown_port(handle, true);
        BtStatus::Success
    }

    pub fn connect(
        &mut self,
        addr: &RawAddress,
        scn: u8,
        uuid: &Uuid,
        callbacks: Box<dyn ISppCallback>,
    ) -> Result<SppHandle, BtStatus> {
        if !self.started {
            return Err(BtStatus::NotReady);
        }
        if !(SPP_SCN_MIN..=SPP_SCN_MAX).contains(&scn) {
            return Err(BtStatus::ParmInvalid);
        }

        let status = self.sal.connect(addr, scn, uuid);
        if status != BtStatus::Success {
            return Err(status);
        }

        let id = self.allocator.alloc().ok_or(BtStatus::NoMem)?;
        self.ports.insert(
            id,
            SppPort {
                scn,
                role: PortRole::Client,
                state: ProfileConnectionState::Connecting,
                addr: Some(*addr),
                callbacks,
                pty: None,
            },
        );

        Ok(SppHandle(id))
    }

    pub fn disconnect(&mut self, handle: SppHandle) -> BtStatus {
        if !self.started {
            return BtStatus::NotReady;
        }
        let port = match self.ports.get_mut(&handle.0) {
            Some(port) => port,
            None => return BtStatus::ParmInvalid,
        };
        let addr = match port.addr {
            Some(addr) => addr,
            None => return BtStatus::Fail,
        };

        let status = self.sal.disconnect(&addr, port.scn);
        if status == BtStatus::Success {
            port.state = ProfileConnectionState::Disconnecting;
        }
        status
    }

    /// Stack event entry point; runs on the dispatch loop.
    pub fn dispatch_sal_event(&mut self, event: SppCallbacks) {
        if !self.started {
            return;
        }

        match event {
            SppCallbacks::ConnectionStateChanged(addr, scn, state) => {
                self.on_connection_state_changed(&addr, scn, state)
            }
            SppCallbacks::DataReceived(addr, scn, data) => self.on_data_received(&addr, scn, &data),
            SppCallbacks::WriteReady(_, scn, writable) => {
                debug!("spp: scn {} writable {}", scn, writable);
            }
        }
    }

    fn on_connection_state_changed(
        &mut self,
        addr: &RawAddress,
        scn: u8,
        state: ProfileConnectionState,
    ) {
        let tx = self.tx.clone();
        let (handle, port) = match self.port_by_scn_mut(scn) {
            Some(found) => found,
            None => {
                warn!("spp: event for unknown scn {}", scn);
                return;
            }
        };

        debug!("spp: {} scn {} state {:?}", addr, scn, state);
        port.state = state;
        match state {
            ProfileConnectionState::Connected => {
                port.addr = Some(*addr);
                port.callbacks.on_connection_state_changed(addr, scn, state);

                match PtyBridge::open() {
                    Ok(mut bridge) => {
                        bridge.spawn_pump(tx.clone(), handle);
                        port.callbacks.on_pty_opened(addr, scn, &bridge.slave_path);
                        port.pty = Some(bridge);
                    }
                    Err(e) => error!("spp: pty setup failed for scn {}: {}", scn, e),
                }

                self.notify_pm(addr, PmState::ConnOpen);
            }
            ProfileConnectionState::Disconnected => {
                port.pty = None;
                port.callbacks.on_connection_state_changed(addr, scn, state);

                let server = port.role == PortRole::Server;
                if !server {
                    self.teardown_port(handle, false);
                }
                self.notify_pm(addr, PmState::ConnClose);
            }
            _ => {}
        }
    }

    fn on_data_received(&mut self, addr: &RawAddress, scn: u8, data: &[u8]) {
        let port = match self.port_by_scn_mut(scn) {
            Some((_, port)) => port,
            None => return,
        };

        if port.state != ProfileConnectionState::Connected || port.addr != Some(*addr) {
            return;
        }

        if let Some(bridge) = port.pty.as_ref() {
            if let Err(e) = write_all(bridge.master_fd, data) {
                error!("spp: pty write failed on scn {}: {}", scn, e);
            }
        }
    }

    fn on_pty_data(&mut self, handle: SppHandle, data: &[u8]) {
        let sal = self.sal.clone();
        let port = match self.ports.get(&handle.0) {
            Some(port) => port,
            None => return,
        };

        if port.state != ProfileConnectionState::Connected {
            return;
        }
        if let Some(addr) = port.addr {
            sal.write(&addr, port.scn, data);
        }
    }

    fn on_pty_closed(&mut self, handle: SppHandle) {
        // The application hung up its side of the bridge.
        if let Some(port) = self.ports.get_mut(&handle.0) {
            if port.state == ProfileConnectionState::Connected {
                if let Some(addr) = port.addr {
                    self.sal.disconnect(&addr, port.scn);
                    port.state = ProfileConnectionState::Disconnecting;
                }
            }
        }
    }

    /// Frees a port slot, synthesising the final disconnect the app would
    /// otherwise miss.
    fn teardown_port(&mut self, handle: SppHandle, notify: bool) {
        let mut port = match self.ports.remove(&handle.0) {
            Some(port) => port,
            None => return,
        };

        if notify && port.state == ProfileConnectionState::Connected {
            if let Some(addr) = port.addr {
                self.sal.disconnect(&addr, port.scn);
                port.callbacks.on_connection_state_changed(
                    &addr,
                    port.scn,
                    ProfileConnectionState::Disconnected,
                );
                self.notify_pm(&addr, PmState::ConnClose);
            }
        }

        port.pty = None;
        self.allocator.free(handle.0);
    }

    fn notify_pm(&self, addr: &RawAddress, state: PmState) {
        let tx = self.tx.clone();
        let addr = *addr;
        tokio::spawn(async move {
            let _ = tx
                .send(Message::PmActions(PmActions::ProfileStateChanged(Profile::Spp, addr, state)))
                .await;
        });
    }
}

fn write_all(fd: RawFd, mut data: &[u8]) -> nix::Result<()> {
    while !data.is_empty() {
        let written = write(fd, data)?;
        data = &data[written..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeSal, SalCall};
    use crate::Stack;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        State(u8, ProfileConnectionState),
        Pty(u8, String),
    }

    #[derive(Clone, Default)]
    struct RecordingCallback {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl RecordingCallback {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ISppCallback for RecordingCallback {
        fn on_connection_state_changed(
            &mut self,
            _addr: &RawAddress,
            scn: u8,
            state: ProfileConnectionState,
        ) {
            self.events.lock().unwrap().push(Event::State(scn, state));
        }

        fn on_pty_opened(&mut self, _addr: &RawAddress, scn: u8, pty_path: &str) {
            self.events.lock().unwrap().push(Event::Pty(scn, pty_path.into()));
        }
    }

    fn addr() -> RawAddress {
        RawAddress::from([2, 2, 3, 3, 4, 4])
    }

    fn started_manager(sal: Arc<FakeSal>) -> SppManager {
        let (tx, _rx) = Stack::create_channel();
        let mut manager = SppManager::new(sal, tx);
        manager.startup();
        manager
    }

    #[tokio::test]
    async fn test_server_lifecycle_and_scn_validation() {
        let sal = Arc::new(FakeSal::new());
        let mut manager = started_manager(sal.clone());
        let cb = RecordingCallback::default();

        assert_eq!(
            manager.start_server(0, &Uuid::from_u16(0x1101), Box::new(cb.clone())).unwrap_err(),
            BtStatus::ParmInvalid
        );
        assert_eq!(
            manager.start_server(29, &Uuid::from_u16(0x1101), Box::new(cb.clone())).unwrap_err(),
            BtStatus::ParmInvalid
        );

        let handle = manager.start_server(3, &Uuid::from_u16(0x1101), Box::new(cb.clone())).unwrap();
        assert!(sal.calls().contains(&SalCall::SppListen(3)));

        // A second listener on the same channel is refused.
        assert_eq!(
            manager.start_server(3, &Uuid::from_u16(0x1101), Box::new(cb.clone())).unwrap_err(),
            BtStatus::Busy
        );

        assert_eq!(manager.stop_server(handle), BtStatus::Success);
        assert!(sal.calls().contains(&SalCall::SppUnlisten(3)));

        // The channel is free again.
        manager.start_server(3, &Uuid::from_u16(0x1101), Box::new(cb)).unwrap();
    }

    #[tokio::test]
    async fn test_connection_opens_pty_bridge() {
        let sal = Arc::new(FakeSal::new());
        let mut manager = started_manager(sal.clone());
        let cb = RecordingCallback::default();

        let handle = manager
            .connect(&addr(), 5, &Uuid::from_u16(0x1101), Box::new(cb.clone()))
            .unwrap();
        assert!(sal.calls().contains(&SalCall::SppConnect(addr(), 5)));

        manager.dispatch_sal_event(SppCallbacks::ConnectionStateChanged(
            addr(),
            5,
            ProfileConnectionState::Connected,
        ));

        let events = cb.events();
        assert_eq!(events[0], Event::State(5, ProfileConnectionState::Connected));
        let pty_path = match &events[1] {
            Event::Pty(5, path) => path.clone(),
            other => panic!("unexpected event {:?}", other),
        };
        assert!(pty_path.starts_with("/dev/pts/"));

        // Stack data lands on the master side for the app to read.
        manager.dispatch_sal_event(SppCallbacks::DataReceived(addr(), 5, b"ping".to_vec()));

        // App data pumped off the PTY goes to the stack.
        manager.handle_actions(SppActions::PtyData(handle, b"pong".to_vec()));
        assert!(sal.calls().contains(&SalCall::SppWrite(addr(), 5, b"pong".to_vec())));
    }

    #[tokio::test]
    async fn test_client_slot_freed_on_disconnect() {
        let sal = Arc::new(FakeSal::new());
        let mut manager = started_manager(sal.clone());
        let cb = RecordingCallback::default();

        let first = manager
            .connect(&addr(), 7, &Uuid::from_u16(0x1101), Box::new(cb.clone()))
            .unwrap();
        manager.dispatch_sal_event(SppCallbacks::ConnectionStateChanged(
            addr(),
            7,
            ProfileConnectionState::Connected,
        ));
        manager.dispatch_sal_event(SppCallbacks::ConnectionStateChanged(
            addr(),
            7,
            ProfileConnectionState::Disconnected,
        ));

        // The slot was released; a new connect may reuse it.
        let second = manager
            .connect(&addr(), 8, &Uuid::from_u16(0x1101), Box::new(cb.clone()))
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_shutdown_synthesises_disconnect() {
        let sal = Arc::new(FakeSal::new());
        let mut manager = started_manager(sal.clone());
        let cb = RecordingCallback::default();

        manager.start_server(4, &Uuid::from_u16(0x1101), Box::new(cb.clone())).unwrap();
        manager.dispatch_sal_event(SppCallbacks::ConnectionStateChanged(
            addr(),
            4,
            ProfileConnectionState::Connected,
        ));

        manager.shutdown();
        let events = cb.events();
        assert_eq!(events.last().unwrap(), &Event::State(4, ProfileConnectionState::Disconnected));
        assert!(sal.calls().contains(&SalCall::SppDisconnect(addr(), 4)));
    }
}
