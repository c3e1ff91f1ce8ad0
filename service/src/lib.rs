//! Bluetooth framework service.
//!
//! This crate sits between applications and a vendor Bluetooth stack
//! reached through the `bt_sal` traits. Every stack upcall and every
//! mutating request is funnelled into one [`Message`] channel consumed by
//! [`Stack::dispatch`], so all framework state changes happen on a single
//! task.

pub mod adapter_state;
pub mod bluetooth;
pub mod bluetooth_adv;
pub mod bluetooth_logging;
pub mod bluetooth_scan;
pub mod btsnoop;
pub mod callbacks;
pub mod config;
pub mod device;
pub mod gatt_client;
pub mod gatt_server;
pub mod index_allocator;
pub mod main_loop;
pub mod power_manager;
pub mod scan_record;
pub mod spp;
pub mod storage;
pub mod utils;
pub mod uuid;

#[cfg(test)]
pub mod test_utils;

use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::mpsc::channel;
use tokio::sync::mpsc::{Receiver, Sender};

use bt_sal::adapter::AdapterCallbacks;
use bt_sal::gatt::{GattClientCallbacks, GattServerCallbacks};
use bt_sal::le::{AdvCallbacks, ScanCallbacks};
use bt_sal::spp::SppCallbacks;
use bt_sal::types::BtTransport;

use crate::adapter_state::FsmEvent;
use crate::bluetooth::Bluetooth;
use crate::bluetooth_adv::{AdvertiseManager, AdvertiserActions};
use crate::bluetooth_scan::{ScanManager, ScannerActions};
use crate::gatt_client::GattClientManager;
use crate::gatt_server::GattServerManager;
use crate::power_manager::{PmActions, PowerManager};
use crate::spp::{SppActions, SppManager};

/// Message types that are sent to the stack main dispatch loop.
pub enum Message {
    // Callbacks from the stack
    Adapter(AdapterCallbacks),
    GattClient(GattClientCallbacks),
    GattServer(GattServerCallbacks),
    LeAdv(AdvCallbacks),
    LeScanner(ScanCallbacks),
    Spp(SppCallbacks),

    // Adapter state machine inputs, including transition watchdogs
    AdapterStateMachine(FsmEvent),
    /// Bring the profile services of one transport up, then report back to
    /// the state machine.
    StartupProfiles(BtTransport),
    /// The reverse of `StartupProfiles` for the shutdown path.
    ShutdownProfiles(BtTransport),

    // Actions within the stack
    PmActions(PmActions),
    AdvertiserActions(AdvertiserActions),
    ScannerActions(ScannerActions),
    SppActions(SppActions),

    // Client callback disconnections
    AdapterCallbackDisconnected(u32),

    /// Deferred closure executed on the loop; carries `post`/`post_sync`
    /// work from other threads.
    RunTask(Box<dyn FnOnce() + Send>),

    /// Drain and stop the dispatch loop.
    Shutdown,
}

/// Returns a callable object that forwards a SAL callback bundle as a
/// Message. The stack binding may invoke it from any thread; per
/// dispatcher the send order matches the callback order.
pub fn make_message_dispatcher<F, Cb>(tx: Sender<Message>, f: F) -> Box<dyn Fn(Cb) + Send>
where
    Cb: Send + 'static,
    F: Fn(Cb) -> Message + Send + 'static,
{
    Box::new(move |cb| {
        if tx.blocking_send(f(cb)).is_err() {
            warn!("Dispatch channel gone, dropping stack event");
        }
    })
}

/// Umbrella class for the framework service.
pub struct Stack {}

impl Stack {
    /// Creates an mpsc channel for passing messages to the main dispatch
    /// loop.
    pub fn create_channel() -> (Sender<Message>, Receiver<Message>) {
        channel::<Message>(1)
    }

    /// Runs the main dispatch loop. All manager state is mutated from
    /// here and nowhere else.
    pub async fn dispatch(
        mut rx: Receiver<Message>,
        bluetooth: Arc<Mutex<Box<Bluetooth>>>,
        gatt_client: Arc<Mutex<Box<GattClientManager>>>,
        gatt_server: Arc<Mutex<Box<GattServerManager>>>,
        advertise: Arc<Mutex<Box<AdvertiseManager>>>,
        scanner: Arc<Mutex<Box<ScanManager>>>,
        power: Arc<Mutex<Box<PowerManager>>>,
        spp: Arc<Mutex<Box<SppManager>>>,
    ) {
        loop {
            let m = rx.recv().await;

            if m.is_none() {
                warn!("Message dispatch loop quit");
                break;
            }

            match m.unwrap() {
                Message::Adapter(event) => {
                    bluetooth.lock().unwrap().dispatch_sal_event(event);
                }

                Message::GattClient(event) => {
                    gatt_client.lock().unwrap().dispatch_sal_event(event);
                }

                Message::GattServer(event) => {
                    gatt_server.lock().unwrap().dispatch_sal_event(event);
                }

                Message::LeAdv(AdvCallbacks::StateChanged(adv_id, state)) => {
                    advertise.lock().unwrap().on_state_changed(adv_id, state);
                }

                Message::LeScanner(event) => match event {
                    ScanCallbacks::StateChanged(state) => {
                        debug!("scan engine state now {}", state);
                    }
                    ScanCallbacks::ResultUpdate(result) => {
                        scanner.lock().unwrap().on_scan_result(result);
                    }
                },

                Message::Spp(event) => {
                    spp.lock().unwrap().dispatch_sal_event(event);
                }

                Message::AdapterStateMachine(event) => {
                    bluetooth.lock().unwrap().step_state_machine(event);
                }

                Message::StartupProfiles(transport) => {
                    let ok = match transport {
                        BtTransport::Le => {
                            let client_up = gatt_client.lock().unwrap().startup();
                            let server_up = gatt_server.lock().unwrap().startup();
                            client_up && server_up
                        }
                        BtTransport::Bredr => spp.lock().unwrap().startup(),
                    };
                    if !ok {
                        warn!("{:?} profile services failed to start", transport);
                    }

                    let event = match transport {
                        BtTransport::Le => FsmEvent::BleProfileEnabled,
                        BtTransport::Bredr => FsmEvent::BredrProfileEnabled,
                    };
                    bluetooth.lock().unwrap().step_state_machine(event);
                }

                Message::ShutdownProfiles(transport) => {
                    match transport {
                        BtTransport::Le => {
                            gatt_client.lock().unwrap().shutdown();
                            gatt_server.lock().unwrap().shutdown();
                        }
                        BtTransport::Bredr => spp.lock().unwrap().shutdown(),
                    }

                    let event = match transport {
                        BtTransport::Le => FsmEvent::BleProfileDisabled,
                        BtTransport::Bredr => FsmEvent::BredrProfileDisabled,
                    };
                    bluetooth.lock().unwrap().step_state_machine(event);
                }

                Message::PmActions(action) => {
                    power.lock().unwrap().handle_actions(action);
                }

                Message::AdvertiserActions(action) => {
                    advertise.lock().unwrap().handle_actions(action);
                }

                Message::ScannerActions(action) => {
                    scanner.lock().unwrap().handle_actions(action);
                }

                Message::SppActions(action) => {
                    spp.lock().unwrap().handle_actions(action);
                }

                Message::AdapterCallbackDisconnected(id) => {
                    bluetooth.lock().unwrap().callback_disconnected(id);
                }

                Message::RunTask(task) => {
                    task();
                }

                Message::Shutdown => {
                    rx.close();
                    // Drain whatever was queued before the close.
                    while let Ok(message) = rx.try_recv() {
                        if let Message::RunTask(task) = message {
                            task();
                        }
                    }
                    break;
                }
            }
        }
    }
}

/// Signifies that the object may be a proxy to a remote caller.
///
/// A callback object implementing this trait may be backed by an IPC
/// client; `register_disconnect` lets the registry observe the remote
/// going away so the entry can be reaped.
pub trait RPCProxy {
    /// Registers disconnect observer that will be notified when the
    /// remote object is disconnected.
    fn register_disconnect(&mut self, _f: Box<dyn Fn(u32) + Send>) -> u32 {
        0
    }

    /// Returns the ID of the object, e.g. a socket peer identity.
    fn get_object_id(&self) -> String {
        String::from("")
    }

    /// Unregisters callback with this id.
    fn unregister(&mut self, _id: u32) -> bool {
        false
    }
}
