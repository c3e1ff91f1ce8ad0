//! Framework aggregate and the service-loop surface.
//!
//! [`Framework`] owns every manager singleton; [`MainLoop`] owns the
//! runtime thread the dispatch loop runs on and is the only thing other
//! threads touch: they `post` messages, `post_task` closures, or
//! `post_sync` closures whose result they wait for.

use std::sync::{Arc, Mutex};

use log::debug;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use bt_sal::adapter::{AdapterCallbacksDispatcher, AdapterSal};
use bt_sal::gatt::{
    GattClientCallbacksDispatcher, GattClientSal, GattServerCallbacksDispatcher, GattServerSal,
};
use bt_sal::le::{
    AdvCallbacksDispatcher, AdvertiserSal, ScanCallbacksDispatcher, ScannerSal,
};
use bt_sal::spp::{SppCallbacksDispatcher, SppSal};

use crate::bluetooth::Bluetooth;
use crate::bluetooth_adv::AdvertiseManager;
use crate::bluetooth_scan::ScanManager;
use crate::btsnoop::BtsnoopLogger;
use crate::config::Config;
use crate::gatt_client::GattClientManager;
use crate::gatt_server::GattServerManager;
use crate::power_manager::PowerManager;
use crate::spp::SppManager;
use crate::{make_message_dispatcher, Message, Stack};

/// The full downward binding: one implementation per SAL facet. A stack
/// integration typically backs all of them with one object.
#[derive(Clone)]
pub struct SalInterfaces {
    pub adapter: Arc<dyn AdapterSal>,
    pub gatt_client: Arc<dyn GattClientSal>,
    pub gatt_server: Arc<dyn GattServerSal>,
    pub advertiser: Arc<dyn AdvertiserSal>,
    pub scanner: Arc<dyn ScannerSal>,
    pub spp: Arc<dyn SppSal>,
}

/// Every manager singleton, owned by value behind the shared handles the
/// dispatch loop and the API surface both use.
#[derive(Clone)]
pub struct Framework {
    pub bluetooth: Arc<Mutex<Box<Bluetooth>>>,
    pub gatt_client: Arc<Mutex<Box<GattClientManager>>>,
    pub gatt_server: Arc<Mutex<Box<GattServerManager>>>,
    pub advertise: Arc<Mutex<Box<AdvertiseManager>>>,
    pub scanner: Arc<Mutex<Box<ScanManager>>>,
    pub power: Arc<Mutex<Box<PowerManager>>>,
    pub spp: Arc<Mutex<Box<SppManager>>>,
    pub btsnoop: Option<Arc<BtsnoopLogger>>,
}

impl Framework {
    pub fn new(config: Config, sal: SalInterfaces, tx: Sender<Message>) -> Framework {
        let btsnoop = config.snoop_log_path.as_ref().map(|path| {
            let logger = Arc::new(BtsnoopLogger::new(path.clone()));
            if let Err(e) = logger.create_new_file() {
                log::warn!("btsnoop capture unavailable: {}", e);
            }
            logger
        });

        Framework {
            bluetooth: Arc::new(Mutex::new(Box::new(Bluetooth::new(
                config.clone(),
                sal.adapter.clone(),
                tx.clone(),
            )))),
            gatt_client: Arc::new(Mutex::new(Box::new(GattClientManager::new(
                sal.gatt_client.clone(),
                config.gattc_max_connections,
            )))),
            gatt_server: Arc::new(Mutex::new(Box::new(GattServerManager::new(
                sal.gatt_server.clone(),
            )))),
            advertise: Arc::new(Mutex::new(Box::new(AdvertiseManager::new(
                sal.advertiser.clone(),
                tx.clone(),
                config.le_advertiser_max_num,
            )))),
            scanner: Arc::new(Mutex::new(Box::new(ScanManager::new(
                sal.scanner.clone(),
                tx.clone(),
                config.le_scanner_max_num,
            )))),
            power: Arc::new(Mutex::new(Box::new(PowerManager::new(
                sal.adapter.clone(),
                tx.clone(),
                config.pm_max_timer_number,
            )))),
            spp: Arc::new(Mutex::new(Box::new(SppManager::new(sal.spp.clone(), tx)))),
            btsnoop,
        }
    }
}

/// The dispatcher bundle a stack binding registers its upcalls with.
pub struct Dispatchers {
    pub adapter: AdapterCallbacksDispatcher,
    pub gatt_client: GattClientCallbacksDispatcher,
    pub gatt_server: GattServerCallbacksDispatcher,
    pub advertiser: AdvCallbacksDispatcher,
    pub scanner: ScanCallbacksDispatcher,
    pub spp: SppCallbacksDispatcher,
}

pub fn make_dispatchers(tx: &Sender<Message>) -> Dispatchers {
    Dispatchers {
        adapter: AdapterCallbacksDispatcher {
            dispatch: make_message_dispatcher(tx.clone(), Message::Adapter),
        },
        gatt_client: GattClientCallbacksDispatcher {
            dispatch: make_message_dispatcher(tx.clone(), Message::GattClient),
        },
        gatt_server: GattServerCallbacksDispatcher {
            dispatch: make_message_dispatcher(tx.clone(), Message::GattServer),
        },
        advertiser: AdvCallbacksDispatcher {
            dispatch: make_message_dispatcher(tx.clone(), Message::LeAdv),
        },
        scanner: ScanCallbacksDispatcher {
            dispatch: make_message_dispatcher(tx.clone(), Message::LeScanner),
        },
        spp: SppCallbacksDispatcher {
            dispatch: make_message_dispatcher(tx.clone(), Message::Spp),
        },
    }
}

pub struct MainLoop {
    runtime: Runtime,
    tx: Sender<Message>,
    framework: Framework,
    dispatch: Option<JoinHandle<()>>,
}

impl MainLoop {
    /// Builds the framework on a fresh single-worker runtime and starts
    /// the dispatch loop on it.
    pub fn new(config: Config, sal: SalInterfaces, name: &str) -> std::io::Result<MainLoop> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(name)
            .enable_all()
            .build()?;

        let (tx, rx) = Stack::create_channel();
        let framework = Framework::new(config, sal, tx.clone());

        let dispatch = runtime.spawn(Stack::dispatch(
            rx,
            framework.bluetooth.clone(),
            framework.gatt_client.clone(),
            framework.gatt_server.clone(),
            framework.advertise.clone(),
            framework.scanner.clone(),
            framework.power.clone(),
            framework.spp.clone(),
        ));

        Ok(MainLoop { runtime, tx, framework, dispatch: Some(dispatch) })
    }

    pub fn framework(&self) -> &Framework {
        &self.framework
    }

    pub fn message_tx(&self) -> Sender<Message> {
        self.tx.clone()
    }

    pub fn dispatchers(&self) -> Dispatchers {
        make_dispatchers(&self.tx)
    }

    /// Queues a message from an application thread. FIFO per caller.
    pub fn post(&self, message: Message) {
        let _ = self.tx.blocking_send(message);
    }

    /// Queues a closure to run on the loop.
    pub fn post_task<F: FnOnce() + Send + 'static>(&self, task: F) {
        self.post(Message::RunTask(Box::new(task)));
    }

    /// Runs a closure on the loop and blocks for its result. Must not be
    /// called from the loop itself.
    pub fn post_sync<R, F>(&self, task: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        debug_assert!(
            tokio::runtime::Handle::try_current().is_err(),
            "post_sync invoked from the service loop"
        );

        let (done_tx, done_rx) = oneshot::channel();
        self.post_task(move || {
            let _ = done_tx.send(task());
        });

        done_rx.blocking_recv().ok()
    }

    /// Drains the queue once, stops the dispatch loop, and joins it.
    pub fn exit(mut self) {
        debug!("main loop exiting");
        let _ = self.tx.blocking_send(Message::Shutdown);
        if let Some(dispatch) = self.dispatch.take() {
            let _ = self.runtime.block_on(dispatch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter_state::{AdapterState, FsmEvent};
    use crate::test_utils::FakeSal;
    use bt_sal::adapter::{AdapterCallbacks, StackState};

    fn fake_sal_interfaces() -> (Arc<FakeSal>, SalInterfaces) {
        let fake = Arc::new(FakeSal::new());
        let interfaces = SalInterfaces {
            adapter: fake.clone(),
            gatt_client: fake.clone(),
            gatt_server: fake.clone(),
            advertiser: fake.clone(),
            scanner: fake.clone(),
            spp: fake.clone(),
        };
        (fake, interfaces)
    }

    fn test_config(tag: &str) -> Config {
        let dir = std::env::temp_dir().join(format!("btmainloop_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Config { storage_path: dir.to_string_lossy().into_owned(), ..Default::default() }
    }

    fn adapter_state(main_loop: &MainLoop) -> AdapterState {
        let framework = main_loop.framework().clone();
        main_loop.post_sync(move || framework.bluetooth.lock().unwrap().get_state()).unwrap()
    }

    fn wait_for_state(main_loop: &MainLoop, want: AdapterState) {
        for _ in 0..300 {
            if adapter_state(main_loop) == want {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("adapter never reached {:?}", want);
    }

    #[test]
    fn test_end_to_end_enable_through_the_loop() {
        let (_fake, sal) = fake_sal_interfaces();
        let main_loop = MainLoop::new(test_config("enable"), sal, "bt_service").unwrap();

        // Drive a full power-up; the profile startup legs flow through the
        // dispatch loop on their own, so each stage is awaited before the
        // next stack report goes in.
        main_loop.post(Message::AdapterStateMachine(FsmEvent::SysTurnOn));
        main_loop.post(Message::Adapter(AdapterCallbacks::StackStateChanged(StackState::BleOn)));
        wait_for_state(&main_loop, AdapterState::TurningOn);

        main_loop.post(Message::Adapter(AdapterCallbacks::StackStateChanged(StackState::BredrOn)));
        wait_for_state(&main_loop, AdapterState::On);

        main_loop.exit();
    }

    #[test]
    fn test_post_sync_round_trip_and_exit_drain() {
        let (_fake, sal) = fake_sal_interfaces();
        let main_loop = MainLoop::new(test_config("sync"), sal, "bt_service").unwrap();

        assert_eq!(main_loop.post_sync(|| 41 + 1), Some(42));

        // Ordering: tasks posted from one thread run in order.
        let (order_tx, order_rx) = std::sync::mpsc::channel();
        for i in 0..4 {
            let order_tx = order_tx.clone();
            main_loop.post_task(move || {
                let _ = order_tx.send(i);
            });
        }
        assert_eq!(main_loop.post_sync(|| ()), Some(()));
        let seen: Vec<i32> = order_rx.try_iter().collect();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        main_loop.exit();
    }
}
