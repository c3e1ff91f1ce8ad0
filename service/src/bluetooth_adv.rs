//! LE advertising manager.
//!
//! Advertiser identities are 1-based ids handed out by the index
//! allocator; id 0 is never a live advertiser and is what failure
//! notifications carry. Between the start request and the stack's first
//! state report a 1 second watchdog runs, so the application always sees
//! exactly one of started or start-timeout.

use std::sync::Arc;

use log::{debug, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use tokio::sync::mpsc::Sender;

use bt_sal::le::{AdvState, AdvertiserSal, BleAdvParams};
use bt_sal::types::BtStatus;

use crate::index_allocator::IndexAllocator;
use crate::utils::Alarm;
use crate::Message;

const ADV_START_WATCHDOG_MS: u64 = 1000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum AdvStartStatus {
    Success = 0,
    NoMem,
    Timeout,
    StackErr,
}

pub trait IAdvertisingCallback: Send {
    fn on_advertising_start(&mut self, adv_id: u8, status: AdvStartStatus);
    fn on_advertising_stopped(&mut self, adv_id: u8);
}

pub enum AdvertiserActions {
    /// App request: bring up one advertising set.
    StartAdvertising {
        params: BleAdvParams,
        adv_data: Vec<u8>,
        scan_rsp_data: Vec<u8>,
        callbacks: Box<dyn IAdvertisingCallback>,
    },
    /// App request: tear one down by id.
    StopAdvertising(u8),
    /// Watchdog expiry for a set that never reported started.
    StartTimeout(u8),
    /// LE power-up / power-down hooks from the adapter.
    ManagerStart,
    ManagerStop,
}

struct Advertiser {
    adv_id: u8,
    callbacks: Box<dyn IAdvertisingCallback>,
    watchdog: Option<Alarm>,
}

pub struct AdvertiseManager {
    started: bool,
    allocator: IndexAllocator,
    advertisers: Vec<Advertiser>,
    max_advertisers: u32,
    sal: Arc<dyn AdvertiserSal>,
    tx: Sender<Message>,
}

impl AdvertiseManager {
    pub fn new(sal: Arc<dyn AdvertiserSal>, tx: Sender<Message>, max_advertisers: u32) -> Self {
        AdvertiseManager {
            started: false,
            allocator: IndexAllocator::new(max_advertisers.saturating_sub(1)),
            advertisers: Vec::new(),
            max_advertisers,
            sal,
            tx,
        }
    }

    pub fn handle_actions(&mut self, action: AdvertiserActions) {
        match action {
            AdvertiserActions::StartAdvertising { params, adv_data, scan_rsp_data, callbacks } => {
                self.start_advertising(&params, &adv_data, &scan_rsp_data, callbacks);
            }
            AdvertiserActions::StopAdvertising(adv_id) => self.stop_advertising(adv_id),
            AdvertiserActions::StartTimeout(adv_id) => self.start_timeout(adv_id),
            AdvertiserActions::ManagerStart => self.manager_start(),
            AdvertiserActions::ManagerStop => self.manager_stop(),
        }
    }

    pub fn is_supported(&self) -> bool {
        true
    }

    pub fn manager_start(&mut self) {
        self.started = true;
        self.allocator = IndexAllocator::new(self.max_advertisers.saturating_sub(1));
        self.advertisers.clear();
    }

    /// LE went down: stop every set at the stack and synthesise the final
    /// stopped notification the stack will no longer deliver.
    pub fn manager_stop(&mut self) {
        if !self.started {
            return;
        }

        for mut adver in self.advertisers.drain(..) {
            self.sal.le_stop_adv(adver.adv_id);
            adver.watchdog = None;
            adver.callbacks.on_advertising_stopped(adver.adv_id);
        }
        self.started = false;
    }

    pub fn start_advertising(
        &mut self,
        params: &BleAdvParams,
        adv_data: &[u8],
        scan_rsp_data: &[u8],
        mut callbacks: Box<dyn IAdvertisingCallback>,
    ) -> u8 {
        if !self.started {
            callbacks.on_advertising_start(0, AdvStartStatus::StackErr);
            return 0;
        }

        let adv_id = match self.allocator.alloc() {
            Some(index) => (index + 1) as u8,
            None => {
                callbacks.on_advertising_start(0, AdvStartStatus::NoMem);
                return 0;
            }
        };

        if self.sal.le_start_adv(adv_id, params, adv_data, scan_rsp_data) != BtStatus::Success {
            callbacks.on_advertising_start(0, AdvStartStatus::StackErr);
            self.allocator.free(u32::from(adv_id) - 1);
            return 0;
        }

        let watchdog = Alarm::start(self.tx.clone(), ADV_START_WATCHDOG_MS, move || {
            Message::AdvertiserActions(AdvertiserActions::StartTimeout(adv_id))
        });
        self.advertisers.push(Advertiser { adv_id, callbacks, watchdog: Some(watchdog) });

        adv_id
    }

    pub fn stop_advertising(&mut self, adv_id: u8) {
        if !self.started {
            return;
        }

        match self.advertisers.iter().find(|a| a.adv_id == adv_id) {
            Some(_) => {
                self.sal.le_stop_adv(adv_id);
            }
            None => debug!("adv: stop for unknown id {}", adv_id),
        }
    }

    fn start_timeout(&mut self, adv_id: u8) {
        let position = match self.advertisers.iter().position(|a| a.adv_id == adv_id) {
            Some(p) => p,
            None => {
                warn!("adv: watchdog expired but id {} is gone", adv_id);
                return;
            }
        };

        // Only a set still waiting for its started report can time out.
        if self.advertisers[position].watchdog.is_none() {
            return;
        }

        let mut adver = self.advertisers.remove(position);
        adver.watchdog = None;
        adver.callbacks.on_advertising_start(0, AdvStartStatus::Timeout);
        self.allocator.free(u32::from(adv_id) - 1);
    }

    pub fn on_state_changed(&mut self, adv_id: u8, state: AdvState) {
        if !self.started {
            return;
        }

        match state {
            AdvState::Started => {
                if let Some(adver) = self.advertisers.iter_mut().find(|a| a.adv_id == adv_id) {
                    adver.watchdog = None;
                    adver.callbacks.on_advertising_start(adv_id, AdvStartStatus::Success);
                }
            }
            AdvState::Stopped => {
                if let Some(position) = self.advertisers.iter().position(|a| a.adv_id == adv_id) {
                    let mut adver = self.advertisers.remove(position);
                    adver.watchdog = None;
                    adver.callbacks.on_advertising_stopped(adv_id);
                    self.allocator.free(u32::from(adv_id) - 1);
                }
            }
        }
    }
}
