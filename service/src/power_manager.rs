//! BR/EDR link power management.
//!
//! Every profile service reports its activity per peer; the manager folds
//! the reports through fixed preference tables into one preferred link
//! mode, then either requests Active immediately or arms an idle timer
//! that requests the winning sniff profile when it fires.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc::Sender;

use bt_sal::adapter::{AdapterSal, PowerMode};
use bt_sal::types::{LinkMode, RawAddress};

use crate::utils::Alarm;
use crate::uuid::Profile;
use crate::Message;

/// Activity states a profile can report for a peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PmState {
    ConnOpen,
    ConnClose,
    AppOpen,
    AppClose,
    ScoOpen,
    ScoClose,
    Idle,
    Busy,
}

impl PmState {
    fn index(&self) -> usize {
        *self as usize
    }
}

/// Preferred link mode, ordered weakest to strongest: a stronger
/// preference always wins the per-peer resolution.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PreferredMode {
    NoAction,
    NoPref,
    Sniff,
    Sniff1,
    Sniff2,
    Sniff3,
    Sniff4,
    Sniff5,
    Sniff6,
    Active,
}

impl PreferredMode {
    fn sniff_index(&self) -> Option<usize> {
        match self {
            PreferredMode::Sniff => Some(0),
            PreferredMode::Sniff1 => Some(1),
            PreferredMode::Sniff2 => Some(2),
            PreferredMode::Sniff3 => Some(3),
            PreferredMode::Sniff4 => Some(4),
            PreferredMode::Sniff5 => Some(5),
            PreferredMode::Sniff6 => Some(6),
            _ => None,
        }
    }
}

/// Sniff parameter rows: (max interval, min interval, attempt, timeout).
const PM_MODE: [(u16, u16, u16, u16); 7] = [
    (800, 400, 4, 1),
    (400, 200, 4, 1),
    (54, 30, 4, 1),
    (150, 50, 4, 1),
    (18, 10, 4, 1),
    (36, 30, 2, 0),
    (18, 14, 1, 0),
];

struct PmAction {
    mode: PreferredMode,
    timeout_ms: u32,
}

struct PmSpecTable {
    allow_sniff: bool,
    actions: [PmAction; 8],
}

const fn action(mode: PreferredMode, timeout_ms: u32) -> PmAction {
    PmAction { mode, timeout_ms }
}

/// Per-service-class preference tables, indexed by [`spec_index`]. Action
/// order is conn open, conn close, app open, app close, sco open, sco
/// close, idle, busy.
const PM_SPEC: [PmSpecTable; 5] = [
    // HF / AG
    PmSpecTable {
        allow_sniff: true,
        actions: [
            action(PreferredMode::Sniff, 7000),
            action(PreferredMode::NoPref, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::Sniff3, 7000),
            action(PreferredMode::Sniff, 7000),
            action(PreferredMode::Sniff, 7000),
            action(PreferredMode::Active, 0),
        ],
    },
    // AV
    PmSpecTable {
        allow_sniff: true,
        actions: [
            action(PreferredMode::Sniff, 7000),
            action(PreferredMode::NoPref, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::Sniff, 7000),
            action(PreferredMode::Active, 0),
        ],
    },
    // SPP
    PmSpecTable {
        allow_sniff: true,
        actions: [
            action(PreferredMode::Active, 0),
            action(PreferredMode::NoPref, 0),
            action(PreferredMode::Active, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::Sniff, 1000),
            action(PreferredMode::Active, 0),
        ],
    },
    // PAN
    PmSpecTable {
        allow_sniff: true,
        actions: [
            action(PreferredMode::Active, 0),
            action(PreferredMode::NoPref, 0),
            action(PreferredMode::Active, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::Sniff, 5000),
            action(PreferredMode::Active, 0),
        ],
    },
    // HID
    PmSpecTable {
        allow_sniff: true,
        actions: [
            action(PreferredMode::Sniff, 5000),
            action(PreferredMode::NoPref, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::NoAction, 0),
            action(PreferredMode::Sniff2, 5000),
            action(PreferredMode::Sniff4, 200),
        ],
    },
];

fn spec_index(profile: Profile) -> Option<usize> {
    match profile {
        Profile::HfpHf | Profile::HfpAg => Some(0),
        Profile::A2dp | Profile::AvrcpCt | Profile::AvrcpTg => Some(1),
        Profile::Spp => Some(2),
        Profile::Panu => Some(3),
        Profile::HidDev => Some(4),
        _ => None,
    }
}

#[derive(Debug)]
pub enum PmActions {
    ProfileStateChanged(Profile, RawAddress, PmState),
    DeviceConnected(RawAddress),
    DeviceDisconnected(RawAddress),
    LinkModeChanged(RawAddress, LinkMode, u16),
    TimerFired(usize),
}

enum PmRequest {
    Restart,
    Execute,
}

struct PmService {
    profile: Profile,
    state: PmState,
    peer_addr: RawAddress,
}

struct PmDevice {
    peer_addr: RawAddress,
    mode: LinkMode,
    interval: u16,
}

struct PmTimerSlot {
    active: bool,
    peer_addr: RawAddress,
    profile: Profile,
    alarm: Option<Alarm>,
}

pub struct PowerManager {
    sal: Arc<dyn AdapterSal>,
    tx: Sender<Message>,
    services: Vec<PmService>,
    devices: Vec<PmDevice>,
    timers: Vec<PmTimerSlot>,
    last_profile: Option<Profile>,
}

impl PowerManager {
    pub fn new(sal: Arc<dyn AdapterSal>, tx: Sender<Message>, timer_pool_size: usize) -> Self {
        let mut timers = Vec::with_capacity(timer_pool_size);
        for _ in 0..timer_pool_size {
            timers.push(PmTimerSlot {
                active: false,
                peer_addr: RawAddress::EMPTY,
                profile: Profile::Spp,
                alarm: None,
            });
        }

        PowerManager {
            sal,
            tx,
            services: Vec::new(),
            devices: Vec::new(),
            timers,
            last_profile: None,
        }
    }

    pub fn handle_actions(&mut self, action: PmActions) {
        match action {
            PmActions::ProfileStateChanged(profile, addr, state) => {
                self.profile_state_changed(profile, &addr, state)
            }
            PmActions::DeviceConnected(addr) => self.device_connected(&addr),
            PmActions::DeviceDisconnected(addr) => self.device_disconnected(&addr),
            PmActions::LinkModeChanged(addr, mode, interval) => {
                self.link_mode_changed(&addr, mode, interval)
            }
            PmActions::TimerFired(slot) => self.timer_fired(slot),
        }
    }

    pub fn profile_state_changed(&mut self, profile: Profile, addr: &RawAddress, state: PmState) {
        match self.services.iter_mut().find(|s| s.profile == profile && s.peer_addr == *addr) {
            Some(service) => service.state = state,
            None => self.services.push(PmService { profile, state, peer_addr: *addr }),
        }

        // A profile whose table has no conn-open preference never takes
        // part in the resolution.
        let keep = spec_index(profile)
            .map(|idx| PM_SPEC[idx].actions[0].mode != PreferredMode::NoPref)
            .unwrap_or(false);
        if !keep {
            self.services.retain(|s| !(s.profile == profile && s.peer_addr == *addr));
        }

        self.mode_request(addr, PmRequest::Restart, Some(profile));
    }

    pub fn device_connected(&mut self, addr: &RawAddress) {
        if self.devices.iter().any(|d| d.peer_addr == *addr) {
            return;
        }
        self.devices.push(PmDevice {
            peer_addr: *addr,
            mode: LinkMode::Active,
            interval: 0,
        });
    }

    pub fn device_disconnected(&mut self, addr: &RawAddress) {
        self.stop_timer(addr);
        self.devices.retain(|d| d.peer_addr != *addr);
        self.services.retain(|s| s.peer_addr != *addr);
    }

    pub fn link_mode_changed(&mut self, addr: &RawAddress, mode: LinkMode, interval: u16) {
        debug!("pm: link mode of {} now {:?} interval {}", addr, mode, interval);

        let device = match self.devices.iter_mut().find(|d| d.peer_addr == *addr) {
            Some(d) => d,
            None => {
                warn!("pm: link mode change for unknown device {}", addr);
                return;
            }
        };
        device.mode = mode;
        device.interval = interval;

        match mode {
            LinkMode::Active => {
                self.stop_timer(addr);
                let last = self.last_profile;
                self.mode_request(addr, PmRequest::Restart, last);
            }
            LinkMode::Sniff => self.stop_timer(addr),
            _ => {}
        }
    }

    fn timer_fired(&mut self, slot: usize) {
        let (addr, profile) = match self.timers.get_mut(slot) {
            Some(timer) if timer.active => {
                timer.active = false;
                timer.alarm = None;
                (timer.peer_addr, timer.profile)
            }
            _ => return,
        };

        debug!("pm: timer fired for {} ({:?})", addr, profile);
        self.mode_request(&addr, PmRequest::Execute, Some(profile));
    }

    /// Picks the strongest preference among the peer's service rows.
    /// Returns (mode, timeout, allow sniff, winning profile).
    fn resolve(
        &mut self,
        addr: &RawAddress,
        tie_break: Option<Profile>,
    ) -> Option<(PreferredMode, u32, bool, Profile)> {
        let mut winner: Option<(PreferredMode, u32, bool, Profile)> = None;

        for service in self.services.iter().filter(|s| s.peer_addr == *addr) {
            let idx = match spec_index(service.profile) {
                Some(idx) => idx,
                None => return None,
            };
            let table = &PM_SPEC[idx];
            let act = &table.actions[service.state.index()];

            let better = match &winner {
                None => true,
                Some((mode, _, _, _)) => {
                    act.mode > *mode || (act.mode == *mode && Some(service.profile) == tie_break)
                }
            };
            if better {
                winner = Some((act.mode, act.timeout_ms, table.allow_sniff, service.profile));
                self.last_profile = Some(service.profile);
            }
        }

        winner
    }

    fn mode_request(&mut self, addr: &RawAddress, req: PmRequest, profile: Option<Profile>) {
        if !self.devices.iter().any(|d| d.peer_addr == *addr) {
            debug!("pm: {} not connected, dropping request", addr);
            self.stop_timer(addr);
            return;
        }

        let (mode, timeout_ms, allow_sniff, win_profile) = match self.resolve(addr, profile) {
            Some(resolved) => resolved,
            None => return,
        };

        if !allow_sniff {
            return;
        }

        match req {
            PmRequest::Execute => {
                if mode == PreferredMode::Active {
                    self.request_active(addr);
                } else if let Some(index) = mode.sniff_index() {
                    self.request_sniff(addr, index);
                }
            }
            PmRequest::Restart => {
                if mode == PreferredMode::Active {
                    self.request_active(addr);
                } else if timeout_ms > 0 {
                    self.stop_timer(addr);
                    self.start_timer(addr, timeout_ms, win_profile);
                }
            }
        }
    }

    fn request_sniff(&self, addr: &RawAddress, index: usize) {
        let device = match self.devices.iter().find(|d| d.peer_addr == *addr) {
            Some(d) => d,
            None => return,
        };

        let (max, min, attempt, timeout) = PM_MODE[index];
        if device.mode == LinkMode::Sniff && device.interval <= max && device.interval >= min {
            return;
        }

        let mode = PowerMode {
            mode: LinkMode::Sniff,
            max_interval: max,
            min_interval: min,
            attempt,
            timeout,
        };
        debug!("pm: sniff request to {}: max {} min {} attempt {} timeout {}", addr, max, min, attempt, timeout);
        self.sal.set_power_mode(addr, &mode);
    }

    fn request_active(&self, addr: &RawAddress) {
        let device = match self.devices.iter().find(|d| d.peer_addr == *addr) {
            Some(d) => d,
            None => return,
        };
        if device.mode == LinkMode::Active {
            return;
        }

        debug!("pm: active request to {}", addr);
        self.sal.set_power_mode(addr, &PowerMode::ACTIVE);
    }

    fn start_timer(&mut self, addr: &RawAddress, timeout_ms: u32, profile: Profile) {
        for (slot, timer) in self.timers.iter_mut().enumerate() {
            if timer.active {
                continue;
            }

            timer.active = true;
            timer.peer_addr = *addr;
            timer.profile = profile;
            timer.alarm = Some(Alarm::start(self.tx.clone(), u64::from(timeout_ms), move || {
                Message::PmActions(PmActions::TimerFired(slot))
            }));
            return;
        }

        warn!("pm: timer pool exhausted ({} slots)", self.timers.len());
    }

    fn stop_timer(&mut self, addr: &RawAddress) {
        for timer in self.timers.iter_mut() {
            if timer.active && timer.peer_addr == *addr {
                timer.active = false;
                timer.alarm = None;
            }
        }
    }

    #[cfg(test)]
    fn armed_timer(&self, addr: &RawAddress) -> Option<usize> {
        self.timers.iter().position(|t| t.active && t.peer_addr == *addr)
    }
}
