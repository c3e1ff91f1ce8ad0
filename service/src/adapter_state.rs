//! Adapter power state machine.
//!
//! LE is the outer life-phase: BR/EDR layers on top of it, so the machine
//! can rest in `BleOn` without ever reaching `On`. The machine itself only
//! decides transitions; the adapter service executes the returned effects
//! (SAL enable/disable, profile start/stop, observable notifications,
//! timeout alarms) on the dispatch loop.

use log::debug;

use bt_sal::types::BtTransport;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AdapterState {
    Off,
    BleTurningOn,
    BleOn,
    TurningOn,
    On,
    TurningOff,
    BleTurningOff,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FsmEvent {
    SysTurnOn,
    SysTurnOff,
    TurnOnBle,
    TurnOffBle,
    BredrEnabled,
    BredrDisabled,
    BredrProfileEnabled,
    BredrProfileDisabled,
    BleEnabled,
    BleDisabled,
    BleProfileEnabled,
    BleProfileDisabled,
    BredrEnableTimeout,
    BredrDisableTimeout,
    BredrProfileEnableTimeout,
    BredrProfileDisableTimeout,
    BleEnableTimeout,
    BleDisableTimeout,
    BleProfileEnableTimeout,
    BleProfileDisableTimeout,
}

impl FsmEvent {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FsmEvent::BredrEnableTimeout
                | FsmEvent::BredrDisableTimeout
                | FsmEvent::BredrProfileEnableTimeout
                | FsmEvent::BredrProfileDisableTimeout
                | FsmEvent::BleEnableTimeout
                | FsmEvent::BleDisableTimeout
                | FsmEvent::BleProfileEnableTimeout
                | FsmEvent::BleProfileDisableTimeout
        )
    }
}

/// Side effects the adapter service performs after a transition. Entered
/// effects carry the previous state so observers get a full edge.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FsmEffect {
    Exited(AdapterState),
    Entered { prev: Option<AdapterState>, state: AdapterState },
    StartProfiles(BtTransport),
    DisableStack,
    DisableLeStack,
}

pub struct AdapterStateMachine {
    state: AdapterState,
    prev_state: Option<AdapterState>,
    support_bredr: bool,
    support_le: bool,
    ble_enabled: bool,
    pending_turn_on: bool,
}

impl AdapterStateMachine {
    pub fn new(support_bredr: bool, support_le: bool) -> Self {
        AdapterStateMachine {
            state: AdapterState::Off,
            prev_state: None,
            support_bredr,
            support_le,
            ble_enabled: false,
            pending_turn_on: false,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    pub fn ble_enabled(&self) -> bool {
        self.ble_enabled
    }

    pub fn pending_turn_on(&self) -> bool {
        self.pending_turn_on
    }

    /// Feeds one event through the machine. The returned effects are empty
    /// when the event is ignored in the current state; the dispatcher never
    /// faults on an unexpected (state, event) pair.
    pub fn process_event(&mut self, event: FsmEvent) -> Vec<FsmEffect> {
        debug!("adapter-stm: state={:?} event={:?}", self.state, event);

        let mut effects = Vec::new();
        self.step(event, &mut effects);
        effects
    }

    fn step(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match self.state {
            AdapterState::Off => self.off_event(event, effects),
            AdapterState::BleTurningOn => self.ble_turning_on_event(event, effects),
            AdapterState::BleOn => self.ble_on_event(event, effects),
            AdapterState::TurningOn => self.turning_on_event(event, effects),
            AdapterState::On => self.on_event(event, effects),
            AdapterState::TurningOff => self.turning_off_event(event, effects),
            AdapterState::BleTurningOff => self.ble_turning_off_event(event, effects),
        }
    }

    fn off_event(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match event {
            FsmEvent::SysTurnOn => {
                if !self.support_le {
                    self.transition(AdapterState::TurningOn, effects);
                    return;
                }
                if self.support_bredr {
                    self.pending_turn_on = true;
                }
                self.transition(AdapterState::BleTurningOn, effects);
            }
            FsmEvent::TurnOnBle => {
                self.transition(AdapterState::BleTurningOn, effects);
            }
            _ => {}
        }
    }

    fn ble_turning_on_event(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match event {
            FsmEvent::BleEnabled => {
                effects.push(FsmEffect::StartProfiles(BtTransport::Le));
            }
            FsmEvent::BleProfileEnabled => {
                self.transition(AdapterState::BleOn, effects);
            }
            FsmEvent::BleEnableTimeout | FsmEvent::BleProfileEnableTimeout => {
                self.transition(AdapterState::Off, effects);
            }
            _ => {}
        }
    }

    fn ble_on_event(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match event {
            FsmEvent::SysTurnOn => {
                self.transition(AdapterState::TurningOn, effects);
            }
            FsmEvent::SysTurnOff | FsmEvent::TurnOffBle => {
                self.transition(AdapterState::BleTurningOff, effects);
            }
            _ => {}
        }
    }

    fn turning_on_event(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match event {
            FsmEvent::BredrEnabled => {
                effects.push(FsmEffect::StartProfiles(BtTransport::Bredr));
            }
            FsmEvent::BredrProfileEnabled => {
                self.transition(AdapterState::On, effects);
            }
            FsmEvent::BredrEnableTimeout | FsmEvent::BredrProfileEnableTimeout => {
                let backout =
                    if self.support_le { AdapterState::BleOn } else { AdapterState::Off };
                self.transition(backout, effects);
            }
            _ => {}
        }
    }

    fn on_event(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match event {
            FsmEvent::SysTurnOff => {
                self.transition(AdapterState::TurningOff, effects);
            }
            _ => {}
        }
    }

    fn turning_off_event(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match event {
            FsmEvent::BredrProfileDisabled => {
                effects.push(FsmEffect::DisableStack);
            }
            FsmEvent::BredrDisabled => {
                if self.support_le {
                    self.transition(AdapterState::BleTurningOff, effects);
                    return;
                }
                self.transition(AdapterState::Off, effects);
            }
            FsmEvent::BredrDisableTimeout | FsmEvent::BredrProfileDisableTimeout => {
                self.transition(AdapterState::Off, effects);
            }
            _ => {}
        }
    }

    fn ble_turning_off_event(&mut self, event: FsmEvent, effects: &mut Vec<FsmEffect>) {
        match event {
            FsmEvent::BleProfileDisabled => {
                effects.push(FsmEffect::DisableLeStack);
            }
            FsmEvent::BleDisabled => {
                self.transition(AdapterState::Off, effects);
            }
            FsmEvent::BleDisableTimeout | FsmEvent::BleProfileDisableTimeout => {
                self.transition(AdapterState::Off, effects);
            }
            _ => {}
        }
    }

    fn transition(&mut self, next: AdapterState, effects: &mut Vec<FsmEffect>) {
        effects.push(FsmEffect::Exited(self.state));
        self.prev_state = Some(self.state);
        self.state = next;
        effects.push(FsmEffect::Entered { prev: self.prev_state, state: next });

        match next {
            AdapterState::Off => {
                self.ble_enabled = false;
                self.pending_turn_on = false;
            }
            AdapterState::BleOn => {
                self.ble_enabled = true;
                if self.pending_turn_on {
                    self.pending_turn_on = false;
                    self.step(FsmEvent::SysTurnOn, effects);
                }
            }
            AdapterState::BleTurningOff => {
                self.ble_enabled = false;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entered_states(effects: &[FsmEffect]) -> Vec<AdapterState> {
        effects
            .iter()
            .filter_map(|e| match e {
                FsmEffect::Entered { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_full_enable_sequence() {
        let mut stm = AdapterStateMachine::new(true, true);

        let effects = stm.process_event(FsmEvent::SysTurnOn);
        assert_eq!(entered_states(&effects), vec![AdapterState::BleTurningOn]);
        assert!(stm.pending_turn_on());

        let effects = stm.process_event(FsmEvent::BleEnabled);
        assert_eq!(effects, vec![FsmEffect::StartProfiles(BtTransport::Le)]);

        // BleOn entry consumes the pending turn-on and chains into TurningOn.
        let effects = stm.process_event(FsmEvent::BleProfileEnabled);
        assert_eq!(entered_states(&effects), vec![AdapterState::BleOn, AdapterState::TurningOn]);
        assert!(!stm.pending_turn_on());
        assert!(stm.ble_enabled());

        let effects = stm.process_event(FsmEvent::BredrEnabled);
        assert_eq!(effects, vec![FsmEffect::StartProfiles(BtTransport::Bredr)]);

        let effects = stm.process_event(FsmEvent::BredrProfileEnabled);
        assert_eq!(entered_states(&effects), vec![AdapterState::On]);
    }

    #[test]
    fn test_ble_only_enable() {
        let mut stm = AdapterStateMachine::new(true, true);

        stm.process_event(FsmEvent::TurnOnBle);
        stm.process_event(FsmEvent::BleEnabled);
        let effects = stm.process_event(FsmEvent::BleProfileEnabled);
        assert_eq!(entered_states(&effects), vec![AdapterState::BleOn]);
        assert_eq!(stm.state(), AdapterState::BleOn);
    }

    #[test]
    fn test_no_le_goes_straight_to_turning_on() {
        let mut stm = AdapterStateMachine::new(true, false);
        let effects = stm.process_event(FsmEvent::SysTurnOn);
        assert_eq!(entered_states(&effects), vec![AdapterState::TurningOn]);
    }

    #[test]
    fn test_full_disable_sequence() {
        let mut stm = AdapterStateMachine::new(true, true);
        stm.process_event(FsmEvent::SysTurnOn);
        stm.process_event(FsmEvent::BleEnabled);
        stm.process_event(FsmEvent::BleProfileEnabled);
        stm.process_event(FsmEvent::BredrEnabled);
        stm.process_event(FsmEvent::BredrProfileEnabled);
        assert_eq!(stm.state(), AdapterState::On);

        let effects = stm.process_event(FsmEvent::SysTurnOff);
        assert_eq!(entered_states(&effects), vec![AdapterState::TurningOff]);

        let effects = stm.process_event(FsmEvent::BredrProfileDisabled);
        assert_eq!(effects, vec![FsmEffect::DisableStack]);

        let effects = stm.process_event(FsmEvent::BredrDisabled);
        assert_eq!(entered_states(&effects), vec![AdapterState::BleTurningOff]);

        let effects = stm.process_event(FsmEvent::BleProfileDisabled);
        assert_eq!(effects, vec![FsmEffect::DisableLeStack]);

        let effects = stm.process_event(FsmEvent::BleDisabled);
        assert_eq!(entered_states(&effects), vec![AdapterState::Off]);
    }

    #[test]
    fn test_enable_timeout_backs_out() {
        let mut stm = AdapterStateMachine::new(true, true);
        stm.process_event(FsmEvent::TurnOnBle);
        let effects = stm.process_event(FsmEvent::BleEnableTimeout);
        assert_eq!(entered_states(&effects), vec![AdapterState::Off]);

        // BR/EDR enable timeout retreats to BleOn, not Off.
        stm.process_event(FsmEvent::TurnOnBle);
        stm.process_event(FsmEvent::BleEnabled);
        stm.process_event(FsmEvent::BleProfileEnabled);
        stm.process_event(FsmEvent::SysTurnOn);
        assert_eq!(stm.state(), AdapterState::TurningOn);
        let effects = stm.process_event(FsmEvent::BredrProfileEnableTimeout);
        assert_eq!(entered_states(&effects), vec![AdapterState::BleOn]);
    }

    #[test]
    fn test_every_state_event_pair_is_defined() {
        let events = [
            FsmEvent::SysTurnOn,
            FsmEvent::SysTurnOff,
            FsmEvent::TurnOnBle,
            FsmEvent::TurnOffBle,
            FsmEvent::BredrEnabled,
            FsmEvent::BredrDisabled,
            FsmEvent::BredrProfileEnabled,
            FsmEvent::BredrProfileDisabled,
            FsmEvent::BleEnabled,
            FsmEvent::BleDisabled,
            FsmEvent::BleProfileEnabled,
            FsmEvent::BleProfileDisabled,
            FsmEvent::BredrEnableTimeout,
            FsmEvent::BredrDisableTimeout,
            FsmEvent::BredrProfileEnableTimeout,
            FsmEvent::BredrProfileDisableTimeout,
            FsmEvent::BleEnableTimeout,
            FsmEvent::BleDisableTimeout,
            FsmEvent::BleProfileEnableTimeout,
            FsmEvent::BleProfileDisableTimeout,
        ];

        // Drive every event from every reachable state; the machine must
        // accept or ignore each one without faulting.
        for seed in 0..events.len() {
            let mut stm = AdapterStateMachine::new(true, true);
            for event in events.iter().cycle().skip(seed).take(events.len() * 2) {
                let _ = stm.process_event(*event);
            }
        }
    }

    #[test]
    fn test_stray_events_ignored() {
        let mut stm = AdapterStateMachine::new(true, true);
        assert!(stm.process_event(FsmEvent::BleEnabled).is_empty());
        assert!(stm.process_event(FsmEvent::SysTurnOff).is_empty());
        assert_eq!(stm.state(), AdapterState::Off);
    }
}
