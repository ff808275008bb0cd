//! Connection state machine
//!
//! Tracks the lifecycle of the network subsystem: joining the WiFi network,
//! opening the listener, serving clients and verifying the link. The
//! subsystem feeds it [`SystemEvent`]s; it answers with the transition taken
//! and owns the alarm used for delayed transitions.

use crate::alarm::Alarm;
use crate::config::{VERIFY_CONNECTION_EVERY_MS, WIFI_CONNECT_RETRY_MS};
use crate::println;
use crate::transport::LinkStatus;
use embassy_time::{Duration, Instant};

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not set up yet
    Invalid,
    /// Need to issue a join request
    Disconnected,
    /// Join issued, watching the link status
    Connecting,
    /// Link is up, listener not open yet
    Connected,
    /// Deciding what to do next while serving
    PreIdle,
    /// Nothing to do until a callback or the verify timer wakes us
    Idle,
    ProcessClientData,
    VerifyConnected,
    /// Delay before continuing in `state_after_wait`
    Waiting,
    /// Unrecoverable error, nothing runs anymore
    Halted,
}

/// Events driving the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    SystemStarted,
    JoinIssued,
    LinkUp,
    JoinFailed,
    ServerListening,
    ClientDataPending,
    VerifyDue,
    NothingPending,
    ClientDataProcessed,
    LinkStillUp,
    LinkLost,
    WaitElapsed,
    FatalError,
}

/// State transition result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// Keep the current state
    Stay,
    /// Move to a new state
    Transition(ConnectionState),
    /// Move to a new state and reset the retry count
    TransitionWithReset(ConnectionState),
    /// Wait for the given delay, then continue in the given state
    WaitThen(ConnectionState, Duration),
}

/// An event to apply later, only if the machine is still in `expected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeferredTransition {
    pub expected: ConnectionState,
    pub event: SystemEvent,
}

pub struct ConnectionStateMachine {
    current_state: ConnectionState,
    previous_state: Option<ConnectionState>,
    state_after_wait: ConnectionState,
    alarm: Alarm<DeferredTransition>,
    verify_needed: bool,
    last_link_status: Option<LinkStatus>,
    retry_count: u32,
}

impl ConnectionStateMachine {
    pub const fn new() -> Self {
        Self {
            current_state: ConnectionState::Invalid,
            previous_state: None,
            state_after_wait: ConnectionState::Invalid,
            alarm: Alarm::new(),
            verify_needed: false,
            last_link_status: None,
            retry_count: 0,
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.current_state
    }

    pub fn previous_state(&self) -> Option<ConnectionState> {
        self.previous_state
    }

    /// Failed joins since the link was last up
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn verify_needed(&self) -> bool {
        self.verify_needed
    }

    /// Listener is open and clients may be connected
    pub fn is_serving(&self) -> bool {
        matches!(
            self.current_state,
            ConnectionState::PreIdle
                | ConnectionState::Idle
                | ConnectionState::ProcessClientData
                | ConnectionState::VerifyConnected
        )
    }

    /// Whether a `work()` pass at `now` would do anything
    pub fn has_work(&self, now: Instant) -> bool {
        match self.current_state {
            ConnectionState::Idle | ConnectionState::Waiting => self.alarm.is_due(now),
            ConnectionState::Invalid | ConnectionState::Halted => false,
            _ => true,
        }
    }

    /// Process an event at time `now`
    pub fn handle_event(&mut self, event: SystemEvent, now: Instant) -> StateTransition {
        let transition = self.get_state_transition(self.current_state, event);
        if event == SystemEvent::JoinFailed {
            self.retry_count = self.retry_count.saturating_add(1);
        }

        match transition {
            StateTransition::Transition(new_state) => {
                self.transition_to_state(new_state);
            }
            StateTransition::TransitionWithReset(new_state) => {
                self.retry_count = 0;
                self.transition_to_state(new_state);
            }
            StateTransition::WaitThen(after_wait, delay) => {
                self.state_after_wait = after_wait;
                self.transition_to_state(ConnectionState::Waiting);
                self.alarm.set_timeout(
                    now,
                    delay,
                    DeferredTransition {
                        expected: ConnectionState::Waiting,
                        event: SystemEvent::WaitElapsed,
                    },
                );
            }
            StateTransition::Stay => {}
        }

        transition
    }

    /// Leave `Idle` because a callback brought client work.
    ///
    /// Does nothing in any other state. No timer is involved, so unlike
    /// [`Self::handle_event`] this needs no timestamp.
    pub fn wake(&mut self) -> bool {
        if self.current_state != ConnectionState::Idle {
            return false;
        }
        match self.get_state_transition(self.current_state, SystemEvent::ClientDataPending) {
            StateTransition::Transition(new_state) => {
                self.transition_to_state(new_state);
                true
            }
            _ => false,
        }
    }

    /// Fire the alarm if due. Returns true when it fired.
    pub fn poll_timer(&mut self, now: Instant) -> bool {
        let Some(deferred) = self.alarm.poll(now) else {
            return false;
        };
        if deferred.event == SystemEvent::VerifyDue {
            self.verify_needed = true;
        }
        // Only act if nothing else moved the machine since the alarm was set
        if self.current_state == deferred.expected {
            self.handle_event(deferred.event, now);
        }
        true
    }

    /// Arm the periodic link check unless one is already pending
    pub fn schedule_verify(&mut self, now: Instant) {
        if self.alarm.is_armed() {
            return;
        }
        self.alarm.set_timeout(
            now,
            Duration::from_millis(VERIFY_CONNECTION_EVERY_MS),
            DeferredTransition {
                expected: ConnectionState::Idle,
                event: SystemEvent::VerifyDue,
            },
        );
    }

    /// Record a freshly polled link status. Returns false if it did not change.
    pub fn link_status_changed(&mut self, status: LinkStatus) -> bool {
        if self.last_link_status == Some(status) {
            return false;
        }
        self.last_link_status = Some(status);
        true
    }

    fn transition_to_state(&mut self, new_state: ConnectionState) {
        if new_state == self.current_state {
            return;
        }

        match new_state {
            // Entered on every pass while serving
            ConnectionState::PreIdle
            | ConnectionState::Idle
            | ConnectionState::ProcessClientData => {}
            ConnectionState::Halted => println!("[STATE] error: network subsystem halted"),
            _ => println!("[STATE] {:?} -> {:?}", self.current_state, new_state),
        }

        match new_state {
            ConnectionState::Disconnected => {
                self.alarm.cancel();
                self.verify_needed = false;
                self.last_link_status = None;
            }
            ConnectionState::VerifyConnected => {
                self.verify_needed = false;
            }
            _ => {}
        }

        self.previous_state = Some(self.current_state);
        self.current_state = new_state;
    }

    fn get_state_transition(
        &self,
        current_state: ConnectionState,
        event: SystemEvent,
    ) -> StateTransition {
        use ConnectionState as S;
        use SystemEvent as E;

        match (current_state, event) {
            (S::Halted, _) => StateTransition::Stay,
            (_, E::FatalError) => StateTransition::Transition(S::Halted),

            (S::Invalid, E::SystemStarted) => StateTransition::Transition(S::Disconnected),

            // Join flow
            (S::Disconnected, E::JoinIssued) => StateTransition::Transition(S::Connecting),
            (S::Connecting, E::LinkUp) => StateTransition::TransitionWithReset(S::Connected),
            (S::Connecting, E::JoinFailed) => StateTransition::WaitThen(
                S::Disconnected,
                Duration::from_millis(WIFI_CONNECT_RETRY_MS),
            ),
            (S::Waiting, E::WaitElapsed) => StateTransition::Transition(self.state_after_wait),

            (S::Connected, E::ServerListening) => StateTransition::Transition(S::PreIdle),

            // Serving loop
            (S::PreIdle | S::Idle, E::ClientDataPending) => {
                StateTransition::Transition(S::ProcessClientData)
            }
            (S::PreIdle | S::Idle, E::VerifyDue) => {
                StateTransition::Transition(S::VerifyConnected)
            }
            (S::PreIdle, E::NothingPending) => StateTransition::Transition(S::Idle),
            (S::ProcessClientData, E::ClientDataProcessed) => {
                StateTransition::Transition(S::PreIdle)
            }
            (S::VerifyConnected, E::LinkStillUp) => StateTransition::Transition(S::PreIdle),
            (S::VerifyConnected, E::LinkLost) => StateTransition::Transition(S::Disconnected),

            _ => StateTransition::Stay,
        }
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: u64) -> Instant {
        Instant::from_millis(millis)
    }

    fn serving_machine() -> ConnectionStateMachine {
        let mut machine = ConnectionStateMachine::new();
        for event in [
            SystemEvent::SystemStarted,
            SystemEvent::JoinIssued,
            SystemEvent::LinkUp,
            SystemEvent::ServerListening,
        ] {
            machine.handle_event(event, at(0));
        }
        machine
    }

    #[test]
    fn join_flow_reaches_serving() {
        let machine = serving_machine();
        assert_eq!(machine.current_state(), ConnectionState::PreIdle);
        assert_eq!(machine.previous_state(), Some(ConnectionState::Connected));
        assert!(machine.is_serving());
    }

    #[test]
    fn failed_join_waits_then_retries() {
        let mut machine = ConnectionStateMachine::new();
        machine.handle_event(SystemEvent::SystemStarted, at(0));
        machine.handle_event(SystemEvent::JoinIssued, at(0));

        let transition = machine.handle_event(SystemEvent::JoinFailed, at(100));
        assert_eq!(
            transition,
            StateTransition::WaitThen(
                ConnectionState::Disconnected,
                Duration::from_millis(WIFI_CONNECT_RETRY_MS)
            )
        );
        assert_eq!(machine.current_state(), ConnectionState::Waiting);
        assert!(!machine.has_work(at(100)));

        assert!(!machine.poll_timer(at(100 + WIFI_CONNECT_RETRY_MS - 1)));
        assert_eq!(machine.current_state(), ConnectionState::Waiting);

        assert!(machine.poll_timer(at(100 + WIFI_CONNECT_RETRY_MS)));
        assert_eq!(machine.current_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn stale_wait_alarm_does_not_override_current_state() {
        let mut machine = ConnectionStateMachine::new();
        machine.handle_event(SystemEvent::SystemStarted, at(0));
        machine.handle_event(SystemEvent::JoinIssued, at(0));
        machine.handle_event(SystemEvent::JoinFailed, at(0));

        // Something else moved the machine on before the alarm fired
        machine.handle_event(SystemEvent::FatalError, at(10));
        assert_eq!(machine.current_state(), ConnectionState::Halted);
        assert!(machine.poll_timer(at(WIFI_CONNECT_RETRY_MS)));
        assert_eq!(machine.current_state(), ConnectionState::Halted);
    }

    #[test]
    fn verify_timer_wakes_idle_machine() {
        let mut machine = serving_machine();
        machine.handle_event(SystemEvent::NothingPending, at(0));
        machine.schedule_verify(at(0));
        assert_eq!(machine.current_state(), ConnectionState::Idle);
        assert!(!machine.has_work(at(999)));
        assert!(machine.has_work(at(VERIFY_CONNECTION_EVERY_MS)));

        assert!(machine.poll_timer(at(VERIFY_CONNECTION_EVERY_MS)));
        assert_eq!(machine.current_state(), ConnectionState::VerifyConnected);
        assert!(!machine.verify_needed());
    }

    #[test]
    fn verify_timer_while_busy_only_flags() {
        let mut machine = serving_machine();
        machine.schedule_verify(at(0));
        machine.handle_event(SystemEvent::ClientDataPending, at(10));

        assert!(machine.poll_timer(at(VERIFY_CONNECTION_EVERY_MS)));
        assert_eq!(machine.current_state(), ConnectionState::ProcessClientData);
        assert!(machine.verify_needed());

        machine.handle_event(SystemEvent::ClientDataProcessed, at(1001));
        machine.handle_event(SystemEvent::VerifyDue, at(1001));
        assert_eq!(machine.current_state(), ConnectionState::VerifyConnected);
    }

    #[test]
    fn wake_only_leaves_idle() {
        let mut machine = serving_machine();
        assert!(!machine.wake());
        assert_eq!(machine.current_state(), ConnectionState::PreIdle);

        machine.handle_event(SystemEvent::NothingPending, at(0));
        machine.schedule_verify(at(0));
        assert!(machine.wake());
        assert_eq!(machine.current_state(), ConnectionState::ProcessClientData);

        // The verify alarm armed while idle is still pending
        assert!(machine.poll_timer(at(VERIFY_CONNECTION_EVERY_MS)));
        assert!(machine.verify_needed());
    }

    #[test]
    fn link_loss_returns_to_disconnected() {
        let mut machine = serving_machine();
        machine.handle_event(SystemEvent::VerifyDue, at(0));
        machine.handle_event(SystemEvent::LinkLost, at(0));
        assert_eq!(machine.current_state(), ConnectionState::Disconnected);
        assert!(!machine.is_serving());
    }

    #[test]
    fn link_status_changes_are_reported_once() {
        let mut machine = ConnectionStateMachine::new();
        assert!(machine.link_status_changed(LinkStatus::Joining));
        assert!(!machine.link_status_changed(LinkStatus::Joining));
        assert!(machine.link_status_changed(LinkStatus::NoIp));
    }

    #[test]
    fn retry_count_resets_when_link_comes_up() {
        let mut machine = ConnectionStateMachine::new();
        machine.handle_event(SystemEvent::SystemStarted, at(0));
        machine.handle_event(SystemEvent::JoinIssued, at(0));
        machine.handle_event(SystemEvent::JoinFailed, at(0));
        assert_eq!(machine.retry_count(), 1);

        machine.poll_timer(at(WIFI_CONNECT_RETRY_MS));
        machine.handle_event(SystemEvent::JoinIssued, at(WIFI_CONNECT_RETRY_MS));
        machine.handle_event(SystemEvent::LinkUp, at(WIFI_CONNECT_RETRY_MS));
        assert_eq!(machine.retry_count(), 0);
        assert_eq!(machine.current_state(), ConnectionState::Connected);
    }

    #[test]
    fn unrelated_events_keep_state() {
        let mut machine = serving_machine();
        assert_eq!(
            machine.handle_event(SystemEvent::LinkUp, at(0)),
            StateTransition::Stay
        );
        assert_eq!(machine.current_state(), ConnectionState::PreIdle);
    }
}
