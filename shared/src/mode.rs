// Central mode state machine.
//
// The machine is pure: events in, commands out. The controller task owns
// the single instance, feeds it from the ordered event channel and executes
// the returned commands, so every transition is serialized by construction.

use std::net::Ipv4Addr;

use log::{debug, warn};
use serde::Serialize;

use crate::credentials::Credentials;
use crate::session::CompletedDraft;

/// Operating mode of the device. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModeState {
    Idle,
    ProvisioningActive,
    CredentialsPending,
    Connecting,
    Connected,
    Reconnecting,
}

impl ModeState {
    pub fn as_str(self) -> &'static str {
        match self {
            ModeState::Idle => "idle",
            ModeState::ProvisioningActive => "provisioning",
            ModeState::CredentialsPending => "credentials-pending",
            ModeState::Connecting => "connecting",
            ModeState::Connected => "connected",
            ModeState::Reconnecting => "reconnecting",
        }
    }

    fn is_provisioning(self) -> bool {
        matches!(self, ModeState::ProvisioningActive | ModeState::CredentialsPending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    ConfigService,
    Station,
}

/// Everything the controller can react to, as one closed set.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    LongPressDetected,
    CredentialsComplete(CompletedDraft),
    ExitRequested(CompletedDraft),
    LinkUp(Ipv4Addr),
    LinkDown,
    CommitSucceeded,
    CommitFailed,
    /// A subsystem failed to start; non-fatal.
    StartFailed(Subsystem),
}

/// Side effects the controller must carry out after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StartConfigService,
    StopConfigService,
    ConnectStation(Credentials),
    StopStation,
    CommitCredentials(Credentials),
}

/// The mode controller's state machine.
#[derive(Debug)]
pub struct ModeMachine {
    state: ModeState,
    stored: Credentials,
    pending_commit: Option<Credentials>,
}

impl ModeMachine {
    /// Boot: provision when no usable credentials are stored, otherwise go
    /// straight to a station attach.
    pub fn boot(stored: Credentials) -> (Self, Vec<Command>) {
        let (state, commands) = if stored.has_network_identity() {
            (ModeState::Connecting, vec![Command::ConnectStation(stored.clone())])
        } else {
            (ModeState::ProvisioningActive, vec![Command::StartConfigService])
        };
        (Self { state, stored, pending_commit: None }, commands)
    }

    pub fn state(&self) -> ModeState {
        self.state
    }

    /// Committed credentials as of the last successful commit (or boot).
    pub fn credentials(&self) -> &Credentials {
        &self.stored
    }

    pub fn handle(&mut self, event: ControllerEvent) -> Vec<Command> {
        match event {
            ControllerEvent::LongPressDetected => self.on_long_press(),
            ControllerEvent::CredentialsComplete(draft) => self.on_session_done(draft, false),
            ControllerEvent::ExitRequested(draft) => self.on_session_done(draft, true),
            ControllerEvent::LinkUp(_) => {
                if matches!(self.state, ModeState::Connecting | ModeState::Reconnecting) {
                    self.state = ModeState::Connected;
                }
                Vec::new()
            }
            ControllerEvent::LinkDown => {
                // the station task keeps retrying on its own
                if matches!(self.state, ModeState::Connected | ModeState::Connecting) {
                    self.state = ModeState::Reconnecting;
                }
                Vec::new()
            }
            ControllerEvent::CommitSucceeded => self.on_commit_succeeded(),
            ControllerEvent::CommitFailed => {
                // stay in CredentialsPending: the service keeps running and
                // a rewrite or exit request retries the commit
                self.pending_commit = None;
                Vec::new()
            }
            ControllerEvent::StartFailed(subsystem) => self.on_start_failed(subsystem),
        }
    }

    // A configuration service that never came up means provisioning did not
    // materialize: fall back to where the device would otherwise be. A
    // failed station start leaves the mode in place; a long-press or a
    // later link event moves it on.
    fn on_start_failed(&mut self, subsystem: Subsystem) -> Vec<Command> {
        if subsystem == Subsystem::ConfigService && self.state == ModeState::ProvisioningActive {
            if self.stored.has_network_identity() {
                self.state = ModeState::Connecting;
                return vec![Command::ConnectStation(self.stored.clone())];
            }
            self.state = ModeState::Idle;
        }
        Vec::new()
    }

    fn on_long_press(&mut self) -> Vec<Command> {
        if self.state.is_provisioning() {
            // toggle out of configuration mode
            let mut commands = vec![Command::StopConfigService];
            if self.stored.has_network_identity() {
                self.state = ModeState::Connecting;
                commands.push(Command::ConnectStation(self.stored.clone()));
            } else {
                self.state = ModeState::Idle;
            }
            commands
        } else {
            let mut commands = Vec::new();
            if matches!(
                self.state,
                ModeState::Connecting | ModeState::Connected | ModeState::Reconnecting
            ) {
                commands.push(Command::StopStation);
            }
            commands.push(Command::StartConfigService);
            self.state = ModeState::ProvisioningActive;
            commands
        }
    }

    fn on_session_done(&mut self, draft: CompletedDraft, exit: bool) -> Vec<Command> {
        if !self.state.is_provisioning() {
            debug!("session event outside provisioning ignored");
            return Vec::new();
        }
        let merged = draft.merge_over(&self.stored);
        if exit && !merged.has_network_identity() {
            // nothing to connect to; leave configuration mode and wait
            self.state = ModeState::Idle;
            return vec![Command::StopConfigService];
        }
        self.state = ModeState::CredentialsPending;
        self.pending_commit = Some(merged.clone());
        vec![Command::CommitCredentials(merged)]
    }

    fn on_commit_succeeded(&mut self) -> Vec<Command> {
        if self.state != ModeState::CredentialsPending {
            return Vec::new();
        }
        match self.pending_commit.take() {
            Some(committed) => {
                self.stored = committed;
                self.state = ModeState::Connecting;
                vec![
                    Command::StopConfigService,
                    Command::ConnectStation(self.stored.clone()),
                ]
            }
            None => {
                warn!("commit outcome with no pending record");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialField;
    use crate::session::ProvisioningSession;

    fn creds(ssid: &str, password: &str) -> Credentials {
        let mut c = Credentials::default();
        c.set(CredentialField::Ssid, ssid.as_bytes());
        c.set(CredentialField::Password, password.as_bytes());
        c
    }

    #[test]
    fn boot_without_credentials_starts_provisioning() {
        let (machine, commands) = ModeMachine::boot(Credentials::default());
        assert_eq!(machine.state(), ModeState::ProvisioningActive);
        assert_eq!(commands, vec![Command::StartConfigService]);
    }

    #[test]
    fn boot_with_credentials_connects() {
        let stored = creds("net", "pw");
        let (machine, commands) = ModeMachine::boot(stored.clone());
        assert_eq!(machine.state(), ModeState::Connecting);
        assert_eq!(commands, vec![Command::ConnectStation(stored)]);
    }

    #[test]
    fn full_provisioning_sequence_reaches_connecting() {
        // boot empty -> provision -> write pair -> commit -> connect
        let (mut machine, _) = ModeMachine::boot(Credentials::default());

        let mut session = ProvisioningSession::new();
        session.write_field(CredentialField::Ssid, b"net");
        let completed = session
            .write_field(CredentialField::Password, b"pw")
            .completed
            .expect("pair complete");

        let commands = machine.handle(ControllerEvent::CredentialsComplete(completed));
        assert_eq!(machine.state(), ModeState::CredentialsPending);
        assert_eq!(commands, vec![Command::CommitCredentials(creds("net", "pw"))]);

        let commands = machine.handle(ControllerEvent::CommitSucceeded);
        assert_eq!(machine.state(), ModeState::Connecting);
        assert_eq!(
            commands,
            vec![
                Command::StopConfigService,
                Command::ConnectStation(creds("net", "pw")),
            ]
        );
    }

    #[test]
    fn link_events_drive_connected_and_reconnecting() {
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));

        machine.handle(ControllerEvent::LinkUp("10.0.0.7".parse().unwrap()));
        assert_eq!(machine.state(), ModeState::Connected);

        machine.handle(ControllerEvent::LinkDown);
        assert_eq!(machine.state(), ModeState::Reconnecting);

        machine.handle(ControllerEvent::LinkUp("10.0.0.7".parse().unwrap()));
        assert_eq!(machine.state(), ModeState::Connected);
    }

    #[test]
    fn long_press_while_connected_stops_station_exactly_once() {
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));
        machine.handle(ControllerEvent::LinkUp("10.0.0.7".parse().unwrap()));

        let commands = machine.handle(ControllerEvent::LongPressDetected);
        assert_eq!(machine.state(), ModeState::ProvisioningActive);
        let stops = commands.iter().filter(|c| **c == Command::StopStation).count();
        assert_eq!(stops, 1);
        assert_eq!(commands.last(), Some(&Command::StartConfigService));
    }

    #[test]
    fn long_press_while_provisioning_toggles_back() {
        // with stored credentials the toggle returns to Connecting
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));
        machine.handle(ControllerEvent::LongPressDetected);
        assert_eq!(machine.state(), ModeState::ProvisioningActive);

        let commands = machine.handle(ControllerEvent::LongPressDetected);
        assert_eq!(machine.state(), ModeState::Connecting);
        assert_eq!(
            commands,
            vec![Command::StopConfigService, Command::ConnectStation(creds("net", "pw"))]
        );

        // without stored credentials it returns to Idle
        let (mut machine, _) = ModeMachine::boot(Credentials::default());
        let commands = machine.handle(ControllerEvent::LongPressDetected);
        assert_eq!(machine.state(), ModeState::Idle);
        assert_eq!(commands, vec![Command::StopConfigService]);
    }

    #[test]
    fn idle_long_press_enters_provisioning_without_station_stop() {
        let (mut machine, _) = ModeMachine::boot(Credentials::default());
        machine.handle(ControllerEvent::LongPressDetected); // -> Idle
        let commands = machine.handle(ControllerEvent::LongPressDetected);
        assert_eq!(machine.state(), ModeState::ProvisioningActive);
        assert_eq!(commands, vec![Command::StartConfigService]);
    }

    #[test]
    fn commit_failure_keeps_credentials_pending() {
        let (mut machine, _) = ModeMachine::boot(Credentials::default());
        let mut session = ProvisioningSession::new();
        session.write_field(CredentialField::Ssid, b"net");
        let completed = session
            .write_field(CredentialField::Password, b"pw")
            .completed
            .unwrap();
        machine.handle(ControllerEvent::CredentialsComplete(completed));

        let commands = machine.handle(ControllerEvent::CommitFailed);
        assert_eq!(machine.state(), ModeState::CredentialsPending);
        assert!(commands.is_empty());
        // the committed record is untouched
        assert_eq!(machine.credentials(), &Credentials::default());

        // a rewritten pair retries the commit
        let mut retry = ProvisioningSession::new();
        retry.write_field(CredentialField::Ssid, b"net2");
        let completed = retry
            .write_field(CredentialField::Password, b"pw2")
            .completed
            .unwrap();
        let commands = machine.handle(ControllerEvent::CredentialsComplete(completed));
        assert_eq!(commands, vec![Command::CommitCredentials(creds("net2", "pw2"))]);
    }

    #[test]
    fn exit_without_network_identity_returns_to_idle() {
        let (mut machine, _) = ModeMachine::boot(Credentials::default());
        let session = ProvisioningSession::new();
        let commands = machine.handle(ControllerEvent::ExitRequested(session.snapshot()));
        assert_eq!(machine.state(), ModeState::Idle);
        assert_eq!(commands, vec![Command::StopConfigService]);
    }

    #[test]
    fn exit_with_partial_writes_merges_over_stored() {
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));
        machine.handle(ControllerEvent::LongPressDetected); // -> provisioning

        let mut session = ProvisioningSession::new();
        session.write_field(CredentialField::MqttBroker, b"mqtt://broker");
        let commands = machine.handle(ControllerEvent::ExitRequested(session.snapshot()));

        let mut expected = creds("net", "pw");
        expected.set(CredentialField::MqttBroker, b"mqtt://broker");
        assert_eq!(commands, vec![Command::CommitCredentials(expected)]);
        assert_eq!(machine.state(), ModeState::CredentialsPending);
    }

    #[test]
    fn config_service_start_failure_falls_back_to_idle() {
        let (mut machine, _) = ModeMachine::boot(Credentials::default());
        let commands = machine.handle(ControllerEvent::StartFailed(Subsystem::ConfigService));
        assert!(commands.is_empty());
        assert_eq!(machine.state(), ModeState::Idle);
    }

    #[test]
    fn config_service_start_failure_falls_back_to_station() {
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));
        machine.handle(ControllerEvent::LinkUp("10.0.0.7".parse().unwrap()));
        machine.handle(ControllerEvent::LongPressDetected); // station stopped

        let commands = machine.handle(ControllerEvent::StartFailed(Subsystem::ConfigService));
        assert_eq!(machine.state(), ModeState::Connecting);
        assert_eq!(commands, vec![Command::ConnectStation(creds("net", "pw"))]);
    }

    #[test]
    fn station_start_failure_is_nonfatal() {
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));
        assert!(machine.handle(ControllerEvent::StartFailed(Subsystem::Station)).is_empty());
        assert_eq!(machine.state(), ModeState::Connecting);
    }

    #[test]
    fn session_events_outside_provisioning_are_ignored() {
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));
        let mut session = ProvisioningSession::new();
        session.write_field(CredentialField::Ssid, b"other");
        let completed = session
            .write_field(CredentialField::Password, b"other")
            .completed
            .unwrap();
        assert!(machine.handle(ControllerEvent::CredentialsComplete(completed)).is_empty());
        assert_eq!(machine.state(), ModeState::Connecting);
    }

    #[test]
    fn stale_commit_outcome_is_ignored() {
        let (mut machine, _) = ModeMachine::boot(creds("net", "pw"));
        assert!(machine.handle(ControllerEvent::CommitSucceeded).is_empty());
        assert_eq!(machine.state(), ModeState::Connecting);
    }
}
