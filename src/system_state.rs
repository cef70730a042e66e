// Cross-task coordination: the single ordered event channel consumed by the
// mode controller, and the observable system snapshot it publishes.
//
// Producers only enqueue; nothing outside the controller task mutates the
// mode. StatusReporter reads the snapshot without side effects.

use std::net::Ipv4Addr;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use log::{error, warn};

use lark_shared::{ControllerEvent, Credentials, ModeState};

const CONTROLLER_EVENT_QUEUE_SIZE: usize = 16;

/// The one ordered event channel into the mode controller.
pub static CONTROLLER_EVENT_CHANNEL: Channel<
    CriticalSectionRawMutex,
    ControllerEvent,
    CONTROLLER_EVENT_QUEUE_SIZE,
> = Channel::new();

/// Observable system snapshot, written by the controller (mode,
/// credentials) and the station task (link flag), read by StatusReporter.
pub static SYSTEM_STATE: Mutex<CriticalSectionRawMutex, SystemState> =
    Mutex::new(SystemState::new());

#[derive(Clone, Debug)]
pub struct SystemState {
    pub mode: ModeState,
    pub wifi_connected: bool,
    pub wifi_ip: Option<Ipv4Addr>,
    pub credentials: Credentials,
}

impl SystemState {
    pub const fn new() -> Self {
        Self {
            mode: ModeState::Idle,
            wifi_connected: false,
            wifi_ip: None,
            credentials: Credentials {
                ssid: String::new(),
                password: String::new(),
                meas_freq: String::new(),
                send_freq: String::new(),
                mqtt_broker: String::new(),
            },
        }
    }
}

// Event priority classification for backpressure handling
#[derive(Debug, Clone, Copy, PartialEq)]
enum EventPriority {
    Critical, // must never be dropped (session results, commit outcomes, toggles)
    Normal,   // re-emitted or re-derivable (link state, start failures)
}

fn classify_event_priority(event: &ControllerEvent) -> EventPriority {
    match event {
        ControllerEvent::LongPressDetected
        | ControllerEvent::CredentialsComplete(_)
        | ControllerEvent::ExitRequested(_)
        | ControllerEvent::CommitSucceeded
        | ControllerEvent::CommitFailed => EventPriority::Critical,
        ControllerEvent::LinkUp(_)
        | ControllerEvent::LinkDown
        | ControllerEvent::StartFailed(_) => EventPriority::Normal,
    }
}

/// Enqueue an event for the controller without blocking the producer.
///
/// Critical events evict the oldest queued event rather than be dropped;
/// normal events are dropped under load.
pub fn send_controller_event(event: ControllerEvent) {
    match classify_event_priority(&event) {
        EventPriority::Critical => {
            if CONTROLLER_EVENT_CHANNEL.try_send(event.clone()).is_err() {
                warn!("controller channel full, evicting one event for a critical one");
                let _ = CONTROLLER_EVENT_CHANNEL.try_receive();
                if CONTROLLER_EVENT_CHANNEL.try_send(event).is_err() {
                    error!("failed to enqueue critical controller event after eviction");
                }
            }
        }
        EventPriority::Normal => {
            if CONTROLLER_EVENT_CHANNEL.try_send(event).is_err() {
                warn!("controller channel full, dropping low-priority event");
            }
        }
    }
}
