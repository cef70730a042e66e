// Mode controller task: the single consumer of the ordered event channel.
//
// Events go through the pure ModeMachine; the returned commands are carried
// out here. Outcomes of command execution (commit results, start failures)
// are fed back through a local follow-up queue, which is drained before the
// next channel receive so transitions stay strictly ordered.

use std::collections::VecDeque;

use log::{debug, error, info, warn};

use lark_shared::{Command, ControllerEvent, ModeMachine, Subsystem};

use crate::ble_server::ConfigService;
use crate::system_state::{CONTROLLER_EVENT_CHANNEL, SYSTEM_STATE};
use crate::wifi_client::{StationCommand, STATION_COMMAND_CHANNEL};
use crate::wifi_storage::WifiStorage;

#[embassy_executor::task]
pub async fn controller_task(mut config_service: ConfigService, mut storage: WifiStorage) {
    let stored = storage.load();
    if stored.has_network_identity() {
        info!("stored credentials found for ssid '{}'", stored.ssid);
    } else {
        info!("no stored credentials, entering configuration mode");
    }

    let (mut machine, boot_commands) = ModeMachine::boot(stored);
    publish_state(&machine).await;

    let mut follow_ups: VecDeque<ControllerEvent> = VecDeque::new();
    for command in boot_commands {
        if let Some(event) = execute_command(&mut config_service, &mut storage, command).await {
            follow_ups.push_back(event);
        }
    }

    loop {
        let event = match follow_ups.pop_front() {
            Some(event) => event,
            None => CONTROLLER_EVENT_CHANNEL.receive().await,
        };
        debug!("controller event: {}", event_name(&event));

        let commands = machine.handle(event);
        publish_state(&machine).await;

        for command in commands {
            if let Some(event) = execute_command(&mut config_service, &mut storage, command).await
            {
                follow_ups.push_back(event);
            }
        }
    }
}

// Event payloads carry credentials; log names only.
fn event_name(event: &ControllerEvent) -> &'static str {
    match event {
        ControllerEvent::LongPressDetected => "long-press",
        ControllerEvent::CredentialsComplete(_) => "credentials-complete",
        ControllerEvent::ExitRequested(_) => "exit-requested",
        ControllerEvent::LinkUp(_) => "link-up",
        ControllerEvent::LinkDown => "link-down",
        ControllerEvent::CommitSucceeded => "commit-succeeded",
        ControllerEvent::CommitFailed => "commit-failed",
        ControllerEvent::StartFailed(Subsystem::ConfigService) => "config-service-start-failed",
        ControllerEvent::StartFailed(Subsystem::Station) => "station-start-failed",
    }
}

async fn execute_command(
    config_service: &mut ConfigService,
    storage: &mut WifiStorage,
    command: Command,
) -> Option<ControllerEvent> {
    match command {
        Command::StartConfigService => match config_service.start().await {
            Ok(()) => None,
            Err(e) => {
                error!("configuration service start failed: {}", e);
                Some(ControllerEvent::StartFailed(Subsystem::ConfigService))
            }
        },
        Command::StopConfigService => {
            if let Err(e) = config_service.stop().await {
                warn!("configuration service stop reported: {}", e);
            }
            None
        }
        Command::ConnectStation(credentials) => {
            STATION_COMMAND_CHANNEL
                .send(StationCommand::Connect(credentials))
                .await;
            None
        }
        Command::StopStation => {
            STATION_COMMAND_CHANNEL.send(StationCommand::Stop).await;
            None
        }
        Command::CommitCredentials(credentials) => match storage.commit(&credentials) {
            Ok(()) => Some(ControllerEvent::CommitSucceeded),
            Err(e) => {
                error!("credential commit failed: {:?}", e);
                Some(ControllerEvent::CommitFailed)
            }
        },
    }
}

async fn publish_state(machine: &ModeMachine) {
    let mut state = SYSTEM_STATE.lock().await;
    state.mode = machine.state();
    state.credentials = machine.credentials().clone();
}
