// Station-mode connection manager.
//
// A dedicated task owns the WiFi driver for its whole life. The mode
// controller commands it over STATION_COMMAND_CHANNEL and hears back
// through the controller event channel (LinkUp/LinkDown); nothing else
// touches the driver.

use std::net::Ipv4Addr;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::modem::WifiModem;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sys::EspError;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{error, info, warn};

use lark_shared::{ControllerEvent, Credentials, RetryPolicy, Subsystem};

use crate::system_state::{send_controller_event, SYSTEM_STATE};

/// Commands from the mode controller.
#[derive(Debug)]
pub enum StationCommand {
    Connect(Credentials),
    Stop,
}

pub static STATION_COMMAND_CHANNEL: Channel<CriticalSectionRawMutex, StationCommand, 4> =
    Channel::new();

const ATTACH_TIMEOUT_SECS: u64 = 10;
const ATTACH_POLL_INTERVAL_MS: u64 = 500;
const LINK_POLL_INTERVAL_MS: u64 = 2000;

/// Wraps the ESP-IDF station client with attach/monitor logic.
pub struct WifiClient {
    wifi: BlockingWifi<EspWifi<'static>>,
}

impl WifiClient {
    pub fn new(
        modem: WifiModem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> Result<Self, EspError> {
        let wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let wifi = BlockingWifi::wrap(wifi, sys_loop)?;
        Ok(Self { wifi })
    }

    fn configure(&mut self, credentials: &Credentials) -> Result<(), EspError> {
        let config = Configuration::Client(ClientConfiguration {
            ssid: credentials.ssid.as_str().try_into().map_err(|_| {
                error!("ssid does not fit the station configuration");
                EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_INVALID_ARG }>()
            })?,
            password: credentials.password.as_str().try_into().map_err(|_| {
                error!("password does not fit the station configuration");
                EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_INVALID_ARG }>()
            })?,
            channel: None,
            auth_method: determine_auth_method(&credentials.password),
            ..Default::default()
        });
        self.wifi.set_configuration(&config)?;
        Ok(())
    }

    /// One attach attempt: start the driver if needed, connect, wait for an
    /// address.
    async fn try_attach(&mut self, timeout: Duration) -> Result<Ipv4Addr, EspError> {
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        self.wifi.connect()?;

        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.wifi.is_connected()? {
                let ip_info = self.wifi.wifi().sta_netif().get_ip_info()?;
                if !ip_info.ip.is_unspecified() {
                    return Ok(ip_info.ip);
                }
            }
            Timer::after(Duration::from_millis(ATTACH_POLL_INTERVAL_MS)).await;
        }
        Err(EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_TIMEOUT }>())
    }

    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    /// Tear the station client down; safe to call when already stopped.
    fn teardown(&mut self) -> Result<(), EspError> {
        if self.wifi.is_connected()? {
            self.wifi.disconnect()?;
        }
        if self.wifi.is_started()? {
            self.wifi.stop()?;
        }
        Ok(())
    }
}

fn determine_auth_method(password: &str) -> AuthMethod {
    if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    }
}

enum MonitorExit {
    LinkLost,
    Stopped,
    Superseded(Credentials),
}

enum RunOutcome {
    Stopped,
    Superseded(Credentials),
    GaveUp,
}

async fn set_link_state(connected: bool, ip: Option<Ipv4Addr>) {
    let mut state = SYSTEM_STATE.lock().await;
    state.wifi_connected = connected;
    state.wifi_ip = ip;
}

/// Watch an established link, reacting to controller commands.
async fn monitor_link(client: &mut WifiClient) -> MonitorExit {
    loop {
        match select(
            Timer::after(Duration::from_millis(LINK_POLL_INTERVAL_MS)),
            STATION_COMMAND_CHANNEL.receive(),
        )
        .await
        {
            Either::First(()) => {
                if !client.is_connected() {
                    return MonitorExit::LinkLost;
                }
            }
            Either::Second(StationCommand::Stop) => return MonitorExit::Stopped,
            Either::Second(StationCommand::Connect(credentials)) => {
                return MonitorExit::Superseded(credentials)
            }
        }
    }
}

/// Drive one connection: attach with backoff, then monitor until the link
/// drops (re-attach) or a command ends the run.
async fn run_station(
    client: &mut WifiClient,
    credentials: Credentials,
    policy: RetryPolicy,
) -> RunOutcome {
    info!("station attach requested for ssid '{}'", credentials.ssid);

    if let Err(e) = client.configure(&credentials) {
        error!("station configuration rejected: {:?}", e);
        send_controller_event(ControllerEvent::StartFailed(Subsystem::Station));
        return RunOutcome::GaveUp;
    }

    let mut attempt: u32 = 0;
    loop {
        match client.try_attach(Duration::from_secs(ATTACH_TIMEOUT_SECS)).await {
            Ok(ip) => {
                attempt = 0;
                info!("station attached, ip {}", ip);
                set_link_state(true, Some(ip)).await;
                send_controller_event(ControllerEvent::LinkUp(ip));

                match monitor_link(client).await {
                    MonitorExit::LinkLost => {
                        warn!("station link lost, re-attaching");
                        set_link_state(false, None).await;
                        send_controller_event(ControllerEvent::LinkDown);
                        // fall through into the attach loop
                    }
                    MonitorExit::Stopped => {
                        if let Err(e) = client.teardown() {
                            warn!("station teardown reported: {:?}", e);
                        }
                        set_link_state(false, None).await;
                        info!("station stopped");
                        return RunOutcome::Stopped;
                    }
                    MonitorExit::Superseded(new_credentials) => {
                        set_link_state(false, None).await;
                        return RunOutcome::Superseded(new_credentials);
                    }
                }
            }
            Err(e) => {
                warn!("station attach failed: {:?}", e);
                if !policy.allows(attempt) {
                    error!("station attach retries exhausted");
                    send_controller_event(ControllerEvent::LinkDown);
                    return RunOutcome::GaveUp;
                }
                let delay = policy.delay_ms(attempt);
                attempt = attempt.saturating_add(1);
                info!("retrying station attach in {} ms", delay);

                // back off, but react to commands immediately
                match select(
                    Timer::after(Duration::from_millis(delay)),
                    STATION_COMMAND_CHANNEL.receive(),
                )
                .await
                {
                    Either::First(()) => {}
                    Either::Second(StationCommand::Stop) => {
                        if let Err(e) = client.teardown() {
                            warn!("station teardown reported: {:?}", e);
                        }
                        return RunOutcome::Stopped;
                    }
                    Either::Second(StationCommand::Connect(new_credentials)) => {
                        return RunOutcome::Superseded(new_credentials)
                    }
                }
            }
        }
    }
}

#[embassy_executor::task]
pub async fn station_task(
    modem: WifiModem,
    sys_loop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
) {
    let mut client = match WifiClient::new(modem, sys_loop, nvs) {
        Ok(client) => client,
        Err(e) => {
            error!("wifi client initialization failed: {:?}", e);
            send_controller_event(ControllerEvent::StartFailed(Subsystem::Station));
            return;
        }
    };
    info!("station task ready");

    let policy = RetryPolicy::default();
    let mut pending: Option<StationCommand> = None;
    loop {
        let command = match pending.take() {
            Some(command) => command,
            None => STATION_COMMAND_CHANNEL.receive().await,
        };
        match command {
            StationCommand::Stop => {
                // nothing running; stop is idempotent
                if let Err(e) = client.teardown() {
                    warn!("station teardown reported: {:?}", e);
                }
            }
            StationCommand::Connect(credentials) => {
                match run_station(&mut client, credentials, policy).await {
                    RunOutcome::Stopped | RunOutcome::GaveUp => {}
                    RunOutcome::Superseded(credentials) => {
                        pending = Some(StationCommand::Connect(credentials));
                    }
                }
            }
        }
    }
}
