// Periodic status reporting.
//
// Read-only observer: surfaces the current mode, connectivity and the
// non-secret configuration fields as one JSON log line every few seconds.

use embassy_time::{Duration, Timer};
use log::{info, warn};
use serde::Serialize;

use crate::system_state::SYSTEM_STATE;

const REPORT_INTERVAL_SECS: u64 = 3;

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    mode: &'static str,
    wifi_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ip: Option<String>,
    ssid: String,
    meas_freq: String,
    send_freq: String,
    mqtt_broker: String,
}

#[embassy_executor::task]
pub async fn status_task() {
    info!("status reporter started ({} s interval)", REPORT_INTERVAL_SECS);
    loop {
        Timer::after(Duration::from_secs(REPORT_INTERVAL_SECS)).await;

        let snapshot = {
            let state = SYSTEM_STATE.lock().await;
            StatusSnapshot {
                mode: state.mode.as_str(),
                wifi_connected: state.wifi_connected,
                ip: state.wifi_ip.map(|ip| ip.to_string()),
                ssid: state.credentials.ssid.clone(),
                meas_freq: state.credentials.meas_freq.clone(),
                send_freq: state.credentials.send_freq.clone(),
                mqtt_broker: state.credentials.mqtt_broker.clone(),
            }
        };

        match serde_json::to_string(&snapshot) {
            Ok(line) => info!("status {}", line),
            Err(e) => warn!("status snapshot serialization failed: {}", e),
        }
    }
}
