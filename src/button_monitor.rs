// Mode button monitoring.
//
// GPIO0, active low with internal pull-up. The debounce/long-press state
// machine lives in lark-shared; this task only samples the line.

use anyhow::{anyhow, Result};
use embassy_time::{Duration, Timer};
use esp_idf_svc::hal::gpio::{Gpio0, Input, PinDriver, Pull};
use log::{error, info};

use lark_shared::trigger::{TriggerMonitor, LONG_PRESS_MS, POLL_INTERVAL_MS};
use lark_shared::ControllerEvent;

use crate::system_state::send_controller_event;

pub struct ButtonMonitor {
    button: PinDriver<'static, Gpio0, Input>,
}

impl ButtonMonitor {
    pub fn new(gpio0: Gpio0) -> Result<Self> {
        // Pull-up means a press reads as LOW
        let mut button = PinDriver::input(gpio0)
            .map_err(|e| anyhow!("failed to configure mode button GPIO: {}", e))?;
        button
            .set_pull(Pull::Up)
            .map_err(|e| anyhow!("failed to set pull-up on mode button GPIO: {}", e))?;
        Ok(Self { button })
    }

    pub async fn run(&mut self) {
        info!(
            "mode button monitor started (GPIO0, active low, {} ms hold)",
            LONG_PRESS_MS
        );
        let mut monitor = TriggerMonitor::new();
        loop {
            Timer::after(Duration::from_millis(POLL_INTERVAL_MS)).await;
            let pressed = self.button.is_low();
            if monitor.sample(pressed, POLL_INTERVAL_MS) {
                info!("long press detected, requesting mode toggle");
                send_controller_event(ControllerEvent::LongPressDetected);
            }
        }
    }
}

#[embassy_executor::task]
pub async fn button_task(gpio0: Gpio0) {
    match ButtonMonitor::new(gpio0) {
        Ok(mut monitor) => monitor.run().await,
        Err(e) => error!("mode button unavailable: {}", e),
    }
}
