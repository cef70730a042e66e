mod ble_server;
mod button_monitor;
mod mode_controller;
mod status_reporter;
mod system_state;
mod wifi_client;
mod wifi_storage;

use anyhow::{anyhow, Result};
use embassy_executor::Spawner;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::hal::peripherals::Peripherals;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::{error, info};

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();

    // Bind the log crate to the ESP Logging facilities
    esp_idf_svc::log::EspLogger::initialize_default();

    if let Err(e) = init(spawner).await {
        // Startup errors are logged rather than aborting; the device keeps
        // running with whatever tasks came up.
        error!("startup failed: {:?}", e);
    }
}

async fn init(spawner: Spawner) -> Result<()> {
    info!("lark starting");

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    // WiFi and Bluetooth share the modem; split it so both stacks coexist
    let (wifi_modem, bt_modem) = peripherals.modem.split();

    let storage = wifi_storage::WifiStorage::new_with_partition(nvs_partition.clone())?;
    let config_service = ble_server::ConfigService::new(bt_modem);

    spawner
        .spawn(wifi_client::station_task(wifi_modem, sys_loop, nvs_partition))
        .map_err(|e| anyhow!("spawning station task failed: {:?}", e))?;
    spawner
        .spawn(button_monitor::button_task(peripherals.pins.gpio0))
        .map_err(|e| anyhow!("spawning button task failed: {:?}", e))?;
    spawner
        .spawn(status_reporter::status_task())
        .map_err(|e| anyhow!("spawning status task failed: {:?}", e))?;
    spawner
        .spawn(mode_controller::controller_task(config_service, storage))
        .map_err(|e| anyhow!("spawning controller task failed: {:?}", e))?;

    info!("all tasks spawned");
    Ok(())
}
