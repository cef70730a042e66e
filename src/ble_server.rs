// Configuration service: BLE GATT attribute server for credential writes,
// using real ESP-IDF Bluedroid APIs.
//
// The protocol model (attribute table, provisioning session) lives in
// lark-shared; this module owns the GATT glue. The attribute database is
// registered with the one-shot table API, handles come back in one array
// and are bound into the shared table exactly once per service start.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use embassy_time::{Duration, Timer};
use esp_idf_svc::bt::{Ble, BtDriver};
use esp_idf_svc::hal::modem::BluetoothModem;
use esp_idf_svc::sys as esp_idf_sys;
use log::{debug, error, info, warn};

use lark_shared::attr_table::{self, AttrDef, AttrKind, AttributeTable};
use lark_shared::{ControllerEvent, ProvisioningSession};

use crate::system_state::send_controller_event;

pub const DEVICE_NAME_PREFIX: &str = "Lark";

const APP_ID: u16 = 0x55;
const SVC_INST_ID: u8 = 0;

// Error types for the GATT layer, with specific ESP error codes
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigServiceError {
    DriverInitFailed(String),
    NotInitialized(String),
    EspError(esp_idf_sys::esp_err_t, String),
}

impl std::fmt::Display for ConfigServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigServiceError::DriverInitFailed(msg) => {
                write!(f, "Bluetooth driver initialization failed: {}", msg)
            }
            ConfigServiceError::NotInitialized(msg) => {
                write!(f, "configuration service not initialized: {}", msg)
            }
            ConfigServiceError::EspError(code, msg) => {
                write!(f, "ESP-IDF error {}: {}", code, msg)
            }
        }
    }
}

impl std::error::Error for ConfigServiceError {}

pub type ConfigServiceResult<T> = Result<T, ConfigServiceError>;

// Service lifecycle flags. The stopping flag is the single authority that
// suppresses disconnect-driven re-advertising during an explicit stop.
static SERVICE_ACTIVE: AtomicBool = AtomicBool::new(false);
static SERVICE_STOPPING: AtomicBool = AtomicBool::new(false);
static ADVERTISING: AtomicBool = AtomicBool::new(false);
static GATT_INTERFACE: AtomicU8 = AtomicU8::new(0);

// GATT constant attribute storage, referenced by the attribute database
static PRIMARY_SERVICE_UUID: u16 = esp_idf_sys::ESP_GATT_UUID_PRI_SERVICE as u16;
static CHARACTER_DECLARATION_UUID: u16 = esp_idf_sys::ESP_GATT_UUID_CHAR_DECLARE as u16;
static CHARACTER_DESCRIPTION_UUID: u16 = esp_idf_sys::ESP_GATT_UUID_CHAR_DESCRIPTION as u16;
static CONFIG_SERVICE_UUID_VALUE: u16 = attr_table::CONFIG_SERVICE_UUID;
static CHAR_PROP_READ_WRITE: u8 = (esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_READ
    | esp_idf_sys::ESP_GATT_CHAR_PROP_BIT_WRITE) as u8;

static SLOT_UUIDS: [u16; 6] = [
    attr_table::SSID_CHAR_UUID,
    attr_table::PASSWORD_CHAR_UUID,
    attr_table::MEAS_FREQ_CHAR_UUID,
    attr_table::SEND_FREQ_CHAR_UUID,
    attr_table::MQTT_BROKER_CHAR_UUID,
    attr_table::EXIT_CONTROL_CHAR_UUID,
];

// 16-bit service identifier embedded in the Bluetooth base UUID for the
// advertising payload
static ADV_SERVICE_UUID128: [u8; 16] = [
    0xfb, 0x34, 0x9b, 0x5f, 0x80, 0x00, 0x00, 0x80,
    0x00, 0x10, 0x00, 0x00,
    (attr_table::CONFIG_SERVICE_UUID & 0xFF) as u8,
    ((attr_table::CONFIG_SERVICE_UUID >> 8) & 0xFF) as u8,
    0x00, 0x00,
];

// Thread-safe service state accessible from the C callbacks
struct ConfigServiceState {
    session: ProvisioningSession,
    table: AttributeTable,
    conn_id: Option<u16>,
    device_name: String,
}

impl ConfigServiceState {
    fn new() -> Self {
        Self {
            session: ProvisioningSession::new(),
            table: attr_table::config_service_table(),
            conn_id: None,
            device_name: String::new(),
        }
    }

    // Fresh session and table for a new service start
    fn reset_for_start(&mut self, device_name: String) {
        self.session = ProvisioningSession::new();
        self.table = attr_table::config_service_table();
        self.conn_id = None;
        self.device_name = device_name;
    }
}

static GLOBAL_CONFIG_STATE: OnceLock<Arc<Mutex<ConfigServiceState>>> = OnceLock::new();

/// Thread-safe and panic-safe access to the service state from callbacks.
///
/// Returns `None` if the state is not initialized or the mutex is
/// poisoned; panics are handled at the callback level with catch_unwind.
fn with_config_state<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut ConfigServiceState) -> R,
{
    let state_arc = GLOBAL_CONFIG_STATE.get()?;
    let mut state = state_arc.lock().ok()?;
    Some(f(&mut state))
}

// Long Write (prepare write) reassembly buffers, one per connection
const MAX_PREPARE_WRITE_BUFFER_SIZE: usize = 256;

#[derive(Debug)]
struct PrepareWriteBuffer {
    data: Vec<u8>,
    last_offset: u16,
    char_handle: u16,
}

impl PrepareWriteBuffer {
    fn new(char_handle: u16) -> Self {
        Self { data: Vec::new(), last_offset: 0, char_handle }
    }

    fn append_chunk(&mut self, offset: u16, chunk: &[u8]) -> Result<(), String> {
        if offset != self.last_offset {
            return Err(format!(
                "non-sequential prepare write: expected offset {}, got {}",
                self.last_offset, offset
            ));
        }
        if self.data.len() + chunk.len() > MAX_PREPARE_WRITE_BUFFER_SIZE {
            return Err(format!(
                "prepare write buffer would exceed {} bytes",
                MAX_PREPARE_WRITE_BUFFER_SIZE
            ));
        }
        self.data.extend_from_slice(chunk);
        self.last_offset += chunk.len() as u16;
        Ok(())
    }
}

static PREPARE_WRITE_BUFFERS: OnceLock<Arc<Mutex<HashMap<u16, PrepareWriteBuffer>>>> =
    OnceLock::new();

fn with_prepare_write_buffers<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut HashMap<u16, PrepareWriteBuffer>) -> R,
{
    let buffers_arc = PREPARE_WRITE_BUFFERS.get_or_init(|| Arc::new(Mutex::new(HashMap::new())));
    let mut buffers = buffers_arc.lock().ok()?;
    Some(f(&mut buffers))
}

/// The configuration service.
///
/// `start()` brings the GATT application up (the attribute table is built
/// and bound through the registration events) and begins advertising;
/// `stop()` is idempotent and tears the table down by unregistering the
/// application. The Bluetooth driver itself is created once and kept for
/// the life of the process for WiFi coexistence.
pub struct ConfigService {
    device_name: String,
    bt_modem: Option<BluetoothModem>,
    bt_driver: Option<BtDriver<'static, Ble>>,
}

impl ConfigService {
    pub fn new(bt_modem: BluetoothModem) -> Self {
        let state = Arc::new(Mutex::new(ConfigServiceState::new()));
        if GLOBAL_CONFIG_STATE.set(state).is_err() {
            warn!("configuration service state was already initialized, using existing instance");
        }
        Self {
            device_name: format!("{}-{}", DEVICE_NAME_PREFIX, device_suffix()),
            bt_modem: Some(bt_modem),
            bt_driver: None,
        }
    }

    pub async fn start(&mut self) -> ConfigServiceResult<()> {
        if SERVICE_ACTIVE.load(Ordering::Acquire) {
            debug!("configuration service already active");
            return Ok(());
        }
        SERVICE_STOPPING.store(false, Ordering::SeqCst);

        self.ensure_driver()?;

        with_config_state(|state| state.reset_for_start(self.device_name.clone()));
        with_prepare_write_buffers(|buffers| buffers.clear());

        // Register callbacks and the GATT application; the rest of the
        // bring-up (device name, advertising data, attribute table) is
        // driven by the registration events.
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_register_callback(Some(gatts_event_handler)) },
            "GATT callback registration",
        )?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gap_register_callback(Some(gap_event_handler)) },
            "GAP callback registration",
        )?;
        call_esp_api_with_context(
            || unsafe { esp_idf_sys::esp_ble_gatts_app_register(APP_ID) },
            "GATT application registration",
        )?;

        SERVICE_ACTIVE.store(true, Ordering::SeqCst);
        Timer::after(Duration::from_millis(100)).await;

        info!("configuration service starting, advertising as '{}'", self.device_name);
        Ok(())
    }

    pub async fn stop(&mut self) -> ConfigServiceResult<()> {
        if !SERVICE_ACTIVE.load(Ordering::Acquire) {
            debug!("configuration service already stopped");
            return Ok(());
        }
        if SERVICE_STOPPING.swap(true, Ordering::SeqCst) {
            debug!("configuration service stop already in progress");
            return Ok(());
        }

        if ADVERTISING.load(Ordering::SeqCst) {
            if let Err(e) = call_esp_api_with_context(
                || unsafe { esp_idf_sys::esp_ble_gap_stop_advertising() },
                "advertising stop",
            ) {
                warn!("stopping advertising reported: {}", e);
            }
        }

        let gatts_if = GATT_INTERFACE.load(Ordering::SeqCst);
        if let Some(conn_id) = with_config_state(|state| state.conn_id.take()).flatten() {
            if let Err(e) = call_esp_api_with_context(
                || unsafe { esp_idf_sys::esp_ble_gatts_close(gatts_if, conn_id) },
                "GATT connection close",
            ) {
                warn!("closing GATT connection reported: {}", e);
            }
        }

        // Unregistering the application destroys the attribute table
        if gatts_if != 0 {
            if let Err(e) = call_esp_api_with_context(
                || unsafe { esp_idf_sys::esp_ble_gatts_app_unregister(gatts_if) },
                "GATT application unregister",
            ) {
                warn!("unregistering GATT application reported: {}", e);
            }
        }

        GATT_INTERFACE.store(0, Ordering::SeqCst);
        ADVERTISING.store(false, Ordering::SeqCst);
        with_prepare_write_buffers(|buffers| buffers.clear());
        SERVICE_ACTIVE.store(false, Ordering::SeqCst);

        Timer::after(Duration::from_millis(100)).await;
        info!("configuration service stopped");
        Ok(())
    }

    // The driver is created lazily on first start and then kept: the BT
    // controller stays up while WiFi runs.
    fn ensure_driver(&mut self) -> ConfigServiceResult<()> {
        if self.bt_driver.is_some() {
            return Ok(());
        }
        let modem = self.bt_modem.take().ok_or_else(|| {
            ConfigServiceError::NotInitialized("bluetooth modem unavailable".to_string())
        })?;
        let driver = BtDriver::new(modem, None)
            .map_err(|e| ConfigServiceError::DriverInitFailed(format!("{:?}", e)))?;
        self.bt_driver = Some(driver);
        info!("Bluetooth driver initialized");
        Ok(())
    }
}

fn device_suffix() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    "lark-node".hash(&mut hasher);
    format!("{:04X}", hasher.finish() & 0xFFFF)
}

// Real GATT event handler with panic safety: never let a panic cross into
// the Bluedroid task.
extern "C" fn gatts_event_handler(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    let result =
        std::panic::catch_unwind(|| gatts_event_handler_impl(event, gatt_interface, event_param));
    if result.is_err() {
        error!("panic in GATT event handler");
    }
}

fn gatts_event_handler_impl(
    event: esp_idf_sys::esp_gatts_cb_event_t,
    gatt_interface: esp_idf_sys::esp_gatt_if_t,
    event_param: *mut esp_idf_sys::esp_ble_gatts_cb_param_t,
) {
    if event_param.is_null() {
        return;
    }

    match event {
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_REG_EVT => {
            info!("GATT application registered, interface {}", gatt_interface);
            GATT_INTERFACE.store(gatt_interface, Ordering::SeqCst);

            set_device_name();
            configure_advertising_data();
            create_attribute_table(gatt_interface);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CREAT_ATTR_TAB_EVT => {
            let create_event = unsafe { &(*event_param).add_attr_tab };
            handle_attribute_table_created(create_event);
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_CONNECT_EVT => {
            let connect_event = unsafe { &(*event_param).connect };
            info!("configuration client connected, conn_id {}", connect_event.conn_id);
            with_prepare_write_buffers(|buffers| buffers.remove(&connect_event.conn_id));
            with_config_state(|state| state.conn_id = Some(connect_event.conn_id));
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_DISCONNECT_EVT => {
            let disconnect_event = unsafe { &(*event_param).disconnect };
            info!(
                "configuration client disconnected, reason {}",
                disconnect_event.reason
            );
            with_prepare_write_buffers(|buffers| buffers.remove(&disconnect_event.conn_id));
            with_config_state(|state| state.conn_id = None);

            // Remain discoverable, unless an explicit stop is in progress
            if !SERVICE_STOPPING.load(Ordering::SeqCst) {
                start_advertising();
            } else {
                debug!("service stopping, not restarting advertising");
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_WRITE_EVT => {
            let write_event = unsafe { &(*event_param).write };
            if write_event.value.is_null() || write_event.len == 0 {
                warn!("GATT write with no payload");
                return;
            }
            let data =
                unsafe { std::slice::from_raw_parts(write_event.value, write_event.len as usize) };
            if write_event.is_prep {
                handle_prepare_write(write_event.conn_id, write_event.handle, write_event.offset, data);
            } else {
                handle_attribute_write(write_event.handle, data);
            }
        }
        esp_idf_sys::esp_gatts_cb_event_t_ESP_GATTS_EXEC_WRITE_EVT => {
            let exec_event = unsafe { &(*event_param).exec_write };
            handle_execute_write(exec_event.conn_id, exec_event.exec_write_flag as u32);
        }
        _ => {
            debug!("unhandled GATT event: {}", event);
        }
    }
}

// Real GAP event handler with panic safety
extern "C" fn gap_event_handler(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    event_param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    let result = std::panic::catch_unwind(|| gap_event_handler_impl(event, event_param));
    if result.is_err() {
        error!("panic in GAP event handler");
    }
}

fn gap_event_handler_impl(
    event: esp_idf_sys::esp_gap_ble_cb_event_t,
    event_param: *mut esp_idf_sys::esp_ble_gap_cb_param_t,
) {
    if event_param.is_null() {
        return;
    }
    match event {
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_DATA_SET_COMPLETE_EVT => {
            if !SERVICE_STOPPING.load(Ordering::SeqCst) {
                start_advertising();
            }
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_START_COMPLETE_EVT => {
            let status = unsafe { (*event_param).adv_start_cmpl.status };
            if status == esp_idf_sys::esp_bt_status_t_ESP_BT_STATUS_SUCCESS {
                info!("advertising started");
                ADVERTISING.store(true, Ordering::SeqCst);
            } else {
                error!("advertising start failed, status {}", status);
            }
        }
        esp_idf_sys::esp_gap_ble_cb_event_t_ESP_GAP_BLE_ADV_STOP_COMPLETE_EVT => {
            debug!("advertising stopped");
            ADVERTISING.store(false, Ordering::SeqCst);
        }
        _ => {}
    }
}

fn set_device_name() {
    let name = with_config_state(|state| state.device_name.clone()).unwrap_or_default();
    let name_cstr = match CString::new(name) {
        Ok(cstr) => cstr,
        Err(_) => {
            error!("device name contains an interior NUL");
            return;
        }
    };
    if let Err(e) = call_esp_api_with_context(
        || unsafe { esp_idf_sys::esp_ble_gap_set_device_name(name_cstr.as_ptr()) },
        "device name setting",
    ) {
        warn!("{}", e);
    }
}

fn configure_advertising_data() {
    let mut adv_data = esp_idf_sys::esp_ble_adv_data_t {
        set_scan_rsp: false,
        include_name: true,
        include_txpower: true,
        min_interval: 0x0006,
        max_interval: 0x0010,
        appearance: 0x00,
        manufacturer_len: 0,
        p_manufacturer_data: std::ptr::null_mut(),
        service_data_len: 0,
        p_service_data: std::ptr::null_mut(),
        service_uuid_len: ADV_SERVICE_UUID128.len() as u16,
        p_service_uuid: ADV_SERVICE_UUID128.as_ptr() as *mut u8,
        flag: (esp_idf_sys::ESP_BLE_ADV_FLAG_GEN_DISC
            | esp_idf_sys::ESP_BLE_ADV_FLAG_BREDR_NOT_SPT) as u8,
    };
    if let Err(e) = call_esp_api_with_context(
        || unsafe { esp_idf_sys::esp_ble_gap_config_adv_data(&mut adv_data) },
        "advertising data configuration",
    ) {
        error!("{}", e);
    }
}

fn start_advertising() {
    let mut adv_params = esp_idf_sys::esp_ble_adv_params_t {
        adv_int_min: 0x20,
        adv_int_max: 0x40,
        adv_type: esp_idf_sys::esp_ble_adv_type_t_ADV_TYPE_IND,
        own_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        peer_addr: [0; 6],
        peer_addr_type: esp_idf_sys::esp_ble_addr_type_t_BLE_ADDR_TYPE_PUBLIC,
        channel_map: esp_idf_sys::esp_ble_adv_channel_t_ADV_CHNL_ALL,
        adv_filter_policy: esp_idf_sys::esp_ble_adv_filter_t_ADV_FILTER_ALLOW_SCAN_ANY_CON_ANY,
    };
    if let Err(e) = call_esp_api_with_context(
        || unsafe { esp_idf_sys::esp_ble_gap_start_advertising(&mut adv_params) },
        "advertising start",
    ) {
        error!("{}", e);
    }
}

// Number of stack attributes the logical table expands to: each field or
// control slot carries a characteristic declaration, descriptions and the
// service declaration are one attribute each.
fn stack_attr_count(defs: &[AttrDef]) -> usize {
    defs.iter()
        .map(|def| match def.kind {
            AttrKind::FieldValue(_) | AttrKind::ExitControl => 2,
            AttrKind::ServiceDeclaration | AttrKind::Description(_) => 1,
        })
        .sum()
}

fn slot_uuid_ptr(uuid: u16) -> Option<*mut u8> {
    SLOT_UUIDS
        .iter()
        .position(|&u| u == uuid)
        .map(|i| &SLOT_UUIDS[i] as *const u16 as *mut u8)
}

fn attr_row(
    uuid_p: *mut u8,
    perm: u32,
    max_length: u16,
    length: u16,
    value: *mut u8,
) -> esp_idf_sys::esp_gatts_attr_db_t {
    esp_idf_sys::esp_gatts_attr_db_t {
        attr_control: esp_idf_sys::esp_attr_control_t {
            auto_rsp: esp_idf_sys::ESP_GATT_AUTO_RSP as u8,
        },
        att_desc: esp_idf_sys::esp_attr_desc_t {
            uuid_length: esp_idf_sys::ESP_UUID_LEN_16 as u16,
            uuid_p,
            perm: perm as u16,
            max_length,
            length,
            value,
        },
    }
}

// Expand the logical table into the Bluedroid attribute database. All
// referenced storage is 'static; dynamic slots start empty.
fn build_gatt_db(defs: &[AttrDef]) -> Vec<esp_idf_sys::esp_gatts_attr_db_t> {
    let mut db = Vec::with_capacity(stack_attr_count(defs));
    for def in defs {
        match def.kind {
            AttrKind::ServiceDeclaration => {
                db.push(attr_row(
                    &PRIMARY_SERVICE_UUID as *const u16 as *mut u8,
                    esp_idf_sys::ESP_GATT_PERM_READ,
                    2,
                    2,
                    &CONFIG_SERVICE_UUID_VALUE as *const u16 as *mut u8,
                ));
            }
            AttrKind::FieldValue(_) | AttrKind::ExitControl => {
                db.push(attr_row(
                    &CHARACTER_DECLARATION_UUID as *const u16 as *mut u8,
                    esp_idf_sys::ESP_GATT_PERM_READ,
                    1,
                    1,
                    &CHAR_PROP_READ_WRITE as *const u8 as *mut u8,
                ));
                let uuid_p = match slot_uuid_ptr(def.uuid) {
                    Some(p) => p,
                    None => {
                        // table and SLOT_UUIDS always agree; bail defensively
                        error!("no static uuid storage for {:#06x}", def.uuid);
                        continue;
                    }
                };
                db.push(attr_row(
                    uuid_p,
                    esp_idf_sys::ESP_GATT_PERM_READ | esp_idf_sys::ESP_GATT_PERM_WRITE,
                    def.max_len as u16,
                    0,
                    std::ptr::null_mut(),
                ));
            }
            AttrKind::Description(text) => {
                db.push(attr_row(
                    &CHARACTER_DESCRIPTION_UUID as *const u16 as *mut u8,
                    esp_idf_sys::ESP_GATT_PERM_READ,
                    text.len() as u16,
                    text.len() as u16,
                    text.as_ptr() as *mut u8,
                ));
            }
        }
    }
    db
}

fn create_attribute_table(gatt_interface: esp_idf_sys::esp_gatt_if_t) {
    let db = match with_config_state(|state| build_gatt_db(state.table.defs())) {
        Some(db) => db,
        None => {
            error!("service state unavailable while creating attribute table");
            return;
        }
    };
    // the stack deep-copies the database within this call
    if let Err(e) = call_esp_api_with_context(
        || unsafe {
            esp_idf_sys::esp_ble_gatts_create_attr_tab(
                db.as_ptr(),
                gatt_interface,
                db.len() as u16,
                SVC_INST_ID,
            )
        },
        "attribute table creation",
    ) {
        error!("{}", e);
    }
}

// Map the handle array the stack reported (one handle per stack attribute,
// in database order) back onto the logical table: skip each characteristic
// declaration, keep service/value/description handles.
fn bind_reported_handles(table: &mut AttributeTable, raw: &[u16]) -> Result<(), String> {
    let mut logical = Vec::with_capacity(table.len());
    let mut iter = raw.iter().copied();
    for def in table.defs() {
        match def.kind {
            AttrKind::FieldValue(_) | AttrKind::ExitControl => {
                let _declaration = iter
                    .next()
                    .ok_or_else(|| "handle array shorter than the table".to_string())?;
                logical.push(
                    iter.next()
                        .ok_or_else(|| "handle array shorter than the table".to_string())?,
                );
            }
            AttrKind::ServiceDeclaration | AttrKind::Description(_) => {
                logical.push(
                    iter.next()
                        .ok_or_else(|| "handle array shorter than the table".to_string())?,
                );
            }
        }
    }
    if iter.next().is_some() {
        return Err("handle array longer than the table".to_string());
    }
    table.bind_handles(&logical).map_err(|e| e.to_string())
}

fn handle_attribute_table_created(
    create_event: &esp_idf_sys::esp_ble_gatts_cb_param_t_gatts_add_attr_tab_evt_param,
) {
    if create_event.status != esp_idf_sys::esp_gatt_status_t_ESP_GATT_OK {
        error!("attribute table creation failed, status {:#x}", create_event.status);
        return;
    }

    let expected = with_config_state(|state| stack_attr_count(state.table.defs())).unwrap_or(0);
    if create_event.num_handle as usize != expected {
        error!(
            "attribute table reported {} handles, expected {}",
            create_event.num_handle, expected
        );
        return;
    }

    let handles = unsafe {
        std::slice::from_raw_parts(create_event.handles, create_event.num_handle as usize)
    };
    let service_handle = handles[0];

    let bound = with_config_state(|state| {
        bind_reported_handles(&mut state.table, handles).map_err(|e| {
            error!("binding attribute handles failed: {}", e);
        })
    });
    if !matches!(bound, Some(Ok(()))) {
        return;
    }

    info!(
        "attribute table created, {} handles, service handle {}",
        handles.len(),
        service_handle
    );
    if let Err(e) = call_esp_api_with_context(
        || unsafe { esp_idf_sys::esp_ble_gatts_start_service(service_handle) },
        "GATT service start",
    ) {
        error!("{}", e);
    }
}

// Route a completed write through the shared table and session; the
// resulting events feed the controller channel. Reads never reach this
// module: the attributes are auto-respond, so the stack serves the draft
// values it mirrors on write.
fn handle_attribute_write(handle: u16, data: &[u8]) {
    let event = with_config_state(|state| {
        let def = match state.table.resolve(handle) {
            Some(def) => def,
            None => {
                debug!("write to unknown handle {}", handle);
                return None;
            }
        };
        match def.kind {
            AttrKind::FieldValue(field) => {
                let write = state.session.write_field(field, data);
                if write.truncated {
                    warn!("value for '{}' truncated to capacity", field.key());
                }
                if field.is_secret() {
                    info!("received value for '{}' ({} bytes)", field.key(), data.len());
                } else {
                    info!(
                        "received value for '{}': {}",
                        field.key(),
                        state.session.read_field(field)
                    );
                }
                write.completed.map(ControllerEvent::CredentialsComplete)
            }
            AttrKind::ExitControl => {
                info!("exit configuration requested by client");
                Some(ControllerEvent::ExitRequested(state.session.snapshot()))
            }
            AttrKind::ServiceDeclaration | AttrKind::Description(_) => {
                warn!("write to read-only attribute {:#06x}", def.uuid);
                None
            }
        }
    })
    .flatten();

    if let Some(event) = event {
        send_controller_event(event);
    }
}

fn handle_prepare_write(conn_id: u16, handle: u16, offset: u16, chunk: &[u8]) {
    let appended = with_prepare_write_buffers(|buffers| {
        let result = {
            let buffer = buffers
                .entry(conn_id)
                .or_insert_with(|| PrepareWriteBuffer::new(handle));
            if buffer.char_handle != handle {
                Err("prepare write handle mismatch".to_string())
            } else {
                buffer.append_chunk(offset, chunk)
            }
        };
        if result.is_err() {
            buffers.remove(&conn_id);
        }
        result
    });
    match appended {
        Some(Ok(())) => debug!(
            "buffered {} prepare-write bytes at offset {} for conn_id {}",
            chunk.len(),
            offset,
            conn_id
        ),
        Some(Err(e)) => warn!("prepare write rejected: {}", e),
        None => warn!("prepare write buffers unavailable"),
    }
}

fn handle_execute_write(conn_id: u16, exec_write_flag: u32) {
    if exec_write_flag == esp_idf_sys::ESP_GATT_PREP_WRITE_CANCEL {
        with_prepare_write_buffers(|buffers| buffers.remove(&conn_id));
        debug!("prepare write cancelled for conn_id {}", conn_id);
        return;
    }
    let buffer = with_prepare_write_buffers(|buffers| buffers.remove(&conn_id)).flatten();
    match buffer {
        Some(buffer) => handle_attribute_write(buffer.char_handle, &buffer.data),
        None => warn!("execute write with no buffered data for conn_id {}", conn_id),
    }
}

// ESP API wrapper with error context
fn call_esp_api_with_context<F>(f: F, context: &str) -> ConfigServiceResult<()>
where
    F: FnOnce() -> esp_idf_sys::esp_err_t,
{
    let result = f();
    if result == esp_idf_sys::ESP_OK {
        Ok(())
    } else {
        let error_msg = match result {
            esp_idf_sys::ESP_ERR_INVALID_STATE => {
                format!("{}: invalid state - BLE stack not ready", context)
            }
            esp_idf_sys::ESP_ERR_INVALID_ARG => format!("{}: invalid argument", context),
            esp_idf_sys::ESP_ERR_NO_MEM => format!("{}: out of memory", context),
            _ => format!("{}: unexpected error", context),
        };
        Err(ConfigServiceError::EspError(result, error_msg))
    }
}
