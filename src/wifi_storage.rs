// Credential store over ESP-IDF NVS.
//
// Commit writes a single JSON record first - that write is the atomic
// commit point - then mirrors the individual per-field keys for external
// tooling. Load prefers the record and falls back to the mirror keys, and
// degrades to empty defaults instead of surfacing read errors.

use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use esp_idf_svc::sys::EspError;
use log::{info, warn};

use lark_shared::{CredentialField, Credentials, StoredConfig};

const NVS_NAMESPACE: &str = "wifi_config";
const CONFIG_RECORD_KEY: &str = "config_json";
const RECORD_BUF_SIZE: usize = 512;

pub struct WifiStorage {
    nvs: EspNvs<NvsDefault>,
}

impl WifiStorage {
    pub fn new_with_partition(nvs_partition: EspDefaultNvsPartition) -> Result<Self, EspError> {
        let nvs = EspNvs::new(nvs_partition, NVS_NAMESPACE, true)?;
        Ok(Self { nvs })
    }

    /// Load the stored credentials. Never fails: a missing or unreadable
    /// record yields empty defaults.
    pub fn load(&mut self) -> Credentials {
        if let Some(credentials) = self.load_record() {
            return credentials;
        }
        self.load_mirror_keys()
    }

    fn load_record(&mut self) -> Option<Credentials> {
        let mut buf = [0u8; RECORD_BUF_SIZE];
        match self.nvs.get_str(CONFIG_RECORD_KEY, &mut buf) {
            Ok(Some(json)) => match serde_json::from_str::<StoredConfig>(json) {
                Ok(record) => Some(record.into_credentials()),
                Err(e) => {
                    warn!("stored credential record is unreadable ({}), trying mirror keys", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("reading credential record failed ({:?}), trying mirror keys", e);
                None
            }
        }
    }

    fn load_mirror_keys(&mut self) -> Credentials {
        let mut credentials = Credentials::default();
        let mut buf = [0u8; 128];
        for field in CredentialField::ALL {
            match self.nvs.get_str(field.key(), &mut buf) {
                Ok(Some(value)) => {
                    credentials.set(field, value.as_bytes());
                }
                Ok(None) => {}
                Err(e) => warn!("reading '{}' from NVS failed: {:?}", field.key(), e),
            }
        }
        credentials
    }

    /// Persist the credentials. Atomic from the caller's perspective: the
    /// record either replaces the previous one completely or not at all.
    pub fn commit(&mut self, credentials: &Credentials) -> Result<(), EspError> {
        let record = StoredConfig::from_credentials(credentials);
        let json = serde_json::to_string(&record).map_err(|e| {
            warn!("serializing credential record failed: {}", e);
            EspError::from_infallible::<{ esp_idf_svc::sys::ESP_ERR_INVALID_ARG }>()
        })?;

        self.nvs.set_str(CONFIG_RECORD_KEY, &json)?;

        // Mirror keys are best effort; the record above is authoritative.
        for field in CredentialField::ALL {
            if let Err(e) = self.nvs.set_str(field.key(), credentials.get(field)) {
                warn!("mirroring '{}' to NVS failed: {:?}", field.key(), e);
            }
        }

        info!("credentials committed for ssid '{}'", credentials.ssid);
        Ok(())
    }
}
