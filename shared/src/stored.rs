// Persisted credential record.
//
// The store writes this as a single JSON blob: that write is the atomic
// commit point. The individual per-field NVS keys are only a best-effort
// mirror for external tooling and a load fallback.

use serde::{Deserialize, Serialize};

use crate::credentials::{CredentialField, Credentials};

pub const STORED_SCHEMA_VERSION: u32 = 1;

/// JSON mirror of [`Credentials`]. Every field defaults to empty so a
/// missing key is never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredConfig {
    pub version: u32,
    pub ssid: String,
    pub password: String,
    pub meas_freq: String,
    pub send_freq: String,
    pub mqtt_broker: String,
}

impl StoredConfig {
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self {
            version: STORED_SCHEMA_VERSION,
            ssid: credentials.ssid.clone(),
            password: credentials.password.clone(),
            meas_freq: credentials.meas_freq.clone(),
            send_freq: credentials.send_freq.clone(),
            mqtt_broker: credentials.mqtt_broker.clone(),
        }
    }

    /// Convert back into the in-memory record, re-applying the field bound
    /// in case the flash record predates the current capacity.
    pub fn into_credentials(self) -> Credentials {
        let mut credentials = Credentials::default();
        credentials.set(CredentialField::Ssid, self.ssid.as_bytes());
        credentials.set(CredentialField::Password, self.password.as_bytes());
        credentials.set(CredentialField::MeasFreq, self.meas_freq.as_bytes());
        credentials.set(CredentialField::SendFreq, self.send_freq.as_bytes());
        credentials.set(CredentialField::MqttBroker, self.mqtt_broker.as_bytes());
        credentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_record_yields_all_empty_credentials() {
        let credentials = StoredConfig::default().into_credentials();
        assert_eq!(credentials, Credentials::default());
        assert!(!credentials.has_network_identity());
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let mut credentials = Credentials::default();
        credentials.set(CredentialField::Ssid, b"net");
        credentials.set(CredentialField::Password, b"pw");
        credentials.set(CredentialField::MeasFreq, b"30");
        credentials.set(CredentialField::SendFreq, b"300");
        credentials.set(CredentialField::MqttBroker, b"mqtt://broker:1883");

        let json = serde_json::to_string(&StoredConfig::from_credentials(&credentials)).unwrap();
        let decoded: StoredConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.version, STORED_SCHEMA_VERSION);
        assert_eq!(decoded.into_credentials(), credentials);
    }

    #[test]
    fn missing_keys_decode_to_defaults() {
        let decoded: StoredConfig = serde_json::from_str(r#"{"ssid":"net"}"#).unwrap();
        let credentials = decoded.into_credentials();
        assert_eq!(credentials.ssid, "net");
        assert_eq!(credentials.password, "");
        assert_eq!(credentials.mqtt_broker, "");
    }

    #[test]
    fn overlong_flash_values_are_rebounded_on_load() {
        let record = StoredConfig {
            version: STORED_SCHEMA_VERSION,
            ssid: "s".repeat(200),
            ..StoredConfig::default()
        };
        let credentials = record.into_credentials();
        assert_eq!(credentials.ssid.len(), crate::credentials::FIELD_CAPACITY);
    }
}
