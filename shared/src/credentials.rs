// Credential record shared between the configuration service, the mode
// controller and the credential store.

use serde::{Deserialize, Serialize};

/// Capacity of every configurable field, in bytes.
///
/// Matches the attribute table's per-characteristic maximum length; writes
/// longer than this are truncated, never rejected.
pub const FIELD_CAPACITY: usize = 64;

/// One configurable field of the credential record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialField {
    Ssid,
    Password,
    MeasFreq,
    SendFreq,
    MqttBroker,
}

impl CredentialField {
    pub const ALL: [CredentialField; 5] = [
        CredentialField::Ssid,
        CredentialField::Password,
        CredentialField::MeasFreq,
        CredentialField::SendFreq,
        CredentialField::MqttBroker,
    ];

    /// NVS key the field is persisted under.
    pub fn key(self) -> &'static str {
        match self {
            CredentialField::Ssid => "ssid",
            CredentialField::Password => "password",
            CredentialField::MeasFreq => "meas_freq",
            CredentialField::SendFreq => "send_freq",
            CredentialField::MqttBroker => "mqtt_broker",
        }
    }

    /// Secret fields never appear in status output.
    pub fn is_secret(self) -> bool {
        matches!(self, CredentialField::Password)
    }
}

/// Network identity plus auxiliary configuration fields.
///
/// Every field is bounded at [`FIELD_CAPACITY`] bytes; [`Credentials::set`]
/// is the only mutation path and enforces the bound.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
    pub meas_freq: String,
    pub send_freq: String,
    pub mqtt_broker: String,
}

impl Credentials {
    pub fn get(&self, field: CredentialField) -> &str {
        match field {
            CredentialField::Ssid => &self.ssid,
            CredentialField::Password => &self.password,
            CredentialField::MeasFreq => &self.meas_freq,
            CredentialField::SendFreq => &self.send_freq,
            CredentialField::MqttBroker => &self.mqtt_broker,
        }
    }

    /// Store a raw value into a field, truncating to capacity.
    ///
    /// Returns `true` when the stored value is shorter than the input. The
    /// stored value is always a prefix of the input: the value is cut at
    /// the first NUL byte, then at [`FIELD_CAPACITY`] bytes, then backed
    /// off to the nearest UTF-8 boundary.
    pub fn set(&mut self, field: CredentialField, raw: &[u8]) -> bool {
        let value = bounded_prefix(raw);
        let truncated = value.len() < raw.len();
        let slot = match field {
            CredentialField::Ssid => &mut self.ssid,
            CredentialField::Password => &mut self.password,
            CredentialField::MeasFreq => &mut self.meas_freq,
            CredentialField::SendFreq => &mut self.send_freq,
            CredentialField::MqttBroker => &mut self.mqtt_broker,
        };
        slot.clear();
        slot.push_str(value);
        truncated
    }

    /// A record without a network name cannot be used for a station attach.
    pub fn has_network_identity(&self) -> bool {
        !self.ssid.is_empty()
    }
}

fn bounded_prefix(raw: &[u8]) -> &str {
    let raw = match raw.iter().position(|&b| b == 0) {
        Some(nul) => &raw[..nul],
        None => raw,
    };
    let capped = &raw[..raw.len().min(FIELD_CAPACITY)];
    match core::str::from_utf8(capped) {
        Ok(s) => s,
        // valid_up_to() is a char boundary, so this re-parse cannot fail
        Err(e) => core::str::from_utf8(&capped[..e.valid_up_to()]).unwrap_or(""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_stores_value_verbatim_when_within_capacity() {
        let mut creds = Credentials::default();
        assert!(!creds.set(CredentialField::Ssid, b"home-net"));
        assert_eq!(creds.ssid, "home-net");
    }

    #[test]
    fn oversized_write_is_truncated_to_capacity_prefix() {
        let raw: Vec<u8> = (0..200).map(|i| b'a' + (i % 26) as u8).collect();
        let mut creds = Credentials::default();
        assert!(creds.set(CredentialField::Password, &raw));
        assert_eq!(creds.password.len(), FIELD_CAPACITY);
        assert_eq!(creds.password.as_bytes(), &raw[..FIELD_CAPACITY]);
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        // 21 three-byte chars = 63 bytes; one more would split at byte 64
        let raw = "\u{20AC}".repeat(22);
        let mut creds = Credentials::default();
        assert!(creds.set(CredentialField::MqttBroker, raw.as_bytes()));
        assert_eq!(creds.mqtt_broker.len(), 63);
        assert!(raw.starts_with(&creds.mqtt_broker));
    }

    #[test]
    fn value_is_cut_at_first_nul() {
        let mut creds = Credentials::default();
        assert!(creds.set(CredentialField::Ssid, b"net\0garbage"));
        assert_eq!(creds.ssid, "net");
    }

    #[test]
    fn every_field_never_exceeds_capacity() {
        let raw = [b'x'; 500];
        let mut creds = Credentials::default();
        for field in CredentialField::ALL {
            creds.set(field, &raw);
            assert!(creds.get(field).len() <= FIELD_CAPACITY);
            assert!(raw.starts_with(creds.get(field).as_bytes()));
        }
    }
}
