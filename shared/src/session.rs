// Provisioning session state: the draft credential record being assembled
// over the configuration service, and the set of fields written so far.

use crate::credentials::{CredentialField, Credentials};

/// Bit-set of credential fields written during the current session.
///
/// Cleared when the session starts; taken (moved out and cleared) when the
/// required ssid/password pair becomes present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWriteSet(u8);

impl PendingWriteSet {
    fn bit(field: CredentialField) -> u8 {
        match field {
            CredentialField::Ssid => 1 << 0,
            CredentialField::Password => 1 << 1,
            CredentialField::MeasFreq => 1 << 2,
            CredentialField::SendFreq => 1 << 3,
            CredentialField::MqttBroker => 1 << 4,
        }
    }

    pub fn insert(&mut self, field: CredentialField) {
        self.0 |= Self::bit(field);
    }

    pub fn contains(self, field: CredentialField) -> bool {
        self.0 & Self::bit(field) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Both required fields (network identifier and secret) present.
    pub fn has_network_pair(self) -> bool {
        self.contains(CredentialField::Ssid) && self.contains(CredentialField::Password)
    }

    fn take(&mut self) -> PendingWriteSet {
        core::mem::take(self)
    }
}

/// Snapshot of a session handed to the mode controller: the draft record
/// plus which fields were actually written, so unwritten fields keep their
/// previously stored values on commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedDraft {
    pub draft: Credentials,
    pub written: PendingWriteSet,
}

impl CompletedDraft {
    /// Merge the written fields over a stored base record.
    pub fn merge_over(&self, base: &Credentials) -> Credentials {
        let mut merged = base.clone();
        for field in CredentialField::ALL {
            if self.written.contains(field) {
                merged.set(field, self.draft.get(field).as_bytes());
            }
        }
        merged
    }
}

/// Result of a single field write.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub truncated: bool,
    /// Present exactly when this write made the required pair complete.
    pub completed: Option<CompletedDraft>,
}

/// Accumulates credential writes for one provisioning session.
///
/// The session never touches the committed store; the controller merges
/// and commits a [`CompletedDraft`].
#[derive(Debug, Default)]
pub struct ProvisioningSession {
    draft: Credentials,
    written: PendingWriteSet,
}

impl ProvisioningSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current draft value of a field; empty until written this session.
    pub fn read_field(&self, field: CredentialField) -> &str {
        self.draft.get(field)
    }

    pub fn write_field(&mut self, field: CredentialField, raw: &[u8]) -> FieldWrite {
        let truncated = self.draft.set(field, raw);
        self.written.insert(field);

        let pair_write =
            matches!(field, CredentialField::Ssid | CredentialField::Password);
        let completed = if pair_write && self.written.has_network_pair() {
            Some(CompletedDraft {
                draft: self.draft.clone(),
                written: self.written.take(),
            })
        } else {
            None
        };

        FieldWrite { truncated, completed }
    }

    /// Snapshot for an exit request, regardless of how much was written.
    pub fn snapshot(&self) -> CompletedDraft {
        CompletedDraft {
            draft: self.draft.clone(),
            written: self.written,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_in_either_order_completes_exactly_once() {
        for order in [
            [CredentialField::Ssid, CredentialField::Password],
            [CredentialField::Password, CredentialField::Ssid],
        ] {
            let mut session = ProvisioningSession::new();
            assert!(session.write_field(order[0], b"first").completed.is_none());
            let second = session.write_field(order[1], b"second");
            let completed = second.completed.expect("pair complete");
            assert!(completed.written.has_network_pair());
        }
    }

    #[test]
    fn rewriting_identifier_without_secret_never_completes() {
        let mut session = ProvisioningSession::new();
        assert!(session.write_field(CredentialField::Ssid, b"a").completed.is_none());
        assert!(session.write_field(CredentialField::Ssid, b"b").completed.is_none());
        assert_eq!(session.read_field(CredentialField::Ssid), "b");
    }

    #[test]
    fn auxiliary_fields_do_not_complete_the_pair() {
        let mut session = ProvisioningSession::new();
        session.write_field(CredentialField::Ssid, b"net");
        assert!(session
            .write_field(CredentialField::MqttBroker, b"mqtt://host")
            .completed
            .is_none());
    }

    #[test]
    fn completion_takes_the_write_set() {
        let mut session = ProvisioningSession::new();
        session.write_field(CredentialField::Ssid, b"net");
        let completed = session
            .write_field(CredentialField::Password, b"pw")
            .completed
            .expect("pair complete");
        assert!(completed.written.has_network_pair());
        // consumed: the next snapshot starts from an empty set
        assert!(session.snapshot().written.is_empty());
        // but the draft keeps its values for reads
        assert_eq!(session.read_field(CredentialField::Ssid), "net");
    }

    #[test]
    fn merge_keeps_unwritten_fields_from_base() {
        let mut base = Credentials::default();
        base.set(CredentialField::Ssid, b"old-net");
        base.set(CredentialField::MqttBroker, b"mqtt://old");

        let mut session = ProvisioningSession::new();
        session.write_field(CredentialField::Ssid, b"new-net");
        let merged = session.snapshot().merge_over(&base);

        assert_eq!(merged.ssid, "new-net");
        assert_eq!(merged.mqtt_broker, "mqtt://old");
    }

    #[test]
    fn truncation_is_reported_per_write() {
        let mut session = ProvisioningSession::new();
        let long = [b'p'; 100];
        let write = session.write_field(CredentialField::Password, &long);
        assert!(write.truncated);
        assert_eq!(session.read_field(CredentialField::Password).len(), 64);
    }
}
