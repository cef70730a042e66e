// Attribute table exposed by the configuration service.
//
// The table is built once when the service starts; the GATT stack assigns
// handles asynchronously and they are bound into the table exactly once.
// Entry order is fixed and is the wire order of the service.

use crate::credentials::{CredentialField, FIELD_CAPACITY};

/// 16-bit service identifier, also carried in the advertising payload.
pub const CONFIG_SERVICE_UUID: u16 = 0x00FF;
pub const SSID_CHAR_UUID: u16 = 0xFF01;
pub const PASSWORD_CHAR_UUID: u16 = 0xFF02;
pub const MEAS_FREQ_CHAR_UUID: u16 = 0xFF03;
pub const SEND_FREQ_CHAR_UUID: u16 = 0xFF04;
pub const MQTT_BROKER_CHAR_UUID: u16 = 0xFF05;
pub const EXIT_CONTROL_CHAR_UUID: u16 = 0xFF06;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
}

impl Permissions {
    pub const READ: Permissions = Permissions { read: true, write: false };
    pub const READ_WRITE: Permissions = Permissions { read: true, write: true };
}

/// What an attribute entry is backed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrKind {
    /// The service declaration itself.
    ServiceDeclaration,
    /// Dynamic slot bound to a draft credential field.
    FieldValue(CredentialField),
    /// Static human-readable description of the preceding entry.
    Description(&'static str),
    /// Control slot; any write requests leaving configuration mode.
    ExitControl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrDef {
    pub uuid: u16,
    pub kind: AttrKind,
    pub permissions: Permissions,
    pub max_len: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TableError {
    HandleCountMismatch { expected: usize, got: usize },
    AlreadyBound,
}

impl core::fmt::Display for TableError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TableError::HandleCountMismatch { expected, got } => {
                write!(f, "expected {} attribute handles, stack reported {}", expected, got)
            }
            TableError::AlreadyBound => write!(f, "attribute handles already bound"),
        }
    }
}

impl std::error::Error for TableError {}

/// Registers attribute entries in wire order and produces the immutable
/// table. Each field/control entry is followed by its description entry.
#[derive(Debug, Default)]
pub struct AttributeTableBuilder {
    defs: Vec<AttrDef>,
}

impl AttributeTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service(mut self, uuid: u16) -> Self {
        self.defs.push(AttrDef {
            uuid,
            kind: AttrKind::ServiceDeclaration,
            permissions: Permissions::READ,
            max_len: 2,
        });
        self
    }

    pub fn field(mut self, uuid: u16, field: CredentialField, description: &'static str) -> Self {
        self.defs.push(AttrDef {
            uuid,
            kind: AttrKind::FieldValue(field),
            permissions: Permissions::READ_WRITE,
            max_len: FIELD_CAPACITY,
        });
        self.description(description)
    }

    pub fn exit_control(mut self, uuid: u16, description: &'static str) -> Self {
        self.defs.push(AttrDef {
            uuid,
            kind: AttrKind::ExitControl,
            permissions: Permissions::READ_WRITE,
            max_len: 1,
        });
        self.description(description)
    }

    fn description(mut self, text: &'static str) -> Self {
        self.defs.push(AttrDef {
            // GATT Characteristic User Description
            uuid: 0x2901,
            kind: AttrKind::Description(text),
            permissions: Permissions::READ,
            max_len: text.len(),
        });
        self
    }

    pub fn build(self) -> AttributeTable {
        AttributeTable { defs: self.defs, handles: Vec::new() }
    }
}

/// Immutable attribute definitions plus the stack-assigned handle of each.
#[derive(Debug)]
pub struct AttributeTable {
    defs: Vec<AttrDef>,
    handles: Vec<u16>,
}

impl AttributeTable {
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn defs(&self) -> &[AttrDef] {
        &self.defs
    }

    /// Bind the handle array the stack reported for this table. One-shot:
    /// the identifier→handle mapping is immutable afterwards.
    pub fn bind_handles(&mut self, handles: &[u16]) -> Result<(), TableError> {
        if !self.handles.is_empty() {
            return Err(TableError::AlreadyBound);
        }
        if handles.len() != self.defs.len() {
            return Err(TableError::HandleCountMismatch {
                expected: self.defs.len(),
                got: handles.len(),
            });
        }
        self.handles = handles.to_vec();
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn resolve(&self, handle: u16) -> Option<&AttrDef> {
        let idx = self.handles.iter().position(|&h| h == handle)?;
        self.defs.get(idx)
    }

    pub fn handle_for_uuid(&self, uuid: u16) -> Option<u16> {
        let idx = self.defs.iter().position(|d| d.uuid == uuid)?;
        self.handles.get(idx).copied()
    }
}

/// The fixed table of the configuration service.
pub fn config_service_table() -> AttributeTable {
    AttributeTableBuilder::new()
        .service(CONFIG_SERVICE_UUID)
        .field(SSID_CHAR_UUID, CredentialField::Ssid, "WiFi network name")
        .field(PASSWORD_CHAR_UUID, CredentialField::Password, "WiFi network password")
        .field(MEAS_FREQ_CHAR_UUID, CredentialField::MeasFreq, "Measurement interval in seconds")
        .field(SEND_FREQ_CHAR_UUID, CredentialField::SendFreq, "Publish interval in seconds")
        .field(MQTT_BROKER_CHAR_UUID, CredentialField::MqttBroker, "MQTT broker address")
        .exit_control(EXIT_CONTROL_CHAR_UUID, "Write any value to leave configuration mode")
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lists_all_fields_in_wire_order() {
        let table = config_service_table();
        let field_uuids: Vec<u16> = table
            .defs()
            .iter()
            .filter(|d| matches!(d.kind, AttrKind::FieldValue(_) | AttrKind::ExitControl))
            .map(|d| d.uuid)
            .collect();
        assert_eq!(field_uuids, [0xFF01, 0xFF02, 0xFF03, 0xFF04, 0xFF05, 0xFF06]);
        // service declaration + 6 slots, each slot with a description
        assert_eq!(table.len(), 13);
    }

    #[test]
    fn every_writable_slot_is_followed_by_a_readonly_description() {
        let table = config_service_table();
        for (i, def) in table.defs().iter().enumerate() {
            if def.permissions.write {
                let desc = &table.defs()[i + 1];
                assert!(matches!(desc.kind, AttrKind::Description(_)));
                assert_eq!(desc.permissions, Permissions::READ);
            }
        }
    }

    #[test]
    fn binding_resolves_handles_to_definitions() {
        let mut table = config_service_table();
        let handles: Vec<u16> = (40..40 + table.len() as u16).collect();
        table.bind_handles(&handles).unwrap();

        let ssid_handle = table.handle_for_uuid(SSID_CHAR_UUID).unwrap();
        let def = table.resolve(ssid_handle).unwrap();
        assert_eq!(def.kind, AttrKind::FieldValue(crate::credentials::CredentialField::Ssid));
        assert_eq!(def.max_len, FIELD_CAPACITY);
    }

    #[test]
    fn binding_is_one_shot() {
        let mut table = config_service_table();
        let handles: Vec<u16> = (1..=table.len() as u16).collect();
        table.bind_handles(&handles).unwrap();
        assert_eq!(table.bind_handles(&handles), Err(TableError::AlreadyBound));
    }

    #[test]
    fn handle_count_mismatch_is_rejected() {
        let mut table = config_service_table();
        assert_eq!(
            table.bind_handles(&[1, 2, 3]),
            Err(TableError::HandleCountMismatch { expected: 13, got: 3 })
        );
        assert!(!table.is_bound());
    }

    #[test]
    fn exit_control_is_a_single_byte_slot() {
        let table = config_service_table();
        let exit = table
            .defs()
            .iter()
            .find(|d| d.kind == AttrKind::ExitControl)
            .unwrap();
        assert_eq!(exit.max_len, 1);
        assert_eq!(exit.uuid, EXIT_CONTROL_CHAR_UUID);
    }
}
