use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use loam_proto::{CommandBatch, JsonObject, PeripheralType};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::{take_string, take_uuid, CommandError, ReportOutcome};

/// Lifecycle of a peripheral. `adding` and `removing` are the in-flight
/// states the manager sets synchronously; the terminal transitions come back
/// from the controller as result envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeripheralState {
    Adding,
    Added,
    Failed,
    Removing,
    Removed,
}

impl PeripheralState {
    /// States from which a remove request is still meaningful.
    pub fn removable(&self) -> bool {
        matches!(self, Self::Adding | Self::Added | Self::Removing)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "adding" => Some(Self::Adding),
            "added" => Some(Self::Added),
            "failed" => Some(Self::Failed),
            "removing" => Some(Self::Removing),
            "removed" => Some(Self::Removed),
            _ => None,
        }
    }

    /// Legal controller-reported edges: `adding -> added | failed` and
    /// `removing -> removed`. Re-reporting the current state is a no-op;
    /// anything else is rejected.
    pub fn report(self, reported: Self) -> ReportOutcome {
        match (self, reported) {
            (Self::Adding, Self::Added)
            | (Self::Adding, Self::Failed)
            | (Self::Removing, Self::Removed) => ReportOutcome::Applied,
            (current, reported) if current == reported => ReportOutcome::Noop,
            _ => ReportOutcome::Rejected,
        }
    }
}

/// A sensor or actuator belonging to exactly one controller. The identifier
/// is caller-supplied so re-submissions stay idempotent.
#[derive(Debug, Clone, Serialize)]
pub struct PeripheralRecord {
    pub id: Uuid,
    pub controller_id: Uuid,
    pub name: String,
    pub peripheral_type: PeripheralType,
    pub state: PeripheralState,
    pub parameters: JsonObject,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl PeripheralRecord {
    fn to_add_command(&self) -> Option<JsonObject> {
        if self.state != PeripheralState::Adding {
            return None;
        }
        let mut entry = JsonObject::new();
        entry.insert("uuid".to_owned(), Value::String(self.id.to_string()));
        entry.insert(
            "type".to_owned(),
            Value::String(self.peripheral_type.as_str().to_owned()),
        );
        for (key, value) in &self.parameters {
            entry.insert(key.clone(), value.clone());
        }
        Some(entry)
    }

    fn to_remove_command(&self) -> Option<JsonObject> {
        if self.state != PeripheralState::Removing {
            return None;
        }
        let mut entry = JsonObject::new();
        entry.insert("uuid".to_owned(), Value::String(self.id.to_string()));
        Some(entry)
    }
}

#[derive(Debug, Default)]
pub struct PeripheralStore {
    records: HashMap<Uuid, PeripheralRecord>,
}

impl PeripheralStore {
    /// Apply add commands then remove commands, returning every record that
    /// was actually mutated. The caller holds this store's write lock, so the
    /// whole call is one atomic batch: a validation failure leaves the store
    /// untouched.
    pub fn apply_commands(
        &mut self,
        commands: &CommandBatch,
        controller_id: Uuid,
    ) -> Result<Vec<PeripheralRecord>, CommandError> {
        let mut affected = self.apply_add_commands(&commands.add, controller_id)?;
        affected.extend(self.apply_remove_commands(&commands.remove)?);
        Ok(affected)
    }

    fn apply_add_commands(
        &mut self,
        add_commands: &[JsonObject],
        controller_id: Uuid,
    ) -> Result<Vec<PeripheralRecord>, CommandError> {
        // Stage and validate the whole batch before touching the map.
        let mut staged: Vec<PeripheralRecord> = Vec::with_capacity(add_commands.len());
        let mut seen: HashSet<Uuid> = HashSet::new();
        let now = Utc::now();
        for command in add_commands {
            let mut parameters = command.clone();
            let id = take_uuid(&mut parameters, "uuid")?;
            let raw_type = take_string(&mut parameters, "type", Some(id))?;
            let peripheral_type = PeripheralType::parse(&raw_type).ok_or_else(|| {
                CommandError::UnknownPeripheralType {
                    value: raw_type,
                    id,
                }
            })?;
            let name = take_string(&mut parameters, "name", Some(id))?;
            if self.records.contains_key(&id) || !seen.insert(id) {
                return Err(CommandError::DuplicateUuid { id });
            }
            staged.push(PeripheralRecord {
                id,
                controller_id,
                name,
                peripheral_type,
                state: PeripheralState::Adding,
                parameters,
                created_at: now,
                modified_at: now,
            });
        }
        for record in &staged {
            self.records.insert(record.id, record.clone());
        }
        Ok(staged)
    }

    fn apply_remove_commands(
        &mut self,
        remove_commands: &[JsonObject],
    ) -> Result<Vec<PeripheralRecord>, CommandError> {
        let mut uuids = Vec::with_capacity(remove_commands.len());
        for command in remove_commands {
            let mut entry = command.clone();
            uuids.push(take_uuid(&mut entry, "uuid")?);
        }
        // Identifiers that are absent or past the removable set are skipped:
        // the command may legitimately race with a completed removal. Repeats
        // within the batch collapse to one transition.
        let now = Utc::now();
        let mut affected = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        for id in uuids {
            if !seen.insert(id) {
                continue;
            }
            if let Some(record) = self.records.get_mut(&id) {
                if record.state.removable() {
                    record.state = PeripheralState::Removing;
                    record.modified_at = now;
                    affected.push(record.clone());
                }
            }
        }
        Ok(affected)
    }

    /// Commit a controller-reported state for one peripheral. Unknown
    /// identifiers and illegal transitions are ignored with a warning; the
    /// controller may be reporting against state we already superseded.
    pub fn commit_report(&mut self, id: Uuid, reported: PeripheralState) -> ReportOutcome {
        let Some(record) = self.records.get_mut(&id) else {
            tracing::warn!(%id, "result for unknown peripheral");
            return ReportOutcome::Rejected;
        };
        let outcome = record.state.report(reported);
        if outcome == ReportOutcome::Applied {
            record.state = reported;
            record.modified_at = Utc::now();
        } else if outcome == ReportOutcome::Rejected {
            tracing::warn!(
                %id,
                current = ?record.state,
                ?reported,
                "rejected peripheral state report"
            );
        }
        outcome
    }

    pub fn get(&self, id: &Uuid) -> Option<&PeripheralRecord> {
        self.records.get(id)
    }

    pub fn for_controller(&self, controller_id: Uuid) -> Vec<PeripheralRecord> {
        self.records
            .values()
            .filter(|record| record.controller_id == controller_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Pure projection of records onto the outbound command shape. Records in a
/// state with no command equivalent are silently excluded, and empty lists
/// are omitted entirely.
pub fn to_commands(peripherals: &[PeripheralRecord]) -> CommandBatch {
    let mut batch = CommandBatch::default();
    for peripheral in peripherals {
        if let Some(entry) = peripheral.to_add_command() {
            batch.add.push(entry);
        }
        if let Some(entry) = peripheral.to_remove_command() {
            batch.remove.push(entry);
        }
    }
    batch
}
