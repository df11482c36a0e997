use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use loam_proto::{CommandBatch, JsonObject};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::{take_string, take_uuid, CommandError, ReportOutcome};

/// Mirrors the peripheral lifecycle, scoped to the controller itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Adding,
    Added,
    Failed,
    Removing,
    Removed,
}

impl TaskState {
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

/// A controller-scoped unit of work. The task vocabulary is firmware-defined,
/// so unlike peripherals the type is carried as an open string.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub controller_id: Uuid,
    pub name: String,
    pub task_type: String,
    pub state: TaskState,
    pub parameters: JsonObject,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl TaskRecord {
    fn to_add_command(&self) -> Option<JsonObject> {
        if self.state != TaskState::Adding {
            return None;
        }
        let mut entry = JsonObject::new();
        entry.insert("uuid".to_owned(), Value::String(self.id.to_string()));
        entry.insert("type".to_owned(), Value::String(self.task_type.clone()));
        for (key, value) in &self.parameters {
            entry.insert(key.clone(), value.clone());
        }
        Some(entry)
    }

    fn to_remove_command(&self) -> Option<JsonObject> {
        if self.state != TaskState::Removing {
            return None;
        }
        let mut entry = JsonObject::new();
        entry.insert("uuid".to_owned(), Value::String(self.id.to_string()));
        Some(entry)
    }
}

#[derive(Debug, Default)]
pub struct TaskStore {
    records: HashMap<Uuid, TaskRecord>,
}

impl TaskStore {
    /// Same contract as the peripheral store: adds first, then removes, one
    /// atomic batch under the caller's write lock.
    pub fn apply_commands(
        &mut self,
        commands: &CommandBatch,
        controller_id: Uuid,
    ) -> Result<Vec<TaskRecord>, CommandError> {
        let mut affected = self.apply_add_commands(&commands.add, controller_id)?;
        affected.extend(self.apply_remove_commands(&commands.remove)?);
        Ok(affected)
    }

    fn apply_add_commands(
        &mut self,
        add_commands: &[JsonObject],
        controller_id: Uuid,
    ) -> Result<Vec<TaskRecord>, CommandError> {
        let mut staged: Vec<TaskRecord> = Vec::with_capacity(add_commands.len());
        let mut seen: HashSet<Uuid> = HashSet::new();
        let now = Utc::now();
        for command in add_commands {
            let mut parameters = command.clone();
            let id = take_uuid(&mut parameters, "uuid")?;
            let task_type = take_string(&mut parameters, "type", Some(id))?;
            let name = take_string(&mut parameters, "name", Some(id))?;
            if self.records.contains_key(&id) || !seen.insert(id) {
                return Err(CommandError::DuplicateUuid { id });
            }
            staged.push(TaskRecord {
                id,
                controller_id,
                name,
                task_type,
                state: TaskState::Adding,
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
    ) -> Result<Vec<TaskRecord>, CommandError> {
        let mut uuids = Vec::with_capacity(remove_commands.len());
        for command in remove_commands {
            let mut entry = command.clone();
            uuids.push(take_uuid(&mut entry, "uuid")?);
        }
        let now = Utc::now();
        let mut affected = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        for id in uuids {
            if !seen.insert(id) {
                continue;
            }
            if let Some(record) = self.records.get_mut(&id) {
                if record.state.removable() {
                    record.state = TaskState::Removing;
                    record.modified_at = now;
                    affected.push(record.clone());
                }
            }
        }
        Ok(affected)
    }

    pub fn commit_report(&mut self, id: Uuid, reported: TaskState) -> ReportOutcome {
        let Some(record) = self.records.get_mut(&id) else {
            tracing::warn!(%id, "result for unknown task");
            return ReportOutcome::Rejected;
        };
        let outcome = record.state.report(reported);
        if outcome == ReportOutcome::Applied {
            record.state = reported;
            record.modified_at = Utc::now();
        } else if outcome == ReportOutcome::Rejected {
            tracing::warn!(%id, current = ?record.state, ?reported, "rejected task state report");
        }
        outcome
    }

    pub fn get(&self, id: &Uuid) -> Option<&TaskRecord> {
        self.records.get(id)
    }

    pub fn for_controller(&self, controller_id: Uuid) -> Vec<TaskRecord> {
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

pub fn to_commands(tasks: &[TaskRecord]) -> CommandBatch {
    let mut batch = CommandBatch::default();
    for task in tasks {
        if let Some(entry) = task.to_add_command() {
            batch.add.push(entry);
        }
        if let Some(entry) = task.to_remove_command() {
            batch.remove.push(entry);
        }
    }
    batch
}
