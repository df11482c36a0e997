//! Coordination state for the loam manager. Controllers are hardware units
//! holding peripherals and tasks; callers push command envelopes at them over
//! HTTP and the manager forwards the validated work to whichever process
//! currently holds the controller's live connection.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use bytes::Bytes;
use channel_bus::{Bus, BusMessage};
use chrono::{DateTime, Utc};
use loam_proto::{ChannelCommand, Envelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Authorizer, OwnerTokenAuthorizer};
use crate::stores::peripheral::{self, PeripheralState, PeripheralStore};
use crate::stores::task::{self, TaskState, TaskStore};
use crate::stores::CommandError;

/// A registered hardware unit. `channel_name` is the address of its live
/// connection; empty means disconnected and therefore undeliverable.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerRecord {
    pub id: Uuid,
    pub name: String,
    pub controller_type: String,
    #[serde(skip_serializing)]
    pub owner_token: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    #[serde(skip_serializing)]
    pub channel_name: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSummary {
    pub id: Uuid,
    pub name: String,
    pub controller_type: String,
    pub connected: bool,
    pub peripherals: usize,
    pub tasks: usize,
    pub created_at: DateTime<Utc>,
}

/// Audit entry for one envelope, unique per (timestamp, controller).
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub created_at: DateTime<Utc>,
    pub controller_id: Uuid,
    pub message: Value,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("controller not found")]
    ControllerNotFound,
    #[error("not authorized for controller")]
    Forbidden,
    #[error("controller channel not set")]
    NotConnected,
    #[error("{0}")]
    Validation(String),
    #[error("duplicate message timestamp for controller")]
    DuplicateMessage,
}

impl From<CommandError> for StateError {
    fn from(err: CommandError) -> Self {
        StateError::Validation(err.to_string())
    }
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<InnerState>,
    bus: Arc<dyn Bus>,
    authorizer: Arc<dyn Authorizer>,
}

struct InnerState {
    controllers: RwLock<HashMap<Uuid, ControllerRecord>>,
    peripherals: RwLock<PeripheralStore>,
    tasks: RwLock<TaskStore>,
    messages: RwLock<BTreeMap<(DateTime<Utc>, Uuid), MessageRecord>>,
}

impl AppState {
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self::with_authorizer(bus, Arc::new(OwnerTokenAuthorizer))
    }

    pub fn with_authorizer(bus: Arc<dyn Bus>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            inner: Arc::new(InnerState {
                controllers: RwLock::new(HashMap::new()),
                peripherals: RwLock::new(PeripheralStore::default()),
                tasks: RwLock::new(TaskStore::default()),
                messages: RwLock::new(BTreeMap::new()),
            }),
            bus,
            authorizer,
        }
    }

    pub async fn register_controller(
        &self,
        name: String,
        controller_type: String,
        owner_token: String,
    ) -> ControllerRecord {
        let now = Utc::now();
        let record = ControllerRecord {
            id: Uuid::new_v4(),
            name,
            controller_type,
            owner_token,
            auth_token: Uuid::new_v4().simple().to_string(),
            channel_name: String::new(),
            created_at: now,
            modified_at: now,
        };
        let mut controllers = self.inner.controllers.write().await;
        controllers.insert(record.id, record.clone());
        info!(controller = %record.id, "registered controller");
        record
    }

    pub async fn controller_summary(
        &self,
        controller_id: Uuid,
        caller: &str,
    ) -> Result<ControllerSummary, StateError> {
        let controllers = self.inner.controllers.read().await;
        let controller = controllers
            .get(&controller_id)
            .ok_or(StateError::ControllerNotFound)?;
        if !self.authorizer.allows(caller, controller) {
            return Err(StateError::Forbidden);
        }
        let peripherals = self.inner.peripherals.read().await;
        let tasks = self.inner.tasks.read().await;
        Ok(ControllerSummary {
            id: controller.id,
            name: controller.name.clone(),
            controller_type: controller.controller_type.clone(),
            connected: !controller.channel_name.is_empty(),
            peripherals: peripherals.for_controller(controller_id).len(),
            tasks: tasks.for_controller(controller_id).len(),
            created_at: controller.created_at,
        })
    }

    /// Translate an inbound command envelope into lifecycle state and forward
    /// the validated commands to the controller's live connection. Returns
    /// the outbound envelope as an acceptance acknowledgment; execution is
    /// confirmed later by an independent result envelope carrying the same
    /// request id.
    pub async fn dispatch_command(
        &self,
        controller_id: Uuid,
        body: Value,
        request_id: String,
        caller: &str,
    ) -> Result<Value, StateError> {
        let channel_name = {
            let controllers = self.inner.controllers.read().await;
            let controller = controllers
                .get(&controller_id)
                .ok_or(StateError::ControllerNotFound)?;
            if !self.authorizer.allows(caller, controller) {
                return Err(StateError::Forbidden);
            }
            if controller.channel_name.is_empty() {
                return Err(StateError::NotConnected);
            }
            controller.channel_name.clone()
        };

        self.record_message(controller_id, body.clone(), &request_id)
            .await?;

        let envelope = Envelope::from_value(body);
        let peripheral_batch = envelope.peripheral_commands();
        let task_batch = envelope.task_commands();

        let peripherals = {
            let mut store = self.inner.peripherals.write().await;
            store.apply_commands(&peripheral_batch, controller_id)?
        };
        // The two stores are mutated independently, not under one
        // transaction: a task validation failure below leaves the peripheral
        // mutations committed and surfaces a single error to the caller.
        let tasks = {
            let mut store = self.inner.tasks.write().await;
            store.apply_commands(&task_batch, controller_id)?
        };

        let peripheral_commands = peripheral::to_commands(&peripherals);
        let task_commands = task::to_commands(&tasks);

        if !peripheral_commands.is_empty() {
            self.publish(
                &channel_name,
                &ChannelCommand::PeripheralCommands {
                    commands: peripheral_commands.clone(),
                    request_id: request_id.clone(),
                },
            );
        }
        if !task_commands.is_empty() {
            self.publish(
                &channel_name,
                &ChannelCommand::ControllerTaskCommands {
                    commands: task_commands.clone(),
                    request_id: request_id.clone(),
                },
            );
        }

        Ok(Envelope::command(peripheral_commands, task_commands, &request_id).to_value())
    }

    fn publish(&self, channel_name: &str, message: &ChannelCommand) {
        // Fire-and-forget: liveness and publish are checked at different
        // points in time, so a dropped connection means a dropped message.
        match serde_json::to_vec(message) {
            Ok(payload) => {
                if let Err(err) = self.bus.publish(channel_name, Bytes::from(payload)) {
                    warn!(channel = %channel_name, error = %err, "command publish failed");
                }
            }
            Err(err) => warn!(error = %err, "failed to serialize channel command"),
        }
    }

    async fn record_message(
        &self,
        controller_id: Uuid,
        message: Value,
        request_id: &str,
    ) -> Result<(), StateError> {
        let mut messages = self.inner.messages.write().await;
        let created_at = Utc::now();
        let key = (created_at, controller_id);
        if messages.contains_key(&key) {
            return Err(StateError::DuplicateMessage);
        }
        messages.insert(
            key,
            MessageRecord {
                created_at,
                controller_id,
                message,
                request_id: request_id.to_owned(),
            },
        );
        Ok(())
    }

    pub async fn list_messages(
        &self,
        controller_id: Uuid,
        caller: &str,
    ) -> Result<Vec<MessageRecord>, StateError> {
        {
            let controllers = self.inner.controllers.read().await;
            let controller = controllers
                .get(&controller_id)
                .ok_or(StateError::ControllerNotFound)?;
            if !self.authorizer.allows(caller, controller) {
                return Err(StateError::Forbidden);
            }
        }
        let messages = self.inner.messages.read().await;
        Ok(messages
            .values()
            .rev()
            .filter(|record| record.controller_id == controller_id)
            .cloned()
            .collect())
    }

    /// Device-side authentication for the WebSocket endpoint, distinct from
    /// the caller-side authorization gate.
    pub async fn authenticate_controller(
        &self,
        controller_id: Uuid,
        token: &str,
    ) -> Result<(), StateError> {
        let controllers = self.inner.controllers.read().await;
        let controller = controllers
            .get(&controller_id)
            .ok_or(StateError::ControllerNotFound)?;
        if token.is_empty() || token != controller.auth_token {
            return Err(StateError::Forbidden);
        }
        Ok(())
    }

    /// Assign a fresh channel id to the controller's live connection and
    /// subscribe to it. The most recent connection wins: any previous channel
    /// id is overwritten, and its messages go nowhere.
    pub async fn connect_controller(
        &self,
        controller_id: Uuid,
    ) -> Result<(String, broadcast::Receiver<BusMessage>), StateError> {
        let mut controllers = self.inner.controllers.write().await;
        let controller = controllers
            .get_mut(&controller_id)
            .ok_or(StateError::ControllerNotFound)?;
        let channel_name = Uuid::new_v4().to_string();
        let receiver = self.bus.subscribe(&channel_name);
        controller.channel_name = channel_name.clone();
        controller.modified_at = Utc::now();
        info!(controller = %controller_id, channel = %channel_name, "controller connected");
        Ok((channel_name, receiver))
    }

    /// Clear the live channel id, but only if it is still ours: a newer
    /// connection may have replaced it in the meantime.
    pub async fn disconnect_controller(&self, controller_id: Uuid, channel_name: &str) {
        let mut controllers = self.inner.controllers.write().await;
        if let Some(controller) = controllers.get_mut(&controller_id) {
            if controller.channel_name == channel_name {
                controller.channel_name.clear();
                controller.modified_at = Utc::now();
                info!(controller = %controller_id, "controller disconnected");
            }
        }
    }

    /// Ingest an envelope sent by the controller itself: audit it, and for
    /// result envelopes commit the reported lifecycle transitions.
    pub async fn ingest_controller_message(
        &self,
        controller_id: Uuid,
        envelope: Envelope,
    ) -> Result<(), StateError> {
        self.record_message(controller_id, envelope.to_value(), envelope.request_id())
            .await?;

        match &envelope {
            Envelope::Result(_) => {
                let reports = envelope.peripheral_results();
                if !reports.is_empty() {
                    let mut store = self.inner.peripherals.write().await;
                    for report in reports {
                        match PeripheralState::parse(&report.state) {
                            Some(state) => {
                                store.commit_report(report.uuid, state);
                            }
                            None => warn!(
                                uuid = %report.uuid,
                                state = %report.state,
                                "unknown peripheral state in result"
                            ),
                        }
                    }
                }
                let reports = envelope.task_results();
                if !reports.is_empty() {
                    let mut store = self.inner.tasks.write().await;
                    for report in reports {
                        match TaskState::parse(&report.state) {
                            Some(state) => {
                                store.commit_report(report.uuid, state);
                            }
                            None => warn!(
                                uuid = %report.uuid,
                                state = %report.state,
                                "unknown task state in result"
                            ),
                        }
                    }
                }
            }
            Envelope::Register(_) => {
                info!(controller = %controller_id, "controller register message");
            }
            Envelope::Telemetry(_) | Envelope::Error(_) => {
                debug!(controller = %controller_id, kind = envelope.wire_type(), "controller report");
            }
            Envelope::Command(_) | Envelope::Unknown(_) => {
                warn!(
                    controller = %controller_id,
                    kind = envelope.wire_type(),
                    "unexpected envelope from controller"
                );
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn peripheral_state(&self, id: &Uuid) -> Option<PeripheralState> {
        self.inner
            .peripherals
            .read()
            .await
            .get(id)
            .map(|record| record.state)
    }

    #[cfg(test)]
    pub(crate) async fn task_state(&self, id: &Uuid) -> Option<TaskState> {
        self.inner.tasks.read().await.get(id).map(|record| record.state)
    }

    #[cfg(test)]
    pub(crate) async fn peripheral_count(&self) -> usize {
        self.inner.peripherals.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel_bus::LocalBus;
    use serde_json::json;

    const OWNER: &str = "owner-token";

    async fn state_with_controller() -> (AppState, ControllerRecord) {
        let state = AppState::new(Arc::new(LocalBus::new()));
        let controller = state
            .register_controller("main bed".into(), "ESP32".into(), OWNER.into())
            .await;
        (state, controller)
    }

    fn add_command_body(uuid: &Uuid) -> Value {
        json!({
            "type": "cmd",
            "peripheral": {
                "add": [{
                    "uuid": uuid.to_string(),
                    "type": "BME280",
                    "name": "temp",
                    "pin": 4
                }]
            }
        })
    }

    #[tokio::test]
    async fn dispatch_unknown_controller_is_not_found() {
        let state = AppState::new(Arc::new(LocalBus::new()));
        let err = state
            .dispatch_command(Uuid::new_v4(), json!({"type": "cmd"}), "req".into(), OWNER)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ControllerNotFound));
    }

    #[tokio::test]
    async fn dispatch_with_wrong_caller_is_forbidden() {
        let (state, controller) = state_with_controller().await;
        state.connect_controller(controller.id).await.unwrap();
        let err = state
            .dispatch_command(controller.id, json!({"type": "cmd"}), "req".into(), "intruder")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Forbidden));
    }

    #[tokio::test]
    async fn dispatch_to_disconnected_controller_mutates_nothing() {
        let (state, controller) = state_with_controller().await;
        let id = Uuid::new_v4();
        let err = state
            .dispatch_command(controller.id, add_command_body(&id), "req".into(), OWNER)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::NotConnected));
        // Not-connected precedes validation, so even a valid batch leaves no
        // trace.
        assert_eq!(state.peripheral_count().await, 0);
        assert!(state.list_messages(controller.id, OWNER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatch_applies_stores_and_delivers_commands() {
        let (state, controller) = state_with_controller().await;
        let (_, mut delivery) = state.connect_controller(controller.id).await.unwrap();

        let peripheral_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let body = json!({
            "type": "cmd",
            "peripheral": {
                "add": [{
                    "uuid": peripheral_id.to_string(),
                    "type": "BME280",
                    "name": "temp",
                    "pin": 4
                }]
            },
            "task": {
                "add": [{
                    "uuid": task_id.to_string(),
                    "type": "PollSensors",
                    "name": "poll",
                    "interval_ms": 5000
                }]
            }
        });
        let ack = state
            .dispatch_command(controller.id, body, "req-7".into(), OWNER)
            .await
            .unwrap();

        assert_eq!(ack["type"], "cmd");
        assert_eq!(ack["request_id"], "req-7");
        assert_eq!(ack["peripheral"]["add"][0]["uuid"], peripheral_id.to_string());
        assert_eq!(ack["peripheral"]["add"][0]["pin"], 4);
        assert!(ack["peripheral"]["add"][0].get("name").is_none());
        assert_eq!(ack["task"]["add"][0]["uuid"], task_id.to_string());

        assert_eq!(
            state.peripheral_state(&peripheral_id).await,
            Some(PeripheralState::Adding)
        );
        assert_eq!(state.task_state(&task_id).await, Some(TaskState::Adding));

        let first: Value =
            serde_json::from_slice(&delivery.recv().await.unwrap().payload).unwrap();
        assert_eq!(first["type"], "send.peripheral.commands");
        assert_eq!(first["request_id"], "req-7");
        assert_eq!(first["commands"]["add"][0]["uuid"], peripheral_id.to_string());

        let second: Value =
            serde_json::from_slice(&delivery.recv().await.unwrap().payload).unwrap();
        assert_eq!(second["type"], "send.controller.task.commands");
        assert_eq!(second["commands"]["add"][0]["type"], "PollSensors");

        assert!(delivery.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_op_command_succeeds_without_delivery() {
        let (state, controller) = state_with_controller().await;
        let (_, mut delivery) = state.connect_controller(controller.id).await.unwrap();

        let ack = state
            .dispatch_command(controller.id, json!({"type": "cmd"}), "req-1".into(), OWNER)
            .await
            .unwrap();
        assert_eq!(ack["type"], "cmd");
        assert!(ack.get("peripheral").is_none());
        assert!(ack.get("task").is_none());
        assert!(delivery.try_recv().is_err());
    }

    #[tokio::test]
    async fn task_validation_failure_keeps_peripheral_mutation() {
        let (state, controller) = state_with_controller().await;
        let (_, mut delivery) = state.connect_controller(controller.id).await.unwrap();

        let peripheral_id = Uuid::new_v4();
        let body = json!({
            "type": "cmd",
            "peripheral": {
                "add": [{
                    "uuid": peripheral_id.to_string(),
                    "type": "LED",
                    "name": "light"
                }]
            },
            "task": {
                "remove": [{"id": "missing uuid key"}]
            }
        });
        let err = state
            .dispatch_command(controller.id, body, "req-2".into(), OWNER)
            .await
            .unwrap_err();

        let StateError::Validation(message) = err else {
            panic!("expected validation error");
        };
        assert!(message.contains("uuid"));
        // Accepted inconsistency: the peripheral store committed before the
        // task batch failed, and nothing was delivered.
        assert_eq!(
            state.peripheral_state(&peripheral_id).await,
            Some(PeripheralState::Adding)
        );
        assert!(delivery.try_recv().is_err());
    }

    #[tokio::test]
    async fn validation_error_names_missing_key() {
        let (state, controller) = state_with_controller().await;
        state.connect_controller(controller.id).await.unwrap();

        let id = Uuid::new_v4();
        let body = json!({
            "type": "cmd",
            "peripheral": {"add": [{"uuid": id.to_string(), "name": "no type"}]}
        });
        let err = state
            .dispatch_command(controller.id, body, "req".into(), OWNER)
            .await
            .unwrap_err();
        let StateError::Validation(message) = err else {
            panic!("expected validation error");
        };
        assert!(message.contains("type"));
        assert!(message.contains(&id.to_string()));
        assert_eq!(state.peripheral_count().await, 0);
    }

    #[tokio::test]
    async fn non_command_envelope_dispatches_as_no_op() {
        let (state, controller) = state_with_controller().await;
        let (_, mut delivery) = state.connect_controller(controller.id).await.unwrap();

        let ack = state
            .dispatch_command(
                controller.id,
                json!({"peripheral": {"add": [{"bogus": true}]}}),
                "req".into(),
                OWNER,
            )
            .await
            .unwrap();
        // No recognized discriminator means no extracted work; probing is not
        // an error.
        assert!(ack.get("peripheral").is_none());
        assert!(delivery.try_recv().is_err());
        assert_eq!(state.peripheral_count().await, 0);
    }

    #[tokio::test]
    async fn result_envelope_commits_reported_states() {
        let (state, controller) = state_with_controller().await;
        state.connect_controller(controller.id).await.unwrap();

        let id = Uuid::new_v4();
        state
            .dispatch_command(controller.id, add_command_body(&id), "req".into(), OWNER)
            .await
            .unwrap();
        assert_eq!(state.peripheral_state(&id).await, Some(PeripheralState::Adding));

        let result = Envelope::from_value(json!({
            "type": "result",
            "peripheral": [{"uuid": id, "state": "added"}],
            "request_id": "req"
        }));
        state
            .ingest_controller_message(controller.id, result)
            .await
            .unwrap();
        assert_eq!(state.peripheral_state(&id).await, Some(PeripheralState::Added));

        // An illegal edge is ignored.
        let bogus = Envelope::from_value(json!({
            "type": "result",
            "peripheral": [{"uuid": id, "state": "removed"}]
        }));
        state
            .ingest_controller_message(controller.id, bogus)
            .await
            .unwrap();
        assert_eq!(state.peripheral_state(&id).await, Some(PeripheralState::Added));
    }

    #[tokio::test]
    async fn concurrent_duplicate_adds_accept_exactly_one() {
        let (state, controller) = state_with_controller().await;
        state.connect_controller(controller.id).await.unwrap();

        let id = Uuid::new_v4();
        let body = add_command_body(&id);
        let first = state.clone();
        let second = state.clone();
        let (a, b) = tokio::join!(
            tokio::spawn({
                let body = body.clone();
                async move {
                    first
                        .dispatch_command(controller.id, body, "req-a".into(), OWNER)
                        .await
                }
            }),
            tokio::spawn(async move {
                second
                    .dispatch_command(controller.id, body, "req-b".into(), OWNER)
                    .await
            }),
        );

        // The store's write lock serializes the two batches: one commits, the
        // other sees the identifier as taken.
        let results = [a.unwrap(), b.unwrap()];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        let err = results.into_iter().find_map(Result::err).unwrap();
        let StateError::Validation(message) = err else {
            panic!("expected validation error");
        };
        assert!(message.contains("duplicate uuid"));

        assert_eq!(state.peripheral_count().await, 1);
        assert_eq!(
            state.peripheral_state(&id).await,
            Some(PeripheralState::Adding)
        );
    }

    #[tokio::test]
    async fn reconnect_replaces_channel_and_disconnect_respects_newest() {
        let (state, controller) = state_with_controller().await;
        let (first_channel, _) = state.connect_controller(controller.id).await.unwrap();
        let (second_channel, _) = state.connect_controller(controller.id).await.unwrap();
        assert_ne!(first_channel, second_channel);

        // The stale connection's teardown must not clear the newer channel.
        state.disconnect_controller(controller.id, &first_channel).await;
        let summary = state.controller_summary(controller.id, OWNER).await.unwrap();
        assert!(summary.connected);

        state.disconnect_controller(controller.id, &second_channel).await;
        let summary = state.controller_summary(controller.id, OWNER).await.unwrap();
        assert!(!summary.connected);
    }

    #[tokio::test]
    async fn messages_are_audited_newest_first() {
        let (state, controller) = state_with_controller().await;
        state.connect_controller(controller.id).await.unwrap();

        state
            .dispatch_command(controller.id, json!({"type": "cmd"}), "req-a".into(), OWNER)
            .await
            .unwrap();
        state
            .dispatch_command(controller.id, json!({"type": "cmd"}), "req-b".into(), OWNER)
            .await
            .unwrap();

        let messages = state.list_messages(controller.id, OWNER).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].request_id, "req-b");
        assert_eq!(messages[1].request_id, "req-a");
    }
}
