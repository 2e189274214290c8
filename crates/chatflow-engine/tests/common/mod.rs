//! Shared test harness: recording collaborator fakes and definition
//! builders against the in-memory store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use chatflow_contracts::{
    ApiCallCommand, ApiCallResult, CreateFormCommand, DataSetQueryCommand, QueryResult,
    SendMessageCommand,
};
use chatflow_core::{
    DeadlineConfig, DefinitionStatus, ExpectedReply, MessageContent, SendMessageConfig,
    StartConfig, StepDef, StepKind, VariableDecl, WaitConfig, WorkflowDefinition,
};
use chatflow_engine::{
    Collaborators, DataSetService, EFormService, EngineError, EscalationScheduler,
    ExternalApiClient, MessagingGateway, Orchestrator, SchedulerConfig, SessionPolicy,
};
use chatflow_storage::{CreateDefinition, ExecutionStore, InMemoryExecutionStore};

#[derive(Default)]
pub struct RecordingGateway {
    pub sent: Mutex<Vec<SendMessageCommand>>,
    pub fail_next: Mutex<bool>,
}

impl RecordingGateway {
    pub fn sent_to(&self, recipient: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|c| c.recipient == recipient)
            .count()
    }
}

#[async_trait]
impl MessagingGateway for RecordingGateway {
    async fn send(&self, command: SendMessageCommand) -> Result<(), EngineError> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(EngineError::Collaborator("gateway unavailable".to_string()));
        }
        self.sent.lock().push(command);
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticDataSet {
    pub rows: Mutex<Vec<HashMap<String, serde_json::Value>>>,
}

#[async_trait]
impl DataSetService for StaticDataSet {
    async fn query(&self, _command: DataSetQueryCommand) -> Result<QueryResult, EngineError> {
        Ok(QueryResult {
            rows: self.rows.lock().clone(),
        })
    }
}

pub struct StaticApi {
    pub result: Mutex<ApiCallResult>,
    pub calls: Mutex<Vec<ApiCallCommand>>,
}

impl Default for StaticApi {
    fn default() -> Self {
        Self {
            result: Mutex::new(ApiCallResult {
                status: 200,
                body: serde_json::json!({}),
            }),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ExternalApiClient for StaticApi {
    async fn call(&self, command: ApiCallCommand) -> Result<ApiCallResult, EngineError> {
        self.calls.lock().push(command);
        Ok(self.result.lock().clone())
    }
}

pub struct StaticForms {
    pub instance_id: Mutex<Uuid>,
    pub created: Mutex<Vec<CreateFormCommand>>,
}

impl Default for StaticForms {
    fn default() -> Self {
        Self {
            instance_id: Mutex::new(Uuid::now_v7()),
            created: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EFormService for StaticForms {
    async fn create_form(&self, command: CreateFormCommand) -> Result<Uuid, EngineError> {
        self.created.lock().push(command);
        Ok(*self.instance_id.lock())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryExecutionStore>,
    pub gateway: Arc<RecordingGateway>,
    pub datasets: Arc<StaticDataSet>,
    pub api: Arc<StaticApi>,
    pub forms: Arc<StaticForms>,
    pub orchestrator: Arc<Orchestrator>,
    pub scheduler: EscalationScheduler,
}

pub fn harness() -> Harness {
    harness_with_policy(SessionPolicy::Reject)
}

pub fn harness_with_policy(policy: SessionPolicy) -> Harness {
    let store = Arc::new(InMemoryExecutionStore::new());
    let gateway = Arc::new(RecordingGateway::default());
    let datasets = Arc::new(StaticDataSet::default());
    let api = Arc::new(StaticApi::default());
    let forms = Arc::new(StaticForms::default());

    let collaborators = Collaborators {
        gateway: gateway.clone(),
        datasets: datasets.clone(),
        api: api.clone(),
        forms: forms.clone(),
    };
    let store_dyn: Arc<dyn ExecutionStore> = store.clone();
    let orchestrator = Arc::new(Orchestrator::with_session_policy(
        store_dyn.clone(),
        collaborators,
        policy,
    ));
    let scheduler = EscalationScheduler::new(
        store_dyn,
        orchestrator.clone(),
        SchedulerConfig::default(),
    );

    Harness {
        store,
        gateway,
        datasets,
        api,
        forms,
        orchestrator,
        scheduler,
    }
}

pub fn step(index: i32, kind: StepKind) -> StepDef {
    StepDef {
        index,
        name: format!("step-{index}"),
        kind,
    }
}

pub fn start_step(index: i32) -> StepDef {
    step(index, StepKind::Start(StartConfig::default()))
}

pub fn send_text(index: i32, text: &str) -> StepDef {
    step(
        index,
        StepKind::SendMessage(SendMessageConfig {
            content: MessageContent::Text {
                text: text.to_string(),
            },
            recipient: None,
        }),
    )
}

pub fn wait_free_text(index: i32, save_as: &str, deadline: Option<DeadlineConfig>) -> StepDef {
    step(
        index,
        StepKind::WaitForReply(WaitConfig {
            expect: ExpectedReply::FreeText,
            save_as: Some(save_as.to_string()),
            deadline,
        }),
    )
}

pub fn definition(variables: Vec<VariableDecl>, steps: Vec<StepDef>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: Uuid::now_v7(),
        tenant_id: Uuid::now_v7(),
        name: "test-flow".to_string(),
        version: 1,
        status: DefinitionStatus::Active,
        variables,
        steps,
    }
}

/// Insert the definition as an Active row and return its id.
pub async fn insert_active(harness: &Harness, def: &WorkflowDefinition) -> Uuid {
    harness
        .store
        .insert_definition(CreateDefinition {
            id: def.id,
            tenant_id: def.tenant_id,
            name: def.name.clone(),
            version: def.version,
            status: "active".to_string(),
            document: serde_json::to_value(def).expect("definition serializes"),
        })
        .await
        .expect("definition inserts");
    def.id
}
