//! Deadline sweep behavior: retry scheduling, escalation, sweep leases
//! and the whole-execution overdue notification.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use chatflow_contracts::{InboundMessage, MessageType, Signal, TimerElapsed};
use chatflow_core::{
    DeadlineConfig, EscalationConfig, EscalationOutcome, MessageContent, OverdueConfig,
    StartConfig, StepKind, VarType, VariableDecl,
};
use chatflow_engine::{AdvanceOutcome, EngineError, StartTrigger, SweepStats};
use chatflow_storage::ExecutionStore;

use common::*;

fn text(text: &str) -> MessageContent {
    MessageContent::Text {
        text: text.to_string(),
    }
}

fn deadline(
    deadline_secs: u64,
    retry_count: u32,
    interval_secs: u64,
    outcome: EscalationOutcome,
) -> DeadlineConfig {
    DeadlineConfig {
        deadline: Duration::from_secs(deadline_secs),
        retry_count,
        retry_interval: Duration::from_secs(interval_secs),
        retry_message: Some(text("still there?")),
        escalation: Some(EscalationConfig {
            recipients: vec!["sup".to_string()],
            message: text("{{name}} stopped responding"),
            on_exhausted: outcome,
        }),
    }
}

fn waiting_definition(cfg: DeadlineConfig) -> chatflow_core::WorkflowDefinition {
    definition(
        vec![
            VariableDecl {
                name: "name".to_string(),
                data_type: VarType::String,
            },
            VariableDecl {
                name: "reply".to_string(),
                data_type: VarType::String,
            },
        ],
        vec![
            start_step(0),
            wait_free_text(1, "reply", Some(cfg)),
            step(2, StepKind::End),
        ],
    )
}

fn trigger(user: &str) -> StartTrigger {
    StartTrigger {
        user_id: Some(user.to_string()),
        variables: [("name".to_string(), serde_json::json!("Ada"))].into(),
    }
}

fn reply(sender: &str, content: &str) -> InboundMessage {
    InboundMessage {
        sender_id: sender.to_string(),
        raw_content: content.to_string(),
        message_type: MessageType::Text,
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn retry_then_escalate_follows_the_timeline() {
    let h = harness();
    // deadline=600s, 2 retries every 300s: nudges at t+300 and t+600,
    // escalation at t+900
    let def = waiting_definition(deadline(600, 2, 300, EscalationOutcome::KeepWaiting));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    let d0 = h
        .store
        .get_execution(exec.id)
        .await
        .unwrap()
        .deadline_at
        .unwrap();

    let stats = h.scheduler.sweep_at(d0).await.unwrap();
    assert_eq!(stats.due_waits, 1);
    assert_eq!(h.gateway.sent_to("u1"), 1);

    let row = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(row.retries_sent, 1);
    assert_eq!(row.deadline_at, Some(d0 + chrono::Duration::seconds(300)));

    let stats = h
        .scheduler
        .sweep_at(d0 + chrono::Duration::seconds(300))
        .await
        .unwrap();
    assert_eq!(stats.due_waits, 1);
    assert_eq!(h.gateway.sent_to("u1"), 2);

    let stats = h
        .scheduler
        .sweep_at(d0 + chrono::Duration::seconds(600))
        .await
        .unwrap();
    assert_eq!(stats.due_waits, 1);

    let row = h.store.get_execution(exec.id).await.unwrap();
    assert!(row.escalated);
    assert!(row.deadline_at.is_none());
    assert_eq!(row.status, "waiting");
    assert_eq!(h.gateway.sent_to("sup"), 1);
    assert_eq!(h.gateway.sent_to("u1"), 2);

    // Escalation was advisory: no further timers fire, and the user can
    // still answer
    let stats = h
        .scheduler
        .sweep_at(d0 + chrono::Duration::seconds(900))
        .await
        .unwrap();
    assert_eq!(stats, SweepStats::default());

    let outcome = h
        .orchestrator
        .signal_message(reply("u1", "sorry, here now"))
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced);
    let row = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(row.status, "completed");
}

#[tokio::test]
async fn escalation_renders_variables_into_the_message() {
    let h = harness();
    let def = waiting_definition(deadline(60, 0, 300, EscalationOutcome::KeepWaiting));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    let d0 = h
        .store
        .get_execution(exec.id)
        .await
        .unwrap()
        .deadline_at
        .unwrap();
    h.scheduler.sweep_at(d0).await.unwrap();

    let sent = h.gateway.sent.lock();
    let to_sup = sent.iter().find(|c| c.recipient == "sup").unwrap();
    match &to_sup.content {
        chatflow_contracts::OutboundContent::Text { text } => {
            assert_eq!(text, "Ada stopped responding");
        }
        _ => panic!("expected text"),
    }
}

#[tokio::test]
async fn exhausted_wait_can_fail_the_execution() {
    let h = harness();
    let def = waiting_definition(deadline(60, 0, 300, EscalationOutcome::FailExecution));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    let d0 = h
        .store
        .get_execution(exec.id)
        .await
        .unwrap()
        .deadline_at
        .unwrap();
    let stats = h.scheduler.sweep_at(d0).await.unwrap();
    assert_eq!(stats.due_waits, 1);

    let row = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(row.status, "failed");
    assert_eq!(row.error.as_deref(), Some("wait deadline exceeded"));
    assert!(!row.is_waiting);
    assert_eq!(h.gateway.sent_to("sup"), 1);

    let steps = h.store.list_step_executions(exec.id).await.unwrap();
    assert_eq!(steps.last().unwrap().status, "failed");
    assert!(h.store.resolve_session("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn due_wait_before_its_deadline_is_left_alone() {
    let h = harness();
    let def = waiting_definition(deadline(600, 2, 300, EscalationOutcome::KeepWaiting));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    // The first deadline is 300s out; handing the row over early is a no-op
    let row = h.store.get_execution(exec.id).await.unwrap();
    h.orchestrator.handle_due_wait(row, Utc::now()).await.unwrap();

    let row = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(row.retries_sent, 0);
    assert_eq!(row.status, "waiting");
    assert!(h.gateway.sent.lock().is_empty());
}

#[tokio::test]
async fn timer_signal_drives_the_due_wait() {
    let h = harness();
    // Zero retry interval: the first deadline is due the moment the wait
    // starts, so an externally delivered timer fires immediately
    let def = waiting_definition(deadline(600, 1, 0, EscalationOutcome::KeepWaiting));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    // A timer for the wrong step is rejected
    let err = h
        .orchestrator
        .advance(
            exec.id,
            Signal::TimerElapsed(TimerElapsed {
                execution_id: exec.id,
                step_index: 5,
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ExecutionNotWaiting(_)));

    let outcome = h
        .orchestrator
        .advance(
            exec.id,
            Signal::TimerElapsed(TimerElapsed {
                execution_id: exec.id,
                step_index: 1,
            }),
        )
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced);

    let row = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(row.retries_sent, 1);
    assert_eq!(row.status, "waiting");
    assert_eq!(h.gateway.sent_to("u1"), 1);
}

#[tokio::test]
async fn sweep_lease_prevents_double_claiming() {
    let h = harness();
    let def = waiting_definition(deadline(600, 2, 300, EscalationOutcome::KeepWaiting));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    let d0 = h
        .store
        .get_execution(exec.id)
        .await
        .unwrap()
        .deadline_at
        .unwrap();

    let lease = Duration::from_secs(60);
    let first = h.store.claim_due_waits(d0, lease, 50).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, exec.id);

    // The lease stamp keeps a concurrent sweep off the same row
    let second = h.store.claim_due_waits(d0, lease, 50).await.unwrap();
    assert!(second.is_empty());

    // After the lease expires the row becomes claimable again
    let later = d0 + chrono::Duration::seconds(61);
    let third = h.store.claim_due_waits(later, lease, 50).await.unwrap();
    assert_eq!(third.len(), 1);
}

#[tokio::test]
async fn losing_sweep_produces_no_duplicate_sends() {
    let h = harness();
    let def = waiting_definition(deadline(600, 2, 300, EscalationOutcome::KeepWaiting));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    let d0 = h
        .store
        .get_execution(exec.id)
        .await
        .unwrap()
        .deadline_at
        .unwrap();

    // A sweep claims the row...
    let claimed = h
        .store
        .claim_due_waits(d0, Duration::from_secs(60), 50)
        .await
        .unwrap();
    let stale = claimed.into_iter().next().unwrap();

    // ...but the user answers before it gets to act
    let outcome = h
        .orchestrator
        .signal_message(reply("u1", "made it"))
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced);

    // The sweep's CAS loses; no retry nudge goes out
    h.orchestrator.handle_due_wait(stale, d0).await.unwrap();
    assert_eq!(h.gateway.sent_to("u1"), 0);

    let row = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(row.status, "completed");
    assert_eq!(row.retries_sent, 0);
}

#[tokio::test]
async fn overdue_notification_fires_exactly_once() {
    let h = harness();
    let def = definition(
        vec![VariableDecl {
            name: "reply".to_string(),
            data_type: VarType::String,
        }],
        vec![
            step(
                0,
                StepKind::Start(StartConfig {
                    overdue: Some(OverdueConfig {
                        deadline: Duration::from_secs(3600),
                        recipients: vec!["ops".to_string()],
                        message: text("flow is overdue"),
                    }),
                }),
            ),
            wait_free_text(1, "reply", None),
            step(2, StepKind::End),
        ],
    );
    let def_id = insert_active(&h, &def).await;
    let exec = h
        .orchestrator
        .start(
            def_id,
            StartTrigger {
                user_id: Some("u1".to_string()),
                variables: HashMap::new(),
            },
        )
        .await
        .unwrap();

    let row = h.store.get_execution(exec.id).await.unwrap();
    let overdue_at = row.overdue_at.unwrap();
    let offset = overdue_at - row.started_at;
    assert!(offset <= chrono::Duration::seconds(3600));
    assert!(offset > chrono::Duration::seconds(3590));

    // Not yet due
    let stats = h
        .scheduler
        .sweep_at(overdue_at - chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(stats.overdue, 0);

    let stats = h.scheduler.sweep_at(overdue_at).await.unwrap();
    assert_eq!(stats.overdue, 1);
    assert_eq!(h.gateway.sent_to("ops"), 1);

    let row = h.store.get_execution(exec.id).await.unwrap();
    assert!(row.overdue_notified);
    assert_eq!(row.status, "waiting");

    // Flagged rows are never claimed again
    let stats = h
        .scheduler
        .sweep_at(overdue_at + chrono::Duration::seconds(3600))
        .await
        .unwrap();
    assert_eq!(stats.overdue, 0);
    assert_eq!(h.gateway.sent_to("ops"), 1);

    // The flow itself is unaffected
    let outcome = h
        .orchestrator
        .signal_message(reply("u1", "done"))
        .await
        .unwrap();
    assert_eq!(outcome, AdvanceOutcome::Advanced);
}

#[tokio::test]
async fn sweep_skips_rows_answered_between_claim_and_handling() {
    // A wait whose deadline stamp survives into a claim but whose state no
    // longer satisfies the waiting checks is silently dropped.
    let h = harness();
    let def = waiting_definition(deadline(600, 1, 300, EscalationOutcome::KeepWaiting));
    let def_id = insert_active(&h, &def).await;
    let exec = h.orchestrator.start(def_id, trigger("u1")).await.unwrap();

    let mut stale = h.store.get_execution(exec.id).await.unwrap();
    h.orchestrator
        .signal_message(reply("u1", "answered"))
        .await
        .unwrap();

    // Pretend the claim happened first
    stale.sweep_lease_until = Some(Utc::now() + chrono::Duration::seconds(60));
    h.orchestrator
        .handle_due_wait(stale, Utc::now() + chrono::Duration::seconds(3600))
        .await
        .unwrap();

    assert_eq!(h.gateway.sent_to("u1"), 0);
    let row = h.store.get_execution(exec.id).await.unwrap();
    assert_eq!(row.status, "completed");
}

#[tokio::test]
async fn waits_without_a_deadline_never_come_due() {
    let h = harness();
    let due_def = waiting_definition(deadline(600, 2, 300, EscalationOutcome::KeepWaiting));
    let due_id = insert_active(&h, &due_def).await;
    h.orchestrator.start(due_id, trigger("u1")).await.unwrap();

    // A second flow whose wait carries no deadline policy
    let open_def = definition(
        vec![VariableDecl {
            name: "reply".to_string(),
            data_type: VarType::String,
        }],
        vec![
            start_step(0),
            wait_free_text(1, "reply", None),
            step(2, StepKind::End),
        ],
    );
    let open_id = insert_active(&h, &open_def).await;
    let open = h
        .orchestrator
        .start(
            open_id,
            StartTrigger {
                user_id: Some("u2".to_string()),
                variables: HashMap::new(),
            },
        )
        .await
        .unwrap();
    assert!(h
        .store
        .get_execution(open.id)
        .await
        .unwrap()
        .deadline_at
        .is_none());

    // Even a far-future sweep only ever picks up the deadlined wait
    let far = Utc::now() + chrono::Duration::days(365);
    let stats = h.scheduler.sweep_at(far).await.unwrap();
    assert_eq!(stats.due_waits, 1);

    let untouched = h.store.get_execution(open.id).await.unwrap();
    assert_eq!(untouched.retries_sent, 0);
    assert_eq!(untouched.status, "waiting");
    assert_eq!(h.gateway.sent_to("u2"), 0);
}
