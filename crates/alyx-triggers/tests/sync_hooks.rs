// Sync-hook semantics for record mutations and identity events, against
// /bin/sh functions.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use alyx_bus::EventBus;
use alyx_core::config::{BusConfig, ExecutorConfig, RetentionConfig};
use alyx_core::types::EventType;
use alyx_executor::{Executor, FunctionDescriptor, FunctionIndex, Runtime};
use alyx_hooks::{HookMode, HookRegistry, NewHook, OnFailure};
use alyx_store::{EventMeta, EventStatus, ExecutionFilter, ExecutionStatus, Store};
use alyx_triggers::{
    IdentityEventKind, MutationOrigin, RecordAction, RecordMutation, SourceTriggers,
    TriggerError,
};
use serde_json::json;

struct Harness {
    triggers: SourceTriggers,
    store: Arc<Store>,
    registry: Arc<HookRegistry>,
    functions: Arc<FunctionIndex>,
    dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(HookRegistry::new(Arc::clone(&store)).unwrap());
        let executor = Arc::new(Executor::new(ExecutorConfig::default(), false));
        let functions = Arc::new(FunctionIndex::new());
        let bus = Arc::new(EventBus::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&executor),
            Arc::clone(&functions),
            BusConfig::default(),
            RetentionConfig::default(),
        ));
        let triggers = SourceTriggers::new(
            Arc::clone(&registry),
            executor,
            Arc::clone(&functions),
            Arc::clone(&store),
            bus,
        );
        Self {
            triggers,
            store,
            registry,
            functions,
            dir,
        }
    }

    fn add_function(&self, name: &str, body: &str) {
        let path = self.dir.path().join(format!("{name}.sh"));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        self.functions
            .upsert(FunctionDescriptor::new(name, Runtime::Binary, path));
    }

    fn add_sync_hook(
        &self,
        name: &str,
        event_type: EventType,
        source: &str,
        action: &str,
        priority: i64,
        on_failure: OnFailure,
    ) {
        let mut hook = NewHook::new(name, name, event_type);
        hook.event_source = source.into();
        hook.event_action = action.into();
        hook.mode = HookMode::Sync;
        hook.priority = priority;
        hook.config.on_failure = on_failure;
        self.registry.register(hook).unwrap();
    }

    fn mutation(&self) -> RecordMutation {
        RecordMutation {
            collection: "users".into(),
            action: RecordAction::Insert,
            document: json!({"id": "u1", "email": "a@b"}),
            previous: None,
            changed_fields: vec![],
        }
    }
}

const ALLOW: &str = r#"cat > /dev/null
echo '{"request_id":"r","success":true}'"#;

const DENY: &str = r#"cat > /dev/null
echo '{"request_id":"r","success":false,"error":{"code":"DENIED","message":"blocked"}}'"#;

#[tokio::test]
async fn mutation_without_hooks_prepares_and_publishes() {
    let h = Harness::new();
    let prepared = h
        .triggers
        .prepare_record_mutation(&h.mutation(), None)
        .await
        .unwrap();

    let event = h.triggers.publish_after_commit(prepared).unwrap();
    assert_eq!(event.event_type, EventType::Database);
    assert_eq!(event.source, "users");
    assert_eq!(event.action, "insert");
    assert_eq!(event.payload["document"]["id"], "u1");
    assert_eq!(event.payload["action"], "insert");
    assert!(event.payload["previous_document"].is_null());
    assert_eq!(event.status, EventStatus::Pending);
}

#[tokio::test]
async fn passing_sync_hook_lets_the_mutation_proceed() {
    let h = Harness::new();
    h.add_function("validate", ALLOW);
    h.add_sync_hook(
        "validate",
        EventType::Database,
        "users",
        "insert",
        0,
        OnFailure::Reject,
    );

    let prepared = h
        .triggers
        .prepare_record_mutation(&h.mutation(), None)
        .await
        .unwrap();

    // the sync run was logged against the pre-assigned event id
    let executions = h
        .store
        .list_executions(&ExecutionFilter {
            trigger_id: Some(prepared.event_id().to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, ExecutionStatus::Success);
    assert_eq!(executions[0].trigger_type, "database");

    // published event carries the same id, so logs correlate
    let event = h.triggers.publish_after_commit(prepared).unwrap();
    assert_eq!(executions[0].trigger_id, event.id);
}

#[tokio::test]
async fn rejecting_sync_hook_aborts_with_its_own_error() {
    let h = Harness::new();
    h.add_function("deny", DENY);
    h.add_sync_hook(
        "deny",
        EventType::Database,
        "users",
        "insert",
        0,
        OnFailure::Reject,
    );

    let err = h
        .triggers
        .prepare_record_mutation(&h.mutation(), None)
        .await
        .unwrap_err();

    match err {
        TriggerError::Rejected { code, message } => {
            assert_eq!(code, "DENIED");
            assert_eq!(message, "blocked");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    // nothing was published; the event only exists after commit
    assert!(h
        .store
        .events_with_status(EventStatus::Pending)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn continue_policy_logs_and_proceeds() {
    let h = Harness::new();
    h.add_function("flaky", DENY);
    h.add_sync_hook(
        "flaky",
        EventType::Database,
        "users",
        "insert",
        0,
        OnFailure::Continue,
    );

    let prepared = h
        .triggers
        .prepare_record_mutation(&h.mutation(), None)
        .await
        .expect("continue policy must not abort");

    let executions = h
        .store
        .list_executions(&ExecutionFilter {
            trigger_id: Some(prepared.event_id().to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(executions[0].status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn sync_hooks_run_in_priority_order() {
    let h = Harness::new();
    let marker = h.dir.path().join("order.log");
    for (name, priority) in [("first", 10), ("second", 5), ("third", 1)] {
        h.add_function(
            name,
            &format!(
                r#"cat > /dev/null
echo '{name}' >> {}
echo '{{"request_id":"r","success":true}}'"#,
                marker.display()
            ),
        );
        h.add_sync_hook(
            name,
            EventType::Database,
            "users",
            "insert",
            priority,
            OnFailure::Reject,
        );
    }

    h.triggers
        .prepare_record_mutation(&h.mutation(), None)
        .await
        .unwrap();

    let order = std::fs::read_to_string(&marker).unwrap();
    assert_eq!(order.lines().collect::<Vec<_>>(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn originating_function_is_skipped() {
    let h = Harness::new();
    h.add_function("writer", DENY); // would reject if it ran
    h.add_sync_hook(
        "writer",
        EventType::Database,
        "events_log",
        "insert",
        0,
        OnFailure::Reject,
    );

    let origin = MutationOrigin {
        meta: EventMeta::new("req-1"),
        function_id: "writer".into(),
    };
    let mutation = RecordMutation {
        collection: "events_log".into(),
        action: RecordAction::Insert,
        document: json!({"entry": 1}),
        previous: None,
        changed_fields: vec![],
    };

    // `writer` caused this mutation, so its own sync hook must not run
    let prepared = h
        .triggers
        .prepare_record_mutation(&mutation, Some(&origin))
        .await
        .expect("own hook skipped");

    // and the chain metadata grew for the published event
    let event = h.triggers.publish_after_commit(prepared).unwrap();
    assert_eq!(event.metadata.depth, 1);
    assert!(event.metadata.chain_contains("writer"));
    assert_eq!(event.metadata.request_id, "req-1");
}

#[tokio::test]
async fn signup_rejection_blocks_registration() {
    let h = Harness::new();
    h.add_function("screen", DENY);
    h.add_sync_hook("screen", EventType::Auth, "*", "signup", 0, OnFailure::Reject);

    let err = h
        .triggers
        .prepare_identity_event(IdentityEventKind::Signup, json!({"email": "a@b"}))
        .await
        .unwrap_err();

    match err {
        TriggerError::Rejected { code, message } => {
            assert_eq!(code, "DENIED");
            assert_eq!(message, "blocked");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn login_ignores_sync_hooks() {
    let h = Harness::new();
    h.add_function("screen", DENY);
    // a sync hook on login would reject; but login is async-only
    h.add_sync_hook("screen", EventType::Auth, "*", "login", 0, OnFailure::Reject);

    let prepared = h
        .triggers
        .prepare_identity_event(IdentityEventKind::Login, json!({"user": "u1"}))
        .await
        .expect("login never blocks");
    let event = h.triggers.publish_after_commit(prepared).unwrap();
    assert_eq!(event.action, "login");
    assert_eq!(event.event_type, EventType::Auth);
}
