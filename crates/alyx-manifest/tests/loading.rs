// Manifest discovery, validation and diff-and-apply behavior.

use std::sync::Arc;

use alyx_bus::EventBus;
use alyx_core::config::{BusConfig, ExecutorConfig, RetentionConfig};
use alyx_core::types::EventType;
use alyx_executor::{Executor, FunctionIndex, Runtime};
use alyx_hooks::{HookMode, HookRegistry};
use alyx_manifest::ManifestLoader;
use alyx_store::{EventStatus, Store};

struct Harness {
    loader: ManifestLoader,
    store: Arc<Store>,
    registry: Arc<HookRegistry>,
    functions: Arc<FunctionIndex>,
    root: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(HookRegistry::new(Arc::clone(&store)).unwrap());
        let executor = Arc::new(Executor::new(ExecutorConfig::default(), false));
        let functions = Arc::new(FunctionIndex::new());
        let bus = Arc::new(EventBus::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            executor,
            Arc::clone(&functions),
            BusConfig::default(),
            RetentionConfig::default(),
        ));
        let loader = ManifestLoader::new(
            root.path(),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&functions),
            bus,
        );
        Self {
            loader,
            store,
            registry,
            functions,
            root,
        }
    }

    fn write_function(&self, name: &str, manifest: &str, entry: &str) {
        let dir = self.root.path().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("alyx.toml"), manifest).unwrap();
        std::fs::write(dir.join(entry), "").unwrap();
    }

    fn remove_function(&self, name: &str) {
        std::fs::remove_dir_all(self.root.path().join(name)).unwrap();
    }
}

const NOTIFY_MANIFEST: &str = r#"
entry = "main.py"
timeout_secs = 10
redact = ["document.password"]

[env]
SMTP_HOST = "localhost"

[[hooks]]
name = "on-user-insert"
event_type = "database"
source = "users"
action = "insert"
mode = "async"
priority = 5

[[schedules]]
name = "notify-digest"
kind = "cron"
expression = "0 2 * * *"
timezone = "America/New_York"

[[routes]]
path = "notify/incoming"
methods = ["POST", "PUT"]

[routes.verification]
algorithm = "hmac-sha256"
header = "X-Signature"
secret = "shh"
"#;

#[test]
fn full_manifest_loads_everything() {
    let h = Harness::new();
    h.write_function("notify", NOTIFY_MANIFEST, "main.py");

    let summary = h.loader.load_all().unwrap();
    assert_eq!(summary.loaded, vec!["notify"]);
    assert!(summary.errors.is_empty());

    // descriptor
    let desc = h.functions.get("notify").expect("descriptor loaded");
    assert_eq!(desc.runtime, Runtime::Python);
    assert_eq!(desc.timeout.as_secs(), 10);
    assert_eq!(desc.env.get("SMTP_HOST").map(String::as_str), Some("localhost"));
    assert_eq!(desc.redact, vec!["document.password".to_string()]);
    assert!(!desc.has_build);

    // hook visible through the registry cache
    let matches = h.registry.find_matches(EventType::Database, "users", "insert");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].function_id, "notify");
    assert_eq!(matches[0].mode, HookMode::Async);
    assert_eq!(matches[0].priority, 5);

    // schedule row with a computed next_run
    let schedules = h.store.schedules_by_function("notify").unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].name, "notify-digest");
    assert_eq!(schedules[0].timezone, "America/New_York");
    assert!(schedules[0].next_run.is_some());

    // webhook route
    let webhook = h
        .store
        .webhook_by_path("notify/incoming")
        .unwrap()
        .expect("route registered");
    assert_eq!(webhook.function_id.as_deref(), Some("notify"));
    assert!(webhook.allows_method("PUT"));
    assert!(webhook.verification.is_some());

    // reload announcement
    let pending = h.store.events_with_status(EventStatus::Pending).unwrap();
    assert!(pending
        .iter()
        .any(|e| e.event_type == EventType::Custom && e.source == "manifest"));
}

#[test]
fn runtime_is_detected_from_entry_extension() {
    let h = Harness::new();
    h.write_function("tsfn", "entry = \"main.ts\"\n", "main.ts");
    h.loader.load_all().unwrap();
    assert_eq!(h.functions.get("tsfn").unwrap().runtime, Runtime::Deno);
}

#[test]
fn invalid_manifests_do_not_block_valid_ones() {
    let h = Harness::new();
    h.write_function("good", "entry = \"main.py\"\n", "main.py");
    h.write_function("bad-runtime", "runtime = \"cobol\"\nentry = \"main.cob\"\n", "main.cob");
    h.write_function(
        "bad-schedule",
        r#"
entry = "main.py"
[[schedules]]
name = "broken"
kind = "cron"
expression = "not a cron"
"#,
        "main.py",
    );

    let summary = h.loader.load_all().unwrap();
    assert_eq!(summary.loaded, vec!["good"]);
    assert_eq!(summary.errors.len(), 2);
    assert!(h.functions.get("bad-runtime").is_none());
    assert!(h.functions.get("bad-schedule").is_none());
}

#[test]
fn reserved_and_duplicate_paths_rejected() {
    let h = Harness::new();
    h.write_function(
        "sneaky",
        r#"
entry = "main.py"
[[routes]]
path = "api/hooks"
"#,
        "main.py",
    );
    let summary = h.loader.load_all().unwrap();
    assert_eq!(summary.errors.len(), 1);
    assert!(summary.errors[0].1.contains("reserved"));

    let h = Harness::new();
    h.write_function(
        "dupe",
        r#"
entry = "main.py"
[[routes]]
path = "same/path"
[[routes]]
path = "same/path"
"#,
        "main.py",
    );
    let summary = h.loader.load_all().unwrap();
    assert!(summary.errors[0].1.contains("duplicate"));
}

#[test]
fn removed_function_is_fully_unregistered() {
    let h = Harness::new();
    h.write_function("notify", NOTIFY_MANIFEST, "main.py");
    h.loader.load_all().unwrap();
    assert!(h.functions.get("notify").is_some());

    h.remove_function("notify");
    let summary = h.loader.load_all().unwrap();
    assert_eq!(summary.removed, vec!["notify"]);

    assert!(h.functions.get("notify").is_none());
    assert!(h
        .registry
        .find_matches(EventType::Database, "users", "insert")
        .is_empty());
    assert!(h.store.schedules_by_function("notify").unwrap().is_empty());
    assert!(h.store.webhook_by_path("notify/incoming").unwrap().is_none());
}

#[test]
fn reload_replaces_declarations_in_place() {
    let h = Harness::new();
    h.write_function("notify", NOTIFY_MANIFEST, "main.py");
    h.loader.load_all().unwrap();

    // drop the hook, change the schedule cadence
    h.write_function(
        "notify",
        r#"
entry = "main.py"
[[schedules]]
name = "notify-digest"
kind = "interval"
expression = "5m"
"#,
        "main.py",
    );
    h.loader.load_all().unwrap();

    assert!(h
        .registry
        .find_matches(EventType::Database, "users", "insert")
        .is_empty());
    let schedules = h.store.schedules_by_function("notify").unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].expression, "5m");
    // the stale route disappeared too
    assert!(h.store.webhook_by_path("notify/incoming").unwrap().is_none());
}

#[test]
fn missing_root_is_an_error() {
    let h = Harness::new();
    let missing = h.root.path().join("nope");
    let loader = ManifestLoader::new(
        missing.as_path(),
        Arc::clone(&h.store),
        Arc::clone(&h.registry),
        Arc::clone(&h.functions),
        // reuse a fresh bus over the same store
        Arc::new(EventBus::new(
            Arc::clone(&h.store),
            Arc::clone(&h.registry),
            Arc::new(Executor::new(ExecutorConfig::default(), false)),
            Arc::clone(&h.functions),
            BusConfig::default(),
            RetentionConfig::default(),
        )),
    );
    assert!(loader.load_all().is_err());
}
