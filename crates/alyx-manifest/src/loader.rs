use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use alyx_bus::EventBus;
use alyx_core::types::EventType;
use alyx_executor::{FunctionDescriptor, FunctionIndex, Runtime};
use alyx_hooks::{HookMode, HookRegistry, NewHook, OnFailure};
use alyx_scheduler::cadence;
use alyx_store::{
    EventDraft, NewSchedule, NewWebhook, ScheduleConfig, ScheduleKind, SignatureAlgorithm,
    Store, Verification, MANAGED_BY_MANIFEST,
};
use chrono::Utc;
use figment::providers::{Format, Toml};
use figment::Figment;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{ManifestError, Result};
use crate::types::{Manifest, ManifestHook, ManifestRoute, ManifestSchedule};

const MANIFEST_FILE: &str = "alyx.toml";

/// Webhook paths that would shadow the management surface are rejected.
const RESERVED_PATH_PREFIXES: &[&str] = &["api", "health", "webhooks"];

/// What one reload pass did.
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub loaded: Vec<String>,
    pub removed: Vec<String>,
    /// `(function, reason)` for manifests that failed validation; the rest
    /// of the set still applies.
    pub errors: Vec<(String, String)>,
}

/// Scans the functions root and applies declarations to the registry,
/// schedule table and webhook table. Loader-owned rows carry the manifest
/// owner tag; API-created rows are never touched.
pub struct ManifestLoader {
    functions_dir: PathBuf,
    store: Arc<Store>,
    registry: Arc<HookRegistry>,
    functions: Arc<FunctionIndex>,
    bus: Arc<EventBus>,
}

struct LoadedFunction {
    descriptor: FunctionDescriptor,
    hooks: Vec<NewHook>,
    schedules: Vec<NewSchedule>,
    routes: Vec<NewWebhook>,
}

impl ManifestLoader {
    pub fn new(
        functions_dir: impl Into<PathBuf>,
        store: Arc<Store>,
        registry: Arc<HookRegistry>,
        functions: Arc<FunctionIndex>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            functions_dir: functions_dir.into(),
            store,
            registry,
            functions,
            bus,
        }
    }

    pub fn functions_dir(&self) -> &Path {
        &self.functions_dir
    }

    /// Discover, validate, diff and apply the whole functions root.
    pub fn load_all(&self) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut discovered: Vec<LoadedFunction> = Vec::new();
        let mut seen_paths: HashSet<String> = HashSet::new();

        let entries = std::fs::read_dir(&self.functions_dir).map_err(|_| {
            ManifestError::RootUnreadable(self.functions_dir.display().to_string())
        })?;
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir() && p.join(MANIFEST_FILE).is_file())
            .collect();
        dirs.sort();

        for dir in dirs {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.load_one(&dir, &name, &mut seen_paths) {
                Ok(loaded) => discovered.push(loaded),
                Err(e) => {
                    error!(function = %name, "manifest rejected: {e}");
                    summary.errors.push((name, e.to_string()));
                }
            }
        }

        // Unregister functions whose directory (or manifest) disappeared.
        let discovered_names: HashSet<&str> = discovered
            .iter()
            .map(|l| l.descriptor.name.as_str())
            .collect();
        for name in self.functions.names() {
            if !discovered_names.contains(name.as_str()) {
                info!(function = %name, "function removed, unregistering");
                self.functions.remove(&name);
                self.store.delete_manifest_hooks(&name)?;
                self.store.delete_manifest_schedules(&name)?;
                self.store.delete_manifest_webhooks(&name)?;
                summary.removed.push(name);
            }
        }

        for loaded in discovered {
            let name = loaded.descriptor.name.clone();
            if let Err(e) = self.apply(loaded) {
                error!(function = %name, "failed to apply manifest: {e}");
                summary.errors.push((name, e.to_string()));
            } else {
                summary.loaded.push(name);
            }
        }
        self.registry.invalidate()?;

        self.bus.publish(EventDraft::new(
            EventType::Custom,
            "manifest",
            "reloaded",
            json!({
                "loaded": summary.loaded,
                "removed": summary.removed,
                "errors": summary.errors.len(),
            }),
        ))?;
        info!(
            loaded = summary.loaded.len(),
            removed = summary.removed.len(),
            errors = summary.errors.len(),
            "manifest reload applied"
        );
        Ok(summary)
    }

    fn apply(&self, loaded: LoadedFunction) -> Result<()> {
        let name = loaded.descriptor.name.clone();
        self.functions.upsert(loaded.descriptor);
        self.registry.replace_manifest_hooks(&name, loaded.hooks)?;

        self.store.delete_manifest_schedules(&name)?;
        for schedule in loaded.schedules {
            self.store.insert_schedule(schedule)?;
        }

        self.store.delete_manifest_webhooks(&name)?;
        for route in loaded.routes {
            self.store.insert_webhook(route)?;
        }
        debug!(function = %name, "manifest applied");
        Ok(())
    }

    fn load_one(
        &self,
        dir: &Path,
        name: &str,
        seen_paths: &mut HashSet<String>,
    ) -> Result<LoadedFunction> {
        let invalid = |reason: String| ManifestError::Validation {
            function: name.to_string(),
            reason,
        };

        let manifest: Manifest = Figment::new()
            .merge(Toml::file(dir.join(MANIFEST_FILE)))
            .extract()
            .map_err(|e| invalid(e.to_string()))?;

        if manifest.entry.trim().is_empty() {
            return Err(invalid("entry path must not be empty".into()));
        }
        let source_path = dir.join(&manifest.entry);
        if !source_path.is_file() {
            warn!(function = %name, entry = %manifest.entry, "entry file does not exist yet");
        }

        let runtime = match manifest.runtime.as_deref() {
            Some(declared) => declared
                .parse::<Runtime>()
                .map_err(|e| invalid(e))?,
            None => Runtime::detect(&source_path)
                .ok_or_else(|| invalid(format!(
                    "cannot detect runtime from entry '{}'; declare one",
                    manifest.entry
                )))?,
        };

        let mut descriptor = FunctionDescriptor::new(name, runtime, source_path);
        descriptor.output_path = manifest.output.as_ref().map(|o| dir.join(o));
        descriptor.has_build = manifest.output.is_some();
        if let Some(secs) = manifest.timeout_secs {
            descriptor.timeout = Duration::from_secs(secs);
        }
        descriptor.memory_hint_mb = manifest.memory_mb;
        descriptor.env = manifest.env.clone();
        descriptor.redact = manifest.redact.clone();

        let hooks = manifest
            .hooks
            .iter()
            .map(|h| self.convert_hook(name, h))
            .collect::<Result<Vec<_>>>()?;
        let schedules = manifest
            .schedules
            .iter()
            .map(|s| self.convert_schedule(name, s))
            .collect::<Result<Vec<_>>>()?;
        let routes = manifest
            .routes
            .iter()
            .map(|r| self.convert_route(name, r, seen_paths))
            .collect::<Result<Vec<_>>>()?;

        Ok(LoadedFunction {
            descriptor,
            hooks,
            schedules,
            routes,
        })
    }

    fn convert_hook(&self, function: &str, hook: &ManifestHook) -> Result<NewHook> {
        let invalid = |reason: String| ManifestError::Validation {
            function: function.to_string(),
            reason,
        };

        if hook.name.trim().is_empty() {
            return Err(invalid("hook name must not be empty".into()));
        }
        let event_type: EventType = hook.event_type.parse().map_err(|e: String| invalid(e))?;
        let mode: HookMode = hook.mode.parse().map_err(|e: String| invalid(e))?;
        let on_failure = match hook.on_failure.as_deref() {
            None => OnFailure::Reject,
            Some("reject") => OnFailure::Reject,
            Some("continue") => OnFailure::Continue,
            Some(other) => {
                return Err(invalid(format!("unknown on_failure '{other}'")));
            }
        };

        let mut new = NewHook::new(hook.name.clone(), function, event_type);
        new.event_source = hook.source.clone();
        new.event_action = hook.action.clone();
        new.mode = mode;
        new.priority = hook.priority;
        new.config.timeout_secs = hook.timeout_secs;
        new.config.on_failure = on_failure;
        new.config.input = hook.input.clone();
        new.managed_by = MANAGED_BY_MANIFEST.to_string();
        Ok(new)
    }

    fn convert_schedule(
        &self,
        function: &str,
        schedule: &ManifestSchedule,
    ) -> Result<NewSchedule> {
        let invalid = |reason: String| ManifestError::Validation {
            function: function.to_string(),
            reason,
        };

        if schedule.name.trim().is_empty() {
            return Err(invalid("schedule name must not be empty".into()));
        }
        if schedule.expression.trim().is_empty() {
            return Err(invalid(format!(
                "schedule '{}' has no expression",
                schedule.name
            )));
        }
        let kind: ScheduleKind = schedule.kind.parse().map_err(|e: String| invalid(e))?;
        cadence::validate(kind, &schedule.expression, &schedule.timezone)
            .map_err(|e| invalid(e.to_string()))?;
        let next_run = cadence::next_fire(kind, &schedule.expression, &schedule.timezone, Utc::now())
            .map_err(|e| invalid(e.to_string()))?;

        let mut new = NewSchedule::new(
            schedule.name.clone(),
            function,
            kind,
            schedule.expression.clone(),
        );
        new.timezone = schedule.timezone.clone();
        new.next_run = next_run;
        let defaults = ScheduleConfig::default();
        new.config = ScheduleConfig {
            skip_if_running: schedule.skip_if_running.unwrap_or(defaults.skip_if_running),
            max_overlap: schedule.max_overlap.unwrap_or(defaults.max_overlap),
            retry_on_failure: schedule
                .retry_on_failure
                .unwrap_or(defaults.retry_on_failure),
            max_retries: schedule.max_retries.unwrap_or(defaults.max_retries),
            input: schedule.input.clone(),
        };
        new.managed_by = MANAGED_BY_MANIFEST.to_string();
        Ok(new)
    }

    fn convert_route(
        &self,
        function: &str,
        route: &ManifestRoute,
        seen_paths: &mut HashSet<String>,
    ) -> Result<NewWebhook> {
        let invalid = |reason: String| ManifestError::Validation {
            function: function.to_string(),
            reason,
        };

        let path = route.path.trim().trim_matches('/').to_string();
        if path.is_empty() {
            return Err(invalid("webhook path must not be empty".into()));
        }
        let head = path.split('/').next().unwrap_or_default();
        if RESERVED_PATH_PREFIXES.contains(&head) {
            return Err(invalid(format!(
                "webhook path '{path}' collides with a reserved route"
            )));
        }
        if !seen_paths.insert(path.clone()) {
            return Err(invalid(format!("duplicate webhook path '{path}'")));
        }
        if route.methods.is_empty() {
            return Err(invalid(format!("webhook '{path}' allows no methods")));
        }

        let verification = route
            .verification
            .as_ref()
            .map(|v| -> Result<Verification> {
                let algorithm = match v.algorithm.as_str() {
                    "hmac-sha1" => SignatureAlgorithm::HmacSha1,
                    "hmac-sha256" => SignatureAlgorithm::HmacSha256,
                    other => {
                        return Err(invalid(format!("unknown signature algorithm '{other}'")));
                    }
                };
                if v.header.trim().is_empty() {
                    return Err(invalid("verification header must not be empty".into()));
                }
                Ok(Verification {
                    algorithm,
                    header: v.header.clone(),
                    secret: v.secret.clone(),
                    skip_invalid: v.skip_invalid,
                })
            })
            .transpose()?;

        let mut new = NewWebhook::new(path);
        new.function_id = Some(function.to_string());
        new.methods = route.methods.iter().map(|m| m.to_uppercase()).collect();
        new.verification = verification;
        new.managed_by = MANAGED_BY_MANIFEST.to_string();
        Ok(new)
    }
}
