use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Supported function runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Runtime {
    Node,
    Deno,
    Bun,
    Python,
    Go,
    /// Executes the path directly with no interpreter; the file must be
    /// executable and honor the JSON protocol.
    Binary,
}

impl Runtime {
    /// Extension-based detection for manifests that omit the runtime.
    /// `.js` resolves to bun when a bun lockfile sits next to the source.
    pub fn detect(source: &Path) -> Option<Runtime> {
        let ext = source.extension()?.to_str()?;
        match ext {
            "ts" => Some(Runtime::Deno),
            "js" | "mjs" | "cjs" => {
                let has_bun_lock = source
                    .parent()
                    .map(|dir| dir.join("bun.lockb").exists() || dir.join("bun.lock").exists())
                    .unwrap_or(false);
                Some(if has_bun_lock { Runtime::Bun } else { Runtime::Node })
            }
            "py" => Some(Runtime::Python),
            "go" => Some(Runtime::Go),
            _ => None,
        }
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Runtime::Node => "node",
            Runtime::Deno => "deno",
            Runtime::Bun => "bun",
            Runtime::Python => "python",
            Runtime::Go => "go",
            Runtime::Binary => "binary",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Runtime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "node" => Ok(Runtime::Node),
            "deno" => Ok(Runtime::Deno),
            "bun" => Ok(Runtime::Bun),
            "python" => Ok(Runtime::Python),
            "go" => Ok(Runtime::Go),
            "binary" => Ok(Runtime::Binary),
            other => Err(format!("unknown runtime: {other}")),
        }
    }
}

/// Everything the executor needs to run one function. Derived from the
/// manifest; owned by the loader and shared read-only.
#[derive(Debug, Clone)]
pub struct FunctionDescriptor {
    pub name: String,
    pub runtime: Runtime,
    pub source_path: PathBuf,
    /// Built artifact, preferred in production mode.
    pub output_path: Option<PathBuf>,
    pub has_build: bool,
    pub timeout: Duration,
    pub memory_hint_mb: Option<u64>,
    /// Extra environment handed to the child.
    pub env: HashMap<String, String>,
    /// Dotted paths redacted from stored execution inputs.
    pub redact: Vec<String>,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, runtime: Runtime, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            runtime,
            source_path: source_path.into(),
            output_path: None,
            has_build: false,
            timeout: Duration::from_secs(30),
            memory_hint_mb: None,
            env: HashMap::new(),
            redact: Vec::new(),
        }
    }
}

/// Live set of loaded descriptors, keyed by function name.
///
/// Written only by the manifest loader; read by the bus, scheduler and
/// gateway. Cheap clones via `Arc` per descriptor.
#[derive(Default)]
pub struct FunctionIndex {
    inner: RwLock<HashMap<String, Arc<FunctionDescriptor>>>,
}

impl FunctionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<FunctionDescriptor>> {
        self.inner.read().expect("function index poisoned").get(name).cloned()
    }

    pub fn upsert(&self, descriptor: FunctionDescriptor) {
        self.inner
            .write()
            .expect("function index poisoned")
            .insert(descriptor.name.clone(), Arc::new(descriptor));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.inner
            .write()
            .expect("function index poisoned")
            .remove(name)
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .expect("function index poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<Arc<FunctionDescriptor>> {
        self.inner
            .read()
            .expect("function index poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("function index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_detection_by_extension() {
        assert_eq!(Runtime::detect(Path::new("/f/main.ts")), Some(Runtime::Deno));
        assert_eq!(Runtime::detect(Path::new("/f/main.py")), Some(Runtime::Python));
        assert_eq!(Runtime::detect(Path::new("/f/main.go")), Some(Runtime::Go));
        assert_eq!(Runtime::detect(Path::new("/f/main.rs")), None);
        assert_eq!(Runtime::detect(Path::new("/f/Makefile")), None);
    }

    #[test]
    fn js_prefers_bun_when_lockfile_present() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("main.js");
        std::fs::write(&source, "").unwrap();
        assert_eq!(Runtime::detect(&source), Some(Runtime::Node));

        std::fs::write(dir.path().join("bun.lockb"), "").unwrap();
        assert_eq!(Runtime::detect(&source), Some(Runtime::Bun));
    }

    #[test]
    fn index_upsert_and_remove() {
        let index = FunctionIndex::new();
        index.upsert(FunctionDescriptor::new("notify", Runtime::Python, "/f/notify/main.py"));
        index.upsert(FunctionDescriptor::new("audit", Runtime::Node, "/f/audit/main.js"));

        assert_eq!(index.names(), vec!["audit", "notify"]);
        assert!(index.get("notify").is_some());

        // upsert replaces in place
        let mut updated = FunctionDescriptor::new("notify", Runtime::Deno, "/f/notify/main.ts");
        updated.timeout = Duration::from_secs(5);
        index.upsert(updated);
        let desc = index.get("notify").unwrap();
        assert_eq!(desc.runtime, Runtime::Deno);
        assert_eq!(desc.timeout, Duration::from_secs(5));

        assert!(index.remove("audit"));
        assert!(!index.remove("audit"));
        assert_eq!(index.len(), 1);
    }
}
