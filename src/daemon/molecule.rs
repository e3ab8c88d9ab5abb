//! Molecule observability for patrols.
//!
//! A molecule is a declarative workflow record in the store: a root wisp plus
//! one child wisp per named step. Patrols pour one at the start of a cycle,
//! close or fail steps as they go, and close the root at the end, giving the
//! operator a live view of patrol progress.
//!
//! Graceful degradation is the design rule here: if the pour fails, every
//! operation on the handle is a no-op. Callers never branch on absence; the
//! check lives inside the handle, and a broken observability path can never
//! break a patrol.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

/// Timeout for store subprocess calls made for molecule tracking.
const MOL_TIMEOUT: Duration = Duration::from_secs(15);

/// Step slugs recognised in child wisp titles.
const STEP_SLUGS: [&str; 9] = [
    "scan", "reap", "purge", "report", "sync", "offsite", "backup", "clean", "verify",
];

/// Pours molecules against the store CLI.
#[derive(Debug, Clone)]
pub struct MoleculeClient {
    bd_path: PathBuf,
    town_root: PathBuf,
}

impl MoleculeClient {
    pub fn new(town_root: impl Into<PathBuf>) -> Self {
        MoleculeClient {
            bd_path: PathBuf::from("bd"),
            town_root: town_root.into(),
        }
    }

    pub fn with_bd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bd_path = path.into();
        self
    }

    /// Creates an ephemeral wisp molecule from a formula. Never fails: a pour
    /// failure yields an inert handle and a log line.
    pub async fn pour(&self, formula: &str, vars: &[(&str, String)]) -> Molecule {
        let mut args: Vec<String> = vec!["mol".into(), "wisp".into(), formula.into()];
        for (key, value) in vars {
            args.push("--var".into());
            args.push(format!("{key}={value}"));
        }

        let out = match self.run(&args).await {
            Ok(out) => out,
            Err(e) => {
                warn!(formula, error = %e, "molecule pour failed (non-fatal)");
                return Molecule::inert();
            }
        };

        let Some(root) = parse_wisp_id(&out) else {
            warn!(formula, output = %out, "could not parse molecule root ID");
            return Molecule::inert();
        };

        let steps = self.discover_steps(&root).await;
        debug!(formula, root = %root, steps = steps.len(), "molecule poured");

        Molecule {
            inner: Some(MoleculeInner {
                root,
                steps,
                client: self.clone(),
            }),
        }
    }

    /// Lists children of the root wisp and maps recognised step slugs to IDs.
    async fn discover_steps(&self, root: &str) -> HashMap<&'static str, String> {
        let args: Vec<String> = vec![
            "show".into(),
            root.into(),
            "--children".into(),
            "--format=jsonl".into(),
        ];
        let out = match self.run(&args).await {
            Ok(out) => out,
            Err(e) => {
                warn!(root, error = %e, "molecule step discovery failed");
                return HashMap::new();
            }
        };

        let mut steps = HashMap::new();
        for line in out.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
                continue;
            };
            let (Some(id), Some(title)) = (
                value.get("id").and_then(|v| v.as_str()),
                value.get("title").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let title = title.to_ascii_lowercase();
            for slug in STEP_SLUGS {
                if title.contains(slug) {
                    steps.entry(slug).or_insert_with(|| id.to_string());
                    break;
                }
            }
        }
        steps
    }

    async fn run(&self, args: &[String]) -> Result<String, String> {
        let mut cmd = Command::new(&self.bd_path);
        cmd.args(args)
            .current_dir(&self.town_root)
            .kill_on_drop(true);
        let output = tokio::time::timeout(MOL_TIMEOUT, cmd.output())
            .await
            .map_err(|_| format!("timed out after {MOL_TIMEOUT:?}"))?
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

struct MoleculeInner {
    root: String,
    steps: HashMap<&'static str, String>,
    client: MoleculeClient,
}

/// Handle to one poured molecule. All operations are no-ops on an inert
/// handle (failed pour), so patrol code calls them unconditionally.
pub struct Molecule {
    inner: Option<MoleculeInner>,
}

impl Molecule {
    /// A handle that does nothing. Used when the pour failed or observability
    /// is disabled.
    pub fn inert() -> Self {
        Molecule { inner: None }
    }

    /// True when the pour succeeded.
    pub fn is_live(&self) -> bool {
        self.inner.is_some()
    }

    /// Marks a step closed.
    pub async fn close_step(&self, slug: &str) {
        let Some(inner) = &self.inner else { return };
        let Some(step_id) = inner.steps.get(slug) else {
            debug!(slug, root = %inner.root, "unknown molecule step");
            return;
        };
        if let Err(e) = inner.client.run(&["close".into(), step_id.clone()]).await {
            warn!(slug, error = %e, "closing molecule step failed (non-fatal)");
        }
    }

    /// Marks a step failed with a reason.
    pub async fn fail_step(&self, slug: &str, reason: &str) {
        let Some(inner) = &self.inner else { return };
        let Some(step_id) = inner.steps.get(slug) else {
            debug!(slug, root = %inner.root, "unknown molecule step");
            return;
        };
        let args: Vec<String> = vec![
            "close".into(),
            step_id.clone(),
            "--reason".into(),
            reason.into(),
        ];
        if let Err(e) = inner.client.run(&args).await {
            warn!(slug, error = %e, "failing molecule step failed (non-fatal)");
        }
    }

    /// Closes the root wisp; call at cycle end.
    pub async fn close(&self) {
        let Some(inner) = &self.inner else { return };
        if let Err(e) = inner.client.run(&["close".into(), inner.root.clone()]).await {
            warn!(root = %inner.root, error = %e, "closing molecule root failed (non-fatal)");
        }
    }
}

/// Extracts a wisp ID from `bd mol wisp` output: the first token containing
/// `-wisp-`, with ANSI styling and trailing punctuation stripped.
fn parse_wisp_id(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|word| strip_ansi(word).trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string())
        .find(|cleaned| cleaned.contains("-wisp-"))
}

/// Removes ANSI escape sequences.
fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if c.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}
