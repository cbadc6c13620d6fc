//! Running scenario files one after another.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use benchmonik_core::{Driver, Registry, RunSummary};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::report::ConsoleReport;

const EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Collects the scenario files to run.
///
/// Explicit files come first, in the order given, followed by every scenario file of `dir` in
/// sorted order.
pub fn scenario_files(files: &[PathBuf], dir: Option<&Path>) -> Result<Vec<PathBuf>> {
    if files.is_empty() && dir.is_none() {
        bail!("no scenario files given, pass `-c <file>` or `-d <dir>`");
    }

    let mut collected = files.to_vec();
    if let Some(dir) = dir {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read scenario directory `{}`", dir.display()))?;

        let mut found = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_scenario_file(&path) {
                found.push(path);
            }
        }
        found.sort();

        if found.is_empty() {
            tracing::warn!(dir = %dir.display(), "no scenario files found");
        }
        collected.extend(found);
    }
    Ok(collected)
}

fn is_scenario_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.contains(&e))
}

/// Runs scenario files against the backends of a registry.
#[derive(Debug)]
pub struct Runner {
    registry: Registry,
    backend_root: Option<PathBuf>,
    profile_memory: bool,
    progress: bool,
}

impl Runner {
    /// Creates a runner without progress output, memory profiling or backend root.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            backend_root: None,
            profile_memory: false,
            progress: false,
        }
    }

    /// Sets the directory for backends that store data locally.
    pub fn backend_root(mut self, root: Option<PathBuf>) -> Self {
        self.backend_root = root;
        self
    }

    /// Enables sampling of resident memory around every measured phase.
    pub fn profile_memory(mut self, enabled: bool) -> Self {
        self.profile_memory = enabled;
        self
    }

    /// Enables the progress spinner of the console report.
    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Loads and runs a single scenario file.
    pub async fn run_file(&self, path: &Path, cancel: &CancellationToken) -> Result<RunSummary> {
        let config = Config::load(path)?;
        let plan = config.plan(&self.registry)?;
        let mut settings = config.driver_settings();
        settings.backend_root = self.backend_root.clone();
        settings.profile_memory = self.profile_memory;

        let driver = Driver::new(self.registry.clone(), settings);
        let mut report = ConsoleReport::new(self.progress);
        let summary = driver
            .run(&plan, &mut report, cancel)
            .await
            .with_context(|| format!("failed to run scenario file `{}`", path.display()))?;
        Ok(summary)
    }

    /// Runs every file in order and returns how many of them failed.
    ///
    /// A failing file is logged and does not stop the remaining ones. Once `cancel` fires, no
    /// further files are started.
    pub async fn run_files(&self, files: &[PathBuf], cancel: &CancellationToken) -> usize {
        let mut failed = 0;
        for path in files {
            if cancel.is_cancelled() {
                tracing::info!(path = %path.display(), "run cancelled, skipping file");
                continue;
            }

            tracing::info!(path = %path.display(), "running scenario file");
            match self.run_file(path, cancel).await {
                Ok(summary) => tracing::info!(
                    path = %path.display(),
                    scenarios = summary.scenarios,
                    iterations = summary.iterations,
                    failures = summary.failures,
                    correctness_failures = summary.correctness_failures,
                    "finished scenario file"
                ),
                Err(error) => {
                    failed += 1;
                    tracing::warn!(
                        path = %path.display(),
                        error = &*error as &dyn std::error::Error,
                        "scenario file failed"
                    );
                }
            }
        }
        failed
    }
}
