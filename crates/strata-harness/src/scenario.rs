//! Structured step logging for end-to-end scenarios.
//!
//! Each step records its inputs and observed outputs as JSON so a failing
//! scenario leaves a readable trail; `write_to` dumps the log next to the
//! test artifacts for post-mortem reading.

use anyhow::{Context as _, Result};
use std::path::Path;
use std::time::{Duration, Instant};

/// One recorded scenario step.
#[derive(Debug, Clone)]
pub struct StepEntry {
    pub step: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub duration_us: u64,
    pub ok: bool,
}

/// Collects step entries for one scenario run.
#[derive(Debug, Default)]
pub struct ScenarioLog {
    name: String,
    entries: Vec<StepEntry>,
}

impl ScenarioLog {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            entries: Vec::new(),
        }
    }

    /// Run `step`, recording its input, output, and wall time.
    pub fn step<T, F>(
        &mut self,
        step: &str,
        input: serde_json::Value,
        run: F,
    ) -> Result<T>
    where
        T: serde::Serialize,
        F: FnOnce() -> Result<T>,
    {
        let started = Instant::now();
        let outcome = run();
        let duration = started.elapsed();
        match &outcome {
            Ok(value) => self.push(step, input, serde_json::to_value(value)?, duration, true),
            Err(err) => self.push(
                step,
                input,
                serde_json::json!({ "error": err.to_string() }),
                duration,
                false,
            ),
        }
        outcome
    }

    fn push(
        &mut self,
        step: &str,
        input: serde_json::Value,
        output: serde_json::Value,
        duration: Duration,
        ok: bool,
    ) {
        self.entries.push(StepEntry {
            step: step.to_owned(),
            input,
            output,
            duration_us: u64::try_from(duration.as_micros()).unwrap_or(u64::MAX),
            ok,
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[StepEntry] {
        &self.entries
    }

    /// Dump the log as one JSON document.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let doc = serde_json::json!({
            "scenario": self.name,
            "steps": self
                .entries
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "step": e.step,
                        "input": e.input,
                        "output": e.output,
                        "duration_us": e.duration_us,
                        "ok": e.ok,
                    })
                })
                .collect::<Vec<_>>(),
        });
        std::fs::write(path, serde_json::to_string_pretty(&doc)?)
            .with_context(|| format!("writing scenario log to {}", path.display()))
    }
}
