//! DAG Runner - Dependency-Ordered Shell Steps
//!
//! Executes a declared graph of shell commands with bounded parallel
//! fan-out. Validation (unique ids, resolvable `after` references, no
//! cycles) happens before anything spawns; the first failing step cancels
//! everything outstanding and marks not-yet-ready steps as skipped.
//!
//! The aggregate transcript is ordered by step id for determinism, not by
//! wall-clock completion.

use crate::error::{ToolError, ToolResult};
use crate::supervisor::{ProcessSupervisor, SignalKind, SpawnSpec};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Per-step output kept in the aggregate transcript; step sessions are
/// removed once captured, so longer tails are not retained.
const STEP_OUTPUT_CAP: usize = 16 * 1024;

/// One validated step.
#[derive(Debug, Clone)]
pub struct DagStep {
    pub id: String,
    pub run: String,
    pub after: Vec<String>,
}

/// Terminal status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Transcript entry for one step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Aggregate result of one DAG invocation.
#[derive(Debug, Clone, Serialize)]
pub struct DagOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,
    pub steps: Vec<StepReport>,
}

/// Parse the wire form: a list whose entries are bare command strings
/// (an implicit sequential chain), `{id, run, after}` objects, or
/// `{parallel: [...], after}` groups whose members share a predecessor set.
pub fn parse_steps(value: &Value) -> ToolResult<Vec<DagStep>> {
    let raw = value
        .as_array()
        .ok_or_else(|| ToolError::InvalidArguments("steps must be an array".into()))?;
    if raw.is_empty() {
        return Err(ToolError::InvalidArguments("steps must not be empty".into()));
    }

    let mut steps = Vec::new();
    let mut previous: Vec<String> = Vec::new();

    for (index, entry) in raw.iter().enumerate() {
        match entry {
            Value::String(command) => {
                if command.trim().is_empty() {
                    return Err(ToolError::InvalidArguments(format!(
                        "steps[{}] has an empty command",
                        index
                    )));
                }
                let id = format!("step_{}", index + 1);
                steps.push(DagStep {
                    id: id.clone(),
                    run: command.clone(),
                    after: previous.clone(),
                });
                previous = vec![id];
            }
            Value::Object(obj) => {
                if let Some(group) = obj.get("parallel") {
                    let members = group.as_array().ok_or_else(|| {
                        ToolError::InvalidArguments(format!(
                            "steps[{}].parallel must be an array",
                            index
                        ))
                    })?;
                    let after = parse_after(obj.get("after"), index)?;
                    let shared_after = if after.is_empty() { previous.clone() } else { after };
                    let mut group_ids = Vec::new();
                    for (sub, member) in members.iter().enumerate() {
                        let step = parse_object_step(member, index, Some((sub, &shared_after)))?;
                        group_ids.push(step.id.clone());
                        steps.push(step);
                    }
                    previous = group_ids;
                } else {
                    let step = parse_object_step(entry, index, None)?;
                    previous = vec![step.id.clone()];
                    steps.push(step);
                }
            }
            _ => {
                return Err(ToolError::InvalidArguments(format!(
                    "steps[{}] must be a string or object",
                    index
                )))
            }
        }
    }

    Ok(steps)
}

fn parse_object_step(
    value: &Value,
    index: usize,
    group: Option<(usize, &[String])>,
) -> ToolResult<DagStep> {
    let obj = value.as_object().ok_or_else(|| {
        ToolError::InvalidArguments(format!("steps[{}] must be a string or object", index))
    })?;

    let run = obj
        .get("run")
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("steps[{}] is missing `run`", index)))?
        .to_string();
    if run.trim().is_empty() {
        return Err(ToolError::InvalidArguments(format!(
            "steps[{}] has an empty command",
            index
        )));
    }

    let id = match obj.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        Some(_) => {
            return Err(ToolError::InvalidArguments(format!(
                "steps[{}] has an empty id",
                index
            )))
        }
        None => match group {
            Some((sub, _)) => format!("step_{}_{}", index + 1, sub + 1),
            None => format!("step_{}", index + 1),
        },
    };

    let after = match group {
        Some((_, shared)) => shared.to_vec(),
        None => parse_after(obj.get("after"), index)?,
    };

    Ok(DagStep { id, run, after })
}

fn parse_after(value: Option<&Value>, index: usize) -> ToolResult<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    ToolError::InvalidArguments(format!(
                        "steps[{}].after entries must be strings",
                        index
                    ))
                })
            })
            .collect(),
        Some(_) => Err(ToolError::InvalidArguments(format!(
            "steps[{}].after must be an array of ids",
            index
        ))),
    }
}

/// Validate ids, references, and acyclicity (Kahn's algorithm).
pub fn validate(steps: &[DagStep]) -> ToolResult<()> {
    let mut ids = HashSet::new();
    for step in steps {
        if !ids.insert(step.id.as_str()) {
            return Err(ToolError::InvalidArguments(format!(
                "duplicate step id `{}`",
                step.id
            )));
        }
    }
    for step in steps {
        for dep in &step.after {
            if !ids.contains(dep.as_str()) {
                return Err(ToolError::InvalidArguments(format!(
                    "step `{}` depends on unknown step `{}`",
                    step.id, dep
                )));
            }
        }
    }

    let mut indegree: HashMap<&str, usize> = steps
        .iter()
        .map(|s| (s.id.as_str(), s.after.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.after {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut seen = 0usize;
    while let Some(id) = queue.pop_front() {
        seen += 1;
        for dependent in dependents.get(id).into_iter().flatten() {
            let d = indegree.get_mut(dependent).expect("known id");
            *d -= 1;
            if *d == 0 {
                queue.push_back(dependent);
            }
        }
    }
    if seen != steps.len() {
        return Err(ToolError::InvalidArguments(
            "dependency cycle in steps".into(),
        ));
    }
    Ok(())
}

enum StepEvent {
    Finished {
        id: String,
        session_id: String,
        exit_status: i32,
        duration_ms: u64,
    },
    SpawnFailed {
        id: String,
        error: String,
    },
}

/// Executes a validated DAG against the supervisor.
pub struct DagRunner {
    supervisor: Arc<ProcessSupervisor>,
    cwd: PathBuf,
    max_parallel: usize,
}

impl DagRunner {
    pub fn new(supervisor: Arc<ProcessSupervisor>, cwd: PathBuf, max_parallel: usize) -> Self {
        Self {
            supervisor,
            cwd,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run the steps to completion, first failure, or cancellation.
    pub async fn run(
        &self,
        steps: Vec<DagStep>,
        cancel: &CancellationToken,
    ) -> ToolResult<DagOutcome> {
        validate(&steps)?;

        let mut indegree: HashMap<String, usize> = steps
            .iter()
            .map(|s| (s.id.clone(), s.after.len()))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &steps {
            for dep in &step.after {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }
        let by_id: HashMap<String, DagStep> =
            steps.iter().map(|s| (s.id.clone(), s.clone())).collect();

        let mut ready: VecDeque<String> = steps
            .iter()
            .filter(|s| s.after.is_empty())
            .map(|s| s.id.clone())
            .collect();
        let mut reports: HashMap<String, StepReport> = HashMap::new();
        let mut running: HashMap<String, String> = HashMap::new(); // step id -> session id
        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut failed_step: Option<String> = None;
        let mut cancelled = false;

        loop {
            while !cancelled && failed_step.is_none() && running.len() < self.max_parallel {
                let Some(id) = ready.pop_front() else { break };
                let step = by_id.get(&id).expect("validated id").clone();
                match self.launch(&step).await {
                    Ok(session_id) => {
                        running.insert(id.clone(), session_id.clone());
                        let supervisor = Arc::clone(&self.supervisor);
                        let tx = event_tx.clone();
                        tokio::spawn(async move {
                            let started = std::time::Instant::now();
                            let exit_status =
                                supervisor.wait_exit(&session_id).await.unwrap_or(-1);
                            let _ = tx.send(StepEvent::Finished {
                                id,
                                session_id,
                                exit_status,
                                duration_ms: started.elapsed().as_millis() as u64,
                            });
                        });
                    }
                    Err(err) => {
                        let _ = event_tx.send(StepEvent::SpawnFailed {
                            id: id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }

            if running.is_empty() && (cancelled || failed_step.is_some() || ready.is_empty()) {
                break;
            }

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    match event {
                        StepEvent::Finished { id, session_id, exit_status, duration_ms } => {
                            running.remove(&id);
                            let output = self.capture_output(&session_id).await;
                            let ok = exit_status == 0;
                            reports.insert(id.clone(), StepReport {
                                id: id.clone(),
                                status: if ok { StepStatus::Success } else { StepStatus::Failed },
                                exit_status: Some(exit_status),
                                output,
                                duration_ms: Some(duration_ms),
                            });
                            if ok {
                                for dependent in dependents.get(&id).into_iter().flatten() {
                                    let d = indegree.get_mut(dependent).expect("known id");
                                    *d -= 1;
                                    if *d == 0 && failed_step.is_none() && !cancelled {
                                        ready.push_back(dependent.clone());
                                    }
                                }
                            } else if failed_step.is_none() && !cancelled {
                                info!(step = %id, exit_status, "step failed, cancelling outstanding");
                                failed_step = Some(id);
                                self.cancel_running(&running);
                            }
                        }
                        StepEvent::SpawnFailed { id, error } => {
                            running.remove(&id);
                            reports.insert(id.clone(), StepReport {
                                id: id.clone(),
                                status: StepStatus::Failed,
                                exit_status: None,
                                output: error,
                                duration_ms: None,
                            });
                            if failed_step.is_none() && !cancelled {
                                failed_step = Some(id);
                                self.cancel_running(&running);
                            }
                        }
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    self.cancel_running(&running);
                }
            }
        }

        if cancelled {
            return Err(ToolError::Cancelled("dag execution cancelled".into()));
        }

        // everything never launched is skipped
        let mut transcript: Vec<StepReport> = steps
            .iter()
            .map(|step| {
                reports.remove(&step.id).unwrap_or_else(|| StepReport {
                    id: step.id.clone(),
                    status: StepStatus::Skipped,
                    exit_status: None,
                    output: String::new(),
                    duration_ms: None,
                })
            })
            .collect();
        transcript.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(DagOutcome {
            success: failed_step.is_none(),
            failed_step,
            steps: transcript,
        })
    }

    async fn launch(&self, step: &DagStep) -> ToolResult<String> {
        debug!(step = %step.id, "launching dag step");
        self.supervisor
            .spawn(SpawnSpec {
                argv: vec!["sh".into(), "-c".into(), step.run.clone()],
                cwd: self.cwd.clone(),
                env: Vec::new(),
                stdin: None,
            })
            .await
    }

    /// Collect a step's combined output and drop its session; the DAG
    /// transcript is the record, not the supervisor index.
    async fn capture_output(&self, session_id: &str) -> String {
        // give the collectors a beat to drain the pipes
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let output = self
            .supervisor
            .read_logs(session_id, 0)
            .map(|slice| truncate_output(&slice.bytes, STEP_OUTPUT_CAP))
            .unwrap_or_default();
        let _ = self.supervisor.remove(session_id);
        output
    }

    /// Terminate outstanding step sessions; a detached task escalates to
    /// kill after the grace window so the event loop keeps draining.
    fn cancel_running(&self, running: &HashMap<String, String>) {
        let session_ids: Vec<String> = running.values().cloned().collect();
        if session_ids.is_empty() {
            return;
        }
        for session_id in &session_ids {
            let _ = self.supervisor.signal(session_id, SignalKind::Terminate);
        }
        let supervisor = Arc::clone(&self.supervisor);
        let grace = supervisor.kill_grace();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            for session_id in &session_ids {
                let _ = supervisor.signal(session_id, SignalKind::Kill);
            }
        });
    }
}

fn truncate_output(bytes: &[u8], cap: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= cap {
        text.into_owned()
    } else {
        let mut cut = cap;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn bare_strings_chain_sequentially() {
        let steps = parse_steps(&json!(["echo a", "echo b", "echo c"])).unwrap();
        assert_eq!(steps.len(), 3);
        assert!(steps[0].after.is_empty());
        assert_eq!(steps[1].after, vec!["step_1"]);
        assert_eq!(steps[2].after, vec!["step_2"]);
    }

    #[test]
    fn objects_keep_declared_edges() {
        let steps = parse_steps(&json!([
            {"id": "build", "run": "make"},
            {"id": "test", "run": "make test", "after": ["build"]},
        ]))
        .unwrap();
        assert_eq!(steps[1].after, vec!["build"]);
    }

    #[test]
    fn parallel_group_shares_predecessors() {
        let steps = parse_steps(&json!([
            {"id": "setup", "run": "true"},
            {"parallel": [
                {"id": "lint", "run": "make lint"},
                {"id": "unit", "run": "make unit"},
            ]},
            {"id": "pack", "run": "make pack"},
        ]))
        .unwrap();

        assert_eq!(steps[1].after, vec!["setup"]);
        assert_eq!(steps[2].after, vec!["setup"]);
        let mut pack_after = steps[3].after.clone();
        pack_after.sort();
        assert_eq!(pack_after, vec!["lint", "unit"]);
    }

    #[test]
    fn empty_command_is_invalid() {
        let err = parse_steps(&json!([""])).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));

        let err = parse_steps(&json!([{"id": "a", "run": "  "}])).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn empty_step_list_is_invalid() {
        assert!(parse_steps(&json!([])).is_err());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let steps = parse_steps(&json!([
            {"id": "a", "run": "true"},
            {"id": "a", "run": "false"},
        ]))
        .unwrap();
        let err = validate(&steps).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn unknown_reference_rejected() {
        let steps = parse_steps(&json!([
            {"id": "a", "run": "true", "after": ["ghost"]},
        ]))
        .unwrap();
        let err = validate(&steps).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn cycle_rejected() {
        let steps = vec![
            DagStep {
                id: "a".into(),
                run: "true".into(),
                after: vec!["b".into()],
            },
            DagStep {
                id: "b".into(),
                run: "true".into(),
                after: vec!["a".into()],
            },
        ];
        let err = validate(&steps).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[cfg(unix)]
    mod exec {
        use super::*;
        use crate::supervisor::ProcessSupervisor;
        use std::time::Duration;

        fn runner(temp: &TempDir) -> DagRunner {
            let supervisor = Arc::new(ProcessSupervisor::new(
                temp.path().to_path_buf(),
                1024 * 1024,
                Duration::from_millis(200),
            ));
            DagRunner::new(supervisor, std::env::temp_dir(), 4)
        }

        #[tokio::test]
        async fn linear_dag_succeeds_in_order() {
            let temp = TempDir::new().unwrap();
            let runner = runner(&temp);
            let marker = temp.path().join("order.txt");

            let steps = parse_steps(&json!([
                {"id": "a", "run": format!("echo a >> {}", marker.display())},
                {"id": "b", "run": format!("echo b >> {}", marker.display()), "after": ["a"]},
            ]))
            .unwrap();

            let outcome = runner.run(steps, &CancellationToken::new()).await.unwrap();
            assert!(outcome.success);
            assert_eq!(
                std::fs::read_to_string(&marker).unwrap(),
                "a\nb\n",
                "dependency edge must be honoured"
            );
        }

        #[tokio::test]
        async fn failure_cascades_to_dependents() {
            let temp = TempDir::new().unwrap();
            let runner = runner(&temp);

            let steps = parse_steps(&json!([
                {"id": "a", "run": "true"},
                {"id": "b", "run": "false", "after": ["a"]},
                {"id": "c", "run": "echo skip", "after": ["b"]},
            ]))
            .unwrap();

            let outcome = runner.run(steps, &CancellationToken::new()).await.unwrap();
            assert!(!outcome.success);
            assert_eq!(outcome.failed_step.as_deref(), Some("b"));

            let by_id: HashMap<&str, &StepReport> =
                outcome.steps.iter().map(|r| (r.id.as_str(), r)).collect();
            assert_eq!(by_id["a"].status, StepStatus::Success);
            assert_eq!(by_id["b"].status, StepStatus::Failed);
            assert_eq!(by_id["b"].exit_status, Some(1));
            assert_eq!(by_id["c"].status, StepStatus::Skipped);
        }

        #[tokio::test]
        async fn transcript_is_ordered_by_id() {
            let temp = TempDir::new().unwrap();
            let runner = runner(&temp);

            let steps = parse_steps(&json!([
                {"id": "zeta", "run": "echo z"},
                {"id": "alpha", "run": "echo a"},
            ]))
            .unwrap();

            let outcome = runner.run(steps, &CancellationToken::new()).await.unwrap();
            let ids: Vec<&str> = outcome.steps.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(ids, vec!["alpha", "zeta"]);
        }

        #[tokio::test]
        async fn parallel_steps_all_run() {
            let temp = TempDir::new().unwrap();
            let runner = runner(&temp);

            let steps = parse_steps(&json!([
                {"parallel": [
                    {"id": "one", "run": "echo 1"},
                    {"id": "two", "run": "echo 2"},
                    {"id": "three", "run": "echo 3"},
                ]},
            ]))
            .unwrap();

            let outcome = runner.run(steps, &CancellationToken::new()).await.unwrap();
            assert!(outcome.success);
            assert_eq!(outcome.steps.len(), 3);
            assert!(outcome
                .steps
                .iter()
                .all(|r| r.status == StepStatus::Success));
        }

        #[tokio::test]
        async fn cancellation_interrupts_the_run() {
            let temp = TempDir::new().unwrap();
            let runner = runner(&temp);

            let steps = parse_steps(&json!([
                {"id": "slow", "run": "sleep 30"},
            ]))
            .unwrap();

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel_clone.cancel();
            });

            let err = runner.run(steps, &cancel).await.unwrap_err();
            assert!(matches!(err, ToolError::Cancelled(_)));
        }
    }
}
