//! Trajectory Recorder
//!
//! Append-only record of a run. The JSON Lines target writes one tagged
//! record per line and syncs it to disk before returning, so a crash leaves
//! the file truncated at a step boundary. At most the final line can be
//! torn; [`load`] drops it.
//!
//! ```text
//! {"type":"run_started", "run_id": ..., "task": ..., ...}
//! {"type":"step", "index": 0, "input": [...], "response": {...}, ...}
//! {"type":"step", "index": 1, ...}
//! {"type":"run_finished", "termination": "task_done", ...}
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::TokenUsage;
use crate::run::{Artifact, Task, Termination};
use crate::tool::{ToolCall, ToolResult};

/// One iteration of the loop
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the run, contiguous from 0
    pub index: u32,

    /// Messages appended to the conversation for this model call
    pub input: Vec<Message>,

    /// Assistant message received
    pub response: Message,

    /// Calls extracted from the response, in emission order
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Exactly one result per call, same order
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,

    /// Model that produced the response
    #[serde(default)]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    pub timestamp: DateTime<Utc>,
}

impl Step {
    /// Every call has a result with its id, in the same order
    pub fn is_resolved(&self) -> bool {
        self.tool_calls.len() == self.tool_results.len()
            && self
                .tool_calls
                .iter()
                .zip(&self.tool_results)
                .all(|(call, result)| call.id == result.call_id)
    }
}

/// Written once when a run starts
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: String,
    pub task: Task,
    pub provider: String,
    pub model: String,
    pub max_steps: u32,
    pub started_at: DateTime<Utc>,
}

/// Written once when a run ends
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub termination: Termination,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    #[serde(default)]
    pub usage: TokenUsage,

    pub finished_at: DateTime<Utc>,
}

/// One line of a trajectory file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrajectoryRecord {
    RunStarted(RunHeader),
    Step(Step),
    RunFinished(RunSummary),
}

/// Everything a trajectory file holds
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Trajectory {
    pub header: Option<RunHeader>,
    pub steps: Vec<Step>,
    pub summary: Option<RunSummary>,
}

/// Append-only sink for a run
///
/// Holds only a write target; the engine passes each record in by reference.
pub trait TrajectoryRecorder: Send + Sync {
    fn start(&self, header: &RunHeader) -> Result<()>;

    /// Must be durable before returning
    fn record(&self, step: &Step) -> Result<()>;

    fn finish(&self, summary: &RunSummary) -> Result<()>;
}

// ============================================================================
// JSON Lines file
// ============================================================================

/// JSON Lines file target
pub struct JsonlTrajectory {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTrajectory {
    /// Create (or truncate) the file, making parent directories as needed
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        tracing::debug!(path = %path.display(), "trajectory file created");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &TrajectoryRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| AgentError::Trajectory("trajectory file lock poisoned".into()))?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

impl TrajectoryRecorder for JsonlTrajectory {
    fn start(&self, header: &RunHeader) -> Result<()> {
        self.append(&TrajectoryRecord::RunStarted(header.clone()))
    }

    fn record(&self, step: &Step) -> Result<()> {
        self.append(&TrajectoryRecord::Step(step.clone()))
    }

    fn finish(&self, summary: &RunSummary) -> Result<()> {
        self.append(&TrajectoryRecord::RunFinished(summary.clone()))
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Keeps records in memory; for tests and embedding
#[derive(Default)]
pub struct MemoryTrajectory {
    records: Mutex<Vec<TrajectoryRecord>>,
}

impl MemoryTrajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TrajectoryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn steps(&self) -> Vec<Step> {
        self.snapshot().steps
    }

    /// Records folded into header, steps and summary
    pub fn snapshot(&self) -> Trajectory {
        fold(self.records())
    }

    fn push(&self, record: TrajectoryRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| AgentError::Trajectory("trajectory buffer lock poisoned".into()))?
            .push(record);
        Ok(())
    }
}

impl TrajectoryRecorder for MemoryTrajectory {
    fn start(&self, header: &RunHeader) -> Result<()> {
        self.push(TrajectoryRecord::RunStarted(header.clone()))
    }

    fn record(&self, step: &Step) -> Result<()> {
        self.push(TrajectoryRecord::Step(step.clone()))
    }

    fn finish(&self, summary: &RunSummary) -> Result<()> {
        self.push(TrajectoryRecord::RunFinished(summary.clone()))
    }
}

/// Discards everything
pub struct NullTrajectory;

impl TrajectoryRecorder for NullTrajectory {
    fn start(&self, _header: &RunHeader) -> Result<()> {
        Ok(())
    }

    fn record(&self, _step: &Step) -> Result<()> {
        Ok(())
    }

    fn finish(&self, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Steps of a trajectory file, in file order
pub fn load(path: impl AsRef<Path>) -> Result<Vec<Step>> {
    Ok(load_trajectory(path)?.steps)
}

/// Header, steps and summary of a trajectory file
pub fn load_trajectory(path: impl AsRef<Path>) -> Result<Trajectory> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse(&content)
}

/// Parse JSON Lines content; a final line without a newline is a torn write
pub fn parse(content: &str) -> Result<Trajectory> {
    let complete = match content.rfind('\n') {
        Some(end) => &content[..=end],
        None => "",
    };
    if complete.len() < content.len() {
        tracing::warn!(
            dropped_bytes = content.len() - complete.len(),
            "ignoring torn final trajectory line"
        );
    }

    let mut records = Vec::new();
    for (line_no, line) in complete.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str::<TrajectoryRecord>(line).map_err(|e| {
            AgentError::Trajectory(format!("line {}: {e}", line_no + 1))
        })?;
        records.push(record);
    }

    let trajectory = fold(records);
    for (expected, step) in trajectory.steps.iter().enumerate() {
        if usize::try_from(step.index).ok() != Some(expected) {
            return Err(AgentError::Trajectory(format!(
                "step indices not contiguous: expected {expected}, found {}",
                step.index
            )));
        }
    }
    Ok(trajectory)
}

fn fold(records: Vec<TrajectoryRecord>) -> Trajectory {
    let mut trajectory = Trajectory::default();
    for record in records {
        match record {
            TrajectoryRecord::RunStarted(header) => trajectory.header = Some(header),
            TrajectoryRecord::Step(step) => trajectory.steps.push(step),
            TrajectoryRecord::RunFinished(summary) => trajectory.summary = Some(summary),
        }
    }
    trajectory
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: u32) -> Step {
        let call = ToolCall::from_json("call-1", "bash", serde_json::json!({"command": "ls"}));
        Step {
            index,
            input: vec![Message::user("go")],
            response: Message::assistant_with_calls("listing", vec![call.clone()]),
            tool_results: vec![ToolResult::success("bash", "call-1", "src\nCargo.toml")],
            tool_calls: vec![call],
            model: "test-model".into(),
            usage: Some(TokenUsage::new(12, 3)),
            timestamp: Utc::now(),
        }
    }

    fn header() -> RunHeader {
        RunHeader {
            run_id: "run-1".into(),
            task: Task::new("task", "/tmp/repo"),
            provider: "mock".into(),
            model: "test-model".into(),
            max_steps: 5,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_jsonl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs/trajectory.jsonl");
        let recorder = JsonlTrajectory::create(&path).unwrap();

        let steps = vec![step(0), step(1)];
        recorder.start(&header()).unwrap();
        for s in &steps {
            recorder.record(s).unwrap();
        }

        assert_eq!(load(&path).unwrap(), steps);
        let trajectory = load_trajectory(&path).unwrap();
        assert_eq!(trajectory.header.unwrap().run_id, "run-1");
        assert!(trajectory.summary.is_none());
    }

    #[test]
    fn test_torn_final_line_is_dropped() {
        let mut content = String::new();
        for s in [step(0), step(1)] {
            content.push_str(&serde_json::to_string(&TrajectoryRecord::Step(s)).unwrap());
            content.push('\n');
        }
        content.push_str(r#"{"type":"step","index":2,"inp"#);

        let trajectory = parse(&content).unwrap();
        assert_eq!(trajectory.steps.len(), 2);
    }

    #[test]
    fn test_corrupt_complete_line_is_an_error() {
        let err = parse("{\"type\":\"step\"\nnot json\n").unwrap_err();
        assert!(matches!(err, AgentError::Trajectory(_)));
    }

    #[test]
    fn test_gap_in_indices_is_rejected() {
        let mut content = String::new();
        for s in [step(0), step(2)] {
            content.push_str(&serde_json::to_string(&TrajectoryRecord::Step(s)).unwrap());
            content.push('\n');
        }
        assert!(parse(&content).is_err());
    }

    #[test]
    fn test_memory_recorder_snapshot() {
        let memory = MemoryTrajectory::new();
        memory.start(&header()).unwrap();
        memory.record(&step(0)).unwrap();
        memory
            .finish(&RunSummary {
                termination: Termination::TaskDone,
                error: None,
                artifact: Some(Artifact::patch("diff --git a/x b/x")),
                usage: TokenUsage::new(12, 3),
                finished_at: Utc::now(),
            })
            .unwrap();

        let snapshot = memory.snapshot();
        assert_eq!(snapshot.steps.len(), 1);
        assert_eq!(snapshot.summary.unwrap().termination, Termination::TaskDone);
        assert_eq!(memory.records().len(), 3);
    }

    #[test]
    fn test_resolved_step() {
        let mut s = step(0);
        assert!(s.is_resolved());
        s.tool_results.clear();
        assert!(!s.is_resolved());
    }
}
