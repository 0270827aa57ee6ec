//! Worker log domain types
//!
//! Runner workers print a mix of plain text and JSON objects on their combined
//! stdout/stderr stream. JSON lines are flattened into `key=value` text so the
//! console and per-worker log files stay readable.

use serde::{Deserialize, Serialize};

/// A structured log line emitted by a worker
///
/// Field names are matched loosely because workers have emitted both
/// `jobId` and `JobId` style keys over time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLogLine {
    #[serde(default, alias = "Time")]
    pub time: String,

    #[serde(default, alias = "Level")]
    pub level: String,

    #[serde(default, alias = "Msg", alias = "message")]
    pub msg: String,

    #[serde(default, alias = "Source")]
    pub source: String,

    #[serde(default, rename = "jobId", alias = "JobId", alias = "JobID", alias = "job_id")]
    pub job_id: String,

    #[serde(default, rename = "runId", alias = "RunID", alias = "RunId", alias = "run_id")]
    pub run_id: String,

    #[serde(
        default,
        rename = "agentId",
        alias = "AgentID",
        alias = "AgentId",
        alias = "agent_id"
    )]
    pub agent_id: String,

    #[serde(
        default,
        rename = "projectId",
        alias = "ProjectID",
        alias = "ProjectId",
        alias = "project_id"
    )]
    pub project_id: String,

    #[serde(
        default,
        rename = "projectOwnerId",
        alias = "ProjectOwnerID",
        alias = "ProjectOwnerId",
        alias = "project_owner_id"
    )]
    pub project_owner_id: String,
}

impl WorkerLogLine {
    /// Parses a brace-delimited line, returning `None` for anything else
    pub fn parse(line: &str) -> Option<Self> {
        if !(line.starts_with('{') && line.ends_with('}')) {
            return None;
        }
        serde_json::from_str(line).ok()
    }

    /// Renders the line as flattened `key=value` text, omitting unset fields
    pub fn render(&self) -> String {
        let mut out = format!("time={} level={} msg={}", self.time, self.level, self.msg);
        let optional = [
            ("AgentID", &self.agent_id),
            ("JobId", &self.job_id),
            ("RunID", &self.run_id),
            ("ProjectID", &self.project_id),
            ("ProjectOwnerID", &self.project_owner_id),
            ("Source", &self.source),
        ];
        for (key, value) in optional {
            if !value.is_empty() {
                out.push(' ');
                out.push_str(key);
                out.push('=');
                out.push_str(value);
            }
        }
        out
    }
}

/// Formats one raw line from a worker log stream
///
/// Structured lines are re-rendered; anything that fails to parse is passed
/// through unchanged (minus the trailing newline).
pub fn format_log_line(raw: &str) -> String {
    let line = raw.trim_end_matches(['\n', '\r']);
    match WorkerLogLine::parse(line) {
        Some(parsed) => parsed.render(),
        None => line.to_string(),
    }
}
