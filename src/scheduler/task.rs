use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Default per-host execution deadline, in seconds.
pub const DEFAULT_TIMEOUT_SECS: i32 = 30;

/// Longest per-host execution deadline accepted at admission (five days).
pub const MAX_TIMEOUT_SECS: i32 = 3600 * 24 * 5;

/// Slack added on top of `TaskMeta::timeout` before a host is force-terminated.
/// Covers the server -> agent dispatch latency.
pub const TIMEOUT_SLACK_SECS: i64 = 3;

/// Number of `task_host_NN` shards.
pub const TASK_HOST_SHARDS: i64 = 100;

/// Wall clock in seconds since the epoch, the unit of every `clock` column.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Name of the sharded per-host table holding the hosts of task `id`.
pub fn task_host_table(id: i64) -> String {
    format!("task_host_{:02}", id.rem_euclid(TASK_HOST_SHARDS))
}

/// Control state of an active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Start,
    Pause,
    Cancel,
    Kill,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Start => "start",
            ActionKind::Pause => "pause",
            ActionKind::Cancel => "cancel",
            ActionKind::Kill => "kill",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(ActionKind::Start),
            "pause" => Ok(ActionKind::Pause),
            "cancel" => Ok(ActionKind::Cancel),
            "kill" => Ok(ActionKind::Kill),
            other => Err(DispatchError::validation(format!("action({other}) invalid"))),
        }
    }
}

/// Execution status of one host of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Waiting,
    Running,
    Killing,
    Success,
    Failed,
    Timeout,
    Ignored,
    Killed,
    Cancelled,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Waiting => "waiting",
            HostStatus::Running => "running",
            HostStatus::Killing => "killing",
            HostStatus::Success => "success",
            HostStatus::Failed => "failed",
            HostStatus::Timeout => "timeout",
            HostStatus::Ignored => "ignored",
            HostStatus::Killed => "killed",
            HostStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal results that count against `TaskMeta::tolerance`.
    pub const UNEXPECTED: [HostStatus; 3] =
        [HostStatus::Failed, HostStatus::Timeout, HostStatus::Killed];

    pub fn is_unexpected(&self) -> bool {
        Self::UNEXPECTED.contains(self)
    }

    /// Statuses an agent report may drive a host into.
    pub fn is_reportable_result(&self) -> bool {
        matches!(
            self,
            HostStatus::Success | HostStatus::Failed | HostStatus::Killed
        )
    }
}

impl std::fmt::Display for HostStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "waiting" => Ok(HostStatus::Waiting),
            "running" => Ok(HostStatus::Running),
            "killing" => Ok(HostStatus::Killing),
            "success" => Ok(HostStatus::Success),
            "failed" => Ok(HostStatus::Failed),
            "timeout" => Ok(HostStatus::Timeout),
            "ignored" => Ok(HostStatus::Ignored),
            "killed" => Ok(HostStatus::Killed),
            "cancelled" => Ok(HostStatus::Cancelled),
            other => Err(DispatchError::InvalidState(format!(
                "unknown host status {other}"
            ))),
        }
    }
}

/// What an agent should do with an in-flight assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoingAction {
    Start,
    Kill,
}

impl DoingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoingAction::Start => "start",
            DoingAction::Kill => "kill",
        }
    }
}

impl std::fmt::Display for DoingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DoingAction {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "start" => Ok(DoingAction::Start),
            "kill" => Ok(DoingAction::Kill),
            other => Err(DispatchError::InvalidState(format!(
                "unknown doing action {other}"
            ))),
        }
    }
}

/// Immutable policy of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    pub account: String,
    #[serde(default)]
    pub batch: i32,
    #[serde(default)]
    pub tolerance: i32,
    #[serde(default)]
    pub timeout: i32,
    #[serde(default)]
    pub pause: String,
    pub script: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default = "Utc::now", rename = "created")]
    pub created_at: DateTime<Utc>,
}

impl TaskMeta {
    pub fn new(title: impl Into<String>, account: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            id: 0,
            title: title.into(),
            account: account.into(),
            batch: 0,
            tolerance: 0,
            timeout: 0,
            pause: String::new(),
            script: script.into(),
            args: String::new(),
            stdin: String::new(),
            creator: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Validate and normalise admission input.
    pub fn clean_fields(&mut self) -> Result<()> {
        if self.batch < 0 {
            return Err(DispatchError::validation("arg(batch) should be nonnegative"));
        }
        if self.tolerance < 0 {
            return Err(DispatchError::validation(
                "arg(tolerance) should be nonnegative",
            ));
        }
        if self.timeout < 0 {
            return Err(DispatchError::validation("arg(timeout) should be nonnegative"));
        }
        if self.timeout > MAX_TIMEOUT_SECS {
            return Err(DispatchError::validation("arg(timeout) longer than five days"));
        }
        if self.timeout == 0 {
            self.timeout = DEFAULT_TIMEOUT_SECS;
        }

        self.pause = self.pause.replace('，', ",").replace(' ', "");
        self.args = self.args.replace('，', ",");

        if self.title.is_empty() {
            return Err(DispatchError::validation("arg(title) is required"));
        }
        if is_dangerous(&self.title) {
            return Err(DispatchError::validation("arg(title) is dangerous"));
        }
        if self.script.is_empty() {
            return Err(DispatchError::validation("arg(script) is required"));
        }
        if is_dangerous(&self.args) {
            return Err(DispatchError::validation("arg(args) is dangerous"));
        }
        if is_dangerous(&self.pause) {
            return Err(DispatchError::validation("arg(pause) is dangerous"));
        }

        Ok(())
    }

    /// Tag the title with the first target host, replacing any earlier tag.
    pub fn handle_fh(&mut self, fh: &str) {
        if let Some(i) = self.title.find(" FH: ") {
            if i > 0 {
                self.title.truncate(i);
            }
        }
        self.title = format!("{} FH: {}", self.title, fh);
    }

    /// Hosts whose turn auto-pauses the task.
    pub fn pause_hosts(&self) -> HashSet<&str> {
        self.pause
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect()
    }
}

const DANGEROUS_CHARS: [char; 9] = ['<', '>', '`', '$', '|', ';', '&', '\n', '\r'];

fn is_dangerous(s: &str) -> bool {
    s.contains(DANGEROUS_CHARS)
}

/// Mutable control state; present iff the task is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAction {
    pub id: i64,
    pub action: ActionKind,
    pub clock: i64,
}

/// Per-host execution row of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHost {
    pub id: i64,
    pub host: String,
    pub status: HostStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl TaskHost {
    pub fn new(id: i64, host: impl Into<String>, status: HostStatus) -> Self {
        Self {
            id,
            host: host.into(),
            status,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Key used for per-row error reporting in bulk upserts.
    pub fn key(&self) -> String {
        format!("{}:{}", self.id, self.host)
    }
}

/// One in-flight `(task, host)` assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHostDoing {
    pub id: i64,
    pub host: String,
    pub clock: i64,
    pub action: DoingAction,
    /// Set when the entry came from the cache (edge, alert-fired) rather than the store.
    #[serde(skip)]
    pub alert_triggered: bool,
}

impl TaskHostDoing {
    pub fn new(id: i64, host: impl Into<String>, clock: i64, action: DoingAction) -> Self {
        Self {
            id,
            host: host.into(),
            clock,
            action,
            alert_triggered: false,
        }
    }

    /// Field name inside the `ibex-host-doing` cache hash.
    pub fn cache_field(&self) -> String {
        host_doing_field(&self.host, self.id)
    }
}

pub fn host_doing_field(host: &str, id: i64) -> String {
    format!("{host}:{id}")
}

/// Completion record applied by `MarkDone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkDone {
    pub id: i64,
    pub clock: i64,
    pub host: String,
    pub status: HostStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> TaskMeta {
        TaskMeta::new("restart nginx", "root", "systemctl restart nginx")
    }

    #[test]
    fn task_host_table_shards_by_id() {
        assert_eq!(task_host_table(0), "task_host_00");
        assert_eq!(task_host_table(7), "task_host_07");
        assert_eq!(task_host_table(1234), "task_host_34");
    }

    #[test]
    fn clean_fields_defaults_timeout() {
        let mut m = meta();
        m.clean_fields().unwrap();
        assert_eq!(m.timeout, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn clean_fields_rejects_negative_values() {
        let mut m = meta();
        m.batch = -1;
        assert_eq!(
            m.clean_fields().unwrap_err().to_string(),
            "arg(batch) should be nonnegative"
        );

        let mut m = meta();
        m.tolerance = -1;
        assert!(m.clean_fields().is_err());

        let mut m = meta();
        m.timeout = -5;
        assert!(m.clean_fields().is_err());
    }

    #[test]
    fn clean_fields_rejects_timeout_over_five_days() {
        let mut m = meta();
        m.timeout = MAX_TIMEOUT_SECS + 1;
        assert_eq!(
            m.clean_fields().unwrap_err().to_string(),
            "arg(timeout) longer than five days"
        );

        let mut m = meta();
        m.timeout = MAX_TIMEOUT_SECS;
        assert!(m.clean_fields().is_ok());
    }

    #[test]
    fn clean_fields_normalises_pause_and_args() {
        let mut m = meta();
        m.pause = "h1， h2 ,h3".to_string();
        m.args = "a，b".to_string();
        m.clean_fields().unwrap();
        assert_eq!(m.pause, "h1,h2,h3");
        assert_eq!(m.args, "a,b");
    }

    #[test]
    fn clean_fields_requires_title_and_script() {
        let mut m = meta();
        m.title.clear();
        assert_eq!(m.clean_fields().unwrap_err().to_string(), "arg(title) is required");

        let mut m = meta();
        m.script.clear();
        assert_eq!(m.clean_fields().unwrap_err().to_string(), "arg(script) is required");
    }

    #[test]
    fn clean_fields_rejects_dangerous_args() {
        let mut m = meta();
        m.args = "x; rm -rf /".to_string();
        assert_eq!(m.clean_fields().unwrap_err().to_string(), "arg(args) is dangerous");
    }

    #[test]
    fn handle_fh_replaces_previous_suffix() {
        let mut m = meta();
        m.handle_fh("10.0.0.1");
        assert_eq!(m.title, "restart nginx FH: 10.0.0.1");
        m.handle_fh("10.0.0.2");
        assert_eq!(m.title, "restart nginx FH: 10.0.0.2");
    }

    #[test]
    fn pause_hosts_skips_blanks() {
        let mut m = meta();
        m.pause = "h3,,h5,".to_string();
        let hosts = m.pause_hosts();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains("h3"));
        assert!(hosts.contains("h5"));
    }

    #[test]
    fn host_status_classification() {
        assert!(HostStatus::Timeout.is_unexpected());
        assert!(HostStatus::Killed.is_unexpected());
        assert!(!HostStatus::Ignored.is_unexpected());
        assert!(HostStatus::Killed.is_reportable_result());
        assert!(!HostStatus::Running.is_reportable_result());
    }

    #[test]
    fn action_kind_parse() {
        assert_eq!("pause".parse::<ActionKind>().unwrap(), ActionKind::Pause);
        assert_eq!(
            "redo".parse::<ActionKind>().unwrap_err().to_string(),
            "action(redo) invalid"
        );
    }

    #[test]
    fn doing_serialises_without_alert_flag() {
        let mut d = TaskHostDoing::new(9, "h1", 100, DoingAction::Start);
        d.alert_triggered = true;
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, r#"{"id":9,"host":"h1","clock":100,"action":"start"}"#);
        let back: TaskHostDoing = serde_json::from_str(&json).unwrap();
        assert!(!back.alert_triggered);
        assert_eq!(d.cache_field(), "h1:9");
    }
}
