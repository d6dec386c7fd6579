//! Oracle adapters behind [`JudgePort`].
//!
//! - [`CommandJudge`] pipes each request as JSON into an external command
//!   and parses its stdout as the reply.
//! - [`ScriptedJudge`] is a deterministic stub for tests and demos.
//! - [`OfflineJudge`] always reports the oracle as unavailable.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use taxon_protocol::{
    AssessmentKind, JudgePort, JudgeReply, JudgeRequest, JudgeVerdict, TaxonError, TaxonResult,
    TypeDefId,
};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeLimits {
    pub max_runtime_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for JudgeLimits {
    fn default() -> Self {
        Self {
            max_runtime_secs: 30,
            max_output_bytes: 64 * 1024,
        }
    }
}

/// External oracle reached through a child process: request JSON on stdin,
/// reply JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandJudge {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub limits: JudgeLimits,
}

impl CommandJudge {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: BTreeMap::new(),
            limits: JudgeLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: JudgeLimits) -> Self {
        self.limits = limits;
        self
    }

    fn truncate(output: Vec<u8>, max_output_bytes: usize) -> String {
        let mut output = output;
        if output.len() > max_output_bytes {
            output.truncate(max_output_bytes);
        }
        String::from_utf8_lossy(&output).into_owned()
    }
}

#[async_trait]
impl JudgePort for CommandJudge {
    #[instrument(
        skip(self, request),
        fields(program = %self.program, project_id = %request.project_id, assessment = ?request.assessment)
    )]
    async fn judge(&self, request: JudgeRequest) -> TaxonResult<JudgeReply> {
        let payload = serde_json::to_vec(&request)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|err| {
            TaxonError::OracleUnavailable(format!("failed to start {}: {err}", self.program))
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|err| {
                TaxonError::OracleUnavailable(format!("failed to write request: {err}"))
            })?;
            // dropping stdin closes the pipe so the oracle sees EOF
        }

        let limit = Duration::from_secs(self.limits.max_runtime_secs.max(1));
        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| {
                TaxonError::OracleUnavailable(format!("oracle process failed: {err}"))
            })?,
            Err(_) => {
                warn!(
                    max_runtime_secs = self.limits.max_runtime_secs,
                    "oracle command timed out"
                );
                return Err(TaxonError::OracleUnavailable(format!(
                    "oracle timeout after {} seconds",
                    self.limits.max_runtime_secs
                )));
            }
        };

        if !output.status.success() {
            let stderr = Self::truncate(output.stderr, self.limits.max_output_bytes);
            warn!(exit_code = ?output.status.code(), "oracle command failed");
            return Err(TaxonError::OracleUnavailable(format!(
                "oracle exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            )));
        }
        if output.stdout.len() > self.limits.max_output_bytes {
            return Err(TaxonError::Validation(format!(
                "oracle reply exceeds {} bytes",
                self.limits.max_output_bytes
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: JudgeReply = serde_json::from_str(stdout.trim()).map_err(|err| {
            TaxonError::Validation(format!("unparsable oracle reply: {err}"))
        })?;
        debug!(verdict = ?reply.verdict, "oracle replied");
        Ok(reply)
    }
}

type ScriptKey = (AssessmentKind, Option<TypeDefId>);

/// Deterministic oracle stub.
///
/// Replies are scripted per assessment kind, optionally narrowed to the type
/// a request is about. Each script is a queue; its last reply repeats.
/// Unscripted requests get an `Undetermined` reply.
#[derive(Debug)]
pub struct ScriptedJudge {
    scripts: RwLock<HashMap<ScriptKey, VecDeque<JudgeReply>>>,
    requests: Mutex<Vec<JudgeRequest>>,
    available: RwLock<bool>,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedJudge {
    pub fn new() -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            available: RwLock::new(true),
        }
    }

    /// Queue a reply for every request of `kind`.
    pub fn script(&self, kind: AssessmentKind, reply: JudgeReply) -> &Self {
        self.push((kind, None), reply);
        self
    }

    /// Queue a reply for requests of `kind` about `type_id`.
    pub fn script_for(&self, kind: AssessmentKind, type_id: &TypeDefId, reply: JudgeReply) -> &Self {
        self.push((kind, Some(type_id.clone())), reply);
        self
    }

    fn push(&self, key: ScriptKey, reply: JudgeReply) {
        self.scripts.write().entry(key).or_default().push_back(reply);
    }

    pub fn set_available(&self, available: bool) {
        *self.available.write() = available;
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<JudgeRequest> {
        self.requests.lock().clone()
    }

    fn next_reply(&self, key: &ScriptKey) -> Option<JudgeReply> {
        let mut scripts = self.scripts.write();
        let queue = scripts.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl JudgePort for ScriptedJudge {
    async fn judge(&self, request: JudgeRequest) -> TaxonResult<JudgeReply> {
        self.requests.lock().push(request.clone());
        if !*self.available.read() {
            return Err(TaxonError::OracleUnavailable(
                "scripted oracle switched off".to_owned(),
            ));
        }
        let subject = request.subject_type();
        let reply = subject
            .and_then(|type_id| self.next_reply(&(request.assessment, Some(type_id))))
            .or_else(|| self.next_reply(&(request.assessment, None)))
            .unwrap_or_else(|| {
                JudgeReply::new(
                    request.assessment,
                    JudgeVerdict::Undetermined,
                    "no scripted assessment",
                )
            });
        Ok(reply)
    }
}

/// Oracle that is never reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineJudge;

#[async_trait]
impl JudgePort for OfflineJudge {
    async fn judge(&self, request: JudgeRequest) -> TaxonResult<JudgeReply> {
        Err(TaxonError::OracleUnavailable(format!(
            "no oracle configured for {:?}",
            request.assessment
        )))
    }
}
