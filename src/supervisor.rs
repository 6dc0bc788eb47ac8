//! Process supervisor adapter (pm2)
//!
//! One named job per node. All three operations are safe on missing targets:
//! `stop` of an absent job succeeds, `start` of a running job restarts it.

use serde_json::Value;
use tracing::{debug, info};

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::remote::{RunOptions, Session};

/// Argument groups in document order, e.g. `{wallet = {name = "default"}}`
pub type ArgGroups = serde_json::Map<String, Value>;

pub const NAME_PLACEHOLDER: &str = "$NAME";
pub const CLUSTER_PLACEHOLDER: &str = "$CLUSTER";
pub const SECRET_PLACEHOLDER: &str = "$SECRET";

/// Values substituted into job commands and arguments
#[derive(Debug, Clone)]
pub struct Placeholders<'a> {
    pub node: &'a str,
    pub cluster: &'a str,
    pub secret: &'a str,
}

impl Placeholders<'_> {
    pub fn apply(&self, text: &str) -> String {
        text.replace(NAME_PLACEHOLDER, self.node)
            .replace(CLUSTER_PLACEHOLDER, self.cluster)
            .replace(SECRET_PLACEHOLDER, self.secret)
    }
}

/// A job to run under the supervisor
#[derive(Debug, Clone)]
pub struct JobSpec<'a> {
    pub command: &'a str,
    pub args: &'a ArgGroups,
    pub extra_args: &'a str,
}

/// Render argument groups as `--group.key value` pairs.
///
/// `true` and `null` entries become a bare `--group.key` flag, `false` is
/// left out. Groups and keys keep their document order.
pub fn render_args(groups: &ArgGroups) -> String {
    let mut parts = Vec::new();

    for (group, entries) in groups {
        let Value::Object(entries) = entries else {
            parts.push(format!("--{} {}", group, scalar(entries)));
            continue;
        };
        for (key, value) in entries {
            match value {
                Value::Bool(true) | Value::Null => parts.push(format!("--{}.{}", group, key)),
                Value::Bool(false) => {}
                other => parts.push(format!("--{}.{} {}", group, key, scalar(other))),
            }
        }
    }

    parts.join(" ")
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct Supervisor {
    job_name: String,
    interpreter: String,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            job_name: config.job_name.clone(),
            interpreter: config.interpreter.clone(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// The full `pm2 start` command line for a job
    pub fn start_command(&self, job: &JobSpec<'_>, placeholders: &Placeholders<'_>) -> String {
        let mut args = render_args(job.args);
        if !job.extra_args.trim().is_empty() {
            if !args.is_empty() {
                args.push(' ');
            }
            args.push_str(job.extra_args.trim());
        }

        let mut command = format!(
            "pm2 start {} --name {} --time --interpreter {}",
            placeholders.apply(job.command),
            self.job_name,
            self.interpreter
        );
        if !args.is_empty() {
            command.push_str(" -- ");
            command.push_str(&placeholders.apply(&args));
        }
        command
    }

    /// Start the job, replacing any instance already running under the name
    pub async fn start(
        &self,
        session: &dyn Session,
        job: &JobSpec<'_>,
        placeholders: &Placeholders<'_>,
    ) -> Result<()> {
        self.stop(session).await?;
        let command = self.start_command(job, placeholders);
        session.run(&command, RunOptions::default()).await?;
        info!(node = %session.node().name, job = %self.job_name, "Job started");
        Ok(())
    }

    /// Delete the job; an absent job is not an error
    pub async fn stop(&self, session: &dyn Session) -> Result<()> {
        let command = format!("pm2 delete {}", self.job_name);
        let result = session
            .run(&command, RunOptions::default().allow_failure())
            .await?;

        if result.success() {
            debug!(node = %session.node().name, job = %self.job_name, "Job stopped");
            return Ok(());
        }

        let output = format!("{}{}", result.stdout, result.stderr);
        if output.contains("not found") {
            debug!(node = %session.node().name, job = %self.job_name, "Job was not running");
            return Ok(());
        }

        result
            .checked(&session.node().name, &command, RunOptions::default())
            .map(|_| ())
    }

    /// True iff the supervisor reports a live process id for the job
    pub async fn is_running(&self, session: &dyn Session) -> Result<bool> {
        let result = session
            .run(
                &format!("pm2 pid {}", self.job_name),
                RunOptions::default().quiet(),
            )
            .await?;

        Ok(result
            .stdout
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .any(|pid| pid > 0))
    }
}
