// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Plan execution.
//!
//! Steps are carried out through an [`Executor`]. The real one spawns `ssh`,
//! `scp`, and `sh` processes, while tests substitute a scripted executor to
//! check what would run without touching any server.
//!
//! # Failure Semantics
//!
//! Steps run strictly in order. A step fails when its process exits non-zero,
//! cannot be spawned, or runs past its time limit. Failures of steps marked
//! `allow_failure` are logged and skipped. Any other failure stops the plan.
//! If the failed step sits at or after the plan checkpoint, every rollback
//! action runs, newest first, regardless of whether earlier rollback steps
//! fail. Rollback never triggers further rollback.

use crate::release::plan::{DeploymentPlan, ReleaseState, Step};

use indicatif::ProgressBar;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    process::Stdio,
    time::Duration,
};
use tokio::{process::Command, time::timeout};
use tracing::{debug, error, info, instrument, warn};

/// Exit status reported for steps that ran past their time limit.
pub const TIMEOUT_STATUS: i32 = 124;

/// Captured result of a finished process.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// Construct new output.
    pub fn new(status: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Check if process exited zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Carry out plan steps.
pub trait Executor {
    /// Execute `step`, honoring its time limit.
    ///
    /// A non-zero exit is not an error here, it is reported through
    /// [`Output::status`].
    fn execute(&mut self, step: &Step) -> impl Future<Output = Result<Output>> + Send;
}

/// Executor spawning real processes.
#[derive(Default, Debug, Clone, Copy)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Executor for ProcessExecutor {
    #[instrument(skip(self, step), fields(step = %step.label), level = "debug")]
    async fn execute(&mut self, step: &Step) -> Result<Output> {
        let (program, args) = step.action.invocation();
        debug!("{program} {args:?}");

        let mut command = Command::new(program.as_str());
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);

        // INVARIANT: Dropping the output future on timeout kills the child.
        let output = timeout(step.timeout, command.output())
            .await
            .map_err(|_| ExecError::Timeout {
                label: step.label.clone(),
                timeout: step.timeout,
            })?
            .map_err(|source| ExecError::Spawn { program, source })?;

        Ok(Output {
            status: output.status.code().unwrap_or(-1),
            stdout: chomp(String::from_utf8_lossy(output.stdout.as_slice()).into_owned()),
            stderr: chomp(String::from_utf8_lossy(output.stderr.as_slice()).into_owned()),
        })
    }
}

// INVARIANT: Chomp trailing newlines.
fn chomp(message: String) -> String {
    message
        .strip_suffix("\r\n")
        .or(message.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(message)
}

/// Why a step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// Process exited non-zero.
    Exit { status: i32, stderr: String },

    /// Process ran past its time limit.
    Timeout(Duration),

    /// Process could not be spawned.
    Spawn(String),
}

/// Failed step with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub label: String,
    pub host: String,
    pub phase: Option<ReleaseState>,
    pub cause: FailureCause,
}

impl StepFailure {
    fn new(step: &Step, cause: FailureCause) -> Self {
        Self {
            label: step.label.clone(),
            host: step.host(),
            phase: step.phase,
            cause,
        }
    }

    /// Exit code to report for this failure.
    pub fn exit_code(&self) -> i32 {
        match &self.cause {
            FailureCause::Exit { status, .. } if *status > 0 => *status,
            FailureCause::Timeout(_) => TIMEOUT_STATUS,
            _ => 1,
        }
    }
}

impl Display for StepFailure {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "step {:?} on {}", self.label, self.host)?;
        if let Some(phase) = self.phase {
            write!(fmt, " (after {phase})")?;
        }

        match &self.cause {
            FailureCause::Exit { status, stderr } if stderr.is_empty() => {
                write!(fmt, " exited with status {status}")
            }
            FailureCause::Exit { status, stderr } => {
                write!(fmt, " exited with status {status}: {stderr}")
            }
            FailureCause::Timeout(limit) => {
                write!(fmt, " timed out after {}s", limit.as_secs())
            }
            FailureCause::Spawn(message) => write!(fmt, " could not start: {message}"),
        }
    }
}

/// Outcome of rollback.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub attempted: usize,
    pub failures: Vec<StepFailure>,
}

impl Display for RollbackReport {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        if self.failures.is_empty() {
            return write!(fmt, "rolled back with {} steps", self.attempted);
        }

        write!(
            fmt,
            "rollback ran {} steps, {} failed",
            self.attempted,
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(fmt, "\n  - {failure}")?;
        }
        Ok(())
    }
}

/// Outcome of a plan run.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Steps finished successfully.
    pub completed: usize,

    /// Failed steps that were allowed to fail.
    pub tolerated: Vec<StepFailure>,

    /// Step that stopped the plan.
    pub failure: Option<StepFailure>,
    pub rollback: Option<RollbackReport>,
}

impl RunReport {
    /// Check if plan ran to completion.
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }

    /// Convert report into result.
    ///
    /// # Errors
    ///
    /// - Return [`RunError`] if a step stopped the plan.
    pub fn into_result(self) -> std::result::Result<Self, RunError> {
        match self.failure {
            Some(failure) => Err(RunError {
                failure,
                rollback: self.rollback,
            }),
            None => Ok(self),
        }
    }
}

/// Run plans through an executor.
pub struct PlanRunner<'a, E: Executor> {
    executor: &'a mut E,
    bar: ProgressBar,
}

impl<'a, E: Executor> PlanRunner<'a, E> {
    /// Construct new runner without visible progress.
    pub fn new(executor: &'a mut E) -> Self {
        Self {
            executor,
            bar: ProgressBar::hidden(),
        }
    }

    /// Report progress through `bar`.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.bar = bar;
        self
    }

    /// Run every step of `plan`.
    #[instrument(skip(self, plan), level = "debug")]
    pub async fn run(&mut self, plan: &DeploymentPlan) -> RunReport {
        let mut report = RunReport::default();
        self.bar.set_length(plan.len() as u64);

        for (index, step) in plan.steps().iter().enumerate() {
            self.bar.set_message(step.label.clone());
            self.bar.suspend(|| info!("{}", step.label));

            match self.attempt(step).await {
                Ok(()) => report.completed += 1,
                Err(cause) if step.allow_failure => {
                    let failure = StepFailure::new(step, cause);
                    self.bar.suspend(|| warn!("{failure}, continuing"));
                    report.tolerated.push(failure);
                }
                Err(cause) => {
                    let failure = StepFailure::new(step, cause);
                    self.bar.suspend(|| error!("{failure}"));
                    if plan.covers(index) {
                        report.rollback = Some(self.roll_back(plan).await);
                    }
                    report.failure = Some(failure);
                    break;
                }
            }
            self.bar.inc(1);
        }

        self.bar.finish_and_clear();
        report
    }

    async fn roll_back(&mut self, plan: &DeploymentPlan) -> RollbackReport {
        let mut report = RollbackReport::default();
        for action in plan.rollback().iter().rev() {
            self.bar.suspend(|| warn!("rolling back: {}", action.label));
            for step in &action.steps {
                report.attempted += 1;
                self.bar.set_message(step.label.clone());

                // INVARIANT: Rollback is best effort, keep going past failures.
                if let Err(cause) = self.attempt(step).await {
                    let mut failure = StepFailure::new(step, cause);
                    failure.phase = Some(ReleaseState::RolledBack);
                    self.bar.suspend(|| error!("{failure}"));
                    report.failures.push(failure);
                }
            }
        }

        report
    }

    async fn attempt(&mut self, step: &Step) -> std::result::Result<(), FailureCause> {
        match self.executor.execute(step).await {
            Ok(output) if output.success() => {
                if !output.stdout.is_empty() {
                    debug!("{}", output.stdout);
                }
                Ok(())
            }
            Ok(output) => Err(FailureCause::Exit {
                status: output.status,
                stderr: output.stderr,
            }),
            Err(ExecError::Timeout { timeout, .. }) => Err(FailureCause::Timeout(timeout)),
            Err(error) => Err(FailureCause::Spawn(error.to_string())),
        }
    }
}

/// Plan stopped on a failing step.
#[derive(Debug, Clone, thiserror::Error)]
pub struct RunError {
    pub failure: StepFailure,
    pub rollback: Option<RollbackReport>,
}

impl RunError {
    /// Exit code to report for the failure.
    pub fn exit_code(&self) -> i32 {
        self.failure.exit_code()
    }
}

impl Display for RunError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}", self.failure)?;
        match &self.rollback {
            Some(rollback) => write!(fmt, "; {rollback}"),
            None => Ok(()),
        }
    }
}

/// Step execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Process ran past its time limit.
    #[error("step {label:?} timed out after {}s", timeout.as_secs())]
    Timeout { label: String, timeout: Duration },

    /// Process could not be spawned.
    #[error("failed to spawn {program:?}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = ExecError> = std::result::Result<T, E>;
