// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deployment plans.
//!
//! A plan is an ordered list of steps computed up front, plus the rollback
//! actions to apply if a step past the checkpoint fails. Plans are plain data,
//! so they can be printed for a dry run, inspected by tests, or handed to a
//! [`PlanRunner`](crate::release::exec::PlanRunner) for execution.

use crate::{
    command::{quote, ShellCommand, Word},
    remote::Server,
};

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
    time::Duration,
};

/// Phase of a release a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Built,
    BackedUp,
    Pushed,
    InstalledOrUpdated,
    ConfigImported,
    CacheCleared,
    MaintenanceOff,
    Done,
    RolledBack,
}

impl Display for ReleaseState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Built => "built",
            Self::BackedUp => "backed up",
            Self::Pushed => "pushed",
            Self::InstalledOrUpdated => "installed or updated",
            Self::ConfigImported => "config imported",
            Self::CacheCleared => "cache cleared",
            Self::MaintenanceOff => "maintenance off",
            Self::Done => "done",
            Self::RolledBack => "rolled back",
        };
        fmt.write_str(name)
    }
}

/// What a step does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run shell command on server, optionally from inside `dir`.
    SshExec {
        server: Server,
        dir: Option<String>,
        command: ShellCommand,
    },

    /// Run shell command on local machine, optionally from inside `dir`.
    LocalExec {
        dir: Option<PathBuf>,
        command: ShellCommand,
    },

    /// Copy local file to server.
    PushArchive {
        server: Server,
        local: PathBuf,
        remote: String,
    },

    /// Copy file from server to local machine.
    PullArchive {
        server: Server,
        remote: String,
        local: PathBuf,
    },

    /// Atomically point symlink `link` at `target` on server.
    SymlinkSwitch {
        server: Server,
        target: Word,
        link: String,
    },
}

impl Action {
    /// Server the action talks to, if any.
    pub fn server(&self) -> Option<&Server> {
        match self {
            Self::SshExec { server, .. }
            | Self::PushArchive { server, .. }
            | Self::PullArchive { server, .. }
            | Self::SymlinkSwitch { server, .. } => Some(server),
            Self::LocalExec { .. } => None,
        }
    }

    /// Program and arguments that carry out the action.
    pub fn invocation(&self) -> (String, Vec<String>) {
        match self {
            Self::SshExec {
                server,
                dir,
                command,
            } => ("ssh".into(), ssh_args(server, script(dir.as_deref(), command))),
            Self::SymlinkSwitch {
                server,
                target,
                link,
            } => (
                "ssh".into(),
                ssh_args(server, format!("ln -sfn {target} {}", quote(link))),
            ),
            Self::LocalExec { dir, command } => {
                let dir = dir.as_ref().map(|dir| dir.to_string_lossy().into_owned());
                ("sh".into(), vec!["-c".into(), script(dir.as_deref(), command)])
            }
            Self::PushArchive {
                server,
                local,
                remote,
            } => {
                let mut args = transport_options(server);
                args.push(local.to_string_lossy().into_owned());
                args.push(format!("{}:{remote}", server.destination()));
                ("scp".into(), args)
            }
            Self::PullArchive {
                server,
                remote,
                local,
            } => {
                let mut args = transport_options(server);
                args.push(format!("{}:{remote}", server.destination()));
                args.push(local.to_string_lossy().into_owned());
                ("scp".into(), args)
            }
        }
    }
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::SshExec {
                server,
                dir,
                command,
            } => write!(fmt, "{server}: {}", script(dir.as_deref(), command)),
            Self::SymlinkSwitch {
                server,
                target,
                link,
            } => write!(fmt, "{server}: ln -sfn {target} {}", quote(link)),
            Self::LocalExec { dir, command } => {
                let dir = dir.as_ref().map(|dir| dir.to_string_lossy().into_owned());
                write!(fmt, "local: {}", script(dir.as_deref(), command))
            }
            Self::PushArchive {
                server,
                local,
                remote,
            } => write!(fmt, "scp {} {server}:{remote}", local.display()),
            Self::PullArchive {
                server,
                remote,
                local,
            } => write!(fmt, "scp {server}:{remote} {}", local.display()),
        }
    }
}

fn script(dir: Option<&str>, command: &ShellCommand) -> String {
    match dir {
        Some(dir) => format!("cd -P {} && {command}", quote(dir)),
        None => command.to_string(),
    }
}

fn transport_options(server: &Server) -> Vec<String> {
    vec![
        "-i".into(),
        server.private_key.to_string_lossy().into_owned(),
        "-o".into(),
        "BatchMode=yes".into(),
    ]
}

fn ssh_args(server: &Server, script: String) -> Vec<String> {
    let mut args = transport_options(server);
    args.push(server.destination());
    args.push(script);
    args
}

/// Single unit of work in a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub label: String,
    pub action: Action,
    pub timeout: Duration,

    /// Failure is logged and the plan moves on.
    pub allow_failure: bool,
    pub phase: Option<ReleaseState>,
}

impl Step {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Construct new step performing `action`.
    pub fn new(label: impl Into<String>, action: Action) -> Self {
        Self {
            label: label.into(),
            action,
            timeout: Self::DEFAULT_TIMEOUT,
            allow_failure: false,
            phase: None,
        }
    }

    /// Run `command` on `server` from inside `dir`.
    pub fn ssh(
        label: impl Into<String>,
        server: &Server,
        dir: Option<&str>,
        command: ShellCommand,
    ) -> Self {
        Self::new(
            label,
            Action::SshExec {
                server: server.clone(),
                dir: dir.map(ToString::to_string),
                command,
            },
        )
    }

    /// Run `command` locally from inside `dir`.
    pub fn local(label: impl Into<String>, dir: Option<PathBuf>, command: ShellCommand) -> Self {
        Self::new(label, Action::LocalExec { dir, command })
    }

    /// Copy `local` file to `remote` path on `server`.
    pub fn push(
        label: impl Into<String>,
        server: &Server,
        local: impl Into<PathBuf>,
        remote: impl Into<String>,
    ) -> Self {
        Self::new(
            label,
            Action::PushArchive {
                server: server.clone(),
                local: local.into(),
                remote: remote.into(),
            },
        )
    }

    /// Copy `remote` file on `server` to `local` path.
    pub fn pull(
        label: impl Into<String>,
        server: &Server,
        remote: impl Into<String>,
        local: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            label,
            Action::PullArchive {
                server: server.clone(),
                remote: remote.into(),
                local: local.into(),
            },
        )
    }

    /// Point `link` at `target` on `server`.
    pub fn symlink(
        label: impl Into<String>,
        server: &Server,
        target: Word,
        link: impl Into<String>,
    ) -> Self {
        Self::new(
            label,
            Action::SymlinkSwitch {
                server: server.clone(),
                target,
                link: link.into(),
            },
        )
    }

    /// Set time limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set time limit in seconds.
    pub fn timeout_secs(self, secs: u64) -> Self {
        self.timeout(Duration::from_secs(secs))
    }

    /// Tolerate failure of this step.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    /// Tag step with release phase.
    pub fn phase(mut self, phase: ReleaseState) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Host the step runs against, `local` for local steps.
    pub fn host(&self) -> String {
        self.action
            .server()
            .map(|server| server.host.clone())
            .unwrap_or_else(|| "local".into())
    }
}

impl Display for Step {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "[{}] {}", self.label, self.action)?;
        if self.allow_failure {
            fmt.write_str(" (may fail)")?;
        }
        Ok(())
    }
}

/// Named group of steps undoing part of a release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackAction {
    pub label: String,
    pub steps: Vec<Step>,
}

/// Ordered steps with rollback checkpoint.
///
/// # Invariants
///
/// - Rollback actions run in reverse registration order, the steps inside one
///   action in their given order.
/// - Rollback only applies to failures at or after the checkpoint.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    steps: Vec<Step>,
    rollback: Vec<RollbackAction>,
    checkpoint: Option<usize>,
}

impl DeploymentPlan {
    /// Construct new empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append step.
    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    /// Append steps.
    pub fn extend(&mut self, steps: impl IntoIterator<Item = Step>) {
        self.steps.extend(steps);
    }

    /// Mark every step appended from now on as covered by rollback.
    pub fn mark_checkpoint(&mut self) {
        self.checkpoint = Some(self.steps.len());
    }

    /// Register rollback action.
    pub fn register_rollback(&mut self, label: impl Into<String>, steps: Vec<Step>) {
        self.rollback.push(RollbackAction {
            label: label.into(),
            steps,
        });
    }

    /// Steps in execution order.
    pub fn steps(&self) -> &[Step] {
        self.steps.as_slice()
    }

    /// Rollback actions in registration order.
    pub fn rollback(&self) -> &[RollbackAction] {
        self.rollback.as_slice()
    }

    /// Index of first step covered by rollback.
    pub fn checkpoint(&self) -> Option<usize> {
        self.checkpoint
    }

    /// Check if failure of step at `index` triggers rollback.
    pub fn covers(&self, index: usize) -> bool {
        self.checkpoint.is_some_and(|checkpoint| index >= checkpoint)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

impl Display for DeploymentPlan {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for (index, step) in self.steps.iter().enumerate() {
            if self.checkpoint == Some(index) {
                writeln!(fmt, "-- checkpoint --")?;
            }
            writeln!(fmt, "{:>3}. {step}", index + 1)?;
        }

        for action in self.rollback.iter().rev() {
            writeln!(fmt, "rollback: {}", action.label)?;
            for step in &action.steps {
                writeln!(fmt, "     {step}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn server() -> Server {
        Server::new("web1.example.com", "deploy", "/keys/id_ed25519")
    }

    #[test]
    fn ssh_invocation_changes_directory_first() {
        let step = Step::ssh(
            "clear cache",
            &server(),
            Some("/srv/app/current/web"),
            ShellCommand::new("../vendor/bin/drush").arg("cr"),
        );
        let (program, args) = step.action.invocation();
        assert_eq!(program, "ssh");
        assert_eq!(
            args,
            vec![
                "-i",
                "/keys/id_ed25519",
                "-o",
                "BatchMode=yes",
                "deploy@web1.example.com",
                "cd -P /srv/app/current/web && ../vendor/bin/drush cr",
            ]
        );
    }

    #[test]
    fn scp_invocations() {
        let push = Step::push("push", &server(), "/tmp/1.tar.gz", "/srv/releases/1/1.tar.gz");
        let (_, args) = push.action.invocation();
        assert_eq!(
            args[4..],
            ["/tmp/1.tar.gz", "deploy@web1.example.com:/srv/releases/1/1.tar.gz"]
        );

        let pull = Step::pull("pull", &server(), "/srv/backups/1/a.sql.gz", "/tmp/a.sql.gz");
        let (_, args) = pull.action.invocation();
        assert_eq!(
            args[4..],
            ["deploy@web1.example.com:/srv/backups/1/a.sql.gz", "/tmp/a.sql.gz"]
        );
    }

    #[test]
    fn symlink_switch_keeps_expansions_unquoted() {
        let step = Step::symlink(
            "switch",
            &server(),
            Word::expansion("$(ls -vd /srv/releases/* | tail -n1)"),
            "/srv/current",
        );
        assert_eq!(
            step.action.to_string(),
            "web1.example.com: ln -sfn $(ls -vd /srv/releases/* | tail -n1) /srv/current"
        );
    }

    #[test]
    fn checkpoint_covers_later_steps_only() {
        let mut plan = DeploymentPlan::new();
        plan.push(Step::local("build", None, ShellCommand::new("true")));
        plan.push(Step::local("backup", None, ShellCommand::new("true")));
        plan.mark_checkpoint();
        plan.push(Step::local("push", None, ShellCommand::new("true")));

        assert!(!plan.covers(0));
        assert!(!plan.covers(1));
        assert!(plan.covers(2));
        assert_eq!(plan.len(), 3);
    }
}
