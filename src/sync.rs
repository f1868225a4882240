// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Site synchronization.
//!
//! Copy the files and databases of one environment onto another by taking a
//! backup on the source, carrying it over through the local machine, and
//! restoring it on the destination. The destination may also be the local
//! development copy of the project.
//!
//! Both sides must be resolved for the same run timestamp, so the backup
//! files keep their names on the way over.

use crate::{
    backup::{self, BackupOptions},
    command::ShellCommand,
    config::Properties,
    drush::Drush,
    release::plan::{DeploymentPlan, Step},
    remote::RemoteSettings,
};

use std::path::{Path, PathBuf};

/// Plan copying `source` onto `destination` through `workdir`.
///
/// # Errors
///
/// - Return [`SyncError::TimeMismatch`] if both sides were resolved for
///   different run timestamps.
pub fn sync(
    source: &RemoteSettings,
    destination: &RemoteSettings,
    workdir: impl AsRef<Path>,
    options: BackupOptions,
) -> Result<DeploymentPlan> {
    if source.time != destination.time {
        return Err(SyncError::TimeMismatch {
            from: source.time,
            to: destination.time,
        });
    }

    let workdir = workdir.as_ref();
    let mut plan = DeploymentPlan::new();
    plan.push(local_mkdir(workdir));
    plan.extend(backup::backup(source, options));
    plan.extend(backup::download(source, workdir, options));
    plan.extend(backup::upload(destination, workdir, options));
    plan.extend(backup::restore(destination, options));
    plan.push(backup::remove(source));
    plan.push(backup::remove(destination));
    plan.push(local_remove(workdir));

    Ok(plan)
}

/// Local project a sync restores into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    /// Project root containing `vendor/`.
    pub root: PathBuf,

    /// Web root relative to project root.
    pub web: String,

    /// Directory receiving the `files` tree.
    pub filesdir: PathBuf,
}

impl LocalTarget {
    /// Local target described by `properties`.
    pub fn from_properties(properties: &Properties) -> Self {
        let filesdir = if properties.local.filesdir.is_absolute() {
            properties.local.filesdir.clone()
        } else {
            properties.project.root.join(&properties.local.filesdir)
        };

        Self {
            root: properties.project.root.clone(),
            web: properties.project.web.clone(),
            filesdir,
        }
    }
}

/// Plan copying `source` onto the local project through `workdir`.
///
/// Files are unpacked into the local files directory and rearranged into the
/// `files` and `files/private` layout of a development copy.
pub fn sync_local(
    source: &RemoteSettings,
    local: &LocalTarget,
    workdir: impl AsRef<Path>,
    options: BackupOptions,
) -> DeploymentPlan {
    let workdir = workdir.as_ref();
    let mut plan = DeploymentPlan::new();
    plan.push(local_mkdir(workdir));
    plan.extend(backup::backup(source, options));
    plan.extend(backup::download(source, workdir, options));

    if options.data {
        for alias in &source.aliases {
            let drush = Drush::from_project_root(local.web.as_str()).site(alias);
            let dump = workdir.join(backup::database_archive_name(source, alias));
            plan.push(Step::local(
                format!("drop local database of {alias}"),
                Some(local.root.clone()),
                drush.run("sql-drop").flag("y"),
            ));
            plan.push(Step::local(
                format!("restore local database of {alias}"),
                Some(local.root.clone()),
                ShellCommand::new("zcat")
                    .arg(dump.to_string_lossy())
                    .pipe(drush.run("sql-cli")),
            ));
        }
    }

    if options.files {
        let filesdir = local.filesdir.to_string_lossy().into_owned();
        let archive = workdir.join(backup::files_archive_name(source));
        let files = format!("{filesdir}/files");
        let command = ShellCommand::new("mkdir")
            .flag("p")
            .arg(filesdir.as_str())
            .and(
                ShellCommand::new("tar")
                    .flag("xzf")
                    .arg(archive.to_string_lossy())
                    .flag_value("C", filesdir.as_str()),
            )
            .and(ShellCommand::new("rm").flag("rf").arg(files.as_str()))
            .and(
                ShellCommand::new("mv")
                    .arg(format!("{filesdir}/public"))
                    .arg(files.as_str()),
            )
            .and(
                ShellCommand::new("mv")
                    .arg(format!("{filesdir}/private"))
                    .arg(format!("{files}/private")),
            );
        plan.push(Step::local("restore local files", None, command));
    }

    plan.push(backup::remove(source));
    plan.push(local_remove(workdir));

    plan
}

fn local_mkdir(dir: &Path) -> Step {
    Step::local(
        "create local scratch directory",
        None,
        ShellCommand::new("mkdir")
            .flag("p")
            .arg(dir.to_string_lossy()),
    )
}

fn local_remove(dir: &Path) -> Step {
    Step::local(
        "remove local scratch directory",
        None,
        ShellCommand::new("rm").flag("rf").arg(dir.to_string_lossy()),
    )
    .allow_failure()
}

/// Sync error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Source and destination were resolved for different runs.
    #[error("source time {from} does not match destination time {to}")]
    TimeMismatch { from: i64, to: i64 },
}

/// Friendly result alias :3
type Result<T, E = SyncError> = std::result::Result<T, E>;
