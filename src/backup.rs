// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Backup and restore coordination.
//!
//! Backups of a run live in `backupsdir/<time>/` on the server. The shared
//! files tree is archived once for the whole application, since every site
//! folder shares it, while databases are dumped once per site alias. Each
//! file is named after the run timestamp, so a restore only needs to know the
//! timestamp to find every file of a backup.
//!
//! # File Names
//!
//! - Files: `{time}_{date}.tar.gz`
//! - Default site database: `{time}_{date}.sql.gz`
//! - Multisite database: `{time}_{date}.{folder}.sql.gz`

use crate::{
    command::{quote, ShellCommand},
    drush::Drush,
    release::{
        exec::Executor,
        plan::{ReleaseState, Step},
    },
    remote::RemoteSettings,
    site::SiteAlias,
};

use std::path::Path;
use tracing::{debug, info, instrument};

/// Subdirectories of the shared files directory that get archived.
pub const FILE_BACKUP_SUBDIRS: [&str; 2] = ["public", "private"];

/// Patterns never archived from the shared files directory.
pub const FILE_BACKUP_EXCLUDES: [&str; 4] = ["php", "js/*", "css/*", "styles/*"];

/// What to back up or restore.
///
/// Asking for neither means both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupOptions {
    pub files: bool,
    pub data: bool,
}

impl BackupOptions {
    /// Construct new options, normalizing "neither" to "both".
    pub fn new(files: bool, data: bool) -> Self {
        if !files && !data {
            return Self::both();
        }

        Self { files, data }
    }

    /// Files and databases.
    pub fn both() -> Self {
        Self {
            files: true,
            data: true,
        }
    }
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self::both()
    }
}

/// File name of the files archive.
pub fn files_archive_name(settings: &RemoteSettings) -> String {
    settings.backup_file_name("", ".tar.gz")
}

/// File name `sql-dump` is told to write for `alias`.
pub fn database_dump_name(settings: &RemoteSettings, alias: &SiteAlias) -> String {
    settings.backup_file_name(alias.file_suffix().as_str(), ".sql")
}

/// File name of the compressed database dump of `alias`.
pub fn database_archive_name(settings: &RemoteSettings, alias: &SiteAlias) -> String {
    settings.backup_file_name(alias.file_suffix().as_str(), ".sql.gz")
}

/// Every file a backup with `options` consists of.
pub fn backup_file_names(settings: &RemoteSettings, options: BackupOptions) -> Vec<String> {
    let mut names = Vec::new();
    if options.files {
        names.push(files_archive_name(settings));
    }
    if options.data {
        names.extend(
            settings
                .aliases
                .iter()
                .map(|alias| database_archive_name(settings, alias)),
        );
    }

    names
}

// INVARIANT: Sites other than default may not be set up on every server yet,
// so only touch their database when their settings file exists.
fn guard_site(settings: &RemoteSettings, alias: &SiteAlias, command: ShellCommand) -> ShellCommand {
    if alias.is_default() {
        return command;
    }

    ShellCommand::file_missing(settings.settings_file(alias)).or(command)
}

fn web_drush(alias: &SiteAlias) -> Drush {
    Drush::from_web_root().site(alias)
}

/// Steps taking a backup on the server of `settings`.
pub fn backup(settings: &RemoteSettings, options: BackupOptions) -> Vec<Step> {
    let dir = settings.backup_dir();
    let mut steps = vec![Step::ssh(
        "create backup directory",
        &settings.server,
        None,
        ShellCommand::new("mkdir").flag("p").arg(dir.as_str()),
    )
    .phase(ReleaseState::BackedUp)];

    if options.files {
        let archive = format!("{dir}/{}", files_archive_name(settings));
        let mut command = ShellCommand::new("tar").flag("czf").arg(archive);
        for pattern in FILE_BACKUP_EXCLUDES {
            command = command.option("exclude", pattern);
        }
        let command = command
            .switch("ignore-failed-read")
            .flag_value("C", settings.filesdir.as_str())
            .args(FILE_BACKUP_SUBDIRS);

        steps.push(
            Step::ssh("back up files", &settings.server, None, command)
                .timeout_secs(settings.timeouts.backup_files)
                .phase(ReleaseState::BackedUp),
        );
    }

    if options.data {
        for alias in &settings.aliases {
            let dump = format!("{dir}/{}", database_dump_name(settings, alias));
            let command = web_drush(alias)
                .run("sql-dump")
                .switch("gzip")
                .option("result-file", dump);

            steps.push(
                Step::ssh(
                    format!("back up database of {alias}"),
                    &settings.server,
                    Some(settings.current_web_root().as_str()),
                    guard_site(settings, alias, command),
                )
                .timeout_secs(settings.timeouts.backup_database)
                .phase(ReleaseState::BackedUp),
            );
        }
    }

    steps
}

/// Steps restoring the backup of `settings.time`.
pub fn restore(settings: &RemoteSettings, options: BackupOptions) -> Vec<Step> {
    let dir = settings.backup_dir();
    let mut steps = Vec::new();

    if options.files {
        let archive = format!("{dir}/{}", files_archive_name(settings));
        let clear = FILE_BACKUP_SUBDIRS
            .iter()
            .map(|subdir| format!("{}/*", quote(format!("{}/{subdir}", settings.filesdir))))
            .collect::<Vec<_>>()
            .join(" ");
        let command = ShellCommand::new("mkdir")
            .flag("p")
            .arg(settings.filesdir.as_str())
            .and(ShellCommand::new("rm").flag("rf").raw_arg(clear))
            .and(
                ShellCommand::new("tar")
                    .flag("xzf")
                    .arg(archive)
                    .flag_value("C", settings.filesdir.as_str()),
            );

        steps.push(
            Step::ssh("restore files", &settings.server, None, command)
                .timeout_secs(settings.timeouts.restore_files),
        );
    }

    if options.data {
        let web_root = settings.current_web_root();
        for alias in &settings.aliases {
            let drush = web_drush(alias);
            let drop = drush.run("sql-drop").flag("y");
            steps.push(
                Step::ssh(
                    format!("drop database of {alias}"),
                    &settings.server,
                    Some(web_root.as_str()),
                    guard_site(settings, alias, drop),
                )
                .timeout_secs(settings.timeouts.pre_restore),
            );

            let dump = format!("{dir}/{}", database_archive_name(settings, alias));
            let import = ShellCommand::new("zcat")
                .arg(dump)
                .pipe(drush.run("sql-cli"));
            steps.push(
                Step::ssh(
                    format!("restore database of {alias}"),
                    &settings.server,
                    Some(web_root.as_str()),
                    guard_site(settings, alias, ShellCommand::group(import)),
                )
                .timeout_secs(settings.timeouts.restore_database),
            );
        }
    }

    steps
}

/// Step removing the backup directory of `settings.time`.
pub fn remove(settings: &RemoteSettings) -> Step {
    Step::ssh(
        "remove backup",
        &settings.server,
        None,
        ShellCommand::new("rm").flag("rf").arg(settings.backup_dir()),
    )
    .allow_failure()
}

/// Steps copying the backup of `settings.time` into `local_dir`.
pub fn download(
    settings: &RemoteSettings,
    local_dir: impl AsRef<Path>,
    options: BackupOptions,
) -> Vec<Step> {
    let dir = settings.backup_dir();
    backup_file_names(settings, options)
        .into_iter()
        .map(|name| {
            Step::pull(
                format!("download {name}"),
                &settings.server,
                format!("{dir}/{name}"),
                local_dir.as_ref().join(name.as_str()),
            )
            .timeout_secs(settings.timeouts.push)
        })
        .collect()
}

/// Steps copying a backup from `local_dir` to the backup directory of
/// `settings.time`.
pub fn upload(
    settings: &RemoteSettings,
    local_dir: impl AsRef<Path>,
    options: BackupOptions,
) -> Vec<Step> {
    let dir = settings.backup_dir();
    let mut steps = vec![Step::ssh(
        "create backup directory",
        &settings.server,
        None,
        ShellCommand::new("mkdir").flag("p").arg(dir.as_str()),
    )];

    steps.extend(backup_file_names(settings, options).into_iter().map(|name| {
        Step::push(
            format!("upload {name}"),
            &settings.server,
            local_dir.as_ref().join(name.as_str()),
            format!("{dir}/{name}"),
        )
        .timeout_secs(settings.timeouts.push)
    }));

    steps
}

/// Step removing all but the newest `settings.keep_backups` backups.
pub fn cleanup(settings: &RemoteSettings) -> Step {
    Step::ssh(
        "remove old backups",
        &settings.server,
        None,
        prune(settings.backupsdir.as_str(), settings.keep_backups),
    )
    .allow_failure()
    .phase(ReleaseState::Done)
}

/// Remove all but the newest `keep` entries of `dir`, newest by version sort.
pub fn prune(dir: &str, keep: usize) -> ShellCommand {
    ShellCommand::raw(format!(
        "for entry in $(ls -vd {}/* | head -n -{keep}); do chmod -R u+w \"$entry\"; rm -rf \"$entry\"; done",
        quote(dir)
    ))
}

/// Find timestamp of the newest backup on the server of `settings`.
///
/// # Errors
///
/// - Return [`BackupError::Probe`] if the backup directory cannot be listed.
/// - Return [`BackupError::NoBackups`] if there are no backups.
#[instrument(skip(executor, settings), level = "debug")]
pub async fn latest_backup<E: Executor>(executor: &mut E, settings: &RemoteSettings) -> Result<i64> {
    let command = ShellCommand::new("ls")
        .flag("1")
        .arg(settings.backupsdir.as_str())
        .pipe("sort")
        .flag("n")
        .pipe("tail")
        .flag_value("n", "1");
    let step = Step::ssh("find latest backup", &settings.server, None, command)
        .timeout_secs(settings.timeouts.probe);

    let output = executor
        .execute(&step)
        .await
        .map_err(|error| BackupError::Probe(error.to_string()))?;
    if !output.success() {
        return Err(BackupError::Probe(output.stderr));
    }

    let name = output.stdout.trim();
    debug!("latest backup entry {name:?}");
    let time = name
        .parse::<i64>()
        .map_err(|_| BackupError::NoBackups(settings.backupsdir.clone()))?;
    info!("using backup {time}");

    Ok(time)
}

/// Backup error types.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Backup directory cannot be listed.
    #[error("failed to look up backups: {0}")]
    Probe(String),

    /// No backup found.
    #[error("no backups found in {0}")]
    NoBackups(String),
}

/// Friendly result alias :3
type Result<T, E = BackupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{AliasEntry, Properties},
        release::plan::Action,
        remote::Server,
    };
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn settings(aliases: &[(&str, &str)]) -> anyhow::Result<RemoteSettings> {
        let mut properties = Properties::default();
        properties.remote.appdir = "/srv/shop".into();
        properties.remote.aliases = aliases
            .iter()
            .map(|(uri, folder)| AliasEntry {
                uri: uri.to_string(),
                folder: folder.to_string(),
            })
            .collect();

        Ok(RemoteSettings::resolve(
            &properties,
            Server::new("web1", "deploy", "/keys/id"),
            &["web1".into()],
            "shop",
            1_700_000_000,
            &[],
        )?)
    }

    fn script(step: &Step) -> String {
        match &step.action {
            Action::SshExec { command, .. } => command.to_string(),
            action => action.to_string(),
        }
    }

    #[test_case(false, false, BackupOptions::both(); "neither means both")]
    #[test_case(true, false, BackupOptions { files: true, data: false }; "files only")]
    #[test_case(false, true, BackupOptions { files: false, data: true }; "data only")]
    #[test]
    fn normalize_options(files: bool, data: bool, expect: BackupOptions) {
        pretty_assertions::assert_eq!(BackupOptions::new(files, data), expect);
    }

    #[test]
    fn backup_dumps_each_alias_and_files_once() -> anyhow::Result<()> {
        let settings = settings(&[("a.com", "a"), ("b.com", "b")])?;
        let steps = backup(&settings, BackupOptions::both());
        let labels = steps.iter().map(|step| step.label.as_str()).collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![
                "create backup directory",
                "back up files",
                "back up database of a.com (a)",
                "back up database of b.com (b)",
            ]
        );
        assert_eq!(
            script(&steps[2]),
            "[[ ! -f /srv/shop/current/web/sites/a/settings.php ]] || ../vendor/bin/drush \
             --uri=a.com sql-dump --gzip \
             --result-file=/srv/shop/backups/1700000000/1700000000_2023_11_14_22_13_20.a.sql"
        );
        assert_eq!(
            script(&steps[1]),
            "tar -czf /srv/shop/backups/1700000000/1700000000_2023_11_14_22_13_20.tar.gz \
             --exclude=php --exclude='js/*' --exclude='css/*' --exclude='styles/*' \
             --ignore-failed-read -C /srv/shop/files public private"
        );

        Ok(())
    }

    #[test]
    fn default_site_backup_is_unguarded() -> anyhow::Result<()> {
        let settings = settings(&[])?;
        let steps = backup(&settings, BackupOptions::new(false, true));
        assert_eq!(steps.len(), 2);
        assert!(script(&steps[1]).starts_with("../vendor/bin/drush sql-dump --gzip"));

        Ok(())
    }

    #[test]
    fn restore_drops_before_importing_each_alias() -> anyhow::Result<()> {
        let settings = settings(&[("a.com", "a")])?;
        let steps = restore(&settings, BackupOptions::new(false, true));
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].timeout.as_secs(), 60);
        assert_eq!(
            script(&steps[1]),
            "[[ ! -f /srv/shop/current/web/sites/a/settings.php ]] || { zcat \
             /srv/shop/backups/1700000000/1700000000_2023_11_14_22_13_20.a.sql.gz | \
             ../vendor/bin/drush --uri=a.com sql-cli; }"
        );

        Ok(())
    }

    #[test]
    fn restore_reads_names_backup_wrote() -> anyhow::Result<()> {
        let settings = settings(&[("a.com", "a"), ("b.com", "b")])?;
        let names = backup_file_names(&settings, BackupOptions::both());
        let restore = restore(&settings, BackupOptions::both())
            .iter()
            .map(script)
            .collect::<Vec<_>>()
            .join("\n");
        for name in names {
            assert!(restore.contains(name.as_str()), "{name} is never restored");
        }

        Ok(())
    }

    #[test]
    fn download_pulls_every_backup_file() -> anyhow::Result<()> {
        let settings = settings(&[])?;
        let steps = download(&settings, "/tmp/backups", BackupOptions::both());
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[1].action,
            Action::PullArchive {
                server: settings.server.clone(),
                remote: "/srv/shop/backups/1700000000/1700000000_2023_11_14_22_13_20.sql.gz"
                    .into(),
                local: "/tmp/backups/1700000000_2023_11_14_22_13_20.sql.gz".into(),
            }
        );

        Ok(())
    }

    #[test]
    fn prune_keeps_newest_entries() {
        assert_eq!(
            prune("/srv/shop/releases", 3).to_string(),
            "for entry in $(ls -vd /srv/shop/releases/* | head -n -3); do chmod -R u+w \
             \"$entry\"; rm -rf \"$entry\"; done"
        );
    }
}
