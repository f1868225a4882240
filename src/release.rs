// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release orchestration.
//!
//! A release moves a freshly built copy of the project onto every server and
//! then brings each site of the worker server in line with the new code. The
//! worker is the one server that touches databases, since all servers share
//! them.
//!
//! # Release Phases
//!
//! ```text
//! BUILT -> BACKED_UP? -> PUSHED -> INSTALLED_OR_UPDATED -> CONFIG_IMPORTED?
//!       -> CACHE_CLEARED -> MAINTENANCE_OFF -> DONE
//! ```
//!
//! A backup is only taken when every site is already installed. Taking it
//! sets the rollback checkpoint: if anything fails afterwards, the `current`
//! symlink is pointed back at the previous release and the backup is restored.
//!
//! Whether a site gets installed or updated and which drush dialect to speak
//! are decided while building the plan, so the plan itself is a fixed list of
//! steps. Planning only reads from servers. Checks that would change a site,
//! like whether its purge queue can be invalidated, run inside the optional
//! step that needs them.

pub mod exec;
pub mod plan;
pub mod poststep;

use crate::{
    backup::{self, BackupOptions},
    command::{quote, ShellCommand, Word},
    config::Properties,
    release::{
        exec::Executor,
        plan::{DeploymentPlan, ReleaseState, Step},
        poststep::Capabilities,
    },
    remote::RemoteSettings,
    site::{settings::ConfigIdentity, state::InstallationState, SiteAlias},
};

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// How to set up sites and which optional steps to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteOptions {
    pub profile: String,
    pub site_name: String,
    pub account_name: String,
    pub account_mail: String,
    pub account_pass: Option<String>,

    /// Install even sites that are already installed.
    pub force: bool,
    pub config_import: bool,

    /// Install from exported configuration.
    pub existing_config: bool,

    /// UUIDs to align before importing configuration, keyed by site uri.
    pub identities: BTreeMap<String, ConfigIdentity>,
}

impl Default for SiteOptions {
    fn default() -> Self {
        Self {
            profile: "standard".into(),
            site_name: "Drupal".into(),
            account_name: "admin".into(),
            account_mail: "admin@example.com".into(),
            account_pass: None,
            force: false,
            config_import: false,
            existing_config: false,
            identities: BTreeMap::new(),
        }
    }
}

/// Build release plans.
///
/// Holds the executor only to probe servers while planning. Running the plan
/// is left to [`PlanRunner`](exec::PlanRunner).
pub struct ReleaseOrchestrator<'a, E: Executor> {
    executor: &'a mut E,
    state: &'a mut InstallationState,
    properties: &'a Properties,
}

impl<'a, E: Executor> ReleaseOrchestrator<'a, E> {
    /// Construct new orchestrator.
    pub fn new(
        executor: &'a mut E,
        state: &'a mut InstallationState,
        properties: &'a Properties,
    ) -> Self {
        Self {
            executor,
            state,
            properties,
        }
    }

    /// Plan building the release archive `archive` locally.
    pub fn build(&self, archive: impl AsRef<Path>) -> DeploymentPlan {
        let mut plan = DeploymentPlan::new();
        plan.extend(build_steps(self.properties, archive.as_ref()));
        plan
    }

    /// Plan a full release of `archive` onto `targets`.
    ///
    /// The target at `worker` runs backups and every database operation.
    ///
    /// # Errors
    ///
    /// - Return [`ReleaseError::NoTargets`] if `targets` is empty.
    /// - Return [`ReleaseError::Worker`] if `worker` is out of range.
    #[instrument(skip(self, targets, archive, options), level = "debug")]
    pub async fn deploy(
        &mut self,
        targets: &[RemoteSettings],
        worker: usize,
        archive: impl AsRef<Path>,
        options: &SiteOptions,
    ) -> Result<DeploymentPlan> {
        if targets.is_empty() {
            return Err(ReleaseError::NoTargets);
        }
        let settings = targets.get(worker).ok_or(ReleaseError::Worker(worker))?;
        let archive = archive.as_ref();

        let mut plan = DeploymentPlan::new();
        plan.extend(build_steps(self.properties, archive));

        let capabilities =
            Capabilities::detect(&mut *self.executor, settings, options.config_import).await;
        if self.state.is_site_installed(&mut *self.executor, settings).await {
            info!("every site is installed, taking backup before release");
            plan.extend(backup::backup(settings, BackupOptions::both()));
            plan.mark_checkpoint();
            plan.register_rollback(
                "restore backup",
                backup::restore(settings, BackupOptions::both()),
            );
            plan.register_rollback(
                "switch back to previous release",
                targets.iter().map(revert_current_release).collect(),
            );
        } else {
            info!("not every site is installed, skipping backup");
        }

        for target in targets {
            plan.extend(push_steps(target, archive));
        }

        for alias in &settings.aliases {
            let installed = self
                .state
                .is_installed(&mut *self.executor, settings, alias)
                .await;
            if !installed || options.force {
                plan.extend(install_steps(settings, &capabilities, alias, options));
                self.state.set_installed(alias, true);
            } else {
                plan.extend(update_steps(settings, &capabilities, alias, options));
            }
        }

        plan.extend(cache_clear_steps(settings, &capabilities));
        for target in targets {
            plan.push(cleanup_releases(target));
            plan.push(backup::cleanup(target));
        }

        Ok(plan)
    }

    /// Plan installing every site of an already pushed release.
    ///
    /// Sites that are installed are left alone unless `options.force` is set.
    pub async fn install(
        &mut self,
        settings: &RemoteSettings,
        options: &SiteOptions,
    ) -> DeploymentPlan {
        let capabilities =
            Capabilities::detect(&mut *self.executor, settings, options.config_import).await;
        let mut plan = DeploymentPlan::new();
        for alias in &settings.aliases {
            plan.extend(install_steps(settings, &capabilities, alias, options));
            self.state.set_installed(alias, true);
        }
        plan.extend(cache_clear_steps(settings, &capabilities));

        plan
    }

    /// Plan updating every site of an already pushed release.
    pub async fn update(
        &mut self,
        settings: &RemoteSettings,
        options: &SiteOptions,
    ) -> DeploymentPlan {
        let capabilities =
            Capabilities::detect(&mut *self.executor, settings, options.config_import).await;
        let mut plan = DeploymentPlan::new();
        for alias in &settings.aliases {
            plan.extend(update_steps(settings, &capabilities, alias, options));
        }
        plan.extend(cache_clear_steps(settings, &capabilities));

        plan
    }

    /// Plan clearing caches of every site.
    pub async fn clear_cache(&mut self, settings: &RemoteSettings) -> DeploymentPlan {
        let capabilities = Capabilities::detect(&mut *self.executor, settings, false).await;
        let mut plan = DeploymentPlan::new();
        plan.extend(cache_clear_steps(settings, &capabilities));
        plan
    }

    /// Plan pointing `current` of every target back at the previous release.
    pub fn switch_previous_release(&self, targets: &[RemoteSettings]) -> DeploymentPlan {
        let mut plan = DeploymentPlan::new();
        for target in targets {
            let previous = format!(
                "$(ls -vdr {}/* | head -n2 | tail -n1)",
                quote(target.releasesdir.as_str())
            );
            plan.push(relink_current("switch to previous release", target, previous));
            plan.extend(poststep::opcache_reset(target));
        }

        plan
    }
}

/// Steps clearing caches of every site, then the opcode cache.
pub fn cache_clear_steps(settings: &RemoteSettings, capabilities: &Capabilities) -> Vec<Step> {
    let mut steps = Vec::new();
    for alias in &settings.aliases {
        steps.push(poststep::clear_cache(settings, capabilities, alias));
        steps.push(poststep::purge_invalidate(settings, capabilities, alias));
    }
    steps.extend(poststep::opcache_reset(settings));

    steps
}

/// Default release archive name for a run at `time`.
pub fn archive_name(time: i64) -> String {
    format!("{time}.tar.gz")
}

/// Steps running build commands and packing the project into `archive`.
pub fn build_steps(properties: &Properties, archive: &Path) -> Vec<Step> {
    let root = properties.project.root.clone();
    let mut steps = properties
        .build
        .commands
        .iter()
        .map(|command| {
            Step::local(
                format!("build: {command}"),
                Some(root.clone()),
                ShellCommand::raw(command.as_str()),
            )
            .timeout_secs(properties.timeouts.build)
            .phase(ReleaseState::Built)
        })
        .collect::<Vec<_>>();

    let mut tar = ShellCommand::new("tar").flag("czf").arg(absolute(archive));
    if let Some(name) = archive.file_name() {
        tar = tar.option("exclude", format!("./{}", name.to_string_lossy()));
    }
    for pattern in &properties.build.exclude {
        tar = tar.option("exclude", pattern);
    }
    let tar = tar.flag_value("C", root.to_string_lossy()).arg(".");

    steps.push(
        Step::local("pack release archive", None, tar)
            .timeout_secs(properties.timeouts.build)
            .phase(ReleaseState::Built),
    );

    steps
}

fn absolute(path: &Path) -> String {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| PathBuf::from(path))
    };

    path.to_string_lossy().into_owned()
}

/// Steps moving `archive` onto the server of `settings` and making it live.
pub fn push_steps(settings: &RemoteSettings, archive: &Path) -> Vec<Step> {
    let server = &settings.server;
    let name = archive
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| archive_name(settings.time));
    let rootdir = settings.rootdir.as_str();

    let mut steps = vec![
        Step::ssh(
            "create release directory",
            server,
            None,
            ShellCommand::new("mkdir").flag("p").arg(rootdir),
        ),
        Step::push(
            "upload release archive",
            server,
            archive,
            format!("{rootdir}/{name}"),
        )
        .timeout_secs(settings.timeouts.push),
        Step::ssh(
            "extract release archive",
            server,
            Some(rootdir),
            ShellCommand::new("tar")
                .flag("xzf")
                .arg(name.as_str())
                .and(ShellCommand::new("rm").arg(name.as_str())),
        )
        .timeout_secs(settings.timeouts.push),
    ];

    for symlink in &settings.symlinks {
        let command = ShellCommand::new("mkdir")
            .flag("p")
            .arg(symlink.target.as_str())
            .and(ShellCommand::new("rm").flag("rf").arg(symlink.link.as_str()))
            .and(
                ShellCommand::new("ln")
                    .flag("s")
                    .arg(symlink.target.as_str())
                    .arg(symlink.link.as_str()),
            );
        steps.push(Step::ssh(
            format!("link {}", symlink.link),
            server,
            None,
            command,
        ));
    }

    steps.push(Step::symlink(
        "switch current release",
        server,
        Word::literal(rootdir),
        settings.currentdir.as_str(),
    ));
    steps.extend(poststep::opcache_reset(settings));

    steps
        .into_iter()
        .map(|step| step.phase(ReleaseState::Pushed))
        .collect()
}

/// Step pointing `current` back at the newest release other than this run's.
pub fn revert_current_release(settings: &RemoteSettings) -> Step {
    let previous = format!(
        "$(ls -vd {}/* | grep -v {} | tail -n1)",
        quote(settings.releasesdir.as_str()),
        quote(format!("/{}$", settings.time))
    );

    relink_current("switch back to previous release", settings, previous)
}

// INVARIANT: Leave `current` alone when `listing` expands to nothing, i.e.,
// there is no release to go back to.
fn relink_current(label: &str, settings: &RemoteSettings, listing: String) -> Step {
    let command = ShellCommand::raw(format!("previous={listing}"))
        .and(ShellCommand::raw("[[ -n \"$previous\" ]]"))
        .and(
            ShellCommand::new("ln")
                .flag("sfn")
                .raw_arg("\"$previous\"")
                .arg(settings.currentdir.as_str()),
        );

    Step::ssh(label, &settings.server, None, command).phase(ReleaseState::RolledBack)
}

/// Step removing all but the newest `settings.keep_releases` releases.
pub fn cleanup_releases(settings: &RemoteSettings) -> Step {
    Step::ssh(
        "remove old releases",
        &settings.server,
        None,
        backup::prune(settings.releasesdir.as_str(), settings.keep_releases),
    )
    .allow_failure()
    .phase(ReleaseState::Done)
}

/// Steps installing the site of `alias`.
///
/// Unless forced, the install itself is skipped when the database already
/// has a `users` table.
pub fn install_steps(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
    options: &SiteOptions,
) -> Vec<Step> {
    let drush = capabilities.drush(alias);
    let mut site_install = drush
        .run("site-install")
        .arg(options.profile.as_str())
        .flag("y")
        .option("site-name", options.site_name.as_str())
        .option("account-name", options.account_name.as_str())
        .option("account-mail", options.account_mail.as_str());
    if let Some(pass) = &options.account_pass {
        site_install = site_install.option("account-pass", pass);
    }
    if let Some(folder) = &alias.folder {
        site_install = site_install.option("sites-subdir", folder);
    }
    if options.existing_config {
        site_install = site_install.switch("existing-config");
    }

    let install = site_install
        .and(drush.clear_drush_cache())
        .and(drush.maintenance_mode(true))
        .and(drush.cache_rebuild());
    let command = if options.force {
        install
    } else {
        ShellCommand::has_output(&drush.users_table()).or(install)
    };

    let web_root = settings.current_web_root();
    let site_dir = format!("{web_root}/sites/{}", alias.folder_or_default());
    let harden = ShellCommand::new("chmod")
        .arg("444")
        .arg(format!("{site_dir}/settings.php"))
        .and(ShellCommand::new("chmod").arg("555").arg(site_dir));

    let mut steps = vec![
        Step::ssh(
            format!("install {alias}"),
            &settings.server,
            Some(web_root.as_str()),
            command,
        )
        .timeout_secs(settings.timeouts.install)
        .phase(ReleaseState::InstalledOrUpdated),
        Step::ssh(
            format!("protect settings of {alias}"),
            &settings.server,
            None,
            harden,
        )
        .phase(ReleaseState::InstalledOrUpdated),
        poststep::locale_update(settings, capabilities, alias),
    ];

    if capabilities.supports_config_import {
        steps.push(poststep::config_import(
            settings,
            capabilities,
            alias,
            options.identities.get(alias.uri.as_str()),
        ));
        steps.push(poststep::varnish_check(settings, capabilities, alias));
    }
    steps.push(poststep::maintenance_mode(settings, capabilities, alias, false));

    steps
}

/// Steps updating the database of `alias` to the new code.
pub fn update_steps(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
    options: &SiteOptions,
) -> Vec<Step> {
    let drush = capabilities.drush(alias);
    let web_root = settings.current_web_root();

    // INVARIANT: Maintenance mode goes on through the release that is still
    // serving traffic, i.e., the second newest one.
    let previous = format!(
        "$(ls -vdr {}/* | head -n2 | tail -n1)/{}",
        quote(settings.releasesdir.as_str()),
        quote(settings.webdir.as_str())
    );
    let maintenance = ShellCommand::new("cd")
        .flag("P")
        .raw_arg(previous)
        .and(drush.maintenance_mode(true));

    let mut steps = vec![
        Step::ssh(
            format!("enable maintenance mode of {alias}"),
            &settings.server,
            None,
            maintenance,
        )
        .timeout_secs(settings.timeouts.cache_clear)
        .phase(ReleaseState::InstalledOrUpdated),
        Step::ssh(
            format!("update database of {alias}"),
            &settings.server,
            Some(web_root.as_str()),
            drush.rebuild_caches().and(drush.run("updb").flag("y")),
        )
        .timeout_secs(settings.timeouts.update)
        .phase(ReleaseState::InstalledOrUpdated),
    ];

    if capabilities.supports_config_import {
        steps.push(poststep::config_import(
            settings,
            capabilities,
            alias,
            options.identities.get(alias.uri.as_str()),
        ));
        steps.push(poststep::varnish_check(settings, capabilities, alias));
    }

    steps.push(poststep::clear_cache(settings, capabilities, alias));
    steps.push(poststep::locale_update(settings, capabilities, alias));
    steps.push(poststep::maintenance_mode(settings, capabilities, alias, false));

    steps
}

/// Release orchestration error types.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    /// No servers to release to.
    #[error("no target servers given")]
    NoTargets,

    /// Worker index out of range.
    #[error("worker server {0} is not one of the targets")]
    Worker(usize),
}

/// Friendly result alias :3
type Result<T, E = ReleaseError> = std::result::Result<T, E>;
