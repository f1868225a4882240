// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Post-install and post-update steps.
//!
//! Steps that run against a site once its code and database are in place:
//! configuration import, the reverse proxy cache sanity check, translation
//! updates, and cache invalidation. All of them run from the web root of the
//! live release.

use crate::{
    command::ShellCommand,
    drush::{Dialect, Drush},
    release::{
        exec::Executor,
        plan::{ReleaseState, Step},
    },
    remote::RemoteSettings,
    site::{settings::ConfigIdentity, SiteAlias},
};

use tracing::{instrument, warn};

/// What the target site and its tooling support.
///
/// Resolved once per run.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub supports_multisite: bool,
    pub supports_config_import: bool,
    pub dialect: Dialect,
}

impl Capabilities {
    /// Detect capabilities through the worker server of `settings`.
    ///
    /// Config import is only supported when requested through
    /// `config_import`. Failure to detect the drush version falls back to the
    /// modern dialect.
    #[instrument(skip(executor, settings), level = "debug")]
    pub async fn detect<E: Executor>(
        executor: &mut E,
        settings: &RemoteSettings,
        config_import: bool,
    ) -> Self {
        let step = Step::ssh(
            "detect drush version",
            &settings.server,
            Some(settings.current_web_root().as_str()),
            Drush::from_web_root().version(),
        )
        .timeout_secs(settings.timeouts.probe);

        let dialect = match executor.execute(&step).await {
            Ok(output) if output.success() => Dialect::from_version_output(&output.stdout),
            Ok(output) => {
                warn!("drush version exited with {}, assuming drush 9+", output.status);
                Dialect::Modern
            }
            Err(error) => {
                warn!("cannot detect drush version, assuming drush 9+: {error}");
                Dialect::Modern
            }
        };

        Self {
            supports_multisite: settings.aliases.iter().any(|alias| !alias.is_default()),
            supports_config_import: config_import,
            dialect,
        }
    }

    /// Drush scoped to `alias` when running a multisite install.
    pub fn drush(&self, alias: &SiteAlias) -> Drush {
        let drush = Drush::from_web_root();
        if self.supports_multisite {
            drush.site(alias)
        } else {
            drush
        }
    }
}

fn web_step(settings: &RemoteSettings, label: String, command: ShellCommand) -> Step {
    Step::ssh(
        label,
        &settings.server,
        Some(settings.current_web_root().as_str()),
        command,
    )
}

/// Import configuration into the site of `alias`.
///
/// Aligns the site UUID and the UUID of every exported language first, so
/// configuration exported from another install is accepted. A language the
/// site lacks is reported and skipped.
pub fn config_import(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
    identity: Option<&ConfigIdentity>,
) -> Step {
    let drush = capabilities.drush(alias);
    let mut alignment = Vec::new();
    if let Some(identity) = identity {
        if let Some(uuid) = &identity.site_uuid {
            alignment.push(
                drush
                    .run("cset")
                    .arg("system.site")
                    .arg("uuid")
                    .arg(uuid)
                    .flag("y"),
            );
        }
        for (langcode, uuid) in &identity.languages {
            let cset = drush
                .run("cset")
                .arg(format!("language.entity.{langcode}"))
                .arg("uuid")
                .arg(uuid)
                .flag("y");
            let report = ShellCommand::new("echo")
                .arg(format!("Could not update uuid of language \"{langcode}\""));
            alignment.push(ShellCommand::group(cset.or(report)));
        }
    }

    let mut alignment = alignment.into_iter();
    let command = match alignment.next() {
        Some(first) => alignment
            .fold(first, |command, next| command.and(next))
            .and(drush.cache_rebuild()),
        None => drush.cache_rebuild(),
    };
    let command = command
        .and(drush.clear_drush_cache())
        .and(drush.run("cim").flag("y"));

    web_step(settings, format!("import configuration of {alias}"), command)
        .timeout_secs(settings.timeouts.update)
        .phase(ReleaseState::ConfigImported)
}

/// Refuse a release where a reverse proxy cache module and the internal page
/// cache are enabled together.
pub fn varnish_check(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
) -> Step {
    let command = capabilities.drush(alias).varnish_check(capabilities.dialect);
    web_step(settings, format!("check page cache modules of {alias}"), command)
        .timeout_secs(settings.timeouts.cache_clear)
        .phase(ReleaseState::ConfigImported)
}

/// Update interface translations when the locale module is enabled.
pub fn locale_update(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
) -> Step {
    let mut drush = Drush::from_project_root(settings.webdir.as_str());
    if capabilities.supports_multisite {
        drush = drush.site(alias);
    }

    let update = drush
        .module_enabled("locale", capabilities.dialect)
        .and(drush.run("locale-check"))
        .and(drush.run("locale-update"));
    let command = ShellCommand::group(update).or(ShellCommand::new("echo").arg(
        "Locale module not found, translations will not be imported.",
    ));

    Step::ssh(
        format!("update translations of {alias}"),
        &settings.server,
        Some(settings.currentdir.as_str()),
        command,
    )
    .timeout_secs(settings.timeouts.update)
    .allow_failure()
    .phase(ReleaseState::InstalledOrUpdated)
}

/// Rebuild caches of `alias`.
pub fn clear_cache(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
) -> Step {
    web_step(
        settings,
        format!("clear caches of {alias}"),
        capabilities.drush(alias).rebuild_caches(),
    )
    .timeout_secs(settings.timeouts.cache_clear)
    .phase(ReleaseState::CacheCleared)
}

/// Toggle maintenance mode of `alias`.
pub fn maintenance_mode(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
    enabled: bool,
) -> Step {
    let drush = capabilities.drush(alias);
    let (label, command, phase) = if enabled {
        (
            format!("enable maintenance mode of {alias}"),
            drush.maintenance_mode(true),
            ReleaseState::InstalledOrUpdated,
        )
    } else {
        (
            format!("disable maintenance mode of {alias}"),
            drush.rebuild_caches().and(drush.maintenance_mode(false)),
            ReleaseState::MaintenanceOff,
        )
    };

    web_step(settings, label, command)
        .timeout_secs(settings.timeouts.cache_clear)
        .phase(phase)
}

/// Invalidate everything in the purge queue of `alias`.
///
/// Only acts when `purge_drush` is enabled and an `everything` invalidator
/// exists. Both are checked when the step runs, without touching caches.
pub fn purge_invalidate(
    settings: &RemoteSettings,
    capabilities: &Capabilities,
    alias: &SiteAlias,
) -> Step {
    let drush = capabilities.drush(alias);
    let invalidate = drush
        .enabled_modules()
        .pipe("grep")
        .flag("q")
        .arg(capabilities.dialect.module_pattern("purge_drush"))
        .and(drush.run("ptyp").option("format", "list"))
        .pipe("grep")
        .flag("q")
        .arg("everything")
        .and(drush.run("pinv").arg("everything").flag("y"));
    let command = ShellCommand::group(invalidate).or(ShellCommand::new("echo").arg(
        "Purge queue not invalidated.",
    ));

    web_step(settings, format!("invalidate purge queue of {alias}"), command)
        .timeout_secs(settings.timeouts.cache_clear)
        .allow_failure()
        .phase(ReleaseState::CacheCleared)
}

/// Reset OPcache of the live release through `cachetool`.
///
/// Returns `None` when no OPcache settings are configured.
pub fn opcache_reset(settings: &RemoteSettings) -> Option<Step> {
    let opcache = settings.opcache.as_ref()?;
    let command = ShellCommand::new("vendor/bin/cachetool").arg("opcache:reset");
    let command = match (opcache.env.as_str(), opcache.host.as_deref()) {
        ("fcgi", Some(host)) => command.option("fcgi", host),
        ("fcgi", None) => command.switch("fcgi"),
        _ => command.switch("cli"),
    };

    Some(
        Step::ssh(
            "reset opcache",
            &settings.server,
            Some(settings.currentdir.as_str()),
            command,
        )
        .allow_failure()
        .phase(ReleaseState::Pushed),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{OpcacheSettings, Properties},
        release::plan::Action,
        remote::Server,
    };
    use pretty_assertions::assert_eq;

    fn settings() -> anyhow::Result<RemoteSettings> {
        Ok(RemoteSettings::resolve(
            &Properties::default(),
            Server::new("web1", "deploy", "/keys/id"),
            &["web1".into()],
            "shop",
            1_700_000_000,
            &[("fr.example.com".into(), "fr".into())],
        )?)
    }

    fn command_of(step: &Step) -> String {
        match &step.action {
            Action::SshExec { command, .. } => command.to_string(),
            action => action.to_string(),
        }
    }

    fn multisite() -> Capabilities {
        Capabilities {
            supports_multisite: true,
            supports_config_import: true,
            dialect: Dialect::Modern,
        }
    }

    #[test]
    fn config_import_aligns_uuid_first() -> anyhow::Result<()> {
        let settings = settings()?;
        let alias = SiteAlias::new("fr.example.com", "fr");
        let identity = ConfigIdentity {
            site_uuid: Some("abc-123".into()),
            languages: vec![("fr".into(), "lang-fr".into())],
        };
        let step = config_import(&settings, &multisite(), &alias, Some(&identity));
        assert_eq!(
            command_of(&step),
            "../vendor/bin/drush --uri=fr.example.com cset system.site uuid abc-123 -y && \
             { ../vendor/bin/drush --uri=fr.example.com cset language.entity.fr uuid lang-fr -y || \
             echo 'Could not update uuid of language \"fr\"'; } && \
             ../vendor/bin/drush --uri=fr.example.com cr && \
             ../vendor/bin/drush --uri=fr.example.com cc drush && \
             ../vendor/bin/drush --uri=fr.example.com cim -y"
        );
        assert_eq!(step.phase, Some(ReleaseState::ConfigImported));

        Ok(())
    }

    #[test]
    fn locale_update_is_optional() -> anyhow::Result<()> {
        let settings = settings()?;
        let step = locale_update(&settings, &Capabilities::default(), &SiteAlias::default_site());
        assert!(step.allow_failure);
        assert!(command_of(&step).starts_with("{ vendor/bin/drush -r web cr && "));
        assert!(command_of(&step).ends_with(
            "vendor/bin/drush -r web locale-update; } || \
             echo 'Locale module not found, translations will not be imported.'"
        ));

        Ok(())
    }

    #[test]
    fn purge_invalidation_checks_module_without_rebuilding_caches() -> anyhow::Result<()> {
        let settings = settings()?;
        let alias = SiteAlias::new("fr.example.com", "fr");
        let step = purge_invalidate(&settings, &multisite(), &alias);
        assert_eq!(
            command_of(&step),
            "{ ../vendor/bin/drush --uri=fr.example.com pml --fields=name --status=enabled \
             --type=module --format=list | grep -q '^purge_drush$' && \
             ../vendor/bin/drush --uri=fr.example.com ptyp --format=list | grep -q everything && \
             ../vendor/bin/drush --uri=fr.example.com pinv everything -y; } || \
             echo 'Purge queue not invalidated.'"
        );
        assert!(step.allow_failure);
        assert!(!command_of(&step).contains(" cr "));

        Ok(())
    }

    #[test]
    fn opcache_reset_through_fcgi() -> anyhow::Result<()> {
        let mut settings = settings()?;
        assert_eq!(opcache_reset(&settings), None);

        settings.opcache = Some(OpcacheSettings {
            env: "fcgi".into(),
            host: Some("127.0.0.1:9000".into()),
        });
        let step = opcache_reset(&settings).ok_or(anyhow::anyhow!("no opcache step"))?;
        assert_eq!(
            command_of(&step),
            ShellCommand::new("vendor/bin/cachetool")
                .arg("opcache:reset")
                .option("fcgi", "127.0.0.1:9000")
                .to_string()
        );
        assert!(step.allow_failure);

        Ok(())
    }

    #[test]
    fn config_import_without_identity_only_imports() -> anyhow::Result<()> {
        let settings = settings()?;
        let step = config_import(&settings, &Capabilities::default(), &SiteAlias::default_site(), None);
        assert_eq!(
            command_of(&step),
            "../vendor/bin/drush cr && ../vendor/bin/drush cc drush && ../vendor/bin/drush cim -y"
        );

        Ok(())
    }
}
