// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote server settings.
//!
//! Turn the token templates of the properties file into concrete paths for one
//! server and one run. Settings are resolved once per invocation and never
//! change afterwards, which keeps every release and backup of a run named
//! after the same timestamp.
//!
//! # Tokens
//!
//! | Token            | Value                                   |
//! |------------------|-----------------------------------------|
//! | `[user]`         | SSH user                                |
//! | `[private-key]`  | path to SSH private key                 |
//! | `[app]`          | application name                        |
//! | `[time]`         | run timestamp in seconds since epoch    |
//! | `[server]`       | host of the server being resolved       |
//! | `[server-N]`     | N-th host given on the command line     |
//! | `[appdir]`       | resolved application directory          |
//! | `[releasesdir]`  | resolved releases directory             |
//! | `[rootdir]`      | resolved release directory of this run  |
//! | `[webdir]`       | web root relative to a release          |
//! | `[filesdir]`     | resolved shared files directory         |

use crate::{
    config::{OpcacheSettings, Properties, Timeouts},
    site::{self, SiteAlias},
};

use chrono::{DateTime, Utc};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};
use tracing::{debug, instrument};

/// SSH endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub user: String,
    pub private_key: PathBuf,
}

impl Server {
    /// Construct new server endpoint.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        private_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            private_key: private_key.into(),
        }
    }

    /// Destination in `user@host` form.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl Display for Server {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.host.as_str())
    }
}

/// Shared directory linked into every release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symlink {
    pub target: String,
    pub link: String,
}

/// Fully resolved settings for one server in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub server: Server,
    pub app: String,
    pub appdir: String,
    pub releasesdir: String,
    pub rootdir: String,
    pub currentdir: String,
    pub webdir: String,
    pub filesdir: String,
    pub backupsdir: String,
    pub symlinks: Vec<Symlink>,
    pub opcache: Option<OpcacheSettings>,
    pub aliases: Vec<SiteAlias>,
    pub time: i64,
    pub timeouts: Timeouts,
    pub keep_releases: usize,
    pub keep_backups: usize,
    stamp: String,
}

impl RemoteSettings {
    /// Resolve settings of `server` for a run at `time`.
    ///
    /// The `servers` listing gives the values of `[server-N]` tokens. Site
    /// aliases are resolved from the explicit aliases of the properties and
    /// the `registry` entries.
    ///
    /// # Errors
    ///
    /// - Return [`SettingsError::Timestamp`] if `time` is out of range.
    /// - Return [`SettingsError::Symlink`] if a symlink is not `target:link`.
    #[instrument(skip(properties, servers, registry), level = "debug")]
    pub fn resolve(
        properties: &Properties,
        server: Server,
        servers: &[String],
        app: &str,
        time: i64,
        registry: &[(String, String)],
    ) -> Result<Self> {
        let datetime: DateTime<Utc> =
            DateTime::from_timestamp(time, 0).ok_or(SettingsError::Timestamp(time))?;
        let layout = &properties.remote;

        let mut tokens = vec![
            ("[user]".to_string(), server.user.clone()),
            (
                "[private-key]".to_string(),
                server.private_key.to_string_lossy().into_owned(),
            ),
            ("[app]".to_string(), app.to_string()),
            ("[time]".to_string(), time.to_string()),
            ("[server]".to_string(), server.host.clone()),
        ];
        tokens.extend(
            servers
                .iter()
                .enumerate()
                .map(|(index, host)| (format!("[server-{index}]"), host.clone())),
        );

        // INVARIANT: Resolve directories in dependency order, so later templates can
        // refer to earlier ones.
        let appdir = substitute(&layout.appdir, &tokens);
        tokens.push(("[appdir]".into(), appdir.clone()));
        let releasesdir = substitute(&layout.releasesdir, &tokens);
        tokens.push(("[releasesdir]".into(), releasesdir.clone()));
        let rootdir = substitute(&layout.rootdir, &tokens);
        tokens.push(("[rootdir]".into(), rootdir.clone()));
        let webdir = substitute(&layout.webdir, &tokens);
        tokens.push(("[webdir]".into(), webdir.clone()));
        let filesdir = substitute(&layout.filesdir, &tokens);
        tokens.push(("[filesdir]".into(), filesdir.clone()));
        let currentdir = substitute(&layout.currentdir, &tokens);
        let backupsdir = substitute(&layout.backupsdir, &tokens);

        let symlinks = layout
            .symlinks
            .iter()
            .map(|entry| {
                let entry = substitute(entry, &tokens);
                entry
                    .split_once(':')
                    .map(|(target, link)| Symlink {
                        target: target.to_string(),
                        link: link.to_string(),
                    })
                    .ok_or(SettingsError::Symlink(entry))
            })
            .collect::<Result<Vec<_>>>()?;

        let explicit = layout
            .aliases
            .iter()
            .map(|alias| (alias.uri.clone(), alias.folder.clone()));
        let aliases = site::resolve(explicit, registry.iter().cloned());
        debug!("resolved {} site aliases for {}", aliases.len(), server.host);

        Ok(Self {
            server,
            app: app.to_string(),
            appdir,
            releasesdir,
            rootdir,
            currentdir,
            webdir,
            filesdir,
            backupsdir,
            symlinks,
            opcache: layout.opcache.clone(),
            aliases,
            time,
            timeouts: properties.timeouts.clone(),
            keep_releases: layout.keep_releases,
            keep_backups: layout.keep_backups,
            stamp: format!("{time}_{}", datetime.format("%Y_%m_%d_%H_%M_%S")),
        })
    }

    /// Same settings with backups named after a different timestamp.
    ///
    /// Used to restore or move a backup taken by an earlier run.
    ///
    /// # Errors
    ///
    /// - Return [`SettingsError::Timestamp`] if `time` is out of range.
    pub fn at_time(&self, time: i64) -> Result<Self> {
        let datetime: DateTime<Utc> =
            DateTime::from_timestamp(time, 0).ok_or(SettingsError::Timestamp(time))?;
        let mut settings = self.clone();
        settings.time = time;
        settings.stamp = format!("{time}_{}", datetime.format("%Y_%m_%d_%H_%M_%S"));
        Ok(settings)
    }

    /// Web root of the live release.
    pub fn current_web_root(&self) -> String {
        format!("{}/{}", self.currentdir, self.webdir)
    }

    /// Backup directory of this run.
    pub fn backup_dir(&self) -> String {
        format!("{}/{}", self.backupsdir, self.time)
    }

    /// Settings file of `alias` inside the live release.
    pub fn settings_file(&self, alias: &SiteAlias) -> String {
        format!(
            "{}/sites/{}/settings.php",
            self.current_web_root(),
            alias.folder_or_default()
        )
    }

    /// Backup file name: `{time}_{%Y_%m_%d_%H_%M_%S}{suffix}{extension}`.
    ///
    /// Date is rendered in UTC, so names stay stable across machines.
    pub fn backup_file_name(&self, suffix: &str, extension: &str) -> String {
        format!("{}{suffix}{extension}", self.stamp)
    }
}

fn substitute(template: &str, tokens: &[(String, String)]) -> String {
    tokens
        .iter()
        .fold(template.to_string(), |acc, (token, value)| {
            acc.replace(token.as_str(), value.as_str())
        })
}

/// Settings resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Timestamp cannot be represented as a date.
    #[error("timestamp {0} is out of range")]
    Timestamp(i64),

    /// Symlink entry is missing `:` separator.
    #[error("symlink {0:?} must be of the form target:link")]
    Symlink(String),
}

/// Friendly result alias :3
type Result<T, E = SettingsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AliasEntry;
    use pretty_assertions::assert_eq;

    fn settings(properties: &Properties) -> anyhow::Result<RemoteSettings> {
        Ok(RemoteSettings::resolve(
            properties,
            Server::new("web1.example.com", "deploy", "~/.ssh/id_ed25519"),
            &["web1.example.com".into(), "web2.example.com".into()],
            "shop",
            1_700_000_000,
            &[("fr.example.com".into(), "fr".into())],
        )?)
    }

    #[test]
    fn resolve_default_layout() -> anyhow::Result<()> {
        let result = settings(&Properties::default())?;
        assert_eq!(result.appdir, "/home/deploy/apps/shop");
        assert_eq!(result.releasesdir, "/home/deploy/apps/shop/releases");
        assert_eq!(result.rootdir, "/home/deploy/apps/shop/releases/1700000000");
        assert_eq!(result.current_web_root(), "/home/deploy/apps/shop/current/web");
        assert_eq!(result.backup_dir(), "/home/deploy/apps/shop/backups/1700000000");
        assert_eq!(
            result.symlinks[0],
            Symlink {
                target: "/home/deploy/apps/shop/files/public".into(),
                link: "/home/deploy/apps/shop/releases/1700000000/web/sites/default/files".into(),
            }
        );
        assert_eq!(result.aliases, vec![SiteAlias::new("fr.example.com", "fr")]);

        Ok(())
    }

    #[test]
    fn resolve_server_tokens() -> anyhow::Result<()> {
        let mut properties = Properties::default();
        properties.remote.appdir = "/srv/[server]/[app]".into();
        properties.remote.filesdir = "/mnt/[server-1]/files".into();
        properties.remote.aliases = vec![AliasEntry {
            uri: "fr.example.com".into(),
            folder: "france".into(),
        }];

        let result = settings(&properties)?;
        assert_eq!(result.appdir, "/srv/web1.example.com/shop");
        assert_eq!(result.filesdir, "/mnt/web2.example.com/files");
        assert_eq!(result.aliases, vec![SiteAlias::new("fr.example.com", "france")]);

        Ok(())
    }

    #[test]
    fn backup_file_names_use_utc() -> anyhow::Result<()> {
        let result = settings(&Properties::default())?;
        assert_eq!(
            result.backup_file_name(".fr", ".sql"),
            "1700000000_2023_11_14_22_13_20.fr.sql"
        );
        assert_eq!(
            result.at_time(0)?.backup_file_name("", ".tar.gz"),
            "0_1970_01_01_00_00_00.tar.gz"
        );

        Ok(())
    }

    #[test]
    fn settings_file_per_alias() -> anyhow::Result<()> {
        let result = settings(&Properties::default())?;
        assert_eq!(
            result.settings_file(&SiteAlias::default_site()),
            "/home/deploy/apps/shop/current/web/sites/default/settings.php"
        );
        assert_eq!(
            result.settings_file(&SiteAlias::new("fr.example.com", "fr")),
            "/home/deploy/apps/shop/current/web/sites/fr/settings.php"
        );

        Ok(())
    }

    #[test]
    fn malformed_symlink_is_error() {
        let mut properties = Properties::default();
        properties.remote.symlinks = vec!["nowhere".into()];
        let result = settings(&properties);
        assert!(result.is_err());
    }
}
