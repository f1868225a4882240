// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the properties file that describes a Drupal project
//! and the layout of the servers it gets released to. Every section and key is
//! optional, missing values fall back to sensible defaults so a bare project
//! only needs to list its site aliases, if any.
//!
//! # Path Tokens
//!
//! Remote paths are templates that may contain bracketed tokens, e.g.,
//! `/home/[user]/apps/[app]`. Tokens are only substituted once the target
//! server, user, and release time are known. See
//! [`RemoteSettings::resolve`](crate::remote::RemoteSettings::resolve) for the
//! full token listing.
//!
//! Local paths get shell expansion when parsed, so `~` and `$VARS` work.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Properties file layout.
///
/// # General Layout
///
/// - `[project]`: where the Drupal project lives on the local machine.
/// - `[build]`: commands used to prepare a release archive.
/// - `[remote]`: layout of an application on the remote servers.
/// - `[local]`: layout of local file and backup directories.
/// - `[timeouts]`: per-operation time limits in seconds.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Properties {
    pub project: ProjectSettings,
    pub build: BuildSettings,
    pub remote: RemoteLayout,
    pub local: LocalLayout,
    pub timeouts: Timeouts,
}

impl Properties {
    /// Load properties from file at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Missing`] if file does not exist.
    /// - Return [`ConfigError::Read`] if file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = read_to_string(path).map_err(|error| match error.kind() {
            ErrorKind::NotFound => ConfigError::Missing(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source: error,
            },
        })?;

        data.parse()
    }

    /// Absolute or relative path to Drupal web root on local machine.
    pub fn local_web_root(&self) -> PathBuf {
        self.project.root.join(&self.project.web)
    }

    /// Path to the multisite registry file, i.e., `sites/sites.php`.
    pub fn registry_path(&self) -> PathBuf {
        self.local_web_root().join("sites").join("sites.php")
    }

    /// Project-wide configuration sync directory, if configured.
    pub fn config_sync_dir(&self) -> Option<PathBuf> {
        self.project
            .config_sync
            .as_ref()
            .map(|sync| self.project.root.join(sync))
    }
}

impl FromStr for Properties {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut properties: Properties =
            toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on local paths only.
        //   - Remote paths are token templates resolved per server.
        properties.project.root = expand_path(&properties.project.root)?;
        properties.local.filesdir = expand_path(&properties.local.filesdir)?;
        properties.local.backupsdir = expand_path(&properties.local.backupsdir)?;

        Ok(properties)
    }
}

impl Display for Properties {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Local Drupal project settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProjectSettings {
    /// Project root containing `composer.json` and `vendor/`.
    pub root: PathBuf,

    /// Web root relative to project root.
    pub web: String,

    /// Config sync directory relative to project root.
    pub config_sync: Option<String>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            web: "web".into(),
            config_sync: None,
        }
    }
}

/// Release archive build settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Shell commands to run in project root before archiving.
    pub commands: Vec<String>,

    /// Patterns excluded from the release archive.
    pub exclude: Vec<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            commands: vec!["composer install --no-dev --optimize-autoloader".into()],
            exclude: vec![".git".into(), "node_modules".into(), "backups".into()],
        }
    }
}

/// Layout of an application on remote servers.
///
/// All paths are token templates.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteLayout {
    pub appdir: String,
    pub releasesdir: String,
    pub rootdir: String,

    /// Symlink pointing at the project root of the live release.
    pub currentdir: String,

    /// Web root relative to a release project root.
    pub webdir: String,
    pub filesdir: String,
    pub backupsdir: String,

    /// Shared directories linked into each release as `target:link` pairs.
    pub symlinks: Vec<String>,

    /// Amount of releases to keep after cleanup.
    pub keep_releases: usize,

    /// Amount of backups to keep after cleanup.
    pub keep_backups: usize,
    pub opcache: Option<OpcacheSettings>,

    /// Explicit site aliases, listed in priority order.
    pub aliases: Vec<AliasEntry>,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            appdir: "/home/[user]/apps/[app]".into(),
            releasesdir: "[appdir]/releases".into(),
            rootdir: "[releasesdir]/[time]".into(),
            currentdir: "[appdir]/current".into(),
            webdir: "web".into(),
            filesdir: "[appdir]/files".into(),
            backupsdir: "[appdir]/backups".into(),
            symlinks: vec![
                "[filesdir]/public:[rootdir]/[webdir]/sites/default/files".into(),
                "[filesdir]/private:[rootdir]/private".into(),
            ],
            keep_releases: 3,
            keep_backups: 5,
            opcache: None,
            aliases: Vec::new(),
        }
    }
}

/// OPcache reset through `cachetool`.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct OpcacheSettings {
    /// Either `fcgi` or `cli`.
    pub env: String,

    /// FastCGI address, e.g., `127.0.0.1:9000`.
    pub host: Option<String>,
}

/// Explicit `uri -> folder` site alias.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct AliasEntry {
    pub uri: String,
    pub folder: String,
}

/// Local layout for files and backups.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocalLayout {
    /// Directory holding the `files` tree of the default site.
    pub filesdir: PathBuf,

    /// Directory to download backups into.
    pub backupsdir: PathBuf,
}

impl Default for LocalLayout {
    fn default() -> Self {
        Self {
            filesdir: PathBuf::from("web/sites/default"),
            backupsdir: PathBuf::from("backups"),
        }
    }
}

/// Per-operation time limits in seconds.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Timeouts {
    pub build: u64,
    pub push: u64,
    pub probe: u64,
    pub install: u64,
    pub update: u64,
    pub cache_clear: u64,
    pub backup_files: u64,
    pub backup_database: u64,
    pub pre_restore: u64,
    pub restore_files: u64,
    pub restore_database: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            build: 900,
            push: 300,
            probe: 300,
            install: 900,
            update: 900,
            cache_clear: 120,
            backup_files: 300,
            backup_database: 300,
            pre_restore: 60,
            restore_files: 300,
            restore_database: 300,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Properties file does not exist.
    #[error("properties file {0:?} does not exist")]
    Missing(PathBuf),

    /// Properties file cannot be read.
    #[error("failed to read properties file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Site has no local settings file.
    #[error("no settings file found for site {alias} in {dir:?}")]
    MissingSettings { alias: String, dir: PathBuf },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
