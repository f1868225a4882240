// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local site settings.
//!
//! Every site keeps a `settings.php`, or at least a `settings.local.php`, in
//! its folder under `sites/` of the local project. Installing or releasing a
//! site without one makes no sense, so those files are checked before any
//! plan touches a server.
//!
//! The settings file also names the configuration sync directory of the site
//! through an assignment like:
//!
//! ```text
//! $settings['config_sync_directory'] = '../config/fr';
//! ```
//!
//! Exported configuration in that directory carries the UUIDs the target site
//! must have for a configuration import to be accepted.

use crate::{
    config::{ConfigError, Properties},
    site::{registry::parse_quoted, SiteAlias},
};

use serde::Deserialize;
use std::{
    fs::{read_dir, read_to_string},
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

const SETTINGS_FILES: [&str; 2] = ["settings.php", "settings.local.php"];
const SYNC_ASSIGNMENTS: [&str; 2] = [
    "$settings['config_sync_directory']",
    "$config_directories['sync']",
];
const LANGUAGE_PREFIX: &str = "language.entity.";

/// Locate settings file of `alias` below local web root `web_root`.
///
/// # Errors
///
/// - Return [`ConfigError::MissingSettings`] if the site folder has neither
///   `settings.php` nor `settings.local.php`.
pub fn settings_file(web_root: impl AsRef<Path>, alias: &SiteAlias) -> Result<PathBuf> {
    let dir = web_root
        .as_ref()
        .join("sites")
        .join(alias.folder_or_default());

    SETTINGS_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| ConfigError::MissingSettings {
            alias: alias.to_string(),
            dir,
        })
}

/// Check that every site of `aliases` has a local settings file.
///
/// # Errors
///
/// - Return [`ConfigError::MissingSettings`] for the first site without one.
pub fn require_settings<'a>(
    properties: &Properties,
    aliases: impl IntoIterator<Item = &'a SiteAlias>,
) -> Result<()> {
    let web_root = properties.local_web_root();
    for alias in aliases {
        let path = settings_file(&web_root, alias)?;
        debug!("settings of {alias}: {}", path.display());
    }

    Ok(())
}

/// Configuration sync directory of `alias` on the local machine.
///
/// Taken from the site's settings file. The default site falls back to the
/// `config_sync` directory of the properties file.
pub fn config_sync_dir(properties: &Properties, alias: &SiteAlias) -> Option<PathBuf> {
    let web_root = properties.local_web_root();
    let from_settings = settings_file(&web_root, alias)
        .ok()
        .and_then(|path| match read_to_string(&path) {
            Ok(data) => sync_directory(&data),
            Err(error) => {
                warn!("cannot read settings {}: {error}", path.display());
                None
            }
        })
        .map(|dir| web_root.join(dir));

    match from_settings {
        Some(dir) => Some(dir),
        None if alias.is_default() => properties.config_sync_dir(),
        None => None,
    }
}

// Last assignment wins, as it would in PHP.
fn sync_directory(data: &str) -> Option<String> {
    let mut found = None;
    for line in data.lines().map(str::trim) {
        for prefix in SYNC_ASSIGNMENTS {
            let Some(rest) = line.strip_prefix(prefix) else {
                continue;
            };
            let Some(rest) = rest.trim_start().strip_prefix('=') else {
                continue;
            };
            if let Some((dir, _)) = parse_quoted(rest.trim_start()) {
                found = Some(dir);
            }
        }
    }

    found
}

/// UUIDs a site must carry to accept its exported configuration.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ConfigIdentity {
    pub site_uuid: Option<String>,

    /// Language code and UUID of every exported language, sorted by code.
    pub languages: Vec<(String, String)>,
}

impl ConfigIdentity {
    /// Read identity of `alias` from its configuration sync directory.
    #[instrument(skip(properties, alias), fields(alias = %alias), level = "debug")]
    pub fn of(properties: &Properties, alias: &SiteAlias) -> Self {
        match config_sync_dir(properties, alias) {
            Some(dir) => Self::read(dir),
            None => {
                debug!("no config sync directory for {alias}");
                Self::default()
            }
        }
    }

    /// Read identity from exported configuration in `dir`.
    ///
    /// Missing or malformed files are logged and skipped.
    pub fn read(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let site_uuid = read_uuid(dir.join("system.site.yml"));

        let mut languages = Vec::new();
        match read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    let Some(langcode) = name
                        .strip_prefix(LANGUAGE_PREFIX)
                        .and_then(|rest| rest.strip_suffix(".yml"))
                    else {
                        continue;
                    };
                    if let Some(uuid) = read_uuid(entry.path()) {
                        languages.push((langcode.to_string(), uuid));
                    }
                }
            }
            Err(error) => warn!("cannot list config sync directory {}: {error}", dir.display()),
        }
        languages.sort();

        Self {
            site_uuid,
            languages,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExportedConfig {
    uuid: String,
}

fn read_uuid(path: PathBuf) -> Option<String> {
    let data = match read_to_string(&path) {
        Ok(data) => data,
        Err(error) => {
            warn!("cannot read exported config {}: {error}", path.display());
            return None;
        }
    };

    match serde_yaml_ng::from_str::<ExportedConfig>(&data) {
        Ok(config) => {
            debug!("uuid {} from {}", config.uuid, path.display());
            Some(config.uuid)
        }
        Err(error) => {
            warn!("cannot parse exported config {}: {error}", path.display());
            None
        }
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
