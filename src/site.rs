// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Multisite alias coordination.
//!
//! A Drupal code base can serve many sites. Each site is reached through a uri
//! and keeps its settings and database credentials in its own folder under
//! `sites/`. Release operations that touch a database must be repeated once
//! per folder, so the first thing any plan needs is the list of distinct
//! sites to act on.
//!
//! # Alias Resolution
//!
//! Aliases come from two places: explicit entries in the properties file, and
//! the multisite registry `sites/sites.php` of the project. Explicit entries
//! always win for a given uri. Several uris may point at the same folder, but
//! only the first uri seen for a folder survives, since all of them would
//! target the same database anyway.
//!
//! # See Also
//!
//! - [Drupal multisite](https://www.drupal.org/docs/getting-started/multisite-drupal)

pub mod registry;
pub mod settings;
pub mod state;

use std::{
    collections::HashSet,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// A site served by the Drupal code base.
///
/// The default site of a non-multisite install has no folder and an empty
/// uri. Drush commands for it never receive a `--uri` option.
#[derive(Default, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SiteAlias {
    pub uri: String,
    pub folder: Option<String>,
}

impl SiteAlias {
    /// Construct new alias from `uri` to folder under `sites/`.
    pub fn new(uri: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            folder: Some(folder.into()),
        }
    }

    /// Construct the default site alias.
    pub fn default_site() -> Self {
        Self::default()
    }

    /// Check if alias names the default site.
    pub fn is_default(&self) -> bool {
        self.folder.is_none()
    }

    /// Folder under `sites/` holding the settings of this site.
    pub fn folder_or_default(&self) -> &str {
        self.folder.as_deref().unwrap_or("default")
    }

    /// Uri to hand to drush, if any.
    pub fn drush_uri(&self) -> Option<&str> {
        self.folder.as_ref().map(|_| self.uri.as_str())
    }

    /// Suffix used in per-site file names, e.g., `.fr`.
    pub fn file_suffix(&self) -> String {
        self.folder
            .as_ref()
            .map(|folder| format!(".{folder}"))
            .unwrap_or_default()
    }
}

impl Display for SiteAlias {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match &self.folder {
            Some(folder) => write!(fmt, "{} ({folder})", self.uri),
            None => fmt.write_str("default"),
        }
    }
}

/// Resolve the distinct sites to operate on.
///
/// Merges `explicit` aliases with `registry` aliases. A registry entry whose
/// uri is already listed explicitly is ignored. Afterwards, only the first
/// uri seen for each folder is kept. Survivors keep their insertion order,
/// explicit entries first.
///
/// Falls back to the single default site when nothing is left.
pub fn resolve(
    explicit: impl IntoIterator<Item = (String, String)>,
    registry: impl IntoIterator<Item = (String, String)>,
) -> Vec<SiteAlias> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for (uri, folder) in explicit.into_iter().chain(registry) {
        // INVARIANT: First entry for a uri wins, so explicit entries are never overwritten.
        if merged.iter().any(|(seen, _)| *seen == uri) {
            continue;
        }
        merged.push((uri, folder));
    }

    let mut folders = HashSet::new();
    let aliases = merged
        .into_iter()
        .filter(|(_, folder)| folders.insert(folder.clone()))
        .map(|(uri, folder)| SiteAlias::new(uri, folder))
        .collect::<Vec<_>>();

    if aliases.is_empty() {
        return vec![SiteAlias::default_site()];
    }

    aliases
}
