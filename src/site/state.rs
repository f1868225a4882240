// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Installation state tracking.
//!
//! Whether a site is installed decides between installing and updating it,
//! and whether a backup can be taken before a release. Finding out requires a
//! round trip to the server, so answers are cached per uri for the rest of
//! the run. Nothing is persisted between runs.
//!
//! # Probe
//!
//! A site counts as installed when its database has a `users` table __and__
//! its `settings.php` exists in the live release. Any failure to get a clear
//! answer, including a timeout or an unreachable host, counts as not
//! installed, so the worst case is attempting a guarded install.

use crate::{
    command::ShellCommand,
    drush::Drush,
    release::{exec::Executor, plan::Step},
    remote::RemoteSettings,
    site::SiteAlias,
};

use std::collections::HashMap;
use tracing::{debug, instrument, warn};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    installed: bool,
    tested: bool,
}

/// Per-uri installation state of one run.
///
/// The default site is tracked under the empty uri.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct InstallationState {
    entries: HashMap<String, Entry>,
}

impl InstallationState {
    /// Construct new empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `alias` is installed, probing the server on first query.
    ///
    /// A value stored through [`set_installed`](Self::set_installed) is
    /// returned as is, without probing.
    #[instrument(skip(self, executor, settings, alias), fields(alias = %alias), level = "debug")]
    pub async fn is_installed<E: Executor>(
        &mut self,
        executor: &mut E,
        settings: &RemoteSettings,
        alias: &SiteAlias,
    ) -> bool {
        if let Some(entry) = self.entries.get(alias.uri.as_str()) {
            return entry.installed;
        }

        let step = probe_step(settings, alias);
        let installed = match executor.execute(&step).await {
            Ok(output) => output.success(),
            Err(error) => {
                warn!("cannot determine if {alias} is installed, assuming it is not: {error}");
                false
            }
        };
        debug!("{alias} installed: {installed}");

        self.entries.insert(
            alias.uri.clone(),
            Entry {
                installed,
                tested: true,
            },
        );
        installed
    }

    /// Override installation state of `alias` without probing.
    pub fn set_installed(&mut self, alias: &SiteAlias, installed: bool) {
        let entry = self.entries.entry(alias.uri.clone()).or_default();
        entry.installed = installed;
    }

    /// Combined state of `aliases`.
    ///
    /// Returns `None` until every alias has been probed, then whether all of
    /// them are installed.
    pub fn aggregate<'a>(&self, aliases: impl IntoIterator<Item = &'a SiteAlias>) -> Option<bool> {
        let mut all_installed = true;
        for alias in aliases {
            let entry = self.entries.get(alias.uri.as_str())?;
            if !entry.tested {
                return None;
            }
            all_installed &= entry.installed;
        }

        Some(all_installed)
    }

    /// Check if every site of `settings` is installed, probing as needed.
    ///
    /// Overrides count as answers here, unlike in [`aggregate`](Self::aggregate).
    pub async fn is_site_installed<E: Executor>(
        &mut self,
        executor: &mut E,
        settings: &RemoteSettings,
    ) -> bool {
        let mut all_installed = true;
        for alias in &settings.aliases {
            all_installed &= self.is_installed(executor, settings, alias).await;
        }

        all_installed
    }
}

/// Step probing whether `alias` is installed on the live release.
pub fn probe_step(settings: &RemoteSettings, alias: &SiteAlias) -> Step {
    let web_root = settings.current_web_root();
    let command = Drush::from_web_root()
        .site(alias)
        .users_table()
        .and(ShellCommand::file_exists(settings.settings_file(alias)))
        .or(ShellCommand::raw("exit 1"));

    Step::ssh(
        format!("check if {alias} is installed"),
        &settings.server,
        Some(web_root.as_str()),
        command,
    )
    .timeout_secs(settings.timeouts.probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn aggregate_is_unknown_until_all_tested() {
        let fr = SiteAlias::new("fr.example.com", "fr");
        let de = SiteAlias::new("de.example.com", "de");
        let mut state = InstallationState::new();
        state.entries.insert(
            fr.uri.clone(),
            Entry {
                installed: true,
                tested: true,
            },
        );

        assert_eq!(state.aggregate([&fr, &de]), None);

        state.entries.insert(
            de.uri.clone(),
            Entry {
                installed: false,
                tested: true,
            },
        );
        assert_eq!(state.aggregate([&fr, &de]), Some(false));
        assert_eq!(state.aggregate([&fr]), Some(true));
    }

    #[test]
    fn set_installed_does_not_mark_tested() {
        let alias = SiteAlias::default_site();
        let mut state = InstallationState::new();
        state.set_installed(&alias, true);
        assert_eq!(state.aggregate([&alias]), None);
        assert_eq!(
            state.entries.get(""),
            Some(&Entry {
                installed: true,
                tested: false,
            })
        );
    }

    #[test]
    fn set_installed_keeps_tested_flag() {
        let alias = SiteAlias::default_site();
        let mut state = InstallationState::new();
        state.entries.insert(
            String::new(),
            Entry {
                installed: false,
                tested: true,
            },
        );
        state.set_installed(&alias, true);
        assert_eq!(state.aggregate([&alias]), Some(true));
    }
}
