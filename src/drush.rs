// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Drush command builders.
//!
//! Drush is the Drupal shell. Every database or cache operation of a release
//! goes through it, always through the copy installed by Composer in the
//! project, never a global one.
//!
//! # Dialects
//!
//! Drush 8 and older print module listings and versions differently than
//! Drush 9 onwards. The few commands that scrape drush output consult a
//! [`Dialect`], detected once per run from `drush version`.
//!
//! # See Also
//!
//! - [Drush commands](https://www.drush.org/latest/commands/all/)

use crate::{command::ShellCommand, site::SiteAlias};

use semver::Version;
use tracing::{debug, warn};

/// Drush binary relative to a Drupal web root.
pub const DRUSH_FROM_WEB_ROOT: &str = "../vendor/bin/drush";

/// Drush binary relative to a project root.
pub const DRUSH_FROM_PROJECT_ROOT: &str = "vendor/bin/drush";

/// Output conventions of a drush major version.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Drush 8 and older.
    Legacy,

    /// Drush 9 and newer.
    #[default]
    Modern,
}

impl Dialect {
    /// Detect dialect from `drush version --format=string` output.
    ///
    /// Anything unparsable is assumed to be a modern drush.
    pub fn from_version_output(output: &str) -> Self {
        let Some(version) = parse_version(output) else {
            warn!("cannot determine drush version from {output:?}, assuming drush 9+");
            return Self::Modern;
        };

        debug!("detected drush {version}");
        if version.major < 9 {
            Self::Legacy
        } else {
            Self::Modern
        }
    }

    /// Pattern that matches `module` in an enabled module listing.
    pub fn module_pattern(&self, module: &str) -> String {
        match self {
            Self::Legacy => format!("({module})"),
            Self::Modern => format!("^{module}$"),
        }
    }

    // Regex alternatives look different for the two listing formats.
    fn cache_module_patterns(&self) -> (&'static str, &'static str) {
        match self {
            Self::Legacy => (r"\((varnish|purge)\)", r"\(page_cache\)"),
            Self::Modern => ("(varnish|purge)", "page_cache"),
        }
    }
}

fn parse_version(output: &str) -> Option<Version> {
    let token = output
        .split(|c: char| c.is_whitespace() || c == ':')
        .find(|token| token.starts_with(|c: char| c.is_ascii_digit()))?;

    // INVARIANT: Pad partial versions like `9.0` to full semver triples.
    let core = token
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .next()
        .unwrap_or(token)
        .trim_end_matches('.');
    let mut parts = core.split('.').collect::<Vec<_>>();
    while parts.len() < 3 {
        parts.push("0");
    }

    Version::parse(parts[..3].join(".").as_str()).ok()
}

/// Builder for drush invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drush {
    binary: String,
    root: Option<String>,
    uri: Option<String>,
}

impl Drush {
    /// Drush run from inside a web root.
    pub fn from_web_root() -> Self {
        Self {
            binary: DRUSH_FROM_WEB_ROOT.into(),
            root: None,
            uri: None,
        }
    }

    /// Drush run from a project root against web root `web`.
    pub fn from_project_root(web: impl Into<String>) -> Self {
        Self {
            binary: DRUSH_FROM_PROJECT_ROOT.into(),
            root: Some(web.into()),
            uri: None,
        }
    }

    /// Target site of `alias`.
    pub fn site(mut self, alias: &SiteAlias) -> Self {
        self.uri = alias.drush_uri().map(ToString::to_string);
        self
    }

    /// Start command for `subcommand`.
    pub fn run(&self, subcommand: impl Into<String>) -> ShellCommand {
        let mut command = ShellCommand::new(self.binary.as_str());
        if let Some(root) = &self.root {
            command = command.flag_value("r", root.as_str());
        }
        if let Some(uri) = &self.uri {
            command = command.option("uri", uri);
        }

        command.arg(subcommand)
    }

    /// `drush cr`
    pub fn cache_rebuild(&self) -> ShellCommand {
        self.run("cr")
    }

    /// `drush cc drush`
    pub fn clear_drush_cache(&self) -> ShellCommand {
        self.run("cc").arg("drush")
    }

    /// `drush cr && drush cc drush`
    pub fn rebuild_caches(&self) -> ShellCommand {
        self.cache_rebuild().and(self.clear_drush_cache())
    }

    /// Toggle maintenance mode.
    pub fn maintenance_mode(&self, enabled: bool) -> ShellCommand {
        self.run("sset")
            .arg("system.maintenance_mode")
            .arg(if enabled { "1" } else { "0" })
    }

    /// Probe that prints a line only if the `users` table exists.
    pub fn users_table(&self) -> ShellCommand {
        self.run("sql-query")
            .arg("SHOW TABLES")
            .pipe("grep")
            .arg("users")
    }

    /// List enabled modules, one per line.
    pub fn enabled_modules(&self) -> ShellCommand {
        self.run("pml")
            .option("fields", "name")
            .option("status", "enabled")
            .option("type", "module")
            .option("format", "list")
    }

    /// Succeed only if `module` is enabled.
    pub fn module_enabled(&self, module: &str, dialect: Dialect) -> ShellCommand {
        self.rebuild_caches()
            .and(self.enabled_modules())
            .pipe("grep")
            .arg(dialect.module_pattern(module))
    }

    /// Fail when a reverse proxy cache module is enabled together with the
    /// internal page cache.
    pub fn varnish_check(&self, dialect: Dialect) -> ShellCommand {
        let (proxy, page_cache) = dialect.cache_module_patterns();
        let test = format!(
            r#"bash -c "[[ '$ENABLED_MODULES' =~ {proxy} && '$ENABLED_MODULES' =~ {page_cache} ]]""#
        );

        ShellCommand::raw(format!("ENABLED_MODULES={}", self.enabled_modules().capture()))
            .and(ShellCommand::raw(test))
            .and(ShellCommand::raw("exit 1"))
            .or(ShellCommand::raw(":"))
    }

    /// `drush version --format=string`
    pub fn version(&self) -> ShellCommand {
        self.run("version").option("format", "string")
    }
}
