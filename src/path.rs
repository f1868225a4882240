// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations of files that dropdeploy reads or writes on
//! the local machine.

use std::path::PathBuf;

/// Name of properties file looked up in the working directory.
pub const PROPERTIES_FILE: &str = "dropdeploy.toml";

/// Determine default path to properties file.
///
/// Uses `dropdeploy.toml` in the current working directory. Does not check if
/// the path returned actually exists.
pub fn default_properties_file() -> PathBuf {
    PathBuf::from(PROPERTIES_FILE)
}

/// Determine default scratch directory for backups moved between servers.
///
/// Uses XDG Base Directory path `$XDG_CACHE_HOME/dropdeploy` as the default
/// absolute path. Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_scratch_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .map(|path| path.join("dropdeploy"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::cache_dir`](https://docs.rs/dirs/latest/dirs/fn.cache_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's cache directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;
