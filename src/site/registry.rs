// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Multisite registry parsing.
//!
//! Drupal maps incoming hosts to site folders through `sites/sites.php`, a
//! plain PHP file made of assignments like:
//!
//! ```text
//! $sites['fr.example.com'] = 'fr';
//! ```
//!
//! Only those assignments matter here. Everything else in the file, comments
//! and PHP boilerplate included, is ignored. Like a PHP array, assigning the
//! same uri twice keeps its original position but takes the later folder.

use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument};

const ASSIGNMENT: &str = "$sites[";

/// Read `uri -> folder` pairs from registry file at `path`.
///
/// A missing registry is not an error, it simply means the project is not a
/// multisite install.
///
/// # Errors
///
/// - Return [`RegistryError::Read`] if file exists but cannot be read.
/// - Return [`RegistryError::Parse`] if an assignment is malformed.
#[instrument(skip(path), level = "debug")]
pub fn read(path: impl AsRef<Path>) -> Result<Vec<(String, String)>> {
    let path = path.as_ref();
    let data = match read_to_string(path) {
        Ok(data) => data,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!("no multisite registry at {}", path.display());
            return Ok(Vec::new());
        }
        Err(error) => {
            return Err(RegistryError::Read {
                path: path.to_path_buf(),
                source: error,
            })
        }
    };

    parse(&data).map_err(|line| RegistryError::Parse {
        path: path.to_path_buf(),
        line,
    })
}

/// Parse registry contents, returning offending line number on failure.
pub fn parse(data: &str) -> std::result::Result<Vec<(String, String)>, usize> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for (index, line) in data.lines().enumerate() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix(ASSIGNMENT) else {
            continue;
        };

        let (uri, folder) = parse_assignment(rest).ok_or(index + 1)?;
        match entries.iter_mut().find(|(seen, _)| *seen == uri) {
            Some(entry) => entry.1 = folder,
            None => entries.push((uri, folder)),
        }
    }

    Ok(entries)
}

// Parse `'uri'] = 'folder';` after the `$sites[` prefix.
fn parse_assignment(input: &str) -> Option<(String, String)> {
    let (uri, rest) = parse_quoted(input.trim_start())?;
    let rest = rest.trim_start().strip_prefix(']')?;
    let rest = rest.trim_start().strip_prefix('=')?;
    let (folder, rest) = parse_quoted(rest.trim_start())?;
    let rest = rest.trim_start();
    if !(rest.is_empty() || rest.starts_with(';')) {
        return None;
    }

    Some((uri, folder))
}

pub(crate) fn parse_quoted(input: &str) -> Option<(String, &str)> {
    let mut chars = input.char_indices();
    let (_, quote) = chars.next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }

    let mut value = String::new();
    let mut escaped = false;
    for (index, c) in chars {
        if escaped {
            value.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some((value, &input[index + c.len_utf8()..]));
        } else {
            value.push(c);
        }
    }

    None
}

/// Registry error types.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Registry file cannot be read.
    #[error("failed to read multisite registry {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Registry assignment is malformed.
    #[error("malformed site assignment in {path:?} at line {line}")]
    Parse { path: PathBuf, line: usize },
}

/// Friendly result alias :3
type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[test]
    fn parse_registry_assignments() {
        let result = parse(indoc! {r#"
            <?php

            /**
             * Multisite directory aliasing.
             * $sites['example.com'] = 'ignored';
             */
            $sites['fr.example.com'] = 'fr';
            $sites["de.example.com"]="de";
            // $sites['old.example.com'] = 'old';
            $sites['fr.example.com'] = 'french';
        "#});

        let expect = vec![
            ("fr.example.com".to_string(), "french".to_string()),
            ("de.example.com".to_string(), "de".to_string()),
        ];
        assert_eq!(result, Ok(expect));
    }

    #[test]
    fn parse_reports_malformed_line() {
        let result = parse(indoc! {r#"
            <?php
            $sites['fr.example.com] = 'fr';
        "#});
        assert_eq!(result, Err(2));
    }

    #[test]
    fn parse_escaped_quotes() {
        let result = parse(r"$sites['it\'s.example.com'] = 'its';");
        assert_eq!(
            result,
            Ok(vec![("it's.example.com".to_string(), "its".to_string())])
        );
    }

    #[sealed_test]
    fn read_missing_registry_is_empty() -> anyhow::Result<()> {
        assert_eq!(read("web/sites/sites.php")?, Vec::new());
        Ok(())
    }

    #[sealed_test]
    fn read_registry_file() -> anyhow::Result<()> {
        std::fs::write("sites.php", "<?php\n$sites['a.com'] = 'a';\n")?;
        assert_eq!(read("sites.php")?, vec![("a.com".into(), "a".into())]);
        Ok(())
    }
}
