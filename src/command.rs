// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Structured shell commands.
//!
//! Every remote or local operation is ultimately a line of POSIX shell handed
//! to `ssh` or `sh -c`. Rather than gluing strings together, commands are kept
//! as lists of words chained by shell operators, and quoting only happens once
//! at the very end when the command is rendered through [`Display`].
//!
//! # Words
//!
//! A [`Word`] is either a literal, which is always quoted when rendered, or an
//! expansion, which is emitted verbatim so the shell can evaluate it, e.g.,
//! `$(ls -vd releases/*)`. Expansions should only ever be built from other
//! rendered commands or constant text, never from user input.

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Quote a value for safe use as a single POSIX shell word.
///
/// Values made up of characters that carry no special meaning to the shell
/// are returned as-is to keep rendered commands readable.
pub fn quote(value: impl AsRef<str>) -> String {
    let value = value.as_ref();
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        return value.to_string();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A single shell word.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Word {
    /// Text passed to the program verbatim after quoting.
    Literal(String),

    /// Text the shell is expected to expand or interpret.
    Expansion(String),
}

impl Word {
    /// Construct literal word.
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal(value.into())
    }

    /// Construct expansion word.
    pub fn expansion(value: impl Into<String>) -> Self {
        Self::Expansion(value.into())
    }
}

impl Display for Word {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Literal(value) => fmt.write_str(quote(value).as_str()),
            Self::Expansion(value) => fmt.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    And,
    Or,
    Pipe,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Self::And => " && ",
            Self::Or => " || ",
            Self::Pipe => " | ",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Simple(Vec<Word>),
    Group(Box<ShellCommand>, Vec<Word>),
}

impl Part {
    fn words_mut(&mut self) -> &mut Vec<Word> {
        match self {
            Self::Simple(words) => words,
            Self::Group(_, words) => words,
        }
    }
}

impl Display for Part {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let words = match self {
            Self::Simple(words) => words.as_slice(),
            Self::Group(command, words) => {
                write!(fmt, "{{ {command}; }}")?;
                if words.is_empty() {
                    return Ok(());
                }
                fmt.write_str(" ")?;
                words.as_slice()
            }
        };

        let rendered = words.iter().map(ToString::to_string).collect::<Vec<_>>();
        fmt.write_str(rendered.join(" ").as_str())
    }
}

/// Shell command made of simple commands chained by `&&`, `||`, and `|`.
///
/// Argument methods always apply to the most recently chained part, so a
/// builder chain reads left to right exactly like the rendered command.
///
/// # Invariant
///
/// - Chaining a command that already has operators wraps it in a group, so
///   precedence never changes after rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    head: Part,
    tail: Vec<(Operator, Part)>,
}

impl ShellCommand {
    /// Start new command invoking `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            head: Part::Simple(vec![Word::literal(program)]),
            tail: Vec::new(),
        }
    }

    /// Start new command from raw shell text.
    pub fn raw(script: impl Into<String>) -> Self {
        Self {
            head: Part::Simple(vec![Word::expansion(script)]),
            tail: Vec::new(),
        }
    }

    /// Wrap command in a `{ ...; }` group.
    pub fn group(command: ShellCommand) -> Self {
        Self {
            head: Part::Group(Box::new(command), Vec::new()),
            tail: Vec::new(),
        }
    }

    /// Test that a command produces output: `[[ $(command) ]]`.
    pub fn has_output(command: &ShellCommand) -> Self {
        Self::raw(format!("[[ {} ]]", command.capture()))
    }

    /// Test that a regular file exists: `[[ -f path ]]`.
    pub fn file_exists(path: impl AsRef<str>) -> Self {
        Self::raw(format!("[[ -f {} ]]", quote(path)))
    }

    /// Test that a regular file does not exist: `[[ ! -f path ]]`.
    pub fn file_missing(path: impl AsRef<str>) -> Self {
        Self::raw(format!("[[ ! -f {} ]]", quote(path)))
    }

    /// Render command as a command substitution: `$(command)`.
    pub fn capture(&self) -> String {
        format!("$({self})")
    }

    /// Add quoted argument.
    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.last_mut().push(Word::literal(value));
        self
    }

    /// Add listing of quoted arguments.
    pub fn args(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let words = self.last_mut();
        words.extend(values.into_iter().map(Word::literal));
        self
    }

    /// Add argument the shell should interpret.
    pub fn raw_arg(mut self, value: impl Into<String>) -> Self {
        self.last_mut().push(Word::expansion(value));
        self
    }

    /// Add short flag, e.g., `-y`.
    pub fn flag(mut self, name: impl AsRef<str>) -> Self {
        self.last_mut()
            .push(Word::expansion(format!("-{}", name.as_ref())));
        self
    }

    /// Add short flag with separate value, e.g., `-r 'path'`.
    pub fn flag_value(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        let words = self.last_mut();
        words.push(Word::expansion(format!("-{}", name.as_ref())));
        words.push(Word::literal(value));
        self
    }

    /// Add long switch without value, e.g., `--force`.
    pub fn switch(mut self, name: impl AsRef<str>) -> Self {
        self.last_mut()
            .push(Word::expansion(format!("--{}", name.as_ref())));
        self
    }

    /// Add long option with value, e.g., `--uri=example.com`.
    pub fn option(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.last_mut().push(Word::expansion(format!(
            "--{}={}",
            name.as_ref(),
            quote(value)
        )));
        self
    }

    /// Chain command to run only if this one succeeds.
    pub fn and(self, next: impl Into<ShellCommand>) -> Self {
        self.chain(Operator::And, next.into())
    }

    /// Chain command to run only if this one fails.
    pub fn or(self, next: impl Into<ShellCommand>) -> Self {
        self.chain(Operator::Or, next.into())
    }

    /// Pipe output of this command into another one.
    pub fn pipe(self, next: impl Into<ShellCommand>) -> Self {
        self.chain(Operator::Pipe, next.into())
    }

    fn chain(mut self, operator: Operator, next: ShellCommand) -> Self {
        let part = if next.tail.is_empty() {
            next.head
        } else {
            Part::Group(Box::new(next), Vec::new())
        };
        self.tail.push((operator, part));
        self
    }

    fn last_mut(&mut self) -> &mut Vec<Word> {
        match self.tail.last_mut() {
            Some((_, part)) => part.words_mut(),
            None => self.head.words_mut(),
        }
    }
}

impl From<&str> for ShellCommand {
    fn from(program: &str) -> Self {
        Self::new(program)
    }
}

impl Display for ShellCommand {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}", self.head)?;
        for (operator, part) in &self.tail {
            write!(fmt, "{}{part}", operator.as_str())?;
        }

        Ok(())
    }
}
