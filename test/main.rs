// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

mod integration;

use anyhow::Result;
use dropdeploy::{
    release::exec::{ExecError, Executor, Output},
    Properties, RemoteSettings, Server, Step,
};

pub(crate) const TIME: i64 = 1_700_000_000;

/// Canned answer of [`FakeExecutor`].
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Exit(i32, &'static str),
    Timeout,
}

/// Executor that records every step and answers from a script.
///
/// A step gets the reply of the first rule whose pattern occurs in its label.
/// Steps without a matching rule succeed with empty output.
#[derive(Debug, Default)]
pub(crate) struct FakeExecutor {
    rules: Vec<(String, Reply)>,
    pub(crate) calls: Vec<String>,
}

impl FakeExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(mut self, pattern: impl Into<String>, reply: Reply) -> Self {
        self.rules.push((pattern.into(), reply));
        self
    }

    pub(crate) fn calls_matching(&self, pattern: &str) -> usize {
        self.calls.iter().filter(|call| call.contains(pattern)).count()
    }
}

impl Executor for FakeExecutor {
    async fn execute(&mut self, step: &Step) -> Result<Output, ExecError> {
        self.calls.push(step.label.clone());
        let reply = self
            .rules
            .iter()
            .find(|(pattern, _)| step.label.contains(pattern.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or(Reply::Exit(0, ""));

        match reply {
            Reply::Exit(status, stdout) => Ok(Output::new(status, stdout, "scripted failure")),
            Reply::Timeout => Err(ExecError::Timeout {
                label: step.label.clone(),
                timeout: step.timeout,
            }),
        }
    }
}

pub(crate) fn properties() -> Properties {
    let mut properties = Properties::default();
    properties.remote.appdir = "/srv/shop".into();
    properties
}

pub(crate) fn settings(
    properties: &Properties,
    host: &str,
    registry: &[(String, String)],
) -> Result<RemoteSettings> {
    Ok(RemoteSettings::resolve(
        properties,
        Server::new(host, "deploy", "/keys/id_ed25519"),
        &[host.to_string()],
        "shop",
        TIME,
        registry,
    )?)
}

pub(crate) fn labels(steps: &[Step]) -> Vec<&str> {
    steps.iter().map(|step| step.label.as_str()).collect()
}
