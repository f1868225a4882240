// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Release orchestration for multisite Drupal deployments.
//!
//! Dropdeploy builds a Drupal project into a release archive, pushes it to
//! one or more servers over SSH, and brings every site of a multisite install
//! in line with the new code through drush. Backups taken before a release
//! are restored automatically if the release fails halfway.
//!
//! # Planning and Running
//!
//! Every operation is split in two. First a [`DeploymentPlan`] is built, a
//! fixed list of steps with an optional rollback checkpoint, probing servers
//! where the steps depend on remote state. Then a [`PlanRunner`] carries the
//! plan out through an [`Executor`]. Plans can be printed instead of run for a
//! dry run.
//!
//! # See Also
//!
//! - [Drush](https://www.drush.org)
//! - [Drupal multisite](https://www.drupal.org/docs/getting-started/multisite-drupal)

pub mod backup;
pub mod command;
pub mod config;
pub mod drush;
pub mod path;
pub mod release;
pub mod remote;
pub mod site;
pub mod sync;

pub use backup::BackupOptions;
pub use config::Properties;
pub use release::{
    exec::{Executor, Output, PlanRunner, ProcessExecutor, RunError},
    plan::{DeploymentPlan, ReleaseState, Step},
    ReleaseOrchestrator, SiteOptions,
};
pub use remote::{RemoteSettings, Server};
pub use site::{state::InstallationState, SiteAlias};
