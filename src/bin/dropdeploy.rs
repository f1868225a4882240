// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use dropdeploy::{
    backup::{self, BackupOptions},
    config::{ConfigError, Properties},
    path::{default_properties_file, default_scratch_dir},
    release::archive_name,
    site::{
        registry,
        settings::{require_settings, ConfigIdentity},
        SiteAlias,
    },
    sync::{self, LocalTarget},
    DeploymentPlan, InstallationState, PlanRunner, ProcessExecutor, ReleaseOrchestrator,
    RemoteSettings, RunError, Server, SiteOptions,
};

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::Confirm;
use std::{path::PathBuf, process::exit, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  dropdeploy [options] <command> [<server>...] <user> <private-key>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to properties file.
    #[arg(short, long, global = true, value_name = "path")]
    pub properties: Option<PathBuf>,

    /// Print plan instead of running it.
    #[arg(short = 'n', long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let context = Context::load(self.properties, self.dry_run)?;
        match self.command {
            Command::Build(opts) => run_build(&context, opts).await,
            Command::Deploy(opts) => run_deploy(&context, opts).await,
            Command::Install(opts) => run_install(&context, opts).await,
            Command::Update(opts) => run_update(&context, opts).await,
            Command::Backup(opts) => run_backup(&context, opts).await,
            Command::Restore(opts) => run_restore(&context, opts).await,
            Command::DownloadBackup(opts) => run_download_backup(&context, opts).await,
            Command::UploadBackup(opts) => run_upload_backup(&context, opts).await,
            Command::Sync(opts) => run_sync(&context, opts).await,
            Command::SyncLocal(opts) => run_sync_local(&context, opts).await,
            Command::ClearCache(opts) => run_clear_cache(&context, opts).await,
            Command::SwitchPreviousRelease(opts) => run_switch_previous_release(&context, opts).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Build release archive locally.
    #[command(override_usage = "dropdeploy build [options] [archive]")]
    Build(BuildOptions),

    /// Build and release project to one or more servers.
    #[command(override_usage = "dropdeploy deploy [options] <server>... <user> <private-key>")]
    Deploy(DeployOptions),

    /// Install every site of the live release.
    #[command(override_usage = "dropdeploy install [options] <server> <user> <private-key>")]
    Install(SiteCommandOptions),

    /// Update every site of the live release.
    #[command(override_usage = "dropdeploy update [options] <server> <user> <private-key>")]
    Update(SiteCommandOptions),

    /// Back up files and databases.
    #[command(override_usage = "dropdeploy backup [options] <server> <user> <private-key>")]
    Backup(BackupCommandOptions),

    /// Restore files and databases from a backup.
    #[command(override_usage = "dropdeploy restore [options] <server> <user> <private-key>")]
    Restore(RestoreOptions),

    /// Copy a backup to the local machine.
    #[command(
        override_usage = "dropdeploy download-backup [options] <server> <user> <private-key>"
    )]
    DownloadBackup(TransferOptions),

    /// Copy a local backup to a server.
    #[command(override_usage = "dropdeploy upload-backup [options] <server> <user> <private-key>")]
    UploadBackup(TransferOptions),

    /// Copy files and databases from one server to another.
    #[command(
        override_usage = "dropdeploy sync [options] <source> <user> <private-key> <destination> <user> <private-key>"
    )]
    Sync(SyncOptions),

    /// Copy files and databases from a server to the local project.
    #[command(override_usage = "dropdeploy sync-local [options] <server> <user> <private-key>")]
    SyncLocal(SyncLocalOptions),

    /// Clear caches of every site.
    #[command(override_usage = "dropdeploy clear-cache [options] <server> <user> <private-key>")]
    ClearCache(TargetOptions),

    /// Point the live release back at the previous one.
    #[command(
        override_usage = "dropdeploy switch-previous-release [options] <server>... <user> <private-key>"
    )]
    SwitchPreviousRelease(ServersOptions),
}

#[derive(Args, Clone, Debug)]
struct TargetOptions {
    /// Host to connect to.
    #[arg(value_name = "server")]
    pub server: String,

    /// SSH user.
    #[arg(value_name = "user")]
    pub user: String,

    /// Path to SSH private key.
    #[arg(value_name = "private-key")]
    pub private_key: PathBuf,

    /// Application name.
    #[arg(short, long, default_value = "drupal", value_name = "name")]
    pub app: String,

    /// Only act on the site reached through this uri.
    #[arg(short, long, value_name = "uri")]
    pub uri: Option<String>,
}

#[derive(Args, Clone, Debug)]
struct ServersOptions {
    /// Hosts followed by SSH user and path to SSH private key.
    #[arg(required = true, num_args = 3.., value_name = "server")]
    pub args: Vec<String>,

    /// Application name.
    #[arg(short, long, default_value = "drupal", value_name = "name")]
    pub app: String,
}

impl ServersOptions {
    fn split(&self) -> Result<(Vec<String>, String, PathBuf)> {
        match self.args.as_slice() {
            [servers @ .., user, key] if !servers.is_empty() => {
                Ok((servers.to_vec(), user.clone(), PathBuf::from(key)))
            }
            _ => bail!("expected at least one server followed by user and private key"),
        }
    }
}

#[derive(Args, Clone, Debug)]
struct SiteArgs {
    /// Install profile.
    #[arg(long, default_value = "standard", value_name = "profile")]
    pub profile: String,

    /// Name of new sites.
    #[arg(long, default_value = "Drupal", value_name = "name")]
    pub site_name: String,

    /// Name of administrator account.
    #[arg(long, default_value = "admin", value_name = "name")]
    pub account_name: String,

    /// Mail of administrator account.
    #[arg(long, default_value = "admin@example.com", value_name = "mail")]
    pub account_mail: String,

    /// Password of administrator account.
    #[arg(long, value_name = "password")]
    pub account_pass: Option<String>,

    /// Install even if sites are already installed.
    #[arg(short, long)]
    pub force: bool,

    /// Import configuration after install or update.
    #[arg(short, long)]
    pub config_import: bool,

    /// Install from exported configuration.
    #[arg(short, long)]
    pub existing_config: bool,
}

impl SiteArgs {
    fn into_options(self, properties: &Properties, aliases: &[SiteAlias]) -> SiteOptions {
        let identities = if self.config_import {
            aliases
                .iter()
                .map(|alias| (alias.uri.clone(), ConfigIdentity::of(properties, alias)))
                .collect()
        } else {
            Default::default()
        };

        SiteOptions {
            profile: self.profile,
            site_name: self.site_name,
            account_name: self.account_name,
            account_mail: self.account_mail,
            account_pass: self.account_pass,
            force: self.force,
            config_import: self.config_import,
            existing_config: self.existing_config,
            identities,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct BackupFlags {
    /// Only files.
    #[arg(long)]
    pub files: bool,

    /// Only databases.
    #[arg(long)]
    pub data: bool,
}

impl BackupFlags {
    fn options(&self) -> BackupOptions {
        BackupOptions::new(self.files, self.data)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BuildOptions {
    /// Path of release archive to write.
    #[arg(value_name = "archive")]
    pub archive: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployOptions {
    #[command(flatten)]
    pub servers: ServersOptions,

    #[command(flatten)]
    pub site: SiteArgs,

    /// Server running backups and database operations, first one by default.
    #[arg(short, long, value_name = "server")]
    pub worker: Option<String>,

    /// Release archive to push instead of building one.
    #[arg(long, value_name = "archive")]
    pub archive: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SiteCommandOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(flatten)]
    pub site: SiteArgs,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct BackupCommandOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(flatten)]
    pub flags: BackupFlags,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RestoreOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(flatten)]
    pub flags: BackupFlags,

    /// Timestamp of backup, latest one by default.
    #[arg(short, long, value_name = "time")]
    pub timestamp: Option<i64>,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncLocalOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(flatten)]
    pub flags: BackupFlags,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct TransferOptions {
    #[command(flatten)]
    pub target: TargetOptions,

    #[command(flatten)]
    pub flags: BackupFlags,

    /// Timestamp of backup, latest one on the server by default.
    #[arg(short, long, value_name = "time")]
    pub timestamp: Option<i64>,

    /// Local backup directory, `[local] backupsdir` by default.
    #[arg(short, long, value_name = "path")]
    pub dir: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SyncOptions {
    /// Host to copy from.
    #[arg(value_name = "source")]
    pub source: String,

    /// SSH user of source.
    #[arg(value_name = "user")]
    pub source_user: String,

    /// Path to SSH private key of source.
    #[arg(value_name = "private-key")]
    pub source_key: PathBuf,

    /// Host to copy to.
    #[arg(value_name = "destination")]
    pub destination: String,

    /// SSH user of destination.
    #[arg(value_name = "user")]
    pub destination_user: String,

    /// Path to SSH private key of destination.
    #[arg(value_name = "private-key")]
    pub destination_key: PathBuf,

    /// Application name on source.
    #[arg(long, default_value = "drupal", value_name = "name")]
    pub source_app: String,

    /// Application name on destination, same as source by default.
    #[arg(long, value_name = "name")]
    pub destination_app: Option<String>,

    #[command(flatten)]
    pub flags: BackupFlags,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer().compact().with_target(false).without_time();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        let code = error
            .downcast_ref::<RunError>()
            .map(RunError::exit_code)
            .unwrap_or(1);
        exit(code);
    }

    exit(0)
}

async fn run() -> Result<()> {
    Cli::parse().run().await
}

/// Shared state of one invocation.
struct Context {
    properties: Properties,
    registry: Vec<(String, String)>,
    time: i64,
    dry_run: bool,
}

impl Context {
    fn load(path: Option<PathBuf>, dry_run: bool) -> Result<Self> {
        let properties = match path {
            Some(path) => Properties::load(path)?,
            None => match Properties::load(default_properties_file()) {
                Err(ConfigError::Missing(path)) => {
                    info!("no properties file at {}, using defaults", path.display());
                    Properties::default()
                }
                result => result?,
            },
        };
        let registry = registry::read(properties.registry_path())?;

        Ok(Self {
            properties,
            registry,
            time: Utc::now().timestamp(),
            dry_run,
        })
    }

    fn resolve(&self, server: Server, servers: &[String], app: &str) -> Result<RemoteSettings> {
        Ok(RemoteSettings::resolve(
            &self.properties,
            server,
            servers,
            app,
            self.time,
            &self.registry,
        )?)
    }

    fn target(&self, target: &TargetOptions) -> Result<RemoteSettings> {
        let server = Server::new(
            target.server.as_str(),
            target.user.as_str(),
            target.private_key.as_path(),
        );
        let mut settings = self.resolve(server, &[target.server.clone()], &target.app)?;

        if let Some(uri) = &target.uri {
            settings.aliases.retain(|alias| alias.uri == *uri);
            if settings.aliases.is_empty() {
                bail!("no site is reached through uri {uri:?}");
            }
        }

        Ok(settings)
    }

    fn targets(&self, opts: &ServersOptions) -> Result<Vec<RemoteSettings>> {
        let (servers, user, key) = opts.split()?;
        servers
            .iter()
            .map(|host| {
                self.resolve(
                    Server::new(host.as_str(), user.as_str(), key.as_path()),
                    &servers,
                    &opts.app,
                )
            })
            .collect()
    }

    async fn execute(&self, executor: &mut ProcessExecutor, plan: &DeploymentPlan) -> Result<()> {
        if self.dry_run {
            print!("{plan}");
            return Ok(());
        }

        let bar = ProgressBar::new_spinner();
        bar.set_style(ProgressStyle::with_template(
            "{elapsed_precise:.green}  {spinner:.yellow}  {msg}",
        )?);
        bar.enable_steady_tick(Duration::from_millis(100));

        let report = PlanRunner::new(executor)
            .with_progress(bar)
            .run(plan)
            .await
            .into_result()?;
        if !report.tolerated.is_empty() {
            warn!("{} steps failed without stopping the run", report.tolerated.len());
        }
        info!("finished {} steps", report.completed);

        Ok(())
    }

    async fn backup_time(
        &self,
        executor: &mut ProcessExecutor,
        settings: &RemoteSettings,
        timestamp: Option<i64>,
    ) -> Result<RemoteSettings> {
        let time = match timestamp {
            Some(time) => time,
            None => backup::latest_backup(executor, settings).await?,
        };

        Ok(settings.at_time(time)?)
    }
}

fn confirm(message: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }

    Ok(Confirm::new(message).with_default(false).prompt()?)
}

async fn run_build(context: &Context, opts: BuildOptions) -> Result<()> {
    let archive = opts
        .archive
        .unwrap_or_else(|| PathBuf::from(archive_name(context.time)));
    let mut executor = ProcessExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut executor, &mut state, &context.properties).build(&archive);
    context.execute(&mut executor, &plan).await
}

async fn run_deploy(context: &Context, opts: DeployOptions) -> Result<()> {
    let targets = context.targets(&opts.servers)?;
    let worker = match &opts.worker {
        Some(host) => targets
            .iter()
            .position(|target| target.server.host == *host)
            .ok_or_else(|| anyhow!("worker {host:?} is not one of the target servers"))?,
        None => 0,
    };
    let aliases = targets
        .get(worker)
        .map(|target| target.aliases.as_slice())
        .unwrap_or_default();
    require_settings(&context.properties, aliases)?;
    let archive = opts
        .archive
        .unwrap_or_else(|| PathBuf::from(archive_name(context.time)));
    let options = opts.site.into_options(&context.properties, aliases);

    let mut executor = ProcessExecutor::new();
    let mut probe = ProcessExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut probe, &mut state, &context.properties)
        .deploy(&targets, worker, &archive, &options)
        .await?;
    context.execute(&mut executor, &plan).await
}

async fn run_install(context: &Context, opts: SiteCommandOptions) -> Result<()> {
    let settings = context.target(&opts.target)?;
    require_settings(&context.properties, &settings.aliases)?;
    let options = opts.site.into_options(&context.properties, &settings.aliases);
    let mut executor = ProcessExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut executor, &mut state, &context.properties)
        .install(&settings, &options)
        .await;
    context.execute(&mut executor, &plan).await
}

async fn run_update(context: &Context, opts: SiteCommandOptions) -> Result<()> {
    let settings = context.target(&opts.target)?;
    let options = opts.site.into_options(&context.properties, &settings.aliases);
    let mut executor = ProcessExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut executor, &mut state, &context.properties)
        .update(&settings, &options)
        .await;
    context.execute(&mut executor, &plan).await
}

async fn run_clear_cache(context: &Context, opts: TargetOptions) -> Result<()> {
    let settings = context.target(&opts)?;
    let mut executor = ProcessExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut executor, &mut state, &context.properties)
        .clear_cache(&settings)
        .await;
    context.execute(&mut executor, &plan).await
}

async fn run_switch_previous_release(context: &Context, opts: ServersOptions) -> Result<()> {
    let targets = context.targets(&opts)?;
    let mut executor = ProcessExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut executor, &mut state, &context.properties)
        .switch_previous_release(&targets);
    context.execute(&mut executor, &plan).await
}

async fn run_backup(context: &Context, opts: BackupCommandOptions) -> Result<()> {
    let settings = context.target(&opts.target)?;
    let mut plan = DeploymentPlan::new();
    plan.extend(backup::backup(&settings, opts.flags.options()));
    plan.push(backup::cleanup(&settings));

    info!("backing up to {}", settings.backup_dir());
    context.execute(&mut ProcessExecutor::new(), &plan).await
}

async fn run_restore(context: &Context, opts: RestoreOptions) -> Result<()> {
    let mut executor = ProcessExecutor::new();
    let settings = context.target(&opts.target)?;
    let settings = context
        .backup_time(&mut executor, &settings, opts.timestamp)
        .await?;

    let message = format!(
        "Overwrite sites on {} with backup {}?",
        settings.server, settings.time
    );
    if !confirm(&message, opts.yes || context.dry_run)? {
        info!("restore cancelled");
        return Ok(());
    }

    let mut plan = DeploymentPlan::new();
    plan.extend(backup::restore(&settings, opts.flags.options()));
    let mut state = InstallationState::new();
    let cache = ReleaseOrchestrator::new(&mut executor, &mut state, &context.properties)
        .clear_cache(&settings)
        .await;
    plan.extend(cache.steps().iter().cloned());

    context.execute(&mut executor, &plan).await
}

async fn run_download_backup(context: &Context, opts: TransferOptions) -> Result<()> {
    let mut executor = ProcessExecutor::new();
    let settings = context.target(&opts.target)?;
    let settings = context
        .backup_time(&mut executor, &settings, opts.timestamp)
        .await?;
    let dir = opts
        .dir
        .unwrap_or_else(|| context.properties.local.backupsdir.join(settings.time.to_string()));

    if !context.dry_run {
        mkdirp::mkdirp(&dir)?;
    }
    let mut plan = DeploymentPlan::new();
    plan.extend(backup::download(&settings, &dir, opts.flags.options()));

    info!("downloading backup {} into {}", settings.time, dir.display());
    context.execute(&mut executor, &plan).await
}

async fn run_upload_backup(context: &Context, opts: TransferOptions) -> Result<()> {
    let time = opts
        .timestamp
        .ok_or_else(|| anyhow!("upload-backup needs --timestamp of the local backup"))?;
    let settings = context.target(&opts.target)?.at_time(time)?;
    let dir = opts
        .dir
        .unwrap_or_else(|| context.properties.local.backupsdir.join(time.to_string()));

    let mut plan = DeploymentPlan::new();
    plan.extend(backup::upload(&settings, &dir, opts.flags.options()));

    info!("uploading backup {time} from {}", dir.display());
    context.execute(&mut ProcessExecutor::new(), &plan).await
}

async fn run_sync(context: &Context, opts: SyncOptions) -> Result<()> {
    let destination_app = opts
        .destination_app
        .clone()
        .unwrap_or_else(|| opts.source_app.clone());
    let servers = [opts.source.clone(), opts.destination.clone()];
    let source = context.resolve(
        Server::new(opts.source.as_str(), opts.source_user.as_str(), opts.source_key.as_path()),
        &servers,
        &opts.source_app,
    )?;
    let destination = context.resolve(
        Server::new(
            opts.destination.as_str(),
            opts.destination_user.as_str(),
            opts.destination_key.as_path(),
        ),
        &servers,
        &destination_app,
    )?;

    let message = format!(
        "Overwrite sites on {} with the sites of {}?",
        destination.server, source.server
    );
    if !confirm(&message, opts.yes || context.dry_run)? {
        info!("sync cancelled");
        return Ok(());
    }

    let workdir = default_scratch_dir()?.join(context.time.to_string());
    let plan = sync::sync(&source, &destination, &workdir, opts.flags.options())?;
    context.execute(&mut ProcessExecutor::new(), &plan).await
}

async fn run_sync_local(context: &Context, opts: SyncLocalOptions) -> Result<()> {
    let source = context.target(&opts.target)?;
    let local = LocalTarget::from_properties(&context.properties);

    let message = format!(
        "Overwrite local project in {} with the sites of {}?",
        local.root.display(),
        source.server
    );
    if !confirm(&message, opts.yes || context.dry_run)? {
        info!("sync cancelled");
        return Ok(());
    }

    let workdir = default_scratch_dir()?.join(context.time.to_string());
    let plan = sync::sync_local(&source, &local, &workdir, opts.flags.options());
    context.execute(&mut ProcessExecutor::new(), &plan).await
}
