// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{labels, properties, settings, FakeExecutor, Reply, TIME};

use anyhow::Result;
use dropdeploy::{
    backup::{self, BackupError},
    release::{exec::TIMEOUT_STATUS, plan::ReleaseState},
    DeploymentPlan, InstallationState, PlanRunner, ReleaseOrchestrator, SiteOptions,
};
use pretty_assertions::assert_eq;
use simple_test_case::test_case;

async fn deploy_plan(executor: &mut FakeExecutor, options: &SiteOptions) -> Result<DeploymentPlan> {
    let properties = properties();
    let target = settings(&properties, "web1", &[])?;
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(executor, &mut state, &properties)
        .deploy(&[target], 0, "/tmp/1700000000.tar.gz", options)
        .await?;

    Ok(plan)
}

#[tokio::test]
async fn deploy_installed_site_backs_up_then_updates() -> Result<()> {
    let mut probe = FakeExecutor::new();
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;

    let steps = labels(plan.steps())
        .into_iter()
        .filter(|label| !label.starts_with("link "))
        .collect::<Vec<_>>();
    assert_eq!(
        steps,
        vec![
            "build: composer install --no-dev --optimize-autoloader",
            "pack release archive",
            "create backup directory",
            "back up files",
            "back up database of default",
            "create release directory",
            "upload release archive",
            "extract release archive",
            "switch current release",
            "enable maintenance mode of default",
            "update database of default",
            "clear caches of default",
            "update translations of default",
            "disable maintenance mode of default",
            "clear caches of default",
            "invalidate purge queue of default",
            "remove old releases",
            "remove old backups",
        ]
    );
    assert_eq!(plan.checkpoint(), Some(5));
    assert_eq!(
        plan.rollback()
            .iter()
            .map(|action| action.label.as_str())
            .collect::<Vec<_>>(),
        vec!["restore backup", "switch back to previous release"]
    );
    assert_eq!(
        probe.calls,
        vec![
            "detect drush version",
            "check if default is installed",
        ]
    );

    Ok(())
}

#[tokio::test]
async fn rollback_leaves_current_alone_without_previous_release() -> Result<()> {
    let mut planner = FakeExecutor::new();
    let plan = deploy_plan(&mut planner, &SiteOptions::default()).await?;
    let revert = plan
        .rollback()
        .iter()
        .find(|action| action.label == "switch back to previous release")
        .ok_or(anyhow::anyhow!("no revert action"))?;

    assert_eq!(
        revert.steps[0].action.to_string(),
        "web1: previous=$(ls -vd /srv/shop/releases/* | grep -v '/1700000000$' | tail -n1) && \
         [[ -n \"$previous\" ]] && ln -sfn \"$previous\" /srv/shop/current"
    );

    Ok(())
}

#[tokio::test]
async fn deploy_fresh_site_installs_without_checkpoint() -> Result<()> {
    let mut probe = FakeExecutor::new().reply("is installed", Reply::Exit(1, ""));
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;
    let steps = labels(plan.steps());

    assert!(steps.contains(&"install default"));
    assert!(steps.contains(&"protect settings of default"));
    assert!(!steps.contains(&"back up files"));
    assert!(!steps.contains(&"update database of default"));
    assert_eq!(plan.checkpoint(), None);
    assert!(plan.rollback().is_empty());

    Ok(())
}

#[tokio::test]
async fn deploy_updates_every_site_of_multisite() -> Result<()> {
    let properties = properties();
    let registry = vec![
        ("shop.example.com".to_string(), "shop".to_string()),
        ("blog.example.com".to_string(), "blog".to_string()),
        ("www.shop.example.com".to_string(), "shop".to_string()),
    ];
    let target = settings(&properties, "web1", &registry)?;
    let mut probe = FakeExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut probe, &mut state, &properties)
        .deploy(&[target], 0, "/tmp/release.tar.gz", &SiteOptions::default())
        .await?;

    let updates = plan
        .steps()
        .iter()
        .filter(|step| step.label.starts_with("update database of"))
        .map(|step| step.action.to_string())
        .collect::<Vec<_>>();
    assert_eq!(updates.len(), 2);
    assert!(updates[0].contains("--uri=shop.example.com "));
    assert!(updates[1].contains("--uri=blog.example.com "));
    assert_eq!(probe.calls_matching("is installed"), 2);

    Ok(())
}

#[tokio::test]
async fn deploy_installs_or_updates_each_site_on_its_own() -> Result<()> {
    let properties = properties();
    let registry = vec![
        ("shop.example.com".to_string(), "shop".to_string()),
        ("blog.example.com".to_string(), "blog".to_string()),
    ];
    let target = settings(&properties, "web1", &registry)?;
    let mut planner = FakeExecutor::new()
        .reply("shop.example.com (shop) is installed", Reply::Exit(1, ""))
        .reply("blog.example.com (blog) is installed", Reply::Exit(0, ""));
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut planner, &mut state, &properties)
        .deploy(&[target], 0, "/tmp/release.tar.gz", &SiteOptions::default())
        .await?;
    let steps = labels(plan.steps());

    let count = |prefix: &str| steps.iter().filter(|label| label.starts_with(prefix)).count();
    assert_eq!(count("install shop.example.com (shop)"), 1);
    assert_eq!(count("update database of blog.example.com (blog)"), 1);
    assert_eq!(count("install "), 1);
    assert_eq!(count("update database of "), 1);
    assert!(!steps.contains(&"back up files"));
    assert_eq!(plan.checkpoint(), None);

    Ok(())
}

#[tokio::test]
async fn failure_before_checkpoint_skips_rollback() -> Result<()> {
    let mut probe = FakeExecutor::new();
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;

    let mut executor = FakeExecutor::new().reply("pack release archive", Reply::Exit(3, ""));
    let report = PlanRunner::new(&mut executor).run(&plan).await;

    assert!(!report.success());
    assert_eq!(report.completed, 1);
    assert_eq!(report.rollback, None);
    assert_eq!(executor.calls.len(), 2);
    let error = report.into_result().err().ok_or(anyhow::anyhow!("expected failure"))?;
    assert_eq!(error.exit_code(), 3);

    Ok(())
}

#[tokio::test]
async fn failure_after_checkpoint_rolls_back_newest_first() -> Result<()> {
    let mut probe = FakeExecutor::new();
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;

    let mut executor = FakeExecutor::new().reply("update database", Reply::Exit(1, ""));
    let report = PlanRunner::new(&mut executor).run(&plan).await;

    let failure = report
        .failure
        .as_ref()
        .ok_or(anyhow::anyhow!("expected failure"))?;
    assert_eq!(failure.label, "update database of default");
    assert_eq!(failure.phase, Some(ReleaseState::InstalledOrUpdated));

    let rollback = report
        .rollback
        .as_ref()
        .ok_or(anyhow::anyhow!("expected rollback"))?;
    assert_eq!(rollback.attempted, 4);
    assert!(rollback.failures.is_empty());

    let tail = &executor.calls[executor.calls.len() - 5..];
    assert_eq!(
        tail,
        [
            "update database of default",
            "switch back to previous release",
            "restore files",
            "drop database of default",
            "restore database of default",
        ]
    );

    Ok(())
}

#[tokio::test]
async fn rollback_keeps_going_past_failed_steps() -> Result<()> {
    let mut probe = FakeExecutor::new();
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;

    let mut executor = FakeExecutor::new()
        .reply("clear caches", Reply::Exit(1, ""))
        .reply("switch back", Reply::Exit(2, ""));
    let report = PlanRunner::new(&mut executor).run(&plan).await;

    let rollback = report
        .rollback
        .as_ref()
        .ok_or(anyhow::anyhow!("expected rollback"))?;
    assert_eq!(rollback.attempted, 4);
    assert_eq!(rollback.failures.len(), 1);
    assert_eq!(rollback.failures[0].phase, Some(ReleaseState::RolledBack));
    assert_eq!(executor.calls_matching("restore database"), 1);

    // INVARIANT: The step that failed decides the exit code, not the rollback.
    assert_eq!(report.into_result().map_err(|error| error.exit_code()).err(), Some(1));

    Ok(())
}

#[tokio::test]
async fn tolerated_failures_do_not_fail_run() -> Result<()> {
    let mut probe = FakeExecutor::new();
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;

    let mut executor = FakeExecutor::new()
        .reply("update translations", Reply::Exit(1, ""))
        .reply("remove old", Reply::Exit(1, ""));
    let report = PlanRunner::new(&mut executor).run(&plan).await;

    assert!(report.success());
    assert_eq!(report.tolerated.len(), 3);
    assert_eq!(report.completed, plan.len() - 3);
    assert_eq!(report.rollback, None);

    Ok(())
}

#[tokio::test]
async fn timeout_reports_timeout_status() -> Result<()> {
    let mut probe = FakeExecutor::new();
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;

    let mut executor = FakeExecutor::new().reply("upload release archive", Reply::Timeout);
    let error = PlanRunner::new(&mut executor)
        .run(&plan)
        .await
        .into_result()
        .err()
        .ok_or(anyhow::anyhow!("expected failure"))?;

    assert_eq!(error.exit_code(), TIMEOUT_STATUS);
    assert!(error.rollback.is_some());

    Ok(())
}

#[test_case(false, true; "guarded")]
#[test_case(true, false; "forced")]
#[tokio::test]
async fn install_guard_unless_forced(force: bool, guarded: bool) -> Result<()> {
    let options = SiteOptions {
        force,
        ..SiteOptions::default()
    };
    let mut probe = FakeExecutor::new().reply("is installed", Reply::Exit(1, ""));
    let plan = deploy_plan(&mut probe, &options).await?;
    let install = plan
        .steps()
        .iter()
        .find(|step| step.label == "install default")
        .ok_or(anyhow::anyhow!("no install step"))?
        .action
        .to_string();

    assert!(install.contains("site-install standard -y --site-name=Drupal"));
    pretty_assertions::assert_eq!(install.contains("[[ $("), guarded);

    Ok(())
}

#[tokio::test]
async fn install_rerun_stays_guarded() -> Result<()> {
    let properties = properties();
    let target = settings(&properties, "web1", &[])?;
    let mut planner = FakeExecutor::new();
    let mut state = InstallationState::new();
    let mut orchestrator = ReleaseOrchestrator::new(&mut planner, &mut state, &properties);

    for _ in 0..2 {
        let plan = orchestrator.install(&target, &SiteOptions::default()).await;
        let install = plan
            .steps()
            .iter()
            .find(|step| step.label == "install default")
            .ok_or(anyhow::anyhow!("no install step"))?
            .action
            .to_string();
        assert!(install.contains("[[ $("));
        assert!(install.contains("site-install"));
    }

    Ok(())
}

#[tokio::test]
async fn purge_invalidation_is_checked_when_step_runs() -> Result<()> {
    let mut planner = FakeExecutor::new();
    let plan = deploy_plan(&mut planner, &SiteOptions::default()).await?;
    assert_eq!(planner.calls_matching("purge"), 0);

    let invalidate = plan
        .steps()
        .iter()
        .find(|step| step.label == "invalidate purge queue of default")
        .ok_or(anyhow::anyhow!("no purge step"))?;
    let command = invalidate.action.to_string();
    assert!(invalidate.allow_failure);
    assert!(command.contains("| grep -q '^purge_drush$' && "));
    assert!(command.ends_with("|| echo 'Purge queue not invalidated.'"));
    assert!(!command.contains(" cr "));

    let mut executor = FakeExecutor::new().reply("invalidate purge queue", Reply::Exit(1, ""));
    let report = PlanRunner::new(&mut executor).run(&plan).await;
    assert!(report.success());
    assert_eq!(report.rollback, None);

    Ok(())
}

#[tokio::test]
async fn legacy_drush_changes_module_patterns() -> Result<()> {
    let mut probe =
        FakeExecutor::new().reply("detect drush", Reply::Exit(0, "Drush Version   :  8.1.17"));
    let plan = deploy_plan(&mut probe, &SiteOptions::default()).await?;
    let locale = plan
        .steps()
        .iter()
        .find(|step| step.label == "update translations of default")
        .ok_or(anyhow::anyhow!("no locale step"))?
        .action
        .to_string();

    assert!(locale.contains("grep '(locale)'"));

    Ok(())
}

#[tokio::test]
async fn installation_state_probes_once() -> Result<()> {
    let properties = properties();
    let target = settings(&properties, "web1", &[])?;
    let mut probe = FakeExecutor::new().reply("is installed", Reply::Timeout);
    let mut state = InstallationState::new();

    assert!(!state.is_site_installed(&mut probe, &target).await);
    assert!(!state.is_site_installed(&mut probe, &target).await);
    assert_eq!(probe.calls.len(), 1);

    Ok(())
}

#[tokio::test]
async fn installation_override_answers_without_asking() -> Result<()> {
    let properties = properties();
    let target = settings(&properties, "web1", &[])?;
    let alias = target.aliases[0].clone();
    let mut executor = FakeExecutor::new().reply("is installed", Reply::Exit(1, ""));
    let mut state = InstallationState::new();

    state.set_installed(&alias, true);
    assert!(state.is_installed(&mut executor, &target, &alias).await);
    assert!(state.is_site_installed(&mut executor, &target).await);
    assert!(executor.calls.is_empty());
    assert_eq!(state.aggregate(&target.aliases), None);

    Ok(())
}

#[test_case(Reply::Exit(0, "1700000000"), Some(TIME); "latest")]
#[test_case(Reply::Exit(0, ""), None; "empty")]
#[test_case(Reply::Exit(2, ""), None; "unreadable")]
#[tokio::test]
async fn latest_backup_lookup(reply: Reply, expect: Option<i64>) -> Result<()> {
    let properties = properties();
    let target = settings(&properties, "web1", &[])?;
    let mut probe = FakeExecutor::new().reply("find latest backup", reply);

    let result = backup::latest_backup(&mut probe, &target).await;
    match expect {
        Some(time) => pretty_assertions::assert_eq!(result?, time),
        None => assert!(matches!(
            result,
            Err(BackupError::NoBackups(_) | BackupError::Probe(_))
        )),
    }

    Ok(())
}

#[tokio::test]
async fn switch_previous_release_points_current_back() -> Result<()> {
    let properties = properties();
    let target = settings(&properties, "web1", &[])?;
    let mut probe = FakeExecutor::new();
    let mut state = InstallationState::new();
    let plan = ReleaseOrchestrator::new(&mut probe, &mut state, &properties)
        .switch_previous_release(&[target]);

    assert_eq!(labels(plan.steps()), vec!["switch to previous release"]);
    assert_eq!(
        plan.steps()[0].action.to_string(),
        "web1: previous=$(ls -vdr /srv/shop/releases/* | head -n2 | tail -n1) && \
         [[ -n \"$previous\" ]] && ln -sfn \"$previous\" /srv/shop/current"
    );
    assert!(probe.calls.is_empty());

    Ok(())
}
