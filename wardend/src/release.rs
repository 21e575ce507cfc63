//! Release manager: clone, build, publish, restart, prune, rollback.
//!
//! Releases are immutable timestamped directories under
//! `<data_dir>/releases/<project>/`; exactly one is live via the `current`
//! symlink. The symlink is only ever replaced atomically (symlink + rename)
//! and only after a successful build, so `current` always points at a
//! directory that exists and built cleanly. Restart failures after the swap
//! are surfaced but do not revert the symlink (fail-forward).

use crate::config::ProjectConfig;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::info;
use warden_common::fs::atomic_write;

const RELEASES_DIR: &str = "releases";
const CURRENT_LINK: &str = "current";
const BUILD_LOG: &str = "build.log";
const LAST_DEPLOY_FILE: &str = "last_deploy.json";

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("git clone failed:\n{output}")]
    Clone { output: String },
    #[error("build failed, log attached")]
    Build { log_path: PathBuf },
    #[error("restart failed after publishing {release}:\n{output}")]
    Restart { release: String, output: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastDeploy {
    pub project: String,
    pub release: String,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReleaseInfo {
    pub name: String,
    pub is_current: bool,
}

#[derive(Debug)]
pub struct DeployReport {
    pub project: String,
    pub release: String,
    pub pruned: Vec<String>,
}

#[derive(Clone)]
pub struct ReleaseManager {
    root: PathBuf,
}

impl ReleaseManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(RELEASES_DIR),
        }
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join(project)
    }

    /// Releases on disk, oldest first, with the `current` target marked.
    pub fn list_releases(&self, project: &str) -> Result<Vec<ReleaseInfo>> {
        let project_dir = self.project_dir(project);
        let current = self.current_release(project);

        let mut names = Vec::new();
        match std::fs::read_dir(&project_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if is_release_name(&name) && entry.path().is_dir() {
                        names.push(name);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to list '{}'", project_dir.display()))
            }
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| ReleaseInfo {
                is_current: current.as_deref() == Some(name.as_str()),
                name,
            })
            .collect())
    }

    /// Name of the release the `current` symlink points at, if any.
    pub fn current_release(&self, project: &str) -> Option<String> {
        let link = self.project_dir(project).join(CURRENT_LINK);
        let target = std::fs::read_link(link).ok()?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// The (newest, previous) pair a rollback would move between.
    /// None unless at least two releases exist.
    pub fn rollback_target(&self, project: &str) -> Result<Option<(String, String)>> {
        let releases = self.list_releases(project)?;
        if releases.len() < 2 {
            return Ok(None);
        }
        let newest = releases[releases.len() - 1].name.clone();
        let previous = releases[releases.len() - 2].name.clone();
        Ok(Some((newest, previous)))
    }

    pub fn last_deploy(&self, project: &str) -> Option<LastDeploy> {
        let path = self.project_dir(project).join(LAST_DEPLOY_FILE);
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Run the full deploy pipeline for one configured project.
    pub async fn deploy(
        &self,
        project: &str,
        cfg: &ProjectConfig,
    ) -> Result<DeployReport, DeployError> {
        let project_dir = self.project_dir(project);
        std::fs::create_dir_all(&project_dir)
            .with_context(|| format!("failed to create '{}'", project_dir.display()))?;

        let release = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let release_dir = project_dir.join(&release);
        if release_dir.exists() {
            return Err(anyhow!("release directory {} already exists", release).into());
        }

        // 1. Shallow clone into the new release directory.
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--branch", &cfg.branch, "--"])
            .arg(&cfg.git_url)
            .arg(&release_dir)
            .output()
            .await
            .context("failed to run git")?;
        if !output.status.success() {
            let combined = combine_output(&output.stdout, &output.stderr);
            let _ = std::fs::remove_dir_all(&release_dir);
            return Err(DeployError::Clone { output: combined });
        }

        // 2. Build; a failure discards the release before it can go live.
        if let Some(build_cmd) = &cfg.build_cmd {
            let (success, combined) = run_shell(build_cmd, &release_dir).await?;
            if success {
                let _ = std::fs::write(release_dir.join(BUILD_LOG), &combined);
            } else {
                let log_path = project_dir.join(format!("build-{}.log", release));
                std::fs::write(&log_path, &combined).with_context(|| {
                    format!("failed to write build log '{}'", log_path.display())
                })?;
                let _ = std::fs::remove_dir_all(&release_dir);
                return Err(DeployError::Build { log_path });
            }
        }

        // 3. Atomically publish.
        switch_current(&project_dir, &release)?;
        info!(project, release = %release, "release published");

        // 4. Restart. Fail-forward: the symlink stays on the new release.
        if let Some(restart_cmd) = &cfg.restart_cmd {
            let (success, combined) = run_shell(restart_cmd, &release_dir).await?;
            if !success {
                return Err(DeployError::Restart {
                    release,
                    output: combined,
                });
            }
        }

        // 5. Retention.
        let pruned = self.prune(project, cfg.retain)?;

        // 6. Metadata for status queries.
        self.record_last_deploy(project, &release)?;

        Ok(DeployReport {
            project: project.to_string(),
            release,
            pruned,
        })
    }

    /// Repoint `current` at an existing prior release and restart.
    pub async fn rollback(
        &self,
        project: &str,
        cfg: &ProjectConfig,
        release: &str,
    ) -> Result<(), DeployError> {
        let project_dir = self.project_dir(project);
        let release_dir = project_dir.join(release);
        if !release_dir.is_dir() {
            return Err(anyhow!("release {} is no longer on disk", release).into());
        }

        switch_current(&project_dir, release)?;
        info!(project, release, "rolled back");

        if let Some(restart_cmd) = &cfg.restart_cmd {
            let (success, combined) = run_shell(restart_cmd, &release_dir).await?;
            if !success {
                return Err(DeployError::Restart {
                    release: release.to_string(),
                    output: combined,
                });
            }
        }

        self.record_last_deploy(project, release)?;
        Ok(())
    }

    /// Delete releases beyond `retain`, oldest first, never the current one.
    fn prune(&self, project: &str, retain: usize) -> Result<Vec<String>> {
        let releases = self.list_releases(project)?;
        if releases.len() <= retain {
            return Ok(Vec::new());
        }

        let excess = releases.len() - retain;
        let project_dir = self.project_dir(project);
        let mut pruned = Vec::new();
        for info in &releases {
            if pruned.len() >= excess {
                break;
            }
            if info.is_current {
                continue;
            }
            std::fs::remove_dir_all(project_dir.join(&info.name))
                .with_context(|| format!("failed to prune release {}", info.name))?;
            pruned.push(info.name.clone());
        }
        Ok(pruned)
    }

    fn record_last_deploy(&self, project: &str, release: &str) -> Result<()> {
        let meta = LastDeploy {
            project: project.to_string(),
            release: release.to_string(),
            deployed_at: Utc::now(),
        };
        atomic_write(
            &self.project_dir(project).join(LAST_DEPLOY_FILE),
            &serde_json::to_vec_pretty(&meta)?,
        )
    }
}

/// Replace the `current` symlink atomically: never a copy-and-delete, and
/// never a window where the link is missing.
fn switch_current(project_dir: &Path, release: &str) -> Result<()> {
    let tmp = project_dir.join(format!("{}.tmp", CURRENT_LINK));
    let _ = std::fs::remove_file(&tmp);
    std::os::unix::fs::symlink(release, &tmp)
        .with_context(|| format!("failed to create symlink for {}", release))?;
    std::fs::rename(&tmp, project_dir.join(CURRENT_LINK))
        .with_context(|| format!("failed to publish symlink for {}", release))?;
    Ok(())
}

fn is_release_name(name: &str) -> bool {
    name.len() == 14 && name.chars().all(|c| c.is_ascii_digit())
}

async fn run_shell(command: &str, cwd: &Path) -> Result<(bool, String)> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()
        .await
        .with_context(|| format!("failed to run '{}'", command))?;
    Ok((
        output.status.success(),
        combine_output(&output.stdout, &output.stderr),
    ))
}

fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).into_owned();
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&String::from_utf8_lossy(stderr));
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_releases(manager: &ReleaseManager, project: &str, names: &[&str]) {
        let project_dir = manager.project_dir(project);
        for name in names {
            std::fs::create_dir_all(project_dir.join(name)).unwrap();
        }
    }

    #[test]
    fn listing_is_sorted_and_marks_current() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        seed_releases(
            &manager,
            "api",
            &["20260102030405", "20260101010101", "20260103000000"],
        );
        switch_current(&manager.project_dir("api"), "20260102030405").unwrap();

        let releases = manager.list_releases("api").unwrap();
        let names: Vec<_> = releases.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            ["20260101010101", "20260102030405", "20260103000000"]
        );
        assert!(releases[1].is_current);
        assert!(!releases[0].is_current);
        assert_eq!(
            manager.current_release("api").as_deref(),
            Some("20260102030405")
        );
    }

    #[test]
    fn unknown_project_lists_empty() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        assert!(manager.list_releases("ghost").unwrap().is_empty());
        assert!(manager.current_release("ghost").is_none());
        assert!(manager.rollback_target("ghost").unwrap().is_none());
    }

    #[test]
    fn switch_current_is_a_replace() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        seed_releases(&manager, "api", &["20260101010101", "20260102020202"]);

        let project_dir = manager.project_dir("api");
        switch_current(&project_dir, "20260101010101").unwrap();
        switch_current(&project_dir, "20260102020202").unwrap();
        assert_eq!(
            manager.current_release("api").as_deref(),
            Some("20260102020202")
        );
        // The temp link never lingers.
        assert!(!project_dir.join("current.tmp").exists());
    }

    #[test]
    fn rollback_target_needs_two_releases() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        seed_releases(&manager, "api", &["20260101010101"]);
        assert!(manager.rollback_target("api").unwrap().is_none());

        seed_releases(&manager, "api", &["20260102020202"]);
        let (newest, previous) = manager.rollback_target("api").unwrap().unwrap();
        assert_eq!(newest, "20260102020202");
        assert_eq!(previous, "20260101010101");
    }

    #[test]
    fn prune_keeps_newest_and_never_the_current() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        seed_releases(
            &manager,
            "api",
            &[
                "20260101000000",
                "20260102000000",
                "20260103000000",
                "20260104000000",
            ],
        );
        // Current pinned on an old release: prune must skip it.
        switch_current(&manager.project_dir("api"), "20260101000000").unwrap();

        let pruned = manager.prune("api", 2).unwrap();
        assert_eq!(pruned, ["20260102000000", "20260103000000"]);

        let left: Vec<_> = manager
            .list_releases("api")
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(left, ["20260101000000", "20260104000000"]);
    }

    #[test]
    fn prune_with_current_on_newest_keeps_exactly_retain() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        let names = [
            "20260101000000",
            "20260102000000",
            "20260103000000",
            "20260104000000",
            "20260105000000",
        ];
        seed_releases(&manager, "api", &names);
        switch_current(&manager.project_dir("api"), "20260105000000").unwrap();

        let pruned = manager.prune("api", 3).unwrap();
        assert_eq!(pruned, ["20260101000000", "20260102000000"]);

        let left = manager.list_releases("api").unwrap();
        assert_eq!(left.len(), 3);
        assert!(left.iter().all(|r| r.name >= "20260103000000".to_string()));
        assert!(left.last().unwrap().is_current);
    }

    #[test]
    fn release_names_are_strictly_timestamps() {
        assert!(is_release_name("20260807120000"));
        assert!(!is_release_name("current"));
        assert!(!is_release_name("build-20260807120000.log"));
        assert!(!is_release_name("2026080712000"));
    }

    // --- pipeline tests against a local git repository ----------------------

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args([
                "-c",
                "user.email=wardend@test",
                "-c",
                "user.name=wardend",
                "-c",
                "init.defaultBranch=main",
            ])
            .args(args)
            .current_dir(dir)
            .status()
            .expect("run git");
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_source_repo(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        git(dir, &["init"]);
        std::fs::write(dir.join("app.sh"), "#!/bin/sh\necho app\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "initial"]);
    }

    fn project(source: &Path, build_cmd: Option<&str>, restart_cmd: Option<&str>) -> ProjectConfig {
        ProjectConfig {
            git_url: source.display().to_string(),
            branch: "main".to_string(),
            build_cmd: build_cmd.map(str::to_string),
            restart_cmd: restart_cmd.map(str::to_string),
            retain: 5,
        }
    }

    #[tokio::test]
    async fn deploy_publishes_builds_and_records_metadata() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        init_source_repo(&source);

        let manager = ReleaseManager::new(&dir.path().join("data"));
        let cfg = project(&source, Some("touch built.marker"), Some("true"));

        let report = manager.deploy("api", &cfg).await.unwrap();
        assert_eq!(report.project, "api");
        assert!(report.pruned.is_empty());

        assert_eq!(
            manager.current_release("api").as_deref(),
            Some(report.release.as_str())
        );
        let release_dir = manager.project_dir("api").join(&report.release);
        assert!(release_dir.join("app.sh").is_file());
        assert!(release_dir.join("built.marker").is_file());
        assert!(release_dir.join(BUILD_LOG).is_file());

        let meta = manager.last_deploy("api").expect("metadata written");
        assert_eq!(meta.release, report.release);
    }

    #[tokio::test]
    async fn failed_build_discards_the_release_and_keeps_current() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        init_source_repo(&source);

        let manager = ReleaseManager::new(&dir.path().join("data"));

        let good = project(&source, None, None);
        let first = manager.deploy("api", &good).await.unwrap();

        // Release names have second resolution.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let bad = project(&source, Some("echo boom >&2; exit 1"), None);
        let err = manager.deploy("api", &bad).await.unwrap_err();
        let log_path = match err {
            DeployError::Build { log_path } => log_path,
            other => panic!("expected Build error, got {:?}", other),
        };

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("boom"));

        // The broken release is gone and the symlink never moved.
        let releases = manager.list_releases("api").unwrap();
        assert_eq!(releases.len(), 1);
        assert_eq!(releases[0].name, first.release);
        assert_eq!(
            manager.current_release("api").as_deref(),
            Some(first.release.as_str())
        );
    }

    #[tokio::test]
    async fn clone_failure_leaves_no_release_directory() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(&dir.path().join("data"));
        let cfg = project(&dir.path().join("missing-repo"), None, None);

        let err = manager.deploy("api", &cfg).await.unwrap_err();
        assert!(matches!(err, DeployError::Clone { .. }));
        assert!(manager.list_releases("api").unwrap().is_empty());
        assert!(manager.current_release("api").is_none());
    }

    #[tokio::test]
    async fn rollback_repoints_and_survives_restart_failure() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        seed_releases(&manager, "api", &["20260101000000", "20260102000000"]);
        switch_current(&manager.project_dir("api"), "20260102000000").unwrap();

        let cfg = ProjectConfig {
            git_url: "unused".to_string(),
            branch: "main".to_string(),
            build_cmd: None,
            restart_cmd: Some("true".to_string()),
            retain: 5,
        };
        manager.rollback("api", &cfg, "20260101000000").await.unwrap();
        assert_eq!(
            manager.current_release("api").as_deref(),
            Some("20260101000000")
        );
        assert_eq!(
            manager.last_deploy("api").unwrap().release,
            "20260101000000"
        );

        // Fail-forward: a failing restart leaves the symlink where it was put.
        let failing = ProjectConfig {
            restart_cmd: Some("exit 5".to_string()),
            ..cfg
        };
        let err = manager
            .rollback("api", &failing, "20260102000000")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Restart { .. }));
        assert_eq!(
            manager.current_release("api").as_deref(),
            Some("20260102000000")
        );
    }

    #[tokio::test]
    async fn rollback_to_a_pruned_release_is_refused() {
        let dir = TempDir::new().unwrap();
        let manager = ReleaseManager::new(dir.path());
        seed_releases(&manager, "api", &["20260102000000"]);

        let cfg = ProjectConfig {
            git_url: "unused".to_string(),
            branch: "main".to_string(),
            build_cmd: None,
            restart_cmd: None,
            retain: 5,
        };
        let err = manager
            .rollback("api", &cfg, "20260101000000")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Other(_)));
        assert!(manager.current_release("api").is_none());
    }
}
