//! Isolated working copies for parallel tasks.
//!
//! Each task gets its own `git worktree` on its own branch, forked from the
//! base branch, or from the branches of the dependencies it builds on. Only
//! merges touch the main working tree, and the coordinator runs them one at
//! a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::errors::MergeError;
use crate::tracker::Task;
use crate::util::slugify;

/// A provisioned working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskWorkspace {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Result of merging one task branch into the main line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// The merge stopped with these files conflicted; the main tree is mid-merge.
    Conflict { files: Vec<String> },
}

/// Version-control operations the parallel coordinator needs.
///
/// Real implementation: `GitWorkspace`. Tests use in-memory doubles.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Create an isolated working copy and branch for `task`. `scope`
    /// namespaces branches and paths (the run id). `bases` are the branches
    /// of finished dependencies; the new branch starts from all of them.
    /// Provisioning the same task again in the same scope starts over.
    async fn provision(&self, scope: &str, task: &Task, bases: &[String]) -> Result<TaskWorkspace>;

    /// Commit everything in the working copy. `Ok(false)` when nothing changed.
    async fn commit(&self, ws: &TaskWorkspace, message: &str) -> Result<bool>;

    /// Merge the task branch into the main line.
    async fn merge(&self, ws: &TaskWorkspace) -> Result<MergeOutcome, MergeError>;

    /// Conclude a conflicted merge once the conflicts were edited away.
    async fn finish_merge(&self, ws: &TaskWorkspace) -> Result<MergeOutcome, MergeError>;

    /// Abandon a conflicted merge, restoring the main tree.
    async fn abort_merge(&self) -> Result<()>;

    /// Remove the working copy. The branch is kept.
    async fn cleanup(&self, ws: &TaskWorkspace) -> Result<()>;

    /// Directory holding the main line, where merges and conflict fixes happen.
    fn main_dir(&self) -> &Path;
}

/// `Workspace` over the `git` CLI.
pub struct GitWorkspace {
    project_dir: PathBuf,
    worktrees_dir: PathBuf,
    base_branch: Option<String>,
}

struct GitOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl GitWorkspace {
    pub fn new(project_dir: PathBuf, worktrees_dir: PathBuf, base_branch: Option<String>) -> Self {
        Self {
            project_dir,
            worktrees_dir,
            base_branch,
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<String, MergeError> {
        let out = self.git(dir, args).await?;
        if !out.success {
            return Err(MergeError::Git {
                command: args.join(" "),
                stderr: out.stderr,
            });
        }
        Ok(out.stdout)
    }

    async fn conflicted_files(&self) -> Result<Vec<String>, MergeError> {
        let stdout = self
            .git_ok(&self.project_dir, &["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Drop the worktree and branch a previous attempt left under this name.
    async fn discard_previous(&self, path: &Path, path_str: &str, branch: &str) -> Result<()> {
        if path.exists() {
            let out = self
                .git(&self.project_dir, &["worktree", "remove", "--force", path_str])
                .await?;
            if !out.success {
                tracing::warn!(path = %path.display(), stderr = %out.stderr, "stale worktree not removed");
            }
        }
        self.git(&self.project_dir, &["worktree", "prune"]).await?;

        let reference = format!("refs/heads/{}", branch);
        let exists = self
            .git(&self.project_dir, &["rev-parse", "--verify", "--quiet", &reference])
            .await?;
        if exists.success {
            let out = self.git(&self.project_dir, &["branch", "-D", branch]).await?;
            if !out.success {
                anyhow::bail!("could not replace existing branch {}: {}", branch, out.stderr);
            }
            tracing::debug!(branch = %branch, "replaced branch left by an earlier attempt");
        }
        Ok(())
    }

    /// Files of the merge that still carry conflict markers after `git add`.
    fn files_with_markers(&self, files: &[String]) -> Vec<String> {
        files
            .iter()
            .filter(|f| {
                std::fs::read_to_string(self.project_dir.join(f))
                    .map(|content| content.lines().any(|l| l.starts_with("<<<<<<< ") || l == "<<<<<<<"))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn provision(&self, scope: &str, task: &Task, bases: &[String]) -> Result<TaskWorkspace> {
        let slug = slugify(&task.title, 30);
        let id = slugify(&task.id, 30);
        let leaf = if slug.is_empty() { id.clone() } else { format!("{}-{}", id, slug) };
        let branch = format!("hive/{}/{}", scope, leaf);
        let path = self.worktrees_dir.join(scope).join(&id);

        let parent = path.parent().context("Worktree path has no parent directory")?;
        tokio::fs::create_dir_all(parent).await?;
        let path_str = path.to_str().context("Worktree path contains invalid UTF-8")?;
        self.discard_previous(&path, path_str, &branch).await?;

        let base = match bases.first() {
            Some(first) => first.as_str(),
            None => self.base_branch.as_deref().unwrap_or("HEAD"),
        };
        let out = self
            .git(&self.project_dir, &["worktree", "add", "-b", &branch, path_str, base])
            .await?;
        if !out.success {
            anyhow::bail!("git worktree creation failed for task {}: {}", task.id, out.stderr);
        }

        for extra in bases.iter().skip(1) {
            let message = format!("Merge {} into {}", extra, branch);
            let out = self
                .git(&path, &["merge", "--no-ff", "-m", &message, extra])
                .await?;
            if !out.success {
                let _ = self.git(&path, &["merge", "--abort"]).await;
                anyhow::bail!(
                    "dependency branches of task {} do not merge cleanly ({}): {}",
                    task.id,
                    extra,
                    out.stderr
                );
            }
        }
        tracing::debug!(task = %task.id, branch = %branch, base = %base, path = %path.display(), "worktree provisioned");

        Ok(TaskWorkspace {
            task_id: task.id.clone(),
            path,
            branch,
        })
    }

    async fn commit(&self, ws: &TaskWorkspace, message: &str) -> Result<bool> {
        let add = self.git(&ws.path, &["add", "-A"]).await?;
        if !add.success {
            anyhow::bail!("git add failed in {}: {}", ws.path.display(), add.stderr);
        }
        let diff = self.git(&ws.path, &["diff", "--cached", "--quiet"]).await?;
        if diff.success {
            return Ok(false);
        }
        let commit = self.git(&ws.path, &["commit", "-m", message]).await?;
        if !commit.success {
            anyhow::bail!("git commit failed in {}: {}", ws.path.display(), commit.stderr);
        }
        Ok(true)
    }

    async fn merge(&self, ws: &TaskWorkspace) -> Result<MergeOutcome, MergeError> {
        if let Some(ref base) = self.base_branch {
            self.git_ok(&self.project_dir, &["checkout", base]).await?;
        }
        let message = format!("Merge {}", ws.branch);
        let out = self
            .git(&self.project_dir, &["merge", "--no-ff", "-m", &message, &ws.branch])
            .await?;
        if out.success {
            return Ok(MergeOutcome::Merged);
        }

        let files = self.conflicted_files().await?;
        if files.is_empty() {
            // Failed for some reason other than conflicts.
            let _ = self.abort_merge().await;
            return Err(MergeError::Git {
                command: format!("merge --no-ff {}", ws.branch),
                stderr: out.stderr,
            });
        }
        Ok(MergeOutcome::Conflict { files })
    }

    async fn finish_merge(&self, ws: &TaskWorkspace) -> Result<MergeOutcome, MergeError> {
        let still_conflicted = self.conflicted_files().await?;
        let marked = self.files_with_markers(&still_conflicted);
        if !marked.is_empty() {
            return Ok(MergeOutcome::Conflict { files: marked });
        }
        self.git_ok(&self.project_dir, &["add", "-u"]).await?;
        let remaining = self.conflicted_files().await?;
        if !remaining.is_empty() {
            return Ok(MergeOutcome::Conflict { files: remaining });
        }
        let message = format!("Merge {} (conflicts reconciled)", ws.branch);
        self.git_ok(&self.project_dir, &["commit", "--no-verify", "-m", &message])
            .await?;
        Ok(MergeOutcome::Merged)
    }

    async fn abort_merge(&self) -> Result<()> {
        let out = self.git(&self.project_dir, &["merge", "--abort"]).await?;
        if !out.success {
            anyhow::bail!("git merge --abort failed: {}", out.stderr);
        }
        Ok(())
    }

    async fn cleanup(&self, ws: &TaskWorkspace) -> Result<()> {
        let path = ws.path.to_str().context("Worktree path contains invalid UTF-8")?;
        let out = self
            .git(&self.project_dir, &["worktree", "remove", "--force", path])
            .await?;
        if !out.success {
            anyhow::bail!("git worktree remove failed: {}", out.stderr);
        }
        Ok(())
    }

    fn main_dir(&self) -> &Path {
        &self.project_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::tempdir;

    fn git(dir: &Path, args: &[&str]) {
        let status = StdCommand::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    fn init_repo(dir: &Path) {
        git(dir, &["init", "-q"]);
        git(dir, &["config", "user.name", "Hive Test"]);
        git(dir, &["config", "user.email", "hive@example.com"]);
        std::fs::write(dir.join("README.md"), "base\n").unwrap();
        std::fs::write(dir.join("shared.txt"), "one\n").unwrap();
        git(dir, &["add", "-A"]);
        git(dir, &["commit", "-q", "-m", "init"]);
    }

    fn workspace(dir: &Path) -> GitWorkspace {
        GitWorkspace::new(dir.to_path_buf(), dir.join(".hive/worktrees"), None)
    }

    #[tokio::test]
    async fn test_disjoint_tasks_merge_cleanly() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());

        let a = ws.provision("r1", &Task::new("a", "Add A"), &[]).await.unwrap();
        let b = ws.provision("r1", &Task::new("b", "Add B"), &[]).await.unwrap();
        assert_eq!(a.branch, "hive/r1/a-add-a");
        assert!(a.path.exists());

        std::fs::write(a.path.join("a.txt"), "a\n").unwrap();
        std::fs::write(b.path.join("b.txt"), "b\n").unwrap();
        assert!(ws.commit(&a, "task a").await.unwrap());
        assert!(ws.commit(&b, "task b").await.unwrap());

        assert_eq!(ws.merge(&a).await.unwrap(), MergeOutcome::Merged);
        assert_eq!(ws.merge(&b).await.unwrap(), MergeOutcome::Merged);
        assert!(dir.path().join("a.txt").exists());
        assert!(dir.path().join("b.txt").exists());

        ws.cleanup(&a).await.unwrap();
        assert!(!a.path.exists());
    }

    #[tokio::test]
    async fn test_commit_without_changes() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());
        let a = ws.provision("r1", &Task::new("a", "noop"), &[]).await.unwrap();
        assert!(!ws.commit(&a, "nothing").await.unwrap());
    }

    #[tokio::test]
    async fn test_conflict_then_reconcile() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());

        let a = ws.provision("r1", &Task::new("a", "edit shared"), &[]).await.unwrap();
        let b = ws.provision("r1", &Task::new("b", "edit shared too"), &[]).await.unwrap();
        std::fs::write(a.path.join("shared.txt"), "from a\n").unwrap();
        std::fs::write(b.path.join("shared.txt"), "from b\n").unwrap();
        ws.commit(&a, "a").await.unwrap();
        ws.commit(&b, "b").await.unwrap();

        assert_eq!(ws.merge(&a).await.unwrap(), MergeOutcome::Merged);
        let outcome = ws.merge(&b).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Conflict {
                files: vec!["shared.txt".to_string()]
            }
        );

        // Markers still present: not finished.
        assert!(matches!(
            ws.finish_merge(&b).await.unwrap(),
            MergeOutcome::Conflict { .. }
        ));

        std::fs::write(dir.path().join("shared.txt"), "from a\nfrom b\n").unwrap();
        assert_eq!(ws.finish_merge(&b).await.unwrap(), MergeOutcome::Merged);
        let content = std::fs::read_to_string(dir.path().join("shared.txt")).unwrap();
        assert_eq!(content, "from a\nfrom b\n");
    }

    #[tokio::test]
    async fn test_abort_restores_main_tree() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());

        let a = ws.provision("r1", &Task::new("a", "x"), &[]).await.unwrap();
        let b = ws.provision("r1", &Task::new("b", "y"), &[]).await.unwrap();
        std::fs::write(a.path.join("shared.txt"), "a\n").unwrap();
        std::fs::write(b.path.join("shared.txt"), "b\n").unwrap();
        ws.commit(&a, "a").await.unwrap();
        ws.commit(&b, "b").await.unwrap();
        ws.merge(&a).await.unwrap();
        assert!(matches!(ws.merge(&b).await.unwrap(), MergeOutcome::Conflict { .. }));

        ws.abort_merge().await.unwrap();
        let content = std::fs::read_to_string(dir.path().join("shared.txt")).unwrap();
        assert_eq!(content, "a\n");
    }

    #[tokio::test]
    async fn test_reprovision_in_same_scope_starts_over() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());
        let task = Task::new("a", "Add A");

        let first = ws.provision("r1", &task, &[]).await.unwrap();
        std::fs::write(first.path.join("stale.txt"), "old\n").unwrap();
        ws.commit(&first, "first attempt").await.unwrap();
        ws.cleanup(&first).await.unwrap();

        let second = ws.provision("r1", &task, &[]).await.unwrap();
        assert_eq!(second.branch, "hive/r1/a-add-a");
        assert!(second.path.exists());
        assert!(!second.path.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn test_reprovision_without_cleanup() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());
        let task = Task::new("a", "Add A");

        ws.provision("r1", &task, &[]).await.unwrap();
        let again = ws.provision("r1", &task, &[]).await.unwrap();
        assert!(again.path.join("README.md").exists());
    }

    #[tokio::test]
    async fn test_dependent_starts_from_dependency_branches() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());

        let a = ws.provision("r1", &Task::new("a", "schema"), &[]).await.unwrap();
        let b = ws.provision("r1", &Task::new("b", "config"), &[]).await.unwrap();
        std::fs::write(a.path.join("schema.sql"), "create table t;\n").unwrap();
        std::fs::write(b.path.join("config.toml"), "x = 1\n").unwrap();
        ws.commit(&a, "a").await.unwrap();
        ws.commit(&b, "b").await.unwrap();

        let mut c = Task::new("c", "api");
        c.blocked_by = vec!["a".to_string(), "b".to_string()];
        let bases = vec![a.branch.clone(), b.branch.clone()];
        let c_ws = ws.provision("r1", &c, &bases).await.unwrap();
        assert!(c_ws.path.join("schema.sql").exists());
        assert!(c_ws.path.join("config.toml").exists());

        std::fs::write(c_ws.path.join("api.rs"), "fn api() {}\n").unwrap();
        ws.commit(&c_ws, "c").await.unwrap();
        for done in [&a, &b, &c_ws] {
            assert_eq!(ws.merge(done).await.unwrap(), MergeOutcome::Merged);
        }
        assert!(dir.path().join("api.rs").exists());
        assert!(dir.path().join("schema.sql").exists());
    }

    #[tokio::test]
    async fn test_conflicting_dependency_branches_fail_provisioning() {
        let dir = tempdir().unwrap();
        init_repo(dir.path());
        let ws = workspace(dir.path());

        let a = ws.provision("r1", &Task::new("a", "x"), &[]).await.unwrap();
        let b = ws.provision("r1", &Task::new("b", "y"), &[]).await.unwrap();
        std::fs::write(a.path.join("shared.txt"), "a\n").unwrap();
        std::fs::write(b.path.join("shared.txt"), "b\n").unwrap();
        ws.commit(&a, "a").await.unwrap();
        ws.commit(&b, "b").await.unwrap();

        let err = ws
            .provision("r1", &Task::new("c", "z"), &[a.branch.clone(), b.branch.clone()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("do not merge cleanly"));
    }
}
