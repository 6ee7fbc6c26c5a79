use anyhow::{Context, Result};
use git2::{ObjectType, Oid, Repository, StatusOptions};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

const HIVE_PREFIX: &str = ".hive/";

/// Content hashes of every dirty or untracked path at one moment.
///
/// `None` means the path is reported by git but has no file on disk (deleted).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorktreeSnapshot {
    dirty: BTreeMap<String, Option<Oid>>,
}

impl WorktreeSnapshot {
    pub fn len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }
}

/// Read-only view of the project's working tree.
///
/// Never commits or stages: phases own the tree, this only observes which
/// files an invocation changed.
pub struct GitTracker {
    repo: Repository,
    root: PathBuf,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        let root = repo
            .workdir()
            .context("Git repository has no working directory")?
            .to_path_buf();
        Ok(Self { repo, root })
    }

    /// `None` when the project is not a git repository.
    pub fn open(project_dir: &Path) -> Option<Self> {
        Self::new(project_dir).ok()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record the current dirty set before a phase runs.
    pub fn snapshot(&self) -> Result<WorktreeSnapshot> {
        Ok(WorktreeSnapshot {
            dirty: self.dirty_files()?,
        })
    }

    /// Paths whose content differs from `snapshot`, relative to the repository root.
    pub fn touched_since(&self, snapshot: &WorktreeSnapshot) -> Result<Vec<String>> {
        let now = self.dirty_files()?;
        let mut touched = BTreeSet::new();
        for (path, hash) in &now {
            if snapshot.dirty.get(path) != Some(hash) {
                touched.insert(path.clone());
            }
        }
        // Dirty before, clean now: the phase reverted it
        for path in snapshot.dirty.keys() {
            if !now.contains_key(path) {
                touched.insert(path.clone());
            }
        }
        Ok(touched.into_iter().collect())
    }

    fn dirty_files(&self) -> Result<BTreeMap<String, Option<Oid>>> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = self
            .repo
            .statuses(Some(&mut opts))
            .context("Failed to read git status")?;

        let mut dirty = BTreeMap::new();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else {
                continue;
            };
            // Run artifacts change on every phase
            if path.starts_with(HIVE_PREFIX) {
                continue;
            }
            let full = self.root.join(path);
            let hash = if full.is_file() {
                Oid::hash_file(ObjectType::Blob, &full).ok()
            } else {
                None
            };
            dirty.insert(path.to_string(), hash);
        }
        Ok(dirty)
    }
}
