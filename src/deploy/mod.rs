// src/deploy/mod.rs

//! Atomic, versioned deployment store.
//!
//! Full-system changes (desktop environment switches, base OS layers) are
//! never applied to a running system. They are committed into a
//! content-addressed, branch-based store and marked as the next-boot
//! deployment; the running system is only ever replaced wholesale.
//!
//! Layout under the repository root:
//!
//! ```text
//! objects/<aa>/<rest>       configuration trees, addressed by SHA-256
//! commits/<id>.json         commit records (tree, parent, timestamp, subject)
//! refs/heads/<branch>       branch head commit id
//! deploy/next-boot          commit id staged for the next boot
//! deploy/current            commit id the running system booted from
//! ```
//!
//! Tree objects are pure content addresses, so committing an identical
//! configuration twice stores one tree; commit ids also cover parent and
//! timestamp and therefore differ per commit.

use crate::config::SystemConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Branch all configuration commits land on
pub const DEFAULT_BRANCH: &str = "os/converge/stable";

/// One commit in the deployment history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Commit id (derived from tree + parent + timestamp)
    pub id: String,
    /// Content address of the configuration tree
    pub tree: String,
    /// Parent commit id, if any
    pub parent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
}

/// Versioned-store operations used by the execution engine
pub trait DeploymentManager: Send + Sync {
    /// Commit a configuration snapshot onto the branch, returning its id
    fn create_commit(&self, config: &SystemConfig, subject: &str) -> Result<String>;

    /// Mark a commit as the next-boot deployment; never mutates the
    /// running system
    fn deploy_commit(&self, id: &str) -> Result<()>;

    /// Re-deploy a prior commit as next-boot
    fn rollback(&self, id: &str) -> Result<()>;

    /// Commit the running system booted from, if recorded
    fn current_commit(&self) -> Result<Option<String>>;

    /// Commit staged for the next boot, if any
    fn pending_commit(&self) -> Result<Option<String>>;

    /// History from the branch head, newest first
    fn list_commits(&self) -> Result<Vec<CommitInfo>>;

    /// Read the configuration tree of a commit
    fn read_commit(&self, id: &str) -> Result<SystemConfig>;

    /// Read a commit's metadata record
    fn commit_info(&self, id: &str) -> Result<CommitInfo>;
}

/// Filesystem-backed deployment store
pub struct OstreeRepo {
    root: PathBuf,
    branch: String,
}

impl OstreeRepo {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_branch(root, DEFAULT_BRANCH)
    }

    pub fn with_branch(root: impl Into<PathBuf>, branch: &str) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("objects"))?;
        fs::create_dir_all(root.join("commits"))?;
        fs::create_dir_all(root.join("deploy"))?;
        // Branch names may contain slashes (e.g. "os/converge/stable")
        let ref_path = root.join("refs/heads").join(branch);
        if let Some(parent) = ref_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            root,
            branch: branch.to_string(),
        })
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        if hash.len() < 2 {
            return self.root.join("objects").join(hash);
        }
        self.root.join("objects").join(&hash[..2]).join(&hash[2..])
    }

    fn commit_path(&self, id: &str) -> PathBuf {
        self.root.join("commits").join(format!("{}.json", id))
    }

    fn ref_path(&self) -> PathBuf {
        self.root.join("refs/heads").join(&self.branch)
    }

    fn head(&self) -> Result<Option<String>> {
        read_marker(&self.ref_path())
    }

    fn load_commit(&self, id: &str) -> Result<CommitInfo> {
        let path = self.commit_path(id);
        if !path.exists() {
            return Err(Error::Ostree(format!("commit '{}' not found", id)));
        }
        let data = fs::read_to_string(path).map_err(|e| Error::Ostree(e.to_string()))?;
        serde_json::from_str(&data).map_err(|e| Error::Ostree(e.to_string()))
    }

    /// Store a tree object if absent; returns its content address
    fn store_tree(&self, payload: &[u8]) -> Result<String> {
        let hash = hex::encode(Sha256::digest(payload));
        let path = self.object_path(&hash);

        if path.exists() {
            debug!("Tree already in store: {}", hash);
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Stage inside the repository root so the final rename stays on one
        // filesystem; the TempDir guard cleans up on every failure path, and
        // a crash never leaves a partial object visible
        let staging = TempDir::new_in(&self.root).map_err(|e| Error::Ostree(e.to_string()))?;
        let tmp = staging.path().join("tree");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        debug!("Stored tree {} ({} bytes)", hash, payload.len());
        Ok(hash)
    }
}

/// Read an optional single-line marker file
fn read_marker(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    let value = data.trim().to_string();
    Ok(if value.is_empty() { None } else { Some(value) })
}

/// Atomic replace of a single-line marker file
fn write_marker(path: &Path, value: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, value)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

impl DeploymentManager for OstreeRepo {
    fn create_commit(&self, config: &SystemConfig, subject: &str) -> Result<String> {
        let payload = config
            .to_canonical_json()
            .map_err(|e| Error::Ostree(e.to_string()))?;
        let tree = self.store_tree(payload.as_bytes())?;
        let parent = self.head()?;
        let timestamp = Utc::now();

        let mut hasher = Sha256::new();
        hasher.update(tree.as_bytes());
        if let Some(ref p) = parent {
            hasher.update(p.as_bytes());
        }
        hasher.update(timestamp.to_rfc3339().as_bytes());
        let id = hex::encode(hasher.finalize());

        let commit = CommitInfo {
            id: id.clone(),
            tree,
            parent,
            timestamp,
            subject: subject.to_string(),
        };

        let commit_path = self.commit_path(&id);
        let tmp = commit_path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string_pretty(&commit)?)
            .map_err(|e| Error::Ostree(e.to_string()))?;
        fs::rename(&tmp, &commit_path).map_err(|e| Error::Ostree(e.to_string()))?;

        write_marker(&self.ref_path(), &id)?;

        info!("Created commit {} on {} ({})", &id[..12], self.branch, subject);
        Ok(id)
    }

    fn deploy_commit(&self, id: &str) -> Result<()> {
        // Existence check before anything is staged
        self.load_commit(id)?;
        write_marker(&self.root.join("deploy/next-boot"), id)?;
        info!("Commit {} staged as next-boot deployment", &id[..12.min(id.len())]);
        Ok(())
    }

    fn rollback(&self, id: &str) -> Result<()> {
        if self.load_commit(id).is_err() {
            return Err(Error::RollbackFailed(format!(
                "commit '{}' not found in deployment history",
                id
            )));
        }
        write_marker(&self.root.join("deploy/next-boot"), id)
            .map_err(|e| Error::RollbackFailed(e.to_string()))?;
        info!("Rolled back next-boot deployment to {}", &id[..12.min(id.len())]);
        Ok(())
    }

    fn current_commit(&self) -> Result<Option<String>> {
        read_marker(&self.root.join("deploy/current"))
    }

    fn pending_commit(&self) -> Result<Option<String>> {
        read_marker(&self.root.join("deploy/next-boot"))
    }

    fn list_commits(&self) -> Result<Vec<CommitInfo>> {
        let mut commits = Vec::new();
        let mut cursor = self.head()?;
        while let Some(id) = cursor {
            let commit = self.load_commit(&id)?;
            cursor = commit.parent.clone();
            commits.push(commit);
        }
        Ok(commits)
    }

    fn read_commit(&self, id: &str) -> Result<SystemConfig> {
        let commit = self.load_commit(id)?;
        let path = self.object_path(&commit.tree);
        let data = fs::read_to_string(&path)
            .map_err(|e| Error::Ostree(format!("tree {} unreadable: {}", commit.tree, e)))?;
        serde_json::from_str(&data).map_err(|e| Error::Ostree(e.to_string()))
    }

    fn commit_info(&self, id: &str) -> Result<CommitInfo> {
        self.load_commit(id)
    }
}
