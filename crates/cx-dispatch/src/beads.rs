//! Client for the external bead tracker (`bd`).
//!
//! The tracker owns bead lifecycle; cortex only lists open work items per
//! project workspace and writes back stage transitions. Both operations are
//! stateless CLI invocations.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use cx_core::types::{Bead, BeadStage};

#[derive(Debug, thiserror::Error)]
pub enum BeadSourceError {
    /// Tool missing, spawn failure, or non-zero exit from the lister.
    #[error("bead tool unavailable: {0}")]
    Unavailable(String),
    #[error("bead tool output: {0}")]
    Parse(String),
    #[error("stage transition failed: {0}")]
    Transition(String),
}

pub type Result<T> = std::result::Result<T, BeadSourceError>;

// ---------------------------------------------------------------------------
// BeadSource trait
// ---------------------------------------------------------------------------

/// The scheduler's view of the external bead tracker.
#[async_trait]
pub trait BeadSource: Send + Sync {
    /// List open work items for a project. The returned beads carry the
    /// project name.
    async fn list_open(&self, project: &str, workspace: &Path, bead_dir: &str)
        -> Result<Vec<Bead>>;

    /// Transition a bead's stage in the external store.
    async fn set_stage(
        &self,
        workspace: &Path,
        bead_dir: &str,
        bead_id: &str,
        stage: BeadStage,
    ) -> Result<()>;
}

// ---------------------------------------------------------------------------
// BdCli — the real tool
// ---------------------------------------------------------------------------

/// Shells out to the `bd` CLI in the project workspace.
pub struct BdCli {
    cmd: String,
}

impl BdCli {
    pub fn new() -> Self {
        Self { cmd: "bd".to_string() }
    }

    pub fn with_command(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

impl Default for BdCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BeadSource for BdCli {
    async fn list_open(
        &self,
        project: &str,
        workspace: &Path,
        bead_dir: &str,
    ) -> Result<Vec<Bead>> {
        let mut cmd = Command::new(&self.cmd);
        cmd.arg("list").arg("--json").current_dir(workspace);
        if !bead_dir.is_empty() {
            cmd.arg("--dir").arg(bead_dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| BeadSourceError::Unavailable(format!("{}: {e}", self.cmd)))?;
        if !output.status.success() {
            return Err(BeadSourceError::Unavailable(format!(
                "{} list exited {}: {}",
                self.cmd,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }

        let mut beads: Vec<Bead> = serde_json::from_slice(&output.stdout)
            .map_err(|e| BeadSourceError::Parse(e.to_string()))?;
        for bead in &mut beads {
            bead.project = project.to_string();
        }
        debug!(project, count = beads.len(), "bead listing parsed");
        Ok(beads)
    }

    async fn set_stage(
        &self,
        workspace: &Path,
        bead_dir: &str,
        bead_id: &str,
        stage: BeadStage,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.cmd);
        cmd.arg("update")
            .arg(bead_id)
            .arg("--stage")
            .arg(stage.as_str())
            .current_dir(workspace);
        if !bead_dir.is_empty() {
            cmd.arg("--dir").arg(bead_dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| BeadSourceError::Transition(format!("{}: {e}", self.cmd)))?;
        if !output.status.success() {
            return Err(BeadSourceError::Transition(format!(
                "{} update {bead_id} exited {}: {}",
                self.cmd,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim(),
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeBeadSource — test seam
// ---------------------------------------------------------------------------

/// In-memory bead source for scheduler tests.
#[derive(Default)]
pub struct FakeBeadSource {
    beads: Mutex<HashMap<String, Vec<Bead>>>,
    failing: Mutex<HashSet<String>>,
    transitions: Mutex<Vec<(String, BeadStage)>>,
}

impl FakeBeadSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_beads(&self, project: &str, beads: Vec<Bead>) {
        self.beads
            .lock()
            .expect("fake lock poisoned")
            .insert(project.to_string(), beads);
    }

    /// Make listings for this project error (`bead_source_unavailable`).
    pub fn fail_project(&self, project: &str) {
        self.failing
            .lock()
            .expect("fake lock poisoned")
            .insert(project.to_string());
    }

    pub fn transitions(&self) -> Vec<(String, BeadStage)> {
        self.transitions.lock().expect("fake lock poisoned").clone()
    }
}

#[async_trait]
impl BeadSource for FakeBeadSource {
    async fn list_open(
        &self,
        project: &str,
        _workspace: &Path,
        _bead_dir: &str,
    ) -> Result<Vec<Bead>> {
        if self.failing.lock().expect("fake lock poisoned").contains(project) {
            return Err(BeadSourceError::Unavailable(format!("{project} down")));
        }
        let mut beads = self
            .beads
            .lock()
            .expect("fake lock poisoned")
            .get(project)
            .cloned()
            .unwrap_or_default();
        for bead in &mut beads {
            bead.project = project.to_string();
        }
        Ok(beads)
    }

    async fn set_stage(
        &self,
        _workspace: &Path,
        _bead_dir: &str,
        bead_id: &str,
        stage: BeadStage,
    ) -> Result<()> {
        self.transitions
            .lock()
            .expect("fake lock poisoned")
            .push((bead_id.to_string(), stage));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
