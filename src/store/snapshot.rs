//! # Store Snapshots
//!
//! JSON snapshot of every destination and association. Written to a temporary
//! file in the target directory and renamed over the previous snapshot, so a
//! crash mid-write leaves the old snapshot intact.
//!
//! [`SnapshotWriter`] does the file I/O on its own thread. Snapshots queued
//! while a write is running collapse into the newest one.

use crate::model::{Association, Destination};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Format version written into every snapshot
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub destinations: Vec<Destination>,
    pub associations: Vec<Association>,
}

/// Load a snapshot; `None` when the file does not exist yet
pub fn load(path: &Path) -> Result<Option<Snapshot>> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read snapshot {}", path.display()))
        }
    };
    let snapshot: Snapshot = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
    if snapshot.version > SNAPSHOT_VERSION {
        anyhow::bail!(
            "Snapshot {} has version {}, newer than supported version {}",
            path.display(),
            snapshot.version,
            SNAPSHOT_VERSION
        );
    }
    Ok(Some(snapshot))
}

/// Atomically replace the snapshot at `path`
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create snapshot directory {}", dir.display()))?;

    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    serde_json::to_writer(&mut file, snapshot).context("Failed to serialize snapshot")?;
    file.flush().context("Failed to flush snapshot")?;
    file.as_file()
        .sync_all()
        .context("Failed to sync snapshot to disk")?;
    file.persist(path)
        .with_context(|| format!("Failed to replace snapshot {}", path.display()))?;
    Ok(())
}

enum Command {
    Save(Snapshot),
    Flush(oneshot::Sender<()>),
}

/// Background snapshot writer
///
/// Dropping the writer waits for queued snapshots to reach disk.
pub struct SnapshotWriter {
    path: PathBuf,
    commands: Option<mpsc::UnboundedSender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for SnapshotWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotWriter")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SnapshotWriter {
    pub fn spawn(path: PathBuf) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let thread_path = path.clone();
        let thread = std::thread::Builder::new()
            .name("store-snapshot".to_string())
            .spawn(move || write_loop(&thread_path, receiver))
            .context("Failed to start snapshot writer thread")?;
        Ok(Self {
            path,
            commands: Some(commands),
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue `snapshot`; write failures are logged by the writer
    pub fn submit(&self, snapshot: Snapshot) {
        let sent = self
            .commands
            .as_ref()
            .is_some_and(|commands| commands.send(Command::Save(snapshot)).is_ok());
        if !sent {
            warn!("Snapshot writer stopped, snapshot for {} dropped", self.path.display());
        }
    }

    /// Wait until every snapshot queued so far has been written or has failed
    pub async fn flush(&self) {
        let Some(commands) = &self.commands else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if commands.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        drop(self.commands.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Snapshot writer for {} panicked", self.path.display());
            }
        }
    }
}

fn write_loop(path: &Path, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(first) = commands.blocking_recv() {
        let mut latest = None;
        let mut waiters = Vec::new();
        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                Command::Save(snapshot) => latest = Some(snapshot),
                Command::Flush(waiter) => waiters.push(waiter),
            }
            next = commands.try_recv().ok();
        }

        if let Some(snapshot) = latest {
            match save(path, &snapshot) {
                Ok(()) => debug!(
                    "Wrote association store snapshot: {} association(s)",
                    snapshot.associations.len()
                ),
                Err(e) => error!("Failed to write association store snapshot: {:#}", e),
            }
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
    debug!("Snapshot writer for {} stopped", path.display());
}
