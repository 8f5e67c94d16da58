//! Configuration file watcher.
//!
//! Watches the directory holding the config file (editors and deploy tools
//! usually replace the file rather than write it in place) and signals on
//! events that name the file.

use crate::error::{FerryError, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Start watching `path`. The receiver yields one item per relevant event;
    /// bursts should be drained by the consumer.
    pub fn start(path: &Path) -> Result<(Self, mpsc::UnboundedReceiver<()>)> {
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| FerryError::Config(format!("{} is not a file", path.display())))?;
        let directory = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) if is_reload_event(&event.kind) && names_file(&event, &file_name) => {
                    debug!(kind = ?event.kind, "Config file changed");
                    let _ = tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Config watcher error"),
            }
        })?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                _watcher: watcher,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn names_file(event: &Event, file_name: &OsString) -> bool {
    event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}

/// Create, finished write, data modification, or a rename onto the file.
pub fn is_reload_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
            | EventKind::Modify(ModifyKind::Name(RenameMode::Both))
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}
