use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crossbeam_channel::{Receiver, Sender};

/// Polls a folder for modified files and fans the changed paths out to subscribers.
///
/// Nothing runs in the background: `poll` is called once per tick on the render thread and
/// subscribers drain their receivers on the same thread.
pub struct FolderWatcher {
    folder: PathBuf,
    timestamps: HashMap<PathBuf, SystemTime>,
    subscribers: Vec<Sender<Vec<PathBuf>>>,
}

impl FolderWatcher {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        let folder = folder.into();
        let mut timestamps = HashMap::new();
        scan(&folder, &mut timestamps);
        log::info!(
            "Watching {} ({} files)",
            folder.display(),
            timestamps.len()
        );
        Self {
            folder,
            timestamps,
            subscribers: Vec::new(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn subscribe(&mut self) -> Receiver<Vec<PathBuf>> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        self.subscribers.push(sender);
        receiver
    }

    /// Returns the files modified or created since the previous poll, after notifying
    /// subscribers. Deleted files are forgotten silently.
    pub fn poll(&mut self) -> Vec<PathBuf> {
        let mut current = HashMap::with_capacity(self.timestamps.len());
        scan(&self.folder, &mut current);

        let mut changed: Vec<PathBuf> = current
            .iter()
            .filter(|(path, modified)| self.timestamps.get(*path) != Some(*modified))
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        self.timestamps = current;

        if !changed.is_empty() {
            log::debug!("{} file(s) changed in {}", changed.len(), self.folder.display());
            self.subscribers
                .retain(|subscriber| subscriber.send(changed.clone()).is_ok());
        }
        changed
    }
}

fn scan(folder: &Path, out: &mut HashMap<PathBuf, SystemTime>) {
    let entries = match std::fs::read_dir(folder) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Cannot list {}: {e}", folder.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            scan(&path, out);
        } else if let Ok(modified) = metadata.modified() {
            out.insert(path, modified);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::time::Duration;

    use super::*;

    fn touch(path: &Path, seconds_ahead: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(seconds_ahead))
            .unwrap();
    }

    #[test]
    fn reports_modified_and_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let shader = dir.path().join("lighting.frag");
        std::fs::write(&shader, "v1").unwrap();

        let mut watcher = FolderWatcher::new(dir.path());
        let receiver = watcher.subscribe();
        assert!(watcher.poll().is_empty());

        touch(&shader, 60);
        let added = dir.path().join("post.frag");
        std::fs::write(&added, "new").unwrap();

        assert_eq!(watcher.poll(), vec![shader.clone(), added]);
        assert_eq!(receiver.try_recv().unwrap().len(), 2);
        assert!(watcher.poll().is_empty());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn nested_folders_are_scanned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("gbuffer")).unwrap();
        let nested = dir.path().join("gbuffer").join("gbuffer.vert");
        std::fs::write(&nested, "v1").unwrap();

        let mut watcher = FolderWatcher::new(dir.path());
        touch(&nested, 120);
        assert_eq!(watcher.poll(), vec![nested]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new(dir.path());
        drop(watcher.subscribe());
        let kept = watcher.subscribe();

        std::fs::write(dir.path().join("a.spv"), "x").unwrap();
        watcher.poll();
        assert_eq!(watcher.subscribers.len(), 1);
        assert!(kept.try_recv().is_ok());
    }

    #[test]
    fn missing_folder_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FolderWatcher::new(dir.path().join("does-not-exist"));
        assert!(watcher.poll().is_empty());
    }
}
