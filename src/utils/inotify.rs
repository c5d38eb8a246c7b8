use std::{collections::HashMap, path::Path, thread, time::Duration};

use anyhow::{Context, Result};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::debug;

const WAIT_MOVE_US: u64 = 500 * 1000;

pub struct InotifyWatcher {
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, (String, WatchMask)>,
}

impl InotifyWatcher {
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init().with_context(|| "Failed to initialize inotify")?;

        Ok(Self {
            inotify,
            watches: HashMap::new(),
        })
    }

    pub fn add<P: AsRef<Path>>(&mut self, path: P, mask: WatchMask) -> Result<()> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .with_context(|| format!("Invalid path: {}", path_ref.display()))?;

        // editors replace files instead of rewriting them
        let mask = mask | WatchMask::DELETE_SELF | WatchMask::MOVE_SELF;

        let wd = self
            .inotify
            .watches()
            .add(path_ref, mask)
            .with_context(|| format!("Failed to add watch for: {}", path_ref.display()))?;

        self.watches.insert(wd, (path_str.to_string(), mask));

        Ok(())
    }

    /// Blocks until at least one event arrives, re-arming replaced files.
    /// Returns the number of events consumed.
    pub fn wait_and_handle(&mut self) -> Result<usize> {
        let mut buffer = [0; 4096];
        let mut rearm = Vec::new();
        let mut count = 0;

        let events = self
            .inotify
            .read_events_blocking(&mut buffer)
            .with_context(|| "Failed to read inotify events")?;

        for event in events {
            count += 1;
            if event.mask.contains(EventMask::IGNORED)
                || event.mask.contains(EventMask::DELETE_SELF)
                || event.mask.contains(EventMask::MOVE_SELF)
            {
                if let Some(watch) = self.watches.get(&event.wd) {
                    rearm.push((event.wd.clone(), watch.clone()));
                }
            }
        }

        for (wd, (path, mask)) in rearm {
            self.watches.remove(&wd);
            if !Path::new(&path).exists() {
                thread::sleep(Duration::from_micros(WAIT_MOVE_US));
            }
            match self.inotify.watches().add(&path, mask) {
                Ok(new_wd) => {
                    self.watches.insert(new_wd, (path, mask));
                }
                Err(e) => debug!("Failed to re-add watch for {path}: {e}"),
            }
        }

        Ok(count)
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}
