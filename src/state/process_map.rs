use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::types::{ProcessId, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Process {
    pub id: ProcessId,
    pub name: Option<Arc<str>>,
    pub first_seen: Timestamp,
    pub started: Option<Timestamp>,
    pub stopped: Option<Timestamp>,
    /// Bytes this process has mapped onto physical memory.
    pub committed_bytes: u64,
    pub virtual_allocations: u64,
}

impl Process {
    fn new(id: ProcessId, first_seen: Timestamp) -> Self {
        Self {
            id,
            name: None,
            first_seen,
            started: None,
            stopped: None,
            committed_bytes: 0,
            virtual_allocations: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.stopped.is_none()
    }
}

/// Processes seen in the trace, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct ProcessMap {
    processes: BTreeMap<ProcessId, Process>,
}

impl ProcessMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the record for `id`, creating it on first sight.
    pub fn touch(&mut self, id: ProcessId, timestamp: Timestamp) -> &mut Process {
        self.processes
            .entry(id)
            .or_insert_with(|| Process::new(id, timestamp))
    }

    pub fn start(&mut self, id: ProcessId, name: Arc<str>, timestamp: Timestamp) {
        let process = self.touch(id, timestamp);
        process.started = Some(timestamp);
        process.stopped = None;
        if !name.is_empty() {
            process.name = Some(name);
        }
    }

    pub fn stop(&mut self, id: ProcessId, timestamp: Timestamp) {
        self.touch(id, timestamp).stopped = Some(timestamp);
    }

    pub fn set_committed(&mut self, id: ProcessId, bytes: u64, timestamp: Timestamp) {
        self.touch(id, timestamp).committed_bytes = bytes;
    }

    pub fn get(&self, id: ProcessId) -> Option<&Process> {
        self.processes.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_then_restart_clears_stop_time() {
        let mut map = ProcessMap::new();
        map.start(4, Arc::from("game.exe"), 10);
        map.stop(4, 20);
        assert!(!map.get(4).unwrap().is_running());
        map.start(4, Arc::from(""), 30);
        let process = map.get(4).unwrap();
        assert!(process.is_running());
        assert_eq!(process.name.as_deref(), Some("game.exe"));
        assert_eq!(process.first_seen, 10);
    }
}
