use super::Pid;
use crate::user_program::process::VmProcess;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Live processes, and the exit status of every process that has exited.
#[derive(Default)]
pub struct ProcessTable {
    table: BTreeMap<Pid, Arc<VmProcess>>,
    exit_statuses: BTreeMap<Pid, i32>,
}

impl ProcessTable {
    pub fn new() -> ProcessTable {
        ProcessTable::default()
    }

    pub fn add(&mut self, process: Arc<VmProcess>) {
        assert!(
            !self.table.contains_key(&process.pid()),
            "process {} already added to process table",
            process.pid()
        );
        self.table.insert(process.pid(), process);
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<VmProcess>> {
        self.table.get(&pid).cloned()
    }

    /// Takes a process out of the table and records its exit status.
    pub fn remove(&mut self, pid: Pid, status: i32) -> Option<Arc<VmProcess>> {
        let process = self.table.remove(&pid)?;
        self.exit_statuses.insert(pid, status);
        Some(process)
    }

    pub fn exit_status(&self, pid: Pid) -> Option<i32> {
        self.exit_statuses.get(&pid).copied()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.table.keys().copied().collect()
    }
}
