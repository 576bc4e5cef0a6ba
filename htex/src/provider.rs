//! The compute-resource provider surface: how fabrics get launched.
//!
//! Providers are external collaborators (batch-scheduler adapters); the
//! executor only consumes this trait. [`LocalProvider`] runs fabrics as
//! local child processes and is enough for single-node use and tests.

use crate::HashMap;
use parking_lot::Mutex;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Opaque handle to one provider-launched block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle(pub u64);

pub trait Provider: Send + Sync {
    fn label(&self) -> &str;

    /// Blocks launched up front by `start`.
    fn init_blocks(&self) -> usize {
        1
    }

    fn tasks_per_node(&self) -> usize;

    fn nodes_per_block(&self) -> usize {
        1
    }

    fn scaling_enabled(&self) -> bool {
        true
    }

    /// Launches one block running `launch_cmd`; `None` means provisioning
    /// failed.
    fn submit(&self, launch_cmd: &str) -> Option<BlockHandle>;

    /// Cancels previously launched blocks; true when all of them went
    /// away.
    fn cancel(&self, blocks: &[BlockHandle]) -> bool;
}

/// Runs each block as a child process on this machine.
pub struct LocalProvider {
    tasks_per_node: usize,
    init_blocks: usize,
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Child>>,
}

impl LocalProvider {
    pub fn new(tasks_per_node: usize, init_blocks: usize) -> Self {
        Self {
            tasks_per_node,
            init_blocks,
            next_id: AtomicU64::new(0),
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Provider for LocalProvider {
    fn label(&self) -> &str {
        "local"
    }

    fn init_blocks(&self) -> usize {
        self.init_blocks
    }

    fn tasks_per_node(&self) -> usize {
        self.tasks_per_node
    }

    fn submit(&self, launch_cmd: &str) -> Option<BlockHandle> {
        // the launch template carries no quoting, so whitespace splitting
        // is enough
        let mut parts = launch_cmd.split_whitespace();
        let program = parts.next()?;
        match Command::new(program).args(parts).spawn() {
            Ok(child) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                debug!("[provider] launched block {} (pid {})", id, child.id());
                self.children.lock().insert(id, child);
                Some(BlockHandle(id))
            }
            Err(e) => {
                warn!("[provider] failed to launch {:?}: {:?}", launch_cmd, e);
                None
            }
        }
    }

    fn cancel(&self, blocks: &[BlockHandle]) -> bool {
        let mut children = self.children.lock();
        let mut all = true;
        for block in blocks {
            match children.remove(&block.0) {
                Some(mut child) => {
                    if child.kill().is_err() {
                        all = false;
                    }
                    let _ = child.wait();
                }
                None => all = false,
            }
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_spawns_and_cancel_reaps() {
        let provider = LocalProvider::new(1, 1);
        let handle = provider
            .submit("sleep 30")
            .expect("sleep should launch");
        assert!(provider.cancel(&[handle]));
        // cancelling twice fails: the child is gone
        assert!(!provider.cancel(&[handle]));
    }

    #[test]
    fn submit_returns_none_for_missing_programs() {
        let provider = LocalProvider::new(1, 1);
        assert!(provider
            .submit("definitely-not-a-real-binary-name --flag")
            .is_none());
    }
}
