use std::sync::Arc;

use parking_lot::Mutex;

use crate::patches::Patch;
use crate::substrate::Pid;
use crate::{PatchError, PatchResult};

/// Outcome of an admission attempt.
#[derive(Debug)]
pub enum InsertOutcome {
    /// The candidate was linked into the map and is now the live patch.
    Inserted,
    /// An identical hooks patch already claims the range; the caller should
    /// add its hook to the returned patch and drop the candidate.
    Shared(Arc<Patch>),
}

struct ProcEntry {
    pid: Pid,
    /// Sorted by address. An entry always holds at least one patch; it is
    /// destroyed in the same critical section that removes the last one.
    patches: Vec<Arc<Patch>>,
}

/// Registry of installed patches, one entry per process.
///
/// The lock protects structure only: bucket lists, entries, and patch
/// linkage. Chain internals are guarded by each chain's own lock, and no
/// substrate call ever happens with the map locked.
pub struct ProcMap {
    nbuckets: usize,
    buckets: Mutex<Vec<Vec<ProcEntry>>>,
}

impl ProcMap {
    /// Creates a map with a fixed number of buckets.
    pub fn new(nbuckets: usize) -> Self {
        assert!(nbuckets > 0, "proc map needs at least one bucket");
        let mut buckets = Vec::with_capacity(nbuckets);
        buckets.resize_with(nbuckets, Vec::new);
        ProcMap {
            nbuckets,
            buckets: Mutex::new(buckets),
        }
    }

    fn bucket_index(&self, pid: Pid) -> usize {
        (pid as u32).wrapping_mul(0x9E37_79B9) as usize % self.nbuckets
    }

    /// Atomically admits `cand` for its process, or reports why it cannot.
    ///
    /// Exact-match sharing: a hooks candidate whose `(pid, addr, size)`
    /// equals an installed hooks patch returns `Shared` with the existing
    /// patch. Any other intersection is a conflict.
    pub fn try_insert(&self, cand: Arc<Patch>) -> PatchResult<InsertOutcome> {
        let mut buckets = self.buckets.lock();
        let idx = self.bucket_index(cand.pid());
        let bucket = &mut buckets[idx];

        let entry = match bucket.iter_mut().find(|e| e.pid == cand.pid()) {
            Some(entry) => entry,
            None => {
                log::debug!(
                    "new proc entry pid:{:#x} for patch addr:{:#x}",
                    cand.pid(),
                    cand.addr()
                );
                bucket.push(ProcEntry {
                    pid: cand.pid(),
                    patches: vec![cand],
                });
                return Ok(InsertOutcome::Inserted);
            }
        };

        let cand_end = cand.addr() + cand.size();
        let mut slot = entry.patches.len();
        for (i, patch) in entry.patches.iter().enumerate() {
            let end = patch.addr() + patch.size();
            if patch.addr() >= cand_end {
                slot = i;
                break;
            }
            if cand.addr() >= end {
                continue;
            }
            // Ranges intersect. Identical hooks patches share a chain.
            if patch.addr() == cand.addr()
                && patch.size() == cand.size()
                && patch.is_hooks()
                && cand.is_hooks()
            {
                log::debug!(
                    "sharing patch pid:{:#x} addr:{:#x} size:{:#x}",
                    patch.pid(),
                    patch.addr(),
                    patch.size()
                );
                return Ok(InsertOutcome::Shared(Arc::clone(patch)));
            }
            log::warn!(
                "patch conflict pid:{:#x} addr:{:#x} size:{:#x} against addr:{:#x} size:{:#x}",
                cand.pid(),
                cand.addr(),
                cand.size(),
                patch.addr(),
                patch.size()
            );
            return Err(PatchError::PatchExists((cand.addr(), cand.size())));
        }

        entry.patches.insert(slot, cand);
        Ok(InsertOutcome::Inserted)
    }

    /// Unlinks one specific patch, by identity. Returns whether it was still
    /// linked; losing this race to a concurrent removal is normal.
    pub fn remove(&self, patch: &Arc<Patch>) -> bool {
        let mut buckets = self.buckets.lock();
        let idx = self.bucket_index(patch.pid());
        let bucket = &mut buckets[idx];

        let Some(entry_idx) = bucket.iter().position(|e| e.pid == patch.pid()) else {
            return false;
        };
        let entry = &mut bucket[entry_idx];
        let Some(pos) = entry.patches.iter().position(|p| Arc::ptr_eq(p, patch)) else {
            return false;
        };
        entry.patches.remove(pos);
        log::debug!(
            "removed patch pid:{:#x} addr:{:#x} size:{:#x}",
            patch.pid(),
            patch.addr(),
            patch.size()
        );
        if entry.patches.is_empty() {
            bucket.remove(entry_idx);
            log::debug!("proc entry pid:{:#x} is empty, dropping", patch.pid());
        }
        true
    }

    /// Unlinks the whole entry for `pid` and hands its patch list (address
    /// ascending) to the caller for teardown. Empty when no entry exists.
    pub fn remove_all_pid(&self, pid: Pid) -> Vec<Arc<Patch>> {
        let mut buckets = self.buckets.lock();
        let idx = self.bucket_index(pid);
        let bucket = &mut buckets[idx];

        match bucket.iter().position(|e| e.pid == pid) {
            Some(entry_idx) => {
                let entry = bucket.remove(entry_idx);
                log::debug!(
                    "removed all {} patches for pid:{:#x}",
                    entry.patches.len(),
                    pid
                );
                entry.patches
            }
            None => Vec::new(),
        }
    }

    /// Number of live patches for a process.
    pub fn count_pid(&self, pid: Pid) -> usize {
        let buckets = self.buckets.lock();
        buckets[self.bucket_index(pid)]
            .iter()
            .find(|e| e.pid == pid)
            .map_or(0, |e| e.patches.len())
    }

    /// True when no process holds any patch.
    pub fn is_empty(&self) -> bool {
        self.buckets.lock().iter().all(|b| b.is_empty())
    }

    /// Logs the whole map at debug level.
    pub fn dump(&self) {
        let buckets = self.buckets.lock();
        log::debug!("dumping map...");
        for bucket in buckets.iter() {
            for entry in bucket {
                log::debug!("proc entry: pid = {:#x}", entry.pid);
                for patch in &entry.patches {
                    log::debug!(
                        "    patch: pid = {:#x}, addr = {:#x}, size = {:#x}",
                        patch.pid(),
                        patch.addr(),
                        patch.size()
                    );
                }
            }
        }
        log::debug!("finished dumping map.");
    }
}
