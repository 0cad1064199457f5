use parking_lot::Mutex;

use crate::substrate::{Pid, Substrate};
use crate::{PatchError, PatchResult};

#[derive(Debug)]
struct InjectState {
    /// Snapshot of the overwritten range, taken at insertion.
    saved: Vec<u8>,
    applied: bool,
    /// Terminal, same discipline as a drained hook chain: set by release or
    /// process teardown, whichever wins the lock.
    dead: bool,
}

/// A raw byte-range overwrite. No chaining, no sharing; any overlap with an
/// existing patch fails at the registry.
#[derive(Debug)]
pub struct InjectRecord {
    state: Mutex<InjectState>,
}

/// What `InjectRecord::apply` did.
pub(crate) enum InjectApply {
    Applied,
    /// Process teardown got to the record before the bytes went in.
    Raced,
}

impl InjectRecord {
    pub(crate) fn new() -> Self {
        InjectRecord {
            state: Mutex::new(InjectState {
                saved: Vec::new(),
                applied: false,
                dead: false,
            }),
        }
    }

    /// Whether the injected bytes are currently in place.
    pub fn applied(&self) -> bool {
        self.state.lock().applied
    }

    /// Snapshots the target range and writes `src` over it.
    pub(crate) fn apply(
        &self,
        substrate: &dyn Substrate,
        pid: Pid,
        addr: usize,
        src: &[u8],
    ) -> PatchResult<InjectApply> {
        let mut st = self.state.lock();
        if st.dead {
            return Ok(InjectApply::Raced);
        }
        let mut saved = vec![0u8; src.len()];
        substrate.save_bytes(pid, addr, &mut saved)?;
        substrate.restore_bytes(pid, addr, src)?;
        st.saved = saved;
        st.applied = true;
        log::debug!(
            "injected pid:{:#x} addr:{:#x} size:{:#x}",
            pid,
            addr,
            src.len()
        );
        Ok(InjectApply::Applied)
    }

    /// Puts the snapshot back. The caller unlinks the owning patch from the
    /// registry after this record's lock is released.
    pub(crate) fn release(
        &self,
        substrate: &dyn Substrate,
        pid: Pid,
        addr: usize,
    ) -> PatchResult<()> {
        let mut st = self.state.lock();
        if st.dead || !st.applied {
            return Err(PatchError::NotFound);
        }
        substrate.restore_bytes(pid, addr, &st.saved)?;
        st.applied = false;
        st.dead = true;
        log::debug!("injection restored pid:{:#x} addr:{:#x}", pid, addr);
        Ok(())
    }

    /// Teardown path for a departing process. Idempotent; a restore failure
    /// is logged and the record dies anyway.
    pub(crate) fn force_teardown(&self, substrate: &dyn Substrate, pid: Pid, addr: usize) {
        let mut st = self.state.lock();
        if st.dead {
            return;
        }
        if st.applied {
            if let Err(err) = substrate.restore_bytes(pid, addr, &st.saved) {
                log::warn!(
                    "teardown could not restore injection pid:{:#x} addr:{:#x}: {}",
                    pid,
                    addr,
                    err
                );
            }
            st.applied = false;
        }
        st.dead = true;
    }
}
