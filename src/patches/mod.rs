use std::sync::Arc;

use anyhow::anyhow;

use crate::hooks::{HookAdd, HookChain, HookNode, HookRef};
use crate::inject::{InjectApply, InjectRecord};
use crate::map::{InsertOutcome, ProcMap};
use crate::substrate::{Pid, Substrate};
use crate::{PatchError, PatchResult};

/// Bucket count for a default-constructed manager. Processes shard across
/// buckets; per-process patch counts stay small, so this needs no tuning.
pub const DEFAULT_NBUCKETS: usize = 16;

/// What a patch claims at its range.
#[derive(Debug)]
pub enum PatchBody {
    Hooks(HookChain),
    Inject(InjectRecord),
}

/// The unit of claim on a contiguous byte range of one process.
#[derive(Debug)]
pub struct Patch {
    pid: Pid,
    addr: usize,
    size: usize,
    body: PatchBody,
}

impl Patch {
    /// A hooks patch with a fresh, uninstalled chain.
    pub fn new_hooks(pid: Pid, addr: usize, size: usize) -> Self {
        Patch {
            pid,
            addr,
            size,
            body: PatchBody::Hooks(HookChain::new()),
        }
    }

    /// An injection patch with an empty record.
    pub fn new_inject(pid: Pid, addr: usize, size: usize) -> Self {
        Patch {
            pid,
            addr,
            size,
            body: PatchBody::Inject(InjectRecord::new()),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn body(&self) -> &PatchBody {
        &self.body
    }

    pub fn is_hooks(&self) -> bool {
        matches!(self.body, PatchBody::Hooks(_))
    }

    pub fn as_hooks(&self) -> Option<&HookChain> {
        match &self.body {
            PatchBody::Hooks(chain) => Some(chain),
            PatchBody::Inject(_) => None,
        }
    }

    pub fn as_inject(&self) -> Option<&InjectRecord> {
        match &self.body {
            PatchBody::Inject(record) => Some(record),
            PatchBody::Hooks(_) => None,
        }
    }
}

/// Owning handle to one installed hook. Releasing it consumes the handle;
/// the handle also keeps the enclosing patch alive, so a handle that lost a
/// teardown race degrades to `NOT_FOUND` instead of touching freed state.
#[derive(Debug)]
pub struct HookHandle {
    node: Arc<HookNode>,
    patch: Arc<Patch>,
}

impl HookHandle {
    /// The continuation token for this hook, same as the one returned at
    /// install time.
    pub fn hook_ref(&self) -> HookRef {
        HookRef::new(Arc::clone(&self.node))
    }

    /// The chain this hook is linked into.
    pub fn chain(&self) -> &HookChain {
        self.patch.as_hooks().expect("hook handle owns a hooks patch")
    }

    pub fn pid(&self) -> Pid {
        self.patch.pid()
    }

    pub fn addr(&self) -> usize {
        self.patch.addr()
    }
}

/// Owning handle to one applied injection.
#[derive(Debug)]
pub struct InjectHandle {
    patch: Arc<Patch>,
}

impl InjectHandle {
    pub fn record(&self) -> &InjectRecord {
        self.patch.as_inject().expect("inject handle owns an inject patch")
    }

    pub fn pid(&self) -> Pid {
        self.patch.pid()
    }

    pub fn addr(&self) -> usize {
        self.patch.addr()
    }

    pub fn size(&self) -> usize {
        self.patch.size()
    }
}

struct ManagerInner {
    substrate: Arc<dyn Substrate>,
    map: ProcMap,
    firmware: std::sync::OnceLock<u32>,
}

/// Public surface of the patch system.
///
/// Cheap to clone and share across threads. Lock discipline: the registry
/// lock is released before any chain or record lock is taken, and a drained
/// chain re-enters the registry only after its own lock is dropped.
#[derive(Clone)]
pub struct PatchManager {
    inner: Arc<ManagerInner>,
}

impl PatchManager {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self::with_buckets(substrate, DEFAULT_NBUCKETS)
    }

    pub fn with_buckets(substrate: Arc<dyn Substrate>, nbuckets: usize) -> Self {
        PatchManager {
            inner: Arc::new(ManagerInner {
                substrate,
                map: ProcMap::new(nbuckets),
                firmware: std::sync::OnceLock::new(),
            }),
        }
    }

    pub fn substrate(&self) -> &Arc<dyn Substrate> {
        &self.inner.substrate
    }

    /// The registry, for inspection and dumps.
    pub fn map(&self) -> &ProcMap {
        &self.inner.map
    }

    pub(crate) fn firmware_cell(&self) -> &std::sync::OnceLock<u32> {
        &self.inner.firmware
    }

    /// Hooks a function at an absolute address.
    ///
    /// The first hook on an address physically installs the branch; later
    /// hooks at the same `(addr, footprint)` share the chain and land at its
    /// head. Returns the release handle and the continuation token the
    /// replacement uses to invoke the next hook.
    pub fn hook_func_abs(
        &self,
        pid: Pid,
        dest_func: usize,
        hook_func: usize,
    ) -> PatchResult<(HookHandle, HookRef)> {
        if dest_func == 0 {
            return Err(PatchError::InvalidArgs(Some(anyhow!("null destination"))));
        }
        if hook_func == 0 {
            return Err(PatchError::InvalidArgs(Some(anyhow!("null replacement"))));
        }

        let substrate = &*self.inner.substrate;
        let size = substrate.footprint();
        log::debug!(
            "hooking pid:{:#x} dest:{:#x} func:{:#x} size:{:#x}",
            pid,
            dest_func,
            hook_func,
            size
        );

        loop {
            let cand = Arc::new(Patch::new_hooks(pid, dest_func, size));
            let (patch, inserted) = match self.inner.map.try_insert(Arc::clone(&cand))? {
                InsertOutcome::Inserted => (cand, true),
                InsertOutcome::Shared(existing) => (existing, false),
            };

            let chain = patch.as_hooks().expect("hooks candidate carries a chain");
            match chain.add(substrate, pid, dest_func, hook_func) {
                Ok(HookAdd::Added(node)) => {
                    let hook_ref = HookRef::new(Arc::clone(&node));
                    return Ok((HookHandle { node, patch }, hook_ref));
                }
                Ok(HookAdd::Raced) => {
                    // The shared chain drained and died before we got its
                    // lock. Its owner unlinks it; a fresh attempt allocates
                    // a new patch.
                    if inserted {
                        self.inner.map.remove(&patch);
                    }
                    log::debug!("chain at {:#x} died mid-insert, retrying", dest_func);
                    continue;
                }
                Err(err) => {
                    // First-install failure. Unlink the candidate unless
                    // another client armed the chain while we were failing.
                    if inserted && chain.kill_if_idle() {
                        self.inner.map.remove(&patch);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Releases one hook. The last release on a chain restores the original
    /// bytes and unlinks the patch.
    pub fn hook_release(&self, handle: HookHandle) -> PatchResult<()> {
        let HookHandle { node, patch } = handle;
        let chain = patch.as_hooks().expect("hook handle owns a hooks patch");
        let drained = chain.remove(&*self.inner.substrate, patch.pid(), patch.addr(), &node)?;
        if drained {
            // Chain lock is out of the picture; losing the unlink race to a
            // process teardown is fine.
            self.inner.map.remove(&patch);
        }
        Ok(())
    }

    /// Overwrites `[dest, dest + src.len())` in `pid`'s address space,
    /// remembering the displaced bytes for restoration.
    pub fn inject_abs(&self, pid: Pid, dest: usize, src: &[u8]) -> PatchResult<InjectHandle> {
        if dest == 0 {
            return Err(PatchError::InvalidArgs(Some(anyhow!("null destination"))));
        }
        if src.is_empty() {
            return Err(PatchError::InvalidArgs(Some(anyhow!("empty source"))));
        }

        log::debug!(
            "injecting pid:{:#x} dest:{:#x} size:{:#x}",
            pid,
            dest,
            src.len()
        );
        let cand = Arc::new(Patch::new_inject(pid, dest, src.len()));
        match self.inner.map.try_insert(Arc::clone(&cand))? {
            InsertOutcome::Inserted => {}
            // The map only ever shares hooks patches.
            InsertOutcome::Shared(_) => unreachable!("injections cannot share"),
        }

        let record = cand.as_inject().expect("inject candidate carries a record");
        match record.apply(&*self.inner.substrate, pid, dest, src) {
            Ok(InjectApply::Applied) => Ok(InjectHandle { patch: cand }),
            Ok(InjectApply::Raced) => {
                // Process teardown beat us to the record; nothing was written.
                self.inner.map.remove(&cand);
                Err(PatchError::NotFound)
            }
            Err(err) => {
                self.inner.map.remove(&cand);
                Err(err)
            }
        }
    }

    /// Restores an injection's original bytes and releases its claim.
    pub fn inject_release(&self, handle: InjectHandle) -> PatchResult<()> {
        let InjectHandle { patch } = handle;
        let record = patch.as_inject().expect("inject handle owns an inject patch");
        record.release(&*self.inner.substrate, patch.pid(), patch.addr())?;
        self.inner.map.remove(&patch);
        Ok(())
    }

    /// Host notification that a process is going away: restores and frees
    /// every patch it owns. Outstanding handles for this pid are invalidated
    /// and their release degrades to `NOT_FOUND`.
    pub fn try_cleanup_process(&self, pid: Pid) -> PatchResult<()> {
        let patches = self.inner.map.remove_all_pid(pid);
        if patches.is_empty() {
            return Ok(());
        }
        log::debug!("cleaning up {} patches for pid:{:#x}", patches.len(), pid);
        let substrate = &*self.inner.substrate;
        for patch in patches {
            match patch.body() {
                PatchBody::Hooks(chain) => chain.force_teardown(substrate, pid, patch.addr()),
                PatchBody::Inject(record) => record.force_teardown(substrate, pid, patch.addr()),
            }
        }
        Ok(())
    }
}
