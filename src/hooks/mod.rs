use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::substrate::{Pid, Substrate};
use crate::{PatchError, PatchResult};

/// One client's subscription to a chain.
///
/// The successor link is behind its own `RwLock` so the dispatch walk never
/// touches the chain mutex; mutation happens only under the chain lock. An
/// unlinked node keeps its successor, letting an in-flight walk drain
/// through it.
#[derive(Debug)]
pub struct HookNode {
    func: AtomicUsize,
    next: RwLock<Option<Arc<HookNode>>>,
}

impl HookNode {
    fn new(func: usize, next: Arc<HookNode>) -> Arc<Self> {
        Arc::new(HookNode {
            func: AtomicUsize::new(func),
            next: RwLock::new(Some(next)),
        })
    }

    fn is_tail(&self) -> bool {
        self.next.read().is_none()
    }
}

/// Opaque continuation token handed to a hook's replacement routine.
///
/// Invoking the chained form of a replacement means transferring control to
/// `continue_addr()`: the next hook in the chain, terminating at the tail
/// sentinel's call-original thunk.
#[derive(Clone, Debug)]
pub struct HookRef {
    node: Arc<HookNode>,
}

impl HookRef {
    pub(crate) fn new(node: Arc<HookNode>) -> Self {
        HookRef { node }
    }

    /// The replacement routine this hook runs.
    pub fn func(&self) -> usize {
        self.node.func.load(Ordering::Acquire)
    }

    /// Where a call-next from this hook lands: the successor's routine, or
    /// the resume thunk once the chain is exhausted.
    pub fn continue_addr(&self) -> usize {
        let next = self.node.next.read();
        match next.as_ref() {
            Some(n) => n.func.load(Ordering::Acquire),
            // Only the tail has no successor, and the tail is never handed out.
            None => 0,
        }
    }

    /// The next interceptor, or `None` when the successor is the tail
    /// sentinel and the chain resumes the original code.
    pub fn next(&self) -> Option<HookRef> {
        let next = self.node.next.read();
        let n = next.as_ref()?;
        if n.is_tail() {
            None
        } else {
            Some(HookRef {
                node: Arc::clone(n),
            })
        }
    }
}

enum Unlink {
    Done,
    NotLinked,
}

#[derive(Debug)]
struct ChainState {
    /// Bytes that lived at the target before the first hook, filled to the
    /// substrate's footprint.
    origcode: Vec<u8>,
    /// How many of them the install actually claimed.
    origlen: usize,
    head: Arc<HookNode>,
    nhooks: usize,
    installed: bool,
    /// Terminal. A drained or force-torn-down chain never accepts another
    /// hook; callers that raced onto it start over with a fresh patch.
    dead: bool,
}

/// All current hooks at one function entry.
///
/// The first hook's install physically patches the target once; every later
/// add and every non-final release is pure list surgery. Newest hooks run
/// first.
#[derive(Debug)]
pub struct HookChain {
    state: Mutex<ChainState>,
    tail: Arc<HookNode>,
}

/// What `HookChain::add` did.
pub(crate) enum HookAdd {
    Added(Arc<HookNode>),
    /// The chain died between the map lookup and the chain lock.
    Raced,
}

impl HookChain {
    pub(crate) fn new() -> Self {
        let tail = Arc::new(HookNode {
            func: AtomicUsize::new(0),
            next: RwLock::new(None),
        });
        HookChain {
            state: Mutex::new(ChainState {
                origcode: Vec::new(),
                origlen: 0,
                head: Arc::clone(&tail),
                nhooks: 0,
                installed: false,
                dead: false,
            }),
            tail,
        }
    }

    /// Stable address identifying this chain's entry dispatcher. The branch
    /// written at the target points here; the thunk that actually lives at
    /// the entry is generated below the substrate and reads the current head
    /// through it.
    pub fn dispatch_entry(&self) -> usize {
        self as *const HookChain as usize
    }

    /// Number of live hooks.
    pub fn len(&self) -> usize {
        self.state.lock().nhooks
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the target is currently branched to this chain.
    pub fn installed(&self) -> bool {
        self.state.lock().installed
    }

    /// The newest hook, as the entry dispatcher would see it. `None` while
    /// the chain is empty.
    pub fn dispatch_head(&self) -> Option<HookRef> {
        let st = self.state.lock();
        if Arc::ptr_eq(&st.head, &self.tail) {
            None
        } else {
            Some(HookRef::new(Arc::clone(&st.head)))
        }
    }

    /// Adds `func` at the head of the chain, physically installing the
    /// branch if this is the first hook ever on this chain.
    pub(crate) fn add(
        &self,
        substrate: &dyn Substrate,
        pid: Pid,
        addr: usize,
        func: usize,
    ) -> PatchResult<HookAdd> {
        let mut st = self.state.lock();
        if st.dead {
            return Ok(HookAdd::Raced);
        }

        if !st.installed {
            let footprint = substrate.footprint();
            let mut orig = vec![0u8; footprint];
            substrate.save_bytes(pid, addr, &mut orig)?;
            let install = substrate.write_branch(pid, addr, self.dispatch_entry(), &mut orig)?;
            self.tail.func.store(install.resume, Ordering::Release);
            st.origcode = orig;
            st.origlen = install.len;
            st.installed = true;
            log::debug!(
                "installed branch pid:{:#x} addr:{:#x} len:{:#x} resume:{:#x}",
                pid,
                addr,
                install.len,
                install.resume
            );
        }

        let node = HookNode::new(func, Arc::clone(&st.head));
        st.head = Arc::clone(&node);
        st.nhooks += 1;
        log::debug!(
            "hook added pid:{:#x} addr:{:#x} func:{:#x} chain len:{}",
            pid,
            addr,
            func,
            st.nhooks
        );
        Ok(HookAdd::Added(node))
    }

    fn unlink(st: &mut ChainState, node: &Arc<HookNode>) -> Unlink {
        if Arc::ptr_eq(&st.head, node) {
            let next = node
                .next
                .read()
                .clone()
                .expect("live hook must have a successor");
            st.head = next;
            return Unlink::Done;
        }
        let mut cur = Arc::clone(&st.head);
        loop {
            let successor = cur.next.read().clone();
            match successor {
                Some(n) if Arc::ptr_eq(&n, node) => {
                    *cur.next.write() = node.next.read().clone();
                    return Unlink::Done;
                }
                Some(n) => cur = n,
                None => return Unlink::NotLinked,
            }
        }
    }

    /// Removes one hook. When the last hook goes, restores the original
    /// bytes and kills the chain; the caller must then unlink the owning
    /// patch from the registry, after this chain's lock is released.
    ///
    /// Returns whether the chain drained.
    pub(crate) fn remove(
        &self,
        substrate: &dyn Substrate,
        pid: Pid,
        addr: usize,
        node: &Arc<HookNode>,
    ) -> PatchResult<bool> {
        let mut st = self.state.lock();
        if st.dead {
            return Err(PatchError::NotFound);
        }
        match Self::unlink(&mut st, node) {
            Unlink::Done => {}
            Unlink::NotLinked => return Err(PatchError::NotFound),
        }
        st.nhooks -= 1;

        if !Arc::ptr_eq(&st.head, &self.tail) {
            return Ok(false);
        }

        substrate.restore_bytes(pid, addr, &st.origcode[..st.origlen])?;
        st.installed = false;
        st.dead = true;
        log::debug!("chain drained, restored pid:{:#x} addr:{:#x}", pid, addr);
        Ok(true)
    }

    /// Rollback gate for a failed first install: kills the chain only if no
    /// other client armed it in the meantime. Returns whether the caller now
    /// owns the unlink of the enclosing patch.
    pub(crate) fn kill_if_idle(&self) -> bool {
        let mut st = self.state.lock();
        if st.dead || st.installed || st.nhooks != 0 {
            return false;
        }
        st.dead = true;
        true
    }

    /// Teardown path for a departing process: restore the target and kill
    /// the chain regardless of outstanding hook handles. Idempotent; a
    /// restore failure is logged and the chain dies anyway.
    pub(crate) fn force_teardown(&self, substrate: &dyn Substrate, pid: Pid, addr: usize) {
        let mut st = self.state.lock();
        if st.dead {
            return;
        }
        if st.installed {
            if let Err(err) = substrate.restore_bytes(pid, addr, &st.origcode[..st.origlen]) {
                log::warn!(
                    "teardown could not restore pid:{:#x} addr:{:#x}: {}",
                    pid,
                    addr,
                    err
                );
            }
            st.installed = false;
        }
        st.head = Arc::clone(&self.tail);
        st.nhooks = 0;
        st.dead = true;
    }
}
