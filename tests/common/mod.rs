#![allow(dead_code)]

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use graft::substrate::{BranchInstall, ModuleInfo, Pid, Substrate};
use graft::{PatchError, PatchResult};

/// Branch footprint used by every test, same as the reference platform.
pub const FOOTPRINT: usize = 16;

const BRANCH_TAG: u8 = 0xEA;
const BRANCH_PAD: u8 = 0xCC;

/// Deterministic "pre-existing" byte for any address that was never written.
fn pristine(pid: Pid, addr: usize) -> u8 {
    (addr as u8) ^ ((addr >> 8) as u8) ^ (pid as u8) ^ 0x5A
}

struct RamState {
    bytes: HashMap<(Pid, usize), u8>,
    branch_writes: HashMap<(Pid, usize), usize>,
    flushes: usize,
    refused: HashSet<(Pid, usize)>,
    firmware: Option<u32>,
    modules: Vec<(Pid, ModuleInfo)>,
    exports: HashMap<(Pid, String, u32, u32), usize>,
    imports: HashMap<(Pid, String, u32, u32), usize>,
}

/// In-memory substrate: sparse per-pid byte store, deterministic branch
/// encoding, counters for branch installs and flushes, and per-address
/// refusal to model unpatchable targets.
pub struct RamSubstrate {
    state: Mutex<RamState>,
}

impl RamSubstrate {
    pub fn new() -> Self {
        RamSubstrate {
            state: Mutex::new(RamState {
                bytes: HashMap::new(),
                branch_writes: HashMap::new(),
                flushes: 0,
                refused: HashSet::new(),
                firmware: None,
                modules: Vec::new(),
                exports: HashMap::new(),
                imports: HashMap::new(),
            }),
        }
    }

    /// Marks an address as unpatchable: saves and writes there fail with
    /// `INVALID_KERNEL_ADDR`.
    pub fn refuse(&self, pid: Pid, addr: usize) {
        self.state.lock().refused.insert((pid, addr));
    }

    pub fn set_firmware(&self, version: u32) {
        self.state.lock().firmware = Some(version);
    }

    pub fn add_module(&self, pid: Pid, info: ModuleInfo) {
        self.state.lock().modules.push((pid, info));
    }

    pub fn add_export(&self, pid: Pid, modname: &str, libnid: u32, funcnid: u32, addr: usize) {
        self.state
            .lock()
            .exports
            .insert((pid, modname.to_string(), libnid, funcnid), addr);
    }

    pub fn add_import(&self, pid: Pid, modname: &str, libnid: u32, funcnid: u32, addr: usize) {
        self.state
            .lock()
            .imports
            .insert((pid, modname.to_string(), libnid, funcnid), addr);
    }

    /// Test-side peek, bypassing the trait.
    pub fn read_mem(&self, pid: Pid, addr: usize, len: usize) -> Vec<u8> {
        let st = self.state.lock();
        (0..len)
            .map(|i| {
                st.bytes
                    .get(&(pid, addr + i))
                    .copied()
                    .unwrap_or_else(|| pristine(pid, addr + i))
            })
            .collect()
    }

    /// What an untouched range looks like.
    pub fn pristine_mem(&self, pid: Pid, addr: usize, len: usize) -> Vec<u8> {
        (0..len).map(|i| pristine(pid, addr + i)).collect()
    }

    /// True when the bytes at `addr` currently hold a branch encoding.
    pub fn is_branched(&self, pid: Pid, addr: usize) -> bool {
        let bytes = self.read_mem(pid, addr, FOOTPRINT);
        bytes[0] == BRANCH_TAG && bytes[9..FOOTPRINT].iter().all(|&b| b == BRANCH_PAD)
    }

    /// How many branch installs ever hit this address.
    pub fn branch_count(&self, pid: Pid, addr: usize) -> usize {
        self.state
            .lock()
            .branch_writes
            .get(&(pid, addr))
            .copied()
            .unwrap_or(0)
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    fn store(st: &mut RamState, pid: Pid, addr: usize, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            st.bytes.insert((pid, addr + i), b);
        }
    }
}

impl Substrate for RamSubstrate {
    fn footprint(&self) -> usize {
        FOOTPRINT
    }

    fn save_bytes(&self, pid: Pid, addr: usize, dst: &mut [u8]) -> PatchResult<usize> {
        let st = self.state.lock();
        if st.refused.contains(&(pid, addr)) {
            return Err(PatchError::InvalidKernelAddr((addr, None)));
        }
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = st
                .bytes
                .get(&(pid, addr + i))
                .copied()
                .unwrap_or_else(|| pristine(pid, addr + i));
        }
        Ok(dst.len())
    }

    fn write_branch(
        &self,
        pid: Pid,
        addr: usize,
        target: usize,
        original: &mut [u8],
    ) -> PatchResult<BranchInstall> {
        let mut st = self.state.lock();
        if st.refused.contains(&(pid, addr)) {
            return Err(PatchError::InvalidKernelAddr((addr, None)));
        }
        let len = original.len().min(FOOTPRINT);
        for (i, slot) in original.iter_mut().take(len).enumerate() {
            *slot = st
                .bytes
                .get(&(pid, addr + i))
                .copied()
                .unwrap_or_else(|| pristine(pid, addr + i));
        }

        let mut encoding = [BRANCH_PAD; FOOTPRINT];
        encoding[0] = BRANCH_TAG;
        encoding[1..9].copy_from_slice(&(target as u64).to_le_bytes());
        Self::store(&mut st, pid, addr, &encoding);

        *st.branch_writes.entry((pid, addr)).or_insert(0) += 1;
        st.flushes += 1;
        Ok(BranchInstall {
            len: FOOTPRINT,
            resume: 0xC0DE_0000 ^ addr,
        })
    }

    fn restore_bytes(&self, pid: Pid, addr: usize, src: &[u8]) -> PatchResult<()> {
        let mut st = self.state.lock();
        if st.refused.contains(&(pid, addr)) {
            return Err(PatchError::InvalidKernelAddr((addr, None)));
        }
        Self::store(&mut st, pid, addr, src);
        st.flushes += 1;
        Ok(())
    }

    fn firmware_version(&self) -> PatchResult<u32> {
        self.state.lock().firmware.ok_or(PatchError::NotFound)
    }

    fn module_info(&self, pid: Pid, name: Option<&str>, nid: u32) -> PatchResult<ModuleInfo> {
        let st = self.state.lock();
        st.modules
            .iter()
            .find(|(mpid, info)| {
                *mpid == pid
                    && name.is_none_or(|n| n == info.name)
                    && (nid == 0 || info.module_nid == nid)
            })
            .map(|(_, info)| info.clone())
            .ok_or(PatchError::NotFound)
    }

    fn module_export_addr(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
    ) -> PatchResult<usize> {
        self.state
            .lock()
            .exports
            .get(&(pid, modname.to_string(), libnid, funcnid))
            .copied()
            .ok_or(PatchError::NotFound)
    }

    fn module_import_stub_addr(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
    ) -> PatchResult<usize> {
        self.state
            .lock()
            .imports
            .get(&(pid, modname.to_string(), libnid, funcnid))
            .copied()
            .ok_or(PatchError::NotFound)
    }
}

/// Tiny deterministic generator so stress runs are reproducible without
/// pulling in a PRNG crate.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }
}

/// Creates a random shuffling of integers 0..count.
///
/// count MUST BE PRIME! This works because any number (except 0) is an
/// additive generator modulo a prime. Number theory!
pub fn shuffle_choices(rng: &mut Lcg, count: usize) -> Vec<usize> {
    let mut ordering = vec![0usize; count];
    ordering[0] = rng.next_u32() as usize % count;
    if ordering[0] == 0 {
        ordering[0] += 1;
    }
    for i in 1..count {
        ordering[i] = (ordering[i - 1] + ordering[0]) % count;
    }
    ordering
}
