use crate::PatchResult;

/// Process identity. The kernel process is `KERNEL_PID`; everything else is a
/// userland process id assigned by the host.
pub type Pid = i32;

/// The distinguished pid naming the kernel process itself.
pub const KERNEL_PID: Pid = 0x10005;

/// Maximum number of segments a module can report.
pub const MODULE_MAX_SEGMENTS: usize = 4;

/// One mapped segment of a loaded module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: usize,
    pub memsz: usize,
}

/// A loaded module, as resolved by the host's module manager.
///
/// Carries only what the patch core and its clients consume; the host-side
/// structures this is converted from differ between firmware versions.
#[derive(Debug, Clone, Default)]
pub struct ModuleInfo {
    pub modid: i32,
    pub module_nid: u32,
    pub name: String,
    pub exports_start: usize,
    pub exports_end: usize,
    pub imports_start: usize,
    pub imports_end: usize,
    pub segments: [Segment; MODULE_MAX_SEGMENTS],
}

/// What the substrate reports back from a branch install.
#[derive(Debug, Clone, Copy)]
pub struct BranchInstall {
    /// Bytes actually claimed at the target. At most the footprint; the
    /// substrate may round up for alignment.
    pub len: usize,
    /// Address of the call-original thunk: executing it resumes the saved
    /// instructions. Stored in the chain's tail sentinel.
    pub resume: usize,
}

/// The platform facility that reads, writes, and flushes target memory.
///
/// Everything below the patch registry goes through this trait: the core
/// never touches an address space directly. Implementations must flush the
/// instruction cache after every code write.
pub trait Substrate: Send + Sync {
    /// Number of bytes needed to encode one unconditional branch on the
    /// target architecture. A platform constant.
    fn footprint(&self) -> usize;

    /// Copy `dst.len()` bytes from `addr` in `pid`'s address space into a
    /// local buffer. Returns the number of bytes copied.
    fn save_bytes(&self, pid: Pid, addr: usize, dst: &mut [u8]) -> PatchResult<usize>;

    /// Atomically replace up to `footprint` bytes at `addr` with a branch to
    /// `target`, copying the displaced bytes into `original`. Must flush the
    /// I-cache before returning.
    fn write_branch(
        &self,
        pid: Pid,
        addr: usize,
        target: usize,
        original: &mut [u8],
    ) -> PatchResult<BranchInstall>;

    /// Write `src` over `[addr, addr + src.len())` and flush. Inverse of
    /// `write_branch` when handed saved bytes; also the raw injection write.
    fn restore_bytes(&self, pid: Pid, addr: usize, src: &[u8]) -> PatchResult<()>;

    /// The running system software version, when the host can tell.
    fn firmware_version(&self) -> PatchResult<u32>;

    /// Resolve a loaded module by name, NID, or both. `name == None` looks up
    /// by NID alone; a non-zero `nid` narrows a name lookup.
    fn module_info(&self, pid: Pid, name: Option<&str>, nid: u32) -> PatchResult<ModuleInfo>;

    /// Address of an exported function, by module name and NIDs.
    fn module_export_addr(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
    ) -> PatchResult<usize>;

    /// Address of the stub a module calls an imported function through.
    fn module_import_stub_addr(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
    ) -> PatchResult<usize>;
}
