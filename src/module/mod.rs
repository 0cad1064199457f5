use anyhow::anyhow;

use crate::patches::PatchManager;
use crate::substrate::{MODULE_MAX_SEGMENTS, ModuleInfo, Pid};
use crate::{PatchError, PatchResult};

/// Fallback if the running firmware version cannot be detected.
pub const DEFAULT_FW_VERSION: u32 = 0x0360_0000;

/// Name/NID lookups layered over the substrate's module manager.
///
/// These are informational: nothing here participates in the registry's
/// invariants. Validation and the firmware memo live on this side; the
/// actual table walking is the platform's business.
impl PatchManager {
    /// The running system software version, computed once per manager.
    pub fn firmware_version(&self) -> u32 {
        *self.firmware_cell().get_or_init(|| {
            match self.substrate().firmware_version() {
                Ok(version) => {
                    log::debug!("firmware version: {:#010x}", version);
                    version
                }
                Err(err) => {
                    log::warn!("cannot detect firmware version ({}), assuming {:#010x}", err, DEFAULT_FW_VERSION);
                    DEFAULT_FW_VERSION
                }
            }
        })
    }

    /// Gets a loaded module by name or NID or both.
    ///
    /// With `name == None` only the NID is used; a non-zero `nid` narrows a
    /// name lookup.
    pub fn module_by_name_nid(
        &self,
        pid: Pid,
        name: Option<&str>,
        nid: u32,
    ) -> PatchResult<ModuleInfo> {
        if name.is_none() && nid == 0 {
            return Err(PatchError::InvalidArgs(Some(anyhow!(
                "need a module name or a NID"
            ))));
        }
        let info = self.substrate().module_info(pid, name, nid)?;
        log::debug!(
            "found module {} pid:{:#x} nid:{:#010x}",
            info.name,
            pid,
            info.module_nid
        );
        Ok(info)
    }

    /// Resolves an offset from a segment of a named module.
    pub fn module_offset(
        &self,
        pid: Pid,
        modname: &str,
        segidx: usize,
        offset: usize,
    ) -> PatchResult<usize> {
        if segidx >= MODULE_MAX_SEGMENTS {
            return Err(PatchError::InvalidArgs(Some(anyhow!(
                "invalid segment index: {segidx}"
            ))));
        }
        let info = self.module_by_name_nid(pid, Some(modname), 0)?;
        let segment = info.segments[segidx];
        if offset > segment.memsz {
            return Err(PatchError::InvalidArgs(Some(anyhow!(
                "offset {offset:#x} overflows segment size {:#x}",
                segment.memsz
            ))));
        }
        Ok(segment.vaddr + offset)
    }

    /// Address of a function exported by a module.
    pub fn module_export_addr(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
    ) -> PatchResult<usize> {
        log::debug!(
            "getting export pid:{:#x} modname:{} libnid:{:#010x} funcnid:{:#010x}",
            pid,
            modname,
            libnid,
            funcnid
        );
        self.substrate()
            .module_export_addr(pid, modname, libnid, funcnid)
    }

    /// Address of the stub a module calls an imported function through.
    pub fn module_import_stub_addr(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
    ) -> PatchResult<usize> {
        log::debug!(
            "getting import stub pid:{:#x} modname:{} libnid:{:#010x} funcnid:{:#010x}",
            pid,
            modname,
            libnid,
            funcnid
        );
        self.substrate()
            .module_import_stub_addr(pid, modname, libnid, funcnid)
    }

    /// Hooks an exported function, resolving it by NID first.
    pub fn hook_export(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
        hook_func: usize,
    ) -> PatchResult<(crate::patches::HookHandle, crate::hooks::HookRef)> {
        let addr = self.module_export_addr(pid, modname, libnid, funcnid)?;
        self.hook_func_abs(pid, addr, hook_func)
    }

    /// Hooks a call site through its import stub, resolving it by NID first.
    pub fn hook_import(
        &self,
        pid: Pid,
        modname: &str,
        libnid: u32,
        funcnid: u32,
        hook_func: usize,
    ) -> PatchResult<(crate::patches::HookHandle, crate::hooks::HookRef)> {
        let addr = self.module_import_stub_addr(pid, modname, libnid, funcnid)?;
        self.hook_func_abs(pid, addr, hook_func)
    }

    /// Injects bytes at an offset from a module segment.
    pub fn inject_at_offset(
        &self,
        pid: Pid,
        modname: &str,
        segidx: usize,
        offset: usize,
        src: &[u8],
    ) -> PatchResult<crate::patches::InjectHandle> {
        let dest = self.module_offset(pid, modname, segidx, offset)?;
        self.inject_abs(pid, dest, src)
    }
}
