#[cfg(feature = "async")]
pub mod async_ext;
pub mod error;
pub mod hooks;
pub mod inject;
pub mod map;
pub mod memory;
pub mod module;
pub mod patches;
pub mod substrate;

pub use error::{PatchError, PatchResult, PatchResultExt};
pub use hooks::{HookChain, HookRef};
pub use patches::{HookHandle, InjectHandle, Patch, PatchBody, PatchManager};
pub use substrate::{BranchInstall, KERNEL_PID, ModuleInfo, Pid, Substrate};
