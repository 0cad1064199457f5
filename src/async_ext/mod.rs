use std::{future::Future, pin::Pin};

use crate::hooks::HookRef;
use crate::patches::{HookHandle, InjectHandle, PatchManager};
use crate::substrate::Pid;
use crate::PatchResult;

#[cfg(feature = "async")]
#[macro_export]
/// Clones a PatchManager and passes it into a smol::unblock closure, awaited.
/// Effectively, this lets you run blocking patch operations asynchronously.
macro_rules! await_patchop {
    (
        $manager:expr,
        $body:expr
    ) => {{
        let manager_clone = $manager.clone();

        smol::unblock(move || -> $crate::PatchResult<_> { $body(manager_clone) }).await
    }};
}

#[cfg(feature = "async")]
#[macro_export]
/// Same as await_patchop!() but does not await the future created by the sync closure.
macro_rules! spawn_patchop {
    (
        $manager:expr,
        $body:expr
    ) => {{
        let manager_clone = $manager.clone();

        smol::unblock(move || -> $crate::PatchResult<_> { $body(manager_clone) })
    }};
}

/// Async-facing operations so the manager can be driven from executor code
/// without blocking a reactor thread.
#[cfg(feature = "async")]
pub trait AsyncPatchOps {
    fn async_hook_func_abs(
        &self,
        pid: Pid,
        dest_func: usize,
        hook_func: usize,
    ) -> Pin<Box<dyn Future<Output = PatchResult<(HookHandle, HookRef)>> + Send + '_>>;

    fn async_hook_release(
        &self,
        handle: HookHandle,
    ) -> Pin<Box<dyn Future<Output = PatchResult<()>> + Send + '_>>;

    fn async_inject_abs(
        &self,
        pid: Pid,
        dest: usize,
        src: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = PatchResult<InjectHandle>> + Send + '_>>;

    fn async_inject_release(
        &self,
        handle: InjectHandle,
    ) -> Pin<Box<dyn Future<Output = PatchResult<()>> + Send + '_>>;

    fn async_try_cleanup_process(
        &self,
        pid: Pid,
    ) -> Pin<Box<dyn Future<Output = PatchResult<()>> + Send + '_>>;
}

#[cfg(feature = "async")]
impl AsyncPatchOps for PatchManager {
    fn async_hook_func_abs(
        &self,
        pid: Pid,
        dest_func: usize,
        hook_func: usize,
    ) -> Pin<Box<dyn Future<Output = PatchResult<(HookHandle, HookRef)>> + Send + '_>> {
        use crate::await_patchop;
        Box::pin(async move {
            await_patchop!(self, |m: PatchManager| m
                .hook_func_abs(pid, dest_func, hook_func))
        })
    }

    fn async_hook_release(
        &self,
        handle: HookHandle,
    ) -> Pin<Box<dyn Future<Output = PatchResult<()>> + Send + '_>> {
        use crate::await_patchop;
        Box::pin(async move { await_patchop!(self, move |m: PatchManager| m.hook_release(handle)) })
    }

    fn async_inject_abs(
        &self,
        pid: Pid,
        dest: usize,
        src: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = PatchResult<InjectHandle>> + Send + '_>> {
        use crate::await_patchop;
        Box::pin(async move {
            await_patchop!(self, move |m: PatchManager| m.inject_abs(pid, dest, &src))
        })
    }

    fn async_inject_release(
        &self,
        handle: InjectHandle,
    ) -> Pin<Box<dyn Future<Output = PatchResult<()>> + Send + '_>> {
        use crate::await_patchop;
        Box::pin(async move { await_patchop!(self, move |m: PatchManager| m.inject_release(handle)) })
    }

    fn async_try_cleanup_process(
        &self,
        pid: Pid,
    ) -> Pin<Box<dyn Future<Output = PatchResult<()>> + Send + '_>> {
        use crate::await_patchop;
        Box::pin(async move { await_patchop!(self, |m: PatchManager| m.try_cleanup_process(pid)) })
    }
}
