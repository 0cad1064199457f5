use std::any::type_name;

use bytemuck::Pod;

use crate::patch_err;
use crate::substrate::{Pid, Substrate};
use crate::PatchResult;

/// Reads `size` bytes out of a target address space.
pub fn read_bytes(
    substrate: &dyn Substrate,
    pid: Pid,
    addr: usize,
    size: usize,
) -> PatchResult<Vec<u8>> {
    let mut buffer = vec![0u8; size];
    let bytes_read = substrate.save_bytes(pid, addr, &mut buffer)?;
    buffer.truncate(bytes_read);
    Ok(buffer)
}

/// Writes raw bytes into a target address space, flushing caches.
pub fn write_bytes(
    substrate: &dyn Substrate,
    pid: Pid,
    addr: usize,
    bytes: &[u8],
) -> PatchResult<()> {
    substrate.restore_bytes(pid, addr, bytes)
}

/// Top-level read function.
///
/// Use this for reading values directly out of target memory.
/// Value must implement bytemuck::Pod.
pub fn read_value<T: Pod>(substrate: &dyn Substrate, pid: Pid, addr: usize) -> PatchResult<T> {
    let size = std::mem::size_of::<T>();
    let raw = read_bytes(substrate, pid, addr, size)?;
    if raw.len() != size {
        return Err(patch_err!(
            "short read of type \"{}\" at {addr:#x}: {} of {} bytes",
            type_name::<T>(),
            raw.len(),
            size
        ));
    }

    bytemuck::try_pod_read_unaligned::<T>(&raw)
        .map_err(|e| patch_err!("failed to convert bytes to type \"{}\": {}", type_name::<T>(), e))
}

/// Top-level write function.
///
/// Use this for writing types directly to target memory.
/// Value must implement bytemuck::Pod.
pub fn write_value<T: Pod>(
    substrate: &dyn Substrate,
    pid: Pid,
    addr: usize,
    value: T,
) -> PatchResult<()> {
    write_bytes(substrate, pid, addr, bytemuck::bytes_of(&value))
}
