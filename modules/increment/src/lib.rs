//! Guest that reads a counter the host planted in linear memory.
//!
//! `loadAndIncrement(location)` loads the little-endian `u32` at byte offset
//! `location` of the exported `memory` and returns it plus one. A location
//! whose four bytes do not fit in memory, or the null address `0`, traps.

/// Size of one wasm linear memory page.
pub const WASM_PAGE_SIZE: usize = 65_536;

#[inline]
pub fn increment(value: u32) -> u32 {
    value.wrapping_add(1)
}

/// Validates that a `u32` can be read at `location` in a memory of
/// `memory_len` bytes and returns the start offset.
///
/// Offset `0` is the null address inside the guest and is never readable.
pub fn checked_start(location: u32, memory_len: usize) -> Option<usize> {
    let start = usize::try_from(location).ok().filter(|&start| start != 0)?;
    let end = start.checked_add(4)?;
    (end <= memory_len).then_some(start)
}

/// Reads the little-endian `u32` at `location` in `memory` and increments it.
///
/// Returns `None` exactly where the wasm export traps.
pub fn load_and_increment_in(memory: &[u8], location: u32) -> Option<u32> {
    let start = checked_start(location, memory.len())?;
    let bytes: [u8; 4] = memory[start..start + 4].try_into().ok()?;
    Some(increment(u32::from_le_bytes(bytes)))
}

#[cfg(target_arch = "wasm32")]
#[export_name = "loadAndIncrement"]
pub extern "C" fn load_and_increment(location: u32) -> u32 {
    let memory_len = core::arch::wasm32::memory_size(0) * WASM_PAGE_SIZE;
    let Some(start) = checked_start(location, memory_len) else {
        panic!("location {location} is not a readable u32 in {memory_len} bytes of memory");
    };
    // SAFETY: `checked_start` rejects the null address and guarantees the four
    // bytes at `start` lie inside the current linear memory, all of which is
    // mapped and readable. The read is unaligned-tolerant.
    let value = unsafe { core::ptr::read_unaligned(start as *const u32) };
    increment(u32::from_le(value))
}
