// protect.rs
//! Scoped memory protection toggling.
//!
//! Patch sites live in pages the loader mapped read-only or read-execute.
//! Writing them means lifting protection for the shortest possible window and
//! putting the original protection back on every exit path. [`ScopedUnprotect`]
//! is that window as an RAII guard.

use thiserror::Error;

/// A contiguous byte range in the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub address: usize,
    pub len: usize,
}

impl Region {
    pub fn new(address: usize, len: usize) -> Self {
        Self { address, len }
    }

    /// Region covering a single value of type `T` at `ptr`.
    pub fn of<T>(ptr: *const T) -> Self {
        Self {
            address: ptr as usize,
            len: std::mem::size_of::<T>(),
        }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.address + self.len
    }

    /// Expand to whole pages of `page_size` bytes (power of two).
    pub fn page_span(&self, page_size: usize) -> Region {
        debug_assert!(page_size.is_power_of_two());
        let mask = page_size - 1;
        let start = self.address & !mask;
        let end = (self.end() + mask) & !mask;
        Region {
            address: start,
            len: end - start,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtectError {
    #[error("region at {address:#x} is empty")]
    EmptyRegion { address: usize },

    #[error("cannot change protection of {len} bytes at {address:#x} (os error {code})")]
    Toggle { address: usize, len: usize, code: i32 },

    #[error("current protection of {address:#x} is unknown")]
    UnknownProtection { address: usize },
}

/// Grants temporary write access to a region.
///
/// The returned guard restores the previous protection when dropped.
pub trait MemoryProtector {
    type Guard;

    /// Granularity at which protection changes.
    fn page_size(&self) -> usize {
        page_size()
    }

    fn unprotect(&self, region: Region) -> Result<Self::Guard, ProtectError>;

    /// Run `f` while `region` is writable.
    fn with_writable_memory<R>(
        &self,
        region: Region,
        f: impl FnOnce() -> R,
    ) -> Result<R, ProtectError> {
        let _guard = self.unprotect(region)?;
        Ok(f())
    }
}

/// For locations that are already writable (plain data, test buffers).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProtection;

impl MemoryProtector for NoProtection {
    type Guard = ();

    fn unprotect(&self, region: Region) -> Result<(), ProtectError> {
        if region.len == 0 {
            return Err(ProtectError::EmptyRegion {
                address: region.address,
            });
        }
        Ok(())
    }
}

/// The operating system's page protection.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProtector;

impl MemoryProtector for SystemProtector {
    type Guard = ScopedUnprotect;

    fn unprotect(&self, region: Region) -> Result<ScopedUnprotect, ProtectError> {
        ScopedUnprotect::new(region)
    }
}

/// Write access to a page span, released on drop.
///
/// Each page keeps its own previous protection and pages are restored in
/// reverse order, so a span covering a code page and a data page gets both
/// back as they were.
#[derive(Debug)]
pub struct ScopedUnprotect {
    span: Region,
    pages: Vec<(Region, Protection)>,
}

impl ScopedUnprotect {
    pub fn new(region: Region) -> Result<Self, ProtectError> {
        if region.len == 0 {
            return Err(ProtectError::EmptyRegion {
                address: region.address,
            });
        }
        let size = page_size();
        let span = region.page_span(size);
        let mut guard = Self {
            span,
            pages: Vec::with_capacity(span.len / size),
        };
        for address in (span.address..span.end()).step_by(size) {
            let page = Region::new(address, size);
            // On error, dropping `guard` restores the pages already lifted.
            let previous = make_writable(page)?;
            guard.pages.push((page, previous));
        }
        tracing::trace!(address = span.address, len = span.len, "unprotected");
        Ok(guard)
    }

    pub fn span(&self) -> Region {
        self.span
    }
}

impl Drop for ScopedUnprotect {
    fn drop(&mut self) {
        for &(page, previous) in self.pages.iter().rev() {
            if let Err(err) = restore(page, previous) {
                tracing::warn!(%err, "failed to restore page protection");
            }
        }
    }
}

fn last_os_error() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/* -------------------------- Windows -------------------------- */

#[cfg(target_os = "windows")]
type Protection = u32;

#[cfg(target_os = "windows")]
pub fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    let size = info.dwPageSize as usize;
    if size.is_power_of_two() { size } else { 4096 }
}

#[cfg(target_os = "windows")]
fn make_writable(span: Region) -> Result<Protection, ProtectError> {
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE};
    let mut old: Protection = 0;
    let ok = unsafe {
        VirtualProtect(
            span.address as *const core::ffi::c_void,
            span.len,
            PAGE_EXECUTE_READWRITE,
            &mut old,
        )
    };
    if ok == 0 {
        return Err(ProtectError::Toggle {
            address: span.address,
            len: span.len,
            code: last_os_error(),
        });
    }
    Ok(old)
}

#[cfg(target_os = "windows")]
fn restore(span: Region, previous: Protection) -> Result<(), ProtectError> {
    use windows_sys::Win32::System::Memory::VirtualProtect;
    let mut old: Protection = 0;
    let ok = unsafe {
        VirtualProtect(
            span.address as *const core::ffi::c_void,
            span.len,
            previous,
            &mut old,
        )
    };
    if ok == 0 {
        return Err(ProtectError::Toggle {
            address: span.address,
            len: span.len,
            code: last_os_error(),
        });
    }
    Ok(())
}

/* --------------------------- Unix ---------------------------- */

#[cfg(unix)]
type Protection = libc::c_int;

#[cfg(unix)]
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 && (size as usize).is_power_of_two() {
        size as usize
    } else {
        4096
    }
}

#[cfg(unix)]
fn make_writable(span: Region) -> Result<Protection, ProtectError> {
    let previous = current_protection(span.address)?;
    set_protection(span, previous | libc::PROT_WRITE)?;
    Ok(previous)
}

#[cfg(unix)]
fn restore(span: Region, previous: Protection) -> Result<(), ProtectError> {
    set_protection(span, previous)
}

#[cfg(unix)]
fn set_protection(span: Region, prot: Protection) -> Result<(), ProtectError> {
    let rc = unsafe { libc::mprotect(span.address as *mut libc::c_void, span.len, prot) };
    if rc != 0 {
        return Err(ProtectError::Toggle {
            address: span.address,
            len: span.len,
            code: last_os_error(),
        });
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_protection(address: usize) -> Result<Protection, ProtectError> {
    std::fs::read_to_string("/proc/self/maps")
        .ok()
        .and_then(|maps| protection_from_maps(&maps, address))
        .ok_or(ProtectError::UnknownProtection { address })
}

/// Without a query the previous protection cannot be put back, so the page
/// is left alone.
#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn current_protection(address: usize) -> Result<Protection, ProtectError> {
    Err(ProtectError::UnknownProtection { address })
}

/// Protection of the mapping containing `address`, from `/proc/self/maps` text.
///
/// Lines look like `55d0c6a00000-55d0c6a21000 r-xp 00000000 08:01 1234 /bin/host`.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn protection_from_maps(maps: &str, address: usize) -> Option<Protection> {
    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;
        if address < start || address >= end {
            continue;
        }
        let bytes = perms.as_bytes();
        let mut prot = libc::PROT_NONE;
        if bytes.first() == Some(&b'r') { prot |= libc::PROT_READ; }
        if bytes.get(1) == Some(&b'w') { prot |= libc::PROT_WRITE; }
        if bytes.get(2) == Some(&b'x') { prot |= libc::PROT_EXEC; }
        return Some(prot);
    }
    None
}

/* --------------------- Other / WASM / Fallbacks --------------------- */

#[cfg(not(any(target_os = "windows", unix)))]
type Protection = ();

#[cfg(not(any(target_os = "windows", unix)))]
pub fn page_size() -> usize {
    4096
}

#[cfg(not(any(target_os = "windows", unix)))]
fn make_writable(_span: Region) -> Result<Protection, ProtectError> {
    Ok(())
}

#[cfg(not(any(target_os = "windows", unix)))]
fn restore(_span: Region, _previous: Protection) -> Result<(), ProtectError> {
    Ok(())
}
