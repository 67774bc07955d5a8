//! Readable image windows and in-process module lookup.
//!
//! Everything upstream of the patch applier works on an [`ImageView`]: a base
//! address plus the bytes mapped there. The view is either a buffer holding a
//! PE file mapped to its virtual layout, or (on Windows) the live module image
//! of the current process.

use crate::error::Result;

#[cfg(target_os = "windows")]
use crate::error::Error;

#[cfg(target_os = "windows")]
use windows::core::PCSTR;
#[cfg(target_os = "windows")]
use windows::Win32::System::{
    LibraryLoader::GetModuleHandleA,
    ProcessStatus::{GetModuleInformation, MODULEINFO},
    Threading::GetCurrentProcess,
};

/// A read-only window over an image mapped at `base`.
#[derive(Clone, Copy, Debug)]
pub struct ImageView<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl<'a> ImageView<'a> {
    /// Wrap `bytes` as the image mapped at `base`.
    pub fn new(base: u64, bytes: &'a [u8]) -> Self {
        Self { base, bytes }
    }

    /// Wrap a live module image.
    ///
    /// # Safety
    /// `base` must point to `size` readable bytes that stay mapped, and are not
    /// written through any other path, for the lifetime `'a`.
    pub unsafe fn from_raw(base: *const u8, size: usize) -> Self {
        Self {
            base: base as u64,
            bytes: std::slice::from_raw_parts(base, size),
        }
    }

    /// Load address of the image.
    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the window in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// First address past the end of the window.
    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    /// Check whether `va` lies inside the window.
    #[inline]
    pub fn contains(&self, va: u64) -> bool {
        va >= self.base && va < self.end()
    }

    /// Convert an absolute address to an RVA, if it lies inside the window.
    #[inline]
    pub fn rva(&self, va: u64) -> Option<u64> {
        self.contains(va).then(|| va - self.base)
    }

    /// Read `len` bytes at `va`. Returns `None` if any of them fall outside the window.
    pub fn read(&self, va: u64, len: usize) -> Option<&'a [u8]> {
        let start = usize::try_from(va.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        self.bytes.get(start..end)
    }

    /// All bytes from `va` to the end of the window.
    pub fn tail(&self, va: u64) -> Option<&'a [u8]> {
        let start = usize::try_from(va.checked_sub(self.base)?).ok()?;
        if start >= self.bytes.len() {
            return None;
        }
        Some(&self.bytes[start..])
    }

    /// The whole window.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Locate a loaded module of the current process and return its `(base, size)`.
#[cfg(target_os = "windows")]
pub fn module_range(name: &str) -> Result<(*const u8, usize)> {
    let name_cstr =
        std::ffi::CString::new(name).map_err(|_| Error::ModuleNotFound(name.to_string()))?;
    let hmodule = unsafe { GetModuleHandleA(PCSTR(name_cstr.as_ptr() as *const u8)) }?;

    if hmodule.is_invalid() {
        return Err(Error::ModuleNotFound(name.to_string()));
    }

    let mut info = MODULEINFO::default();
    unsafe {
        GetModuleInformation(
            GetCurrentProcess(),
            hmodule,
            &mut info,
            std::mem::size_of::<MODULEINFO>() as u32,
        )?;
    }

    Ok((info.lpBaseOfDll as *const u8, info.SizeOfImage as usize))
}

/// Stub for non-Windows platforms.
#[cfg(not(target_os = "windows"))]
pub fn module_range(_name: &str) -> Result<(*const u8, usize)> {
    Err(crate::error::Error::Unsupported("in-process module lookup"))
}
