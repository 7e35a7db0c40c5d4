//! Protection-toggled safepoint page.
//!
//! Compiled code polls the page with a single load. Arming the page removes
//! read access so the next poll faults; the fault layer recognises the
//! faulting address and treats the fault as a safepoint arrival.
//!
//! Several independent requesters (GC, interrupt delivery) may want the page
//! armed at once, so arming is reference counted: the protection only
//! changes on the 0 → 1 and 1 → 0 transitions.
//!
//! ```ignore
//! let page = SafepointPage::new()?;
//! page.arm()?;      // polls now trap
//! page.disarm()?;   // polls succeed again
//! ```

use std::io;
use std::ptr::NonNull;

use parking_lot::Mutex;

#[cfg(unix)]
use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_NONE, PROT_READ, c_void, mmap, mprotect, munmap};

#[cfg(windows)]
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READONLY, VirtualAlloc, VirtualFree,
    VirtualProtect,
};

use super::SafepointError;

// =============================================================================
// SafepointPage
// =============================================================================

/// A single OS page whose readability signals "no safepoint requested".
pub struct SafepointPage {
    /// Page base address.
    base: NonNull<u8>,

    /// OS page size.
    page_size: usize,

    /// Outstanding arm requests.
    arm_count: Mutex<u32>,
}

// Safety: the page is only touched through protection syscalls and address
// comparisons; the arm count is lock-protected.
unsafe impl Send for SafepointPage {}
unsafe impl Sync for SafepointPage {}

impl SafepointPage {
    /// Reserve and commit one readable page.
    pub fn new() -> Result<Self, SafepointError> {
        let page_size = Self::get_page_size();
        let base = Self::allocate_page(page_size)?;

        Ok(SafepointPage {
            base,
            page_size,
            arm_count: Mutex::new(0),
        })
    }

    /// Address compiled code polls.
    #[inline]
    pub fn poll_address(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size of the page in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.page_size
    }

    /// Whether `addr` falls inside the page.
    #[inline]
    pub fn contains_address(&self, addr: usize) -> bool {
        let base = self.poll_address();
        addr >= base && addr < base + self.page_size
    }

    /// Whether any requester currently has the page armed.
    #[inline]
    pub fn is_armed(&self) -> bool {
        *self.arm_count.lock() != 0
    }

    /// Number of outstanding arm requests.
    #[inline]
    pub fn arm_count(&self) -> u32 {
        *self.arm_count.lock()
    }

    /// Add an arm request, revoking read access on the first one.
    pub fn arm(&self) -> Result<(), SafepointError> {
        let mut count = self.arm_count.lock();
        if *count == 0 {
            self.protect_page(false)?;
        }
        *count += 1;
        Ok(())
    }

    /// Drop an arm request, restoring read access on the last one.
    pub fn disarm(&self) -> Result<(), SafepointError> {
        let mut count = self.arm_count.lock();
        match *count {
            0 => Err(SafepointError::NotArmed),
            1 => {
                self.protect_page(true)?;
                *count = 0;
                Ok(())
            }
            _ => {
                *count -= 1;
                Ok(())
            }
        }
    }

    // =========================================================================
    // Platform-specific implementation
    // =========================================================================

    #[cfg(unix)]
    fn allocate_page(page_size: usize) -> Result<NonNull<u8>, SafepointError> {
        unsafe {
            let ptr = mmap(
                std::ptr::null_mut(),
                page_size,
                PROT_READ,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            );

            if ptr == libc::MAP_FAILED {
                return Err(SafepointError::AllocationFailed(
                    io::Error::last_os_error().to_string(),
                ));
            }

            NonNull::new(ptr as *mut u8)
                .ok_or_else(|| SafepointError::AllocationFailed("mmap returned null".to_string()))
        }
    }

    #[cfg(windows)]
    fn allocate_page(page_size: usize) -> Result<NonNull<u8>, SafepointError> {
        unsafe {
            let ptr = VirtualAlloc(
                std::ptr::null_mut(),
                page_size,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_READONLY,
            );

            if ptr.is_null() {
                return Err(SafepointError::AllocationFailed(
                    io::Error::last_os_error().to_string(),
                ));
            }

            NonNull::new(ptr as *mut u8).ok_or_else(|| {
                SafepointError::AllocationFailed("VirtualAlloc returned null".to_string())
            })
        }
    }

    #[cfg(unix)]
    fn protect_page(&self, readable: bool) -> Result<(), SafepointError> {
        let prot = if readable { PROT_READ } else { PROT_NONE };
        let result = unsafe { mprotect(self.base.as_ptr() as *mut c_void, self.page_size, prot) };
        if result != 0 {
            return Err(SafepointError::ProtectionFailed(
                io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(windows)]
    fn protect_page(&self, readable: bool) -> Result<(), SafepointError> {
        let protect = if readable {
            PAGE_READONLY
        } else {
            PAGE_NOACCESS
        };
        let mut old_protect = 0;
        let result = unsafe {
            VirtualProtect(
                self.base.as_ptr() as *mut _,
                self.page_size,
                protect,
                &mut old_protect,
            )
        };
        if result == 0 {
            return Err(SafepointError::ProtectionFailed(
                io::Error::last_os_error().to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(unix)]
    fn get_page_size() -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    #[cfg(windows)]
    fn get_page_size() -> usize {
        use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
        unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info.dwPageSize as usize
        }
    }
}

impl Drop for SafepointPage {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            munmap(self.base.as_ptr() as *mut c_void, self.page_size);
        }

        #[cfg(windows)]
        unsafe {
            VirtualFree(self.base.as_ptr() as *mut _, 0, MEM_RELEASE);
        }
    }
}

impl std::fmt::Debug for SafepointPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafepointPage")
            .field("base", &format_args!("{:#x}", self.poll_address()))
            .field("page_size", &self.page_size)
            .field("arm_count", &self.arm_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
