//! Allocates and tears down the scratch stack the worker thread runs on, and
//! carries the path string the trampoline eventually hands to `_dlopen`.

use std::ffi::CString;
use std::path::Path;

use crate::mac::errors::InjectError;
use crate::mac::mach::{self, mach_port_t};

/// 32 KiB, ample for the handful of frames the worker thread executes before
/// faulting.
const STACK_SIZE: u64 = 32 * 1024;

/// How far below the top of the allocation the initial stack pointer sits,
/// leaving room below it for the `_dlopen` path string.
const TIP_MARGIN: u64 = 256;

/// A scratch region allocated in the target task, deallocated unconditionally
/// when dropped so a failure partway through setup can never leak it.
pub struct RemoteStack {
    task: mach_port_t,
    base: u64,
    size: u64,
    armed: bool,
}

impl RemoteStack {
    pub fn allocate(task: mach_port_t) -> Result<Self, InjectError> {
        let mut base: u64 = 0;

        mach::kern_ret("mach_vm_allocate", unsafe {
            mach::mach_vm_allocate(task, &mut base, STACK_SIZE, mach::VM_FLAGS_ANYWHERE)
        })?;

        Ok(Self {
            task,
            base,
            size: STACK_SIZE,
            armed: true,
        })
    }

    /// The initial stack pointer handed to the newly created thread.
    pub fn tip(&self) -> u64 {
        self.base + self.size - TIP_MARGIN
    }

    /// The base of the allocation, also used as the address the target
    /// image's path string is written to.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Writes `path`'s null-terminated bytes to [`Self::base`], returning the
    /// address `_dlopen`'s first argument should point at.
    pub fn write_path(&self, path: &Path) -> Result<u64, InjectError> {
        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| InjectError::InvalidArgument("path contains an interior NUL byte"))?;
        let bytes = c_path.as_bytes_with_nul();

        if bytes.len() as u64 > TIP_MARGIN {
            return Err(InjectError::InvalidArgument(
                "path is too long to fit in the reserved scratch space",
            ));
        }

        mach::kern_ret("mach_vm_write", unsafe {
            mach::mach_vm_write(self.task, self.base, bytes.as_ptr().cast(), bytes.len() as u32)
        })?;

        Ok(self.base)
    }

    /// Writes raw 32-bit words at [`Self::tip`]. Used by the X86-32 calling
    /// convention, which passes all of its call arguments on the stack, and
    /// by ARM32, which spills only its fifth and sixth arguments there.
    pub fn write_stack_words(&self, words: &[u32]) -> Result<(), InjectError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_ne_bytes()).collect();

        mach::kern_ret("mach_vm_write", unsafe {
            mach::mach_vm_write(self.task, self.tip(), bytes.as_ptr().cast(), bytes.len() as u32)
        })?;

        Ok(())
    }

    fn deallocate(&mut self) {
        if self.armed {
            // SAFETY: `self.base`/`self.size` describe the allocation made in
            // `allocate`, which we own exclusively.
            unsafe {
                let _ = mach::mach_vm_deallocate(self.task, self.base, self.size);
            }
            self.armed = false;
        }
    }
}

impl Drop for RemoteStack {
    fn drop(&mut self) {
        self.deallocate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_paths_too_long_for_the_reserved_margin() {
        let stack = RemoteStack {
            task: 0,
            base: 0x1000,
            size: STACK_SIZE,
            armed: false,
        };

        let long_path = Path::new(&"a".repeat(TIP_MARGIN as usize + 1));
        let err = stack.write_path(long_path).unwrap_err();
        assert!(matches!(err, InjectError::InvalidArgument(_)));
    }

    #[test]
    fn tip_sits_below_the_top_of_the_allocation_by_the_margin() {
        let stack = RemoteStack {
            task: 0,
            base: 0x1000,
            size: STACK_SIZE,
            armed: false,
        };

        assert_eq!(stack.tip(), 0x1000 + STACK_SIZE - TIP_MARGIN);
    }
}
