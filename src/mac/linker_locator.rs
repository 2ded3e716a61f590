//! Finds the dynamic linker inside a target task and resolves the addresses
//! of `_dlopen` and `_syscall` within it.

use crate::mac::arch::ArchProfile;
use crate::mac::binary_walker::BinaryWalker;
use crate::mac::errors::InjectError;
use crate::mac::mach::{
    self, mach_port_t, DyldAllImageInfos32, DyldAllImageInfos64, MachHeader32, MachHeader64,
    TaskDyldInfo, TaskInfo,
};
use crate::mac::symbol_finder::{AddressBundle, SymbolFinder};

pub struct LinkerLocator;

impl LinkerLocator {
    /// Walks `task_info(TASK_DYLD_INFO)` → the dynamic linker's own Mach
    /// header → its load commands → its symbol table, returning the
    /// dynamic linker's architecture and the addresses of the two symbols
    /// the injection engine needs.
    pub fn locate(task: mach_port_t) -> Result<(ArchProfile, AddressBundle), InjectError> {
        let dyld_info = Self::task_dyld_info(task)?;

        let wide = dyld_info.all_image_info_addr > 0xffff_ffff;
        let dyld_header_addr = Self::dyld_header_address(task, dyld_info.all_image_info_addr, wide)?;

        let (arch, addr_bundle) = Self::resolve_symbols(task, dyld_header_addr)?;
        Ok((arch, addr_bundle))
    }

    fn task_dyld_info(task: mach_port_t) -> Result<TaskDyldInfo, InjectError> {
        let mut info = TaskDyldInfo::default();
        let mut count = (std::mem::size_of::<TaskDyldInfo>() / std::mem::size_of::<u32>()) as u32;

        mach::kern_ret("task_info", unsafe {
            mach::task_info(
                task,
                TaskDyldInfo::FLAVOR,
                std::ptr::from_mut(&mut info).cast(),
                &mut count,
            )
        })?;

        Ok(info)
    }

    /// `dyld_all_image_infos.dyldImageLoadAddress` is the Mach-O header
    /// address of the dynamic linker itself — where `_dlopen`/`_syscall`
    /// live — so this reads just the leading fields of the structure rather
    /// than walking the loaded-image array.
    ///
    /// `version == 1` is the versioned descriptor's oldest known layout and
    /// is rejected outright rather than guessing at a pre-`dyldImageLoadAddress`
    /// field layout.
    fn dyld_header_address(task: mach_port_t, all_image_info_addr: u64, wide: bool) -> Result<u64, InjectError> {
        if wide {
            let raw = mach::read_remote(task, all_image_info_addr, std::mem::size_of::<DyldAllImageInfos64>())?;
            // SAFETY: `raw` is exactly `size_of::<DyldAllImageInfos64>()` bytes.
            let info = unsafe { &*(raw.as_ptr().cast::<DyldAllImageInfos64>()) };
            if info.version == 1 {
                return Err(InjectError::NoSpace);
            }
            Ok(info.dyld_image_load_address)
        } else {
            let raw = mach::read_remote(task, all_image_info_addr, std::mem::size_of::<DyldAllImageInfos32>())?;
            // SAFETY: `raw` is exactly `size_of::<DyldAllImageInfos32>()` bytes.
            let info = unsafe { &*(raw.as_ptr().cast::<DyldAllImageInfos32>()) };
            if info.version == 1 {
                return Err(InjectError::NoSpace);
            }
            Ok(u64::from(info.dyld_image_load_address))
        }
    }

    fn resolve_symbols(
        task: mach_port_t,
        header_addr: u64,
    ) -> Result<(ArchProfile, AddressBundle), InjectError> {
        let magic_bytes = mach::read_remote(task, header_addr, 4)?;
        let magic = u32::from_ne_bytes(magic_bytes.try_into().unwrap());
        let (swap, wide) = BinaryWalker::magic_layout(magic)?;

        let (cpu_type, num_commands, size_commands, header_size) = if wide {
            let raw = mach::read_remote(task, header_addr, std::mem::size_of::<MachHeader64>())?;
            // SAFETY: `raw` is exactly `size_of::<MachHeader64>()` bytes.
            let header = unsafe { &*(raw.as_ptr().cast::<MachHeader64>()) };
            (
                swap_if(swap, header.cpu_type),
                swap_if_u32(swap, header.num_commands),
                swap_if_u32(swap, header.size_commands),
                std::mem::size_of::<MachHeader64>(),
            )
        } else {
            let raw = mach::read_remote(task, header_addr, std::mem::size_of::<MachHeader32>())?;
            // SAFETY: `raw` is exactly `size_of::<MachHeader32>()` bytes.
            let header = unsafe { &*(raw.as_ptr().cast::<MachHeader32>()) };
            (
                swap_if(swap, header.cpu_type),
                swap_if_u32(swap, header.num_commands),
                swap_if_u32(swap, header.size_commands),
                std::mem::size_of::<MachHeader32>(),
            )
        };

        let arch = ArchProfile::from_cpu_type(cpu_type).ok_or(InjectError::InvalidArgument(
            "dynamic linker has an unsupported CPU type",
        ))?;

        let load_commands = mach::read_remote(task, header_addr + header_size as u64, size_commands as usize)?;
        let walked = BinaryWalker::walk(load_commands, num_commands, swap, wide)?;

        let symtab = walked
            .symtab
            .ok_or(InjectError::InvalidAddress("dynamic linker has no symbol table"))?;

        let symtab_vmaddr = BinaryWalker::file_offset_to_vmaddr(&walked.segments, symtab.sym_off)?;
        let strtab_addr = BinaryWalker::file_offset_to_vmaddr(&walked.segments, symtab.str_off)?;

        let entry_size = if wide {
            std::mem::size_of::<crate::mac::mach::Nlist64>()
        } else {
            std::mem::size_of::<crate::mac::mach::Nlist32>()
        };
        let sym_bytes = mach::read_remote(task, symtab_vmaddr, entry_size * symtab.num_syms as usize)?;
        let str_bytes = mach::read_remote(task, strtab_addr, symtab.str_size as usize)?;

        let bundle = SymbolFinder::find(&sym_bytes, &str_bytes, symtab.num_syms, swap, wide)?;

        Ok((arch, bundle))
    }
}

fn swap_if(swap: bool, v: i32) -> i32 {
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

fn swap_if_u32(swap: bool, v: u32) -> u32 {
    if swap {
        v.swap_bytes()
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_if_is_a_no_op_when_not_swapping() {
        assert_eq!(swap_if(false, 42), 42);
        assert_eq!(swap_if_u32(false, 42), 42);
    }

    #[test]
    fn rejects_a_version_one_descriptor() {
        let info = DyldAllImageInfos64 {
            version: 1,
            dyld_image_load_address: 0x1234_5678,
            ..Default::default()
        };
        let addr = std::ptr::addr_of!(info) as u64;
        // SAFETY: reading our own process's memory via `mach_vm_read`.
        let task = unsafe { mach::mach_task_self() };

        let err = LinkerLocator::dyld_header_address(task, addr, true).unwrap_err();
        assert!(matches!(err, InjectError::NoSpace));
    }

    #[test]
    fn reads_the_load_address_from_a_current_descriptor() {
        let info = DyldAllImageInfos64 {
            version: 15,
            dyld_image_load_address: 0x1234_5678,
            ..Default::default()
        };
        let addr = std::ptr::addr_of!(info) as u64;
        // SAFETY: reading our own process's memory via `mach_vm_read`.
        let task = unsafe { mach::mach_task_self() };

        let load_addr = LinkerLocator::dyld_header_address(task, addr, true).unwrap();
        assert_eq!(load_addr, 0x1234_5678);
    }
}
