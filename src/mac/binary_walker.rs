//! Walks a Mach-O image's load commands, recording the segment mappings and
//! symbol-table location needed to resolve symbols remotely.

use crate::mac::errors::InjectError;
use crate::mac::mach::{
    LoadCommand, LoadCommands, Segment, Symtab, MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64,
};

/// A well-formed dyld image never has anywhere near a million symbols or a
/// megabyte-scale string table, so anything past this is treated as a
/// corrupt read rather than trusted.
const MAX_SANE_COUNT: u32 = 1_000_000;

pub struct Walked {
    pub segments: Vec<Segment>,
    pub symtab: Option<Symtab>,
    pub wide: bool,
}

pub struct BinaryWalker;

impl BinaryWalker {
    /// Determines endianness and pointer width from a 4-byte Mach-O magic
    /// number.
    pub fn magic_layout(magic: u32) -> Result<(bool, bool), InjectError> {
        match magic {
            MH_MAGIC_64 => Ok((false, true)),
            MH_CIGAM_64 => Ok((true, true)),
            MH_MAGIC => Ok((false, false)),
            MH_CIGAM => Ok((true, false)),
            _ => Err(InjectError::InvalidArgument(
                "target image does not start with a recognized Mach-O magic number",
            )),
        }
    }

    /// Walks every load command in `buffer`, recording segments and the
    /// symbol table location. Rejects the buffer outright if the cumulative
    /// `cmd_size` ever runs past its bounds (handled by
    /// [`crate::mac::mach::LoadCommandsIter`]) or if the symtab declares an
    /// implausible symbol/string-table size.
    pub fn walk(buffer: Vec<u8>, count: u32, swap: bool, wide: bool) -> Result<Walked, InjectError> {
        let commands = LoadCommands {
            buffer,
            count,
            swap,
            wide,
        };
        let mut iter = commands.iter();

        let mut segments = Vec::new();
        let mut symtab = None;

        for cmd in &mut iter {
            match cmd {
                LoadCommand::Segment(seg) => segments.push(seg),
                LoadCommand::Symtab(st) => {
                    if st.num_syms >= MAX_SANE_COUNT
                        || failspot::failspot!(crate::FailSpotName::OversizedSymbolCount)
                    {
                        return Err(InjectError::InvalidArgument(
                            "symbol table entry count is implausibly large",
                        ));
                    }
                    if st.str_size >= MAX_SANE_COUNT
                        || failspot::failspot!(crate::FailSpotName::OversizedStringTableSize)
                    {
                        return Err(InjectError::InvalidArgument(
                            "string table size is implausibly large",
                        ));
                    }
                    symtab = Some(st);
                }
            }
        }

        if let Some(msg) = iter.fault {
            return Err(InjectError::InvalidArgument(msg));
        }

        Ok(Walked {
            segments,
            symtab,
            wide,
        })
    }

    /// Maps a file offset onto a virtual address using whichever segment
    /// encloses it, the same resolution `find_symtab_addrs` in the original
    /// performs before reading the symbol/string tables remotely.
    pub fn file_offset_to_vmaddr(segments: &[Segment], file_off: u64) -> Result<u64, InjectError> {
        segments
            .iter()
            .find(|seg| file_off >= seg.file_off && file_off < seg.file_off + seg.file_size)
            .map(|seg| seg.vm_addr + (file_off - seg.file_off))
            .ok_or(InjectError::InvalidArgument(
                "file offset is not covered by any loaded segment",
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_segment32(buf: &mut Vec<u8>, vm_addr: u32, vm_size: u32, file_off: u32, file_size: u32) {
        buf.extend_from_slice(&1u32.to_ne_bytes()); // LC_SEGMENT
        buf.extend_from_slice(&56u32.to_ne_bytes()); // sizeof(segment_command)
        buf.extend_from_slice(&[0u8; 16]); // segment_name
        buf.extend_from_slice(&vm_addr.to_ne_bytes());
        buf.extend_from_slice(&vm_size.to_ne_bytes());
        buf.extend_from_slice(&file_off.to_ne_bytes());
        buf.extend_from_slice(&file_size.to_ne_bytes());
        buf.extend_from_slice(&0i32.to_ne_bytes()); // max_prot
        buf.extend_from_slice(&0i32.to_ne_bytes()); // init_prot
        buf.extend_from_slice(&0u32.to_ne_bytes()); // num_sections
        buf.extend_from_slice(&0u32.to_ne_bytes()); // flags
    }

    fn push_segment64(buf: &mut Vec<u8>, vm_addr: u64, vm_size: u64, file_off: u64, file_size: u64) {
        buf.extend_from_slice(&0x19u32.to_ne_bytes()); // LC_SEGMENT_64
        buf.extend_from_slice(&72u32.to_ne_bytes()); // sizeof(segment_command_64)
        buf.extend_from_slice(&[0u8; 16]); // segment_name
        buf.extend_from_slice(&vm_addr.to_ne_bytes());
        buf.extend_from_slice(&vm_size.to_ne_bytes());
        buf.extend_from_slice(&file_off.to_ne_bytes());
        buf.extend_from_slice(&file_size.to_ne_bytes());
        buf.extend_from_slice(&0i32.to_ne_bytes()); // max_prot
        buf.extend_from_slice(&0i32.to_ne_bytes()); // init_prot
        buf.extend_from_slice(&0u32.to_ne_bytes()); // num_sections
        buf.extend_from_slice(&0u32.to_ne_bytes()); // flags
    }

    /// Big-endian mirror of `push_segment32`, for exercising the swapped path.
    fn push_segment32_swapped(buf: &mut Vec<u8>, vm_addr: u32, vm_size: u32, file_off: u32, file_size: u32) {
        buf.extend_from_slice(&1u32.to_be_bytes()); // LC_SEGMENT
        buf.extend_from_slice(&56u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);
        buf.extend_from_slice(&vm_addr.to_be_bytes());
        buf.extend_from_slice(&vm_size.to_be_bytes());
        buf.extend_from_slice(&file_off.to_be_bytes());
        buf.extend_from_slice(&file_size.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&0i32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
    }

    #[test]
    fn walks_a_single_32_bit_segment() {
        let mut buf = Vec::new();
        push_segment32(&mut buf, 0x1000, 0x2000, 0, 0x2000);

        let walked = BinaryWalker::walk(buf, 1, false, false).expect("walk");
        assert_eq!(walked.segments.len(), 1);
        assert_eq!(walked.segments[0].vm_addr, 0x1000);
        assert!(walked.symtab.is_none());
    }

    #[test]
    fn walks_a_single_64_bit_segment() {
        let mut buf = Vec::new();
        push_segment64(&mut buf, 0x1_0000_0000, 0x2000, 0, 0x2000);

        let walked = BinaryWalker::walk(buf, 1, false, true).expect("walk");
        assert_eq!(walked.segments.len(), 1);
        assert_eq!(walked.segments[0].vm_addr, 0x1_0000_0000);
    }

    #[test]
    fn honors_the_byte_swap_flag() {
        let mut buf = Vec::new();
        push_segment32_swapped(&mut buf, 0x1000, 0x2000, 0, 0x2000);

        let walked = BinaryWalker::walk(buf, 1, true, false).expect("walk");
        assert_eq!(walked.segments.len(), 1);
        assert_eq!(walked.segments[0].vm_addr, 0x1000);
    }

    #[test]
    fn rejects_a_command_count_that_overruns_the_buffer() {
        // Declares two commands but only supplies bytes for one: the
        // cumulative size the header promised doesn't match what's actually
        // there, mirroring the original's `accumulated_sizeofcmds >
        // sizeofcmds` rejection.
        let mut buf = Vec::new();
        push_segment32(&mut buf, 0x1000, 0x2000, 0, 0x2000);

        let err = BinaryWalker::walk(buf, 2, false, false).unwrap_err();
        assert!(matches!(err, InjectError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_oversized_symtab_counts() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u32.to_ne_bytes()); // LC_SYMTAB
        buf.extend_from_slice(&24u32.to_ne_bytes()); // cmd_size
        buf.extend_from_slice(&0u32.to_ne_bytes()); // sym_off
        buf.extend_from_slice(&(MAX_SANE_COUNT + 1).to_ne_bytes()); // num_syms
        buf.extend_from_slice(&0u32.to_ne_bytes()); // str_off
        buf.extend_from_slice(&0u32.to_ne_bytes()); // str_size

        let err = BinaryWalker::walk(buf, 1, false, false).unwrap_err();
        assert!(matches!(err, InjectError::InvalidArgument(_)));
    }

    #[test]
    fn file_offset_resolves_through_enclosing_segment() {
        let segments = vec![Segment {
            vm_addr: 0x1000,
            vm_size: 0x2000,
            file_off: 0,
            file_size: 0x2000,
        }];

        assert_eq!(
            BinaryWalker::file_offset_to_vmaddr(&segments, 0x100).unwrap(),
            0x1100
        );
        assert!(BinaryWalker::file_offset_to_vmaddr(&segments, 0x3000).is_err());
    }
}
