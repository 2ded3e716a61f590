//! Scans a symbol table for the two entry points the injection engine needs
//! out of the dynamic linker: `_dlopen` and `_syscall`.
//!
//! Rather than a generic string-prefix scan, dispatches on the symbol's
//! second byte (`'d'` or `'s'`, after the leading `_`) before doing the full
//! comparison.

use crate::mac::errors::InjectError;
use crate::mac::mach::{Nlist32, Nlist64};

/// Addresses of the two dynamic-linker entry points the trampoline calls
/// into: `_dlopen` to load the target image, `_syscall` to spawn the worker
/// thread via `bsdthread_create`.
#[derive(Debug, Clone, Copy)]
pub struct AddressBundle {
    pub dlopen: u64,
    pub syscall: u64,
}

pub struct SymbolFinder;

impl SymbolFinder {
    /// `sym_table`/`str_table` are the raw bytes read out of the target
    /// process. `num_syms` and `wide` come from the `Symtab` load command
    /// and the image's pointer width, respectively.
    pub fn find(
        sym_table: &[u8],
        str_table: &[u8],
        num_syms: u32,
        swap: bool,
        wide: bool,
    ) -> Result<AddressBundle, InjectError> {
        let mut dlopen = None;
        let mut syscall = None;

        let entry_size = if wide {
            std::mem::size_of::<Nlist64>()
        } else {
            std::mem::size_of::<Nlist32>()
        };

        for i in 0..num_syms as usize {
            let start = i * entry_size;
            let Some(entry) = sym_table.get(start..start + entry_size) else {
                break;
            };

            let (n_strx, n_value) = if wide {
                // SAFETY: `entry` is exactly `size_of::<Nlist64>()` bytes.
                let nlist = unsafe { &*(entry.as_ptr().cast::<Nlist64>()) };
                (nlist.n_strx, nlist.n_value)
            } else {
                // SAFETY: `entry` is exactly `size_of::<Nlist32>()` bytes.
                let nlist = unsafe { &*(entry.as_ptr().cast::<Nlist32>()) };
                (nlist.n_strx, u64::from(nlist.n_value))
            };

            let n_strx = if swap { n_strx.swap_bytes() } else { n_strx } as usize;
            let n_value = if swap { n_value.swap_bytes() } else { n_value };

            // An out-of-bounds string index means the symbol table is
            // malformed, not that this one entry should be skipped — fail
            // the whole pass, mirroring `handle_sym`'s own fatal bounds
            // check in the original.
            if n_strx >= str_table.len() {
                return Err(InjectError::InvalidArgument(
                    "symbol table entry's string index is past the end of the string table",
                ));
            }

            let name = read_cstr(str_table, n_strx);
            if name.len() < 2 || name[0] != b'_' {
                continue;
            }

            match name[1] {
                b'd' if name == b"_dlopen" => dlopen = Some(n_value),
                b's' if name == b"_syscall" => syscall = Some(n_value),
                _ => {}
            }

            if dlopen.is_some() && syscall.is_some() {
                break;
            }
        }

        match (dlopen, syscall) {
            (Some(dlopen), Some(syscall)) => Ok(AddressBundle { dlopen, syscall }),
            _ => Err(InjectError::InvalidAddress(
                "could not locate both _dlopen and _syscall in the dynamic linker",
            )),
        }
    }
}

/// Reads the string starting at `offset` (already validated to be within
/// `table`), bounded by the remaining length of `table` when no NUL
/// terminator is found — this defends against unterminated entries without
/// ever reading past the string table itself.
fn read_cstr(table: &[u8], offset: usize) -> &[u8] {
    let bytes = &table[offset..];
    match bytes.iter().position(|&b| b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nlist32(n_strx: u32, n_value: u32) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&n_strx.to_ne_bytes());
        out[4] = 0; // n_type
        out[5] = 0; // n_sect
        out[6..8].copy_from_slice(&0i16.to_ne_bytes());
        out[8..12].copy_from_slice(&n_value.to_ne_bytes());
        out
    }

    #[test]
    fn finds_both_symbols() {
        let str_table = b"\0_dlopen\0_syscall\0";
        let mut sym_table = Vec::new();
        sym_table.extend_from_slice(&nlist32(1, 0x1000)); // "_dlopen"
        sym_table.extend_from_slice(&nlist32(9, 0x2000)); // "_syscall"

        let bundle = SymbolFinder::find(&sym_table, str_table, 2, false, false).unwrap();
        assert_eq!(bundle.dlopen, 0x1000);
        assert_eq!(bundle.syscall, 0x2000);
    }

    #[test]
    fn fails_when_syscall_is_missing() {
        let str_table = b"\0_dlopen\0";
        let mut sym_table = Vec::new();
        sym_table.extend_from_slice(&nlist32(1, 0x1000));

        let err = SymbolFinder::find(&sym_table, str_table, 1, false, false).unwrap_err();
        assert!(matches!(err, InjectError::InvalidAddress(_)));
    }

    #[test]
    fn fails_the_whole_pass_when_a_string_index_is_past_the_table_bound() {
        let str_table = b"\0_dlopen\0";
        let mut sym_table = Vec::new();
        sym_table.extend_from_slice(&nlist32(1000, 0x1000));
        sym_table.extend_from_slice(&nlist32(1, 0x2000)); // "_dlopen", never reached

        let err = SymbolFinder::find(&sym_table, str_table, 2, false, false).unwrap_err();
        assert!(matches!(err, InjectError::InvalidArgument(_)));
    }
}
