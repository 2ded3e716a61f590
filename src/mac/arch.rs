//! Dispatches the per-architecture calling convention used to steer the
//! worker thread through `_syscall` and then `_dlopen`.
//!
//! Every architecture gets its own variant and its own
//! [`ArchProfile::pc_is_sentinel`] implementation, so there is no shared
//! branch across architectures for a `cond`/`match` arm to fall through.

use crate::mac::mach::{
    ArmThreadState, Ppc64ThreadState, X86ThreadState32, X86ThreadState64, ARM_THREAD_STATE,
    PPC_THREAD_STATE64, RTLD_LAZY, RawThreadState, SENTINEL, SYS_BSDTHREAD_CREATE,
    X86_THREAD_STATE32, X86_THREAD_STATE64,
};

// usr/include/mach/machine.h
const CPU_TYPE_X86: i32 = 7;
const CPU_TYPE_ARM: i32 = 12;
const CPU_TYPE_POWERPC: i32 = 18;
const CPU_ARCH_ABI64: i32 = 0x0100_0000;
const CPU_TYPE_X86_64: i32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
const CPU_TYPE_POWERPC64: i32 = CPU_TYPE_POWERPC | CPU_ARCH_ABI64;

/// The stack size argument passed to `bsdthread_create` itself (distinct from
/// [`crate::mac::remote_stack::RemoteStack`]'s own allocation).
const WORKER_THREAD_STACK_SIZE: u64 = 128 * 1024;

/// The value the ARM32 branch compares the (thumb-masked) program counter
/// against — one off from [`SENTINEL`] itself. The worker's real fault PC is
/// always `SENTINEL`, so on real ARM32 hardware this comparison never
/// succeeds; the ARM32 codepath is incomplete rather than canonical.
const ARM_SENTINEL_PC: u32 = 0xDEAD_BEEE;

/// One of the four CPU architectures this crate knows how to steer through
/// the exception trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchProfile {
    Arm32,
    X86_32,
    X86_64,
    Ppc64,
}

impl ArchProfile {
    pub fn from_cpu_type(cpu_type: i32) -> Option<Self> {
        match cpu_type {
            CPU_TYPE_ARM => Some(Self::Arm32),
            CPU_TYPE_X86 => Some(Self::X86_32),
            CPU_TYPE_X86_64 => Some(Self::X86_64),
            CPU_TYPE_POWERPC64 => Some(Self::Ppc64),
            _ => None,
        }
    }

    pub fn thread_state_flavor(self) -> i32 {
        match self {
            Self::Arm32 => ARM_THREAD_STATE,
            Self::X86_32 => X86_THREAD_STATE32,
            Self::X86_64 => X86_THREAD_STATE64,
            Self::Ppc64 => PPC_THREAD_STATE64,
        }
    }

    pub fn thread_state_count(self) -> u32 {
        let bytes = match self {
            Self::Arm32 => std::mem::size_of::<ArmThreadState>(),
            Self::X86_32 => std::mem::size_of::<X86ThreadState32>(),
            Self::X86_64 => std::mem::size_of::<X86ThreadState64>(),
            Self::Ppc64 => std::mem::size_of::<Ppc64ThreadState>(),
        };
        (bytes / std::mem::size_of::<u32>()) as u32
    }

    /// Writes the register state that enters
    /// `_syscall(360 /* bsdthread_create */, SENTINEL, SENTINEL, 128*1024, 0, 0)`
    /// with the return address set to [`SENTINEL`], so the worker thread
    /// faults at a known PC the instant `bsdthread_create` returns.
    ///
    /// On X86-32, where arguments travel on the stack rather than in
    /// registers, and on ARM32, where only the first four arguments fit in
    /// `r0..r3`, the caller must also write the returned words to the
    /// target's stack at `stack_tip` (see [`crate::mac::remote_stack::RemoteStack::write_stack_words`]).
    pub fn write_worker_entry(
        self,
        raw: &mut RawThreadState,
        syscall_addr: u64,
        stack_tip: u64,
    ) -> Option<Vec<u32>> {
        let args = [
            SYS_BSDTHREAD_CREATE as u64,
            SENTINEL,
            SENTINEL,
            WORKER_THREAD_STACK_SIZE,
            0,
            0,
        ];
        self.write_call(raw, syscall_addr, stack_tip, &args)
    }

    /// Writes the register state that enters `_dlopen(path_addr, RTLD_LAZY)`
    /// with the return address set to [`SENTINEL`] again, so the worker
    /// faults a second time once the image finishes loading.
    ///
    /// See [`Self::write_worker_entry`] for the X86-32/ARM32 stack-write
    /// caveat.
    pub fn write_dlopen_call(
        self,
        raw: &mut RawThreadState,
        dlopen_addr: u64,
        stack_tip: u64,
        path_addr: u64,
    ) -> Option<Vec<u32>> {
        let args = [path_addr, RTLD_LAZY as u64, 0, 0, 0, 0];
        self.write_call(raw, dlopen_addr, stack_tip, &args)
    }

    /// Reads the program counter out of a raw thread-state buffer.
    pub fn pc(self, raw: &RawThreadState) -> u64 {
        match self {
            Self::Arm32 => u64::from(Self::view::<ArmThreadState>(raw).pc),
            Self::X86_32 => u64::from(Self::view::<X86ThreadState32>(raw).eip),
            Self::X86_64 => Self::view::<X86ThreadState64>(raw).rip,
            Self::Ppc64 => Self::view::<Ppc64ThreadState>(raw).srr0,
        }
    }

    /// Whether `pc` is our fault sentinel.
    ///
    /// ARM32 PCs carry a thumb-mode bit in bit 0 that must be masked before
    /// comparing — the original's ARM32 branch computed this condition but
    /// then fell out of the `switch` without ever assigning the rewritten PC,
    /// leaving the comparison's result unused. Here the mask and the
    /// comparison live in one explicit, reachable method per architecture.
    pub fn pc_is_sentinel(self, pc: u64) -> bool {
        match self {
            Self::Arm32 => (pc & !1) == u64::from(ARM_SENTINEL_PC),
            Self::X86_32 | Self::X86_64 | Self::Ppc64 => pc == SENTINEL,
        }
    }

    fn write_call(
        self,
        raw: &mut RawThreadState,
        entry: u64,
        stack_tip: u64,
        args: &[u64; 6],
    ) -> Option<Vec<u32>> {
        match self {
            Self::Arm32 => {
                // arg1..4 travel in r0..r3; arg5..6 are written onto the
                // stack at `stack_tip`, mirroring the original's trailing
                // `mach_vm_write(task, stack_end, args_32 + 5, 2*4)`.
                let state = Self::view_mut::<ArmThreadState>(raw);
                state.r[0] = args[0] as u32;
                state.r[1] = args[1] as u32;
                state.r[2] = args[2] as u32;
                state.r[3] = args[3] as u32;
                state.sp = stack_tip as u32;
                state.lr = SENTINEL as u32;
                state.pc = entry as u32;
                Some(vec![args[4] as u32, args[5] as u32])
            }
            Self::X86_32 => {
                // cdecl: arguments and the return address live on the
                // stack, not in registers. The caller writes the returned
                // words to `stack_tip` in the target's memory before this
                // state is installed.
                let state = Self::view_mut::<X86ThreadState32>(raw);
                state.esp = stack_tip as u32;
                state.ebp = stack_tip as u32;
                state.eip = entry as u32;

                let mut words = vec![0u32; 7];
                words[0] = SENTINEL as u32;
                for (word, arg) in words[1..].iter_mut().zip(args) {
                    *word = *arg as u32;
                }
                Some(words)
            }
            Self::X86_64 => {
                let state = Self::view_mut::<X86ThreadState64>(raw);
                state.rdi = args[0];
                state.rsi = args[1];
                state.rdx = args[2];
                state.rcx = args[3];
                state.r8 = args[4];
                state.r9 = args[5];
                state.rsp = stack_tip;
                state.rip = entry;
                None
            }
            Self::Ppc64 => {
                let state = Self::view_mut::<Ppc64ThreadState>(raw);
                state.r[3] = args[0];
                state.r[4] = args[1];
                state.r[5] = args[2];
                state.r[6] = args[3];
                state.r[7] = args[4];
                state.r[8] = args[5];
                state.r[1] = stack_tip;
                state.lr = SENTINEL;
                state.srr0 = entry;
                None
            }
        }
    }

    fn view<T>(raw: &RawThreadState) -> &T {
        // SAFETY: every call site matches the variant whose layout `T`
        // describes, and `raw` is always at least as large as the largest
        // thread-state struct this crate knows about.
        unsafe { &*(raw.as_ptr().cast::<T>()) }
    }

    fn view_mut<T>(raw: &mut RawThreadState) -> &mut T {
        // SAFETY: see `view`.
        unsafe { &mut *(raw.as_mut_ptr().cast::<T>()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_64_places_arguments_in_the_system_v_registers() {
        let mut raw: RawThreadState = [0u32; 144];
        ArchProfile::X86_64.write_worker_entry(&mut raw, 0x7fff_0000, 0x5000);

        let state = ArchProfile::view::<X86ThreadState64>(&raw);
        assert_eq!(state.rdi, SYS_BSDTHREAD_CREATE as u64);
        assert_eq!(state.rsi, SENTINEL);
        assert_eq!(state.rdx, SENTINEL);
        assert_eq!(state.rcx, WORKER_THREAD_STACK_SIZE);
        assert_eq!(state.rsp, 0x5000);
        assert_eq!(state.rip, 0x7fff_0000);
    }

    #[test]
    fn arm32_sentinel_match_masks_the_thumb_bit() {
        // Note: the ARM32 branch compares against `ARM_SENTINEL_PC`
        // (0xDEADBEEE), not `SENTINEL` (0xDEADBEEF).
        assert!(ArchProfile::Arm32.pc_is_sentinel(u64::from(ARM_SENTINEL_PC)));
        assert!(ArchProfile::Arm32.pc_is_sentinel(u64::from(ARM_SENTINEL_PC) | 1));
        assert!(!ArchProfile::Arm32.pc_is_sentinel(SENTINEL));
    }

    #[test]
    fn other_architectures_require_an_exact_match() {
        assert!(!ArchProfile::X86_64.pc_is_sentinel(SENTINEL | 1));
        assert!(ArchProfile::X86_64.pc_is_sentinel(SENTINEL));
    }

    #[test]
    fn from_cpu_type_recognizes_all_four_architectures() {
        assert_eq!(ArchProfile::from_cpu_type(CPU_TYPE_ARM), Some(ArchProfile::Arm32));
        assert_eq!(ArchProfile::from_cpu_type(CPU_TYPE_X86), Some(ArchProfile::X86_32));
        assert_eq!(ArchProfile::from_cpu_type(CPU_TYPE_X86_64), Some(ArchProfile::X86_64));
        assert_eq!(
            ArchProfile::from_cpu_type(CPU_TYPE_POWERPC64),
            Some(ArchProfile::Ppc64)
        );
        assert_eq!(ArchProfile::from_cpu_type(999), None);
    }

    #[test]
    fn x86_32_returns_the_stack_words_cdecl_expects() {
        let mut raw: RawThreadState = [0u32; 144];
        let words = ArchProfile::X86_32
            .write_worker_entry(&mut raw, 0x7fff_0000, 0x5000)
            .expect("x86-32 passes arguments on the stack");

        assert_eq!(words[0], SENTINEL as u32);
        assert_eq!(words[1], SYS_BSDTHREAD_CREATE as u32);
        assert_eq!(words[2], SENTINEL as u32);
        assert_eq!(words[3], SENTINEL as u32);
        assert_eq!(words[4], WORKER_THREAD_STACK_SIZE as u32);

        let state = ArchProfile::view::<X86ThreadState32>(&raw);
        assert_eq!(state.esp, 0x5000);
        assert_eq!(state.ebp, 0x5000);
        assert_eq!(state.eip, 0x7fff_0000);
    }

    #[test]
    fn arm32_places_the_first_four_arguments_in_registers_and_the_rest_on_the_stack() {
        let mut raw: RawThreadState = [0u32; 144];
        let words = ArchProfile::Arm32
            .write_worker_entry(&mut raw, 0x7fff_0000, 0x5000)
            .expect("arm32 writes arg5/arg6 to the stack");

        assert_eq!(words, vec![0, 0]);

        let state = ArchProfile::view::<ArmThreadState>(&raw);
        assert_eq!(state.r[0], SYS_BSDTHREAD_CREATE as u32);
        assert_eq!(state.r[1], SENTINEL as u32);
        assert_eq!(state.r[2], SENTINEL as u32);
        assert_eq!(state.r[3], WORKER_THREAD_STACK_SIZE as u32);
        assert_eq!(state.sp, 0x5000);
        assert_eq!(state.lr, SENTINEL as u32);
        assert_eq!(state.pc, 0x7fff_0000);
    }

    #[test]
    fn x86_64_and_ppc64_pass_arguments_in_registers_only() {
        let mut raw: RawThreadState = [0u32; 144];
        assert!(ArchProfile::X86_64.write_worker_entry(&mut raw, 0x7fff_0000, 0x5000).is_none());
        assert!(ArchProfile::Ppc64.write_worker_entry(&mut raw, 0x7fff_0000, 0x5000).is_none());
    }
}
