//! Contains various helpers to improve and expand on the bindings provided
//! by `mach2`, plus the raw Mach-O/thread-state structures needed to walk a
//! foreign process's dynamic linker and drive it through an exception
//! trampoline.

// Just exports all of the mach functions we use into a flat list
pub use mach2::{
    exception_types::{EXCEPTION_STATE_IDENTITY, EXC_MASK_BAD_ACCESS},
    kern_return::{kern_return_t, KERN_SUCCESS},
    mach_port::{mach_port_allocate, mach_port_deallocate, mach_port_insert_right},
    message::{
        mach_msg, mach_msg_header_t, mach_msg_type_number_t, MACH_MSGH_BITS_COMPLEX,
        MACH_MSG_TIMEOUT_NONE, MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_MSG, MACH_SEND_MSG,
    },
    port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE},
    task::{task_info, task_set_exception_ports, task_swap_exception_ports, thread_create},
    thread_act::{thread_resume, thread_set_state, thread_terminate},
    traps::{mach_task_self, task_for_pid},
    vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_read, mach_vm_write},
    vm_statistics::VM_FLAGS_ANYWHERE,
    vm_types::vm_offset_t,
};

/// A Mach kernel error.
///
/// See <usr/include/mach/kern_return.h>.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("specified address is not currently valid")]
    InvalidAddress = 1,
    #[error("specified memory is valid, but does not permit the required forms of access")]
    ProtectionFailure = 2,
    #[error("the address range specified is already in use, or no address range of the size specified could be found")]
    NoSpace = 3,
    #[error("the function requested was not applicable to this type of argument, or an argument is invalid")]
    InvalidArgument = 4,
    #[error("the function could not be performed")]
    Failure = 5,
    #[error("system resource could not be allocated to fulfill this request")]
    ResourceShortage = 6,
    #[error("the task in question does not hold receive rights for the port argument")]
    NotReceiver = 7,
    #[error("bogus access restriction")]
    NoAccess = 8,
    #[error(
        "during a page fault, the target address refers to a memory object that has been destroyed"
    )]
    MemoryFailure = 9,
    #[error(
        "during a page fault, the memory object indicated that the data could not be returned"
    )]
    MemoryError = 10,
    #[error("the receive right is already a member of the portset")]
    AlreadyInSet = 11,
    #[error("the receive right is not a member of a port set")]
    NotInSet = 12,
    #[error("the name already denotes a right in the task")]
    NameExists = 13,
    #[error("the operation was aborted")]
    Aborted = 14,
    #[error("the name doesn't denote a right in the task")]
    InvalidName = 15,
    #[error("target task isn't an active task")]
    InvalidTask = 16,
    #[error("the name denotes a right, but not an appropriate right")]
    InvalidRight = 17,
    #[error("a blatant range error")]
    InvalidValue = 18,
    #[error("operation would overflow limit on user-references")]
    UserRefsOverflow = 19,
    #[error("the supplied port capability is improper")]
    InvalidCapability = 20,
    #[error("the task already has send or receive rights for the port under another name")]
    RightExists = 21,
    #[error("target host isn't actually a host")]
    InvalidHost = 22,
    #[error("an attempt was made to supply 'precious' data for memory that is already present in a memory object")]
    MemoryPresent = 23,
    // These 2 are errors which should only ever be seen by the kernel itself
    //MemoryDataMoved = 24,
    //MemoryRestartCopy = 25,
    #[error("an argument applied to assert processor set privilege was not a processor set control port")]
    InvalidProcessorSet = 26,
    #[error("the specified scheduling attributes exceed the thread's limits")]
    PolicyLimit = 27,
    #[error("the specified scheduling policy is not currently enabled for the processor set")]
    InvalidPolicy = 28,
    #[error("the external memory manager failed to initialize the memory object")]
    InvalidObject = 29,
    #[error(
        "a thread is attempting to wait for an event for which there is already a waiting thread"
    )]
    AlreadyWaiting = 30,
    #[error("an attempt was made to destroy the default processor set")]
    DefaultSet = 31,
    #[error("an attempt was made to fetch an exception port that is protected, or to abort a thread while processing a protected exception")]
    ExceptionProtected = 32,
    #[error("a ledger was required but not supplied")]
    InvalidLedger = 33,
    #[error("the port was not a memory cache control port")]
    InvalidMemoryControl = 34,
    #[error("an argument supplied to assert security privilege was not a host security port")]
    InvalidSecurity = 35,
    #[error("thread_depress_abort was called on a thread which was not currently depressed")]
    NotDepressed = 36,
    #[error("object has been terminated and is no longer available")]
    Terminated = 37,
    #[error("lock set has been destroyed and is no longer available")]
    LockSetDestroyed = 38,
    #[error("the thread holding the lock terminated before releasing the lock")]
    LockUnstable = 39,
    #[error("the lock is already owned by another thread")]
    LockOwned = 40,
    #[error("the lock is already owned by the calling thread")]
    LockOwnedSelf = 41,
    #[error("semaphore has been destroyed and is no longer available")]
    SemaphoreDestroyed = 42,
    #[error("return from RPC indicating the target server was terminated before it successfully replied")]
    RpcServerTerminated = 43,
    #[error("terminate an orphaned activation")]
    RpcTerminateOrphan = 44,
    #[error("allow an orphaned activation to continue executing")]
    RpcContinueOrphan = 45,
    #[error("empty thread activation (No thread linked to it)")]
    NotSupported = 46,
    #[error("remote node down or inaccessible")]
    NodeDown = 47,
    #[error("a signalled thread was not actually waiting")]
    NotWaiting = 48,
    #[error("some thread-oriented operation (semaphore_wait) timed out")]
    OperationTimedOut = 49,
    #[error("during a page fault, indicates that the page was rejected as a result of a signature check")]
    CodesignError = 50,
    #[error("the requested property cannot be changed at this time")]
    PolicyStatic = 51,
    #[error("the provided buffer is of insufficient size for the requested data")]
    InsufficientBufferSize = 52,
    #[error("denied by security policy")]
    Denied = 53,
    #[error("the KC on which the function is operating is missing")]
    MissingKC = 54,
    #[error("the KC on which the function is operating is invalid")]
    InvalidKC = 55,
    #[error("a search or query operation did not return a result")]
    NotFound = 56,
}

impl From<mach2::kern_return::kern_return_t> for KernelError {
    fn from(kr: mach2::kern_return::kern_return_t) -> Self {
        use mach2::kern_return::*;

        match kr {
            KERN_INVALID_ADDRESS => Self::InvalidAddress,
            KERN_PROTECTION_FAILURE => Self::ProtectionFailure,
            KERN_NO_SPACE => Self::NoSpace,
            KERN_INVALID_ARGUMENT => Self::InvalidArgument,
            KERN_FAILURE => Self::Failure,
            KERN_RESOURCE_SHORTAGE => Self::ResourceShortage,
            KERN_NOT_RECEIVER => Self::NotReceiver,
            KERN_NO_ACCESS => Self::NoAccess,
            KERN_MEMORY_FAILURE => Self::MemoryFailure,
            KERN_MEMORY_ERROR => Self::MemoryError,
            KERN_ALREADY_IN_SET => Self::AlreadyInSet,
            KERN_NAME_EXISTS => Self::NameExists,
            KERN_INVALID_NAME => Self::InvalidName,
            KERN_INVALID_TASK => Self::InvalidTask,
            KERN_INVALID_RIGHT => Self::InvalidRight,
            KERN_INVALID_VALUE => Self::InvalidValue,
            KERN_UREFS_OVERFLOW => Self::UserRefsOverflow,
            KERN_INVALID_CAPABILITY => Self::InvalidCapability,
            KERN_RIGHT_EXISTS => Self::RightExists,
            KERN_INVALID_HOST => Self::InvalidHost,
            KERN_MEMORY_PRESENT => Self::MemoryPresent,
            KERN_INVALID_PROCESSOR_SET => Self::InvalidProcessorSet,
            KERN_POLICY_LIMIT => Self::PolicyLimit,
            KERN_INVALID_POLICY => Self::InvalidPolicy,
            KERN_INVALID_OBJECT => Self::InvalidObject,
            KERN_ALREADY_WAITING => Self::AlreadyWaiting,
            KERN_DEFAULT_SET => Self::DefaultSet,
            KERN_EXCEPTION_PROTECTED => Self::ExceptionProtected,
            KERN_INVALID_LEDGER => Self::InvalidLedger,
            KERN_INVALID_MEMORY_CONTROL => Self::InvalidMemoryControl,
            KERN_INVALID_SECURITY => Self::InvalidSecurity,
            KERN_NOT_DEPRESSED => Self::NotDepressed,
            KERN_TERMINATED => Self::Terminated,
            KERN_LOCK_SET_DESTROYED => Self::LockSetDestroyed,
            KERN_LOCK_UNSTABLE => Self::LockUnstable,
            KERN_LOCK_OWNED => Self::LockOwned,
            KERN_LOCK_OWNED_SELF => Self::LockOwnedSelf,
            KERN_SEMAPHORE_DESTROYED => Self::SemaphoreDestroyed,
            KERN_RPC_SERVER_TERMINATED => Self::RpcServerTerminated,
            KERN_RPC_TERMINATE_ORPHAN => Self::RpcTerminateOrphan,
            KERN_RPC_CONTINUE_ORPHAN => Self::RpcContinueOrphan,
            KERN_NOT_SUPPORTED => Self::NotSupported,
            KERN_NODE_DOWN => Self::NodeDown,
            KERN_NOT_WAITING => Self::NotWaiting,
            KERN_OPERATION_TIMED_OUT => Self::OperationTimedOut,
            KERN_CODESIGN_ERROR => Self::CodesignError,
            KERN_POLICY_STATIC => Self::PolicyStatic,
            52 => Self::InsufficientBufferSize,
            53 => Self::Denied,
            54 => Self::MissingKC,
            55 => Self::InvalidKC,
            56 => Self::NotFound,
            // This should never happen given a result from a mach call, but
            // in that case we just use `Failure` as the mach header itself
            // describes it as a catch all
            _ => Self::Failure,
        }
    }
}

/// Wraps a call that returns a raw `kern_return_t` into a `Result`, logging
/// the syscall name on failure.
#[inline]
pub fn kern_ret(syscall: &'static str, kr: kern_return_t) -> Result<(), KernelError> {
    if kr == KERN_SUCCESS {
        Ok(())
    } else {
        let err = KernelError::from(kr);
        log::trace!("{syscall} returned {err}");
        Err(err)
    }
}

/// Minimal trait that just pairs a structure that can be filled out by
/// [`mach2::task::task_info`] with the "flavor" that tells it the info we
/// actually want to retrieve
pub trait TaskInfo {
    /// One of the `MACH_*_TASK` integers. I assume it's very bad if you implement
    /// this trait and provide the wrong flavor for the struct
    const FLAVOR: u32;
}

// usr/include/mach-o/loader.h, magic numbers
pub const MH_MAGIC: u32 = 0xfeedface;
pub const MH_CIGAM: u32 = 0xcefaedfe;
pub const MH_MAGIC_64: u32 = 0xfeedfacf;
pub const MH_CIGAM_64: u32 = 0xcffaedfe;

// usr/include/mach-o/loader.h, load command types we care about
pub const LC_SEGMENT: u32 = 0x1;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_SEGMENT_64: u32 = 0x19;

/// usr/include/mach-o/loader.h, 32-bit mach header (ARM32, X86-32).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MachHeader32 {
    pub magic: u32,
    pub cpu_type: i32,
    pub cpu_sub_type: i32,
    pub file_type: u32,
    pub num_commands: u32,
    pub size_commands: u32,
    pub flags: u32,
}

/// usr/include/mach-o/loader.h, 64-bit mach header (X86-64, PPC-64).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cpu_type: i32,
    pub cpu_sub_type: i32,
    pub file_type: u32,
    pub num_commands: u32,
    pub size_commands: u32,
    pub flags: u32,
    __reserved: u32,
}

// usr/include/mach-o/loader.h
#[repr(C)]
pub struct LoadCommandBase {
    pub cmd: u32,      // type of load command
    pub cmd_size: u32, // total size of the command in bytes
}

/// 32-bit segment load command.
#[repr(C)]
pub struct SegmentCommand32 {
    cmd: u32,
    cmd_size: u32,
    pub segment_name: [u8; 16],
    pub vm_addr: u32,
    pub vm_size: u32,
    pub file_off: u32,
    pub file_size: u32,
    pub max_prot: i32,
    pub init_prot: i32,
    pub num_sections: u32,
    pub flags: u32,
}

/// 64-bit segment load command.
#[repr(C)]
pub struct SegmentCommand64 {
    cmd: u32,
    cmd_size: u32,
    pub segment_name: [u8; 16],
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub max_prot: i32,
    pub init_prot: i32,
    pub num_sections: u32,
    pub flags: u32,
}

/// usr/include/mach-o/loader.h, identifies where the symbol and string
/// tables live within the image.
#[repr(C)]
pub struct SymtabCommand {
    cmd: u32,
    cmd_size: u32,
    pub sym_off: u32,
    pub num_syms: u32,
    pub str_off: u32,
    pub str_size: u32,
}

/// usr/include/mach-o/nlist.h, 32-bit symbol table entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Nlist32 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: i16,
    pub n_value: u32,
}

/// usr/include/mach-o/nlist.h, 64-bit symbol table entry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Nlist64 {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: i16,
    pub n_value: u64,
}

/// A block of load commands for a particular image
pub struct LoadCommands {
    /// The block of memory containing all of the load commands
    pub buffer: Vec<u8>,
    /// The number of actual load commmands that _should_ be in the buffer
    pub count: u32,
    /// Whether the buffer's multi-byte fields need to be byte-swapped
    /// relative to the host (`MH_CIGAM`/`MH_CIGAM_64` was seen)
    pub swap: bool,
    /// Whether the image is 64-bit (`LC_SEGMENT_64` vs `LC_SEGMENT`,
    /// [`Nlist64`] vs [`Nlist32`])
    pub wide: bool,
}

impl LoadCommands {
    #[inline]
    pub fn iter(&self) -> LoadCommandsIter<'_> {
        LoadCommandsIter {
            buffer: &self.buffer,
            count: self.count,
            swap: self.swap,
            wide: self.wide,
            fault: None,
        }
    }
}

/// A segment command, normalized to 64-bit fields regardless of the image's
/// actual width.
pub struct Segment {
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_off: u64,
    pub file_size: u64,
}

/// A symtab command, normalized to 64-bit offsets.
pub struct Symtab {
    pub sym_off: u64,
    pub num_syms: u32,
    pub str_off: u64,
    pub str_size: u32,
}

pub enum LoadCommand {
    Segment(Segment),
    Symtab(Symtab),
}

pub struct LoadCommandsIter<'buf> {
    buffer: &'buf [u8],
    count: u32,
    swap: bool,
    wide: bool,
    /// Set once iteration hits a load-command area that doesn't match its
    /// own declared bounds; checked by [`crate::mac::binary_walker::BinaryWalker::walk`]
    /// once iteration stops.
    pub fault: Option<&'static str>,
}

impl LoadCommandsIter<'_> {
    #[inline]
    fn field(&self, v: u32) -> u32 {
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }

    #[inline]
    fn field64(&self, v: u64) -> u64 {
        if self.swap {
            v.swap_bytes()
        } else {
            v
        }
    }
}

impl Iterator for LoadCommandsIter<'_> {
    type Item = LoadCommand;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fault.is_some() {
            return None;
        }

        // SAFETY: we're interpreting raw bytes as C structs, we try and be safe
        unsafe {
            loop {
                if self.count == 0 {
                    return None;
                }

                if self.buffer.len() < std::mem::size_of::<LoadCommandBase>() {
                    self.fault = Some(
                        "load-command area ended before the declared command count was reached",
                    );
                    return None;
                }

                let header = &*(self.buffer.as_ptr().cast::<LoadCommandBase>());
                let cmd = self.field(header.cmd);
                let cmd_size = self.field(header.cmd_size) as usize;

                // This would mean we've been lied to by the MachHeader and either
                // the size_commands field was too small, or the num_command was
                // too large: mirrors the original's
                // `accumulated_sizeofcmds > sizeofcmds` rejection.
                if cmd_size < std::mem::size_of::<LoadCommandBase>() {
                    self.fault = Some("load command declares a size smaller than its own header");
                    return None;
                }
                if cmd_size > self.buffer.len() {
                    self.fault =
                        Some("accumulated load-command sizes exceed the header-declared total");
                    return None;
                }

                let out = match (cmd, self.wide) {
                    (LC_SEGMENT_64, true) => {
                        let seg = &*(self.buffer.as_ptr().cast::<SegmentCommand64>());
                        Some(LoadCommand::Segment(Segment {
                            vm_addr: self.field64(seg.vm_addr),
                            vm_size: self.field64(seg.vm_size),
                            file_off: self.field64(seg.file_off),
                            file_size: self.field64(seg.file_size),
                        }))
                    }
                    (LC_SEGMENT, false) => {
                        let seg = &*(self.buffer.as_ptr().cast::<SegmentCommand32>());
                        Some(LoadCommand::Segment(Segment {
                            vm_addr: self.field(seg.vm_addr) as u64,
                            vm_size: self.field(seg.vm_size) as u64,
                            file_off: self.field(seg.file_off) as u64,
                            file_size: self.field(seg.file_size) as u64,
                        }))
                    }
                    (LC_SYMTAB, _) => {
                        let st = &*(self.buffer.as_ptr().cast::<SymtabCommand>());
                        Some(LoadCommand::Symtab(Symtab {
                            sym_off: self.field(st.sym_off) as u64,
                            num_syms: self.field(st.num_syms),
                            str_off: self.field(st.str_off) as u64,
                            str_size: self.field(st.str_size),
                        }))
                    }
                    // Just ignore any other load commands
                    _ => None,
                };

                self.count -= 1;
                self.buffer = &self.buffer[cmd_size..];

                if let Some(cmd) = out {
                    return Some(cmd);
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let sz = self.count as usize;
        (sz, Some(sz))
    }
}

/// `TASK_DYLD_INFO` flavor for `task_info`, and the struct it fills.
/// usr/include/mach/task_info.h
pub const TASK_DYLD_INFO: u32 = 17;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TaskDyldInfo {
    pub all_image_info_addr: u64,
    pub all_image_info_size: u64,
    pub all_image_info_format: i32,
}

impl TaskInfo for TaskDyldInfo {
    const FLAVOR: u32 = TASK_DYLD_INFO;
}

/// The leading fields shared by `dyld_all_image_infos` and
/// `dyld_all_image_infos_64` (`usr/include/mach-o/dyld_images.h`) — only the
/// version is read before picking which width applies.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DyldAllImageInfosVersion {
    pub version: u32,
}

/// 32-bit `dyld_all_image_infos`, truncated to the leading fields this crate
/// needs — in particular `dyld_image_load_address`, the Mach-O header
/// address of the dynamic linker itself, which is where `_dlopen` and
/// `_syscall` live.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DyldAllImageInfos32 {
    pub version: u32,
    pub info_array_count: u32,
    pub info_array: u32,
    pub notification: u32,
    pub process_detached_from_shared_region: u8,
    pub lib_system_initialized: u8,
    pub pad: [u8; 2],
    pub dyld_image_load_address: u32,
}

/// 64-bit `dyld_all_image_infos`, truncated to the leading fields this crate
/// needs.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DyldAllImageInfos64 {
    pub version: u32,
    pub info_array_count: u32,
    pub info_array: u64,
    pub notification: u64,
    pub process_detached_from_shared_region: u8,
    pub lib_system_initialized: u8,
    pub pad: [u8; 6],
    pub dyld_image_load_address: u64,
}

/// `NDR_record_t`, the MIG wire-format descriptor echoed back verbatim in
/// every exception reply.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NdrRecord {
    pub mig_vers: u8,
    pub if_vers: u8,
    pub reserved1: u8,
    pub mig_encoding: u8,
    pub int_rep: u8,
    pub char_rep: u8,
    pub float_rep: u8,
    pub reserved2: u8,
}

/// `mach_msg_port_descriptor_t` (`usr/include/mach/message.h`): how a port
/// right actually travels inside a "complex" message's body, 12 bytes, not
/// the bare 4-byte `mach_port_t` a naive reading of the request layout would
/// suggest.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MachMsgPortDescriptor {
    pub name: mach_port_t,
    pad1: u32,
    pad2: u16,
    pub disposition: u8,
    pub descriptor_type: u8,
}

/// A raw thread-state buffer sized to comfortably hold any of this crate's
/// four architecture-specific register layouts, used both for
/// [`ExceptionMessage`]/[`ExceptionReply`] and for [`crate::mac::arch::ArchProfile`]'s
/// register-writing methods.
pub type RawThreadState = [u32; 144];

/// A Mach exception-state-identity request
/// (`__Request__exception_raise_state_identity_t`, see
/// `usr/include/mach/mach_exc.defs`). `old_state`/`new_state` are sized at
/// 144 natural_t words, comfortably covering the largest thread-state flavor
/// this crate reads (`x86_THREAD_STATE64`); the true length is carried
/// separately in `old_state_count`. `code` is `[integer_t; 2]`, not
/// `[i64; 2]`: this crate never passes `MACH_EXCEPTION_CODES` to
/// `task_swap_exception_ports` (see `exception_broker.rs`), so the kernel
/// writes the narrower, non-64-bit-codes flavor of this message.
#[repr(C, packed(4))]
pub struct ExceptionMessage {
    pub head: mach_msg_header_t,
    pub msgh_body: u32,
    pub thread: MachMsgPortDescriptor,
    pub task: MachMsgPortDescriptor,
    pub ndr: NdrRecord,
    pub exception: i32,
    pub code_count: mach_msg_type_number_t,
    pub code: [i32; 2],
    pub flavor: i32,
    pub old_state_count: mach_msg_type_number_t,
    pub old_state: RawThreadState,
}

/// Reply counterpart to [`ExceptionMessage`], for `exception_raise_state_identity`.
#[repr(C, packed(4))]
pub struct ExceptionReply {
    pub head: mach_msg_header_t,
    pub ndr: NdrRecord,
    pub ret_code: kern_return_t,
    pub flavor: i32,
    pub new_state_count: mach_msg_type_number_t,
    pub new_state: RawThreadState,
}

/// The sentinel return address planted for the worker thread: an address
/// the kernel will never legitimately map, so returning to it reliably
/// faults with a bad-access exception at a known PC.
pub const SENTINEL: u64 = 0xdead_beef;

/// `bsdthread_create`, the historical Darwin syscall number used to spawn a
/// lightweight worker thread in terms of `_syscall` alone.
pub const SYS_BSDTHREAD_CREATE: i64 = 360;

/// `RTLD_LAZY`, passed to `_dlopen` so binding of the new image is deferred.
pub const RTLD_LAZY: i32 = 0x1;

// 32-bit `arm_thread_state_t` (usr/include/mach/arm/thread_status.h).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ArmThreadState {
    pub r: [u32; 13],
    pub sp: u32,
    pub lr: u32,
    pub pc: u32,
    pub cpsr: u32,
}

pub const ARM_THREAD_STATE: i32 = 1;

// 32-bit `x86_thread_state32_t` (usr/include/mach/i386/thread_status.h).
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct X86ThreadState32 {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ss: u32,
    pub eflags: u32,
    pub eip: u32,
    pub cs: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
}

pub const X86_THREAD_STATE32: i32 = 1;

// 64-bit `x86_thread_state64_t` (usr/include/mach/i386/_structs.h). Defined
// locally, rather than reused from `mach2::structs`, so the field names this
// crate's register-writing code depends on are pinned regardless of how the
// upstream crate happens to expose them.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct X86ThreadState64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

pub const X86_THREAD_STATE64: i32 = 4;

// `ppc_thread_state64_t` (usr/include/mach/ppc/thread_status.h), missing
// from `mach2` since PPC support was dropped long ago.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ppc64ThreadState {
    pub srr0: u64,
    pub srr1: u64,
    pub r: [u64; 32],
    pub cr: u32,
    pub xer: u64,
    pub lr: u64,
    pub ctr: u64,
    pub vrsave: u32,
}

impl Default for Ppc64ThreadState {
    fn default() -> Self {
        // SAFETY: an all-zero bit pattern is a valid Ppc64ThreadState
        unsafe { std::mem::zeroed() }
    }
}

pub const PPC_THREAD_STATE64: i32 = 5;

/// Reads `len` bytes out of `task`'s address space at `addr`.
///
/// Mirrors the page-aligned `mach_vm_read`/`mach_vm_deallocate` pattern the
/// pack's `task_dumper.rs` uses: `mach_vm_read` hands back a freshly mapped
/// region in *our* address space that we copy out of and then release. A
/// short read (the call succeeds but hands back fewer bytes than asked for)
/// is reported as `InvalidAddress` rather than a generic kernel failure, per
/// the crate's error-kind mapping — `mach_vm_read` itself failing still
/// surfaces as its own `KernelError`.
pub fn read_remote(
    task: mach_port_t,
    addr: u64,
    len: usize,
) -> Result<Vec<u8>, crate::mac::errors::InjectError> {
    let mut read_ptr: vm_offset_t = 0;
    let mut read_len: mach_msg_type_number_t = 0;

    kern_ret("mach_vm_read", unsafe {
        mach_vm_read(task, addr, len as u64, &mut read_ptr, &mut read_len)
    })?;

    // SAFETY: `mach_vm_read` succeeded, so `read_ptr`/`read_len` describe a
    // region mapped into our own task.
    let data = unsafe { std::slice::from_raw_parts(read_ptr as *const u8, read_len as usize) }.to_vec();

    // SAFETY: deallocating memory `mach_vm_read` mapped for us.
    unsafe {
        mach_vm_deallocate(mach_task_self(), read_ptr, u64::from(read_len));
    }

    if (data.len() as u64) < len as u64 || failspot::failspot!(crate::FailSpotName::ShortRemoteRead) {
        return Err(crate::mac::errors::InjectError::InvalidAddress(
            "cross-process read returned fewer bytes than requested",
        ));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_error_round_trips_the_well_known_kern_constants() {
        use mach2::kern_return::*;

        assert_eq!(KernelError::from(KERN_INVALID_ADDRESS), KernelError::InvalidAddress);
        assert_eq!(KernelError::from(KERN_PROTECTION_FAILURE), KernelError::ProtectionFailure);
        assert_eq!(KernelError::from(KERN_NO_SPACE), KernelError::NoSpace);
        assert_eq!(KernelError::from(KERN_INVALID_ARGUMENT), KernelError::InvalidArgument);
        assert_eq!(KernelError::from(KERN_FAILURE), KernelError::Failure);
        assert_eq!(KernelError::from(KERN_TERMINATED), KernelError::Terminated);
        assert_eq!(KernelError::from(56), KernelError::NotFound);
    }

    #[test]
    fn kernel_error_falls_back_to_failure_for_unrecognized_codes() {
        assert_eq!(KernelError::from(9_999), KernelError::Failure);
    }

    #[test]
    fn kern_ret_maps_success_to_ok() {
        assert!(kern_ret("noop", KERN_SUCCESS).is_ok());
    }

    #[test]
    fn kern_ret_maps_failure_codes_to_the_matching_kernel_error() {
        let err = kern_ret("noop", mach2::kern_return::KERN_NO_SPACE).unwrap_err();
        assert_eq!(err, KernelError::NoSpace);
    }
}
