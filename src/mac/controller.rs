//! Drives the three-event exception trampoline that turns a foreign
//! process's dynamic linker into loading our target image.

use std::path::Path;

use crate::mac::arch::ArchProfile;
use crate::mac::errors::InjectError;
use crate::mac::exception_broker::ExceptionBroker;
use crate::mac::linker_locator::LinkerLocator;
use crate::mac::mach::{self, mach_port_t, RawThreadState};
use crate::mac::remote_stack::RemoteStack;
use crate::mac::symbol_finder::AddressBundle;

/// Where the controller is in the three-event exchange with the worker
/// thread. The initiator thread's own fault is handled inline and doesn't
/// need a state of its own — only the worker thread's two faults advance
/// this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the worker thread's first fault (immediately after
    /// `bsdthread_create` hands it control at the sentinel PC).
    AwaitingWorkerEntry,
    /// The `_dlopen` call has been issued; waiting for the worker's second
    /// fault, once `_dlopen` returns to the sentinel again.
    LoaderCallIssued,
}

/// Injects the dynamic library at `path` into the process identified by
/// `pid`.
///
/// This is the crate's sole public entry point (see `lib.rs`). It acquires
/// the target's task port, locates `_dlopen`/`_syscall` inside its dynamic
/// linker, spawns a worker thread via `_syscall(bsdthread_create, ...)`, and
/// steers that thread through `_dlopen` by rewriting its register state each
/// time it faults at a sentinel return address. Every resource acquired
/// along the way — the exception port, the remote stack, the spawned
/// threads — is released on every exit path, success or failure.
pub fn inject(pid: i32, path: impl AsRef<Path>) -> Result<(), InjectError> {
    let canonical = std::fs::canonicalize(path.as_ref()).map_err(|_| {
        InjectError::InvalidArgument("path does not refer to a file that can be resolved")
    })?;

    log::info!("injecting {} into pid {pid}", canonical.display());

    // `task` releases the send right obtained from `task_for_pid` on every
    // exit path below, success or failure, via `Drop`.
    let task = TaskHandle::acquire(pid)?;
    let (arch, bundle) = LinkerLocator::locate(task.raw())?;
    log::debug!("resolved dynamic linker symbols: {bundle:?}");

    let stack = RemoteStack::allocate(task.raw())?;
    let path_addr = stack.write_path(&canonical)?;

    let broker = ExceptionBroker::install(task.raw(), arch.thread_state_flavor())?;

    // Single exit: whether or not the initiator spawns successfully, the
    // exception handler installed above is always restored before this
    // function returns, and the remote stack (via `Drop`) is always
    // deallocated.
    let result = spawn_initiator(task.raw(), arch, &bundle, &stack).and_then(|initiator| {
        run_trampoline(&broker, arch, &bundle, &stack, path_addr, initiator)
    });

    let restore_result = broker.restore();

    match (result, restore_result) {
        (Ok(()), Ok(())) => {
            log::info!("injection into pid {pid} completed");
            Ok(())
        }
        (Err(e), _) => Err(e),
        (Ok(()), Err(e)) => Err(e),
    }
}

/// RAII wrapper around the send right `task_for_pid` hands back, so it is
/// deallocated on every exit path regardless of how injection finishes
/// (mirroring `inject.c`'s unconditional `mach_port_deallocate` of the task
/// port on every return from `inject()`).
struct TaskHandle(mach_port_t);

impl TaskHandle {
    fn acquire(pid: i32) -> Result<Self, InjectError> {
        let mut task: mach_port_t = 0;
        mach::kern_ret("task_for_pid", unsafe {
            mach::task_for_pid(mach::mach_task_self(), pid, &mut task)
        })?;
        Ok(Self(task))
    }

    fn raw(&self) -> mach_port_t {
        self.0
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        // SAFETY: `self.0` was acquired from `task_for_pid` in `acquire` and
        // is not shared with anything outside this struct.
        unsafe {
            let _ = mach::mach_port_deallocate(mach::mach_task_self(), self.0);
        }
    }
}

/// Creates the initiator thread and sets it running `_syscall(360, ...)`
/// with its own return address set to the sentinel.
fn spawn_initiator(
    task: mach_port_t,
    arch: ArchProfile,
    bundle: &AddressBundle,
    stack: &RemoteStack,
) -> Result<mach_port_t, InjectError> {
    let mut thread: mach_port_t = 0;
    mach::kern_ret("thread_create", unsafe { mach::thread_create(task, &mut thread) })?;

    let mut raw: RawThreadState = [0u32; 144];
    if let Some(words) = arch.write_worker_entry(&mut raw, bundle.syscall, stack.tip()) {
        stack.write_stack_words(&words)?;
    }

    mach::kern_ret("thread_set_state", unsafe {
        mach::thread_set_state(
            thread,
            arch.thread_state_flavor(),
            raw.as_mut_ptr(),
            arch.thread_state_count(),
        )
    })?;

    mach::kern_ret("thread_resume", unsafe { mach::thread_resume(thread) })?;

    Ok(thread)
}

/// The three-event receive loop: the initiator's fault is reaped inline,
/// then the worker thread's two faults drive `state` from
/// [`State::AwaitingWorkerEntry`] to [`State::LoaderCallIssued`] to done.
fn run_trampoline(
    broker: &ExceptionBroker,
    arch: ArchProfile,
    bundle: &AddressBundle,
    stack: &RemoteStack,
    path_addr: u64,
    initiator: mach_port_t,
) -> Result<(), InjectError> {
    let mut state = State::AwaitingWorkerEntry;
    let mut worker: Option<mach_port_t> = None;

    loop {
        let msg = broker.recv()?;

        let msg_thread = msg.thread.name;

        if msg_thread == initiator {
            log::debug!("initiator thread {initiator:x} faulted, tearing it down");
            // SAFETY: `initiator` was created by us in `spawn_initiator` and
            // its job — spawning the worker — is already done by the time it
            // faults here. No reply is sent: the initiator is terminated
            // outright rather than resumed, matching the original
            // implementation, which never replies to this exception either.
            mach::kern_ret("thread_terminate", unsafe { mach::thread_terminate(initiator) })?;
            continue;
        }

        let worker_thread = *worker.get_or_insert(msg_thread);
        if msg_thread != worker_thread {
            return Err(InjectError::Failure(
                "received an exception from an unexpected thread",
            ));
        }

        if msg.old_state_count != arch.thread_state_count() {
            return Err(InjectError::Failure(
                "exception message's old-state count did not match the architecture's thread-state count",
            ));
        }

        let pc = arch.pc(&msg.old_state);
        if !arch.pc_is_sentinel(pc) {
            return Err(InjectError::Failure(
                "worker thread faulted somewhere other than the sentinel address",
            ));
        }

        match state {
            State::AwaitingWorkerEntry => {
                log::debug!("worker thread {worker_thread:x} reached the sentinel, issuing dlopen");

                let mut new_state: RawThreadState = [0u32; 144];
                if let Some(words) = arch.write_dlopen_call(&mut new_state, bundle.dlopen, stack.tip(), path_addr) {
                    stack.write_stack_words(&words)?;
                }

                broker.reply(
                    &msg,
                    mach::KERN_SUCCESS,
                    Some((&new_state[..arch.thread_state_count() as usize], arch.thread_state_flavor())),
                )?;

                state = State::LoaderCallIssued;
            }
            State::LoaderCallIssued => {
                log::debug!("worker thread {worker_thread:x} returned from dlopen, tearing it down");

                // SAFETY: `worker_thread`'s only remaining purpose was to run
                // `_dlopen`, which has already returned. No reply is sent
                // here either; the thread is simply torn down.
                mach::kern_ret("thread_terminate", unsafe { mach::thread_terminate(worker_thread) })?;

                return Ok(());
            }
        }
    }
}
