//! Owns the bad-access exception port installed on the target task for the
//! duration of an injection, and the state-identity message exchange used to
//! rewrite the worker thread's registers from the exception handler side.

use crate::mac::errors::InjectError;
use crate::mac::mach::{
    self, mach_port_t, ExceptionMessage, ExceptionReply, NdrRecord, EXCEPTION_STATE_IDENTITY,
    EXC_MASK_BAD_ACCESS, MACH_MSGH_BITS_COMPLEX,
};

/// The smallest a state-identity request can legitimately be: the fixed
/// header fields up to (but not including) the variable-length `old_state`
/// payload itself.
const MIN_REQUEST_SIZE: u32 = std::mem::size_of::<ExceptionMessage>() as u32
    - std::mem::size_of::<mach::RawThreadState>() as u32;

/// The previous exception handler installed on the target task, if any, so
/// [`ExceptionBroker::restore`] can put things back exactly as they were.
struct SavedExceptionPort {
    mask: u32,
    port: mach_port_t,
    behavior: i32,
    flavor: i32,
}

/// Installs a bad-access exception handler on a task for the lifetime of an
/// injection and brokers the state-identity exception messages the
/// [`crate::mac::controller::InjectionController`] rewrites.
pub struct ExceptionBroker {
    task: mach_port_t,
    exc_port: mach_port_t,
    saved: Option<SavedExceptionPort>,
}

impl ExceptionBroker {
    pub fn install(task: mach_port_t, flavor: i32) -> Result<Self, InjectError> {
        let self_task = mach::mach_task_self();
        let mut exc_port: mach_port_t = 0;

        mach::kern_ret("mach_port_allocate", unsafe {
            mach::mach_port_allocate(self_task, mach::MACH_PORT_RIGHT_RECEIVE, &mut exc_port)
        })?;

        mach::kern_ret("mach_port_insert_right", unsafe {
            mach::mach_port_insert_right(self_task, exc_port, exc_port, mach::MACH_MSG_TYPE_MAKE_SEND)
        })?;

        let mut old_masks = [0u32; 1];
        let mut old_count: mach::mach_msg_type_number_t = 1;
        let mut old_ports = [0 as mach_port_t; 1];
        let mut old_behaviors = [0i32; 1];
        let mut old_flavors = [0i32; 1];

        mach::kern_ret("task_swap_exception_ports", unsafe {
            mach::task_swap_exception_ports(
                task,
                EXC_MASK_BAD_ACCESS,
                exc_port,
                EXCEPTION_STATE_IDENTITY as i32,
                flavor,
                old_masks.as_mut_ptr(),
                &mut old_count,
                old_ports.as_mut_ptr(),
                old_behaviors.as_mut_ptr(),
                old_flavors.as_mut_ptr(),
            )
        })?;

        // The controller assumes at most one prior handler; more than that
        // means we can't faithfully restore the original state, so we bail
        // rather than silently keeping only the first.
        if old_count > 1 {
            return Err(InjectError::Failure(
                "target task already had more than one bad-access exception handler installed",
            ));
        }

        let saved = (old_count == 1 && old_ports[0] != mach::MACH_PORT_NULL).then(|| {
            SavedExceptionPort {
                mask: old_masks[0],
                port: old_ports[0],
                behavior: old_behaviors[0],
                flavor: old_flavors[0],
            }
        });

        Ok(Self {
            task,
            exc_port,
            saved,
        })
    }

    /// Blocks for the next exception-state-identity request.
    pub fn recv(&self) -> Result<ExceptionMessage, InjectError> {
        let mut msg: ExceptionMessage = unsafe { std::mem::zeroed() };
        msg.head.msgh_size = std::mem::size_of::<ExceptionMessage>() as u32;
        msg.head.msgh_local_port = self.exc_port;

        mach::kern_ret("mach_msg (receive)", unsafe {
            mach::mach_msg(
                std::ptr::addr_of_mut!(msg).cast(),
                mach::MACH_RCV_MSG,
                0,
                std::mem::size_of::<ExceptionMessage>() as u32,
                self.exc_port,
                mach::MACH_MSG_TIMEOUT_NONE,
                mach::MACH_PORT_NULL,
            )
        })?;

        validate_request(&msg)?;

        log::debug!(
            "exception broker received exception {} for thread {:x}",
            msg.exception,
            msg.thread.name
        );

        Ok(msg)
    }

    /// Replies to `request`, optionally supplying a rewritten register state
    /// (`None` leaves the faulting thread's state untouched, used for the
    /// terminal replies that precede `thread_terminate`).
    pub fn reply(
        &self,
        request: &ExceptionMessage,
        ret_code: mach::kern_return_t,
        new_state: Option<(&[u32], i32)>,
    ) -> Result<(), InjectError> {
        let mut reply: ExceptionReply = unsafe { std::mem::zeroed() };
        reply.head.msgh_bits = request.head.msgh_bits & !mach::MACH_MSGH_BITS_COMPLEX;
        reply.head.msgh_size = std::mem::size_of::<ExceptionReply>() as u32;
        reply.head.msgh_remote_port = request.head.msgh_remote_port;
        reply.head.msgh_local_port = mach::MACH_PORT_NULL;
        // MIG reply convention: the reply id is always request id + 100.
        reply.head.msgh_id = request.head.msgh_id + 100;
        reply.ndr = NdrRecord {
            mig_vers: 0,
            if_vers: 0,
            reserved1: 0,
            mig_encoding: 0,
            int_rep: 1,
            char_rep: 0,
            float_rep: 0,
            reserved2: 0,
        };
        reply.ret_code = ret_code;

        if let Some((state, flavor)) = new_state {
            reply.flavor = flavor;
            reply.new_state_count = state.len() as u32;
            reply.new_state[..state.len()].copy_from_slice(state);
        }

        mach::kern_ret("mach_msg (send)", unsafe {
            mach::mach_msg(
                std::ptr::addr_of_mut!(reply).cast(),
                mach::MACH_SEND_MSG,
                std::mem::size_of::<ExceptionReply>() as u32,
                0,
                mach::MACH_PORT_NULL,
                mach::MACH_MSG_TIMEOUT_NONE,
                mach::MACH_PORT_NULL,
            )
        })
    }

    /// Restores whatever exception handler was previously installed on the
    /// task (or clears ours if there wasn't one) and deallocates our port.
    pub fn restore(self) -> Result<(), InjectError> {
        let (mask, port, behavior, flavor) = match &self.saved {
            Some(saved) => (saved.mask, saved.port, saved.behavior, saved.flavor),
            None => (
                EXC_MASK_BAD_ACCESS,
                mach::MACH_PORT_NULL,
                EXCEPTION_STATE_IDENTITY as i32,
                0,
            ),
        };

        mach::kern_ret("task_set_exception_ports", unsafe {
            mach::task_set_exception_ports(self.task, mask, port, behavior, flavor)
        })?;

        // SAFETY: `exc_port` was allocated by us in `install` and is not
        // shared with anything else once the handler is restored.
        unsafe {
            let _ = mach::mach_port_deallocate(mach::mach_task_self(), self.exc_port);
        }

        Ok(())
    }
}

/// Validates the shape of a received state-identity request: the complexity
/// bit (port descriptors present), at least one port descriptor, and a
/// declared size large enough to hold the old-state payload it claims to
/// carry.
fn validate_request(msg: &ExceptionMessage) -> Result<(), InjectError> {
    if msg.head.msgh_bits & MACH_MSGH_BITS_COMPLEX == 0 {
        return Err(InjectError::Failure(
            "exception message was not complex (missing port descriptors)",
        ));
    }
    if msg.msgh_body < 1 {
        return Err(InjectError::Failure(
            "exception message carried no port descriptors",
        ));
    }
    let declared_state_bytes = msg.old_state_count.saturating_mul(4);
    if msg.head.msgh_size < MIN_REQUEST_SIZE.saturating_add(declared_state_bytes) {
        return Err(InjectError::Failure(
            "exception message is too small to hold its declared state payload",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn well_formed_request() -> ExceptionMessage {
        // SAFETY: an all-zero `ExceptionMessage` is a valid bit pattern;
        // tests below only ever flip a handful of scalar fields afterwards.
        let mut msg: ExceptionMessage = unsafe { std::mem::zeroed() };
        msg.head.msgh_bits = MACH_MSGH_BITS_COMPLEX;
        msg.head.msgh_size = std::mem::size_of::<ExceptionMessage>() as u32;
        msg.msgh_body = 2;
        msg.old_state_count = 16;
        msg
    }

    #[test]
    fn accepts_a_well_formed_request() {
        assert!(validate_request(&well_formed_request()).is_ok());
    }

    #[test]
    fn rejects_a_non_complex_message() {
        let mut msg = well_formed_request();
        msg.head.msgh_bits = 0;
        assert!(matches!(validate_request(&msg), Err(InjectError::Failure(_))));
    }

    #[test]
    fn rejects_zero_descriptors() {
        let mut msg = well_formed_request();
        msg.msgh_body = 0;
        assert!(matches!(validate_request(&msg), Err(InjectError::Failure(_))));
    }

    #[test]
    fn accepts_a_single_descriptor() {
        let mut msg = well_formed_request();
        msg.msgh_body = 1;
        assert!(validate_request(&msg).is_ok());
    }

    #[test]
    fn rejects_a_declared_size_too_small_for_the_state_payload() {
        let mut msg = well_formed_request();
        msg.old_state_count = 1000;
        msg.head.msgh_size = MIN_REQUEST_SIZE;
        assert!(matches!(validate_request(&msg), Err(InjectError::Failure(_))));
    }
}
