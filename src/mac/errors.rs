use thiserror::Error;

use crate::mac::mach::KernelError;

/// The top-level error returned by [`crate::inject`].
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("no space available for the operation")]
    NoSpace,
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),
    #[error("{0}")]
    Failure(&'static str),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}
