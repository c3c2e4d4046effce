//! Common error taxonomy for the VMM.
//!
//! There is no local recovery anywhere in the core: every failure propagates
//! to the top-level loop, which logs it and terminates the process. The
//! variants map onto process exit codes in `main`.

use thiserror::Error;

/// Errors surfaced by the VMM core.
#[derive(Error, Debug)]
pub enum VmmError {
    /// A KVM ioctl returned an error. The static string names the ioctl
    /// wrapper that failed.
    #[error("KVM ioctl failed ({0}): {1}")]
    IoctlFailed(&'static str, #[source] kvm_ioctls::Error),

    /// Mapping or accessing guest memory failed.
    #[error("guest memory mapping failed: {0}")]
    NoMemory(String),

    /// The host's KVM reports an API version other than 12.
    #[error("host KVM API version {0} is not supported (need 12)")]
    ApiIncompatible(i32),

    /// An operation was invoked out of order (programmer error), e.g.
    /// placing the TSS after a vCPU already exists.
    #[error("operation out of order: {0}")]
    NotReady(&'static str),

    /// Guest memory is too small for a requested operation, or too large to
    /// leave room for the control structures above it.
    #[error("guest memory cannot fit {0}")]
    GMemNotEnough(&'static str),

    /// The `--memory` argument could not be parsed.
    #[error("invalid memory size {0:?} (expected <number><K|M|G>[B])")]
    InvalidMemoryUnit(String),

    /// The kernel image is not a usable bzImage.
    #[error("invalid kernel image: {0}")]
    InvalidKernel(String),

    /// The vCPU stopped with an exit reason the run loop does not handle.
    #[error("unhandled VM exit: {0}")]
    UnexpectedExit(String),
}

pub type Result<T> = std::result::Result<T, VmmError>;
