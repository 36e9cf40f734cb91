#![forbid(unsafe_code)]
//! Error types for the virtual block device engine.
//!
//! # Error Taxonomy
//!
//! Every failure in the engine is one [`VbdError`]. Failures fall into two
//! propagation classes:
//!
//! | Class | Surfaced to | Variants |
//! |-------|-------------|----------|
//! | Lifecycle | caller of `start` / `reconfigure` | `InvalidConfiguration`, `BackingStoreUnavailable`, `BackingStoreTooSmall`, `OutOfMemory` |
//! | Per-request | that request's completion callback only | `InvalidRequest`, `IoFailure`, `Io`, `OutOfMemory`, `DeviceDeleting` |
//!
//! A lifecycle failure is recovered by the lifecycle controller (it tears
//! down whatever was partially built) before the single error is returned.
//! A per-request failure never crosses into another request.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`VbdError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `InvalidConfiguration` | `EINVAL` |
//! | `InvalidRequest` | `EINVAL` |
//! | `BackingStoreUnavailable` | `ENODEV` |
//! | `BackingStoreTooSmall` | `EINVAL` |
//! | `OutOfMemory` | `ENOMEM` |
//! | `IoFailure` | `EIO` |
//! | `Io` | raw OS error, else `EIO` |
//! | `DeviceDeleting` | `EIO` |

use thiserror::Error;

/// Unified error type for all engine operations.
#[derive(Debug, Error)]
pub enum VbdError {
    /// Absent or unusable configuration: no mode, empty mirror list,
    /// zero capacity, or a lifecycle call made in the wrong state.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A request whose shape cannot be serviced (buffer not a whole number
    /// of sectors, length overflow).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A backing store path could not be opened or claimed.
    #[error("backing store {path} unavailable: {detail}")]
    BackingStoreUnavailable { path: String, detail: String },

    /// A backing store is smaller than the requested device capacity.
    #[error(
        "backing store {path} too small: capacity={capacity} sectors, required={required} sectors"
    )]
    BackingStoreTooSmall {
        path: String,
        capacity: u64,
        required: u64,
    },

    /// Allocation failed while initialising a backend or cloning a request.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A submitted I/O did not complete successfully.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request arrived while the device was being torn down or was
    /// not created at all.
    #[error("device is deleting")]
    DeviceDeleting,
}

impl VbdError {
    /// Convert this error into a POSIX errno.
    ///
    /// `DeviceDeleting` maps to `EIO` because a request rejected during
    /// teardown is reported to the block layer as a plain I/O error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidConfiguration(_)
            | Self::InvalidRequest(_)
            | Self::BackingStoreTooSmall { .. } => libc::EINVAL,
            Self::BackingStoreUnavailable { .. } => libc::ENODEV,
            Self::OutOfMemory(_) => libc::ENOMEM,
            Self::IoFailure(_) | Self::DeviceDeleting => libc::EIO,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias using `VbdError`.
pub type Result<T> = std::result::Result<T, VbdError>;

/// Final status reported to a request's completion callback.
pub type IoStatus = Result<()>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(VbdError, libc::c_int)> = vec![
            (
                VbdError::InvalidConfiguration("no mode".into()),
                libc::EINVAL,
            ),
            (VbdError::InvalidRequest("odd length".into()), libc::EINVAL),
            (
                VbdError::BackingStoreUnavailable {
                    path: "/dev/missing".into(),
                    detail: "not found".into(),
                },
                libc::ENODEV,
            ),
            (
                VbdError::BackingStoreTooSmall {
                    path: "/dev/small".into(),
                    capacity: 10,
                    required: 20,
                },
                libc::EINVAL,
            ),
            (VbdError::OutOfMemory("clone".into()), libc::ENOMEM),
            (VbdError::IoFailure("leg failed".into()), libc::EIO),
            (VbdError::Io(std::io::Error::other("test")), libc::EIO),
            (VbdError::DeviceDeleting, libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EBUSY);
        assert_eq!(VbdError::Io(raw).to_errno(), libc::EBUSY);
    }

    #[test]
    fn display_formatting() {
        let small = VbdError::BackingStoreTooSmall {
            path: "/tmp/a.img".into(),
            capacity: 102_400,
            required: 204_800,
        };
        assert_eq!(
            small.to_string(),
            "backing store /tmp/a.img too small: capacity=102400 sectors, required=204800 sectors"
        );

        let gone = VbdError::BackingStoreUnavailable {
            path: "/dev/sdz".into(),
            detail: "No such file or directory".into(),
        };
        assert_eq!(
            gone.to_string(),
            "backing store /dev/sdz unavailable: No such file or directory"
        );

        assert_eq!(VbdError::DeviceDeleting.to_string(), "device is deleting");
    }
}
