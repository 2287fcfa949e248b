//! Process exit codes, one per failure class.

use patchnorm::{ConfigError, ErrorKind, NormError};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAIL: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_PROTOCOL: i32 = 3;
pub const EXIT_TOLERANCE: i32 = 4;

/// Map an error chain to an exit code.
///
/// The first [`NormError`] or [`ConfigError`] found in the chain decides.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(norm) = cause.downcast_ref::<NormError>() {
            return match norm.kind() {
                ErrorKind::Configuration => EXIT_CONFIG,
                ErrorKind::Protocol => EXIT_PROTOCOL,
                ErrorKind::Tensor => EXIT_GENERIC_FAIL,
            };
        }
        if cause.downcast_ref::<ConfigError>().is_some() {
            return EXIT_CONFIG;
        }
    }
    EXIT_GENERIC_FAIL
}
