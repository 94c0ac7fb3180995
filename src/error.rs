use thiserror::Error;

/// Errors surfaced by allocation paths. Precondition violations (null
/// handles, double publication, counter misuse) are asserted instead and
/// are not recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Virtual reservation, arena commit, or handle-table growth failed,
    /// or the handle table hit its fixed ceiling.
    #[error("out of memory")]
    OutOfMemory,
}

pub type Result<T> = std::result::Result<T, Error>;
