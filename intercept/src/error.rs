use thiserror::Error;

pub type Result<T> = std::result::Result<T, DetourError>;

/// Failures reported while building, installing or removing a trampoline.
///
/// Every variant is returned before any code is patched or handed out, so an
/// `Err` never leaves a half-installed detour behind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetourError {
    #[error("unsupported signature: {0}")]
    UnsupportedSignature(String),

    #[error("stack argument area of {bytes} bytes exceeds the {max} byte limit")]
    TooManyStackArgs { bytes: usize, max: usize },

    #[error("signature targets {expected} but the emitter implements {found}")]
    ConventionMismatch { expected: &'static str, found: &'static str },

    #[error("target address is null")]
    NullTarget,

    #[error("a detour is already installed at {0:#x}")]
    AlreadyInstalled(usize),

    #[error("no detour is installed at {0:#x}")]
    NotInstalled(usize),

    #[error("prologue at {address:#x} cannot be relocated: {reason}")]
    RelocationFailed { address: usize, reason: &'static str },

    #[error("executable memory allocation failed")]
    AllocationFailed,

    #[error("changing page protection failed (errno {0})")]
    ProtectionFailed(i32),

    #[error("stub needs {needed} bytes but only {capacity} are available")]
    CodeTooLarge { needed: usize, capacity: usize },

    #[error("entry patch needs {needed} bytes but only {available} were relocated")]
    PatchTooLarge { needed: usize, available: usize },

    #[error("unwind info: {0}")]
    UnwindInfo(String),

    #[error("operation not supported on this platform")]
    Unsupported,
}

impl From<gimli::write::Error> for DetourError {
    fn from(err: gimli::write::Error) -> Self {
        DetourError::UnwindInfo(err.to_string())
    }
}
