//! Error types for the instrumentation core.
//!
//! One crate-wide error enum, with a variant per failure family. Every
//! fallible operation in the crate returns [`Result`]; errors are never
//! swallowed internally, they propagate to the caller that initiated the
//! operation.

use thiserror::Error;

/// Status code returned by the underlying GPU runtime.
pub type RuntimeStatus = i32;

/// Main error type for lifting, instrumentation and loading.
#[derive(Error, Debug)]
pub enum Error {
    /// The underlying GPU runtime returned failure.
    #[error("runtime error: {call} returned status {status}")]
    Runtime {
        call: &'static str,
        status: RuntimeStatus,
    },

    /// No target description exists for the requested ISA.
    #[error("no target description for ISA {isa:?}")]
    Target { isa: String },

    /// An instruction byte sequence could not be disassembled.
    #[error("cannot decode instruction at offset {offset:#x} (word {word:#010x})")]
    Decode { offset: u64, word: u32 },

    /// Lifting failed.
    #[error("lift error: {reason}")]
    Lift { reason: String },

    /// An intrinsic could not be lowered.
    #[error("cannot lower intrinsic {name:?}: {reason}")]
    Lowering { name: String, reason: String },

    /// An intrinsic call site names an intrinsic that was never registered.
    #[error("unknown intrinsic {name:?} called from {caller:?}")]
    UnknownIntrinsic { name: String, caller: String },

    /// The codegen pipeline or the object printer reported failure.
    #[error("code generation failed: {reason}")]
    CodeGen { reason: String },

    /// Creating, loading into, or freezing an executable failed.
    #[error("loader error: {reason}")]
    Loader { reason: String },

    /// A queried loaded code object or symbol has been invalidated.
    #[error("cache miss: {what} is no longer cached")]
    CacheMiss { what: String },

    /// Error reported by the ELF parser or writer.
    #[error("object file error: {0}")]
    Object(String),
}

impl Error {
    pub fn lift(reason: impl Into<String>) -> Self {
        Error::Lift {
            reason: reason.into(),
        }
    }

    pub fn codegen(reason: impl Into<String>) -> Self {
        Error::CodeGen {
            reason: reason.into(),
        }
    }

    pub fn loader(reason: impl Into<String>) -> Self {
        Error::Loader {
            reason: reason.into(),
        }
    }

    pub fn cache_miss(what: impl Into<String>) -> Self {
        Error::CacheMiss { what: what.into() }
    }

    pub fn lowering(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Lowering {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<object::Error> for Error {
    fn from(e: object::Error) -> Self {
        Error::Object(e.to_string())
    }
}

impl From<object::write::Error> for Error {
    fn from(e: object::write::Error) -> Self {
        Error::Object(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Aborts the process on a broken internal precondition.
///
/// Invariant violations are not recoverable errors; they indicate a bug in
/// the core itself and terminate with the source location of the check.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("invariant violation: {}", format_args!($($arg)+));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_carries_offset() {
        let err = Error::Decode {
            offset: 0x40,
            word: 0xdead_beef,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x40"));
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn invariant_macro_aborts() {
        invariant!(1 == 2, "math stopped working: {}", 42);
    }
}
