use thiserror::Error;

/// The error taxonomy of the factorization engine (spec §7).
///
/// Every fallible operation in `dmf-runtime`, `dmf-matrix` and `dmf-engine`
/// returns `Result<T>`. There is no automatic retry at this layer; decay
/// controllers recover from a transient loss increase internally and never
/// surface a `MfError`.
#[derive(Error, Debug)]
pub enum MfError {
    /// Unknown or incompatible CLI/config options. Raised before any data
    /// is read.
    #[error("config error: {0}")]
    Config(String),

    /// V, W, H are not conforming, or rank is zero.
    #[error("shape error: {0}")]
    Shape(String),

    /// Upstream file read/write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The tag allocator or the thread pool ran out of capacity.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// A remote call into the environment store or the task manager failed.
    #[error("remote call failed: {0}")]
    RemoteCall(#[from] RemoteCallError),
}

/// Failures raised by `dmf-runtime`'s environment store and task manager
/// (spec §4.1, §4.2). Always fatal to the calling epoch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteCallError {
    #[error("unknown task id: {0}")]
    UnknownTaskId(String),
    #[error("unknown variable name: {0}")]
    UnknownName(String),
    #[error("variable name already exists: {0}")]
    NameExists(String),
    #[error("type mismatch for variable {name}: expected {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, MfError>;

/// Outcome of a decay controller's step-size search (spec §9: replaces
/// exceptions-as-control-flow with an explicit result).
///
/// `BoldDriver`, `Sequential` and `Constant` never return anything but
/// `Eps`; only `Auto`/`DistributedDecayAuto` can ask the caller to retry
/// with a smaller search band, or give up and fall back to `BoldDriver`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecayOutcome {
    Eps(f64),
    RetryWithSmallerEps,
    GiveUp,
}
