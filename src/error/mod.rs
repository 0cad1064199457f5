use std::fmt;

/// Success, as reported to clients that want a raw status code.
pub const CODE_SUCCESS: u32 = 0;
/// Opaque failure from the host platform.
pub const CODE_SYSTEM: u32 = 0x9001_0000;
/// Allocation failed mid-operation.
pub const CODE_MEMORY: u32 = 0x9001_0001;
/// Address, module, or handle could not be resolved.
pub const CODE_NOT_FOUND: u32 = 0x9001_0002;
/// Caller passed a null, zero, or out-of-range argument.
pub const CODE_INVALID_ARGS: u32 = 0x9001_0003;
/// The substrate refused to read or patch the address.
pub const CODE_INVALID_KERNEL_ADDR: u32 = 0x9001_0004;
/// Range conflict that sharing could not resolve.
pub const CODE_PATCH_EXISTS: u32 = 0x9001_0005;

/// Represents errors that can occur while installing or releasing patches.
#[derive(Debug)]
pub enum PatchError {
    /// Opaque failure surfaced from the substrate or host platform
    System(Option<anyhow::Error>),
    /// Allocation failed; any partial mutation has been rolled back
    Memory,
    /// Address, module, or handle was not resolvable (or already released)
    NotFound,
    /// Validation failure, no state was changed
    InvalidArgs(Option<anyhow::Error>),
    /// The substrate refused to save or patch bytes at this address
    InvalidKernelAddr((usize, Option<anyhow::Error>)),
    /// The requested range collides with an installed patch of an
    /// incompatible kind or shape
    PatchExists((usize, usize)),
    /// Generic error that wraps an anyhow::Error
    Other(anyhow::Error),
}

impl PatchError {
    /// Creates a new `PatchError::Other` from anything that implements `std::error::Error`
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        PatchError::Other(anyhow::Error::new(error))
    }

    /// Convert a boxed error into a PatchError
    pub fn from_boxed(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        let anyhow_err = anyhow::anyhow!("{}", err);
        PatchError::Other(anyhow_err)
    }

    /// Returns the inner anyhow::Error if this is an `Other` variant
    pub fn into_inner(self) -> Option<anyhow::Error> {
        match self {
            PatchError::Other(err) => Some(err),
            _ => None,
        }
    }

    /// The numeric status code clients of the original interface expect.
    pub fn code(&self) -> u32 {
        match self {
            PatchError::System(_) => CODE_SYSTEM,
            PatchError::Memory => CODE_MEMORY,
            PatchError::NotFound => CODE_NOT_FOUND,
            PatchError::InvalidArgs(_) => CODE_INVALID_ARGS,
            PatchError::InvalidKernelAddr(_) => CODE_INVALID_KERNEL_ADDR,
            PatchError::PatchExists(_) => CODE_PATCH_EXISTS,
            PatchError::Other(_) => CODE_SYSTEM,
        }
    }

    /// Returns true if this is a `NotFound` error
    pub fn is_not_found(&self) -> bool {
        matches!(self, PatchError::NotFound)
    }

    /// Returns true if this is a `PatchExists` conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, PatchError::PatchExists(_))
    }

    /// Returns true if the substrate rejected the target address
    pub fn is_invalid_addr(&self) -> bool {
        matches!(self, PatchError::InvalidKernelAddr(_))
    }

    /// Converts this error to its underlying root cause string
    pub fn root_cause_string(&self) -> String {
        match self {
            PatchError::System(err) => match err {
                Some(e) => format!("System failure with context \"{e}\"."),
                None => "System failure.".to_string(),
            },
            PatchError::Memory => "Allocation failed mid-operation.".to_string(),
            PatchError::NotFound => "Address, module, or handle not found.".to_string(),
            PatchError::InvalidArgs(err) => match err {
                Some(e) => format!("Invalid arguments: \"{e}\"."),
                None => "Invalid arguments.".to_string(),
            },
            PatchError::InvalidKernelAddr((addr, err)) => match err {
                Some(e) => format!("Substrate refused address {addr:#x} with context \"{e}\"."),
                None => format!("Substrate refused address {addr:#x}."),
            },
            PatchError::PatchExists((addr, size)) => {
                format!(
                    "Range [{addr:#x}, {:#x}) collides with an installed patch.",
                    addr + size
                )
            }
            PatchError::Other(err) => format!("{:#}", err),
        }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PatchError: \"{}\"", &self.root_cause_string())
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PatchError::Other(err) => err.source(),
            _ => None,
        }
    }
}

// From implementations for better interoperability with anyhow
impl From<anyhow::Error> for PatchError {
    fn from(err: anyhow::Error) -> Self {
        PatchError::Other(err)
    }
}

impl From<std::io::Error> for PatchError {
    fn from(err: std::io::Error) -> Self {
        PatchError::Other(anyhow::Error::new(err))
    }
}

impl From<std::str::Utf8Error> for PatchError {
    fn from(err: std::str::Utf8Error) -> Self {
        PatchError::Other(anyhow::Error::new(err))
    }
}

// Create a Result type alias with methods similar to anyhow::Result
pub type PatchResult<T> = Result<T, PatchError>;

/// Extension trait to add anyhow-like methods to PatchResult
pub trait PatchResultExt<T> {
    /// Add context to an error
    fn context<C>(self, context: C) -> PatchResult<T>
    where
        C: fmt::Display + Send + Sync + 'static;

    /// Add context to an error with a lazy closure
    fn with_context<C, F>(self, f: F) -> PatchResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T> PatchResultExt<T> for PatchResult<T> {
    fn context<C>(self, context: C) -> PatchResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.map_err(|err| {
            if let PatchError::Other(inner) = err {
                PatchError::Other(inner.context(context))
            } else {
                let new_err = anyhow::anyhow!("{}: {}", context, err);
                PatchError::Other(new_err)
            }
        })
    }

    fn with_context<C, F>(self, f: F) -> PatchResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.map_err(|err| {
            if let PatchError::Other(inner) = err {
                PatchError::Other(inner.context(f()))
            } else {
                let new_err = anyhow::anyhow!("{}: {}", f(), err);
                PatchError::Other(new_err)
            }
        })
    }
}

impl<T> PatchResultExt<T> for Option<T> {
    fn context<C>(self, context: C) -> PatchResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
    {
        self.ok_or_else(|| PatchError::Other(anyhow::anyhow!("{}", context)))
    }

    fn with_context<C, F>(self, f: F) -> PatchResult<T>
    where
        C: fmt::Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| PatchError::Other(anyhow::anyhow!("{}", f())))
    }
}

// Allow macro-based error creation, similar to anyhow::anyhow!
#[macro_export]
macro_rules! patch_err {
    ($msg:literal $(,)?) => {
        $crate::PatchError::Other(anyhow::anyhow!($msg))
    };
    ($err:expr $(,)?) => {
        $crate::PatchError::Other(anyhow::anyhow!($err))
    };
    ($fmt:literal, $($arg:tt)*) => {
        $crate::PatchError::Other(anyhow::anyhow!($fmt, $($arg)*))
    };
}
