use facet::Facet;
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    ZeroId(&'static str),
    EmptyField(&'static str),
    TooManyAddresses { len: usize, max: usize },
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroId(field) => write!(f, "{field} must be non-zero"),
            Self::EmptyField(field) => write!(f, "{field} must be non-empty"),
            Self::TooManyAddresses { len, max } => {
                write!(f, "backtrace holds {len} addresses, at most {max} allowed")
            }
        }
    }
}

impl Error for InvariantError {}

/// Kernel-level thread id, stable for the lifetime of the thread.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeThreadId(u64);

impl NativeThreadId {
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one thread as reported alongside its backtraces.
///
/// A `thread_id` of zero means the thread could not be resolved (or must not
/// be sampled) and is skipped for the current pass.
#[derive(Facet, Debug, Clone, PartialEq, Eq, Default)]
pub struct ThreadMetadata {
    pub thread_id: u64,
    pub name: String,
    pub priority: i32,
}

impl ThreadMetadata {
    pub fn new(thread_id: u64, name: impl Into<String>, priority: i32) -> Self {
        Self {
            thread_id,
            name: name.into(),
            priority,
        }
    }

    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self) -> bool {
        self.thread_id != 0
    }
}

/// Upper bound on the number of return addresses a single backtrace may carry.
pub const MAX_BACKTRACE_DEPTH: usize = 128;

/// One complete stack captured from one thread at one instant.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct Backtrace {
    pub thread_metadata: ThreadMetadata,
    /// Monotonic nanoseconds, taken just before the thread was suspended.
    pub absolute_timestamp: u64,
    pub addresses: Vec<u64>,
}

impl Backtrace {
    pub fn new(
        thread_metadata: ThreadMetadata,
        absolute_timestamp: u64,
        addresses: Vec<u64>,
    ) -> Result<Self, InvariantError> {
        if !thread_metadata.is_resolved() {
            return Err(InvariantError::ZeroId("thread_id"));
        }
        if addresses.is_empty() {
            return Err(InvariantError::EmptyField("addresses"));
        }
        if addresses.len() > MAX_BACKTRACE_DEPTH {
            return Err(InvariantError::TooManyAddresses {
                len: addresses.len(),
                max: MAX_BACKTRACE_DEPTH,
            });
        }
        Ok(Self {
            thread_metadata,
            absolute_timestamp,
            addresses,
        })
    }

    pub fn depth(&self) -> usize {
        self.addresses.len()
    }
}
