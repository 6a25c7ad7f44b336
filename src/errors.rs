//! The errors encountered in this crate.
//!
//! Everything fallible returns a `failure::Error`. Use
//! [`failure::Error::downcast_ref()`] to find out which of these went wrong.

use std::fmt::{self, Display, Formatter};

/// The repository URL was rejected before any retrieval was attempted.
///
/// This covers unsupported schemes, hosts which don't resolve, and hosts
/// which resolve to an address we must never talk to (loopback, private
/// networks, the cloud metadata service).
#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(display = "Invalid repository URL \"{}\": {}", url, reason)]
pub struct InvalidRepository {
    pub url: String,
    pub reason: String,
}

impl InvalidRepository {
    pub fn new<U, R>(url: U, reason: R) -> InvalidRepository
    where
        U: Into<String>,
        R: Into<String>,
    {
        InvalidRepository {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Nothing is registered for this repository type.
#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(display = "Can't understand how to make \"{}\" repositories", repo_type)]
pub struct UnknownRepositoryType {
    pub repo_type: String,
}

/// A git reference names both a branch and a tag.
#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(
    display = "Ambiguous reference: '{}' denotes both a branch and a tag",
    name
)]
pub struct AmbiguousReference {
    pub name: String,
}

/// The client binary needed to retrieve a repository is missing or broken.
#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(display = "The {} retriever is unavailable: {}", tool, reason)]
pub struct RetrieverUnavailable {
    pub tool: String,
    pub reason: String,
}

/// The installed client is too old (or too new) to be driven safely.
#[derive(Debug, Clone, PartialEq, Fail)]
#[fail(display = "Unsupported {} version {}: {}", tool, version, reason)]
pub struct VersionUnsupported {
    pub tool: String,
    pub version: String,
    pub reason: String,
}

/// A spawned tool failed or blew through its resource limits.
#[derive(Debug, Clone, PartialEq, Fail)]
pub struct ProcessExecution {
    pub command: String,
    pub failure: ProcessFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessFailure {
    /// The child exited unsuccessfully. `code` is `None` when it was killed
    /// by a signal.
    Exited { code: Option<i32>, stderr: String },
    /// More output was produced than allowed.
    TooManyBytes { limit: u64 },
    /// The child ran for longer than allowed.
    TimedOut { limit: u64 },
}

impl Display for ProcessExecution {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.failure {
            ProcessFailure::Exited { code, ref stderr } => {
                write!(f, "{:?} failed", self.command)?;
                if let Some(ret) = code {
                    write!(f, " with return code {}", ret)?;
                }
                if !stderr.trim().is_empty() {
                    write!(f, ": {}", stderr.trim())?;
                }
                Ok(())
            }
            ProcessFailure::TooManyBytes { limit } => write!(
                f,
                "{:?} was killed after producing more than {} bytes",
                self.command, limit
            ),
            ProcessFailure::TimedOut { limit } => write!(
                f,
                "{:?} was killed after running for more than {} seconds",
                self.command, limit
            ),
        }
    }
}
