//! Fetch git and Subversion repositories into local working directories,
//! incrementally.
//!
//! Repositories are described by a [`Repository`], built from untrusted
//! configuration by a [`Registry`] which rejects URLs pointing at internal
//! network addresses. A [`Retriever`] then makes sure a working directory
//! holds a complete checkout of the requested branch, tag or revision,
//! cloning it the first time and updating it from then on.
//!
//! ```rust,no_run
//! # extern crate repo_retriever;
//! # extern crate failure;
//! use repo_retriever::{GitDriver, Registry, RepositoryConfig, Retriever,
//!                      RetrieverOptions, Validation};
//!
//! # fn run() -> Result<(), failure::Error> {
//! let registry = Registry::standard(Validation::default());
//! let repo = registry.from_config(RepositoryConfig {
//!     repo_type: String::from("git"),
//!     url: String::from("https://github.com/rust-lang/log"),
//!     tag: Some(String::from("master")),
//!     ..Default::default()
//! })?;
//!
//! let retriever = Retriever::new(GitDriver::new(), RetrieverOptions::new("/tmp/checkouts"));
//! let retrieval = retriever.retrieve(&repo)?;
//! println!("{} is at {:?}", retrieval.dir.display(), retrieval.repository.tag());
//! # Ok(())
//! # }
//! # fn main() { run().unwrap() }
//! ```

#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

#[cfg(test)]
#[macro_use]
mod test_utils;

pub mod config;
pub mod driver;
pub mod errors;
pub mod git;
pub mod process;
pub mod registry;
pub mod repository;
pub mod retriever;
pub mod ssh_agent;
pub mod svn;
pub mod trace;
pub mod uri;

pub use crate::config::{Config, General};
pub use crate::driver::{Driver, UpdateFailure};
pub use crate::git::GitDriver;
pub use crate::process::{Invocation, ProcessOutput, ProcessRunner, Watcher};
pub use crate::registry::{Registry, Validation};
pub use crate::repository::{RepoType, Repository, RepositoryConfig};
pub use crate::retriever::{Retrieval, Retriever, RetrieverOptions};
pub use crate::svn::SvnDriver;
pub use crate::trace::{LogTracer, Operation, OperationKind, Tracer};
pub use crate::uri::{Resolve, SystemResolver, UriValidator};
