//! The checkout-or-update protocol shared by every version control system.

use crate::process::{Invocation, ProcessOutput, ProcessRunner, Watcher};
use crate::repository::Repository;
use crate::ssh_agent::SshAgent;
use crate::trace::{trace, LogTracer, Operation, OperationKind, Tracer};
use failure::{Error, ResultExt};
use std::env;
use std::fmt::{self, Debug, Formatter};
use std::fs;
use std::path::{Path, PathBuf};

/// How a retriever should go about its business.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverOptions {
    /// The most output any single command may produce.
    pub max_bytes: Option<u64>,
    /// The longest any single command may run for.
    pub max_seconds: Option<u64>,
    /// Where checkouts are kept.
    pub base_dir: PathBuf,
}

impl RetrieverOptions {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> RetrieverOptions {
        RetrieverOptions {
            max_bytes: None,
            max_seconds: None,
            base_dir: base_dir.into(),
        }
    }
}

/// Everything a [`Driver`] needs to know while checking out or updating a
/// single repository.
pub struct Session<'a> {
    pub repository: &'a Repository,
    /// The working directory.
    pub dir: &'a Path,
    pub runner: &'a dyn ProcessRunner,
    pub tracer: &'a dyn Tracer,
    /// The operation this session is part of.
    pub operation: &'a Operation<'a>,
    /// Extra environment variables for every command (e.g. the SSH agent).
    pub env: Vec<(String, String)>,
}

impl<'a> Session<'a> {
    /// Run one step of the retrieval as its own operation.
    pub fn step<T, F>(
        &self,
        kind: OperationKind,
        explanation: Option<String>,
        f: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let mut op = self.operation.child(kind);
        if let Some(explanation) = explanation {
            op = op.explained(explanation);
        }

        trace(self.tracer, &op, f)
    }

    /// Run a command with the session's environment, failing if it exits
    /// unsuccessfully.
    pub fn run(&self, invocation: Invocation) -> Result<ProcessOutput, Error> {
        self.runner.run(&invocation.envs(self.env.iter().cloned()))
    }

    /// Like [`Session::run()`], but the exit status is left for the caller
    /// to interpret.
    pub fn execute(&self, invocation: Invocation) -> Result<ProcessOutput, Error> {
        self.runner.execute(&invocation.envs(self.env.iter().cloned()))
    }
}

/// The parts of retrieval which depend on the version control system.
pub trait Driver: Send + Sync {
    /// The name of the client tool.
    fn name(&self) -> &'static str;

    /// Make sure the client tool is installed and working.
    fn available(&self, runner: &dyn ProcessRunner) -> Result<(), Error>;

    /// Does `dir` already contain a checkout we can update?
    fn exists(&self, dir: &Path) -> bool;

    /// Acquire whatever credentials need to be held for the duration of a
    /// retrieval.
    fn credentials<'r>(
        &self,
        _repository: &Repository,
        _runner: &'r dyn ProcessRunner,
    ) -> Result<Option<SshAgent<'r>>, Error> {
        Ok(None)
    }

    /// Create a fresh checkout, returning the resolved revision.
    fn checkout(&self, session: &Session) -> Result<String, Error>;

    /// Bring an existing checkout up to date, returning the resolved revision.
    fn update(&self, session: &Session) -> Result<String, Error>;

    /// Version control metadata which shouldn't be treated as content.
    fn ignorable_paths(&self) -> &'static [&'static str];
}

/// The result of a successful retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    /// The repository, with its tag replaced by the revision actually
    /// checked out.
    pub repository: Repository,
    /// The working directory the checkout lives in.
    pub dir: PathBuf,
}

/// Checks out a repository, or updates the checkout if one already exists.
pub struct Retriever<D> {
    driver: D,
    base_dir: PathBuf,
    runner: Box<dyn ProcessRunner>,
    tracer: Box<dyn Tracer>,
}

impl<D: Driver> Retriever<D> {
    /// A relative `base_dir` is taken relative to the current directory at
    /// the time the retriever is created.
    pub fn new(driver: D, options: RetrieverOptions) -> Retriever<D> {
        Retriever {
            driver,
            runner: Box::new(Watcher::new(options.max_bytes, options.max_seconds)),
            base_dir: absolute(options.base_dir),
            tracer: Box::new(LogTracer),
        }
    }

    pub fn with_tracer<T: Tracer + 'static>(self, tracer: T) -> Retriever<D> {
        Retriever {
            tracer: Box::new(tracer),
            ..self
        }
    }

    pub fn with_runner<R: ProcessRunner + 'static>(self, runner: R) -> Retriever<D> {
        Retriever {
            runner: Box::new(runner),
            ..self
        }
    }

    /// Where a repository's checkout lives.
    pub fn repo_dir(&self, repository: &Repository) -> PathBuf {
        self.base_dir.join(repository.repository_hash())
    }

    pub fn ignorable_paths(&self) -> &'static [&'static str] {
        self.driver.ignorable_paths()
    }

    /// Make sure the working directory holds a full checkout of the
    /// repository's tag.
    ///
    /// The `repository` itself is never touched. A failed retrieval leaves
    /// the working directory however the tool left it.
    pub fn retrieve(&self, repository: &Repository) -> Result<Retrieval, Error> {
        let root = Operation::root(OperationKind::Retrieve, repository.to_string());
        let tracer = &*self.tracer;

        trace(tracer, &root, || {
            let availability = root
                .child(OperationKind::Availability)
                .explained(self.driver.name());
            trace(tracer, &availability, || self.driver.available(&*self.runner))?;

            let dir = self.repo_dir(repository);
            fs::create_dir_all(&self.base_dir).with_context(|_| {
                format!("Couldn't create the base directory ({})", self.base_dir.display())
            })?;

            // Held until the end of this closure so the agent is torn down
            // however we leave.
            let agent = trace(tracer, &root.child(OperationKind::Credentials), || {
                self.driver.credentials(repository, &*self.runner)
            })?;

            let exists = self.driver.exists(&dir);
            if !exists && dir.exists() {
                debug!("Clearing out {} before checking out", dir.display());
                fs::remove_dir_all(&dir).with_context(|_| {
                    format!("Couldn't remove the stale working directory ({})", dir.display())
                })?;
            }
            let kind = if exists {
                OperationKind::Update
            } else {
                OperationKind::Checkout
            };
            let op = root.child(kind).explained(dir.display().to_string());

            let session = Session {
                repository,
                dir: &dir,
                runner: &*self.runner,
                tracer,
                operation: &op,
                env: agent.as_ref().map(|a| a.env()).unwrap_or_default(),
            };

            let revision = trace(tracer, &op, || {
                if exists {
                    debug!("Updating the existing checkout in {}", dir.display());
                    self.driver.update(&session)
                } else {
                    debug!("Checking out into {}", dir.display());
                    self.driver.checkout(&session)
                }
            })?;

            info!("{} is at revision {}", repository, revision);

            Ok(Retrieval {
                repository: repository.with_tag(revision),
                dir,
            })
        })
    }
}

fn absolute(dir: PathBuf) -> PathBuf {
    if dir.is_absolute() {
        return dir;
    }

    match env::current_dir() {
        Ok(cwd) => cwd.join(dir),
        Err(e) => {
            warn!("Unable to find the current directory, {}", e);
            dir
        }
    }
}

impl<D: Debug> Debug for Retriever<D> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Retriever")
            .field("driver", &self.driver)
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RetrieverUnavailable;
    use crate::repository::RepoType;
    use crate::trace::tests::RecordingTracer;
    use std::sync::{Arc, Mutex};

    /// Pretends to be a version control system by writing a marker directory.
    #[derive(Debug, Default)]
    struct FakeDriver {
        unavailable: bool,
        broken_updates: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FakeDriver {
        fn called(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }
    }

    impl Driver for FakeDriver {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn available(&self, _runner: &dyn ProcessRunner) -> Result<(), Error> {
            if self.unavailable {
                Err(RetrieverUnavailable {
                    tool: String::from("fake"),
                    reason: String::from("not installed"),
                }
                .into())
            } else {
                Ok(())
            }
        }

        fn exists(&self, dir: &Path) -> bool {
            dir.join(".fake").is_dir()
        }

        fn checkout(&self, session: &Session) -> Result<String, Error> {
            self.called("checkout");
            session.step(OperationKind::Cloning, None, || {
                fs::create_dir_all(session.dir.join(".fake"))?;
                Ok(())
            })?;
            Ok(String::from("r1"))
        }

        fn update(&self, session: &Session) -> Result<String, Error> {
            self.called("update");
            session.step(OperationKind::Fetch, None, || {
                if self.broken_updates {
                    Err(failure::err_msg("the network is down"))
                } else {
                    Ok(String::from("r2"))
                }
            })
        }

        fn ignorable_paths(&self) -> &'static [&'static str] {
            &[".fake"]
        }
    }

    fn repo() -> Repository {
        Repository::new(RepoType::Mock, "http://example.com/repo").with_tag("main")
    }

    #[test]
    fn check_out_then_update() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FakeDriver::default();
        let calls = Arc::clone(&driver.calls);
        let retriever = Retriever::new(driver, RetrieverOptions::new(temp.path()));
        let repo = repo();

        let first = retriever.retrieve(&repo).unwrap();
        assert_eq!(first.repository.tag(), Some("r1"));
        assert_eq!(first.dir, temp.path().join(repo.repository_hash()));
        assert!(first.repository.equal_repo(&repo));

        let second = retriever.retrieve(&first.repository).unwrap();
        assert_eq!(second.repository.tag(), Some("r2"));
        assert_eq!(second.dir, first.dir);

        assert_eq!(*calls.lock().unwrap(), vec!["checkout", "update"]);
        // the original is never modified
        assert_eq!(repo.tag(), Some("main"));
    }

    #[test]
    fn unavailable_tools_stop_everything() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FakeDriver {
            unavailable: true,
            ..Default::default()
        };
        let calls = Arc::clone(&driver.calls);
        let retriever = Retriever::new(driver, RetrieverOptions::new(temp.path()));

        let err = retriever.retrieve(&repo()).unwrap_err();

        assert!(err.downcast_ref::<RetrieverUnavailable>().is_some());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn failures_are_traced_and_passed_back() {
        let temp = tempfile::tempdir().unwrap();
        let tracer = Arc::new(RecordingTracer::default());
        let driver = FakeDriver {
            broken_updates: true,
            ..Default::default()
        };
        let retriever = Retriever::new(driver, RetrieverOptions::new(temp.path()))
            .with_tracer(Arc::clone(&tracer));
        let repo = repo();
        fs::create_dir_all(retriever.repo_dir(&repo).join(".fake")).unwrap();

        let err = retriever.retrieve(&repo).unwrap_err();

        assert_eq!(err.to_string(), "the network is down");
        let events = tracer.events();
        let dir = retriever.repo_dir(&repo);
        assert!(events.contains(&String::from("begin availability: fake")));
        assert!(events.contains(&format!(
            "error the network is down during fetch in update: {} in retrieve: mock http://example.com/repo:main",
            dir.display()
        )));
        assert_eq!(
            events.last().unwrap(),
            "error the network is down during retrieve: mock http://example.com/repo:main"
        );
    }

    #[test]
    fn relative_base_directories_are_made_absolute() {
        let retriever = Retriever::new(FakeDriver::default(), RetrieverOptions::new("checkouts"));
        let repo = repo();

        let dir = retriever.repo_dir(&repo);

        assert!(dir.is_absolute());
        assert_eq!(
            dir,
            env::current_dir()
                .unwrap()
                .join("checkouts")
                .join(repo.repository_hash())
        );
    }

    #[test]
    fn leftovers_without_a_checkout_are_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let driver = FakeDriver::default();
        let calls = Arc::clone(&driver.calls);
        let retriever = Retriever::new(driver, RetrieverOptions::new(temp.path()));
        let repo = repo();
        let dir = retriever.repo_dir(&repo);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("leftover"), "from an interrupted clone").unwrap();

        let got = retriever.retrieve(&repo).unwrap();

        assert_eq!(got.repository.tag(), Some("r1"));
        assert_eq!(*calls.lock().unwrap(), vec!["checkout"]);
        assert!(!dir.join("leftover").exists());
        assert!(dir.join(".fake").is_dir());
    }

    #[test]
    fn ignorable_paths_come_from_the_driver() {
        let temp = tempfile::tempdir().unwrap();
        let retriever = Retriever::new(FakeDriver::default(), RetrieverOptions::new(temp.path()));

        assert_eq!(retriever.ignorable_paths(), &[".fake"]);
    }
}
