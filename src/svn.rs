use crate::errors::{RetrieverUnavailable, VersionUnsupported};
use crate::process::{Invocation, ProcessRunner};
use crate::repository::Repository;
use crate::retriever::{Driver, Session};
use crate::trace::OperationKind;
use failure::Error;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use std::fmt::{self, Display, Formatter};
use std::path::Path;

static VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\.(\d+)").expect("valid regex"));
static REVISION_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));
static INFO_REVISION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Revision:\s*(\d+)\s*$").expect("valid regex"));

/// The major and minor version of the installed `svn` client.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SvnVersion {
    pub major: u32,
    pub minor: u32,
}

impl SvnVersion {
    /// Parse the output of `svn --version --quiet` (e.g. "1.14.2").
    pub fn parse(src: &str) -> Option<SvnVersion> {
        let caps = VERSION.captures(src)?;

        Some(SvnVersion {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
        })
    }

    /// Only 1.x clients from 1.4 onwards are supported.
    pub fn check(self) -> Result<(), VersionUnsupported> {
        if self.major != 1 || self.minor < 4 {
            Err(VersionUnsupported {
                tool: String::from("svn"),
                version: self.to_string(),
                reason: String::from("1.4 or later (but not 2.x) is required"),
            })
        } else {
            Ok(())
        }
    }

    /// `--trust-server-cert` only exists from 1.6 onwards.
    pub fn trusts_server_certs(self) -> bool {
        self.minor >= 6
    }
}

impl Display for SvnVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// What to pass to `svn -r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SvnRevision {
    Number(u64),
    /// Anything else (e.g. `HEAD`), passed through untouched.
    Keyword(String),
}

impl SvnRevision {
    /// Tags are always stored as strings, even when they hold a revision
    /// number. An unset tag means the latest revision.
    pub fn from_tag(tag: Option<&str>) -> SvnRevision {
        match tag {
            Some(tag) if REVISION_NUMBER.is_match(tag) => match tag.parse() {
                Ok(number) => SvnRevision::Number(number),
                Err(_) => SvnRevision::Keyword(tag.to_string()),
            },
            Some(tag) => SvnRevision::Keyword(tag.to_string()),
            None => SvnRevision::Keyword(String::from("HEAD")),
        }
    }
}

impl Display for SvnRevision {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            SvnRevision::Number(n) => write!(f, "{}", n),
            SvnRevision::Keyword(ref word) => write!(f, "{}", word),
        }
    }
}

/// Retrieves Subversion repositories using the `svn` command line client.
#[derive(Debug, Default)]
pub struct SvnDriver {
    version: OnceCell<SvnVersion>,
}

impl SvnDriver {
    pub fn new() -> SvnDriver {
        SvnDriver::default()
    }

    /// The client's version, asked for the first time it's needed.
    pub fn version(&self, runner: &dyn ProcessRunner) -> Result<SvnVersion, Error> {
        let version = self
            .version
            .get_or_try_init(|| query_version(runner))?;

        Ok(*version)
    }

    fn current_version(&self, session: &Session) -> Result<SvnVersion, Error> {
        session.step(OperationKind::Version, None, || {
            let version = self.version(session.runner)?;
            version.check()?;
            Ok(version)
        })
    }
}

impl Driver for SvnDriver {
    fn name(&self) -> &'static str {
        "svn"
    }

    fn available(&self, runner: &dyn ProcessRunner) -> Result<(), Error> {
        let version = self.version(runner)?;
        trace!("Using svn {}", version);
        version.check()?;
        Ok(())
    }

    fn exists(&self, dir: &Path) -> bool {
        dir.join(".svn").exists()
    }

    fn checkout(&self, session: &Session) -> Result<String, Error> {
        let version = self.current_version(session)?;
        let revision = SvnRevision::from_tag(session.repository.tag());
        let explanation = format!("r{} to {}", revision, session.dir.display());

        session.step(OperationKind::Cloning, Some(explanation), || {
            let parent = session.dir.parent().unwrap_or(session.dir);
            let checkout = svn(parent)
                .arg("checkout")
                .arg("-r")
                .arg(revision.to_string());
            let checkout = with_auth(checkout, session.repository, version)
                .arg("--")
                .arg(session.repository.url())
                .arg(session.dir);

            session.run(checkout)?;
            Ok(())
        })?;

        working_copy_revision(session)
    }

    fn update(&self, session: &Session) -> Result<String, Error> {
        let version = self.current_version(session)?;
        let revision = SvnRevision::from_tag(session.repository.tag());

        session.step(OperationKind::Fetch, Some(format!("r{}", revision)), || {
            let update = svn(session.dir)
                .arg("update")
                .arg("-r")
                .arg(revision.to_string());
            let update = with_auth(update, session.repository, version)
                .arg("--")
                .arg(session.dir);

            session.run(update)?;
            Ok(())
        })?;

        working_copy_revision(session)
    }

    fn ignorable_paths(&self) -> &'static [&'static str] {
        &[".svn"]
    }
}

fn query_version(runner: &dyn ProcessRunner) -> Result<SvnVersion, RetrieverUnavailable> {
    let unavailable = |reason: String| {
        error!("The svn retriever is unavailable, {}", reason);
        RetrieverUnavailable {
            tool: String::from("svn"),
            reason,
        }
    };

    let output = runner
        .run(&Invocation::new("svn").env("LC_ALL", "C").args(&["--version", "--quiet"]))
        .map_err(|e| unavailable(e.to_string()))?;

    SvnVersion::parse(&output.stdout)
        .ok_or_else(|| unavailable(format!("Unable to parse the version {:?}", output.stdout.trim())))
}

fn svn(dir: &Path) -> Invocation {
    Invocation::new("svn").env("LC_ALL", "C").current_dir(dir)
}

/// Append the arguments which keep `svn` from prompting or remembering
/// anything.
///
/// Credentials are only passed along when we have both a username and a
/// password.
fn with_auth(invocation: Invocation, repository: &Repository, version: SvnVersion) -> Invocation {
    let mut invocation = invocation.args(&["--no-auth-cache", "--non-interactive"]);

    if version.trusts_server_certs() {
        invocation = invocation.arg("--trust-server-cert");
    }

    if let (Some(username), Some(password)) =
        (repository.first_credential(), repository.second_credential())
    {
        invocation = invocation
            .arg("--username")
            .arg(username)
            .arg("--password")
            .secret_arg(password);
    }

    invocation
}

fn working_copy_revision(session: &Session) -> Result<String, Error> {
    session.step(OperationKind::ResolveRevision, None, || {
        let output = session.run(svn(session.dir).arg("info").arg(session.dir))?;

        parse_info_revision(&output.stdout).ok_or_else(|| {
            failure::err_msg(format!(
                "Unable to find the revision of {}",
                session.dir.display()
            ))
        })
    })
}

fn parse_info_revision(info: &str) -> Option<String> {
    INFO_REVISION
        .captures(info)
        .map(|caps| caps[1].to_string())
}
