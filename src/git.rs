use crate::errors::{AmbiguousReference, RetrieverUnavailable};
use crate::process::{Invocation, ProcessRunner};
use crate::repository::Repository;
use crate::retriever::{Driver, Session};
use crate::ssh_agent::SshAgent;
use crate::trace::OperationKind;
use failure::Error;
use once_cell::sync::OnceCell;
use std::path::Path;

/// The branch used when a repository's tag is blank.
pub const DEFAULT_BRANCH: &str = "master";

/// Retrieves git repositories using the `git` command line client.
#[derive(Debug, Default)]
pub struct GitDriver {
    /// Whether `git --version` worked, only ever checked once.
    available: OnceCell<Result<String, String>>,
}

impl GitDriver {
    pub fn new() -> GitDriver {
        GitDriver::default()
    }
}

impl Driver for GitDriver {
    fn name(&self) -> &'static str {
        "git"
    }

    fn available(&self, runner: &dyn ProcessRunner) -> Result<(), Error> {
        match self.available.get_or_init(|| check_git(runner)) {
            Ok(version) => {
                trace!("Using {}", version);
                Ok(())
            }
            Err(reason) => Err(RetrieverUnavailable {
                tool: String::from("git"),
                reason: reason.clone(),
            }
            .into()),
        }
    }

    fn exists(&self, dir: &Path) -> bool {
        dir.join(".git").exists()
    }

    /// If the repository has a private key, it's loaded into a fresh
    /// `ssh-agent` which lives until the retrieval is done.
    fn credentials<'r>(
        &self,
        repository: &Repository,
        runner: &'r dyn ProcessRunner,
    ) -> Result<Option<SshAgent<'r>>, Error> {
        match repository.first_credential() {
            Some(key) => {
                let agent = SshAgent::start(runner)?;
                agent.add_key(key)?;
                Ok(Some(agent))
            }
            None => Ok(None),
        }
    }

    fn checkout(&self, session: &Session) -> Result<String, Error> {
        let explanation = format!("to {}", session.dir.display());
        session.step(OperationKind::Cloning, Some(explanation), || {
            let parent = session.dir.parent().unwrap_or(session.dir);
            let clone = Invocation::new("git")
                .env("GIT_TERMINAL_PROMPT", "0")
                .current_dir(parent)
                .arg("clone")
                .arg("--quiet")
                .arg("--")
                .arg(session.repository.url())
                .arg(session.dir);

            session.run(clone)?;
            Ok(())
        })?;

        fetch(session)?;
        checkout_revision(session)?;
        resolve_head(session)
    }

    /// Local changes are thrown away, the checkout always ends up identical
    /// to what's on the remote.
    fn update(&self, session: &Session) -> Result<String, Error> {
        fetch(session)?;

        session.step(OperationKind::Reset, None, || {
            session.run(git(session).args(&["reset", "--hard", "--quiet"]))?;
            Ok(())
        })?;

        if session.repository.tag().is_some() {
            checkout_revision(session)?;
        } else {
            follow_upstream(session)?;
        }

        resolve_head(session)
    }

    fn ignorable_paths(&self) -> &'static [&'static str] {
        &[".git"]
    }
}

fn check_git(runner: &dyn ProcessRunner) -> Result<String, String> {
    match runner.run(&Invocation::new("git").arg("--version")) {
        Ok(output) => Ok(output.stdout.trim().to_string()),
        Err(e) => {
            error!("The git retriever is unavailable, {}", e);
            Err(e.to_string())
        }
    }
}

fn git(session: &Session) -> Invocation {
    Invocation::new("git")
        .env("GIT_TERMINAL_PROMPT", "0")
        .current_dir(session.dir)
}

/// Delete every local tag and fetch everything from every remote.
///
/// Tags are deleted first so one which was deleted (or moved) upstream can't
/// linger and shadow a branch.
fn fetch(session: &Session) -> Result<(), Error> {
    session.step(OperationKind::Fetch, None, || {
        let refs = list_refs(session)?;

        for chunk in refs.tags.chunks(100) {
            session.run(git(session).arg("tag").arg("-d").args(chunk))?;
        }

        session.run(git(session).args(&["fetch", "--all", "--prune", "--tags", "--quiet"]))?;
        Ok(())
    })
}

/// Check out whatever the repository's tag refers to.
///
/// A branch on the remote wins over a local branch, which wins over treating
/// the tag as a revision. A name which is both a branch and a tag is an
/// error because we'd only be guessing.
fn checkout_revision(session: &Session) -> Result<(), Error> {
    let name = match session.repository.tag() {
        Some(tag) => repo_tag(tag),
        None => return Ok(()),
    };

    session.step(OperationKind::CheckoutRevision, Some(name.clone()), || {
        let refs = list_refs(session)?;

        if refs.is_tag(&name) && refs.is_branch(&name) {
            return Err(AmbiguousReference { name: name.clone() }.into());
        }

        let checkout = if let Some(remote) = refs.remote_for(&name) {
            trace!("{} is a branch on {}", name, remote);
            git(session)
                .args(&["checkout", "--quiet", "--track", "-B"])
                .arg(&name)
                .arg(format!("refs/remotes/{}/{}", remote, name))
        } else if refs.is_local_branch(&name) {
            trace!("{} is a local branch", name);
            git(session).args(&["checkout", "--quiet"]).arg(&name)
        } else {
            trace!("Treating {} as a revision", name);
            git(session)
                .args(&["checkout", "--quiet", "--detach"])
                .arg(&name)
        };

        session.run(checkout)?;
        Ok(())
    })
}

/// Without a tag we stay on the current branch, but it should still catch up
/// with its upstream.
fn follow_upstream(session: &Session) -> Result<(), Error> {
    session.step(OperationKind::Reset, Some(String::from("@{upstream}")), || {
        let upstream = session.execute(git(session).args(&[
            "rev-parse",
            "--abbrev-ref",
            "--symbolic-full-name",
            "@{upstream}",
        ]))?;

        if upstream.status.success() {
            session.run(git(session).args(&["reset", "--hard", "--quiet", "@{upstream}"]))?;
        } else {
            debug!("The current branch has no upstream, leaving it alone");
        }

        Ok(())
    })
}

fn resolve_head(session: &Session) -> Result<String, Error> {
    session.step(OperationKind::ResolveRevision, None, || {
        let output = session.run(git(session).args(&["rev-parse", "HEAD"]))?;
        Ok(output.stdout.trim().to_string())
    })
}

/// The tag to check out, falling back to the default branch when it's blank.
fn repo_tag(tag: &str) -> String {
    let name = tag.trim_end_matches(|c| c == '\r' || c == '\n');

    if name.is_empty() {
        String::from(DEFAULT_BRANCH)
    } else {
        name.to_string()
    }
}

fn list_refs(session: &Session) -> Result<Refs, Error> {
    let output = session.run(git(session).args(&[
        "for-each-ref",
        "--format=%(refname)",
        "refs/heads",
        "refs/remotes",
        "refs/tags",
    ]))?;

    Ok(Refs::parse(&output.stdout))
}

/// The branches and tags in a repository.
#[derive(Debug, Clone, Default, PartialEq)]
struct Refs {
    local: Vec<String>,
    /// `(remote, branch)` pairs.
    remote: Vec<(String, String)>,
    tags: Vec<String>,
}

impl Refs {
    fn parse(for_each_ref: &str) -> Refs {
        let mut refs = Refs::default();

        for line in for_each_ref.lines().map(|l| l.trim()) {
            if let Some(branch) = strip(line, "refs/heads/") {
                refs.local.push(branch.to_string());
            } else if let Some(tag) = strip(line, "refs/tags/") {
                refs.tags.push(tag.to_string());
            } else if let Some(rest) = strip(line, "refs/remotes/") {
                let mut split = rest.splitn(2, '/');
                if let (Some(remote), Some(branch)) = (split.next(), split.next()) {
                    if branch != "HEAD" {
                        refs.remote.push((remote.to_string(), branch.to_string()));
                    }
                }
            }
        }

        refs
    }

    fn is_tag(&self, name: &str) -> bool {
        self.tags.iter().any(|t| t == name)
    }

    fn is_local_branch(&self, name: &str) -> bool {
        self.local.iter().any(|b| b == name)
    }

    fn remote_for(&self, name: &str) -> Option<&str> {
        self.remote
            .iter()
            .find(|&&(_, ref branch)| branch == name)
            .map(|&(ref remote, _)| remote.as_str())
    }

    fn is_branch(&self, name: &str) -> bool {
        self.is_local_branch(name) || self.remote_for(name).is_some()
    }
}

fn strip<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    if line.starts_with(prefix) {
        Some(&line[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepoType;
    use crate::retriever::{Retriever, RetrieverOptions};
    use std::fs;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    /// A repository on disk to act as the remote.
    struct Upstream {
        _temp: TempDir,
        path: std::path::PathBuf,
    }

    impl Upstream {
        fn new() -> Upstream {
            let temp = tempfile::tempdir().unwrap();
            let path = temp.path().join("upstream");
            fs::create_dir(&path).unwrap();

            let upstream = Upstream { _temp: temp, path };
            upstream.git(&["init", "--quiet"]);
            upstream.git(&["symbolic-ref", "HEAD", "refs/heads/master"]);
            upstream.commit("README.md", "# Hello World\n");
            upstream
        }

        fn git(&self, args: &[&str]) -> String {
            let output = Command::new("git")
                .args(&["-c", "user.name=Test", "-c", "user.email=test@example.com"])
                .args(args)
                .current_dir(&self.path)
                .stdin(Stdio::null())
                .output()
                .unwrap();
            assert!(
                output.status.success(),
                "git {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            );
            String::from_utf8(output.stdout).unwrap().trim().to_string()
        }

        fn commit(&self, file: &str, content: &str) -> String {
            fs::write(self.path.join(file), content).unwrap();
            self.git(&["add", "."]);
            self.git(&["commit", "--quiet", "-m", file]);
            self.head()
        }

        fn head(&self) -> String {
            self.git(&["rev-parse", "HEAD"])
        }

        fn repository(&self) -> Repository {
            Repository::new(RepoType::Git, self.path.to_str().unwrap())
        }
    }

    fn retriever(base: &Path) -> Retriever<GitDriver> {
        let mut options = RetrieverOptions::new(base);
        options.max_seconds = Some(60);
        Retriever::new(GitDriver::new(), options)
    }

    fn local_git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .output()
            .unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    fn listing(dir: &Path, ignored: &[&str]) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| !ignored.contains(&name.as_str()))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn parse_refs() {
        let src = "refs/heads/master\n\
                   refs/heads/feature/login\n\
                   refs/remotes/origin/HEAD\n\
                   refs/remotes/origin/master\n\
                   refs/remotes/origin/release/1.0\n\
                   refs/tags/v1.0\n";

        let refs = Refs::parse(src);

        assert_eq!(refs.local, vec!["master", "feature/login"]);
        assert_eq!(
            refs.remote,
            vec![
                (String::from("origin"), String::from("master")),
                (String::from("origin"), String::from("release/1.0")),
            ]
        );
        assert_eq!(refs.tags, vec!["v1.0"]);
        assert_eq!(refs.remote_for("release/1.0"), Some("origin"));
        assert!(refs.is_branch("feature/login"));
        assert!(!refs.is_branch("v1.0"));
        assert!(!refs.is_branch("HEAD"));
    }

    #[test]
    fn blank_tags_mean_the_default_branch() {
        assert_eq!(repo_tag(""), "master");
        assert_eq!(repo_tag("\n"), "master");
        assert_eq!(repo_tag("v1.0\n"), "v1.0");
        assert_eq!(repo_tag("develop"), "develop");
    }

    #[test]
    fn clone_a_repo() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());

        let got = retriever.retrieve(&upstream.repository()).unwrap();

        assert!(got.dir.join(".git").is_dir());
        assert_eq!(got.repository.tag(), Some(upstream.head().as_str()));
        assert_eq!(
            listing(&got.dir, retriever.ignorable_paths()),
            vec!["README.md"]
        );
    }

    #[test]
    fn clone_and_then_update() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("master");

        let first = retriever.retrieve(&repo).unwrap();
        let second = retriever.retrieve(&repo).unwrap();

        assert_eq!(first.repository.tag(), second.repository.tag());
        assert_eq!(first.dir, second.dir);
        assert_eq!(listing(&second.dir, &[".git"]), vec!["README.md"]);
    }

    #[test]
    fn updates_pick_up_new_commits() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("master");
        retriever.retrieve(&repo).unwrap();

        let latest = upstream.commit("second.txt", "more stuff\n");
        let got = retriever.retrieve(&repo).unwrap();

        assert_eq!(got.repository.tag(), Some(latest.as_str()));
        assert!(got.dir.join("second.txt").exists());
    }

    #[test]
    fn updates_without_a_tag_follow_the_default_branch() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        retriever.retrieve(&upstream.repository()).unwrap();

        let latest = upstream.commit("second.txt", "more stuff\n");
        let got = retriever.retrieve(&upstream.repository()).unwrap();

        assert_eq!(got.repository.tag(), Some(latest.as_str()));
    }

    #[test]
    fn local_modifications_are_discarded() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("master");
        let first = retriever.retrieve(&repo).unwrap();
        fs::write(first.dir.join("README.md"), "scribbles").unwrap();

        let second = retriever.retrieve(&repo).unwrap();

        let readme = fs::read_to_string(second.dir.join("README.md")).unwrap();
        assert_eq!(readme, "# Hello World\n");
    }

    #[test]
    fn a_name_which_is_both_a_tag_and_a_branch_is_ambiguous() {
        require_program!("git");

        let upstream = Upstream::new();
        upstream.git(&["tag", "v1"]);
        upstream.git(&["branch", "v1"]);
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("v1");

        let err = retriever.retrieve(&repo).unwrap_err();

        let ambiguous = err.downcast_ref::<AmbiguousReference>().unwrap();
        assert_eq!(ambiguous.name, "v1");
    }

    #[test]
    fn check_out_a_remote_branch() {
        require_program!("git");

        let upstream = Upstream::new();
        upstream.git(&["checkout", "--quiet", "-b", "feature"]);
        let feature = upstream.commit("feature.txt", "new feature\n");
        upstream.git(&["checkout", "--quiet", "master"]);
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("feature");

        let got = retriever.retrieve(&repo).unwrap();

        assert_eq!(got.repository.tag(), Some(feature.as_str()));
        assert!(got.dir.join("feature.txt").exists());
    }

    #[test]
    fn check_out_a_tag_then_follow_it_when_it_moves() {
        require_program!("git");

        let upstream = Upstream::new();
        let original = upstream.head();
        upstream.git(&["tag", "release"]);
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("release");

        let first = retriever.retrieve(&repo).unwrap();
        assert_eq!(first.repository.tag(), Some(original.as_str()));

        let moved = upstream.commit("second.txt", "more stuff\n");
        upstream.git(&["tag", "-f", "release"]);
        let second = retriever.retrieve(&repo).unwrap();

        assert_eq!(second.repository.tag(), Some(moved.as_str()));
    }

    #[test]
    fn check_out_a_literal_revision() {
        require_program!("git");

        let upstream = Upstream::new();
        let first_commit = upstream.head();
        upstream.commit("second.txt", "more stuff\n");
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag(first_commit.as_str());

        let got = retriever.retrieve(&repo).unwrap();

        assert_eq!(got.repository.tag(), Some(first_commit.as_str()));
        assert!(!got.dir.join("second.txt").exists());
    }

    #[test]
    fn tags_deleted_upstream_disappear_locally() {
        require_program!("git");

        let upstream = Upstream::new();
        upstream.git(&["tag", "doomed"]);
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("master");
        let first = retriever.retrieve(&repo).unwrap();
        assert_eq!(local_git(&first.dir, &["tag", "-l"]), "doomed");

        upstream.git(&["tag", "-d", "doomed"]);
        let second = retriever.retrieve(&repo).unwrap();

        assert_eq!(local_git(&second.dir, &["tag", "-l"]), "");
    }

    #[test]
    fn branches_deleted_upstream_are_pruned() {
        require_program!("git");

        let upstream = Upstream::new();
        upstream.git(&["branch", "doomed"]);
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("master");
        let first = retriever.retrieve(&repo).unwrap();
        assert!(local_git(&first.dir, &["branch", "-r"]).contains("origin/doomed"));

        upstream.git(&["branch", "-D", "doomed"]);
        let second = retriever.retrieve(&repo).unwrap();

        assert!(!local_git(&second.dir, &["branch", "-r"]).contains("origin/doomed"));
    }

    #[test]
    fn rewritten_branches_are_followed() {
        require_program!("git");

        let upstream = Upstream::new();
        upstream.git(&["checkout", "--quiet", "-b", "feature"]);
        upstream.commit("feature.txt", "first attempt\n");
        upstream.git(&["checkout", "--quiet", "master"]);
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("feature");
        retriever.retrieve(&repo).unwrap();

        upstream.git(&["checkout", "--quiet", "feature"]);
        upstream.git(&["reset", "--hard", "--quiet", "HEAD~1"]);
        let rewritten = upstream.commit("other.txt", "second attempt\n");
        upstream.git(&["checkout", "--quiet", "master"]);
        let got = retriever.retrieve(&repo).unwrap();

        assert_eq!(got.repository.tag(), Some(rewritten.as_str()));
        assert!(got.dir.join("other.txt").exists());
        assert!(!got.dir.join("feature.txt").exists());
    }

    #[test]
    fn relative_base_directories_work() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::Builder::new().tempdir_in(".").unwrap();
        let base = temp
            .path()
            .strip_prefix(std::env::current_dir().unwrap())
            .unwrap_or(temp.path())
            .to_path_buf();
        assert!(base.is_relative());
        let retriever = retriever(&base);

        let first = retriever.retrieve(&upstream.repository()).unwrap();
        let second = retriever.retrieve(&upstream.repository()).unwrap();

        assert!(first.dir.is_absolute());
        assert!(first.dir.join(".git").is_dir());
        assert_eq!(first.repository.tag(), second.repository.tag());
    }

    #[test]
    fn interrupted_checkouts_are_started_again() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository();
        let dir = retriever.repo_dir(&repo);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("leftover"), "junk").unwrap();

        let got = retriever.retrieve(&repo).unwrap();

        assert_eq!(got.repository.tag(), Some(upstream.head().as_str()));
        assert_eq!(listing(&got.dir, &[".git"]), vec!["README.md"]);
    }

    #[cfg(unix)]
    #[test]
    fn the_ssh_agent_never_outlives_a_retrieval() {
        use crate::process::tests::RecordingRunner;
        use crate::ssh_agent::parse_agent_output;
        use std::sync::Arc;

        require_program!("git");
        require_program!("ssh-agent");
        require_program!("ssh-add");
        require_program!("ssh-keygen");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let key_file = temp.path().join("id_ed25519");
        let status = Command::new("ssh-keygen")
            .args(&["-q", "-t", "ed25519", "-N", "", "-f"])
            .arg(&key_file)
            .stdin(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success());
        let key = fs::read_to_string(&key_file).unwrap();
        let repo = upstream
            .repository()
            .with_credentials(Some(key), None)
            .with_tag("master");
        let missing = repo.with_tag("no-such-branch");

        for (repo, should_succeed) in vec![(repo, true), (missing, false)] {
            let runner = Arc::new(RecordingRunner::default());
            let retriever = retriever(&temp.path().join("checkouts"))
                .with_runner(Arc::clone(&runner));

            let got = retriever.retrieve(&repo);

            assert_eq!(got.is_ok(), should_succeed);
            let calls = runner.calls.lock().unwrap().clone();
            let started = calls
                .iter()
                .find(|&&(ref line, _)| line == "ssh-agent -s")
                .unwrap();
            let (socket, _) = parse_agent_output(&started.1).unwrap();
            assert!(calls.iter().any(|&(ref line, _)| line.starts_with("ssh-add ")));
            assert_eq!(&calls.last().unwrap().0, "ssh-agent -k");

            // the agent removes its socket asynchronously
            let mut gone = false;
            for _ in 0..50 {
                if !Path::new(&socket).exists() {
                    gone = true;
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            assert!(gone, "{} was never cleaned up", socket);
        }
    }

    #[test]
    fn unknown_revisions_fail() {
        require_program!("git");

        let upstream = Upstream::new();
        let temp = tempfile::tempdir().unwrap();
        let retriever = retriever(temp.path());
        let repo = upstream.repository().with_tag("no-such-thing");

        assert!(retriever.retrieve(&repo).is_err());
    }
}
