//! The description of a single repository we want to retrieve.

use crate::uri;
use failure::Error;
use sec::Secret;
use sha1::{Digest, Sha1};
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use url::Url;

/// Bumped whenever the on-disk layout of retrieved repositories changes, so
/// old checkouts are never mistaken for new ones.
pub const PROTOCOL_VERSION: u32 = 1;

/// The kinds of repository we know about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Git,
    Svn,
    Download,
    Mock,
}

impl RepoType {
    pub fn as_str(&self) -> &'static str {
        match *self {
            RepoType::Git => "git",
            RepoType::Svn => "svn",
            RepoType::Download => "download",
            RepoType::Mock => "mock",
        }
    }
}

impl Display for RepoType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The raw, unvalidated settings for a repository, as they appear in a
/// config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RepositoryConfig {
    pub repo_type: String,
    pub url: String,
    /// A username, or the SSH private key for git repositories.
    pub first_credential: Option<Secret<String>>,
    /// A password.
    pub second_credential: Option<Secret<String>>,
    /// The branch, tag or revision to check out.
    pub tag: Option<String>,
    /// Human readable name used in progress reports.
    pub display_name: Option<String>,
    /// Subdirectories in the repository to search for resources.
    pub resources_path: Vec<String>,
}

/// A repository to retrieve.
///
/// Two repositories are equal when they point at the same place *and* the
/// same tag. Use [`Repository::equal_repo()`] to ignore the tag.
#[derive(Debug, Clone)]
pub struct Repository {
    repo_type: RepoType,
    url: String,
    first_credential: Option<Secret<String>>,
    second_credential: Option<Secret<String>>,
    tag: Option<String>,
    display_name: Option<String>,
    resources_path: Vec<String>,
}

impl Repository {
    pub fn new<S: Into<String>>(repo_type: RepoType, url: S) -> Repository {
        Repository {
            repo_type,
            url: url.into(),
            first_credential: None,
            second_credential: None,
            tag: None,
            display_name: None,
            resources_path: Vec::new(),
        }
    }

    /// Copy the settings from a config entry, throwing away any credentials
    /// which are blank.
    pub fn from_config(repo_type: RepoType, cfg: RepositoryConfig) -> Repository {
        Repository {
            repo_type,
            url: cfg.url,
            first_credential: useful_part(cfg.first_credential),
            second_credential: useful_part(cfg.second_credential),
            tag: cfg.tag,
            display_name: cfg.display_name,
            resources_path: cfg.resources_path,
        }
    }

    pub fn repo_type(&self) -> RepoType {
        self.repo_type
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn first_credential(&self) -> Option<&str> {
        self.first_credential.as_ref().map(|c| c.reveal().as_str())
    }

    pub fn second_credential(&self) -> Option<&str> {
        self.second_credential.as_ref().map(|c| c.reveal().as_str())
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_ref().map(|t| t.as_str())
    }

    /// The revision this repository is currently looking at.
    pub fn revision(&self) -> Option<&str> {
        self.tag()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_ref().map(|n| n.as_str())
    }

    pub fn resources_path(&self) -> &[String] {
        &self.resources_path
    }

    /// A copy of this repository pointing at a different tag.
    pub fn with_tag<S: Into<String>>(&self, tag: S) -> Repository {
        Repository {
            tag: Some(tag.into()),
            ..self.clone()
        }
    }

    pub fn with_credentials(
        self,
        first: Option<String>,
        second: Option<String>,
    ) -> Repository {
        Repository {
            first_credential: useful_part(first.map(Secret::new)),
            second_credential: useful_part(second.map(Secret::new)),
            ..self
        }
    }

    /// A unique identifier for the repository, ignoring the tag to check out.
    pub fn repository_hash(&self) -> String {
        digest(&format!(
            "{}\0{}\0{}",
            PROTOCOL_VERSION, self.repo_type, self.url
        ))
    }

    /// A unique identifier for this particular tag of the repository.
    pub fn checkout_hash(&self) -> String {
        digest(&format!(
            "{}\0{}\0{}\0{}",
            PROTOCOL_VERSION,
            self.repo_type,
            self.url,
            self.tag().unwrap_or_default()
        ))
    }

    /// Do both repositories point at the same place, regardless of tag?
    pub fn equal_repo(&self, other: &Repository) -> bool {
        self.repository_hash() == other.repository_hash()
    }

    /// The URL which completely characterises this repository.
    ///
    /// Downloads get their credentials embedded. Git and Subversion
    /// credentials are handed to the client out-of-band, so those get the
    /// bare URL (SCP-style references are rewritten as `ssh://` URLs).
    pub fn to_url(&self) -> Result<Url, Error> {
        match self.repo_type {
            RepoType::Download => uri::add_users_to(
                &self.url,
                self.first_credential(),
                self.second_credential(),
            ),
            _ => uri::add_users_to(&self.url, None, None),
        }
    }
}

impl PartialEq for Repository {
    fn eq(&self, other: &Repository) -> bool {
        self.checkout_hash() == other.checkout_hash()
    }
}

impl Eq for Repository {}

impl Hash for Repository {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.checkout_hash().hash(state);
    }
}

impl Display for Repository {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.repo_type {
            RepoType::Mock => write!(
                f,
                "mock {}:{}",
                self.url,
                self.tag().unwrap_or_default()
            ),
            other => write!(f, "{} {}", other, self.url),
        }
    }
}

pub fn git(cfg: RepositoryConfig) -> Repository {
    Repository::from_config(RepoType::Git, cfg)
}

pub fn svn(cfg: RepositoryConfig) -> Repository {
    Repository::from_config(RepoType::Svn, cfg)
}

pub fn download(cfg: RepositoryConfig) -> Repository {
    Repository::from_config(RepoType::Download, cfg)
}

/// Only meant for testing, so it isn't part of the standard registry.
pub fn mock(cfg: RepositoryConfig) -> Repository {
    Repository::from_config(RepoType::Mock, cfg)
}

/// A credential is only useful if it has something other than whitespace.
fn useful_part(credential: Option<Secret<String>>) -> Option<Secret<String>> {
    credential
        .map(|c| c.reveal().trim().to_string())
        .filter(|c| !c.is_empty())
        .map(Secret::new)
}

fn digest(text: &str) -> String {
    hex::encode(Sha1::digest(text.as_bytes()))
}
