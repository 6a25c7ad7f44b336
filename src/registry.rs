use crate::errors::UnknownRepositoryType;
use crate::repository::{self, Repository, RepositoryConfig};
use crate::uri::UriValidator;
use failure::Error;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

/// Something which turns a config entry into a [`Repository`].
pub type Constructor = fn(RepositoryConfig) -> Repository;

/// Whether repository URLs get checked before being accepted.
#[derive(Debug)]
pub enum Validation {
    Enforced(UriValidator),
    /// Trust every URL. Only ever use this during development, it turns off
    /// the protection against requests to internal network addresses.
    Skipped,
}

impl Default for Validation {
    fn default() -> Validation {
        Validation::Enforced(UriValidator::default())
    }
}

/// The lookup table from a repository type's name to its constructor.
pub struct Registry {
    constructors: HashMap<String, Constructor>,
    validation: Validation,
}

impl Registry {
    pub fn new<I, S>(registrations: I, validation: Validation) -> Registry
    where
        I: IntoIterator<Item = (S, Constructor)>,
        S: Into<String>,
    {
        let constructors = registrations
            .into_iter()
            .map(|(name, ctor)| (name.into(), ctor))
            .collect();

        Registry {
            constructors,
            validation,
        }
    }

    /// A registry which knows about git, svn and download repositories.
    pub fn standard(validation: Validation) -> Registry {
        Registry::new(standard_registrations(), validation)
    }

    pub fn register<S: Into<String>>(&mut self, repo_type: S, ctor: Constructor) {
        self.constructors.insert(repo_type.into(), ctor);
    }

    pub fn repo_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.constructors.keys().map(|k| k.as_str()).collect();
        names.sort();
        names
    }

    /// Create the [`Repository`] a config entry describes, making sure its
    /// URL is safe to retrieve.
    pub fn from_config(&self, cfg: RepositoryConfig) -> Result<Repository, Error> {
        let ctor = self.constructors.get(&cfg.repo_type).ok_or_else(|| {
            UnknownRepositoryType {
                repo_type: cfg.repo_type.clone(),
            }
        })?;

        match self.validation {
            Validation::Enforced(ref validator) => validator.validate(&cfg.url)?,
            Validation::Skipped => {
                trace!("Skipping validation of {}", cfg.url);
            }
        }

        Ok(ctor(cfg))
    }
}

impl Debug for Registry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("repo_types", &self.repo_types())
            .field("validation", &self.validation)
            .finish()
    }
}

pub fn standard_registrations() -> Vec<(&'static str, Constructor)> {
    vec![
        ("git", repository::git as Constructor),
        ("svn", repository::svn as Constructor),
        ("download", repository::download as Constructor),
    ]
}
