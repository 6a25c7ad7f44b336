use crate::config::Config;
use crate::errors::RetrieverUnavailable;
use crate::git::GitDriver;
use crate::registry::{Registry, Validation};
use crate::repository::{RepoType, Repository, RepositoryConfig};
use crate::retriever::{Retrieval, Retriever, RetrieverOptions};
use crate::svn::SvnDriver;
use failure::Error;
use std::io::Write;

/// Retrieves every repository mentioned in a [`Config`].
#[derive(Debug)]
pub struct Driver {
    config: Config,
    registry: Registry,
    git: Retriever<GitDriver>,
    svn: Retriever<SvnDriver>,
}

impl Driver {
    /// Use the standard repository types, validating URLs unless the config
    /// says we're in development mode.
    pub fn with_config(config: Config) -> Driver {
        let validation = if config.general.development {
            warn!("Development mode is on, repository URLs won't be validated");
            Validation::Skipped
        } else {
            Validation::default()
        };

        Driver::new(config, Registry::standard(validation))
    }

    pub fn new(config: Config, registry: Registry) -> Driver {
        let options = RetrieverOptions {
            max_bytes: config.general.max_bytes,
            max_seconds: config.general.max_seconds,
            base_dir: config.general.root.clone(),
        };

        Driver {
            git: Retriever::new(GitDriver::new(), options.clone()),
            svn: Retriever::new(SvnDriver::new(), options),
            config,
            registry,
        }
    }

    pub fn run(&self) -> Result<Vec<Retrieval>, Error> {
        info!("Updating {} repositories", self.config.repositories.len());
        let mut retrieved = Vec::new();
        let mut errors = Vec::new();

        for cfg in &self.config.repositories {
            let name = name_of(cfg);

            match self.update_repo(cfg) {
                Ok(retrieval) => retrieved.push(retrieval),
                Err(e) => {
                    warn!("Updating {} failed, {}", name, e);
                    errors.push((name, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(retrieved)
        } else {
            Err(UpdateFailure { errors }.into())
        }
    }

    pub fn update_repo(&self, cfg: &RepositoryConfig) -> Result<Retrieval, Error> {
        let repository = self.registry.from_config(cfg.clone())?;
        debug!("Updating {}", repository);

        let retrieval = self.retrieve(&repository)?;
        if let Some(revision) = retrieval.repository.revision() {
            info!("{} is at {}", name_of(cfg), revision);
        }

        Ok(retrieval)
    }

    fn retrieve(&self, repository: &Repository) -> Result<Retrieval, Error> {
        match repository.repo_type() {
            RepoType::Git => self.git.retrieve(repository),
            RepoType::Svn => self.svn.retrieve(repository),
            other => Err(RetrieverUnavailable {
                tool: other.to_string(),
                reason: format!("{} repositories can't be checked out", other),
            }
            .into()),
        }
    }
}

fn name_of(cfg: &RepositoryConfig) -> String {
    cfg.display_name.clone().unwrap_or_else(|| cfg.url.clone())
}

#[derive(Debug, Fail)]
#[fail(display = "One or more errors encountered while updating repos")]
pub struct UpdateFailure {
    errors: Vec<(String, Error)>,
}

impl UpdateFailure {
    pub fn errors(&self) -> &[(String, Error)] {
        &self.errors
    }

    pub fn display<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writeln!(
            writer,
            "There were {} errors updating repositories",
            self.errors.len()
        )?;

        for &(ref name, ref err) in &self.errors {
            writeln!(writer, "Error: {} failed with {}", name, err)?;
            for cause in err.iter_chain().skip(1) {
                writeln!(writer, "\tCaused By: {}", cause)?;
            }
        }

        Ok(())
    }
}
