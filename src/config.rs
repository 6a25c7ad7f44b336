use crate::repository::RepositoryConfig;
use failure::{Error, ResultExt};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: General,
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct General {
    /// The top-level directory all checkouts should be placed in.
    pub root: PathBuf,
    /// The most output a single git or svn command may produce before it
    /// gets killed.
    #[serde(default)]
    pub max_bytes: Option<u64>,
    /// How long a single git or svn command may run for.
    #[serde(default)]
    pub max_seconds: Option<u64>,
    /// Accept any repository URL, even ones pointing at loopback or private
    /// network addresses.
    ///
    /// Never turn this on for URLs you don't control.
    #[serde(default)]
    pub development: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        debug!("Loading config from {}", path.display());

        let content = fs::read_to_string(path)
            .with_context(|_| format!("Unable to read {}", path.display()))?;

        Config::from_toml(&content)
    }

    /// Parse a config, expanding `~` and environment variables in the root
    /// directory.
    pub fn from_toml(src: &str) -> Result<Config, Error> {
        let mut cfg: Config = toml::from_str(src).context("Invalid config file")?;

        let root = cfg.general.root.to_string_lossy().into_owned();
        let expanded = shellexpand::full(&root)
            .context("Unable to expand the root directory")?;
        cfg.general.root = PathBuf::from(&*expanded);

        Ok(cfg)
    }

    /// Generate an example config.
    pub fn example() -> Config {
        let general = General {
            root: PathBuf::from("~/checkouts"),
            max_bytes: Some(64 * 1024 * 1024),
            max_seconds: Some(15 * 60),
            development: false,
        };

        let git = RepositoryConfig {
            repo_type: String::from("git"),
            url: String::from("https://github.com/rust-lang/log"),
            tag: Some(String::from("master")),
            display_name: Some(String::from("log")),
            ..Default::default()
        };

        let svn = RepositoryConfig {
            repo_type: String::from("svn"),
            url: String::from("https://svn.apache.org/repos/asf/subversion/trunk"),
            display_name: Some(String::from("Subversion")),
            resources_path: vec![String::from("doc")],
            ..Default::default()
        };

        Config {
            general,
            repositories: vec![git, svn],
        }
    }

    pub fn as_toml(&self) -> Result<String, Error> {
        let rendered = toml::to_string_pretty(self).context("Unable to serialize the config")?;
        Ok(rendered)
    }
}
