use crate::process::{Invocation, ProcessRunner};
use failure::{Error, ResultExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;

static AUTH_SOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SSH_AUTH_SOCK=([^;\s]+);").expect("valid regex"));
static AGENT_PID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SSH_AGENT_PID=(\d+);").expect("valid regex"));

/// A private `ssh-agent` which lives exactly as long as this value.
///
/// The agent is killed when the `SshAgent` is dropped, so keys added to it
/// can't outlive the retrieval they were meant for.
pub struct SshAgent<'r> {
    runner: &'r dyn ProcessRunner,
    socket: String,
    pid: String,
}

impl<'r> SshAgent<'r> {
    pub fn start(runner: &'r dyn ProcessRunner) -> Result<SshAgent<'r>, Error> {
        let output = runner
            .run(&Invocation::new("ssh-agent").arg("-s"))
            .context("Unable to start ssh-agent")?;

        let (socket, pid) = parse_agent_output(&output.stdout).ok_or_else(|| {
            failure::err_msg("Unable to understand the output of ssh-agent")
        })?;
        debug!("Started ssh-agent (pid {}) listening on {}", pid, socket);

        Ok(SshAgent {
            runner,
            socket,
            pid,
        })
    }

    /// The environment variables a child process needs to talk to this agent.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (String::from("SSH_AUTH_SOCK"), self.socket.clone()),
            (String::from("SSH_AGENT_PID"), self.pid.clone()),
        ]
    }

    pub fn socket(&self) -> &str {
        &self.socket
    }

    /// Give the agent a private key.
    pub fn add_key(&self, key: &str) -> Result<(), Error> {
        // tempfile creates this readable by us alone, which ssh-add insists on
        let mut file = tempfile::NamedTempFile::new()
            .context("Unable to create a temporary file for the key")?;
        file.write_all(key.as_bytes())?;
        if !key.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;

        let invocation = Invocation::new("ssh-add")
            .arg(file.path())
            .envs(self.env())
            .env("SSH_ASKPASS", "/bin/false");

        self.runner
            .run(&invocation)
            .context("Unable to add the key to ssh-agent")?;

        Ok(())
    }
}

impl<'r> Drop for SshAgent<'r> {
    fn drop(&mut self) {
        let invocation = Invocation::new("ssh-agent").arg("-k").envs(self.env());

        match self.runner.run(&invocation) {
            Ok(_) => debug!("Stopped ssh-agent (pid {})", self.pid),
            Err(e) => warn!("Unable to stop ssh-agent (pid {}), {}", self.pid, e),
        }
    }
}

pub(crate) fn parse_agent_output(stdout: &str) -> Option<(String, String)> {
    let socket = AUTH_SOCK.captures(stdout)?[1].to_string();
    let pid = AGENT_PID.captures(stdout)?[1].to_string();

    Some((socket, pid))
}
