//! Vetting repository URLs before we go anywhere near them.
//!
//! A retriever running inside a cloud host must never be talked into fetching
//! from the metadata service or the internal network, so every URL is resolved
//! and each address it maps to is checked against a blocklist.

use crate::errors::InvalidRepository;
use failure::Error;
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::Arc;
use url::{Host, Url};

/// The port assumed for SCP-style (`user@host:path`) references.
pub const SSH_PORT: u16 = 22;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ftp"];

/// Everything which isn't allowed in a URL, plus `:`, `@`, `/`, `?` and `#`
/// so usernames and passwords survive a round trip.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b';')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b',');

static SCP_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^((?:[A-Za-z0-9\-_.!~*'()]|%[0-9A-Fa-f]{2})*)@([A-Za-z0-9.\-]+|\[[0-9A-Fa-f:.]+\]):(.+)$",
    )
    .expect("the SCP pattern is valid")
});

/// Something which can turn a host name into the addresses it points at.
pub trait Resolve: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        (**self).resolve(host, port)
    }
}

/// Resolve hosts using the platform's resolver.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        let addresses = (host, port).to_socket_addrs()?;
        Ok(addresses.map(|addr| addr.ip()).collect())
    }
}

/// Checks that a repository URL is something we're allowed to retrieve.
pub struct UriValidator {
    resolver: Box<dyn Resolve>,
}

impl UriValidator {
    pub fn new<R: Resolve + 'static>(resolver: R) -> UriValidator {
        UriValidator {
            resolver: Box::new(resolver),
        }
    }

    /// Make sure `url` uses a scheme we understand (or is an SCP-style
    /// reference) and that none of the addresses its host resolves to are
    /// off limits.
    pub fn validate(&self, url: &str) -> Result<(), Error> {
        match Url::parse(url) {
            Ok(parsed) => {
                if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
                    let reason = format!(
                        "don't know how to interpret scheme {}",
                        parsed.scheme()
                    );
                    return Err(InvalidRepository::new(url, reason).into());
                }

                let host = parsed
                    .host()
                    .ok_or_else(|| InvalidRepository::new(url, "no host"))?
                    .to_owned();
                let port = parsed.port_or_known_default().unwrap_or(80);

                self.check_host(url, &host, port)
            }
            Err(e) => match ScpReference::parse(url) {
                Some(scp) => self.check_host(url, &scp.host, SSH_PORT),
                None => Err(InvalidRepository::new(url, e.to_string()).into()),
            },
        }
    }

    fn check_host(
        &self,
        url: &str,
        host: &Host<String>,
        port: u16,
    ) -> Result<(), Error> {
        let addresses = match *host {
            Host::Ipv4(ip) => vec![IpAddr::V4(ip)],
            Host::Ipv6(ip) => vec![IpAddr::V6(ip)],
            Host::Domain(ref name) => {
                self.resolver.resolve(name, port).unwrap_or_else(|e| {
                    debug!("Unable to resolve {}:{}, {}", name, port, e);
                    Vec::new()
                })
            }
        };

        if addresses.is_empty() {
            let reason = format!("no hosts for {}:{}", host, port);
            return Err(InvalidRepository::new(url, reason).into());
        }

        for address in addresses {
            trace!("{} resolved to {}", host, address);

            if is_forbidden(address) {
                warn!("Rejecting {} because {} resolves to {}", url, host, address);
                let reason = format!("{} is not a permitted address", address);
                return Err(InvalidRepository::new(url, reason).into());
            }
        }

        Ok(())
    }
}

impl Default for UriValidator {
    fn default() -> UriValidator {
        UriValidator::new(SystemResolver)
    }
}

impl Debug for UriValidator {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("UriValidator").finish()
    }
}

/// Is this an address a repository must never resolve to?
///
/// IPv4-mapped IPv6 addresses are checked as the IPv4 address they carry.
pub fn is_forbidden(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(ip) => is_forbidden_v4(ip),
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(mapped) => is_forbidden_v4(mapped),
            None => is_forbidden_v6(ip),
        },
    }
}

fn is_forbidden_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();

    // 169.254/16 includes the metadata service at 169.254.169.254
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || octets[0] == 0
}

fn is_forbidden_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;

    ip.is_loopback() || ip.is_unspecified() || unique_local || link_local
}

/// A git-style `user@host:path` reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ScpReference {
    pub user: String,
    pub host: Host<String>,
    pub path: String,
}

impl ScpReference {
    pub fn parse(reference: &str) -> Option<ScpReference> {
        let captures = SCP_REFERENCE.captures(reference)?;
        let host = Host::parse(&captures[2]).ok()?;

        Some(ScpReference {
            user: captures[1].to_string(),
            host,
            path: captures[3].to_string(),
        })
    }

    /// The equivalent `ssh://` URL, using `userinfo` in place of the user.
    fn to_ssh_url(&self, userinfo: &str) -> Result<Url, Error> {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };

        let url = Url::parse(&format!("ssh://{}@{}{}", userinfo, self.host, path))?;
        Ok(url)
    }
}

/// Percent-encode a username or password so it can be embedded in a URL.
pub fn encode_userinfo(raw: &str) -> String {
    utf8_percent_encode(raw, USERINFO).to_string()
}

/// Embed a username (and optionally a password) in `uri`.
///
/// SCP-style references are turned into an `ssh://` URL where the reference's
/// own user stays the user and `username` becomes the password component.
pub fn add_users_to(
    uri: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<Url, Error> {
    let mut url = match Url::parse(uri) {
        Ok(url) => url,
        Err(e) => {
            let scp = ScpReference::parse(uri)
                .ok_or_else(|| InvalidRepository::new(uri, e.to_string()))?;

            let mut userinfo = scp.user.clone();
            if let Some(name) = username {
                userinfo.push(':');
                userinfo.push_str(&encode_userinfo(name));
            }

            return scp.to_ssh_url(&userinfo);
        }
    };

    if let Some(name) = username {
        url.set_username(&encode_userinfo(name)).map_err(|_| {
            InvalidRepository::new(uri, "this URL can't carry a username")
        })?;

        if let Some(pass) = password {
            url.set_password(Some(&encode_userinfo(pass))).map_err(|_| {
                InvalidRepository::new(uri, "this URL can't carry a password")
            })?;
        }
    }

    Ok(url)
}
