//! Miner addresses and the resolver that expands address expressions.
//!
//! An expression is a comma separated list of groups. Each group is a single
//! host, a host with a port, or an inclusive IPv4 range with an optional port:
//!
//! ```text
//! 10.0.0.1
//! 10.0.0.1:4028
//! 10.0.0.1-10.0.0.9
//! 10.0.0.1:4028-10.0.0.9        (also 10.0.0.1:4028:10.0.0.9)
//! 10.0.0.1-10.0.0.9:4028        (also 10.0.0.1:10.0.0.9:4028)
//! 10.0.0.1:4028-10.0.0.9:4028
//! miner.local:4028
//! ```
//!
//! Groups are parsed only when the iterator reaches them, so a malformed group
//! fails at iteration time without poisoning the groups before it.

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::MinerError;

/// A (host, port) pair identifying one miner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host[:port]`, falling back to `default_port`.
    pub fn parse_with_default(txt: &str, default_port: u16) -> Result<Self, MinerError> {
        match parse_expr(txt)? {
            Group::Single { host, port } => Ok(Address::new(host, port.unwrap_or(default_port))),
            Group::Range { .. } => Err(MinerError::address_parsing(
                txt,
                "expected a single address, found a range",
            )),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = MinerError;

    /// Parses `host:port`; the port is mandatory.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_expr(s)? {
            Group::Single {
                host,
                port: Some(port),
            } => Ok(Address::new(host, port)),
            Group::Single { port: None, .. } => {
                Err(MinerError::address_parsing(s, "missing port"))
            }
            Group::Range { .. } => Err(MinerError::address_parsing(
                s,
                "expected a single address, found a range",
            )),
        }
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Address::new(host, port)
    }
}

/// What to do with a malformed group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParsePolicy {
    /// Yield the error for the offending group.
    #[default]
    Strict,
    /// Skip the offending group and keep going.
    Lenient,
}

/// One parsed group of an address expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    Single {
        host: String,
        port: Option<u16>,
    },
    Range {
        start: Ipv4Addr,
        end: Ipv4Addr,
        port: Option<u16>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Ip,
    Sep,
    Div,
    Port,
    Host,
}

static TOKENS: Lazy<Vec<(Token, Regex)>> = Lazy::new(|| {
    [
        (Token::Ip, r"^\d{1,3}(?:\.\d{1,3}){3}"),
        (Token::Sep, r"^:"),
        (Token::Div, r"^-"),
        (Token::Port, r"^\d+"),
        (Token::Host, r"^[^:]+"),
    ]
    .into_iter()
    .filter_map(|(token, pattern)| Regex::new(pattern).ok().map(|re| (token, re)))
    .collect()
});

fn tokenize<'a>(input: &str, txt: &'a str) -> Result<Vec<(Token, &'a str)>, MinerError> {
    let mut rest = txt;
    let mut tokens = Vec::new();
    while !rest.is_empty() {
        let (token, len) = TOKENS
            .iter()
            .find_map(|(token, re)| re.find(rest).map(|m| (*token, m.end())))
            .ok_or_else(|| MinerError::address_parsing(input, "unexpected character"))?;
        tokens.push((token, &rest[..len]));
        rest = &rest[len..];
    }
    Ok(tokens)
}

fn parse_ip(input: &str, txt: &str) -> Result<Ipv4Addr, MinerError> {
    Ipv4Addr::from_str(txt)
        .map_err(|_| MinerError::address_parsing(input, format!("invalid ipv4 address '{txt}'")))
}

fn parse_port(input: &str, txt: &str) -> Result<u16, MinerError> {
    txt.parse::<u16>()
        .map_err(|_| MinerError::address_parsing(input, format!("invalid port '{txt}'")))
}

/// Parses a single group (no `,`) of an address expression.
pub fn parse_expr(txt: &str) -> Result<Group, MinerError> {
    let compact = txt.replace(' ', "");
    if compact.is_empty() {
        return Err(MinerError::address_parsing(txt, "empty address"));
    }
    let tokens = tokenize(txt, &compact)?;
    let kinds = tokens.iter().map(|(kind, _)| *kind).collect::<Vec<_>>();
    let value = |idx: usize| tokens[idx].1;

    use Token::*;
    let range = |start: usize, end: usize, port: Option<u16>| -> Result<Group, MinerError> {
        Ok(Group::Range {
            start: parse_ip(txt, value(start))?,
            end: parse_ip(txt, value(end))?,
            port,
        })
    };

    match kinds.as_slice() {
        [Ip] => Ok(Group::Single {
            host: parse_ip(txt, value(0))?.to_string(),
            port: None,
        }),
        [Host] => Ok(Group::Single {
            host: value(0).to_string(),
            port: None,
        }),
        [Ip, Sep, Port] => Ok(Group::Single {
            host: parse_ip(txt, value(0))?.to_string(),
            port: Some(parse_port(txt, value(2))?),
        }),
        [Host, Sep, Port] => Ok(Group::Single {
            host: value(0).to_string(),
            port: Some(parse_port(txt, value(2))?),
        }),
        [Ip, Sep | Div, Ip] => range(0, 2, None),
        [Ip, Sep, Port, Div | Sep, Ip] => range(0, 4, Some(parse_port(txt, value(2))?)),
        [Ip, Div | Sep, Ip, Sep, Port] => range(0, 2, Some(parse_port(txt, value(4))?)),
        [Ip, Sep, Port, Div | Sep, Ip, Sep, Port] => {
            let first = parse_port(txt, value(2))?;
            let second = parse_port(txt, value(6))?;
            if first != second {
                return Err(MinerError::address_parsing(
                    txt,
                    format!("ports mismatch {first} != {second}"),
                ));
            }
            range(0, 4, Some(first))
        }
        _ => Err(MinerError::address_parsing(txt, "unrecognised address syntax")),
    }
}

/// A reusable address expression; every call to [`iter`](Self::iter) walks it
/// again from the start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpRangeSpec {
    text: String,
    default_port: u16,
    policy: ParsePolicy,
}

impl IpRangeSpec {
    pub fn new(text: impl Into<String>, default_port: u16) -> Self {
        Self {
            text: text.into(),
            default_port,
            policy: ParsePolicy::Strict,
        }
    }

    pub fn with_policy(mut self, policy: ParsePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn iter(&self) -> IpRanges {
        IpRanges::new(&self.text, self.default_port, self.policy)
    }
}

impl IntoIterator for &IpRangeSpec {
    type Item = Result<Address, MinerError>;
    type IntoIter = IpRanges;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy iterator over the addresses of an expression.
#[derive(Debug, Clone)]
pub struct IpRanges {
    groups: std::vec::IntoIter<String>,
    default_port: u16,
    policy: ParsePolicy,
    current: Option<(RangeInclusive<u32>, u16)>,
}

impl IpRanges {
    fn new(text: &str, default_port: u16, policy: ParsePolicy) -> Self {
        let groups = text
            .replace(' ', "")
            .split(',')
            .filter(|group| !group.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        Self {
            groups: groups.into_iter(),
            default_port,
            policy,
            current: None,
        }
    }
}

impl Iterator for IpRanges {
    type Item = Result<Address, MinerError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((range, port)) = self.current.as_mut() {
                if let Some(ip) = range.next() {
                    return Some(Ok(Address::new(Ipv4Addr::from(ip).to_string(), *port)));
                }
                self.current = None;
            }

            let group = self.groups.next()?;
            match parse_expr(&group) {
                Ok(Group::Single { host, port }) => {
                    return Some(Ok(Address::new(host, port.unwrap_or(self.default_port))));
                }
                Ok(Group::Range { start, end, port }) => {
                    self.current = Some((
                        u32::from(start)..=u32::from(end),
                        port.unwrap_or(self.default_port),
                    ));
                }
                Err(err) => match self.policy {
                    ParsePolicy::Strict => return Some(Err(err)),
                    ParsePolicy::Lenient => {
                        debug!("Skipping malformed address group '{}': {}", group, err);
                    }
                },
            }
        }
    }
}

/// Lazily expands `txt` into addresses, using `default_port` where a group
/// names none. Malformed groups yield an error item.
pub fn iter_ip_ranges(txt: &str, default_port: u16) -> IpRanges {
    IpRanges::new(txt, default_port, ParsePolicy::Strict)
}

/// Eagerly expands `txt`, failing on the first malformed group.
pub fn ip_ranges(txt: &str, default_port: u16) -> Result<Vec<Address>, MinerError> {
    iter_ip_ranges(txt, default_port).collect()
}

/// Parses the contents of an address list file.
///
/// `#` starts a comment, blank lines and a `hostname` header are ignored, and
/// each remaining line is an address expression.
pub fn parse_address_list(
    content: &str,
    default_port: u16,
    policy: ParsePolicy,
) -> Result<Vec<Address>, MinerError> {
    let mut result = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() || line.eq_ignore_ascii_case("hostname") {
            continue;
        }
        for address in IpRanges::new(line, default_port, policy) {
            result.push(address?);
        }
    }
    Ok(result)
}

/// Loads addresses from a csv-like file with one `host[:port]` (or range)
/// per line.
pub fn load_addresses_from_csv(
    path: impl AsRef<Path>,
    default_port: u16,
    policy: ParsePolicy,
) -> Result<Vec<Address>, MinerError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let addresses = parse_address_list(&content, default_port, policy)?;
    debug!("Loaded {} addresses from {}", addresses.len(), path.display());
    Ok(addresses)
}
