//! Git smart-HTTP protocol helpers
//!
//! Service negotiation, pkt-line framing of the ref advertisement and
//! validation of the `Git-Protocol` header.

use std::fmt;
use std::sync::LazyLock;
use regex::Regex;

use crate::error::{Error, Result};

/// Flush packet terminating the advertisement header
pub const FLUSH_PKT: &[u8] = b"0000";

/// `key=value` pairs joined by `:`, alphanumeric only
static GIT_PROTOCOL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-zA-Z]+=[0-9a-zA-Z]+(:[0-9a-zA-Z]+=[0-9a-zA-Z]+)*$")
        .expect("static Git-Protocol pattern")
});

/// Git services served over smart HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitService {
    UploadPack,
    ReceivePack,
}

impl GitService {
    /// Parse the `service` query value of `/info/refs` (`git-upload-pack`)
    pub fn from_query(value: &str) -> Result<Self> {
        match value.strip_prefix("git-") {
            Some(short) => Self::from_short(short),
            None => Err(Error::ServiceNotAllowed(value.to_string())),
        }
    }

    /// Parse a short service name (`upload-pack`)
    pub fn from_short(value: &str) -> Result<Self> {
        match value {
            "upload-pack" => Ok(GitService::UploadPack),
            "receive-pack" => Ok(GitService::ReceivePack),
            other => Err(Error::ServiceNotAllowed(other.to_string())),
        }
    }

    /// Short name, also the executor subcommand
    pub fn short_name(&self) -> &'static str {
        match self {
            GitService::UploadPack => "upload-pack",
            GitService::ReceivePack => "receive-pack",
        }
    }

    /// Full service name as it appears on the wire
    pub fn name(&self) -> String {
        format!("git-{}", self.short_name())
    }

    pub fn advertisement_content_type(&self) -> String {
        format!("application/x-git-{}-advertisement", self.short_name())
    }

    pub fn request_content_type(&self) -> String {
        format!("application/x-git-{}-request", self.short_name())
    }

    pub fn result_content_type(&self) -> String {
        format!("application/x-git-{}-result", self.short_name())
    }

    /// Reject requests whose body type does not belong to this service
    pub fn check_request_content_type(&self, actual: Option<&str>) -> Result<()> {
        let expected = self.request_content_type();
        match actual {
            Some(actual) if actual == expected => Ok(()),
            other => Err(Error::ContentTypeMismatch {
                expected,
                actual: other.unwrap_or_default().to_string(),
            }),
        }
    }
}

impl fmt::Display for GitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git-{}", self.short_name())
    }
}

/// Frame `payload` as a pkt-line.
///
/// The length prefix counts itself and is written in lowercase hex, padded
/// with zeros to a multiple of four digits.
pub fn packet_line(payload: &[u8]) -> Vec<u8> {
    let length = format!("{:x}", payload.len() + 4);
    let width = length.len().div_ceil(4) * 4;

    let mut line = Vec::with_capacity(width + payload.len());
    line.extend(std::iter::repeat(b'0').take(width - length.len()));
    line.extend_from_slice(length.as_bytes());
    line.extend_from_slice(payload);
    line
}

/// Header sent before the executor's ref advertisement
pub fn advertisement_header(service: GitService) -> Vec<u8> {
    let mut header = packet_line(format!("# service={}\n", service).as_bytes());
    header.extend_from_slice(FLUSH_PKT);
    header
}

/// Whether a `Git-Protocol` header value may be forwarded to the executor
pub fn valid_git_protocol(value: &str) -> bool {
    GIT_PROTOCOL.is_match(value)
}
