//! Polling policies
//!
//! Strongly-typed choices instead of raw strings: which unseen
//! messages a tick processes, and how the transport is secured.

use std::fmt;
use std::str::FromStr;

/// Which unseen messages a single poll tick processes.
///
/// # Examples
///
/// ```
/// use mail_attachment_fetcher::SelectionPolicy;
///
/// let ids = [3, 7, 9];
/// assert_eq!(SelectionPolicy::LatestOnly.select(&ids), &[9]);
/// assert_eq!(SelectionPolicy::AllUnseen.select(&ids), &[3, 7, 9]);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SelectionPolicy {
    /// Only the most recently arrived unseen message.
    ///
    /// Older unseen messages stay unseen on the server and are never
    /// picked up while newer mail keeps arriving.
    #[default]
    LatestOnly,
    /// Every unseen message, oldest first.
    AllUnseen,
}

impl SelectionPolicy {
    /// Narrow an ascending list of unseen ids to the ones to process.
    #[must_use]
    pub fn select(self, unseen: &[u32]) -> &[u32] {
        match self {
            Self::LatestOnly => &unseen[unseen.len().saturating_sub(1)..],
            Self::AllUnseen => unseen,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LatestOnly => "latest",
            Self::AllUnseen => "all",
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "latest" | "latest-only" | "latest_only" => Ok(Self::LatestOnly),
            "all" | "all-unseen" | "all_unseen" => Ok(Self::AllUnseen),
            other => Err(format!("unknown selection policy '{other}'")),
        }
    }
}

/// How the IMAP connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TlsMode {
    /// TLS from the first byte (IMAPS, port 993).
    #[default]
    Implicit,
    /// Plain connect, then upgrade with `STARTTLS` (port 143).
    StartTls,
}

impl TlsMode {
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Implicit => 993,
            Self::StartTls => 143,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Implicit => "implicit",
            Self::StartTls => "starttls",
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "implicit" | "tls" | "imaps" => Ok(Self::Implicit),
            "starttls" => Ok(Self::StartTls),
            other => Err(format!("unknown TLS mode '{other}'")),
        }
    }
}
