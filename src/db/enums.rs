use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Network interface the manager daemon listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    #[default]
    Localhost,
    Private,
    Public,
}

impl FromStr for Interface {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "localhost" => Ok(Interface::Localhost),
            "private" => Ok(Interface::Private),
            "public" => Ok(Interface::Public),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Interface::Localhost => "localhost",
            Interface::Private => "private",
            Interface::Public => "public",
        };
        write!(f, "{s}")
    }
}

/// Server edition behind a manager endpoint.
///
/// The libev edition answers `ping` with per-port counters and supports the
/// undocumented `list` command. The python edition only acknowledges `ping`
/// and cannot list its ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerEdition {
    #[default]
    Libev,
    Python,
}

impl ServerEdition {
    pub fn supports_list(self) -> bool {
        matches!(self, ServerEdition::Libev)
    }
}

impl fmt::Display for ServerEdition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerEdition::Libev => "libev",
            ServerEdition::Python => "python",
        };
        write!(f, "{s}")
    }
}
