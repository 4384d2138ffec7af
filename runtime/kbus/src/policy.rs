//! Ownership-based access policy
//!
//! Endpoints carry a file-like `mode`/`uid`/`gid` triple. The bus only
//! enforces these ownership fields; richer policy is left to the
//! transport layer in front of it.
//!
//! | Operation            | Needs                  |
//! |----------------------|------------------------|
//! | attach a connection  | read or write          |
//! | send                 | write                  |
//! | receive a broadcast  | read                   |

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Permission bits of a namespace, bus or endpoint node
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Mode: u32 {
        const OWNER_READ = 0o400;
        const OWNER_WRITE = 0o200;
        const GROUP_READ = 0o040;
        const GROUP_WRITE = 0o020;
        const OTHER_READ = 0o004;
        const OTHER_WRITE = 0o002;
    }
}

impl Mode {
    /// Build a mode from octal permission bits, ignoring execute bits
    pub fn from_octal(bits: u32) -> Self {
        Self::from_bits_truncate(bits)
    }

    /// `rw-------`
    pub const PRIVATE: Self = Self::OWNER_READ.union(Self::OWNER_WRITE);

    /// `rw-rw-rw-`
    pub const WORLD: Self = Self::PRIVATE
        .union(Self::GROUP_READ)
        .union(Self::GROUP_WRITE)
        .union(Self::OTHER_READ)
        .union(Self::OTHER_WRITE);
}

bitflags::bitflags! {
    /// Rights requested from an [`Access`] check
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rights: u32 {
        const READ = 0o4;
        const WRITE = 0o2;
    }
}

/// Identity a connection was opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub const fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Superuser credentials
    pub const ROOT: Self = Self::new(0, 0);
}

/// Ownership fields of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
    pub mode: Mode,
    pub uid: u32,
    pub gid: u32,
}

impl Access {
    pub const fn new(mode: Mode, uid: u32, gid: u32) -> Self {
        Self { mode, uid, gid }
    }

    /// Check `rights` for `creds`; uid 0 is always allowed
    pub fn permits(&self, creds: &Credentials, rights: Rights) -> bool {
        if creds.uid == 0 {
            return true;
        }

        let shift = if creds.uid == self.uid {
            6
        } else if creds.gid == self.gid {
            3
        } else {
            0
        };
        let granted = (self.mode.bits() >> shift) & 0o7;
        granted & rights.bits() == rights.bits()
    }

    /// True if `creds` may attach at all
    pub fn permits_attach(&self, creds: &Credentials) -> bool {
        self.permits(creds, Rights::READ) || self.permits(creds, Rights::WRITE)
    }
}
