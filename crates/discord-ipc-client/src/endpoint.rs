//! IPC endpoint discovery.
//!
//! Discord exposes `discord-ipc-{0..9}` in its runtime directory. Sandboxed
//! installs (Flatpak, Snap) put the socket in a sub-directory instead.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::{ClientError, ClientResult};

/// Highest endpoint slot Discord binds.
pub const MAX_SLOT: u8 = 9;

/// Endpoint file name prefix; the slot number is appended.
pub const ENDPOINT_PREFIX: &str = "discord-ipc-";

/// Sub-directories of the runtime directory searched on Unix.
#[cfg(unix)]
const UNIX_SUBDIRS: &[&str] = &[
    ".",
    "app/com.discordapp.Discord",
    "app/com.discordapp.DiscordCanary",
    "app/com.discordapp.DiscordPTB",
    "snap.discord",
    ".flatpak/dev.vencord.Vesktop/xdg-run",
];

/// Environment variables consulted, in order, for the runtime directory.
#[cfg(unix)]
const RUNTIME_DIR_VARS: &[&str] = &["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"];

/// Turns an optional slot into a local endpoint path.
pub trait EndpointResolver: Send + Sync {
    /// Returns the first existing endpoint, or `None` when nothing is listening.
    fn resolve(&self, slot: Option<u8>) -> Option<PathBuf>;
}

/// Resolver probing the well-known Discord locations.
#[derive(Debug, Clone)]
pub struct IpcPathResolver {
    search_dirs: Vec<PathBuf>,
}

impl IpcPathResolver {
    /// Builds the resolver from the process environment.
    #[cfg(unix)]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the resolver for the Windows pipe namespace.
    #[cfg(windows)]
    pub fn from_env() -> Self {
        Self::with_dirs([r"\\?\pipe\"])
    }

    /// Builds the resolver from an arbitrary variable lookup.
    #[cfg(unix)]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base = runtime_dir(lookup);
        Self::with_dirs(UNIX_SUBDIRS.iter().map(|sub| {
            if *sub == "." {
                base.clone()
            } else {
                base.join(sub)
            }
        }))
    }

    /// Searches exactly the given directories, in order.
    pub fn with_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the directories searched.
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Candidate paths in probe order: every directory for slot 0, then slot 1, and so on.
    pub fn candidates(&self, slot: Option<u8>) -> impl Iterator<Item = PathBuf> + '_ {
        let slots = match slot {
            Some(slot) => slot..=slot,
            None => 0..=MAX_SLOT,
        };
        slots.flat_map(move |slot| {
            self.search_dirs
                .iter()
                .map(move |dir| endpoint_path(dir, slot))
        })
    }
}

impl Default for IpcPathResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EndpointResolver for IpcPathResolver {
    fn resolve(&self, slot: Option<u8>) -> Option<PathBuf> {
        let found = self.candidates(slot).find(|path| {
            let exists = path.exists();
            trace!(path = %path.display(), exists, "probing IPC endpoint");
            exists
        });

        match &found {
            Some(path) => debug!(path = %path.display(), "resolved IPC endpoint"),
            None => debug!(?slot, "no IPC endpoint found"),
        }
        found
    }
}

/// Returns `dir/discord-ipc-{slot}`.
pub fn endpoint_path(dir: &Path, slot: u8) -> PathBuf {
    dir.join(format!("{}{}", ENDPOINT_PREFIX, slot))
}

/// Rejects slots outside `0..=9`.
pub fn validate_slot(slot: u8) -> ClientResult<u8> {
    if slot > MAX_SLOT {
        return Err(ClientError::config(format!(
            "pipe slot must be between 0 and {}, got {}",
            MAX_SLOT, slot
        )));
    }
    Ok(slot)
}

#[cfg(unix)]
fn runtime_dir(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    RUNTIME_DIR_VARS
        .iter()
        .filter_map(|name| lookup(*name))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}
