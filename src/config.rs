//! Engine configuration.
//!
//! Built once at startup (from CLI arguments in the binary) and handed
//! to whichever backend gets selected.

use std::str::FromStr;

/// Default upper bound for a single incoming transfer.
pub const DEFAULT_MAX_TRANSFER_BYTES: usize = 64 * 1024 * 1024;

/// Default X11 INCR threshold and chunk size.
pub const DEFAULT_INCR_CHUNK_BYTES: usize = 256 * 1024;

/// Highest Xdnd protocol version we speak.
pub const XDND_VERSION: u32 = 5;

/// Lowest Xdnd protocol version we accept from a peer.
pub const XDND_MIN_VERSION: u32 = 3;

/// Which native transport to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Wayland when `WAYLAND_DISPLAY` is set (and support is compiled in),
    /// otherwise X11.
    #[default]
    Auto,
    X11,
    Wayland,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "x11" => Ok(BackendKind::X11),
            "wayland" => Ok(BackendKind::Wayland),
            other => Err(format!("unknown backend {other:?} (expected auto, x11 or wayland)")),
        }
    }
}

impl BackendKind {
    /// Resolve `Auto` against the process environment.
    pub fn resolve(self) -> BackendKind {
        match self {
            BackendKind::Auto => {
                let wayland = std::env::var_os("WAYLAND_DISPLAY").is_some();
                if wayland && cfg!(feature = "wayland") {
                    BackendKind::Wayland
                } else {
                    BackendKind::X11
                }
            }
            other => other,
        }
    }
}

/// Tunables shared by all backends.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub backend: BackendKind,
    /// Incoming transfers larger than this resolve as failed.
    pub max_transfer_bytes: usize,
    /// Outgoing X11 payloads above this size use INCR, in chunks of
    /// this size.
    pub incr_chunk_bytes: usize,
    /// Xdnd version advertised in `XdndAware` and `XdndEnter`.
    pub xdnd_version: u32,
    /// Bound for blocking CLI waits. The engine itself has no timeouts.
    pub timeout_ms: Option<u64>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            incr_chunk_bytes: DEFAULT_INCR_CHUNK_BYTES,
            xdnd_version: XDND_VERSION,
            timeout_ms: None,
        }
    }
}

impl ExchangeConfig {
    /// Xdnd version clamped to the range we implement.
    pub fn xdnd_version(&self) -> u32 {
        self.xdnd_version.clamp(XDND_MIN_VERSION, XDND_VERSION)
    }
}
