use heapscope_wire::DEFAULT_MAX_FRAME_BYTES;
use tracing::warn;

use crate::resolver::{DEFAULT_MAX_DEPTH, DEFAULT_MAX_STEPS, ResolverConfig};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9140";

pub const LISTEN_ENV: &str = "HEAPSCOPE_LISTEN";
pub const MAX_FRAME_BYTES_ENV: &str = "HEAPSCOPE_MAX_FRAME_BYTES";
pub const RESOLVE_MAX_DEPTH_ENV: &str = "HEAPSCOPE_RESOLVE_MAX_DEPTH";
pub const RESOLVE_MAX_STEPS_ENV: &str = "HEAPSCOPE_RESOLVE_MAX_STEPS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub listen_addr: String,
    pub max_frame_bytes: usize,
    pub resolver: ResolverConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            resolver: ResolverConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from `lookup`, falling back to the default for every
    /// missing or invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let listen_addr = lookup(LISTEN_ENV)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let max_frame_bytes =
            positive_usize(&lookup, MAX_FRAME_BYTES_ENV, DEFAULT_MAX_FRAME_BYTES);
        let resolver = ResolverConfig {
            max_depth: positive_usize(&lookup, RESOLVE_MAX_DEPTH_ENV, DEFAULT_MAX_DEPTH),
            max_steps: positive_usize(&lookup, RESOLVE_MAX_STEPS_ENV, DEFAULT_MAX_STEPS),
            ..ResolverConfig::default()
        };
        Self {
            listen_addr,
            max_frame_bytes,
            resolver,
        }
    }
}

fn positive_usize(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: usize) -> usize {
    match lookup(name) {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(v) if v > 0 => v,
            _ => {
                warn!(%name, value = %raw, default, "invalid value, using default");
                default
            }
        },
        None => default,
    }
}
