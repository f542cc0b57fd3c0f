use std::fmt;

/// Static build metadata, surfaced by the conclave hub's `welcome` frame
/// and by the admin config dump. Mirrors the teacher's `agent_core::version::BuildInfo`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub rust_version: &'static str,
}

pub const BUILD: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    rust_version: "unknown",
};

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wardgate {}", self.version)
    }
}
