use crate::error::{Result, StoreError};
use crate::index::PlatformArtifact;

/// Pick the artifact published for `(os, arch)`.
///
/// Linear scan, first match wins; duplicate `(os, arch)` pairs later in the
/// list are intentionally shadowed. There is no fallback logic.
pub fn select<'a>(
    artifacts: &'a [PlatformArtifact],
    os: &str,
    arch: &str,
) -> Result<&'a PlatformArtifact> {
    artifacts
        .iter()
        .find(|artifact| artifact.os == os && artifact.arch == arch)
        .ok_or_else(|| StoreError::NoPlatformMatch {
            os: os.to_string(),
            arch: arch.to_string(),
        })
}

/// Select for the platform this process runs on.
pub fn select_current(artifacts: &[PlatformArtifact]) -> Result<&PlatformArtifact> {
    let (os, arch) = current();
    select(artifacts, os, arch)
}

/// The running platform in registry naming (`darwin`/`amd64` style).
pub fn current() -> (&'static str, &'static str) {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    };
    (os, arch)
}
