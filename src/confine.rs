//! Filesystem confinement with Landlock.
//!
//! A confined program has full access beneath its scratch directory and
//! read/execute access to the runtime's files. Every other path is denied,
//! including the scratch base and the scratch directories of other runs.

use landlock::{
    Access, AccessFs, BitFlags, CompatLevel, Compatible, PathBeneath, PathFd, Ruleset,
    RulesetAttr, RulesetCreatedAttr, RulesetStatus, ABI,
};
use std::io;
use std::path::{Path, PathBuf};

/// Highest ABI asked for; older kernels get the subset they support
const TARGET_ABI: ABI = ABI::V3;

/// Whether the running kernel enforces Landlock rulesets
pub(crate) fn supported() -> bool {
    Ruleset::default()
        .set_compatibility(CompatLevel::HardRequirement)
        .handle_access(AccessFs::from_all(ABI::V1))
        .and_then(|ruleset| ruleset.create())
        .is_ok()
}

/// Restrict the calling process to `scratch` and `read_only`. Runs in the
/// child between fork and exec, so it only reports errors and never logs.
pub(crate) fn restrict_to(scratch: &Path, read_only: &[PathBuf]) -> io::Result<RulesetStatus> {
    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(TARGET_ABI))
        .map_err(io::Error::other)?
        .create()
        .map_err(io::Error::other)?;

    let scratch = PathFd::new(scratch).map_err(io::Error::other)?;
    ruleset = ruleset
        .add_rule(PathBeneath::new(scratch, AccessFs::from_all(TARGET_ABI)))
        .map_err(io::Error::other)?;

    for path in read_only {
        // Absent on this host
        let Ok(fd) = PathFd::new(path) else {
            continue;
        };
        ruleset = ruleset
            .add_rule(PathBeneath::new(fd, access_for(path)))
            .map_err(io::Error::other)?;
    }

    // Python lists its open descriptors before starting a subprocess
    if let Ok(fd) = PathFd::new("/proc/self/fd") {
        ruleset = ruleset
            .add_rule(PathBeneath::new(fd, AccessFs::ReadDir | AccessFs::ReadFile))
            .map_err(io::Error::other)?;
    }

    let status = ruleset.restrict_self().map_err(io::Error::other)?;
    Ok(status.ruleset)
}

/// Read and execute; devices such as `/dev/null` are also writable
fn access_for(path: &Path) -> BitFlags<AccessFs> {
    if path.is_dir() {
        AccessFs::from_read(TARGET_ABI)
    } else if path.starts_with("/dev") {
        AccessFs::from_file(TARGET_ABI)
    } else {
        AccessFs::from_read(TARGET_ABI) & AccessFs::from_file(TARGET_ABI)
    }
}

/// Install prefixes of the interpreter, as invoked and after following
/// symlinks: `/opt/py/bin/python3` gives `/opt/py`
pub(crate) fn install_prefixes(program: &Path) -> Vec<PathBuf> {
    let mut prefixes = Vec::new();
    let resolved = std::fs::canonicalize(program).ok();
    for path in std::iter::once(program).chain(resolved.as_deref()) {
        let Some(bin) = path.parent() else {
            continue;
        };
        let prefix = bin.parent().filter(|p| *p != Path::new("/")).unwrap_or(bin);
        if prefix != Path::new("/") && !prefixes.iter().any(|p: &PathBuf| p == prefix) {
            prefixes.push(prefix.to_path_buf());
        }
    }
    prefixes
}
