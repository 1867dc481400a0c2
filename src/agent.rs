//! Embedding and packaging of the in-container agent: the bootstrap script is compiled
//! into this binary as a static asset; the agent executable itself is a build-time
//! dependency whose path is supplied by the caller (it is not embedded as crate source,
//! since it is built and published separately per the agent protocol named out of scope
//! in the top-level scope statement).

use std::path::Path;

use include_dir::{Dir, include_dir};

use crate::provider::{ProviderError, ProviderResult};

static ASSETS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/assets");

/// Directory the agent binary is installed under inside the container.
pub const EXECD_DIR: &str = "/opt/opensandbox/execd";
/// Path to the agent executable inside the container.
pub const EXECD_BIN_PATH: &str = "/opt/opensandbox/execd/agent";
/// Path the bootstrap script is installed at inside the container.
pub const BOOTSTRAP_PATH: &str = "/opt/opensandbox/bootstrap.sh";

/// The bootstrap shell script's contents, embedded at compile time.
pub fn bootstrap_script() -> &'static str {
    ASSETS
        .get_file("bootstrap.sh")
        .and_then(|f| f.contents_utf8())
        .expect("assets/bootstrap.sh is embedded at compile time")
}

/// Build an in-memory tar archive containing the bootstrap script and the agent binary
/// (read from `agent_binary_path` on the host), laid out at their fixed container-internal
/// paths. The returned bytes are suitable for upload through a runtime's file-injection
/// mechanism (e.g. Docker's archive-upload API) prior to starting the workload's entrypoint.
pub fn build_injection_archive(agent_binary_path: &Path) -> ProviderResult<Vec<u8>> {
    let agent_bytes = std::fs::read(agent_binary_path).map_err(|err| {
        ProviderError::Operation(format!(
            "failed to read agent binary at {}: {err}",
            agent_binary_path.display()
        ))
    })?;

    let mut builder = tar::Builder::new(Vec::new());

    append_entry(&mut builder, strip_leading_slash(BOOTSTRAP_PATH), bootstrap_script().as_bytes(), 0o755)?;
    append_entry(&mut builder, strip_leading_slash(EXECD_BIN_PATH), &agent_bytes, 0o755)?;

    builder
        .into_inner()
        .map_err(|err| ProviderError::Operation(format!("failed to finalize injection archive: {err}")))
}

fn strip_leading_slash(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn append_entry(
    builder: &mut tar::Builder<Vec<u8>>,
    path: &str,
    contents: &[u8],
    mode: u32,
) -> ProviderResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_cksum();
    builder
        .append_data(&mut header, path, contents)
        .map_err(|err| ProviderError::Operation(format!("failed to append '{path}' to injection archive: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_script_is_embedded_and_nonempty() {
        assert!(bootstrap_script().contains("exec \"$@\""));
    }

    #[test]
    fn fixed_paths_are_posix_and_under_opensandbox() {
        assert!(EXECD_BIN_PATH.starts_with("/opt/opensandbox/"));
        assert!(BOOTSTRAP_PATH.starts_with("/opt/opensandbox/"));
        assert!(!EXECD_BIN_PATH.contains('\\'));
    }

    #[test]
    fn injection_archive_contains_both_fixed_paths() {
        let dir = tempdir();
        let agent_path = dir.join("agent");
        std::fs::write(&agent_path, b"fake-agent-binary").unwrap();

        let archive = build_injection_archive(&agent_path).unwrap();
        let mut reader = tar::Archive::new(std::io::Cursor::new(archive));
        let paths: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();

        assert!(paths.iter().any(|p| p == strip_leading_slash(BOOTSTRAP_PATH)));
        assert!(paths.iter().any(|p| p == strip_leading_slash(EXECD_BIN_PATH)));

        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("opensandbox-agent-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
