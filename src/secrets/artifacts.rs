use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::{IoContext, Scope, SecretsError};

/// Writes a secret file readable only by the owner, replacing previous contents.
pub fn write_secret_file(
    path: &Path,
    contents: &[u8],
    step: &'static str,
    scope: &Scope,
) -> Result<(), SecretsError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).io_step(step, scope, path)?;
    // `mode` only applies on creation; tighten files that already existed
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .io_step(step, scope, path)?;
    }
    file.write_all(contents).io_step(step, scope, path)?;
    file.sync_all().io_step(step, scope, path)?;
    Ok(())
}

pub fn create_dir_if_not_exist(dir: &Path, scope: &Scope) -> Result<(), SecretsError> {
    fs::create_dir_all(dir).io_step("create secrets directory", scope, dir)
}

/// Files produced by one multi-step issuance.
///
/// Unless [`ArtifactSaga::commit`] is called, every recorded file is removed
/// when the saga is dropped, so a failed issuance leaves no partial artifacts.
pub struct ArtifactSaga {
    scope: Scope,
    written: Vec<PathBuf>,
    committed: bool,
}

impl ArtifactSaga {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            written: Vec::new(),
            committed: false,
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Writes `contents` to `path` and records it for rollback.
    pub fn write(
        &mut self,
        path: &Path,
        contents: &[u8],
        step: &'static str,
    ) -> Result<(), SecretsError> {
        if !self.written.iter().any(|p| p == path) {
            self.written.push(path.to_path_buf());
        }
        write_secret_file(path, contents, step, &self.scope)
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    pub fn commit(mut self) -> Vec<PathBuf> {
        self.committed = true;
        std::mem::take(&mut self.written)
    }
}

impl Drop for ArtifactSaga {
    fn drop(&mut self) {
        if self.committed || self.written.is_empty() {
            return;
        }
        warn!(
            "↩️  Rolling back {} partial artifact(s) for {}",
            self.written.len(),
            self.scope
        );
        for path in self.written.iter().rev() {
            match fs::remove_file(path) {
                Ok(()) => debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("⚠️  Could not remove {}: {}", path.display(), e),
            }
        }
    }
}
