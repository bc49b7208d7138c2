//! Symmetric signing secret, persisted once per host.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use ring::rand::{SecureRandom, SystemRandom};
use tracing::info;

use crate::error::SecretError;

/// 256 bit minimum.
pub const SECRET_LEN: usize = 32;

#[derive(Clone)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn generate() -> Result<Self, SecretError> {
        let mut bytes = vec![0u8; SECRET_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| SecretError::Random)?;
        Ok(Self(bytes))
    }

    /// Reads the key at `path`, or generates and writes a new one if the file
    /// does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, SecretError> {
        let io_err = |source| SecretError::Io {
            path: path.to_path_buf(),
            source,
        };

        if path.exists() {
            let bytes = fs::read(path).map_err(io_err)?;
            if bytes.len() < SECRET_LEN {
                return Err(SecretError::TooShort {
                    path: path.to_path_buf(),
                    len: bytes.len(),
                    min: SECRET_LEN,
                });
            }
            return Ok(Self(bytes));
        }

        let key = Self::generate()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        write_private(path, &key.0).map_err(io_err)?;
        info!(target: "auth::secret", "generated new secret key at '{}'", path.display());
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<{} bytes>)", self.0.len())
    }
}

/// Creates `path` owner-only (0600 on unix) before any key byte is written.
/// Fails if the file appeared in the meantime.
fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
