//! # Key Store
//!
//! Keeps the local RSA key pair on disk between runs so that fingerprints
//! stay stable. Layout:
//!
//! ```text
//! ~/.cipherlink/        (0o700)
//! └── keypair.pem       (0o700, PKCS#8, encrypted when a passphrase is used)
//! ```

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::crypto::CryptoEngine;
use crate::error::KeyStoreError;

/// Directory created under the home directory by default
pub const DEFAULT_DIR_NAME: &str = ".cipherlink";

/// File holding the key pair inside the store directory
pub const KEYPAIR_FILE: &str = "keypair.pem";

/// Directory-backed key pair persistence
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.cipherlink`
    pub fn default_location() -> Result<Self, KeyStoreError> {
        let home = dirs::home_dir().ok_or(KeyStoreError::NoHomeDirectory)?;
        Ok(Self::new(home.join(DEFAULT_DIR_NAME)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keypair_path(&self) -> PathBuf {
        self.dir.join(KEYPAIR_FILE)
    }

    /// Whether a key pair has been saved
    pub fn exists(&self) -> bool {
        self.keypair_path().is_file()
    }

    /// Write the engine's key pair, creating the directory if needed
    pub fn save(&self, engine: &CryptoEngine, passphrase: Option<&str>) -> Result<(), KeyStoreError> {
        let pem = engine.export_key_pair_pem(passphrase)?;

        create_private_dir(&self.dir)?;
        let path = self.keypair_path();
        let mut file = create_private_file(&path)?;
        file.write_all(pem.as_bytes())?;
        file.sync_all()?;

        info!("Saved key pair to {}", path.display());
        Ok(())
    }

    /// Load a saved key pair into `engine`
    ///
    /// Returns `Ok(false)` when nothing has been saved yet.
    pub fn load(&self, engine: &mut CryptoEngine, passphrase: Option<&str>) -> Result<bool, KeyStoreError> {
        let path = self.keypair_path();
        let pem = match fs::read_to_string(&path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        engine.import_key_pair_pem(&pem, passphrase)?;
        debug!("Loaded key pair from {}", path.display());
        Ok(true)
    }

    /// Load the saved key pair, or generate one of `bits` and save it
    ///
    /// Returns true when a new key pair was generated.
    pub fn load_or_generate(
        &self,
        engine: &mut CryptoEngine,
        bits: usize,
        passphrase: Option<&str>,
    ) -> Result<bool, KeyStoreError> {
        if self.load(engine, passphrase)? {
            return Ok(false);
        }

        info!("No saved key pair, generating {} bit RSA key", bits);
        engine.generate_key_pair(bits)?;
        self.save(engine, passphrase)?;
        Ok(true)
    }

    /// Delete the saved key pair and, if it is then empty, the directory
    pub fn clear(&self) -> Result<(), KeyStoreError> {
        match fs::remove_file(self.keypair_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        // Other files in the directory are not ours to delete
        if let Err(e) = fs::remove_dir(&self.dir) {
            debug!("Leaving {} in place: {}", self.dir.display(), e);
        }
        info!("Cleared key pair from {}", self.dir.display());
        Ok(())
    }
}

/// Export the engine's public key as PEM so a peer can pin it
pub fn write_public_key(engine: &CryptoEngine, path: &Path) -> Result<(), KeyStoreError> {
    fs::write(path, engine.local_public_key_pem()?)?;
    Ok(())
}

/// Set the engine's remote key from a PEM file
pub fn read_remote_public_key(engine: &mut CryptoEngine, path: &Path) -> Result<(), KeyStoreError> {
    let pem = fs::read(path)?;
    engine.set_remote_public_key_pem(&pem)?;
    Ok(())
}

/// Owner-only mode for the store directory and the key pair file
#[cfg(unix)]
const PRIVATE_MODE: u32 = 0o700;

/// Create the directory owner-only; an existing one is tightened
#[cfg(unix)]
fn create_private_dir(path: &Path) -> Result<(), KeyStoreError> {
    use std::os::unix::fs::{DirBuilderExt, PermissionsExt};

    fs::DirBuilder::new()
        .recursive(true)
        .mode(PRIVATE_MODE)
        .create(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(PRIVATE_MODE))?;
    Ok(())
}

/// Open `path` for writing with owner-only permissions from the start
///
/// A file left over with looser permissions is tightened before anything
/// is written to it.
#[cfg(unix)]
fn create_private_file(path: &Path) -> Result<File, KeyStoreError> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PRIVATE_MODE)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(PRIVATE_MODE))?;
    Ok(file)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> Result<(), KeyStoreError> {
    fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_file(path: &Path) -> Result<File, KeyStoreError> {
    Ok(File::create(path)?)
}
