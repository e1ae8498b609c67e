//! Configuration for the relay server and chat client

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cipher::CipherMode;
use crate::crypto::DEFAULT_RSA_BITS;
use crate::error::ConfigError;
use crate::handshake::KeyExchange;

/// Relay server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to accept connections on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Modulus size for a freshly generated identity key
    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: usize,

    /// Cipher handed out on the RSA key exchange path
    #[serde(default)]
    pub cipher: CipherMode,

    #[serde(default)]
    pub key_exchange: KeyExchange,

    /// Where the identity key is kept (`~/.cipherlink` when unset)
    #[serde(default)]
    pub keystore_dir: Option<PathBuf>,
}

/// Chat client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Relay server to connect to
    #[serde(default = "default_server")]
    pub server: SocketAddr,

    /// Name other clients use to reach us
    #[serde(default = "default_nickname")]
    pub nickname: String,

    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: usize,

    /// Must match the server
    #[serde(default)]
    pub key_exchange: KeyExchange,

    #[serde(default)]
    pub keystore_dir: Option<PathBuf>,
}

// Default value functions
fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9000))
}
fn default_server() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9000))
}
fn default_rsa_bits() -> usize {
    DEFAULT_RSA_BITS
}
fn default_nickname() -> String {
    "anonymous".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            rsa_bits: default_rsa_bits(),
            cipher: CipherMode::default(),
            key_exchange: KeyExchange::default(),
            keystore_dir: None,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            nickname: default_nickname(),
            rsa_bits: default_rsa_bits(),
            key_exchange: KeyExchange::default(),
            keystore_dir: None,
        }
    }
}

/// Load server configuration from a TOML file
pub fn load_server_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load client configuration from a TOML file
pub fn load_client_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Save any configuration as TOML
pub fn save<T: Serialize>(config: &T, path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.rsa_bits, 2048);
        assert_eq!(config.cipher, CipherMode::Aes256Cbc);
        assert_eq!(config.key_exchange, KeyExchange::Rsa);

        let config = ClientConfig::default();
        assert_eq!(config.server, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.nickname, "anonymous");
    }

    #[test]
    fn test_load_partial_config() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, r#"nickname = "alice""#).unwrap();
        writeln!(file, r#"key_exchange = "diffie_hellman""#).unwrap();

        let config = load_client_config(file.path()).unwrap();
        assert_eq!(config.nickname, "alice");
        assert_eq!(config.key_exchange, KeyExchange::DiffieHellman);
        assert_eq!(config.server, default_server());
    }

    #[test]
    fn test_server_cipher() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, r#"cipher = "aes_128_cbc""#).unwrap();

        let config = load_server_config(file.path()).unwrap();
        assert_eq!(config.cipher, CipherMode::Aes128Cbc);
        assert_eq!(config.listen, default_listen());
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, r#"cipher = "aes_512_cbc""#).unwrap();

        assert!(matches!(
            load_server_config(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let config = ServerConfig {
            listen: "127.0.0.1:7000".parse().unwrap(),
            keystore_dir: Some(PathBuf::from("/tmp/keys")),
            ..ServerConfig::default()
        };
        let file = NamedTempFile::with_suffix(".toml").unwrap();

        save(&config, file.path()).unwrap();
        assert_eq!(load_server_config(file.path()).unwrap(), config);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_server_config(Path::new("/nonexistent/cipherlink.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
