//! CURVE certificate management.
//!
//! A certificate is a long-term CURVE keypair stored as Z85 text. Each role
//! gets two files: `<role>` holds the public half and may be world-readable;
//! `<role>_private` holds both halves and must be readable only by its
//! owner. Peers are admitted by inserting their public key into the local
//! [`CertStore`] before they connect.

use hashbrown::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use canopy_core::error::{Error, Result};

/// CURVE key size in bytes.
pub const KEY_SIZE: usize = 32;

/// A CURVE public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Z85 text form, 40 characters.
    #[must_use]
    pub fn to_z85(&self) -> String {
        zmq::z85_encode(&self.0).expect("32 bytes is z85-encodable")
    }

    pub fn from_z85(text: &str) -> Result<Self> {
        let bytes = zmq::z85_decode(text)
            .map_err(|_| Error::invalid(format!("bad z85 key {text:?}")))?;
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::invalid("curve key must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_z85())
    }
}

/// A CURVE secret key. Never printed.
#[derive(Clone)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    #[must_use]
    pub fn to_z85(&self) -> String {
        zmq::z85_encode(&self.0).expect("32 bytes is z85-encodable")
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// A long-term keypair with an owner name.
#[derive(Debug, Clone)]
pub struct Certificate {
    name: String,
    public: PublicKey,
    secret: Option<SecretKey>,
}

impl Certificate {
    /// Generate a fresh keypair.
    pub fn generate(name: impl Into<String>) -> Result<Self> {
        let pair = zmq::CurveKeyPair::new()
            .map_err(|e| Error::Io(std::io::Error::other(format!("curve keygen: {e}"))))?;
        Ok(Self {
            name: name.into(),
            public: PublicKey::from_bytes(pair.public_key),
            secret: Some(SecretKey::from_bytes(pair.secret_key)),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// The secret half. Absent on certificates loaded from a public file.
    pub fn secret_key(&self) -> Result<&SecretKey> {
        self.secret
            .as_ref()
            .ok_or_else(|| Error::NotFound("certificate has no secret key".to_string()))
    }

    /// Write `<role>` (public, 0644) and `<role>_private` (public+secret,
    /// 0600) under `dir`. Refuses to overwrite existing files unless
    /// `force` is set.
    pub fn save(&self, dir: &Path, role: &str, force: bool) -> Result<()> {
        let secret = self.secret_key()?;
        let public_path = dir.join(role);
        let private_path = dir.join(format!("{role}_private"));
        for path in [&public_path, &private_path] {
            if path.exists() && !force {
                return Err(Error::Exists(format!(
                    "{} exists; use force to overwrite",
                    path.display()
                )));
            }
        }

        let mut body = String::new();
        body.push_str("# Canopy CURVE certificate\n");
        body.push_str(&format!("name = \"{}\"\n", self.name));
        body.push_str(&format!("public-key = \"{}\"\n", self.public.to_z85()));
        write_with_mode(&public_path, &body, 0o644, force)?;

        body.push_str(&format!("secret-key = \"{}\"\n", secret.to_z85()));
        write_with_mode(&private_path, &body, 0o600, force)?;
        Ok(())
    }

    /// Load a certificate file. Files carrying a secret key must not be
    /// group- or world-readable.
    pub fn load(path: &Path) -> Result<Self> {
        let body = match fs::read_to_string(path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "{}: no certificate; generate one with keygen",
                    path.display()
                )));
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let mut name = None;
        let mut public = None;
        let mut secret = None;
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(Error::invalid(format!(
                    "{}: malformed line {line:?}",
                    path.display()
                )));
            };
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "name" => name = Some(value.to_string()),
                "public-key" => public = Some(PublicKey::from_z85(value)?),
                "secret-key" => secret = Some(value.to_string()),
                other => {
                    return Err(Error::invalid(format!(
                        "{}: unknown field {other:?}",
                        path.display()
                    )));
                }
            }
        }

        if secret.is_some() {
            let mode = fs::metadata(path)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(Error::PermissionDenied(format!(
                    "{}: secret key file is group or world readable (mode {:o})",
                    path.display(),
                    mode & 0o777
                )));
            }
        }

        let public = public
            .ok_or_else(|| Error::invalid(format!("{}: missing public-key", path.display())))?;
        let secret = match secret {
            Some(text) => {
                let bytes = zmq::z85_decode(&text)
                    .map_err(|_| Error::invalid(format!("{}: bad secret key", path.display())))?;
                let bytes: [u8; KEY_SIZE] = bytes
                    .try_into()
                    .map_err(|_| Error::invalid("curve key must be 32 bytes"))?;
                Some(SecretKey::from_bytes(bytes))
            }
            None => None,
        };
        Ok(Self {
            name: name.unwrap_or_default(),
            public,
            secret,
        })
    }
}

fn write_with_mode(path: &Path, body: &str, mode: u32, force: bool) -> Result<()> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).mode(mode);
    if force {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    let mut file = opts.open(path)?;
    // create() honors umask; pin the mode explicitly.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(body.as_bytes())?;
    Ok(())
}

/// In-memory map of authorized peer public keys to role names. Consulted by
/// the ZAP agent on every inbound CURVE session.
#[derive(Debug, Default)]
pub struct CertStore {
    by_key: HashMap<String, String>,
}

impl CertStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorize a peer. Later calls for the same key replace the name.
    pub fn authorize(&mut self, name: impl Into<String>, key: &PublicKey) {
        self.by_key.insert(key.to_z85(), name.into());
    }

    pub fn revoke(&mut self, key: &PublicKey) -> bool {
        self.by_key.remove(&key.to_z85()).is_some()
    }

    /// Look up an authorized key by its Z85 text, returning the role name.
    #[must_use]
    pub fn lookup(&self, key_txt: &str) -> Option<&str> {
        self.by_key.get(key_txt).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cert = Certificate::generate("broker-3").unwrap();
        cert.save(dir.path(), "broker", false).unwrap();

        let public = Certificate::load(&dir.path().join("broker")).unwrap();
        assert_eq!(public.name(), "broker-3");
        assert_eq!(public.public_key(), cert.public_key());
        assert!(public.secret_key().is_err());

        let private = Certificate::load(&dir.path().join("broker_private")).unwrap();
        assert_eq!(private.public_key(), cert.public_key());
        assert_eq!(
            private.secret_key().unwrap().as_bytes(),
            cert.secret_key().unwrap().as_bytes()
        );
    }

    #[test]
    fn save_refuses_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let cert = Certificate::generate("a").unwrap();
        cert.save(dir.path(), "broker", false).unwrap();

        let other = Certificate::generate("b").unwrap();
        let err = other.save(dir.path(), "broker", false).unwrap_err();
        assert_eq!(err.errnum(), canopy_core::error::errnum::EEXIST);

        other.save(dir.path(), "broker", true).unwrap();
        let loaded = Certificate::load(&dir.path().join("broker")).unwrap();
        assert_eq!(loaded.public_key(), other.public_key());
    }

    #[test]
    fn load_rejects_lax_private_mode() {
        let dir = tempfile::tempdir().unwrap();
        let cert = Certificate::generate("a").unwrap();
        cert.save(dir.path(), "broker", false).unwrap();

        let path = dir.path().join("broker_private");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        let err = Certificate::load(&path).unwrap_err();
        assert_eq!(err.errnum(), canopy_core::error::errnum::EPERM);
    }

    #[test]
    fn load_missing_file_mentions_keygen() {
        let err = Certificate::load(Path::new("/nonexistent/cert")).unwrap_err();
        assert!(err.to_string().contains("keygen"));
    }

    #[test]
    fn store_authorizes_and_revokes() {
        let mut store = CertStore::new();
        let a = Certificate::generate("a").unwrap();
        let b = Certificate::generate("b").unwrap();

        store.authorize("child-1", a.public_key());
        assert_eq!(store.lookup(&a.public_key().to_z85()), Some("child-1"));
        assert_eq!(store.lookup(&b.public_key().to_z85()), None);

        assert!(store.revoke(a.public_key()));
        assert!(!store.revoke(a.public_key()));
        assert!(store.is_empty());
    }
}
