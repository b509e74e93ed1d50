//! On-disk storage for key bundles.
//!
//! Layout inside a key directory (the directory itself is created 0700):
//!
//! ```text
//! signing.pub.pem    0644
//! signing.key.pem    0600
//! exchange.pub.pem   0644
//! exchange.key.pem   0600
//! ```
//!
//! A peer directory holds only the two `.pub.pem` files.

use std::fs;
use std::path::Path;

use crate::keys::{ExchangeKeypair, KeyBundle, PublicKeyBundle, SigningKeypair};
use crate::CryptoError;

const SIGNING_PUB: &str = "signing.pub.pem";
const SIGNING_KEY: &str = "signing.key.pem";
const EXCHANGE_PUB: &str = "exchange.pub.pem";
const EXCHANGE_KEY: &str = "exchange.key.pem";

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

fn write_key_file(dir: &Path, name: &str, contents: &str, mode: u32) -> Result<(), CryptoError> {
    let path = dir.join(name);
    fs::write(&path, contents)?;
    set_mode(&path, mode)?;
    Ok(())
}

/// Write a full bundle (public and private halves) into `dir`.
pub fn save_bundle(dir: &Path, bundle: &KeyBundle) -> Result<(), CryptoError> {
    fs::create_dir_all(dir)?;
    set_mode(dir, 0o700)?;

    write_key_file(dir, SIGNING_PUB, &bundle.signing.public_pem(), 0o644)?;
    write_key_file(dir, SIGNING_KEY, &bundle.signing.private_pem(), 0o600)?;
    write_key_file(dir, EXCHANGE_PUB, &bundle.exchange.public_pem(), 0o644)?;
    write_key_file(dir, EXCHANGE_KEY, &bundle.exchange.private_pem(), 0o600)?;
    Ok(())
}

/// Load a full bundle from `dir`.
pub fn load_bundle(dir: &Path) -> Result<KeyBundle, CryptoError> {
    let signing = fs::read_to_string(dir.join(SIGNING_KEY))?;
    let exchange = fs::read_to_string(dir.join(EXCHANGE_KEY))?;
    Ok(KeyBundle {
        signing: SigningKeypair::from_private_pem(&signing)?,
        exchange: ExchangeKeypair::from_private_pem(&exchange)?,
    })
}

/// Write only the shareable halves into `dir` (how a peer's keys are stored).
pub fn save_public_bundle(dir: &Path, bundle: &PublicKeyBundle) -> Result<(), CryptoError> {
    fs::create_dir_all(dir)?;
    set_mode(dir, 0o700)?;

    write_key_file(dir, SIGNING_PUB, &bundle.signing_pem(), 0o644)?;
    write_key_file(dir, EXCHANGE_PUB, &bundle.exchange_pem(), 0o644)?;
    Ok(())
}

/// Load the shareable halves from `dir`.
pub fn load_public_bundle(dir: &Path) -> Result<PublicKeyBundle, CryptoError> {
    let signing = fs::read_to_string(dir.join(SIGNING_PUB))?;
    let exchange = fs::read_to_string(dir.join(EXCHANGE_PUB))?;
    PublicKeyBundle::from_pems(&signing, &exchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = KeyBundle::generate(&mut OsRng);
        save_bundle(dir.path(), &bundle).unwrap();

        let loaded = load_bundle(dir.path()).unwrap();
        assert_eq!(loaded.public_bundle(), bundle.public_bundle());
    }

    #[test]
    fn test_public_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = KeyBundle::generate(&mut OsRng);
        save_public_bundle(dir.path(), &bundle.public_bundle()).unwrap();

        let loaded = load_public_bundle(dir.path()).unwrap();
        assert_eq!(loaded, bundle.public_bundle());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bundle = KeyBundle::generate(&mut OsRng);
        save_bundle(dir.path(), &bundle).unwrap();

        let key_mode = fs::metadata(dir.path().join(SIGNING_KEY))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(key_mode & 0o777, 0o600);

        let pub_mode = fs::metadata(dir.path().join(SIGNING_PUB))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(pub_mode & 0o777, 0o644);
    }

    #[test]
    fn test_load_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_bundle(&dir.path().join("nope")).is_err());
    }
}
