//! Self-signed certificate material for the HTTPS listener.
//!
//! First TLS start generates a local CA and a wildcard leaf for
//! `*.test` + `localhost`; afterwards the files are reused as-is. Trusting
//! the CA in the OS store is the installer tooling's job, not the daemon's.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::common::Error;

const CA_VALIDITY_DAYS: i64 = 10 * 365;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Subject alternative names on the server leaf.
const LEAF_HOSTS: &[&str] = &["*.test", "localhost"];

#[derive(Debug, Clone)]
pub struct CertMaterial {
    pub ca_cert: PathBuf,
    pub ca_key: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
}

impl CertMaterial {
    fn in_dir(certs_dir: &Path) -> Self {
        Self {
            ca_cert: certs_dir.join("ca-cert.pem"),
            ca_key: certs_dir.join("ca-key.pem"),
            server_cert: certs_dir.join("server-cert.pem"),
            server_key: certs_dir.join("server-key.pem"),
        }
    }
}

/// Make sure CA and server leaf exist under `certs_dir`, generating whatever
/// is missing. Existing files are never touched or regenerated.
pub fn ensure_material(certs_dir: &Path) -> Result<CertMaterial, Error> {
    std::fs::create_dir_all(certs_dir)?;
    let material = CertMaterial::in_dir(certs_dir);

    if material.server_cert.exists() && material.server_key.exists() {
        return Ok(material);
    }

    let (ca_cert, ca_key) = if material.ca_cert.exists() && material.ca_key.exists() {
        load_ca(&material)?
    } else {
        generate_ca(&material)?
    };

    generate_leaf(&material, &ca_cert, &ca_key)?;
    info!(dir = %certs_dir.display(), "TLS certificate material generated");
    Ok(material)
}

fn generate_ca(material: &CertMaterial) -> Result<(Certificate, KeyPair), Error> {
    // KeyPair::generate defaults to ECDSA P-256.
    let key = KeyPair::generate().map_err(|e| Error::Tls(format!("generate CA key: {e}")))?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::OrganizationName, "devmux local CA");
    params.distinguished_name.push(DnType::CommonName, "devmux CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Tls(format!("self-sign CA: {e}")))?;

    std::fs::write(&material.ca_cert, cert.pem())?;
    write_key_pem(&material.ca_key, &key.serialize_pem())?;

    Ok((cert, key))
}

/// Reload an existing CA so a missing leaf can be reissued under it.
fn load_ca(material: &CertMaterial) -> Result<(Certificate, KeyPair), Error> {
    let key_pem = std::fs::read_to_string(&material.ca_key)?;
    let key =
        KeyPair::from_pem(&key_pem).map_err(|e| Error::Tls(format!("parse CA key: {e}")))?;

    let cert_pem = std::fs::read_to_string(&material.ca_cert)?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)
        .map_err(|e| Error::Tls(format!("parse CA cert: {e}")))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| Error::Tls(format!("rebuild CA issuer: {e}")))?;

    Ok((cert, key))
}

fn generate_leaf(
    material: &CertMaterial,
    ca_cert: &Certificate,
    ca_key: &KeyPair,
) -> Result<(), Error> {
    let key = KeyPair::generate().map_err(|e| Error::Tls(format!("generate server key: {e}")))?;

    let hosts: Vec<String> = LEAF_HOSTS.iter().map(|h| h.to_string()).collect();
    let mut params = CertificateParams::new(hosts)
        .map_err(|e| Error::Tls(format!("server cert params: {e}")))?;
    params
        .distinguished_name
        .push(DnType::OrganizationName, "devmux");
    params
        .distinguished_name
        .push(DnType::CommonName, "devmux server");
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

    let cert = params
        .signed_by(&key, ca_cert, ca_key)
        .map_err(|e| Error::Tls(format!("sign server cert: {e}")))?;

    std::fs::write(&material.server_cert, cert.pem())?;
    write_key_pem(&material.server_key, &key.serialize_pem())?;
    Ok(())
}

/// Private keys are written owner-only.
fn write_key_pem(path: &Path, pem: &str) -> Result<(), Error> {
    use std::io::Write;
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(pem.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_full_material_set() {
        let dir = tempfile::tempdir().unwrap();
        let material = ensure_material(dir.path()).unwrap();

        for path in [
            &material.ca_cert,
            &material.ca_key,
            &material.server_cert,
            &material.server_key,
        ] {
            assert!(path.exists(), "{path:?} should exist");
            let content = std::fs::read_to_string(path).unwrap();
            assert!(content.contains("-----BEGIN"), "{path:?} should be PEM");
        }
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let material = ensure_material(dir.path()).unwrap();

        for path in [&material.ca_key, &material.server_key] {
            let mode = std::fs::metadata(path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{path:?} should be 0600");
        }
    }

    #[test]
    fn existing_material_is_reused_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let material = ensure_material(dir.path()).unwrap();
        let before: Vec<Vec<u8>> = [
            &material.ca_cert,
            &material.ca_key,
            &material.server_cert,
            &material.server_key,
        ]
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();

        let material = ensure_material(dir.path()).unwrap();
        let after: Vec<Vec<u8>> = [
            &material.ca_cert,
            &material.ca_key,
            &material.server_cert,
            &material.server_key,
        ]
        .iter()
        .map(|p| std::fs::read(p).unwrap())
        .collect();

        assert_eq!(before, after);
    }

    #[test]
    fn missing_leaf_reissued_under_existing_ca() {
        let dir = tempfile::tempdir().unwrap();
        let material = ensure_material(dir.path()).unwrap();
        let ca_before = std::fs::read(&material.ca_cert).unwrap();

        std::fs::remove_file(&material.server_cert).unwrap();
        std::fs::remove_file(&material.server_key).unwrap();

        let material = ensure_material(dir.path()).unwrap();
        assert!(material.server_cert.exists());
        assert_eq!(std::fs::read(&material.ca_cert).unwrap(), ca_before);
    }

    #[test]
    fn leaf_names_cover_wildcard_and_localhost() {
        let dir = tempfile::tempdir().unwrap();
        let material = ensure_material(dir.path()).unwrap();

        // DNS SANs are IA5Strings, so they appear verbatim in the DER.
        let pem = std::fs::read(&material.server_cert).unwrap();
        let der = rustls_pemfile::certs(&mut pem.as_slice())
            .next()
            .unwrap()
            .unwrap();
        for host in LEAF_HOSTS {
            assert!(
                der.windows(host.len()).any(|w| w == host.as_bytes()),
                "leaf should carry SAN {host}"
            );
        }
    }
}
