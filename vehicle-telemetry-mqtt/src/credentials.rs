// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Loading per-device X.509 credentials into a TLS client identity.
//!
//! A device's certificate lives at `{cert_dir}/{device}.cert.pem` and its key
//! at `{key_dir}/{device}.key.pem`. Both are parsed, checked against each
//! other, and bundled with the broker trust anchors into one rustls
//! [`ClientConfig`] that the MQTT transport uses for the handshake.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, SignatureVerificationAlgorithm};
use rustls::{ClientConfig, RootCertStore, SignatureScheme};

use crate::error::CredentialError;

const KEY_PROBE: &[u8] = b"vehicle-telemetry-mqtt credential probe";

const PROBE_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PKCS1_SHA256,
];

/// A device's loaded TLS client identity. Immutable once loaded.
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    certificate_path: PathBuf,
    key_path: PathBuf,
    tls: Arc<ClientConfig>,
}

impl DeviceIdentity {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Client configuration carrying the certificate chain, key and trust anchors.
    pub fn tls_config(&self) -> Arc<ClientConfig> {
        self.tls.clone()
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("certificate_path", &self.certificate_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

/// Loads device identities from a certificate directory and a key directory.
#[derive(Clone)]
pub struct CredentialLoader {
    cert_dir: PathBuf,
    key_dir: PathBuf,
    roots: Arc<RootCertStore>,
}

impl CredentialLoader {
    /// `cert_dir` and `key_dir` may be the same directory.
    pub fn new(
        cert_dir: impl Into<PathBuf>,
        key_dir: impl Into<PathBuf>,
        roots: Arc<RootCertStore>,
    ) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            key_dir: key_dir.into(),
            roots,
        }
    }

    pub fn certificate_path(&self, device_id: &str) -> PathBuf {
        self.cert_dir.join(format!("{device_id}.cert.pem"))
    }

    pub fn key_path(&self, device_id: &str) -> PathBuf {
        self.key_dir.join(format!("{device_id}.key.pem"))
    }

    /// Load, validate and bundle the credential pair for `device_id`.
    pub fn load(&self, device_id: &str) -> Result<DeviceIdentity, CredentialError> {
        let certificate_path = self.certificate_path(device_id);
        let key_path = self.key_path(device_id);

        let chain = parse_certificates(&read_pem(&certificate_path)?, &certificate_path)?;
        let key = parse_private_key(&read_pem(&key_path)?, &key_path)?;

        verify_key_pair(&chain[0], &key)?;

        let tls = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(chain, key)
            .map_err(|e| CredentialError::Malformed(format!("{}: {e}", key_path.display())))?;

        debug!("[{device_id}] Loaded client certificate {}", certificate_path.display());

        Ok(DeviceIdentity {
            device_id: device_id.to_string(),
            certificate_path,
            key_path,
            tls: Arc::new(tls),
        })
    }
}

/// Trust anchors used to verify the broker's certificate.
///
/// Uses the PEM bundle at `ca_file` when given, otherwise the platform's
/// native certificate store.
pub fn load_trust_anchors(ca_file: Option<&Path>) -> Result<RootCertStore, CredentialError> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in parse_certificates(&read_pem(path)?, path)? {
                roots
                    .add(cert)
                    .map_err(|e| CredentialError::Malformed(format!("{}: {e}", path.display())))?;
            }
        }
        None => {
            let native = rustls_native_certs::load_native_certs().map_err(|e| {
                CredentialError::NotFound(format!("platform certificate store: {e}"))
            })?;
            let (added, ignored) = roots.add_parsable_certificates(native);
            if ignored > 0 {
                warn!("Ignored {ignored} unparsable platform root certificates");
            }
            debug!("Loaded {added} platform root certificates");
        }
    }
    if roots.is_empty() {
        return Err(CredentialError::NotFound("no trust anchors".to_string()));
    }
    Ok(roots)
}

fn read_pem(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => CredentialError::NotFound(path.display().to_string()),
        _ => CredentialError::NotFound(format!("{}: {e}", path.display())),
    })
}

fn parse_certificates(
    pem: &[u8],
    path: &Path,
) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CredentialError::Malformed(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(CredentialError::Malformed(format!(
            "{}: no PEM certificate found",
            path.display()
        )));
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8], path: &Path) -> Result<PrivateKeyDer<'static>, CredentialError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CredentialError::Malformed(format!("{}: {e}", path.display())))?
        .ok_or_else(|| {
            CredentialError::Malformed(format!("{}: no PEM private key found", path.display()))
        })
}

/// Check that `key` is the private half of `cert`'s public key by signing a
/// probe message and verifying it against the certificate.
fn verify_key_pair(
    cert: &CertificateDer<'_>,
    key: &PrivateKeyDer<'_>,
) -> Result<(), CredentialError> {
    let signing_key = any_supported_type(key)
        .map_err(|e| CredentialError::Malformed(format!("unsupported private key: {e}")))?;
    let signer = signing_key.choose_scheme(PROBE_SCHEMES).ok_or_else(|| {
        CredentialError::Malformed("private key supports no known signature scheme".to_string())
    })?;
    let scheme = signer.scheme();
    let algorithm = verification_algorithm(scheme).ok_or_else(|| {
        CredentialError::Malformed(format!("unsupported signature scheme {scheme:?}"))
    })?;
    let signature = signer
        .sign(KEY_PROBE)
        .map_err(|e| CredentialError::Malformed(format!("signing with private key failed: {e}")))?;

    let end_entity = webpki::EndEntityCert::try_from(cert)
        .map_err(|e| CredentialError::Malformed(format!("certificate: {e:?}")))?;
    end_entity
        .verify_signature(algorithm, KEY_PROBE, &signature)
        .map_err(|e| CredentialError::KeyMismatch(format!("{e:?}")))
}

fn verification_algorithm(
    scheme: SignatureScheme,
) -> Option<&'static dyn SignatureVerificationAlgorithm> {
    match scheme {
        SignatureScheme::ECDSA_NISTP256_SHA256 => Some(webpki::ring::ECDSA_P256_SHA256),
        SignatureScheme::ECDSA_NISTP384_SHA384 => Some(webpki::ring::ECDSA_P384_SHA384),
        SignatureScheme::ED25519 => Some(webpki::ring::ED25519),
        SignatureScheme::RSA_PKCS1_SHA256 => Some(webpki::ring::RSA_PKCS1_2048_8192_SHA256),
        _ => None,
    }
}
