// Jackson Coxson
// Inspired by pymobiledevice3

use std::{str::FromStr, time::Duration};

use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPublicKey,
    pkcs1v15::SigningKey,
    pkcs8::{EncodePrivateKey, LineEnding, SubjectPublicKeyInfo},
};
use sha2::Sha256;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::EncodePem,
    name::Name,
    serial_number::SerialNumber,
    time::Validity,
};

use crate::IdeviceError;

/// Roughly ten years, like the records iTunes creates
const VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// PEM material for a new pairing record
#[derive(Clone, Debug)]
pub struct PairingCertificates {
    /// Root/host certificate, self-signed
    pub host_cert: Vec<u8>,
    /// Device certificate, signed by the host key
    pub dev_cert: Vec<u8>,
    /// Host private key, PKCS#8
    pub private_key: Vec<u8>,
}

fn make_cert(
    signing_key: &RsaPrivateKey,
    public_key: &RsaPublicKey,
    common_name: Option<&str>,
) -> Result<Certificate, Box<dyn std::error::Error>> {
    let name = match common_name {
        Some(name) => Name::from_str(&format!("CN={name}"))?,
        None => Name::default(),
    };
    let validity = Validity::from_now(VALIDITY)?;

    let signing_key = SigningKey::<Sha256>::new(signing_key.clone());
    let public_key = SubjectPublicKeyInfo::from_key(public_key.clone())?;

    let builder = CertificateBuilder::new(
        Profile::Root,
        SerialNumber::new(&[1])?,
        validity,
        name,
        public_key,
        &signing_key,
    )?;

    Ok(builder.build()?)
}

fn generate(
    device_public_key_pem: &[u8],
    private_key: Option<RsaPrivateKey>,
) -> Result<PairingCertificates, Box<dyn std::error::Error>> {
    let device_public_key =
        RsaPublicKey::from_pkcs1_pem(std::str::from_utf8(device_public_key_pem)?.trim())?;

    let private_key = match private_key {
        Some(p) => p,
        None => {
            let mut rng = rsa::rand_core::OsRng;
            RsaPrivateKey::new(&mut rng, 2048)?
        }
    };

    let host_public_key = RsaPublicKey::from(&private_key);
    let host_cert = make_cert(&private_key, &host_public_key, None)?;
    let dev_cert = make_cert(&private_key, &device_public_key, Some("Device"))?;

    Ok(PairingCertificates {
        host_cert: host_cert.to_pem(LineEnding::LF)?.into_bytes(),
        dev_cert: dev_cert.to_pem(LineEnding::LF)?.into_bytes(),
        private_key: private_key
            .to_pkcs8_pem(LineEnding::LF)?
            .as_bytes()
            .to_vec(),
    })
}

/// Mints host and device certificates for the device's public key
///
/// # Arguments
/// * `device_public_key_pem` - `DevicePublicKey` from lockdown, PKCS#1 PEM
/// * `private_key` - Host key to reuse; a fresh 2048 bit key otherwise
pub(crate) fn generate_certificates(
    device_public_key_pem: &[u8],
    private_key: Option<RsaPrivateKey>,
) -> Result<PairingCertificates, IdeviceError> {
    generate(device_public_key_pem, private_key)
        .map_err(|e| IdeviceError::CertificateGeneration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_public_key() {
        assert!(matches!(
            generate_certificates(b"not a key", None),
            Err(IdeviceError::CertificateGeneration(_))
        ));
    }
}
