//! iOS Device Pairing File Handling
//!
//! Provides functionality for reading, writing, and manipulating iOS device pairing files
//! which contain the cryptographic materials needed for secure communication with devices.

use std::path::Path;

use plist::Data;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::IdeviceError;

/// Represents a complete iOS device pairing record
///
/// Certificates and keys are kept PEM encoded, exactly as lockdown and usbmuxd
/// exchange them, so a record survives a read/write cycle byte for byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingFile {
    /// Device's certificate, PEM
    pub device_certificate: Vec<u8>,
    /// Host's private key, PEM
    pub host_private_key: Vec<u8>,
    /// Host's certificate, PEM
    pub host_certificate: Vec<u8>,
    /// Root CA's private key, PEM
    pub root_private_key: Vec<u8>,
    /// Root CA's certificate, PEM
    pub root_certificate: Vec<u8>,
    /// System Build Unique Identifier
    pub system_buid: String,
    /// Host identifier
    pub host_id: String,
    /// Escrow bag allowing for access while locked
    pub escrow_bag: Vec<u8>,
    /// Device's WiFi MAC address
    pub wifi_mac_address: String,
    /// Device's Unique Device Identifier (optional)
    pub udid: Option<String>,
}

/// Internal representation of a pairing file for serialization/deserialization
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairingFile {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_private_key: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress")]
    wifi_mac_address: String,
    #[serde(rename = "UDID", default, skip_serializing_if = "Option::is_none")]
    udid: Option<String>,
}

impl PairingFile {
    /// Reads a pairing file from disk
    ///
    /// # Errors
    /// Returns `IdeviceError` if the file cannot be read or is malformed
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, IdeviceError> {
        let f = std::fs::read(path)?;
        Self::from_bytes(&f)
    }

    /// Parses a pairing file from raw plist bytes (XML or binary)
    ///
    /// # Errors
    /// Returns `IdeviceError` if:
    /// - The data cannot be parsed as PLIST
    /// - Required fields are missing
    /// - Certificates are not valid PEM
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdeviceError> {
        let r = match plist::from_bytes::<RawPairingFile>(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to convert bytes to raw pairing file: {e:?}");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        match r.try_into() {
            Ok(r) => Ok(r),
            Err(e) => {
                warn!("Unable to convert raw pairing file into pairing file: {e:?}");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Creates a pairing file from a plist value
    ///
    /// # Errors
    /// Returns `IdeviceError` if required fields are missing or certificates
    /// are invalid
    pub fn from_value(v: &plist::Value) -> Result<Self, IdeviceError> {
        let raw: RawPairingFile = plist::from_value(v)?;
        let p = raw.try_into()?;
        Ok(p)
    }

    /// Serializes the pairing file to an XML plist
    ///
    /// # Errors
    /// Returns `IdeviceError` if serialization fails
    pub fn serialize(&self) -> Result<Vec<u8>, IdeviceError> {
        let raw = RawPairingFile::from(self.clone());

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }

    /// The host certificate in DER form, for the TLS client identity
    pub fn host_certificate_der(&self) -> Result<CertificateDer<'static>, IdeviceError> {
        Ok(CertificateDer::from_pem_slice(&self.host_certificate)?)
    }

    /// The host private key in DER form, for the TLS client identity
    pub fn host_private_key_der(&self) -> Result<PrivateKeyDer<'static>, IdeviceError> {
        Ok(PrivateKeyDer::from_pem_slice(&self.host_private_key)?)
    }

    /// The subset of the record lockdown expects in `ValidatePair` and
    /// `Unpair` requests. Private keys never leave the host.
    pub fn to_device_record(&self) -> plist::Dictionary {
        let mut record = plist::Dictionary::new();
        record.insert(
            "DeviceCertificate".into(),
            plist::Value::Data(self.device_certificate.clone()),
        );
        record.insert(
            "HostCertificate".into(),
            plist::Value::Data(self.host_certificate.clone()),
        );
        record.insert("HostID".into(), self.host_id.clone().into());
        record.insert(
            "RootCertificate".into(),
            plist::Value::Data(self.root_certificate.clone()),
        );
        record.insert("SystemBUID".into(), self.system_buid.clone().into());
        record
    }
}

impl TryFrom<RawPairingFile> for PairingFile {
    type Error = rustls::pki_types::pem::Error;

    /// Attempts to convert a raw pairing file into a structured pairing file
    ///
    /// Every certificate must parse as PEM.
    fn try_from(value: RawPairingFile) -> Result<Self, Self::Error> {
        let device_certificate: Vec<u8> = value.device_certificate.into();
        let host_certificate: Vec<u8> = value.host_certificate.into();
        let root_certificate: Vec<u8> = value.root_certificate.into();
        for cert in [&device_certificate, &host_certificate, &root_certificate] {
            CertificateDer::from_pem_slice(cert)?;
        }

        Ok(Self {
            device_certificate,
            host_private_key: value.host_private_key.into(),
            host_certificate,
            root_private_key: value.root_private_key.into(),
            root_certificate,
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into).unwrap_or_default(),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

impl From<PairingFile> for RawPairingFile {
    /// Converts a structured pairing file into a raw pairing file for serialization
    fn from(value: PairingFile) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate),
            host_private_key: Data::new(value.host_private_key),
            host_certificate: Data::new(value.host_certificate),
            root_private_key: Data::new(value.root_private_key),
            root_certificate: Data::new(value.root_certificate),
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: (!value.escrow_bag.is_empty()).then(|| Data::new(value.escrow_bag)),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        }
    }
}
