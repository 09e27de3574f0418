//! iOS Lockdown Service Client
//!
//! Provides functionality for interacting with the lockdown service on iOS devices,
//! which guards pairing, sessions and the ports of every other service.

use std::time::Duration;

use plist::Value;
use tracing::{debug, warn};

use crate::{
    Idevice, IdeviceError, IdeviceService, pairing_file::PairingFile, provider::IdeviceProvider,
};

/// Client for interacting with the iOS lockdown service
///
/// This is the device's control channel and provides:
/// - Pairing and pairing validation
/// - Session management and the TLS upgrade
/// - Service discovery and port allocation
#[derive(Debug)]
pub struct LockdownClient {
    /// The underlying device connection with established lockdown service
    pub idevice: Idevice,
    session_id: Option<String>,
}

impl IdeviceService for LockdownClient {
    /// Returns the lockdown service name as registered with the device
    fn service_name() -> &'static str {
        "com.apple.mobile.lockdown"
    }

    async fn from_stream(idevice: Idevice) -> Result<Self, IdeviceError> {
        Ok(Self::new(idevice))
    }
}

impl LockdownClient {
    /// The default TCP port for the lockdown service
    pub const LOCKDOWND_PORT: u16 = 62078;

    const PROTOCOL_VERSION: &'static str = "2";
    const PAIR_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Creates a new lockdown client from an existing device connection
    ///
    /// # Arguments
    /// * `idevice` - Pre-established device connection
    pub fn new(idevice: Idevice) -> Self {
        Self {
            idevice,
            session_id: None,
        }
    }

    /// Opens a fresh connection to lockdown through the provider
    ///
    /// # Errors
    /// Returns `IdeviceError` if the connection can't be made
    pub async fn connect(provider: &dyn IdeviceProvider) -> Result<Self, IdeviceError> {
        let idevice = provider.connect(Self::LOCKDOWND_PORT).await?;
        Ok(Self::new(idevice))
    }

    /// Asks the service to identify itself, `com.apple.mobile.lockdown` for lockdown
    pub async fn query_type(&mut self) -> Result<String, IdeviceError> {
        self.idevice.get_type().await
    }

    /// The ID of the running session, if any
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Retrieves a value from the device
    ///
    /// # Arguments
    /// * `key` - The name of the value (e.g. `DeviceName`), `None` for the whole domain
    /// * `domain` - Domain to read from, `None` for the global domain
    ///
    /// # Errors
    /// Returns `IdeviceError` if communication fails, the value doesn't exist
    /// or the response is malformed
    pub async fn get_value(
        &mut self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Value, IdeviceError> {
        let mut req = self.request("GetValue");
        if let Some(key) = key {
            req.insert("Key".into(), key.into());
        }
        if let Some(domain) = domain {
            req.insert("Domain".into(), domain.into());
        }
        self.idevice.send_plist(req).await?;
        let mut message = self.idevice.read_plist().await?;
        match message.remove("Value") {
            Some(m) => Ok(m),
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Starts an authenticated session with the device
    ///
    /// Upgrades the connection to TLS when the device asks for it. Devices on
    /// USB always do; the upgrade happens at most once per connection.
    ///
    /// # Arguments
    /// * `pairing_file` - Contains the host identity and certificates
    ///
    /// # Errors
    /// Returns `IdeviceError` if:
    /// - A session is already running
    /// - The session request is denied (`InvalidHostID` and friends)
    /// - TLS handshake fails
    pub async fn start_session(&mut self, pairing_file: &PairingFile) -> Result<(), IdeviceError> {
        if self.session_id.is_some() {
            return Err(IdeviceError::SessionAlreadyActive);
        }

        let mut req = self.request("StartSession");
        req.insert("ProtocolVersion".into(), Self::PROTOCOL_VERSION.into());
        req.insert("HostID".into(), pairing_file.host_id.clone().into());
        req.insert("SystemBUID".into(), pairing_file.system_buid.clone().into());
        self.idevice.send_plist(req).await?;

        let response = self.idevice.read_plist().await?;
        let session_id = match response.get("SessionID").and_then(|s| s.as_string()) {
            Some(s) => s.to_string(),
            None => {
                warn!("StartSession reply carried no SessionID");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        let ssl = response
            .get("EnableSessionSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false);
        if ssl {
            self.idevice.start_session(pairing_file).await?;
        } else {
            debug!("Device did not request session SSL");
        }

        self.session_id = Some(session_id);
        Ok(())
    }

    /// Ends the running session
    pub async fn stop_session(&mut self) -> Result<(), IdeviceError> {
        let Some(session_id) = self.session_id.take() else {
            return Ok(());
        };

        let mut req = self.request("StopSession");
        req.insert("SessionID".into(), session_id.into());
        self.idevice.send_plist(req).await?;
        self.idevice.read_plist().await?;
        Ok(())
    }

    /// Requests to start a service on the device
    ///
    /// # Arguments
    /// * `identifier` - The service identifier (e.g., "com.apple.mobile.installation_proxy")
    ///
    /// # Returns
    /// A tuple containing:
    /// - The port number where the service is available
    /// - A boolean indicating whether SSL should be used
    ///
    /// # Errors
    /// `ServiceUnavailable` if the device doesn't know or run the service,
    /// `PermissionDenied` if it refuses to start it for this host
    pub async fn start_service(
        &mut self,
        identifier: impl Into<String>,
    ) -> Result<(u16, bool), IdeviceError> {
        let identifier = identifier.into();
        let mut req = self.request("StartService");
        req.insert("Service".into(), identifier.clone().into());
        self.idevice.send_plist(req).await?;
        let response = match self.idevice.read_plist().await {
            Ok(r) => r,
            Err(IdeviceError::ServiceUnavailable(_)) => {
                return Err(IdeviceError::ServiceUnavailable(identifier));
            }
            Err(e) => return Err(e),
        };

        // over USB, this option won't exist
        let ssl = response
            .get("EnableServiceSSL")
            .and_then(|s| s.as_boolean())
            .unwrap_or(false);

        match response.get("Port").and_then(|p| p.as_unsigned_integer()) {
            Some(port) => match u16::try_from(port) {
                Ok(port) => Ok((port, ssl)),
                Err(_) => {
                    warn!("Port {port} for {identifier} is out of range");
                    Err(IdeviceError::UnexpectedResponse)
                }
            },
            None => {
                warn!("Response didn't contain an integer port");
                Err(IdeviceError::UnexpectedResponse)
            }
        }
    }

    /// Checks whether the device still trusts a pairing record
    ///
    /// # Returns
    /// `false` when the device rejects the record, so the caller can re-pair
    ///
    /// # Errors
    /// Anything other than a rejection, e.g. a transport failure
    pub async fn validate_pair(&mut self, pairing_file: &PairingFile) -> Result<bool, IdeviceError> {
        let mut req = self.request("ValidatePair");
        req.insert(
            "PairRecord".into(),
            Value::Dictionary(pairing_file.to_device_record()),
        );
        req.insert("ProtocolVersion".into(), Self::PROTOCOL_VERSION.into());
        self.idevice.send_plist(req).await?;

        match self.idevice.read_plist().await {
            Ok(_) => Ok(true),
            Err(IdeviceError::PairingRejected(reason)) => {
                debug!("Pairing record rejected: {reason}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Generates a pairing record and sends it to the device for trusting.
    /// Note that this does NOT persist the record; that's the caller's job.
    /// Note that this function is computationally heavy in a debug build.
    ///
    /// While the trust dialog is up the device answers
    /// `PairingDialogResponsePending`, and the request is repeated until the
    /// user answers or `wait` runs out.
    ///
    /// # Arguments
    /// * `host_id` - The host ID, in the form of a UUID
    /// * `system_buid` - The host's system BUID, usually fetched from usbmuxd
    /// * `wait` - How long to wait for the user to answer the trust dialog
    ///
    /// # Returns
    /// The newly generated pairing record
    ///
    /// # Errors
    /// `UserDeniedTrust` if the user tapped "Don't Trust", `PairingRejected`
    /// if the device refuses or the dialog is left unanswered
    #[cfg(feature = "pair")]
    pub async fn pair(
        &mut self,
        host_id: impl Into<String>,
        system_buid: impl Into<String>,
        wait: Duration,
    ) -> Result<PairingFile, IdeviceError> {
        let pub_key = self.get_value(Some("DevicePublicKey"), None).await?;
        let pub_key = match pub_key.as_data() {
            Some(p) => p.to_vec(),
            None => {
                warn!("Did not get public key data response");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        let wifi_mac = self.get_value(Some("WiFiAddress"), None).await?;
        let wifi_mac = match wifi_mac.as_string() {
            Some(w) => w.to_string(),
            None => {
                warn!("Did not get WiFiAddress string");
                return Err(IdeviceError::UnexpectedResponse);
            }
        };

        let ca = crate::ca::generate_certificates(&pub_key, None)?;
        let mut record = PairingFile {
            device_certificate: ca.dev_cert,
            host_private_key: ca.private_key.clone(),
            host_certificate: ca.host_cert.clone(),
            root_private_key: ca.private_key,
            root_certificate: ca.host_cert,
            system_buid: system_buid.into(),
            host_id: host_id.into(),
            escrow_bag: Vec::new(),
            wifi_mac_address: wifi_mac,
            udid: None,
        };

        let mut device_record = record.to_device_record();
        device_record.insert("WiFiMACAddress".into(), record.wifi_mac_address.clone().into());

        let mut options = plist::Dictionary::new();
        options.insert("ExtendedPairingErrors".into(), true.into());

        let mut req = self.request("Pair");
        req.insert("PairRecord".into(), Value::Dictionary(device_record));
        req.insert("ProtocolVersion".into(), Self::PROTOCOL_VERSION.into());
        req.insert("PairingOptions".into(), Value::Dictionary(options));

        let deadline = tokio::time::Instant::now() + wait;
        loop {
            self.idevice.send_plist(req.clone()).await?;
            match self.idevice.read_plist().await {
                Ok(res) => {
                    if let Some(escrow) = res.get("EscrowBag").and_then(|x| x.as_data()) {
                        record.escrow_bag = escrow.to_vec();
                    }
                    debug!("Device accepted pairing");
                    break Ok(record);
                }
                Err(IdeviceError::PairingDialogResponsePending) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        break Err(IdeviceError::PairingRejected(
                            "trust dialog was not answered in time".into(),
                        ));
                    }
                    debug!("Waiting for the user to answer the trust dialog");
                    tokio::time::sleep(Self::PAIR_POLL_INTERVAL.min(deadline - now)).await;
                }
                Err(e) => break Err(e),
            }
        }
    }

    /// Removes the device's trust in a pairing record
    pub async fn unpair(&mut self, pairing_file: &PairingFile) -> Result<(), IdeviceError> {
        let mut req = self.request("Unpair");
        req.insert(
            "PairRecord".into(),
            Value::Dictionary(pairing_file.to_device_record()),
        );
        req.insert("ProtocolVersion".into(), Self::PROTOCOL_VERSION.into());
        self.idevice.send_plist(req).await?;
        self.idevice.read_plist().await?;
        Ok(())
    }

    /// Politely tells lockdown the connection is about to close
    pub async fn goodbye(&mut self) -> Result<(), IdeviceError> {
        let req = self.request("Goodbye");
        self.idevice.send_plist(req).await?;
        self.idevice.read_plist().await?;
        Ok(())
    }

    fn request(&self, request: &str) -> plist::Dictionary {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.idevice.label().into());
        req.insert("Request".into(), request.into());
        req
    }
}

impl From<Idevice> for LockdownClient {
    /// Converts an existing device connection into a lockdown client
    fn from(value: Idevice) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;
    use crate::{
        codec::{self, PlistFormat},
        pairing_file::tests::sample,
    };

    fn reply(pairs: &[(&str, Value)]) -> plist::Dictionary {
        let mut d = plist::Dictionary::new();
        for (k, v) in pairs {
            d.insert((*k).into(), v.clone());
        }
        d
    }

    /// Answers each request in order and hands back what it saw
    async fn lockdownd(
        mut server: DuplexStream,
        replies: Vec<plist::Dictionary>,
    ) -> Vec<plist::Dictionary> {
        let mut seen = Vec::new();
        for r in replies {
            seen.push(codec::read_message(&mut server).await.unwrap());
            codec::write_message(&mut server, &r, PlistFormat::Xml)
                .await
                .unwrap();
        }
        seen
    }

    fn client(stream: DuplexStream) -> LockdownClient {
        LockdownClient::new(Idevice::new(Box::new(stream), "lockdown-test"))
    }

    #[tokio::test]
    async fn session_without_ssl_stays_plaintext() {
        let (c, s) = tokio::io::duplex(4096);
        let server = tokio::spawn(lockdownd(
            s,
            vec![
                reply(&[
                    ("SessionID", "ABCD".into()),
                    ("EnableSessionSSL", false.into()),
                ]),
                reply(&[]),
            ],
        ));
        let mut lockdown = client(c);
        let record = sample();

        lockdown.start_session(&record).await.unwrap();
        assert_eq!(lockdown.session_id(), Some("ABCD"));
        assert!(!lockdown.idevice.is_tls_active());
        assert!(matches!(
            lockdown.start_session(&record).await,
            Err(IdeviceError::SessionAlreadyActive)
        ));
        lockdown.stop_session().await.unwrap();
        assert_eq!(lockdown.session_id(), None);

        let seen = server.await.unwrap();
        assert_eq!(
            seen[0].get("HostID").and_then(|h| h.as_string()),
            Some(record.host_id.as_str())
        );
        assert_eq!(
            seen[1].get("SessionID").and_then(|h| h.as_string()),
            Some("ABCD")
        );
    }

    #[tokio::test]
    async fn start_service_reports_port() {
        let (c, s) = tokio::io::duplex(4096);
        tokio::spawn(lockdownd(
            s,
            vec![reply(&[
                ("Port", 49152u64.into()),
                ("EnableServiceSSL", true.into()),
            ])],
        ));
        let mut lockdown = client(c);
        assert_eq!(
            lockdown
                .start_service("com.apple.mobile.installation_proxy")
                .await
                .unwrap(),
            (49152, true)
        );
    }

    #[tokio::test]
    async fn unknown_service_is_unavailable() {
        let (c, s) = tokio::io::duplex(4096);
        tokio::spawn(lockdownd(
            s,
            vec![
                reply(&[("Error", "InvalidService".into())]),
                reply(&[("Error", "ServiceProhibited".into())]),
            ],
        ));
        let mut lockdown = client(c);
        match lockdown.start_service("com.example.nope").await {
            Err(IdeviceError::ServiceUnavailable(name)) => assert_eq!(name, "com.example.nope"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            lockdown.start_service("com.example.secret").await,
            Err(IdeviceError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn rejected_record_fails_validation() {
        let (c, s) = tokio::io::duplex(4096);
        let server = tokio::spawn(lockdownd(
            s,
            vec![reply(&[]), reply(&[("Error", "InvalidHostID".into())])],
        ));
        let mut lockdown = client(c);
        let record = sample();
        assert!(lockdown.validate_pair(&record).await.unwrap());
        assert!(!lockdown.validate_pair(&record).await.unwrap());

        let seen = server.await.unwrap();
        let sent = seen[0]
            .get("PairRecord")
            .and_then(|r| r.as_dictionary())
            .unwrap();
        assert!(!sent.contains_key("HostPrivateKey"));
    }
}
