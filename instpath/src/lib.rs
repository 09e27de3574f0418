#![doc = include_str!("../README.md")]
// Jackson Coxson

#[cfg(feature = "pair")]
mod ca;
pub mod codec;
pub mod device;
pub mod pairing;
pub mod pairing_file;
pub mod provider;
mod sni;
#[cfg(feature = "usbmuxd")]
pub mod usbmuxd;
mod util;

pub mod services;
pub use services::*;

pub use device::{Device, DeviceConfig};

use std::{io, time::Duration};

use codec::{Message, PlistFormat};
use device::Lifeline;
use rustls::{crypto::CryptoProvider, pki_types::ServerName};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

pub use util::{pretty_print_dictionary, pretty_print_plist};

/// A trait combining all required characteristics for a device communication socket
///
/// Tokio's TcpStream, UnixStream and DuplexStream implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for services that can be started on an iOS device
///
/// Implement this trait to expose a typed client for a lockdown service. The
/// [`Device`] multiplexer asks lockdown for [`IdeviceService::service_name`] and
/// hands the resulting connection to [`IdeviceService::from_stream`].
pub trait IdeviceService: Sized {
    /// Returns the service name as advertised by the device
    fn service_name() -> &'static str;

    /// Wraps an already established service connection
    fn from_stream(
        idevice: Idevice,
    ) -> impl std::future::Future<Output = Result<Self, IdeviceError>> + Send;
}

/// Type alias for boxed device connection sockets
pub type IdeviceSocket = Box<dyn ReadWrite>;

/// Main handle for communicating with an iOS device
///
/// One `Idevice` is one logical channel: the lockdown control channel, or a
/// service connection handed out by [`Device::start_service`]. Requests and
/// responses on a channel are strictly ordered; the `&mut self` receivers make
/// pipelining impossible.
pub struct Idevice {
    /// The underlying connection socket, boxed for dynamic dispatch
    socket: Option<Box<dyn ReadWrite>>,
    /// Unique label identifying this connection
    label: String,
    /// Upper bound for every read
    timeout: Option<Duration>,
    /// Set while a frame is partially written or read
    in_frame: bool,
    /// Whether the socket was upgraded to TLS
    tls_active: bool,
    /// Liveness of the device this channel belongs to
    lifeline: Option<Lifeline>,
}

impl std::fmt::Debug for Idevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Idevice")
            .field("label", &self.label)
            .field("connected", &self.socket.is_some())
            .field("tls_active", &self.tls_active)
            .finish()
    }
}

impl Idevice {
    /// Creates a new device connection handle
    ///
    /// # Arguments
    /// * `socket` - The established connection socket
    /// * `label` - Unique identifier for this connection
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
            timeout: None,
            in_frame: false,
            tls_active: false,
            lifeline: None,
        }
    }

    /// The label sent to the device with requests
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Bounds every subsequent read by `timeout`
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The bound applied to reads, `None` if they wait forever
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Ties this connection to the lifetime of its parent device
    pub(crate) fn attach(&mut self, lifeline: Lifeline) {
        self.lifeline = Some(lifeline);
    }

    /// Whether the connection can still carry traffic
    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
            && !self.in_frame
            && self.lifeline.as_ref().is_none_or(|l| l.is_alive())
    }

    /// Whether the socket has been upgraded to TLS
    pub fn is_tls_active(&self) -> bool {
        self.tls_active
    }

    /// Closes the underlying socket
    pub async fn close(&mut self) -> Result<(), IdeviceError> {
        if let Some(mut socket) = self.socket.take() {
            socket.shutdown().await?;
        }
        Ok(())
    }

    /// Queries the device type
    ///
    /// Sends a QueryType request and parses the response
    ///
    /// # Returns
    /// The device type string on success
    ///
    /// # Errors
    /// Returns `IdeviceError` if communication fails or response is invalid
    pub async fn get_type(&mut self) -> Result<String, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("Label".into(), self.label.clone().into());
        req.insert("Request".into(), "QueryType".into());
        self.send_plist(req).await?;
        let message = self.read_plist().await?;
        match message.get("Type").and_then(|t| t.as_string()) {
            Some(t) => Ok(t.to_string()),
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Sends an XML plist message to the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if serialization or transmission fails
    pub async fn send_plist(&mut self, message: Message) -> Result<(), IdeviceError> {
        debug!("Sending plist: {}", pretty_print_dictionary(&message));
        let frame = codec::encode(&message, PlistFormat::Xml)?;
        self.write_frame(&frame).await
    }

    /// Sends a binary plist message to the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if serialization or transmission fails
    pub async fn send_bplist(&mut self, message: Message) -> Result<(), IdeviceError> {
        debug!("Sending bplist: {}", pretty_print_dictionary(&message));
        let frame = codec::encode(&message, PlistFormat::Binary)?;
        self.write_frame(&frame).await
    }

    /// Sends raw binary data to the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if transmission fails
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), IdeviceError> {
        trace!("Writing {} raw bytes", message.len());
        self.write_frame(message).await
    }

    /// Reads exactly `len` bytes from the device
    ///
    /// # Errors
    /// Returns `IdeviceError` if reading fails, times out or the connection is
    /// closed prematurely
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, IdeviceError> {
        self.ensure_usable()?;
        let timeout = self.timeout;
        let Some(socket) = self.socket.as_mut() else {
            return Err(IdeviceError::NoEstablishedConnection);
        };
        self.in_frame = true;
        let res = util::bounded(timeout, async {
            let mut buf = vec![0; len];
            socket.read_exact(&mut buf).await?;
            Ok(buf)
        })
        .await;
        self.settle(res)
    }

    /// Reads a plist message from the device
    ///
    /// # Returns
    /// The parsed plist dictionary
    ///
    /// # Errors
    /// Returns `IdeviceError` if reading or parsing fails, times out, or the
    /// device reports an error
    pub async fn read_plist(&mut self) -> Result<Message, IdeviceError> {
        self.ensure_usable()?;
        let timeout = self.timeout;
        let Some(socket) = self.socket.as_mut() else {
            return Err(IdeviceError::NoEstablishedConnection);
        };
        self.in_frame = true;
        let res = util::bounded(timeout, codec::read_frame(socket)).await;
        if let Err(IdeviceError::MalformedMessage(reason)) = &res {
            // the body was never read, so the next prefix can't be found
            warn!("Lost frame boundary on {}: {reason}", self.label);
            self.socket = None;
        }
        let body = self.settle(res)?;
        let res = codec::decode_body(&body)?;
        debug!("Received plist: {}", pretty_print_dictionary(&res));

        if let Some(e) = res.get("Error").and_then(|e| e.as_string()) {
            return Err(IdeviceError::from_device_error_type(e, &res));
        }
        Ok(res)
    }

    /// Upgrades the connection to TLS using device pairing credentials
    ///
    /// A connection switches to TLS at most once.
    ///
    /// # Errors
    /// Returns `IdeviceError` if TLS handshake fails or credentials are invalid
    pub async fn start_session(
        &mut self,
        pairing_file: &pairing_file::PairingFile,
    ) -> Result<(), IdeviceError> {
        if self.tls_active {
            return Err(IdeviceError::SessionAlreadyActive);
        }
        self.ensure_usable()?;
        install_crypto_provider();

        let config = sni::create_client_config(pairing_file)?;
        let connector = tokio_rustls::TlsConnector::from(std::sync::Arc::new(config));
        let server_name = ServerName::try_from("Device")
            .map_err(|e| IdeviceError::InternalError(e.to_string()))?;

        let Some(socket) = self.socket.take() else {
            return Err(IdeviceError::NoEstablishedConnection);
        };
        let res = util::bounded(self.timeout, async {
            Ok(connector.connect(server_name, socket).await?)
        })
        .await;
        let socket = self.settle(res)?;

        self.socket = Some(Box::new(socket));
        self.tls_active = true;
        debug!("TLS session established for {}", self.label);

        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), IdeviceError> {
        self.ensure_usable()?;
        let timeout = self.timeout;
        let Some(socket) = self.socket.as_mut() else {
            return Err(IdeviceError::NoEstablishedConnection);
        };
        self.in_frame = true;
        let res = util::bounded(timeout, codec::write_frame(socket, frame)).await;
        self.settle(res)
    }

    /// Fails if the parent device is gone or a previous frame was abandoned
    /// halfway. Either way the socket is dropped.
    fn ensure_usable(&mut self) -> Result<(), IdeviceError> {
        if self.lifeline.as_ref().is_some_and(|l| !l.is_alive()) {
            if self.socket.take().is_some() {
                debug!("Device for {} is gone, dropping connection", self.label);
            }
            return Err(IdeviceError::NoEstablishedConnection);
        }
        if self.in_frame {
            warn!(
                "Connection {} was interrupted mid-frame, tearing it down",
                self.label
            );
            self.socket = None;
            self.in_frame = false;
            return Err(IdeviceError::NoEstablishedConnection);
        }
        Ok(())
    }

    /// Clears the in-frame marker and drops the socket on transport failures
    ///
    /// A transport failure also takes down the device this channel belongs to.
    fn settle<T>(&mut self, res: Result<T, IdeviceError>) -> Result<T, IdeviceError> {
        self.in_frame = false;
        if let Err(e) = &res {
            if e.is_transport() {
                warn!("Transport failure on {}: {e}", self.label);
                self.socket = None;
                if let Some(lifeline) = &self.lifeline {
                    lifeline.kill();
                }
            }
        }
        res
    }
}

fn install_crypto_provider() {
    if CryptoProvider::get_default().is_some() {
        return;
    }
    #[cfg(feature = "aws-lc")]
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(feature = "ring", not(feature = "aws-lc")))]
    let provider = rustls::crypto::ring::default_provider();

    // Racing installers get an error here; the winner's provider is just as good.
    if let Err(e) = CryptoProvider::install_default(provider) {
        debug!("Crypto provider already installed: {e:?}");
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[repr(i32)]
#[non_exhaustive]
pub enum IdeviceError {
    #[error("device socket io failed")]
    Socket(io::Error) = -1,
    #[error("PEM parse failed")]
    PemParseFailed(#[from] rustls::pki_types::pem::Error) = -2,
    #[error("TLS error")]
    Rustls(#[from] rustls::Error) = -3,
    #[error("io on plist")]
    Plist(#[from] plist::Error) = -4,
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error) = -5,
    #[error("unexpected response from device")]
    UnexpectedResponse = -6,
    #[error("no established connection")]
    NoEstablishedConnection = -7,
    #[error("a TLS session is already active on this connection")]
    SessionAlreadyActive = -8,
    #[error("not found")]
    NotFound = -9,

    #[error("device not found, is it plugged in?")]
    DeviceNotFound = -10,
    #[error("timed out waiting for the device")]
    ConnectionTimeout = -11,
    #[error("connection to the device was reset")]
    ConnectionReset = -12,

    #[error("device rejected pairing: {0}")]
    PairingRejected(String) = -13,
    #[error("user denied pairing trust")]
    UserDeniedTrust = -14,
    #[error("pairing trust dialog pending")]
    PairingDialogResponsePending = -15,
    #[error("host is not paired with {0}")]
    NotPaired(String) = -27,

    #[error("service `{0}` is unavailable")]
    ServiceUnavailable(String) = -16,
    #[error("permission denied: {0}")]
    PermissionDenied(String) = -17,

    #[error("malformed message: {0}")]
    MalformedMessage(String) = -18,

    #[error("no application installed with bundle identifier `{0}`")]
    AppNotFound(String) = -19,
    #[error("device reported `{error}`: {}", .description.as_deref().unwrap_or("no description"))]
    ServiceError {
        error: String,
        description: Option<String>,
    } = -20,

    #[error("bad command")]
    UsbBadCommand = -21,
    #[error("device refused connection")]
    UsbConnectionRefused = -22,
    #[error("usb bad version")]
    UsbBadVersion = -23,

    #[error("internal error: {0}")]
    InternalError(String) = -24,

    #[cfg(feature = "pair")]
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String) = -25,

    #[error("cannot parse string as IpAddr")]
    AddrParseError(#[from] std::net::AddrParseError) = -26,
}

impl From<io::Error> for IdeviceError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            io::ErrorKind::TimedOut => Self::ConnectionTimeout,
            _ => Self::Socket(e),
        }
    }
}

impl IdeviceError {
    /// Converts a device-reported error string to a typed error
    ///
    /// # Arguments
    /// * `e` - The error string from device
    /// * `context` - Full plist context containing additional error details
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Self {
        match e {
            "InvalidHostID"
            | "InvalidPairRecord"
            | "PairingProhibitedOverThisConnection"
            | "PasswordProtected" => Self::PairingRejected(e.to_string()),
            "UserDeniedPairing" => Self::UserDeniedTrust,
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "InvalidService" | "ServiceNotFound" => Self::ServiceUnavailable(
                context
                    .get("Service")
                    .and_then(|s| s.as_string())
                    .unwrap_or(e)
                    .to_string(),
            ),
            "ServiceProhibited" | "NoRunningSession" | "SessionInactive" | "EscrowLocked"
            | "ServiceLimit" | "GetProhibited" => Self::PermissionDenied(e.to_string()),
            "InternalError" => Self::InternalError(
                context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string(),
            ),
            _ => Self::ServiceError {
                error: e.to_string(),
                description: context
                    .get("ErrorDescription")
                    .and_then(|d| d.as_string())
                    .map(|d| d.to_string()),
            },
        }
    }

    /// Whether this error leaves the connection unusable
    ///
    /// Transport errors tear down the connection they happened on; protocol
    /// errors only fail the request in flight.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Socket(_)
                | Self::Rustls(_)
                | Self::ConnectionTimeout
                | Self::ConnectionReset
                | Self::NoEstablishedConnection
        )
    }

    pub fn code(&self) -> i32 {
        match self {
            IdeviceError::Socket(_) => -1,
            IdeviceError::PemParseFailed(_) => -2,
            IdeviceError::Rustls(_) => -3,
            IdeviceError::Plist(_) => -4,
            IdeviceError::Utf8(_) => -5,
            IdeviceError::UnexpectedResponse => -6,
            IdeviceError::NoEstablishedConnection => -7,
            IdeviceError::SessionAlreadyActive => -8,
            IdeviceError::NotFound => -9,
            IdeviceError::DeviceNotFound => -10,
            IdeviceError::ConnectionTimeout => -11,
            IdeviceError::ConnectionReset => -12,
            IdeviceError::PairingRejected(_) => -13,
            IdeviceError::UserDeniedTrust => -14,
            IdeviceError::PairingDialogResponsePending => -15,
            IdeviceError::ServiceUnavailable(_) => -16,
            IdeviceError::PermissionDenied(_) => -17,
            IdeviceError::MalformedMessage(_) => -18,
            IdeviceError::AppNotFound(_) => -19,
            IdeviceError::ServiceError { .. } => -20,
            IdeviceError::UsbBadCommand => -21,
            IdeviceError::UsbConnectionRefused => -22,
            IdeviceError::UsbBadVersion => -23,
            IdeviceError::InternalError(_) => -24,
            #[cfg(feature = "pair")]
            IdeviceError::CertificateGeneration(_) => -25,
            IdeviceError::AddrParseError(_) => -26,
            IdeviceError::NotPaired(_) => -27,
        }
    }
}
