//! USB Multiplexing Daemon (usbmuxd) Client
//!
//! Provides functionality for interacting with the usbmuxd service which manages
//! connections to iOS devices over USB and network and stores pairing records

use std::{
    net::{AddrParseError, IpAddr, SocketAddr},
    pin::Pin,
    str::FromStr,
    time::Duration,
};

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use futures::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    Idevice, IdeviceError, ReadWrite, pairing_file::PairingFile, provider::UsbmuxdProvider,
    usbmuxd::des::DeviceListResponse, util,
};

mod des;
mod raw_packet;

pub use des::parse_network_address;

/// Represents the connection type of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connection {
    /// Connected via USB
    Usb,
    /// Connected via network with specific IP address
    Network(IpAddr),
    /// Unknown connection type with description
    Unknown(String),
}

/// Represents a device connected through usbmuxd
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    /// How the device is connected
    pub connection_type: Connection,
    /// Unique Device Identifier
    pub udid: String,
    /// usbmuxd-assigned device ID
    pub device_id: u32,
}

/// Listen events from the socket
#[derive(Debug, Clone)]
pub enum UsbmuxdListenEvent {
    Connected(UsbmuxdDevice),
    /// The mux ID
    Disconnected(u32),
}

/// Active connection to the usbmuxd service
///
/// Every reply is awaited for at most [`UsbmuxdConnection::DEFAULT_TIMEOUT`]
/// unless changed with [`UsbmuxdConnection::set_timeout`]. Events from
/// [`UsbmuxdConnection::listen`] are awaited indefinitely.
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
    timeout: Option<Duration>,
}

/// Address of the usbmuxd service
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    /// Default TCP port for usbmuxd
    pub const DEFAULT_PORT: u16 = 27015;
    /// Default Unix socket path for usbmuxd
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";
    /// Environment variable overriding the address
    pub const ENV_VAR: &'static str = "USBMUXD_SOCKET_ADDRESS";

    /// Connects to the usbmuxd service
    ///
    /// # Errors
    /// Returns `IdeviceError` if connection fails
    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, IdeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    /// Creates a new usbmuxd connection
    ///
    /// # Arguments
    /// * `tag` - Connection tag/identifier echoed back in replies
    pub async fn connect(&self, tag: u32) -> Result<UsbmuxdConnection, IdeviceError> {
        let socket =
            util::bounded(Some(UsbmuxdConnection::DEFAULT_TIMEOUT), self.to_socket()).await?;
        Ok(UsbmuxdConnection::new(socket, tag))
    }

    /// Parses an address the way `USBMUXD_SOCKET_ADDRESS` is written:
    /// `host:port` for TCP, anything else is a unix socket path
    pub fn parse(var: &str) -> Result<Self, AddrParseError> {
        #[cfg(unix)]
        if var.contains(':') {
            Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
        } else {
            Ok(Self::UnixSocket(var.to_string()))
        }
        #[cfg(not(unix))]
        Ok(Self::TcpSocket(SocketAddr::from_str(var)?))
    }

    /// Creates a UsbmuxdAddr from environment variable
    ///
    /// Checks `USBMUXD_SOCKET_ADDRESS` environment variable, falls back to default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        match std::env::var(Self::ENV_VAR) {
            Ok(var) => Self::parse(&var),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl Default for UsbmuxdAddr {
    /// Creates default usbmuxd address based on platform:
    /// - Unix: Uses default socket path
    /// - Non-Unix: Uses localhost TCP port
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

impl UsbmuxdConnection {
    /// Binary PLIST protocol version
    pub const BINARY_PLIST_VERSION: u32 = 0;
    /// XML PLIST protocol version
    pub const XML_PLIST_VERSION: u32 = 1;

    /// Result message type
    pub const RESULT_MESSAGE_TYPE: u32 = 1;
    /// PLIST message type
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    /// How long a reply may take by default
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    const CLIENT_VERSION: &'static str = concat!("instpath-", env!("CARGO_PKG_VERSION"));
    const PROG_NAME: &'static str = "instpath";

    /// Creates a default usbmuxd connection
    ///
    /// Honors `USBMUXD_SOCKET_ADDRESS`, otherwise uses the platform default
    pub async fn default() -> Result<Self, IdeviceError> {
        let addr = UsbmuxdAddr::from_env_var()?;
        addr.connect(0).await
    }

    /// Creates a new usbmuxd connection
    ///
    /// # Arguments
    /// * `socket` - The transport stream
    /// * `tag` - Connection tag/identifier
    pub fn new(socket: Box<dyn ReadWrite>, tag: u32) -> Self {
        Self {
            socket,
            tag,
            timeout: Some(Self::DEFAULT_TIMEOUT),
        }
    }

    /// Bounds how long each reply is awaited, `None` waits forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Lists all connected devices
    ///
    /// # Errors
    /// Returns `IdeviceError` if communication fails or the response is malformed.
    /// Entries that can't be understood are skipped.
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;
        let res = plist::from_value::<des::ListDevicesResponse>(&plist::Value::Dictionary(res))?;

        let devs = res
            .device_list
            .into_iter()
            .filter_map(|x| match x.into_usbmuxd_dev() {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!("Skipping device list entry: {e}");
                    None
                }
            })
            .collect::<Vec<UsbmuxdDevice>>();

        Ok(devs)
    }

    /// Gets a specific device by UDID
    ///
    /// # Errors
    /// `DeviceNotFound` if no attached device has that UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, IdeviceError> {
        let devices = self.get_devices().await?;
        match devices.into_iter().find(|x| x.udid == udid) {
            Some(d) => Ok(d),
            None => Err(IdeviceError::DeviceNotFound),
        }
    }

    /// Gets the pairing record usbmuxd holds for a device
    ///
    /// # Errors
    /// `NotFound` if usbmuxd has no record for the UDID
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairingFile, IdeviceError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        let res = self.read_plist().await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairingFile::from_bytes(d),
            _ => match res.get("Number").and_then(|n| n.as_unsigned_integer()) {
                Some(n) if n != 0 => Err(IdeviceError::NotFound),
                _ => Err(IdeviceError::UnexpectedResponse),
            },
        }
    }

    /// Gets the BUID
    ///
    /// # Returns
    /// The host's system BUID, shared by every pairing record usbmuxd makes
    pub async fn get_buid(&mut self) -> Result<String, IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        self.write_plist(req).await?;
        let mut res = self.read_plist().await?;

        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Connects to a port on the device
    ///
    /// Consumes the connection: once usbmuxd accepts, the socket is a raw pipe
    /// to the device port.
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID
    /// * `port` - TCP port to connect to (host byte order)
    /// * `label` - Connection label
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<Idevice, IdeviceError> {
        debug!("Connecting to device {device_id} on port {port}");
        let port = port.to_be();

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.into());
        self.write_plist(req).await?;
        match self.read_result().await? {
            0 => Ok(Idevice::new(self.socket, label)),
            1 => Err(IdeviceError::UsbBadCommand),
            2 => Err(IdeviceError::DeviceNotFound),
            3 => Err(IdeviceError::UsbConnectionRefused),
            6 => Err(IdeviceError::UsbBadVersion),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Tells usbmuxd to save the pairing record in its storage
    ///
    /// # Arguments
    /// * `device_id` - usbmuxd device ID, 0 if unknown
    /// * `udid` - the device UDID/serial
    /// * `pair_record` - a serialized plist of the pair record
    pub async fn save_pair_record(
        &mut self,
        device_id: u32,
        udid: &str,
        pair_record: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "SavePairRecord".into());
        req.insert("PairRecordData".into(), plist::Value::Data(pair_record));
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        match self.read_result().await? {
            0 => Ok(()),
            _ => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Removes the pairing record usbmuxd holds for a device
    pub async fn delete_pair_record(&mut self, udid: &str) -> Result<(), IdeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "DeletePairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        self.write_plist(req).await?;
        match self.read_result().await? {
            0 => Ok(()),
            _ => Err(IdeviceError::NotFound),
        }
    }

    /// Subscribes to attach and detach events
    pub async fn listen<'a>(
        &'a mut self,
    ) -> Result<
        Pin<Box<dyn Stream<Item = Result<UsbmuxdListenEvent, IdeviceError>> + Send + 'a>>,
        IdeviceError,
    > {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        self.write_plist(req).await?;

        if self.read_result().await? != 0 {
            return Err(IdeviceError::UnexpectedResponse);
        }

        let stream = futures::stream::try_unfold(self, |conn| async move {
            // Skip anything that isn't an attach or detach
            loop {
                let msg = conn.read_packet().await?;

                match msg.get("MessageType").and_then(|x| x.as_string()) {
                    Some("Attached") => {
                        let dev = plist::from_value::<DeviceListResponse>(
                            &plist::Value::Dictionary(msg),
                        )
                        .map_err(IdeviceError::from)
                        .and_then(|d| d.into_usbmuxd_dev());
                        match dev {
                            Ok(dev) => return Ok(Some((UsbmuxdListenEvent::Connected(dev), conn))),
                            Err(e) => warn!("Malformed attach event: {e}"),
                        }
                    }
                    Some("Detached") => {
                        match msg.get("DeviceID").and_then(|v| v.as_unsigned_integer()) {
                            Some(id) => {
                                return Ok(Some((
                                    UsbmuxdListenEvent::Disconnected(id as u32),
                                    conn,
                                )));
                            }
                            None => debug!("Device detached (unknown ID)"),
                        }
                    }
                    Some(other) => warn!("Received unexpected message type during listen: {other}"),
                    None => warn!("Received malformed message during listen (no MessageType)"),
                }
            }
        });

        Ok(Box::pin(stream))
    }

    /// Reads the `Number` of a `Result` reply
    async fn read_result(&mut self) -> Result<u64, IdeviceError> {
        let res = self.read_plist().await?;
        match res.get("Number").and_then(|n| n.as_unsigned_integer()) {
            Some(n) => Ok(n),
            None => Err(IdeviceError::UnexpectedResponse),
        }
    }

    /// Writes a PLIST message to usbmuxd
    async fn write_plist(&mut self, mut req: plist::Dictionary) -> Result<(), IdeviceError> {
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        req.insert("ProgName".into(), Self::PROG_NAME.into());
        req.insert("kLibUSBMuxVersion".into(), 3u64.into());
        debug!("Writing to muxer: {}", crate::pretty_print_dictionary(&req));

        let raw = raw_packet::RawPacket::new(
            req,
            Self::XML_PLIST_VERSION,
            Self::PLIST_MESSAGE_TYPE,
            self.tag,
        )
        .encode()?;
        self.socket.write_all(&raw).await?;
        self.socket.flush().await?;

        Ok(())
    }

    /// Reads a reply, bounded by the connection timeout
    async fn read_plist(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let timeout = self.timeout;
        util::bounded(timeout, self.read_packet()).await
    }

    /// Reads a PLIST message from usbmuxd
    async fn read_packet(&mut self) -> Result<plist::Dictionary, IdeviceError> {
        let mut header = [0; raw_packet::HEADER_SIZE];
        self.socket.read_exact(&mut header).await?;
        let header = raw_packet::RawHeader::parse(&header);
        let packet_size = header.body_len()?;
        debug!("Reading {packet_size} bytes from muxer");

        let mut body_buffer = vec![0; packet_size];
        self.socket.read_exact(&mut body_buffer).await?;

        let res = plist::from_bytes(&body_buffer)?;
        debug!("Read from muxer: {}", crate::pretty_print_dictionary(&res));

        Ok(res)
    }
}

impl UsbmuxdDevice {
    /// Creates a provider for this device
    ///
    /// # Arguments
    /// * `addr` - usbmuxd address
    /// * `label` - Connection label
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            tag: self.device_id,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}
