// Jackson Coxson

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    IdeviceError,
    usbmuxd::{Connection, UsbmuxdDevice},
};

/// Reply to `ListDevices`
#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceListResponse>,
}

/// One entry of the device list, also the body of an `Attached` event
#[derive(Clone, Debug, Deserialize)]
pub struct DeviceListResponse {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DevicePropertiesResponse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DevicePropertiesResponse {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
}

const AF_INET: u8 = 0x02;
// Darwin's AF_INET6; usbmuxd forwards the raw sockaddr from the mac side
const AF_INET6_DARWIN: u8 = 0x1E;
const AF_INET6_LINUX: u8 = 0x0A;

/// Decodes the `sockaddr` usbmuxd reports for network devices
///
/// BSD layouts start with a length byte followed by the family; Linux layouts
/// start with a little-endian `u16` family. Both put the IPv4 address at byte 4
/// and the IPv6 address at byte 8.
pub fn parse_network_address(addr: &[u8]) -> Result<IpAddr, IdeviceError> {
    let family = match addr {
        [len, family, ..] if *len as usize == addr.len() || *len == 0x10 || *len == 0x1C => {
            *family
        }
        [family, 0, ..] => *family,
        [family, ..] => *family,
        [] => return Err(IdeviceError::UnexpectedResponse),
    };

    match family {
        AF_INET => match addr.get(4..8) {
            Some(b) => Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))),
            None => {
                warn!("IPv4 sockaddr too short (len {})", addr.len());
                Err(IdeviceError::UnexpectedResponse)
            }
        },
        AF_INET6_DARWIN | AF_INET6_LINUX => match addr.get(8..24) {
            Some(b) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                Ok(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            None => {
                warn!("IPv6 sockaddr too short (len {})", addr.len());
                Err(IdeviceError::UnexpectedResponse)
            }
        },
        f => {
            warn!("Unknown address family {f:02X}");
            Err(IdeviceError::UnexpectedResponse)
        }
    }
}

impl DeviceListResponse {
    pub fn into_usbmuxd_dev(self) -> Result<UsbmuxdDevice, IdeviceError> {
        self.try_into()
    }
}

impl TryFrom<DeviceListResponse> for UsbmuxdDevice {
    type Error = IdeviceError;

    fn try_from(dev: DeviceListResponse) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "USB" => Connection::Usb,
            "Network" => match dev.properties.network_address {
                Some(addr) => {
                    let addr: Vec<u8> = addr.into();
                    match parse_network_address(&addr) {
                        Ok(ip) => Connection::Network(ip),
                        Err(_) => Connection::Unknown(format!("Network {addr:02X?}")),
                    }
                }
                None => {
                    warn!("Device is network attached, but has no network info");
                    return Err(IdeviceError::UnexpectedResponse);
                }
            },
            _ => Connection::Unknown(dev.properties.connection_type),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
        })
    }
}
