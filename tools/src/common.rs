// Jackson Coxson
// Common functions between tools

#![allow(dead_code)]

use std::{
    net::{AddrParseError, IpAddr},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use instpath::{
    Device, DeviceConfig, IdeviceError,
    pairing::{MemoryPairingStore, PairingManager},
    pairing_file::PairingFile,
    provider::TcpProvider,
    usbmuxd::{Connection, UsbmuxdAddr, UsbmuxdConnection, UsbmuxdDevice},
};
use tracing_subscriber::EnvFilter;

/// Logs to stderr, filtered by `RUST_LOG`, so stdout only carries results
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// The usbmuxd address, honoring `USBMUXD_SOCKET_ADDRESS`
pub fn usbmuxd_addr() -> Result<UsbmuxdAddr, AddrParseError> {
    UsbmuxdAddr::from_env_var()
}

/// Picks the device with `udid`, or the first USB device, or the first device
pub async fn choose_device(
    addr: &UsbmuxdAddr,
    udid: Option<&String>,
) -> Result<UsbmuxdDevice, IdeviceError> {
    let mut usbmuxd = UsbmuxdConnection::new(addr.to_socket().await?, 1);
    if let Some(udid) = udid {
        return usbmuxd.get_device(udid).await;
    }

    let devs = usbmuxd.get_devices().await?;
    let usb = devs
        .iter()
        .position(|x| x.connection_type == Connection::Usb)
        .unwrap_or(0);
    devs.into_iter()
        .nth(usb)
        .ok_or(IdeviceError::DeviceNotFound)
}

/// Connection options shared by the tools
pub struct Target<'a> {
    pub udid: Option<&'a String>,
    pub host: Option<&'a String>,
    pub pairing_file: Option<&'a String>,
    pub label: &'a str,
    pub timeout: Option<Duration>,
    pub auto_pair: bool,
}

/// Connects to the device the arguments describe
///
/// `host` and `pairing_file` connect straight over the network with the given
/// record; otherwise the device is found through usbmuxd.
pub async fn connect(target: Target<'_>) -> Result<Device, IdeviceError> {
    let mut config = DeviceConfig {
        label: target.label.to_string(),
        timeout: target.timeout,
        auto_pair: target.auto_pair,
        ..Default::default()
    };

    match (target.host, target.pairing_file) {
        (Some(host), Some(pairing_file)) => {
            let addr = IpAddr::from_str(host)?;
            let record = PairingFile::read_from_file(pairing_file)?;
            let udid = target
                .udid
                .cloned()
                .or_else(|| record.udid.clone())
                .unwrap_or_else(|| host.clone());

            let provider = TcpProvider {
                addr,
                udid: udid.clone(),
                label: target.label.to_string(),
            };
            // a new record would have nowhere to go
            config.auto_pair = false;
            let pairing = PairingManager::new(Arc::new(MemoryPairingStore::with_record(
                udid, record,
            )));
            Device::from_provider(Box::new(provider), &config, &pairing).await
        }
        _ => {
            config.usbmuxd_addr = usbmuxd_addr()?;
            let dev = choose_device(&config.usbmuxd_addr, target.udid).await?;
            Device::connect(&dev.udid, &config).await
        }
    }
}
