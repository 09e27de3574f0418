// Jackson Coxson

use std::{future::Future, pin::Pin};

#[cfg(feature = "tcp")]
use std::net::{IpAddr, SocketAddr};

#[cfg(feature = "tcp")]
use tokio::net::TcpStream;

use crate::{Idevice, IdeviceError};

#[cfg(feature = "usbmuxd")]
use crate::usbmuxd::UsbmuxdAddr;

/// A provider for connecting to a port on the iOS device
///
/// Every call to `connect` opens a brand new transport connection. This is an
/// ugly trait until async traits are object safe.
pub trait IdeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send>>;

    /// Label sent along with lockdown requests
    fn label(&self) -> &str;

    /// UDID of the device behind this provider
    fn udid(&self) -> &str;
}

/// Reaches a device directly over the network, bypassing usbmuxd
#[cfg(feature = "tcp")]
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub udid: String,
    pub label: String,
}

#[cfg(feature = "tcp")]
impl IdeviceProvider for TcpProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send>> {
        let addr = self.addr;
        let label = self.label.clone();
        Box::pin(async move {
            let socket_addr = SocketAddr::new(addr, port);
            let stream = TcpStream::connect(socket_addr).await?;
            Ok(Idevice::new(Box::new(stream), label))
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        &self.udid
    }
}

/// Reaches a device through the local usbmuxd
#[cfg(feature = "usbmuxd")]
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub addr: UsbmuxdAddr,
    pub tag: u32,
    pub udid: String,
    pub device_id: u32,
    pub label: String,
}

#[cfg(feature = "usbmuxd")]
impl IdeviceProvider for UsbmuxdProvider {
    fn connect(
        &self,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Idevice, IdeviceError>> + Send>> {
        let addr = self.addr.clone();
        let tag = self.tag;
        let device_id = self.device_id;
        let label = self.label.clone();

        Box::pin(async move {
            let usbmuxd = addr.connect(tag).await?;
            usbmuxd.connect_to_device(device_id, port, label).await
        })
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        &self.udid
    }
}
