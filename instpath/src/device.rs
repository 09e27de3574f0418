//! Device handle and service multiplexer
//!
//! A [`Device`] owns the lockdown control channel of one device. Services are
//! started over that channel and each one gets its own connection through the
//! provider, so several services can be used at once.

// Jackson Coxson

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    Idevice, IdeviceError, IdeviceService, lockdown::LockdownClient, pairing::PairingManager,
    pairing_file::PairingFile, provider::IdeviceProvider, util,
};

#[cfg(feature = "usbmuxd")]
use std::collections::BTreeSet;

#[cfg(feature = "usbmuxd")]
use crate::{pairing::UsbmuxdPairingStore, usbmuxd::UsbmuxdAddr};

/// Shared liveness flag of a device
///
/// Every service connection holds a clone. Once the device is disconnected or
/// dropped, or any of its channels hits a transport failure, those
/// connections refuse further traffic.
#[derive(Clone, Debug)]
pub struct Lifeline(Arc<AtomicBool>);

impl Lifeline {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether the device is still usable
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Options for connecting to a device
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Label sent with lockdown requests
    pub label: String,
    /// Bound for connecting and for every read, `None` waits forever
    pub timeout: Option<Duration>,
    /// Pair with the device when no valid record exists
    pub auto_pair: bool,
    /// How long pairing waits for the trust dialog
    pub pair_timeout: Duration,
    #[cfg(feature = "usbmuxd")]
    pub usbmuxd_addr: UsbmuxdAddr,
}

impl DeviceConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            label: "instpath".to_string(),
            timeout: Some(Self::DEFAULT_TIMEOUT),
            auto_pair: false,
            pair_timeout: PairingManager::DEFAULT_PAIR_TIMEOUT,
            #[cfg(feature = "usbmuxd")]
            usbmuxd_addr: UsbmuxdAddr::from_env_var().unwrap_or_else(|e| {
                warn!("Ignoring invalid {}: {e}", UsbmuxdAddr::ENV_VAR);
                UsbmuxdAddr::default()
            }),
        }
    }
}

/// A paired device with a running lockdown session
pub struct Device {
    provider: Box<dyn IdeviceProvider>,
    lockdown: Mutex<LockdownClient>,
    pairing_file: PairingFile,
    lifeline: Lifeline,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("udid", &self.provider.udid())
            .field("alive", &self.lifeline.is_alive())
            .finish()
    }
}

/// Lists the UDIDs of the devices usbmuxd can see
#[cfg(feature = "usbmuxd")]
pub async fn discover_devices(addr: &UsbmuxdAddr) -> Result<BTreeSet<String>, IdeviceError> {
    let mut conn = addr.connect(0).await?;
    Ok(conn
        .get_devices()
        .await?
        .into_iter()
        .map(|d| d.udid)
        .collect())
}

impl Device {
    /// Connects to an attached device through usbmuxd
    ///
    /// Pairing records are read from and written to usbmuxd.
    ///
    /// # Errors
    /// `DeviceNotFound` if usbmuxd doesn't know the UDID, `NotPaired` if there
    /// is no usable record and `auto_pair` is off
    #[cfg(feature = "usbmuxd")]
    pub async fn connect(udid: &str, config: &DeviceConfig) -> Result<Self, IdeviceError> {
        let addr = config.usbmuxd_addr.clone();
        let device = util::bounded(config.timeout, async {
            let mut conn = addr.connect(0).await?;
            conn.set_timeout(config.timeout);
            conn.get_device(udid).await
        })
        .await?;
        debug!("Found {udid} as usbmuxd device {}", device.device_id);

        let provider = device.to_provider(addr.clone(), config.label.clone());
        let store = UsbmuxdPairingStore::new(addr).with_timeout(config.timeout);
        let pairing =
            PairingManager::new(Arc::new(store)).with_pair_timeout(config.pair_timeout);
        Self::from_provider(Box::new(provider), config, &pairing).await
    }

    /// Connects to the device behind `provider`
    ///
    /// Opens lockdown, makes sure the host is paired (see
    /// [`PairingManager::ensure_paired`]) and starts a session.
    pub async fn from_provider(
        provider: Box<dyn IdeviceProvider>,
        config: &DeviceConfig,
        pairing: &PairingManager,
    ) -> Result<Self, IdeviceError> {
        let mut idevice = util::bounded(
            config.timeout,
            provider.connect(LockdownClient::LOCKDOWND_PORT),
        )
        .await?;
        idevice.set_timeout(config.timeout);

        let mut lockdown = LockdownClient::new(idevice);
        let service = lockdown.query_type().await?;
        if service != LockdownClient::service_name() {
            warn!(
                "Expected lockdown on port {}, got {service}",
                LockdownClient::LOCKDOWND_PORT
            );
            return Err(IdeviceError::UnexpectedResponse);
        }

        let udid = provider.udid().to_string();
        let pairing_file = pairing
            .ensure_paired(&mut lockdown, &udid, config.auto_pair)
            .await?;
        lockdown.start_session(&pairing_file).await?;
        info!("Session started with {udid}");

        Ok(Self {
            provider,
            lockdown: Mutex::new(lockdown),
            pairing_file,
            lifeline: Lifeline::new(),
            timeout: config.timeout,
        })
    }

    /// UDID of the device, as reported by the provider
    pub fn udid(&self) -> &str {
        self.provider.udid()
    }

    /// The record this session was authenticated with
    pub fn pairing_file(&self) -> &PairingFile {
        &self.pairing_file
    }

    /// Whether the device can still start services
    pub fn is_connected(&self) -> bool {
        self.lifeline.is_alive()
    }

    /// Reads a lockdown value, see [`LockdownClient::get_value`]
    pub async fn get_value(
        &self,
        key: Option<&str>,
        domain: Option<&str>,
    ) -> Result<plist::Value, IdeviceError> {
        self.ensure_alive()?;
        let mut lockdown = self.lockdown.lock().await;
        let res = lockdown.get_value(key, domain).await;
        self.check_control_channel(res)
    }

    /// Starts a service and opens a connection to it
    ///
    /// The lockdown channel is held only for the `StartService` exchange; the
    /// returned connection is independent of it and of other services. A
    /// transport failure on the returned connection disconnects the device.
    ///
    /// # Errors
    /// `ServiceUnavailable` or `PermissionDenied` from lockdown, or a
    /// transport error while connecting to the service
    pub async fn start_service(&self, name: &str) -> Result<Idevice, IdeviceError> {
        self.ensure_alive()?;
        let (port, ssl) = {
            let mut lockdown = self.lockdown.lock().await;
            let res = lockdown.start_service(name).await;
            self.check_control_channel(res)?
        };
        debug!("{name} is listening on port {port} (ssl: {ssl})");

        let mut idevice = util::bounded(self.timeout, self.provider.connect(port)).await?;
        idevice.set_timeout(self.timeout);
        idevice.attach(self.lifeline.clone());
        if ssl {
            idevice.start_session(&self.pairing_file).await?;
        }
        Ok(idevice)
    }

    /// Starts a service and wraps it in its typed client
    pub async fn start<T: IdeviceService>(&self) -> Result<T, IdeviceError> {
        let idevice = self.start_service(T::service_name()).await?;
        T::from_stream(idevice).await
    }

    /// Ends the session and closes the control channel
    ///
    /// Service connections handed out by this device stop working.
    pub async fn disconnect(self) -> Result<(), IdeviceError> {
        self.lifeline.kill();
        let mut lockdown = self.lockdown.lock().await;

        let res = if lockdown.session_id().is_some() {
            lockdown.stop_session().await
        } else {
            lockdown.goodbye().await
        };
        if let Err(e) = &res {
            debug!("Ignoring failure while saying goodbye: {e}");
        }
        lockdown.idevice.close().await
    }

    fn ensure_alive(&self) -> Result<(), IdeviceError> {
        if self.lifeline.is_alive() {
            Ok(())
        } else {
            Err(IdeviceError::NoEstablishedConnection)
        }
    }

    /// A broken control channel takes the whole device down with it
    fn check_control_channel<T>(&self, res: Result<T, IdeviceError>) -> Result<T, IdeviceError> {
        if let Err(e) = &res {
            if e.is_transport() {
                warn!("Lost the control channel of {}: {e}", self.udid());
                self.lifeline.kill();
            }
        }
        res
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.lifeline.kill();
    }
}
