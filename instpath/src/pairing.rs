//! Pairing record storage and the trust handshake
//!
//! A [`PairingStore`] persists pairing records keyed by UDID. The
//! [`PairingManager`] decides whether an existing record can be reused or a
//! new pairing is needed, and serializes pairing per device so two callers
//! never clobber each other's record.

// Jackson Coxson

use std::{
    collections::HashMap,
    future::Future,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::{Arc, OnceLock},
    time::Duration,
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{IdeviceError, lockdown::LockdownClient, pairing_file::PairingFile};

#[cfg(feature = "usbmuxd")]
use crate::usbmuxd::{UsbmuxdAddr, UsbmuxdConnection};

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, IdeviceError>> + Send + 'a>>;

/// Persistent storage for pairing records
///
/// Like the providers, this is boxed futures until async traits are object safe.
pub trait PairingStore: Send + Sync + std::fmt::Debug {
    /// Reads the record for `udid`, `None` if there isn't one
    fn load<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, Option<PairingFile>>;

    /// Writes the record for `udid`, replacing any previous one
    fn save<'a>(&'a self, udid: &'a str, record: &'a PairingFile) -> StoreFuture<'a, ()>;

    /// Forgets the record for `udid`. Removing a missing record is not an error.
    fn remove<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, ()>;

    /// The host's SystemBUID, shared by every record this store creates
    fn system_buid(&self) -> StoreFuture<'_, String>;
}

/// Records kept by usbmuxd, shared with every other usbmuxd client on the host
#[cfg(feature = "usbmuxd")]
#[derive(Debug, Clone)]
pub struct UsbmuxdPairingStore {
    addr: UsbmuxdAddr,
    timeout: Option<Duration>,
}

#[cfg(feature = "usbmuxd")]
impl UsbmuxdPairingStore {
    /// A store backed by the usbmuxd listening on `addr`
    pub fn new(addr: UsbmuxdAddr) -> Self {
        Self {
            addr,
            timeout: Some(UsbmuxdConnection::DEFAULT_TIMEOUT),
        }
    }

    /// Bounds how long each usbmuxd reply is awaited
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<UsbmuxdConnection, IdeviceError> {
        let mut conn = self.addr.connect(0).await?;
        conn.set_timeout(self.timeout);
        Ok(conn)
    }
}

#[cfg(feature = "usbmuxd")]
impl PairingStore for UsbmuxdPairingStore {
    fn load<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, Option<PairingFile>> {
        Box::pin(async move {
            let mut conn = self.connect().await?;
            match conn.get_pair_record(udid).await {
                Ok(p) => Ok(Some(p)),
                Err(IdeviceError::NotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn save<'a>(&'a self, udid: &'a str, record: &'a PairingFile) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let bytes = record.serialize()?;
            // usbmuxd uses the device ID to notify the device it is now trusted
            let device_id = match self.connect().await?.get_device(udid).await {
                Ok(d) => d.device_id,
                Err(IdeviceError::DeviceNotFound) => 0,
                Err(e) => return Err(e),
            };
            let mut conn = self.connect().await?;
            conn.save_pair_record(device_id, udid, bytes).await
        })
    }

    fn remove<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.connect().await?;
            match conn.delete_pair_record(udid).await {
                Ok(()) | Err(IdeviceError::NotFound) => Ok(()),
                Err(e) => Err(e),
            }
        })
    }

    fn system_buid(&self) -> StoreFuture<'_, String> {
        Box::pin(async move {
            let mut conn = self.connect().await?;
            conn.get_buid().await
        })
    }
}

/// Records kept as `<udid>.plist` files in a directory, the layout usbmuxd
/// itself uses
#[derive(Debug, Clone)]
pub struct DirectoryPairingStore {
    dir: PathBuf,
}

impl DirectoryPairingStore {
    #[cfg(target_os = "macos")]
    pub const DEFAULT_DIR: &'static str = "/var/db/lockdown";
    #[cfg(not(target_os = "macos"))]
    pub const DEFAULT_DIR: &'static str = "/var/lib/lockdown";

    const SYSTEM_CONFIGURATION: &'static str = "SystemConfiguration.plist";

    /// A store rooted at `dir`, created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory the records live in
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, udid: &str) -> PathBuf {
        self.dir.join(format!("{udid}.plist"))
    }
}

impl Default for DirectoryPairingStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIR)
    }
}

/// Reads a file, `None` if it doesn't exist
async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, IdeviceError> {
    match tokio::fs::read(path).await {
        Ok(b) => Ok(Some(b)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl PairingStore for DirectoryPairingStore {
    fn load<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, Option<PairingFile>> {
        Box::pin(async move {
            let path = self.record_path(udid);
            match read_optional(&path).await? {
                Some(bytes) => {
                    debug!("Loading pairing record from {}", path.display());
                    PairingFile::from_bytes(&bytes).map(Some)
                }
                None => Ok(None),
            }
        })
    }

    fn save<'a>(&'a self, udid: &'a str, record: &'a PairingFile) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let bytes = record.serialize()?;
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(self.record_path(udid), bytes).await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.record_path(udid)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn system_buid(&self) -> StoreFuture<'_, String> {
        Box::pin(async move {
            let path = self.dir.join(Self::SYSTEM_CONFIGURATION);
            if let Some(bytes) = read_optional(&path).await? {
                let config: plist::Dictionary = plist::from_bytes(&bytes)?;
                if let Some(buid) = config.get("SystemBUID").and_then(|b| b.as_string()) {
                    return Ok(buid.to_string());
                }
                warn!("{} has no SystemBUID, generating one", path.display());
            }

            let buid = new_identifier();
            let mut config = plist::Dictionary::new();
            config.insert("SystemBUID".into(), buid.clone().into());
            let mut bytes = Vec::new();
            plist::to_writer_xml(&mut bytes, &config)?;
            tokio::fs::create_dir_all(&self.dir).await?;
            tokio::fs::write(&path, bytes).await?;
            Ok(buid)
        })
    }
}

/// Records kept in memory, for tests and for records supplied on the command line
#[derive(Debug)]
pub struct MemoryPairingStore {
    records: Mutex<HashMap<String, PairingFile>>,
    system_buid: String,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            system_buid: new_identifier(),
        }
    }

    /// A store holding a single record
    pub fn with_record(udid: impl Into<String>, record: PairingFile) -> Self {
        let mut records = HashMap::new();
        let system_buid = record.system_buid.clone();
        records.insert(udid.into(), record);
        Self {
            records: Mutex::new(records),
            system_buid,
        }
    }
}

impl Default for MemoryPairingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingStore for MemoryPairingStore {
    fn load<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, Option<PairingFile>> {
        Box::pin(async move { Ok(self.records.lock().await.get(udid).cloned()) })
    }

    fn save<'a>(&'a self, udid: &'a str, record: &'a PairingFile) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.records
                .lock()
                .await
                .insert(udid.to_string(), record.clone());
            Ok(())
        })
    }

    fn remove<'a>(&'a self, udid: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.records.lock().await.remove(udid);
            Ok(())
        })
    }

    fn system_buid(&self) -> StoreFuture<'_, String> {
        Box::pin(async move { Ok(self.system_buid.clone()) })
    }
}

fn new_identifier() -> String {
    uuid::Uuid::new_v4().to_string().to_uppercase()
}

type PairingLocks = std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>;

/// Per-UDID pairing locks shared by every manager in the process
fn pairing_locks() -> &'static PairingLocks {
    static LOCKS: OnceLock<PairingLocks> = OnceLock::new();
    LOCKS.get_or_init(Default::default)
}

/// Exclusive right to pair one UDID
///
/// The map entry is removed when the last holder or waiter lets go.
struct PairingGuard {
    udid: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PairingGuard {
    async fn acquire(udid: &str) -> Self {
        let lock = {
            let mut locks = pairing_locks()
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            locks
                .entry(udid.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        Self {
            udid: udid.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

impl Drop for PairingGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = pairing_locks()
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // only the map itself still points at the lock
        if locks
            .get(&self.udid)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&self.udid);
        }
    }
}

/// Establishes trust between this host and devices
///
/// Pairing for one UDID is serialized across the whole process, whichever
/// manager or store the callers use: a second caller waits for the first
/// one's pairing and then validates the record it produced.
#[derive(Debug)]
pub struct PairingManager {
    store: Arc<dyn PairingStore>,
    pair_timeout: Duration,
}

impl PairingManager {
    /// How long the user gets to answer the trust dialog by default
    pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(store: Arc<dyn PairingStore>) -> Self {
        Self {
            store,
            pair_timeout: Self::DEFAULT_PAIR_TIMEOUT,
        }
    }

    /// Bounds how long pairing waits on the trust dialog
    pub fn with_pair_timeout(mut self, timeout: Duration) -> Self {
        self.pair_timeout = timeout;
        self
    }

    /// The store records are loaded from and saved to
    pub fn store(&self) -> &Arc<dyn PairingStore> {
        &self.store
    }

    /// Returns a record the device trusts, pairing if needed and allowed
    ///
    /// A stored record is checked with `ValidatePair`. If it is missing or
    /// rejected and `allow_pair` is set, a new pairing is performed and
    /// persisted; otherwise `NotPaired` is returned.
    ///
    /// # Errors
    /// `UserDeniedTrust` if the user refuses, `PairingRejected` if the device
    /// does, plus any transport or store failure
    pub async fn ensure_paired(
        &self,
        lockdown: &mut LockdownClient,
        udid: &str,
        allow_pair: bool,
    ) -> Result<PairingFile, IdeviceError> {
        let _guard = PairingGuard::acquire(udid).await;

        let existing = self.store.load(udid).await?;
        if let Some(record) = &existing {
            if lockdown.validate_pair(record).await? {
                debug!("Existing pairing record for {udid} is valid");
                return Ok(record.clone());
            }
            warn!("{udid} rejected the stored pairing record");
        }

        if !allow_pair {
            return Err(IdeviceError::NotPaired(udid.to_string()));
        }
        self.pair_locked(lockdown, udid, existing.as_ref()).await
    }

    /// Pairs with the device unconditionally, replacing any stored record
    pub async fn pair(
        &self,
        lockdown: &mut LockdownClient,
        udid: &str,
    ) -> Result<PairingFile, IdeviceError> {
        let _guard = PairingGuard::acquire(udid).await;
        let existing = self.store.load(udid).await?;
        self.pair_locked(lockdown, udid, existing.as_ref()).await
    }

    /// Withdraws trust on the device and forgets the stored record
    pub async fn unpair(
        &self,
        lockdown: &mut LockdownClient,
        udid: &str,
    ) -> Result<(), IdeviceError> {
        let _guard = PairingGuard::acquire(udid).await;
        let Some(record) = self.store.load(udid).await? else {
            return Err(IdeviceError::NotPaired(udid.to_string()));
        };
        match lockdown.unpair(&record).await {
            Ok(()) => {}
            // the device already forgot us
            Err(IdeviceError::PairingRejected(reason)) => debug!("Unpair: {reason}"),
            Err(e) => return Err(e),
        }
        self.store.remove(udid).await?;
        info!("Unpaired {udid}");
        Ok(())
    }

    #[cfg(feature = "pair")]
    async fn pair_locked(
        &self,
        lockdown: &mut LockdownClient,
        udid: &str,
        existing: Option<&PairingFile>,
    ) -> Result<PairingFile, IdeviceError> {
        let system_buid = self.store.system_buid().await?;
        let host_id = match existing {
            Some(r) => r.host_id.clone(),
            None => new_identifier(),
        };

        info!("Pairing with {udid}, accept the trust dialog on the device");
        let mut record = lockdown
            .pair(host_id, system_buid, self.pair_timeout)
            .await?;
        record.udid = Some(udid.to_string());

        self.store.save(udid, &record).await?;
        info!("Paired with {udid}");
        Ok(record)
    }

    #[cfg(not(feature = "pair"))]
    async fn pair_locked(
        &self,
        _lockdown: &mut LockdownClient,
        udid: &str,
        _existing: Option<&PairingFile>,
    ) -> Result<PairingFile, IdeviceError> {
        Err(IdeviceError::NotPaired(udid.to_string()))
    }
}
