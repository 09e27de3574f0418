// Jackson Coxson
#![cfg(unix)]

mod common;

use std::{sync::Arc, time::Duration};

use common::{APP_ID, APP_PATH, MuxerRecords, PairBehavior, SimulatedDevice, UDID, record};
use instpath::{
    Device, DeviceConfig, IdeviceError,
    device::discover_devices,
    installation_proxy::InstallationProxyClient,
    pairing::{PairingStore, UsbmuxdPairingStore},
    usbmuxd::UsbmuxdAddr,
};

const HOST_ID: &str = "6E2C4C5B-1B1A-4D67-A6C8-9C7D9BB5A0F1";

fn config(addr: UsbmuxdAddr, auto_pair: bool) -> DeviceConfig {
    DeviceConfig {
        label: "usbmuxd-test".into(),
        timeout: Some(Duration::from_secs(5)),
        auto_pair,
        usbmuxd_addr: addr,
        ..Default::default()
    }
}

fn muxer_with_record(sim: &SimulatedDevice) -> (UsbmuxdAddr, Arc<MuxerRecords>) {
    let records = Arc::new(MuxerRecords::default());
    records
        .records
        .lock()
        .unwrap()
        .insert(UDID.into(), record(HOST_ID).serialize().unwrap());
    let path = common::spawn_muxer(sim.clone(), records.clone());
    (
        UsbmuxdAddr::UnixSocket(path.to_string_lossy().into_owned()),
        records,
    )
}

#[tokio::test]
async fn lists_attached_devices() {
    let sim = SimulatedDevice::trusting(HOST_ID);
    let (addr, _) = muxer_with_record(&sim);

    let devices = discover_devices(&addr).await.unwrap();
    assert_eq!(devices.into_iter().collect::<Vec<_>>(), [UDID]);
}

#[tokio::test]
async fn container_path_over_usbmuxd() {
    let sim = SimulatedDevice::trusting(HOST_ID);
    let (addr, _) = muxer_with_record(&sim);

    let device = Device::connect(UDID, &config(addr, false)).await.unwrap();
    let mut proxy = device.start::<InstallationProxyClient>().await.unwrap();
    assert_eq!(
        proxy.get_path_for_bundle_identifier(APP_ID).await.unwrap(),
        APP_PATH
    );
    device.disconnect().await.unwrap();
}

#[tokio::test]
async fn unknown_udid_is_device_not_found() {
    let sim = SimulatedDevice::trusting(HOST_ID);
    let (addr, _) = muxer_with_record(&sim);

    assert!(matches!(
        Device::connect("0000-NOT-ATTACHED", &config(addr, false)).await,
        Err(IdeviceError::DeviceNotFound)
    ));
}

#[tokio::test]
async fn new_pairing_is_saved_to_usbmuxd() {
    let sim = SimulatedDevice::new(None, PairBehavior::Accept);
    let records = Arc::new(MuxerRecords::default());
    let path = common::spawn_muxer(sim.clone(), records.clone());
    let addr = UsbmuxdAddr::UnixSocket(path.to_string_lossy().into_owned());

    let store = UsbmuxdPairingStore::new(addr.clone());
    assert!(store.load(UDID).await.unwrap().is_none());

    let device = Device::connect(UDID, &config(addr, true)).await.unwrap();
    let saved = store.load(UDID).await.unwrap().unwrap();
    assert_eq!(&saved, device.pairing_file());
    assert_eq!(saved.system_buid, "30B2C5A8-2F27-4E55-9D3A-59F57E14A3D2");

    store.remove(UDID).await.unwrap();
    assert!(records.records.lock().unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_connects_pair_once() {
    let sim = SimulatedDevice::new(None, PairBehavior::Accept);
    let records = Arc::new(MuxerRecords::default());
    let path = common::spawn_muxer(sim.clone(), records.clone());
    let addr = UsbmuxdAddr::UnixSocket(path.to_string_lossy().into_owned());
    let config = config(addr, true);

    // each connect builds its own pairing manager
    let (a, b) = tokio::join!(Device::connect(UDID, &config), Device::connect(UDID, &config));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(
        sim.state.pair_requests.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(a.pairing_file().host_id, b.pairing_file().host_id);
    assert_eq!(records.records.lock().unwrap().len(), 1);
}
