// Jackson Coxson
// Pairs, validates or unpairs a device

use std::{process::ExitCode, sync::Arc, time::Duration};

use clap::{Arg, ArgGroup, ArgMatches, Command, value_parser};
use instpath::{
    IdeviceError,
    lockdown::LockdownClient,
    pairing::{DirectoryPairingStore, PairingManager, PairingStore, UsbmuxdPairingStore},
};

mod common;

async fn run(matches: &ArgMatches) -> Result<String, IdeviceError> {
    let addr = common::usbmuxd_addr()?;
    let dev = common::choose_device(&addr, matches.get_one::<String>("udid")).await?;
    let provider = dev.to_provider(addr.clone(), "pair");

    let store: Arc<dyn PairingStore> = match matches.get_one::<String>("store") {
        Some(dir) => Arc::new(DirectoryPairingStore::new(dir)),
        None => Arc::new(UsbmuxdPairingStore::new(addr)),
    };
    let wait = matches
        .get_one::<u64>("timeout")
        .map(|s| Duration::from_secs(*s))
        .unwrap_or(PairingManager::DEFAULT_PAIR_TIMEOUT);
    let manager = PairingManager::new(store.clone()).with_pair_timeout(wait);

    let mut lockdown = LockdownClient::connect(&provider).await?;
    lockdown.idevice.set_timeout(Some(wait));

    if matches.get_flag("validate") {
        let Some(record) = store.load(&dev.udid).await? else {
            return Err(IdeviceError::NotPaired(dev.udid));
        };
        return match lockdown.validate_pair(&record).await? {
            true => Ok(format!("{} trusts this host", dev.udid)),
            false => Err(IdeviceError::PairingRejected(format!(
                "{} no longer trusts this host",
                dev.udid
            ))),
        };
    }

    if matches.get_flag("unpair") {
        manager.unpair(&mut lockdown, &dev.udid).await?;
        return Ok(format!("Unpaired {}", dev.udid));
    }

    let record = manager.pair(&mut lockdown, &dev.udid).await?;
    // make sure the device takes the new record
    lockdown.start_session(&record).await?;
    lockdown.stop_session().await?;
    Ok(format!("Paired with {}", dev.udid))
}

#[tokio::main]
async fn main() -> ExitCode {
    common::init_logging();

    let matches = Command::new("pair")
        .about("Manage trust between this host and a device")
        .arg(
            Arg::new("udid")
                .value_name("UDID")
                .help("UDID of the device, defaults to the first USB device")
                .index(1),
        )
        .arg(
            Arg::new("validate")
                .long("validate")
                .help("Check that the device still trusts the stored record")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("unpair")
                .long("unpair")
                .help("Remove trust on the device and delete the stored record")
                .action(clap::ArgAction::SetTrue),
        )
        .group(ArgGroup::new("mode").args(["validate", "unpair"]))
        .arg(
            Arg::new("store")
                .long("store")
                .value_name("DIR")
                .help("Keep records in this directory instead of usbmuxd"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("How long to wait for the trust dialog")
                .value_parser(value_parser!(u64)),
        )
        .get_matches();

    match run(&matches).await {
        Ok(msg) => {
            println!("{msg}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("pair: {e}");
            ExitCode::FAILURE
        }
    }
}
