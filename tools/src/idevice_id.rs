// Jackson Coxson
// Gets the devices from the muxer

use std::process::ExitCode;

use clap::{Arg, Command};
use futures_util::StreamExt;
use instpath::{
    IdeviceError,
    usbmuxd::{Connection, UsbmuxdConnection, UsbmuxdDevice, UsbmuxdListenEvent},
};

mod common;

fn describe(dev: &UsbmuxdDevice) -> String {
    match &dev.connection_type {
        Connection::Usb => format!("{} (USB)", dev.udid),
        Connection::Network(ip) => format!("{} (Network {ip})", dev.udid),
        Connection::Unknown(kind) => format!("{} ({kind})", dev.udid),
    }
}

async fn run(listen: bool) -> Result<(), IdeviceError> {
    let addr = common::usbmuxd_addr()?;
    let mut muxer = addr.connect(0).await?;
    for dev in muxer.get_devices().await? {
        println!("{}", describe(&dev));
    }

    if listen {
        let mut muxer: UsbmuxdConnection = addr.connect(1).await?;
        let mut events = muxer.listen().await?;
        while let Some(event) = events.next().await {
            match event? {
                UsbmuxdListenEvent::Connected(dev) => println!("+ {}", describe(&dev)),
                UsbmuxdListenEvent::Disconnected(id) => println!("- device {id}"),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    common::init_logging();

    let matches = Command::new("idevice_id")
        .about("Lists attached devices")
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .help("Keep running and print attach and detach events")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    match run(matches.get_flag("listen")).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("idevice_id: {e}");
            ExitCode::FAILURE
        }
    }
}
