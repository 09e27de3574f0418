// Jackson Coxson
// Prints where an installed app lives on the device

use std::{process::ExitCode, time::Duration};

use clap::{Arg, ArgMatches, Command, value_parser};
use instpath::{IdeviceError, installation_proxy::InstallationProxyClient};

mod common;

#[tokio::main]
async fn main() -> ExitCode {
    common::init_logging();

    let matches = Command::new("containerpathtool")
        .about("Prints the on-device path of an installed application's executable")
        .arg(
            Arg::new("bundle_id")
                .value_name("BUNDLE_ID")
                .help("Bundle identifier of the application")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("udid")
                .short('u')
                .long("udid")
                .value_name("UDID")
                .help("UDID of the device, defaults to the first USB device"),
        )
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("IP address of the device")
                .requires("pairing_file"),
        )
        .arg(
            Arg::new("pairing_file")
                .long("pairing-file")
                .value_name("PATH")
                .help("Path to the pairing file")
                .requires("host"),
        )
        .arg(
            Arg::new("bundle")
                .long("bundle")
                .help("Print the path of the app's bundle instead of its executable")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .value_name("SECONDS")
                .help("Give up on an unresponsive device after this long")
                .value_parser(value_parser!(u64))
                .default_value("10"),
        )
        .arg(
            Arg::new("label")
                .long("label")
                .value_name("LABEL")
                .help("Label reported to lockdown")
                .default_value("containerpathtool"),
        )
        .arg(
            Arg::new("pair")
                .long("pair")
                .help("Pair with the device if this host isn't trusted yet")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    match run(&matches).await {
        Ok(path) => {
            println!("{path}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("containerpathtool: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &ArgMatches) -> Result<String, IdeviceError> {
    let bundle_id = matches
        .get_one::<String>("bundle_id")
        .ok_or(IdeviceError::UnexpectedResponse)?;
    let label = matches
        .get_one::<String>("label")
        .map(String::as_str)
        .unwrap_or("containerpathtool");
    let timeout = matches
        .get_one::<u64>("timeout")
        .map(|s| Duration::from_secs(*s))
        .filter(|d| !d.is_zero());

    let device = common::connect(common::Target {
        udid: matches.get_one::<String>("udid"),
        host: matches.get_one::<String>("host"),
        pairing_file: matches.get_one::<String>("pairing_file"),
        label,
        timeout,
        auto_pair: matches.get_flag("pair"),
    })
    .await?;

    let mut proxy = device.start::<InstallationProxyClient>().await?;
    let path = if matches.get_flag("bundle") {
        proxy.get_path_for_bundle_identifier(bundle_id).await
    } else {
        proxy
            .get_executable_path_for_bundle_identifier(bundle_id)
            .await
    };

    if let Err(e) = device.disconnect().await {
        tracing::debug!("Disconnect failed: {e}");
    }
    path
}
