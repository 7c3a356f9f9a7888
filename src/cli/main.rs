use tpmtls::platform::{ChannelConfig, Hierarchy, DEFAULT_DEVICE_PATH, DEVICE_PATH_ENV};
use tpmtls::{Harness, HarnessConfig, HardwareKey, KeyOptions, KeySigner, TpmTlsError};

use tpmtls::reexports::log;

use clap::{crate_description, crate_name, crate_version, value_parser, Arg, ArgAction, Command};
use std::sync::Arc;

fn start() -> Result<(), TpmTlsError> {
    let command = Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Verbose output"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Prints debugging information"),
        )
        .arg(
            Arg::new("iter")
                .long("iter")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .default_value("1000")
                .help("Number of handshakes to run"),
        )
        .arg(
            Arg::new("device")
                .long("device")
                .value_name("PATH")
                .env(DEVICE_PATH_ENV)
                .default_value(DEFAULT_DEVICE_PATH)
                .help("TPM character device"),
        )
        .arg(
            Arg::new("hierarchy")
                .long("hierarchy")
                .value_name("HIERARCHY")
                .value_parser(["owner", "endorsement", "platform", "null"])
                .default_value("owner")
                .help("Hierarchy the client key is created under"),
        )
        .arg(
            Arg::new("subject")
                .long("subject")
                .value_name("NAME")
                .default_value(tpmtls::harness::DEFAULT_CLIENT_SUBJECT)
                .help("Common name of the client certificate"),
        )
        .arg(
            Arg::new("message")
                .long("message")
                .value_name("TEXT")
                .default_value(tpmtls::harness::DEFAULT_MESSAGE)
                .help("Payload echoed on every connection"),
        );

    #[cfg(feature = "simulator")]
    let command = command.arg(
        Arg::new("simulator")
            .long("simulator")
            .action(ArgAction::SetTrue)
            .help("Use a software-simulated TPM instead of a device"),
    );

    let matches = command.get_matches();

    let verbose = matches.get_flag("verbose");
    let debug = matches.get_flag("debug");

    env_logger::builder()
        .format_timestamp(None)
        .format_level(false)
        .format_module_path(false)
        .format_target(false)
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let iterations = *matches
        .get_one::<usize>("iter")
        .ok_or_else(|| TpmTlsError::InvalidArgument("--iter is required".to_string()))?;
    let hierarchy: Hierarchy = matches
        .get_one::<String>("hierarchy")
        .map(|s| s.as_str())
        .unwrap_or("owner")
        .parse()?;
    let device = matches
        .get_one::<String>("device")
        .map(|s| s.as_str())
        .unwrap_or(DEFAULT_DEVICE_PATH);
    let subject = matches
        .get_one::<String>("subject")
        .map(|s| s.as_str())
        .unwrap_or(tpmtls::harness::DEFAULT_CLIENT_SUBJECT);
    let message = matches
        .get_one::<String>("message")
        .map(|s| s.as_str())
        .unwrap_or(tpmtls::harness::DEFAULT_MESSAGE);

    let options = KeyOptions::new(hierarchy);

    #[cfg(feature = "simulator")]
    let key = if matches.get_flag("simulator") {
        let tpm = tpmtls::platform::simulator::SimulatedTpm::new();
        HardwareKey::create_with_channel(Box::new(tpm), &options)?
    } else {
        HardwareKey::create_with_options(&ChannelConfig::new(device), &options)?
    };
    #[cfg(not(feature = "simulator"))]
    let key = HardwareKey::create_with_options(&ChannelConfig::new(device), &options)?;

    let key = Arc::new(key);
    if verbose {
        println!("Client public key: {:?}", key.public_key());
    }

    let harness = Harness::new(
        HarnessConfig::default()
            .with_iterations(iterations)
            .with_client_subject(subject)
            .with_message(message),
    );
    let signer: Arc<dyn KeySigner> = key.clone();
    let report = harness.run(signer);

    // Explicit release surfaces flush errors
    let released = key.release();
    let report = report?;
    released?;

    if verbose {
        println!("Client certificate:\n{}", report.client_certificate.to_pem());
    }

    match report.failure {
        None => {
            println!("{} handshakes completed", report.completed);
            Ok(())
        }
        Some(failure) => {
            log::error!(
                "Stopped after {} of {} handshakes",
                report.completed,
                iterations
            );
            log::error!("{}", failure);
            Err(failure.error)
        }
    }
}

fn main() -> Result<(), TpmTlsError> {
    let res = start();
    match res {
        Ok(_) => {}
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    Ok(())
}
