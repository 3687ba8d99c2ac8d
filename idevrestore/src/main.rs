// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use ipswtools::tss::TssClient;
use ipswtools::{FirmwareBundle, RestoreOptions, UsbBackend};

/// Restore/upgrade IPSW firmware FILE to a connected device.
#[derive(Parser, Debug)]
#[clap(name = "idevrestore", max_term_width = 80)]
struct Args {
    /// Enable incremental levels of verboseness
    #[clap(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable communication debugging (maximum verbosity; also dumps each
    /// re-signed component to the working directory)
    #[clap(short = 'd')]
    debug: bool,

    /// Restore with a custom firmware whose components are already signed
    #[clap(short = 'c')]
    custom: bool,

    /// Target a specific device by its 40-digit device UUID
    #[clap(short = 'u', value_name = "UUID", value_parser = parse_uuid)]
    uuid: Option<String>,

    /// IPSW firmware bundle
    #[clap(value_name = "FILE")]
    file: PathBuf,
}

fn parse_uuid(raw: &str) -> Result<String, String> {
    if raw.len() == 40 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(raw.to_ascii_lowercase())
    } else {
        Err("expected a 40-character hex identifier".to_owned())
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = if args.debug {
        "trace"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(filter),
    )
    .init();

    match restore(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn restore(args: &Args) -> Result<()> {
    let bundle = FirmwareBundle::open(&args.file)
        .with_context(|| format!("opening {}", args.file.display()))?;

    let mut backend = UsbBackend::new(args.uuid.clone());
    let signer = TssClient::new();
    let opts = RestoreOptions {
        custom: args.custom,
        dump_components: args.debug,
        ..RestoreOptions::new()
    };

    ipswtools::run(&mut backend, &bundle, &signer, opts)?;
    Ok(())
}
