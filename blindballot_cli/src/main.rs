use clap::{App, Arg, SubCommand};
use env_logger::{Builder, Target};
use log::LevelFilter;
use serde::Serialize;

mod command_e2e;
mod command_keygen;
mod command_verify;
mod config;

use command_e2e::*;
use command_keygen::*;
use command_verify::*;

fn main() {
    let matches = App::new("BlindBallot CLI")
        .version("0.1")
        .about("Runs and verifies blind-signature elections")
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("keygen")
                .about("Generate an authority RSA key")
                .arg(
                    Arg::with_name("bits")
                        .long("bits")
                        .takes_value(true)
                        .help("RSA modulus size, defaults to 2048"),
                )
                .arg(
                    Arg::with_name("audit")
                        .long("audit")
                        .help("Also generate an audit signing key"),
                ),
        )
        .subcommand(
            SubCommand::with_name("e2e")
                .about("Run a complete election in-process and verify it")
                .arg(
                    Arg::with_name("VOTES")
                        .index(1)
                        .required(false)
                        .help("Comma separated options, one per voter, defaults to A,B,A"),
                )
                .arg(
                    Arg::with_name("election-id")
                        .long("election-id")
                        .takes_value(true)
                        .help("Election id - can also be set with BLINDBALLOT_ELECTION_ID"),
                )
                .arg(
                    Arg::with_name("record-out")
                        .long("record-out")
                        .takes_value(true)
                        .help("Write the public record to this file"),
                )
                .arg(
                    Arg::with_name("chain-out")
                        .long("chain-out")
                        .takes_value(true)
                        .help("Write the device audit chain to this file"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify-record")
                .about("Re-verify a published election record")
                .arg(
                    Arg::with_name("INPUT")
                        .index(1)
                        .required(true)
                        .help("Public record in JSON format"),
                )
                .arg(
                    Arg::with_name("receipt")
                        .long("receipt")
                        .takes_value(true)
                        .help("Also check that this receipt is included"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify-chain")
                .about("Verify the integrity of an audit chain")
                .arg(
                    Arg::with_name("INPUT")
                        .index(1)
                        .required(true)
                        .help("Audit blocks in JSON format"),
                ),
        )
        .get_matches();

    let level = match matches.occurrences_of("v") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = Builder::new();
    builder.filter_level(level);
    builder.parse_default_env();
    builder.target(Target::Stderr);
    builder.init();

    // Subcommands
    if let Some(matches) = matches.subcommand_matches("keygen") {
        command_keygen(matches);
    } else if let Some(matches) = matches.subcommand_matches("e2e") {
        let config = config::Config::from_env().unwrap_or_else(|e| {
            eprintln!("blindballot e2e: invalid configuration: {}", e);
            std::process::exit(1);
        });
        command_e2e(matches, config);
    } else if let Some(matches) = matches.subcommand_matches("verify-record") {
        command_verify_record(matches);
    } else if let Some(matches) = matches.subcommand_matches("verify-chain") {
        command_verify_chain(matches);
    } else {
        eprintln!("{}", matches.usage());
        std::process::exit(1);
    }
}

pub fn expand(filename: &str) -> String {
    match shellexpand::full(filename) {
        Ok(expanded) => expanded.into_owned(),
        Err(e) => {
            eprintln!("blindballot: unable to expand {}: {}", filename, e);
            std::process::exit(1);
        }
    }
}

pub fn read_file(command: &str, filename: &str) -> Vec<u8> {
    std::fs::read(filename).unwrap_or_else(|e| {
        eprintln!("blindballot {}: unable to read {}: {}", command, filename, e);
        std::process::exit(1);
    })
}

pub fn print_json<T: Serialize + ?Sized>(command: &str, value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("blindballot {}: unable to serialize output: {}", command, e);
            std::process::exit(1);
        }
    }
}

pub fn write_json<T: Serialize + ?Sized>(command: &str, filename: &str, value: &T) {
    let json = serde_json::to_vec_pretty(value).unwrap_or_else(|e| {
        eprintln!("blindballot {}: unable to serialize output: {}", command, e);
        std::process::exit(1);
    });
    if let Err(e) = std::fs::write(filename, json) {
        eprintln!("blindballot {}: unable to write {}: {}", command, filename, e);
        std::process::exit(1);
    }
    log::info!("wrote {}", filename);
}
