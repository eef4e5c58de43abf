//! gg-offload-cli entry point.
//!
//! ## CLI Subcommands
//!
//! - `gg-offload-cli config show|defaults|validate` - Inspect configuration
//! - `gg-offload-cli simulate FILE` - Replay a load scenario on mock devices
//! - `gg-offload-cli version` - Print version

use std::path::Path;
use std::process::ExitCode;

use gg_offload::cli::{config_cmd, simulate_cmd};
use gg_offload::telemetry::{init_logging, LogConfig};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("Logging disabled: {}", e);
    }

    match command {
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            let file = config_file_arg(&args[3.min(args.len())..]);
            let code = match subcommand {
                "show" => config_cmd::run_show(file),
                "defaults" => config_cmd::run_defaults(),
                "validate" => config_cmd::run_validate(file),
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_command_help("config");
                    return ExitCode::FAILURE;
                }
            };
            ExitCode::from(code as u8)
        }
        "simulate" => match args.get(2) {
            Some(path) => ExitCode::from(simulate_cmd::run_simulate(Path::new(path)) as u8),
            None => {
                eprintln!("simulate requires a scenario file");
                print_command_help("simulate");
                ExitCode::from(2u8)
            }
        },
        "help" | "--help" | "-h" => {
            if let Some(subcommand) = args.get(2) {
                print_command_help(subcommand);
            } else {
                print_usage();
            }
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("gg-offload {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// `--file PATH` or a bare path.
fn config_file_arg(rest: &[String]) -> Option<&Path> {
    match rest {
        [flag, path, ..] if flag == "--file" => Some(Path::new(path)),
        [path, ..] if !path.starts_with('-') => Some(Path::new(path)),
        _ => None,
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "gg-offload - adaptive model-memory manager v{}

USAGE:
    gg-offload-cli [COMMAND] [OPTIONS]

COMMANDS:
    config       Manage configuration (show, defaults, validate)
    simulate     Replay a load scenario against mock devices
    version      Show version information
    help         Show this help message

EXAMPLES:
    gg-offload-cli config show                  # Effective config from env
    gg-offload-cli config validate offload.toml # Check a config file
    gg-offload-cli config defaults > offload.toml
    gg-offload-cli simulate scenario.toml

ENVIRONMENT:
    GG_OFFLOAD_LOG         Log filter (default: gg_offload=info)
    GG_OFFLOAD_LOG_FORMAT  json or pretty (default: json)
    GG_OFFLOAD_*           Configuration overrides, see `config show`

EXIT CODES:
    0  Success
    1  Failure / validation warnings / failed simulation step
    2  Bad scenario or configuration file
",
        version
    );
}

/// Print detailed help for a specific command.
fn print_command_help(command: &str) {
    match command {
        "config" => {
            eprintln!(
                "gg-offload-cli config - Manage configuration

USAGE:
    gg-offload-cli config show [--file FILE]
    gg-offload-cli config defaults
    gg-offload-cli config validate [FILE]

DESCRIPTION:
    show      Print effective values as GG_OFFLOAD_* pairs
    defaults  Print the default configuration as TOML
    validate  Check a file (or the environment) for invalid or
              contradictory values
"
            );
        }
        "simulate" => {
            eprintln!(
                "gg-offload-cli simulate - Replay a load scenario

USAGE:
    gg-offload-cli simulate <FILE>

DESCRIPTION:
    Reads a TOML scenario describing a mock accelerator, a set of models
    and a list of steps (load, drop, cleanup, unload_all, inject_oom),
    runs every step through the offload manager and prints a JSON report
    of placements, evictions and mode changes.
"
            );
        }
        _ => print_usage(),
    }
}
