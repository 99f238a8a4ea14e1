//! CLI entrypoint: argument parsing, logging setup, direction/invocation-form
//! resolution, and exit-code mapping.

mod cli;
mod dump;
mod error;
mod pool_control;
mod run;
mod volume_info;

use std::process::ExitCode;

use clap::Parser;

use cli::{parse_receive_target, parse_send_target, resolve_direction, Cli, Direction, ABOUT_TEXT};
use error::AppError;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if cli.about {
        println!("{ABOUT_TEXT}");
        return ExitCode::SUCCESS;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("thin-send-recv: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let argv0 = std::env::args().next().unwrap_or_default();
    let direction = resolve_direction(&argv0, cli.send, cli.receive)?;

    match direction {
        Direction::Send => {
            let target = parse_send_target(&cli.volumes)?;
            run::run_send(target, cli.allow_tty)?;
        }
        Direction::Receive => {
            let volume = parse_receive_target(&cli.volumes)?;
            run::run_receive(volume, cli.accept_stream_format.into(), cli.allow_tty)?;
        }
    }
    Ok(())
}
