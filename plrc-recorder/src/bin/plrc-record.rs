// Copyright 2023 Gregory Szorc.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Record one profiling session into a PLRC trace file.
//!
//! Listens on a TCP port for an instrumented process (or replays a
//! captured raw stream) and records until the session ends or ctrl-c.
//!
//! Exit codes: 0 success, 1 argument error, 2 transport error, 3 storage
//! error.

use clap::Parser;
use log::{error, info};
use plrc_recorder::{
    collector::run_session,
    error::Error,
    transport::{FileReplayer, Stop, TcpAcceptor, Transport},
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "plrc-record", about = "Record profiling sessions to PLRC files")]
struct Args {
    /// TCP port to listen on for an instrumented process.
    #[arg(long, default_value_t = 59059)]
    port: u16,

    /// Replay a captured raw session stream instead of listening.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory the record file is written into.
    storage_dir: PathBuf,

    /// Base name of the record file.
    #[arg(long, default_value = "record")]
    name: String,

    /// Logging verbosity (-v, -vv, ...).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn run(args: Args) -> Result<(), ExitCode> {
    let stop = Stop::default();

    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.set()).ok();
    }

    let transport: Box<dyn Transport> = match &args.input {
        Some(path) => Box::new(FileReplayer::open(path, stop.clone()).map_err(|e| {
            error!("cannot open input: {}", e);
            ExitCode::from(2)
        })?),
        None => {
            let acceptor = TcpAcceptor::bind(args.port, stop.clone()).map_err(|e| {
                error!("cannot listen on port {}: {}", args.port, e);
                ExitCode::from(2)
            })?;
            match acceptor.accept() {
                Ok(Some(t)) => Box::new(t),
                Ok(None) => return Ok(()), // Stopped before a client came.
                Err(e) => {
                    error!("accept failed: {}", e);
                    return Err(ExitCode::from(2));
                }
            }
        }
    };

    let outcome = run_session(transport, args.storage_dir, args.name, stop);

    match outcome {
        Ok(Some(path)) => {
            info!("record written to {}", path.display());
            Ok(())
        }
        Ok(None) => {
            info!("session ended before any record was made");
            Ok(())
        }
        Err(Error::StorageWriteFailed(msg)) => {
            error!("storage failure: {}", msg);
            Err(ExitCode::from(3))
        }
        Err(e) => {
            error!("session failed: {}", e);
            Err(ExitCode::from(2))
        }
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.kind() == clap::error::ErrorKind::DisplayHelp
            || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            e.print().ok();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            e.print().ok();
            return ExitCode::from(1);
        }
    };

    stderrlog::new()
        .module(module_path!())
        .module("plrc_recorder")
        .verbosity(args.verbose as usize + 2)
        .init()
        .ok();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => code,
    }
}
