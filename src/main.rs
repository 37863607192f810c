// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

mod attr;
mod config;
mod fs;
mod handle;
mod ident;
mod node;
mod record;
mod tracer;

use std::process;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;

use crate::fs::{TrailFs, PROGRAM_NAME};

fn main() {
    // Diagnostics go to stderr; standard output is reserved for trace
    // records when '--out=-' is in effect.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    // Parse command line arguments
    let cli = match config::Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.exit()
        }
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };
    let conf = match config::Config::from_cli(cli) {
        Ok(conf) => conf,
        Err(err) => {
            eprintln!("{PROGRAM_NAME}: {err:#}");
            process::exit(1);
        }
    };

    // Create the tracer
    let tracer = match tracer::Tracer::new(conf.format, &conf.destination) {
        Ok(tracer) => Arc::new(tracer),
        Err(err) => {
            eprintln!("{PROGRAM_NAME}: {err:#}");
            process::exit(2);
        }
    };

    // Create the file system object
    let tfs = match TrailFs::new(&conf.shadow, tracer.clone()) {
        Ok(tfs) => tfs,
        Err(err) => {
            eprintln!("{PROGRAM_NAME}: could not create file system [{err:#}]");
            process::exit(2);
        }
    };

    // Mount and serve file system requests until unmounted externally
    if let Err(err) = tfs.mount_and_serve(&conf.mount, conf.read_only) {
        eprintln!("{PROGRAM_NAME}: could not mount file system [{err:#}]");
        tracer.close();
        process::exit(3);
    }

    // Drain any queued trace records before exiting
    tracer.close();
}
