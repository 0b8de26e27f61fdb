// SPDX-License-Identifier: GPL-3.0-or-later
//! CLI entry point: parses the target/port, installs logging if asked for, builds the
//! selected backend, and hands it to the forkserver loop.

use clap::Parser;
use executor_core::cmdline::{Arguments, Target};
use executor_core::forkserver::Forkserver;

fn init_logging(level: Option<executor_core::LogLevel>) {
    let Some(level) = level else {
        return;
    };
    tracing_subscriber::fmt()
        .with_max_level(level.to_tracing())
        .with_target(false)
        .init();
}

fn main() {
    let args = Arguments::parse();
    init_logging(args.log_level);

    let code = match args.target {
        Target::Optee => Forkserver::run(optee_runtime::OpteeBackend::default(), args.port),
        Target::Qsee => Forkserver::run(qsee_runtime::QseeBackend::default(), args.port),
        Target::Tc => Forkserver::run(tc_runtime::TcBackend::default(), args.port),
        Target::Beanpod => Forkserver::run(beanpod_runtime::BeanpodBackend::default(), args.port),
    };

    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "executor failed");
            std::process::exit(1)
        }
    }
}
