// SPDX-License-Identifier: GPL-3.0-or-later
//! The CLI surface shared by the single `executor` binary: `<target> <port>` plus an
//! optional log-level flag. One backend target is selected per process; there is no
//! subcommand beyond that.

use crate::LogLevel;
use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Target {
    Optee,
    Qsee,
    Tc,
    Beanpod,
}

#[derive(Parser, Debug)]
#[clap(name = "executor")]
pub struct Arguments {
    /// Which TEE client library to dispatch against.
    #[clap(value_enum)]
    pub target: Target,

    /// Base TCP port; the status socket binds here, the data socket at port + 1.
    pub port: u16,

    /// The level to filter runtime logging at; omit to run silent.
    #[clap(long, short, value_enum)]
    pub log_level: Option<LogLevel>,
}
