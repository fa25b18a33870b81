// Copyright 2019-2021 Meridb Developers.
// This file is part of Meridb.

// Meridb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Meridb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Meridb.  If not, see <http://www.gnu.org/licenses/>.

//! Meridb server entry point.

use std::path::{Path, PathBuf};
use std::process;

use clap::{App, Arg};
use log::info;

use meridb::config::ServerConfig;
use meridb::ExitCode;

fn main() {
    let matches = App::new("meridb")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Meridb database server")
        .arg(
            Arg::with_name("instance")
                .long("instance")
                .takes_value(true)
                .help("Instance name"),
        )
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::with_name("data-dir")
                .long("data-dir")
                .takes_value(true)
                .help("Root data directory (overrides the configuration)"),
        )
        .arg(
            Arg::with_name("listen")
                .long("listen")
                .takes_value(true)
                .help("Listen address (overrides the configuration)"),
        )
        .get_matches();

    if env_logger::try_init().is_err() {
        eprintln!("cannot initialize logging");
        process::exit(ExitCode::LogInitializationFailed as i32);
    }

    let mut config = match matches.value_of("config") {
        Some(path) => match ServerConfig::load(Path::new(path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{}", e);
                process::exit(ExitCode::InvalidConfig as i32);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(instance) = matches.value_of("instance") {
        config.instance = instance.to_owned();
    }
    if let Some(data_dir) = matches.value_of("data-dir") {
        config.data_dir = PathBuf::from(data_dir);
    }
    if let Some(listen) = matches.value_of("listen") {
        config.listen = listen.to_owned();
    }
    if let Err(e) = config.validate() {
        eprintln!("{}", e);
        process::exit(ExitCode::InvalidConfig as i32);
    }

    info!(target: "server", "starting instance '{}'", config.instance);
    let code = meridb::run::run(config);
    if code != ExitCode::Success && code.is_fatal() {
        info!(target: "server", "exiting with fatal code {:?}", code);
    }
    process::exit(code as i32);
}
