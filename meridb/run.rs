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

//! Server startup: engine initialization and the run loop.

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use meridb_engine::instance::InstanceConfig;
use meridb_engine::Instance;

use crate::config::ServerConfig;
use crate::server::Server;
use crate::ExitCode;

/// Brings the engine up and serves until a shutdown is requested.
pub fn run(config: ServerConfig) -> ExitCode {
    let cipher_key = match config.cipher_key() {
        Ok(key) => key,
        Err(e) => {
            error!(target: "server", "{}", e);
            return ExitCode::InvalidConfig;
        }
    };

    let mut instance_config = InstanceConfig::new(
        config.data_dir.clone(),
        config.system_cipher_id.clone(),
        cipher_key,
    );
    instance_config.table_cache_capacity = config.table_cache_capacity;

    let instance = match Instance::open(instance_config) {
        Ok(instance) => Arc::new(instance),
        Err(e) => {
            error!(target: "server", "engine initialization failed: {}", e);
            return ExitCode::DatabaseEngineInitializationFailed;
        }
    };
    info!(
        target: "server",
        "instance '{}' ready, {} database(s)",
        config.instance,
        instance.database_records().len()
    );

    let exit_requested = Arc::new(AtomicBool::new(false));
    {
        let exit_requested = exit_requested.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!(target: "server", "shutdown requested");
            exit_requested.store(true, Ordering::SeqCst);
        }) {
            error!(target: "server", "cannot install signal handler: {}", e);
            return ExitCode::InitializationFailed;
        }
    }

    let listener = match TcpListener::bind(&config.listen) {
        Ok(listener) => listener,
        Err(e) => {
            error!(target: "server", "cannot listen on {}: {}", config.listen, e);
            return ExitCode::ConnectionCreationFailed;
        }
    };

    let server = Server::new(
        instance.clone(),
        exit_requested,
        config.effective_worker_threads() * 4,
        Duration::from_secs(config.reap_interval_secs),
    );
    if let Err(e) = server.run(listener) {
        error!(target: "server", "server loop failed: {}", e);
        return ExitCode::InitializationFailed;
    }

    if let Err(e) = instance.flush() {
        error!(target: "server", "final flush failed: {}", e);
    }
    ExitCode::Success
}
