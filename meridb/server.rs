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

//! Connection manager: the TCP accept loop, per-connection workers and
//! the dead-connection reaper.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use meridb_engine::handlers::RequestHandler;
use meridb_engine::Instance;
use meridb_proto::{
    read_message, write_message, DatabaseEngineResponse, DbeRequest, MessageType, StatusMessage,
};

struct Worker {
    handle: thread::JoinHandle<()>,
    done: Arc<AtomicBool>,
}

/// The TCP server driving one engine instance.
pub struct Server {
    instance: Arc<Instance>,
    exit_requested: Arc<AtomicBool>,
    max_workers: usize,
    reap_interval: Duration,
}

impl Server {
    pub fn new(
        instance: Arc<Instance>,
        exit_requested: Arc<AtomicBool>,
        max_workers: usize,
        reap_interval: Duration,
    ) -> Server {
        Server {
            instance,
            exit_requested,
            max_workers,
            reap_interval,
        }
    }

    /// Accepts connections until exit is requested; joins all workers on
    /// the way out.
    pub fn run(&self, listener: TcpListener) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        info!(target: "server", "listening on {}", listener.local_addr()?);

        let mut workers: Vec<Worker> = Vec::new();
        let mut last_reap = Instant::now();
        while !self.exit_requested.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    reap_workers(&mut workers, false);
                    if workers.len() >= self.max_workers {
                        warn!(target: "server", "connection limit reached, rejecting {}", peer);
                        drop(stream);
                        continue;
                    }
                    debug!(target: "server", "accepted connection from {}", peer);
                    let instance = self.instance.clone();
                    let done = Arc::new(AtomicBool::new(false));
                    let done_flag = done.clone();
                    let exit = self.exit_requested.clone();
                    let handle = thread::Builder::new()
                        .name(format!("conn-{}", peer))
                        .spawn(move || {
                            if let Err(e) = serve_connection(instance, stream, &exit) {
                                debug!(target: "server", "connection {} closed: {}", peer, e);
                            }
                            done_flag.store(true, Ordering::SeqCst);
                        })?;
                    workers.push(Worker { handle, done });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e),
            }
            if last_reap.elapsed() >= self.reap_interval {
                reap_workers(&mut workers, false);
                last_reap = Instant::now();
            }
        }

        info!(target: "server", "shutting down, waiting for {} workers", workers.len());
        reap_workers(&mut workers, true);
        Ok(())
    }
}

// Joins finished workers; with `wait` set, joins all of them.
fn reap_workers(workers: &mut Vec<Worker>, wait: bool) {
    let mut remaining = Vec::with_capacity(workers.len());
    for worker in workers.drain(..) {
        if wait || worker.done.load(Ordering::SeqCst) {
            if worker.handle.join().is_err() {
                error!(target: "server", "worker thread panicked");
            }
        } else {
            remaining.push(worker);
        }
    }
    *workers = remaining;
}

// Session handshake followed by the request loop. The worker checks the
// exit flag between requests; in-flight operations complete.
fn serve_connection(
    instance: Arc<Instance>,
    stream: TcpStream,
    exit_requested: &AtomicBool,
) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    begin_session(&mut reader, &mut writer)?;
    let user_id = authenticate(&mut reader, &mut writer)?;
    let mut handler = RequestHandler::new(instance, &mut writer, user_id);

    while !exit_requested.load(Ordering::SeqCst) {
        let (message_type, payload) = match read_message(&mut reader)? {
            Some(message) => message,
            None => break,
        };
        if message_type != MessageType::Command {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected message type {:?}", message_type),
            ));
        }
        match DbeRequest::decode(&payload) {
            Ok((request_id, request)) => handler.execute_request(request_id, request)?,
            Err(e) => {
                warn!(target: "server", "malformed request: {}", e);
                let mut response = DatabaseEngineResponse::new(0);
                response.messages.push(StatusMessage {
                    code: u32::max_value(),
                    text: format!("malformed request: {}", e),
                });
                handler.write_response_raw(&response)?;
            }
        }
    }
    Ok(())
}

fn begin_session<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<()> {
    match read_message(reader)? {
        Some((MessageType::BeginSessionRequest, _)) => {
            write_message(writer, MessageType::BeginSessionResponse, &[1])
        }
        Some((other, _)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected session start, received {:?}", other),
        )),
        None => Err(io::ErrorKind::UnexpectedEof.into()),
    }
}

// Access-key authentication lives upstream; the engine trusts the session
// layer and assigns the superuser to every connection it admits.
fn authenticate<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<u32> {
    match read_message(reader)? {
        Some((MessageType::ClientAuthenticationRequest, _)) => {
            let user_id = meridb_engine::defs::SUPER_USER_ID;
            write_message(
                writer,
                MessageType::ClientAuthenticationResponse,
                &user_id.to_le_bytes(),
            )?;
            Ok(user_id)
        }
        Some((other, _)) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected authentication, received {:?}", other),
        )),
        None => Err(io::ErrorKind::UnexpectedEof.into()),
    }
}
