use anyhow::Result;
use clap::Parser;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jamsync::authority::{Outbound, RoomAuthority};
use jamsync::clock::SystemWallClock;
use jamsync::net::{FramedStream, DEFAULT_PORT};
use jamsync::protocol::{ClientMessage, ParticipantId};

#[derive(Parser, Debug)]
#[command(author, version, about = "Room server for jamsync sessions", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value_t = format!("0.0.0.0:{}", DEFAULT_PORT))]
    listen: String,
}

fn deliver(conns: &mut HashMap<ParticipantId, FramedStream>, outbound: Vec<Outbound>) {
    for o in outbound {
        let Some(conn) = conns.get_mut(&o.to) else {
            debug!("[Server] Dropping message for departed {}", o.to);
            continue;
        };
        if let Err(e) = conn.send_frame(&o.msg) {
            warn!("[Server] Send to {} failed: {}", o.to, e);
        }
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let listener = TcpListener::bind(&args.listen)?;
    listener.set_nonblocking(true)?;
    info!("[Server] Listening on {}", args.listen);

    let mut authority = RoomAuthority::new(SystemWallClock);
    let mut conns: HashMap<ParticipantId, FramedStream> = HashMap::new();
    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        let mut did_work = false;

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    did_work = true;
                    match FramedStream::from_stream(stream) {
                        Ok(conn) => {
                            let id = authority.connect();
                            info!("[Server] {} connected as {}", addr, id);
                            conns.insert(id, conn);
                        }
                        Err(e) => warn!("[Server] Could not set up {}: {}", addr, e),
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("[Server] Accept failed: {}", e);
                    break;
                }
            }
        }

        let mut outbound = Vec::new();
        let mut dead = Vec::new();
        for (id, conn) in conns.iter_mut() {
            loop {
                match conn.recv_frame::<ClientMessage>() {
                    Ok(Some(msg)) => {
                        did_work = true;
                        outbound.extend(authority.handle(id, msg));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("[Server] Dropping {}: {}", id, e);
                        let _ = conn.shutdown();
                        break;
                    }
                }
            }
            if !conn.is_closed() {
                if let Err(e) = conn.flush() {
                    warn!("[Server] Flush to {} failed: {}", id, e);
                }
            }
            if conn.is_closed() {
                dead.push(id.clone());
            }
        }

        for id in dead {
            if let Some(conn) = conns.remove(&id) {
                info!("[Server] {} ({}) disconnected", id, conn.peer());
            }
            outbound.extend(authority.disconnect(&id));
        }
        deliver(&mut conns, outbound);

        if last_log.elapsed() >= Duration::from_secs(10) {
            info!("[Status] {} connection(s), {} room(s)", conns.len(), authority.room_count());
            last_log = Instant::now();
        }

        if !did_work {
            thread::sleep(Duration::from_millis(1));
        }
    }

    for (_, mut conn) in conns.drain() {
        let _ = conn.shutdown();
    }
    info!("Exiting.");
    Ok(())
}
