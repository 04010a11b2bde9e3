use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::protocol::{encode_frame, ClientMessage, FrameDecoder, ServerMessage};
use crate::traits::SignalingChannel;

pub const DEFAULT_PORT: u16 = 31950;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Length-prefixed frames over a non-blocking TCP stream. Writes that would
/// block are buffered and retried on the next `flush`.
pub struct FramedStream {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: FrameDecoder,
    outbound: Vec<u8>,
    closed: bool,
}

impl FramedStream {
    pub fn connect(addr: &str) -> Result<Self> {
        let target = addr
            .to_socket_addrs()
            .with_context(|| format!("Resolving {}", addr))?
            .next()
            .ok_or_else(|| anyhow!("No address for {}", addr))?;
        let stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)
            .with_context(|| format!("Connecting to {}", target))?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(FramedStream {
            stream,
            peer,
            decoder: FrameDecoder::new(),
            outbound: Vec::new(),
            closed: false,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The peer hung up or the stream failed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn send_frame<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        if self.closed {
            return Err(anyhow!("Connection to {} is closed", self.peer));
        }
        self.outbound.extend(encode_frame(msg)?);
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => {
                    self.closed = true;
                    return Err(anyhow!("Connection to {} closed while writing", self.peer));
                }
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(e).with_context(|| format!("Writing to {}", self.peer));
                }
            }
        }
        Ok(())
    }

    /// Next complete frame, reading whatever the socket has ready.
    pub fn recv_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if let Some(frame) = self.decoder.next_frame()? {
            return Ok(Some(frame));
        }
        self.fill()?;
        self.decoder.next_frame()
    }

    fn fill(&mut self) -> Result<()> {
        let mut buf = [0u8; 4096];
        while !self.closed {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!("[Net] {} hung up", self.peer);
                    self.closed = true;
                }
                Ok(n) => self.decoder.push(&buf[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.closed = true;
                    return Err(e).with_context(|| format!("Reading from {}", self.peer));
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        // Best effort: push out anything still queued.
        let _ = self.flush();
        self.closed = true;
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Client side of the room server connection.
pub struct TcpSignaling {
    stream: FramedStream,
}

impl TcpSignaling {
    pub fn connect(addr: &str) -> Result<Self> {
        let stream = FramedStream::connect(addr)?;
        info!("[Net] Connected to room server {}", stream.peer());
        Ok(TcpSignaling { stream })
    }
}

impl SignalingChannel for TcpSignaling {
    fn send(&mut self, message: ClientMessage) -> Result<()> {
        self.stream.send_frame(&message)
    }

    fn try_recv(&mut self) -> Result<Option<ServerMessage>> {
        if !self.stream.is_closed() {
            self.stream.flush()?;
        }
        match self.stream.recv_frame()? {
            Some(msg) => Ok(Some(msg)),
            None if self.stream.is_closed() => Err(anyhow!("Room server {} closed the connection", self.stream.peer())),
            None => Ok(None),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.stream.is_closed() {
            return Ok(());
        }
        info!("[Net] Disconnecting from {}", self.stream.peer());
        self.stream.shutdown()
    }
}
