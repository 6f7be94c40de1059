/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Length-prefixed borsh framing over TCP, and [Stream]: a wrapper around
//! [TcpStream](std::net::TcpStream) which implements in-the-background reads and writes of
//! [Message]s.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::messages::Message;
use crate::types::basic::ReplicaId;

/// Upper bound on a single frame. Frames beyond this are treated as stream corruption.
const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

/// Serialize `value` and write it to `stream` as one `u32`-length-prefixed frame.
pub(crate) fn write_frame<T: BorshSerialize>(stream: &mut TcpStream, value: &T) -> io::Result<()> {
    let bytes = value.try_to_vec()?;
    if bytes.len() as u32 > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }
    stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
    stream.write_all(&bytes)
}

/// Read one `u32`-length-prefixed frame from `stream` and deserialize it.
pub(crate) fn read_frame<T: BorshDeserialize>(stream: &mut TcpStream) -> io::Result<T> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum size",
        ));
    }

    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;
    T::try_from_slice(&buf).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "frame failed to deserialize")
    })
}

/// A live peer connection with background reader and writer threads.
///
/// The writer thread drains a bounded queue and writes frames to the socket; the reader thread
/// reads frames and pushes them, tagged with the peer's id, into the shared inbox drained by the
/// poller. When either thread hits an I/O error it flips the shared liveness flag and exits,
/// which marks the stream for reconnection by the establisher. The adapter either delivers a
/// message intact or does not deliver it at all.
pub(crate) struct Stream {
    to_writer: mpsc::SyncSender<Message>,
    alive: Arc<AtomicBool>,
}

impl Stream {
    /// Wrap an established `tcp_stream` to `peer`, spawning its reader and writer threads.
    pub(crate) fn start(
        tcp_stream: TcpStream,
        peer: ReplicaId,
        inbox: mpsc::Sender<(ReplicaId, Message)>,
        writer_channel_buffer_len: usize,
    ) -> io::Result<Stream> {
        let (to_writer, from_main) = mpsc::sync_channel(writer_channel_buffer_len);
        let alive = Arc::new(AtomicBool::new(true));

        Self::writer(from_main, tcp_stream.try_clone()?, Arc::clone(&alive));
        Self::reader(inbox, peer, tcp_stream, Arc::clone(&alive));

        Ok(Stream { to_writer, alive })
    }

    /// Enqueue `msg` for writing. Blocks if the writer queue is full. Returns
    /// [StreamCorruptedError] if the connection has died.
    pub(crate) fn write(&self, msg: Message) -> Result<(), StreamCorruptedError> {
        if !self.is_alive() {
            return Err(StreamCorruptedError);
        }
        self.to_writer.send(msg).map_err(|_| StreamCorruptedError)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    // Continuously receives messages from the main thread and writes them into the socket.
    // On any write error the thread flips the liveness flag and quietly dies, marking the
    // stream for reconnection.
    fn writer(
        from_main: mpsc::Receiver<Message>,
        mut tcp_stream: TcpStream,
        alive: Arc<AtomicBool>,
    ) {
        thread::spawn(move || {
            while let Ok(msg) = from_main.recv() {
                if write_frame(&mut tcp_stream, &msg).is_err() {
                    break;
                }
            }
            alive.store(false, Ordering::Relaxed);
        });
    }

    // Continuously reads messages from the socket and pushes them into the inbox. On any read
    // or framing error the thread flips the liveness flag and quietly dies.
    fn reader(
        inbox: mpsc::Sender<(ReplicaId, Message)>,
        peer: ReplicaId,
        mut tcp_stream: TcpStream,
        alive: Arc<AtomicBool>,
    ) {
        thread::spawn(move || {
            while let Ok(msg) = read_frame::<Message>(&mut tcp_stream) {
                if inbox.send((peer, msg)).is_err() {
                    break;
                }
            }
            alive.store(false, Ordering::Relaxed);
        });
    }
}

pub(crate) struct StreamCorruptedError;
