//! Utilities for exercising an assembled stack without a real link or a
//! real interception shim: in-memory pipes stand in for the capture and
//! inject streams, and `ShimClient` drives the control channel the way the
//! shim process would.

use config::Config;
use sem::{LocalGate, Semaphore};
use socket::channel::{self, ControlChannel, opcodes};
use stack::{LinkStreams, NetworkStack};

use byteorder::{LittleEndian, NativeEndian, WriteBytesExt};

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Creates an in-memory unidirectional byte pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel();
    (PipeWriter { tx: tx },
     PipeReader {
         rx: rx,
         buffer: Vec::new(),
         pos: 0,
     })
}

pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "reader gone"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buffer.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buffer = chunk;
                    self.pos = 0;
                }
                // Every writer dropped: end of stream.
                Err(..) => return Ok(0),
            }
        }
        let take = ::std::cmp::min(buf.len(), self.buffer.len() - self.pos);
        buf[..take].copy_from_slice(&self.buffer[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }
}

/// Reassembles `{u32le length, bytes}` records out of the chunks the
/// inject writer produces.
pub struct RecordCollector {
    rx: Receiver<Vec<u8>>,
    buffer: Vec<u8>,
}

impl RecordCollector {
    /// Next complete record within `timeout`, or `None`.
    pub fn next_record(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.buffer.len() >= 4 {
                let want = u32::from_le_bytes([self.buffer[0],
                                               self.buffer[1],
                                               self.buffer[2],
                                               self.buffer[3]]) as usize;
                if self.buffer.len() >= 4 + want {
                    let record = self.buffer[4..4 + want].to_vec();
                    self.buffer.drain(..4 + want);
                    return Some(record);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

/// Drives the control channel the way the interception shim would: write
/// the call record, post the call semaphore, wait on the reply semaphore,
/// read the reply record.
pub struct ShimClient {
    pub pid: u32,
    tx: PipeWriter,
    rx: PipeReader,
    call: Arc<Semaphore>,
    reply: Arc<Semaphore>,
}

impl ShimClient {
    pub fn call(&mut self, opcode: u32, body: &[u8]) -> (u32, Vec<u8>) {
        self.tx.write_u32::<NativeEndian>(self.pid).unwrap();
        self.tx.write_u32::<NativeEndian>(opcode).unwrap();
        self.tx.write_all(body).unwrap();
        self.call.post();
        assert!(self.reply.wait_timeout(Duration::from_secs(10)),
                "socket handler did not reply within 10s");
        let mut header = [0u8; 8];
        self.rx.read_exact(&mut header).unwrap();
        let status = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let mut payload = vec![0u8; len];
        self.rx.read_exact(&mut payload).unwrap();
        (status, payload)
    }

    /// `socket()`; returns (status, fabric id).
    pub fn socket(&mut self, sock_type: u32, protocol: u32, fd: i32) -> (u32, u32) {
        let mut body = Vec::new();
        body.write_u32::<NativeEndian>(channel::AF_INET as u32).unwrap();
        body.write_u32::<NativeEndian>(sock_type).unwrap();
        body.write_u32::<NativeEndian>(protocol).unwrap();
        body.write_i32::<NativeEndian>(fd).unwrap();
        let (status, payload) = self.call(opcodes::SOCKET, &body);
        let id = if payload.len() == 4 {
            u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]])
        } else {
            0
        };
        (status, id)
    }

    pub fn bind(&mut self, fd: i32, addr: SocketAddrV4) -> u32 {
        let mut body = Vec::new();
        body.write_i32::<NativeEndian>(fd).unwrap();
        body.extend_from_slice(&channel::sockaddr_to_bytes(&addr));
        self.call(opcodes::BIND, &body).0
    }

    pub fn connect(&mut self, fd: i32, addr: SocketAddrV4) -> u32 {
        let mut body = Vec::new();
        body.write_i32::<NativeEndian>(fd).unwrap();
        body.extend_from_slice(&channel::sockaddr_to_bytes(&addr));
        self.call(opcodes::CONNECT, &body).0
    }

    pub fn sendto(&mut self, fd: i32, addr: SocketAddrV4, data: &[u8]) -> u32 {
        let mut body = Vec::new();
        body.write_i32::<NativeEndian>(fd).unwrap();
        body.write_u32::<NativeEndian>(0).unwrap();
        body.extend_from_slice(&channel::sockaddr_to_bytes(&addr));
        body.write_u32::<NativeEndian>(data.len() as u32).unwrap();
        body.extend_from_slice(data);
        self.call(opcodes::SENDTO, &body).0
    }

    pub fn send(&mut self, fd: i32, data: &[u8]) -> u32 {
        let mut body = Vec::new();
        body.write_i32::<NativeEndian>(fd).unwrap();
        body.write_u32::<NativeEndian>(0).unwrap();
        body.write_u32::<NativeEndian>(data.len() as u32).unwrap();
        body.extend_from_slice(data);
        self.call(opcodes::SEND, &body).0
    }

    /// `recvfrom()`; returns (status, source address, data).
    pub fn recvfrom(&mut self,
                    fd: i32,
                    flags: u32,
                    buf_len: u32)
                    -> (u32, Option<SocketAddrV4>, Vec<u8>) {
        let mut body = Vec::new();
        body.write_i32::<NativeEndian>(fd).unwrap();
        body.write_u32::<NativeEndian>(flags).unwrap();
        body.write_u32::<NativeEndian>(buf_len).unwrap();
        let (status, payload) = self.call(opcodes::RECVFROM, &body);
        if status != 0 || payload.len() < 8 {
            return (status, None, payload);
        }
        let from = channel::sockaddr_from_bytes(&payload[..8]);
        (status, from, payload[8..].to_vec())
    }

    pub fn recv(&mut self, fd: i32, flags: u32, buf_len: u32) -> (u32, Vec<u8>) {
        let mut body = Vec::new();
        body.write_i32::<NativeEndian>(fd).unwrap();
        body.write_u32::<NativeEndian>(flags).unwrap();
        body.write_u32::<NativeEndian>(buf_len).unwrap();
        self.call(opcodes::RECV, &body)
    }

    pub fn close(&mut self, fd: i32) -> u32 {
        let mut body = Vec::new();
        body.write_i32::<NativeEndian>(fd).unwrap();
        self.call(opcodes::CLOSE, &body).0
    }
}

/// A fully assembled stack wired to in-memory endpoints.
pub struct TestStack {
    pub stack: NetworkStack,
    capture: Option<PipeWriter>,
    inject: RecordCollector,
    pub shim: ShimClient,
    gate_closed: Arc<AtomicBool>,
}

impl TestStack {
    /// Feeds one raw Ethernet frame into the capture stream.
    pub fn send_frame(&mut self, frame: &[u8]) {
        let writer = self.capture.as_mut().expect("capture stream already closed");
        writer.write_u32::<LittleEndian>(frame.len() as u32).unwrap();
        writer.write_all(frame).unwrap();
    }

    /// Next frame written to the inject stream.
    pub fn next_injected(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.inject.next_record(timeout)
    }

    /// Ends the capture stream, as if the capturing process went away.
    pub fn close_capture(&mut self) {
        self.capture = None;
    }

    /// Orderly teardown: end the capture stream, release the control
    /// channel gate, then stop and join the stack.
    pub fn shutdown(mut self) {
        self.capture = None;
        self.gate_closed.store(true, Ordering::SeqCst);
        self.stack.stop();
    }
}

impl Drop for TestStack {
    fn drop(&mut self) {
        self.capture = None;
        self.gate_closed.store(true, Ordering::SeqCst);
    }
}

/// The configuration the dummy stack runs with: 10.0.0.1/24, gateway
/// 10.0.0.254 with a known MAC, small queues so backpressure is testable.
pub fn dummy_config() -> Config {
    let mut config = Config::default();
    config.interface_addr = Ipv4Addr::new(10, 0, 0, 1);
    config.netmask = Ipv4Addr::new(255, 255, 255, 0);
    config.gateway = Ipv4Addr::new(10, 0, 0, 254);
    config.gateway_mac = Some("aa:bb:cc:dd:ee:ff".to_owned());
    config.interface_mac = "02:00:00:00:00:01".to_owned();
    config.queue_capacity = 64;
    config
}

pub fn dummy_stack() -> TestStack {
    dummy_stack_with(dummy_config())
}

pub fn dummy_stack_with(config: Config) -> TestStack {
    let (capture_writer, capture_reader) = pipe();

    let (inject_tx, inject_rx) = mpsc::channel();
    let inject_writer = PipeWriter { tx: inject_tx };
    let collector = RecordCollector {
        rx: inject_rx,
        buffer: Vec::new(),
    };

    let (shim_writer, server_reader) = pipe();
    let (server_writer, shim_reader) = pipe();
    let (gate, call, reply, gate_closed) = LocalGate::new();

    let channel = ControlChannel::new(Box::new(server_reader), Box::new(server_writer));
    let link = LinkStreams {
        capture: Box::new(capture_reader),
        inject: Box::new(inject_writer),
    };
    let stack = NetworkStack::new(&config, link, channel, Box::new(gate))
        .expect("unable to assemble test stack");

    TestStack {
        stack: stack,
        capture: Some(capture_writer),
        inject: collector,
        shim: ShimClient {
            pid: 4242,
            tx: shim_writer,
            rx: shim_reader,
            call: call,
            reply: reply,
        },
        gate_closed: gate_closed,
    }
}
