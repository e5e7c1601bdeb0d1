//! The control-channel server: maps intercepted socket calls to the
//! fabric.
//!
//! One thread serves the channel. Each call is gated by the semaphore
//! pair: the shim writes the record and posts the call semaphore; the
//! server reads the record, performs the operation, writes the reply and
//! posts the reply semaphore. Blocking calls (recv on an empty queue,
//! connect delegated to TCP) block the channel, which is serialized by
//! design.

use frame::{CtrlData, CtrlFrame, CtrlOpcode, DestList, Direction, Frame, ModuleId};
use ipv4::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use metadata::{keys, Metadata};
use queue::{FrameQueue, QueueError};
use sem::ChannelGate;

use super::channel::{self, ControlChannel, errno, opcodes};
use super::table::{ConnState, LogicalSocket, SocketTable};
use super::PendingExecs;

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Server-issued exec serials live in the upper half of the serial space
/// so they never collide with the module context's counters.
const EXEC_SERIAL_BASE: u32 = 0x8000_0000;

pub struct SocketServer {
    channel: ControlChannel,
    gate: Box<dyn ChannelGate>,
    table: Arc<SocketTable>,
    /// The socket module's egress queue; both halves of the handler emit
    /// through it.
    egress: FrameQueue,
    interface_addr: Ipv4Addr,
    pending_execs: PendingExecs,
    exec_serial: u32,
    connect_timeout: Duration,
}

impl SocketServer {
    pub fn new(channel: ControlChannel,
               gate: Box<dyn ChannelGate>,
               table: Arc<SocketTable>,
               egress: FrameQueue,
               interface_addr: Ipv4Addr,
               pending_execs: PendingExecs,
               connect_timeout: Duration)
               -> SocketServer {
        SocketServer {
            channel: channel,
            gate: gate,
            table: table,
            egress: egress,
            interface_addr: interface_addr,
            pending_execs: pending_execs,
            exec_serial: EXEC_SERIAL_BASE,
            connect_timeout: connect_timeout,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("netfabric-sockets".to_owned())
            .spawn(move || self.run())
            .expect("failed to spawn socket server thread")
    }

    fn run(mut self) {
        debug!("socket server running");
        loop {
            if !self.gate.wait_call() {
                break;
            }
            match self.serve_one() {
                Ok(()) => self.gate.post_reply(),
                Err(e) => {
                    error!("control channel failed: {}", e);
                    break;
                }
            }
        }
        debug!("socket server quitting");
    }

    fn serve_one(&mut self) -> io::Result<()> {
        let (pid, opcode) = self.channel.read_call()?;
        trace!("socket call pid {} opcode {}", pid, opcode);
        match opcode {
            opcodes::SOCKET => self.socket_call(pid),
            opcodes::BIND => self.bind_call(pid),
            opcodes::GETSOCKNAME => self.getsockname_call(pid),
            opcodes::GETPEERNAME => self.getpeername_call(pid),
            opcodes::CONNECT => self.connect_call(pid),
            opcodes::SEND => self.send_call(pid, false),
            opcodes::SENDTO | opcodes::SENDMSG => self.send_call(pid, true),
            opcodes::RECV => self.recv_call(pid, false),
            opcodes::RECVFROM | opcodes::RECVMSG => self.recv_call(pid, true),
            opcodes::GETSOCKOPT => self.getsockopt_call(pid),
            opcodes::SETSOCKOPT => self.setsockopt_call(pid),
            opcodes::LISTEN => self.listen_call(pid),
            opcodes::ACCEPT | opcodes::ACCEPT4 => self.accept_call(pid, opcode),
            opcodes::SHUTDOWN => self.shutdown_call(pid),
            opcodes::CLOSE => self.close_call(pid),
            opcodes::SOCKETPAIR => self.reply(pid, errno::EOPNOTSUPP, &[]),
            other => {
                // An unknown opcode desynchronizes the record stream;
                // nothing after this point can be parsed.
                Err(io::Error::new(io::ErrorKind::InvalidData,
                                   format!("unknown socket call opcode {}", other)))
            }
        }
    }

    /// Writes the reply record. A write failure means the client is gone:
    /// its sockets are torn down and the channel error propagates.
    fn reply(&mut self, pid: u32, status: u32, payload: &[u8]) -> io::Result<()> {
        match self.channel.write_reply(status, payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("reply to pid {} failed, tearing its sockets down", pid);
                self.teardown_pid(pid);
                Err(e)
            }
        }
    }

    fn teardown_pid(&mut self, pid: u32) {
        for socket in self.table.remove_pid(pid) {
            self.notify_close(&socket);
        }
    }

    // ---- individual calls ----

    fn socket_call(&mut self, pid: u32) -> io::Result<()> {
        let domain = self.channel.read_u32()?;
        let sock_type = self.channel.read_u32()?;
        let protocol = self.channel.read_u32()?;
        let fd = self.channel.read_i32()?;

        if domain != channel::AF_INET as u32 {
            return self.reply(pid, errno::EAFNOSUPPORT, &[]);
        }
        let proto = match sock_type {
            channel::SOCK_DGRAM => PROTO_UDP,
            channel::SOCK_STREAM => PROTO_TCP,
            channel::SOCK_RAW if protocol == PROTO_ICMP as u32 || protocol == 0 => PROTO_ICMP,
            channel::SOCK_RAW => protocol as u8,
            _ => return self.reply(pid, errno::EPROTONOSUPPORT, &[]),
        };
        match self.table.create(pid, fd, sock_type, proto) {
            Ok(socket) => {
                debug!("socket: created fd {} for pid {} (fabric id {})",
                       fd,
                       pid,
                       socket.fabric_id);
                let id = socket.fabric_id.to_ne_bytes();
                self.reply(pid, 0, &id)
            }
            Err(()) => self.reply(pid, errno::EINVAL, &[]),
        }
    }

    fn bind_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let addr = self.channel.read_sockaddr()?;
        let addr = match addr {
            Some(addr) => addr,
            None => return self.reply(pid, errno::EAFNOSUPPORT, &[]),
        };
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        let addr = if addr.port() == 0 {
            SocketAddrV4::new(*addr.ip(), self.table.ephemeral_port(socket.protocol))
        } else {
            addr
        };
        if self.table.bind_conflict(socket.protocol, addr, socket.fabric_id) {
            return self.reply(pid, errno::EADDRINUSE, &[]);
        }
        {
            let mut state = socket.state.lock().unwrap();
            state.local = Some(addr);
            if state.conn == ConnState::Fresh {
                state.conn = ConnState::Bound;
            }
        }
        debug!("socket: fd {} bound to {}", fd, addr);
        self.reply(pid, 0, &[])
    }

    fn getsockname_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        let local = socket.local().unwrap_or(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 0));
        let bytes = channel::sockaddr_to_bytes(&local);
        self.reply(pid, 0, &bytes)
    }

    fn getpeername_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        match socket.peer() {
            Some(peer) => {
                let bytes = channel::sockaddr_to_bytes(&peer);
                self.reply(pid, 0, &bytes)
            }
            None => self.reply(pid, errno::ENOTCONN, &[]),
        }
    }

    fn connect_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let addr = self.channel.read_sockaddr()?;
        let addr = match addr {
            Some(addr) => addr,
            None => return self.reply(pid, errno::EAFNOSUPPORT, &[]),
        };
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        if socket.protocol == PROTO_TCP {
            // The rendezvous belongs to the TCP module; park the call on
            // its reply.
            let status = self.delegate_exec(ModuleId::Tcp,
                                            "connect",
                                            CtrlData::Bytes(channel::sockaddr_to_bytes(&addr)
                                                .to_vec()));
            return self.reply(pid, status, &[]);
        }
        // UDP and raw sockets: connecting is purely local state.
        self.ensure_bound(&socket);
        {
            let mut state = socket.state.lock().unwrap();
            state.peer = Some(addr);
            state.conn = ConnState::Connected;
        }
        debug!("socket: fd {} connected to {}", fd, addr);
        self.reply(pid, 0, &[])
    }

    fn send_call(&mut self, pid: u32, with_addr: bool) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let _flags = self.channel.read_u32()?;
        let explicit = if with_addr {
            self.channel.read_sockaddr()?
        } else {
            None
        };
        let len = self.channel.read_u32()? as usize;
        let payload = self.channel.read_bytes(len)?;

        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        if let Some(errno) = socket.state.lock().unwrap().take_error() {
            return self.reply(pid, errno, &[]);
        }
        if socket.state.lock().unwrap().shut_wr {
            return self.reply(pid, errno::EPIPE, &[]);
        }
        let dst = match explicit.or(socket.peer()) {
            Some(dst) => dst,
            None => return self.reply(pid, errno::EDESTADDRREQ, &[]),
        };
        self.ensure_bound(&socket);
        let local = socket.local().unwrap();
        let src_ip = if *local.ip() == Ipv4Addr::new(0, 0, 0, 0) {
            self.interface_addr
        } else {
            *local.ip()
        };

        let mut meta = Metadata::new();
        meta.insert_ipv4(keys::IP_SRC, src_ip);
        meta.insert_ipv4(keys::IP_DST, *dst.ip());
        meta.insert_u32(keys::PROTOCOL, socket.protocol as u32);
        let transport = match socket.protocol {
            PROTO_UDP => {
                meta.insert_port(keys::PORT_SRC, local.port());
                meta.insert_port(keys::PORT_DST, dst.port());
                ModuleId::Udp
            }
            PROTO_TCP => {
                meta.insert_port(keys::PORT_SRC, local.port());
                meta.insert_port(keys::PORT_DST, dst.port());
                ModuleId::Tcp
            }
            _ => ModuleId::Icmp,
        };
        let sent = payload.len();
        let frame = Frame::data(DestList::to(transport), Direction::Down, payload, meta);
        match self.egress.enqueue(frame) {
            Ok(()) => self.reply(pid, 0, &(sent as u32).to_ne_bytes()),
            Err(..) => self.reply(pid, errno::ECONNABORTED, &[]),
        }
    }

    fn recv_call(&mut self, pid: u32, with_addr: bool) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let flags = self.channel.read_u32()?;
        let buf_len = self.channel.read_u32()? as usize;

        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        if let Some(errno) = socket.state.lock().unwrap().take_error() {
            return self.reply(pid, errno, &[]);
        }
        if socket.state.lock().unwrap().shut_rd {
            return self.reply(pid, 0, &[]);
        }
        let nonblocking = flags & channel::MSG_DONTWAIT != 0;
        let frame = if nonblocking {
            match socket.data.try_dequeue() {
                Ok(frame) => frame,
                Err(QueueError::Empty) => return self.reply(pid, errno::EWOULDBLOCK, &[]),
                Err(..) => return self.reply(pid, errno::EBADF, &[]),
            }
        } else {
            match socket.data.dequeue() {
                Ok(frame) => frame,
                Err(..) => return self.reply(pid, errno::EBADF, &[]),
            }
        };
        let data = match frame.body {
            ::frame::FrameBody::Data(data) => data,
            ::frame::FrameBody::Control(..) => return self.reply(pid, errno::EINVAL, &[]),
        };
        let from_ip = data.meta.ipv4_value(keys::IP_SRC).unwrap_or(Ipv4Addr::new(0, 0, 0, 0));
        let from_port = data.meta.port_value(keys::PORT_SRC).unwrap_or(0);
        // UDP queues the datagram with its header on; strip it here. Raw
        // sockets hand the client the whole PDU. Surplus bytes beyond the
        // client buffer are truncated, per datagram semantics.
        let body = match socket.protocol {
            PROTO_UDP if data.pdu.len() >= super::super::udp::HEADER_SIZE => {
                &data.pdu[super::super::udp::HEADER_SIZE..]
            }
            _ => &data.pdu[..],
        };
        let take = ::std::cmp::min(buf_len, body.len());
        let mut payload = Vec::with_capacity(8 + take);
        if with_addr {
            let from = SocketAddrV4::new(from_ip, from_port);
            payload.extend_from_slice(&channel::sockaddr_to_bytes(&from));
        }
        payload.extend_from_slice(&body[..take]);
        self.reply(pid, 0, &payload)
    }

    fn getsockopt_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let level = self.channel.read_u32()?;
        let optname = self.channel.read_u32()?;
        let optlen = self.channel.read_u32()? as usize;
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        let value = socket.state
            .lock()
            .unwrap()
            .options
            .get(&(level, optname))
            .cloned()
            .unwrap_or_else(|| vec![0u8; ::std::cmp::max(optlen, 4)]);
        let take = ::std::cmp::min(value.len(), ::std::cmp::max(optlen, 4));
        self.reply(pid, 0, &value[..take])
    }

    fn setsockopt_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let level = self.channel.read_u32()?;
        let optname = self.channel.read_u32()?;
        let optlen = self.channel.read_u32()? as usize;
        let value = self.channel.read_bytes(optlen)?;
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        // Unknown options are stored and succeed with no effect.
        socket.state.lock().unwrap().options.insert((level, optname), value);
        self.reply(pid, 0, &[])
    }

    fn listen_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let backlog = self.channel.read_u32()?;
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        if socket.protocol != PROTO_TCP {
            return self.reply(pid, errno::EOPNOTSUPP, &[]);
        }
        let status = self.delegate_exec(ModuleId::Tcp,
                                        "listen",
                                        CtrlData::Bytes(backlog.to_ne_bytes().to_vec()));
        if status == 0 {
            socket.state.lock().unwrap().conn = ConnState::Listening;
        }
        self.reply(pid, status, &[])
    }

    fn accept_call(&mut self, pid: u32, opcode: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        if opcode == opcodes::ACCEPT4 {
            let _flags = self.channel.read_u32()?;
        }
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        if socket.protocol != PROTO_TCP {
            return self.reply(pid, errno::EOPNOTSUPP, &[]);
        }
        let status = self.delegate_exec(ModuleId::Tcp, "accept", CtrlData::None);
        self.reply(pid, status, &[])
    }

    fn shutdown_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        let how = self.channel.read_u32()?;
        let socket = match self.table.get(pid, fd) {
            Some(socket) => socket,
            None => return self.reply(pid, errno::EBADF, &[]),
        };
        {
            let mut state = socket.state.lock().unwrap();
            match how {
                channel::SHUT_RD => state.shut_rd = true,
                channel::SHUT_WR => state.shut_wr = true,
                channel::SHUT_RDWR => {
                    state.shut_rd = true;
                    state.shut_wr = true;
                }
                _ => return self.reply(pid, errno::EINVAL, &[]),
            }
        }
        self.reply(pid, 0, &[])
    }

    fn close_call(&mut self, pid: u32) -> io::Result<()> {
        let fd = self.channel.read_i32()?;
        match self.table.remove(pid, fd) {
            Some(socket) => {
                debug!("socket: fd {} of pid {} closed", fd, pid);
                self.notify_close(&socket);
                self.reply(pid, 0, &[])
            }
            None => self.reply(pid, errno::EBADF, &[]),
        }
    }

    // ---- plumbing ----

    fn ensure_bound(&mut self, socket: &LogicalSocket) {
        let mut state = socket.state.lock().unwrap();
        if state.local.is_none() {
            let port = self.table.ephemeral_port(socket.protocol);
            state.local = Some(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), port));
            if state.conn == ConnState::Fresh {
                state.conn = ConnState::Bound;
            }
        }
    }

    /// Tells the transport module that a socket went away.
    fn notify_close(&mut self, socket: &LogicalSocket) {
        let transport = match socket.protocol {
            PROTO_UDP => ModuleId::Udp,
            PROTO_TCP => ModuleId::Tcp,
            _ => return,
        };
        self.exec_serial = self.exec_serial.wrapping_add(1);
        let frame = Frame::control(DestList::to(transport),
                                   CtrlFrame {
                                       sender: ModuleId::Socket,
                                       opcode: CtrlOpcode::Exec,
                                       serial: self.exec_serial,
                                       name: "close".to_owned(),
                                       data: CtrlData::Bytes(socket.fabric_id
                                           .to_ne_bytes()
                                           .to_vec()),
                                   });
        let _ = self.egress.try_enqueue(frame);
    }

    /// Sends an `Exec` to another module and parks until its `ExecReply`
    /// comes back through the socket module, or the timeout fires.
    fn delegate_exec(&mut self, target: ModuleId, name: &str, data: CtrlData) -> u32 {
        let (tx, rx) = mpsc::channel();
        self.exec_serial = self.exec_serial.wrapping_add(1);
        let serial = self.exec_serial;
        self.pending_execs.lock().unwrap().insert(serial, tx);
        let frame = Frame::control(DestList::to(target),
                                   CtrlFrame {
                                       sender: ModuleId::Socket,
                                       opcode: CtrlOpcode::Exec,
                                       serial: serial,
                                       name: name.to_owned(),
                                       data: data,
                                   });
        if self.egress.enqueue(frame).is_err() {
            self.pending_execs.lock().unwrap().remove(&serial);
            return errno::ECONNABORTED;
        }
        match rx.recv_timeout(self.connect_timeout) {
            Ok(status) => status,
            Err(..) => {
                self.pending_execs.lock().unwrap().remove(&serial);
                debug!("socket: {} request to {} timed out", name, target);
                errno::ETIMEDOUT
            }
        }
    }
}
