//! Wire format of the host-local control channel.
//!
//! The interception shim writes call records `{pid, opcode, body}` and
//! reads back reply records `{status, payload_length, payload}`. Integers
//! travel in host byte order (the channel never leaves the machine);
//! socket addresses travel as 8-byte `sockaddr_in`-style blobs whose port
//! and address are in network order, like the kernel structures the shim
//! intercepts.

use byteorder::{BigEndian, NativeEndian, ReadBytesExt, WriteBytesExt};

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Call opcodes understood by the handler.
pub mod opcodes {
    pub const SOCKET: u32 = 1;
    pub const SOCKETPAIR: u32 = 2;
    pub const BIND: u32 = 3;
    pub const GETSOCKNAME: u32 = 4;
    pub const CONNECT: u32 = 5;
    pub const GETPEERNAME: u32 = 6;
    pub const SEND: u32 = 7;
    pub const RECV: u32 = 8;
    pub const SENDTO: u32 = 9;
    pub const RECVFROM: u32 = 10;
    pub const SENDMSG: u32 = 11;
    pub const RECVMSG: u32 = 12;
    pub const GETSOCKOPT: u32 = 13;
    pub const SETSOCKOPT: u32 = 14;
    pub const LISTEN: u32 = 15;
    pub const ACCEPT: u32 = 16;
    pub const ACCEPT4: u32 = 17;
    pub const SHUTDOWN: u32 = 18;
    pub const CLOSE: u32 = 19;
}

/// Errno-style status codes of reply records. 0 is success.
pub mod errno {
    pub const EBADF: u32 = 9;
    pub const EWOULDBLOCK: u32 = 11;
    pub const EINVAL: u32 = 22;
    pub const EPIPE: u32 = 32;
    pub const EDESTADDRREQ: u32 = 89;
    pub const EMSGSIZE: u32 = 90;
    pub const EPROTONOSUPPORT: u32 = 93;
    pub const EOPNOTSUPP: u32 = 95;
    pub const EAFNOSUPPORT: u32 = 97;
    pub const EADDRINUSE: u32 = 98;
    pub const ENETUNREACH: u32 = 101;
    pub const ECONNABORTED: u32 = 103;
    pub const ENOTCONN: u32 = 107;
    pub const ETIMEDOUT: u32 = 110;
    pub const ECONNREFUSED: u32 = 111;
    pub const EHOSTUNREACH: u32 = 113;
}

pub const AF_INET: u16 = 2;
pub const SOCK_STREAM: u32 = 1;
pub const SOCK_DGRAM: u32 = 2;
pub const SOCK_RAW: u32 = 3;

pub const SHUT_RD: u32 = 0;
pub const SHUT_WR: u32 = 1;
pub const SHUT_RDWR: u32 = 2;

/// MSG_DONTWAIT, the only recv flag the handler interprets.
pub const MSG_DONTWAIT: u32 = 0x40;

/// Maps a fabric error kind to the errno stored as a socket's pending
/// error.
pub fn errno_for_kind(kind: ::frame::ErrorKind) -> u32 {
    use frame::ErrorKind::*;
    match kind {
        PortUnreachable => errno::ECONNREFUSED,
        NetUnreachable | SourceRouteFailed => errno::ENETUNREACH,
        HostUnreachable | TtlExceeded | FragTimeExceeded => errno::EHOSTUNREACH,
        FragNeeded => errno::EMSGSIZE,
        ProtoUnreachable => errno::EPROTONOSUPPORT,
        QueueFull => errno::EWOULDBLOCK,
    }
}

/// Serializes an address into the 8-byte wire blob.
pub fn sockaddr_to_bytes(addr: &SocketAddrV4) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..2].copy_from_slice(&AF_INET.to_ne_bytes());
    bytes[2..4].copy_from_slice(&addr.port().to_be_bytes());
    bytes[4..8].copy_from_slice(&addr.ip().octets());
    bytes
}

/// Parses the 8-byte wire blob; `None` for a non-INET family.
pub fn sockaddr_from_bytes(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() < 8 {
        return None;
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    if family != AF_INET {
        return None;
    }
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
    Some(SocketAddrV4::new(ip, port))
}

/// The handler's end of the control channel byte streams.
pub struct ControlChannel {
    rx: Box<dyn Read + Send>,
    tx: Box<dyn Write + Send>,
}

impl ControlChannel {
    pub fn new(rx: Box<dyn Read + Send>, tx: Box<dyn Write + Send>) -> ControlChannel {
        ControlChannel { rx: rx, tx: tx }
    }

    /// Reads the fixed call header.
    pub fn read_call(&mut self) -> io::Result<(u32, u32)> {
        let pid = self.rx.read_u32::<NativeEndian>()?;
        let opcode = self.rx.read_u32::<NativeEndian>()?;
        Ok((pid, opcode))
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        self.rx.read_u32::<NativeEndian>()
    }

    pub fn read_i32(&mut self) -> io::Result<i32> {
        self.rx.read_i32::<NativeEndian>()
    }

    pub fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut bytes = vec![0u8; len];
        self.rx.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    pub fn read_sockaddr(&mut self) -> io::Result<Option<SocketAddrV4>> {
        let bytes = self.read_bytes(8)?;
        Ok(sockaddr_from_bytes(&bytes))
    }

    /// Writes one reply record.
    pub fn write_reply(&mut self, status: u32, payload: &[u8]) -> io::Result<()> {
        self.tx.write_u32::<NativeEndian>(status)?;
        self.tx.write_u32::<NativeEndian>(payload.len() as u32)?;
        self.tx.write_all(payload)?;
        self.tx.flush()
    }
}

#[cfg(test)]
mod tests {
    use frame::ErrorKind;

    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 40000);
        let bytes = sockaddr_to_bytes(&addr);
        // Port and address are in network order on the wire.
        assert_eq!(&bytes[2..4], &[0x9c, 0x40]);
        assert_eq!(&bytes[4..8], &[192, 0, 2, 1]);
        assert_eq!(sockaddr_from_bytes(&bytes), Some(addr));
    }

    #[test]
    fn non_inet_family_is_rejected() {
        let mut bytes = sockaddr_to_bytes(&SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 5));
        bytes[0] = 10; // AF_INET6 on most ABIs
        bytes[1] = 0;
        assert_eq!(sockaddr_from_bytes(&bytes), None);
    }

    #[test]
    fn kind_to_errno_mapping() {
        assert_eq!(errno_for_kind(ErrorKind::PortUnreachable), errno::ECONNREFUSED);
        assert_eq!(errno_for_kind(ErrorKind::FragNeeded), errno::EMSGSIZE);
        assert_eq!(errno_for_kind(ErrorKind::NetUnreachable), errno::ENETUNREACH);
    }
}
