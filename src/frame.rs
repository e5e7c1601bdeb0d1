//! The frame: the universal message passed between protocol modules.
//!
//! A frame is either a data frame (a protocol data unit travelling up toward
//! a client or down toward the link, with a metadata sidecar) or a control
//! frame (an alert, a parameter read/write, an execution request or an
//! error). All frames carry an ordered, non-empty destination list of module
//! ids; more than one id means multicast.

use metadata::Metadata;
use routing::Route;

use std::fmt;
use std::net::Ipv4Addr;

/// Identity of a protocol module. The numeric values are the stable 8-bit
/// queue addresses used in diagnostics and on the control-channel wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleId {
    Switch,
    Ethernet,
    Ipv4,
    Tcp,
    Udp,
    Socket,
    Arp,
    Icmp,
    Rtm,
}

impl ModuleId {
    /// Every module, in switch service order.
    pub const ALL: [ModuleId; 9] = [ModuleId::Switch,
                                    ModuleId::Ethernet,
                                    ModuleId::Ipv4,
                                    ModuleId::Tcp,
                                    ModuleId::Udp,
                                    ModuleId::Socket,
                                    ModuleId::Arp,
                                    ModuleId::Icmp,
                                    ModuleId::Rtm];

    pub fn as_u8(&self) -> u8 {
        match *self {
            ModuleId::Switch => 0,
            ModuleId::Ethernet => 11,
            ModuleId::Ipv4 => 22,
            ModuleId::Tcp => 33,
            ModuleId::Udp => 44,
            ModuleId::Socket => 55,
            ModuleId::Arp => 66,
            ModuleId::Icmp => 77,
            ModuleId::Rtm => 88,
        }
    }

    pub fn from_u8(id: u8) -> Option<ModuleId> {
        match id {
            0 => Some(ModuleId::Switch),
            11 => Some(ModuleId::Ethernet),
            22 => Some(ModuleId::Ipv4),
            33 => Some(ModuleId::Tcp),
            44 => Some(ModuleId::Udp),
            55 => Some(ModuleId::Socket),
            66 => Some(ModuleId::Arp),
            77 => Some(ModuleId::Icmp),
            88 => Some(ModuleId::Rtm),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match *self {
            ModuleId::Switch => "switch",
            ModuleId::Ethernet => "ethernet",
            ModuleId::Ipv4 => "ipv4",
            ModuleId::Tcp => "tcp",
            ModuleId::Udp => "udp",
            ModuleId::Socket => "socket",
            ModuleId::Arp => "arp",
            ModuleId::Icmp => "icmp",
            ModuleId::Rtm => "rtm",
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.name())
    }
}

/// Ordered, non-empty list of destination module ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestList(Vec<ModuleId>);

impl DestList {
    /// Unicast destination.
    pub fn to(id: ModuleId) -> DestList {
        DestList(vec![id])
    }

    /// Multicast destination; the switch delivers a copy to every id.
    ///
    /// # Panics
    ///
    /// Panics if `ids` is empty. A frame without a destination cannot be
    /// routed.
    pub fn multicast(ids: &[ModuleId]) -> DestList {
        assert!(!ids.is_empty(), "empty destination list");
        DestList(ids.to_vec())
    }

    pub fn head(&self) -> ModuleId {
        self.0[0]
    }

    pub fn ids(&self) -> &[ModuleId] {
        &self.0[..]
    }

    /// The deliverable destinations: the list with leading `Switch` entries
    /// resolved away, the way the switch itself strips its own id.
    pub fn resolve(&self) -> Vec<ModuleId> {
        self.0.iter().cloned().filter(|id| *id != ModuleId::Switch).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Direction of travel of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ingress network data, toward a client.
    Up,
    /// Egress network data, toward the link.
    Down,
}

/// Opcode of a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CtrlOpcode {
    /// Pushed notification; not an error.
    Alert,
    /// Read a module parameter.
    ReadParam,
    /// Reply carrying a parameter value.
    ReadParamReply,
    /// Replace a module parameter.
    SetParam,
    /// Ask a module to do something; module dependent.
    Exec,
    /// Reply to an `Exec`, when one is required.
    ExecReply,
    /// Error report, e.g. a translated ICMP message.
    Error,
}

impl fmt::Display for CtrlOpcode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            CtrlOpcode::Alert => "alert",
            CtrlOpcode::ReadParam => "read_param",
            CtrlOpcode::ReadParamReply => "read_param_reply",
            CtrlOpcode::SetParam => "set_param",
            CtrlOpcode::Exec => "exec",
            CtrlOpcode::ExecReply => "exec_reply",
            CtrlOpcode::Error => "error",
        };
        fmt.write_str(name)
    }
}

/// Closed enumeration of the error classes carried by `Error` control
/// frames. Each kind keeps its textual wire name so the control-channel
/// format stays compatible with name-prefix consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NetUnreachable,
    HostUnreachable,
    ProtoUnreachable,
    PortUnreachable,
    FragNeeded,
    SourceRouteFailed,
    TtlExceeded,
    FragTimeExceeded,
    QueueFull,
}

impl ErrorKind {
    pub fn wire_name(&self) -> &'static str {
        match *self {
            ErrorKind::NetUnreachable => "DUnetunreach",
            ErrorKind::HostUnreachable => "DUhostunreach",
            ErrorKind::ProtoUnreachable => "DUprotounreach",
            ErrorKind::PortUnreachable => "DUportunreach",
            ErrorKind::FragNeeded => "DUfragneeded",
            ErrorKind::SourceRouteFailed => "DUsrcroute",
            ErrorKind::TtlExceeded => "TTLexceeded",
            ErrorKind::FragTimeExceeded => "TTLfragtime",
            ErrorKind::QueueFull => "queue_full",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<ErrorKind> {
        match name {
            "DUnetunreach" => Some(ErrorKind::NetUnreachable),
            "DUhostunreach" => Some(ErrorKind::HostUnreachable),
            "DUprotounreach" => Some(ErrorKind::ProtoUnreachable),
            "DUportunreach" => Some(ErrorKind::PortUnreachable),
            "DUfragneeded" => Some(ErrorKind::FragNeeded),
            "DUsrcroute" => Some(ErrorKind::SourceRouteFailed),
            "TTLexceeded" => Some(ErrorKind::TtlExceeded),
            "TTLfragtime" => Some(ErrorKind::FragTimeExceeded),
            "queue_full" => Some(ErrorKind::QueueFull),
            _ => None,
        }
    }

    /// The ICMP (type, code) pair of kinds that map to a wire message.
    /// `QueueFull` is fabric-internal and maps to nothing.
    pub fn icmp_type_code(&self) -> Option<(u8, u8)> {
        match *self {
            ErrorKind::NetUnreachable => Some((3, 0)),
            ErrorKind::HostUnreachable => Some((3, 1)),
            ErrorKind::ProtoUnreachable => Some((3, 2)),
            ErrorKind::PortUnreachable => Some((3, 3)),
            ErrorKind::FragNeeded => Some((3, 4)),
            ErrorKind::SourceRouteFailed => Some((3, 5)),
            ErrorKind::TtlExceeded => Some((11, 0)),
            ErrorKind::FragTimeExceeded => Some((11, 1)),
            ErrorKind::QueueFull => None,
        }
    }

    /// Maps an ICMP (type, code) pair from the wire to an error kind.
    pub fn from_icmp_type_code(icmp_type: u8, icmp_code: u8) -> Option<ErrorKind> {
        match (icmp_type, icmp_code) {
            (3, 0) => Some(ErrorKind::NetUnreachable),
            (3, 1) => Some(ErrorKind::HostUnreachable),
            (3, 2) => Some(ErrorKind::ProtoUnreachable),
            (3, 3) => Some(ErrorKind::PortUnreachable),
            (3, 4) => Some(ErrorKind::FragNeeded),
            (3, 5) => Some(ErrorKind::SourceRouteFailed),
            (11, 0) => Some(ErrorKind::TtlExceeded),
            (11, 1) => Some(ErrorKind::FragTimeExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.wire_name())
    }
}

/// An error report travelling in a control frame. `detail` is
/// kind-specific; for errors derived from or destined for ICMP it holds the
/// offending IP header plus the first 8 octets of its transport payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub detail: Vec<u8>,
}

/// A parameter value moved by `ReadParamReply`/`SetParam` frames.
#[derive(Debug, Clone)]
pub enum ParamValue {
    U32(u32),
    Addr(Ipv4Addr),
    Routes(Vec<Route>),
}

/// Opcode-specific data slot of a control frame.
#[derive(Debug, Clone)]
pub enum CtrlData {
    None,
    Bytes(Vec<u8>),
    Param(ParamValue),
    Error(ErrorReport),
}

/// A data frame: one PDU moving through the stack.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub direction: Direction,
    pub pdu: Vec<u8>,
    pub meta: Metadata,
}

/// A control frame. Serial numbers are monotonic per (sender, opcode).
#[derive(Debug, Clone)]
pub struct CtrlFrame {
    pub sender: ModuleId,
    pub opcode: CtrlOpcode,
    pub serial: u32,
    /// Parameter/function/error name. For errors this is the wire name of
    /// the `ErrorKind` in `data`.
    pub name: String,
    pub data: CtrlData,
}

#[derive(Debug, Clone)]
pub enum FrameBody {
    Data(DataFrame),
    Control(CtrlFrame),
}

/// The universal inter-module message. Cloning deep-copies the PDU and
/// shallow-copies the metadata map (value storage is reference counted).
#[derive(Debug, Clone)]
pub struct Frame {
    pub dst: DestList,
    pub body: FrameBody,
}

impl Frame {
    pub fn data(dst: DestList, direction: Direction, pdu: Vec<u8>, meta: Metadata) -> Frame {
        Frame {
            dst: dst,
            body: FrameBody::Data(DataFrame {
                direction: direction,
                pdu: pdu,
                meta: meta,
            }),
        }
    }

    pub fn control(dst: DestList, ctrl: CtrlFrame) -> Frame {
        Frame {
            dst: dst,
            body: FrameBody::Control(ctrl),
        }
    }

    pub fn is_data(&self) -> bool {
        match self.body {
            FrameBody::Data(..) => true,
            FrameBody::Control(..) => false,
        }
    }

    pub fn as_data(&self) -> Option<&DataFrame> {
        match self.body {
            FrameBody::Data(ref data) => Some(data),
            FrameBody::Control(..) => None,
        }
    }

    pub fn as_control(&self) -> Option<&CtrlFrame> {
        match self.body {
            FrameBody::Control(ref ctrl) => Some(ctrl),
            FrameBody::Data(..) => None,
        }
    }

    /// Short description for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self.body {
            FrameBody::Data(..) => "data",
            FrameBody::Control(..) => "control",
        }
    }
}
