// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # netfabric
//!
//! `netfabric` is a user-space IPv4 network stack. It sits between an
//! OS-level socket interception shim and a raw packet capture/injection pair
//! of endpoints: Ethernet frames captured from the link come in on one byte
//! stream, parsed IPv4/ICMP/UDP traffic is served to intercepted client
//! processes over a host-local control channel, and outbound traffic leaves
//! as Ethernet frames on a second byte stream.
//!
//! ## Architecture
//!
//! Internally the stack is a set of *protocol modules* that communicate
//! exclusively by message passing. The one currency between modules is the
//! frame: either a data frame (a PDU plus a typed metadata sidecar) or a
//! control frame (alerts, parameter reads/writes, execution requests,
//! errors).
//!
//! Every module owns exactly one ingress and one egress `FrameQueue`. The
//! `Switch` is the only component that touches queues of more than one
//! module: it pops frames from egress queues in a fair rotation and pushes
//! each one onto the ingress queue of the module named by the frame's
//! destination list. Modules themselves are `FrameHandler`s registered with
//! the `Fabric`, which owns the per-module dequeue-dispatch loop and the
//! module threads. A module never touches another module's queues, and a
//! frame is owned by exactly one module at a time; ownership transfers
//! through the switch.
//!
//! Ingress data flows capture → ethernet → switch → ipv4 → switch →
//! {udp, tcp, icmp} → switch → socket handler → client; egress is the
//! mirror image. TCP and ARP are present as skeleton modules of the same
//! shape.
//!
//! ## Link and control interfaces
//!
//! The capture and inject streams carry `{u32 little-endian length, frame
//! bytes}` records of complete Ethernet II frames. The control channel
//! carries socket-call records `{pid, opcode, body}` gated by a pair of
//! counting semaphores (named POSIX semaphores in the daemon, in-process
//! semaphores in tests); see the `socket` module.

extern crate byteorder;
extern crate ipnetwork;
#[cfg(unix)]
extern crate libc;
extern crate pnet;
extern crate rand;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;

#[macro_use]
extern crate log;

pub mod frame;
pub mod metadata;
pub mod queue;
pub mod fabric;
pub mod switch;

/// Module containing the Ethernet capture/inject endpoint.
pub mod ethernet;

/// Module containing IPv4 ingress, egress and reassembly.
pub mod ipv4;

/// Module containing internet control message protocol (ICMP) functionality.
pub mod icmp;

/// Module containing UDP functionality.
pub mod udp;

/// Skeleton TCP protocol module.
pub mod tcp;

/// Skeleton address resolution protocol module.
pub mod arp;

/// Runtime manager module.
pub mod rtm;

/// The socket-call handler and its control channel.
pub mod socket;

mod routing;
pub use routing::{Route, RoutingTable};

pub mod config;
pub mod sem;
pub mod stack;

/// Test utilities: in-process link pipes and a control-channel shim driver.
pub mod testing;

pub use frame::{CtrlData, CtrlFrame, CtrlOpcode, DataFrame, DestList, Direction, ErrorKind,
                ErrorReport, Frame, FrameBody, ModuleId, ParamValue};
pub use metadata::{MetaValue, Metadata};
pub use queue::{FrameQueue, QueueError};
