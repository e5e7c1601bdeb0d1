//! Skeleton address resolution protocol module.
//!
//! Full ARP resolution is out of scope: the Ethernet endpoint learns
//! neighbor MACs passively from captured traffic and from configuration.
//! This module exists so ARP frames and resolution requests have an owner
//! of the regular handler shape: wire frames are counted and dropped,
//! resolution requests are acknowledged as unresolved so the requester can
//! apply its retry/drop policy.

use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlFrame, CtrlOpcode, DestList, Frame, FrameBody};

/// Name of the resolution request understood by this module.
pub const RESOLVE: &'static str = "resolve";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArpStats {
    pub frames_dropped: u64,
    pub requests_seen: u64,
}

#[derive(Default)]
pub struct ArpModule {
    stats: ArpStats,
}

impl ArpModule {
    pub fn new() -> ArpModule {
        ArpModule::default()
    }

    pub fn stats(&self) -> &ArpStats {
        &self.stats
    }

    fn control(&mut self, ctrl: CtrlFrame, ctx: &mut ModuleContext) {
        match ctrl.opcode {
            CtrlOpcode::Exec if ctrl.name == RESOLVE => {
                self.stats.requests_seen += 1;
                let mut reply = ctx.control(DestList::to(ctrl.sender),
                                            CtrlOpcode::ExecReply,
                                            RESOLVE,
                                            ctrl.data);
                if let FrameBody::Control(ref mut body) = reply.body {
                    body.serial = ctrl.serial;
                }
                let _ = ctx.send(reply);
            }
            CtrlOpcode::Error => {
                warn!("arp: control error {} from {}", ctrl.name, ctrl.sender)
            }
            _ => debug!("arp: ignoring {} control frame", ctrl.opcode),
        }
    }
}

impl FrameHandler for ArpModule {
    fn handle(&mut self, frame: Frame, ctx: &mut ModuleContext) {
        match frame.body {
            FrameBody::Data(..) => {
                // ARP wire traffic; resolution is handled passively.
                trace!("arp: dropping wire frame");
                self.stats.frames_dropped += 1;
            }
            FrameBody::Control(ctrl) => self.control(ctrl, ctx),
        }
    }
}
