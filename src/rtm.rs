//! The runtime manager module.
//!
//! The runtime manager is the administrative endpoint of the fabric: it
//! relays parameter reads and replacements (routing table, interface
//! address, MTU) to the module that owns them, logs the replies, and turns
//! fatal alerts (capture/inject stream failure) into a stack shutdown.

use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlFrame, CtrlOpcode, DestList, Frame, FrameBody, ModuleId};
use ipv4::params;
use stack::ShutdownSignal;

use std::sync::Arc;

/// Alert name raised when a link stream fails.
pub const ETHERNET_DOWN: &'static str = "ethernet_down";

pub struct RtmModule {
    shutdown: Arc<ShutdownSignal>,
}

impl RtmModule {
    pub fn new(shutdown: Arc<ShutdownSignal>) -> RtmModule {
        RtmModule { shutdown: shutdown }
    }

    /// The module owning a named parameter.
    fn owner_of(name: &str) -> Option<ModuleId> {
        match name {
            params::ROUTING_TABLE | params::INTERFACE_ADDR | params::MTU => Some(ModuleId::Ipv4),
            _ => None,
        }
    }

    fn control(&mut self, ctrl: CtrlFrame, ctx: &mut ModuleContext) {
        match ctrl.opcode {
            CtrlOpcode::Alert => {
                error!("rtm: fatal alert {} from {}, shutting down", ctrl.name, ctrl.sender);
                self.shutdown.request();
            }
            CtrlOpcode::ReadParam | CtrlOpcode::SetParam => {
                match Self::owner_of(&ctrl.name) {
                    Some(owner) => {
                        let forwarded = ctx.control(DestList::to(owner),
                                                    ctrl.opcode,
                                                    &ctrl.name,
                                                    ctrl.data);
                        let _ = ctx.send(forwarded);
                    }
                    None => debug!("rtm: no owner for parameter {:?}", ctrl.name),
                }
            }
            CtrlOpcode::ReadParamReply => {
                info!("rtm: parameter {} = {:?}", ctrl.name, ctrl.data);
            }
            CtrlOpcode::Error => {
                warn!("rtm: control error {} from {}", ctrl.name, ctrl.sender)
            }
            _ => debug!("rtm: ignoring {} control frame", ctrl.opcode),
        }
    }
}

impl FrameHandler for RtmModule {
    fn handle(&mut self, frame: Frame, ctx: &mut ModuleContext) {
        match frame.body {
            FrameBody::Data(..) => debug!("rtm: ignoring data frame"),
            FrameBody::Control(ctrl) => self.control(ctrl, ctx),
        }
    }
}
