//! Skeleton TCP protocol module.
//!
//! Present so the fabric carries the full module set; the state machine
//! itself is not implemented. Ingress segments are counted and dropped,
//! connection-management requests from the socket handler are answered
//! with an unsupported-operation reply, and transport errors from ICMP are
//! relayed up like UDP does.

use fabric::{FrameHandler, ModuleContext};
use frame::{CtrlData, CtrlFrame, CtrlOpcode, DestList, Frame, FrameBody, ModuleId, ParamValue};

/// Errno carried in `ExecReply` frames for unimplemented operations.
const EOPNOTSUPP: u32 = 95;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TcpStats {
    pub segments_dropped: u64,
    pub requests_refused: u64,
    pub errors_relayed: u64,
}

#[derive(Default)]
pub struct TcpModule {
    stats: TcpStats,
}

impl TcpModule {
    pub fn new() -> TcpModule {
        TcpModule::default()
    }

    pub fn stats(&self) -> &TcpStats {
        &self.stats
    }

    fn control(&mut self, ctrl: CtrlFrame, ctx: &mut ModuleContext) {
        match ctrl.opcode {
            CtrlOpcode::Exec => {
                // connect/listen/accept rendezvous requests; refuse them
                // all until a real state machine exists.
                debug!("tcp: refusing {} request from {}", ctrl.name, ctrl.sender);
                self.stats.requests_refused += 1;
                let mut reply = ctx.control(DestList::to(ctrl.sender),
                                            CtrlOpcode::ExecReply,
                                            &ctrl.name,
                                            CtrlData::Param(ParamValue::U32(EOPNOTSUPP)));
                // Answer under the serial of the request so the caller can
                // pair it with the pending call.
                if let FrameBody::Control(ref mut body) = reply.body {
                    body.serial = ctrl.serial;
                }
                let _ = ctx.send(reply);
            }
            CtrlOpcode::Error if ctrl.sender == ModuleId::Icmp => {
                self.stats.errors_relayed += 1;
                let relayed = Frame::control(DestList::to(ModuleId::Socket), ctrl);
                let _ = ctx.send(relayed);
            }
            CtrlOpcode::Error => {
                warn!("tcp: control error {} from {}", ctrl.name, ctrl.sender)
            }
            _ => debug!("tcp: ignoring {} control frame", ctrl.opcode),
        }
    }
}

impl FrameHandler for TcpModule {
    fn handle(&mut self, frame: Frame, ctx: &mut ModuleContext) {
        match frame.body {
            FrameBody::Data(..) => {
                trace!("tcp: dropping segment, no state machine yet");
                self.stats.segments_dropped += 1;
            }
            FrameBody::Control(ctrl) => self.control(ctrl, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use fabric::ModuleContext;
    use frame::{CtrlData, CtrlOpcode, DestList, Direction, Frame, FrameBody, ModuleId,
                ParamValue};
    use metadata::Metadata;
    use queue::FrameQueue;

    use super::*;

    #[test]
    fn exec_is_refused_with_matching_serial() {
        let egress = FrameQueue::new("tcp2switch", 8);
        let mut ctx = ModuleContext::new(ModuleId::Tcp, egress.clone());
        let mut module = TcpModule::new();

        let request = CtrlFrame {
            sender: ModuleId::Socket,
            opcode: CtrlOpcode::Exec,
            serial: 17,
            name: "connect".to_owned(),
            data: CtrlData::None,
        };
        module.handle(Frame::control(DestList::to(ModuleId::Tcp), request), &mut ctx);

        let reply = egress.try_dequeue().unwrap();
        assert_eq!(reply.dst.head(), ModuleId::Socket);
        match reply.body {
            FrameBody::Control(ctrl) => {
                assert_eq!(ctrl.opcode, CtrlOpcode::ExecReply);
                assert_eq!(ctrl.serial, 17);
                match ctrl.data {
                    CtrlData::Param(ParamValue::U32(errno)) => assert_eq!(errno, 95),
                    other => panic!("unexpected data {:?}", other),
                }
            }
            FrameBody::Data(..) => panic!("expected control frame"),
        }
    }

    #[test]
    fn segments_are_counted_and_dropped() {
        let egress = FrameQueue::new("tcp2switch", 8);
        let mut ctx = ModuleContext::new(ModuleId::Tcp, egress.clone());
        let mut module = TcpModule::new();
        let frame = Frame::data(DestList::to(ModuleId::Tcp),
                                Direction::Up,
                                vec![0u8; 20],
                                Metadata::new());
        module.handle(frame, &mut ctx);
        assert!(egress.try_dequeue().is_err());
        assert_eq!(module.stats().segments_dropped, 1);
    }
}
