//! The switch: the stateless router at the center of the fabric.
//!
//! The switch services every module's egress queue in a fair rotation,
//! taking at most one frame per queue per revolution, so no queue starves
//! for longer than one full revolution. Each frame is pushed onto the
//! ingress queue of the modules named by its destination list; the switch
//! itself never appears as a final destination and never mutates frame
//! contents. A frame is never dropped silently: an undeliverable frame
//! turns into a `CTRL_ERROR` back to its sender, identified by the egress
//! queue it was popped from, or is freed and counted when no sender can be
//! told.

use fabric::Fabric;
use frame::{CtrlData, CtrlFrame, CtrlOpcode, DestList, ErrorKind, ErrorReport, Frame, ModuleId};
use queue::{EnqueueError, FrameQueue, Notifier, QueueError};

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How many times a full destination queue is retried before the frame is
/// bounced back to its sender.
pub const DELIVERY_RETRIES: usize = 8;
/// Pause between delivery retries.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(1);
/// Longest the switch sleeps when every egress queue is empty.
const IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SwitchStats {
    /// Frames moved from an egress to an ingress queue.
    pub routed: u64,
    /// Frames bounced back to their sender as `queue_full` errors.
    pub bounced: u64,
    /// Frames with no resolvable destination.
    pub undeliverable: u64,
    /// Frames freed because not even the sender could be told.
    pub dropped: u64,
}

struct Member {
    id: ModuleId,
    ingress: FrameQueue,
    egress: FrameQueue,
}

/// The switch thread state. Built from a `Fabric` once all modules are
/// registered, then consumed by `spawn`.
pub struct Switch {
    members: Vec<Member>,
    notifier: Arc<Notifier>,
    error_serial: u32,
    stats: SwitchStats,
}

impl Switch {
    pub fn new(fabric: &Fabric) -> Switch {
        let members = fabric.endpoints()
            .iter()
            .map(|ep| {
                Member {
                    id: ep.id,
                    ingress: ep.ingress.clone(),
                    egress: ep.egress.clone(),
                }
            })
            .collect();
        Switch {
            members: members,
            notifier: fabric.notifier(),
            error_serial: 0,
            stats: SwitchStats::default(),
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        thread::Builder::new()
            .name("netfabric-switch".to_owned())
            .spawn(move || self.run())
            .expect("failed to spawn switch thread")
    }

    pub fn run(mut self) {
        if self.members.is_empty() {
            return;
        }
        debug!("switch running over {} modules", self.members.len());
        let mut seen = self.notifier.current();
        let mut start = 0;
        loop {
            let mut moved = false;
            let mut open = 0;
            for offset in 0..self.members.len() {
                let index = (start + offset) % self.members.len();
                match self.members[index].egress.try_dequeue() {
                    Ok(frame) => {
                        moved = true;
                        open += 1;
                        let sender = self.members[index].id;
                        self.route(sender, frame);
                    }
                    Err(QueueError::Empty) => open += 1,
                    Err(..) => {}
                }
            }
            start = (start + 1) % self.members.len();
            if open == 0 {
                break;
            }
            if !moved {
                seen = self.notifier.wait(seen, IDLE_WAIT);
            }
        }
        debug!("switch quitting: {:?}", self.stats);
    }

    pub fn stats(&self) -> &SwitchStats {
        &self.stats
    }

    /// Routes one frame popped from `sender`'s egress queue. Multicast
    /// destinations receive deep copies, the last one the original.
    fn route(&mut self, sender: ModuleId, frame: Frame) {
        let dests = frame.dst.resolve();
        if dests.is_empty() {
            self.stats.undeliverable += 1;
            self.bounce(sender, ErrorKind::QueueFull, b"no destination".to_vec());
            return;
        }
        let last = dests.len() - 1;
        for id in &dests[..last] {
            self.deliver(sender, *id, frame.clone());
        }
        self.deliver(sender, dests[last], frame);
    }

    fn deliver(&mut self, sender: ModuleId, dst: ModuleId, frame: Frame) {
        let ingress = match self.members.iter().find(|m| m.id == dst) {
            Some(member) => member.ingress.clone(),
            None => {
                warn!("switch: no ingress queue for {}", dst);
                self.stats.undeliverable += 1;
                self.bounce(sender, ErrorKind::QueueFull, dst.name().as_bytes().to_vec());
                return;
            }
        };
        let mut frame = frame;
        for attempt in 0.. {
            match ingress.try_enqueue(frame) {
                Ok(()) => {
                    self.stats.routed += 1;
                    return;
                }
                Err(EnqueueError::Closed(..)) => {
                    // The destination shut down; the frame is freed here.
                    self.stats.dropped += 1;
                    return;
                }
                Err(EnqueueError::Full(returned)) => {
                    if attempt >= DELIVERY_RETRIES {
                        trace!("switch: {} ingress full, bouncing to {}", dst, sender);
                        drop(returned);
                        self.bounce(sender, ErrorKind::QueueFull, dst.name().as_bytes().to_vec());
                        return;
                    }
                    frame = returned;
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }

    /// Tells `sender` that its frame could not be delivered. The error goes
    /// straight onto the sender's ingress queue; if even that is full the
    /// frame is freed and counted.
    fn bounce(&mut self, sender: ModuleId, kind: ErrorKind, detail: Vec<u8>) {
        let ingress = match self.members.iter().find(|m| m.id == sender) {
            Some(member) => member.ingress.clone(),
            None => {
                self.stats.dropped += 1;
                return;
            }
        };
        self.error_serial = self.error_serial.wrapping_add(1);
        let error = Frame::control(DestList::to(sender),
                                   CtrlFrame {
                                       sender: ModuleId::Switch,
                                       opcode: CtrlOpcode::Error,
                                       serial: self.error_serial,
                                       name: kind.wire_name().to_owned(),
                                       data: CtrlData::Error(ErrorReport {
                                           kind: kind,
                                           detail: detail,
                                       }),
                                   });
        match ingress.try_enqueue(error) {
            Ok(()) => self.stats.bounced += 1,
            Err(..) => self.stats.dropped += 1,
        }
    }
}
