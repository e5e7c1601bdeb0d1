//! The queue fabric: per-module queue pairs and the module run loop.
//!
//! A protocol module is a `FrameHandler` registered with the `Fabric`. The
//! fabric allocates the module's ingress/egress queue pair, spawns one
//! thread per handler and owns the dequeue-dispatch loop, so a module can
//! never leak a frame on an unhandled branch: every frame popped from the
//! ingress queue is moved into `handle` by value, and everything a module
//! emits goes out through its own egress queue via the `ModuleContext`.

use frame::{CtrlData, CtrlFrame, CtrlOpcode, DestList, ErrorKind, ErrorReport, Frame, ModuleId};
use queue::{FrameQueue, Notifier, QueueError};

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a module loop waits on its ingress queue before giving the
/// handler a `tick`.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// The queue pair of one module.
#[derive(Clone)]
pub struct Endpoint {
    pub id: ModuleId,
    /// switch → module.
    pub ingress: FrameQueue,
    /// module → switch.
    pub egress: FrameQueue,
}

/// Handed to a module's handler; the only way a module reaches the fabric.
pub struct ModuleContext {
    id: ModuleId,
    egress: FrameQueue,
    serials: HashMap<CtrlOpcode, u32>,
}

impl ModuleContext {
    pub fn new(id: ModuleId, egress: FrameQueue) -> ModuleContext {
        ModuleContext {
            id: id,
            egress: egress,
            serials: HashMap::new(),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Hands `frame` to the switch. Relinquishes ownership; blocks while the
    /// egress queue is at capacity.
    pub fn send(&self, frame: Frame) -> Result<(), QueueError> {
        self.egress.enqueue(frame).map_err(|e| e.error())
    }

    /// Next serial number for control frames of `opcode` from this module.
    pub fn next_serial(&mut self, opcode: CtrlOpcode) -> u32 {
        let serial = self.serials.entry(opcode).or_insert(0);
        *serial = serial.wrapping_add(1);
        *serial
    }

    /// Builds a control frame stamped with this module's id and the next
    /// serial for `opcode`.
    pub fn control(&mut self,
                   dst: DestList,
                   opcode: CtrlOpcode,
                   name: &str,
                   data: CtrlData)
                   -> Frame {
        let serial = self.next_serial(opcode);
        Frame::control(dst,
                       CtrlFrame {
                           sender: self.id,
                           opcode: opcode,
                           serial: serial,
                           name: name.to_owned(),
                           data: data,
                       })
    }

    /// Emits a `CTRL_ERROR` of `kind` to `to`.
    pub fn send_error(&mut self,
                      to: ModuleId,
                      kind: ErrorKind,
                      detail: Vec<u8>)
                      -> Result<(), QueueError> {
        let frame = self.control(DestList::to(to),
                                 CtrlOpcode::Error,
                                 kind.wire_name(),
                                 CtrlData::Error(ErrorReport {
                                     kind: kind,
                                     detail: detail,
                                 }));
        self.send(frame)
    }

    /// Emits a `CTRL_EXEC` request to `to`.
    pub fn send_exec(&mut self,
                     to: ModuleId,
                     name: &str,
                     data: CtrlData)
                     -> Result<(), QueueError> {
        let frame = self.control(DestList::to(to), CtrlOpcode::Exec, name, data);
        self.send(frame)
    }

    /// Emits a `CTRL_ALERT` to `to`.
    pub fn send_alert(&mut self, to: ModuleId, name: &str) -> Result<(), QueueError> {
        let frame = self.control(DestList::to(to), CtrlOpcode::Alert, name, CtrlData::None);
        self.send(frame)
    }
}

/// A protocol module's message handler. The fabric owns the loop; the
/// handler only sees one frame at a time.
pub trait FrameHandler: Send {
    /// Called with every frame addressed to this module. The frame is owned
    /// by the handler from here on.
    fn handle(&mut self, frame: Frame, ctx: &mut ModuleContext);

    /// Called when the ingress queue stayed empty for one tick interval.
    /// Used for housekeeping such as the IPv4 reassembly reaper.
    fn tick(&mut self, _ctx: &mut ModuleContext) {}

    /// Called once when the module loop stops.
    fn stopped(&mut self, _ctx: &mut ModuleContext) {}
}

/// Allocates queue pairs and runs module threads.
pub struct Fabric {
    queue_capacity: usize,
    notifier: Arc<Notifier>,
    endpoints: Vec<Endpoint>,
    threads: Vec<JoinHandle<()>>,
}

impl Fabric {
    pub fn new(queue_capacity: usize) -> Fabric {
        Fabric {
            queue_capacity: queue_capacity,
            notifier: Notifier::new(),
            endpoints: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// The notifier shared by every egress queue; the switch sleeps on it.
    pub fn notifier(&self) -> Arc<Notifier> {
        self.notifier.clone()
    }

    /// Creates the queue pair for `id`. The egress queue reports into the
    /// switch notifier. Queue names follow the `<module>2switch` /
    /// `switch2<module>` convention for diagnostics.
    pub fn register(&mut self, id: ModuleId) -> Endpoint {
        self.register_with_capacity(id, self.queue_capacity)
    }

    pub fn register_with_capacity(&mut self, id: ModuleId, capacity: usize) -> Endpoint {
        assert!(self.endpoint(id).is_none(), "module {} registered twice", id);
        let ingress = FrameQueue::new(&format!("switch2{}", id.name()), capacity);
        let egress = FrameQueue::with_notifier(&format!("{}2switch", id.name()),
                                               capacity,
                                               self.notifier.clone());
        let endpoint = Endpoint {
            id: id,
            ingress: ingress,
            egress: egress,
        };
        self.endpoints.push(endpoint.clone());
        endpoint
    }

    pub fn endpoint(&self, id: ModuleId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|ep| ep.id == id)
    }

    /// All registered endpoints in registration (switch service) order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints[..]
    }

    /// Spawns the dequeue-dispatch loop of `handler` on its own thread.
    /// `register` must have been called for `id` first.
    pub fn spawn<H>(&mut self, id: ModuleId, handler: H)
        where H: FrameHandler + 'static
    {
        let endpoint = self.endpoint(id)
            .unwrap_or_else(|| panic!("module {} not registered", id))
            .clone();
        let ctx = ModuleContext::new(id, endpoint.egress.clone());
        let thread = thread::Builder::new()
            .name(format!("netfabric-{}", id.name()))
            .spawn(move || run_module(handler, ctx, endpoint.ingress))
            .expect("failed to spawn module thread");
        self.threads.push(thread);
    }

    /// Keeps track of a thread that is part of the fabric but not a frame
    /// handler loop (the switch, the capture reader, the socket server).
    pub fn adopt(&mut self, thread: JoinHandle<()>) {
        self.threads.push(thread);
    }

    /// Closes every queue. Blocked operations wake with `Closed`; module
    /// loops drain and exit.
    pub fn shutdown(&self) {
        for endpoint in &self.endpoints {
            endpoint.ingress.close();
            endpoint.egress.close();
        }
        self.notifier.notify();
    }

    /// Joins every spawned thread. Call after `shutdown`.
    pub fn join(&mut self) {
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("a fabric thread panicked");
            }
        }
    }
}

fn run_module<H: FrameHandler>(mut handler: H, mut ctx: ModuleContext, ingress: FrameQueue) {
    debug!("{} module running", ctx.id());
    loop {
        match ingress.dequeue_timeout(TICK_INTERVAL) {
            Ok(frame) => handler.handle(frame, &mut ctx),
            Err(QueueError::Empty) => handler.tick(&mut ctx),
            Err(..) => break,
        }
    }
    handler.stopped(&mut ctx);
    debug!("{} module quitting", ctx.id());
}
