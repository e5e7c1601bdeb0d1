extern crate netfabric;

use netfabric::fabric::Fabric;
use netfabric::frame::{CtrlData, CtrlOpcode, DestList, Direction, ErrorKind, Frame, FrameBody,
                       ModuleId};
use netfabric::metadata::Metadata;
use netfabric::switch::Switch;
use netfabric::testing;

use std::time::Duration;

fn frame_to(dst: ModuleId, tag: u8) -> Frame {
    Frame::data(DestList::to(dst), Direction::Up, vec![tag], Metadata::new())
}

/// Flooding a module whose ingress is bounded to 8 must, after the switch
/// retry budget, bounce a `queue_full` control error to the sender without
/// losing track of any frame.
#[test]
fn flooded_ingress_bounces_error_to_sender() {
    let mut fabric = Fabric::new(64);
    let sender = fabric.register(ModuleId::Udp);
    // The victim has a bounded ingress and nothing draining it.
    let victim = fabric.register_with_capacity(ModuleId::Icmp, 8);
    let switch = Switch::new(&fabric).spawn();

    for tag in 0..12u8 {
        sender.egress.enqueue(frame_to(ModuleId::Icmp, tag)).unwrap();
    }

    // The victim's queue fills with the first 8 frames; each later frame
    // comes back as a CTRL_ERROR after the retry budget.
    let mut bounced = 0;
    for _ in 0..4 {
        let error = sender.ingress
            .dequeue_timeout(Duration::from_secs(10))
            .expect("expected a bounced control error");
        match error.body {
            FrameBody::Control(ctrl) => {
                assert_eq!(ctrl.sender, ModuleId::Switch);
                assert_eq!(ctrl.opcode, CtrlOpcode::Error);
                assert_eq!(ctrl.name, "queue_full");
                match ctrl.data {
                    CtrlData::Error(report) => assert_eq!(report.kind, ErrorKind::QueueFull),
                    other => panic!("unexpected control data {:?}", other),
                }
                bounced += 1;
            }
            FrameBody::Data(..) => panic!("expected a control frame"),
        }
    }
    assert_eq!(bounced, 4);
    assert_eq!(victim.ingress.len(), 8);
    // All 8 delivered frames are intact and in order.
    for tag in 0..8u8 {
        let frame = victim.ingress.try_dequeue().unwrap();
        assert_eq!(frame.as_data().unwrap().pdu, vec![tag]);
    }

    fabric.shutdown();
    switch.join().unwrap();
}

/// A capture stream failure must shut the whole stack down through the
/// fatal-alert path (ethernet → runtime manager → shutdown latch).
#[test]
fn capture_eof_triggers_stack_shutdown() {
    let mut stack = testing::dummy_stack();
    let signal = stack.stack.shutdown_signal();
    assert!(!signal.is_requested());

    stack.close_capture();
    assert!(signal.wait_timeout(Duration::from_secs(5)),
            "expected the fatal alert to pull the shutdown latch");

    stack.shutdown();
}
