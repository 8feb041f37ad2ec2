use crossbeam_channel as xch;
use std::sync::Arc;
use std::time::Duration;
use weigh_core::config::{BufferCfg, PublisherCfg};
use weigh_core::mocks::{MemoryBroker, wait_until};
use weigh_core::{AgentStatus, ControlMessage, Publisher};
use weigh_traits::BrokerMessage;

const WAIT: Duration = Duration::from_secs(3);

fn cfg(buffer: Option<BufferCfg>) -> PublisherCfg {
    PublisherCfg {
        machine_id: "m1".into(),
        buffer,
        reconnect_delay: Duration::from_millis(20),
        ..PublisherCfg::default()
    }
}

fn memory_buffer() -> Option<BufferCfg> {
    Some(BufferCfg {
        max_items: 100,
        dir: None,
    })
}

fn reading(i: usize) -> BrokerMessage {
    BrokerMessage::new("weigh/m1/reading", format!("{i}"), 0, false)
}

fn ignore() -> weigh_core::publisher::ControlCallback {
    Arc::new(|_| {})
}

#[test]
fn offline_publishes_are_delivered_in_order_after_connect() {
    let broker = MemoryBroker::offline();
    let mut p = Publisher::new(cfg(memory_buffer()), Box::new(broker.clone()), ignore());
    p.start().expect("start");
    for i in 0..5 {
        p.publish(reading(i));
    }
    assert!(wait_until(WAIT, || p.buffered_len() == 5));
    assert!(broker.published().is_empty());

    broker.set_online(true);
    assert!(wait_until(WAIT, || broker.published().len() >= 5));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(broker.payloads_on("weigh/m1/reading"), vec!["0", "1", "2", "3", "4"]);
    assert_eq!(p.buffered_len(), 0);
    p.stop();
}

#[test]
fn without_buffer_offline_publishes_are_dropped() {
    let broker = MemoryBroker::offline();
    let mut p = Publisher::new(cfg(None), Box::new(broker.clone()), ignore());
    p.start().expect("start");
    p.publish(reading(1));
    assert!(wait_until(WAIT, || p.pending_len() == 0));
    broker.set_online(true);
    assert!(wait_until(WAIT, || broker.connects() == 1));
    p.publish(reading(2));
    assert!(wait_until(WAIT, || !broker.published().is_empty()));
    assert_eq!(broker.payloads_on("weigh/m1/reading"), vec!["2"]);
}

#[test]
fn last_will_is_registered_on_every_connect() {
    let broker = MemoryBroker::new();
    let mut p = Publisher::new(cfg(memory_buffer()), Box::new(broker.clone()), ignore());
    p.start().expect("start");
    assert!(wait_until(WAIT, || broker.connects() == 1));
    broker.set_online(false);
    broker.set_online(true);
    // The dead session is only noticed on the next poll or publish.
    assert!(wait_until(WAIT, || broker.connects() == 2));
    let wills = broker.wills();
    assert_eq!(wills.len(), 2);
    for w in wills {
        assert_eq!(w.topic, "weigh/m1/status");
        assert_eq!(w.payload, b"OFFLINE".to_vec());
        assert_eq!(w.qos, 1);
    }
    assert_eq!(broker.subscriptions(), vec!["weigh/m1/print", "weigh/m1/print"]);
}

#[test]
fn status_uses_configured_policy_and_stop_disconnects_cleanly() {
    let broker = MemoryBroker::new();
    let mut p = Publisher::new(
        PublisherCfg {
            status_retain: true,
            ..cfg(None)
        },
        Box::new(broker.clone()),
        ignore(),
    );
    p.start().expect("start");
    p.start().expect("second start is a no-op");
    p.publish_status(AgentStatus::Online);
    assert!(wait_until(WAIT, || !broker.published().is_empty()));
    p.stop();
    p.stop();
    let status = &broker.published()[0];
    assert_eq!(status.topic, "weigh/m1/status");
    assert_eq!(status.payload, b"ONLINE".to_vec());
    assert!(status.retain);
    assert_eq!(broker.connects(), 1);
    assert_eq!(broker.clean_disconnects(), 1);
}

#[test]
fn inbound_print_commands_reach_the_callback() {
    let broker = MemoryBroker::new();
    let (tx, rx) = xch::unbounded();
    let mut p = Publisher::new(
        cfg(None),
        Box::new(broker.clone()),
        Arc::new(move |m: ControlMessage| {
            let _ = tx.send(m);
        }),
    );
    p.start().expect("start");
    assert!(wait_until(WAIT, || broker.connects() == 1));
    broker.inject(BrokerMessage::new(
        "weigh/m1/print",
        br#"{"secret":"k","pdfBase64":"JVBERg=="}"#.to_vec(),
        1,
        false,
    ));
    broker.inject(BrokerMessage::new("weigh/m1/print", b"{oops".to_vec(), 1, false));
    let first = rx.recv_timeout(WAIT).expect("print command");
    let ControlMessage::Print(cmd) = first else {
        panic!("expected print, got {first:?}");
    };
    assert_eq!(cmd.pdf_base64.as_deref(), Some("JVBERg=="));
    let second = rx.recv_timeout(WAIT).expect("raw fallback");
    assert!(matches!(second, ControlMessage::Unknown { ref payload, .. } if payload == b"{oops"));
}

#[test]
fn disk_buffer_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let buffer = Some(BufferCfg {
        max_items: 100,
        dir: Some(dir.path().to_path_buf()),
    });
    {
        let broker = MemoryBroker::offline();
        let mut p = Publisher::new(cfg(buffer.clone()), Box::new(broker), ignore());
        p.start().expect("start");
        for i in 0..3 {
            p.publish(reading(i));
        }
        assert!(wait_until(WAIT, || p.buffered_len() == 3));
        p.stop();
    }
    let broker = MemoryBroker::new();
    let mut p = Publisher::new(cfg(buffer), Box::new(broker.clone()), ignore());
    p.start().expect("restart");
    assert!(wait_until(WAIT, || broker.published().len() == 3));
    assert_eq!(broker.payloads_on("weigh/m1/reading"), vec!["0", "1", "2"]);
    p.stop();
    let file = std::fs::read_to_string(dir.path().join(weigh_core::buffer::BUFFER_FILE)).expect("file");
    assert!(file.is_empty());
}

#[test]
fn unconfirmed_publishes_are_redelivered_after_reconnect() {
    let broker = MemoryBroker::new();
    broker.set_unresponsive(true);
    let mut p = Publisher::new(cfg(memory_buffer()), Box::new(broker.clone()), ignore());
    p.start().expect("start");
    for i in 0..3 {
        p.publish(reading(i));
    }
    assert!(wait_until(WAIT, || broker.swallowed() == 3));
    assert!(broker.published().is_empty());

    broker.set_unresponsive(false);
    broker.set_online(false);
    assert!(wait_until(WAIT, || p.buffered_len() == 3));
    p.publish(reading(3));
    assert!(wait_until(WAIT, || p.buffered_len() == 4));

    broker.set_online(true);
    assert!(wait_until(WAIT, || broker.published().len() >= 4));
    assert_eq!(broker.payloads_on("weigh/m1/reading"), vec!["0", "1", "2", "3"]);
    assert_eq!(broker.connects(), 2);
    p.stop();
}

#[test]
fn unconfirmed_publishes_are_kept_across_stop() {
    let broker = MemoryBroker::new();
    broker.set_unresponsive(true);
    let mut p = Publisher::new(cfg(memory_buffer()), Box::new(broker.clone()), ignore());
    p.start().expect("start");
    p.publish(reading(7));
    assert!(wait_until(WAIT, || broker.swallowed() == 1));
    p.stop();
    assert_eq!(p.buffered_len(), 1);

    broker.set_unresponsive(false);
    p.start().expect("restart");
    assert!(wait_until(WAIT, || !broker.published().is_empty()));
    assert_eq!(broker.payloads_on("weigh/m1/reading"), vec!["7"]);
    p.stop();
}
