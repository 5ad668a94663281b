use super::{with_chan, with_conn};
use crate::{ConsumerMessage, ConsumerOptions, Error, QueueDeclareOptions};

fn exclusive() -> QueueDeclareOptions {
    QueueDeclareOptions {
        exclusive: true,
        ..QueueDeclareOptions::default()
    }
}

#[test]
fn test_rpc_responses_arrive_in_issue_order() {
    with_chan(|chan| {
        let names: Vec<String> = (0..5)
            .map(|i| format!("coney-test-order-{}", i))
            .collect();
        for name in &names {
            // each declare-ok echoes the requested name; a misrouted or
            // reordered response would show up as a mismatch
            let queue = chan
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        exclusive: true,
                        ..QueueDeclareOptions::default()
                    },
                )
                .unwrap();
            assert_eq!(queue.name(), name);
        }
    })
}

#[test]
fn test_explicit_channel_ids() {
    with_conn(|conn| {
        let _ch5 = conn.open_channel(Some(5)).unwrap();
        match conn.open_channel(Some(5)) {
            Err(Error::UnavailableChannelId { channel_id }) => assert_eq!(channel_id, 5),
            Err(err) => panic!("unexpected error {}", err),
            Ok(_) => panic!("duplicate channel id accepted"),
        }

        // automatic allocation skips the taken id
        let auto = conn.open_channel(None).unwrap();
        assert_ne!(auto.channel_id(), 5);
    })
}

#[test]
fn test_client_cancel_ends_consumer() {
    with_chan(|chan| {
        let queue = chan.queue_declare("", exclusive()).unwrap();
        let consumer = queue.consume(ConsumerOptions::default()).unwrap();
        consumer.cancel().unwrap();

        match consumer.receiver().recv().unwrap() {
            ConsumerMessage::ClientCancelled => (),
            other => panic!("unexpected consumer message {:?}", other),
        }
        // after the terminal message the sending side is gone
        assert!(consumer.receiver().recv().is_err());
    })
}

#[test]
fn test_get_on_empty_queue_returns_none() {
    with_chan(|chan| {
        let queue = chan.queue_declare("", exclusive()).unwrap();
        assert!(queue.get(true).unwrap().is_none());
    })
}

#[test]
fn test_channel_close_is_idempotent_via_drop() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.close().unwrap();
        // dropping other channels after explicit close of the first must
        // not disturb the connection
        let chan2 = conn.open_channel(None).unwrap();
        drop(chan2);
    })
}

#[test]
fn test_qos_applies() {
    with_chan(|chan| {
        chan.qos(0, 10, false).unwrap();
    })
}
