use super::{with_chan, with_conn};
use crate::{
    AmqpReplyCode, ConsumerMessage, ConsumerOptions, Error, Publish, QueueDeclareOptions,
    QueueDeleteOptions,
};

fn exclusive() -> QueueDeclareOptions {
    QueueDeclareOptions {
        exclusive: true,
        ..QueueDeclareOptions::default()
    }
}

#[test]
fn test_declare_returns_server_assigned_name() {
    with_chan(|chan| {
        let queue = chan.queue_declare("", exclusive()).unwrap();
        assert!(!queue.name().is_empty());
        assert_eq!(queue.declared_message_count(), Some(0));
        assert_eq!(queue.declared_consumer_count(), Some(0));
    })
}

#[test]
fn test_redeclare_with_different_durability() {
    with_conn(|conn| {
        let name = "coney-test-redeclare";
        let chan = conn.open_channel(None).unwrap();
        chan.queue_declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
        )
        .unwrap();

        // redeclaring with mismatched parameters is a precondition failure
        // that closes the channel
        match chan
            .queue_declare(name, QueueDeclareOptions::default())
            .err()
            .unwrap()
        {
            Error::ServerClosedChannel { code, .. } => {
                assert_eq!(code, AmqpReplyCode::PreconditionFailed);
            }
            err => panic!("unexpected error {}", err),
        }

        // the dead channel keeps failing with its close reason
        match chan.basic_get(name, true).unwrap_err() {
            Error::ServerClosedChannel { code, .. } => {
                assert_eq!(code, AmqpReplyCode::PreconditionFailed);
            }
            err => panic!("unexpected error {}", err),
        }

        // but the connection is fine and a fresh channel works
        let chan2 = conn.open_channel(None).unwrap();
        let queue = chan2.queue_declare_passive(name).unwrap();
        queue.delete(QueueDeleteOptions::default()).unwrap();
    })
}

#[test]
fn test_get_loop_in_publish_order() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        // confirms make the published messages visible to the counts below
        chan.enable_publisher_confirms().unwrap();
        let queue = chan.queue_declare("", exclusive()).unwrap();

        for i in 0..3 {
            let body = format!("msg{}", i);
            assert!(chan
                .basic_publish("", Publish::new(body.as_bytes(), queue.name()))
                .unwrap());
        }
        assert_eq!(queue.message_count().unwrap(), 3);

        for i in 0..3 {
            let get = queue.get(false).unwrap().expect("message available");
            assert_eq!(get.delivery.content, format!("msg{}", i).into_bytes());
            assert!(!get.delivery.redelivered);
            get.ack(&chan).unwrap();
        }
        assert!(queue.get(false).unwrap().is_none());
    })
}

#[test]
fn test_purge() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.enable_publisher_confirms().unwrap();
        let queue = chan.queue_declare("", exclusive()).unwrap();

        for _ in 0..2 {
            assert!(chan
                .basic_publish("", Publish::new(b"bye", queue.name()))
                .unwrap());
        }
        assert_eq!(queue.purge().unwrap(), 2);
        assert_eq!(queue.message_count().unwrap(), 0);
    })
}

#[test]
fn test_server_cancel_ends_consumer_cleanly() {
    with_conn(|conn| {
        let name = "coney-test-server-cancel";
        let chan = conn.open_channel(None).unwrap();
        chan.queue_declare(name, QueueDeclareOptions::default())
            .unwrap();
        let consumer = chan
            .basic_consume(name, ConsumerOptions::default())
            .unwrap();

        // deleting the queue from another channel makes the server cancel
        // the consumer
        let chan2 = conn.open_channel(None).unwrap();
        chan2
            .queue_declare_passive(name)
            .unwrap()
            .delete(QueueDeleteOptions::default())
            .unwrap();

        match consumer.receiver().recv().unwrap() {
            ConsumerMessage::ServerCancelled => (),
            other => panic!("unexpected consumer message {:?}", other),
        }

        // the consumer's channel is still open
        chan.queue_declare("", exclusive()).unwrap();
    })
}
