use super::{with_chan, with_conn};
use crate::{
    AmqpProperties, AmqpReplyCode, AmqpValue, ConsumerMessage, ConsumerOptions, Error,
    ExchangeDeclareOptions, ExchangeType, FieldTable, Publish, QueueDeclareOptions,
};

fn exclusive() -> QueueDeclareOptions {
    QueueDeclareOptions {
        exclusive: true,
        ..QueueDeclareOptions::default()
    }
}

#[test]
fn test_publish_empty() {
    with_chan(|chan| {
        for _ in 0..2 {
            chan.basic_publish("", Publish::new(&[], "does.not.exist"))
                .unwrap();
        }
    })
}

#[test]
fn test_publish_confirm_happy_path() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.enable_publisher_confirms().unwrap();

        let exchange = chan
            .exchange_declare(
                ExchangeType::Direct,
                "coney-test-confirm",
                ExchangeDeclareOptions {
                    auto_delete: true,
                    ..ExchangeDeclareOptions::default()
                },
            )
            .unwrap();
        let queue = chan.queue_declare("", exclusive()).unwrap();
        queue.bind(&exchange, "k", FieldTable::new()).unwrap();

        assert!(exchange.publish(Publish::new(b"hello", "k")).unwrap());

        let consumer = queue.consume(ConsumerOptions::default()).unwrap();
        match consumer.receiver().recv().unwrap() {
            ConsumerMessage::Delivery(delivery) => {
                assert_eq!(delivery.content, b"hello");
                consumer.ack(&delivery).unwrap();
            }
            other => panic!("unexpected consumer message {:?}", other),
        }
    })
}

#[test]
fn test_mandatory_publish_with_no_route() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.enable_publisher_confirms().unwrap();

        let publish = Publish {
            mandatory: true,
            ..Publish::new(b"nobody home", "coney-test-no-such-binding")
        };
        match chan.basic_publish("amq.direct", publish).unwrap_err() {
            Error::MessageReturned {
                reply_code,
                routing_key,
                ..
            } => {
                assert_eq!(reply_code, AmqpReplyCode::NoRoute.code());
                assert_eq!(routing_key, "coney-test-no-such-binding");
            }
            err => panic!("unexpected error {}", err),
        }

        // a returned publish does not kill the channel
        assert!(chan
            .basic_publish("amq.direct", Publish::new(&[], "k"))
            .unwrap());
    })
}

#[test]
fn test_properties_round_trip() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.enable_publisher_confirms().unwrap();
        let queue = chan.queue_declare("", exclusive()).unwrap();

        let mut headers = FieldTable::new();
        headers.insert("retries".to_string(), AmqpValue::LongInt(3));
        let properties = AmqpProperties::default()
            .with_content_type("application/json".to_string())
            .with_delivery_mode(2)
            .with_priority(5)
            .with_correlation_id("corr-17".to_string())
            .with_message_id("msg-17".to_string())
            .with_headers(headers);

        let body = br#"{"seq":17}"#;
        assert!(chan
            .basic_publish(
                "",
                Publish::with_properties(body, queue.name(), properties.clone())
            )
            .unwrap());

        let get = queue.get(false).unwrap().expect("message available");
        assert_eq!(get.delivery.content, body);
        assert_eq!(get.delivery.properties, properties);
        get.ack(&chan).unwrap();
    })
}

#[test]
fn test_transactional_rollback_and_commit() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        let queue = chan.queue_declare("", exclusive()).unwrap();

        let tx = chan.tx().unwrap();
        chan.basic_publish("", Publish::new(b"doomed", queue.name()))
            .unwrap();
        tx.rollback().unwrap();
        assert_eq!(queue.message_count().unwrap(), 0);

        let tx = chan.tx().unwrap();
        chan.basic_publish("", Publish::new(b"kept", queue.name()))
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(queue.message_count().unwrap(), 1);
    })
}

#[test]
fn test_dropped_transaction_rolls_back() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        let queue = chan.queue_declare("", exclusive()).unwrap();

        {
            let _tx = chan.tx().unwrap();
            chan.basic_publish("", Publish::new(b"doomed", queue.name()))
                .unwrap();
            // guard dropped unresolved
        }
        assert_eq!(queue.message_count().unwrap(), 0);
    })
}

#[test]
fn test_confirms_and_transactions_are_exclusive() {
    with_chan(|chan| {
        chan.enable_publisher_confirms().unwrap();
        match chan.tx() {
            Err(Error::ConfirmsAndTransactionsExclusive { channel_id }) => {
                assert_eq!(channel_id, chan.channel_id());
            }
            Err(err) => panic!("unexpected error {}", err),
            Ok(_) => panic!("tx.select succeeded with confirms enabled"),
        }
    })
}
