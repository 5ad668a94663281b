use super::{with_chan, with_conn};
use crate::{
    ConsumerMessage, ConsumerOptions, ExchangeDeclareOptions, ExchangeType, FieldTable, Publish,
    QueueDeclareOptions,
};

fn auto_delete() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        auto_delete: true,
        ..ExchangeDeclareOptions::default()
    }
}

#[test]
fn test_declare_and_publish() {
    with_chan(|chan| {
        let exchange = chan
            .exchange_declare(ExchangeType::Direct, "coney-test-declare", auto_delete())
            .unwrap();
        exchange.publish(Publish::new(&[], "does.not.exist")).unwrap();

        let passive = chan.exchange_declare_passive("coney-test-declare").unwrap();
        assert_eq!(passive.name(), exchange.name());
    })
}

#[test]
fn test_exchange_to_exchange_binding() {
    with_conn(|conn| {
        let chan = conn.open_channel(None).unwrap();
        chan.enable_publisher_confirms().unwrap();

        let source = chan
            .exchange_declare(ExchangeType::Fanout, "coney-test-e2e-source", auto_delete())
            .unwrap();
        let destination = chan
            .exchange_declare(ExchangeType::Fanout, "coney-test-e2e-dest", auto_delete())
            .unwrap();
        destination
            .bind_to_source(&source, "", FieldTable::new())
            .unwrap();

        let queue = chan
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    ..QueueDeclareOptions::default()
                },
            )
            .unwrap();
        queue.bind(&destination, "", FieldTable::new()).unwrap();

        // a publish to the source must flow through the e2e binding
        assert!(source.publish(Publish::new(b"routed", "")).unwrap());

        let consumer = queue.consume(ConsumerOptions::default()).unwrap();
        match consumer.receiver().recv().unwrap() {
            ConsumerMessage::Delivery(delivery) => {
                assert_eq!(delivery.content, b"routed");
                consumer.ack(&delivery).unwrap();
            }
            other => panic!("unexpected consumer message {:?}", other),
        }

        destination
            .unbind_from_source(&source, "", FieldTable::new())
            .unwrap();
    })
}
