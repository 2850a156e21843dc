mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sourced_outbox::bus::InMemoryBroker;
use sourced_outbox::{
    Collector, ConsumeOutcome, Consumer, ConsumerPipeline, ConsumerThread, Dispatcher,
    DispatcherThread, IntegrationEvent, MemoryStore, MessageStatus, Monitor, OutboxConfig,
    Publisher, Store, TransactionCoordinator,
};
use support::orders::{counter, place_order, shipping_handlers, OrderCreated, Shipment, SHIPMENTS};

#[test]
fn order_created_reaches_shipping_once() {
    support::init_tracing();
    let orders_db = Arc::new(MemoryStore::new());
    let shipping_db = Arc::new(MemoryStore::new());
    let broker = InMemoryBroker::new();
    let subscription = broker.subscribe(&[OrderCreated::NAME]);

    // order service: business row and outbox row in one commit
    let coordinator = TransactionCoordinator::new(orders_db.clone());
    place_order(&coordinator, "o-1", "alice", 4200).unwrap();
    let pending = orders_db
        .query_outbox(&sourced_outbox::MessageQuery::status(MessageStatus::Scheduled))
        .unwrap();
    assert_eq!(pending.len(), 1);
    let outbox_id = pending[0].id;

    // dispatcher publishes it
    let mut dispatcher =
        Dispatcher::new(orders_db.clone(), broker.clone()).with_worker_id("orders-1");
    let report = dispatcher.run_cycle().unwrap();
    assert_eq!(report.published, 1);
    assert!(orders_db.get_outbox(outbox_id).unwrap().unwrap().is_succeeded());

    let published = broker.find_all_by_name(OrderCreated::NAME);
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].id, outbox_id.to_string());
    assert_eq!(published[0].header("correlation_id"), Some("place-o-1"));
    let event: OrderCreated = published[0].decode().unwrap();
    assert_eq!(event.total_cents, 4200);

    // the broker hands the same message out twice
    broker.publish(published[0].clone()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let pipeline = ConsumerPipeline::new(shipping_db.clone(), shipping_handlers(calls.clone()));
    let mut consumer = Consumer::new(pipeline).with_poll_timeout(Duration::from_millis(50));

    assert_eq!(
        consumer.poll_once(&subscription).unwrap(),
        Some(ConsumeOutcome::Processed)
    );
    assert_eq!(
        consumer.poll_once(&subscription).unwrap(),
        Some(ConsumeOutcome::Duplicate)
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(counter(&shipping_db, "shipments"), 1);
    let shipment: Shipment = shipping_db.row(SHIPMENTS, "o-1").unwrap().unwrap();
    assert_eq!(shipment.customer, "alice");

    let inbox = shipping_db
        .get_inbox(&outbox_id.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(inbox.status, MessageStatus::Succeeded);
    assert_eq!(subscription.acknowledged().len(), 2);
}

#[test]
fn background_workers_from_config() {
    support::init_tracing();
    let config = OutboxConfig::from_json(
        r#"{
            "dispatcher": { "worker_id": "orders-bg", "batch_size": 4, "poll_interval_ms": 5 },
            "consumer": { "poll_timeout_ms": 10 },
            "retry": { "max_retries": 5, "base_delay_ms": 1, "max_delay_ms": 20 },
            "retention": { "succeeded_outbox_ms": 0, "collect_batch": 3 }
        }"#,
    )
    .unwrap();

    let orders_db = Arc::new(MemoryStore::new());
    let shipping_db = Arc::new(MemoryStore::new());
    let broker = InMemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let dispatcher = DispatcherThread::spawn(
        Dispatcher::from_config(orders_db.clone(), broker.clone(), &config),
        config.dispatcher.poll_interval(),
    )
    .unwrap();
    let pipeline =
        ConsumerPipeline::from_config(shipping_db.clone(), shipping_handlers(calls.clone()), &config);
    let consumer = ConsumerThread::spawn(
        "shipping",
        Consumer::from_config(pipeline, &config),
        broker.subscribe(&[OrderCreated::NAME]),
    )
    .unwrap();

    let coordinator = TransactionCoordinator::new(orders_db.clone());
    for i in 0..10 {
        place_order(&coordinator, &format!("o-{}", i), "bob", 100 + i).unwrap();
    }

    assert!(support::wait_until(Duration::from_secs(10), || {
        counter(&shipping_db, "shipments") == 10
    }));

    let dispatched = dispatcher.stop();
    let consumed = consumer.stop();
    assert_eq!(dispatched.published, 10);
    assert_eq!(consumed.processed, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 10);

    let monitor = Monitor::from_config(orders_db.clone(), &config);
    assert_eq!(monitor.statistics().unwrap().outbox.succeeded, 10);
    assert!(monitor.exhausted_outbox().unwrap().is_empty());

    // zero retention: every published row is immediately collectable
    let collected = Collector::from_config(orders_db.clone(), &config)
        .collect()
        .unwrap();
    assert_eq!(collected.outbox, 10);
    assert_eq!(orders_db.outbox_len().unwrap(), 0);
    assert_eq!(orders_db.table_len("orders").unwrap(), 10);
}

#[cfg(feature = "emitter")]
#[test]
fn dispatch_to_in_process_listeners() {
    use sourced_outbox::bus::EmitterPublisher;
    use std::sync::mpsc;
    use std::sync::Mutex;

    let orders_db = Arc::new(MemoryStore::new());
    let publisher = Arc::new(EmitterPublisher::default());
    let (tx, rx) = mpsc::channel::<String>();
    let tx = Mutex::new(tx);
    publisher
        .on(OrderCreated::NAME, move |payload| {
            let _ = tx.lock().unwrap().send(payload);
        })
        .unwrap();

    let coordinator = TransactionCoordinator::new(orders_db.clone());
    place_order(&coordinator, "o-9", "carol", 999).unwrap();

    let mut dispatcher = Dispatcher::new(orders_db.clone(), publisher.clone());
    assert_eq!(dispatcher.run_cycle().unwrap().published, 1);

    let payload = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    let event: OrderCreated = serde_json::from_str(&payload).unwrap();
    assert_eq!(event.order_id, "o-9");
}
