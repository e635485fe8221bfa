//! Card-inserted workflow tests.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use cardgate_events::{message_types, Event, EventDispatcher, GatewayFault};
use common::{card_inserted, RecordingRelay, ScriptedGateway};

fn dispatcher(gateway: ScriptedGateway) -> (EventDispatcher, Arc<RecordingRelay>, Arc<ScriptedGateway>) {
    let gateway = Arc::new(gateway);
    let relay = Arc::new(RecordingRelay::default());
    let dispatcher = EventDispatcher::new(gateway.clone(), relay.clone(), None);
    (dispatcher, relay, gateway)
}

#[tokio::test]
async fn test_success_relays_tokens_bundles_and_sensor_data() {
    let (dispatcher, relay, _gateway) = dispatcher(ScriptedGateway::succeeding());

    dispatcher.dispatch(card_inserted("3", "CtIDValue")).await;

    let envelopes = relay.envelopes();
    let kinds = envelopes.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>();
    assert_eq!(
        kinds,
        vec![
            message_types::TOKENS,
            message_types::BUNDLES,
            message_types::SENSOR_DATA
        ]
    );

    let tokens = &envelopes[0].1;
    assert_eq!(tokens["tokens"].as_array().unwrap().len(), 1);
    assert_eq!(tokens["slotId"], "3");
    assert_eq!(tokens["ctId"], "CtIDValue");
    assert_eq!(tokens["correlationId"], envelopes[1].1["correlationId"]);

    let bundles = &envelopes[1].1;
    assert_eq!(bundles["bundles"][0]["resourceType"], "Bundle");

    let sensor = &envelopes[2].1;
    assert_eq!(sensor["slotId"], "3");
    assert_eq!(sensor["ctId"], "CtIDValue");
    assert!(sensor["endTime"].as_i64().unwrap() > 0);
    assert_eq!(sensor["eventId"], "2");
    assert!(sensor.get("err").is_none());
}

#[tokio::test]
async fn test_read_fault_relays_only_sensor_data_with_code() {
    let (dispatcher, relay, gateway) =
        dispatcher(ScriptedGateway::failing_read(GatewayFault::new("Fault").with_code(10)));

    dispatcher.dispatch(card_inserted("3", "CtIDValue")).await;

    let envelopes = relay.envelopes();
    assert_eq!(envelopes.len(), 1);
    let (kind, sensor) = &envelopes[0];
    assert_eq!(kind, message_types::SENSOR_DATA);
    assert_eq!(sensor["slotId"], "3");
    assert_eq!(sensor["ctId"], "CtIDValue");
    assert!(sensor.get("endTime").is_some());
    assert_eq!(sensor["err"], "10");
    assert!(sensor.get("eventId").is_none());
    assert_eq!(gateway.fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_fetch_fault_relays_only_sensor_data() {
    let (dispatcher, relay, _gateway) =
        dispatcher(ScriptedGateway::failing_fetch(GatewayFault::new("Fault").with_code(4203)));

    dispatcher.dispatch(card_inserted("1", "CT9")).await;

    let envelopes = relay.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].1["err"], "4203");
}

#[tokio::test]
async fn test_other_topics_are_ignored() {
    let (dispatcher, relay, gateway) = dispatcher(ScriptedGateway::succeeding());

    dispatcher
        .dispatch(Event::new("CARD/REMOVED").with_param("SlotID", "3"))
        .await;

    assert!(relay.messages().is_empty());
    assert_eq!(gateway.reads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_parameters_are_not_fatal() {
    let (dispatcher, relay, _gateway) = dispatcher(ScriptedGateway::succeeding());

    dispatcher.dispatch(Event::new(cardgate_events::CARD_INSERTED)).await;

    let envelopes = relay.envelopes();
    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[2].1["slotId"], "");
}

#[tokio::test]
async fn test_workers_drain_queue() {
    let gateway = Arc::new(ScriptedGateway::succeeding());
    let relay = Arc::new(RecordingRelay::default());
    let dispatcher = Arc::new(EventDispatcher::new(gateway, relay.clone(), None));

    let (tx, rx) = async_channel::bounded(4);
    let workers = dispatcher.spawn_workers(rx, 2);
    tx.send(card_inserted("1", "CT1")).await.unwrap();
    tx.send(card_inserted("2", "CT1")).await.unwrap();
    tx.close();

    for worker in workers {
        worker.await.unwrap();
    }
    assert_eq!(relay.messages().len(), 6);
}
