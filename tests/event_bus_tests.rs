use parley::event::{Event, EventBus, EventType};
use serde_json::json;
use std::time::Duration;
use tokio_stream::StreamExt;

fn event(event_type: EventType, negotiation_id: &str, n: usize) -> Event {
    Event::now(event_type, negotiation_id, json!({ "n": n }))
}

#[tokio::test]
async fn subscribers_receive_events_in_publish_order() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe("neg-1").await;

    for n in 0..5 {
        bus.publish(event(EventType::CenterToolCall, "neg-1", n)).await;
    }
    bus.complete("neg-1").await;

    let mut seen = Vec::new();
    while let Some(e) = rx.recv().await {
        seen.push(e.data["n"].as_u64().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn events_are_scoped_to_their_negotiation() {
    let bus = EventBus::default();
    let mut rx_a = bus.subscribe("neg-a").await;
    let mut rx_b = bus.subscribe("neg-b").await;

    bus.publish(event(EventType::FormulationReady, "neg-a", 1)).await;
    bus.publish(event(EventType::FormulationReady, "neg-b", 2)).await;
    bus.complete("neg-a").await;
    bus.complete("neg-b").await;

    let a = rx_a.recv().await.unwrap();
    assert_eq!(a.negotiation_id, "neg-a");
    assert!(rx_a.recv().await.is_none());

    let b = rx_b.recv().await.unwrap();
    assert_eq!(b.negotiation_id, "neg-b");
    assert!(rx_b.recv().await.is_none());
}

#[tokio::test]
async fn mid_session_joiners_see_only_subsequent_events() {
    let bus = EventBus::default();
    let mut early = bus.subscribe("neg-1").await;

    bus.publish(event(EventType::FormulationReady, "neg-1", 0)).await;
    let mut late = bus.subscribe("neg-1").await;
    bus.publish(event(EventType::PlanReady, "neg-1", 1)).await;
    bus.complete("neg-1").await;

    let mut early_types = Vec::new();
    while let Some(e) = early.recv().await {
        early_types.push(e.event_type);
    }
    assert_eq!(
        early_types,
        vec![EventType::FormulationReady, EventType::PlanReady]
    );

    let late_event = late.recv().await.unwrap();
    assert_eq!(late_event.event_type, EventType::PlanReady);
    assert!(late.recv().await.is_none());
}

#[tokio::test]
async fn a_stuck_subscriber_is_evicted_and_reported() {
    // Capacity 1 and a short publish timeout: the second undrained publish
    // must evict rather than block the publisher.
    let bus = EventBus::new(1, Duration::from_millis(20));
    let rx = bus.subscribe("neg-1").await;

    let first = bus.publish(event(EventType::OfferReceived, "neg-1", 0)).await;
    assert_eq!(first.delivered, 1);
    assert!(first.evicted.is_empty());

    let second = bus.publish(event(EventType::OfferReceived, "neg-1", 1)).await;
    assert_eq!(second.delivered, 0);
    assert_eq!(second.evicted.len(), 1);

    // Publication continues for the remaining (now zero) subscribers.
    let third = bus.publish(event(EventType::OfferReceived, "neg-1", 2)).await;
    assert_eq!(third.delivered, 0);
    assert!(third.evicted.is_empty());

    drop(rx);
}

#[tokio::test]
async fn a_dropped_receiver_is_evicted_on_next_publish() {
    let bus = EventBus::default();
    let rx = bus.subscribe("neg-1").await;
    drop(rx);

    let report = bus.publish(event(EventType::PlanReady, "neg-1", 0)).await;
    assert_eq!(report.delivered, 0);
    assert_eq!(report.evicted.len(), 1);
}

#[tokio::test]
async fn complete_ends_the_stream_for_all_subscribers() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe("neg-1").await;

    bus.publish(event(EventType::NegotiationCompleted, "neg-1", 0)).await;
    bus.complete("neg-1").await;

    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_none());

    // Publishing after completion reaches nobody.
    let report = bus.publish(event(EventType::PlanReady, "neg-1", 1)).await;
    assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn subscribe_stream_yields_the_same_events() {
    let bus = EventBus::default();
    let stream = bus.subscribe_stream("neg-1").await;

    bus.publish(event(EventType::FormulationReady, "neg-1", 0)).await;
    bus.publish(event(EventType::NegotiationCompleted, "neg-1", 1)).await;
    bus.complete("neg-1").await;

    let collected: Vec<Event> = stream.collect().await;
    assert_eq!(collected.len(), 2);
    assert_eq!(collected[0].event_type, EventType::FormulationReady);
    assert_eq!(collected[1].event_type, EventType::NegotiationCompleted);
}

#[tokio::test]
async fn envelope_serialises_with_wire_names_and_iso_timestamps() {
    let e = Event::now(
        EventType::BarrierComplete,
        "neg-1",
        json!({ "offered": 2, "timed_out": 1, "exited": 0 }),
    );
    let value = serde_json::to_value(&e).unwrap();
    assert_eq!(value["event_type"], "barrier.complete");
    assert_eq!(value["negotiation_id"], "neg-1");
    assert_eq!(value["data"]["offered"], 2);
    // chrono serialises DateTime<Utc> as RFC 3339 / ISO-8601 UTC.
    let ts = value["timestamp"].as_str().unwrap();
    assert!(ts.ends_with('Z') || ts.contains("+00:00"));
}
