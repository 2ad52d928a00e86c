//! End-to-end scenarios against the public facade: ordered delivery,
//! backpressure policies, reconnection replay, batching, and supersede.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde_json::Value;

use streamweaver::{
    EventType, EventVisibility, OverflowPolicy, StreamConfig, StreamEvent, StreamWeaver,
};

const WAIT: Duration = Duration::from_secs(5);

/// One parsed SSE frame from the wire.
#[derive(Debug)]
struct Frame {
    channel: String,
    data: Value,
}

impl Frame {
    fn event_type(&self) -> &str {
        self.data.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    fn message(&self) -> &str {
        self.data.get("message").and_then(Value::as_str).unwrap_or_default()
    }
}

/// Split collected payload chunks into individual SSE frames.
fn frames_of(chunks: &[String]) -> Vec<Frame> {
    let mut frames = Vec::new();
    for chunk in chunks {
        for raw in chunk.split("\n\n").filter(|raw| !raw.trim().is_empty()) {
            let channel = raw
                .lines()
                .find_map(|line| line.strip_prefix("event: "))
                .unwrap_or_default()
                .to_string();
            let data = raw
                .lines()
                .find_map(|line| line.strip_prefix("data: "))
                .and_then(|data| serde_json::from_str(data).ok())
                .unwrap_or(Value::Null);
            frames.push(Frame { channel, data });
        }
    }
    frames
}

async fn next_chunk(stream: &mut (impl Stream<Item = String> + Unpin)) -> String {
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("stream produced nothing before the deadline")
        .expect("stream ended unexpectedly")
}

async fn collect_all(stream: impl Stream<Item = String>) -> Vec<String> {
    tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
        .await
        .expect("stream did not terminate before the deadline")
}

#[tokio::test]
async fn basic_publish_subscribe_delivers_in_order() {
    let weaver = Arc::new(StreamWeaver::new(StreamConfig::default()));
    weaver.initialize().await;
    weaver.register_session("s1", "demo", None, None).await;

    assert!(weaver.publish("s1", EventType::WorkflowStarted, "start").await);
    assert!(weaver.publish("s1", EventType::StepStarted, "s").await);
    assert!(weaver.publish("s1", EventType::StepCompleted, "c").await);
    assert!(weaver.publish("s1", EventType::WorkflowCompleted, "done").await);

    let stream = weaver.subscribe("s1", None, None).await.expect("subscribe");
    let chunks = collect_all(stream).await;
    let frames = frames_of(&chunks);

    let messages: Vec<_> = frames.iter().map(Frame::message).collect();
    assert_eq!(messages, ["Connected to stream", "start", "s", "c", "done"]);
    assert!(frames.iter().all(|frame| frame.channel == "message"));
    assert_eq!(frames.last().map(Frame::event_type), Some("workflow_completed"));

    weaver.shutdown().await;
}

#[tokio::test]
async fn drop_oldest_keeps_newest_under_burst() {
    let config = StreamConfig {
        queue_size: 3,
        backpressure_policy: OverflowPolicy::DropOldest,
        ..StreamConfig::default()
    };
    let weaver = Arc::new(StreamWeaver::new(config));
    weaver.register_session("s1", "burst", None, None).await;

    for name in ["e1", "e2", "e3", "e4", "e5"] {
        assert!(weaver.publish("s1", EventType::StepProgress, name).await);
    }

    let stats = weaver.queue_stats("s1").await;
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.size, 3);

    let stream = weaver.subscribe("s1", None, None).await.expect("subscribe");
    let chunks: Vec<_> = tokio::time::timeout(WAIT, stream.take(4).collect::<Vec<_>>())
        .await
        .expect("delivery");
    let messages: Vec<_> = frames_of(&chunks).iter().map(|f| f.message().to_string()).collect();
    assert_eq!(messages, ["Connected to stream", "e3", "e4", "e5"]);
}

#[tokio::test]
async fn drop_newest_rejects_overflow_publishes() {
    let config = StreamConfig {
        queue_size: 3,
        backpressure_policy: OverflowPolicy::DropNewest,
        ..StreamConfig::default()
    };
    let weaver = Arc::new(StreamWeaver::new(config));
    weaver.register_session("s1", "burst", None, None).await;

    assert!(weaver.publish("s1", EventType::StepProgress, "e1").await);
    assert!(weaver.publish("s1", EventType::StepProgress, "e2").await);
    assert!(weaver.publish("s1", EventType::StepProgress, "e3").await);
    assert!(!weaver.publish("s1", EventType::StepProgress, "e4").await);
    assert!(!weaver.publish("s1", EventType::StepProgress, "e5").await);

    assert_eq!(weaver.queue_stats("s1").await.dropped, 2);

    let stream = weaver.subscribe("s1", None, None).await.expect("subscribe");
    let chunks: Vec<_> = tokio::time::timeout(WAIT, stream.take(4).collect::<Vec<_>>())
        .await
        .expect("delivery");
    let messages: Vec<_> = frames_of(&chunks).iter().map(|f| f.message().to_string()).collect();
    assert_eq!(messages, ["Connected to stream", "e1", "e2", "e3"]);
}

#[tokio::test]
async fn reconnection_replays_missed_events() {
    let weaver = Arc::new(StreamWeaver::new(StreamConfig::default()));
    weaver.register_session("s1", "reconnect", None, None).await;

    let events: Vec<_> = (1..=4)
        .map(|n| StreamEvent::new(EventType::StepProgress, "s1", format!("e{n}")))
        .collect();
    for event in &events {
        assert!(weaver.publish_event(event.clone()).await);
    }

    // First subscriber reads the connect event plus e1, e2, then drops.
    {
        let stream = weaver.subscribe("s1", None, None).await.expect("subscribe");
        let chunks: Vec<_> = tokio::time::timeout(WAIT, stream.take(3).collect::<Vec<_>>())
            .await
            .expect("delivery");
        let messages: Vec<_> =
            frames_of(&chunks).iter().map(|f| f.message().to_string()).collect();
        assert_eq!(messages, ["Connected to stream", "e1", "e2"]);
    }
    // Let the dropped subscriber's cleanup land before reconnecting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = weaver
        .subscribe("s1", Some(events[1].event_id.clone()), None)
        .await
        .expect("resubscribe");
    futures::pin_mut!(stream);

    let replayed = [next_chunk(&mut stream).await, next_chunk(&mut stream).await];
    let messages: Vec<_> = frames_of(&replayed).iter().map(|f| f.message().to_string()).collect();
    assert_eq!(messages, ["e3", "e4"]);

    // The stream is live again after the replay prefix.
    assert!(weaver.publish("s1", EventType::StepProgress, "e5").await);
    assert!(weaver.publish("s1", EventType::WorkflowCompleted, "done").await);

    let live = [next_chunk(&mut stream).await, next_chunk(&mut stream).await];
    let messages: Vec<_> = frames_of(&live).iter().map(|f| f.message().to_string()).collect();
    assert_eq!(messages, ["e5", "done"]);

    let end = tokio::time::timeout(WAIT, stream.next()).await.expect("terminated");
    assert!(end.is_none());
}

#[tokio::test]
async fn batching_coalesces_burst_and_flushes_on_immediate() {
    let config = StreamConfig {
        enable_batching: true,
        batch_size: 10,
        batch_delay: Duration::from_millis(50),
        ..StreamConfig::default()
    };
    let weaver = Arc::new(StreamWeaver::new(config));
    weaver.register_session("s1", "batch", None, None).await;

    for name in ["e1", "e2", "e3"] {
        assert!(weaver.publish("s1", EventType::StepProgress, name).await);
    }
    assert!(weaver.publish("s1", EventType::WorkflowCompleted, "done").await);

    let stream = weaver.subscribe("s1", None, None).await.expect("subscribe");
    let chunks = collect_all(stream).await;
    let frames = frames_of(&chunks);

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].channel, "message");
    assert_eq!(frames[0].message(), "Connected to stream");

    assert_eq!(frames[1].channel, "batch");
    let batch = frames[1].data.as_array().expect("batch array");
    let batched: Vec<_> = batch
        .iter()
        .map(|event| event.get("message").and_then(Value::as_str).unwrap_or_default())
        .collect();
    assert_eq!(batched, ["e1", "e2", "e3"]);

    assert_eq!(frames[2].channel, "message");
    assert_eq!(frames[2].event_type(), "workflow_completed");
}

#[tokio::test]
async fn second_subscriber_supersedes_first() {
    let weaver = Arc::new(StreamWeaver::new(StreamConfig::default()));
    weaver.register_session("s1", "supersede", None, None).await;

    let mut first =
        Box::pin(weaver.subscribe("s1", None, None).await.expect("first subscribe"));
    let connect = next_chunk(&mut first).await;
    assert_eq!(frames_of(&[connect])[0].message(), "Connected to stream");

    // Drain the rest of the first stream concurrently.
    let first_tail = tokio::spawn(async move {
        tokio::time::timeout(WAIT, first.collect::<Vec<_>>()).await.expect("first terminated")
    });

    let second = weaver.subscribe("s1", None, None).await.expect("second subscribe");
    futures::pin_mut!(second);
    let connect = next_chunk(&mut second).await;
    assert_eq!(frames_of(&[connect])[0].message(), "Connected to stream");

    let tail = first_tail.await.expect("join");
    let frames = frames_of(&tail);
    let last = frames.last().expect("interruption frame");
    assert_eq!(last.event_type(), "workflow_interruption");
    assert_eq!(last.message(), "Stream has been superseded by a new connection");
    assert_eq!(last.data.get("success"), Some(&Value::Bool(false)));

    // The superseding subscriber stays live.
    assert!(weaver.publish("s1", EventType::WorkflowCompleted, "done").await);
    let done = next_chunk(&mut second).await;
    assert_eq!(frames_of(&[done])[0].event_type(), "workflow_completed");
}

#[tokio::test]
async fn filters_project_at_the_subscriber_boundary() {
    let weaver = Arc::new(StreamWeaver::new(StreamConfig::default()));
    weaver.register_session("s1", "filtered", None, None).await;

    weaver
        .publish_event(
            StreamEvent::new(EventType::ReasoningChunk, "s1", "internal thought")
                .with_visibility(EventVisibility::LiveUiOnly),
        )
        .await;
    weaver.publish("s1", EventType::StepProgress, "visible").await;
    weaver.publish("s1", EventType::WorkflowCompleted, "done").await;

    let stream = weaver
        .subscribe("s1", None, Some(streamweaver::EventFilter::user_facing()))
        .await
        .expect("subscribe");
    let chunks = collect_all(stream).await;
    let messages: Vec<_> = frames_of(&chunks).iter().map(|f| f.message().to_string()).collect();
    assert_eq!(messages, ["Connected to stream", "visible", "done"]);
}

#[tokio::test]
async fn close_stream_twice_is_idempotent() {
    let weaver = Arc::new(StreamWeaver::new(StreamConfig::default()));
    weaver.register_session("s1", "close", None, None).await;
    weaver.publish("s1", EventType::StepStarted, "step").await;

    assert!(weaver.close_stream("s1", Some("operator request")).await);
    assert!(weaver.close_stream("s1", Some("operator request")).await);
    assert!(weaver.get_session("s1").await.is_none());
}

#[tokio::test]
async fn replay_window_is_bounded_by_buffer_size() {
    let config = StreamConfig { event_buffer_size: 5, ..StreamConfig::default() };
    let weaver = Arc::new(StreamWeaver::new(config));
    weaver.register_session("s1", "window", None, None).await;

    let events: Vec<_> = (0..10)
        .map(|n| StreamEvent::new(EventType::StepProgress, "s1", format!("e{n}")))
        .collect();
    for event in &events {
        weaver.publish_event(event.clone()).await;
    }

    // An evicted id yields nothing; a retained one yields the exact suffix.
    assert!(weaver.get_replay_events("s1", &events[2].event_id).await.is_empty());
    let replayed = weaver.get_replay_events("s1", &events[6].event_id).await;
    let messages: Vec<_> = replayed.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, ["e7", "e8", "e9"]);
}
