//! The output pipeline: batched file sink, the overflow policy of the UI
//! queue and the per delivery deadline with head retention.

mod support;

use engine_lib::output_pipeline::{OutputPipeline, OutputPipelineConfig};
use engine_lib::ui_endpoint::UiEndpoint;
use protocol::Message;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const TOKEN: &str = "spectator-ui-token-0000000000000";

fn scratch_file(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("output-pipeline-{name}-{}.log", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

fn detached_ui() -> Arc<UiEndpoint> {
    UiEndpoint::new(TOKEN.to_string())
}

#[tokio::test]
async fn the_file_sink_writes_one_line_per_message_in_batches() {
    let path = scratch_file("batches");
    let config = OutputPipelineConfig {
        send_to_ui: false,
        time_interval: Duration::from_millis(50),
        send_to_file: true,
        file_path: path.clone(),
        buffer_size: 3,
        queue_capacity: 100,
    };
    let pipeline = OutputPipeline::spawn(config, detached_ui()).await;

    for index in 0..3 {
        pipeline
            .put_message(Message::new("logged", vec![json!(index)]))
            .await
            .expect("put");
    }
    // The third message completed the batch and triggered the hand-off.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let written = std::fs::read_to_string(&path).expect("read log");
    assert_eq!(written.lines().count(), 3);

    // Two residual messages below the threshold get flushed by the shutdown.
    for index in 3..5 {
        pipeline
            .put_message(Message::new("logged", vec![json!(index)]))
            .await
            .expect("put");
    }
    pipeline.shutdown().await;
    let written = std::fs::read_to_string(&path).expect("read log");
    let lines: Vec<Message> = written
        .lines()
        .map(|line| serde_json::from_str(line).expect("decode log line"))
        .collect();
    assert_eq!(lines.len(), 5);
    assert_eq!(lines[4].args, vec![json!(4)]);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn a_full_queue_discards_the_backlog_in_favor_of_the_new_message() {
    let config = OutputPipelineConfig {
        send_to_ui: true,
        // Keep the ticker quiet during the test.
        time_interval: Duration::from_secs(3600),
        send_to_file: false,
        file_path: PathBuf::new(),
        buffer_size: 1,
        queue_capacity: 5,
    };
    let pipeline = OutputPipeline::spawn(config, detached_ui()).await;

    for index in 0..5 {
        pipeline
            .put_message(Message::new("filler", vec![json!(index)]))
            .await
            .expect("put");
    }
    assert_eq!(pipeline.queued().await, 5);

    pipeline
        .put_message(Message::new("fresh", Vec::new()))
        .await
        .expect("put over the cap");
    // The whole backlog is gone, only the new message survived.
    assert_eq!(pipeline.queued().await, 1);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn a_missed_deadline_keeps_the_head_for_the_next_tick() {
    let ui = detached_ui();
    let config = OutputPipelineConfig {
        send_to_ui: true,
        time_interval: Duration::from_millis(50),
        send_to_file: false,
        file_path: PathBuf::new(),
        buffer_size: 1,
        queue_capacity: 100,
    };
    let pipeline = OutputPipeline::spawn(config, ui.clone()).await;

    pipeline
        .put_message(Message::new("stubborn", Vec::new()))
        .await
        .expect("put");

    // Without a spectator every attempt runs into the deadline, the head must
    // survive all of them.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(pipeline.queued().await, 1);

    // Once a spectator shows up the very same message gets delivered.
    ui.listen(0).await.expect("ui listen");
    let addr = ui.local_addr().await.expect("ui addr");
    let mut spectator = support::connect(addr).await;
    support::send_message(&mut spectator, &Message::token(TOKEN)).await;

    let delivered = support::read_message(&mut spectator).await;
    assert_eq!(delivered.name, "stubborn");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pipeline.queued().await, 0);
    pipeline.shutdown().await;
}
