//! Decouples the turn loop from the slow consumers of its output: the
//! spectator UI and the optional on disk log. The UI sink works off a bounded
//! queue on a timer with a hard per delivery deadline, the file sink batches
//! messages and hands them to a single writer worker.

use crate::error::{EngineError, EngineResult};
use crate::ui_endpoint::UiEndpoint;
use protocol::{Message, QUEUE_DEFAULT_SIZE, UI_SEND_DEADLINE_MS};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug)]
pub struct OutputPipelineConfig {
    pub send_to_ui: bool,
    /// The UI ticker period.
    pub time_interval: Duration,
    pub send_to_file: bool,
    pub file_path: PathBuf,
    /// How many messages pile up before they get handed to the file writer.
    pub buffer_size: usize,
    /// Capacity of the UI queue before the overflow policy strikes. The
    /// production value is [`QUEUE_DEFAULT_SIZE`].
    pub queue_capacity: usize,
}

impl OutputPipelineConfig {
    pub fn disabled() -> Self {
        OutputPipelineConfig {
            send_to_ui: false,
            time_interval: Duration::from_millis(100),
            send_to_file: false,
            file_path: PathBuf::new(),
            buffer_size: 1,
            queue_capacity: QUEUE_DEFAULT_SIZE,
        }
    }
}

pub struct OutputPipeline {
    config: OutputPipelineConfig,
    queue: Mutex<VecDeque<Message>>,
    queue_notify: Notify,
    file_staging: Mutex<Vec<Message>>,
    /// Capacity one: the writer processes at most one hand-off at a time.
    batch_tx: Mutex<Option<mpsc::Sender<Vec<Message>>>>,
    stop: watch::Sender<bool>,
    ticker_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl OutputPipeline {
    /// Builds the pipeline and spawns the sinks that are enabled.
    pub async fn spawn(config: OutputPipelineConfig, ui: Arc<UiEndpoint>) -> Arc<OutputPipeline> {
        let (stop, _) = watch::channel(false);
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<Message>>(1);

        let pipeline = Arc::new(OutputPipeline {
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            file_staging: Mutex::new(Vec::new()),
            batch_tx: Mutex::new(config.send_to_file.then_some(batch_tx)),
            stop,
            ticker_task: Mutex::new(None),
            writer_task: Mutex::new(None),
            config,
        });

        if pipeline.config.send_to_ui {
            let task = tokio::spawn(ui_ticker(
                pipeline.clone(),
                ui,
                pipeline.stop.subscribe(),
            ));
            *pipeline.ticker_task.lock().await = Some(task);
        }
        if pipeline.config.send_to_file {
            let task = tokio::spawn(file_writer(pipeline.config.file_path.clone(), batch_rx));
            *pipeline.writer_task.lock().await = Some(task);
        }
        pipeline
    }

    /// Either appends the message or fails. When the UI queue is full the
    /// whole backlog gets discarded in favor of fresh output, which is the
    /// lesser evil for a spectator that lags this far behind.
    pub async fn put_message(&self, message: Message) -> EngineResult<()> {
        if self.config.send_to_file {
            let handoff = {
                let mut staging = self.file_staging.lock().await;
                staging.push(message.clone());
                if staging.len() >= self.config.buffer_size {
                    Some(std::mem::take(&mut *staging))
                } else {
                    None
                }
            };
            if let Some(batch) = handoff {
                let sender = self.batch_tx.lock().await.clone();
                let sender = sender.ok_or(EngineError::QueueOverflow)?;
                if sender.send(batch).await.is_err() {
                    return Err(EngineError::QueueOverflow);
                }
            }
        }
        if self.config.send_to_ui {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.config.queue_capacity {
                tracing::warn!(
                    discarded = queue.len(),
                    "output queue overflowed, discarding the backlog"
                );
                queue.clear();
            }
            queue.push_back(message);
            drop(queue);
            self.queue_notify.notify_one();
        }
        Ok(())
    }

    /// How many messages wait for the UI sink right now.
    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Stops the UI ticker, flushes the residual file staging as a final
    /// hand-off and waits for the writer to drain.
    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        if let Some(task) = self.ticker_task.lock().await.take() {
            let _ = task.await;
        }
        let sender = self.batch_tx.lock().await.take();
        if let Some(sender) = sender {
            let residual = std::mem::take(&mut *self.file_staging.lock().await);
            if !residual.is_empty() {
                let _ = sender.send(residual).await;
            }
            // Dropping the sender lets the writer exit once it drained.
        }
        if let Some(task) = self.writer_task.lock().await.take() {
            let _ = task.await;
        }
    }

    async fn peek_head(&self) -> Option<Message> {
        self.queue.lock().await.front().cloned()
    }

    async fn pop_head(&self) {
        self.queue.lock().await.pop_front();
    }
}

/// Fires every interval. Each firing waits for a head message, attempts one
/// delivery under the hard deadline and only pops the head when the delivery
/// made it. An expired delivery leaves the head in place for the next tick.
async fn ui_ticker(
    pipeline: Arc<OutputPipeline>,
    ui: Arc<UiEndpoint>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let deadline = Duration::from_millis(UI_SEND_DEADLINE_MS);
    let mut ticker = tokio::time::interval(pipeline.config.time_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop_rx.changed() => return,
            _ = ticker.tick() => {}
        }
        let head = loop {
            if let Some(message) = pipeline.peek_head().await {
                break message;
            }
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = pipeline.queue_notify.notified() => {}
            }
        };
        if ui.send_within(head, deadline).await {
            pipeline.pop_head().await;
        } else {
            tracing::debug!("spectator delivery missed its deadline, retrying next tick");
        }
    }
}

/// Appends every handed over batch to the log file, one serialized message
/// per line. Exits when the hand-off channel closes.
async fn file_writer(path: PathBuf, mut batch_rx: mpsc::Receiver<Vec<Message>>) {
    let mut file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(?err, path = %path.display(), "can not open the output log");
            // Drain the channel so hand-offs never block forever.
            while batch_rx.recv().await.is_some() {}
            return;
        }
    };
    while let Some(batch) = batch_rx.recv().await {
        let mut lines = String::new();
        for message in &batch {
            match serde_json::to_string(message) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(err) => tracing::error!(%err, "unserializable output message"),
            }
        }
        if let Err(err) = file.write_all(lines.as_bytes()).await {
            tracing::error!(?err, "output log write failed");
        }
    }
    let _ = file.flush().await;
}
