//! Consumer stages: the repartition hop and the stateful main fold.
//!
//! Each stage owns one consumer and processes records serially, so events
//! within a partition are observed strictly in offset order. Per-message
//! failures (decode, script) are logged and skipped with the offset still
//! advancing; consumer failures are fatal to the stage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use alembic_core::{Event, EventEnvelope, ProcessorConfig, RecordContext};
use alembic_dsl::Projection;

use crate::error::{ProcessorError, Result};
use crate::state::StateTable;
use crate::topics::{client_config, METADATA_TIMEOUT};

/// Stage lifecycle. `Stopped` is terminal; a stopped stage is never
/// restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    NotStarted,
    Starting,
    Ready,
    Running,
    Draining,
    Stopped,
}

/// Everything a stage task needs from its processor.
pub(crate) struct StageContext {
    pub cfg: ProcessorConfig,
    pub projection: Arc<Projection>,
    pub state_tx: watch::Sender<StageState>,
    pub cancel: CancellationToken,
}

pub(crate) fn consumer_config(cfg: &ProcessorConfig, group: &str) -> ClientConfig {
    let mut config = client_config(cfg);
    config
        .set("group.id", group)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "true")
        // Offsets are stored manually once a record is fully processed.
        .set("enable.auto.offset.store", "false");
    config
}

pub(crate) fn producer_config(cfg: &ProcessorConfig) -> ClientConfig {
    let mut config = client_config(cfg);
    config.set("message.timeout.ms", "10000");
    config
}

fn record_context(msg: &BorrowedMessage<'_>) -> RecordContext {
    RecordContext {
        key: msg
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned())
            .unwrap_or_default(),
        topic: msg.topic().to_string(),
        partition: msg.partition(),
        offset: msg.offset(),
        timestamp_ms: msg.timestamp().to_millis(),
    }
}

/// Outcome of the main-stage per-message protocol, already persisted.
pub(crate) struct ProcessedRecord {
    pub key: String,
    pub state: Vec<u8>,
    pub output: Option<Vec<u8>>,
}

/// Main-stage per-message protocol: decode, fold, persist, build the
/// output envelope. Returns `Ok(None)` when the record is skipped; the
/// caller still advances the offset. State-store failures are fatal.
pub(crate) fn process_main_record(
    projection: &Projection,
    table: &mut dyn StateTable,
    payload: &[u8],
    ctx: &RecordContext,
) -> Result<Option<ProcessedRecord>> {
    let envelope = match EventEnvelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(topic = %ctx.topic, offset = ctx.offset, error = %e, "skipping undecodable record");
            return Ok(None);
        }
    };

    let event = Event::from_envelope(envelope, ctx);
    let state = table.get(&ctx.key)?;

    let outcome = match projection.apply(state.as_deref(), &event) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                projection = projection.name(),
                topic = %ctx.topic,
                offset = ctx.offset,
                error = %e,
                "skipping event after script failure"
            );
            return Ok(None);
        }
    };

    // The new state is persisted under the key before anything is emitted
    // for this event.
    table.put(&ctx.key, &outcome.state)?;

    let output = match outcome.output {
        Some(value) => match EventEnvelope::result(value).encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(projection = projection.name(), error = %e, "dropping unencodable output");
                None
            }
        },
        None => None,
    };

    Ok(Some(ProcessedRecord {
        key: ctx.key.clone(),
        state: outcome.state,
        output,
    }))
}

/// Repartition-stage per-message protocol: decode just enough to compute
/// the new key. Returns `None` when the record is skipped.
pub(crate) fn process_repartition_record(
    projection: &Projection,
    payload: &[u8],
    ctx: &RecordContext,
) -> Option<String> {
    let envelope = match EventEnvelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(topic = %ctx.topic, offset = ctx.offset, error = %e, "skipping undecodable record");
            return None;
        }
    };

    let event = Event::from_envelope(envelope, ctx);
    match projection.partition_key(&event) {
        Ok(key) => Some(key),
        Err(e) => {
            error!(
                projection = projection.name(),
                offset = ctx.offset,
                error = %e,
                "skipping event after partition function failure"
            );
            None
        }
    }
}

async fn emit(producer: &FutureProducer, topic: &str, key: &str, payload: &[u8]) {
    let record = FutureRecord::to(topic).key(key).payload(payload);
    if let Err((e, _)) = producer.send(record, Duration::from_secs(10)).await {
        // At-least-once: the un-stored offset will be redelivered.
        error!(topic, error = %e, "emit failed");
    }
}

/// Read the compacted changelog up to its high watermarks.
///
/// Runs on a blocking thread; the caller applies the entries to the table.
fn recover_entries(cfg: &ProcessorConfig, changelog: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let consumer: BaseConsumer = client_config(cfg)
        .set("group.id", format!("{changelog}-recovery"))
        .set("enable.auto.commit", "false")
        .create()?;

    let md = consumer.fetch_metadata(Some(changelog), METADATA_TIMEOUT)?;
    let Some(topic_md) = md.topics().iter().find(|t| t.name() == changelog) else {
        return Ok(Vec::new());
    };

    let mut tpl = TopicPartitionList::new();
    let mut remaining: HashMap<i32, i64> = HashMap::new();
    for partition in topic_md.partitions() {
        let (low, high) = consumer.fetch_watermarks(changelog, partition.id(), METADATA_TIMEOUT)?;
        if high > low {
            remaining.insert(partition.id(), high);
        }
        tpl.add_partition_offset(changelog, partition.id(), Offset::Beginning)?;
    }
    if remaining.is_empty() {
        return Ok(Vec::new());
    }
    consumer.assign(&tpl)?;

    let mut entries = Vec::new();
    let mut idle_polls = 0;
    while !remaining.is_empty() {
        match consumer.poll(Duration::from_millis(200)) {
            Some(Ok(msg)) => {
                idle_polls = 0;
                if let (Some(key), Some(payload)) = (msg.key(), msg.payload()) {
                    entries.push((String::from_utf8_lossy(key).into_owned(), payload.to_vec()));
                }
                if let Some(high) = remaining.get(&msg.partition()) {
                    if msg.offset() + 1 >= *high {
                        remaining.remove(&msg.partition());
                    }
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                // Compaction can leave the live tail short of the watermark;
                // give up on silent partitions after a bounded wait.
                idle_polls += 1;
                if idle_polls >= 50 {
                    warn!(changelog, "changelog replay stopped short of watermark");
                    break;
                }
            }
        }
    }
    Ok(entries)
}

pub(crate) fn apply_changelog(
    table: &mut dyn StateTable,
    entries: Vec<(String, Vec<u8>)>,
) -> Result<()> {
    for (key, value) in entries {
        table.put(&key, &value)?;
    }
    Ok(())
}

/// The stateful main stage: restore state, then fold records until
/// cancelled.
pub(crate) async fn run_main_stage(
    ctx: StageContext,
    input_topics: Vec<String>,
    result_topic: String,
    group: String,
) -> Result<()> {
    let _ = ctx.state_tx.send(StageState::Starting);

    let mut table = crate::state::open_table(&ctx.cfg, &group)?;
    let changelog = changelog_topic(&group);

    let recover_cfg = ctx.cfg.clone();
    let recover_topic = changelog.clone();
    let entries =
        tokio::task::spawn_blocking(move || recover_entries(&recover_cfg, &recover_topic))
            .await
            .map_err(|e| ProcessorError::StartAborted(e.to_string()))??;
    if !entries.is_empty() {
        info!(group = %group, restored = entries.len(), "state restored from changelog");
    }
    apply_changelog(table.as_mut(), entries)?;

    let consumer: StreamConsumer = consumer_config(&ctx.cfg, &group).create()?;
    let topics: Vec<&str> = input_topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topics)?;
    let producer: FutureProducer = producer_config(&ctx.cfg).create()?;

    let _ = ctx.state_tx.send(StageState::Ready);
    info!(group = %group, "stage ready");
    let _ = ctx.state_tx.send(StageState::Running);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            msg = consumer.recv() => {
                let msg = msg?;
                let record_ctx = record_context(&msg);
                let payload = msg.payload().unwrap_or_default();

                if let Some(record) =
                    process_main_record(&ctx.projection, table.as_mut(), payload, &record_ctx)?
                {
                    emit(&producer, &changelog, &record.key, &record.state).await;
                    if let Some(output) = record.output {
                        emit(&producer, &result_topic, "", &output).await;
                    }
                }

                if let Err(e) = consumer.store_offset_from_message(&msg) {
                    warn!(group = %group, error = %e, "failed to store offset");
                }
            }
        }
    }

    let _ = ctx.state_tx.send(StageState::Draining);
    if let Err(e) = producer.flush(Duration::from_secs(10)) {
        warn!(group = %group, error = %e, "producer flush failed during drain");
    }
    let _ = ctx.state_tx.send(StageState::Stopped);
    info!(group = %group, "stage stopped");
    Ok(())
}

/// The stateless repartition stage: re-emit raw records keyed by the
/// projection's partition function.
pub(crate) async fn run_repartition_stage(
    ctx: StageContext,
    input_topics: Vec<String>,
    output_topic: String,
    group: String,
) -> Result<()> {
    let _ = ctx.state_tx.send(StageState::Starting);

    let consumer: StreamConsumer = consumer_config(&ctx.cfg, &group).create()?;
    let topics: Vec<&str> = input_topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topics)?;
    let producer: FutureProducer = producer_config(&ctx.cfg).create()?;

    let _ = ctx.state_tx.send(StageState::Ready);
    info!(group = %group, "stage ready");
    let _ = ctx.state_tx.send(StageState::Running);

    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            msg = consumer.recv() => {
                let msg = msg?;
                let record_ctx = record_context(&msg);
                let payload = msg.payload().unwrap_or_default();

                if let Some(key) =
                    process_repartition_record(&ctx.projection, payload, &record_ctx)
                {
                    // The original raw bytes travel on, only the key changes.
                    emit(&producer, &output_topic, &key, payload).await;
                }

                if let Err(e) = consumer.store_offset_from_message(&msg) {
                    warn!(group = %group, error = %e, "failed to store offset");
                }
            }
        }
    }

    let _ = ctx.state_tx.send(StageState::Draining);
    if let Err(e) = producer.flush(Duration::from_secs(10)) {
        warn!(group = %group, error = %e, "producer flush failed during drain");
    }
    let _ = ctx.state_tx.send(StageState::Stopped);
    info!(group = %group, "stage stopped");
    Ok(())
}

pub(crate) fn partition_by_topic(name: &str) -> String {
    format!("{name}-partition-by-output")
}

pub(crate) fn main_group(name: &str) -> String {
    format!("{name}-group")
}

pub(crate) fn partition_group(name: &str) -> String {
    format!("{name}-partition-by-group")
}

pub(crate) fn changelog_topic(group: &str) -> String {
    format!("{group}-table")
}
