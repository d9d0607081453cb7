// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cloudwatch_logs::{
    buffer::{BufferHandle, BufferService},
    clock::{Clock, SystemClock},
    commit::CommitEngine,
    config::{ForwarderConfig, InputConfig, OutputConfig, StateBackend},
    dispatcher::Dispatcher,
    format::RecordFormatter,
    http::{HttpClientOptions, HttpLogsClient},
    parser::Record,
    poller::{IngestionPoller, PollerHandle},
    provisioner::ResourceProvisioner,
    resolver::StreamResolver,
    sequence::SequenceTokenCache,
    sink::{ChannelSink, SinkEvent},
    store::{CursorStore, FileStore, MemoryStore, SledStore, StateStore},
    LogsClient,
};

/// Tag of stdin lines that are bare records rather than envelopes.
const DEFAULT_TAG: &str = "stdin";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let config = ForwarderConfig::from_os_env();
    let log_level = config
        .as_ref()
        .map(|c| c.log_level.to_lowercase())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&log_level)?;

    let config = config.context("invalid configuration")?;
    config.validate().context("invalid configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    let result = runtime.block_on(run(config));
    // Reading stdin blocks a thread that cannot be interrupted.
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,sled=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse log level in configuration")?,
        )
        .with_writer(std::io::stderr)
        .event_format(logger::Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");
    Ok(())
}

async fn run(config: ForwarderConfig) -> anyhow::Result<()> {
    let endpoint = config.endpoint.clone().context("CW_ENDPOINT is not set")?;
    let client: Arc<dyn LogsClient> = Arc::new(HttpLogsClient::new(
        endpoint,
        &HttpClientOptions {
            https_proxy: config.https_proxy.clone(),
            timeout: config.request_timeout,
        },
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cancel = CancellationToken::new();

    let input = match &config.input {
        Some(input) => Some(start_input(input, client.clone(), clock.clone())?),
        None => None,
    };
    let output = match &config.output {
        Some(output) => Some(start_output(
            output,
            client,
            clock,
            cancel.clone(),
            input.is_none(),
        )?),
        None => None,
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                shutdown.cancel();
            }
            Err(err) => error!("failed to listen for shutdown signal: {err}"),
        }
    });
    info!(
        input = config.input.is_some(),
        output = config.output.is_some(),
        "forwarder started"
    );

    cancel.cancelled().await;

    if let Some(input) = input {
        input.stop().await;
    }
    if let Some(output) = output {
        output.stop().await;
    }
    info!("forwarder stopped");
    Ok(())
}

struct Input {
    poller: PollerHandle,
    writer: JoinHandle<()>,
    sled: Option<Arc<SledStore>>,
}

impl Input {
    async fn stop(self) {
        // Dropping the poller closes the record channel and ends the writer.
        drop(self.poller.shutdown().await);
        if let Err(err) = self.writer.await {
            error!("record writer task failed: {err}");
        }
        if let Some(sled) = self.sled {
            if let Err(err) = sled.flush() {
                error!("failed to flush cursor database: {err}");
            }
        }
    }
}

fn start_input(
    config: &InputConfig,
    client: Arc<dyn LogsClient>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Input> {
    let (cursors, sled) = cursor_store(config)?;
    let poller_config = config.poller_config();
    let resolver = StreamResolver::new(
        client.clone(),
        clock.clone(),
        config.group_selector()?,
        config.stream_selector()?,
    )
    .with_throttle_backoff(poller_config.throttle_backoff);

    let (sink, rx) = ChannelSink::channel();
    let sink = Arc::new(sink);
    let poller = IngestionPoller::new(
        client,
        clock,
        resolver,
        cursors,
        config.parser()?,
        sink.clone(),
        sink,
        poller_config,
    );

    Ok(Input {
        poller: poller.spawn(),
        writer: tokio::spawn(write_records(rx)),
        sled,
    })
}

fn cursor_store(config: &InputConfig) -> anyhow::Result<(CursorStore, Option<Arc<SledStore>>)> {
    let mut sled = None;
    let store: Arc<dyn StateStore> = match config.state_backend()? {
        StateBackend::Memory => Arc::new(MemoryStore::new()),
        StateBackend::Files(dir) => Arc::new(
            FileStore::open(&dir)
                .with_context(|| format!("failed to open state directory {}", dir.display()))?,
        ),
        StateBackend::Sled(path) => {
            let store = Arc::new(
                SledStore::open(&path)
                    .with_context(|| format!("failed to open state database {}", path.display()))?,
            );
            sled = Some(store.clone());
            store
        }
    };

    let cursors = CursorStore::new(store);
    let cursors = match &config.legacy_state_base {
        Some(base) => cursors.with_legacy_migration(base.clone()),
        None => cursors,
    };
    Ok((cursors, sled))
}

/// Prints ingested records to stdout as JSON lines.
async fn write_records(mut rx: UnboundedReceiver<SinkEvent>) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            SinkEvent::Record {
                tag,
                time_ms,
                record,
            } => {
                let mut line = envelope(tag, time_ms, record).to_string();
                line.push('\n');
                let written = async {
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.flush().await
                };
                if let Err(err) = written.await {
                    error!("failed to write record to stdout: {err}");
                    return;
                }
            }
            SinkEvent::Error {
                tag,
                time_ms,
                record,
                cause,
            } => {
                warn!(
                    tag = %tag,
                    time_ms,
                    record = %serde_json::Value::Object(record),
                    "invalid log event: {cause}"
                );
            }
        }
    }
}

struct Output {
    buffer: BufferHandle,
    dispatcher: Dispatcher,
    reader: JoinHandle<()>,
    flusher: JoinHandle<()>,
}

impl Output {
    async fn stop(self) {
        if let Err(err) = self.reader.await {
            error!("stdin reader task failed: {err}");
        }
        if let Err(err) = self.flusher.await {
            error!("flush task failed: {err}");
        }
        flush(&self.buffer, &self.dispatcher).await;
        if let Err(err) = self.buffer.shutdown() {
            error!("failed to stop record buffer: {err}");
        }
    }
}

fn start_output(
    config: &OutputConfig,
    client: Arc<dyn LogsClient>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    stop_on_eof: bool,
) -> anyhow::Result<Output> {
    let formatter = RecordFormatter::new(config.format_config()?);

    let cache = Arc::new(SequenceTokenCache::new(client.clone()));
    let provisioner = Arc::new(ResourceProvisioner::new(
        client.clone(),
        cache.clone(),
        config.provisioning_config(),
    ));
    let engine = CommitEngine::new(client, cache, provisioner, clock.clone(), config.retry_policy())
        .with_cancellation(cancel.clone());
    let dispatcher = Dispatcher::new(Arc::new(engine), config.concurrency, config.batch_limits());

    let (service, buffer) = BufferService::new(config.buffer_capacity);
    tokio::spawn(service.run());

    let reader = tokio::spawn(read_records(
        buffer.clone(),
        formatter,
        clock,
        cancel.clone(),
        stop_on_eof,
    ));
    let flusher = tokio::spawn(flush_loop(
        buffer.clone(),
        dispatcher.clone(),
        config.flush_interval,
        cancel,
    ));

    Ok(Output {
        buffer,
        dispatcher,
        reader,
        flusher,
    })
}

/// Reads JSON lines from stdin into the buffer until cancelled or closed.
async fn read_records(
    buffer: BufferHandle,
    formatter: RecordFormatter,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    stop_on_eof: bool,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("stdin closed");
                if stop_on_eof {
                    cancel.cancel();
                }
                break;
            }
            Err(err) => {
                error!("failed to read stdin: {err}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (tag, time_ms, record) = match parse_line(&line, clock.now_millis()) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("skipping input line: {err}");
                continue;
            }
        };
        if let Some(entry) = formatter.format(&tag, time_ms, record) {
            if buffer.insert_batch(vec![entry]).is_err() {
                error!("record buffer closed, stopping stdin reader");
                break;
            }
        }
    }
}

async fn flush_loop(
    buffer: BufferHandle,
    dispatcher: Dispatcher,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick is immediate
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        flush(&buffer, &dispatcher).await;
    }
}

async fn flush(buffer: &BufferHandle, dispatcher: &Dispatcher) {
    let entries = match buffer.drain().await {
        Ok(entries) => entries,
        Err(err) => {
            error!("{err}");
            return;
        }
    };
    if entries.is_empty() {
        return;
    }

    let report = dispatcher.dispatch(entries).await;
    debug!(
        committed = report.committed,
        skipped = report.skipped,
        dropped = report.dropped,
        interrupted = report.interrupted,
        "flushed records"
    );
    for (key, err) in report.failed {
        error!(group = %key.group, stream = %key.stream, "failed to commit records: {err}");
    }
}

/// Accepts `{"tag", "time", "record"}` envelopes or bare records.
fn parse_line(line: &str, now_ms: i64) -> Result<(String, i64, Record), String> {
    let value: Value = serde_json::from_str(line).map_err(|e| format!("invalid JSON: {e}"))?;
    let Value::Object(mut object) = value else {
        return Err("not a JSON object".to_string());
    };

    match object.remove("record") {
        Some(Value::Object(record)) => {
            let tag = object
                .get("tag")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_TAG)
                .to_string();
            let time_ms = object.get("time").and_then(Value::as_i64).unwrap_or(now_ms);
            Ok((tag, time_ms, record))
        }
        other => {
            if let Some(other) = other {
                object.insert("record".to_string(), other);
            }
            Ok((DEFAULT_TAG.to_string(), now_ms, object))
        }
    }
}

fn envelope(tag: String, time_ms: i64, record: Record) -> Value {
    let mut object = Record::new();
    object.insert("tag".to_string(), Value::String(tag));
    object.insert("time".to_string(), time_ms.into());
    object.insert("record".to_string(), Value::Object(record));
    Value::Object(object)
}
