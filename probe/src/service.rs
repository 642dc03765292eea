use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};

use crate::api::{
    CancelResponse, FetchResult, InitializeResponse, ProducerResult, QueueStatusResponse,
    StartResponse, TestStatus,
};
use crate::directory::StreamDirectory;
use crate::error::{ProduceError, ServiceError};
use crate::kafka::consumer::ConsumerCmd;
use crate::kafka::producer::ProducerCmd;
use crate::scheduler::SchedulerMsg;
use crate::types::{EventEnvelope, TestId};

/// Default deadline on scheduler round-trips. The actor side never times
/// out on its own; expiry is surfaced to the caller as `Timeout`.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(25);

const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The DSL facade interface adapters call. Cheap to clone; every method is
/// a message to the scheduler or a directory lookup plus a message to a
/// streaming worker.
#[derive(Clone)]
pub struct ProbeHandle {
    scheduler: mpsc::UnboundedSender<SchedulerMsg>,
    directory: Arc<StreamDirectory>,
    reply_timeout: Duration,
}

impl ProbeHandle {
    pub fn new(
        scheduler: mpsc::UnboundedSender<SchedulerMsg>,
        directory: Arc<StreamDirectory>,
    ) -> Self {
        Self {
            scheduler,
            directory,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerMsg,
    ) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.scheduler
            .send(build(tx))
            .map_err(|_| ServiceError::Unavailable)?;
        match timeout(self.reply_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ServiceError::Unavailable),
            Err(_) => Err(ServiceError::Timeout(self.reply_timeout)),
        }
    }

    /// Registers a fresh test and returns the upload hint.
    pub async fn submit_test(&self) -> Result<InitializeResponse, ServiceError> {
        self.ask(|reply| SchedulerMsg::Submit { reply }).await?
    }

    pub async fn start_test(
        &self,
        test_id: TestId,
        bucket: impl Into<String>,
        test_type: Option<String>,
    ) -> Result<StartResponse, ServiceError> {
        let bucket = bucket.into();
        self.ask(|reply| SchedulerMsg::Start {
            test_id,
            bucket,
            test_type,
            reply,
        })
        .await?
    }

    pub async fn get_status(&self, test_id: TestId) -> Result<TestStatus, ServiceError> {
        self.ask(|reply| SchedulerMsg::Status { test_id, reply })
            .await?
    }

    pub async fn cancel_test(&self, test_id: TestId) -> Result<CancelResponse, ServiceError> {
        self.ask(|reply| SchedulerMsg::Cancel { test_id, reply })
            .await?
    }

    pub async fn queue_status(
        &self,
        test_id: Option<TestId>,
    ) -> Result<QueueStatusResponse, ServiceError> {
        self.ask(|reply| SchedulerMsg::QueueStatus { test_id, reply })
            .await
    }

    /// Publishes one event through the test's producer stream and awaits
    /// the broker ack. Kafka-level failures come back as a nack, not an
    /// error; only an unregistered stream or a lost worker is an error.
    pub async fn produce_event(
        &self,
        test_id: TestId,
        topic: &str,
        envelope: EventEnvelope,
    ) -> Result<ProducerResult, ServiceError> {
        let receiver = self.produce_event_nowait(test_id, topic, envelope)?;
        match timeout(self.reply_timeout, receiver).await {
            Ok(Ok(Ok(()))) => Ok(ProducerResult::Acked),
            Ok(Ok(Err(err))) => Ok(ProducerResult::Nacked {
                detail: err.to_string(),
            }),
            Ok(Err(_)) => Err(ServiceError::Unavailable),
            Err(_) => Err(ServiceError::Timeout(self.reply_timeout)),
        }
    }

    /// Fire-and-collect variant: dispatches the event and hands back the
    /// ack channel for the caller to await (or drop).
    pub fn produce_event_nowait(
        &self,
        test_id: TestId,
        topic: &str,
        envelope: EventEnvelope,
    ) -> Result<oneshot::Receiver<Result<(), ProduceError>>, ServiceError> {
        let producer =
            self.directory
                .producer(test_id, topic)
                .ok_or_else(|| ServiceError::NotRegistered {
                    test_id,
                    topic: topic.to_string(),
                })?;
        let (reply, receiver) = oneshot::channel();
        producer
            .send(ProducerCmd::Produce { envelope, reply })
            .map_err(|_| ServiceError::NotRegistered {
                test_id,
                topic: topic.to_string(),
            })?;
        Ok(receiver)
    }

    /// Looks up a consumed event by correlation id, polling the worker's
    /// registry until `wait` elapses. A zero wait surfaces the immediate
    /// nack; a positive wait that never sees the event times out.
    pub async fn fetch_consumed_event(
        &self,
        test_id: TestId,
        topic: &str,
        correlation_id: &str,
        wait: Duration,
    ) -> Result<FetchResult, ServiceError> {
        let consumer =
            self.directory
                .consumer(test_id, topic)
                .ok_or_else(|| ServiceError::NotRegistered {
                    test_id,
                    topic: topic.to_string(),
                })?;
        let deadline = Instant::now() + wait;
        loop {
            let (reply, receiver) = oneshot::channel();
            if consumer
                .send(ConsumerCmd::Fetch {
                    correlation_id: correlation_id.to_string(),
                    reply,
                })
                .is_err()
            {
                return Ok(FetchResult::Nack);
            }
            match timeout(self.reply_timeout, receiver).await {
                Ok(Ok(Some(envelope))) => return Ok(FetchResult::Ack(envelope)),
                Ok(Ok(None)) => {}
                Ok(Err(_)) => return Ok(FetchResult::Nack),
                Err(_) => return Err(ServiceError::Timeout(self.reply_timeout)),
            }
            if Instant::now() >= deadline {
                return Ok(if wait.is_zero() {
                    FetchResult::Nack
                } else {
                    FetchResult::TimedOut
                });
            }
            sleep(FETCH_POLL_INTERVAL).await;
        }
    }
}
