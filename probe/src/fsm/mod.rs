use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::api::{CancelResponse, InitializeResponse, StartResponse, TestStatus, TestStatusError};
use crate::error::{ServiceError, TestFailure};
use crate::scheduler::{ProbeDeps, SchedulerMsg, TestEvent};
use crate::storage::BlockStorageDirective;
use crate::types::{
    KafkaSecurityDirective, TestExecutionResult, TestId, TestState, TopicRole,
};

pub mod children;

use children::{BddCmd, LoaderCmd, PoolCmd, VaultCmd};

/// The five supervised children, by the names used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildName {
    BlockStorage,
    Vault,
    Bdd,
    Producer,
    Consumer,
}

impl ChildName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildName::BlockStorage => "BlockStorage",
            ChildName::Vault => "Vault",
            ChildName::Bdd => "BDD",
            ChildName::Producer => "Producer",
            ChildName::Consumer => "Consumer",
        }
    }
}

impl fmt::Display for ChildName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CHILD_COUNT: usize = 5;

pub enum FsmMsg {
    // From the scheduler, on behalf of callers
    Init {
        reply: oneshot::Sender<Result<InitializeResponse, ServiceError>>,
    },
    Start {
        bucket: String,
        test_type: Option<String>,
        reply: oneshot::Sender<Result<StartResponse, ServiceError>>,
    },
    GetStatus {
        reply: oneshot::Sender<Result<TestStatus, ServiceError>>,
    },
    Cancel {
        reply: oneshot::Sender<Result<CancelResponse, ServiceError>>,
    },
    StartTesting,
    // From children
    StorageLoaded {
        directive: BlockStorageDirective,
    },
    CredentialsIssued {
        directives: Vec<KafkaSecurityDirective>,
    },
    ChildReady {
        child: ChildName,
    },
    ChildFailed {
        child: ChildName,
        failure: TestFailure,
    },
    BddComplete {
        result: TestExecutionResult,
    },
    EvidenceUploaded {
        key: String,
    },
    // Internal
    Transitioned {
        state: TestState,
    },
    DeadlineExpired,
    CleanupExpired,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Default)]
struct Children {
    loader: Option<mpsc::UnboundedSender<LoaderCmd>>,
    vault: Option<mpsc::UnboundedSender<VaultCmd>>,
    bdd: Option<mpsc::UnboundedSender<BddCmd>>,
    producers: Option<mpsc::UnboundedSender<PoolCmd>>,
    consumers: Option<mpsc::UnboundedSender<PoolCmd>>,
}

impl Children {
    fn broadcast_stop(&self) {
        if let Some(loader) = &self.loader {
            _ = loader.send(LoaderCmd::Stop);
        }
        if let Some(vault) = &self.vault {
            _ = vault.send(VaultCmd::Stop);
        }
        if let Some(bdd) = &self.bdd {
            _ = bdd.send(BddCmd::Stop);
        }
        if let Some(producers) = &self.producers {
            _ = producers.send(PoolCmd::Stop);
        }
        if let Some(consumers) = &self.consumers {
            _ = consumers.send(PoolCmd::Stop);
        }
    }
}

/// Per-test lifecycle machine. One tokio task, one FIFO mailbox; every
/// reaction to a message completes before the next is taken, which is what
/// makes the deferred self-sent `Transitioned` hook the first thing
/// processed in a new state.
pub struct TestExecutionFsm {
    test_id: TestId,
    state: TestState,
    deps: Arc<ProbeDeps>,
    scheduler: mpsc::UnboundedSender<SchedulerMsg>,
    tx: mpsc::UnboundedSender<FsmMsg>,

    bucket: Option<String>,
    test_type: Option<String>,
    start_request_time: Option<OffsetDateTime>,
    start_time: Option<OffsetDateTime>,
    end_time: Option<OffsetDateTime>,
    success: Option<bool>,
    failure: Option<TestFailure>,
    directive: Option<BlockStorageDirective>,
    result: Option<TestExecutionResult>,
    evidence_key: Option<String>,

    children: Children,
    tasks: JoinSet<ChildName>,
    ready: HashSet<ChildName>,
    loader_initialized: bool,
    cancel_waiters: Vec<oneshot::Sender<Result<CancelResponse, ServiceError>>>,
    deadline: Option<JoinHandle<()>>,
}

impl TestExecutionFsm {
    /// Builds the machine and returns its mailbox plus the future the
    /// scheduler spawns, so the scheduler can observe termination.
    pub fn build(
        test_id: TestId,
        deps: Arc<ProbeDeps>,
        scheduler: mpsc::UnboundedSender<SchedulerMsg>,
    ) -> (mpsc::UnboundedSender<FsmMsg>, impl Future<Output = ()> + Send) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fsm = Self {
            test_id,
            state: TestState::Setup,
            deps,
            scheduler,
            tx: tx.clone(),
            bucket: None,
            test_type: None,
            start_request_time: None,
            start_time: None,
            end_time: None,
            success: None,
            failure: None,
            directive: None,
            result: None,
            evidence_key: None,
            children: Children::default(),
            tasks: JoinSet::new(),
            ready: HashSet::new(),
            loader_initialized: false,
            cancel_waiters: Vec::new(),
            deadline: None,
        };
        (tx, fsm.run(rx))
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<FsmMsg>) {
        self.arm_deadline();
        loop {
            let flow = tokio::select! {
                msg = mailbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => Flow::Stop,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.handle_child_exit(joined)
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        for waiter in self.cancel_waiters.drain(..) {
            _ = waiter.send(Ok(CancelResponse {
                test_id: self.test_id,
                cancelled: true,
            }));
        }
        info!(test_id = %self.test_id, "test fsm terminated");
    }

    fn handle(&mut self, msg: FsmMsg) -> Flow {
        match msg {
            FsmMsg::Init { reply } => {
                self.notify(TestEvent::Initialized);
                let hint = format!(
                    "upload feature files to {}/{}/ and call start",
                    self.deps.config.storage.storage_bucket, self.test_id
                );
                _ = reply.send(Ok(InitializeResponse {
                    test_id: self.test_id,
                    message: hint,
                }));
                self.transition(TestState::Loading);
                Flow::Continue
            }
            FsmMsg::Start {
                bucket,
                test_type,
                reply,
            } => {
                if self.bucket.is_none() {
                    self.bucket = Some(bucket);
                    self.test_type = test_type;
                    self.start_request_time = Some(OffsetDateTime::now_utc());
                }
                _ = reply.send(Ok(StartResponse {
                    test_id: self.test_id,
                    accepted: true,
                    message: "queued for execution once loaded".to_string(),
                }));
                self.maybe_initialize_loader();
                Flow::Continue
            }
            FsmMsg::GetStatus { reply } => {
                _ = reply.send(Ok(self.snapshot()));
                Flow::Continue
            }
            FsmMsg::Cancel { reply } => {
                if self.state == TestState::ShuttingDown && self.tasks.is_empty() {
                    _ = reply.send(Ok(CancelResponse {
                        test_id: self.test_id,
                        cancelled: true,
                    }));
                    return Flow::Continue;
                }
                self.cancel_waiters.push(reply);
                info!(test_id = %self.test_id, "cancel requested");
                self.transition(TestState::ShuttingDown);
                Flow::Continue
            }
            FsmMsg::StartTesting => {
                if self.state == TestState::Loaded {
                    self.transition(TestState::Testing);
                } else {
                    debug!(test_id = %self.test_id, state = %self.state, "start-testing ignored");
                }
                Flow::Continue
            }
            FsmMsg::StorageLoaded { directive } => {
                if self.state != TestState::Loading {
                    debug!(test_id = %self.test_id, "late storage directive dropped");
                    return Flow::Continue;
                }
                self.directive = Some(directive.clone());
                self.mark_ready(ChildName::BlockStorage);
                self.spawn_vault(directive);
                Flow::Continue
            }
            FsmMsg::CredentialsIssued { directives } => {
                if self.state != TestState::Loading {
                    debug!(test_id = %self.test_id, "late credentials dropped");
                    return Flow::Continue;
                }
                self.mark_ready(ChildName::Vault);
                self.spawn_streaming_children(directives);
                Flow::Continue
            }
            FsmMsg::ChildReady { child } => {
                self.mark_ready(child);
                Flow::Continue
            }
            FsmMsg::ChildFailed { child, failure } => {
                if self.state == TestState::ShuttingDown {
                    debug!(test_id = %self.test_id, child = %child, "child failure during shutdown ignored");
                    return Flow::Continue;
                }
                error!(test_id = %self.test_id, child = %child, "child failed: {}", failure.message);
                self.failure = Some(failure);
                self.transition(TestState::Exception);
                Flow::Continue
            }
            FsmMsg::BddComplete { result } => {
                if self.state == TestState::Testing {
                    self.success = Some(result.passed);
                    self.result = Some(result);
                    self.transition(TestState::Completed);
                }
                Flow::Continue
            }
            FsmMsg::EvidenceUploaded { key } => {
                if self.state == TestState::Completed {
                    self.evidence_key = Some(key);
                    self.transition(TestState::ShuttingDown);
                }
                Flow::Continue
            }
            FsmMsg::Transitioned { state } => self.entered(state),
            FsmMsg::DeadlineExpired => {
                if self.state != TestState::ShuttingDown {
                    warn!(test_id = %self.test_id, state = %self.state, "poison pill fired");
                    self.transition(TestState::ShuttingDown);
                }
                Flow::Continue
            }
            FsmMsg::CleanupExpired => {
                if self.state == TestState::Exception {
                    self.transition(TestState::ShuttingDown);
                }
                Flow::Continue
            }
        }
    }

    /// Post-transition hook, guaranteed to be the next message processed
    /// after the state switch.
    fn entered(&mut self, state: TestState) -> Flow {
        if state != self.state {
            // A later transition (e.g. Cancel) won the race; its own hook follows
            return Flow::Continue;
        }
        match state {
            TestState::Setup => Flow::Continue,
            TestState::Loading => {
                self.notify(TestEvent::Loading);
                self.spawn_loader();
                self.maybe_initialize_loader();
                Flow::Continue
            }
            TestState::Loaded => {
                self.notify(TestEvent::Loaded);
                Flow::Continue
            }
            TestState::Testing => {
                self.start_time = Some(OffsetDateTime::now_utc());
                self.notify(TestEvent::Started);
                if let Some(bdd) = &self.children.bdd {
                    _ = bdd.send(BddCmd::Start);
                }
                Flow::Continue
            }
            TestState::Completed => {
                self.end_time = Some(OffsetDateTime::now_utc());
                let success = self.success.unwrap_or(false);
                self.notify(TestEvent::Completed { success });
                self.arm_deadline();
                match (&self.children.loader, &self.directive, &self.result) {
                    (Some(loader), Some(directive), Some(result)) => {
                        _ = loader.send(LoaderCmd::UploadEvidence {
                            directive: directive.clone(),
                            result: result.clone(),
                        });
                    }
                    _ => {
                        self.failure = Some(TestFailure::internal(
                            "completed without a loader to upload evidence",
                        ));
                        self.transition(TestState::Exception);
                    }
                }
                Flow::Continue
            }
            TestState::Exception => {
                let kind = self
                    .failure
                    .as_ref()
                    .map(|f| f.kind)
                    .unwrap_or(crate::error::FailureKind::Internal);
                self.notify(TestEvent::Exception { kind });
                let cleanup = Duration::from_millis(self.deps.config.exception_cleanup_ms);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(cleanup).await;
                    _ = tx.send(FsmMsg::CleanupExpired);
                });
                Flow::Continue
            }
            TestState::ShuttingDown => {
                self.notify(TestEvent::Stopping);
                if let Some(deadline) = self.deadline.take() {
                    deadline.abort();
                }
                self.children.broadcast_stop();
                if self.tasks.is_empty() {
                    return Flow::Stop;
                }
                Flow::Continue
            }
        }
    }

    fn handle_child_exit(
        &mut self,
        joined: Result<ChildName, tokio::task::JoinError>,
    ) -> Flow {
        match joined {
            Ok(child) => {
                debug!(test_id = %self.test_id, child = %child, "child terminated");
                match self.state {
                    TestState::ShuttingDown => {
                        if self.tasks.is_empty() {
                            return Flow::Stop;
                        }
                        Flow::Continue
                    }
                    TestState::Exception => Flow::Continue,
                    _ => {
                        warn!(test_id = %self.test_id, child = %child, "unexpected child termination");
                        self.failure = Some(TestFailure::internal(format!(
                            "child {child} terminated unexpectedly"
                        )));
                        self.transition(TestState::Exception);
                        Flow::Continue
                    }
                }
            }
            Err(join_err) => {
                error!(test_id = %self.test_id, "child task panicked: {join_err}");
                if self.state == TestState::ShuttingDown {
                    if self.tasks.is_empty() {
                        return Flow::Stop;
                    }
                    return Flow::Continue;
                }
                self.failure = Some(TestFailure::internal("child task panicked"));
                self.transition(TestState::Exception);
                Flow::Continue
            }
        }
    }

    fn transition(&mut self, next: TestState) {
        if !self.state.may_advance_to(next) {
            debug!(test_id = %self.test_id, from = %self.state, to = %next, "transition rejected");
            return;
        }
        info!(test_id = %self.test_id, from = %self.state, to = %next, "state transition");
        self.state = next;
        // Deferred self-message: the hook runs as the next message in the
        // new state, never synchronously inside the old one
        _ = self.tx.send(FsmMsg::Transitioned { state: next });
    }

    fn mark_ready(&mut self, child: ChildName) {
        if !self.ready.insert(child) {
            warn!(test_id = %self.test_id, child = %child, "duplicate ready report");
            return;
        }
        debug!(test_id = %self.test_id, child = %child, ready = self.ready.len(), "child ready");
        if self.ready.len() == CHILD_COUNT && self.state == TestState::Loading {
            self.transition(TestState::Loaded);
        }
    }

    fn maybe_initialize_loader(&mut self) {
        if self.state != TestState::Loading || self.loader_initialized {
            return;
        }
        let (Some(loader), Some(bucket)) = (&self.children.loader, &self.bucket) else {
            return;
        };
        _ = loader.send(LoaderCmd::Initialize {
            bucket: bucket.clone(),
        });
        self.loader_initialized = true;
    }

    fn spawn_loader(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks.spawn(children::run_loader(
            self.test_id,
            self.deps.storage.clone(),
            self.tx.clone(),
            rx,
        ));
        self.children.loader = Some(tx);
    }

    fn spawn_vault(&mut self, directive: BlockStorageDirective) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tasks.spawn(children::run_vault(
            self.deps.broker.clone(),
            self.tx.clone(),
            rx,
        ));
        _ = tx.send(VaultCmd::Initialize {
            directives: directive.topic_directives,
        });
        self.children.vault = Some(tx);
    }

    /// Third loading step: BDD runner and both streaming pools come up
    /// concurrently once credentials exist.
    fn spawn_streaming_children(&mut self, securities: Vec<KafkaSecurityDirective>) {
        let Some(directive) = self.directive.clone() else {
            self.failure = Some(TestFailure::internal(
                "credentials issued before storage directive",
            ));
            self.transition(TestState::Exception);
            return;
        };

        let (bdd_tx, bdd_rx) = mpsc::unbounded_channel();
        self.tasks.spawn(children::run_bdd(
            self.deps.engine.clone(),
            directive.clone(),
            self.test_id,
            self.deps.directory.clone(),
            self.tx.clone(),
            bdd_rx,
        ));
        self.children.bdd = Some(bdd_tx);

        let producer_assignments: Vec<KafkaSecurityDirective> = securities
            .iter()
            .filter(|s| s.role == TopicRole::Producer)
            .cloned()
            .collect();
        let (producer_tx, producer_rx) = mpsc::unbounded_channel();
        self.tasks.spawn(children::run_producer_pool(
            self.test_id,
            self.deps.config.kafka.clone(),
            producer_assignments,
            self.deps.directory.clone(),
            self.tx.clone(),
            producer_rx,
        ));
        self.children.producers = Some(producer_tx);

        let consumer_assignments: Vec<_> = directive
            .topic_directives
            .iter()
            .zip(securities.iter())
            .filter(|(d, _)| d.role == TopicRole::Consumer)
            .map(|(d, s)| (d.clone(), s.clone()))
            .collect();
        let (consumer_tx, consumer_rx) = mpsc::unbounded_channel();
        self.tasks.spawn(children::run_consumer_pool(
            self.test_id,
            self.deps.config.kafka.clone(),
            consumer_assignments,
            self.deps.directory.clone(),
            self.tx.clone(),
            consumer_rx,
        ));
        self.children.consumers = Some(consumer_tx);
    }

    /// The poison pill: armed on entry to Setup and re-armed at Completed.
    /// Loaded waits indefinitely for promotion and Testing may run long, so
    /// neither arms its own timer.
    fn arm_deadline(&mut self) {
        if let Some(previous) = self.deadline.take() {
            previous.abort();
        }
        let deadline = Duration::from_millis(self.deps.config.poison_pill_ms);
        let tx = self.tx.clone();
        self.deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            _ = tx.send(FsmMsg::DeadlineExpired);
        }));
    }

    fn snapshot(&self) -> TestStatus {
        TestStatus {
            test_id: self.test_id,
            state: self.state,
            bucket: self.bucket.clone(),
            test_type: self.test_type.clone(),
            start_request_time: self.start_request_time,
            start_time: self.start_time,
            end_time: self.end_time,
            success: self.success,
            error: self.failure.as_ref().map(|f| TestStatusError {
                kind: f.kind.as_str().to_string(),
                message: f.message.clone(),
            }),
            result: self.result.clone(),
            evidence_key: self.evidence_key.clone(),
        }
    }

    fn notify(&self, event: TestEvent) {
        _ = self.scheduler.send(SchedulerMsg::TestEvent {
            test_id: self.test_id,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::directory::StreamDirectory;
    use crate::bdd::DryRunEngine;
    use crate::storage::MockObjectStorageClient;
    use crate::types::SecurityProtocol;
    use crate::vault::{CredentialBroker, CredentialsMapping, MockVaultClient};
    use bytes::Bytes;

    const MAPPING_YAML: &str = r#"
mappings:
  - targetField: clientId
    sourcePath: $.client_id
  - targetField: clientSecret
    sourcePath: $.client_secret
  - targetField: tokenEndpoint
    sourcePath: $.token_endpoint
"#;

    const MANIFEST_NO_TOPICS: &str = r#"{"topics": []}"#;
    const FEATURE: &str = "Feature: smoke\n\n  Scenario: one\n    Given nothing\n";

    fn storage_with_feature_tree(uploads: bool) -> MockObjectStorageClient {
        let mut storage = MockObjectStorageClient::new();
        storage.expect_list_keys().returning(|_, prefix| {
            Ok(vec![
                format!("{prefix}manifest.json"),
                format!("{prefix}features/smoke.feature"),
            ])
        });
        storage.expect_get_object().returning(|_, key| {
            if key.ends_with("manifest.json") {
                Ok(Bytes::from(MANIFEST_NO_TOPICS))
            } else {
                Ok(Bytes::from(FEATURE))
            }
        });
        if uploads {
            storage
                .expect_put_object()
                .times(1)
                .withf(|_, key, _| key.ends_with("/evidence.zip"))
                .returning(|_, _, _| Ok(()));
        } else {
            storage.expect_put_object().never();
        }
        storage
    }

    fn deps_with(storage: MockObjectStorageClient, config: crate::config::Config) -> Arc<ProbeDeps> {
        let mapping = CredentialsMapping::from_yaml(MAPPING_YAML).expect("mapping");
        let broker = CredentialBroker::new(
            Arc::new(MockVaultClient::new()),
            mapping,
            SecurityProtocol::Plaintext,
        );
        Arc::new(ProbeDeps {
            config: Arc::new(config),
            storage: Arc::new(storage),
            broker: Arc::new(broker),
            engine: Arc::new(DryRunEngine),
            directory: Arc::new(StreamDirectory::new()),
        })
    }

    struct Harness {
        fsm: mpsc::UnboundedSender<FsmMsg>,
        events: mpsc::UnboundedReceiver<SchedulerMsg>,
        task: tokio::task::JoinHandle<()>,
        test_id: TestId,
    }

    fn spawn_fsm(deps: Arc<ProbeDeps>) -> Harness {
        let (scheduler_tx, events) = mpsc::unbounded_channel();
        let test_id = TestId::new();
        let (fsm, fut) = TestExecutionFsm::build(test_id, deps, scheduler_tx);
        Harness {
            fsm,
            events,
            task: tokio::spawn(fut),
            test_id,
        }
    }

    async fn next_event(harness: &mut Harness) -> TestEvent {
        let msg = tokio::time::timeout(Duration::from_secs(5), harness.events.recv())
            .await
            .expect("timed out waiting for scheduler event")
            .expect("scheduler channel closed");
        match msg {
            SchedulerMsg::TestEvent { event, .. } => event,
            _ => panic!("unexpected scheduler message"),
        }
    }

    async fn ask<T: Send + 'static>(
        harness: &Harness,
        build: impl FnOnce(oneshot::Sender<Result<T, ServiceError>>) -> FsmMsg,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        harness.fsm.send(build(tx)).expect("fsm gone");
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("reply timed out")
            .expect("reply dropped")
            .expect("operation failed")
    }

    #[tokio::test]
    async fn happy_path_walks_the_full_lifecycle() {
        let deps = deps_with(storage_with_feature_tree(true), test_config());
        let mut harness = spawn_fsm(deps);

        let init: InitializeResponse = ask(&harness, |reply| FsmMsg::Init { reply }).await;
        assert_eq!(init.test_id, harness.test_id);
        assert!(init.message.contains(&harness.test_id.to_string()));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Initialized));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loading));

        let start: StartResponse = ask(&harness, |reply| FsmMsg::Start {
            bucket: "probe-tests".to_string(),
            test_type: Some("functional".to_string()),
            reply,
        })
        .await;
        assert!(start.accepted);
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loaded));

        harness.fsm.send(FsmMsg::StartTesting).expect("send");
        assert!(matches!(next_event(&mut harness).await, TestEvent::Started));
        match next_event(&mut harness).await {
            TestEvent::Completed { success } => assert!(success),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(matches!(next_event(&mut harness).await, TestEvent::Stopping));

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("fsm did not terminate")
            .expect("fsm task failed");
    }

    #[tokio::test]
    async fn status_snapshots_do_not_transition() {
        let deps = deps_with(storage_with_feature_tree(false), test_config());
        let mut harness = spawn_fsm(deps);

        ask::<InitializeResponse>(&harness, |reply| FsmMsg::Init { reply }).await;
        assert!(matches!(next_event(&mut harness).await, TestEvent::Initialized));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loading));

        let status: TestStatus = ask(&harness, |reply| FsmMsg::GetStatus { reply }).await;
        assert_eq!(status.state, TestState::Loading);
        assert_eq!(status.bucket, None);
        assert_eq!(status.success, None);

        let again: TestStatus = ask(&harness, |reply| FsmMsg::GetStatus { reply }).await;
        assert_eq!(again.state, TestState::Loading);
    }

    #[tokio::test]
    async fn storage_failure_flips_to_exception_then_stops() {
        let mut storage = MockObjectStorageClient::new();
        storage.expect_list_keys().returning(|bucket, prefix| {
            Err(crate::error::BlockStorageError::EmptyPrefix {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            })
        });
        storage.expect_put_object().never();

        let deps = deps_with(storage, test_config());
        let mut harness = spawn_fsm(deps);

        ask::<InitializeResponse>(&harness, |reply| FsmMsg::Init { reply }).await;
        ask::<StartResponse>(&harness, |reply| FsmMsg::Start {
            bucket: "probe-tests".to_string(),
            test_type: None,
            reply,
        })
        .await;

        assert!(matches!(next_event(&mut harness).await, TestEvent::Initialized));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loading));
        match next_event(&mut harness).await {
            TestEvent::Exception { kind } => {
                assert_eq!(kind, crate::error::FailureKind::BlockStorage);
            }
            other => panic!("expected exception, got {other:?}"),
        }
        assert!(matches!(next_event(&mut harness).await, TestEvent::Stopping));

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("fsm did not terminate")
            .expect("fsm task failed");
    }

    #[tokio::test]
    async fn streaming_children_fail_fast_without_a_published_codec() {
        // The process-wide codec is deliberately left unpublished: worker
        // start-up must fail the child before any Kafka client is built
        const MANIFEST_ONE_PRODUCER: &str =
            r#"{"topics": [{"topic": "orders", "role": "PRODUCER", "clientPrincipal": "svc-probe"}]}"#;

        let mut storage = MockObjectStorageClient::new();
        storage.expect_list_keys().returning(|_, prefix| {
            Ok(vec![
                format!("{prefix}manifest.json"),
                format!("{prefix}features/smoke.feature"),
            ])
        });
        storage.expect_get_object().returning(|_, key| {
            if key.ends_with("manifest.json") {
                Ok(Bytes::from(MANIFEST_ONE_PRODUCER))
            } else {
                Ok(Bytes::from(FEATURE))
            }
        });
        storage.expect_put_object().never();

        let deps = deps_with(storage, test_config());
        let mut harness = spawn_fsm(deps);

        ask::<InitializeResponse>(&harness, |reply| FsmMsg::Init { reply }).await;
        ask::<StartResponse>(&harness, |reply| FsmMsg::Start {
            bucket: "probe-tests".to_string(),
            test_type: None,
            reply,
        })
        .await;

        assert!(matches!(next_event(&mut harness).await, TestEvent::Initialized));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loading));
        match next_event(&mut harness).await {
            TestEvent::Exception { kind } => {
                assert_eq!(kind, crate::error::FailureKind::Producer);
            }
            other => panic!("expected exception, got {other:?}"),
        }
        assert!(matches!(next_event(&mut harness).await, TestEvent::Stopping));

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("fsm did not terminate")
            .expect("fsm task failed");
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_skips_evidence() {
        let deps = deps_with(storage_with_feature_tree(false), test_config());
        let mut harness = spawn_fsm(deps);

        ask::<InitializeResponse>(&harness, |reply| FsmMsg::Init { reply }).await;
        ask::<StartResponse>(&harness, |reply| FsmMsg::Start {
            bucket: "probe-tests".to_string(),
            test_type: None,
            reply,
        })
        .await;
        assert!(matches!(next_event(&mut harness).await, TestEvent::Initialized));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loading));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loaded));

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        harness.fsm.send(FsmMsg::Cancel { reply: first_tx }).expect("send");
        harness.fsm.send(FsmMsg::Cancel { reply: second_tx }).expect("send");

        let first = first_rx.await.expect("first reply").expect("first cancel");
        let second = second_rx.await.expect("second reply").expect("second cancel");
        assert!(first.cancelled);
        assert!(second.cancelled);

        // Exactly one Stopping event despite the double cancel
        assert!(matches!(next_event(&mut harness).await, TestEvent::Stopping));
        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("fsm did not terminate")
            .expect("fsm task failed");
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn poison_pill_forces_shutdown() {
        let mut config = test_config();
        config.poison_pill_ms = 50;
        let mut storage = MockObjectStorageClient::new();
        storage.expect_put_object().never();
        let deps = deps_with(storage, config);
        let mut harness = spawn_fsm(deps);

        // Init but never Start: the test would sit in Loading forever
        ask::<InitializeResponse>(&harness, |reply| FsmMsg::Init { reply }).await;
        assert!(matches!(next_event(&mut harness).await, TestEvent::Initialized));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Loading));
        assert!(matches!(next_event(&mut harness).await, TestEvent::Stopping));

        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .expect("fsm did not terminate")
            .expect("fsm task failed");
    }
}
