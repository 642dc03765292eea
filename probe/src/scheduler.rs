use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::{
    CancelResponse, InitializeResponse, QueueStatusResponse, StartResponse, TestStatus,
};
use crate::bdd::BddEngine;
use crate::config::Config;
use crate::directory::StreamDirectory;
use crate::error::{FailureKind, ServiceError};
use crate::fsm::{FsmMsg, TestExecutionFsm};
use crate::health::HealthHandle;
use crate::storage::ObjectStorageClient;
use crate::types::{TestId, TestState};
use crate::vault::CredentialBroker;

/// Shared wiring every test FSM needs: validated configuration plus the
/// boot-time clients. Built once by the lifecycle supervisor.
pub struct ProbeDeps {
    pub config: Arc<Config>,
    pub storage: Arc<dyn ObjectStorageClient>,
    pub broker: Arc<CredentialBroker>,
    pub engine: Arc<dyn BddEngine>,
    pub directory: Arc<StreamDirectory>,
}

/// Lifecycle notifications the FSMs push to the scheduler, unsolicited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestEvent {
    Initialized,
    Loading,
    Loaded,
    Started,
    Completed { success: bool },
    Exception { kind: FailureKind },
    Stopping,
}

pub enum SchedulerMsg {
    Submit {
        reply: oneshot::Sender<Result<InitializeResponse, ServiceError>>,
    },
    Start {
        test_id: TestId,
        bucket: String,
        test_type: Option<String>,
        reply: oneshot::Sender<Result<StartResponse, ServiceError>>,
    },
    Status {
        test_id: TestId,
        reply: oneshot::Sender<Result<TestStatus, ServiceError>>,
    },
    Cancel {
        test_id: TestId,
        reply: oneshot::Sender<Result<CancelResponse, ServiceError>>,
    },
    QueueStatus {
        test_id: Option<TestId>,
        reply: oneshot::Sender<QueueStatusResponse>,
    },
    TestEvent {
        test_id: TestId,
        event: TestEvent,
    },
}

struct TestEntry {
    fsm: mpsc::UnboundedSender<FsmMsg>,
    state: TestState,
    bucket: Option<String>,
    test_type: Option<String>,
    start_request_time: Option<OffsetDateTime>,
    success: Option<bool>,
    error: Option<FailureKind>,
}

/// The sole coordinator of test admission, ordering and single-runner
/// enforcement. One tokio task; every registry mutation happens inside its
/// loop, which is what upholds the at-most-one-Testing invariant.
pub struct QueueScheduler {
    deps: Arc<ProbeDeps>,
    tx: mpsc::UnboundedSender<SchedulerMsg>,
    entries: HashMap<TestId, TestEntry>,
    pending: VecDeque<TestId>,
    current: Option<TestId>,
    fsm_tasks: JoinSet<TestId>,
    liveness: Option<HealthHandle>,
    submitted_total: u64,
    completed_total: u64,
    exception_total: u64,
}

impl QueueScheduler {
    pub fn spawn(
        deps: Arc<ProbeDeps>,
        liveness: Option<HealthHandle>,
    ) -> mpsc::UnboundedSender<SchedulerMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            deps,
            tx: tx.clone(),
            entries: HashMap::new(),
            pending: VecDeque::new(),
            current: None,
            fsm_tasks: JoinSet::new(),
            liveness,
            submitted_total: 0,
            completed_total: 0,
            exception_total: 0,
        };
        tokio::spawn(scheduler.run(rx));
        tx
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<SchedulerMsg>) {
        info!("queue scheduler up");
        let mut heartbeat = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                msg = mailbox.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                Some(done) = self.fsm_tasks.join_next(), if !self.fsm_tasks.is_empty() => {
                    self.handle_fsm_exit(done);
                }
                _ = heartbeat.tick() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy().await;
                    }
                }
            }
        }
        info!("queue scheduler down");
    }

    fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::Submit { reply } => self.submit(reply),
            SchedulerMsg::Start {
                test_id,
                bucket,
                test_type,
                reply,
            } => self.start(test_id, bucket, test_type, reply),
            SchedulerMsg::Status { test_id, reply } => {
                match self.entries.get(&test_id) {
                    Some(entry) => {
                        // The FSM replies straight to the caller with its snapshot
                        _ = entry.fsm.send(FsmMsg::GetStatus { reply });
                    }
                    None => {
                        _ = reply.send(Err(ServiceError::NotFound(test_id)));
                    }
                }
            }
            SchedulerMsg::Cancel { test_id, reply } => match self.entries.get(&test_id) {
                Some(entry) => {
                    _ = entry.fsm.send(FsmMsg::Cancel { reply });
                }
                None => {
                    _ = reply.send(Err(ServiceError::NotFound(test_id)));
                }
            },
            SchedulerMsg::QueueStatus { test_id, reply } => {
                // The per-test filter is advisory; the aggregate view answers it
                if let Some(filter) = test_id {
                    debug!(%filter, "queue status filter ignored");
                }
                _ = reply.send(self.queue_status());
            }
            SchedulerMsg::TestEvent { test_id, event } => self.observe(test_id, event),
        }
    }

    fn submit(&mut self, reply: oneshot::Sender<Result<InitializeResponse, ServiceError>>) {
        if self.entries.len() >= self.deps.config.queue_capacity {
            counter!("probe_scheduler_rejected_total").increment(1);
            _ = reply.send(Err(ServiceError::QueueFull));
            return;
        }

        let test_id = TestId::new();
        let (fsm, fut) = TestExecutionFsm::build(test_id, self.deps.clone(), self.tx.clone());
        self.fsm_tasks.spawn(async move {
            fut.await;
            test_id
        });
        self.entries.insert(
            test_id,
            TestEntry {
                fsm: fsm.clone(),
                state: TestState::Setup,
                bucket: None,
                test_type: None,
                start_request_time: None,
                success: None,
                error: None,
            },
        );
        self.submitted_total += 1;
        counter!("probe_scheduler_submitted_total").increment(1);
        info!(%test_id, registered = self.entries.len(), "test registered");

        // The FSM answers the caller with the upload hint
        _ = fsm.send(FsmMsg::Init { reply });
    }

    fn start(
        &mut self,
        test_id: TestId,
        bucket: String,
        test_type: Option<String>,
        reply: oneshot::Sender<Result<StartResponse, ServiceError>>,
    ) {
        let Some(entry) = self.entries.get_mut(&test_id) else {
            _ = reply.send(Err(ServiceError::NotFound(test_id)));
            return;
        };
        entry.bucket = Some(bucket.clone());
        entry.test_type = test_type.clone();
        entry.start_request_time = Some(OffsetDateTime::now_utc());
        _ = entry.fsm.send(FsmMsg::Start {
            bucket,
            test_type,
            reply,
        });
    }

    fn observe(&mut self, test_id: TestId, event: TestEvent) {
        let Some(entry) = self.entries.get_mut(&test_id) else {
            debug!(%test_id, ?event, "event for unknown test dropped");
            return;
        };

        let next_state = match event {
            TestEvent::Initialized => TestState::Setup,
            TestEvent::Loading => TestState::Loading,
            TestEvent::Loaded => TestState::Loaded,
            TestEvent::Started => TestState::Testing,
            TestEvent::Completed { .. } => TestState::Completed,
            TestEvent::Exception { .. } => TestState::Exception,
            TestEvent::Stopping => TestState::ShuttingDown,
        };
        if entry.state != next_state {
            if !entry.state.may_advance_to(next_state) {
                debug!(%test_id, from = %entry.state, to = %next_state, "stale event dropped");
                return;
            }
            entry.state = next_state;
        }
        match event {
            TestEvent::Completed { success } => entry.success = Some(success),
            TestEvent::Exception { kind } => entry.error = Some(kind),
            _ => {}
        }

        match event {
            TestEvent::Loaded => {
                self.pending.push_back(test_id);
                self.process_queue();
            }
            TestEvent::Completed { .. } => {
                self.completed_total += 1;
                self.clear_current_and_promote(test_id);
            }
            TestEvent::Exception { .. } => {
                self.exception_total += 1;
                self.clear_current_and_promote(test_id);
            }
            TestEvent::Stopping => self.clear_current_and_promote(test_id),
            _ => {}
        }
    }

    fn clear_current_and_promote(&mut self, test_id: TestId) {
        if self.current == Some(test_id) {
            self.current = None;
        }
        self.process_queue();
    }

    /// Promotion: when no test is running, the head of the pending queue
    /// that is still in `Loaded` becomes the current test.
    fn process_queue(&mut self) {
        if self.current.is_some() {
            return;
        }
        while let Some(test_id) = self.pending.pop_front() {
            let Some(entry) = self.entries.get(&test_id) else {
                continue;
            };
            if entry.state != TestState::Loaded {
                debug!(%test_id, state = %entry.state, "skipping stale pending entry");
                continue;
            }
            info!(%test_id, "promoting test to run");
            self.current = Some(test_id);
            counter!("probe_scheduler_promotions_total").increment(1);
            _ = entry.fsm.send(FsmMsg::StartTesting);
            break;
        }
        gauge!("probe_scheduler_pending_tests").set(self.pending.len() as f64);
    }

    fn handle_fsm_exit(&mut self, joined: Result<TestId, tokio::task::JoinError>) {
        match joined {
            Ok(test_id) => {
                debug!(%test_id, "test fsm terminated");
                self.entries.remove(&test_id);
                self.pending.retain(|pending| *pending != test_id);
                if self.current == Some(test_id) {
                    self.current = None;
                }
                self.process_queue();
            }
            Err(join_err) => {
                warn!("test fsm task failed: {join_err}");
            }
        }
    }

    fn queue_status(&self) -> QueueStatusResponse {
        let mut status = QueueStatusResponse {
            total_tests: self.submitted_total,
            completed_count: self.completed_total,
            exception_count: self.exception_total,
            currently_testing: self.current,
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.state {
                TestState::Setup => status.setup += 1,
                TestState::Loading => status.loading += 1,
                TestState::Loaded => status.loaded += 1,
                TestState::Testing => status.testing += 1,
                TestState::ShuttingDown => status.shutting_down += 1,
                TestState::Completed | TestState::Exception => {}
            }
        }
        status
    }
}
