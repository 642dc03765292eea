use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::warn;

use crate::bdd::{BddEngine, BddRunner};
use crate::config::KafkaConfig;
use crate::directory::StreamDirectory;
use crate::error::{ConsumeError, ProduceError};
use crate::fsm::{ChildName, FsmMsg};
use crate::kafka::consumer::{ConsumerCmd, ConsumerWorker};
use crate::kafka::producer::{ProducerCmd, ProducerWorker};
use crate::schema_registry;
use crate::storage::{BlockStorageDirective, FeatureLoader, ObjectStorageClient};
use crate::types::{KafkaSecurityDirective, TestExecutionResult, TestId, TopicDirective};
use crate::vault::CredentialBroker;

pub enum LoaderCmd {
    Initialize {
        bucket: String,
    },
    UploadEvidence {
        directive: BlockStorageDirective,
        result: TestExecutionResult,
    },
    Stop,
}

pub enum VaultCmd {
    Initialize { directives: Vec<TopicDirective> },
    Stop,
}

pub enum BddCmd {
    Start,
    Stop,
}

pub enum PoolCmd {
    Stop,
}

/// Block-storage child: materializes the feature tree on `Initialize` and
/// ships the evidence archive after the run. One operation at a time; the
/// FSM owns the ordering.
pub(super) async fn run_loader(
    test_id: TestId,
    storage: Arc<dyn ObjectStorageClient>,
    fsm: mpsc::UnboundedSender<FsmMsg>,
    mut commands: mpsc::UnboundedReceiver<LoaderCmd>,
) -> ChildName {
    let loader = FeatureLoader::new(storage);
    while let Some(cmd) = commands.recv().await {
        match cmd {
            LoaderCmd::Initialize { bucket } => {
                let msg = match loader.initialize(&bucket, test_id).await {
                    Ok(directive) => FsmMsg::StorageLoaded { directive },
                    Err(err) => FsmMsg::ChildFailed {
                        child: ChildName::BlockStorage,
                        failure: err.into(),
                    },
                };
                _ = fsm.send(msg);
            }
            LoaderCmd::UploadEvidence { directive, result } => {
                let msg = match loader.upload_evidence(&directive, test_id, &result).await {
                    Ok(key) => FsmMsg::EvidenceUploaded { key },
                    Err(err) => FsmMsg::ChildFailed {
                        child: ChildName::BlockStorage,
                        failure: err.into(),
                    },
                };
                _ = fsm.send(msg);
            }
            LoaderCmd::Stop => break,
        }
    }
    ChildName::BlockStorage
}

/// Vault child: one credential-issuing pass over the topic directives.
pub(super) async fn run_vault(
    broker: Arc<CredentialBroker>,
    fsm: mpsc::UnboundedSender<FsmMsg>,
    mut commands: mpsc::UnboundedReceiver<VaultCmd>,
) -> ChildName {
    while let Some(cmd) = commands.recv().await {
        match cmd {
            VaultCmd::Initialize { directives } => {
                let msg = match broker.issue(&directives).await {
                    Ok(directives) => FsmMsg::CredentialsIssued { directives },
                    Err(err) => FsmMsg::ChildFailed {
                        child: ChildName::Vault,
                        failure: err.into(),
                    },
                };
                _ = fsm.send(msg);
            }
            VaultCmd::Stop => break,
        }
    }
    ChildName::Vault
}

/// BDD child: configures the runner up front, then waits for the start
/// order. Engine failures mid-run come back as a failed result, never as a
/// crash.
pub(super) async fn run_bdd(
    engine: Arc<dyn BddEngine>,
    directive: BlockStorageDirective,
    test_id: TestId,
    directory: Arc<StreamDirectory>,
    fsm: mpsc::UnboundedSender<FsmMsg>,
    mut commands: mpsc::UnboundedReceiver<BddCmd>,
) -> ChildName {
    let runner = match BddRunner::prepare(engine, &directive, test_id, directory) {
        Ok(runner) => {
            _ = fsm.send(FsmMsg::ChildReady {
                child: ChildName::Bdd,
            });
            Some(runner)
        }
        Err(err) => {
            _ = fsm.send(FsmMsg::ChildFailed {
                child: ChildName::Bdd,
                failure: err.into(),
            });
            None
        }
    };

    while let Some(cmd) = commands.recv().await {
        match cmd {
            BddCmd::Start => {
                let Some(runner) = &runner else {
                    warn!(%test_id, "start ignored, bdd runner failed to configure");
                    continue;
                };
                let run = runner.execute();
                tokio::pin!(run);
                loop {
                    tokio::select! {
                        result = &mut run => {
                            _ = fsm.send(FsmMsg::BddComplete { result });
                            break;
                        }
                        cmd = commands.recv() => match cmd {
                            // A stop mid-run abandons the engine
                            Some(BddCmd::Stop) | None => return ChildName::Bdd,
                            Some(BddCmd::Start) => {
                                warn!(%test_id, "duplicate start ignored, run in progress");
                            }
                        }
                    }
                }
            }
            BddCmd::Stop => break,
        }
    }
    ChildName::Bdd
}

/// Producer pool child: one streaming worker per PRODUCER directive, each
/// registered in the process-wide directory before `Ready` is reported.
/// Workers encode through the codec published at boot; reaching this point
/// without one fails the child immediately.
pub(super) async fn run_producer_pool(
    test_id: TestId,
    config: KafkaConfig,
    assignments: Vec<KafkaSecurityDirective>,
    directory: Arc<StreamDirectory>,
    fsm: mpsc::UnboundedSender<FsmMsg>,
    mut commands: mpsc::UnboundedReceiver<PoolCmd>,
) -> ChildName {
    let mut worker_txs: Vec<(String, mpsc::UnboundedSender<ProducerCmd>)> = Vec::new();
    let mut worker_tasks = Vec::new();
    let mut failed = false;

    for security in &assignments {
        let codec = match schema_registry::global() {
            Ok(codec) => codec,
            Err(err) => {
                _ = fsm.send(FsmMsg::ChildFailed {
                    child: ChildName::Producer,
                    failure: ProduceError::Client(err.to_string()).into(),
                });
                failed = true;
                break;
            }
        };
        match ProducerWorker::new(test_id, security, &config, codec) {
            Ok(worker) => {
                let (tx, rx) = mpsc::unbounded_channel();
                directory.register_producer(test_id, &security.topic, tx.clone());
                worker_tasks.push(tokio::spawn(worker.run(rx, directory.clone())));
                worker_txs.push((security.topic.clone(), tx));
            }
            Err(err) => {
                _ = fsm.send(FsmMsg::ChildFailed {
                    child: ChildName::Producer,
                    failure: err.into(),
                });
                failed = true;
                break;
            }
        }
    }
    if !failed {
        _ = fsm.send(FsmMsg::ChildReady {
            child: ChildName::Producer,
        });
    }

    // Stay up until the stop order, failed or not
    while let Some(cmd) = commands.recv().await {
        match cmd {
            PoolCmd::Stop => break,
        }
    }
    stop_workers(&worker_txs);
    join_all(worker_tasks).await;
    ChildName::Producer
}

/// Consumer pool child, symmetric to the producer pool but carrying each
/// topic's event filters into the worker.
pub(super) async fn run_consumer_pool(
    test_id: TestId,
    config: KafkaConfig,
    assignments: Vec<(TopicDirective, KafkaSecurityDirective)>,
    directory: Arc<StreamDirectory>,
    fsm: mpsc::UnboundedSender<FsmMsg>,
    mut commands: mpsc::UnboundedReceiver<PoolCmd>,
) -> ChildName {
    let mut worker_txs: Vec<(String, mpsc::UnboundedSender<ConsumerCmd>)> = Vec::new();
    let mut worker_tasks = Vec::new();
    let mut failed = false;

    for (directive, security) in &assignments {
        let codec = match schema_registry::global() {
            Ok(codec) => codec,
            Err(err) => {
                _ = fsm.send(FsmMsg::ChildFailed {
                    child: ChildName::Consumer,
                    failure: ConsumeError::Client(err.to_string()).into(),
                });
                failed = true;
                break;
            }
        };
        match ConsumerWorker::new(
            test_id,
            security,
            directive.event_filters.clone(),
            &config,
            codec,
        ) {
            Ok(worker) => {
                let (tx, rx) = mpsc::unbounded_channel();
                directory.register_consumer(test_id, &security.topic, tx.clone());
                worker_tasks.push(tokio::spawn(worker.run(rx, directory.clone())));
                worker_txs.push((security.topic.clone(), tx));
            }
            Err(err) => {
                _ = fsm.send(FsmMsg::ChildFailed {
                    child: ChildName::Consumer,
                    failure: err.into(),
                });
                failed = true;
                break;
            }
        }
    }
    if !failed {
        _ = fsm.send(FsmMsg::ChildReady {
            child: ChildName::Consumer,
        });
    }

    while let Some(cmd) = commands.recv().await {
        match cmd {
            PoolCmd::Stop => break,
        }
    }
    stop_workers(&worker_txs);
    join_all(worker_tasks).await;
    ChildName::Consumer
}

fn stop_workers<C: StopCmd>(worker_txs: &[(String, mpsc::UnboundedSender<C>)]) {
    for (topic, tx) in worker_txs {
        if tx.send(C::stop()).is_err() {
            warn!(topic, "worker already gone at stop");
        }
    }
}

trait StopCmd {
    fn stop() -> Self;
}

impl StopCmd for ProducerCmd {
    fn stop() -> Self {
        ProducerCmd::Stop
    }
}

impl StopCmd for ConsumerCmd {
    fn stop() -> Self {
        ConsumerCmd::Stop
    }
}
