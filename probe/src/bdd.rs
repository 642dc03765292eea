use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info};

use crate::directory::StreamDirectory;
use crate::error::BddError;
use crate::storage::{BlockStorageDirective, FeatureTree};
use crate::types::{TestExecutionResult, TestId};

/// Context handed to the engine for one run. Step code reaches the
/// per-test streams through the directory, keyed by `(test_id, topic)`.
pub struct BddRun {
    pub test_id: TestId,
    pub features: Arc<FeatureTree>,
    pub feature_paths: Vec<String>,
    pub evidence_dir: String,
    pub directory: Arc<StreamDirectory>,
}

/// The BDD engine is a black box: given the run context, it executes every
/// scenario and reports structured counts. Deployments inject their own;
/// the crate ships `DryRunEngine` for wiring and smoke runs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BddEngine: Send + Sync {
    async fn run(&self, run: &BddRun) -> Result<TestExecutionResult, BddError>;
}

/// Drives the engine for one test. Configuration problems surface as
/// errors before the run; anything the engine throws mid-run is folded
/// into a failed result so the lifecycle still completes and uploads
/// evidence.
pub struct BddRunner {
    engine: Arc<dyn BddEngine>,
    run: BddRun,
}

impl BddRunner {
    pub fn prepare(
        engine: Arc<dyn BddEngine>,
        directive: &BlockStorageDirective,
        test_id: TestId,
        directory: Arc<StreamDirectory>,
    ) -> Result<Self, BddError> {
        let feature_paths: Vec<String> = directive
            .features
            .paths()
            .into_iter()
            .filter(|path| path.ends_with(".feature"))
            .collect();
        if feature_paths.is_empty() {
            return Err(BddError::NoFeatures("feature tree root".to_string()));
        }
        info!(%test_id, features = feature_paths.len(), "bdd runner configured");

        Ok(Self {
            engine,
            run: BddRun {
                test_id,
                features: directive.features.clone(),
                feature_paths,
                evidence_dir: directive.evidence_dir.clone(),
                directory,
            },
        })
    }

    /// Runs every scenario and always produces a result, pass or fail.
    pub async fn execute(&self) -> TestExecutionResult {
        let started = Instant::now();
        match self.engine.run(&self.run).await {
            Ok(result) => result,
            Err(err) => {
                error!(test_id = %self.run.test_id, "bdd engine aborted: {err}");
                TestExecutionResult::aborted(
                    self.run.test_id,
                    started.elapsed().as_millis() as u64,
                    err.to_string(),
                )
            }
        }
    }
}

/// Minimal built-in engine: walks the feature files, counts scenarios and
/// steps, marks everything passed and drops a summary into the evidence
/// directory. Useful for wiring checks and probe self-tests; real
/// deployments plug in a full Gherkin engine.
pub struct DryRunEngine;

#[async_trait]
impl BddEngine for DryRunEngine {
    async fn run(&self, run: &BddRun) -> Result<TestExecutionResult, BddError> {
        let started = Instant::now();
        let mut scenarios = 0u32;
        let mut steps = 0u32;
        let mut summary = String::new();

        for path in &run.feature_paths {
            let Some(contents) = run.features.read(path) else {
                continue;
            };
            let text = String::from_utf8_lossy(&contents);
            for line in text.lines() {
                let trimmed = line.trim_start();
                if trimmed.starts_with("Scenario:") || trimmed.starts_with("Scenario Outline:") {
                    scenarios += 1;
                    summary.push_str(path);
                    summary.push_str(": ");
                    summary.push_str(trimmed);
                    summary.push('\n');
                } else if ["Given ", "When ", "Then ", "And ", "But "]
                    .iter()
                    .any(|prefix| trimmed.starts_with(prefix))
                {
                    steps += 1;
                }
            }
        }
        if scenarios == 0 {
            return Err(BddError::Engine(
                "feature files contain no scenarios".to_string(),
            ));
        }

        run.features.insert(
            format!("{}/scenarios.txt", run.evidence_dir),
            summary.into_bytes(),
        );

        Ok(TestExecutionResult {
            test_id: run.test_id,
            passed: true,
            scenario_count: scenarios,
            scenarios_passed: scenarios,
            scenarios_failed: 0,
            scenarios_skipped: 0,
            step_count: steps,
            steps_passed: steps,
            steps_failed: 0,
            steps_skipped: 0,
            steps_undefined: 0,
            duration_millis: started.elapsed().as_millis() as u64,
            error_note: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EVIDENCE_DIR;

    const FEATURE: &str = "\
Feature: order flow

  Scenario: produce and observe an order
    Given a producer stream for topic orders
    When an OrderCreated event is produced with correlation id corr-1
    Then the event is fetchable by correlation id corr-1
";

    fn directive_with_feature() -> BlockStorageDirective {
        let tree = FeatureTree::new();
        tree.insert("features/orders.feature", FEATURE.as_bytes());
        tree.insert("manifest.json", "{}".as_bytes());
        BlockStorageDirective {
            features: Arc::new(tree),
            evidence_dir: EVIDENCE_DIR.to_string(),
            topic_directives: vec![],
            bucket: "probe-tests".to_string(),
        }
    }

    #[tokio::test]
    async fn prepare_requires_feature_files() {
        let tree = FeatureTree::new();
        tree.insert("manifest.json", "{}".as_bytes());
        let directive = BlockStorageDirective {
            features: Arc::new(tree),
            evidence_dir: EVIDENCE_DIR.to_string(),
            topic_directives: vec![],
            bucket: "probe-tests".to_string(),
        };
        let err = BddRunner::prepare(
            Arc::new(DryRunEngine),
            &directive,
            TestId::new(),
            Arc::new(StreamDirectory::new()),
        )
        .unwrap_err();
        assert!(matches!(err, BddError::NoFeatures(_)));
    }

    #[tokio::test]
    async fn dry_run_counts_scenarios_and_writes_evidence() {
        let directive = directive_with_feature();
        let runner = BddRunner::prepare(
            Arc::new(DryRunEngine),
            &directive,
            TestId::new(),
            Arc::new(StreamDirectory::new()),
        )
        .expect("prepare");

        let result = runner.execute().await;
        assert!(result.passed);
        assert_eq!(result.scenario_count, 1);
        assert_eq!(result.scenarios_passed, 1);
        assert_eq!(result.step_count, 3);

        let evidence = directive
            .features
            .read(&format!("{EVIDENCE_DIR}/scenarios.txt"))
            .expect("evidence summary");
        assert!(String::from_utf8_lossy(&evidence).contains("produce and observe an order"));
    }

    #[tokio::test]
    async fn engine_errors_become_failed_results() {
        let directive = directive_with_feature();
        let mut engine = MockBddEngine::new();
        engine
            .expect_run()
            .returning(|_| Err(BddError::Engine("step bindings missing".to_string())));

        let runner = BddRunner::prepare(
            Arc::new(engine),
            &directive,
            TestId::new(),
            Arc::new(StreamDirectory::new()),
        )
        .expect("prepare");

        let result = runner.execute().await;
        assert!(!result.passed);
        assert_eq!(result.scenario_count, 0);
        assert!(result
            .error_note
            .as_deref()
            .expect("error note")
            .contains("step bindings missing"));
    }
}
