use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::kafka::consumer::ConsumerCmd;
use crate::kafka::producer::ProducerCmd;
use crate::types::TestId;

/// Process-wide map from `(testId, topic)` to the streaming worker serving
/// that pair. Workers insert their own entry exactly once at start and
/// remove it at stop; BDD step code only reads. Keys embed the test id, so
/// concurrent tests cannot collide.
#[derive(Default)]
pub struct StreamDirectory {
    producers: DashMap<(TestId, String), mpsc::UnboundedSender<ProducerCmd>>,
    consumers: DashMap<(TestId, String), mpsc::UnboundedSender<ConsumerCmd>>,
}

impl StreamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_producer(
        &self,
        test_id: TestId,
        topic: &str,
        handle: mpsc::UnboundedSender<ProducerCmd>,
    ) {
        self.producers.insert((test_id, topic.to_string()), handle);
    }

    pub fn deregister_producer(&self, test_id: TestId, topic: &str) {
        self.producers.remove(&(test_id, topic.to_string()));
    }

    pub fn producer(
        &self,
        test_id: TestId,
        topic: &str,
    ) -> Option<mpsc::UnboundedSender<ProducerCmd>> {
        self.producers
            .get(&(test_id, topic.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn register_consumer(
        &self,
        test_id: TestId,
        topic: &str,
        handle: mpsc::UnboundedSender<ConsumerCmd>,
    ) {
        self.consumers.insert((test_id, topic.to_string()), handle);
    }

    pub fn deregister_consumer(&self, test_id: TestId, topic: &str) {
        self.consumers.remove(&(test_id, topic.to_string()));
    }

    pub fn consumer(
        &self,
        test_id: TestId,
        topic: &str,
    ) -> Option<mpsc::UnboundedSender<ConsumerCmd>> {
        self.consumers
            .get(&(test_id, topic.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Number of live entries for a test, across both maps.
    pub fn entries_for(&self, test_id: TestId) -> usize {
        let producers = self
            .producers
            .iter()
            .filter(|entry| entry.key().0 == test_id)
            .count();
        let consumers = self
            .consumers
            .iter()
            .filter(|entry| entry.key().0 == test_id)
            .count();
        producers + consumers
    }
}
