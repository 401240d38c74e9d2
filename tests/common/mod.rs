use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use iot_ingestion::config::{DownstreamConfig, RetryConfig};
use iot_ingestion::consumer::{
    ConsumedRecord, ConsumerError, ConsumerFactory, RecordStream, SubscriptionOptions,
};
use iot_ingestion::credentials::{
    ResolvedCredentials, ServiceCredentials, ServiceEndpoints, ServiceKind,
};
use iot_ingestion::error::IngestError;
use iot_ingestion::registry::TopicLister;

pub type Feed = mpsc::UnboundedSender<Result<ConsumedRecord, ConsumerError>>;

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Endpoints for all three services pointing at one mock server.
#[allow(dead_code)]
pub fn endpoints(base_url: &str) -> ServiceEndpoints {
    let creds = |user: &str| ServiceCredentials {
        url: base_url.to_string(),
        user: user.to_string(),
        password: format!("{}-pw", user),
    };
    ServiceEndpoints {
        metadata: ResolvedCredentials::new(ServiceKind::Metadata, &creds("meta"))
            .expect("valid metadata credentials"),
        raw_data: ResolvedCredentials::new(ServiceKind::RawData, &creds("raw"))
            .expect("valid raw-data credentials"),
        location: ResolvedCredentials::new(ServiceKind::Location, &creds("loc"))
            .expect("valid location credentials"),
    }
}

/// Downstream settings with fast retries.
#[allow(dead_code)]
pub fn fast_downstream() -> DownstreamConfig {
    DownstreamConfig {
        timeout_secs: 5,
        max_concurrent_requests: 4,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
    }
}

/// Lister returning a fixed set of topic names.
#[allow(dead_code)]
pub struct StaticLister(pub Vec<&'static str>);

#[async_trait]
impl TopicLister for StaticLister {
    async fn list_topics(&self) -> Result<BTreeSet<String>, IngestError> {
        Ok(self.0.iter().map(|s| s.to_string()).collect())
    }
}

struct ChannelStream {
    rx: mpsc::UnboundedReceiver<Result<ConsumedRecord, ConsumerError>>,
    topic: String,
    closed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RecordStream for ChannelStream {
    async fn next(&mut self) -> Option<Result<ConsumedRecord, ConsumerError>> {
        self.rx.recv().await
    }

    fn is_assigned(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.closed.lock().unwrap().push(self.topic.clone());
    }
}

/// In-memory consumer factory; each subscription is fed through a channel.
#[derive(Default)]
#[allow(dead_code)]
pub struct ChannelFactory {
    feeds: Mutex<HashMap<String, Feed>>,
    groups: Mutex<Vec<String>>,
    closed: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
impl ChannelFactory {
    /// Waits until a subscription for `topic` has been opened.
    pub async fn feed(&self, topic: &str) -> Feed {
        for _ in 0..200 {
            if let Some(feed) = self.feeds.lock().unwrap().get(topic) {
                return feed.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no subscription opened for {}", topic);
    }

    pub fn group_ids(&self) -> Vec<String> {
        self.groups.lock().unwrap().clone()
    }

    pub fn closed_topics(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

impl ConsumerFactory for ChannelFactory {
    fn subscribe(
        &self,
        options: &SubscriptionOptions,
    ) -> Result<Box<dyn RecordStream>, ConsumerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().insert(options.topic.clone(), tx);
        self.groups.lock().unwrap().push(options.group_id.clone());
        Ok(Box::new(ChannelStream {
            rx,
            topic: options.topic.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Builds a record as the bus would deliver it.
#[allow(dead_code)]
pub fn record(topic: &str, offset: i64, payload: &str) -> ConsumedRecord {
    ConsumedRecord {
        topic: topic.to_string(),
        partition: 0,
        offset,
        payload: payload.as_bytes().to_vec(),
    }
}
