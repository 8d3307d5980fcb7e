// tests/common/mod.rs
#![allow(dead_code)]

use kinesis_shard_runtime::test::TestUtils;
use kinesis_shard_runtime::{ConsumerConfig, ProducerConfig, StartingPosition};
use std::future::Future;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub const STREAM: &str = "test-stream";

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("kinesis_shard_runtime=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

pub fn consumer_config(starting_position: StartingPosition) -> ConsumerConfig {
    ConsumerConfig {
        stream_name: STREAM.to_string(),
        starting_position,
        poll_interval: Duration::from_millis(5),
        checkpoint_interval: Duration::from_secs(3600),
        retry: TestUtils::fast_retry_config(5),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn producer_config() -> ProducerConfig {
    ProducerConfig {
        stream_name: STREAM.to_string(),
        retry: TestUtils::fast_retry_config(5),
        ..Default::default()
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition().await
}
