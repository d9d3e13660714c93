//! Shared fixtures for integration tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tether::models::ChangeRecord;
use tether::sync::ChangeSink;
use tether::Result;

/// Poll `check` every 20 ms until it holds or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Sink that accepts and records every change.
#[derive(Default)]
pub struct RecordingSink {
    pub delivered: Mutex<Vec<ChangeRecord>>,
}

impl RecordingSink {
    pub fn snapshot(&self) -> Vec<ChangeRecord> {
        self.delivered.lock().unwrap().clone()
    }
}

impl ChangeSink for RecordingSink {
    fn deliver<'a>(
        &'a self,
        change: &'a ChangeRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.delivered.lock().unwrap().push(change.clone());
            Ok(())
        })
    }
}
