// Reconnecting store — reopens the session after it was lost.
//
// The session (pool, plus the SSH tunnel it goes through) is opened on first
// use and dropped as soon as a call comes back with a Connection error or the
// tunnel's ssh process is found dead. The next call opens a fresh one. A
// failed open is itself a Connection error, so the scheduler aborts that
// cycle and tries again after the normal sleep.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::error::{StoreError, StoreResult};
use super::models::{
    EngagementObservation, ExternalCategory, ExternalSample, GlobalSentimentSample, ImpactChange,
    PostEngagement, PostKey, PostSentiment, PostType, WindowPost,
};
use super::traits::{BatchOutcome, Database};
use crate::tunnel::SshTunnel;

/// An open store and the tunnel keeping it reachable, if any.
pub struct Session {
    pub db: Arc<dyn Database>,
    pub tunnel: Option<SshTunnel>,
}

impl Session {
    pub fn direct(db: Arc<dyn Database>) -> Self {
        Self { db, tunnel: None }
    }

    fn is_healthy(&mut self) -> bool {
        self.tunnel.as_mut().map_or(true, SshTunnel::is_running)
    }
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Session>;
}

pub struct ReconnectingDatabase {
    connector: Box<dyn Connector>,
    session: Mutex<Option<Session>>,
}

impl ReconnectingDatabase {
    /// No session is opened until the first call.
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            session: Mutex::new(None),
        }
    }

    /// Whether a session is currently open.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Close the current session, tunnel included.
    pub async fn disconnect(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        if let Some(Session { db, tunnel }) = session {
            drop(db);
            if let Some(tunnel) = tunnel {
                tunnel.close().await?;
            }
        }
        Ok(())
    }

    async fn current(&self) -> StoreResult<Arc<dyn Database>> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            if session.is_healthy() {
                return Ok(session.db.clone());
            }
            warn!("SSH tunnel is gone, reconnecting");
            *guard = None;
        }

        let session = self
            .connector
            .connect()
            .await
            .map_err(|e| StoreError::Connection(format!("{e:#}")))?;
        info!("Store session opened");
        let db = session.db.clone();
        *guard = Some(session);
        Ok(db)
    }

    /// Drop the session `db` belongs to, unless it was already replaced.
    async fn invalidate(&self, db: &Arc<dyn Database>) {
        let mut guard = self.session.lock().await;
        if guard.as_ref().is_some_and(|s| Arc::ptr_eq(&s.db, db)) {
            warn!("Store session lost, reconnecting next call");
            *guard = None;
        }
    }

    async fn call<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(Arc<dyn Database>) -> Fut + Send,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        let db = self.current().await?;
        let result = op(db.clone()).await;
        if matches!(&result, Err(e) if e.is_connection()) {
            self.invalidate(&db).await;
        }
        result
    }
}

#[async_trait]
impl Database for ReconnectingDatabase {
    async fn table_count(&self) -> StoreResult<i64> {
        self.call(|db| async move { db.table_count().await }).await
    }

    async fn upsert_posts(&self, posts: &[PostSentiment]) -> StoreResult<BatchOutcome> {
        self.call(|db| async move { db.upsert_posts(posts).await })
            .await
    }

    async fn existing_post_keys(&self, keys: &[PostKey]) -> StoreResult<Vec<PostKey>> {
        self.call(|db| async move { db.existing_post_keys(keys).await })
            .await
    }

    async fn get_post(&self, key: &PostKey) -> StoreResult<Option<PostSentiment>> {
        self.call(|db| async move { db.get_post(key).await }).await
    }

    async fn record_engagement(
        &self,
        observations: &[EngagementObservation],
    ) -> StoreResult<BatchOutcome> {
        self.call(|db| async move { db.record_engagement(observations).await })
            .await
    }

    async fn recent_engagement(&self, since_ms: i64) -> StoreResult<Vec<PostEngagement>> {
        self.call(|db| async move { db.recent_engagement(since_ms).await })
            .await
    }

    async fn update_impacts(&self, changes: &[ImpactChange]) -> StoreResult<BatchOutcome> {
        self.call(|db| async move { db.update_impacts(changes).await })
            .await
    }

    async fn window_posts(
        &self,
        post_types: &[PostType],
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<WindowPost>> {
        self.call(|db| async move { db.window_posts(post_types, since_ms, until_ms).await })
            .await
    }

    async fn insert_external_samples(
        &self,
        samples: &[ExternalSample],
    ) -> StoreResult<BatchOutcome> {
        self.call(|db| async move { db.insert_external_samples(samples).await })
            .await
    }

    async fn external_values(
        &self,
        category: ExternalCategory,
        since_ms: i64,
        until_ms: i64,
    ) -> StoreResult<Vec<f64>> {
        self.call(|db| async move { db.external_values(category, since_ms, until_ms).await })
            .await
    }

    async fn insert_samples(
        &self,
        samples: &[GlobalSentimentSample],
    ) -> StoreResult<BatchOutcome> {
        self.call(|db| async move { db.insert_samples(samples).await })
            .await
    }

    async fn latest_samples(&self) -> StoreResult<Vec<GlobalSentimentSample>> {
        self.call(|db| async move { db.latest_samples().await }).await
    }
}
