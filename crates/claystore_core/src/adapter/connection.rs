//! Connection lifecycle.
//!
//! # Responsibility
//! - Open the driver connection, retrying per the configured policy.
//! - Lend the handle to one operation at a time and clear it on shutdown.
//! - Publish connection status changes to subscribers.
//!
//! # Invariants
//! - The manager is the only owner of the handle; operations clone the
//!   `Arc` for their own duration and never store it.
//! - Before the first successful connect, operations fail with
//!   `NotConnected`; after shutdown, with `ConnectionClosed`.

use super::{AdapterError, AdapterResult};
use crate::config::RetryPolicy;
use crate::db::{ConnectOptions, Connection, Driver};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex, RwLock};

/// Observable connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Idle,
    Connecting { attempt: u32 },
    Ready,
    Failed(String),
    Closed,
}

pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    options: ConnectOptions,
    retry: RetryPolicy,
    handle: RwLock<Option<Arc<dyn Connection>>>,
    lifecycle: Mutex<()>,
    status: watch::Sender<ConnectionStatus>,
}

impl ConnectionManager {
    pub fn new(driver: Arc<dyn Driver>, options: ConnectOptions, retry: RetryPolicy) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        Self {
            driver,
            options,
            retry,
            handle: RwLock::new(None),
            lifecycle: Mutex::new(()),
            status,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Connects unless already connected. Resolves once the handle is
    /// usable, or with the last driver error once attempts run out.
    pub async fn connect(&self) -> AdapterResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.handle.read().await.is_some() {
            return Ok(());
        }

        let started_at = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.status
                .send_replace(ConnectionStatus::Connecting { attempt });
            info!(
                "event=connect module=adapter status=start attempt={attempt} host={} port={}",
                self.options.host, self.options.port
            );

            match self.driver.connect(&self.options).await {
                Ok(conn) => {
                    *self.handle.write().await = Some(conn);
                    self.status.send_replace(ConnectionStatus::Ready);
                    info!(
                        "event=connect module=adapter status=ok attempt={attempt} duration_ms={}",
                        started_at.elapsed().as_millis()
                    );
                    return Ok(());
                }
                Err(err) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "event=connect module=adapter status=retry attempt={attempt} retry_in_ms={} error={}",
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    error!(
                        "event=connect module=adapter status=error attempt={attempt} duration_ms={} error_code=connect_failed error={}",
                        started_at.elapsed().as_millis(),
                        err
                    );
                    self.status
                        .send_replace(ConnectionStatus::Failed(err.to_string()));
                    return Err(AdapterError::Connection(err));
                }
            }
        }
    }

    /// Lends the open connection to a single operation.
    pub async fn handle(&self) -> AdapterResult<Arc<dyn Connection>> {
        if let Some(conn) = self.handle.read().await.as_ref() {
            return Ok(Arc::clone(conn));
        }
        match &*self.status.borrow() {
            ConnectionStatus::Closed => Err(AdapterError::ConnectionClosed),
            _ => Err(AdapterError::NotConnected),
        }
    }

    /// Closes the connection if one is open. A no-op otherwise.
    pub async fn shutdown(&self) -> AdapterResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(conn) = self.handle.write().await.take() else {
            return Ok(());
        };

        self.status.send_replace(ConnectionStatus::Closed);
        match conn.close().await {
            Ok(()) => {
                info!("event=shutdown module=adapter status=ok");
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=shutdown module=adapter status=error error_code=close_failed error={}",
                    err
                );
                Err(AdapterError::Storage(err))
            }
        }
    }
}
