// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! [`ConnectionManager`] owns at most one live connection to RabbitMQ. The
//! connection is created lazily on the first channel request and recreated
//! whenever the cached one reports closed. Every request gets a fresh channel;
//! channels are never shared between concurrent operations.
//!
//! Connections are established by a [`Connector`]. [`LapinConnector`] dials the
//! broker described by [`Configs`].

use crate::{
    channel::{AmqpChannel, ChannelProvider, LapinChannel, REPLY_SUCCESS},
    configs::Configs,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

/// A broker connection able to open channels.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Establishes new broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// [`Connector`] dialing RabbitMQ through lapin.
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    pub fn new(cfg: &Configs) -> LapinConnector {
        LapinConnector {
            uri: cfg.rabbitmq.uri(),
            connection_name: cfg.app.name.clone(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(&self.uri, options).await {
            Ok(c) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection {
                    connection: Arc::new(c),
                }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    connection: Arc<Connection>,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let channel = LapinChannel::open(self.connection.clone()).await?;
        Ok(Arc::new(channel))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "connection released")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

pub struct ConnectionManager {
    connector: Box<dyn Connector>,
    connection: RwLock<Option<Arc<dyn AmqpConnection>>>,
}

impl ConnectionManager {
    pub fn new(cfg: &Configs) -> ConnectionManager {
        ConnectionManager::with_connector(LapinConnector::new(cfg))
    }

    pub fn with_connector(connector: impl Connector + 'static) -> ConnectionManager {
        ConnectionManager {
            connector: Box::new(connector),
            connection: RwLock::new(None),
        }
    }

    /// Returns the cached connection if it is still open, connecting otherwise.
    ///
    /// Reconnection happens under the write lock and re-checks liveness after
    /// acquiring it, so concurrent callers trigger a single connection attempt.
    async fn live_connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if let Some(conn) = self.connection.read().await.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
        }

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            if conn.is_open() {
                return Ok(conn.clone());
            }
            info!("amqp connection closed, reconnecting");
        }

        let conn = self.connector.connect().await?;
        *guard = Some(conn.clone());

        Ok(conn)
    }
}

#[async_trait]
impl ChannelProvider for ConnectionManager {
    async fn acquire_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let conn = self.live_connection().await?;
        conn.open_channel().await
    }

    fn is_connected(&self) -> bool {
        match self.connection.try_read() {
            Ok(guard) => guard.as_ref().map(|conn| conn.is_open()).unwrap_or(false),
            // a writer is (re)connecting
            Err(_) => false,
        }
    }

    async fn close(&self) {
        let Some(conn) = self.connection.write().await.take() else {
            return;
        };

        match conn.close().await {
            Ok(()) => debug!("amqp connection closed"),
            Err(err) => error!(error = err.to_string(), "error closing amqp connection"),
        }
    }
}
