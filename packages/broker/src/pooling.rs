use std::collections::VecDeque;
use std::time::Duration;

use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::BrokerSettings;
use crate::error::BrokerError;

/// How often the reconnect supervisor checks the connection.
pub(crate) const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

const REPLY_SUCCESS: u16 = 200;

/// A single AMQP connection multiplexing a bounded pool of channels.
///
/// Channels are cheap but not safe to share, so acquire/release is the unit
/// of concurrency. The connection mutex serializes replacement (reconnect)
/// against shutdown.
pub(crate) struct ChannelPool {
    settings: BrokerSettings,
    connection: Mutex<Connection>,
    channels: Mutex<VecDeque<Channel>>,
}

impl ChannelPool {
    pub(crate) async fn connect(settings: BrokerSettings) -> Result<Self, BrokerError> {
        let connection = dial(&settings).await?;

        // Probe channel: validates the connection before the pool is built.
        let probe = connection.create_channel().await?;
        probe.close(REPLY_SUCCESS, "connection probe").await?;

        let mut channels = VecDeque::with_capacity(settings.pool_size as usize);
        for _ in 0..settings.pool_size {
            channels.push_back(connection.create_channel().await?);
        }

        info!(
            pool_size = settings.pool_size,
            "RabbitMQ connection and channel pool initialized"
        );

        Ok(Self {
            settings,
            connection: Mutex::new(connection),
            channels: Mutex::new(channels),
        })
    }

    /// Non-blocking acquire: pop pooled channels until a live one turns up,
    /// discarding any whose server-side close has fired. When the pool is
    /// empty a fresh channel is opened on the live connection.
    pub(crate) async fn acquire(&self) -> Result<Channel, BrokerError> {
        loop {
            let pooled = self.channels.lock().await.pop_front();
            match pooled {
                Some(channel) if channel.status().connected() => return Ok(channel),
                Some(_) => {
                    debug!("Discarding closed channel");
                    continue;
                }
                None => {
                    let connection = self.connection.lock().await;
                    if !connection.status().connected() {
                        return Err(BrokerError::Connection(
                            "RabbitMQ connection is not open".to_string(),
                        ));
                    }
                    debug!("Channel pool empty, opening new channel");
                    return Ok(connection.create_channel().await?);
                }
            }
        }
    }

    /// Return a channel to the pool. Channels closed by the server since
    /// acquire are discarded; the pool size is a hard cap.
    pub(crate) async fn release(&self, channel: Channel) {
        if !channel.status().connected() {
            debug!("Discarding channel closed by server");
            return;
        }

        let mut channels = self.channels.lock().await;
        if channels.len() < self.settings.pool_size as usize {
            channels.push_back(channel);
            return;
        }
        drop(channels);

        debug!("Channel pool full, closing channel");
        if let Err(e) = channel.close(REPLY_SUCCESS, "pool full").await {
            debug!(error = %e, "Failed to close surplus channel");
        }
    }

    /// Reconnect supervisor body: when the connection reports closed, dial a
    /// new one, repopulate the pool with fresh channels and retire the old
    /// connection.
    pub(crate) async fn ensure_connected(&self) -> Result<(), BrokerError> {
        let mut connection = self.connection.lock().await;
        if connection.status().connected() {
            return Ok(());
        }

        info!("Attempting to reconnect to RabbitMQ");
        let fresh = dial(&self.settings).await?;

        let mut channels = self.channels.lock().await;
        channels.clear();
        for _ in 0..self.settings.pool_size {
            channels.push_back(fresh.create_channel().await?);
        }
        drop(channels);

        let stale = std::mem::replace(&mut *connection, fresh);
        if stale.status().connected() {
            if let Err(e) = stale.close(REPLY_SUCCESS, "replaced").await {
                debug!(error = %e, "Failed to close stale connection");
            }
        }

        info!("Reconnected to RabbitMQ");
        Ok(())
    }

    /// Drain and close every pooled channel, then close the connection.
    pub(crate) async fn shutdown(&self) -> Result<(), BrokerError> {
        let connection = self.connection.lock().await;

        let mut channels = self.channels.lock().await;
        while let Some(channel) = channels.pop_front() {
            if !channel.status().connected() {
                continue;
            }
            if let Err(e) = channel.close(REPLY_SUCCESS, "shutting down").await {
                debug!(error = %e, "Failed to close pooled channel");
            }
        }
        drop(channels);

        if connection.status().connected() {
            connection.close(REPLY_SUCCESS, "shutting down").await?;
        }
        Ok(())
    }
}

async fn dial(settings: &BrokerSettings) -> Result<Connection, BrokerError> {
    let connection = Connection::connect(&settings.url, ConnectionProperties::default())
        .await
        .map_err(|e| BrokerError::Connection(format!("failed to connect to RabbitMQ: {e}")))?;

    connection.on_error(|err| {
        error!(error = %err, "RabbitMQ connection closed");
    });

    Ok(connection)
}
