//! Connection teardown and will message publishing

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{Connection, ConnectionError, Exit};
use crate::backend::Session;
use crate::transport::MqttStream;

impl<S> Connection<S>
where
    S: MqttStream,
{
    /// Release everything the connection holds
    ///
    /// The will is published only when the connection ended with an error
    /// (transport failure, keep-alive timeout, protocol violation).
    pub(crate) async fn finish(
        &mut self,
        session: &Arc<Session>,
        result: &Result<Exit, ConnectionError>,
    ) {
        let will = self.will.take();
        let publish_will = result.is_err();

        self.engine.lock().close();

        if let Err(e) = self.backend.terminate(session, self.id).await {
            warn!("Failed to release session {}: {}", session.client_id(), e);
        }

        if publish_will {
            if let Some(will) = will {
                debug!(
                    "Publishing will for {} to '{}'",
                    session.client_id(),
                    will.topic
                );
                if let Err(e) = self.backend.publish(will.to_publish()).await {
                    warn!("Failed to publish will for {}: {}", session.client_id(), e);
                }
            }
        }

        let _ = self.stream.shutdown().await;
        debug!("Connection {} from {} closed", self.id, self.addr);
    }
}
