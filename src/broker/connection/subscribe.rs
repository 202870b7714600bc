//! SUBSCRIBE and UNSUBSCRIBE handling

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::{Connection, ConnectionError};
use crate::backend::Session;
use crate::protocol::{Packet, QoS, SubAck, Subscribe, SubscribeReturnCode, Unsubscribe};
use crate::topic::validate_topic_filter;
use crate::transport::MqttStream;

impl<S> Connection<S>
where
    S: MqttStream,
{
    /// Grant what can be granted, answer SUBACK, then replay retained
    /// messages for every granted filter
    pub(crate) async fn handle_subscribe(
        &mut self,
        session: &Arc<Session>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted: Vec<(String, QoS)> = Vec::with_capacity(subscribe.subscriptions.len());

        for sub in subscribe.subscriptions {
            if let Err(reason) = validate_topic_filter(&sub.filter) {
                debug!("Rejecting filter '{}' from {}: {}", sub.filter, self.addr, reason);
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            match self.backend.subscribe(session, &sub.filter, sub.qos).await {
                Ok(qos) => {
                    return_codes.push(SubscribeReturnCode::Success(qos));
                    granted.push((sub.filter, qos));
                }
                Err(e) => {
                    warn!("Subscribe to '{}' failed: {}", sub.filter, e);
                    return_codes.push(SubscribeReturnCode::Failure);
                }
            }
        }

        self.write_packets(&[Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        })])
        .await?;

        for (filter, qos) in granted {
            let retained = match self.backend.retained_for(&filter).await {
                Ok(retained) => retained,
                Err(e) => {
                    warn!("Failed to load retained messages for '{}': {}", filter, e);
                    continue;
                }
            };
            if retained.is_empty() {
                continue;
            }

            let mut packets = Vec::with_capacity(retained.len());
            {
                let mut engine = self.engine.lock();
                let now = Instant::now();
                for message in &retained {
                    packets.push(engine.send(message.to_publish(qos), now)?);
                }
            }
            self.write_packets(&packets).await?;
        }

        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        session: &Arc<Session>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        for filter in &unsubscribe.filters {
            if let Err(e) = self.backend.unsubscribe(session, filter).await {
                warn!("Unsubscribe from '{}' failed: {}", filter, e);
            }
        }

        self.write_packets(&[Packet::UnsubAck(unsubscribe.packet_id)])
            .await
    }
}
