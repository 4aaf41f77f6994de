//! Entry points the transport calls: one per connection lifecycle step and
//! one per inbound client event.

use shared::{
    domain::ConnectionId,
    error::ApiError,
    protocol::{ClientEvent, ServerEvent},
};
use tracing::{debug, warn};

use crate::{
    error::RealtimeError,
    fanout, presence,
    registry::Outbox,
    signaling::{self, SignalKind},
    RealtimeContext, Session,
};

impl RealtimeContext {
    pub async fn on_connect(
        &self,
        credential: &str,
        outbox: Outbox,
    ) -> Result<Session, RealtimeError> {
        presence::connect(self, credential, outbox).await
    }

    pub async fn on_disconnect(&self, connection_id: ConnectionId) {
        presence::disconnect(self, connection_id).await;
    }

    /// Runs one client event. Failures are reported to the sending
    /// connection only and never end the session.
    pub async fn on_client_event(&self, connection_id: ConnectionId, event: ClientEvent) {
        if self.registry.get(connection_id).is_none() {
            debug!(%connection_id, event = event.name(), "event from unregistered connection ignored");
            return;
        }
        let name = event.name();
        if let Err(error) = self.dispatch(connection_id, event).await {
            match &error {
                RealtimeError::Upstream(detail) => {
                    warn!(%connection_id, event = name, error = %detail, "event failed")
                }
                other => debug!(%connection_id, event = name, error = %other, "event rejected"),
            }
            self.registry
                .send_to(connection_id, ServerEvent::Error(ApiError::from(error)));
        }
    }

    async fn dispatch(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), RealtimeError> {
        match event {
            ClientEvent::JoinConversation { conversation_id } => {
                fanout::join_conversation(self, connection_id, &conversation_id).await
            }
            ClientEvent::LeaveConversation { conversation_id } => {
                fanout::leave_conversation(self, connection_id, &conversation_id);
                Ok(())
            }
            ClientEvent::SendMessage(request) => {
                fanout::send_message(self, connection_id, request).await?;
                Ok(())
            }
            ClientEvent::MarkRead { conversation_id } => {
                fanout::mark_read(self, connection_id, &conversation_id).await?;
                Ok(())
            }
            ClientEvent::JoinRoom { room_id } => {
                signaling::join_room(self, connection_id, &room_id)
            }
            ClientEvent::LeaveRoom { room_id } => {
                signaling::leave_room(self, connection_id, &room_id)?;
                Ok(())
            }
            ClientEvent::Offer(payload) => {
                signaling::relay(self, connection_id, SignalKind::Offer, payload).map(drop)
            }
            ClientEvent::Answer(payload) => {
                signaling::relay(self, connection_id, SignalKind::Answer, payload).map(drop)
            }
            ClientEvent::IceCandidate(payload) => {
                signaling::relay(self, connection_id, SignalKind::IceCandidate, payload).map(drop)
            }
            ClientEvent::Signal(payload) => {
                signaling::relay(self, connection_id, SignalKind::Generic, payload).map(drop)
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
