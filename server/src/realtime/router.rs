//! Per-type message dispatch.
//!
//! The router owns the handler contract: which connection states may
//! send which types, which permission the AuthGate must grant first,
//! and how each error variant maps back onto the wire. Handlers are
//! isolated — a failure produces at most an `error` (or `auth_error` +
//! close) on the offending connection and never crosses to another.

use std::sync::Arc;

use tracing::{debug, warn};

use super::connection::{Connection, ConnectionState, CLOSE_POLICY_VIOLATION};
use crate::auth::AuthGate;
use crate::error::SyncError;
use crate::protocol::{
    AuthErrorPayload, AuthPayload, AuthSuccessPayload, AwarenessStatePayload,
    AwarenessSubscribePayload, AwarenessUpdatePayload, DeltaPayload, Message, MessageBody,
    PongPayload, SubscribePayload, SyncRequestPayload, SyncResponsePayload, UnsubscribePayload,
};
use crate::sync::SyncCoordinator;

pub struct MessageRouter {
    auth_gate: Arc<AuthGate>,
    coordinator: Arc<SyncCoordinator>,
}

impl MessageRouter {
    pub fn new(auth_gate: Arc<AuthGate>, coordinator: Arc<SyncCoordinator>) -> Self {
        Self {
            auth_gate,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Dispatch one parsed inbound message. Messages on a connection
    /// are routed in arrival order by the read loop.
    pub async fn route(&self, connection: &Arc<Connection>, message: Message) {
        connection.touch();

        // ping/pong are legal in every state.
        match &message.body {
            MessageBody::Ping(_) => {
                let pong = Message::with_id(&message.id, MessageBody::Pong(PongPayload {}));
                if let Err(e) = connection.send(&pong) {
                    debug!(connection = %connection.id(), error = %e, "pong not delivered");
                }
                return;
            }
            MessageBody::Pong(_) => {
                return;
            }
            MessageBody::Auth(payload) => {
                self.handle_auth(connection, payload).await;
                return;
            }
            _ => {}
        }

        // With authentication disabled, the first substantive message
        // auto-authenticates the connection as the anonymous admin. An
        // explicit auth frame (handled above) still gets to propose a
        // client id first; only the fallback path pins the connection id.
        if !connection.is_authenticated()
            && !self.auth_gate.required()
            && connection.state() == ConnectionState::Authenticating
        {
            let anonymous = self.auth_gate.anonymous();
            let user_id = anonymous.user_id.clone();
            connection.authenticate(anonymous, None);
            self.coordinator
                .registry()
                .index_user(&user_id, connection.id());
        }

        // Everything else requires an authenticated connection.
        if !connection.is_authenticated() {
            self.reply_error(
                connection,
                &SyncError::Auth("authenticate before sending messages".to_string()),
            );
            return;
        }

        let result = match &message.body {
            MessageBody::Subscribe(payload) => self.handle_subscribe(connection, payload).await,
            MessageBody::Unsubscribe(payload) => {
                self.handle_unsubscribe(connection, payload).await
            }
            MessageBody::SyncRequest(payload) => {
                self.handle_sync_request(connection, payload).await
            }
            MessageBody::Delta(payload) => match self.require_write(connection, &payload.document_id) {
                Ok(()) => {
                    self.coordinator
                        .handle_delta(connection, &message.id, message.timestamp, payload)
                        .await
                }
                Err(denied) => Err(denied),
            },
            MessageBody::Ack(payload) => {
                self.coordinator.resolve_ack(connection.id(), &payload.message_id);
                Ok(())
            }
            MessageBody::AwarenessSubscribe(payload) => {
                self.handle_awareness_subscribe(connection, payload).await
            }
            MessageBody::AwarenessUpdate(payload) => {
                self.handle_awareness_update(connection, payload).await
            }
            // Server-to-client types arriving inbound.
            other => Err(SyncError::Protocol(format!(
                "unexpected message type {}",
                other.message_type().name()
            ))),
        };

        if let Err(error) = result {
            if error.is_recoverable() {
                self.reply_error(connection, &error);
            } else {
                warn!(
                    connection = %connection.id(),
                    error = %error,
                    "handler failed"
                );
            }
        }
    }

    // -----------------------------------------------------------------
    // auth
    // -----------------------------------------------------------------

    async fn handle_auth(&self, connection: &Arc<Connection>, payload: &AuthPayload) {
        // Re-auth on an authenticated connection is answered
        // idempotently; the identity was fixed by the first auth.
        if connection.is_authenticated() {
            self.reply_auth_success(connection);
            return;
        }
        if connection.state() != ConnectionState::Authenticating {
            return;
        }

        match self.auth_gate.authenticate(payload) {
            Ok(token) => {
                let user_id = token.user_id.clone();
                connection.authenticate(token, payload.client_id.clone());
                self.coordinator
                    .registry()
                    .index_user(&user_id, connection.id());
                debug!(
                    connection = %connection.id(),
                    user = %user_id,
                    client = %connection.client_id(),
                    "connection authenticated"
                );
                self.reply_auth_success(connection);
            }
            Err(error) => {
                warn!(connection = %connection.id(), error = %error, "authentication failed");
                let reply = Message::new(MessageBody::AuthError(AuthErrorPayload {
                    reason: error.to_string(),
                }));
                let _ = connection.send(&reply);
                connection.close(CLOSE_POLICY_VIOLATION, "authentication failed");
            }
        }
    }

    fn reply_auth_success(&self, connection: &Arc<Connection>) {
        let Some(token) = connection.token() else {
            return;
        };
        let reply = Message::new(MessageBody::AuthSuccess(AuthSuccessPayload {
            user_id: token.user_id.clone(),
            client_id: connection.client_id(),
            permissions: token.wire_permissions(),
        }));
        let _ = connection.send(&reply);
    }

    // -----------------------------------------------------------------
    // subscribe / sync
    // -----------------------------------------------------------------

    async fn handle_subscribe(
        &self,
        connection: &Arc<Connection>,
        payload: &SubscribePayload,
    ) -> Result<(), SyncError> {
        self.require_read(connection, &payload.document_id)?;

        if connection.add_subscription(&payload.document_id) {
            self.coordinator
                .documents()
                .subscribe(&payload.document_id, connection.id())
                .await;
            self.coordinator
                .ensure_bus_subscription(&payload.document_id)
                .await;
        }

        self.reply_sync_response(connection, &payload.document_id, None)
            .await
    }

    async fn handle_unsubscribe(
        &self,
        connection: &Arc<Connection>,
        payload: &UnsubscribePayload,
    ) -> Result<(), SyncError> {
        if connection.remove_subscription(&payload.document_id) {
            self.coordinator
                .documents()
                .unsubscribe(&payload.document_id, connection.id());
            if let Err(e) = self
                .coordinator
                .bus()
                .unsubscribe(&payload.document_id)
                .await
            {
                warn!(document = %payload.document_id, error = %e, "bus unsubscribe failed");
            }
        }
        Ok(())
    }

    async fn handle_sync_request(
        &self,
        connection: &Arc<Connection>,
        payload: &SyncRequestPayload,
    ) -> Result<(), SyncError> {
        self.require_read(connection, &payload.document_id)?;

        if let Some(clock) = &payload.vector_clock {
            self.coordinator
                .documents()
                .merge_clock(&payload.document_id, clock)
                .await;
        }
        self.reply_sync_response(
            connection,
            &payload.document_id,
            payload.vector_clock.as_ref(),
        )
        .await
    }

    async fn reply_sync_response(
        &self,
        connection: &Arc<Connection>,
        document_id: &str,
        since: Option<&crate::clock::VectorClock>,
    ) -> Result<(), SyncError> {
        let (state, vector_clock) = self.coordinator.documents().snapshot(document_id).await;
        let deltas = match since {
            Some(clock) => Some(
                self.coordinator
                    .documents()
                    .deltas_since(document_id, clock)
                    .await,
            ),
            None => None,
        };

        let reply = Message::new(MessageBody::SyncResponse(SyncResponsePayload {
            document_id: document_id.to_string(),
            state,
            vector_clock,
            deltas,
        }));
        connection.send(&reply)
    }

    // -----------------------------------------------------------------
    // awareness
    // -----------------------------------------------------------------

    async fn handle_awareness_subscribe(
        &self,
        connection: &Arc<Connection>,
        payload: &AwarenessSubscribePayload,
    ) -> Result<(), SyncError> {
        self.require_read(connection, &payload.document_id)?;

        if connection.add_awareness_subscription(&payload.document_id) {
            self.coordinator
                .awareness()
                .add_subscriber(&payload.document_id, connection.id());
            self.coordinator
                .ensure_bus_subscription(&payload.document_id)
                .await;
        }

        let entries = self
            .coordinator
            .awareness()
            .list_active(&payload.document_id)
            .iter()
            .map(|entry| entry.to_wire())
            .collect();
        let reply = Message::new(MessageBody::AwarenessState(AwarenessStatePayload {
            document_id: payload.document_id.clone(),
            entries,
        }));
        connection.send(&reply)
    }

    async fn handle_awareness_update(
        &self,
        connection: &Arc<Connection>,
        payload: &AwarenessUpdatePayload,
    ) -> Result<(), SyncError> {
        self.require_read(connection, &payload.document_id)?;

        // Presence on a document the connection never joined is only
        // an admin privilege.
        let subscribed = connection.is_subscribed(&payload.document_id)
            || connection
                .awareness_subscriptions()
                .contains(&payload.document_id);
        let is_admin = connection.token().map(|t| t.is_admin()).unwrap_or(false);
        if !subscribed && !is_admin {
            return Err(SyncError::NotSubscribed(payload.document_id.clone()));
        }

        self.coordinator
            .handle_awareness_update(connection, payload)
            .await
    }

    // -----------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------

    fn require_read(
        &self,
        connection: &Arc<Connection>,
        document_id: &str,
    ) -> Result<(), SyncError> {
        let token = connection
            .token()
            .ok_or_else(|| SyncError::Auth("not authenticated".to_string()))?;
        if token.can_read(document_id) {
            Ok(())
        } else {
            Err(SyncError::PermissionDenied(format!(
                "read access to {document_id} denied"
            )))
        }
    }

    fn require_write(
        &self,
        connection: &Arc<Connection>,
        document_id: &str,
    ) -> Result<(), SyncError> {
        let token = connection
            .token()
            .ok_or_else(|| SyncError::Auth("not authenticated".to_string()))?;
        if token.can_write(document_id) {
            Ok(())
        } else {
            Err(SyncError::PermissionDenied(format!(
                "write access to {document_id} denied"
            )))
        }
    }

    fn reply_error(&self, connection: &Arc<Connection>, error: &SyncError) {
        let reply = Message::error(error.code(), error.to_string());
        if let Err(e) = connection.send(&reply) {
            debug!(connection = %connection.id(), error = %e, "error reply not delivered");
        }
    }
}
