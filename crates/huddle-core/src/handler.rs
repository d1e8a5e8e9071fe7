//! Command handler for Huddle.
//!
//! Maps one decoded client event to store mutations and outbound
//! deliveries. Each event takes the store lock once, so existence checks
//! and the mutations that depend on them are atomic.

use crate::delivery::{Delivery, DeliveryBus};
use crate::store::{EntityStore, StoreError, Token};
use huddle_protocol::events::{LeaveRequest, ReconnectRequest, RoomRequest, SendMessageRequest};
use huddle_protocol::{codec, ClientEvent, ErrorCode, ProtocolError, ServerEvent};
use huddle_transport::ConnectionId;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What the read loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Keep reading.
    Continue,
    /// The stream is no longer interpretable; stop reading.
    Close,
}

/// Encode an event for one connection, or log and drop it.
fn reply(source: ConnectionId, event: &ServerEvent) -> Option<Delivery> {
    match codec::encode(event) {
        Ok(payload) => Some(Delivery::to_connection(source, payload)),
        Err(e) => {
            error!(connection = %source, event = event.tag(), error = %e, "Failed to encode event");
            None
        }
    }
}

/// Callback invoked with the code of every `error` event produced.
pub type ErrorHook = Arc<dyn Fn(ErrorCode) + Send + Sync>;

/// Executes client events against the entity store.
#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<EntityStore>,
    bus: DeliveryBus,
    on_error: Option<ErrorHook>,
    max_frame_size: usize,
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("store", &self.store)
            .field("bus", &self.bus)
            .field("on_error", &self.on_error.is_some())
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl CommandHandler {
    /// Create a handler.
    #[must_use]
    pub fn new(store: Arc<EntityStore>, bus: DeliveryBus) -> Self {
        Self {
            store,
            bus,
            on_error: None,
            max_frame_size: codec::MAX_FRAME_SIZE,
        }
    }

    /// Accept frames up to `max` bytes.
    ///
    /// Should match the transport's message limit.
    #[must_use]
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Observe error codes reported to clients.
    #[must_use]
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.on_error = Some(hook);
        self
    }

    /// Get the entity store.
    #[must_use]
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Get the delivery bus.
    #[must_use]
    pub fn bus(&self) -> &DeliveryBus {
        &self.bus
    }

    /// Decode a raw frame and handle it.
    ///
    /// Codec errors are reported to `source` as an `error` event. Only a
    /// malformed envelope ends the read loop.
    pub fn handle_frame(&self, frame: &[u8], source: ConnectionId) -> FrameOutcome {
        match codec::decode_with_limit(frame, self.max_frame_size) {
            Ok(event) => {
                self.handle(event, source);
                FrameOutcome::Continue
            }
            Err(e) => self.reject_frame(&e, source),
        }
    }

    /// Report a codec error to `source`.
    ///
    /// Also used by the read loop for frames the transport refused before
    /// decoding, such as oversize messages.
    pub fn reject_frame(&self, err: &ProtocolError, source: ConnectionId) -> FrameOutcome {
        warn!(connection = %source, error = %err, "Rejected frame");
        for delivery in self.reject(source, err.code(), err.to_string()) {
            self.bus.publish(delivery);
        }
        if err.is_fatal() {
            FrameOutcome::Close
        } else {
            FrameOutcome::Continue
        }
    }

    /// Handle an event and queue its deliveries.
    ///
    /// Returns the number of deliveries queued.
    pub fn handle(&self, event: ClientEvent, source: ConnectionId) -> usize {
        let deliveries = self.dispatch(event, source);
        let count = deliveries.len();
        for delivery in deliveries {
            if !self.bus.publish(delivery) {
                warn!(connection = %source, "Delivery bus closed");
            }
        }
        count
    }

    /// Apply an event to the store and return the deliveries it produces.
    pub fn dispatch(&self, event: ClientEvent, source: ConnectionId) -> Vec<Delivery> {
        debug!(connection = %source, event = %event.event_type(), "Handling event");

        match event {
            ClientEvent::CreateRoom(req) => self.create_room(req, source),
            ClientEvent::JoinRoom(req) => self.join_room(req, source),
            ClientEvent::LeaveRoom(req) => self.leave_room(req, source),
            ClientEvent::ReconnectRoom(req) => self.reconnect_room(req, source),
            ClientEvent::SendMessage(req) => self.send_message(req, source),
        }
    }

    fn reject(&self, source: ConnectionId, code: ErrorCode, message: String) -> Vec<Delivery> {
        if let Some(hook) = &self.on_error {
            hook(code);
        }
        reply(source, &ServerEvent::error(code, message))
            .into_iter()
            .collect()
    }

    fn reject_store(&self, source: ConnectionId, err: &StoreError) -> Vec<Delivery> {
        debug!(connection = %source, error = %err, "Request rejected");
        self.reject(source, err.code(), err.to_string())
    }

    fn create_room(&self, req: RoomRequest, source: ConnectionId) -> Vec<Delivery> {
        let token = {
            let mut table = self.store.lock();
            if let Err(e) = table.create_room(&req.room_name) {
                return self.reject_store(source, &e);
            }
            match table.add_user(&req.room_name, &req.username, source) {
                Ok(user) => user.token().clone(),
                Err(e) => return self.reject_store(source, &e),
            }
        };

        [
            ServerEvent::room_created(token.as_str(), &req.room_name),
            ServerEvent::room_joined(token.as_str(), &req.room_name),
        ]
        .iter()
        .filter_map(|event| reply(source, event))
        .collect()
    }

    fn join_room(&self, req: RoomRequest, source: ConnectionId) -> Vec<Delivery> {
        let joined = self
            .store
            .lock()
            .add_user(&req.room_name, &req.username, source)
            .map(|user| user.token().clone());

        match joined {
            Ok(token) => reply(
                source,
                &ServerEvent::room_joined(token.as_str(), &req.room_name),
            )
            .into_iter()
            .collect(),
            Err(e) => self.reject_store(source, &e),
        }
    }

    fn leave_room(&self, req: LeaveRequest, source: ConnectionId) -> Vec<Delivery> {
        let token = Token::from(req.token);
        {
            let mut table = self.store.lock();
            if let Err(e) = table.room(&req.room_name) {
                return self.reject_store(source, &e);
            }
            if table.remove_user(&req.room_name, &token).is_none() {
                debug!(
                    connection = %source,
                    room = %req.room_name,
                    user = %req.username,
                    "Leave for a session that is already gone"
                );
            }
        }

        reply(
            source,
            &ServerEvent::room_left(token.as_str(), &req.room_name),
        )
        .into_iter()
        .collect()
    }

    fn reconnect_room(&self, req: ReconnectRequest, source: ConnectionId) -> Vec<Delivery> {
        let token = Token::from(req.token);
        let rebound = {
            let mut table = self.store.lock();
            let Some(seat) = table.resolve_token(&token).cloned() else {
                return self.reject_store(source, &StoreError::InvalidToken);
            };

            // The index may point at a room or member that no longer exists
            let rebound = table
                .rebind(&seat.room, &token, source)
                .map(|user| (seat.room.clone(), user.name().to_string()));
            if rebound.is_err() {
                table.forget_token(&token);
                debug!(room = %seat.room, user = %seat.username, "Dropped stale token");
            }
            rebound
        };

        match rebound {
            Ok((room, username)) => reply(
                source,
                &ServerEvent::room_reconnected(token.as_str(), room, username),
            )
            .into_iter()
            .collect(),
            Err(e) => self.reject_store(source, &e),
        }
    }

    fn send_message(&self, req: SendMessageRequest, source: ConnectionId) -> Vec<Delivery> {
        if let Err(e) = self.store.lock().room(&req.room_name) {
            return self.reject_store(source, &e);
        }

        let event = ServerEvent::message_received(req.username, req.body);
        match codec::encode(&event) {
            Ok(payload) => vec![Delivery::to_room(req.room_name, payload)],
            Err(e) => {
                error!(room = %req.room_name, error = %e, "Failed to encode message");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::delivery::{DeliveryQueue, DeliveryWorker, Target};
    use crate::testing::RecordingSink;
    use huddle_protocol::events::ErrorData;

    const ALICE: ConnectionId = ConnectionId::new(1);
    const BOB: ConnectionId = ConnectionId::new(2);

    fn handler() -> (CommandHandler, DeliveryQueue) {
        let (bus, queue) = DeliveryBus::new();
        (CommandHandler::new(Arc::new(EntityStore::new()), bus), queue)
    }

    fn events(deliveries: &[Delivery]) -> Vec<ServerEvent> {
        deliveries
            .iter()
            .map(|d| codec::decode_server_event(&d.payload).unwrap())
            .collect()
    }

    fn token_of(deliveries: &[Delivery]) -> String {
        match &events(deliveries)[0] {
            ServerEvent::RoomCreated(data) | ServerEvent::RoomJoined(data) => data.token.clone(),
            other => panic!("Expected a session event, got {:?}", other),
        }
    }

    fn error_code(deliveries: &[Delivery]) -> ErrorCode {
        match events(deliveries).as_slice() {
            [ServerEvent::Error(ErrorData { code, .. })] => *code,
            other => panic!("Expected a single error, got {:?}", other),
        }
    }

    #[test]
    fn test_create_room_sends_created_then_joined() {
        let (handler, _queue) = handler();

        let out = handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE);

        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.target == Target::Connection(ALICE)));
        let token = token_of(&out);
        assert_eq!(
            events(&out),
            vec![
                ServerEvent::room_created(&token, "r1"),
                ServerEvent::room_joined(&token, "r1"),
            ]
        );
    }

    #[test]
    fn test_create_room_twice() {
        let (handler, _queue) = handler();
        handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE);

        let out = handler.dispatch(ClientEvent::create_room("r1", "bob"), BOB);
        assert_eq!(error_code(&out), ErrorCode::RoomAlreadyExists);
        assert_eq!(out[0].target, Target::Connection(BOB));
    }

    #[test]
    fn test_concurrent_create_room_exactly_one_wins() {
        let (handler, _queue) = handler();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let handler = handler.clone();
                std::thread::spawn(move || {
                    let out = handler.dispatch(
                        ClientEvent::create_room("r1", format!("user-{i}")),
                        ConnectionId::new(i),
                    );
                    events(&out)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results
            .iter()
            .filter(|evs| matches!(evs.first(), Some(ServerEvent::RoomCreated(_))))
            .count();
        let losers = results
            .iter()
            .filter(|evs| {
                matches!(
                    evs.as_slice(),
                    [ServerEvent::Error(ErrorData { code: ErrorCode::RoomAlreadyExists, .. })]
                )
            })
            .count();

        assert_eq!(winners, 1);
        assert_eq!(losers, 15);
        assert_eq!(handler.store().lock().room("r1").unwrap().member_count(), 1);
    }

    #[test]
    fn test_join_room() {
        let (handler, _queue) = handler();
        handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE);

        let out = handler.dispatch(ClientEvent::join_room("r1", "bob"), BOB);
        let token = token_of(&out);
        assert_eq!(events(&out), vec![ServerEvent::room_joined(&token, "r1")]);

        let missing = handler.dispatch(ClientEvent::join_room("r2", "bob"), BOB);
        assert_eq!(error_code(&missing), ErrorCode::RoomNotFound);
    }

    #[test]
    fn test_join_with_taken_name() {
        let (handler, _queue) = handler();
        handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE);

        let out = handler.dispatch(ClientEvent::join_room("r1", "alice"), BOB);
        assert_eq!(error_code(&out), ErrorCode::UsernameTaken);
        assert_eq!(handler.store().lock().room("r1").unwrap().member_count(), 1);
    }

    #[test]
    fn test_leave_then_reconnect_is_rejected() {
        let (handler, _queue) = handler();
        let token = token_of(&handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE));

        let out = handler.dispatch(ClientEvent::leave_room("r1", "alice", &token), ALICE);
        assert_eq!(events(&out), vec![ServerEvent::room_left(&token, "r1")]);
        assert!(handler.store().lock().room("r1").unwrap().is_empty());

        let out = handler.dispatch(ClientEvent::reconnect_room(&token), BOB);
        assert_eq!(error_code(&out), ErrorCode::InvalidToken);
        // The stale index entry is gone after the first rejection
        assert!(handler
            .store()
            .lock()
            .resolve_token(&Token::from(token.as_str()))
            .is_none());
    }

    #[test]
    fn test_leave_missing_room() {
        let (handler, _queue) = handler();
        let out = handler.dispatch(ClientEvent::leave_room("r1", "alice", "tok"), ALICE);
        assert_eq!(error_code(&out), ErrorCode::RoomNotFound);
    }

    #[test]
    fn test_reconnect_rebinds_connection() {
        let (handler, _queue) = handler();
        let token = token_of(&handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE));
        let fresh = ConnectionId::new(99);

        let out = handler.dispatch(ClientEvent::reconnect_room(&token), fresh);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::Connection(fresh));
        assert_eq!(
            events(&out),
            vec![ServerEvent::room_reconnected(&token, "r1", "alice")]
        );
        let table = handler.store().lock();
        let user = table
            .find_user_by_token("r1", &Token::from(token.as_str()))
            .unwrap();
        assert_eq!(user.connection(), fresh);
    }

    #[test]
    fn test_reconnect_unknown_token() {
        let (handler, _queue) = handler();
        let out = handler.dispatch(ClientEvent::reconnect_room("nope"), ALICE);
        assert_eq!(error_code(&out), ErrorCode::InvalidToken);
    }

    #[test]
    fn test_send_message_targets_room() {
        let (handler, _queue) = handler();
        handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE);

        let out = handler.dispatch(ClientEvent::send_message("r1", "alice", "hi"), ALICE);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, Target::Room("r1".to_string()));
        assert_eq!(events(&out), vec![ServerEvent::message_received("alice", "hi")]);

        let missing = handler.dispatch(ClientEvent::send_message("r2", "alice", "hi"), ALICE);
        assert_eq!(error_code(&missing), ErrorCode::RoomNotFound);
    }

    #[test]
    fn test_handle_frame_reports_codec_errors() {
        let (handler, mut queue) = handler();

        let outcome = handler.handle_frame(br#"{"eventType":"dance","data":{}}"#, ALICE);
        assert_eq!(outcome, FrameOutcome::Continue);

        let outcome = handler.handle_frame(
            br#"{"eventType":"join_room","data":{"roomName":"","username":"a"}}"#,
            ALICE,
        );
        assert_eq!(outcome, FrameOutcome::Continue);

        let outcome = handler.handle_frame(b"{not json", ALICE);
        assert_eq!(outcome, FrameOutcome::Close);

        let codes: Vec<_> = queue
            .take_all()
            .iter()
            .map(|d| error_code(std::slice::from_ref(d)))
            .collect();
        assert_eq!(
            codes,
            vec![
                ErrorCode::UnknownEventType,
                ErrorCode::InvalidPayload,
                ErrorCode::MalformedEvent,
            ]
        );
    }

    #[test]
    fn test_error_hook_sees_every_rejection() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (bus, _queue) = DeliveryBus::new();
        let hook_seen = seen.clone();
        let handler = CommandHandler::new(Arc::new(EntityStore::new()), bus)
            .with_error_hook(Arc::new(move |code| hook_seen.lock().unwrap().push(code)));

        handler.dispatch(ClientEvent::join_room("r1", "alice"), ALICE);
        handler.handle_frame(b"not json", ALICE);
        handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ErrorCode::RoomNotFound, ErrorCode::MalformedEvent]
        );
    }

    #[test]
    fn test_leave_with_unknown_token_still_answers() {
        let (handler, _queue) = handler();
        handler.dispatch(ClientEvent::create_room("r1", "alice"), ALICE);

        let out = handler.dispatch(ClientEvent::leave_room("r1", "bob", "not-a-token"), BOB);

        assert_eq!(out[0].target, Target::Connection(BOB));
        assert_eq!(events(&out), vec![ServerEvent::room_left("not-a-token", "r1")]);
        assert_eq!(handler.store().lock().room("r1").unwrap().member_count(), 1);
    }

    #[test]
    fn test_frame_limit_follows_configuration() {
        let body = "x".repeat(codec::MAX_FRAME_SIZE);
        let raw = codec::encode_client_event(&ClientEvent::send_message("r1", "bob", body))
            .unwrap();

        let (strict, mut strict_queue) = handler();
        assert_eq!(strict.handle_frame(&raw, ALICE), FrameOutcome::Close);
        assert_eq!(
            error_code(&strict_queue.take_all()),
            ErrorCode::MalformedEvent
        );

        let (relaxed, mut relaxed_queue) = handler();
        let relaxed = relaxed.with_max_frame_size(2 * codec::MAX_FRAME_SIZE);
        assert_eq!(relaxed.handle_frame(&raw, ALICE), FrameOutcome::Continue);
        // Decoded and handled; the room just does not exist
        assert_eq!(error_code(&relaxed_queue.take_all()), ErrorCode::RoomNotFound);
    }

    /// Drives the full path: frames in, writes out through the worker.
    #[tokio::test]
    async fn test_chat_scenario_end_to_end() {
        let store = Arc::new(EntityStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let (bus, queue) = DeliveryBus::new();
        let handler = CommandHandler::new(store.clone(), bus);
        let worker = DeliveryWorker::new(queue, store, registry.clone());
        let worker = tokio::spawn(worker.run());

        let alice = Arc::new(RecordingSink::default());
        let bob = Arc::new(RecordingSink::default());
        registry.register(ALICE, alice.clone());
        registry.register(BOB, bob.clone());

        handler.handle(ClientEvent::create_room("r1", "alice"), ALICE);
        handler.handle(ClientEvent::join_room("r1", "bob"), BOB);
        handler.handle(ClientEvent::send_message("r1", "bob", "hi"), BOB);
        handler.handle(ClientEvent::join_room("r1", "alice"), BOB);

        drop(handler);
        worker.await.unwrap();

        let alice_events = alice.events();
        assert_eq!(alice_events.len(), 3);
        assert!(matches!(alice_events[0], ServerEvent::RoomCreated(_)));
        assert!(matches!(alice_events[1], ServerEvent::RoomJoined(_)));
        assert_eq!(alice_events[2], ServerEvent::message_received("bob", "hi"));

        let bob_events = bob.events();
        assert_eq!(bob_events.len(), 3);
        assert!(matches!(bob_events[0], ServerEvent::RoomJoined(_)));
        assert_eq!(bob_events[1], ServerEvent::message_received("bob", "hi"));
        assert!(matches!(
            bob_events[2],
            ServerEvent::Error(ErrorData { code: ErrorCode::UsernameTaken, .. })
        ));
    }
}
