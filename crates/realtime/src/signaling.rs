//! Call signaling relay. Payloads are forwarded untouched to the other members
//! of a call room; nothing is validated or persisted.

use shared::{
    domain::{ConnectionId, RoomId},
    protocol::{RelayedSignal, ServerEvent, SignalPayload},
};
use tracing::{debug, info};

use crate::{error::RealtimeError, rooms::JoinOutcome, RealtimeContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Generic,
}

impl SignalKind {
    fn event(self, signal: RelayedSignal) -> ServerEvent {
        match self {
            Self::Offer => ServerEvent::Offer(signal),
            Self::Answer => ServerEvent::Answer(signal),
            Self::IceCandidate => ServerEvent::IceCandidate(signal),
            Self::Generic => ServerEvent::Signal(signal),
        }
    }
}

fn call_room(room_id: &str) -> Result<RoomId, RealtimeError> {
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Err(RealtimeError::validation("room id is required"));
    }
    Ok(RoomId::call(room_id))
}

pub fn join_room(
    ctx: &RealtimeContext,
    connection_id: ConnectionId,
    room_id: &str,
) -> Result<(), RealtimeError> {
    let joiner = ctx.connection(connection_id)?;
    let room = call_room(room_id)?;
    let outcome = match ctx.limits.max_call_participants {
        Some(capacity) => ctx.rooms.join_with_capacity(&room, connection_id, capacity),
        None => {
            if ctx.rooms.join(&room, connection_id) {
                JoinOutcome::Joined
            } else {
                JoinOutcome::AlreadyMember
            }
        }
    };
    match outcome {
        JoinOutcome::Full => Err(RealtimeError::validation("call room is full")),
        JoinOutcome::AlreadyMember => Ok(()),
        JoinOutcome::Joined => {
            let room_name = room_id.trim().to_string();
            ctx.broadcast(
                &room,
                &ServerEvent::UserConnected {
                    room_id: room_name.clone(),
                    user_id: joiner.user_id(),
                },
                Some(connection_id),
            );
            ctx.broadcast(
                &room,
                &ServerEvent::ReceiveCall {
                    room_id: room_name.clone(),
                    user: joiner.user.clone(),
                },
                Some(connection_id),
            );
            info!(user_id = %joiner.user_id(), room_id = %room_name, "joined call room");
            Ok(())
        }
    }
}

pub fn leave_room(
    ctx: &RealtimeContext,
    connection_id: ConnectionId,
    room_id: &str,
) -> Result<bool, RealtimeError> {
    let leaver = ctx.connection(connection_id)?;
    let room = call_room(room_id)?;
    if !ctx.rooms.leave(&room, connection_id) {
        return Ok(false);
    }
    ctx.broadcast(
        &room,
        &ServerEvent::UserDisconnected {
            room_id: room_id.trim().to_string(),
            user_id: leaver.user_id(),
        },
        None,
    );
    info!(user_id = %leaver.user_id(), room_id = %room_id.trim(), "left call room");
    Ok(true)
}

/// Forwards the payload to every other member of the room. Only members may
/// relay. Returns the number of peers reached.
pub fn relay(
    ctx: &RealtimeContext,
    connection_id: ConnectionId,
    kind: SignalKind,
    payload: SignalPayload,
) -> Result<usize, RealtimeError> {
    let room = call_room(&payload.room_id)?;
    if !ctx.rooms.contains(&room, connection_id) {
        debug!(%connection_id, %room, "relay from outside the call room refused");
        return Err(RealtimeError::authorization("not a member of this call room"));
    }
    let event = kind.event(RelayedSignal {
        room_id: payload.room_id.trim().to_string(),
        from: connection_id,
        data: payload.data,
    });
    let reached = ctx.broadcast(&room, &event, Some(connection_id));
    debug!(%connection_id, %room, event = event.name(), reached, "relayed signal");
    Ok(reached)
}

#[cfg(test)]
#[path = "tests/signaling_tests.rs"]
mod tests;
