//! Continuation restore: portable bytes back to a runnable tasklet

use crate::continuation::Continuation;
use crate::error::{SchedError, SchedResult};
use crate::exception::Exc;
use crate::invoke::{self, InvocableCapture};
use crate::scheduler::scheduler;
use crate::scheduler::{Scheduler, Tasklet, TaskletState, WakeSlot};
use crate::scheduler::tasklet::TaskletId;
use crate::snapshot::format::{self, SnapshotError};
use crate::sync::{registry, ChannelId, Dir};
use crate::value::Value;
use std::io::Read;
use std::sync::Arc;

struct ChannelMembership {
    channel: ChannelId,
    dir: Dir,
    position: u32,
    payload: Option<WakeSlot>,
}

/// Rebuild a tasklet from a continuation snapshot.
///
/// The restored tasklet gets a fresh identity and is bound to the calling
/// thread's scheduler. A snapshot captured as scheduled re-enters the run
/// queue; one captured as blocked re-joins its channel's waiter queue at
/// the captured position (clamped if the queue shrank meanwhile).
pub fn restore(bytes: &[u8]) -> SchedResult<Arc<Tasklet>> {
    let body = format::open(bytes)?;

    let mut flags: Option<(bool, bool, bool)> = None;
    let mut state: Option<u8> = None;
    let mut frame: Option<InvocableCapture> = None;
    let mut pending_exc: Option<Exc> = None;
    let mut membership: Option<ChannelMembership> = None;

    for segment in format::segments(body) {
        let (tag, payload) = segment?;
        match tag {
            format::SEG_FLAGS => {
                if payload.len() != 3 {
                    return Err(SnapshotError::Malformed("flags segment length").into());
                }
                flags = Some((payload[0] != 0, payload[1] != 0, payload[2] != 0));
            }
            format::SEG_STATE => {
                if payload.len() != 1 {
                    return Err(SnapshotError::Malformed("state segment length").into());
                }
                state = Some(payload[0]);
            }
            format::SEG_FRAME => frame = Some(parse_frame(&payload)?),
            format::SEG_PENDING_EXC => {
                pending_exc = Some(Exc::decode(&mut &payload[..]).map_err(SnapshotError::Io)?);
            }
            format::SEG_CHANNEL => membership = Some(parse_membership(&payload)?),
            // Unknown segments from a newer writer of the same version are
            // skipped rather than rejected.
            _ => {}
        }
    }

    let frame = frame.ok_or(SnapshotError::Malformed("missing frame segment"))?;
    let state = state.ok_or(SnapshotError::Malformed("missing state segment"))?;

    let invocable = invoke::restore_invocable(&frame)?;

    let sched = Scheduler::current();
    let tasklet = Arc::new(Tasklet::raw(TaskletId::new(), Some(sched.id()), false));
    tasklet.with_continuation(|c| *c = Continuation::new(invocable));
    tasklet.set_state(TaskletState::Paused);

    if let Some((atomic, block_trap, ignore_nesting)) = flags {
        tasklet.set_atomic(atomic);
        tasklet.set_block_trap(block_trap);
        tasklet.set_ignore_nesting(ignore_nesting);
    }
    if let Some(exc) = pending_exc {
        tasklet.set_pending_exc(exc);
    }

    match state {
        // Paused: bound, out of every queue.
        0 => {}
        // Scheduled: take a fresh place at the back of the run queue.
        1 => scheduler::route_insert(&tasklet, false)?,
        // Blocked: re-join the channel's waiter queue.
        2 => {
            let membership = membership
                .ok_or(SnapshotError::Malformed("blocked snapshot without channel segment"))?;
            let channel = registry::lookup(membership.channel)
                .ok_or(SchedError::State("channel from snapshot no longer exists"))?;
            channel.reinsert_waiter(
                &tasklet,
                membership.dir,
                membership.position,
                membership.payload,
            )?;
        }
        _ => return Err(SnapshotError::Malformed("unknown state tag").into()),
    }

    Ok(tasklet)
}

fn parse_frame(payload: &[u8]) -> Result<InvocableCapture, SnapshotError> {
    let mut reader = payload;

    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|_| SnapshotError::Truncated)?;
    let name_len = u32::from_le_bytes(buf) as usize;
    let mut name = vec![0u8; name_len];
    reader.read_exact(&mut name).map_err(|_| SnapshotError::Truncated)?;
    let factory = String::from_utf8(name)
        .map_err(|_| SnapshotError::Malformed("factory name is not utf-8"))?;

    reader.read_exact(&mut buf).map_err(|_| SnapshotError::Truncated)?;
    let pc = u32::from_le_bytes(buf);

    reader.read_exact(&mut buf).map_err(|_| SnapshotError::Truncated)?;
    let count = u32::from_le_bytes(buf) as usize;
    let mut locals = Vec::with_capacity(count);
    for _ in 0..count {
        locals.push(Value::decode(&mut reader).map_err(SnapshotError::Io)?);
    }

    Ok(InvocableCapture { factory, pc, locals })
}

fn parse_membership(payload: &[u8]) -> Result<ChannelMembership, SnapshotError> {
    let mut reader = payload;

    let mut id_buf = [0u8; 8];
    reader.read_exact(&mut id_buf).map_err(|_| SnapshotError::Truncated)?;
    let channel = ChannelId::from_u64(u64::from_le_bytes(id_buf));

    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte).map_err(|_| SnapshotError::Truncated)?;
    let dir = match byte[0] {
        0 => Dir::Send,
        1 => Dir::Receive,
        _ => return Err(SnapshotError::Malformed("unknown channel direction")),
    };

    let mut pos_buf = [0u8; 4];
    reader.read_exact(&mut pos_buf).map_err(|_| SnapshotError::Truncated)?;
    let position = u32::from_le_bytes(pos_buf);

    reader.read_exact(&mut byte).map_err(|_| SnapshotError::Truncated)?;
    let payload_slot = match byte[0] {
        0 => None,
        1 => Some(format::read_wake_slot(&mut reader)?),
        _ => return Err(SnapshotError::Malformed("unknown payload flag")),
    };

    Ok(ChannelMembership {
        channel,
        dir,
        position,
        payload: payload_slot,
    })
}
