//! Continuation capture: tasklet state to portable bytes

use crate::error::{SchedError, SchedResult};
use crate::scheduler::{Tasklet, TaskletState};
use crate::snapshot::format::{self, SnapshotError};
use crate::sync::{registry, Dir};
use std::sync::Arc;

/// Serialize a suspended tasklet into a portable continuation snapshot.
///
/// The tasklet must be soft: paused, scheduled, or blocked, with no live
/// native frames and a capturable invocable. Anything else is C state (or
/// has no execution state to speak of) and fails.
pub fn capture(tasklet: &Arc<Tasklet>) -> SchedResult<Vec<u8>> {
    let state = tasklet.state();
    match state {
        TaskletState::Running => {
            return Err(SchedError::State("cannot capture a running tasklet"))
        }
        TaskletState::Dead => return Err(SchedError::State("cannot capture a dead tasklet")),
        TaskletState::Unbound => {
            return Err(SchedError::State("cannot capture an unbound tasklet"))
        }
        TaskletState::Paused | TaskletState::Scheduled | TaskletState::Blocked => {}
    }

    let frame = tasklet
        .with_continuation(|c| c.capture())
        .ok_or(SchedError::State("C state"))?;

    let mut buf = Vec::new();
    format::write_header(&mut buf);

    format::write_segment(
        &mut buf,
        format::SEG_FLAGS,
        &[
            tasklet.atomic() as u8,
            tasklet.block_trap() as u8,
            tasklet.ignore_nesting() as u8,
        ],
    );

    format::write_segment(&mut buf, format::SEG_STATE, &[encode_state(state)]);

    let mut frame_bytes = Vec::new();
    frame_bytes.extend_from_slice(&(frame.factory.len() as u32).to_le_bytes());
    frame_bytes.extend_from_slice(frame.factory.as_bytes());
    frame_bytes.extend_from_slice(&frame.pc.to_le_bytes());
    frame_bytes.extend_from_slice(&(frame.locals.len() as u32).to_le_bytes());
    for local in &frame.locals {
        local.encode(&mut frame_bytes).map_err(SnapshotError::Io)?;
    }
    format::write_segment(&mut buf, format::SEG_FRAME, &frame_bytes);

    if let Some(exc) = tasklet.pending_exc() {
        let mut exc_bytes = Vec::new();
        exc.encode(&mut exc_bytes).map_err(SnapshotError::Io)?;
        format::write_segment(&mut buf, format::SEG_PENDING_EXC, &exc_bytes);
    }

    if state == TaskletState::Blocked {
        let blocked = tasklet
            .blocked_on()
            .ok_or(SchedError::State("blocked tasklet has no channel"))?;
        let channel = registry::lookup(blocked.channel)
            .ok_or(SchedError::State("blocked tasklet's channel is gone"))?;
        let (position, payload) = channel
            .waiter_position(tasklet)
            .ok_or(SchedError::State("blocked tasklet left its channel queue"))?;

        let mut chan_bytes = Vec::new();
        chan_bytes.extend_from_slice(&blocked.channel.as_u64().to_le_bytes());
        chan_bytes.push(match blocked.dir {
            Dir::Send => 0,
            Dir::Receive => 1,
        });
        chan_bytes.extend_from_slice(&position.to_le_bytes());
        match payload {
            Some(slot) => {
                chan_bytes.push(1);
                format::write_wake_slot(&mut chan_bytes, &slot).map_err(SnapshotError::Io)?;
            }
            None => chan_bytes.push(0),
        }
        format::write_segment(&mut buf, format::SEG_CHANNEL, &chan_bytes);
    }

    format::seal(&mut buf);
    Ok(buf)
}

pub(crate) fn encode_state(state: TaskletState) -> u8 {
    match state {
        TaskletState::Paused => 0,
        TaskletState::Scheduled => 1,
        TaskletState::Blocked => 2,
        // Unreachable here; capture rejects the other states up front.
        _ => 0,
    }
}
