pub mod nosv;
pub mod ovni;

use crate::error::{Error, Result};
use crate::serialize::Event;

/// Reads the `index`-th i32 argument of the event payload.
pub(crate) fn arg(ev: &Event, index: usize) -> Result<i32> {
    ev.i32_arg(index).ok_or_else(|| {
        Error::state(format!(
            "event {} has no argument {} (payload of {} bytes)",
            ev.mcv(),
            index,
            ev.payload().len()
        ))
    })
}

pub(crate) fn unknown_event(ev: &Event) -> Error {
    Error::state(format!("unknown event {}", ev.mcv()))
}
