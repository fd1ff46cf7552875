//! Panic surfacing: walking the frame chain into a structured trace.
//!
//! Failures never unwind the handler stack; they become values. A panic walks the frame
//! headers from the faulting frame outward, attributing each frame to its source and token via
//! the module's bytecode-offset-to-token map, and renders one record per frame:
//! `{status, note, source, tok, wkid}`.

use murmur_core::{Kind, Status, Value};
use tracing::debug;

use crate::engine::Engine;

/// Builds the structured trace for a fault at `(fb, ip)`.
///
/// The faulting frame carries the status and note; ancestor frames contribute context with an
/// `ok` status and an empty note. The bottom frame is included only when it is itself the
/// faulting frame, matching how the frame chain terminates at the null return link.
pub(crate) fn panic_trace(
    engine: &Engine,
    stack: &[Value],
    fb: usize,
    ip: usize,
    status: Status,
    note: &str,
    wkid: usize,
) -> Value {
    debug!(wkid, %status, note, "building panic trace");

    let mut frames = vec![frame_record(engine, stack, fb, ip, status, note, wkid)];

    let mut ip = stack[fb - 2].raw_bits() as usize;
    let mut link = stack[fb - 1].raw_bits();
    while link != 0 {
        let fb = (link - 1) as usize;
        if stack[fb - 1].raw_bits() == 0 {
            break;
        }
        frames.push(frame_record(engine, stack, fb, ip, Status::None, "", wkid));
        ip = stack[fb - 2].raw_bits() as usize;
        link = stack[fb - 1].raw_bits();
    }

    engine.list_of(&frames)
}

fn frame_record(
    engine: &Engine,
    stack: &[Value],
    fb: usize,
    ip: usize,
    status: Status,
    note: &str,
    wkid: usize,
) -> Value {
    let block = stack[fb - 3];
    let (source, tok) = if block.kind() == Kind::Block {
        let prototype = engine.heap().get(block).as_block().prototype;
        let proto_obj = engine.heap().get(prototype);
        let module = engine.module(proto_obj.as_prototype().module());
        (engine.string(module.name()), module.token_at(ip.saturating_sub(1)))
    } else {
        (engine.string(""), 0)
    };

    engine.record_of(&[
        (engine.message("status"), engine.message(status.sigil_name())),
        (engine.message("note"), engine.string(note)),
        (engine.message("source"), source),
        (engine.message("tok"), Value::number(tok as f64)),
        (engine.message("wkid"), Value::number(wkid as f64)),
    ])
}
