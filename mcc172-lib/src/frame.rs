//! Command/response framing for the SPI link.
//!
//! Outbound frames are `[0xDB, command, count_lo, count_hi, payload...]`.
//! Inbound frames carry an extra status byte after the command. The count is
//! a little-endian u16 giving the payload length, at most
//! [`MAX_TX_DATA_SIZE`] bytes.

use crate::constants::{Command, MAX_TX_DATA_SIZE, MSG_START, RX_HEADER_SIZE, TX_HEADER_SIZE};
use crate::error::{Error, Result};
use num_enum::FromPrimitive;

/// Build an outbound frame around `payload`.
pub fn encode(command: Command, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_TX_DATA_SIZE {
        return Err(Error::BadParameter("payload exceeds 256 bytes"));
    }

    let count = payload.len() as u16;
    let mut frame = Vec::with_capacity(TX_HEADER_SIZE + payload.len());
    frame.push(MSG_START);
    frame.push(command.into());
    frame.push(count as u8);
    frame.push((count >> 8) as u8);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Outcome of scanning a byte chunk for an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// A complete frame was located in the chunk.
    pub found: bool,
    /// Offset of the frame's start byte.
    pub frame_start: usize,
    /// Total frame length including the header.
    pub frame_length: usize,
    /// Payload bytes still missing when the chunk ended mid-frame. Feeding
    /// this many more bytes (appended to the chunk) completes the frame.
    pub remaining: usize,
}

/// Scanner states. The start byte resynchronises from any state on the next
/// call, since a failed chunk is always re-scanned from scratch.
enum State {
    SearchStart,
    Command,
    Status,
    CountLo,
    CountHi,
    Data,
}

/// Scan `chunk` for a valid inbound frame.
///
/// Byte-at-a-time state machine; never fails. When no complete frame is
/// present the outcome reports `found = false` and `remaining` says how many
/// payload bytes are still owed to the partially-parsed frame.
pub fn scan(chunk: &[u8]) -> ScanOutcome {
    let mut state = State::SearchStart;
    let mut outcome = ScanOutcome {
        found: false,
        frame_start: 0,
        frame_length: 0,
        remaining: 0,
    };
    let mut count: usize = 0;
    let mut data_index: usize = 0;

    for (index, &byte) in chunk.iter().enumerate() {
        match state {
            State::SearchStart => {
                if byte == MSG_START {
                    outcome.frame_start = index;
                    count = 0;
                    data_index = 0;
                    state = State::Command;
                }
            }
            State::Command => state = State::Status,
            State::Status => state = State::CountLo,
            State::CountLo => {
                count = byte as usize;
                state = State::CountHi;
            }
            State::CountHi => {
                count |= (byte as usize) << 8;
                if count == 0 {
                    outcome.remaining = 0;
                    outcome.found = true;
                    outcome.frame_length = RX_HEADER_SIZE;
                    return outcome;
                }
                outcome.remaining = count;
                state = State::Data;
            }
            State::Data => {
                outcome.remaining -= 1;
                data_index += 1;
                if data_index >= count {
                    outcome.found = true;
                    outcome.frame_length = count + RX_HEADER_SIZE;
                    return outcome;
                }
            }
        }
    }

    outcome
}

/// A located inbound frame, borrowed from the scanned chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxFrame<'a> {
    pub command: Command,
    pub status: u8,
    pub payload: &'a [u8],
}

/// Slice the frame fields out of a chunk at a [`scan`] hit.
pub fn split_frame(chunk: &[u8], outcome: ScanOutcome) -> RxFrame<'_> {
    debug_assert!(outcome.found);
    let start = outcome.frame_start;
    RxFrame {
        command: Command::from_primitive(chunk[start + 1]),
        status: chunk[start + 2],
        payload: &chunk[start + RX_HEADER_SIZE..start + outcome.frame_length],
    }
}
