//! # Transfer Receiver
//!
//! Writes chunks positionally as they arrive, tracks what is still
//! missing in a bitfield, answers `file-complete` with either an MD5
//! verification or a `missing-chunks` request, and stalls out when the
//! sender stops making progress.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{chunk_count, chunk_len, chunk_offset, FileInfo, MAX_RECOVERY_ROUNDS, STALL_TIMEOUT};
use crate::channel::ChannelWriter;
use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::event::{CoreEvent, EventSink, TransferDirection};
use crate::framing;
use crate::fsutil;

/// Everything a receiving transfer needs.
pub struct ReceiverParams {
    /// The announcement from `file-info`.
    pub info: FileInfo,
    /// Destination path (already sanitized and joined to the download dir).
    pub dest: PathBuf,
    /// Negotiated payload bytes per frame.
    pub payload_size: u32,
    /// Control-channel writer, for `missing-chunks`.
    pub control: ChannelWriter,
    /// Application event sink.
    pub events: EventSink,
}

/// Input routed to a receiving transfer.
#[derive(Debug)]
pub enum ReceiverInput {
    /// A raw frame from the data channel.
    Frame(Bytes),
    /// `file-complete` arrived on the control channel.
    Complete,
}

fn validate_announcement(info: &FileInfo, payload_size: u32) -> Result<()> {
    if info.md5.len() != 32 || !info.md5.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::TransferFailed(format!(
            "announced md5 {:?} is not 32 hex digits",
            info.md5
        )));
    }
    let expected = chunk_count(info.size, payload_size);
    if info.chunks != expected {
        return Err(Error::TransferFailed(format!(
            "announced {} chunks but {} bytes at payload {} need {}",
            info.chunks, info.size, payload_size, expected
        )));
    }
    Ok(())
}

/// Run a receiving transfer to completion.
///
/// Returns once the file verifies, or errors with `IntegrityMismatch`
/// (file left in place), `TransferStalled`, or `SessionClosed`.
pub async fn run_receiver(
    params: ReceiverParams,
    mut input_rx: mpsc::UnboundedReceiver<ReceiverInput>,
) -> Result<()> {
    let ReceiverParams { info, dest, payload_size, control, events } = params;
    validate_announcement(&info, payload_size)?;

    let file = fsutil::create_sized(&dest, info.size).await?;
    let chunks = info.chunks;
    let mut have = vec![false; chunks as usize];
    let mut missing_count = chunks;
    let mut received_bytes: u64 = 0;

    let mut last_progress = Instant::now();
    let mut stalled_rounds: u32 = 0;
    let mut missing_at_last_round: Option<u32> = None;

    events.status(format!(
        "receiving {} ({} bytes, {} chunks) -> {}",
        info.name,
        info.size,
        chunks,
        dest.display()
    ));

    loop {
        let deadline = last_progress + STALL_TIMEOUT;
        let input = tokio::select! {
            input = input_rx.recv() => match input {
                Some(input) => input,
                None => return Err(Error::SessionClosed),
            },
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::TransferStalled(format!(
                    "{} of {} chunks still missing after {}s without progress",
                    missing_count,
                    chunks,
                    STALL_TIMEOUT.as_secs()
                )));
            }
        };

        match input {
            ReceiverInput::Frame(frame) => {
                let (sequence, payload) = match framing::decode_chunk(&frame, payload_size) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        // Dropped; missing-chunks recovery covers the gap.
                        warn!(error = %e, "dropping malformed chunk");
                        continue;
                    }
                };
                if sequence >= chunks {
                    warn!(sequence, chunks, "dropping out-of-range chunk");
                    continue;
                }
                let expected_len = chunk_len(sequence, info.size, payload_size);
                if payload.len() as u32 != expected_len {
                    warn!(
                        sequence,
                        got = payload.len(),
                        expected = expected_len,
                        "dropping chunk with unexpected length"
                    );
                    continue;
                }

                let offset = chunk_offset(sequence, payload_size);
                fsutil::write_chunk_at(
                    std::sync::Arc::clone(&file),
                    offset,
                    frame.slice_ref(payload),
                )
                .await?;

                if !have[sequence as usize] {
                    have[sequence as usize] = true;
                    missing_count -= 1;
                    received_bytes += expected_len as u64;
                    last_progress = Instant::now();
                    events.emit(CoreEvent::TransferProgress {
                        direction: TransferDirection::Receive,
                        completed: chunks - missing_count,
                        total: chunks,
                        succeeded: chunks - missing_count,
                        failed: 0,
                    });
                } else {
                    debug!(sequence, "duplicate chunk ignored");
                }
            }

            ReceiverInput::Complete => {
                if missing_count == 0 {
                    debug_assert_eq!(received_bytes, info.size);
                    let actual = fsutil::md5_of_path(&dest).await?;
                    if actual != info.md5 {
                        // The file stays on disk for inspection.
                        return Err(Error::IntegrityMismatch {
                            expected: info.md5.clone(),
                            actual,
                        });
                    }
                    events.emit(CoreEvent::TransferDone {
                        direction: TransferDirection::Receive,
                        name: info.name.clone(),
                        size: info.size,
                    });
                    return Ok(());
                }

                if missing_at_last_round == Some(missing_count) {
                    stalled_rounds += 1;
                } else {
                    stalled_rounds = 1;
                }
                missing_at_last_round = Some(missing_count);
                if stalled_rounds >= MAX_RECOVERY_ROUNDS {
                    return Err(Error::TransferStalled(format!(
                        "{} chunks still missing after {} recovery rounds",
                        missing_count, stalled_rounds
                    )));
                }

                let sequences: Vec<u32> = have
                    .iter()
                    .enumerate()
                    .filter(|(_, &got)| !got)
                    .map(|(i, _)| i as u32)
                    .collect();
                debug!(missing = sequences.len(), "requesting retransmission");
                control
                    .send_json(&ControlMessage::MissingChunks { sequences })
                    .await?;
            }
        }
    }
}
