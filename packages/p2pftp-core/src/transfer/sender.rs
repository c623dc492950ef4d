//! # Transfer Sender
//!
//! Sliding-window chunk dispatch. A fixed pool of per-chunk tasks reads,
//! frames, and sends; the coordinator refills the window from a bounded
//! completion channel, so at most `window` chunks are in flight at any
//! point. Completion order is whatever the tasks produce; progress is
//! reported per completion, not per sequence.

use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    chunk_count, chunk_len, chunk_offset, FileInfo, CHUNK_RETRY_DELAY, MAX_RECOVERY_ROUNDS,
    SENDER_LINGER,
};
use crate::channel::ChannelWriter;
use crate::control::ControlMessage;
use crate::error::{Error, Result};
use crate::event::{CoreEvent, EventSink, TransferDirection};
use crate::framing;
use crate::fsutil;

/// Everything a sending transfer needs.
pub struct SenderParams {
    /// Open file handle, positioned reads only.
    pub file: Arc<File>,
    /// The announcement already carries the chunk count for
    /// `payload_size`.
    pub info: FileInfo,
    /// Negotiated payload bytes per frame.
    pub payload_size: u32,
    /// Maximum concurrently in-flight chunks.
    pub window: usize,
    /// Control-channel writer.
    pub control: ChannelWriter,
    /// Data-channel writer.
    pub data: ChannelWriter,
    /// Application event sink.
    pub events: EventSink,
    /// Set once every chunk has been attempted and `file-complete` is
    /// out; from then on a new outgoing transfer may preempt this one.
    pub settled: Arc<AtomicBool>,
}

/// Build the `file-info` for `path` with the session's payload size:
/// hashes the contents and counts chunks.
pub async fn describe_file(path: &std::path::Path, payload_size: u32) -> Result<(Arc<File>, FileInfo)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidState(format!("not a sendable path: {}", path.display())))?
        .to_string();

    let file = {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || File::open(&path))
            .await
            .map_err(|e| Error::TransferFailed(e.to_string()))??
    };
    let file = Arc::new(file);
    let size = file.metadata()?.len();
    let md5 = fsutil::md5_of(Arc::clone(&file), size).await?;

    let info = FileInfo {
        name,
        size,
        md5,
        chunks: chunk_count(size, payload_size),
    };
    Ok((file, info))
}

/// Read, frame, and send one chunk, retrying once after a short pause.
async fn send_chunk(
    file: Arc<File>,
    data: ChannelWriter,
    sequence: u32,
    offset: u64,
    len: usize,
) -> Result<()> {
    let payload = fsutil::read_chunk_at(file, offset, len).await?;
    let frame = framing::encode_chunk(sequence, &payload)?;

    match data.send_binary(frame.clone()).await {
        Ok(()) => Ok(()),
        Err(first) => {
            debug!(sequence, error = %first, "chunk send failed, retrying once");
            tokio::time::sleep(CHUNK_RETRY_DELAY).await;
            data.send_binary(frame).await
        }
    }
}

/// Run a sending transfer to completion.
///
/// `missing_rx` delivers `missing-chunks` requests routed from the control
/// dispatcher. The function returns once the receiver has gone quiet after
/// the final `file-complete`, or errors out after [`MAX_RECOVERY_ROUNDS`]
/// fruitless rounds.
pub async fn run_sender(params: SenderParams, mut missing_rx: mpsc::UnboundedReceiver<Vec<u32>>) -> Result<()> {
    let SenderParams { file, info, payload_size, window, control, data, events, settled } = params;
    let chunks = info.chunks;
    let window = window.max(1).min(chunks.max(1) as usize);

    control.send_json(&ControlMessage::file_info(&info)).await?;
    debug!(name = %info.name, size = info.size, chunks, "file announced");

    let (done_tx, mut done_rx) = mpsc::channel::<(u32, Result<()>)>(window);
    let mut next: u32 = 0;
    let mut inflight: usize = 0;
    let mut completed: u32 = 0;
    let mut succeeded: u32 = 0;
    let mut failed: u32 = 0;

    while completed < chunks {
        while inflight < window && next < chunks {
            let sequence = next;
            next += 1;
            inflight += 1;

            let file = Arc::clone(&file);
            let data = data.clone();
            let done = done_tx.clone();
            let offset = chunk_offset(sequence, payload_size);
            let len = chunk_len(sequence, info.size, payload_size) as usize;
            tokio::spawn(async move {
                let result = send_chunk(file, data, sequence, offset, len).await;
                let _ = done.send((sequence, result)).await;
            });
        }

        let (sequence, result) = done_rx
            .recv()
            .await
            .ok_or_else(|| Error::TransferFailed("chunk pool vanished".into()))?;
        inflight -= 1;
        completed += 1;
        match result {
            Ok(()) => succeeded += 1,
            Err(e) => {
                // The chunk already got its retry; missing-chunks recovery
                // picks it up later.
                warn!(sequence, error = %e, "chunk failed after retry");
                failed += 1;
            }
        }

        events.emit(CoreEvent::TransferProgress {
            direction: TransferDirection::Send,
            completed,
            total: chunks,
            succeeded,
            failed,
        });
    }

    control.send_json(&ControlMessage::FileComplete).await?;
    events.emit(CoreEvent::TransferDone {
        direction: TransferDirection::Send,
        name: info.name.clone(),
        size: info.size,
    });
    settled.store(true, Ordering::SeqCst);

    // Serve retransmission rounds until the receiver goes quiet.
    let mut rounds: u32 = 0;
    loop {
        tokio::select! {
            request = missing_rx.recv() => {
                let sequences = match request {
                    Some(sequences) => sequences,
                    None => return Ok(()),
                };
                if sequences.is_empty() {
                    continue;
                }

                rounds += 1;
                if rounds > MAX_RECOVERY_ROUNDS {
                    return Err(Error::TransferFailed(format!(
                        "receiver still missing {} chunks after {} rounds",
                        sequences.len(),
                        MAX_RECOVERY_ROUNDS
                    )));
                }

                events.status(format!(
                    "retransmitting {} chunks (round {rounds})",
                    sequences.len()
                ));
                for sequence in sequences {
                    if sequence >= chunks {
                        warn!(sequence, chunks, "ignoring out-of-range retransmit request");
                        continue;
                    }
                    let offset = chunk_offset(sequence, payload_size);
                    let len = chunk_len(sequence, info.size, payload_size) as usize;
                    if let Err(e) =
                        send_chunk(Arc::clone(&file), data.clone(), sequence, offset, len).await
                    {
                        warn!(sequence, error = %e, "retransmit failed");
                    }
                }
                control.send_json(&ControlMessage::FileComplete).await?;
            }
            _ = tokio::time::sleep(SENDER_LINGER) => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory, ChannelEvent, ChannelWriter, DATA_LABEL};
    use std::io::Write;

    fn temp_file_with(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        File::create(&path).unwrap().write_all(content).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_describe_file_counts_chunks() {
        let (_dir, path) = temp_file_with(&[0xaa; 8176]);
        let (_file, info) = describe_file(&path, 4088).await.unwrap();
        assert_eq!(info.name, "payload.bin");
        assert_eq!(info.size, 8176);
        assert_eq!(info.chunks, 2);
        assert_eq!(info.md5.len(), 32);
    }

    #[tokio::test]
    async fn test_sender_covers_every_byte_once() {
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (_dir, path) = temp_file_with(&content);
        let (file, info) = describe_file(&path, 4088).await.unwrap();
        assert_eq!(info.chunks, 3);

        let (ctrl_a, _ctrl_a_rx, _ctrl_b, mut ctrl_b_rx) = memory::pair("control");
        let (data_a, _data_a_rx, _data_b, mut data_b_rx) = memory::pair(DATA_LABEL);
        let control = ChannelWriter::spawn(ctrl_a, 256 * 1024);
        let data = ChannelWriter::spawn(data_a, 256 * 1024);
        let (events, _events_rx) = EventSink::new();
        let (_missing_tx, missing_rx) = mpsc::unbounded_channel();

        let settled = Arc::new(AtomicBool::new(false));
        let params = SenderParams {
            file,
            info: info.clone(),
            payload_size: 4088,
            window: 8,
            control,
            data,
            events,
            settled: Arc::clone(&settled),
        };
        let sender = tokio::spawn(run_sender(params, missing_rx));

        // Control channel: file-info then file-complete.
        assert!(matches!(ctrl_b_rx.recv().await, Some(ChannelEvent::Open)));
        let announce = match ctrl_b_rx.recv().await {
            Some(ChannelEvent::Text(text)) => text,
            other => panic!("unexpected: {:?}", other),
        };
        let parsed: ControlMessage = serde_json::from_str(&announce).unwrap();
        assert_eq!(parsed, ControlMessage::file_info(&info));

        // Data channel: exactly three frames reassembling the file.
        assert!(matches!(data_b_rx.recv().await, Some(ChannelEvent::Open)));
        let mut rebuilt = vec![0u8; content.len()];
        for _ in 0..info.chunks {
            match data_b_rx.recv().await {
                Some(ChannelEvent::Binary(frame)) => {
                    let (sequence, payload) = framing::decode_chunk(&frame, 4088).unwrap();
                    let offset = chunk_offset(sequence, 4088) as usize;
                    rebuilt[offset..offset + payload.len()].copy_from_slice(payload);
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert_eq!(rebuilt, content);

        let complete = match ctrl_b_rx.recv().await {
            Some(ChannelEvent::Text(text)) => text,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(
            serde_json::from_str::<ControlMessage>(&complete).unwrap(),
            ControlMessage::FileComplete
        );

        // Dropping the missing-request side lets the sender retire.
        drop(_missing_tx);
        sender.await.unwrap().unwrap();
        assert!(settled.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_empty_file_sends_no_frames() {
        let (_dir, path) = temp_file_with(b"");
        let (file, info) = describe_file(&path, 4088).await.unwrap();
        assert_eq!(info.chunks, 0);

        let (ctrl_a, _ctrl_a_rx, _ctrl_b, mut ctrl_b_rx) = memory::pair("control");
        let (data_a, _data_a_rx, _data_b, mut data_b_rx) = memory::pair(DATA_LABEL);
        let (events, _events_rx) = EventSink::new();
        let (missing_tx, missing_rx) = mpsc::unbounded_channel::<Vec<u32>>();

        let params = SenderParams {
            file,
            info,
            payload_size: 4088,
            window: 8,
            control: ChannelWriter::spawn(ctrl_a, 256 * 1024),
            data: ChannelWriter::spawn(data_a, 256 * 1024),
            events,
            settled: Arc::new(AtomicBool::new(false)),
        };
        drop(missing_tx);
        run_sender(params, missing_rx).await.unwrap();

        assert!(matches!(ctrl_b_rx.recv().await, Some(ChannelEvent::Open)));
        let mut control_texts = Vec::new();
        while let Ok(event) = ctrl_b_rx.try_recv() {
            if let ChannelEvent::Text(text) = event {
                control_texts.push(serde_json::from_str::<ControlMessage>(&text).unwrap());
            }
        }
        assert!(matches!(control_texts[0], ControlMessage::FileInfo { chunks: 0, .. }));
        assert_eq!(control_texts[1], ControlMessage::FileComplete);

        assert!(matches!(data_b_rx.try_recv(), Ok(ChannelEvent::Open)));
        assert!(data_b_rx.try_recv().is_err());
    }
}
