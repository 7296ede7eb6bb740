//! Feeders that turn raw s16le stereo PCM into pipeline frames.

use std::io;

use bytes::Bytes;
use cadence_codec::audio::opus::{FRAME_BYTES, FRAME_SAMPLES};
use cadence_models::Snowflake;
use futures_util::TryStreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::io::StreamReader;

use crate::pipeline::{AudioFrame, PipelineInput};

/// How a chunked item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEnd {
    /// Input exhausted; the item was closed with a Skip tag.
    Completed { frames: u64 },
    /// The pipeline stopped or skipped the item first.
    Cancelled,
}

/// Read PCM from `reader` in 20 ms frames until EOF.
pub fn spawn_pcm_reader<R>(
    reader: R,
    input: PipelineInput,
    user_id: Option<Snowflake>,
) -> JoinHandle<io::Result<SourceEnd>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = pump(reader, &input, user_id).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "pcm source failed");
            input.send(AudioFrame::cancel().with_user(user_id)).await;
        }
        result
    })
}

/// Stream a remote raw PCM body through the same chunker.
pub fn spawn_http_source(
    http: reqwest::Client,
    url: String,
    input: PipelineInput,
    user_id: Option<Snowflake>,
) -> JoinHandle<io::Result<SourceEnd>> {
    tokio::spawn(async move {
        let result = async {
            let response = http
                .get(&url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(io::Error::other)?;
            tracing::info!(%url, status = %response.status(), "http audio source opened");
            let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
            tokio::pin!(body);
            pump(body, &input, user_id).await
        }
        .await;

        if let Err(e) = &result {
            tracing::warn!(%url, error = %e, "http audio source failed");
            input.send(AudioFrame::cancel().with_user(user_id)).await;
        }
        result
    })
}

async fn pump<R>(mut reader: R, input: &PipelineInput, user_id: Option<Snowflake>) -> io::Result<SourceEnd>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; FRAME_BYTES];
    let mut frames = 0u64;
    loop {
        let filled = read_frame(&mut reader, &mut buf).await?;
        if filled == 0 {
            break;
        }
        // Zero-pad the trailing partial frame.
        buf[filled..].fill(0);
        let frame = AudioFrame::pcm(to_samples(&buf)).with_user(user_id);
        if !input.send(frame).await {
            return Ok(SourceEnd::Cancelled);
        }
        frames += 1;
        if filled < FRAME_BYTES {
            break;
        }
    }

    if !input.send(AudioFrame::skip().with_user(user_id)).await {
        return Ok(SourceEnd::Cancelled);
    }
    tracing::debug!(frames, "pcm source complete");
    Ok(SourceEnd::Completed { frames })
}

/// Fill `buf` unless EOF comes first. Returns the byte count read.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn to_samples(bytes: &[u8]) -> Vec<i16> {
    let mut samples = Vec::with_capacity(FRAME_SAMPLES);
    samples.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
    );
    samples
}

/// Raw PCM bytes for one frame of `samples`, handy for tests and tools.
pub fn pcm_bytes(samples: &[i16]) -> Bytes {
    samples
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect::<Vec<u8>>()
        .into()
}
