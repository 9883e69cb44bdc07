//! Length-prefixed framing over QUIC streams.
//!
//! Every reliable message is written as `[len: u32][bytes]`. A stream may
//! carry any number of frames; a clean finish at a frame boundary ends it.

use anyhow::{bail, Context, Result};
use quinn::{ReadExactError, RecvStream, SendStream};
use tracing::trace;

/// Largest frame accepted from a remote peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Write one frame.
pub async fn write_frame(stream: &mut SendStream, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit {}", data.len(), MAX_FRAME_LEN);
    }
    let len = data.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .context("Failed to write length prefix")?;
    stream
        .write_all(data)
        .await
        .context("Failed to write frame data")?;
    trace!(bytes = data.len(), "frame written");
    Ok(())
}

/// Read one frame; `None` when the stream finished cleanly between frames.
pub async fn read_frame(stream: &mut RecvStream) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(0)) => return Ok(None),
        Err(err) => return Err(err).context("Failed to read length prefix"),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds limit {MAX_FRAME_LEN}");
    }

    let mut data = vec![0u8; len];
    stream
        .read_exact(&mut data)
        .await
        .context("Failed to read frame data")?;
    trace!(bytes = len, "frame read");
    Ok(Some(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{bind_server_endpoint, client_endpoint};

    #[tokio::test]
    async fn frames_survive_a_shared_stream() {
        let server = bind_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let connection = server
                .accept()
                .await
                .expect("no incoming connection")
                .await
                .expect("failed to accept connection");
            let mut recv = connection.accept_uni().await.expect("no stream");
            let mut frames = Vec::new();
            while let Some(frame) = read_frame(&mut recv).await.expect("read failed") {
                frames.push(frame);
            }
            frames
        });

        let client = client_endpoint().unwrap();
        let connection = client
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .expect("failed to connect");
        let mut send = connection.open_uni().await.unwrap();
        write_frame(&mut send, b"first").await.unwrap();
        write_frame(&mut send, b"").await.unwrap();
        write_frame(&mut send, &[7u8; 4096]).await.unwrap();
        send.finish().unwrap();

        let frames = server_task.await.unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], b"first");
        assert!(frames[1].is_empty());
        assert_eq!(frames[2], vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_before_sending() {
        let server = bind_server_endpoint("127.0.0.1:0".parse().unwrap()).unwrap();
        let server_addr = server.local_addr().unwrap();
        let accept = tokio::spawn(async move { server.accept().await.unwrap().await.unwrap() });

        let client = client_endpoint().unwrap();
        let connection = client
            .connect(server_addr, "localhost")
            .unwrap()
            .await
            .unwrap();
        let _server_side = accept.await.unwrap();
        let mut send = connection.open_uni().await.unwrap();
        assert!(write_frame(&mut send, &vec![0u8; MAX_FRAME_LEN + 1])
            .await
            .is_err());
    }
}
