//! Length-prefixed wire framing.
//!
//! Every frame is a u32 big-endian length followed by a bincode-encoded
//! [`Frame`]. Ordering is guaranteed within a single connection only; the
//! receiving side tolerates reordering across connections.

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::proto::Frame;

/// Frames larger than this are refused outright; a length prefix beyond it
/// means a corrupt or hostile stream.
const MAX_FRAME_BYTES: u32 = 512 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(u32),

    #[error("undecodable frame: {0}")]
    Corrupt(#[from] bincode::Error),
}

/// Encode `frame` and write it with its length prefix.
///
/// The caller flushes; a sender batches several frames per flush.
pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> Result<(), CodecError>
where W: AsyncWrite + Unpin {
    let body = bincode::serialize(frame)?;
    let len = body.len() as u32;
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(len));
    }

    w.write_u32(len).await?;
    w.write_all(&body).await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(r: &mut R) -> Result<Option<Frame>, CodecError>
where R: AsyncRead + Unpin {
    let len = match r.read_u32().await {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;

    let frame = bincode::deserialize(&body)?;
    Ok(Some(frame))
}
