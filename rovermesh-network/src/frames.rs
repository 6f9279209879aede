//! Length-prefixed frame reading, shared by the accepter (handshake)
//! and the per-peer receive loops.

use tokio::io::{AsyncRead, AsyncReadExt};

use rovermesh_core::wire::{Frame, MAX_FRAME_LEN};
use rovermesh_core::{MeshError, WireError};

/// Read one `u32`-BE length prefix and the frame body it announces.
///
/// An oversized length is unrecoverable (there is no way to resync the
/// stream); a body that fails to decode only costs that one frame.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame, MeshError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(MeshError::InvalidFrame(WireError::Oversize(len)));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Frame::decode(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn round_trip_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = Frame::Send {
            endpoint: "pose".into(),
            data: json!({"x": 1}),
        };
        client.write_all(&frame.encode()).await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(MeshError::InvalidFrame(WireError::Oversize(_)))
        ));
    }

    #[tokio::test]
    async fn undecodable_body_is_an_invalid_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&4u32.to_be_bytes()).await.unwrap();
        client.write_all(b"!!!!").await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(MeshError::InvalidFrame(_))
        ));
    }
}
