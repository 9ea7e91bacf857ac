//! Bidirectional byte relay between two streams.

use tokio::io::{AsyncRead, AsyncWrite};

/// Copies bytes in both directions between `a` and `b` until the streams
/// finish.
///
/// An EOF on one direction propagates as a write-side shutdown to the peer;
/// any error ends the relay and both streams are dropped (and with them
/// their sockets). A broken pipe is a normal way for a proxied connection to
/// end and is reported as a clean close.
///
/// Returns the number of bytes copied `a -> b` and `b -> a`. No user-space
/// buffering beyond the copy scratch space is involved; backpressure comes
/// from the socket buffers.
pub async fn splice<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match tokio::io::copy_bidirectional(a, b).await {
        Ok(counts) => Ok(counts),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok((0, 0)),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_bytes_flow_both_directions() {
        let (mut near_a, mut far_a) = tokio::io::duplex(64);
        let (mut near_b, mut far_b) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move { splice(&mut far_a, &mut near_b).await });

        near_a.write_all(b"ping").await.unwrap();
        let mut buf = [0_u8; 4];
        far_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far_b.write_all(b"pong").await.unwrap();
        near_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing both outer ends lets the relay finish.
        drop(near_a);
        drop(far_b);
        let (sent, received) = relay.await.unwrap().unwrap();
        assert_eq!(sent, 4);
        assert_eq!(received, 4);
    }

    #[tokio::test]
    async fn test_eof_propagates() {
        let (near_a, mut far_a) = tokio::io::duplex(64);
        let (mut near_b, mut far_b) = tokio::io::duplex(64);

        let relay = tokio::spawn(async move { splice(&mut far_a, &mut near_b).await });

        drop(near_a);
        drop(far_b);

        let (sent, received) = relay.await.unwrap().unwrap();
        assert_eq!((sent, received), (0, 0));
    }
}
