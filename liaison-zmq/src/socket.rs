//! Socket helpers shared by every ZeroMQ transport.

use crate::context::ZmqContext;
use bytes::Bytes;
use liaison_core::options::ProtocolOptions;
use liaison_core::services::bind_leased_port;
use liaison_core::{LiaisonError, Result};
use rand::RngCore;

/// Map a ZeroMQ error into the transport error of the protocol layer.
pub fn transport_error(e: zmq::Error) -> LiaisonError {
    LiaisonError::Transport(e.to_string())
}

/// Create a socket with the linger configured in `options`.
pub fn new_socket(
    ctx: &zmq::Context,
    kind: zmq::SocketType,
    options: &ProtocolOptions,
) -> Result<zmq::Socket> {
    let socket = ctx.socket(kind).map_err(transport_error)?;
    socket
        .set_linger(options.linger_millis())
        .map_err(transport_error)?;
    Ok(socket)
}

/// Bind `socket` on a port leased from the context's port service.
///
/// Ports that fail to bind are reported unavailable and replaced.
pub fn bind_leased(
    socket: &zmq::Socket,
    ctx: &ZmqContext,
    owner: &str,
    options: &ProtocolOptions,
) -> Result<u16> {
    let (port, ()) = bind_leased_port(ctx.ports(), owner, |port| {
        socket.bind(&options.bind_address(port))
    })?;
    Ok(port)
}

/// Fresh `inproc://` endpoint, unique within the process.
pub fn unique_inproc(prefix: &str) -> String {
    let mut id = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut id);
    format!("inproc://{}.{}", prefix, hex::encode(id))
}

/// Receive every frame of the next message.
///
/// `Ok(None)` once the context is terminated; with `zmq::DONTWAIT`, also
/// when nothing is pending.
pub fn recv_frames(socket: &zmq::Socket, flags: i32) -> Result<Option<Vec<Bytes>>> {
    match socket.recv_multipart(flags) {
        Ok(frames) => Ok(Some(frames.into_iter().map(Bytes::from).collect())),
        Err(zmq::Error::ETERM | zmq::Error::EAGAIN) => Ok(None),
        Err(e) => Err(transport_error(e)),
    }
}

/// Send `frames` as one multipart message.
pub fn send_frames(socket: &zmq::Socket, frames: &[Bytes]) -> Result<()> {
    socket
        .send_multipart(frames.iter().map(|frame| &frame[..]), 0)
        .map_err(transport_error)
}

/// Wait up to `timeout_ms` for a message; -1 waits forever.
pub fn wait_readable(socket: &zmq::Socket, timeout_ms: i64) -> Result<bool> {
    let ready = socket.poll(zmq::POLLIN, timeout_ms).map_err(transport_error)?;
    Ok(ready > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_inproc() {
        let a = unique_inproc("cancel");
        let b = unique_inproc("cancel");
        assert!(a.starts_with("inproc://cancel."));
        assert_eq!(a.len(), "inproc://cancel.".len() + 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_frames_over_inproc_pair() {
        let ctx = zmq::Context::new();
        let options = ProtocolOptions::default();
        let endpoint = unique_inproc("pair");

        let a = new_socket(&ctx, zmq::PAIR, &options).unwrap();
        a.bind(&endpoint).unwrap();
        let b = new_socket(&ctx, zmq::PAIR, &options).unwrap();
        b.connect(&endpoint).unwrap();

        let sent = vec![Bytes::new(), Bytes::from_static(b"\x00\xff"), Bytes::new()];
        send_frames(&a, &sent).unwrap();

        assert!(wait_readable(&b, 1000).unwrap());
        assert_eq!(recv_frames(&b, 0).unwrap(), Some(sent));
        assert_eq!(recv_frames(&b, zmq::DONTWAIT).unwrap(), None);
    }
}
