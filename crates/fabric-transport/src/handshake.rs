//! TCP rendezvous handshake.
//!
//! The accepting side always reads before it writes and the connecting side
//! always writes before it reads, so the two can never both block in a read.
//! Every message is a fixed-size bincode struct.
//!
//! 1. both directions: [`Identity`]
//! 2. server to client: [`ServerQueueAttrs`]
//! 3. client to server: [`ClientQueueAttrs`]
//! 4. both directions: [`ReadyBarrier`]

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::nic::{InstanceId, MemHandle, PlacementInfo};

const READY_MARKER: u32 = 0x5244_5921;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub instance: InstanceId,
    pub placement: PlacementInfo,
}

/// The server's request-queue descriptor. `req_count == 0` means the server
/// has no request queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerQueueAttrs {
    pub req_index_addr: u64,
    pub req_index_mem: MemHandle,
    pub req_buffer_addr: u64,
    pub req_size: u64,
    pub req_count: u64,
    pub req_mem: MemHandle,
    pub wc_buffer_addr: u64,
    pub wc_mem: MemHandle,
}

impl ServerQueueAttrs {
    pub fn has_queue(&self) -> bool {
        self.req_count > 0
    }
}

/// Where the server delivers unblock notifications for this client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientQueueAttrs {
    pub unblock_addr: u64,
    pub unblock_mem: MemHandle,
}

impl ClientQueueAttrs {
    pub fn is_set(&self) -> bool {
        !self.unblock_mem.is_null()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct ReadyBarrier {
    marker: u32,
}

fn write_msg<T: Serialize, W: Write>(stream: &mut W, msg: &T, phase: &'static str) -> Result<()> {
    let bytes = bincode::serialize(msg)?;
    stream
        .write_all(&bytes)
        .and_then(|_| stream.flush())
        .map_err(|source| TransportError::Handshake { phase, source })
}

fn read_msg<T, R>(stream: &mut R, phase: &'static str) -> Result<T>
where
    T: DeserializeOwned + Serialize + Default,
    R: Read,
{
    let len = bincode::serialized_size(&T::default())? as usize;
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .map_err(|source| TransportError::Handshake { phase, source })?;
    Ok(bincode::deserialize(&buf)?)
}

fn check_barrier(barrier: ReadyBarrier) -> Result<()> {
    if barrier.marker == READY_MARKER {
        Ok(())
    } else {
        Err(TransportError::Handshake {
            phase: "ready barrier",
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unexpected barrier marker {:#x}", barrier.marker),
            ),
        })
    }
}

/// Accepting side. Returns the client's identity and unblock descriptor.
pub fn server_handshake<S: Read + Write>(
    stream: &mut S,
    local: Identity,
    queue: ServerQueueAttrs,
) -> Result<(Identity, ClientQueueAttrs)> {
    let peer: Identity = read_msg(stream, "identity")?;
    write_msg(stream, &local, "identity")?;
    write_msg(stream, &queue, "queue descriptor")?;
    let client: ClientQueueAttrs = read_msg(stream, "client descriptor")?;
    check_barrier(read_msg(stream, "ready barrier")?)?;
    write_msg(
        stream,
        &ReadyBarrier {
            marker: READY_MARKER,
        },
        "ready barrier",
    )?;
    Ok((peer, client))
}

/// Connecting side. `client_attrs` runs between receiving the server's queue
/// descriptor and sending the client's own; it builds whatever local state
/// the descriptor calls for.
pub fn client_handshake<S, F>(
    stream: &mut S,
    local: Identity,
    client_attrs: F,
) -> Result<(Identity, ServerQueueAttrs)>
where
    S: Read + Write,
    F: FnOnce(&Identity, &ServerQueueAttrs) -> Result<ClientQueueAttrs>,
{
    write_msg(stream, &local, "identity")?;
    let peer: Identity = read_msg(stream, "identity")?;
    let queue: ServerQueueAttrs = read_msg(stream, "queue descriptor")?;
    let attrs = client_attrs(&peer, &queue)?;
    write_msg(stream, &attrs, "client descriptor")?;
    write_msg(
        stream,
        &ReadyBarrier {
            marker: READY_MARKER,
        },
        "ready barrier",
    )?;
    check_barrier(read_msg(stream, "ready barrier")?)?;
    Ok((peer, queue))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn identity(instance: InstanceId) -> Identity {
        Identity {
            instance,
            placement: PlacementInfo {
                device_id: 0,
                local_addr: 0x4000 + instance,
                ptag: 1,
                cookie: 2,
            },
        }
    }

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    #[test]
    fn test_full_exchange() {
        let (mut server, mut client) = socket_pair();
        let queue = ServerQueueAttrs {
            req_buffer_addr: 0x1000,
            req_size: 512,
            req_count: 8,
            ..Default::default()
        };
        let server_thread =
            thread::spawn(move || server_handshake(&mut server, identity(1), queue).unwrap());

        let (peer, got_queue) = client_handshake(&mut client, identity(2), |peer, q| {
            assert_eq!(peer.instance, 1);
            assert!(q.has_queue());
            Ok(ClientQueueAttrs {
                unblock_addr: 0x2000,
                unblock_mem: MemHandle { qword1: 5, qword2: 0x2000 },
            })
        })
        .unwrap();
        let (client_id, client_attrs) = server_thread.join().unwrap();

        assert_eq!(peer, identity(1));
        assert_eq!(got_queue, queue);
        assert_eq!(client_id, identity(2));
        assert!(client_attrs.is_set());
        assert_eq!(client_attrs.unblock_addr, 0x2000);
    }

    #[test]
    fn test_server_without_queue() {
        let (mut server, mut client) = socket_pair();
        let server_thread = thread::spawn(move || {
            server_handshake(&mut server, identity(1), ServerQueueAttrs::default()).unwrap()
        });
        let (_, queue) = client_handshake(&mut client, identity(2), |_, q| {
            assert!(!q.has_queue());
            Ok(ClientQueueAttrs::default())
        })
        .unwrap();
        let (_, attrs) = server_thread.join().unwrap();
        assert!(!queue.has_queue());
        assert!(!attrs.is_set());
    }

    #[test]
    fn test_truncated_identity_is_eio() {
        let (mut server, mut client) = socket_pair();
        client.write_all(&[1, 2, 3]).unwrap();
        drop(client);
        let err = server_handshake(&mut server, identity(1), ServerQueueAttrs::default())
            .unwrap_err();
        assert!(matches!(err, TransportError::Handshake { phase: "identity", .. }));
        assert_eq!(err.code(), ResultCode::Io);
    }

    #[test]
    fn test_bad_barrier_rejected() {
        let (mut server, mut client) = socket_pair();
        let server_thread = thread::spawn(move || {
            let _: Identity = read_msg(&mut server, "identity").unwrap();
            write_msg(&mut server, &identity(1), "identity").unwrap();
            write_msg(&mut server, &ServerQueueAttrs::default(), "queue descriptor").unwrap();
            let _: ClientQueueAttrs = read_msg(&mut server, "client descriptor").unwrap();
            let _: ReadyBarrier = read_msg(&mut server, "ready barrier").unwrap();
            write_msg(&mut server, &ReadyBarrier { marker: 7 }, "ready barrier").unwrap();
        });
        let err = client_handshake(&mut client, identity(2), |_, _| {
            Ok(ClientQueueAttrs::default())
        })
        .unwrap_err();
        server_thread.join().unwrap();
        assert!(matches!(err, TransportError::Handshake { phase: "ready barrier", .. }));
    }
}
