//! End-to-end tests: several transports on one simulated fabric, connected
//! over real loopback rendezvous sockets.

mod common;

use std::io::Write;
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use common::{connect_client, eventually, fast_config, transport, TIMEOUT};
use fabric_transport::{
    CancelReason, OpState, Operation, RemoteBuffer, ResultCode, Role, SimFabric, Transport,
    TransportConfig,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_put_round_trip() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);

    let mut dst = server
        .register(vec![0u8; 4096], 1, Role::PutDst, Some(&client.on_server))
        .unwrap();
    let data = pattern(1024);
    let mut src = client
        .transport
        .register(data.clone(), 1, Role::PutSrc, Some(&client.server))
        .unwrap();

    client
        .transport
        .put(&mut src, 0, 1024, &dst.remote(), 0)
        .unwrap();
    let sent = client.transport.wait(&mut src, Operation::Put, TIMEOUT).unwrap();
    assert_eq!(sent.result, ResultCode::Ok);
    assert_eq!(sent.length, 1024);
    assert_eq!(sent.offset, 0);
    assert_eq!(sent.src.as_ref().unwrap().instance, client.transport.instance());
    assert_eq!(sent.dest.as_ref().unwrap().instance, server.instance());

    let landed = server.wait(&mut dst, Operation::Put, TIMEOUT).unwrap();
    assert_eq!(landed.op, Operation::Put);
    assert_eq!(landed.length, 1024);
    assert_eq!(landed.offset, 0);
    assert_eq!(landed.src.as_ref().unwrap().instance, client.transport.instance());
    assert_eq!(landed.dest.as_ref().unwrap().instance, server.instance());
    assert_eq!(dst.read(0, 1024).unwrap(), data);
    assert_eq!(dst.state(), OpState::Complete);

    client.transport.unregister(src).unwrap();
    server.unregister(dst).unwrap();
    assert_eq!(client.transport.metrics().bytes_put, 1024);
}

#[test]
fn test_put_offsets_and_rearm() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);

    let mut dst = server
        .register(vec![0u8; 1024], 1, Role::PutDst, Some(&client.on_server))
        .unwrap();
    let mut src = client
        .transport
        .register(pattern(256), 1, Role::PutSrc, Some(&client.server))
        .unwrap();
    let remote = dst.remote();

    client.transport.put(&mut src, 16, 64, &remote, 128).unwrap();
    let sent = client.transport.wait(&mut src, Operation::Put, TIMEOUT).unwrap();
    assert_eq!(sent.offset, 16);
    let landed = server.wait(&mut dst, Operation::Put, TIMEOUT).unwrap();
    assert_eq!(landed.offset, 128);
    assert_eq!(landed.length, 64);
    assert!(dst.is_complete());

    // The next wait on the target re-arms it and waits for the next put.
    client.transport.put(&mut src, 0, 32, &remote, 512).unwrap();
    client.transport.wait(&mut src, Operation::Put, TIMEOUT).unwrap();
    let second = server.wait(&mut dst, Operation::Put, TIMEOUT).unwrap();
    assert_eq!(second.offset, 512);
    assert_eq!(second.length, 32);
    assert_eq!(dst.read(512, 32).unwrap(), pattern(32));
}

#[test]
fn test_get_round_trip() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);

    let data = pattern(512);
    let mut src = server
        .register(data.clone(), 1, Role::GetSrc, Some(&client.on_server))
        .unwrap();
    let mut dst = client
        .transport
        .register(vec![0u8; 512], 1, Role::GetDst, Some(&client.server))
        .unwrap();

    client
        .transport
        .get(&src.remote(), 100, 200, &mut dst, 50)
        .unwrap();
    let pulled = client.transport.wait(&mut dst, Operation::Get, TIMEOUT).unwrap();
    assert_eq!(pulled.op, Operation::Get);
    assert_eq!(pulled.length, 200);
    assert_eq!(pulled.offset, 50);
    assert_eq!(pulled.src.as_ref().unwrap().instance, server.instance());
    assert_eq!(dst.read(50, 200).unwrap(), data[100..300].to_vec());

    let served = server.wait(&mut src, Operation::Get, TIMEOUT).unwrap();
    assert_eq!(served.length, 200);
    assert_eq!(served.offset, 100);
    assert_eq!(served.src.as_ref().unwrap().instance, server.instance());
    assert_eq!(served.dest.as_ref().unwrap().instance, client.transport.instance());
    assert_eq!(client.transport.metrics().bytes_got, 200);
}

#[test]
fn test_out_of_range_transfers_rejected() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);

    let dst = server
        .register(vec![0u8; 128], 1, Role::PutDst, Some(&client.on_server))
        .unwrap();
    let mut src = client
        .transport
        .register(vec![0u8; 256], 1, Role::PutSrc, Some(&client.server))
        .unwrap();

    let err = client
        .transport
        .put(&mut src, 0, 256, &dst.remote(), 0)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidArgument);
    let err = client
        .transport
        .put(&mut src, 0, 0, &dst.remote(), 0)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidArgument);

    // A descriptor decoded off the wire whose address wraps past u64::MAX.
    let mut descriptor = dst.remote();
    descriptor.addr = u64::MAX - 16;
    let forged = RemoteBuffer::from_bytes(&descriptor.to_bytes().unwrap()).unwrap();
    let err = client
        .transport
        .put(&mut src, 0, 64, &forged, 32)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidArgument);
    assert_eq!(src.state(), OpState::Init);
}

#[test]
fn test_requests_delivered_in_slot_order() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let mut queue = server
        .register(vec![0u8; 8 * 256], 256, Role::RequestQueue, None)
        .unwrap();
    let a = connect_client(&fabric, &server);
    let b = connect_client(&fabric, &server);
    let mut ha = a
        .transport
        .register(vec![0u8; 256], 1, Role::Send, Some(&a.server))
        .unwrap();
    let mut hb = b
        .transport
        .register(vec![0u8; 256], 1, Role::Send, Some(&b.server))
        .unwrap();

    fabric.hold_remote_events(true);
    for seq in 0u8..4 {
        let (client, handle) = if seq % 2 == 0 {
            (&a, &mut ha)
        } else {
            (&b, &mut hb)
        };
        handle.write(0, &[seq; 256]).unwrap();
        client.transport.send(handle, None).unwrap();
        let sent = client
            .transport
            .wait(handle, Operation::Send, TIMEOUT)
            .unwrap();
        assert_eq!(sent.offset, seq as u64 * 256);
    }
    assert_eq!(fabric.held_events(), 4);

    let err = server
        .wait(&mut queue, Operation::Receive, Some(Duration::ZERO))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::TimedOut);

    fabric.hold_remote_events(false);
    assert_eq!(fabric.release_held(&[2, 0, 3, 1]), 4);

    for seq in 0u8..4 {
        // Both operations are valid on the queue; the status echoes the one asked for.
        let op = if seq == 3 { Operation::Send } else { Operation::Receive };
        let status = server.wait(&mut queue, op, TIMEOUT).unwrap();
        assert_eq!(status.op, op);
        assert_eq!(status.offset, seq as u64 * 256);
        assert_eq!(status.length, 256);
        let sender = if seq % 2 == 0 { &a } else { &b };
        assert_eq!(
            status.src.as_ref().unwrap().instance,
            sender.transport.instance()
        );
        let bytes = queue.read(status.offset as usize, 256).unwrap();
        assert!(bytes.iter().all(|&byte| byte == seq));
    }
    assert_eq!(server.metrics().requests_received, 4);
}

#[test]
fn test_ninth_send_waits_for_unblock() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let mut queue = server
        .register(vec![0u8; 8 * 512], 512, Role::RequestQueue, None)
        .unwrap();
    let client = connect_client(&fabric, &server);
    let mut handle = client
        .transport
        .register(vec![0u8; 512], 1, Role::Send, Some(&client.server))
        .unwrap();

    for seq in 0u8..8 {
        handle.write(0, &[seq; 512]).unwrap();
        client.transport.send(&mut handle, None).unwrap();
        client
            .transport
            .wait(&mut handle, Operation::Send, TIMEOUT)
            .unwrap();
    }

    thread::scope(|s| {
        let ninth = s.spawn(|| {
            handle.write(0, &[9u8; 512])?;
            client.transport.send(&mut handle, None)?;
            client.transport.wait(&mut handle, Operation::Send, TIMEOUT)
        });

        eventually("the ninth claim to overflow", || {
            client.transport.metrics().slot_overflows >= 1
        });
        assert_eq!(server.metrics().queue_resets, 0);

        for seq in 0u8..4 {
            let status = server
                .wait(&mut queue, Operation::Receive, TIMEOUT)
                .unwrap();
            assert_eq!(status.offset, seq as u64 * 512);
            assert_eq!(queue.read(status.offset as usize, 1).unwrap(), vec![seq]);
        }
        let metrics = server.metrics();
        assert_eq!(metrics.queue_resets, 1);
        assert_eq!(metrics.unblocks_sent, 1);

        let sent = ninth.join().unwrap().unwrap();
        assert_eq!(sent.offset, 0);

        for seq in 4u8..8 {
            let status = server
                .wait(&mut queue, Operation::Receive, TIMEOUT)
                .unwrap();
            assert_eq!(status.offset, seq as u64 * 512);
            assert_eq!(queue.read(status.offset as usize, 1).unwrap(), vec![seq]);
        }
        let status = server
            .wait(&mut queue, Operation::Receive, TIMEOUT)
            .unwrap();
        assert_eq!(status.offset, 0);
        assert_eq!(queue.read(0, 1).unwrap(), vec![9]);
    });

    let stats = server.queue_stats().unwrap();
    assert_eq!(stats.total_processed, 9);
    assert_eq!(stats.resets, 1);
    assert_eq!(stats.processed, 1);
    assert!(client.transport.metrics().unblocks_received >= 1);
}

#[test]
fn test_overflow_across_distinct_clients() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let mut queue = server
        .register(vec![0u8; 8 * 512], 512, Role::RequestQueue, None)
        .unwrap();
    let clients: Vec<_> = (0..9).map(|_| connect_client(&fabric, &server)).collect();
    let mut handles: Vec<_> = clients
        .iter()
        .map(|c| {
            c.transport
                .register(vec![0u8; 512], 1, Role::Send, Some(&c.server))
                .unwrap()
        })
        .collect();
    let mut last = handles.pop().unwrap();
    let (early, ninth) = clients.split_at(8);
    let ninth = &ninth[0];

    for (seq, (client, handle)) in early.iter().zip(handles.iter_mut()).enumerate() {
        handle.write(0, &[seq as u8; 512]).unwrap();
        client.transport.send(handle, None).unwrap();
        let sent = client
            .transport
            .wait(handle, Operation::Send, TIMEOUT)
            .unwrap();
        assert_eq!(sent.offset, seq as u64 * 512);
    }

    thread::scope(|s| {
        let blocked = s.spawn(|| {
            last.write(0, &[9u8; 512])?;
            ninth.transport.send(&mut last, None)?;
            ninth.transport.wait(&mut last, Operation::Send, TIMEOUT)
        });

        eventually("the ninth client to overflow", || {
            ninth.transport.metrics().slot_overflows >= 1
        });
        for seq in 0u8..4 {
            let status = server
                .wait(&mut queue, Operation::Receive, TIMEOUT)
                .unwrap();
            assert_eq!(status.offset, seq as u64 * 512);
            assert_eq!(
                status.src.as_ref().unwrap().instance,
                early[seq as usize].transport.instance()
            );
        }
        // Every connected client is told, not only the one that overflowed.
        assert_eq!(server.metrics().unblocks_sent, 9);

        let sent = blocked.join().unwrap().unwrap();
        assert_eq!(sent.offset, 0);
    });

    for seq in 4u8..8 {
        let status = server
            .wait(&mut queue, Operation::Receive, TIMEOUT)
            .unwrap();
        assert_eq!(status.offset, seq as u64 * 512);
        assert_eq!(queue.read(status.offset as usize, 1).unwrap(), vec![seq]);
    }
    let status = server
        .wait(&mut queue, Operation::Receive, TIMEOUT)
        .unwrap();
    assert_eq!(status.offset, 0);
    assert_eq!(status.src.as_ref().unwrap().instance, ninth.transport.instance());
    assert_eq!(queue.read(0, 1).unwrap(), vec![9]);

    assert!(ninth.transport.metrics().unblocks_received >= 1);
    for client in early {
        assert_eq!(client.transport.metrics().slot_overflows, 0);
    }
    assert_eq!(server.queue_stats().unwrap().resets, 1);
}

/// Four clients share a 16-slot ring, each keeping one request in flight,
/// so fewer than half the slots are ever live.
#[test]
fn test_concurrent_clients_keep_per_client_order() {
    const SLOTS: usize = 16;
    const CLIENTS: usize = 4;
    const REQUESTS: u8 = 20;

    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let mut queue = server
        .register(vec![0u8; SLOTS * 64], 64, Role::RequestQueue, None)
        .unwrap();
    let clients: Vec<_> = (0..CLIENTS).map(|_| connect_client(&fabric, &server)).collect();
    let delivered = Mutex::new(vec![0u8; CLIENTS]);
    let progress = Condvar::new();

    thread::scope(|s| {
        for (id, client) in clients.iter().enumerate() {
            let delivered = &delivered;
            let progress = &progress;
            s.spawn(move || {
                let mut handle = client
                    .transport
                    .register(vec![0u8; 64], 1, Role::Send, Some(&client.server))
                    .unwrap();
                for seq in 0..REQUESTS {
                    {
                        let mut done = delivered.lock();
                        let deadline = Instant::now() + Duration::from_secs(5);
                        while done[id] < seq {
                            assert!(
                                !progress.wait_until(&mut done, deadline).timed_out(),
                                "client {id} never saw request {seq} delivered"
                            );
                        }
                    }
                    handle.write(0, &[id as u8, seq]).unwrap();
                    client.transport.send(&mut handle, None).unwrap();
                    client
                        .transport
                        .wait(&mut handle, Operation::Send, TIMEOUT)
                        .unwrap();
                }
                client.transport.unregister(handle).unwrap();
            });
        }

        let mut next = [0u8; CLIENTS];
        for _ in 0..CLIENTS * REQUESTS as usize {
            let status = server
                .wait(&mut queue, Operation::Receive, TIMEOUT)
                .unwrap();
            let tag = queue.read(status.offset as usize, 2).unwrap();
            let (id, seq) = (tag[0] as usize, tag[1]);
            assert_eq!(seq, next[id], "client {id} delivered out of order");
            assert_eq!(
                status.src.as_ref().unwrap().instance,
                clients[id].transport.instance()
            );
            next[id] += 1;
            delivered.lock()[id] = next[id];
            progress.notify_all();
        }
        assert_eq!(next, [REQUESTS; CLIENTS]);
    });

    let stats = server.queue_stats().unwrap();
    assert_eq!(stats.total_processed, (CLIENTS * REQUESTS as usize) as u64);
    assert!(stats.resets >= 4);
    let overflows: u64 = clients
        .iter()
        .map(|c| c.transport.metrics().slot_overflows)
        .sum();
    assert_eq!(overflows, 0);
}

#[test]
fn test_send_without_queue_is_einval() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);
    let mut handle = client
        .transport
        .register(vec![1u8; 64], 1, Role::Send, Some(&client.server))
        .unwrap();
    let err = client.transport.send(&mut handle, None).unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidArgument);
}

#[test]
fn test_send_to_explicit_buffer_is_a_put() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);

    let mut inbox = server
        .register(vec![0u8; 128], 1, Role::Receive, Some(&client.on_server))
        .unwrap();
    let mut handle = client
        .transport
        .register(pattern(128), 1, Role::Send, Some(&client.server))
        .unwrap();

    client
        .transport
        .send(&mut handle, Some(&inbox.remote()))
        .unwrap();
    let sent = client.transport.wait(&mut handle, Operation::Put, TIMEOUT).unwrap();
    assert_eq!(sent.op, Operation::Put);
    assert_eq!(sent.length, 128);

    let received = server.wait(&mut inbox, Operation::Receive, TIMEOUT).unwrap();
    assert_eq!(received.op, Operation::Receive);
    assert_eq!(received.length, 128);
    assert_eq!(inbox.state(), OpState::RecvComplete);
    assert_eq!(inbox.read(0, 128).unwrap(), pattern(128));
}

#[test]
fn test_wait_times_out_then_completes() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);

    let mut dst = server
        .register(vec![0u8; 64], 1, Role::PutDst, Some(&client.on_server))
        .unwrap();
    let mut src = client
        .transport
        .register(vec![7u8; 64], 1, Role::PutSrc, Some(&client.server))
        .unwrap();

    let started = Instant::now();
    let err = server
        .wait(&mut dst, Operation::Put, Some(Duration::from_millis(150)))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(server.metrics().waits_timed_out, 1);

    client.transport.put(&mut src, 0, 64, &dst.remote(), 0).unwrap();
    client.transport.wait(&mut src, Operation::Put, TIMEOUT).unwrap();
    let status = server
        .wait(&mut dst, Operation::Put, Some(Duration::from_millis(150)))
        .unwrap();
    assert_eq!(status.length, 64);
}

#[test]
fn test_wait_for_wrong_operation_is_einval() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);
    let mut dst = server
        .register(vec![0u8; 64], 1, Role::PutDst, Some(&client.on_server))
        .unwrap();
    let err = server.wait(&mut dst, Operation::Get, TIMEOUT).unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidArgument);
}

#[test]
fn test_cancel_interrupts_wait() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);
    let mut dst = server
        .register(vec![0u8; 64], 1, Role::PutDst, Some(&client.on_server))
        .unwrap();

    let cancel = server.cancel_handle();
    let started = Instant::now();
    thread::scope(|s| {
        s.spawn(|| {
            thread::sleep(Duration::from_millis(50));
            cancel.cancel(CancelReason::UserRequested);
        });
        let err = server.wait(&mut dst, Operation::Put, None).unwrap_err();
        assert_eq!(err.code(), ResultCode::Canceled);
    });
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(server.metrics().waits_cancelled, 1);
}

#[test]
fn test_injected_failure_is_eio() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);
    let dst = server
        .register(vec![0u8; 64], 1, Role::PutDst, Some(&client.on_server))
        .unwrap();
    let mut src = client
        .transport
        .register(vec![1u8; 64], 1, Role::PutSrc, Some(&client.server))
        .unwrap();

    fabric.fail_next_posts(1);
    client.transport.put(&mut src, 0, 64, &dst.remote(), 0).unwrap();
    let err = client
        .transport
        .wait(&mut src, Operation::Put, TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::Io);
    assert_eq!(client.transport.metrics().completion_errors, 1);
}

#[test]
fn test_refused_ptag_is_eperm() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = transport(&fabric);
    fabric.refuse_ptag(7);
    let url = format!("fabric://127.0.0.1:{}/?ptag=7&cookie=0", server.url().port);
    let err = client.connect(&url, TIMEOUT).unwrap_err();
    assert_eq!(err.code(), ResultCode::PermissionDenied);
}

#[test]
fn test_unresolvable_host_is_enoent() {
    let fabric = SimFabric::default();
    let client = transport(&fabric);
    let err = client
        .connect("fabric://no-such-host.invalid:4000/?ptag=1&cookie=0", TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::NoEntry);
}

#[test]
fn test_malformed_url_is_einval() {
    let fabric = SimFabric::default();
    let client = transport(&fabric);
    let err = client
        .connect("http://127.0.0.1:4000/?ptag=1&cookie=0", TIMEOUT)
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidArgument);
}

#[test]
fn test_closed_port_times_out() {
    let fabric = SimFabric::default();
    let client = transport(&fabric);
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let url = format!("fabric://127.0.0.1:{port}/?ptag=1&cookie=0");
    let started = Instant::now();
    let err = client
        .connect(&url, Some(Duration::from_millis(200)))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::TimedOut);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(client.connection_count(), 0);
}

#[test]
fn test_truncated_handshake_is_eio() {
    let fabric = SimFabric::default();
    let client = transport(&fabric);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let fake = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = stream.write_all(&[1, 2, 3]);
    });

    let url = format!("fabric://127.0.0.1:{port}/?ptag=1&cookie=0");
    let err = client.connect(&url, TIMEOUT).unwrap_err();
    assert_eq!(err.code(), ResultCode::Io);
    assert_eq!(client.connection_count(), 0);
    fake.join().unwrap();
}

#[test]
fn test_connect_is_reused_and_disconnect_idempotent() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let client = connect_client(&fabric, &server);
    let url = server.url().to_string();

    let again = client.transport.connect(&url, TIMEOUT).unwrap();
    assert_eq!(again, client.server);
    assert_eq!(client.transport.connection_count(), 1);

    client.transport.disconnect(&client.server).unwrap();
    client.transport.disconnect(&client.server).unwrap();
    assert_eq!(client.transport.connection_count(), 0);
    let metrics = client.transport.metrics();
    assert_eq!(metrics.connections_opened, 1);
    assert_eq!(metrics.connections_closed, 1);

    let err = client
        .transport
        .register(vec![0u8; 8], 1, Role::PutSrc, Some(&client.server))
        .unwrap_err();
    assert_eq!(err.code(), ResultCode::NoEntry);
}

#[test]
fn test_contact_file_written() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("contact");
    let config = TransportConfig {
        contact_file: Some(path.clone()),
        ..fast_config()
    };
    let fabric = SimFabric::default();
    let transport = Transport::init(config, fabric.add_nic()).unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written.trim(), transport.url().to_string());
    assert!(written.starts_with("fabric://127.0.0.1:"));
}

#[test]
fn test_fini_tears_everything_down() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let _queue = server
        .register(vec![0u8; 4 * 64], 64, Role::RequestQueue, None)
        .unwrap();
    let client = connect_client(&fabric, &server);

    server.fini().unwrap();
    server.fini().unwrap();
    assert_eq!(server.connection_count(), 0);
    assert!(server.queue_stats().is_none());
    assert_eq!(server.metrics().connections_closed, 1);

    client.transport.fini().unwrap();
    assert_eq!(client.transport.connection_count(), 0);
}

#[test]
fn test_metrics_snapshot_serializes() {
    let fabric = SimFabric::default();
    let server = transport(&fabric);
    let _client = connect_client(&fabric, &server);
    let value = serde_json::to_value(server.metrics()).unwrap();
    assert_eq!(value["connections_opened"], 1);
    assert_eq!(value["active_connections"], 1);
    assert_eq!(value["requests_sent"], 0);
}
