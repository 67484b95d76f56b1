// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate failures and verify graceful degradation.
//!
//! These tests verify the system handles failures gracefully without panics,
//! deadlocks, or threads left asleep after shutdown.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use bytes::Bytes;
use common::{configure_group, eventually, free_port, init_tracing, shutdown, start_group};
use repmgr::config::{ConnectionConfig, ElectionConfig};
use repmgr::{AckPolicy, ManagerState, RepMgrConfig, RepMgrError, ReplicationManager, StartMode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::sleep;

const STOP_BOUND: Duration = Duration::from_secs(5);

async fn local_manager(config: RepMgrConfig) -> Arc<ReplicationManager> {
    let mgr = Arc::new(ReplicationManager::new(config));
    mgr.set_local_site("127.0.0.1", 0).await.unwrap();
    mgr
}

// =============================================================================
// Shutdown while blocked
// =============================================================================

/// Stop during an election that can never reach quorum.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_mid_election_joins_promptly() {
    init_tracing();
    let mut config = RepMgrConfig::for_testing();
    config.election = ElectionConfig {
        timeout_ms: 10_000,
        retry_wait_ms: 10_000,
        max_rounds: None,
    };
    let mgr = local_manager(config).await;
    mgr.add_remote_site("127.0.0.1", free_port(), false).await.unwrap();
    mgr.add_remote_site("127.0.0.1", free_port(), false).await.unwrap();
    mgr.start(2, StartMode::Election).await.unwrap();

    let electing = eventually(Duration::from_secs(2), || async {
        mgr.status().await.election_phase != repmgr::election::ElectionPhase::Idle
    })
    .await;
    assert!(electing, "election never started");

    let started = Instant::now();
    mgr.stop().await.unwrap();
    tokio::time::timeout(STOP_BOUND, mgr.wait())
        .await
        .expect("election task kept sleeping after stop()")
        .unwrap();
    assert!(started.elapsed() < STOP_BOUND);
    assert_eq!(mgr.state(), ManagerState::Stopped);
}

/// A durable send waiting for acks is released by stop().
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_releases_ack_waiter() {
    init_tracing();
    let mut config = RepMgrConfig::for_testing();
    config.ack_timeout = "60s".to_string();
    let sites = start_group(&[30, 20], &[StartMode::Master, StartMode::Client], &config).await;
    let master = sites[0].mgr.clone();
    master.set_ack_policy(AckPolicy::All).await.unwrap();

    let ready = eventually(Duration::from_secs(10), || async {
        master.status().await.connected_sites == 1
    })
    .await;
    assert!(ready);

    // The client never acknowledges
    sites[1].apply.reject_logs(true);
    let waiter = {
        let master = master.clone();
        tokio::spawn(async move { master.send_log(1, Bytes::from_static(b"stuck")).await })
    };

    let pending = eventually(Duration::from_secs(2), || async {
        master.status().await.pending_acks == 1
    })
    .await;
    assert!(pending);

    master.stop().await.unwrap();
    let result = tokio::time::timeout(STOP_BOUND, waiter)
        .await
        .expect("ack waiter not released")
        .unwrap();
    assert!(matches!(result, Err(RepMgrError::Shutdown)));

    shutdown(&sites).await;
}

/// Senders blocked on a full send buffer are released by stop().
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_releases_senders_on_full_buffer() {
    init_tracing();
    // A listener that accepts but never reads: the remote buffers fill up
    let sink = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sink_port = sink.local_addr().unwrap().port();
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = sink.accept().await {
            held.push(stream);
        }
    });

    let mut config = RepMgrConfig::for_testing();
    config.ack_timeout = "60s".to_string();
    config.connection = ConnectionConfig {
        send_buffer_frames: 1,
        ..config.connection.clone()
    };
    let mgr = local_manager(config).await;
    mgr.add_remote_site("127.0.0.1", sink_port, false).await.unwrap();
    mgr.start(1, StartMode::Master).await.unwrap();
    mgr.set_ack_policy(AckPolicy::All).await.unwrap();

    let connected = eventually(Duration::from_secs(5), || async {
        mgr.status().await.connected_sites == 1
    })
    .await;
    assert!(connected);

    // Large records fill the socket and then the one-frame buffer
    let payload = Bytes::from(vec![0u8; 4 * 1024 * 1024]);
    let senders: Vec<_> = (1..=4u64)
        .map(|lsn| {
            let mgr = mgr.clone();
            let payload = payload.clone();
            tokio::spawn(async move { mgr.send_log(lsn, payload).await })
        })
        .collect();
    sleep(Duration::from_millis(300)).await;

    mgr.stop().await.unwrap();
    for sender in senders {
        let result = tokio::time::timeout(STOP_BOUND, sender)
            .await
            .expect("sender left blocked after stop()")
            .unwrap();
        assert!(matches!(result, Err(RepMgrError::Shutdown)));
    }
    tokio::time::timeout(STOP_BOUND, mgr.wait())
        .await
        .expect("wait() hung")
        .unwrap();
    hold.abort();
}

/// Idle messengers (no traffic at all) exit on stop().
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_releases_idle_messengers() {
    init_tracing();
    let mgr = local_manager(RepMgrConfig::for_testing()).await;
    mgr.start(8, StartMode::Master).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    mgr.stop().await.unwrap();
    tokio::time::timeout(STOP_BOUND, mgr.wait())
        .await
        .expect("messengers kept sleeping after stop()")
        .unwrap();
}

// =============================================================================
// Network faults
// =============================================================================

/// A site that never answers costs retries, not failures.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_site_is_retried_quietly() {
    init_tracing();
    let mut config = RepMgrConfig::for_testing();
    config.ack_timeout = "200ms".to_string();
    let mgr = local_manager(config).await;
    mgr.add_remote_site("127.0.0.1", free_port(), true).await.unwrap();
    mgr.start(1, StartMode::Master).await.unwrap();
    mgr.set_ack_policy(AckPolicy::OnePeer).await.unwrap();

    sleep(Duration::from_millis(300)).await;
    let status = mgr.status().await;
    assert_eq!(status.state, ManagerState::Running);
    assert_eq!(status.connected_sites, 0);

    let err = mgr.send_log(1, Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, RepMgrError::AckTimeout { lsn: 1 }));

    mgr.close().await.unwrap();
}

/// Garbage on an inbound stream drops that stream only.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn garbage_inbound_stream_is_dropped() {
    init_tracing();
    let mgr = local_manager(RepMgrConfig::for_testing()).await;
    mgr.start(1, StartMode::Master).await.unwrap();
    let port = mgr.local_addr().await.unwrap().port();

    let junk: &[&[u8]] = &[
        &[0xFF, 0xFF, 0xFF, 0xFF, 0x01],
        &[0x00, 0x00, 0x00, 0x00],
        &[0x00, 0x00, 0x00, 0x02, 0x63, 0x00],
        b"GET / HTTP/1.1\r\n\r\n",
    ];
    for payload in junk {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _ = stream.write_all(payload).await;
    }
    sleep(Duration::from_millis(200)).await;

    let status = mgr.status().await;
    assert_eq!(status.state, ManagerState::Running);
    assert!(status.sites.is_empty());
    assert!(status.is_master());

    mgr.close().await.unwrap();
}

/// A client restarting under the same address is picked up again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_client_reconnects() {
    init_tracing();
    let config = RepMgrConfig::for_testing();
    let sites = configure_group(&[30, 20], &config).await;
    sites[0].mgr.start(2, StartMode::Master).await.unwrap();
    sites[1].mgr.start(2, StartMode::Client).await.unwrap();

    let master = &sites[0].mgr;
    let up = eventually(Duration::from_secs(10), || async {
        master.status().await.connected_sites == 1
    })
    .await;
    assert!(up);

    sites[1].mgr.close().await.unwrap();
    let down = eventually(Duration::from_secs(5), || async {
        master.status().await.connected_sites == 0
    })
    .await;
    assert!(down, "master did not notice the client leaving");

    // Same address, fresh manager
    let replacement = ReplicationManager::new(config.clone());
    replacement.set_local_site("127.0.0.1", sites[1].port).await.unwrap();
    replacement
        .add_remote_site("127.0.0.1", sites[0].port, true)
        .await
        .unwrap();
    replacement.start(1, StartMode::Client).await.unwrap();

    let back = eventually(Duration::from_secs(10), || async {
        master.status().await.connected_sites == 1 && replacement.master().await.is_some()
    })
    .await;
    assert!(back, "restarted client was not reconnected");

    replacement.close().await.unwrap();
    shutdown(&sites[..1]).await;
}
