//! Worker-side integration tests: connections handed over a real IPC socket
//! pair are served by the HTTP app, and shutdown drains them.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use common::{http_exchange, peer, tcp_pair, verify_request};
use stickypool::cluster::{
    MasterChannel, TransferableConnection, WorkerChannel, WorkerMessage,
};
use stickypool::shutdown::{DrainOutcome, Shutdown, ShutdownTrigger};
use stickypool::worker::{self, WorkerOptions};

struct Harness {
    master: WorkerChannel,
    shutdown: Shutdown,
    task: tokio::task::JoinHandle<stickypool::error::Result<DrainOutcome>>,
}

async fn start_worker(drain_timeout: Duration) -> Harness {
    let (master_end, worker_end) = UnixStream::pair().unwrap();
    let master = WorkerChannel::new(master_end);
    let shutdown = Shutdown::new(drain_timeout);

    let options = WorkerOptions {
        ordinal: 0,
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: None,
    };
    let task = tokio::spawn(worker::run(
        options,
        MasterChannel::new(worker_end),
        shutdown.clone(),
    ));

    let mut reader = master.reader();
    let first = tokio::time::timeout(Duration::from_secs(5), reader.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, Some(WorkerMessage::Ready));

    Harness {
        master,
        shutdown,
        task,
    }
}

#[tokio::test]
async fn test_handed_off_request_is_served() {
    let harness = start_worker(Duration::from_secs(2)).await;

    let (mut client, server) = tcp_pair().await;
    harness
        .master
        .send_connection(TransferableConnection::new(server, peer(10, 0, 0, 1)))
        .await
        .unwrap();

    let response = http_exchange(&mut client, &verify_request(r#"{"code":"123456"}"#)).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"message":"Success"}"#));

    let (mut client, server) = tcp_pair().await;
    harness
        .master
        .send_connection(TransferableConnection::new(server, peer(10, 0, 0, 1)))
        .await
        .unwrap();
    let response = http_exchange(&mut client, &verify_request(r#"{"code":"123457"}"#)).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains(r#"{"message":"Verification Error"}"#));

    harness.shutdown.begin(ShutdownTrigger::Signal("SIGTERM"));
    let outcome = harness.task.await.unwrap().unwrap();
    assert_eq!(outcome, DrainOutcome::Drained);
}

#[tokio::test]
async fn test_request_sent_before_handoff_is_not_lost() {
    let harness = start_worker(Duration::from_secs(2)).await;

    let (mut client, server) = tcp_pair().await;
    // The whole request is in the socket buffer before the worker owns it
    client
        .write_all(
            b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    harness
        .master
        .send_connection(TransferableConnection::new(server, peer(10, 0, 0, 1)))
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#""status":"ok""#));

    harness.shutdown.begin(ShutdownTrigger::Signal("SIGTERM"));
    harness.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_announces_draining() {
    let harness = start_worker(Duration::from_secs(2)).await;
    let mut reader = harness.master.reader();

    harness.shutdown.begin(ShutdownTrigger::Signal("SIGINT"));

    let message = tokio::time::timeout(Duration::from_secs(5), reader.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Some(WorkerMessage::Draining));

    let outcome = harness.task.await.unwrap().unwrap();
    assert_eq!(outcome, DrainOutcome::Drained);
    assert_eq!(harness.shutdown.exit_code(outcome), 0);
}

#[tokio::test]
async fn test_in_flight_request_completes_while_draining() {
    let harness = start_worker(Duration::from_secs(2)).await;

    let (mut client, server) = tcp_pair().await;
    harness
        .master
        .send_connection(TransferableConnection::new(server, peer(10, 0, 0, 1)))
        .await
        .unwrap();

    let body = r#"{"code":"123456"}"#;
    client
        .write_all(
            format!(
                "POST /verify HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.shutdown.begin(ShutdownTrigger::Signal("SIGTERM"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.write_all(body.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains(r#"{"message":"Success"}"#));

    let outcome = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, DrainOutcome::Drained);
}

#[tokio::test]
async fn test_handoff_after_draining_is_not_served() {
    let harness = start_worker(Duration::from_secs(2)).await;
    let mut reader = harness.master.reader();

    harness.shutdown.begin(ShutdownTrigger::Signal("SIGTERM"));
    let message = tokio::time::timeout(Duration::from_secs(5), reader.next_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message, Some(WorkerMessage::Draining));

    let (mut client, server) = tcp_pair().await;
    client
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    // The send may still succeed; the worker just never takes the descriptor
    let _ = harness
        .master
        .send_connection(TransferableConnection::new(server, peer(10, 0, 0, 1)))
        .await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, DrainOutcome::Drained);

    let mut response = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
        .await
        .unwrap();
    // Either a clean close or a reset, but never an answer
    if read.is_ok() {
        assert!(response.is_empty(), "{}", String::from_utf8_lossy(&response));
    }
}

#[tokio::test]
async fn test_in_flight_request_is_cut_off_at_deadline() {
    let harness = start_worker(Duration::from_millis(300)).await;

    let (mut client, server) = tcp_pair().await;
    harness
        .master
        .send_connection(TransferableConnection::new(server, peer(10, 0, 0, 1)))
        .await
        .unwrap();

    // Announce a body that never fully arrives
    client
        .write_all(
            b"POST /verify HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"code\":",
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.shutdown.begin(ShutdownTrigger::Signal("SIGTERM"));
    let outcome = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(outcome, DrainOutcome::DeadlineElapsed { forced: 1 });
    assert_eq!(harness.shutdown.exit_code(outcome), 1);

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut rest)).await;
    assert!(read.is_ok());
}

#[tokio::test]
async fn test_worker_drains_when_master_goes_away() {
    let harness = start_worker(Duration::from_secs(2)).await;

    drop(harness.master);
    let outcome = tokio::time::timeout(Duration::from_secs(5), harness.task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(outcome, DrainOutcome::Drained);
    assert_eq!(harness.shutdown.trigger(), Some(ShutdownTrigger::MasterGone));
}

#[tokio::test]
async fn test_standalone_serves_directly() {
    let shutdown = Shutdown::new(Duration::from_secs(2));
    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let task = tokio::spawn(worker::run_standalone(addr, shutdown.clone()));

    let mut client = loop {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    let response = http_exchange(
        &mut client,
        "GET /missing HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    assert!(response.contains(r#"{"message":"Not found"}"#));
    assert!(response.to_ascii_lowercase().contains("x-content-type-options: nosniff"));

    shutdown.begin(ShutdownTrigger::Signal("SIGTERM"));
    assert_eq!(task.await.unwrap().unwrap(), DrainOutcome::Drained);
}
