use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use wraith::{Client, ClientBuilder, FingerprintProfile};

mod helpers;
use helpers::init_tracing;
use helpers::mock_server::{MockHttpServer, Reply};

fn client() -> ClientBuilder {
    Client::builder().fingerprint(FingerprintProfile::None)
}

#[tokio::test]
async fn test_sequential_requests_share_one_connection() {
    init_tracing();
    let server = MockHttpServer::start(|_| Reply::ok("Hello")).await;
    let client = client().build().unwrap();

    for _ in 0..5 {
        let resp = client.get(&server.url("/")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "Hello");
    }

    assert_eq!(server.connections(), 1);
    assert_eq!(server.tracker().requests_per_connection(), vec![5]);
    assert_eq!(client.pool_count(), 1);
}

#[tokio::test]
async fn test_undrained_connection_is_not_handed_out() {
    init_tracing();
    let server = MockHttpServer::start(|_| {
        Reply::raw("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n")
            .then_after(Duration::from_millis(300), "0\r\n\r\n")
    })
    .await;
    let client = client().build().unwrap();

    // The first body is still streaming, so the second request needs its own
    // connection.
    let first = client.get(&server.url("/a")).send().await.unwrap();
    let second = client.get(&server.url("/b")).send().await.unwrap();
    assert_eq!(server.connections(), 2);

    assert_eq!(first.text().await.unwrap(), "hello");
    assert_eq!(second.text().await.unwrap(), "hello");

    // Both are drained and parked now.
    let third = client.get(&server.url("/c")).send().await.unwrap();
    assert_eq!(third.text().await.unwrap(), "hello");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn test_event_stream_connection_not_reused() {
    init_tracing();
    let server = MockHttpServer::start(|_| {
        Reply::raw(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: 10\r\n\r\ndata: hi\n\n",
        )
    })
    .await;
    let client = client().build().unwrap();

    for _ in 0..2 {
        let resp = client.get(&server.url("/events")).send().await.unwrap();
        assert!(resp.is_event_stream());
        assert_eq!(resp.text().await.unwrap(), "data: hi\n\n");
    }
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn test_switching_protocols_hands_over_the_socket() {
    init_tracing();
    let server = MockHttpServer::start(|r| {
        if r.header("Upgrade").is_some() {
            Reply::raw("HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        } else {
            Reply::ok("plain")
        }
    })
    .await;
    let client = client().build().unwrap();

    let mut resp = client
        .get(&server.url("/ws"))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 101);
    let mut upgraded = resp.upgrade().expect("upgraded stream");

    let plain = client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(plain.text().await.unwrap(), "plain");
    assert_eq!(server.connections(), 2);

    // The upgraded socket still belongs to the caller.
    upgraded.write_all(b"ping").await.unwrap();
}

#[tokio::test]
async fn test_disabled_keep_alive_dials_every_time() {
    init_tracing();
    let server = MockHttpServer::start(|_| Reply::ok("x")).await;
    let client = client().disable_keep_alive(true).build().unwrap();

    for _ in 0..3 {
        let resp = client.get(&server.url("/")).send().await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "x");
    }

    assert_eq!(server.connections(), 3);
    assert_eq!(client.pool_count(), 0);
    for req in server.received() {
        assert_eq!(req.header("Connection"), Some("close"));
    }
}

#[tokio::test]
async fn test_busy_connection_leads_to_second_dial() {
    init_tracing();
    let server = MockHttpServer::start(|_| Reply::ok("slow").after(Duration::from_millis(200))).await;
    let client = client().build().unwrap();

    let (a, b) = tokio::join!(
        client.get(&server.url("/1")).send(),
        client.get(&server.url("/2")).send()
    );
    assert_eq!(a.unwrap().text().await.unwrap(), "slow");
    assert_eq!(b.unwrap().text().await.unwrap(), "slow");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn test_idle_wait_reuses_busy_connection() {
    init_tracing();
    let server = MockHttpServer::start(|_| Reply::ok("slow").after(Duration::from_millis(100))).await;
    let client = client()
        .max_idle_wait(Duration::from_secs(2))
        .build()
        .unwrap();

    // Warm the pool.
    let resp = client.get(&server.url("/")).send().await.unwrap();
    resp.text().await.unwrap();

    let (a, b) = tokio::join!(
        async { client.get(&server.url("/1")).send().await?.text().await },
        async { client.get(&server.url("/2")).send().await?.text().await }
    );
    assert_eq!(a.unwrap(), "slow");
    assert_eq!(b.unwrap(), "slow");
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_stale_pooled_connection_retried_silently() {
    init_tracing();
    let served = Arc::new(AtomicUsize::new(0));
    let count = served.clone();
    // The second request lands on the pooled connection and the server
    // hangs up on it without answering.
    let server = MockHttpServer::start(move |_| {
        if count.fetch_add(1, Ordering::SeqCst) == 1 {
            Reply::hang_up()
        } else {
            Reply::ok("fresh")
        }
    })
    .await;
    let client = client().build().unwrap();

    let first = client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(first.text().await.unwrap(), "fresh");

    let second = client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(second.text().await.unwrap(), "fresh");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn test_peer_closed_idle_connection_is_evicted() {
    init_tracing();
    let server = MockHttpServer::start(|_| Reply::ok("bye").then_close()).await;
    let client = client().build().unwrap();

    let resp = client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "bye");

    for _ in 0..100 {
        if client.pool_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.pool_count(), 0);

    let resp = client.get(&server.url("/")).send().await.unwrap();
    assert_eq!(resp.text().await.unwrap(), "bye");
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn test_close_sweeps_pools() {
    init_tracing();
    let server = MockHttpServer::start(|_| Reply::ok("x")).await;
    let client = client().build().unwrap();

    client.get(&server.url("/")).send().await.unwrap().text().await.unwrap();
    assert_eq!(client.pool_count(), 1);

    client.close();
    assert_eq!(client.pool_count(), 0);

    client.get(&server.url("/")).send().await.unwrap().text().await.unwrap();
    assert_eq!(server.connections(), 2);

    client.force_close();
    assert_eq!(client.pool_count(), 0);
}

#[tokio::test]
async fn test_concurrent_burst_all_succeed() {
    init_tracing();
    let server = MockHttpServer::start(|r| Reply::ok(r.request_line())).await;
    let client = client().build().unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let client = client.clone();
        let url = server.url(&format!("/item/{}", i));
        handles.push(tokio::spawn(async move {
            client.get(&url).send().await?.text().await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        let body = handle.await.unwrap().unwrap();
        assert_eq!(body, format!("GET /item/{} HTTP/1.1", i));
    }
    assert!(server.connections() <= 20);
    assert_eq!(server.received().len(), 20);
}
