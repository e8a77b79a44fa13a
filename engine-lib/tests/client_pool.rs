//! Admission, fan out and receive window behavior of the client pool, driven
//! over real sockets on ephemeral ports.

mod support;

use engine_lib::client_pool::ClientPool;
use engine_lib::error::EngineError;
use protocol::Message;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

const TOKEN: &str = "TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT";

/// A pool with one declared slot, already listening on an ephemeral port.
async fn single_slot_pool() -> (Arc<ClientPool>, std::net::SocketAddr) {
    let pool = ClientPool::new();
    pool.define_client(TOKEN).await.expect("define slot");
    pool.listen(0).await.expect("listen");
    let addr = pool.local_addr().await.expect("pool addr");
    (pool, addr)
}

/// Connects a client and walks it through the token admission.
async fn connect_verified(addr: std::net::SocketAddr, token: &str) -> TcpStream {
    let mut client = support::connect(addr).await;
    support::send_message(&mut client, &Message::token(token)).await;
    client
}

#[tokio::test]
async fn a_bare_string_instead_of_a_token_message_gets_the_socket_dropped() {
    let (pool, addr) = single_slot_pool().await;
    let mut client = support::connect(addr).await;

    // Not a message, just a JSON string. The verification must reject it
    // without any feedback.
    support::send_value(&mut client, &json!("TTTTTTTTTTTTTTTTTTTTTTTTTTTTTTTT")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pool.is_connected(0).await);

    // Subsequent sends run into the closed connection eventually.
    let mut send_failed = false;
    for _ in 0..50 {
        if support::try_send_value(&mut client, &json!("ping")).await.is_err() {
            send_failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(send_failed, "the rejected socket should be closed");
}

#[tokio::test]
async fn an_unknown_token_gets_the_socket_dropped() {
    let (pool, addr) = single_slot_pool().await;
    let mut client = support::connect(addr).await;
    support::send_message(&mut client, &Message::token("WWWWWWWWWWWWWWWWWWWWWWWWWWWWWWWW")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!pool.is_connected(0).await);
}

#[tokio::test]
async fn the_correct_token_binds_the_slot_and_keeps_the_socket_open() {
    let (pool, addr) = single_slot_pool().await;
    let mut client = connect_verified(addr, TOKEN).await;

    assert!(pool.wait_for_client(0, Some(Duration::from_secs(2))).await);
    assert!(pool.is_connected(0).await);

    // Even a message the server can not decode leaves the connection alive.
    support::send_value(&mut client, &json!({"name": "nothing", "args": null})).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pool.is_connected(0).await);
}

#[tokio::test]
async fn fan_out_delivers_each_slot_exactly_its_own_message() {
    let count = 25usize;
    let pool = ClientPool::new();
    let tokens: Vec<String> = (0..count).map(|i| format!("fan-out-client-token-{i:011}")).collect();
    for token in &tokens {
        pool.define_client(token).await.expect("define slot");
    }
    pool.listen(0).await.expect("listen");
    let addr = pool.local_addr().await.expect("pool addr");

    let mut clients = Vec::with_capacity(count);
    for token in &tokens {
        clients.push(connect_verified(addr, token).await);
    }
    assert!(pool.wait_for_all_clients(Some(Duration::from_secs(5))).await);

    for id in 0..count {
        let lucky_number = (id as i64) * 31 + 7;
        pool.queue(id, Message::new("test", vec![json!("arg0"), json!(lucky_number)]))
            .await;
    }
    pool.send_all_blocking().await;

    for (id, client) in clients.iter_mut().enumerate() {
        let received = support::read_message(client).await;
        let lucky_number = (id as i64) * 31 + 7;
        assert_eq!(received, Message::new("test", vec![json!("arg0"), json!(lucky_number)]));
    }

    // Nothing was staged beyond the one round.
    let extra = tokio::time::timeout(
        Duration::from_millis(200),
        support::try_read_message(&mut clients[0]),
    )
    .await;
    assert!(extra.is_err(), "no second message may arrive");
}

#[tokio::test]
async fn only_messages_read_inside_the_window_become_valid() {
    let (pool, addr) = single_slot_pool().await;
    let mut client = connect_verified(addr, TOKEN).await;
    assert!(pool.wait_for_client(0, Some(Duration::from_secs(2))).await);

    let stamped = |name: &str| Message::new(name, vec![json!([])]);

    support::send_message(&mut client, &stamped("m1")).await;
    support::send_message(&mut client, &stamped("m2")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.start_receiving_all().await;
    support::send_message(&mut client, &stamped("m3")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.stop_receiving_all();

    support::send_message(&mut client, &stamped("m4")).await;
    support::send_message(&mut client, &stamped("m5")).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let valid = pool.get_received_message(0).await.expect("valid message");
    assert_eq!(valid.name, "m3");
}

#[tokio::test]
async fn a_window_without_any_message_leaves_no_valid_entry() {
    let (pool, addr) = single_slot_pool().await;
    let mut client = connect_verified(addr, TOKEN).await;
    assert!(pool.wait_for_client(0, Some(Duration::from_secs(2))).await);

    // A message before the window fills the last received cache only.
    support::send_message(&mut client, &Message::new("early", Vec::new())).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    pool.start_receiving_all().await;
    pool.stop_receiving_all();
    assert!(pool.get_received_message(0).await.is_none());

    // Arriving after the window does not help either.
    support::send_message(&mut client, &Message::new("late", Vec::new())).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pool.get_received_message(0).await.is_none());
}

#[tokio::test]
async fn the_later_of_two_window_messages_wins() {
    let (pool, addr) = single_slot_pool().await;
    let mut client = connect_verified(addr, TOKEN).await;
    assert!(pool.wait_for_client(0, Some(Duration::from_secs(2))).await);

    pool.start_receiving_all().await;
    support::send_message(&mut client, &Message::new("first", Vec::new())).await;
    support::send_message(&mut client, &Message::new("second", Vec::new())).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    pool.stop_receiving_all();

    assert_eq!(pool.get_received_message(0).await.expect("valid").name, "second");
}

#[tokio::test]
async fn received_events_decode_from_the_first_argument() {
    let (pool, addr) = single_slot_pool().await;
    let mut client = connect_verified(addr, TOKEN).await;
    assert!(pool.wait_for_client(0, Some(Duration::from_secs(2))).await);

    pool.start_receiving_all().await;
    let reply = Message::new(
        "move",
        vec![json!([{"type": "add", "args": [4]}, {"type": "add", "args": [6]}])],
    );
    support::send_message(&mut client, &reply).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.stop_receiving_all();

    let events = pool.get_received_event(0).await.expect("events");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, "add");
    assert_eq!(events[1].args, vec![json!(6)]);
}

#[tokio::test]
async fn defining_clients_is_forbidden_while_listening() {
    let (pool, _addr) = single_slot_pool().await;
    match pool.define_client("XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX").await {
        Err(EngineError::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
    pool.terminate().await;
    assert!(pool.define_client("XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX").await.is_ok());
}

#[tokio::test]
async fn duplicate_tokens_are_rejected() {
    let pool = ClientPool::new();
    pool.define_client(TOKEN).await.expect("define slot");
    match pool.define_client(TOKEN).await {
        Err(EngineError::DuplicateToken(token)) => assert_eq!(token, TOKEN),
        other => panic!("expected DuplicateToken, got {other:?}"),
    }
}

#[tokio::test]
async fn omitting_clients_is_forbidden_while_listening() {
    let (pool, _addr) = single_slot_pool().await;
    match pool.omit_all_clients().await {
        Err(EngineError::InvalidState(_)) => {}
        other => panic!("expected InvalidState, got {other:?}"),
    }
    pool.terminate().await;
    pool.omit_all_clients().await.expect("omit after terminate");
    assert_eq!(pool.client_count().await, 0);
}

#[tokio::test]
async fn waiting_for_all_clients_respects_the_shared_budget() {
    let pool = ClientPool::new();
    pool.define_client("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA").await.expect("define");
    pool.define_client("BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB").await.expect("define");

    let started = Instant::now();
    let all_bound = pool.wait_for_all_clients(Some(Duration::from_millis(300))).await;
    let elapsed = started.elapsed();

    assert!(!all_bound);
    // The budget is shared over both slots, not per slot.
    assert!(elapsed < Duration::from_millis(900), "waited {elapsed:?}");
}

#[tokio::test]
async fn a_reconnect_replaces_the_bound_socket() {
    let (pool, addr) = single_slot_pool().await;
    let _first = connect_verified(addr, TOKEN).await;
    assert!(pool.wait_for_client(0, Some(Duration::from_secs(2))).await);

    let mut second = connect_verified(addr, TOKEN).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    pool.queue(0, Message::new("hello-again", Vec::new())).await;
    pool.send_all_blocking().await;
    let received = support::read_message(&mut second).await;
    assert_eq!(received.name, "hello-again");
}
