/// Receive path: inbound messages, receipts, directory ordering
mod support;

use schoolchat_core::push::{
    DeliveredNotice, InboundEvent, MarkDelivered, OutboundEvent, ReadReceipt, ReadRequest, SendAck,
};
use schoolchat_core::{ChatEvent, MessageStatus, MessageType};
use std::time::Duration;
use support::*;

fn is_read(event: &OutboundEvent) -> bool {
    matches!(event, OutboundEvent::Read(_))
}

#[tokio::test(start_paused = true)]
async fn test_message_for_active_conversation_is_read_immediately() {
    let api = FakeApi::new(vec![
        conversation("x", "u1", 10, 0),
        conversation("b", "u2", 5, 1),
    ]);
    let connector = FakeConnector::new();
    let (session, mut events) = start_session(api.clone(), connector.clone());
    let mut server = connector.accept().await;
    wait_ready(&mut events).await;
    open(&session, &mut events, "x").await;

    server
        .push(InboundEvent::Receive(message("in-1", "x", "u1", 20)))
        .await;

    // Delivery ack first (written by the connection), then the read receipt
    let delivered = server.next_event().await;
    assert_eq!(
        delivered,
        OutboundEvent::MarkDelivered(MarkDelivered {
            message_ids: vec!["in-1".to_string()],
        })
    );
    let read = server.next_matching(is_read).await;
    assert_eq!(
        read,
        OutboundEvent::Read(ReadRequest {
            message_id: "in-1".to_string(),
        })
    );

    let messages = session.messages("x").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, "in-1");
    assert_eq!(messages[0].status, MessageStatus::Read);

    let conversations = session.conversations().await.unwrap();
    let x = conversations.iter().find(|c| c.id == "x").unwrap();
    assert_eq!(x.unread_count, 0);
    assert_eq!(x.last_message.as_ref().unwrap().id, "in-1");
    // Pushed read receipts don't touch REST
    assert!(api.read_marks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_conversation_triggers_full_refetch() {
    let api = FakeApi::new(vec![conversation("c1", "u1", 10, 0)]);
    let connector = FakeConnector::new();
    let (session, mut events) = start_session(api.clone(), connector.clone());
    let server = connector.accept().await;
    wait_ready(&mut events).await;
    assert_eq!(api.list_calls(), 1);

    // Server truth now includes Y with its own counter
    api.set_conversations(vec![
        conversation("c1", "u1", 10, 0),
        conversation("y", "u5", 40, 3),
    ]);
    server
        .push(InboundEvent::Receive(message("y-1", "y", "u5", 40)))
        .await;
    wait_for(&mut events, |e| matches!(e, ChatEvent::ConversationsUpdated)).await;

    assert_eq!(api.list_calls(), 2);
    let conversations = session.conversations().await.unwrap();
    assert_eq!(conversations[0].id, "y");
    assert_eq!(conversations[0].unread_count, 3);
    assert_eq!(conversations.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_two_rapid_messages_for_inactive_conversation() {
    let api = FakeApi::new(vec![
        conversation("a", "u1", 10, 0),
        conversation("z", "u3", 1, 0),
    ]);
    let connector = FakeConnector::new();
    let (session, mut events) = start_session(api.clone(), connector.clone());
    let mut server = connector.accept().await;
    wait_ready(&mut events).await;
    open(&session, &mut events, "a").await;

    server
        .push(InboundEvent::Receive(message("z-1", "z", "u3", 30)))
        .await;
    server
        .push(InboundEvent::Receive(message("z-2", "z", "u3", 31)))
        .await;

    // Both observed: each gets its delivery ack
    for expected in ["z-1", "z-2"] {
        assert_eq!(
            server.next_event().await,
            OutboundEvent::MarkDelivered(MarkDelivered {
                message_ids: vec![expected.to_string()],
            })
        );
    }
    wait_for(&mut events, |e| matches!(e, ChatEvent::ConversationsUpdated)).await;
    wait_for(&mut events, |e| matches!(e, ChatEvent::ConversationsUpdated)).await;

    let conversations = session.conversations().await.unwrap();
    let ids: Vec<&str> = conversations.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["z", "a"]);
    assert_eq!(conversations[0].unread_count, 2);
    assert_eq!(conversations[0].last_message.as_ref().unwrap().id, "z-2");
    assert!(conversations
        .windows(2)
        .all(|w| w[0].updated_at >= w[1].updated_at));
    // Nothing was read on the user's behalf
    assert!(api.read_marks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_selecting_conversation_batch_marks_unread_read() {
    let api = FakeApi::new(vec![conversation("c1", "u2", 10, 2)]);
    let mut seen = message("h-0", "c1", "u2", 1);
    seen.status = MessageStatus::Read;
    let mut first = message("h-1", "c1", "u2", 2);
    first.status = MessageStatus::Delivered;
    let mut second = message("h-2", "c1", "u2", 3);
    second.status = MessageStatus::Delivered;
    let own = message("h-3", "c1", ME, 4);
    api.set_history("c1", vec![seen, first, second, own]);

    let connector = FakeConnector::new();
    let (session, mut events) = start_session(api.clone(), connector.clone());
    let mut server = connector.accept().await;
    wait_ready(&mut events).await;
    open(&session, &mut events, "c1").await;

    let mut marked = Vec::new();
    for _ in 0..2 {
        if let OutboundEvent::Read(request) = server.next_matching(is_read).await {
            marked.push(request.message_id);
        }
    }
    assert_eq!(marked, vec!["h-1".to_string(), "h-2".to_string()]);

    let conversations = session.conversations().await.unwrap();
    assert_eq!(conversations[0].unread_count, 0);
    let statuses: Vec<MessageStatus> = session
        .messages("c1")
        .await
        .unwrap()
        .iter()
        .map(|m| m.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            MessageStatus::Read,
            MessageStatus::Read,
            MessageStatus::Read,
            MessageStatus::Sent,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_offline_read_marks_use_rest() {
    let api = FakeApi::new(vec![conversation("c1", "u2", 10, 1)]);
    let mut unread = message("h-1", "c1", "u2", 2);
    unread.status = MessageStatus::Delivered;
    api.set_history("c1", vec![unread]);

    let (session, mut events) = start_session(api.clone(), FakeConnector::offline());
    wait_listed(&mut events).await;
    open(&session, &mut events, "c1").await;
    wait_for(&mut events, |e| matches!(e, ChatEvent::MessageStatusChanged { .. })).await;

    // Let the spawned REST call land
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(api.read_marks(), vec!["h-1".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_late_delivered_never_downgrades_read() {
    let api = FakeApi::new(vec![conversation("c1", "u2", 10, 0)]);
    let connector = FakeConnector::new();
    let (session, mut events) = start_session(api.clone(), connector.clone());
    let mut server = connector.accept().await;
    wait_ready(&mut events).await;
    open(&session, &mut events, "c1").await;

    let client_id = session.send("c1", "homework?", MessageType::Text).await.unwrap();
    server
        .next_matching(|e| matches!(e, OutboundEvent::Send(_)))
        .await;
    server
        .push(InboundEvent::Ack(SendAck {
            client_id,
            success: true,
            data: Some(message("m1", "c1", ME, 20)),
            error: None,
        }))
        .await;
    server
        .push(InboundEvent::ReadReceipt(ReadReceipt {
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
        }))
        .await;
    wait_for(&mut events, |e| matches!(e, ChatEvent::MessageStatusChanged { .. })).await;

    // Late DELIVERED, a repeated READ, then a marker message
    server
        .push(InboundEvent::Delivered(DeliveredNotice {
            message_ids: vec!["m1".to_string()],
            conversation_id: "c1".to_string(),
        }))
        .await;
    server
        .push(InboundEvent::ReadReceipt(ReadReceipt {
            message_id: "m1".to_string(),
            conversation_id: "c1".to_string(),
        }))
        .await;
    server
        .push(InboundEvent::Receive(message("marker", "c1", "u2", 25)))
        .await;
    let next_change = wait_for(&mut events, |e| {
        matches!(e, ChatEvent::MessageStatusChanged { .. } | ChatEvent::MessageAppended { .. })
    })
    .await;
    assert!(
        matches!(next_change, ChatEvent::MessageAppended { ref message } if message.id == "marker"),
        "receipt after READ changed state: {:?}",
        next_change
    );

    let messages = session.messages("c1").await.unwrap();
    assert_eq!(messages[0].id, "m1");
    assert_eq!(messages[0].status, MessageStatus::Read);
}

#[tokio::test(start_paused = true)]
async fn test_start_chat_reuses_existing_conversation() {
    let api = FakeApi::new(vec![
        conversation("c1", "u1", 10, 4),
        conversation("c2", "u2", 5, 0),
    ]);
    let connector = FakeConnector::new();
    let (session, mut events) = start_session(api.clone(), connector.clone());
    let _server = connector.accept().await;
    wait_ready(&mut events).await;

    let existing = session.start_chat("u1").await.unwrap();
    assert_eq!(existing.id, "c1");
    assert!(api.opened().is_empty());
    assert_eq!(session.active_conversation().await.unwrap(), Some("c1".to_string()));
    let conversations = session.conversations().await.unwrap();
    assert_eq!(conversations[0].unread_count, 0);

    let created = session.start_chat("u3").await.unwrap();
    assert_eq!(created.id, "c-u3");
    assert_eq!(api.opened(), vec!["u3".to_string()]);
    assert_eq!(session.active_conversation().await.unwrap(), Some("c-u3".to_string()));
    let conversations = session.conversations().await.unwrap();
    assert_eq!(conversations.len(), 3);
    assert_eq!(conversations[0].id, "c-u3");
}

#[tokio::test(start_paused = true)]
async fn test_search_users_goes_to_directory() {
    let api = FakeApi::new(vec![]);
    let (session, mut events) = start_session(api.clone(), FakeConnector::offline());
    wait_listed(&mut events).await;

    let users = session.search_users(Some("u2")).await.unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].id, "u2");
    assert_eq!(session.search_users(None).await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_load_older_prepends_until_cursor_runs_out() {
    let api = FakeApi::new(vec![conversation("c1", "u2", 10, 0)]);
    api.set_history_page(
        "c1",
        vec![message("m3", "c1", "u2", 3), message("m4", "c1", ME, 4)],
        "cur-1",
    );
    api.set_older_page(
        "cur-1",
        vec![message("m1", "c1", "u2", 1), message("m2", "c1", ME, 2)],
        None,
    );
    let (session, mut events) = start_session(api.clone(), FakeConnector::offline());
    wait_listed(&mut events).await;
    open(&session, &mut events, "c1").await;

    session.load_older("c1").await.unwrap();
    wait_for(&mut events, |e| matches!(e, ChatEvent::HistoryLoaded { .. })).await;

    let ids: Vec<String> = session
        .messages("c1")
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
    assert_eq!(
        api.history_cursors(),
        vec![None, Some("cur-1".to_string())]
    );

    // Oldest page reached: nothing left to ask for
    session.load_older("c1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(api.history_cursors().len(), 2);
    assert_eq!(session.messages("c1").await.unwrap().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_read_dropped_with_the_link_goes_over_rest() {
    let api = FakeApi::new(vec![conversation("c1", "u2", 10, 0)]);
    let connector = FakeConnector::new();
    let (session, mut events) = start_session(api.clone(), connector.clone());
    let server = connector.accept().await;
    wait_ready(&mut events).await;
    open(&session, &mut events, "c1").await;

    // The link dies right behind the message
    server
        .push(InboundEvent::Receive(message("in-1", "c1", "u2", 20)))
        .await;
    drop(server);
    wait_for(&mut events, |e| {
        matches!(e, ChatEvent::ConnectionChanged { connected: false })
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(api.read_marks(), vec!["in-1".to_string()]);
    let messages = session.messages("c1").await.unwrap();
    assert_eq!(messages[0].status, MessageStatus::Read);
}
