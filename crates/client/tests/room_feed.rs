mod support;

use std::sync::Arc;
use std::time::Duration;

use roomfeed_client::{
    ConnectionState, Credentials, FeedOptions, FeedState, RoomFeed, RoomFeedError, RoomSession,
};
use roomfeed_shared::{ClientCommand, ConversationId, Message, ServerEvent};
use support::{eventually, fast_config, ids, memory_transport, message, MemoryServer, WAIT};

fn session(server_token: &str) -> (Arc<RoomSession>, MemoryServer) {
    let (connector, server) = memory_transport();
    let session = RoomSession::new(
        fast_config(),
        Credentials::new(server_token, "alice"),
        connector,
    )
    .unwrap();
    (session, server)
}

fn live_ids(feed: &RoomFeed) -> Vec<String> {
    feed.messages()
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.id)
        .collect()
}

#[tokio::test]
async fn feed_goes_live_when_history_arrives() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");

    let mut feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    assert_eq!(feed.state(), FeedState::Joining);
    assert!(feed.messages().is_none());

    let mut link = server.accept().await;
    assert_eq!(link.token, "tok-a");
    let epoch = link.expect_join(&room).await;

    link.recent(
        &room,
        Some(epoch),
        vec![
            message(&room, "3", 30),
            message(&room, "1", 10),
            message(&room, "2", 20),
        ],
    );
    tokio::time::timeout(WAIT, feed.changed())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(feed.state(), FeedState::Live);
    assert_eq!(ids(&feed.messages().unwrap()), ["1", "2", "3"]);
}

#[tokio::test]
async fn empty_history_still_goes_live() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::direct("alice:bob");

    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    let mut link = server.accept().await;
    let epoch = link.expect_join(&room).await;
    link.recent(&room, Some(epoch), Vec::new());

    eventually(|| feed.state() == FeedState::Live).await;
    assert_eq!(feed.messages(), Some(Vec::new()));
}

#[tokio::test]
async fn live_pushes_merge_with_history() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();

    let mut link = server.accept().await;
    let epoch = link.expect_join(&room).await;
    link.recent(
        &room,
        Some(epoch),
        vec![
            message(&room, "1", 10),
            message(&room, "2", 20),
            message(&room, "3", 30),
        ],
    );
    link.push(ServerEvent::Message(message(&room, "2", 20)));
    link.push(ServerEvent::Message(message(&room, "4", 40)));

    eventually(|| live_ids(&feed) == ["1", "2", "3", "4"]).await;
}

#[tokio::test]
async fn feeds_on_one_room_share_a_join_and_leave_once() {
    let (session, mut server) = session("tok-a");
    let anchor = ConversationId::room("anchor");
    let room = ConversationId::room("lobby");

    let _anchor = session.open_feed(anchor.clone(), FeedOptions::default()).unwrap();
    let mut link = server.accept().await;
    link.expect_join(&anchor).await;

    let first = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    link.expect_join(&room).await;
    let second = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    link.expect_quiet(Duration::from_millis(50)).await;

    drop(first);
    link.expect_quiet(Duration::from_millis(50)).await;
    assert!(session.is_joined(&room));

    drop(second);
    assert_eq!(link.next_command().await, ClientCommand::leave(&room));
    assert!(!session.is_joined(&room));
    assert_eq!(session.references(), 1);
}

#[tokio::test]
async fn last_feed_leaving_flushes_the_leave_before_closing() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");

    let first = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    let mut link = server.accept().await;
    link.expect_join(&room).await;
    let second = session.open_feed(room.clone(), FeedOptions::default()).unwrap();

    drop(first);
    drop(second);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    assert_eq!(link.next_command().await, ClientCommand::leave(&room));
    link.expect_closed().await;

    // A closed connection does not come back on its own.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.attempts(), 1);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn stale_history_is_discarded() {
    let (session, mut server) = session("tok-a");
    let anchor = ConversationId::room("anchor");
    let room = ConversationId::room("lobby");

    let anchor_feed = session.open_feed(anchor.clone(), FeedOptions::default()).unwrap();
    let mut link = server.accept().await;
    let anchor_epoch = link.expect_join(&anchor).await;
    link.recent(&anchor, Some(anchor_epoch), Vec::new());

    let first = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    let old_epoch = link.expect_join(&room).await;
    drop(first);
    assert_eq!(link.next_command().await, ClientCommand::leave(&room));

    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    let new_epoch = link.expect_join(&room).await;
    assert!(new_epoch > old_epoch);

    // The late answer to the first join must not hydrate the second.
    link.recent(&room, Some(old_epoch), vec![message(&room, "old", 10)]);
    link.push(ServerEvent::Message(message(&anchor, "sentinel", 1)));
    eventually(|| live_ids(&anchor_feed) == ["sentinel"]).await;
    assert_eq!(feed.state(), FeedState::Joining);

    link.recent(&room, Some(new_epoch), vec![message(&room, "fresh", 20)]);
    eventually(|| feed.state() == FeedState::Live).await;
    assert_eq!(live_ids(&feed), ["fresh"]);
}

#[tokio::test]
async fn malformed_history_entries_do_not_block_the_feed() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();

    let mut link = server.accept().await;
    let epoch = link.expect_join(&room).await;
    link.push_raw(format!(
        r#"{{"id":"h1","type":"room:recent","ts":"2024-05-01T10:00:00Z","data":{{
            "roomId":"lobby","conversationKind":"room","epoch":{epoch},"messages":[
                {{"id":"good","roomId":"lobby","authorId":"bo","text":"hi","createdAt":10}},
                {{"id":"bad","roomId":"lobby","authorId":"bo","text":"no timestamp"}},
                {{"id":"","roomId":"lobby","authorId":"bo","text":"no id","createdAt":20}}
            ]}}}}"#
    ));

    eventually(|| feed.state() == FeedState::Live).await;
    assert_eq!(live_ids(&feed), ["good"]);
}

#[tokio::test]
async fn reconnect_rejoins_and_refetches_history() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();

    let mut link = server.accept().await;
    let first_epoch = link.expect_join(&room).await;
    link.recent(&room, Some(first_epoch), vec![message(&room, "1", 10)]);
    eventually(|| live_ids(&feed) == ["1"]).await;

    let mut states = session.watch_connection_state();
    server.refuse();
    link.drop_link();
    tokio::time::timeout(
        WAIT,
        states.wait_for(|state| matches!(state, ConnectionState::Reconnecting { .. })),
    )
    .await
    .unwrap()
    .unwrap();
    // The log survives a transient drop.
    assert_eq!(feed.state(), FeedState::Live);

    server.allow();
    let mut link = server.accept().await;
    let second_epoch = link.expect_join(&room).await;
    assert!(second_epoch > first_epoch);
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    link.recent(
        &room,
        Some(second_epoch),
        vec![message(&room, "1", 10), message(&room, "2", 20)],
    );
    eventually(|| live_ids(&feed) == ["1", "2"]).await;
}

#[tokio::test]
async fn send_stamps_unique_ids_and_dedupes_the_echo() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();

    let mut link = server.accept().await;
    let epoch = link.expect_join(&room).await;
    link.recent(&room, Some(epoch), Vec::new());
    eventually(|| feed.state() == FeedState::Live).await;

    let first = feed.send("hello").unwrap();
    let second = feed.send("hello").unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.author_id, "alice");
    assert_eq!(first.conversation(), room);
    assert_eq!(link.next_command().await, ClientCommand::send(&first));
    assert_eq!(link.next_command().await, ClientCommand::send(&second));

    // Nothing is shown before the echo.
    assert_eq!(feed.messages(), Some(Vec::new()));

    let echo = Message {
        created_at: 1_000,
        ..first.clone()
    };
    link.push(ServerEvent::Message(echo.clone()));
    link.push(ServerEvent::Message(echo));
    eventually(|| live_ids(&feed) == [first.id.clone()]).await;
}

#[tokio::test]
async fn optimistic_send_is_replaced_by_the_server_copy() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let feed = session
        .open_feed(
            room.clone(),
            FeedOptions {
                optimistic_send: true,
            },
        )
        .unwrap();

    let mut link = server.accept().await;
    let epoch = link.expect_join(&room).await;
    link.recent(
        &room,
        Some(epoch),
        vec![message(&room, "a", 10), message(&room, "b", 20)],
    );
    eventually(|| feed.state() == FeedState::Live).await;

    let sent = feed.send("hi").unwrap();
    assert_eq!(live_ids(&feed), ["a", "b", sent.id.as_str()]);

    // The server's timestamp is authoritative and re-sorts the entry.
    link.push(ServerEvent::Message(Message {
        created_at: 15,
        ..sent.clone()
    }));
    eventually(|| live_ids(&feed) == ["a", sent.id.as_str(), "b"]).await;
}

#[tokio::test]
async fn send_fails_fast_while_disconnected() {
    let (session, mut server) = session("tok-a");
    server.refuse();
    let room = ConversationId::room("lobby");
    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();

    assert_eq!(feed.send("hello"), Err(RoomFeedError::TransportUnavailable));
    assert_eq!(feed.send("   "), Err(RoomFeedError::EmptyMessage));

    eventually(|| server.attempts() >= 2).await;
    server.allow();

    // The failed send is not replayed after connecting.
    let mut link = server.accept().await;
    link.expect_join(&room).await;
    link.expect_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn unknown_rooms_and_malformed_frames_are_ignored() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();

    let mut link = server.accept().await;
    let epoch = link.expect_join(&room).await;
    link.recent(&room, Some(epoch), Vec::new());

    link.push_raw("{not json");
    link.push(ServerEvent::Message(message(
        &ConversationId::room("elsewhere"),
        "x",
        5,
    )));
    link.push(ServerEvent::Error {
        code: "BAD_REQUEST".to_string(),
        message: "nope".to_string(),
    });
    link.push(ServerEvent::Message(message(&room, "1", 10)));

    eventually(|| live_ids(&feed) == ["1"]).await;
    assert_eq!(session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn closed_feed_rejects_use_and_releases_the_transport() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let mut feed = session.open_feed(room.clone(), FeedOptions::default()).unwrap();
    let mut link = server.accept().await;
    link.expect_join(&room).await;

    feed.close();
    feed.close();
    assert_eq!(feed.state(), FeedState::Closed);
    assert_eq!(
        feed.send("hello"),
        Err(RoomFeedError::FeedClosed(room.to_string()))
    );
    assert!(feed.changed().await.is_err());
    assert!(feed.start().is_err());

    assert_eq!(session.references(), 0);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn idle_feed_sends_nothing_until_started() {
    let (session, mut server) = session("tok-a");
    let room = ConversationId::room("lobby");
    let mut feed = RoomFeed::new(&session, room.clone(), FeedOptions::default());
    assert_eq!(feed.state(), FeedState::Idle);
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);

    feed.start().unwrap();
    let mut link = server.accept().await;
    link.expect_join(&room).await;
}

#[tokio::test]
async fn shared_session_is_reused_per_token_and_replaced_on_change() {
    let config = fast_config().with_optimistic_send(true);
    let room = ConversationId::room("lobby");

    let mut feed = RoomFeed::connect(&config, Credentials::new("t1", "alice"), room.clone()).unwrap();
    assert!(feed.options().optimistic_send);
    let first = feed.session().clone();
    let again = RoomSession::shared(&config, Credentials::new("t1", "alice")).unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert!(first.is_joined(&room));
    assert_eq!(first.references(), 1);

    let other = RoomSession::shared(&config, Credentials::new("t2", "bob")).unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(other.author_id(), "bob");

    // The stale session is torn down and its feeds stop waiting.
    assert_eq!(first.connection_state(), ConnectionState::Disconnected);
    assert!(!first.is_joined(&room));
    assert!(first.messages(&room).is_empty());
    assert!(feed.changed().await.is_err());

    drop(feed);
    assert_eq!(first.references(), 0);
    assert_eq!(other.references(), 0);
}
