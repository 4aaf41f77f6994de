use super::*;
use crate::test_support::{connect, harness, harness_with, received_messages, RecordingPushGateway};
use crate::Limits;
use shared::{error::ErrorCode, protocol::MediaPayload};

fn image() -> MediaPayload {
    MediaPayload {
        url: "https://cdn.example.test/cat.png".to_string(),
        public_id: Some("cat".to_string()),
        file_name: Some("cat.png".to_string()),
        file_size: Some(2048),
        mime_type: Some("image/png".to_string()),
        duration: None,
        thumbnail: None,
    }
}

#[test]
fn content_at_the_limit_is_accepted_and_one_more_is_not() {
    let at_limit = SendMessageRequest::text("conv1", "a".repeat(2000));
    assert!(validate_content(&at_limit, 2000).is_ok());

    let over = SendMessageRequest::text("conv1", "a".repeat(2001));
    let err = validate_content(&over, 2000).expect_err("too long");
    assert_eq!(err.code(), ErrorCode::Validation);
}

#[test]
fn limit_counts_characters_not_bytes() {
    let request = SendMessageRequest::text("conv1", "é".repeat(2000));
    assert!(validate_content(&request, 2000).is_ok());
}

#[test]
fn empty_and_blank_bodies_are_rejected() {
    for text in ["", "   \n\t"] {
        let request = SendMessageRequest::text("conv1", text);
        assert!(matches!(
            validate_content(&request, 2000),
            Err(RealtimeError::Validation(_))
        ));
    }
    let mut no_content = SendMessageRequest::text("conv1", "");
    no_content.content = None;
    assert!(validate_content(&no_content, 2000).is_err());
}

#[test]
fn media_counts_as_content_only_for_media_kinds() {
    let mut request = SendMessageRequest::text("conv1", "");
    request.media = Some(image());
    assert!(validate_content(&request, 2000).is_err());

    request.kind = MessageKind::Image;
    let content = validate_content(&request, 2000).expect("media message");
    assert_eq!(content.text, "");
    assert_eq!(content.media, Some(image()));
}

#[test]
fn text_is_trimmed_and_stray_media_dropped() {
    let mut request = SendMessageRequest::text("conv1", "  hi  ");
    request.media = Some(image());
    let content = validate_content(&request, 2000).expect("valid");
    assert_eq!(content.text, "hi");
    assert_eq!(content.media, None);
}

#[tokio::test]
async fn message_reaches_every_member_and_moves_the_last_message_pointer() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    let conv1 = h.store.add_conversation("conv1", &[1, 2]).await;
    let mut alice = connect(&h.ctx, 1).await;
    let mut bob = connect(&h.ctx, 2).await;

    let payload = send_message(&h.ctx, alice.id(), SendMessageRequest::text("conv1", "hi"))
        .await
        .expect("sent");

    assert_eq!(payload.status, DeliveryStatus::Delivered);
    assert_eq!(payload.sender.user_id, UserId(1));
    assert_eq!(received_messages(&alice.drain()), vec!["hi"]);
    assert_eq!(received_messages(&bob.drain()), vec!["hi"]);

    let stored = h.store.message(payload.message_id).await;
    assert_eq!(stored.content.text, "hi");
    assert_eq!(stored.conversation_id, conv1);
    assert_eq!(
        h.store.conversation(&conv1).await.last_message_id,
        Some(payload.message_id)
    );
}

#[tokio::test]
async fn status_is_sent_when_nobody_else_is_online() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    h.store.add_conversation("conv1", &[1, 2]).await;
    let alice = connect(&h.ctx, 1).await;
    // A second device of the sender does not count as a recipient.
    let _alice_phone = connect(&h.ctx, 1).await;

    let payload = send_message(&h.ctx, alice.id(), SendMessageRequest::text("conv1", "anyone?"))
        .await
        .expect("sent");
    assert_eq!(payload.status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn group_message_is_delivered_when_any_member_is_online() {
    let h = harness();
    for (id, name) in [(1, "alice"), (2, "bob"), (3, "carol")] {
        h.store.add_user(id, name).await;
    }
    h.store.add_conversation("team", &[1, 2, 3]).await;
    let alice = connect(&h.ctx, 1).await;
    let _carol = connect(&h.ctx, 3).await;

    let payload = send_message(&h.ctx, alice.id(), SendMessageRequest::text("team", "standup"))
        .await
        .expect("sent");
    assert_eq!(payload.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn rejected_sends_persist_nothing() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    h.store.add_conversation("conv1", &[1, 2]).await;
    let mut alice = connect(&h.ctx, 1).await;

    let too_long = SendMessageRequest::text("conv1", "x".repeat(2001));
    let err = send_message(&h.ctx, alice.id(), too_long).await.expect_err("too long");
    assert!(matches!(err, RealtimeError::Validation(_)));

    let empty = SendMessageRequest::text("conv1", " ");
    assert!(send_message(&h.ctx, alice.id(), empty).await.is_err());

    assert_eq!(h.store.message_count().await, 0);
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn conversation_access_is_checked() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(3, "mallory").await;
    let conv1 = h.store.add_conversation("conv1", &[1, 2]).await;
    let archived = h.store.add_conversation("archived", &[1, 3]).await;
    h.store.deactivate(&archived).await;
    let mallory = connect(&h.ctx, 3).await;

    let err = send_message(&h.ctx, mallory.id(), SendMessageRequest::text("conv1", "hello"))
        .await
        .expect_err("outsider");
    assert!(matches!(err, RealtimeError::Authorization(_)));

    let err = send_message(&h.ctx, mallory.id(), SendMessageRequest::text("nope", "hello"))
        .await
        .expect_err("unknown");
    assert!(matches!(err, RealtimeError::NotFound(_)));

    let err = send_message(&h.ctx, mallory.id(), SendMessageRequest::text("archived", "hello"))
        .await
        .expect_err("inactive");
    assert!(matches!(err, RealtimeError::NotFound(_)));

    let err = send_message(&h.ctx, mallory.id(), SendMessageRequest::text("", "hello"))
        .await
        .expect_err("missing id");
    assert!(matches!(err, RealtimeError::Validation(_)));

    let err = join_conversation(&h.ctx, mallory.id(), &conv1)
        .await
        .expect_err("outsider join");
    assert!(matches!(err, RealtimeError::Authorization(_)));
    assert!(!h.ctx.rooms.contains(&RoomId::from(&conv1), mallory.id()));
}

#[tokio::test]
async fn reply_must_target_a_live_message_in_the_same_conversation() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    let conv1 = h.store.add_conversation("conv1", &[1, 2]).await;
    let conv2 = h.store.add_conversation("conv2", &[1, 2]).await;
    let alice = connect(&h.ctx, 1).await;

    let original = h.store.insert_message(&conv1, 2, "lunch?", DeliveryStatus::Read).await;
    let elsewhere = h.store.insert_message(&conv2, 2, "other thread", DeliveryStatus::Read).await;
    let deleted = h.store.insert_message(&conv1, 2, "oops", DeliveryStatus::Read).await;
    h.store.delete_message(deleted).await;

    let mut reply = SendMessageRequest::text("conv1", "sure");
    reply.reply_to = Some(original);
    let payload = send_message(&h.ctx, alice.id(), reply).await.expect("reply");
    let summary = payload.reply_to.expect("summary attached");
    assert_eq!(summary.message_id, original);
    assert_eq!(summary.content.text, "lunch?");
    assert_eq!(h.store.message(payload.message_id).await.reply_to, Some(original));

    for target in [elsewhere, deleted, MessageId(999)] {
        let mut reply = SendMessageRequest::text("conv1", "sure");
        reply.reply_to = Some(target);
        let err = send_message(&h.ctx, alice.id(), reply).await.expect_err("bad reply");
        assert!(matches!(err, RealtimeError::Validation(_)), "{target}");
    }
}

#[tokio::test]
async fn last_message_failure_does_not_fail_the_send() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    let conv1 = h.store.add_conversation("conv1", &[1, 2]).await;
    let alice = connect(&h.ctx, 1).await;
    let mut bob = connect(&h.ctx, 2).await;
    h.store.fail_last_message_updates().await;

    let payload = send_message(&h.ctx, alice.id(), SendMessageRequest::text("conv1", "hi"))
        .await
        .expect("sent");
    assert_eq!(received_messages(&bob.drain()), vec!["hi"]);
    assert_eq!(h.store.conversation(&conv1).await.last_message_id, None);
    assert_eq!(h.store.message(payload.message_id).await.content.text, "hi");
}

#[tokio::test]
async fn sender_outside_the_room_still_gets_its_copy() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    let conv1 = h.store.add_conversation("conv1", &[1, 2]).await;
    let mut alice = connect(&h.ctx, 1).await;
    let mut bob = connect(&h.ctx, 2).await;
    assert!(leave_conversation(&h.ctx, alice.id(), &conv1));

    send_message(&h.ctx, alice.id(), SendMessageRequest::text("conv1", "still here"))
        .await
        .expect("sent");
    assert_eq!(received_messages(&alice.drain()), vec!["still here"]);
    assert_eq!(received_messages(&bob.drain()), vec!["still here"]);

    join_conversation(&h.ctx, alice.id(), &conv1).await.expect("rejoin");
    assert!(h.ctx.rooms.contains(&RoomId::from(&conv1), alice.id()));
}

#[tokio::test]
async fn push_goes_to_recipients_not_looking_at_the_conversation() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    h.store.add_user(3, "carol").await;
    h.store.add_user(4, "dave").await;
    h.store.add_conversation("team", &[1, 2, 3, 4]).await;
    h.store.set_push(2, Some("bob-device"), false).await;
    h.store.set_push(3, Some("carol-device"), true).await;
    h.store.set_push(4, None, false).await;
    let alice = connect(&h.ctx, 1).await;

    send_message(&h.ctx, alice.id(), SendMessageRequest::text("team", "deploy done"))
        .await
        .expect("sent");

    let sent = h.push.wait_for(1).await;
    assert_eq!(sent.len(), 1);
    let notification = &sent[0];
    assert_eq!(notification.user_id, UserId(2));
    assert_eq!(notification.token, "bob-device");
    assert_eq!(notification.title, "New message from alice Tester");
    assert_eq!(notification.body, "deploy done");
    assert_eq!(notification.conversation_id, ConversationId::from("team"));
    assert!(!notification.is_online);
}

#[tokio::test]
async fn push_failure_is_contained() {
    let h = harness_with(Limits::default(), RecordingPushGateway::failing());
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    h.store.add_conversation("conv1", &[1, 2]).await;
    h.store.set_push(2, Some("bob-device"), false).await;
    let alice = connect(&h.ctx, 1).await;

    let payload = send_message(&h.ctx, alice.id(), SendMessageRequest::text("conv1", "ping"))
        .await
        .expect("send succeeds");
    assert_eq!(h.push.wait_for(1).await.len(), 1);
    assert_eq!(h.store.message(payload.message_id).await.content.text, "ping");
}

#[tokio::test]
async fn mark_read_advances_only_messages_from_others() {
    let h = harness();
    h.store.add_user(1, "alice").await;
    h.store.add_user(2, "bob").await;
    let conv1 = h.store.add_conversation("conv1", &[1, 2]).await;
    let mut alice = connect(&h.ctx, 1).await;
    let mut bob = connect(&h.ctx, 2).await;

    let from_alice = send_message(&h.ctx, alice.id(), SendMessageRequest::text("conv1", "one"))
        .await
        .expect("sent")
        .message_id;
    let from_bob = send_message(&h.ctx, bob.id(), SendMessageRequest::text("conv1", "two"))
        .await
        .expect("sent")
        .message_id;
    alice.drain();
    bob.drain();

    let read = mark_read(&h.ctx, bob.id(), &conv1).await.expect("read");
    assert_eq!(read, vec![from_alice]);
    assert_eq!(h.store.message(from_alice).await.status, DeliveryStatus::Read);
    assert_eq!(h.store.message(from_bob).await.status, DeliveryStatus::Delivered);

    let expected = ServerEvent::MessagesRead {
        conversation_id: conv1.clone(),
        reader_id: UserId(2),
        message_ids: vec![from_alice],
    };
    assert_eq!(alice.drain(), vec![expected.clone()]);
    assert_eq!(bob.drain(), vec![expected]);

    assert!(mark_read(&h.ctx, bob.id(), &conv1).await.expect("again").is_empty());
    assert!(alice.drain().is_empty());
}
