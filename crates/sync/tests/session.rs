use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use parley_core::config::{FeedConfig, SyncConfig};
use parley_core::event::{ChangeEvent, RowChange};
use parley_core::model::{ChannelKind, MemberRole, Message, MessageKey};
use parley_gateway::{GatewayError, MemoryGateway};
use parley_sync::unread::count_unread;
use parley_sync::{ChatSession, SyncEngine, SyncError};
use parley_test_support::build::bodies;
use parley_test_support::world::World;

fn session_with(world: &World, config: SyncConfig) -> Arc<ChatSession<MemoryGateway>> {
    Arc::new(ChatSession::new(world.gateway(), config))
}

fn session(world: &World) -> Arc<ChatSession<MemoryGateway>> {
    session_with(world, SyncConfig::default())
}

fn engine(world: &World, session: &Arc<ChatSession<MemoryGateway>>) -> SyncEngine<MemoryGateway> {
    SyncEngine::new(
        Arc::clone(session),
        Arc::new(world.feed.clone()),
        FeedConfig::default(),
    )
}

fn insert_event(world: &World, message: &Message) -> ChangeEvent {
    let row = world
        .backend
        .message_row(message.id().unwrap())
        .expect("message row");
    ChangeEvent::Message(RowChange::insert(row))
}

// ── Unread ───────────────────────────────────────────────────────────

#[tokio::test]
async fn unread_counts_up_on_insert_and_resets_when_opened() {
    let world = World::new();
    let general = world.shared_channel("general");
    let random = world.shared_channel("random");
    world.alice_posts(&general, 3);

    let session = session(&world);
    let engine = engine(&world, &session);
    session.load_channels().await.unwrap();
    session.set_active_channel(Some(random.id)).await.unwrap();
    let unread = |id| session.store().read(|s| s.unread_count(id));
    assert_eq!(unread(general.id), 3);

    let fourth = world.backend.post_message(general.id, world.alice, "four");
    engine.handle_change(&insert_event(&world, &fourth)).await;
    assert_eq!(unread(general.id), 4);

    // Duplicate delivery does not double count.
    engine.handle_change(&insert_event(&world, &fourth)).await;
    assert_eq!(unread(general.id), 4);

    session.set_active_channel(Some(general.id)).await.unwrap();
    assert_eq!(unread(general.id), 0);
    assert_eq!(unread(random.id), 0);
}

#[tokio::test]
async fn insert_seen_by_an_earlier_recount_is_not_counted_twice() {
    let world = World::new();
    let general = world.shared_channel("general");
    let random = world.shared_channel("random");

    let session = session(&world);
    let engine = engine(&world, &session);
    session.load_channels().await.unwrap();
    session.set_active_channel(Some(general.id)).await.unwrap();
    let unread = |id| session.store().read(|s| s.unread_count(id));

    // Posted while general is open; its event is only delivered after the switch.
    let late = world.backend.post_message(general.id, world.alice, "late");
    session.set_active_channel(Some(random.id)).await.unwrap();
    assert_eq!(unread(general.id), 1);

    engine.handle_change(&insert_event(&world, &late)).await;
    assert_eq!(unread(general.id), 1);
    assert_eq!(session.recompute_unread(general.id).await.unwrap(), 1);

    let fresh = world.backend.post_message(general.id, world.alice, "fresh");
    engine.handle_change(&insert_event(&world, &fresh)).await;
    assert_eq!(unread(general.id), 2);
    assert_eq!(session.recompute_unread(general.id).await.unwrap(), 2);
}

#[tokio::test]
async fn incremental_unread_converges_with_recount() {
    let world = World::new();
    let general = world.shared_channel("general");
    let random = world.shared_channel("random");
    let lobby = world.shared_channel("lobby");

    let session = session(&world);
    let engine = engine(&world, &session);
    session.load_channels().await.unwrap();
    session.set_active_channel(Some(lobby.id)).await.unwrap();

    let mut posted = Vec::new();
    for i in 0..4 {
        posted.push(world.backend.post_message(general.id, world.alice, &format!("g{i}")));
        posted.push(world.backend.post_message(random.id, world.alice, &format!("r{i}")));
        posted.push(world.backend.post_message(general.id, world.me, &format!("mine {i}")));
        posted.push(world.backend.post_message(lobby.id, world.alice, &format!("l{i}")));
    }
    for message in &posted {
        engine.handle_change(&insert_event(&world, message)).await;
    }
    let incremental = session.snapshot();
    for channel in [&general, &random] {
        let history = posted.iter().filter(|m| m.channel_id == channel.id);
        let expected = count_unread(history, world.me, None);
        assert_eq!(expected, 4);
        assert_eq!(incremental.unread_count(channel.id), expected);
    }
    assert_eq!(incremental.unread_count(lobby.id), 0);

    session.recompute_all_unread().await.unwrap();
    let recounted = session.snapshot();
    for channel in [&general, &random, &lobby] {
        assert_eq!(
            incremental.unread_count(channel.id),
            recounted.unread_count(channel.id),
            "channel {}",
            channel.name
        );
    }
}

#[tokio::test]
async fn mark_as_read_only_touches_that_channel() {
    let world = World::new();
    let general = world.shared_channel("general");
    let random = world.shared_channel("random");
    world.alice_posts(&general, 2);
    world.alice_posts(&random, 5);

    let session = session(&world);
    session.load_channels().await.unwrap();
    session.mark_as_read(general.id).await.unwrap();

    let state = session.snapshot();
    assert_eq!(state.unread_count(general.id), 0);
    assert_eq!(state.unread_count(random.id), 5);
    assert!(state.membership(general.id).unwrap().last_read_at.is_some());
    assert_eq!(session.recompute_unread(general.id).await.unwrap(), 0);
}

// ── Sending ──────────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_send_leaves_window_unchanged() {
    let world = World::new();
    let general = world.shared_channel("general");
    world.alice_posts(&general, 2);

    let session = session(&world);
    session.load_channels().await.unwrap();
    session.set_active_channel(Some(general.id)).await.unwrap();
    let before = session.store().read(|s| s.messages(general.id));

    // The cache still says "member"; the gateway knows better.
    world.backend.remove_member(general.id, world.me);
    let err = session
        .send_message(general.id, "hello?", None, None)
        .await
        .unwrap_err();
    assert_matches!(err, SyncError::NotAuthorized(_));
    assert_eq!(session.store().read(|s| s.messages(general.id)), before);
}

#[tokio::test]
async fn optimistic_send_failure_removes_pending_entry() {
    let world = World::new();
    let general = world.shared_channel("general");
    let session = session_with(
        &world,
        SyncConfig {
            optimistic_send: true,
            ..SyncConfig::default()
        },
    );
    session.load_channels().await.unwrap();
    session.load_messages(general.id).await.unwrap();

    world
        .backend
        .fail_next(GatewayError::Unavailable("write path down".into()));
    let err = session
        .send_message(general.id, "lost", None, None)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    let state = session.snapshot();
    let window = state.window(general.id).unwrap();
    assert_eq!(window.pending_count(), 0);
    assert!(window.is_empty());
}

#[tokio::test(start_paused = true)]
async fn optimistic_send_shows_pending_then_committed() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let world = World::new();
            let general = world.shared_channel("general");
            let session = session_with(
                &world,
                SyncConfig {
                    optimistic_send: true,
                    ..SyncConfig::default()
                },
            );
            session.load_channels().await.unwrap();
            session.load_messages(general.id).await.unwrap();
            world.backend.set_latency(Some(Duration::from_millis(200)));

            let sender = Arc::clone(&session);
            let channel_id = general.id;
            let send = tokio::task::spawn_local(async move {
                sender.send_message(channel_id, "on its way", None, None).await
            });
            tokio::time::sleep(Duration::from_millis(10)).await;

            let in_flight = session.snapshot();
            let window = in_flight.window(general.id).unwrap();
            assert_eq!(window.pending_count(), 1);
            assert!(window.latest().unwrap().is_pending());

            let sent = send.await.unwrap().unwrap();
            let state = session.snapshot();
            let window = state.window(general.id).unwrap();
            assert_eq!(window.pending_count(), 0);
            assert_eq!(window.len(), 1);
            assert_eq!(window.latest().unwrap().key, sent.key);
            assert_eq!(sent.author.as_ref().unwrap().display_name, "Me");
        })
        .await;
}

#[tokio::test]
async fn sent_message_echo_is_absorbed() {
    let world = World::new();
    let general = world.shared_channel("general");
    let session = session(&world);
    let engine = engine(&world, &session);
    session.load_channels().await.unwrap();
    session.set_active_channel(Some(general.id)).await.unwrap();

    let sent = session
        .send_message(general.id, "ping", None, Some(serde_json::json!({"source": "test"})))
        .await
        .unwrap();
    engine.handle_change(&insert_event(&world, &sent)).await;

    let messages = session.store().read(|s| s.messages(general.id));
    assert_eq!(bodies(&messages), vec!["ping"]);
    assert_eq!(messages[0].metadata["source"], "test");
}

// ── Editing and deleting ─────────────────────────────────────────────

#[tokio::test]
async fn edit_and_soft_delete_replace_in_place() {
    let world = World::new();
    let general = world.shared_channel("general");
    world.alice_posts(&general, 1);
    let session = session(&world);
    session.load_channels().await.unwrap();
    session.set_active_channel(Some(general.id)).await.unwrap();

    let mine = session
        .send_message(general.id, "tpyo", None, None)
        .await
        .unwrap();
    let id = mine.id().unwrap();
    let edited = session.edit_message(id, "typo").await.unwrap();
    assert!(edited.edited_at.is_some());

    let deleted = session.delete_message(id).await.unwrap();
    assert!(deleted.is_deleted);

    let messages = session.store().read(|s| s.messages(general.id));
    assert_eq!(messages.len(), 2);
    assert!(messages[1].is_deleted);
    assert_eq!(messages[1].key, MessageKey::Committed(id));
}

// ── Pagination ───────────────────────────────────────────────────────

#[tokio::test]
async fn pagination_terminates() {
    let world = World::new();
    let general = world.shared_channel("general");
    world.alice_posts(&general, 7);
    let session = session_with(
        &world,
        SyncConfig {
            page_size: 3,
            load_previews: false,
            ..SyncConfig::default()
        },
    );
    session.load_channels().await.unwrap();
    session.load_messages(general.id).await.unwrap();

    assert_eq!(session.load_older_messages(general.id).await.unwrap(), 3);
    assert_eq!(session.load_older_messages(general.id).await.unwrap(), 1);
    let calls = world.backend.call_count("fetch_messages");
    assert_eq!(session.load_older_messages(general.id).await.unwrap(), 0);
    assert_eq!(world.backend.call_count("fetch_messages"), calls);

    let state = session.snapshot();
    let window = state.window(general.id).unwrap();
    assert!(!window.has_more_older());
    assert_eq!(window.len(), 7);
    let expected: Vec<String> = (0..7).map(|i| format!("alice {i}")).collect();
    assert_eq!(bodies(window.iter()), expected);
}

#[tokio::test]
async fn exact_page_multiple_needs_one_empty_fetch() {
    let world = World::new();
    let general = world.shared_channel("general");
    world.alice_posts(&general, 4);
    let session = session_with(
        &world,
        SyncConfig {
            page_size: 2,
            ..SyncConfig::default()
        },
    );
    session.load_channels().await.unwrap();
    session.load_messages(general.id).await.unwrap();

    assert_eq!(session.load_older_messages(general.id).await.unwrap(), 2);
    assert_eq!(session.load_older_messages(general.id).await.unwrap(), 0);
    let has_more = session
        .store()
        .read(|s| s.window(general.id).map(|w| w.has_more_older()));
    assert_eq!(has_more, Some(false));
}

// ── Membership gating ────────────────────────────────────────────────

#[tokio::test]
async fn non_member_load_fails_closed() {
    let world = World::new();
    let general = world.shared_channel("general");
    let secret = world
        .backend
        .create_channel("secret", ChannelKind::Private, world.alice);
    world.backend.post_message(secret.id, world.alice, "classified");

    let session = session(&world);
    session.load_channels().await.unwrap();
    let before = world.backend.call_count("fetch_messages");

    let messages = session.load_messages(secret.id).await.unwrap();
    assert!(messages.is_empty());
    assert_eq!(world.backend.call_count("fetch_messages"), before);
    let state = session.snapshot();
    assert_eq!(
        state.channels().iter().map(|c| c.id).collect::<Vec<_>>(),
        vec![general.id]
    );
    assert!(state.window(secret.id).is_none());
    assert_matches!(
        session.send_message(secret.id, "let me in", None, None).await,
        Err(SyncError::NotMember(id)) if id == secret.id
    );
}

#[tokio::test(start_paused = true)]
async fn revocation_during_fetch_discards_the_page() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let world = World::new();
            let owner = world.alice;
            let channel = world
                .backend
                .create_channel("ops", ChannelKind::Public, owner);
            world
                .backend
                .add_member(channel.id, world.me, MemberRole::Member);
            world.backend.post_message(channel.id, owner, "sensitive");

            let session = session(&world);
            let engine = engine(&world, &session);
            session.load_channels().await.unwrap();
            world.backend.set_latency(Some(Duration::from_millis(100)));

            let loader = Arc::clone(&session);
            let channel_id = channel.id;
            let load = tokio::task::spawn_local(async move { loader.load_messages(channel_id).await });
            tokio::time::sleep(Duration::from_millis(10)).await;

            let membership = world.backend.remove_member(channel.id, world.me).unwrap();
            engine
                .handle_change(&ChangeEvent::Membership(RowChange::delete(membership)))
                .await;

            let loaded = load.await.unwrap().unwrap();
            assert!(loaded.is_empty());
            let state = session.snapshot();
            assert!(!state.has_channel(channel.id));
            assert!(state.window(channel.id).is_none());
        })
        .await;
}

// ── Profiles ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn slow_profiles_degrade_to_placeholders() {
    let world = World::new();
    let general = world.shared_channel("general");
    world.alice_posts(&general, 2);
    world
        .backend
        .set_profile_latency(Some(Duration::from_secs(60)));

    let session = session_with(
        &world,
        SyncConfig {
            fetch_timeout_ms: 200,
            load_previews: false,
            ..SyncConfig::default()
        },
    );
    session.load_channels().await.unwrap();
    let messages = session.load_messages(general.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages
        .iter()
        .all(|m| m.author.as_ref().is_some_and(|a| a.is_placeholder())));

    world.backend.set_profile_latency(None);
    let messages = session.load_messages(general.id).await.unwrap();
    assert!(messages
        .iter()
        .all(|m| m.author.as_ref().is_some_and(|a| a.display_name == "Alice")));
}

#[tokio::test]
async fn authors_resolve_in_one_batch_per_page() {
    let world = World::new();
    let general = world.shared_channel("general");
    world.alice_posts(&general, 3);
    world.backend.post_message(general.id, world.me, "me too");

    let session = session_with(
        &world,
        SyncConfig {
            load_previews: false,
            ..SyncConfig::default()
        },
    );
    session.load_channels().await.unwrap();
    session.load_messages(general.id).await.unwrap();
    assert_eq!(world.backend.call_count("fetch_profiles"), 1);
    assert_eq!(session.profiles().len(), 2);
}

// ── Gateway timeouts ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn gateway_timeout_is_transient_and_leaves_state() {
    let world = World::new();
    let general = world.shared_channel("general");
    world.alice_posts(&general, 2);
    let session = session_with(
        &world,
        SyncConfig {
            fetch_timeout_ms: 100,
            ..SyncConfig::default()
        },
    );
    session.load_channels().await.unwrap();
    session.load_messages(general.id).await.unwrap();
    let before = session.snapshot();

    world.backend.set_latency(Some(Duration::from_secs(5)));
    let err = session.load_messages(general.id).await.unwrap_err();
    assert_matches!(err, SyncError::Gateway(GatewayError::Timeout(100)));
    assert!(err.is_transient());
    assert_eq!(session.snapshot(), before);
}

// ── Members, joining and search ──────────────────────────────────────

#[tokio::test]
async fn join_and_leave_public_channel() {
    let world = World::new();
    let lobby = world
        .backend
        .create_channel("lobby", ChannelKind::Public, world.alice);
    world.alice_posts(&lobby, 2);

    let session = session(&world);
    session.load_channels().await.unwrap();
    assert!(!session.snapshot().has_channel(lobby.id));

    session.join_channel(lobby.id).await.unwrap();
    let state = session.snapshot();
    assert!(state.has_channel(lobby.id));
    assert_eq!(state.unread_count(lobby.id), 2);

    // Joining twice is harmless.
    session.join_channel(lobby.id).await.unwrap();

    session.leave_channel(lobby.id).await.unwrap();
    assert!(!session.snapshot().has_channel(lobby.id));
    assert!(world.backend.membership(lobby.id, world.me).is_none());
}

#[tokio::test]
async fn private_channels_cannot_be_self_joined() {
    let world = World::new();
    let vault = world
        .backend
        .create_channel("vault", ChannelKind::Private, world.alice);
    let session = session(&world);
    assert_matches!(
        session.join_channel(vault.id).await,
        Err(SyncError::NotAuthorized(_))
    );
}

#[tokio::test]
async fn creator_manages_members_of_open_channel() {
    let world = World::new();
    let general = world.shared_channel("general");
    let bob = parley_core::model::UserId::new();

    let session = session(&world);
    session.load_channels().await.unwrap();
    session.set_active_channel(Some(general.id)).await.unwrap();

    session
        .add_member(general.id, bob, MemberRole::Member)
        .await
        .unwrap();
    let promoted = session
        .set_member_role(general.id, bob, MemberRole::Manager)
        .await
        .unwrap();
    assert_eq!(promoted.role, MemberRole::Manager);

    let members = session
        .store()
        .read(|s| s.channel_members().map(|m| m.members.clone()))
        .unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().any(|m| m.user_id == bob && m.role == MemberRole::Manager));

    session.remove_member(general.id, bob).await.unwrap();
    let members = session.load_channel_members(general.id).await.unwrap();
    assert_eq!(members.len(), 2);
}

#[tokio::test]
async fn search_only_covers_visible_channels() {
    let world = World::new();
    let general = world.shared_channel("general");
    let secret = world
        .backend
        .create_channel("secret", ChannelKind::Private, world.alice);
    world.backend.post_message(general.id, world.alice, "Release notes are up");
    world.backend.post_message(secret.id, world.alice, "release date is secret");

    let session = session(&world);
    session.load_channels().await.unwrap();
    let results = session.search_messages("release").await.unwrap();
    assert_eq!(bodies(&results.messages), vec!["Release notes are up"]);
    assert!(results.messages[0].author.is_some());

    let empty = session.search_messages("   ").await.unwrap();
    assert!(empty.messages.is_empty());
    assert!(session.store().read(|s| s.search_results().is_none()));
}
