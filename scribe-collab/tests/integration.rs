//! End-to-end tests: a real server, real WebSocket channels, real editors.

mod common;

use common::{close_reason, pump_for, pump_until, rooms_become, server_text_becomes, TestServer};
use scribe_collab::channel::{CloseReason, SyncChannel, TransportState};
use scribe_collab::editor::EditorInput;
use scribe_collab::permission::Role;
use scribe_collab::server::ServerConfig;
use scribe_collab::session::LogoutReason;
use scribe_collab::SyncError;
use scribe_core::TextOp;
use tokio::time::Duration;
use uuid::Uuid;

fn insert(index: u32, text: &str) -> EditorInput {
    EditorInput::Edit(TextOp::insert(index, text))
}

#[tokio::test]
async fn test_reader_edit_rejected_writer_edit_converges() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Read)]).await;

    let mut writer = srv.open(&alice, doc).await;
    let mut reader = srv.open(&bob, doc).await;
    assert!(reader.is_read_only());
    assert!(reader.surface().read_only);

    let denied = reader.handle_input(insert(0, "Hi"));
    assert!(matches!(denied, Err(SyncError::Forbidden(_))));
    assert_eq!(reader.text(), "");
    assert_eq!(reader.channel().pending_outbound(), 0);

    writer.handle_input(insert(0, "Hello")).unwrap();
    assert_eq!(writer.text(), "Hello");
    assert!(pump_until(&mut reader, |b| b.text() == "Hello").await);
    assert_eq!(reader.surface().text, "Hello");
    assert!(server_text_becomes(&srv.server, doc, "Hello").await);

    // Nothing from the reader ever reached the server.
    assert_eq!(srv.server.stats().await.denied_frames, 0);
}

#[tokio::test]
async fn test_concurrent_writers_converge() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Write)]).await;

    let mut a = srv.open(&alice, doc).await;
    let mut b = srv.open(&bob, doc).await;

    a.handle_input(insert(0, "abc")).unwrap();
    b.handle_input(insert(0, "xyz")).unwrap();

    assert!(pump_until(&mut a, |e| e.text().len() == 6).await);
    assert!(pump_until(&mut b, |e| e.text().len() == 6).await);
    assert_eq!(a.text(), b.text());
    assert!(a.text().contains("abc") && a.text().contains("xyz"));
    assert!(server_text_becomes(&srv.server, doc, &a.text()).await);

    let stats = srv.server.stats().await;
    assert_eq!(stats.active_rooms, 1);
    assert_eq!(stats.active_connections, 2);
}

#[tokio::test]
async fn test_reopened_editor_catches_up() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Write)]).await;

    let mut a = srv.open(&alice, doc).await;
    let mut b = srv.open(&bob, doc).await;
    a.handle_input(insert(0, "shared")).unwrap();
    assert!(pump_until(&mut b, |e| e.text() == "shared").await);

    b.close();
    assert_eq!(b.close_reason(), Some(CloseReason::Requested));
    a.handle_input(insert(6, " notes")).unwrap();
    assert!(server_text_becomes(&srv.server, doc, "shared notes").await);

    let mut b = srv.open(&bob, doc).await;
    assert!(pump_until(&mut b, |e| e.text() == "shared notes").await);
    pump_for(&mut a, Duration::from_millis(50)).await;
    assert_eq!(a.text(), "shared notes");
}

#[tokio::test]
async fn test_edits_survive_dropped_connections() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Write)]).await;

    let mut a = srv.open(&alice, doc).await;
    let mut b = srv.open(&bob, doc).await;
    a.handle_input(insert(0, "one")).unwrap();
    assert!(pump_until(&mut b, |e| e.text() == "one").await);

    let first_session = a.session_id();
    srv.server.drop_connections();
    // Made while the connection is going away; the resync on reconnect
    // delivers it even if the socket swallowed it.
    a.handle_input(insert(3, " two")).unwrap();

    assert!(pump_until(&mut a, |e| e.session_id() != first_session).await);
    let statuses = &a.surface().statuses;
    let reconnecting = statuses
        .iter()
        .rposition(|s| *s == TransportState::Reconnecting)
        .unwrap();
    assert!(statuses[reconnecting + 1..].contains(&TransportState::Open));
    assert!(pump_until(&mut b, |e| e.text() == "one two").await);
    assert!(server_text_becomes(&srv.server, doc, "one two").await);
}

#[tokio::test]
async fn test_logout_tears_down_every_channel() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;

    let mut docs = Vec::new();
    for _ in 0..3 {
        docs.push(srv.document(&alice, &[(&bob, Role::Write)]).await);
    }
    let mut editors = Vec::new();
    for doc in &docs {
        editors.push(srv.open(&alice, *doc).await);
    }
    let mut other = srv.open(&bob, docs[0]).await;

    alice.session.logout().await;
    for editor in &editors {
        assert!(!editor.channel().is_active());
    }

    other.handle_input(insert(0, "after logout")).unwrap();
    assert!(server_text_becomes(&srv.server, docs[0], "after logout").await);

    for editor in editors.iter_mut() {
        assert!(pump_until(editor, |e| e.close_reason().is_some()).await);
        assert_eq!(editor.close_reason(), Some(CloseReason::LoggedOut));
        assert_eq!(editor.surface().closed, Some(CloseReason::LoggedOut));
        assert_eq!(editor.channel().state(), TransportState::Closed);
        assert!(editor.is_read_only());
        assert_eq!(editor.text(), "");
        assert!(matches!(
            editor.handle_input(insert(0, "x")),
            Err(SyncError::AuthExpired)
        ));
    }
    assert_eq!(alice.session.snapshot().last_logout, Some(LogoutReason::Requested));
}

#[tokio::test]
async fn test_new_login_supersedes_open_channels() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let doc = srv.document(&alice, &[]).await;
    let mut editor = srv.open(&alice, doc).await;

    alice.session.login(&alice.credentials).await.unwrap();
    assert!(!editor.channel().is_active());
    assert!(pump_until(&mut editor, |e| e.close_reason().is_some()).await);
    assert_eq!(editor.close_reason(), Some(CloseReason::LoggedOut));
}

#[tokio::test]
async fn test_downgrade_denied_by_server_then_enforced_locally() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Write)]).await;

    let mut a = srv.open(&alice, doc).await;
    let mut b = srv.open(&bob, doc).await;
    b.handle_input(insert(0, "accepted")).unwrap();
    assert!(pump_until(&mut a, |e| e.text() == "accepted").await);

    srv.directory()
        .grant(alice.user_id, doc, bob.user_id, Role::Read)
        .await
        .unwrap();

    // The cached capability is stale: the edit leaves, the server refuses it.
    assert_eq!(b.role(), Role::Write);
    b.handle_input(insert(0, "late ")).unwrap();
    assert!(pump_until(&mut b, |e| e.is_read_only()).await);
    assert_eq!(b.role(), Role::Read);
    assert!(b.surface().read_only);
    assert!(b.channel().is_active());

    assert!(matches!(
        b.handle_input(insert(0, "again")),
        Err(SyncError::Forbidden(_))
    ));
    assert_eq!(b.channel().pending_outbound(), 0);

    assert_eq!(srv.server.stats().await.denied_frames, 1);
    assert_eq!(srv.server.document_text(doc).await.as_deref(), Some("accepted"));
    pump_for(&mut a, Duration::from_millis(100)).await;
    assert_eq!(a.text(), "accepted");
}

#[tokio::test]
async fn test_refreshed_capability_rejects_before_sending() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Write)]).await;
    let mut b = srv.open(&bob, doc).await;
    assert!(!b.is_read_only());

    srv.directory()
        .grant(alice.user_id, doc, bob.user_id, Role::Read)
        .await
        .unwrap();
    assert_eq!(b.refresh_capability().await.unwrap(), Role::Read);
    assert!(b.is_read_only());

    assert!(matches!(
        b.handle_input(insert(0, "nope")),
        Err(SyncError::Forbidden(_))
    ));
    assert_eq!(b.text(), "");
    assert_eq!(srv.server.stats().await.denied_frames, 0);
}

#[tokio::test]
async fn test_full_revoke_closes_channel() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Read)]).await;
    let mut b = srv.open(&bob, doc).await;

    srv.directory()
        .revoke(alice.user_id, doc, bob.user_id)
        .await
        .unwrap();
    b.handle_input(EditorInput::Cursor {
        position: 0,
        selection: None,
    })
    .unwrap();

    assert!(pump_until(&mut b, |e| e.close_reason().is_some()).await);
    assert_eq!(b.close_reason(), Some(CloseReason::Forbidden));
    assert_eq!(b.role(), Role::None);
    assert!(matches!(
        b.handle_input(insert(0, "x")),
        Err(SyncError::Forbidden(_))
    ));
}

#[tokio::test]
async fn test_rejected_token_logs_the_session_out() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let doc = srv.document(&alice, &[]).await;
    assert_eq!(alice.gate.refresh(doc).await.unwrap(), Role::Owner);

    let token = alice.session.current_token().unwrap();
    assert!(srv.accounts().revoke_token(&token).await);

    let mut channel = SyncChannel::open(
        doc,
        alice.session.clone(),
        alice.gate.clone(),
        srv.channel_config(),
    )
    .unwrap();
    assert_eq!(close_reason(&mut channel).await, Some(CloseReason::AuthExpired));
    assert!(!alice.session.is_authenticated());
    assert_eq!(alice.session.snapshot().last_logout, Some(LogoutReason::Expired));
    assert_eq!(srv.server.stats().await.rejected_handshakes, 1);
}

#[tokio::test]
async fn test_open_without_access_is_forbidden() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let carol = srv.user("carol").await;
    let doc = srv.document(&alice, &[]).await;

    assert!(matches!(
        srv.open_unready(&carol, doc).await,
        Err(SyncError::Forbidden(_))
    ));

    // A stale cache does not get past the handshake either.
    carol.gate.record(doc, Role::Read);
    let mut channel = SyncChannel::open(
        doc,
        carol.session.clone(),
        carol.gate.clone(),
        srv.channel_config(),
    )
    .unwrap();
    assert_eq!(close_reason(&mut channel).await, Some(CloseReason::Forbidden));
    assert_eq!(carol.gate.cached(doc), Role::None);
    assert!(carol.session.is_authenticated());
}

#[tokio::test]
async fn test_unknown_document_not_found() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let missing = Uuid::new_v4();

    assert!(matches!(
        srv.open_unready(&alice, missing).await,
        Err(SyncError::NotFound(id)) if id == missing
    ));

    let mut channel = SyncChannel::open(
        missing,
        alice.session.clone(),
        alice.gate.clone(),
        srv.channel_config(),
    )
    .unwrap();
    assert_eq!(close_reason(&mut channel).await, Some(CloseReason::NotFound));
}

#[tokio::test]
async fn test_deleted_document_closes_editors() {
    let srv = TestServer::start().await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Read)]).await;

    let mut a = srv.open(&alice, doc).await;
    let mut b = srv.open(&bob, doc).await;
    a.handle_input(insert(0, "doomed")).unwrap();
    assert!(pump_until(&mut b, |e| e.text() == "doomed").await);

    let token = alice.session.current_token().unwrap();
    srv.server.delete_document(&token, doc).await.unwrap();

    assert!(pump_until(&mut b, |e| e.close_reason().is_some()).await);
    assert_eq!(b.close_reason(), Some(CloseReason::DocumentDeleted));
    assert!(matches!(
        b.handle_input(EditorInput::Cursor {
            position: 0,
            selection: None
        }),
        Err(SyncError::DocumentDeleted(id)) if id == doc
    ));

    assert!(pump_until(&mut a, |e| e.close_reason().is_some()).await);
    assert_eq!(a.close_reason(), Some(CloseReason::DocumentDeleted));
    // The replica stays readable after the close.
    assert_eq!(b.text(), "doomed");

    assert!(srv.server.document_text(doc).await.is_none());
    assert!(rooms_become(&srv.server, 0).await);
}

#[tokio::test]
async fn test_lagging_reader_converges_through_server_resync() {
    // A one-slot room broadcast: a burst of writes overflows the reader's
    // receiver and the server falls back to a state-vector resync.
    let srv = TestServer::start_with(ServerConfig {
        broadcast_capacity: 1,
        ..ServerConfig::default()
    })
    .await;
    let alice = srv.user("alice").await;
    let bob = srv.user("bob").await;
    let doc = srv.document(&alice, &[(&bob, Role::Read)]).await;

    let mut writer = srv.open(&alice, doc).await;
    let mut reader = srv.open(&bob, doc).await;

    let mut expected = String::new();
    for i in 0..50 {
        let word = format!("w{i:02} ");
        writer
            .handle_input(insert(expected.len() as u32, &word))
            .unwrap();
        expected.push_str(&word);
    }

    assert!(server_text_becomes(&srv.server, doc, &expected).await);
    assert!(pump_until(&mut reader, |b| b.text() == expected).await);
    assert_eq!(reader.surface().text, expected);
    // A reader answers the resync with SyncStep1 only, which READ permits.
    assert_eq!(srv.server.stats().await.denied_frames, 0);
}
