//! Data access through the authenticating proxy.
//!
//! Run with: `cargo test -p verity-auth --test secure_access`

mod common;

use std::sync::Arc;

use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use verity_auth::proxy::{AccessError, RemoteError};
use verity_core::TransitionKind;
use verity_storage::SharedStorage;

use common::{ADA, FakeAccessor, FakeIdentityServer, init_test, open_tab, seed_session};

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn query_chain_reaches_backend_once_authenticated() {
    init_test();
    let storage = SharedStorage::in_memory();
    let server = FakeIdentityServer::new();
    let tab = open_tab(&storage, &server, "tab-a");
    seed_session(&tab, &server.issue(ADA));
    let accessor = FakeAccessor::new();
    let proxy = tab.coordinator.secure_accessor(Arc::new(accessor.clone()));

    let rows = assert_ok!(
        proxy
            .from("notes")
            .select("id,title")
            .eq("owner", ADA)
            .order("created_at", false)
            .limit(20)
            .execute()
            .await
    );

    assert_eq!(
        accessor.executed(),
        vec![vec![
            "from notes".to_string(),
            "select id,title".to_string(),
            "eq owner \"user-1\"".to_string(),
            "order created_at desc".to_string(),
            "limit 20".to_string(),
        ]]
    );
    assert_eq!(rows["ops"][0], "from notes");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unauthenticated_callers_never_reach_the_backend() {
    init_test();
    let storage = SharedStorage::in_memory();
    let server = FakeIdentityServer::new();
    let tab = open_tab(&storage, &server, "tab-a");
    let accessor = FakeAccessor::new();
    let proxy = tab.coordinator.secure_accessor(Arc::new(accessor.clone()));

    let err = assert_err!(proxy.from("notes").select("*").execute().await);
    assert!(matches!(err, AccessError::AuthRequired));

    let err = assert_err!(proxy.rpc("archive_notes", json!({ "days": 30 })).await);
    assert!(matches!(err, AccessError::AuthRequired));

    assert!(accessor.executed().is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn data_access_waits_out_unsafe_transitions() {
    init_test();
    let storage = SharedStorage::in_memory();
    let server = FakeIdentityServer::new();
    let tab = open_tab(&storage, &server, "tab-a");
    seed_session(&tab, &server.issue(ADA));
    let accessor = FakeAccessor::new();
    let proxy = tab.coordinator.secure_accessor(Arc::new(accessor.clone()));
    let transitions = tab.coordinator.transitions();

    for kind in [
        TransitionKind::OauthCallback,
        TransitionKind::LoggingOut,
        TransitionKind::Impersonating,
        TransitionKind::CacheClearing,
    ] {
        transitions.start_transition(kind, None);
        assert!(!tab.coordinator.is_safe_for_api_calls());
        let err = assert_err!(proxy.from("notes").execute().await);
        assert!(matches!(err, AccessError::Unavailable { transition } if transition == kind));
        transitions.end_transition();
    }
    assert!(accessor.executed().is_empty());

    transitions.start_transition(TransitionKind::RefreshingToken, None);
    assert_ok!(proxy.from("notes").execute().await);
    transitions.end_transition();
    assert_eq!(accessor.executed().len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn authorization_failure_invalidates_cached_verification() {
    init_test();
    let storage = SharedStorage::in_memory();
    let server = FakeIdentityServer::new();
    let tab = open_tab(&storage, &server, "tab-a");
    seed_session(&tab, &server.issue(ADA));
    let accessor = FakeAccessor::new();
    let proxy = tab.coordinator.secure_accessor(Arc::new(accessor.clone()));

    assert_ok!(proxy.from("notes").execute().await);
    assert_eq!(server.get_user_calls(), 1);

    accessor.fail_next(RemoteError::new(Some(401), "JWT expired"));
    let err = assert_err!(proxy.from("notes").delete().eq("id", 7).execute().await);
    assert!(matches!(err, AccessError::PermissionDenied { status: 401, .. }));
    assert!(tab.coordinator.get_auth_state().verification.is_none());

    assert_ok!(proxy.rpc("touch", json!({})).await);
    assert_eq!(server.get_user_calls(), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn other_remote_failures_pass_through_untouched() {
    init_test();
    let storage = SharedStorage::in_memory();
    let server = FakeIdentityServer::new();
    let tab = open_tab(&storage, &server, "tab-a");
    seed_session(&tab, &server.issue(ADA));
    let accessor = FakeAccessor::new();
    let proxy = tab.coordinator.secure_accessor(Arc::new(accessor.clone()));

    accessor.fail_next(RemoteError::new(Some(409), "duplicate key"));
    let err = assert_err!(
        proxy
            .from("notes")
            .insert(json!({ "title": "hello" }))
            .execute()
            .await
    );

    assert!(matches!(err, AccessError::Remote(RemoteError { status: Some(409), .. })));
    assert!(tab.coordinator.get_auth_state().is_authenticated());
}
