//! End-to-end behaviour of the element cache over the in-memory provider.

use assembly_cache::{
    CacheConfig, ChannelTransport, Element, ElementCache, ElementChange, ElementId,
    MemoryCacheProvider, RestrictionEngine, RestrictionRegistry, RestrictionStrategy, UserId,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

const ADMIN: UserId = 1;
const DELEGATE: UserId = 2;

fn element(value: Value) -> Element {
    value.as_object().unwrap().clone()
}

fn id(collection: &str, id: u64) -> ElementId {
    ElementId::new(collection, id).unwrap()
}

fn has_perm(user: UserId, perm: &str) -> bool {
    match user {
        ADMIN => true,
        DELEGATE => perm == "motions.can_see",
        _ => false,
    }
}

fn source() -> BTreeMap<String, Vec<Element>> {
    let mut source = BTreeMap::new();
    source.insert(
        "core/tag".to_string(),
        vec![element(json!({"id": 1, "name": "Important"}))],
    );
    source.insert(
        "users/user".to_string(),
        vec![
            element(json!({"id": 1, "username": "admin", "first_name": "Ada", "email": "ada@example.com"})),
            element(json!({"id": 2, "username": "delegate", "first_name": "Bob", "email": "bob@example.com"})),
        ],
    );
    source.insert(
        "motions/motion".to_string(),
        vec![element(json!({"id": 10, "title": "Budget"}))],
    );
    source.insert(
        "users/personal_note".to_string(),
        vec![element(json!({"id": 3, "user_id": 2, "note": "remember", "_no_delete_on_restriction": true}))],
    );
    source
}

fn registry() -> RestrictionRegistry {
    RestrictionRegistry::new()
        .register(
            "motions/motion",
            RestrictionStrategy::Permission("motions.can_see".to_string()),
        )
        .register(
            "users/user",
            RestrictionStrategy::PermissionOrFields {
                permission: "users.can_see_extra_data".to_string(),
                fields: vec!["id".to_string(), "username".to_string(), "first_name".to_string()],
            },
        )
        .register(
            "users/personal_note",
            RestrictionStrategy::OwnerOrPermission {
                owner_field: "user_id".to_string(),
                permission: "users.can_manage".to_string(),
            },
        )
}

async fn cache() -> Arc<ElementCache> {
    let cache = ElementCache::new(
        Arc::new(MemoryCacheProvider::new()),
        Arc::new(RestrictionEngine::new(registry(), Arc::new(has_perm))),
        CacheConfig::for_testing(),
    )
    .with_populator(Arc::new(source()));
    cache.init().await.unwrap();
    // Start past change id 0, which always means "send everything".
    cache
        .change_elements(vec![ElementChange::update(
            id("core/tag", 2),
            element(json!({"id": 2, "name": "Seed"})),
        )])
        .await
        .unwrap();
    Arc::new(cache)
}

#[tokio::test]
async fn test_rebuild_matches_populator() {
    let cache = cache().await;
    assert_eq!(cache.get_all_data_list(None).await.unwrap().len(), 4);
    assert_eq!(
        cache.get_all_data_list(None).await.unwrap()["users/user"],
        source()["users/user"]
    );
}

#[tokio::test]
async fn test_internal_fields_never_leave_the_cache() {
    let cache = cache().await;
    let note = cache
        .get_element_data("users/personal_note", 3, None)
        .await
        .unwrap()
        .unwrap();
    assert!(!note.contains_key("_no_delete_on_restriction"));
    assert_eq!(note["note"], "remember");
}

#[tokio::test]
async fn test_tags_are_world_readable() {
    let cache = cache().await;
    let unrestricted = cache.get_collection_data("core/tag", None).await.unwrap();
    let delegate = cache.get_collection_data("core/tag", Some(DELEGATE)).await.unwrap();
    assert_eq!(unrestricted, delegate);
}

#[tokio::test]
async fn test_users_reduced_to_public_fields() {
    let cache = cache().await;

    let admin_view = cache.get_collection_data("users/user", Some(ADMIN)).await.unwrap();
    assert_eq!(admin_view[&2]["email"], "bob@example.com");

    let delegate_view = cache.get_collection_data("users/user", Some(DELEGATE)).await.unwrap();
    assert_eq!(delegate_view.len(), 2);
    for user in delegate_view.values() {
        assert!(!user.contains_key("email"));
        assert!(user.contains_key("username"));
    }
}

#[tokio::test]
async fn test_personal_notes_visible_to_owner_only() {
    let cache = cache().await;
    assert!(cache
        .get_element_data("users/personal_note", 3, Some(DELEGATE))
        .await
        .unwrap()
        .is_some());
    assert!(cache
        .get_element_data("users/personal_note", 3, Some(99))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_restricted_user_never_sees_raw_data_after_writes() {
    let cache = cache().await;

    // Warm the restriction cache for both users.
    cache.get_collection_data("users/user", Some(DELEGATE)).await.unwrap();
    cache.get_collection_data("users/user", Some(ADMIN)).await.unwrap();

    let updated = element(json!({"id": 2, "username": "delegate", "first_name": "Bob", "email": "new@example.com"}));
    let change_id = cache
        .change_elements(vec![ElementChange::update(id("users/user", 2), updated).by_user(ADMIN)])
        .await
        .unwrap();

    let delegate_view = cache.get_element_data("users/user", 2, Some(DELEGATE)).await.unwrap().unwrap();
    assert!(!delegate_view.contains_key("email"));
    let admin_view = cache.get_element_data("users/user", 2, Some(ADMIN)).await.unwrap().unwrap();
    assert_eq!(admin_view["email"], "new@example.com");

    let since = cache.get_data_since(change_id - 1, Some(DELEGATE)).await.unwrap();
    assert!(!since.changed["users/user"][0].contains_key("email"));
}

#[tokio::test]
async fn test_permission_change_takes_effect_after_bump() {
    let granted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = granted.clone();
    let engine = RestrictionEngine::new(
        registry(),
        Arc::new(move |_: UserId, perm: &str| {
            perm == "motions.can_see" && flag.load(std::sync::atomic::Ordering::SeqCst)
        }),
    );
    let cache = ElementCache::new(
        Arc::new(MemoryCacheProvider::new()),
        Arc::new(engine),
        CacheConfig::for_testing(),
    )
    .with_populator(Arc::new(source()));

    assert!(cache.get_element_data("motions/motion", 10, Some(5)).await.unwrap().is_none());

    granted.store(true, std::sync::atomic::Ordering::SeqCst);
    // Cached result still applies until the permission version moves.
    assert!(cache.get_element_data("motions/motion", 10, Some(5)).await.unwrap().is_none());

    cache.restrictions().bump_permission_version(5);
    assert!(cache.get_element_data("motions/motion", 10, Some(5)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_restricted_away_element_reported_as_deleted() {
    let cache = cache().await;
    let change_id = cache
        .change_elements(vec![ElementChange::update(
            id("motions/motion", 10),
            element(json!({"id": 10, "title": "Budget v2"})),
        )])
        .await
        .unwrap();

    let visible = cache.get_data_since(change_id - 1, Some(DELEGATE)).await.unwrap();
    assert_eq!(visible.changed["motions/motion"][0]["title"], "Budget v2");

    let hidden = cache.get_data_since(change_id - 1, Some(99)).await.unwrap();
    assert!(hidden.changed.is_empty());
    assert_eq!(hidden.deleted, vec![id("motions/motion", 10)]);
}

#[tokio::test]
async fn test_no_delete_on_restriction_suppresses_deleted() {
    let cache = cache().await;
    let change_id = cache
        .change_elements(vec![ElementChange::update(
            id("users/personal_note", 3),
            element(json!({"id": 3, "user_id": 2, "note": "edited", "_no_delete_on_restriction": true})),
        )])
        .await
        .unwrap();

    let stranger = cache.get_data_since(change_id - 1, Some(99)).await.unwrap();
    assert!(stranger.is_empty());
}

#[tokio::test]
async fn test_concurrent_disjoint_batches() {
    let cache = cache().await;

    let left = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .change_elements(vec![ElementChange::update(
                    id("core/tag", 100),
                    element(json!({"id": 100, "name": "left"})),
                )])
                .await
        })
    };
    let right = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .change_elements(vec![ElementChange::update(
                    id("core/tag", 200),
                    element(json!({"id": 200, "name": "right"})),
                )])
                .await
        })
    };
    let left_id = left.await.unwrap().unwrap();
    let right_id = right.await.unwrap().unwrap();
    assert_ne!(left_id, right_id);

    let tags = cache.get_collection_data("core/tag", None).await.unwrap();
    assert!(tags.contains_key(&100) && tags.contains_key(&200));

    let (first, second) = if left_id < right_id {
        (100, 200)
    } else {
        (200, 100)
    };
    let since_first = cache.get_data_since(left_id.min(right_id) - 1, None).await.unwrap();
    let ids: Vec<u64> = since_first.changed["core/tag"]
        .iter()
        .map(|tag| tag["id"].as_u64().unwrap())
        .collect();
    assert_eq!(ids.len(), 2);

    let since_second = cache.get_data_since(left_id.min(right_id), None).await.unwrap();
    assert_eq!(since_second.changed["core/tag"].len(), 1);
    assert_eq!(since_second.changed["core/tag"][0]["id"], second);
    assert!(ids.contains(&first));
}

#[tokio::test]
async fn test_sessions_receive_batches_in_change_id_order() {
    let cache = cache().await;
    let (transport, mut rx) = ChannelTransport::new(64);
    cache
        .connect_session(ADMIN, cache.current_change_id().await.unwrap(), Arc::new(transport))
        .await
        .unwrap();

    let mut writers = Vec::new();
    for n in 0..10u64 {
        let cache = cache.clone();
        writers.push(tokio::spawn(async move {
            cache
                .change_elements(vec![ElementChange::update(
                    id("core/tag", 1000 + n),
                    element(json!({"id": 1000 + n})),
                )])
                .await
                .unwrap()
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let mut last = 0;
    for _ in 0..10 {
        let message = rx.recv().await.unwrap();
        assert_eq!(message.from_change_id + 1, message.to_change_id);
        assert!(message.to_change_id > last);
        last = message.to_change_id;
    }
}

#[tokio::test]
async fn test_reconnect_receives_only_missed_changes() {
    let cache = cache().await;
    let (transport, _rx) = ChannelTransport::new(8);
    let (session_id, initial) = cache.connect_session(ADMIN, 0, Arc::new(transport)).await.unwrap();
    assert!(initial.all_data);
    cache.autoupdate().disconnect(&session_id);

    cache
        .change_elements(vec![ElementChange::delete(id("core/tag", 1))])
        .await
        .unwrap();

    let (transport, _rx) = ChannelTransport::new(8);
    let (_, missed) = cache
        .connect_session(ADMIN, initial.to_change_id, Arc::new(transport))
        .await
        .unwrap();
    assert!(!missed.all_data);
    assert_eq!(missed.deleted, vec![id("core/tag", 1)]);
    assert!(missed.changed.is_empty());
}

#[tokio::test]
async fn test_reconnect_after_rebuild_starts_over() {
    let cache = cache().await;
    cache
        .change_elements(vec![ElementChange::update(
            id("core/tag", 50),
            element(json!({"id": 50, "name": "Gone"})),
        )])
        .await
        .unwrap();
    let held = cache.current_change_id().await.unwrap();

    cache.force_rebuild().await.unwrap();
    for n in [51, 52] {
        cache
            .change_elements(vec![ElementChange::update(id("core/tag", n), element(json!({"id": n})))])
            .await
            .unwrap();
    }
    assert!(cache.current_change_id().await.unwrap() > held);

    let (transport, _rx) = ChannelTransport::new(8);
    let (_, resumed) = cache.connect_session(ADMIN, held, Arc::new(transport)).await.unwrap();
    assert!(resumed.all_data);
    let tags: Vec<u64> = resumed.changed["core/tag"]
        .iter()
        .filter_map(|tag| tag["id"].as_u64())
        .collect();
    assert!(!tags.contains(&50));
    assert!(tags.contains(&51));
    assert!(tags.contains(&52));
}
