#![cfg(feature = "memory-store")]

use std::sync::Arc;

use rs_catalog_auth::{
    MemoryStore, ObjectRef, OwnerKey, RelationKey, RelationKind, Toggle, ToggleManager,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_pair_toggles_converge_to_parity() {
    let store = MemoryStore::new();
    let user = store.add_user("fan@x.com", "fan", &["ROLE_USER"]).unwrap();
    let artist = store.add_artist();
    let manager = Arc::new(ToggleManager::new(store));

    for n in [1usize, 2, 7, 16] {
        let before = manager.is_member(RelationKey::follow(user, artist)).await.unwrap();
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.follow_artist(user, artist).await })
            })
            .collect();

        let mut added = 0usize;
        let mut removed = 0usize;
        for handle in handles {
            match handle.await.unwrap().unwrap().change {
                Toggle::Added => added += 1,
                Toggle::Removed => removed += 1,
            }
        }
        assert_eq!(added + removed, n);

        let member = manager.is_member(RelationKey::follow(user, artist)).await.unwrap();
        assert_eq!(member, before ^ (n % 2 == 1));
        let count = manager.count(ObjectRef::Artist(artist)).await.unwrap();
        assert_eq!(count, u64::from(member));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counters_match_rows_after_many_users_like() {
    let store = MemoryStore::new();
    let owner = store.add_user("artist@x.com", "Nova", &["ROLE_ARTIST"]).unwrap();
    let song = store.add_song(OwnerKey::ById(owner));
    let fans: Vec<_> = (0..20)
        .map(|i| {
            store
                .add_user(&format!("fan{i}@x.com"), &format!("fan{i}"), &["USER"])
                .unwrap()
        })
        .collect();
    let manager = Arc::new(ToggleManager::new(store));

    // Even-numbered fans toggle twice, odd ones once.
    let handles: Vec<_> = fans
        .iter()
        .enumerate()
        .flat_map(|(i, fan)| std::iter::repeat_n(*fan, if i % 2 == 0 { 2 } else { 1 }))
        .map(|fan| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.like_song(fan, song).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let count = manager.count(ObjectRef::Song(song)).await.unwrap();
    assert_eq!(count, 10);
    let reconciled = manager.reconcile(ObjectRef::Song(song)).await.unwrap();
    assert!(!reconciled.drifted());

    let top = manager.top_objects(RelationKind::Like, 5).await.unwrap();
    assert_eq!(top, vec![(ObjectRef::Song(song), 10)]);
}
