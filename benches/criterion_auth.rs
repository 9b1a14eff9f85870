#![cfg(all(feature = "criterion-bench", feature = "memory-store"))]

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use futures::executor::block_on;
use rs_catalog_auth::{
    Guard, IdentityResolver, MemoryStore, OwnerKey, Role, Subject, TokenCodec, ToggleManager,
    normalize_roles,
};

const SECRET: &str = "criterion-bench-secret-0123456789abcd";

fn bench_token(c: &mut Criterion) {
    let mut group = c.benchmark_group("token");
    group.throughput(Throughput::Elements(1));

    let codec = TokenCodec::new(SECRET).unwrap();
    let subject = Subject::try_from("bench@x.com").unwrap();
    let token = codec.issue_now(&subject).unwrap();

    group.bench_function("issue", |b| {
        b.iter(|| black_box(codec.issue_now(&subject).unwrap()));
    });
    group.bench_function("verify", |b| {
        b.iter(|| black_box(codec.verify(token.as_str()).unwrap()));
    });
    group.bench_function("verify_garbage", |b| {
        b.iter(|| black_box(codec.verify("not.a.token").is_err()));
    });
    group.finish();
}

fn bench_resolution(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolution");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    for role_count in [1usize, 8, 64] {
        let store = MemoryStore::new();
        let roles: Vec<String> = (0..role_count)
            .map(|i| if i == 0 { "artist".to_string() } else { format!("role_extra_{i}") })
            .collect();
        let role_refs: Vec<&str> = roles.iter().map(String::as_str).collect();
        store.add_user("bench@x.com", "Bench", &role_refs).unwrap();

        let codec = Arc::new(TokenCodec::new(SECRET).unwrap());
        let header = format!(
            "Bearer {}",
            codec
                .issue_now(&Subject::try_from("bench@x.com").unwrap())
                .unwrap()
                .as_str()
        );
        let resolver = IdentityResolver::new(codec, store);
        let guard = Guard::new().role(Role::Artist).owner(OwnerKey::ByName("Bench".into()));

        group.bench_with_input(BenchmarkId::from_parameter(role_count), &role_count, |b, _| {
            b.iter(|| {
                let identity =
                    block_on(resolver.resolve_authorization(Some(&header))).unwrap();
                guard.check(&identity).unwrap();
                black_box(identity);
            });
        });
    }
    group.finish();
}

fn bench_normalize(c: &mut Criterion) {
    let raw = ["user", " ROLE_USER ", "Artist", "ROLE_ARTIST", "role_moderator", ""];
    c.bench_function("normalize_roles", |b| {
        b.iter(|| black_box(normalize_roles(black_box(raw))));
    });
}

fn bench_toggle(c: &mut Criterion) {
    let store = MemoryStore::new();
    let user = store.add_user("bench@x.com", "Bench", &["USER"]).unwrap();
    let artist = store.add_artist();
    let manager = ToggleManager::new(store);

    c.bench_function("follow_toggle", |b| {
        b.iter(|| black_box(block_on(manager.follow_artist(user, artist)).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_token,
    bench_resolution,
    bench_normalize,
    bench_toggle
);
criterion_main!(benches);
