//! Benchmarks for policy compilation and evaluation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ditto_model::{
    AuthorizationSubject, JsonPointer, Permission, Policy, PolicyEntry, ResourceKey, ResourceType,
};
use ditto_policies::PolicyEnforcer;
use serde_json::{json, Map, Value};

/// Policy with `entries` entries, each owning one feature
fn policy_with(entries: usize) -> Policy {
    (0..entries).fold(
        Policy::new("org.example:bench".parse().unwrap()).with_entry(
            "admin",
            PolicyEntry::new()
                .with_subject("user:admin")
                .grant(ResourceKey::thing("/"), &[Permission::Read, Permission::Write])
                .revoke(ResourceKey::thing("/attributes/secret"), &[Permission::Read]),
        ),
        |policy, i| {
            policy.with_entry(
                format!("feature-{i}"),
                PolicyEntry::new()
                    .with_subject(format!("device:{i}"))
                    .grant(
                        ResourceKey::thing(format!("/features/f{i}")),
                        &[Permission::Read, Permission::Write],
                    ),
            )
        },
    )
}

fn thing_with(features: usize) -> Value {
    let mut map = Map::new();
    for i in 0..features {
        map.insert(format!("f{i}"), json!({"properties": {"value": i, "unit": "C"}}));
    }
    json!({
        "thingId": "org.example:bench",
        "policyId": "org.example:bench",
        "attributes": {"secret": "s3cr3t", "location": "lab"},
        "features": map
    })
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_policy");
    for size in [10, 100, 1000] {
        let policy = policy_with(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &policy, |b, policy| {
            b.iter(|| PolicyEnforcer::new(black_box(policy.clone())))
        });
    }
    group.finish();
}

fn bench_checks(c: &mut Criterion) {
    let enforcer = PolicyEnforcer::new(policy_with(100));
    let admin = vec![AuthorizationSubject::new("user:admin")];
    let device = vec![AuthorizationSubject::new("device:42")];
    let root = ResourceKey::thing("/");
    let feature = ResourceKey::thing("/features/f42/properties/value");

    c.bench_function("unrestricted_root", |b| {
        b.iter(|| {
            enforcer.has_unrestricted_permissions(black_box(&root), &admin, &[Permission::Read])
        })
    });
    c.bench_function("unrestricted_feature", |b| {
        let write = [Permission::Write];
        b.iter(|| enforcer.has_unrestricted_permissions(black_box(&feature), &device, &write))
    });
    c.bench_function("partial_root", |b| {
        b.iter(|| enforcer.has_partial_permissions(black_box(&root), &device, &[Permission::Read]))
    });
}

fn bench_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_json_view");
    let whitelist = [JsonPointer::parse("/thingId")];
    for size in [10, 100] {
        let enforcer = PolicyEnforcer::new(policy_with(size));
        let thing = thing_with(size);
        let admin = vec![AuthorizationSubject::new("user:admin")];
        group.bench_with_input(BenchmarkId::new("admin", size), &thing, |b, thing| {
            b.iter(|| {
                enforcer.build_json_view(
                    ResourceType::Thing,
                    black_box(thing),
                    &admin,
                    Permission::Read,
                    &whitelist,
                )
            })
        });
        let device = vec![AuthorizationSubject::new("device:1")];
        group.bench_with_input(BenchmarkId::new("device", size), &thing, |b, thing| {
            b.iter(|| {
                enforcer.build_json_view(
                    ResourceType::Thing,
                    black_box(thing),
                    &device,
                    Permission::Read,
                    &whitelist,
                )
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_compile, bench_checks, bench_view);
criterion_main!(benches);
