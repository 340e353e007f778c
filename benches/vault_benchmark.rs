use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use datavault::keys::SigningKey;
use datavault::package::{DataPackager, PackageOptions};
use datavault::store::DocumentStore;
use datavault::VaultConfig;
use serde_json::{json, Value};

const SIZES: [(&str, usize); 3] = [("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024)];

fn benchmark_store(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut store = DocumentStore::new(&VaultConfig::for_testing(dir.path()));
    store.initialize("bench passphrase").unwrap();

    let mut group = c.benchmark_group("document_store");
    for (name, size) in SIZES {
        let payload = vec![0u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("store", name), &payload, |b, payload| {
            b.iter(|| {
                store
                    .store_document("bench", black_box(name), black_box(payload))
                    .unwrap()
            });
        });

        group.bench_with_input(BenchmarkId::new("retrieve", name), &name, |b, name| {
            b.iter(|| store.retrieve_document("bench", black_box(name)).unwrap());
        });
    }
    group.finish();
}

fn benchmark_package(c: &mut Criterion) {
    let packager = DataPackager::new(SigningKey::generate().unwrap());
    let fields = vec!["notes".to_string()];

    let mut group = c.benchmark_group("package");
    for (name, size) in SIZES {
        let data: Value = json!({ "notes": "x".repeat(size), "ssn": "000-00-0000" });
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("create", name), &data, |b, data| {
            b.iter(|| {
                packager
                    .create_package(
                        "req-bench",
                        "recipient",
                        "medical",
                        &fields,
                        black_box(data),
                        PackageOptions::default(),
                    )
                    .unwrap()
            });
        });

        let (pkg, key) = packager
            .create_package("req-bench", "recipient", "medical", &fields, &data, PackageOptions::default())
            .unwrap();
        group.bench_function(BenchmarkId::new("verify_and_decrypt", name), |b| {
            b.iter(|| packager.decrypt_package(black_box(&pkg), &key).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_store, benchmark_package);
criterion_main!(benches);
