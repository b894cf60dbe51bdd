//! Performance benchmarks for mdib-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mdib_engine::{
    build_reports, ConsumerConfig, ConsumerMdib, MdibSnapshot, MetricSample, MetricValue,
    NodeType, ProviderConfig, ProviderMdib, Report, Traversal,
};

/// mds0 / vmd0 / ch{c} / m{c}_{m}
fn create_device(channels: usize, metrics_per_channel: usize) -> ProviderMdib {
    let mdib = ProviderMdib::new(&ProviderConfig {
        sequence_id: Some("urn:uuid:bench".to_string()),
        instance_id: None,
    });
    let mut tx = mdib.descriptor_transaction();
    tx.write_entity(&mdib.new_entity("mds0", None, NodeType::Mds).unwrap())
        .unwrap();
    tx.write_entity(&mdib.new_entity("vmd0", Some("mds0"), NodeType::Vmd).unwrap())
        .unwrap();
    for c in 0..channels {
        let channel = format!("ch{}", c);
        tx.write_entity(
            &mdib
                .new_entity(&channel, Some("vmd0"), NodeType::Channel)
                .unwrap(),
        )
        .unwrap();
        for m in 0..metrics_per_channel {
            let handle = format!("m{}_{}", c, m);
            tx.write_entity(
                &mdib
                    .new_entity(&handle, Some(&channel), NodeType::NumericMetric)
                    .unwrap(),
            )
            .unwrap();
        }
    }
    tx.commit().unwrap();
    mdib
}

fn metric_handles(mdib: &ProviderMdib) -> Vec<String> {
    mdib.by_node_type(NodeType::NumericMetric)
        .iter()
        .map(|e| e.handle().to_string())
        .collect()
}

fn metric_reports(mdib: &ProviderMdib, count: usize) -> Vec<Report> {
    let handles = metric_handles(mdib);
    let mut reports = Vec::with_capacity(count);
    for i in 0..count {
        let mut entity = mdib.by_handle(&handles[i % handles.len()]).unwrap();
        entity.metric_mut().unwrap().value =
            Some(MetricValue::valid(MetricSample::Numeric(i as f64)));
        let mut tx = mdib.metric_state_transaction();
        tx.write_entity(&entity).unwrap();
        let result = tx.commit().unwrap().unwrap();
        reports.extend(build_reports(&result, &mdib.mdib_version_group()));
    }
    reports
}

fn bench_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("transactions");

    group.bench_function("metric_commit", |b| {
        let mdib = create_device(10, 10);
        let mut entity = mdib.by_handle("m5_5").unwrap();
        let mut value = 0.0;

        b.iter(|| {
            value += 1.0;
            entity.metric_mut().unwrap().value =
                Some(MetricValue::valid(MetricSample::Numeric(value)));
            let mut tx = mdib.metric_state_transaction();
            tx.write_entity(black_box(&entity)).unwrap();
            tx.commit()
        })
    });

    for size in [10, 50, 100].iter() {
        group.bench_with_input(BenchmarkId::new("metric_batch", size), size, |b, &size| {
            let mdib = create_device(10, 10);
            let handles = metric_handles(&mdib);
            let mut value = 0.0;

            b.iter(|| {
                value += 1.0;
                let mut tx = mdib.metric_state_transaction();
                for handle in handles.iter().take(size) {
                    let mut entity = mdib.by_handle(handle).unwrap();
                    entity.metric_mut().unwrap().value =
                        Some(MetricValue::valid(MetricSample::Numeric(value)));
                    tx.write_entity(&entity).unwrap();
                }
                tx.commit()
            })
        });
    }

    group.bench_function("insert_and_delete_channel", |b| {
        let mdib = create_device(10, 10);

        b.iter(|| {
            let mut tx = mdib.descriptor_transaction();
            tx.write_entity(&mdib.new_entity("extra", Some("vmd0"), NodeType::Channel).unwrap())
                .unwrap();
            tx.commit().unwrap();

            let mut tx = mdib.descriptor_transaction();
            tx.remove_entity(black_box("extra")).unwrap();
            tx.commit()
        })
    });

    group.finish();
}

fn bench_lookups(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookups");
    let mdib = create_device(20, 25);

    group.bench_function("by_handle", |b| {
        b.iter(|| mdib.by_handle(black_box("m10_12")))
    });

    group.bench_function("by_parent_handle", |b| {
        b.iter(|| mdib.by_parent_handle(black_box(Some("ch7"))))
    });

    group.bench_function("subtree_depth_first", |b| {
        b.iter(|| mdib.subtree(black_box("vmd0"), Traversal::DepthFirst, true))
    });

    group.finish();
}

fn bench_replication(c: &mut Criterion) {
    let mut group = c.benchmark_group("replication");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("apply_reports", size), size, |b, &size| {
            let mdib = create_device(10, 10);
            let snapshot = mdib.snapshot();
            let reports = metric_reports(&mdib, size);

            b.iter(|| {
                let source = ProviderMdib::from_snapshot(snapshot.clone()).unwrap();
                let consumer = ConsumerMdib::new(source, ConsumerConfig::default());
                consumer.reload_all().unwrap();
                for report in reports.iter() {
                    consumer.process_incoming(black_box(report.clone()));
                }
                consumer
            })
        });
    }

    group.bench_function("reload_all", |b| {
        let mdib = create_device(20, 25);
        let consumer = ConsumerMdib::new(mdib.clone(), ConsumerConfig::default());
        b.iter(|| consumer.reload_all())
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100, 500, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("export", size), size, |b, &size| {
            let mdib = create_device(10, size / 10);
            b.iter(|| mdib.snapshot())
        });

        group.bench_with_input(BenchmarkId::new("to_json", size), size, |b, &size| {
            let snapshot = create_device(10, size / 10).snapshot();
            b.iter(|| black_box(&snapshot).to_json())
        });

        group.bench_with_input(BenchmarkId::new("from_json", size), size, |b, &size| {
            let json = create_device(10, size / 10).snapshot().to_json().unwrap();
            b.iter(|| MdibSnapshot::from_json(black_box(&json)))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_transactions,
    bench_lookups,
    bench_replication,
    bench_snapshot,
);
criterion_main!(benches);
