use chrono::{Duration, Utc};
use common::{BloodBankId, DonorId};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use domain::request::{OpenCommitment, SubmitRequest};
use domain::{
    BloodGroup, CommitmentKind, Component, GeoPoint, InventoryLedger, RequestId, RequestLedger,
    RequestSpec, Urgency,
};
use event_store::InMemoryEventStore;

fn stocked_ledger(banks: usize, units_per_bank: u32) -> (InventoryLedger, Vec<BloodBankId>) {
    let ledger = InventoryLedger::new();
    let now = Utc::now();
    let bank_ids: Vec<_> = (0..banks)
        .map(|i| BloodBankId::new(format!("BB-{i:03}")))
        .collect();
    for (i, bank_id) in bank_ids.iter().enumerate() {
        ledger
            .stock(
                bank_id,
                BloodGroup::OPositive,
                Component::RedCells,
                units_per_bank,
                now + Duration::days(5 + i as i64),
                now,
            )
            .unwrap();
    }
    (ledger, bank_ids)
}

fn bench_reserve_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("inventory/reserve_release");
    for stock in [100u32, 1_000] {
        let (ledger, banks) = stocked_ledger(1, stock);
        let bank_id = banks[0].clone();
        group.bench_with_input(BenchmarkId::from_parameter(stock), &stock, |b, _| {
            b.iter(|| {
                let units = ledger
                    .reserve(
                        &bank_id,
                        BloodGroup::OPositive,
                        Component::RedCells,
                        4,
                        RequestId::new(),
                        Utc::now(),
                    )
                    .unwrap();
                ledger.release(&units).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_expire_sweep(c: &mut Criterion) {
    let (ledger, _) = stocked_ledger(20, 500);

    // Nothing is due, so every iteration scans the full ledger.
    c.bench_function("inventory/expire_sweep_10k", |b| {
        b.iter(|| ledger.expire_sweep(Utc::now()));
    });
}

fn bench_request_replay(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = RequestLedger::new(InMemoryEventStore::new());
    let now = Utc::now();

    let request_id = rt.block_on(async {
        let cmd = SubmitRequest::new(
            RequestSpec {
                hospital_id: "H-BENCH".into(),
                blood_group: BloodGroup::APositive,
                component: Component::WholeBlood,
                units: 50,
                urgency: Urgency::Medium,
                deadline: now + Duration::days(1),
                location: GeoPoint::new(0.0, 0.0),
            },
            now,
        );
        let request_id = cmd.request_id;
        ledger.submit(cmd).await.unwrap();
        for i in 0..50 {
            let kind = CommitmentKind::DonorPledge {
                donors: vec![DonorId::new(format!("D-{i}"))],
                respond_by: now + Duration::hours(1),
            };
            ledger
                .open_commitment(OpenCommitment::new(request_id, kind, 1, now))
                .await
                .unwrap();
        }
        request_id
    });

    c.bench_function("request/replay_51_events", |b| {
        b.iter(|| rt.block_on(async { ledger.get(request_id).await.unwrap() }));
    });
}

criterion_group!(
    benches,
    bench_reserve_release,
    bench_expire_sweep,
    bench_request_replay
);
criterion_main!(benches);
