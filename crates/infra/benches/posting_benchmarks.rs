use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::Arc;

use stockbook_accounting::CounterAccounts;
use stockbook_core::{
    AccountId, BusinessId, DetailId, ProductId, ReferenceId, ReferenceType, WarehouseId,
};
use stockbook_infra::catalog::{Catalog, InMemoryCatalog, ProductInfo};
use stockbook_infra::outbox::{OutboxRelay, OutboxWriter, RelayConfig};
use stockbook_infra::reports::InventoryReports;
use stockbook_infra::store::{InMemoryStockStore, StockStore};
use stockbook_infra::workflow::{
    InventoryJournalPublisher, StockPostingEngine, WorkflowDispatcher,
};
use stockbook_inventory::{Document, DocumentLine, DocumentStatus, ProductKey};

struct Pipeline {
    store: Arc<InMemoryStockStore>,
    writer: OutboxWriter,
    relay: OutboxRelay<Arc<InMemoryStockStore>>,
    business: BusinessId,
    warehouse: WarehouseId,
    product: ProductKey,
}

impl Pipeline {
    fn new() -> Self {
        let business = BusinessId::new();
        let product = ProductKey::single(ProductId::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.register(business, product, ProductInfo::tracked(AccountId::new()));
        let catalog: Arc<dyn Catalog> = catalog;
        let accounts = CounterAccounts {
            cost_of_goods_sold: AccountId::new(),
            goods_received_clearing: AccountId::new(),
            inventory_adjustment: AccountId::new(),
            opening_balance_equity: AccountId::new(),
        };
        let engine = Arc::new(StockPostingEngine::new(
            catalog.clone(),
            Arc::new(InventoryJournalPublisher::new(catalog, accounts)),
        ));
        let store = Arc::new(InMemoryStockStore::new());
        let dispatcher = Arc::new(WorkflowDispatcher::standard(engine.clone()));
        Self {
            relay: OutboxRelay::new(store.clone(), dispatcher, RelayConfig::default()),
            writer: OutboxWriter::new(engine),
            store,
            business,
            warehouse: WarehouseId::new(),
            product,
        }
    }

    fn document(&self, reference_type: ReferenceType, day: u32, quantity: i64, unit_cost: Option<i64>) -> Document {
        Document {
            business_id: self.business,
            reference_type,
            reference_id: ReferenceId::new(),
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(u64::from(day)),
            status: DocumentStatus::Confirmed,
            warehouse_id: self.warehouse,
            destination_warehouse_id: None,
            lines: vec![DocumentLine {
                detail_id: DetailId::new(),
                product: self.product,
                batch_number: String::new(),
                quantity: Decimal::from(quantity),
                unit_cost: unit_cost.map(Decimal::from),
            }],
        }
    }

    fn post(&self, document: &Document) {
        self.store
            .transact(self.business, |tx| self.writer.record(tx, None, Some(document)))
            .unwrap();
        self.relay.drain().unwrap();
    }

    /// One receipt per day, each at a different cost.
    fn with_receipts(count: u32, quantity: i64) -> Self {
        let pipeline = Self::new();
        for day in 0..count {
            let bill = pipeline.document(ReferenceType::Bill, day, quantity, Some(i64::from(day % 7) + 1));
            pipeline.post(&bill);
        }
        pipeline
    }
}

fn bench_posting_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("posting_latency");
    group.sample_size(200);

    group.bench_function("receipt_write_and_process", |b| {
        let pipeline = Pipeline::new();
        let mut day = 0;
        b.iter(|| {
            day += 1;
            let bill = pipeline.document(ReferenceType::Bill, day % 300, 5, Some(3));
            pipeline.post(black_box(&bill));
        });
    });

    group.bench_function("issue_write_and_process", |b| {
        let pipeline = Pipeline::with_receipts(100, 1_000_000);
        b.iter(|| {
            let invoice = pipeline.document(ReferenceType::Invoice, 200, 1, None);
            pipeline.post(black_box(&invoice));
        });
    });

    group.finish();
}

fn bench_fifo_issue_vs_ledger_size(c: &mut Criterion) {
    let mut group = c.benchmark_group("fifo_issue_vs_ledger_size");
    group.throughput(Throughput::Elements(1));

    for receipts in [10u32, 100, 500].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(receipts), receipts, |b, &receipts| {
            b.iter_batched(
                || Pipeline::with_receipts(receipts, 10),
                |pipeline| {
                    // Consumes about half of all layers.
                    let quantity = i64::from(receipts) * 5;
                    let invoice = pipeline.document(ReferenceType::Invoice, receipts + 1, quantity, None);
                    pipeline.post(&invoice);
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_reports(c: &mut Criterion) {
    let mut group = c.benchmark_group("as_of_reports");
    let pipeline = Pipeline::with_receipts(500, 10);
    let reports = InventoryReports::new(pipeline.store.clone());
    let as_of = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();

    group.bench_function("inventory_summary_daily_balances", |b| {
        b.iter(|| reports.inventory_summary(pipeline.business, black_box(as_of), None).unwrap());
    });
    group.bench_function("inventory_summary_from_ledger", |b| {
        b.iter(|| {
            reports
                .inventory_summary_from_ledger(pipeline.business, black_box(as_of), None)
                .unwrap()
        });
    });
    group.bench_function("valuation", |b| {
        b.iter(|| reports.valuation(pipeline.business, black_box(as_of), None).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_posting_latency,
    bench_fifo_issue_vs_ledger_size,
    bench_reports
);
criterion_main!(benches);
