//! Integration tests for the full posting pipeline.
//!
//! Tests: Document write → Outbox → Relay → Workflow processor → Ledger/Caches → Reports
//!
//! Verifies:
//! - Ledger and caches agree after every flow
//! - Replayed and redelivered messages never double-post
//! - Edits are checked against stock as of the document date
//! - Transfers conserve quantity and cost; reversals do not leak into reports

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::sync::Arc;
    use std::time::Duration;

    use stockbook_accounting::{CounterAccounts, net_by_account};
    use stockbook_core::{
        AccountId, BusinessId, DetailId, OutboxAction, ProductId, ReferenceId, ReferenceType,
        WarehouseId,
    };
    use stockbook_inventory::{
        Document, DocumentLine, DocumentSnapshot, DocumentStatus, ProductKey, StockHistory,
    };
    use stockbook_outbox::{DeliveryFailure, MessageStatus, NewOutboxMessage, OutboxMessage};

    use crate::catalog::{Catalog, InMemoryCatalog, ProductInfo};
    use crate::outbox::{OutboxRelay, OutboxWriteError, OutboxWriter, RelayConfig, RelayStep, RetryPolicy};
    use crate::reports::InventoryReports;
    use crate::store::{InMemoryStockStore, StockStore, StoreError};
    use crate::workflow::{
        InventoryJournalPublisher, ProcessOutcome, StockPostingEngine, WorkflowDispatcher,
        WorkflowError,
    };

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
    }

    fn dec(v: i64) -> Decimal {
        Decimal::from(v)
    }

    struct Harness {
        store: Arc<InMemoryStockStore>,
        dispatcher: Arc<WorkflowDispatcher>,
        writer: OutboxWriter,
        relay: OutboxRelay<Arc<InMemoryStockStore>>,
        reports: InventoryReports<Arc<InMemoryStockStore>>,
        business: BusinessId,
        product: ProductKey,
        inventory_account: AccountId,
        accounts: CounterAccounts,
    }

    fn setup() -> Harness {
        let business = BusinessId::new();
        let product = ProductKey::single(ProductId::new());
        let inventory_account = AccountId::new();
        let accounts = CounterAccounts {
            cost_of_goods_sold: AccountId::new(),
            goods_received_clearing: AccountId::new(),
            inventory_adjustment: AccountId::new(),
            opening_balance_equity: AccountId::new(),
        };

        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.register(business, product, ProductInfo::tracked(inventory_account));
        let catalog: Arc<dyn Catalog> = catalog;

        let engine = Arc::new(StockPostingEngine::new(
            catalog.clone(),
            Arc::new(InventoryJournalPublisher::new(catalog, accounts)),
        ));
        let store = Arc::new(InMemoryStockStore::new());
        let dispatcher = Arc::new(WorkflowDispatcher::standard(engine.clone()));
        let relay = OutboxRelay::new(
            store.clone(),
            dispatcher.clone(),
            RelayConfig::default().with_retry(RetryPolicy::fixed(3, Duration::from_millis(50))),
        );

        Harness {
            reports: InventoryReports::new(store.clone()),
            writer: OutboxWriter::new(engine),
            store,
            dispatcher,
            relay,
            business,
            product,
            inventory_account,
            accounts,
        }
    }

    impl Harness {
        fn document(
            &self,
            reference_type: ReferenceType,
            date: NaiveDate,
            warehouse_id: WarehouseId,
            destination_warehouse_id: Option<WarehouseId>,
            quantity: i64,
            unit_cost: Option<i64>,
        ) -> Document {
            Document {
                business_id: self.business,
                reference_type,
                reference_id: ReferenceId::new(),
                date,
                status: DocumentStatus::Confirmed,
                warehouse_id,
                destination_warehouse_id,
                lines: vec![DocumentLine {
                    detail_id: DetailId::new(),
                    product: self.product,
                    batch_number: String::new(),
                    quantity: dec(quantity),
                    unit_cost: unit_cost.map(dec),
                }],
            }
        }

        fn submit(
            &self,
            previous: Option<&Document>,
            current: Option<&Document>,
        ) -> Result<Option<OutboxMessage>, OutboxWriteError> {
            self.store
                .transact(self.business, |tx| self.writer.record(tx, previous, current))
        }

        /// Queue the change and process everything due.
        fn apply(&self, previous: Option<&Document>, current: Option<&Document>) -> OutboxMessage {
            let message = self.submit(previous, current).unwrap().unwrap();
            self.relay.drain().unwrap();
            message
        }

        fn replay(&self, message: &OutboxMessage) -> ProcessOutcome {
            self.store
                .transact(self.business, |tx| self.dispatcher.dispatch(tx, message))
                .unwrap()
        }

        fn on_hand(&self, warehouse_id: WarehouseId, as_of: NaiveDate) -> Decimal {
            self.reports
                .inventory_summary(self.business, as_of, Some(warehouse_id))
                .unwrap()
                .iter()
                .map(|row| row.buckets.current_qty)
                .sum()
        }

        fn rows_for(&self, document: &Document) -> Vec<StockHistory> {
            self.store
                .transact(self.business, |tx| {
                    tx.history_for_reference(document.reference_type, document.reference_id)
                })
                .unwrap()
        }

        fn all_rows(&self) -> usize {
            self.store
                .transact(self.business, |tx| tx.history(&Default::default()))
                .unwrap()
                .len()
        }

        fn inventory_net(&self, document: &Document) -> (usize, Decimal) {
            let entries = self
                .store
                .transact(self.business, |tx| {
                    tx.journal_entries_for_reference(document.reference_type, document.reference_id)
                })
                .unwrap();
            for entry in &entries {
                entry.validate().unwrap();
            }
            let net = net_by_account(&entries)
                .get(&self.inventory_account)
                .copied()
                .unwrap_or_default();
            (entries.len(), net)
        }

        fn assert_cache_matches_ledger(&self) {
            assert!(self.reports.reconcile(self.business).unwrap().is_empty());
            let cached: Vec<_> = self
                .reports
                .current_on_hand(self.business, None)
                .unwrap()
                .into_iter()
                .filter(|row| !row.current_qty.is_zero())
                .collect();
            let ledger: Vec<_> = self
                .reports
                .ledger_on_hand(self.business, None)
                .unwrap()
                .into_iter()
                .filter(|row| !row.current_qty.is_zero())
                .collect();
            assert_eq!(cached, ledger);
        }
    }

    #[test]
    fn opening_stock_and_transfer_report_consistent_positions() {
        let h = setup();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        let opening = h.document(ReferenceType::OpeningStock, day(1), w1, None, 100, Some(50));
        let transfer = h.document(ReferenceType::TransferOrder, day(2), w1, Some(w2), 10, None);

        h.apply(None, Some(&opening));
        let transfer_message = h.apply(None, Some(&transfer));

        assert_eq!(h.on_hand(w1, day(2)), dec(90));
        assert_eq!(h.on_hand(w2, day(2)), dec(10));
        let valuation = h.reports.valuation(h.business, day(2), None).unwrap();
        assert_eq!(valuation[0].totals.stock_on_hand, dec(100));
        assert_eq!(valuation[0].totals.asset_value, dec(5000));

        // Replay of the processed transfer message.
        let rows_before = h.all_rows();
        assert_eq!(h.replay(&transfer_message), ProcessOutcome::AlreadyApplied);
        assert_eq!(h.all_rows(), rows_before);
        assert_eq!(h.on_hand(w1, day(2)), dec(90));
        assert_eq!(h.on_hand(w2, day(2)), dec(10));

        // Both legs carry the opening cost; nothing to journal.
        let legs = h.rows_for(&transfer);
        assert!(legs.iter().all(|r| r.base_unit_value == dec(50)));
        assert_eq!(legs.iter().map(|r| r.quantity).sum::<Decimal>(), Decimal::ZERO);
        assert_eq!(h.inventory_net(&transfer), (0, Decimal::ZERO));
        assert_eq!(h.inventory_net(&opening), (1, dec(5000)));

        let detail = h
            .reports
            .valuation_detail(h.business, day(1), day(2), h.product, Some(w2))
            .unwrap();
        assert_eq!(detail.closing.stock_on_hand, dec(10));
        assert_eq!(detail.closing_layers[0].layer.unit_cost, dec(50));

        h.assert_cache_matches_ledger();
    }

    #[test]
    fn cross_reports_agree_on_quantity() {
        let h = setup();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(1), w1, None, 40, Some(3))));
        h.apply(None, Some(&h.document(ReferenceType::TransferOrder, day(2), w1, Some(w2), 15, None)));
        h.apply(None, Some(&h.document(ReferenceType::Invoice, day(3), w2, None, 5, None)));
        h.apply(None, Some(&h.document(ReferenceType::InventoryAdjustment, day(4), w1, None, -2, None)));

        for as_of in [day(1), day(2), day(3), day(4), day(20)] {
            let summary: Decimal = h
                .reports
                .inventory_summary(h.business, as_of, None)
                .unwrap()
                .iter()
                .map(|r| r.buckets.current_qty)
                .sum();
            let per_warehouse: Decimal = h
                .reports
                .warehouse_inventory(h.business, as_of)
                .unwrap()
                .iter()
                .filter(|r| r.product == h.product)
                .map(|r| r.buckets.current_qty)
                .sum();
            let valuation: Decimal = h
                .reports
                .valuation(h.business, as_of, None)
                .unwrap()
                .iter()
                .map(|r| r.totals.stock_on_hand)
                .sum();
            assert_eq!(summary, per_warehouse, "as of {as_of}");
            assert_eq!(summary, valuation, "as of {as_of}");

            let cached = h.reports.inventory_summary(h.business, as_of, None).unwrap();
            let rebuilt = h.reports.inventory_summary_from_ledger(h.business, as_of, None).unwrap();
            for (a, b) in cached.iter().zip(&rebuilt) {
                assert!(a.buckets.same_movements(&b.buckets), "as of {as_of}");
            }
        }
        assert_eq!(h.on_hand(w1, day(20)), dec(23));
        assert_eq!(h.on_hand(w2, day(20)), dec(10));
        h.assert_cache_matches_ledger();
    }

    #[test]
    fn redelivered_messages_never_double_post() {
        let h = setup();
        let w = WarehouseId::new();
        let bill = h.document(ReferenceType::Bill, day(1), w, None, 12, Some(4));
        let message = h.apply(None, Some(&bill));
        let rows = h.all_rows();
        let summary = h.reports.current_on_hand(h.business, None).unwrap();

        for _ in 0..3 {
            assert_eq!(h.replay(&message), ProcessOutcome::AlreadyApplied);
        }

        // Same snapshot under a new message id converges to no change.
        let duplicate = NewOutboxMessage::new(
            h.business,
            bill.reference_type,
            bill.reference_id,
            OutboxAction::Create,
            DocumentSnapshot {
                current: Some(bill.clone()),
                previous: None,
            },
        )
        .into_json()
        .unwrap();
        let duplicate = h
            .store
            .transact(h.business, |tx| tx.insert_outbox(duplicate))
            .unwrap();
        assert_eq!(
            h.relay.run_once().unwrap(),
            RelayStep::Delivered(ProcessOutcome::Applied {
                reversed: 0,
                posted: 0,
                journal_posted: false,
            })
        );
        assert_eq!(h.replay(&duplicate), ProcessOutcome::AlreadyApplied);

        assert_eq!(h.all_rows(), rows);
        assert_eq!(h.reports.current_on_hand(h.business, None).unwrap(), summary);
        assert_eq!(h.inventory_net(&bill), (1, dec(48)));
    }

    #[test]
    fn editing_a_back_dated_issue_checks_stock_as_of_its_date() {
        let h = setup();
        let w = WarehouseId::new();
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(1), w, None, 10, Some(5))));
        let invoice = h.document(ReferenceType::Invoice, day(5), w, None, 8, None);
        h.apply(None, Some(&invoice));
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(10), w, None, 50, Some(6))));

        // Only 2 left on day 5; the later receipt does not count.
        let mut greedy = invoice.clone();
        greedy.lines[0].quantity = dec(12);
        let err = h.submit(Some(&invoice), Some(&greedy)).unwrap_err();
        match err {
            OutboxWriteError::Rejected(WorkflowError::InsufficientStock(shortfall)) => {
                assert_eq!(shortfall.date, day(5));
                assert_eq!(shortfall.available, dec(2));
            }
            other => panic!("expected shortfall, got {other:?}"),
        }
        assert!(h.store.undelivered_messages(h.business).unwrap().is_empty());

        let mut all_of_it = invoice.clone();
        all_of_it.lines[0].quantity = dec(10);
        h.apply(Some(&invoice), Some(&all_of_it));
        assert_eq!(h.on_hand(w, day(5)), Decimal::ZERO);
        assert_eq!(h.on_hand(w, day(10)), dec(50));

        // Shrinking hands back the most recently consumed layers.
        let mut smaller = all_of_it.clone();
        smaller.lines[0].quantity = dec(4);
        h.apply(Some(&all_of_it), Some(&smaller));
        let valuation = h.reports.valuation(h.business, day(9), None).unwrap();
        assert_eq!(valuation[0].totals.stock_on_hand, dec(6));
        assert_eq!(valuation[0].totals.asset_value, dec(30));
        h.assert_cache_matches_ledger();
    }

    #[test]
    fn receipts_consumed_later_cannot_shrink_or_vanish() {
        let h = setup();
        let w = WarehouseId::new();
        let bill = h.document(ReferenceType::Bill, day(1), w, None, 10, Some(5));
        h.apply(None, Some(&bill));
        h.apply(None, Some(&h.document(ReferenceType::Invoice, day(5), w, None, 8, None)));

        let mut smaller = bill.clone();
        smaller.lines[0].quantity = dec(5);
        assert!(matches!(
            h.submit(Some(&bill), Some(&smaller)).unwrap_err(),
            OutboxWriteError::Rejected(WorkflowError::InsufficientStock(_))
        ));
        assert!(matches!(
            h.submit(Some(&bill), None).unwrap_err(),
            OutboxWriteError::Rejected(WorkflowError::InsufficientStock(_))
        ));
        assert_eq!(h.on_hand(w, day(5)), dec(2));
    }

    #[test]
    fn deleted_transfer_leaves_no_trace_in_reports() {
        let h = setup();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        h.apply(None, Some(&h.document(ReferenceType::OpeningStock, day(1), w1, None, 100, Some(50))));
        let transfer = h.document(ReferenceType::TransferOrder, day(2), w1, Some(w2), 10, None);
        h.apply(None, Some(&transfer));
        let delete = h.apply(Some(&transfer), None);
        assert_eq!(delete.action(), OutboxAction::Delete);

        let rows = h.rows_for(&transfer);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| !r.is_valid()));
        assert_eq!(rows.iter().filter(|r| r.is_reversal).count(), 2);

        assert_eq!(h.on_hand(w1, day(3)), dec(100));
        assert_eq!(h.on_hand(w2, day(3)), Decimal::ZERO);
        assert!(h.reports.ledger_on_hand(h.business, Some(w2)).unwrap().is_empty());
        assert!(h.reports.valuation(h.business, day(3), Some(w2)).unwrap().is_empty());
        let valuation = h.reports.valuation(h.business, day(3), None).unwrap();
        assert_eq!(valuation[0].totals.stock_on_hand, dec(100));
        assert_eq!(valuation[0].totals.asset_value, dec(5000));
        h.assert_cache_matches_ledger();
    }

    #[test]
    fn drafts_never_reach_the_ledger_and_void_reverses() {
        let h = setup();
        let w = WarehouseId::new();
        let mut draft = h.document(ReferenceType::Bill, day(1), w, None, 7, Some(3));
        draft.status = DocumentStatus::Draft;

        assert!(h.submit(None, Some(&draft)).unwrap().is_none());
        assert!(h.store.undelivered_messages(h.business).unwrap().is_empty());
        assert!(h.reports.current_on_hand(h.business, None).unwrap().is_empty());

        let mut confirmed = draft.clone();
        confirmed.status = DocumentStatus::Confirmed;
        h.apply(Some(&draft), Some(&confirmed));
        assert_eq!(h.on_hand(w, day(1)), dec(7));

        let mut void = confirmed.clone();
        void.status = DocumentStatus::Void;
        h.apply(Some(&confirmed), Some(&void));
        assert_eq!(h.on_hand(w, day(1)), Decimal::ZERO);
        assert_eq!(h.inventory_net(&confirmed), (2, Decimal::ZERO));
    }

    #[test]
    fn tracking_started_fires_once_per_key() {
        let h = setup();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(1), w1, None, 5, Some(2))));
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(2), w1, None, 5, Some(2))));
        h.apply(None, Some(&h.document(ReferenceType::TransferOrder, day(3), w1, Some(w2), 4, None)));

        let events = h.store.integration_events(h.business).unwrap();
        assert_eq!(events.len(), 2);
        let warehouses: Vec<WarehouseId> = events.iter().map(|e| e.key.warehouse_id).collect();
        assert!(warehouses.contains(&w1) && warehouses.contains(&w2));
    }

    #[test]
    fn queued_edit_touches_no_cache_until_processed() {
        let h = setup();
        let (w1, w2) = (WarehouseId::new(), WarehouseId::new());
        let bill = h.document(ReferenceType::Bill, day(1), w1, None, 6, Some(3));
        h.apply(None, Some(&bill));
        assert_eq!(h.store.integration_events(h.business).unwrap().len(), 1);

        let mut moved = bill.clone();
        moved.warehouse_id = w2;
        let queued = h.submit(Some(&bill), Some(&moved)).unwrap().unwrap();
        assert_eq!(queued.action(), OutboxAction::Update);

        let summaries_in_w2 = h
            .store
            .transact(h.business, |tx| tx.summaries(Some(w2)))
            .unwrap();
        assert!(summaries_in_w2.is_empty());
        assert_eq!(h.store.integration_events(h.business).unwrap().len(), 1);
        assert_eq!(h.on_hand(w1, day(30)), dec(6));

        h.relay.drain().unwrap();
        let events = h.store.integration_events(h.business).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].key.warehouse_id, w2);
        assert_eq!(h.on_hand(w2, day(30)), dec(6));
        h.assert_cache_matches_ledger();
    }

    #[test]
    fn journal_follows_fifo_cost_and_replays_post_nothing() {
        let h = setup();
        let w = WarehouseId::new();
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(1), w, None, 10, Some(5))));
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(2), w, None, 10, Some(7))));
        let invoice = h.document(ReferenceType::Invoice, day(3), w, None, 15, None);
        h.apply(None, Some(&invoice));
        assert_eq!(h.inventory_net(&invoice), (1, dec(-85)));

        let mut fewer = invoice.clone();
        fewer.lines[0].quantity = dec(12);
        let update = h.apply(Some(&invoice), Some(&fewer));
        assert_eq!(h.inventory_net(&invoice), (2, dec(-64)));

        assert_eq!(h.replay(&update), ProcessOutcome::AlreadyApplied);
        assert_eq!(h.inventory_net(&invoice), (2, dec(-64)));

        let entries = h
            .store
            .transact(h.business, |tx| {
                tx.journal_entries_for_reference(ReferenceType::Invoice, invoice.reference_id)
            })
            .unwrap();
        let cogs = net_by_account(&entries)
            .get(&h.accounts.cost_of_goods_sold)
            .copied()
            .unwrap_or_default();
        assert_eq!(cogs, dec(64));
    }

    #[test]
    fn early_issue_waits_for_its_receipt() {
        let h = setup();
        let w = WarehouseId::new();
        let invoice = h.document(ReferenceType::Invoice, day(5), w, None, 3, None);
        h.submit(None, Some(&invoice)).unwrap();

        assert!(matches!(
            h.relay.run_once().unwrap(),
            RelayStep::Failed(DeliveryFailure::Retry { .. })
        ));
        assert!(h.rows_for(&invoice).is_empty());

        h.submit(None, Some(&h.document(ReferenceType::Bill, day(1), w, None, 10, Some(2))))
            .unwrap();
        h.relay.drain().unwrap();
        std::thread::sleep(Duration::from_millis(80));
        h.relay.drain().unwrap();

        assert_eq!(h.rows_for(&invoice).len(), 1);
        assert_eq!(h.on_hand(w, day(5)), dec(7));
        assert!(h.store.undelivered_messages(h.business).unwrap().is_empty());
    }

    #[test]
    fn malformed_payload_is_dead_lettered_and_stays_visible() {
        let h = setup();
        let new = NewOutboxMessage::new(
            h.business,
            ReferenceType::Invoice,
            ReferenceId::new(),
            OutboxAction::Create,
            serde_json::json!({ "lines": "not a document" }),
        );
        h.store
            .transact(h.business, |tx| tx.insert_outbox(new))
            .unwrap();

        assert!(matches!(
            h.relay.run_once().unwrap(),
            RelayStep::Failed(DeliveryFailure::DeadLetter { .. })
        ));
        let stuck = h.store.undelivered_messages(h.business).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].delivery.status, MessageStatus::DeadLettered);
        assert!(stuck[0].delivery.last_error.as_deref().unwrap().contains("malformed"));
        assert_eq!(h.relay.run_once().unwrap(), RelayStep::Idle);
    }

    #[test]
    fn concurrent_writers_and_relays_keep_cache_in_line_with_ledger() {
        let h = setup();
        let w = WarehouseId::new();
        h.apply(None, Some(&h.document(ReferenceType::OpeningStock, day(1), w, None, 100, Some(10))));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let relay = OutboxRelay::new(
                        h.store.clone(),
                        h.dispatcher.clone(),
                        RelayConfig::default(),
                    );
                    for _ in 0..5 {
                        let invoice = h.document(ReferenceType::Invoice, day(3), w, None, 1, None);
                        h.submit(None, Some(&invoice)).unwrap();
                        relay.drain().unwrap();
                    }
                });
            }
        });
        h.relay.drain().unwrap();

        assert!(h.store.undelivered_messages(h.business).unwrap().is_empty());
        assert_eq!(h.on_hand(w, day(3)), dec(80));
        let valuation = h.reports.valuation(h.business, day(3), None).unwrap();
        assert_eq!(valuation[0].totals.asset_value, dec(800));
        h.assert_cache_matches_ledger();
    }

    #[test]
    fn tenants_do_not_see_each_others_stock() {
        let h = setup();
        let w = WarehouseId::new();
        h.apply(None, Some(&h.document(ReferenceType::Bill, day(1), w, None, 9, Some(1))));

        let other = BusinessId::new();
        assert!(h.reports.current_on_hand(other, None).unwrap().is_empty());

        let foreign = h.document(ReferenceType::Bill, day(1), w, None, 1, Some(1));
        let err = h
            .store
            .transact(other, |tx| h.writer.record(tx, None, Some(&foreign)))
            .unwrap_err();
        assert!(matches!(err, OutboxWriteError::Rejected(WorkflowError::Document(_))));

        let err = h
            .store
            .transact(other, |tx| {
                tx.insert_outbox(NewOutboxMessage::new(
                    h.business,
                    ReferenceType::Bill,
                    ReferenceId::new(),
                    OutboxAction::Create,
                    serde_json::json!({}),
                ))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::TenantIsolation(_)));
    }
}
