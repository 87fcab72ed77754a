//! Integration tests for the full continuation pipeline.
//!
//! Tests: Submitter → Channel → Worker → ContinuationHandler → ActivityStore
//!        → CompletionTracker → DeadLetterInspector
//!
//! Verifies:
//! - A job converges to exactly one terminal status and one notification
//! - Duplicate and concurrent deliveries merge each slice once
//! - Delivery order does not change the final state
//! - Failed and abandoned units surface through the dead-letter ledger
//! - Redrive, resume and cancel leave the job consistent
//! - Store and channel outages never strand a unit or duplicate a ledger row

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;

    use cubeflow_channels::{
        DispatchQueue, FanoutStream, InMemoryDispatchQueue, InMemoryFanoutStream, ManualClock,
        QueueDispatcher, RedrivePolicy, StreamConfig, StreamDispatcher,
    };
    use cubeflow_core::{ControlKey, JobId, JobStatus, PeriodId, TileId, UnitStatus};

    use crate::activity_store::{ActivityStore, InMemoryActivityStore, TransitionUpdate};
    use crate::collaborators::{InMemoryCatalog, JobSpec, StaticRasterCompute};
    use crate::engine::{
        CompletionOutcome, ContinuationHandler, DeadLetterInspector, InspectorError, JobSubmitter,
        RecordingNotifier, SkipReason, UnitOutcome, UnitResolution, job_status,
    };
    use crate::faults::{FlakyQueue, FlakyStore};
    use crate::workers::{DeadLetterWorker, QueueWorker, StreamWorker, WorkerConfig};

    type Store = Arc<InMemoryActivityStore>;
    type Compute = Arc<StaticRasterCompute>;
    type Notifier = Arc<RecordingNotifier>;
    type Queue = Arc<InMemoryDispatchQueue>;
    type Handler = ContinuationHandler<Store, Compute, Notifier>;

    const JAN: &str = "2020-01-01_2020-01-31";
    const FEB: &str = "2020-02-01_2020-02-29";

    struct Pipeline {
        store: Store,
        compute: Compute,
        notifier: Notifier,
        queue: Queue,
        handler: Arc<Handler>,
        submitter: JobSubmitter<Store, InMemoryCatalog, QueueDispatcher<Queue>, Notifier>,
        inspector: Arc<DeadLetterInspector<Store, Queue, Notifier>>,
    }

    impl Pipeline {
        fn worker(&self) -> QueueWorker<Store, Compute, Notifier, Queue> {
            QueueWorker::new(self.handler.clone(), self.queue.clone(), 10)
        }

        /// Run the queue worker until the queue has nothing visible.
        fn drain_queue(&self) {
            let worker = self.worker();
            while !worker.run_once().unwrap().is_idle() {}
        }
    }

    fn setup() -> Pipeline {
        setup_with(InMemoryDispatchQueue::arc(RedrivePolicy::default()))
    }

    fn setup_with(queue: Queue) -> Pipeline {
        let store = InMemoryActivityStore::arc();
        let compute = Arc::new(StaticRasterCompute::new(2));
        let notifier = Arc::new(RecordingNotifier::new());

        let handler = Arc::new(ContinuationHandler::new(store.clone(), compute.clone(), notifier.clone()));
        let submitter = JobSubmitter::new(
            store.clone(),
            InMemoryCatalog::new(["S2_MSI"]),
            QueueDispatcher::new(queue.clone()),
            notifier.clone(),
        );
        let inspector = Arc::new(DeadLetterInspector::new(store.clone(), queue.clone(), notifier.clone()));

        Pipeline {
            store,
            compute,
            notifier,
            queue,
            handler,
            submitter,
            inspector,
        }
    }

    fn spec(tiles: &[&str], periods: &[&str]) -> JobSpec {
        JobSpec {
            cube: "S2_10_1M_MED".to_string(),
            tiles: tiles.iter().map(|t| t.to_string()).collect(),
            periods: periods.iter().map(|p| p.to_string()).collect(),
            timeline: None,
            collections: vec!["S2_MSI".to_string()],
        }
    }

    fn tile(raw: &str) -> TileId {
        raw.parse().unwrap()
    }

    fn period(raw: &str) -> PeriodId {
        raw.parse().unwrap()
    }

    fn job_of(store: &Store, job_id: JobId) -> cubeflow_core::Job {
        store.get_job(job_id).unwrap().unwrap()
    }

    #[test]
    fn two_by_two_job_runs_to_done_through_queue_worker() {
        let p = setup();
        let submitted = p.submitter.submit(&spec(&["001", "002"], &[JAN, FEB])).unwrap();
        assert!(submitted.created);
        assert_eq!(p.queue.depth().unwrap().visible, 4);

        p.drain_queue();

        let job = job_of(&p.store, submitted.job_id);
        assert_eq!(job.status, JobStatus::Done);
        assert!(job.finished_at.is_some());

        let report = job_status(&*p.store, submitted.job_id).unwrap().unwrap();
        assert_eq!(report.units_total, 4);
        assert_eq!(report.units_done, 4);
        assert!(report.finalized);
        assert!(report.failures.is_empty());

        let metadata = p.store.cube_metadata(submitted.job_id).unwrap().unwrap();
        assert_eq!(metadata.slices.len(), 4);
        assert!(metadata.slices.iter().all(|s| s.inputs == 2));

        let notifications = p.notifier.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].status, JobStatus::Done);
        assert_eq!(notifications[0].units_done, 4);

        let depth = p.queue.depth().unwrap();
        assert_eq!(depth.visible + depth.in_flight + depth.dead_letters, 0);
    }

    #[test]
    fn resubmitting_an_identical_job_is_idempotent() {
        let p = setup();
        let first = p.submitter.submit(&spec(&["001"], &[JAN, FEB])).unwrap();
        let second = p.submitter.submit(&spec(&["001"], &[JAN, FEB])).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(p.queue.depth().unwrap().visible, 2);

        // A finished job still deduplicates.
        p.drain_queue();
        let third = p.submitter.submit(&spec(&["001"], &[JAN, FEB])).unwrap();
        assert_eq!(third.job_id, first.job_id);
        assert!(!third.created);
    }

    #[test]
    fn failing_unit_degrades_job_and_lands_in_ledger() {
        let p = setup();
        p.compute.fail_on(tile("002"), period(FEB), "no scenes over tile 002");
        let submitted = p.submitter.submit(&spec(&["001", "002"], &[JAN, FEB])).unwrap();

        p.drain_queue();

        let job = job_of(&p.store, submitted.job_id);
        assert_eq!(job.status, JobStatus::Degraded);
        assert_eq!(p.queue.depth().unwrap().dead_letters, 1);

        let worker = DeadLetterWorker::new(p.inspector.clone(), 10);
        let tick = worker.run_once().unwrap();
        assert_eq!(tick.received, 1);
        assert_eq!(p.queue.depth().unwrap().dead_letters, 0);

        let ledger = p.store.list_dead_letters(Some(submitted.job_id), 10).unwrap();
        assert_eq!(ledger.len(), 1);
        assert!(ledger[0].record.failure_reason.contains("no scenes over tile 002"));
        assert!(ledger[0].redriven_at.is_none());

        let failed = p.store.get_unit(ledger[0].unit_id).unwrap().unwrap();
        assert_eq!(failed.status, UnitStatus::Failed);
        assert_eq!(failed.attempt_count, 1);

        let report = job_status(&*p.store, submitted.job_id).unwrap().unwrap();
        assert_eq!(report.units_done, 3);
        assert_eq!(report.units_failed, 1);
        assert_eq!(report.failures[0].tile_id, tile("002"));

        // Metadata is only published for a complete cube.
        assert!(p.store.cube_metadata(submitted.job_id).unwrap().is_none());

        let statuses: Vec<_> = p.notifier.notifications().iter().map(|n| n.status).collect();
        assert_eq!(statuses, vec![JobStatus::Degraded]);
    }

    #[test]
    fn duplicate_delivery_merges_once() {
        let p = setup();
        let submitted = p.submitter.submit(&spec(&["001"], &[JAN])).unwrap();
        let delivery = p.queue.receive(1).unwrap().remove(0);

        let first = p.handler.handle(&delivery.message).unwrap();
        let second = p.handler.handle(&delivery.message).unwrap();

        assert!(matches!(first, UnitOutcome::Completed { .. }));
        assert!(matches!(
            second,
            UnitOutcome::Skipped {
                reason: SkipReason::AlreadyTerminal(UnitStatus::Done),
                ..
            }
        ));
        assert_eq!(p.compute.calls(), 1);

        let key = ControlKey::new("S2_10_1M_MED", tile("001"), period(JAN));
        let entry = p.store.control(&key).unwrap().unwrap();
        assert_eq!(entry.len(), 2);
        assert_eq!(entry.version, 1);

        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Done);
        assert_eq!(p.notifier.notifications().len(), 1);
    }

    #[test]
    fn concurrent_deliveries_complete_exactly_once() {
        let p = setup();
        let submitted = p.submitter.submit(&spec(&["001"], &[JAN])).unwrap();
        let message = p.queue.receive(1).unwrap().remove(0).message;

        let contenders = 6;
        let barrier = Arc::new(Barrier::new(contenders));
        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let handler = p.handler.clone();
                let barrier = barrier.clone();
                let message = message.clone();
                thread::spawn(move || {
                    barrier.wait();
                    handler.handle(&message).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<UnitOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert!(outcomes.iter().all(UnitOutcome::is_settled));
        assert_eq!(p.compute.calls(), 1);
        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Done);
        assert_eq!(p.notifier.notifications().len(), 1);
    }

    #[test]
    fn concurrent_last_units_finalize_job_once() {
        let p = setup();
        let submitted = p.submitter.submit(&spec(&["001", "002", "003", "004"], &[JAN])).unwrap();
        let messages: Vec<_> = p.queue.receive(4).unwrap().into_iter().map(|d| d.message).collect();

        let barrier = Arc::new(Barrier::new(messages.len()));
        let handles: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let handler = p.handler.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    handler.handle(&message).unwrap()
                })
            })
            .collect();
        let finalized = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| {
                matches!(
                    o,
                    UnitOutcome::Completed {
                        job: CompletionOutcome::Finalized { .. },
                        ..
                    }
                )
            })
            .count();

        assert_eq!(finalized, 1);
        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Done);
        assert_eq!(p.notifier.notifications().len(), 1);
    }

    #[test]
    fn stream_channel_runs_job_to_done() {
        let store = InMemoryActivityStore::arc();
        let compute = Arc::new(StaticRasterCompute::new(3));
        let notifier = Arc::new(RecordingNotifier::new());
        let stream = Arc::new(
            InMemoryFanoutStream::new(StreamConfig::default().with_partitions(2).with_max_batch_size(2)).unwrap(),
        );
        let dead_letters = InMemoryDispatchQueue::arc(RedrivePolicy::default());

        let submitter = JobSubmitter::new(
            store.clone(),
            InMemoryCatalog::new(["S2_MSI"]),
            StreamDispatcher::new(stream.clone()),
            notifier.clone(),
        );
        let handler = Arc::new(ContinuationHandler::new(store.clone(), compute.clone(), notifier.clone()));
        let worker = StreamWorker::new(handler, stream.clone(), dead_letters.clone());

        compute.fail_on(tile("003"), period(JAN), "cloud cover 100%");
        let submitted = submitter.submit(&spec(&["001", "002", "003"], &[JAN, FEB])).unwrap();

        while !worker.run_once().unwrap().is_idle() {}

        for partition in 0..stream.partitions() {
            assert_eq!(stream.lag(partition).unwrap(), 0);
        }
        assert_eq!(job_of(&store, submitted.job_id).status, JobStatus::Degraded);
        assert_eq!(dead_letters.depth().unwrap().dead_letters, 1);

        let drained = dead_letters.drain_dead_letters(10).unwrap();
        assert_eq!(drained[0].original_message.tile_id, tile("003"));
        assert!(drained[0].failure_reason.contains("cloud cover"));
    }

    #[test]
    fn expired_lease_fails_running_unit_through_inspector() {
        let clock = Arc::new(ManualClock::default());
        let policy = RedrivePolicy::default().with_visibility_timeout(Duration::from_secs(60));
        let queue = Arc::new(InMemoryDispatchQueue::with_clock(policy, clock.clone()));
        let p = setup_with(queue);

        let submitted = p.submitter.submit(&spec(&["001"], &[JAN])).unwrap();
        let delivery = p.queue.receive(1).unwrap().remove(0);

        // Worker claims the unit, then dies before completing or acking.
        assert!(p
            .store
            .transition(delivery.message.unit_id, UnitStatus::Pending, UnitStatus::Running, TransitionUpdate::attempt(1))
            .unwrap());

        clock.advance(chrono::Duration::seconds(61));
        let inspected = p.inspector.drain(10).unwrap();
        assert_eq!(inspected.len(), 1);
        assert_eq!(inspected[0].unit, UnitResolution::MarkedFailed);
        assert!(inspected[0].entry.record.failure_reason.contains("lease expired"));

        let unit = p.store.get_unit(delivery.message.unit_id).unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Failed);
        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Failed);

        // The late ack from the dead worker is rejected.
        assert!(p.queue.ack(&delivery.receipt).is_err());
    }

    #[test]
    fn redrive_after_fix_brings_job_to_done() {
        let p = setup();
        p.compute.fail_on(tile("001"), period(FEB), "catalog timeout");
        let submitted = p.submitter.submit(&spec(&["001"], &[JAN, FEB])).unwrap();
        p.drain_queue();
        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Degraded);

        let inspected = p.inspector.drain(10).unwrap();
        let entry_id = inspected[0].entry.id;

        p.compute.clear_failures();
        let message = p.inspector.redrive(entry_id).unwrap();
        assert_eq!(message.attempt, 2);
        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Running);

        p.drain_queue();

        let job = job_of(&p.store, submitted.job_id);
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(p.store.cube_metadata(submitted.job_id).unwrap().unwrap().slices.len(), 2);
        let unit = p.store.get_unit(message.unit_id).unwrap().unwrap();
        assert_eq!(unit.attempt_count, 2);
        assert!(p.inspector.redrive(entry_id).is_err());

        let statuses: Vec<_> = p.notifier.notifications().iter().map(|n| n.status).collect();
        assert_eq!(statuses, vec![JobStatus::Degraded, JobStatus::Done]);
    }

    #[test]
    fn auto_redrive_retries_until_limit() {
        let store = InMemoryActivityStore::arc();
        let compute = Arc::new(StaticRasterCompute::new(1));
        let notifier = Arc::new(RecordingNotifier::new());
        let queue = InMemoryDispatchQueue::arc(RedrivePolicy::default());
        let handler = Arc::new(ContinuationHandler::new(store.clone(), compute.clone(), notifier.clone()));
        let submitter = JobSubmitter::new(
            store.clone(),
            InMemoryCatalog::new(["S2_MSI"]),
            QueueDispatcher::new(queue.clone()),
            notifier.clone(),
        );
        let inspector = Arc::new(
            DeadLetterInspector::new(store.clone(), queue.clone(), notifier.clone()).with_auto_redrive_limit(3),
        );
        let queue_worker = QueueWorker::new(handler, queue.clone(), 10);
        let dlq_worker = DeadLetterWorker::new(inspector, 10);

        compute.fail_tile(tile("001"));
        let submitted = submitter.submit(&spec(&["001"], &[JAN])).unwrap();
        for _ in 0..10 {
            queue_worker.run_once().unwrap();
            dlq_worker.run_once().unwrap();
        }

        let unit = &store.list_units(submitted.job_id).unwrap()[0];
        assert_eq!(unit.status, UnitStatus::Failed);
        assert_eq!(unit.attempt_count, 3);
        assert_eq!(compute.calls(), 3);
        assert_eq!(store.list_dead_letters(Some(submitted.job_id), 10).unwrap().len(), 3);
        assert_eq!(job_of(&store, submitted.job_id).status, JobStatus::Failed);
    }

    #[test]
    fn cancel_skips_pending_units_and_ignores_their_deliveries() {
        let p = setup();
        let submitted = p.submitter.submit(&spec(&["001", "002"], &[JAN])).unwrap();
        let deliveries = p.queue.receive(2).unwrap();

        p.handler.handle(&deliveries[0].message).unwrap();
        let cancelled = p.submitter.cancel(submitted.job_id).unwrap();
        assert_eq!(cancelled.skipped, 1);
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let late = p.handler.handle(&deliveries[1].message).unwrap();
        assert!(matches!(
            late,
            UnitOutcome::Skipped {
                reason: SkipReason::AlreadyTerminal(UnitStatus::Skipped),
                ..
            }
        ));
        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Cancelled);
        assert_eq!(p.compute.calls(), 1);
    }

    #[test]
    fn resume_reemits_only_pending_units() {
        let p = setup();
        let submitted = p.submitter.submit(&spec(&["001", "002"], &[JAN])).unwrap();
        let first = p.queue.receive(1).unwrap().remove(0);
        p.handler.handle(&first.message).unwrap();
        p.queue.ack(&first.receipt).unwrap();

        assert_eq!(p.submitter.resume(submitted.job_id).unwrap(), 1);
        p.drain_queue();

        assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Done);
        assert_eq!(p.compute.calls(), 2);
    }

    #[test]
    fn spawned_workers_finish_job_and_shut_down() {
        let p = setup();
        let config = WorkerConfig::default()
            .with_name("queue-worker-test")
            .with_poll_interval(Duration::from_millis(5));
        let handle = p.worker().spawn(config).unwrap();

        let submitted = p.submitter.submit(&spec(&["001", "002"], &[JAN, FEB])).unwrap();
        let mut status = JobStatus::Pending;
        for _ in 0..400 {
            status = job_of(&p.store, submitted.job_id).status;
            if status.is_terminal() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(status, JobStatus::Done);

        let stats = handle.stats();
        assert_eq!(handle.name(), "queue-worker-test");
        assert!(stats.ticks >= 1);
        handle.shutdown();
    }

    // Recovery from store and channel outages.

    type FaultyStore = Arc<FlakyStore>;
    type FaultyQueue = Arc<FlakyQueue>;

    struct Faulty {
        store: FaultyStore,
        inner: Store,
        compute: Compute,
        queue: FaultyQueue,
        handler: Arc<ContinuationHandler<FaultyStore, Compute, Notifier>>,
        submitter: JobSubmitter<FaultyStore, InMemoryCatalog, QueueDispatcher<FaultyQueue>, Notifier>,
        inspector: DeadLetterInspector<FaultyStore, FaultyQueue, Notifier>,
    }

    impl Faulty {
        fn drain_queue(&self) {
            let worker = QueueWorker::new(self.handler.clone(), self.queue.clone(), 10);
            while !worker.run_once().unwrap().is_idle() {}
        }
    }

    fn faulty_setup() -> Faulty {
        let inner = InMemoryActivityStore::arc();
        let store = FlakyStore::arc(inner.clone());
        let queue = FlakyQueue::arc(InMemoryDispatchQueue::arc(RedrivePolicy::default()));
        let compute = Arc::new(StaticRasterCompute::new(2));
        let notifier = Arc::new(RecordingNotifier::new());

        let handler = Arc::new(ContinuationHandler::new(store.clone(), compute.clone(), notifier.clone()));
        let submitter = JobSubmitter::new(
            store.clone(),
            InMemoryCatalog::new(["S2_MSI"]),
            QueueDispatcher::new(queue.clone()),
            notifier.clone(),
        );
        let inspector = DeadLetterInspector::new(store.clone(), queue.clone(), notifier.clone());

        Faulty {
            store,
            inner,
            compute,
            queue,
            handler,
            submitter,
            inspector,
        }
    }

    #[test]
    fn stream_store_error_fails_unit_instead_of_stranding_it() {
        let inner = InMemoryActivityStore::arc();
        let store = FlakyStore::arc(inner.clone());
        let notifier = Arc::new(RecordingNotifier::new());
        let stream = Arc::new(InMemoryFanoutStream::new(StreamConfig::default().with_partitions(1)).unwrap());
        let dead_letters = InMemoryDispatchQueue::arc(RedrivePolicy::default());
        let submitter = JobSubmitter::new(
            store.clone(),
            InMemoryCatalog::new(["S2_MSI"]),
            StreamDispatcher::new(stream.clone()),
            notifier.clone(),
        );
        let handler = Arc::new(ContinuationHandler::new(
            store.clone(),
            Arc::new(StaticRasterCompute::new(2)),
            notifier.clone(),
        ));
        let inspector = DeadLetterInspector::new(store.clone(), dead_letters.clone(), notifier.clone());
        let worker = StreamWorker::new(handler, stream.clone(), dead_letters.clone());

        let submitted = submitter.submit(&spec(&["001"], &[JAN, FEB])).unwrap();
        store.fail_next("swap_control", 1);
        while !worker.run_once().unwrap().is_idle() {}

        assert_eq!(stream.lag(0).unwrap(), 0);
        let failed: Vec<_> = inner
            .list_units(submitted.job_id)
            .unwrap()
            .into_iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].last_error.as_deref().unwrap().contains("injected failure in swap_control"));
        assert_eq!(job_of(&inner, submitted.job_id).status, JobStatus::Degraded);

        let inspected = inspector.drain(10).unwrap();
        assert_eq!(inspected.len(), 1);
        assert_eq!(inspected[0].entry.unit_id, failed[0].id);
        assert_eq!(inner.list_dead_letters(Some(submitted.job_id), 10).unwrap().len(), 1);
    }

    #[test]
    fn dead_letter_outage_on_stream_is_retried_from_checkpoint() {
        let store = InMemoryActivityStore::arc();
        let compute = Arc::new(StaticRasterCompute::new(2));
        let notifier = Arc::new(RecordingNotifier::new());
        let stream = Arc::new(InMemoryFanoutStream::new(StreamConfig::default().with_partitions(1)).unwrap());
        let dead_letters = FlakyQueue::arc(InMemoryDispatchQueue::arc(RedrivePolicy::default()));
        let submitter = JobSubmitter::new(
            store.clone(),
            InMemoryCatalog::new(["S2_MSI"]),
            StreamDispatcher::new(stream.clone()),
            notifier.clone(),
        );
        let handler = Arc::new(ContinuationHandler::new(store.clone(), compute.clone(), notifier.clone()));
        let inspector = DeadLetterInspector::new(store.clone(), dead_letters.clone(), notifier.clone());
        let worker = StreamWorker::new(handler, stream.clone(), dead_letters.clone());

        compute.fail_tile(tile("001"));
        let submitted = submitter.submit(&spec(&["001"], &[JAN])).unwrap();
        dead_letters.fail_next("dead_letter", 1);

        assert!(worker.run_once().is_err());
        assert_eq!(stream.lag(0).unwrap(), 1);
        assert_eq!(job_of(&store, submitted.job_id).status, JobStatus::Failed);

        // The re-read record reports the same failed attempt and reaches the path.
        let report = worker.run_once().unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(stream.lag(0).unwrap(), 0);
        assert_eq!(compute.calls(), 1);

        inspector.drain(10).unwrap();
        assert_eq!(store.list_dead_letters(Some(submitted.job_id), 10).unwrap().len(), 1);
    }

    #[test]
    fn interrupted_drain_returns_records_without_duplicate_ledger_rows() {
        let p = faulty_setup();
        p.compute.fail_tile(tile("001"));
        let submitted = p.submitter.submit(&spec(&["001"], &[JAN, FEB])).unwrap();
        p.drain_queue();
        assert_eq!(p.queue.depth().unwrap().dead_letters, 2);

        // The ledger row is written, then the unit lookup fails.
        p.store.fail_next("get_unit", 1);
        assert!(p.inspector.drain(10).is_err());
        assert_eq!(p.queue.depth().unwrap().dead_letters, 2);

        let inspected = p.inspector.drain(10).unwrap();
        assert_eq!(inspected.len(), 2);
        assert_eq!(p.inner.list_dead_letters(Some(submitted.job_id), 10).unwrap().len(), 2);
    }

    #[test]
    fn failed_redrive_send_leaves_entry_redrivable() {
        let p = faulty_setup();
        p.compute.fail_on(tile("001"), period(FEB), "catalog timeout");
        let submitted = p.submitter.submit(&spec(&["001"], &[JAN, FEB])).unwrap();
        p.drain_queue();
        let entry_id = p.inspector.drain(10).unwrap()[0].entry.id;
        assert_eq!(job_of(&p.inner, submitted.job_id).status, JobStatus::Degraded);

        p.queue.fail_next("send", 1);
        assert!(matches!(p.inspector.redrive(entry_id), Err(InspectorError::Channel(_))));

        let entry = p.inner.get_dead_letter(entry_id).unwrap().unwrap();
        assert!(entry.redriven_at.is_none());
        let unit = p.inner.get_unit(entry.unit_id).unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Failed);
        assert!(unit.last_error.unwrap().contains("catalog timeout"));
        assert_eq!(job_of(&p.inner, submitted.job_id).status, JobStatus::Degraded);

        p.compute.clear_failures();
        p.inspector.redrive(entry_id).unwrap();
        p.drain_queue();
        assert_eq!(job_of(&p.inner, submitted.job_id).status, JobStatus::Done);
        assert!(p.inner.get_dead_letter(entry_id).unwrap().unwrap().redriven_at.is_some());
    }

    #[test]
    fn lost_metadata_write_is_finished_through_dead_letter_path() {
        let clock = Arc::new(ManualClock::default());
        let policy = RedrivePolicy::default().with_visibility_timeout(Duration::from_secs(60));
        let inner = InMemoryActivityStore::arc();
        let store = FlakyStore::arc(inner.clone());
        let queue = Arc::new(InMemoryDispatchQueue::with_clock(policy, clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let handler = Arc::new(ContinuationHandler::new(
            store.clone(),
            Arc::new(StaticRasterCompute::new(2)),
            notifier.clone(),
        ));
        let submitter = JobSubmitter::new(
            store.clone(),
            InMemoryCatalog::new(["S2_MSI"]),
            QueueDispatcher::new(queue.clone()),
            notifier.clone(),
        );
        let inspector = DeadLetterInspector::new(store.clone(), queue.clone(), notifier.clone());
        let worker = QueueWorker::new(handler, queue.clone(), 10);

        let submitted = submitter.submit(&spec(&["001"], &[JAN])).unwrap();
        store.fail_next("record_cube_metadata", 1);
        let report = worker.run_once().unwrap();
        assert_eq!(report.errors, 1);
        assert!(!job_of(&inner, submitted.job_id).status.is_terminal());
        assert!(notifier.notifications().is_empty());

        // The unacked delivery expires and the inspector re-runs the check.
        clock.advance(chrono::Duration::seconds(61));
        let inspected = inspector.drain(10).unwrap();
        assert_eq!(inspected[0].unit, UnitResolution::AlreadyTerminal(UnitStatus::Done));
        assert!(matches!(
            inspected[0].job,
            Some(CompletionOutcome::Finalized { status: JobStatus::Done, .. })
        ));
        assert_eq!(inner.cube_metadata(submitted.job_id).unwrap().unwrap().slices.len(), 1);
        assert_eq!(notifier.notifications().len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Any delivery order, with duplicates, ends in the same final state.
        #[test]
        fn delivery_order_does_not_change_final_state(
            order in Just((0usize..6).collect::<Vec<_>>()).prop_shuffle(),
            duplicates in proptest::collection::vec(0usize..6, 0..4),
        ) {
            let p = setup();
            let submitted = p.submitter.submit(&spec(&["001", "002", "003"], &[JAN, FEB])).unwrap();
            let messages: Vec<_> = p.queue.receive(6).unwrap().into_iter().map(|d| d.message).collect();

            for i in order.iter().chain(duplicates.iter()) {
                p.handler.handle(&messages[*i]).unwrap();
            }

            prop_assert_eq!(job_of(&p.store, submitted.job_id).status, JobStatus::Done);
            prop_assert_eq!(p.compute.calls(), 6);
            prop_assert_eq!(p.notifier.notifications().len(), 1);
            let metadata = p.store.cube_metadata(submitted.job_id).unwrap().unwrap();
            prop_assert_eq!(metadata.slices.len(), 6);
            prop_assert!(metadata.slices.iter().all(|s| s.inputs == 2));
        }
    }
}
