use super::*;
use crate::store::SqliteStore;
use crate::telemetry::Field;
use chrono::TimeZone;
use serde_json::json;
use std::sync::Mutex;

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn src(raw: i64) -> SourceId {
    SourceId::new(raw).unwrap()
}

fn single(value: Value) -> Frame {
    Frame::from_object(value.as_object().cloned().unwrap())
}

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Online(SourceId),
    Offline(SourceId),
    Reading(SourceId, Option<f64>),
    Status(bool),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Consumer for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn on_reading(&mut self, reading: &Reading) -> anyhow::Result<()> {
        self.push(Event::Reading(reading.source(), reading.value(Field::Pm25)));
        Ok(())
    }

    fn on_source_online(&mut self, source: SourceId) -> anyhow::Result<()> {
        self.push(Event::Online(source));
        Ok(())
    }

    fn on_source_offline(&mut self, source: SourceId) -> anyhow::Result<()> {
        self.push(Event::Offline(source));
        Ok(())
    }

    fn on_transport_status(&mut self, status: &TransportStatus) -> anyhow::Result<()> {
        self.push(Event::Status(status.is_connected()));
        Ok(())
    }
}

struct Broken {
    panic: bool,
}

impl Consumer for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn on_reading(&mut self, _reading: &Reading) -> anyhow::Result<()> {
        if self.panic {
            panic!("widget crashed");
        }
        anyhow::bail!("widget unavailable")
    }

    fn on_source_online(&mut self, _source: SourceId) -> anyhow::Result<()> {
        anyhow::bail!("widget unavailable")
    }

    fn on_source_offline(&mut self, _source: SourceId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Store that fails while `failing` is set and counts successful inserts.
#[derive(Clone, Default)]
struct FlakyStore {
    failing: Arc<Mutex<bool>>,
    inserts: Arc<Mutex<Vec<(SourceId, DateTime<Utc>, Option<f64>)>>>,
}

impl FlakyStore {
    fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn inserts(&self) -> Vec<(SourceId, DateTime<Utc>, Option<f64>)> {
        self.inserts.lock().unwrap().clone()
    }
}

impl ReadingStore for FlakyStore {
    fn insert(&mut self, reading: &Reading, inserted_at: DateTime<Utc>) -> Result<i64, StoreError> {
        if *self.failing.lock().unwrap() {
            return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
        }
        let mut inserts = self.inserts.lock().unwrap();
        inserts.push((reading.source(), inserted_at, reading.value(Field::Pm25)));
        Ok(inserts.len() as i64)
    }

    fn recent_readings(&self, _limit: usize) -> Result<Vec<StoredRow>, StoreError> {
        Ok(Vec::new())
    }

    fn statistics(&self) -> Result<StoreStatistics, StoreError> {
        Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows))
    }
}

fn pipeline_with(store: Box<dyn ReadingStore>, consumers: Vec<Box<dyn Consumer>>) -> Pipeline {
    Pipeline::new(
        PipelineSettings::default(),
        store,
        consumers,
        Arc::new(IngestStats::new()),
    )
}

#[test]
fn valid_frame_is_delivered_and_marks_source_online() {
    let recorder = Recorder::default();
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![Box::new(recorder.clone())],
    );

    let outcome = pipeline.ingest_frame(single(json!({"nodeId":1,"pm25":45.2,"eco2":900})), t(0));
    assert_eq!(outcome, FrameOutcome { accepted: 1, rejected: 0 });
    assert_eq!(
        recorder.take(),
        vec![Event::Online(src(1)), Event::Reading(src(1), Some(45.2))]
    );
    assert!(pipeline.liveness().is_online(src(1)));

    let rows = pipeline.recent_readings(10).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].eco2, Some(900.0));
}

#[test]
fn unknown_source_changes_nothing() {
    let recorder = Recorder::default();
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![Box::new(recorder.clone())],
    );

    let outcome = pipeline.ingest_frame(single(json!({"nodeId":7,"pm25":10})), t(0));
    assert_eq!(outcome, FrameOutcome { accepted: 0, rejected: 1 });
    assert!(recorder.take().is_empty());
    assert!(SourceId::ALL
        .into_iter()
        .all(|source| !pipeline.liveness().is_online(source)));
    assert_eq!(pipeline.stats().snapshot().readings_rejected, 1);
}

#[test]
fn record_without_surviving_measurements_is_rejected() {
    let recorder = Recorder::default();
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![Box::new(recorder.clone())],
    );
    let result = pipeline.ingest_candidate(&json!({"nodeId":2,"pm25":99999}), t(0));
    assert_eq!(result, Err(Rejection::NoMeasurements));
    assert!(recorder.take().is_empty());
    assert!(!pipeline.liveness().is_online(src(2)));
}

#[test]
fn batch_frame_delivers_each_member_in_order() {
    let recorder = Recorder::default();
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![Box::new(recorder.clone())],
    );
    let frame = single(json!({"nodes": [
        {"nodeId": 3, "pm25": 3},
        {"nodeId": 9, "pm25": 9},
        {"nodeId": 2, "pm25": 2}
    ]}));
    let outcome = pipeline.ingest_frame(frame, t(0));
    assert_eq!(outcome, FrameOutcome { accepted: 2, rejected: 1 });
    assert_eq!(
        recorder.take(),
        vec![
            Event::Online(src(3)),
            Event::Reading(src(3), Some(3.0)),
            Event::Online(src(2)),
            Event::Reading(src(2), Some(2.0)),
        ]
    );
}

#[test]
fn second_reading_waits_for_throttle_window() {
    let store = FlakyStore::default();
    let mut pipeline = pipeline_with(Box::new(store.clone()), Vec::new());

    pipeline.ingest_candidate(&json!({"nodeId":1,"pm25":1}), t(0)).unwrap();
    pipeline.ingest_candidate(&json!({"nodeId":1,"pm25":2}), t(2)).unwrap();
    assert_eq!(store.inserts(), vec![(src(1), t(0), Some(1.0))]);

    for second in 3..5 {
        pipeline.tick(t(second));
    }
    assert_eq!(store.inserts().len(), 1);

    let report = pipeline.tick(t(5));
    assert_eq!(report.persist.written, 1);
    assert_eq!(store.inserts()[1], (src(1), t(5), Some(2.0)));
    assert_eq!(pipeline.last_persisted_at(src(1)), Some(t(5)));
}

#[test]
fn at_most_one_write_per_source_per_window() {
    let store = FlakyStore::default();
    let mut pipeline = pipeline_with(Box::new(store.clone()), Vec::new());

    // readings every 700 ms for two sources, ticks every second
    for step in 0..60i64 {
        let now = t(0) + ChronoDuration::milliseconds(step * 700);
        let source = 1 + step % 2;
        pipeline
            .ingest_candidate(&json!({"nodeId": source, "pm25": step}), now)
            .unwrap();
        if step % 2 == 0 {
            pipeline.tick(t(0) + ChronoDuration::milliseconds(step * 700 + 300));
        }
    }

    let inserts = store.inserts();
    for source in [src(1), src(2)] {
        let times: Vec<_> = inserts
            .iter()
            .filter(|(s, _, _)| *s == source)
            .map(|(_, at, _)| *at)
            .collect();
        assert!(times.len() > 1);
        assert!(times
            .windows(2)
            .all(|pair| pair[1] - pair[0] >= ChronoDuration::seconds(5)));
    }
}

#[test]
fn queued_frame_is_stamped_with_the_handling_clock() {
    let store = FlakyStore::default();
    let mut pipeline = pipeline_with(Box::new(store.clone()), Vec::new());
    pipeline.handle_worker_event(
        WorkerEvent::Frame(single(json!({"nodeId": 1, "pm25": 1}))),
        t(0),
    );
    pipeline.tick(t(4));

    // the frame sat in the queue behind a slow consumer and is only handled at t+12
    pipeline.handle_worker_event(
        WorkerEvent::Frame(single(json!({"nodeId": 1, "pm25": 2}))),
        t(12),
    );
    assert_eq!(pipeline.last_persisted_at(src(1)), Some(t(12)));
    assert_eq!(pipeline.tick(t(12)).persist.written, 0);
    assert_eq!(pipeline.tick(t(16)).persist.written, 0);
    assert_eq!(pipeline.tick(t(17)).persist.written, 1);

    assert_eq!(
        store.inserts(),
        vec![
            (src(1), t(0), Some(1.0)),
            (src(1), t(12), Some(2.0)),
            (src(1), t(17), Some(2.0)),
        ]
    );
    let liveness = pipeline.liveness();
    assert_eq!(liveness.sources[0].1.last_seen, Some(t(12)));
}

#[test]
fn heartbeat_persists_latest_reading_without_new_data() {
    let store = FlakyStore::default();
    let mut pipeline = pipeline_with(Box::new(store.clone()), Vec::new());
    pipeline.ingest_candidate(&json!({"nodeId":2,"pm25":7}), t(0)).unwrap();
    for second in 1..=10 {
        pipeline.tick(t(second));
    }
    let inserts = store.inserts();
    assert_eq!(
        inserts,
        vec![
            (src(2), t(0), Some(7.0)),
            (src(2), t(5), Some(7.0)),
            (src(2), t(10), Some(7.0)),
        ]
    );
}

#[test]
fn on_change_policy_skips_unchanged_sources() {
    let store = FlakyStore::default();
    let mut pipeline = Pipeline::new(
        PipelineSettings {
            persist_policy: PersistPolicy::OnChange,
            ..PipelineSettings::default()
        },
        Box::new(store.clone()),
        Vec::new(),
        Arc::new(IngestStats::new()),
    );
    pipeline.ingest_candidate(&json!({"nodeId":2,"pm25":7}), t(0)).unwrap();
    for second in 1..=10 {
        pipeline.tick(t(second));
    }
    assert_eq!(store.inserts().len(), 1);

    pipeline.ingest_candidate(&json!({"nodeId":2,"pm25":8}), t(11)).unwrap();
    assert_eq!(store.inserts().len(), 2);
}

#[test]
fn failed_write_leaves_cursor_and_retries_next_tick() {
    let store = FlakyStore::default();
    let mut pipeline = pipeline_with(Box::new(store.clone()), Vec::new());

    store.set_failing(true);
    pipeline.ingest_candidate(&json!({"nodeId":3,"pm25":1}), t(0)).unwrap();
    assert_eq!(pipeline.last_persisted_at(src(3)), None);
    let report = pipeline.tick(t(1));
    assert_eq!(report.persist, PersistReport { written: 0, failed: 1 });

    store.set_failing(false);
    let report = pipeline.tick(t(2));
    assert_eq!(report.persist.written, 1);
    assert_eq!(pipeline.last_persisted_at(src(3)), Some(t(2)));

    let snapshot = pipeline.stats().snapshot();
    assert_eq!(snapshot.persist_failures, 2);
    assert_eq!(snapshot.rows_persisted, 1);
    // persistence failures never reach consumers or liveness
    assert!(pipeline.liveness().is_online(src(3)));
}

#[test]
fn silent_source_goes_offline_exactly_once() {
    let recorder = Recorder::default();
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![Box::new(recorder.clone())],
    );
    pipeline.ingest_candidate(&json!({"nodeId":3,"co":1}), t(0)).unwrap();
    recorder.take();

    let mut offline = Vec::new();
    for second in 1..=90 {
        offline.extend(pipeline.tick(t(second)).went_offline);
    }
    assert_eq!(offline, vec![src(3)]);
    assert_eq!(recorder.take(), vec![Event::Offline(src(3))]);

    pipeline.ingest_candidate(&json!({"nodeId":3,"co":2}), t(91)).unwrap();
    assert_eq!(
        recorder.take(),
        vec![Event::Online(src(3)), Event::Reading(src(3), None)]
    );
}

#[test]
fn aggregate_drops_stale_readings_after_sources_go_offline() {
    let (aggregate, rx) = crate::consumers::RollingAggregate::new(60);
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![Box::new(aggregate)],
    );
    pipeline
        .ingest_candidate(&json!({"nodeId": 2, "pm25": 30}), t(0))
        .unwrap();
    assert_eq!(rx.borrow().field(Field::Pm25).map(|f| f.count), Some(1));

    for second in 1..=61 {
        pipeline.tick(t(second));
    }
    let summary = rx.borrow().clone();
    assert_eq!(summary.online_count(), 0);
    assert!(summary.field(Field::Pm25).is_none());
    assert_eq!(pipeline.stats().snapshot().consumer_failures, 0);
}

#[test]
fn source_stays_online_while_readings_keep_arriving() {
    let mut pipeline = pipeline_with(Box::new(FlakyStore::default()), Vec::new());
    for second in (0..=300).step_by(30) {
        pipeline
            .ingest_candidate(&json!({"nodeId":1,"humidity":50}), t(second))
            .unwrap();
        assert!(pipeline.tick(t(second + 1)).went_offline.is_empty());
    }
}

#[test]
fn failing_consumer_does_not_starve_siblings() {
    let recorder = Recorder::default();
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![
            Box::new(Broken { panic: false }),
            Box::new(Broken { panic: true }),
            Box::new(recorder.clone()),
        ],
    );
    pipeline.ingest_candidate(&json!({"nodeId":1,"pm25":3}), t(0)).unwrap();
    assert_eq!(
        recorder.take(),
        vec![Event::Online(src(1)), Event::Reading(src(1), Some(3.0))]
    );
    // two failures for the online event, two for the reading
    assert_eq!(pipeline.stats().snapshot().consumer_failures, 4);
    assert_eq!(pipeline.recent_readings(1).unwrap().len(), 1);
}

#[test]
fn transport_status_reaches_consumers_and_stats() {
    let recorder = Recorder::default();
    let mut pipeline = pipeline_with(
        Box::new(SqliteStore::open_in_memory().unwrap()),
        vec![Box::new(recorder.clone())],
    );
    pipeline.handle_worker_event(
        WorkerEvent::Status(TransportStatus::Connected {
            device: "/dev/ttyUSB0".into(),
        }),
        t(0),
    );
    assert!(pipeline.stats().snapshot().transport_connected);

    pipeline.handle_worker_event(
        WorkerEvent::Status(TransportStatus::Fault {
            device: "/dev/ttyUSB0".into(),
            message: "device unplugged".into(),
        }),
        t(1),
    );
    let snapshot = pipeline.stats().snapshot();
    assert!(!snapshot.transport_connected);
    assert_eq!(snapshot.last_error.as_deref(), Some("device unplugged"));
    assert_eq!(recorder.take(), vec![Event::Status(true), Event::Status(false)]);
}

#[test]
fn store_query_failures_surface_to_caller() {
    let pipeline = pipeline_with(Box::new(FlakyStore::default()), Vec::new());
    assert!(pipeline.statistics().is_err());
    assert!(pipeline.export_rows(10).unwrap().is_empty());
}
