use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;

use crate::db::Database;
use crate::device::{
    Connector, DeviceReader, EndpointConfig, LineDecoder, ReadingHandler, ReconnectPolicy,
};
use crate::error::TrackerError;
use crate::models::{Channel, ChannelId, ProductId, Reading, SeriesPoint, Session, StartSession};
use crate::recording::{
    Clock, IngestPipeline, LiveValueCache, PersistenceWorker, SessionRegistry, SlotState,
    SystemClock,
};
use crate::settings::TrackerSettings;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub channel_id: ChannelId,
    pub device_key: String,
    pub state: SlotState,
}

/// Process-wide recording state and the command/query surface over it.
///
/// Built once at startup and torn down with [`shutdown`](Self::shutdown).
/// Every operation of the operator interface goes through here.
pub struct OvenTracker {
    channels: Vec<Channel>,
    endpoint: EndpointConfig,
    clock: Arc<dyn Clock>,
    db: Database,
    registry: Arc<SessionRegistry>,
    cache: Arc<LiveValueCache>,
    pipeline: IngestPipeline,
    worker: tokio::sync::Mutex<PersistenceWorker>,
    reader: DeviceReader,
    attach_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Vec<Session>>,
}

impl OvenTracker {
    /// Opens the configured database and builds the tracker on the system
    /// clock.
    pub async fn open(settings: &TrackerSettings) -> Result<Self> {
        let db = Database::new(settings.database_path.clone())?;
        Self::new(settings, db, Arc::new(SystemClock)).await
    }

    /// Sessions left running by a previous process are closed as
    /// `Interrupted` before any slot becomes available.
    pub async fn new(
        settings: &TrackerSettings,
        db: Database,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        let channels = settings.channels()?;
        let channel_ids: Vec<ChannelId> = channels.iter().map(|c| c.id.clone()).collect();

        db.prepare_history(&channel_ids).await?;
        for session in db.recover_interrupted_sessions(clock.now()).await? {
            warn!(
                "Recovered session {} on {} (product {}); marked as Interrupted",
                session.id, session.channel_id, session.product_id
            );
        }

        let registry = Arc::new(SessionRegistry::new(
            channel_ids.iter().cloned(),
            settings.throttle(),
        ));
        let cache = Arc::new(LiveValueCache::new(channel_ids));
        let (pipeline, worker) = PersistenceWorker::spawn(
            registry.clone(),
            cache.clone(),
            db.clone(),
            settings.persist_queue_capacity,
        );

        let policy: Arc<dyn ReconnectPolicy> = settings.reconnect.policy();
        let reader = DeviceReader::new(LineDecoder::new(&channels), clock.clone(), policy);

        Ok(Self {
            channels,
            endpoint: settings.serial.clone(),
            clock,
            db,
            registry,
            cache,
            pipeline,
            worker: tokio::sync::Mutex::new(worker),
            reader,
            attach_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn reader(&self) -> &DeviceReader {
        &self.reader
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    /// Opens the configured serial port and feeds its readings into the
    /// pipeline.
    pub async fn connect_device(&self) -> Result<(), TrackerError> {
        let endpoint = self.endpoint.clone();
        self.attach(|reader| reader.open(&endpoint)).await
    }

    /// Same as [`connect_device`](Self::connect_device) over any byte source.
    pub async fn connect_with(&self, connector: Connector) -> Result<(), TrackerError> {
        self.attach(move |reader| reader.open_with(connector)).await
    }

    /// Subscribes the pipeline and opens the reader as one step, so
    /// concurrent connects register a single handler.
    async fn attach<F>(&self, open: F) -> Result<(), TrackerError>
    where
        F: FnOnce(&DeviceReader) -> Result<(), TrackerError>,
    {
        let _guard = self.attach_lock.lock().await;
        if self.reader.is_open() {
            return Ok(());
        }

        let pipeline = self.pipeline.clone();
        let handler: ReadingHandler = Arc::new(move |readings: &[Reading]| {
            pipeline.on_readings(readings);
        });
        self.reader.subscribe(handler);

        if let Err(err) = open(&self.reader) {
            self.reader.close().await;
            return Err(err);
        }
        Ok(())
    }

    pub async fn start_session(&self, request: StartSession) -> Result<Session, TrackerError> {
        if !self.registry.channels().contains(&request.channel_id) {
            return Err(TrackerError::invalid(format!(
                "unknown channel '{}'",
                request.channel_id
            )));
        }
        if let Some(channel_id) = self.registry.channel_recording(&request.product_id) {
            return Err(TrackerError::invalid(format!(
                "product {} is being recorded on {channel_id}",
                request.product_id
            )));
        }
        if self.db.product_exists(&request.product_id).await? {
            return Err(TrackerError::invalid(format!(
                "product {} already has a recorded series",
                request.product_id
            )));
        }

        let session = self.registry.start(request, self.clock.now())?;
        info!(
            "Started session {} on {} for product {}",
            session.id, session.channel_id, session.product_id
        );

        if let Err(err) = self.db.save_checkpoint(&session).await {
            warn!(
                "Failed to checkpoint session {} on {}: {err:#}",
                session.id, session.channel_id
            );
        }
        Ok(session)
    }

    /// Ends the active session and appends it to the channel history.
    ///
    /// The slot is idle once this returns, even when the append fails; the
    /// record is then kept for [`retry_pending_sessions`](Self::retry_pending_sessions)
    /// and the error is returned.
    pub async fn stop_session(&self, channel_id: &ChannelId) -> Result<Session, TrackerError> {
        let session = self.registry.stop(channel_id, self.clock.now())?;
        info!("Stopped session {} on {}", session.id, channel_id);

        if let Err(err) = self.db.append_history(&session).await {
            error!(
                "Failed to append session {} to {} history: {err:#}",
                session.id, channel_id
            );
            self.lock_pending().push(session);
            return Err(TrackerError::Persistence(err));
        }

        if let Err(err) = self.db.clear_checkpoint(&session).await {
            warn!("Failed to clear checkpoint of {channel_id}: {err:#}");
        }
        if let Err(err) = self.retry_pending_sessions().await {
            warn!("Pending sessions still not saved: {err}");
        }
        Ok(session)
    }

    pub fn get_active_session(&self, channel_id: &ChannelId) -> Option<Session> {
        self.registry.get_active(channel_id)
    }

    /// Appends a completed record supplied by the caller.
    pub async fn save_session(
        &self,
        channel_id: &ChannelId,
        session: Session,
    ) -> Result<(), TrackerError> {
        self.known_channel(channel_id)?;
        if session.channel_id != *channel_id {
            return Err(TrackerError::invalid(format!(
                "session belongs to {}, not {channel_id}",
                session.channel_id
            )));
        }
        session.validate_completed()?;

        self.db.append_history(&session).await?;
        Ok(())
    }

    pub async fn get_sessions(&self, channel_id: &ChannelId) -> Result<Vec<Session>, TrackerError> {
        self.known_channel(channel_id)?;
        Ok(self.db.list_history(channel_id).await?)
    }

    pub async fn get_session_temperatures(
        &self,
        product_id: &ProductId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<SeriesPoint>, TrackerError> {
        Ok(self.db.query_points(product_id, from, to).await?)
    }

    pub async fn check_product_id_exists(
        &self,
        product_id: &ProductId,
    ) -> Result<bool, TrackerError> {
        Ok(self.db.product_exists(product_id).await?)
    }

    /// Served from the cache only, never from the device.
    pub fn read_live_temperature(&self) -> BTreeMap<ChannelId, Option<f64>> {
        self.cache
            .snapshot()
            .into_iter()
            .map(|(channel_id, reading)| (channel_id, reading.map(|r| r.value)))
            .collect()
    }

    pub fn list_channels(&self) -> Vec<ChannelStatus> {
        self.channels
            .iter()
            .map(|channel| ChannelStatus {
                channel_id: channel.id.clone(),
                device_key: channel.device_key.clone(),
                state: self.registry.state(&channel.id).unwrap_or_default(),
            })
            .collect()
    }

    pub async fn list_products(&self) -> Result<Vec<ProductId>, TrackerError> {
        Ok(self.db.list_products().await?)
    }

    pub fn pending_sessions(&self) -> Vec<Session> {
        self.lock_pending().clone()
    }

    /// Re-attempts history appends that failed during `stop_session`.
    /// Returns how many records were written; failed ones stay pending.
    pub async fn retry_pending_sessions(&self) -> Result<usize, TrackerError> {
        let queued = mem::take(&mut *self.lock_pending());
        if queued.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut failure = None;
        let mut remaining = Vec::new();
        for session in queued {
            if failure.is_some() {
                remaining.push(session);
                continue;
            }
            match self.db.append_history(&session).await {
                Ok(()) => {
                    if let Err(err) = self.db.clear_checkpoint(&session).await {
                        warn!(
                            "Failed to clear checkpoint of {}: {err:#}",
                            session.channel_id
                        );
                    }
                    written += 1;
                }
                Err(err) => {
                    remaining.push(session);
                    failure = Some(err);
                }
            }
        }

        if !remaining.is_empty() {
            let mut pending = self.lock_pending();
            remaining.append(&mut pending);
            *pending = remaining;
        }
        match failure {
            Some(err) => Err(TrackerError::Persistence(err)),
            None => Ok(written),
        }
    }

    /// Waits until every throttled sample queued so far is written.
    pub async fn flush(&self) -> Result<()> {
        self.pipeline.drain().await
    }

    /// Closes the device, drains the persistence queue and stops the store.
    pub async fn shutdown(&self) -> Result<()> {
        self.reader.close().await;
        self.worker.lock().await.stop().await?;

        let pending = self.lock_pending().len();
        if pending > 0 {
            warn!("{pending} completed sessions were never saved to history");
        }
        self.db.shutdown();
        info!("Oven tracker stopped");
        Ok(())
    }

    fn known_channel(&self, channel_id: &ChannelId) -> Result<(), TrackerError> {
        if self.registry.channels().contains(channel_id) {
            Ok(())
        } else {
            Err(TrackerError::invalid(format!("unknown channel '{channel_id}'")))
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<Session>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::helpers::{history_table_name, quote_identifier};
    use crate::models::SessionStatus;
    use crate::recording::ManualClock;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn oven(name: &str) -> ChannelId {
        ChannelId::new(name).unwrap()
    }

    fn product(id: &str) -> ProductId {
        ProductId::new(id).unwrap()
    }

    fn request(channel: &str, product_id: &str) -> StartSession {
        StartSession {
            channel_id: oven(channel),
            product_id: product(product_id),
            operation: "Colle Blanche".into(),
            piece_count: 20,
        }
    }

    async fn tracker_on(db: Database) -> (OvenTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let tracker = OvenTracker::new(&TrackerSettings::default(), db, clock.clone())
            .await
            .unwrap();
        (tracker, clock)
    }

    async fn tracker() -> (OvenTracker, Arc<ManualClock>) {
        tracker_on(Database::in_memory().unwrap()).await
    }

    fn reading(channel: &str, value: f64, at: DateTime<Utc>) -> Reading {
        Reading {
            channel_id: oven(channel),
            value,
            captured_at: at,
        }
    }

    #[tokio::test]
    async fn start_and_stop_round_trip_into_history() {
        let (tracker, clock) = tracker().await;
        let started = tracker.start_session(request("oven1", "5466")).await.unwrap();
        assert_eq!(started.status, SessionStatus::Running);
        assert_eq!(tracker.get_active_session(&oven("oven1")), Some(started.clone()));

        clock.advance(Duration::minutes(45));
        let stopped = tracker.stop_session(&oven("oven1")).await.unwrap();
        assert_eq!(stopped.id, started.id);
        assert_eq!(stopped.ended_at, Some(t0() + Duration::minutes(45)));
        assert_eq!(stopped.status, SessionStatus::Completed);
        assert!(tracker.get_active_session(&oven("oven1")).is_none());

        let history = tracker.get_sessions(&oven("oven1")).await.unwrap();
        assert_eq!(history, vec![stopped]);
        assert!(tracker.get_sessions(&oven("oven2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicting_starts_are_rejected() {
        let (tracker, _clock) = tracker().await;
        tracker.start_session(request("oven1", "5466")).await.unwrap();

        let err = tracker.start_session(request("oven1", "77")).await.unwrap_err();
        assert_eq!(err.kind(), "already-running");

        let err = tracker.start_session(request("oven2", "5466")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-arguments");
        assert!(tracker.get_active_session(&oven("oven2")).is_none());

        let err = tracker.start_session(request("oven9", "1")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-arguments");

        let mut bad = request("oven2", "88");
        bad.piece_count = 0;
        assert_eq!(
            tracker.start_session(bad).await.unwrap_err().kind(),
            "invalid-arguments"
        );
    }

    #[tokio::test]
    async fn products_with_a_series_cannot_be_reused() {
        let (tracker, clock) = tracker().await;
        tracker.start_session(request("oven1", "5466")).await.unwrap();
        tracker.pipeline().on_reading(&reading("oven1", 180.2, t0()));
        tracker.flush().await.unwrap();
        clock.advance(Duration::minutes(5));
        tracker.stop_session(&oven("oven1")).await.unwrap();

        assert!(tracker.check_product_id_exists(&product("5466")).await.unwrap());
        assert!(!tracker.check_product_id_exists(&product("5467")).await.unwrap());
        let err = tracker.start_session(request("oven2", "5466")).await.unwrap_err();
        assert_eq!(err.kind(), "invalid-arguments");
        assert_eq!(tracker.list_products().await.unwrap(), vec![product("5466")]);
    }

    #[tokio::test]
    async fn stop_on_idle_channel_is_not_running() {
        let (tracker, _clock) = tracker().await;
        let err = tracker.stop_session(&oven("oven2")).await.unwrap_err();
        assert_eq!(err.kind(), "not-running");
        assert!(tracker.get_sessions(&oven("oven2")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn live_values_and_channel_states() {
        let (tracker, _clock) = tracker().await;
        let live = tracker.read_live_temperature();
        assert_eq!(live.get(&oven("oven1")), Some(&None));
        assert_eq!(live.get(&oven("oven2")), Some(&None));

        tracker.start_session(request("oven2", "9")).await.unwrap();
        tracker.pipeline().on_reading(&reading("oven1", 171.5, t0()));

        let live = tracker.read_live_temperature();
        assert_eq!(live.get(&oven("oven1")), Some(&Some(171.5)));
        assert_eq!(live.get(&oven("oven2")), Some(&None));

        let states: Vec<(String, SlotState)> = tracker
            .list_channels()
            .into_iter()
            .map(|status| (status.channel_id.to_string(), status.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("oven1".to_string(), SlotState::Idle),
                ("oven2".to_string(), SlotState::Recording),
            ]
        );
    }

    #[tokio::test]
    async fn temperatures_are_filtered_by_range() {
        let (tracker, _clock) = tracker().await;
        tracker.start_session(request("oven1", "5466")).await.unwrap();
        for (value, minutes) in [(180.0, 0), (181.0, 1), (182.0, 2), (183.0, 3)] {
            tracker
                .pipeline()
                .on_reading(&reading("oven1", value, t0() + Duration::minutes(minutes)));
        }
        tracker.flush().await.unwrap();

        let all = tracker
            .get_session_temperatures(&product("5466"), None, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 4);

        let window = tracker
            .get_session_temperatures(
                &product("5466"),
                Some(t0() + Duration::minutes(1)),
                Some(t0() + Duration::minutes(2)),
            )
            .await
            .unwrap();
        assert_eq!(
            window.iter().map(|p| p.value).collect::<Vec<_>>(),
            vec![181.0, 182.0]
        );

        let unknown = tracker
            .get_session_temperatures(&product("404"), None, None)
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn save_session_checks_the_record() {
        let (tracker, _clock) = tracker().await;
        let mut session = request("oven2", "31")
            .into_session(t0() - Duration::hours(3))
            .unwrap();
        session.ended_at = Some(t0() - Duration::hours(2));
        session.status = SessionStatus::Completed;

        let err = tracker
            .save_session(&oven("oven1"), session.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid-arguments");

        let mut open_ended = session.clone();
        open_ended.ended_at = None;
        assert!(tracker.save_session(&oven("oven2"), open_ended).await.is_err());

        tracker.save_session(&oven("oven2"), session.clone()).await.unwrap();
        assert_eq!(tracker.get_sessions(&oven("oven2")).await.unwrap(), vec![session]);
    }

    #[tokio::test]
    async fn failed_history_append_is_kept_for_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.sqlite3");
        let (tracker, clock) = tracker_on(Database::new(path).unwrap()).await;

        tracker.start_session(request("oven1", "5466")).await.unwrap();
        tracker.db.shutdown();
        clock.advance(Duration::minutes(10));

        let err = tracker.stop_session(&oven("oven1")).await.unwrap_err();
        assert_eq!(err.kind(), "persistence-error");
        assert!(tracker.get_active_session(&oven("oven1")).is_none());
        assert_eq!(tracker.pending_sessions().len(), 1);
        assert!(tracker.retry_pending_sessions().await.is_err());
        assert_eq!(tracker.pending_sessions().len(), 1);
    }

    async fn reject_history_writes(db: &Database, channel: &str) {
        let table = quote_identifier(&history_table_name(&oven(channel)));
        db.execute(move |conn| {
            conn.execute_batch(&format!(
                "CREATE TRIGGER reject_history BEFORE INSERT ON {table}
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;"
            ))?;
            Ok(())
        })
        .await
        .unwrap();
    }

    async fn accept_history_writes(db: &Database) {
        db.execute(|conn| {
            conn.execute_batch("DROP TRIGGER reject_history")?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn retry_writes_pending_sessions() {
        let (tracker, clock) = tracker().await;
        tracker.start_session(request("oven1", "5466")).await.unwrap();
        reject_history_writes(&tracker.db, "oven1").await;
        clock.advance(Duration::minutes(10));

        let err = tracker.stop_session(&oven("oven1")).await.unwrap_err();
        assert_eq!(err.kind(), "persistence-error");
        assert_eq!(tracker.pending_sessions().len(), 1);
        assert!(tracker.get_sessions(&oven("oven1")).await.unwrap().is_empty());

        accept_history_writes(&tracker.db).await;
        assert_eq!(tracker.retry_pending_sessions().await.unwrap(), 1);
        assert!(tracker.pending_sessions().is_empty());

        let history = tracker.get_sessions(&oven("oven1")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].product_id, product("5466"));
        assert_eq!(history[0].status, SessionStatus::Completed);
        assert_eq!(history[0].ended_at, Some(t0() + Duration::minutes(10)));
        assert_eq!(tracker.retry_pending_sessions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn next_successful_stop_flushes_pending_sessions() {
        let (tracker, clock) = tracker().await;
        tracker.start_session(request("oven1", "5466")).await.unwrap();
        tracker.start_session(request("oven2", "77")).await.unwrap();
        reject_history_writes(&tracker.db, "oven1").await;
        clock.advance(Duration::minutes(10));

        assert!(tracker.stop_session(&oven("oven1")).await.is_err());
        accept_history_writes(&tracker.db).await;

        let stopped = tracker.stop_session(&oven("oven2")).await.unwrap();
        assert!(tracker.pending_sessions().is_empty());
        assert_eq!(tracker.get_sessions(&oven("oven2")).await.unwrap(), vec![stopped]);
        let flushed = tracker.get_sessions(&oven("oven1")).await.unwrap();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].product_id, product("5466"));
    }

    #[tokio::test]
    async fn restart_closes_sessions_left_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.sqlite3");

        let (tracker, _clock) = tracker_on(Database::new(path.clone()).unwrap()).await;
        let started = tracker.start_session(request("oven2", "808")).await.unwrap();
        tracker.shutdown().await.unwrap();

        let (tracker, _clock) = tracker_on(Database::new(path).unwrap()).await;
        assert!(tracker.get_active_session(&oven("oven2")).is_none());
        let history = tracker.get_sessions(&oven("oven2")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, started.id);
        assert_eq!(history[0].status, SessionStatus::Interrupted);
        assert_eq!(history[0].ended_at, Some(t0()));
        tracker.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn device_lines_reach_cache_and_series() {
        let (tracker, _clock) = tracker().await;
        tracker.start_session(request("oven1", "5466")).await.unwrap();

        let (mut device, host) = tokio::io::duplex(1024);
        let host = Mutex::new(Some(host));
        let connector: Connector = Arc::new(move || {
            host.lock()
                .unwrap()
                .take()
                .map(|stream| Box::new(stream) as crate::device::DeviceStream)
                .ok_or_else(|| std::io::Error::other("device already taken"))
        });
        let (first, second) = tokio::join!(
            tracker.connect_with(connector.clone()),
            tracker.connect_with(connector.clone())
        );
        first.unwrap();
        second.unwrap();
        tracker.connect_with(connector).await.unwrap();
        assert_eq!(tracker.reader().handler_count(), 1);

        use tokio::io::AsyncWriteExt;
        device
            .write_all(b"not-json\n{\"temp1\": 180.2, \"temp2\": 90}\n")
            .await
            .unwrap();

        let mut live = tracker.read_live_temperature();
        for _ in 0..200 {
            if live.get(&oven("oven2")) == Some(&Some(90.0)) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            live = tracker.read_live_temperature();
        }
        assert_eq!(live.get(&oven("oven1")), Some(&Some(180.2)));
        assert_eq!(live.get(&oven("oven2")), Some(&Some(90.0)));

        tracker.flush().await.unwrap();
        let points = tracker
            .get_session_temperatures(&product("5466"), None, None)
            .await
            .unwrap();
        assert_eq!(points, vec![SeriesPoint { value: 180.2, captured_at: t0() }]);
        tracker.shutdown().await.unwrap();
    }
}
