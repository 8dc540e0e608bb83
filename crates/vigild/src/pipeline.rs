//! Recognition pipeline driver.
//!
//! Pulls frames from a [`StreamSource`], samples them, embeds every face,
//! matches against the registry and lets the visit tracker decide what to
//! emit. Emitted events get a face snapshot and are handed to the recorder
//! and the notifier without waiting on either.

use crate::notify::{Notification, NotifierHandle};
use crate::recorder::RecorderHandle;
use crate::snapshot::{save_face_crop, snapshot_label, snapshot_path};
use crate::status::HealthReporter;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use vigil_core::{
    EuclideanMatcher, FaceEmbedder, FrameSampler, Matcher, Person, PersonId, RecognitionState,
    SightingEvent, TrackerDecision, TrackerPolicy, UnknownSighting, Visit, VisitTracker,
};
use vigil_store::{Store, StoreError};
use vigil_stream::{Frame, StreamError, StreamSource};

/// Where the known-persons registry comes from.
pub trait RegistrySource: Send {
    fn load(&mut self) -> Result<Vec<Person>, StoreError>;
}

impl RegistrySource for Store {
    fn load(&mut self) -> Result<Vec<Person>, StoreError> {
        self.list_persons()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub process_every_n_frames: u32,
    pub tracker: TrackerPolicy,
    /// `None` loads the registry once.
    pub registry_refresh: Option<Duration>,
    pub images_dir: PathBuf,
}

impl PipelineSettings {
    pub fn from_config(config: &vigil_core::Config) -> Self {
        let rec = &config.recognition;
        Self {
            process_every_n_frames: rec.process_every_n_frames,
            tracker: rec.tracker_policy(),
            registry_refresh: (rec.registry_refresh_seconds > 0)
                .then(|| Duration::from_secs(rec.registry_refresh_seconds)),
            images_dir: config.storage.images_dir(),
        }
    }
}

pub struct Pipeline {
    embedder: Box<dyn FaceEmbedder>,
    matcher: EuclideanMatcher,
    tracker: VisitTracker,
    sampler: FrameSampler,
    state: RecognitionState,
    registry: Vec<Person>,
    registry_source: Box<dyn RegistrySource>,
    registry_refresh: Option<Duration>,
    last_refresh: Option<Instant>,
    images_dir: PathBuf,
    recorder: RecorderHandle,
    notifier: NotifierHandle,
    health: HealthReporter,
}

impl Pipeline {
    pub fn new(
        embedder: Box<dyn FaceEmbedder>,
        registry_source: Box<dyn RegistrySource>,
        settings: PipelineSettings,
        recorder: RecorderHandle,
        notifier: NotifierHandle,
        health: HealthReporter,
    ) -> Self {
        Self {
            embedder,
            matcher: EuclideanMatcher::new(settings.tracker.tolerance),
            tracker: VisitTracker::new(settings.tracker),
            sampler: FrameSampler::new(settings.process_every_n_frames),
            state: RecognitionState::new(),
            registry: Vec::new(),
            registry_source,
            registry_refresh: settings.registry_refresh,
            last_refresh: None,
            images_dir: settings.images_dir,
            recorder,
            notifier,
            health,
        }
    }

    pub fn health(&self) -> &HealthReporter {
        &self.health
    }

    /// Process frames until `stop` is raised or the stream ends.
    ///
    /// Returns the stream's fatal error if reconnecting was exhausted.
    pub fn run(
        &mut self,
        stream: &mut StreamSource,
        stop: &watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        tracing::info!(
            known_persons = self.registry.len(),
            tolerance = self.tracker.policy().tolerance,
            "pipeline running"
        );

        loop {
            if *stop.borrow() {
                tracing::info!("stop requested, pipeline exiting");
                return Ok(());
            }
            if self.registry_due() {
                self.refresh_registry();
            }

            let frame = match stream.read_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!("stream ended");
                    return Ok(());
                }
                Err(e) => {
                    self.health.error(&e.to_string());
                    tracing::error!(error = %e, "stream failed");
                    return Err(e);
                }
            };

            let admitted = self.sampler.admit();
            self.health.frame(admitted);
            if admitted {
                self.process_frame(&frame);
            }
        }
    }

    /// Run one frame through detection, matching and deduplication.
    pub fn process_frame(&mut self, frame: &Frame) {
        let faces = match self
            .embedder
            .detect_and_embed(&frame.data, frame.width, frame.height)
        {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, error = %e, "discarding frame");
                return;
            }
        };
        if faces.is_empty() {
            tracing::trace!(sequence = frame.sequence, "no faces");
            return;
        }

        let mut emitted = 0;
        for face in &faces {
            let matched = self.matcher.best_match(&face.embedding, &self.registry);
            let decision =
                self.tracker
                    .observe(&mut self.state, frame.captured_at, &matched, &face.embedding);

            let event = match decision {
                TrackerDecision::Suppressed => {
                    tracing::debug!(
                        person = ?matched.person.as_ref().map(|p| p.id),
                        distance = matched.distance,
                        "sighting suppressed"
                    );
                    continue;
                }
                TrackerDecision::Visit {
                    person_id,
                    person_name,
                    confidence,
                    at,
                } => {
                    let label = snapshot_label(Some(&person_name));
                    SightingEvent::Visit(Visit {
                        person_id,
                        image_path: snapshot_path(&self.images_dir, at, &label, emitted),
                        person_name,
                        timestamp: at,
                        confidence,
                    })
                }
                TrackerDecision::Unknown { at } => SightingEvent::Unknown(UnknownSighting {
                    timestamp: at,
                    image_path: snapshot_path(&self.images_dir, at, &snapshot_label(None), emitted),
                }),
            };
            emitted += 1;

            if let Err(e) = save_face_crop(frame, &face.bbox, event.image_path()) {
                tracing::warn!(
                    path = %event.image_path().display(),
                    error = %e,
                    "snapshot not saved"
                );
            }

            match &event {
                SightingEvent::Visit(v) => tracing::info!(
                    person_id = v.person_id,
                    name = %v.person_name,
                    confidence = v.confidence,
                    "visit"
                ),
                SightingEvent::Unknown(_) => {
                    tracing::info!(distance = matched.distance, "unknown visitor")
                }
            }

            self.health.event(&event);
            self.notifier.notify(Notification::from_event(&event));
            self.recorder.submit(event);
        }
    }

    fn registry_due(&self) -> bool {
        match (self.last_refresh, self.registry_refresh) {
            (None, _) => true,
            (Some(last), Some(every)) => last.elapsed() >= every,
            (Some(_), None) => false,
        }
    }

    /// Reload the registry; on failure the previous one stays in use.
    pub fn refresh_registry(&mut self) {
        self.last_refresh = Some(Instant::now());
        let persons = match self.registry_source.load() {
            Ok(persons) => persons,
            Err(e) => {
                tracing::warn!(error = %e, "registry reload failed, keeping previous registry");
                return;
            }
        };

        let removed: Vec<PersonId> = self
            .registry
            .iter()
            .map(|p| p.id)
            .filter(|id| !persons.iter().any(|p| p.id == *id))
            .collect();
        for id in removed {
            self.state.forget_person(id);
        }

        if persons.len() != self.registry.len() {
            tracing::info!(
                before = self.registry.len(),
                after = persons.len(),
                "registry reloaded"
            );
        }
        self.registry = persons;
        self.health.registry_size(self.registry.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotificationSink, Notifier, NotifyError};
    use crate::recorder::{EventStore, Recorder, RetryPolicy};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use vigil_core::{BoundingBox, DetectedFace, EmbedError, Embedding};
    use vigil_stream::{Connector, FrameSource, ReconnectPolicy, ThreadSleeper};

    const SIZE: u32 = 32;

    /// Unit embedding whose hot axis is the frame's first byte.
    fn code_embedding(code: u8) -> Embedding {
        let mut values = vec![0.0; 4];
        values[code as usize % 4] = 1.0;
        Embedding::new(values)
    }

    /// First byte 0: no face; 255: malformed; anything else: one face.
    struct CodeEmbedder;

    impl FaceEmbedder for CodeEmbedder {
        fn detect_and_embed(
            &mut self,
            rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, EmbedError> {
            match rgb[0] {
                0 => Ok(Vec::new()),
                255 => Err(EmbedError::MalformedFrame("corrupt".into())),
                code => Ok(vec![DetectedFace {
                    embedding: code_embedding(code),
                    bbox: BoundingBox {
                        x: 8.0,
                        y: 8.0,
                        width: 16.0,
                        height: 16.0,
                        confidence: 0.9,
                    },
                }]),
            }
        }
    }

    /// Plays back `(code, seconds)` frames, then raises the stop signal.
    struct Playback {
        frames: Arc<Mutex<VecDeque<(u8, i64)>>>,
        stop: Arc<watch::Sender<bool>>,
        base: DateTime<Utc>,
    }

    struct PlaybackSource {
        frames: Arc<Mutex<VecDeque<(u8, i64)>>>,
        stop: Arc<watch::Sender<bool>>,
        base: DateTime<Utc>,
        sequence: u64,
    }

    impl Connector for Playback {
        fn connect(&mut self) -> Result<Box<dyn FrameSource>, StreamError> {
            Ok(Box::new(PlaybackSource {
                frames: self.frames.clone(),
                stop: self.stop.clone(),
                base: self.base,
                sequence: 0,
            }))
        }

        fn describe(&self) -> String {
            "playback".into()
        }
    }

    impl FrameSource for PlaybackSource {
        fn read_frame(&mut self) -> Result<Option<Frame>, StreamError> {
            let next = self.frames.lock().unwrap().pop_front();
            let (code, secs) = next.unwrap_or_else(|| {
                let _ = self.stop.send(true);
                (0, 0)
            });
            self.sequence += 1;
            Ok(Some(Frame {
                data: vec![code; (SIZE * SIZE * 3) as usize],
                width: SIZE,
                height: SIZE,
                captured_at: self.base + chrono::Duration::seconds(secs),
                sequence: self.sequence,
            }))
        }
    }

    #[derive(Clone, Default)]
    struct Collected(Arc<Mutex<Vec<SightingEvent>>>);

    impl EventStore for Collected {
        fn record_visit(&mut self, visit: &Visit) -> Result<i64, StoreError> {
            self.0.lock().unwrap().push(SightingEvent::Visit(visit.clone()));
            Ok(1)
        }

        fn record_unknown(&mut self, sighting: &UnknownSighting) -> Result<i64, StoreError> {
            self.0
                .lock()
                .unwrap()
                .push(SightingEvent::Unknown(sighting.clone()));
            Ok(1)
        }
    }

    struct Titles(Arc<Mutex<Vec<String>>>);

    impl NotificationSink for Titles {
        fn name(&self) -> &str {
            "titles"
        }

        fn notify(&mut self, n: &Notification) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(n.title.clone());
            Ok(())
        }
    }

    #[derive(Clone)]
    struct SharedRegistry {
        persons: Arc<Mutex<Vec<Person>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl RegistrySource for SharedRegistry {
        fn load(&mut self) -> Result<Vec<Person>, StoreError> {
            if *self.fail.lock().unwrap() {
                return Err(StoreError::PersonNotFound(0));
            }
            Ok(self.persons.lock().unwrap().clone())
        }
    }

    fn person(id: PersonId, name: &str, code: u8) -> Person {
        Person {
            id,
            name: name.into(),
            embeddings: vec![code_embedding(code)],
            notes: String::new(),
            first_seen: None,
            last_seen: None,
            visit_count: 0,
        }
    }

    fn settings(images_dir: PathBuf, every_n: u32) -> PipelineSettings {
        let mut config = vigil_core::Config::default();
        config.recognition.process_every_n_frames = every_n;
        config.recognition.visit_cooldown_seconds = 300;
        config.recognition.unknown_cooldown_seconds = 60;
        PipelineSettings {
            images_dir,
            registry_refresh: None,
            ..PipelineSettings::from_config(&config)
        }
    }

    struct Harness {
        pipeline: Pipeline,
        recorder: Recorder,
        notifier: Notifier,
        events: Collected,
        titles: Arc<Mutex<Vec<String>>>,
        registry: SharedRegistry,
        dir: PathBuf,
    }

    fn harness(persons: Vec<Person>, every_n: u32) -> Harness {
        let dir = std::env::temp_dir().join(format!("vigil-pipeline-{}", uuid::Uuid::new_v4()));
        let events = Collected::default();
        let titles = Arc::new(Mutex::new(Vec::new()));
        let registry = SharedRegistry {
            persons: Arc::new(Mutex::new(persons)),
            fail: Arc::new(Mutex::new(false)),
        };
        let recorder = Recorder::spawn(events.clone(), RetryPolicy::default()).unwrap();
        let notifier = Notifier::spawn(vec![Box::new(Titles(titles.clone()))], 16).unwrap();
        let (health, _rx) = HealthReporter::new("playback".into());
        let pipeline = Pipeline::new(
            Box::new(CodeEmbedder),
            Box::new(registry.clone()),
            settings(dir.join("images"), every_n),
            recorder.handle(),
            notifier.handle(),
            health,
        );
        Harness {
            pipeline,
            recorder,
            notifier,
            events,
            titles,
            registry,
            dir,
        }
    }

    fn play(h: &mut Harness, frames: &[(u8, i64)]) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let connector = Playback {
            frames: Arc::new(Mutex::new(frames.iter().copied().collect())),
            stop: Arc::new(stop_tx),
            base: Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
        };
        let mut stream = StreamSource::open(
            Box::new(connector),
            ReconnectPolicy::default(),
            Box::new(ThreadSleeper),
        )
        .unwrap();
        h.pipeline.run(&mut stream, &stop_rx).unwrap();
    }

    /// Stop the workers and return what reached them.
    fn finish(h: Harness) -> (Vec<SightingEvent>, Vec<String>, PathBuf) {
        let Harness {
            pipeline,
            recorder,
            notifier,
            events,
            titles,
            dir,
            ..
        } = h;
        drop(pipeline);
        recorder.shutdown();
        notifier.shutdown();
        let events = events.0.lock().unwrap().clone();
        let titles = titles.lock().unwrap().clone();
        (events, titles, dir)
    }

    #[test]
    fn test_end_to_end_dedup() {
        let mut h = harness(vec![person(1, "Asha Rao", 1)], 1);
        // Asha lingers, a stranger lingers, nothing, then Asha returns much later.
        play(
            &mut h,
            &[(1, 0), (1, 1), (1, 2), (2, 3), (2, 4), (0, 5), (1, 400)],
        );
        let (events, titles, dir) = finish(h);

        assert_eq!(events.len(), 3);
        match (&events[0], &events[1], &events[2]) {
            (SightingEvent::Visit(a), SightingEvent::Unknown(_), SightingEvent::Visit(b)) => {
                assert_eq!(a.person_id, 1);
                assert_eq!(b.person_id, 1);
                assert_eq!((b.timestamp - a.timestamp).num_seconds(), 400);
                assert!(a
                    .image_path
                    .to_string_lossy()
                    .ends_with("_Asha_Rao.jpg"));
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(events[1].image_path().to_string_lossy().ends_with("_Unknown.jpg"));
        assert!(events.iter().all(|e| e.image_path().exists()));
        assert_eq!(
            titles,
            vec![
                "Asha Rao detected",
                "Unknown person detected",
                "Asha Rao detected"
            ]
        );
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_sampling_skips_frames() {
        let mut h = harness(vec![person(1, "Asha", 1)], 3);
        // Only the 3rd frame is processed; it is the stranger.
        play(&mut h, &[(1, 0), (1, 1), (2, 2), (1, 3)]);
        let (events, _, dir) = finish(h);

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SightingEvent::Unknown(_)));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_malformed_frame_discarded() {
        let mut h = harness(vec![person(1, "Asha", 1)], 1);
        play(&mut h, &[(255, 0), (1, 1)]);
        let (events, _, dir) = finish(h);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp().timestamp() % 60, 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_empty_registry_only_unknowns() {
        let mut h = harness(Vec::new(), 1);
        play(&mut h, &[(1, 0), (1, 10), (2, 11), (1, 70)]);
        let (events, _, dir) = finish(h);

        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| matches!(e, SightingEvent::Unknown(_))));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_registry_refresh() {
        let mut h = harness(vec![person(1, "Asha", 1)], 1);
        h.pipeline.refresh_registry();
        assert_eq!(h.pipeline.registry.len(), 1);

        h.registry.persons.lock().unwrap().push(person(2, "Bilal", 2));
        h.pipeline.refresh_registry();
        assert_eq!(h.pipeline.registry.len(), 2);

        *h.registry.fail.lock().unwrap() = true;
        h.pipeline.refresh_registry();
        assert_eq!(h.pipeline.registry.len(), 2);

        *h.registry.fail.lock().unwrap() = false;
        h.registry.persons.lock().unwrap().clear();
        h.pipeline.refresh_registry();
        assert!(h.pipeline.registry.is_empty());

        let (_, _, dir) = finish(h);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_removed_person_forgotten() {
        let mut h = harness(vec![person(1, "Asha", 1)], 1);
        play(&mut h, &[(1, 0)]);
        assert!(h.pipeline.state.last_visit(1).is_some());

        h.registry.persons.lock().unwrap().clear();
        h.pipeline.refresh_registry();
        assert!(h.pipeline.state.last_visit(1).is_none());

        let (_, _, dir) = finish(h);
        let _ = std::fs::remove_dir_all(dir);
    }
}
