//! Keeps the pipeline alive across fatal stream failures.

use crate::pipeline::Pipeline;
use std::time::Duration;
use tokio::sync::watch;
use vigil_stream::{
    Connector, ReconnectPolicy, Sleeper, StateObserver, StreamError, StreamSource, WatchSleeper,
};

pub struct Supervisor {
    pub restart_on_failure: bool,
    pub restart_delay: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Supervisor {
    pub fn from_config(config: &vigil_core::Config) -> Self {
        Self {
            restart_on_failure: config.supervisor.restart_on_failure,
            restart_delay: Duration::from_secs(config.supervisor.restart_delay_seconds),
            reconnect: vigil_stream::reconnect_policy(&config.dvr),
        }
    }

    /// Run `pipeline` on fresh streams from `connect` until `stop` is raised.
    ///
    /// The pipeline (and its recognition state) survives restarts. Without
    /// `restart_on_failure` the first fatal stream error is returned.
    pub fn run(
        &self,
        pipeline: &mut Pipeline,
        mut connect: impl FnMut() -> Box<dyn Connector>,
        stop: watch::Receiver<bool>,
    ) -> Result<(), StreamError> {
        loop {
            if *stop.borrow() {
                return Ok(());
            }

            let health = pipeline.health().clone();
            let observer: StateObserver = Box::new(move |state| health.set_state(state));
            let result = StreamSource::open_observed(
                connect(),
                self.reconnect,
                Box::new(WatchSleeper::new(stop.clone())),
                Some(observer),
            )
            .and_then(|mut stream| {
                let result = pipeline.run(&mut stream, &stop);
                stream.close();
                result
            });

            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            pipeline.health().error(&error.to_string());
            if !self.restart_on_failure {
                return Err(error);
            }

            tracing::error!(
                error = %error,
                delay_secs = self.restart_delay.as_secs(),
                "pipeline failed, restarting"
            );
            if !WatchSleeper::new(stop.clone()).sleep(self.restart_delay) {
                return Ok(());
            }
            pipeline.health().restarted();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifierHandle;
    use crate::pipeline::{PipelineSettings, RegistrySource};
    use crate::recorder::{Recorder, RetryPolicy};
    use crate::status::HealthReporter;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use vigil_core::{DetectedFace, EmbedError, FaceEmbedder, Person};
    use vigil_store::{Store, StoreError};
    use vigil_stream::FrameSource;

    struct NoFaces;

    impl FaceEmbedder for NoFaces {
        fn detect_and_embed(
            &mut self,
            _rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, EmbedError> {
            Ok(Vec::new())
        }
    }

    struct NoPersons;

    impl RegistrySource for NoPersons {
        fn load(&mut self) -> Result<Vec<Person>, StoreError> {
            Ok(Vec::new())
        }
    }

    /// Always refuses; counts attempts.
    struct Unreachable(Arc<AtomicU32>);

    impl Connector for Unreachable {
        fn connect(&mut self) -> Result<Box<dyn FrameSource>, StreamError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(StreamError::Connect("no route to host".into()))
        }

        fn describe(&self) -> String {
            "unreachable".into()
        }
    }

    fn supervisor(restart: bool) -> Supervisor {
        Supervisor {
            restart_on_failure: restart,
            restart_delay: Duration::from_millis(1),
            reconnect: ReconnectPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        }
    }

    fn pipeline() -> (Pipeline, Recorder, HealthReporter) {
        let recorder = Recorder::spawn(Store::open_in_memory().unwrap(), RetryPolicy::default())
            .unwrap();
        let (health, _rx) = HealthReporter::new("test".into());
        let settings = PipelineSettings::from_config(&vigil_core::Config::default());
        let pipeline = Pipeline::new(
            Box::new(NoFaces),
            Box::new(NoPersons),
            settings,
            recorder.handle(),
            NotifierHandle::disabled(),
            health.clone(),
        );
        (pipeline, recorder, health)
    }

    #[test]
    fn test_failure_returned_without_restart() {
        let (mut pipeline, recorder, health) = pipeline();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result = supervisor(false).run(
            &mut pipeline,
            || Box::new(Unreachable(counter.clone())) as Box<dyn Connector>,
            stop_rx,
        );

        assert!(matches!(result, Err(StreamError::Exhausted { attempts: 2, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let current = health.current();
        assert_eq!(current.state, vigil_stream::StreamState::Failed);
        assert!(current.last_error.is_some());

        drop(pipeline);
        recorder.shutdown();
    }

    #[test]
    fn test_restarts_until_stopped() {
        let (mut pipeline, recorder, health) = pipeline();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut restarts = 0;

        let result = supervisor(true).run(
            &mut pipeline,
            || {
                restarts += 1;
                if restarts == 3 {
                    let _ = stop_tx.send(true);
                }
                Box::new(Unreachable(counter.clone())) as Box<dyn Connector>
            },
            stop_rx,
        );

        assert!(result.is_ok());
        assert_eq!(health.current().restarts, 2);
        assert!(attempts.load(Ordering::SeqCst) >= 5);

        drop(pipeline);
        recorder.shutdown();
    }
}
