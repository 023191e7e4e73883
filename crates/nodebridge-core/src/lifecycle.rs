//! Foreground/background notifications forwarded to the runtime.

use crate::channel::{ChannelName, PAUSE_EVENT, RESUME_EVENT};
use crate::engine::NodeEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BackgroundTaskId(pub u64);

pub type ExpirationHandler = Box<dyn FnOnce() + Send + 'static>;

/// Host facility that keeps the application running briefly after it moves
/// to the background.
pub trait BackgroundTaskHost: Send + Sync {
    /// `on_expire` is called if the host cuts the extension short. The window
    /// then ends through the usual [`BackgroundTaskHost::end_background_task`].
    fn begin_background_task(&self, on_expire: ExpirationHandler) -> BackgroundTaskId;
    fn end_background_task(&self, id: BackgroundTaskId);
}

/// For hosts without an execution-extension concept.
#[derive(Debug, Default)]
pub struct NoopTaskHost;

impl BackgroundTaskHost for NoopTaskHost {
    fn begin_background_task(&self, _on_expire: ExpirationHandler) -> BackgroundTaskId {
        BackgroundTaskId(0)
    }

    fn end_background_task(&self, _id: BackgroundTaskId) {}
}

struct GraceInner {
    id: OnceLock<BackgroundTaskId>,
    host: Arc<dyn BackgroundTaskHost>,
    ended: AtomicBool,
    reported: AtomicBool,
    wake: Mutex<Option<Sender<()>>>,
}

impl GraceInner {
    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.report_end();
    }

    /// The host hears about the end exactly once, and only after it handed
    /// out an id.
    fn report_end(&self) {
        let Some(id) = self.id.get().copied() else {
            return;
        };
        if self.reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.host.end_background_task(id);
        debug!(task = id.0, "background grace window ended");
    }
}

/// An open execution extension. It ends once, on whichever comes first:
/// the window elapsing, [`GraceWindow::complete`], or the host expiring it.
#[derive(Clone)]
pub struct GraceWindow {
    inner: Arc<GraceInner>,
}

impl GraceWindow {
    pub fn id(&self) -> BackgroundTaskId {
        self.inner.id.get().copied().unwrap_or(BackgroundTaskId(0))
    }

    pub fn complete(&self) {
        self.inner.end();
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }
}

pub struct LifecycleSignal {
    engine: NodeEngine,
    host: Arc<dyn BackgroundTaskHost>,
    grace_window: Duration,
}

impl LifecycleSignal {
    pub fn new(
        engine: NodeEngine,
        host: Arc<dyn BackgroundTaskHost>,
        grace_window: Duration,
    ) -> Self {
        Self {
            engine,
            host,
            grace_window,
        }
    }

    pub fn grace_window(&self) -> Duration {
        self.grace_window
    }

    fn is_live(&self) -> bool {
        self.engine.is_started() && self.engine.is_ready()
    }

    /// Returns whether `resume` was sent.
    pub fn on_foreground(&self) -> bool {
        if !self.is_live() {
            return false;
        }
        self.engine.send_message(ChannelName::App, RESUME_EVENT, &[]);
        true
    }

    pub fn on_background(&self) -> Option<GraceWindow> {
        if !self.is_live() {
            return None;
        }
        self.engine.send_message(ChannelName::App, PAUSE_EVENT, &[]);

        let (tx, rx) = mpsc::channel::<()>();
        let window = GraceWindow {
            inner: Arc::new(GraceInner {
                id: OnceLock::new(),
                host: self.host.clone(),
                ended: AtomicBool::new(false),
                reported: AtomicBool::new(false),
                wake: Mutex::new(Some(tx)),
            }),
        };
        let expiring = window.inner.clone();
        let id = self.host.begin_background_task(Box::new(move || expiring.end()));
        let _ = window.inner.id.set(id);
        if window.is_ended() {
            window.inner.report_end();
            return Some(window);
        }
        debug!(
            task = id.0,
            grace = ?self.grace_window,
            "background grace window started"
        );

        let timer = window.inner.clone();
        let grace = self.grace_window;
        let spawned = thread::Builder::new()
            .name("nodejs-grace-window".to_string())
            .spawn(move || {
                let _ = rx.recv_timeout(grace);
                timer.end();
            });
        if spawned.is_err() {
            window.complete();
        }

        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DecodedMessage, APP_CHANNEL};
    use crate::engine::StartRequest;
    use crate::testing::{ready_frame, EngineFixture, MemoryProcess};
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingTaskHost {
        next: Mutex<u64>,
        begun: Mutex<Vec<BackgroundTaskId>>,
        ended: Mutex<Vec<BackgroundTaskId>>,
        expirations: Mutex<Vec<ExpirationHandler>>,
        expire_immediately: bool,
    }

    impl RecordingTaskHost {
        fn expire_all(&self) {
            let handlers = std::mem::take(&mut *self.expirations.lock().expect("expire lock"));
            for handler in handlers {
                handler();
            }
        }
    }

    impl BackgroundTaskHost for RecordingTaskHost {
        fn begin_background_task(&self, on_expire: ExpirationHandler) -> BackgroundTaskId {
            let mut next = self.next.lock().expect("next lock");
            *next += 1;
            let id = BackgroundTaskId(*next);
            self.begun.lock().expect("begun lock").push(id);
            if self.expire_immediately {
                on_expire();
            } else {
                self.expirations.lock().expect("expire lock").push(on_expire);
            }
            id
        }

        fn end_background_task(&self, id: BackgroundTaskId) {
            self.ended.lock().expect("ended lock").push(id);
        }
    }

    fn ready_fixture(name: &str) -> EngineFixture {
        let fixture = EngineFixture::new(name, MemoryProcess::new(vec![ready_frame()]));
        fixture
            .engine
            .start(StartRequest::new("nodejs"), Arc::new(|_: DecodedMessage| {}))
            .wait()
            .expect("start engine");
        fixture.engine.join();
        assert!(fixture.engine.is_ready());
        fixture
    }

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let started_at = Instant::now();
        while started_at.elapsed() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn nothing_is_sent_before_ready() {
        let fixture = EngineFixture::new("signal_not_ready", MemoryProcess::new(vec![]));
        let host = Arc::new(RecordingTaskHost::default());
        let signal =
            LifecycleSignal::new(fixture.engine.clone(), host.clone(), DEFAULT_GRACE_WINDOW);

        assert!(!signal.on_foreground());
        assert!(signal.on_background().is_none());
        assert!(fixture.process.sent().is_empty());
        assert!(host.begun.lock().expect("begun lock").is_empty());
    }

    #[test]
    fn foreground_sends_resume_on_app_channel() {
        let fixture = ready_fixture("signal_resume");
        let signal = LifecycleSignal::new(
            fixture.engine.clone(),
            Arc::new(NoopTaskHost),
            DEFAULT_GRACE_WINDOW,
        );

        assert!(signal.on_foreground());
        assert_eq!(
            fixture.process.sent_events(),
            vec![(APP_CHANNEL.to_string(), "resume".to_string())]
        );
    }

    #[test]
    fn background_sends_pause_and_ends_after_grace_window() {
        let fixture = ready_fixture("signal_pause");
        let host = Arc::new(RecordingTaskHost::default());
        let signal = LifecycleSignal::new(
            fixture.engine.clone(),
            host.clone(),
            Duration::from_millis(20),
        );

        let window = signal.on_background().expect("grace window opened");
        assert_eq!(
            fixture.process.sent_events(),
            vec![(APP_CHANNEL.to_string(), "pause".to_string())]
        );
        assert_eq!(*host.begun.lock().expect("begun lock"), vec![window.id()]);

        assert!(wait_until(Duration::from_secs(5), || {
            !host.ended.lock().expect("ended lock").is_empty()
        }));
        assert!(window.is_ended());
        assert_eq!(*host.ended.lock().expect("ended lock"), vec![window.id()]);
    }

    #[test]
    fn explicit_completion_ends_once_before_window() {
        let fixture = ready_fixture("signal_complete");
        let host = Arc::new(RecordingTaskHost::default());
        let signal = LifecycleSignal::new(
            fixture.engine.clone(),
            host.clone(),
            Duration::from_secs(60),
        );

        let window = signal.on_background().expect("grace window opened");
        window.complete();
        window.complete();
        assert!(window.is_ended());

        thread::sleep(Duration::from_millis(20));
        assert_eq!(host.ended.lock().expect("ended lock").len(), 1);
    }

    #[test]
    fn host_expiry_ends_window_once() {
        let fixture = ready_fixture("signal_expire");
        let host = Arc::new(RecordingTaskHost::default());
        let signal = LifecycleSignal::new(
            fixture.engine.clone(),
            host.clone(),
            Duration::from_millis(50),
        );

        let window = signal.on_background().expect("grace window opened");
        assert!(!window.is_ended());
        host.expire_all();
        assert!(window.is_ended());
        assert_eq!(*host.ended.lock().expect("ended lock"), vec![window.id()]);

        window.complete();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(host.ended.lock().expect("ended lock").len(), 1);
    }

    #[test]
    fn expiry_during_begin_still_reports_end() {
        let fixture = ready_fixture("signal_expire_early");
        let host = Arc::new(RecordingTaskHost {
            expire_immediately: true,
            ..RecordingTaskHost::default()
        });
        let signal =
            LifecycleSignal::new(fixture.engine.clone(), host.clone(), DEFAULT_GRACE_WINDOW);

        let window = signal.on_background().expect("grace window opened");
        assert!(window.is_ended());
        assert_eq!(window.id(), BackgroundTaskId(1));
        assert_eq!(
            *host.ended.lock().expect("ended lock"),
            vec![BackgroundTaskId(1)]
        );
    }
}
