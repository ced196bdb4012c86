#![forbid(unsafe_code)]

// Transcode module - per-room HLS transcoder processes fed with presenter media

pub mod config;
pub mod pipe;
pub mod types;
pub mod viewers;

pub use config::TranscodeConfig;
pub use pipe::ChunkPipe;
pub use types::{ChunkStatus, SessionState, StreamEvent, TranscodeError, TranscodeResult};
pub use viewers::ViewerTracker;

use crate::metrics::ServerMetrics;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, RwLock as StdRwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// How many times `start` re-examines a session it lost to a concurrent stop.
const START_ATTEMPTS: usize = 3;
/// Upper bound on reaping a process after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

struct SessionInner {
    state: SessionState,
    /// Chunks received before the process input was open
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    pipe: Option<Arc<ChunkPipe>>,
    playlist_url: Option<String>,
    terminate: Option<oneshot::Sender<()>>,
}

/// One room's transcoder: queued input, process input pipe and lifecycle state.
pub struct TranscodeSession {
    room_code: String,
    generation: u64,
    output_dir: PathBuf,
    /// Serializes start attempts so concurrent requests share one process
    start_gate: Arc<TokioMutex<()>>,
    inner: StdMutex<SessionInner>,
    exited: watch::Sender<bool>,
}

impl TranscodeSession {
    fn new(room_code: &str, generation: u64, output_dir: PathBuf) -> Self {
        let (exited, _) = watch::channel(false);
        Self {
            room_code: room_code.to_string(),
            generation,
            output_dir,
            start_gate: Arc::new(TokioMutex::new(())),
            inner: StdMutex::new(SessionInner {
                state: SessionState::Idle,
                pending: VecDeque::new(),
                pending_bytes: 0,
                pipe: None,
                playlist_url: None,
                terminate: None,
            }),
            exited,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }
}

enum StartClaim {
    Running(String),
    Launch(Arc<TranscodeSession>, OwnedMutexGuard<()>),
}

/// Owns every room's transcoder process.
///
/// At most one session exists per room code. Start requests are idempotent,
/// failures are reported both to the caller and on the event channel, and
/// output directories are removed a while after the process exits.
pub struct TranscodeSupervisor {
    config: TranscodeConfig,
    sessions: StdRwLock<HashMap<String, Arc<TranscodeSession>>>,
    /// Deferred output removals, tagged with the session generation
    cleanups: StdMutex<HashMap<String, (u64, JoinHandle<()>)>>,
    viewers: ViewerTracker,
    events: mpsc::UnboundedSender<StreamEvent>,
    auto_stop_rx: StdMutex<Option<mpsc::UnboundedReceiver<String>>>,
    next_generation: AtomicU64,
    metrics: ServerMetrics,
}

impl TranscodeSupervisor {
    /// Creates the supervisor and the receiver for its stream events.
    pub fn new(
        config: TranscodeConfig,
        metrics: ServerMetrics,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let viewers = ViewerTracker::new(config.auto_stop_delay, config.viewer_idle_timeout, stop_tx);
        let supervisor = Arc::new(Self {
            config,
            sessions: StdRwLock::new(HashMap::new()),
            cleanups: StdMutex::new(HashMap::new()),
            viewers,
            events: events_tx,
            auto_stop_rx: StdMutex::new(Some(stop_rx)),
            next_generation: AtomicU64::new(1),
            metrics,
        });
        (supervisor, events_rx)
    }

    pub fn config(&self) -> &TranscodeConfig {
        &self.config
    }

    pub fn viewers(&self) -> &ViewerTracker {
        &self.viewers
    }

    fn session(&self, room_code: &str) -> Option<Arc<TranscodeSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(room_code).cloned()
    }

    fn session_or_idle(&self, room_code: &str) -> Arc<TranscodeSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session = sessions.entry(room_code.to_string()).or_insert_with(|| {
            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            Arc::new(TranscodeSession::new(
                room_code,
                generation,
                self.config.output_dir(room_code),
            ))
        });
        Arc::clone(session)
    }

    fn remove_session(&self, session: &TranscodeSession) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let is_current = sessions
            .get(&session.room_code)
            .map_or(false, |s| s.generation == session.generation);
        if is_current {
            sessions.remove(&session.room_code);
        }
    }

    pub fn state(&self, room_code: &str) -> Option<SessionState> {
        self.session(room_code).map(|s| s.state())
    }

    pub fn is_streaming(&self, room_code: &str) -> bool {
        self.state(room_code) == Some(SessionState::Streaming)
    }

    pub fn playlist_url(&self, room_code: &str) -> Option<String> {
        self.session(room_code).and_then(|s| {
            let inner = s.lock();
            inner.playlist_url.clone()
        })
    }

    /// Sessions that are starting or streaming.
    pub fn active_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().filter(|s| s.state().is_active()).count()
    }

    fn emit(&self, event: StreamEvent) {
        if self.events.send(event).is_err() {
            debug!("Stream event dropped, no listener");
        }
    }

    /// Hand a media chunk to the room's transcoder.
    ///
    /// Before the process input is open, chunks are queued (oldest dropped
    /// past the configured cap). Afterwards they go straight to the input
    /// pipe, which reports `Busy` above its high-water mark.
    ///
    /// # Errors
    /// `NotStreaming` while the session is shutting down.
    pub fn write_chunk(&self, room_code: &str, chunk: Bytes) -> TranscodeResult<ChunkStatus> {
        let session = self.session_or_idle(room_code);
        let mut inner = session.lock();
        if matches!(inner.state, SessionState::Draining | SessionState::Stopped) {
            return Err(TranscodeError::NotStreaming(room_code.to_string()));
        }
        if let Some(pipe) = &inner.pipe {
            return pipe
                .write(chunk)
                .ok_or_else(|| TranscodeError::NotStreaming(room_code.to_string()));
        }

        inner.pending_bytes += chunk.len();
        inner.pending.push_back(chunk);
        while inner.pending_bytes > self.config.max_pending_bytes && inner.pending.len() > 1 {
            if let Some(dropped) = inner.pending.pop_front() {
                inner.pending_bytes -= dropped.len();
                warn!(
                    "Queued input for room {} over {} bytes, dropped oldest chunk",
                    room_code, self.config.max_pending_bytes
                );
            }
        }
        Ok(ChunkStatus::Accepted)
    }

    /// Wait until the room's input pipe has no buffered bytes.
    /// Returns immediately when there is no open pipe.
    pub async fn wait_drained(&self, room_code: &str) {
        let pipe = self.session(room_code).and_then(|s| {
            let inner = s.lock();
            inner.pipe.clone()
        });
        if let Some(pipe) = pipe {
            pipe.wait_drained().await;
        }
    }

    /// Start (or join an in-flight start of) the room's transcoder.
    ///
    /// Returns the playlist URL once the playlist file exists.
    ///
    /// # Errors
    /// `SpawnError`, `StdinTimeout`, `PlaylistTimeout` or `SubprocessCrash`
    /// when the process cannot be brought up; `Cancelled` when a stop arrived
    /// first.
    pub async fn start(self: &Arc<Self>, room_code: &str) -> TranscodeResult<String> {
        let (session, _gate) = match self.claim_start(room_code).await? {
            StartClaim::Running(url) => {
                debug!("Transcoder for room {} already streaming", room_code);
                self.emit(StreamEvent::Ready {
                    room_code: room_code.to_string(),
                    playlist_url: url.clone(),
                });
                return Ok(url);
            }
            StartClaim::Launch(session, gate) => (session, gate),
        };

        let started = Instant::now();
        match self.launch(&session).await {
            Ok(url) => {
                self.metrics.inc_streams_started();
                self.metrics.observe_stream_startup(started.elapsed());
                info!("HLS output for room {} ready at {}", room_code, url);
                self.emit(StreamEvent::Ready {
                    room_code: room_code.to_string(),
                    playlist_url: url.clone(),
                });
                Ok(url)
            }
            Err(e) => {
                self.abandon(&session);
                if let TranscodeError::Cancelled(_) = e {
                    info!("Transcoder start for room {} cancelled", room_code);
                } else {
                    self.metrics.inc_stream_failures();
                    error!("Failed to start transcoder for room {}: {}", room_code, e);
                    self.emit(StreamEvent::Failed {
                        room_code: room_code.to_string(),
                        error: e.clone(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn claim_start(&self, room_code: &str) -> TranscodeResult<StartClaim> {
        for _ in 0..START_ATTEMPTS {
            if let Some(existing) = self.session(room_code) {
                if existing.state() == SessionState::Draining {
                    self.wait_exited(&existing).await;
                }
            }

            let session = self.session_or_idle(room_code);
            let gate = Arc::clone(&session.start_gate).lock_owned().await;
            let running = {
                let mut inner = session.lock();
                match inner.state {
                    SessionState::Idle => {
                        inner.state = SessionState::Starting;
                        None
                    }
                    SessionState::Streaming => Some(inner.playlist_url.clone()),
                    _ => Some(None),
                }
            };
            match running {
                None => return Ok(StartClaim::Launch(session, gate)),
                Some(Some(url)) => return Ok(StartClaim::Running(url)),
                // Lost to a stop or a failed attempt; look again
                Some(None) => continue,
            }
        }
        Err(TranscodeError::SpawnError(format!(
            "previous transcoder for room {room_code} is still shutting down"
        )))
    }

    async fn launch(self: &Arc<Self>, session: &Arc<TranscodeSession>) -> TranscodeResult<String> {
        let room_code = session.room_code.as_str();
        self.cancel_cleanup(room_code);
        reset_output_dir(&session.output_dir).await?;

        let playlist = session.output_dir.join(&self.config.playlist_name);
        let args = self.config.command_args(&session.output_dir, &playlist);
        info!(
            "Starting transcoder for room {}: {} {}",
            room_code,
            self.config.program,
            args.join(" ")
        );

        let mut child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::SpawnError(format!("{}: {}", self.config.program, e)))?;

        let Some(pid) = child.id() else {
            return Err(TranscodeError::SpawnError(
                "process exited before it could be tracked".into(),
            ));
        };
        let Some(mut stdin) = child.stdin.take() else {
            kill_child(&mut child).await;
            return Err(TranscodeError::SpawnError("stdin was not captured".into()));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(room_code.to_string(), stderr));
        }

        // Prime the input with what arrived before the process existed
        let primed: Vec<Bytes> = {
            let mut inner = session.lock();
            inner.pending_bytes = 0;
            inner.pending.drain(..).collect()
        };
        let prime = async {
            for chunk in &primed {
                stdin.write_all(chunk).await?;
            }
            stdin.flush().await
        };
        match timeout(self.config.stdin_timeout, prime).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                kill_child(&mut child).await;
                return Err(TranscodeError::SubprocessCrash(format!("input closed: {e}")));
            }
            Err(_) => {
                kill_child(&mut child).await;
                return Err(TranscodeError::StdinTimeout(self.config.stdin_timeout));
            }
        }

        let (pipe, _writer) =
            ChunkPipe::spawn(room_code.to_string(), stdin, self.config.high_water_bytes);
        let installed = {
            let mut inner = session.lock();
            if inner.state == SessionState::Starting {
                while let Some(chunk) = inner.pending.pop_front() {
                    pipe.write(chunk);
                }
                inner.pending_bytes = 0;
                inner.pipe = Some(Arc::clone(&pipe));
                true
            } else {
                false
            }
        };
        if !installed {
            pipe.close();
            kill_child(&mut child).await;
            return Err(TranscodeError::Cancelled(room_code.to_string()));
        }
        debug!(
            "Transcoder for room {} running as pid {} ({} chunks primed)",
            room_code,
            pid,
            primed.len()
        );

        if let Err(e) = self.wait_for_playlist(session, &mut child, &playlist).await {
            pipe.close();
            kill_child(&mut child).await;
            return Err(e);
        }

        let url = self.config.playlist_url(room_code);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let promoted = {
            let mut inner = session.lock();
            if inner.state == SessionState::Starting {
                inner.state = SessionState::Streaming;
                inner.playlist_url = Some(url.clone());
                inner.terminate = Some(terminate_tx);
                true
            } else {
                false
            }
        };
        if !promoted {
            pipe.close();
            kill_child(&mut child).await;
            return Err(TranscodeError::Cancelled(room_code.to_string()));
        }

        self.spawn_monitor(Arc::clone(session), child, terminate_rx);
        Ok(url)
    }

    async fn wait_for_playlist(
        &self,
        session: &TranscodeSession,
        child: &mut Child,
        playlist: &Path,
    ) -> TranscodeResult<()> {
        let deadline = Instant::now() + self.config.playlist_timeout;
        loop {
            if tokio::fs::try_exists(playlist).await.unwrap_or(false) {
                return Ok(());
            }
            if session.state() != SessionState::Starting {
                return Err(TranscodeError::Cancelled(session.room_code.clone()));
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(TranscodeError::SubprocessCrash(describe_exit(status)))
                }
                Ok(None) => {}
                Err(e) => return Err(TranscodeError::SubprocessCrash(e.to_string())),
            }
            if Instant::now() >= deadline {
                return Err(TranscodeError::PlaylistTimeout(self.config.playlist_timeout));
            }
            sleep(self.config.playlist_poll_interval).await;
        }
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        session: Arc<TranscodeSession>,
        mut child: Child,
        terminate: oneshot::Receiver<()>,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = terminate => {
                    match timeout(supervisor.config.stop_grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!(
                                "Transcoder for room {} still running {:?} after end of input, killing",
                                session.room_code, supervisor.config.stop_grace
                            );
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };
            supervisor.on_exit(&session, status);
        });
    }

    fn on_exit(self: &Arc<Self>, session: &Arc<TranscodeSession>, status: std::io::Result<ExitStatus>) {
        let (requested, pipe) = {
            let mut inner = session.lock();
            let requested = inner.state == SessionState::Draining;
            inner.state = SessionState::Stopped;
            inner.playlist_url = None;
            inner.terminate = None;
            (requested, inner.pipe.take())
        };
        if let Some(pipe) = pipe {
            pipe.close();
        }
        self.remove_session(session);
        session.exited.send_replace(true);
        self.viewers.forget(&session.room_code);

        let room_code = session.room_code.clone();
        let delay = match status {
            Ok(status) if requested => {
                info!("Transcoder for room {} stopped ({})", room_code, describe_exit(status));
                self.config.cleanup_delay
            }
            Ok(status) => {
                let detail = describe_exit(status);
                error!("Transcoder for room {} exited unexpectedly ({})", room_code, detail);
                self.metrics.inc_stream_failures();
                self.emit(StreamEvent::Crashed { room_code, detail });
                self.config.cleanup_delay
            }
            Err(e) => {
                error!("Lost track of transcoder for room {}: {}", room_code, e);
                if !requested {
                    self.metrics.inc_stream_failures();
                    self.emit(StreamEvent::Crashed {
                        room_code,
                        detail: e.to_string(),
                    });
                }
                self.config.error_cleanup_delay
            }
        };
        self.schedule_cleanup(session, delay);
    }

    /// Tear down a session whose start failed or was cancelled.
    fn abandon(self: &Arc<Self>, session: &Arc<TranscodeSession>) {
        let pipe = {
            let mut inner = session.lock();
            inner.state = SessionState::Stopped;
            inner.pending.clear();
            inner.pending_bytes = 0;
            inner.playlist_url = None;
            inner.terminate = None;
            inner.pipe.take()
        };
        if let Some(pipe) = pipe {
            pipe.close();
        }
        self.remove_session(session);
        session.exited.send_replace(true);
        self.schedule_cleanup(session, self.config.error_cleanup_delay);
    }

    /// Stop the room's transcoder: close its input and ask it to exit.
    ///
    /// End of input is the graceful stop request: ffmpeg reading `pipe:0`
    /// flushes its last segment, writes the end-list tag and exits. The exit
    /// monitor kills the process if it is still running after `stop_grace`.
    /// A start still in flight is cancelled and its process killed at once.
    ///
    /// Returns false when nothing was starting or running. Queued chunks of
    /// an idle session are discarded either way.
    pub fn stop(&self, room_code: &str) -> bool {
        let Some(session) = self.session(room_code) else {
            return false;
        };
        let (pipe, terminate) = {
            let mut inner = session.lock();
            let state = inner.state;
            match state {
                SessionState::Idle => {
                    inner.state = SessionState::Stopped;
                    inner.pending.clear();
                    inner.pending_bytes = 0;
                    drop(inner);
                    self.remove_session(&session);
                    session.exited.send_replace(true);
                    return false;
                }
                SessionState::Starting | SessionState::Streaming => {
                    inner.state = SessionState::Draining;
                    (inner.pipe.take(), inner.terminate.take())
                }
                SessionState::Draining | SessionState::Stopped => return false,
            }
        };

        info!("Stopping transcoder for room {}", room_code);
        if let Some(pipe) = pipe {
            pipe.close();
        }
        if let Some(terminate) = terminate {
            let _ = terminate.send(());
        }
        true
    }

    /// Stop every session and wait for the processes to exit.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<TranscodeSession>> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.values().cloned().collect()
        };
        if sessions.is_empty() {
            return;
        }
        info!("Stopping {} transcoder session(s)", sessions.len());
        for session in &sessions {
            self.stop(&session.room_code);
        }
        for session in &sessions {
            self.wait_exited(session).await;
        }
    }

    async fn wait_exited(&self, session: &TranscodeSession) {
        let mut exited = session.exited.subscribe();
        let limit = self.config.stop_grace + KILL_WAIT;
        if timeout(limit, exited.wait_for(|done| *done)).await.is_err() {
            warn!(
                "Transcoder for room {} did not exit within {:?}",
                session.room_code, limit
            );
        }
    }

    fn schedule_cleanup(self: &Arc<Self>, session: &TranscodeSession, delay: Duration) {
        let room_code = session.room_code.clone();
        let generation = session.generation;
        let dir = session.output_dir.clone();
        let supervisor = Arc::downgrade(self);
        let task_code = room_code.clone();

        let handle = tokio::spawn(async move {
            sleep(delay).await;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!("Removed HLS output for room {}", task_code),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove HLS output {}: {}", dir.display(), e),
            }
            if let Some(supervisor) = supervisor.upgrade() {
                let mut cleanups = supervisor.cleanups.lock().unwrap_or_else(|e| e.into_inner());
                if cleanups.get(&task_code).map_or(false, |(gen, _)| *gen == generation) {
                    cleanups.remove(&task_code);
                }
            }
        });

        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = cleanups.insert(room_code, (generation, handle)) {
            previous.abort();
        }
    }

    fn cancel_cleanup(&self, room_code: &str) {
        let mut cleanups = self.cleanups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, handle)) = cleanups.remove(room_code) {
            handle.abort();
            debug!("Cancelled pending HLS cleanup for room {}", room_code);
        }
    }

    /// Spawn the task that serves auto-stop requests and the idle-viewer sweep.
    /// Returns `None` if it was already spawned.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut stop_requests = self
            .auto_stop_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let supervisor = Arc::downgrade(self);
        let mut idle_sweep = tokio::time::interval(self.config.idle_sweep_interval);

        Some(tokio::spawn(async move {
            idle_sweep.tick().await;
            loop {
                tokio::select! {
                    request = stop_requests.recv() => {
                        let Some(room_code) = request else { break };
                        let Some(supervisor) = supervisor.upgrade() else { break };
                        supervisor.auto_stop(&room_code);
                    }
                    _ = idle_sweep.tick() => {
                        let Some(supervisor) = supervisor.upgrade() else { break };
                        supervisor.sweep_idle_viewers();
                    }
                }
            }
            debug!("Transcode maintenance task stopped");
        }))
    }

    fn auto_stop(&self, room_code: &str) {
        let viewers = self.viewers.count(room_code);
        if viewers > 0 {
            debug!("Auto-stop for room {} skipped, {} viewer(s) back", room_code, viewers);
            return;
        }
        if self.stop(room_code) {
            info!("No viewers left in room {}, stopped HLS output", room_code);
            self.emit(StreamEvent::AutoStopped {
                room_code: room_code.to_string(),
            });
        }
    }

    fn sweep_idle_viewers(&self) {
        let reset = self
            .viewers
            .sweep_idle(|code| self.is_streaming(code), |code| self.session(code).is_some());
        if !reset.is_empty() {
            debug!("Idle viewer sweep reset {} room(s)", reset.len());
        }
    }
}

async fn reset_output_dir(dir: &Path) -> TranscodeResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(TranscodeError::OutputDir(format!("{}: {}", dir.display(), e)));
        }
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| TranscodeError::OutputDir(format!("{}: {}", dir.display(), e)))
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!("Transcoder kill: {}", e);
    }
    let _ = timeout(KILL_WAIT, child.wait()).await;
}

async fn log_stderr(room_code: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("[transcoder {}] {}", room_code, line);
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => status.to_string(),
    }
}
