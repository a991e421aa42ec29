//! Encoder process supervisor
//!
//! Owns the single encoder subprocess on an edge device:
//!
//! ```text
//! idle ──start──▶ starting ──grace──▶ active
//!                    ▲                  │ exit
//!                    │ backoff          ▼
//!                 retrying ◀──────── error ──(auth x3 | device | 10 in a row)──▶ paused
//! ```
//!
//! [`SupervisorCore`] is the pure state machine (counters, breaker, backoff).
//! [`Supervisor`] drives it from one task that owns the child process and
//! reacts to requests from [`SupervisorHandle`], process exits and timers.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::BackoffPolicy;
use super::classify::{classify_failure, FailureKind};
use crate::camera::CameraSlot;
use crate::command::RedactedString;
use crate::profile::QualityProfile;
use crate::protocol::now_ms;
use crate::state::StreamingStatus;

/// Lines of encoder stderr kept for failure classification
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    #[default]
    Idle,
    Starting,
    Active,
    Error,
    Retrying,
    Paused,
}

/// Published after every transition. Read-only outside the supervisor.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub camera: Option<CameraSlot>,
    pub profile: QualityProfile,
    /// Consecutive failures since the last stable run
    pub restart_count: u32,
    /// Lifetime automatic restarts
    pub total_restarts: u64,
    pub auth_failure_count: u32,
    pub last_error: Option<String>,
    pub last_failure: Option<FailureKind>,
    /// Epoch ms of the next automatic restart
    pub next_retry_at: Option<u64>,
    pub backoff_delay_ms: Option<u64>,
    pub pid: Option<u32>,
    /// Epoch ms the current encoder run was spawned
    pub started_at: Option<u64>,
}

impl SupervisorStatus {
    /// How the edge reports this to the cloud.
    pub fn streaming_status(&self) -> StreamingStatus {
        match self.state {
            SupervisorState::Idle => StreamingStatus::Idle,
            SupervisorState::Starting => StreamingStatus::Starting,
            SupervisorState::Active => StreamingStatus::Live,
            SupervisorState::Error | SupervisorState::Retrying => StreamingStatus::Error,
            SupervisorState::Paused => StreamingStatus::Paused,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Camera '{0}' is not configured on this edge")]
    CameraNotConfigured(CameraSlot),

    #[error("Stream key not configured")]
    StreamKeyNotConfigured,

    #[error("Encoder exited during startup ({kind}): {message}")]
    StartupFailed { kind: FailureKind, message: String },

    #[error("Failed to spawn encoder: {0}")]
    Spawn(String),

    #[error("Encoder paused after repeated failures; reset required")]
    Paused,

    #[error("Superseded by a newer request")]
    Superseded,

    #[error("Supervisor is shut down")]
    Closed,
}

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Auth failures before pausing
    pub auth_failure_limit: u32,
    /// Consecutive failures of any kind before pausing
    pub breaker_limit: u32,
    pub backoff: BackoffPolicy,
    /// A run that survives this long resets the failure counters
    pub stable_after: Duration,
    /// A start is reported successful once the encoder survives this long
    pub start_grace: Duration,
    /// How long to wait for a graceful encoder exit before killing it
    pub stop_timeout: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            auth_failure_limit: 3,
            breaker_limit: 10,
            backoff: BackoffPolicy::supervisor(),
            stable_after: Duration::from_secs(30),
            start_grace: Duration::from_secs(3),
            stop_timeout: Duration::from_secs(3),
        }
    }
}

/// What to do after an encoder exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Retry(Duration),
    Pause,
}

/// Supervisor state machine without any I/O.
pub struct SupervisorCore {
    status: SupervisorStatus,
    policy: SupervisorPolicy,
}

impl SupervisorCore {
    pub fn new(policy: SupervisorPolicy, profile: QualityProfile) -> Self {
        Self {
            status: SupervisorStatus {
                profile,
                ..Default::default()
            },
            policy,
        }
    }

    pub fn status(&self) -> &SupervisorStatus {
        &self.status
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    /// Explicit start or camera switch. Clears the failure counters and
    /// lifts a pause.
    pub fn begin_start(&mut self, camera: CameraSlot) {
        self.status.camera = Some(camera);
        self.status.state = SupervisorState::Starting;
        self.status.restart_count = 0;
        self.status.auth_failure_count = 0;
        self.status.last_error = None;
        self.status.last_failure = None;
        self.status.next_retry_at = None;
        self.status.backoff_delay_ms = None;
    }

    pub fn set_camera(&mut self, camera: CameraSlot) {
        self.status.camera = Some(camera);
    }

    pub fn set_profile(&mut self, profile: QualityProfile) {
        self.status.profile = profile;
    }

    /// Intentional restart (profile change) of a running encoder.
    pub fn begin_restart(&mut self) {
        self.status.state = SupervisorState::Starting;
    }

    pub fn spawned(&mut self, pid: Option<u32>, now_ms: u64) {
        self.status.pid = pid;
        self.status.started_at = Some(now_ms);
    }

    /// The encoder survived the start grace period.
    pub fn confirm_running(&mut self) {
        self.status.state = SupervisorState::Active;
    }

    /// The encoder survived the stability window.
    pub fn mark_stable(&mut self) {
        if self.status.restart_count > 0 || self.status.auth_failure_count > 0 {
            info!(
                restarts = self.status.restart_count,
                "Encoder stable, failure counters reset"
            );
        }
        self.status.restart_count = 0;
        self.status.auth_failure_count = 0;
    }

    /// Startup failed before a process existed (bad configuration).
    pub fn fail_start(&mut self, message: String) {
        self.status.state = SupervisorState::Error;
        self.status.last_error = Some(message);
        self.status.pid = None;
        self.status.started_at = None;
    }

    /// The encoder exited on its own.
    pub fn on_exit(&mut self, kind: FailureKind, message: String, now_ms: u64) -> ExitAction {
        let s = &mut self.status;
        s.state = SupervisorState::Error;
        s.pid = None;
        s.started_at = None;
        s.last_error = Some(message);
        s.last_failure = Some(kind);
        s.restart_count += 1;

        let pause = match kind {
            FailureKind::Auth => {
                s.auth_failure_count += 1;
                s.auth_failure_count >= self.policy.auth_failure_limit
            }
            FailureKind::Device => true,
            FailureKind::Network | FailureKind::Crash => false,
        } || s.restart_count >= self.policy.breaker_limit;

        if pause {
            s.state = SupervisorState::Paused;
            s.next_retry_at = None;
            s.backoff_delay_ms = None;
            return ExitAction::Pause;
        }

        let delay = self.policy.backoff.delay(s.restart_count - 1);
        s.state = SupervisorState::Retrying;
        s.backoff_delay_ms = Some(delay.as_millis() as u64);
        s.next_retry_at = Some(now_ms + delay.as_millis() as u64);
        ExitAction::Retry(delay)
    }

    /// Backoff elapsed, launching again.
    pub fn begin_retry(&mut self) {
        self.status.state = SupervisorState::Starting;
        self.status.total_restarts += 1;
        self.status.next_retry_at = None;
    }

    pub fn stopped(&mut self) {
        let s = &mut self.status;
        s.state = SupervisorState::Idle;
        s.pid = None;
        s.started_at = None;
        s.next_retry_at = None;
        s.backoff_delay_ms = None;
    }

    /// Manual reset: clear counters and leave any failure state.
    pub fn reset(&mut self) {
        let s = &mut self.status;
        s.restart_count = 0;
        s.auth_failure_count = 0;
        s.last_error = None;
        s.last_failure = None;
        s.next_retry_at = None;
        s.backoff_delay_ms = None;
        if matches!(
            s.state,
            SupervisorState::Paused | SupervisorState::Error | SupervisorState::Retrying
        ) {
            s.state = SupervisorState::Idle;
        }
    }
}

/// How to launch the encoder.
///
/// `args` is a template; `{input}`, `{bitrate}`, `{bufsize}`, `{size}` and
/// `{output}` are substituted per launch.
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Camera slot → encoder input (device path or URL)
    pub inputs: HashMap<CameraSlot, String>,
    pub rtmp_url: String,
    pub stream_key: RedactedString,
    /// Command-line fragment identifying stray encoders to reap before a start
    pub orphan_signature: Option<String>,
}

impl EncoderSpec {
    /// Stock ffmpeg pipeline: camera → H.264/AAC → FLV over RTMP.
    pub fn ffmpeg(
        rtmp_url: impl Into<String>,
        stream_key: RedactedString,
        inputs: HashMap<CameraSlot, String>,
    ) -> Self {
        let args = [
            "-hide_banner", "-loglevel", "warning", "-stats",
            "-thread_queue_size", "512", "-i", "{input}",
            "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency",
            "-b:v", "{bitrate}k", "-maxrate", "{bitrate}k", "-bufsize", "{bufsize}k",
            "-s", "{size}", "-g", "60", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "128k",
            "-f", "flv", "{output}",
        ];
        let rtmp_url = rtmp_url.into();
        Self {
            program: "ffmpeg".into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            inputs,
            orphan_signature: (!rtmp_url.is_empty()).then(|| rtmp_url.clone()),
            rtmp_url,
            stream_key,
        }
    }

    /// Cameras this edge can stream, in slot order.
    pub fn cameras(&self) -> Vec<CameraSlot> {
        CameraSlot::ALL
            .into_iter()
            .filter(|slot| self.inputs.contains_key(slot))
            .collect()
    }

    /// True when the RTMP target and key are both set.
    pub fn output_configured(&self) -> bool {
        !self.rtmp_url.trim().is_empty() && !self.stream_key.is_empty()
    }

    /// Concrete argument list for one launch.
    pub fn render(
        &self,
        camera: CameraSlot,
        profile: QualityProfile,
    ) -> Result<Vec<String>, SupervisorError> {
        let input = self
            .inputs
            .get(&camera)
            .ok_or(SupervisorError::CameraNotConfigured(camera))?;
        if !self.output_configured() {
            return Err(SupervisorError::StreamKeyNotConfigured);
        }
        let output = format!(
            "{}/{}",
            self.rtmp_url.trim_end_matches('/'),
            self.stream_key.expose()
        );
        let (w, h) = profile.resolution();
        let bitrate = profile.bitrate_kbps().to_string();
        let bufsize = (profile.bitrate_kbps() * 2).to_string();
        let size = format!("{}x{}", w, h);

        Ok(self
            .args
            .iter()
            .map(|a| {
                a.replace("{input}", input)
                    .replace("{bitrate}", &bitrate)
                    .replace("{bufsize}", &bufsize)
                    .replace("{size}", &size)
                    .replace("{output}", &output)
            })
            .collect())
    }
}

/// Signals the health controller consumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EncoderSignal {
    /// Encoding speed relative to real time
    Throughput(f64),
    /// The encoder died unexpectedly
    Restarted,
}

/// Parse `speed=0.97x` from an encoder progress line.
pub fn parse_speed(line: &str) -> Option<f64> {
    let rest = line.split_once("speed=")?.1.trim_start();
    let end = rest.find('x')?;
    rest[..end].trim().parse().ok()
}

type Reply = oneshot::Sender<Result<SupervisorStatus, SupervisorError>>;

enum Request {
    Start { camera: CameraSlot, reply: Reply },
    SwitchCamera { camera: CameraSlot, reply: Reply },
    SetProfile { profile: QualityProfile, reply: Reply },
    Stop { reply: Reply },
    Reset { reply: Reply },
}

/// Cheap, cloneable handle to a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Request>,
    status: watch::Receiver<SupervisorStatus>,
    signals: broadcast::Sender<EncoderSignal>,
}

impl SupervisorHandle {
    async fn call(
        &self,
        make: impl FnOnce(Reply) -> Request,
    ) -> Result<SupervisorStatus, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SupervisorError::Closed)?;
        rx.await.map_err(|_| SupervisorError::Closed)?
    }

    /// Start streaming `camera`. Resolves once the encoder has survived the
    /// start grace period or failed.
    pub async fn start(&self, camera: CameraSlot) -> Result<SupervisorStatus, SupervisorError> {
        self.call(|reply| Request::Start { camera, reply }).await
    }

    /// Move to a different camera, restarting the encoder if it is running
    /// or paused.
    pub async fn switch_camera(
        &self,
        camera: CameraSlot,
    ) -> Result<SupervisorStatus, SupervisorError> {
        self.call(|reply| Request::SwitchCamera { camera, reply })
            .await
    }

    pub async fn set_profile(
        &self,
        profile: QualityProfile,
    ) -> Result<SupervisorStatus, SupervisorError> {
        self.call(|reply| Request::SetProfile { profile, reply })
            .await
    }

    pub async fn stop(&self) -> Result<SupervisorStatus, SupervisorError> {
        self.call(|reply| Request::Stop { reply }).await
    }

    pub async fn reset(&self) -> Result<SupervisorStatus, SupervisorError> {
        self.call(|reply| Request::Reset { reply }).await
    }

    /// Latest published status.
    pub fn status(&self) -> SupervisorStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    pub fn signals(&self) -> broadcast::Receiver<EncoderSignal> {
        self.signals.subscribe()
    }
}

struct RunningEncoder {
    child: Child,
    tail: Arc<Mutex<VecDeque<String>>>,
    reader: JoinHandle<()>,
    spawned_at: Instant,
    /// Survived the start grace period
    confirmed: bool,
    /// Survived the stability window
    stable: bool,
}

/// The supervisor task. Create with [`Supervisor::new`], then drive with
/// [`Supervisor::run`].
pub struct Supervisor {
    core: SupervisorCore,
    encoder: EncoderSpec,
    status_file: Option<PathBuf>,
    requests: mpsc::Receiver<Request>,
    status_tx: watch::Sender<SupervisorStatus>,
    signals: broadcast::Sender<EncoderSignal>,
    child: Option<RunningEncoder>,
    retry_at: Option<Instant>,
    /// Caller waiting on the current start to confirm or fail
    pending_reply: Option<Reply>,
}

impl Supervisor {
    pub fn new(
        policy: SupervisorPolicy,
        spec: EncoderSpec,
        profile: QualityProfile,
        status_file: Option<PathBuf>,
    ) -> (Self, SupervisorHandle) {
        let core = SupervisorCore::new(policy, profile);
        let (tx, requests) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(core.status().clone());
        let (signals, _) = broadcast::channel(64);

        let handle = SupervisorHandle {
            tx,
            status: status_rx,
            signals: signals.clone(),
        };
        let supervisor = Self {
            core,
            encoder: spec,
            status_file,
            requests,
            status_tx,
            signals,
            child: None,
            retry_at: None,
            pending_reply: None,
        };
        (supervisor, handle)
    }

    /// Monitor loop. Returns when cancelled or every handle is dropped,
    /// stopping the encoder on the way out.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.publish().await;
        loop {
            let grace_at = self
                .child
                .as_ref()
                .filter(|c| !c.confirmed)
                .map(|c| c.spawned_at + self.core.policy().start_grace);
            let stable_at = self
                .child
                .as_ref()
                .filter(|c| c.confirmed && !c.stable)
                .map(|c| c.spawned_at + self.core.policy().stable_after);
            let retry_at = self.retry_at;

            tokio::select! {
                _ = cancel.cancelled() => break,
                req = self.requests.recv() => match req {
                    Some(req) => self.handle_request(req).await,
                    None => break,
                },
                exit = wait_child(&mut self.child) => self.on_exit(exit).await,
                _ = sleep_until_opt(grace_at) => self.on_grace_elapsed().await,
                _ = sleep_until_opt(stable_at) => self.on_stable().await,
                _ = sleep_until_opt(retry_at) => self.on_retry().await,
            }
        }

        self.kill_encoder().await;
        self.core.stopped();
        self.publish().await;
        debug!("Supervisor stopped");
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Start { camera, reply } => {
                info!(camera = %camera, "Supervisor: start");
                self.core.begin_start(camera);
                self.launch(Some(reply)).await;
            }
            Request::SwitchCamera { camera, reply } => {
                if self.core.status().state == SupervisorState::Idle {
                    self.core.set_camera(camera);
                    self.publish().await;
                    let _ = reply.send(Ok(self.core.status().clone()));
                } else {
                    info!(camera = %camera, "Supervisor: switching camera");
                    self.core.begin_start(camera);
                    self.launch(Some(reply)).await;
                }
            }
            Request::SetProfile { profile, reply } => {
                self.core.set_profile(profile);
                match self.core.status().state {
                    SupervisorState::Starting | SupervisorState::Active => {
                        info!(profile = %profile, "Supervisor: restarting with new profile");
                        self.core.begin_restart();
                        self.launch(Some(reply)).await;
                    }
                    _ => {
                        self.publish().await;
                        let _ = reply.send(Ok(self.core.status().clone()));
                    }
                }
            }
            Request::Stop { reply } => {
                info!("Supervisor: stop");
                self.retry_at = None;
                self.kill_encoder().await;
                self.core.stopped();
                self.publish().await;
                let _ = reply.send(Ok(self.core.status().clone()));
            }
            Request::Reset { reply } => {
                info!("Supervisor: reset");
                if self.child.is_none() {
                    self.retry_at = None;
                }
                self.core.reset();
                self.publish().await;
                let _ = reply.send(Ok(self.core.status().clone()));
            }
        }
    }

    /// Kill whatever is running and spawn a fresh encoder.
    async fn launch(&mut self, reply: Option<Reply>) {
        self.retry_at = None;
        self.kill_encoder().await;
        self.reap_orphans().await;
        if let Some(old) = self.pending_reply.take() {
            let _ = old.send(Err(SupervisorError::Superseded));
        }

        let status = self.core.status();
        let Some(camera) = status.camera else {
            return;
        };
        let args = match self.encoder.render(camera, status.profile) {
            Ok(args) => args,
            Err(e) => {
                warn!(error = %e, "Cannot launch encoder");
                self.core.fail_start(e.to_string());
                self.publish().await;
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return;
            }
        };

        let spawned = Command::new(&self.encoder.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = format!("{}: {}", self.encoder.program, e);
                error!(error = %message, "Failed to spawn encoder");
                let action = self.core.on_exit(FailureKind::Crash, message.clone(), now_ms());
                self.schedule(action);
                self.publish().await;
                if let Some(reply) = reply {
                    let _ = reply.send(Err(SupervisorError::Spawn(message)));
                }
                return;
            }
        };

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let reader = match child.stderr.take() {
            Some(stderr) => tokio::spawn(read_encoder_output(
                stderr,
                Arc::clone(&tail),
                self.signals.clone(),
            )),
            None => tokio::spawn(async {}),
        };

        let pid = child.id();
        info!(
            pid = ?pid,
            camera = %camera,
            profile = %self.core.status().profile,
            "Encoder spawned"
        );
        self.child = Some(RunningEncoder {
            child,
            tail,
            reader,
            spawned_at: Instant::now(),
            confirmed: false,
            stable: false,
        });
        self.pending_reply = reply;
        self.core.spawned(pid, now_ms());
        self.publish().await;
    }

    async fn on_grace_elapsed(&mut self) {
        if let Some(running) = self.child.as_mut() {
            running.confirmed = true;
        }
        self.core.confirm_running();
        info!("Encoder running");
        self.publish().await;
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Ok(self.core.status().clone()));
        }
    }

    async fn on_stable(&mut self) {
        if let Some(running) = self.child.as_mut() {
            running.stable = true;
        }
        self.core.mark_stable();
        self.publish().await;
    }

    async fn on_exit(&mut self, exit: std::io::Result<ExitStatus>) {
        let Some(running) = self.child.take() else {
            return;
        };
        let RunningEncoder { tail, reader, .. } = running;

        // Let the reader drain what the encoder printed on its way out
        if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
            debug!("Encoder output reader still busy after exit");
        }
        let output = tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();

        let code = exit.as_ref().ok().and_then(|s| s.code());
        let kind = classify_failure(code, &output);
        let message = output
            .lines()
            .last()
            .map(str::to_string)
            .unwrap_or_else(|| match &exit {
                Ok(status) => format!("Encoder exited with {}", status),
                Err(e) => format!("Encoder wait failed: {}", e),
            });

        let action = self.core.on_exit(kind, message.clone(), now_ms());
        let _ = self.signals.send(EncoderSignal::Restarted);
        match action {
            ExitAction::Retry(delay) => warn!(
                kind = %kind,
                code = ?code,
                attempt = self.core.status().restart_count,
                "Encoder exited, restarting in {:.1}s: {}",
                delay.as_secs_f64(),
                message
            ),
            ExitAction::Pause => error!(
                kind = %kind,
                code = ?code,
                restarts = self.core.status().restart_count,
                auth_failures = self.core.status().auth_failure_count,
                "Encoder paused, manual reset required: {}",
                message
            ),
        }
        self.schedule(action);
        self.publish().await;

        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Err(SupervisorError::StartupFailed { kind, message }));
        }
    }

    async fn on_retry(&mut self) {
        self.retry_at = None;
        self.core.begin_retry();
        info!(
            attempt = self.core.status().restart_count + 1,
            total = self.core.status().total_restarts,
            "Restarting encoder"
        );
        self.launch(None).await;
    }

    fn schedule(&mut self, action: ExitAction) {
        self.retry_at = match action {
            ExitAction::Retry(delay) => Some(Instant::now() + delay),
            ExitAction::Pause => None,
        };
    }

    /// Stop the current encoder: ask nicely on stdin, then kill.
    async fn kill_encoder(&mut self) {
        let Some(mut running) = self.child.take() else {
            return;
        };
        if let Some(mut stdin) = running.child.stdin.take() {
            let _ = stdin.write_all(b"q\n").await;
        }
        match tokio::time::timeout(self.core.policy().stop_timeout, running.child.wait()).await {
            Ok(_) => debug!("Encoder exited gracefully"),
            Err(_) => {
                warn!("Encoder ignored quit request, killing");
                if let Err(e) = running.child.kill().await {
                    warn!(error = %e, "Failed to kill encoder");
                }
            }
        }
        running.reader.abort();
        if let Some(reply) = self.pending_reply.take() {
            let _ = reply.send(Err(SupervisorError::Superseded));
        }
    }

    /// Kill stray encoders from a previous crash of this agent.
    async fn reap_orphans(&self) {
        let Some(signature) = self.encoder.orphan_signature.as_deref() else {
            return;
        };
        match Command::new("pkill").args(["-f", signature]).status().await {
            Ok(status) if status.success() => {
                warn!(signature, "Reaped orphaned encoder processes");
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            // pkill exits 1 when nothing matched
            Ok(status) if status.code() == Some(1) => {}
            Ok(status) => warn!(signature, %status, "pkill failed"),
            Err(e) => warn!(error = %e, "Could not run pkill"),
        }
    }

    async fn publish(&self) {
        let status = self.core.status().clone();
        if let Some(path) = &self.status_file {
            if let Err(e) = write_status_file(path, &status).await {
                warn!(path = %path.display(), error = %e, "Failed to write status file");
            }
        }
        self.status_tx.send_replace(status);
    }
}

async fn wait_child(child: &mut Option<RunningEncoder>) -> std::io::Result<ExitStatus> {
    match child {
        Some(running) => running.child.wait().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Forward progress lines as throughput samples and keep the last lines of
/// everything else for failure classification.
async fn read_encoder_output(
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
    signals: broadcast::Sender<EncoderSignal>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_line_or_progress(&mut reader, &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let chunk = String::from_utf8_lossy(&buf);
        let line = chunk.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("speed=") {
            if let Some(speed) = parse_speed(line) {
                let _ = signals.send(EncoderSignal::Throughput(speed));
            }
            continue;
        }
        debug!(target: "pitwall::encoder", "{}", line);
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }
    }
}

/// Read up to and including the next `\r` (progress updates) or `\n`
/// (log lines). Returns the number of bytes read, 0 at EOF.
async fn read_line_or_progress<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut read = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read);
        }
        let (used, done) = match available.iter().position(|b| *b == b'\r' || *b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        read += used;
        if done {
            return Ok(read);
        }
    }
}

/// Atomically replace the status file (temp file + rename).
async fn write_status_file(path: &Path, status: &SupervisorStatus) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(status)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await
}
