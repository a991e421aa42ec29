//! Edge agent: executes pushed commands, reports to the cloud
//!
//! Three loops share one [`EdgeAgent`]:
//! - commands: envelope from the listener → supervisor → ACK over HTTP
//! - heartbeat: self-report every few seconds
//! - health: throughput/restart signals → auto-quality profile requests

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::{HealthConfig, HealthController, HealthDecision};
use super::supervisor::{EncoderSignal, SupervisorHandle, SupervisorStatus};
use crate::camera::CameraSlot;
use crate::command::{CommandAck, CommandEnvelope, EdgeCommand, ProfileOrigin, RedactedString};
use crate::profile::QualityProfile;
use crate::protocol::{HEARTBEAT_INTERVAL_MS, TRUCK_TOKEN_HEADER};
use crate::state::Heartbeat;

/// Everything the edge sends to the cloud.
#[async_trait]
pub trait CloudLink: Send + Sync {
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()>;
    async fn acknowledge(&self, ack: &CommandAck) -> Result<()>;
    async fn request_profile(&self, profile: QualityProfile) -> Result<()>;
}

/// [`CloudLink`] over the cloud's HTTP edge API.
pub struct CloudClient {
    http: reqwest::Client,
    base: String,
    token: RedactedString,
}

impl CloudClient {
    pub fn new(cloud_url: &str, token: RedactedString) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base: cloud_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let url = format!("{}{}", self.base, path);
        self.http
            .post(&url)
            .header(TRUCK_TOKEN_HEADER, self.token.expose())
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", path))?
            .error_for_status()
            .with_context(|| format!("POST {} rejected", path))?;
        Ok(())
    }
}

#[async_trait]
impl CloudLink for CloudClient {
    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
        self.post("/api/edge/heartbeat", &serde_json::to_value(heartbeat)?)
            .await
    }

    async fn acknowledge(&self, ack: &CommandAck) -> Result<()> {
        self.post("/api/edge/command-response", &serde_json::to_value(ack)?)
            .await
    }

    async fn request_profile(&self, profile: QualityProfile) -> Result<()> {
        self.post("/api/edge/profile-request", &json!({ "profile": profile }))
            .await
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub heartbeat_interval: Duration,
    /// How often the health controller is evaluated
    pub health_interval: Duration,
    pub auto_quality: bool,
    pub health: HealthConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            health_interval: Duration::from_secs(1),
            auto_quality: true,
            health: HealthConfig::default(),
        }
    }
}

pub struct EdgeAgent {
    supervisor: SupervisorHandle,
    cloud: Arc<dyn CloudLink>,
    cameras: Vec<CameraSlot>,
    /// RTMP target and key present
    output_configured: bool,
    youtube_url: Option<String>,
    health: Mutex<HealthController>,
    config: AgentConfig,
}

impl EdgeAgent {
    pub fn new(
        supervisor: SupervisorHandle,
        cloud: Arc<dyn CloudLink>,
        cameras: Vec<CameraSlot>,
        output_configured: bool,
        config: AgentConfig,
    ) -> Self {
        let profile = supervisor.status().profile;
        Self {
            health: Mutex::new(HealthController::new(config.health.clone(), profile)),
            supervisor,
            cloud,
            cameras,
            output_configured,
            youtube_url: None,
            config,
        }
    }

    /// Public watch URL reported in heartbeats.
    pub fn with_youtube_url(mut self, url: Option<String>) -> Self {
        self.youtube_url = url;
        self
    }

    /// Run the command, heartbeat and health loops until cancelled.
    pub async fn run(
        self: Arc<Self>,
        commands: mpsc::Receiver<CommandEnvelope>,
        cancel: CancellationToken,
    ) {
        tokio::join!(
            self.run_commands(commands, cancel.clone()),
            self.run_heartbeat(cancel.clone()),
            self.run_health(cancel),
        );
    }

    async fn run_commands(
        &self,
        mut commands: mpsc::Receiver<CommandEnvelope>,
        cancel: CancellationToken,
    ) {
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                env = commands.recv() => match env {
                    Some(env) => env,
                    None => break,
                },
            };
            let ack = self.execute_command(&envelope).await;
            if let Err(e) = self.cloud.acknowledge(&ack).await {
                warn!(command_id = %ack.command_id, "Failed to send ACK: {:#}", e);
            }
            // Report the new state right away instead of waiting a full interval
            self.send_heartbeat().await;
        }
        debug!("Command loop stopped");
    }

    async fn run_heartbeat(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.send_heartbeat().await,
            }
        }
    }

    async fn run_health(&self, cancel: CancellationToken) {
        let mut signals = self.supervisor.signals();
        let mut tick = tokio::time::interval(self.config.health_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                signal = signals.recv() => match signal {
                    Ok(EncoderSignal::Throughput(ratio)) => {
                        self.health.lock().await.record_ratio(Instant::now(), ratio);
                    }
                    Ok(EncoderSignal::Restarted) => {
                        self.health.lock().await.record_restart(Instant::now());
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Health signals lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tick.tick() => {
                    if self.config.auto_quality {
                        self.evaluate_health().await;
                    }
                }
            }
        }
    }

    async fn evaluate_health(&self) {
        // Steps are measured from the profile the encoder runs, not the one
        // last requested; an accepted request may never be applied
        let actual = self.supervisor.status().profile;
        let decision = {
            let mut health = self.health.lock().await;
            health.observe(actual);
            health.evaluate(Instant::now())
        };
        let HealthDecision::ChangeTo(profile) = decision else {
            return;
        };
        if let Err(e) = self.cloud.request_profile(profile).await {
            warn!(profile = %profile, "Auto quality request refused: {:#}", e);
        }
    }

    async fn send_heartbeat(&self) {
        let heartbeat = self.heartbeat();
        if let Err(e) = self.cloud.heartbeat(&heartbeat).await {
            warn!("Heartbeat failed: {:#}", e);
        }
    }

    /// Current self-report.
    pub fn heartbeat(&self) -> Heartbeat {
        let status = self.supervisor.status();
        Heartbeat {
            streaming_status: status.streaming_status(),
            streaming_camera: status.camera.map(|c| c.as_str().to_string()),
            cameras: self.cameras.iter().map(|c| c.as_str().to_string()).collect(),
            youtube_configured: self.output_configured,
            youtube_url: self.youtube_url.clone(),
            profile: Some(status.profile),
            started_at: status.started_at,
            supervisor: serde_json::to_value(&status).ok(),
        }
    }

    /// Run one command and build its ACK. Never fails: every problem becomes
    /// an error ACK.
    pub async fn execute_command(&self, envelope: &CommandEnvelope) -> CommandAck {
        let id = envelope.command_id.clone();
        let command = match envelope.decode() {
            Ok(command) => command,
            Err(e) => {
                warn!(command_id = %id, command = %envelope.command, "Rejected command: {}", e);
                return CommandAck::error(id, e.to_string());
            }
        };
        info!(command_id = %id, command = command.verb(), "Executing command");

        let result = match command {
            EdgeCommand::StartStream { camera, profile } => {
                if let Some(profile) = profile {
                    self.health.lock().await.set_manual(profile);
                    if let Err(e) = self.supervisor.set_profile(profile).await {
                        return CommandAck::error(id, e.to_string());
                    }
                }
                self.supervisor
                    .start(camera)
                    .await
                    .map(|s| (format!("Streaming {}", camera), s))
            }
            EdgeCommand::StopStream => self
                .supervisor
                .stop()
                .await
                .map(|s| ("Stream stopped".to_string(), s)),
            EdgeCommand::SetActiveCamera { camera } => self
                .supervisor
                .switch_camera(camera)
                .await
                .map(|s| (format!("Camera set to {}", camera), s)),
            EdgeCommand::SetProfile { profile, origin } => {
                {
                    let mut health = self.health.lock().await;
                    match origin {
                        ProfileOrigin::Manual => health.set_manual(profile),
                        ProfileOrigin::Auto => health.observe(profile),
                    }
                }
                self.supervisor
                    .set_profile(profile)
                    .await
                    .map(|s| (format!("Profile set to {}", profile), s))
            }
            EdgeCommand::GetStatus => Ok(("Status".to_string(), self.supervisor.status())),
            EdgeCommand::ResetSupervisor => self
                .supervisor
                .reset()
                .await
                .map(|s| ("Supervisor reset".to_string(), s)),
        };

        match result {
            Ok((message, status)) => {
                CommandAck::success(id, message).with_data(status_data(&status))
            }
            Err(e) => {
                warn!(command_id = %id, "Command failed: {}", e);
                CommandAck::error(id, e.to_string())
            }
        }
    }
}

fn status_data(status: &SupervisorStatus) -> serde_json::Value {
    serde_json::to_value(status).unwrap_or(serde_json::Value::Null)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::CommandId;
    use crate::edge::backoff::BackoffPolicy;
    use crate::edge::supervisor::{EncoderSpec, Supervisor, SupervisorPolicy};
    use crate::state::StreamingStatus;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingCloud {
        heartbeats: std::sync::Mutex<Vec<Heartbeat>>,
        acks: std::sync::Mutex<Vec<CommandAck>>,
        profiles: std::sync::Mutex<Vec<QualityProfile>>,
    }

    #[async_trait]
    impl CloudLink for RecordingCloud {
        async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<()> {
            self.heartbeats.lock().unwrap().push(heartbeat.clone());
            Ok(())
        }
        async fn acknowledge(&self, ack: &CommandAck) -> Result<()> {
            self.acks.lock().unwrap().push(ack.clone());
            Ok(())
        }
        async fn request_profile(&self, profile: QualityProfile) -> Result<()> {
            self.profiles.lock().unwrap().push(profile);
            Ok(())
        }
    }

    fn agent() -> (Arc<EdgeAgent>, Arc<RecordingCloud>, CancellationToken) {
        agent_with(AgentConfig::default())
    }

    fn agent_with(config: AgentConfig) -> (Arc<EdgeAgent>, Arc<RecordingCloud>, CancellationToken) {
        let spec = EncoderSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "exec sleep 30".into()],
            inputs: HashMap::from([(CameraSlot::Main, "main".to_string())]),
            rtmp_url: "rtmp://localhost/live".into(),
            stream_key: RedactedString::from("key"),
            orphan_signature: None,
        };
        let policy = SupervisorPolicy {
            backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                ceiling: Duration::from_millis(80),
                jitter: Duration::ZERO,
                symmetric: false,
            },
            start_grace: Duration::from_millis(100),
            stop_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (sup, handle) = Supervisor::new(policy, spec.clone(), QualityProfile::Hd720, None);
        let cancel = CancellationToken::new();
        tokio::spawn(sup.run(cancel.clone()));

        let cloud = Arc::new(RecordingCloud::default());
        let agent = EdgeAgent::new(
            handle,
            cloud.clone(),
            spec.cameras(),
            spec.output_configured(),
            config,
        );
        (Arc::new(agent), cloud, cancel)
    }

    fn envelope(command: &str, params: serde_json::Value) -> CommandEnvelope {
        CommandEnvelope {
            command_id: CommandId::from("cmd-1"),
            command: command.to_string(),
            params,
            sent_at: 0,
        }
    }

    #[tokio::test]
    async fn start_then_stop_acks_with_status() {
        let (agent, _cloud, cancel) = agent();
        let ack = agent
            .execute_command(&envelope("start_stream", json!({ "camera": "main" })))
            .await;
        assert!(ack.is_success(), "{:?}", ack);
        assert_eq!(ack.data.as_ref().unwrap()["state"], "active");

        let hb = agent.heartbeat();
        assert_eq!(hb.streaming_status, StreamingStatus::Live);
        assert_eq!(hb.streaming_camera.as_deref(), Some("main"));
        assert_eq!(hb.cameras, vec!["main".to_string()]);
        assert!(hb.youtube_configured);

        let ack = agent
            .execute_command(&envelope("stop_stream", json!({})))
            .await;
        assert!(ack.is_success());
        assert_eq!(agent.heartbeat().streaming_status, StreamingStatus::Idle);
        cancel.cancel();
    }

    #[tokio::test]
    async fn bad_commands_become_error_acks() {
        let (agent, _cloud, cancel) = agent();
        let ack = agent
            .execute_command(&envelope("self_destruct", json!({})))
            .await;
        assert!(!ack.is_success());

        let ack = agent
            .execute_command(&envelope("start_stream", json!({ "camera": "chase" })))
            .await;
        assert!(!ack.is_success());
        assert!(ack.message.contains("Camera"), "{}", ack.message);
        cancel.cancel();
    }

    #[tokio::test]
    async fn manual_profile_caps_auto_quality() {
        let (agent, _cloud, cancel) = agent();
        let ack = agent
            .execute_command(&envelope(
                "set_profile",
                json!({ "profile": "480p", "origin": "manual" }),
            ))
            .await;
        assert!(ack.is_success());
        assert_eq!(agent.heartbeat().profile, Some(QualityProfile::Sd480));
        assert_eq!(agent.health.lock().await.ceiling(), QualityProfile::Sd480);

        agent
            .execute_command(&envelope(
                "set_profile",
                json!({ "profile": "360p", "origin": "auto" }),
            ))
            .await;
        let health = agent.health.lock().await;
        assert_eq!(health.current(), QualityProfile::Sd360);
        assert_eq!(health.ceiling(), QualityProfile::Sd480);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unapplied_auto_step_resyncs_to_encoder_profile() {
        let (agent, cloud, cancel) = agent_with(AgentConfig {
            health: HealthConfig {
                downgrade_after: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        });

        agent.health.lock().await.record_ratio(Instant::now(), 0.5);
        agent.evaluate_health().await;
        assert_eq!(*cloud.profiles.lock().unwrap(), vec![QualityProfile::Sd480]);
        assert_eq!(agent.health.lock().await.current(), QualityProfile::Sd480);

        // The cloud accepted the request but the switch never reached the
        // encoder, which is still on 720p
        agent.evaluate_health().await;
        assert_eq!(agent.health.lock().await.current(), QualityProfile::Hd720);
        assert_eq!(cloud.profiles.lock().unwrap().len(), 1);

        // Still unhealthy: the next step starts from 720p again
        agent.health.lock().await.record_ratio(Instant::now(), 0.5);
        agent.evaluate_health().await;
        assert_eq!(
            *cloud.profiles.lock().unwrap(),
            vec![QualityProfile::Sd480, QualityProfile::Sd480]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn command_loop_acks_and_reports() {
        let (agent, cloud, cancel) = agent();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(agent.clone().run(rx, cancel.clone()));

        tx.send(envelope("get_status", json!({}))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while cloud.acks.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let acks = cloud.acks.lock().unwrap().clone();
        assert_eq!(acks[0].command_id, CommandId::from("cmd-1"));
        assert!(acks[0].is_success());
        assert!(!cloud.heartbeats.lock().unwrap().is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
