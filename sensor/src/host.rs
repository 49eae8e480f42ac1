use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use smokesensor_common::{
    state_topic, status_topic, Broker, BrokerCredentials, NetworkConfig, RestartAuthority,
    RuntimeConfig, SensorSource, SmokeReporter, TickOutcome, STATUS_OFFLINE, STATUS_ONLINE,
};

const TICK_INTERVAL_MS: u64 = 250;
const STATE_PUBLISH_INTERVAL_MS: u64 = 10_000;

type ReconnectReply = oneshot::Sender<Result<(), String>>;

struct ConfigStore {
    runtime_path: PathBuf,
}

/// Bridges the synchronous reporter loop to the rumqttc event loop task.
struct HostBroker {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    reconnect_requests: mpsc::Sender<ReconnectReply>,
}

#[derive(Default)]
struct ProcessRestart {
    requested: bool,
}

#[derive(Default)]
struct SimulatedSmokeSensor {
    tick: u64,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut runtime = match store.load_runtime_config().await {
        Ok(Some(runtime)) => runtime,
        Ok(None) => {
            let runtime = RuntimeConfig::default();
            match store.save_runtime_config(&runtime).await {
                Ok(()) => info!(
                    "wrote default config to {}",
                    store.runtime_path.display()
                ),
                Err(err) => warn!("failed to write default config: {err:#}"),
            }
            runtime
        }
        Err(err) => {
            warn!("failed to load runtime config from store: {err:#}");
            RuntimeConfig::default()
        }
    };

    apply_env_overrides(&mut runtime.network);
    runtime
        .device
        .validate()
        .context("invalid device configuration")?;
    let credentials =
        BrokerCredentials::from_network(&runtime.network).context("invalid mqtt credentials")?;

    let reporter = SmokeReporter::new(runtime.reporter.clone(), monotonic_ms());
    let root_topic = reporter.config().root_topic.clone();
    let availability_topic = status_topic(&root_topic);

    info!(
        "smoke sensor `{}` starting (console {} baud, broker {}:{}, topic `{}`)",
        runtime.device.hostname,
        runtime.device.baud_rate,
        credentials.host,
        credentials.port,
        root_topic
    );

    let mut mqtt_options = MqttOptions::new(
        runtime.device.hostname.clone(),
        credentials.host.as_str(),
        credentials.port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_last_will(LastWill::new(
        availability_topic.clone(),
        STATUS_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    if credentials.has_login() {
        mqtt_options.set_credentials(credentials.user.as_str(), credentials.pass.as_str());
    }

    let (client, eventloop) = AsyncClient::new(mqtt_options, 32);
    let (connected_tx, connected_rx) = watch::channel(false);
    let (reconnect_tx, reconnect_rx) = mpsc::channel(1);

    spawn_mqtt_loop(
        client.clone(),
        eventloop,
        availability_topic,
        connected_tx,
        reconnect_rx,
    );

    let broker = HostBroker {
        client,
        connected: connected_rx,
        reconnect_requests: reconnect_tx,
    };

    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || run_reporter_loop(reporter, broker, &stop))
    };

    tokio::select! {
        joined = &mut worker => return joined.context("reporter loop panicked")?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
            stop.store(true, Ordering::Relaxed);
        }
    }

    worker.await.context("reporter loop panicked")?
}

fn spawn_mqtt_loop(
    client: AsyncClient,
    mut eventloop: EventLoop,
    availability_topic: String,
    connected: watch::Sender<bool>,
    mut reconnect_requests: mpsc::Receiver<ReconnectReply>,
) {
    tokio::spawn(async move {
        let mut pending: Option<ReconnectReply> = None;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    connected.send_replace(true);

                    if let Err(err) = client.try_publish(
                        availability_topic.clone(),
                        QoS::AtLeastOnce,
                        true,
                        STATUS_ONLINE,
                    ) {
                        warn!("failed to publish sensor online status: {err}");
                    }

                    if let Some(reply) = pending.take() {
                        let _ = reply.send(Ok(()));
                    }
                    // Requests queued while the initial connect was in flight.
                    while let Ok(reply) = reconnect_requests.try_recv() {
                        let _ = reply.send(Ok(()));
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("sensor mqtt poll error: {err}");
                    connected.send_replace(false);

                    if let Some(reply) = pending.take() {
                        let _ = reply.send(Err(err.to_string()));
                    }

                    // Hold further connection attempts until the reporter asks for one.
                    match reconnect_requests.recv().await {
                        Some(reply) => pending = Some(reply),
                        None => break,
                    }
                }
            }
        }
    });
}

fn run_reporter_loop(
    mut reporter: SmokeReporter,
    mut broker: HostBroker,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let mut sensor = SimulatedSmokeSensor::default();
    let mut restart = ProcessRestart::default();
    let diagnostics_topic = state_topic(&reporter.config().root_topic);
    let mut last_state_publish_ms: Option<u64> = None;

    info!("smoke reporter started");

    while !stop.load(Ordering::Relaxed) {
        let now_ms = monotonic_ms();
        let raw = sensor.read();
        let outcome = reporter.on_tick(now_ms, raw, &mut broker, &mut restart);
        log_outcome(&outcome, raw);

        if restart.requested {
            return Err(anyhow!(
                "broker unreachable after {} reconnect attempts; exiting for restart",
                reporter.config().max_reconnect_tries
            ));
        }

        let state_due = last_state_publish_ms
            .map(|last| now_ms.saturating_sub(last) >= STATE_PUBLISH_INTERVAL_MS)
            .unwrap_or(true);
        if state_due && broker.is_connected() {
            last_state_publish_ms = Some(now_ms);
            match serde_json::to_vec(&reporter.status_payload(now_ms)) {
                Ok(body) => {
                    if let Err(err) = broker.publish_retained(&diagnostics_topic, body) {
                        warn!("reporter state publish failed: {err:#}");
                    }
                }
                Err(err) => warn!("reporter state serialization failed: {err}"),
            }
        }

        thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
    }

    info!("smoke reporter stopped");
    Ok(())
}

fn log_outcome(outcome: &TickOutcome, raw: i32) {
    match outcome {
        TickOutcome::Published { value } => info!("published smoke reading {value}"),
        TickOutcome::PublishFailed { error } => {
            warn!("failed to publish smoke reading {raw}: {error}")
        }
        TickOutcome::ReconnectFailed { failures, error } => {
            warn!("mqtt reconnect attempt {failures} failed: {error}")
        }
        TickOutcome::RestartRequested { failures, error } => {
            warn!("mqtt reconnect failed {failures} times in a row; last error: {error}")
        }
        TickOutcome::WarmingUp
        | TickOutcome::Skipped(_)
        | TickOutcome::AwaitingReconnect
        | TickOutcome::GaveUp => debug!(raw, outcome = outcome.as_str(), "reading held"),
    }
}

impl Broker for HostBroker {
    type Error = anyhow::Error;

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn reconnect(&mut self) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.reconnect_requests
            .blocking_send(reply_tx)
            .map_err(|_| anyhow!("mqtt event loop stopped"))?;

        match reply_rx.blocking_recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(_) => Err(anyhow!("mqtt event loop stopped")),
        }
    }

    fn publish(&mut self, topic: &str, payload: &str) -> anyhow::Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_owned())
            .context("failed to queue smoke reading")
    }
}

impl HostBroker {
    fn publish_retained(&self, topic: &str, body: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, true, body)
            .context("failed to queue reporter state")
    }
}

impl RestartAuthority for ProcessRestart {
    fn restart(&mut self) {
        warn!("restart requested by smoke reporter");
        self.requested = true;
    }
}

impl SensorSource for SimulatedSmokeSensor {
    fn read(&mut self) -> i32 {
        self.tick = self.tick.saturating_add(1);

        // Hardware integration point:
        // the ESP build reads the MQ-2 analog output instead of this profile.
        let heater_spike = 400_i32.saturating_sub(self.tick.min(40) as i32 * 10);
        let jitter = (self.tick % 7) as i32 - 3;
        let phase = self.tick % 480;
        let plume = if phase > 400 {
            ((phase - 400) * 8) as i32
        } else {
            0
        };

        120 + heater_spike + jitter + plume
    }
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("SMOKESENSOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.smokesensor"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<Option<RuntimeConfig>> {
        match tokio::fs::read(&self.runtime_path).await {
            Ok(raw) => Ok(Some(
                RuntimeConfig::from_json(&raw).context("invalid runtime.json")?,
            )),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        if let Some(parent) = self.runtime_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(&self.runtime_path, payload).await?;
        Ok(())
    }
}

fn apply_env_overrides(network: &mut NetworkConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
        network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
