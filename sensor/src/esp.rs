use core::convert::TryInto;
use std::{
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    mqtt::client::QoS,
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::Gpio34,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EventPayload, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};

use smokesensor_common::{
    config::NetworkConfig, state_topic, status_topic, Broker, BrokerCredentials, LinkSlot,
    RestartAuthority, RuntimeConfig, SensorSource, SmokeReporter, TickOutcome, STATUS_OFFLINE,
    STATUS_ONLINE,
};

const NVS_NAMESPACE: &str = "smokesensor";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const SMOKE_SENSOR_PIN: i32 = 34;

const TICK_INTERVAL_MS: u64 = 250;
const STATE_PUBLISH_INTERVAL_MS: u64 = 10_000;
const MQTT_CONNECT_WAIT_MS: u64 = 5_000;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

struct AdcSmokeSensor {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
    last_value: i32,
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// MQTT link that is torn down and rebuilt on every reconnect attempt.
struct EspBroker {
    url: String,
    client_id: String,
    credentials: BrokerCredentials,
    availability_topic: String,
    link: LinkSlot<EspMqttClient<'static>>,
}

struct EspRestart;

impl AdcSmokeSensor {
    fn new(adc: ADC1, pin: Gpio34) -> anyhow::Result<Self> {
        let driver = AdcDriver::new(adc)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(driver, pin, &config)?;
        info!("MQ-2 smoke sensor ready on GPIO{}", SMOKE_SENSOR_PIN);

        Ok(Self {
            channel,
            last_value: 0,
        })
    }
}

impl SensorSource for AdcSmokeSensor {
    fn read(&mut self) -> i32 {
        match self.channel.read() {
            Ok(value) => self.last_value = i32::from(value),
            Err(err) => warn!(
                "failed to read smoke sensor on GPIO{}: {err:?}",
                SMOKE_SENSOR_PIN
            ),
        }
        self.last_value
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);

    runtime
        .device
        .validate()
        .context("invalid device configuration")?;
    let credentials =
        BrokerCredentials::from_network(&runtime.network).context("invalid mqtt credentials")?;

    info!(
        "smoke sensor `{}` booting (console {} baud)",
        runtime.device.hostname, runtime.device.baud_rate
    );

    let Peripherals { modem, pins, adc1, .. } = Peripherals::take()?;

    let mut sensor =
        AdcSmokeSensor::new(adc1, pins.gpio34).context("failed to initialize smoke sensor")?;
    // esp_timer counts from boot, so warm-up starts at zero.
    let reporter = SmokeReporter::new(runtime.reporter.clone(), 0);

    let wifi = match connect_wifi(
        modem,
        sys_loop,
        nvs_partition,
        &runtime.device.hostname,
        &runtime.network,
        runtime.device.wifi_timeout_ms,
    ) {
        Ok(wifi) => wifi,
        Err(err) => {
            warn!("wifi startup failed ({err:#}); restarting device");
            EspRestart.restart();
            return Err(err);
        }
    };

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let root_topic = reporter.config().root_topic.clone();
    let mut broker = EspBroker {
        url: format!("mqtt://{}:{}", credentials.host, credentials.port),
        client_id: runtime.device.hostname.clone(),
        credentials,
        availability_topic: status_topic(&root_topic),
        link: LinkSlot::default(),
    };

    if let Err(err) = broker.reconnect() {
        warn!("initial mqtt connect failed: {err:#}");
    }

    // Keep wifi alive for the program lifetime.
    let _wifi = wifi;
    run_reporter_loop(reporter, &mut sensor, &mut broker, &state_topic(&root_topic));
    Ok(())
}

fn run_reporter_loop(
    mut reporter: SmokeReporter,
    sensor: &mut AdcSmokeSensor,
    broker: &mut EspBroker,
    diagnostics_topic: &str,
) {
    let mut restart = EspRestart;
    let mut last_state_publish_ms: Option<u64> = None;

    loop {
        feed_watchdog();

        let now_ms = monotonic_ms();
        let raw = sensor.read();
        let outcome = reporter.on_tick(now_ms, raw, broker, &mut restart);
        log_outcome(&outcome, raw);

        let state_due = last_state_publish_ms
            .map(|last| now_ms.saturating_sub(last) >= STATE_PUBLISH_INTERVAL_MS)
            .unwrap_or(true);
        if state_due && broker.is_connected() {
            last_state_publish_ms = Some(now_ms);
            match serde_json::to_vec(&reporter.status_payload(now_ms)) {
                Ok(body) => {
                    if let Err(err) = broker.publish_retained(diagnostics_topic, &body) {
                        warn!("reporter state publish failed: {err:#}");
                    }
                }
                Err(err) => warn!("reporter state serialization failed: {err}"),
            }
        }

        thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
    }
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
        | TickOutcome::GaveUp => debug!("reading {raw} held ({})", outcome.as_str()),
    }
}

impl Broker for EspBroker {
    type Error = anyhow::Error;

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    fn reconnect(&mut self) -> anyhow::Result<()> {
        // Dropping the old client ends its connection thread.
        let connected = self.link.begin();

        let conf = MqttClientConfiguration {
            client_id: Some(self.client_id.as_str()),
            username: if self.credentials.has_login() {
                Some(self.credentials.user.as_str())
            } else {
                None
            },
            password: if self.credentials.pass.is_empty() {
                None
            } else {
                Some(self.credentials.pass.as_str())
            },
            lwt: Some(LwtConfiguration {
                topic: self.availability_topic.as_str(),
                payload: STATUS_OFFLINE.as_bytes(),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            ..Default::default()
        };

        let (mut client, mut conn) = EspMqttClient::new(&self.url, &conf)?;

        let poll_connected = connected.clone();
        thread::Builder::new()
            .name("mqtt-poll".to_string())
            .stack_size(8192)
            .spawn(move || {
                while let Ok(event) = conn.next() {
                    match event.payload() {
                        EventPayload::Connected(_) => poll_connected.set(true),
                        EventPayload::Disconnected => poll_connected.set(false),
                        EventPayload::Error(err) => warn!("sensor mqtt error: {err:?}"),
                        _ => {}
                    }
                }
                poll_connected.set(false);
            })
            .context("failed to spawn mqtt thread")?;

        let deadline = Instant::now() + Duration::from_millis(MQTT_CONNECT_WAIT_MS);
        while !connected.is_up() {
            if Instant::now() >= deadline {
                return Err(anyhow!(
                    "no CONNACK from {} within {MQTT_CONNECT_WAIT_MS} ms",
                    self.url
                ));
            }
            feed_watchdog();
            thread::sleep(Duration::from_millis(100));
        }

        if let Err(err) = client.publish(
            &self.availability_topic,
            QoS::AtLeastOnce,
            true,
            STATUS_ONLINE.as_bytes(),
        ) {
            warn!("failed to publish sensor online status: {err:?}");
        }

        self.link.install(client, connected);
        info!("mqtt connected to {}", self.url);
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> anyhow::Result<()> {
        let client = self
            .link
            .client_mut()
            .ok_or_else(|| anyhow!("mqtt client not connected"))?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes())
            .map_err(|err| anyhow!("mqtt publish failed: {err:?}"))?;
        Ok(())
    }
}

impl EspBroker {
    fn publish_retained(&mut self, topic: &str, body: &[u8]) -> anyhow::Result<()> {
        let client = self
            .link
            .client_mut()
            .ok_or_else(|| anyhow!("mqtt client not connected"))?;
        client
            .publish(topic, QoS::AtLeastOnce, true, body)
            .map_err(|err| anyhow!("mqtt publish failed: {err:?}"))?;
        Ok(())
    }
}

impl RestartAuthority for EspRestart {
    fn restart(&mut self) {
        warn!("restarting device for recovery");
        thread::sleep(Duration::from_millis(100));
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    hostname: &str,
    network: &NetworkConfig,
    timeout_ms: u64,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    esp_wifi
        .sta_netif_mut()
        .set_hostname(hostname)
        .context("failed to set wifi hostname")?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut attempt = 0_u32;
    loop {
        attempt = attempt.saturating_add(1);
        info!("wifi connect attempt {attempt}");

        let result = wifi.connect().and_then(|()| wifi.wait_netif_up());
        match result {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                break;
            }
            Err(err) => warn!("wifi connect failed on attempt {attempt}: {err:#}"),
        }

        if Instant::now() >= deadline {
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            return Err(anyhow!("wifi not connected within {timeout_ms} ms"));
        }

        let _ = wifi.disconnect();
        thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
    }

    drop(wifi);
    Ok(esp_wifi)
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(RuntimeConfig::from_json(value.as_bytes())?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn monotonic_ms() -> u64 {
    let micros = unsafe { esp_idf_svc::sys::esp_timer_get_time() };
    u64::try_from(micros / 1_000).unwrap_or(0)
}
