//! MQTT link to the battery: telemetry in, set-points out.
//!
//! A single background task drives the rumqttc event loop. It decodes
//! telemetry messages into the [`TelemetryStore`] and resolves publish
//! acknowledgements so [`MqttCommandSink::send`] can wait for the broker's
//! PUBACK.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::domain::{wire_format, CommandError, CommandSink, TelemetryDecoder, TelemetryStore};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Matches QoS 1 publishes to their PUBACK and tracks whether the broker
/// connection is up.
///
/// Every publish accepted by the client holds one slot, in request order,
/// until the event loop reports it with a packet id. A slot outlives its
/// waiter: when a `send` gives up or the connection drops, the slot stays as
/// `None` so later packet ids still land on the right waiter.
#[derive(Debug, Default)]
struct AckTracker {
    connected: bool,
    queued: VecDeque<Option<oneshot::Sender<()>>>,
    in_flight: HashMap<u16, Option<oneshot::Sender<()>>>,
}

impl AckTracker {
    fn enqueue(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(Some(tx));
        rx
    }

    /// Releases the slot of a publish the client refused.
    fn withdraw_last(&mut self) {
        self.queued.pop_back();
    }

    fn assign(&mut self, pkid: u16) {
        // Retransmission after a reconnect keeps its packet id.
        if self.in_flight.contains_key(&pkid) {
            return;
        }
        if let Some(slot) = self.queued.pop_front() {
            self.in_flight.insert(pkid, slot);
        }
    }

    fn acknowledge(&mut self, pkid: u16) {
        if let Some(Some(tx)) = self.in_flight.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    fn set_connected(&mut self) {
        self.connected = true;
    }

    /// Fails every outstanding waiter. Their slots are kept.
    fn set_disconnected(&mut self) {
        self.connected = false;
        for slot in self.queued.iter_mut().chain(self.in_flight.values_mut()) {
            slot.take();
        }
    }

    /// Waiters still listening for an acknowledgement.
    fn pending(&self) -> usize {
        self.queued
            .iter()
            .chain(self.in_flight.values())
            .filter(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
            .count()
    }
}

/// Owns the MQTT client and its event-loop task.
pub struct MqttLink {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    task: JoinHandle<()>,
    command_topic: String,
    ack_timeout: Duration,
}

impl MqttLink {
    /// Starts the event loop. The connection is established (and re-established)
    /// in the background; telemetry is subscribed on every connect.
    pub fn start(cfg: &MqttConfig, store: TelemetryStore) -> Self {
        let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_seconds));
        if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 16);
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let driver = EventDriver {
            client: client.clone(),
            telemetry_topic: cfg.telemetry_topic.clone(),
            decoder: TelemetryDecoder::new(&cfg.soc_field, &cfg.grid_power_field),
            store,
            acks: acks.clone(),
        };
        info!(host = %cfg.host, port = cfg.port, "connecting to MQTT broker");
        let task = tokio::spawn(driver.run(eventloop));

        Self {
            client,
            acks,
            task,
            command_topic: cfg.command_topic.clone(),
            ack_timeout: cfg.ack_timeout(),
        }
    }

    pub fn command_sink(&self) -> MqttCommandSink {
        MqttCommandSink {
            client: self.client.clone(),
            acks: self.acks.clone(),
            topic: self.command_topic.clone(),
            ack_timeout: self.ack_timeout,
        }
    }

    /// Disconnects from the broker and waits briefly for the event loop to
    /// flush the disconnect.
    pub async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "MQTT disconnect request failed");
        }
        let abort = self.task.abort_handle();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            abort.abort();
        }
        info!("MQTT link closed");
    }
}

struct EventDriver {
    client: AsyncClient,
    telemetry_topic: String,
    decoder: TelemetryDecoder,
    store: TelemetryStore,
    acks: Arc<Mutex<AckTracker>>,
}

impl EventDriver {
    async fn run(self, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    self.acks.lock().set_connected();
                    if let Err(e) = self
                        .client
                        .try_subscribe(self.telemetry_topic.clone(), QoS::AtLeastOnce)
                    {
                        error!(topic = %self.telemetry_topic, error = %e, "telemetry subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    info!(topic = %self.telemetry_topic, codes = ?ack.return_codes, "subscribed");
                }
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    if msg.topic == self.telemetry_topic {
                        self.on_telemetry(&msg.payload);
                    }
                }
                Ok(Event::Incoming(Packet::PubAck(ack))) => {
                    self.acks.lock().acknowledge(ack.pkid);
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    self.acks.lock().assign(pkid);
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("disconnect sent");
                    self.acks.lock().set_disconnected();
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.acks.lock().set_disconnected();
                    warn!(error = %e, "MQTT connection error, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    fn on_telemetry(&self, payload: &[u8]) {
        match self.decoder.decode(payload) {
            Ok((soc, grid_power)) => {
                debug!(soc_percent = ?soc, grid_power_w = ?grid_power, "battery telemetry");
                self.store.update(soc, grid_power);
            }
            Err(e) => warn!(error = %e, "ignoring battery telemetry message"),
        }
    }
}

/// Publishes set-points with QoS 1 and waits for the broker acknowledgement.
///
/// Never waits for room in the client's request queue: while the broker is
/// unreachable, or the queue is full, `send` fails right away.
#[derive(Clone)]
pub struct MqttCommandSink {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    topic: String,
    ack_timeout: Duration,
}

#[async_trait]
impl CommandSink for MqttCommandSink {
    async fn send(&self, set_point_w: f64) -> Result<(), CommandError> {
        let payload = wire_format(set_point_w);
        let ack = {
            let mut acks = self.acks.lock();
            if !acks.connected {
                return Err(CommandError::Disconnected);
            }
            let ack = acks.enqueue();
            if let Err(e) = self.client.try_publish(
                self.topic.clone(),
                QoS::AtLeastOnce,
                false,
                payload.clone().into_bytes(),
            ) {
                acks.withdraw_last();
                return Err(CommandError::Publish(e.to_string()));
            }
            ack
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(())) => {
                debug!(topic = %self.topic, %payload, "set-point acknowledged");
                Ok(())
            }
            Ok(Err(_)) => Err(CommandError::Disconnected),
            Err(_) => Err(CommandError::AckTimeout(self.ack_timeout)),
        }
    }
}
