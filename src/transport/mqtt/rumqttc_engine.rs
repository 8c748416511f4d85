//! Impure I/O: the rumqttc-backed protocol engine
//!
//! Each connection runs two tasks. The driver polls the rumqttc `EventLoop`
//! and forwards routed events into a channel; the dispatcher feeds them to the
//! session one at a time. Keeping the two apart lets the driver keep polling
//! while the session awaits a subscribe that needs the event loop to make
//! progress.
//!
//! A failed event loop is dropped rather than parked. Requests still queued on
//! its channel fail at once, and `reconnect()` starts a fresh client and event
//! loop. Publishes resolve when the broker acknowledges them: PUBACK for QoS 1,
//! PUBCOMP for QoS 2, and the write itself for QoS 0.

use super::connection::{ConnectOptions, MqttError};
use super::engine::{EngineEvent, ProtocolConnection, ProtocolEngine};
use super::message_handler::{EventRoute, MessageHandler};
use super::session::EventSink;
use crate::config::TlsSection;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Largest packet accepted from or sent to the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Build rumqttc options from engine-independent connection options
pub fn configure_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, MqttError> {
    let mut mqtt_options = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, &password);
    }

    if options.use_tls {
        mqtt_options.set_transport(tls_transport(options.tls.as_ref())?);
    }

    Ok(mqtt_options)
}

fn tls_transport(tls: Option<&TlsSection>) -> Result<RumqttcTransport, MqttError> {
    let Some(tls) = tls else {
        return Ok(RumqttcTransport::tls_with_default_config());
    };

    let ca = read_pem(&tls.ca_file)?;
    let client_auth = match (&tls.client_cert_file, &tls.client_key_file) {
        (Some(cert), Some(key)) => Some((read_pem(cert)?, read_pem(key)?)),
        (None, None) => None,
        _ => {
            return Err(MqttError::Tls(
                "client certificate and key must be configured together".to_string(),
            ))
        }
    };

    Ok(RumqttcTransport::tls(ca, client_auth, None))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|e| MqttError::Tls(format!("{}: {e}", path.display())))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type AckSender = oneshot::Sender<Result<(), MqttError>>;

struct QueuedPublish {
    id: u64,
    qos: QoS,
    ack: AckSender,
}

/// Matches publish requests to the broker acknowledgements for them
///
/// rumqttc writes requests in channel order, so queued publishes are paired
/// with `Outgoing::Publish` notifications first in, first out. Written QoS 1
/// and 2 publishes then wait under their packet id. A packet id can hold two
/// entries when rumqttc resends a collided publish before reporting the ack
/// for the earlier one.
#[derive(Default)]
struct PublishTracker {
    next_id: u64,
    queued: VecDeque<QueuedPublish>,
    in_flight: HashMap<u16, VecDeque<AckSender>>,
}

impl PublishTracker {
    fn enqueue(&mut self, qos: QoS) -> (u64, oneshot::Receiver<Result<(), MqttError>>) {
        self.next_id += 1;
        let (ack, acked) = oneshot::channel();
        self.queued.push_back(QueuedPublish {
            id: self.next_id,
            qos,
            ack,
        });
        (self.next_id, acked)
    }

    /// Forget a publish whose request never reached the event loop
    fn withdraw(&mut self, id: u64) {
        self.queued.retain(|queued| queued.id != id);
    }

    fn on_written(&mut self, pkid: u16) {
        let Some(queued) = self.queued.pop_front() else {
            debug!(target: "mqtt_transport", "Untracked publish {} written", pkid);
            return;
        };

        if queued.qos == QoS::AtMostOnce {
            let _ = queued.ack.send(Ok(()));
        } else {
            self.in_flight.entry(pkid).or_default().push_back(queued.ack);
        }
    }

    fn on_acknowledged(&mut self, pkid: u16) {
        let Some(waiting) = self.in_flight.get_mut(&pkid) else {
            return;
        };
        if let Some(ack) = waiting.pop_front() {
            let _ = ack.send(Ok(()));
        }
        if waiting.is_empty() {
            self.in_flight.remove(&pkid);
        }
    }

    /// Reject every outstanding publish
    fn fail_all(&mut self, reason: &str) {
        let queued = self.queued.drain(..).map(|queued| queued.ack);
        let in_flight = self.in_flight.drain().flat_map(|(_, waiting)| waiting);
        for ack in queued.chain(in_flight) {
            let _ = ack.send(Err(MqttError::Publish(reason.to_string())));
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.queued.len() + self.in_flight.values().map(VecDeque::len).sum::<usize>()
    }
}

/// Protocol engine backed by rumqttc
#[derive(Debug, Clone)]
pub struct RumqttcEngine {
    channel_capacity: usize,
}

impl RumqttcEngine {
    /// `channel_capacity` bounds the queue of requests waiting for the event loop
    pub fn new(channel_capacity: usize) -> Self {
        Self { channel_capacity }
    }
}

impl Default for RumqttcEngine {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProtocolEngine for RumqttcEngine {
    fn open(
        &self,
        options: &ConnectOptions,
        events: EventSink,
    ) -> Result<Arc<dyn ProtocolConnection>, MqttError> {
        let mqtt_options = configure_mqtt_options(options)?;
        Ok(Arc::new(RumqttcConnection::start(
            mqtt_options,
            self.channel_capacity,
            events,
        )))
    }
}

/// State shared by a connection and its driver task
struct Link {
    /// Client for the live event loop; `None` while the loop is down
    client: Mutex<Option<AsyncClient>>,
    publishes: Mutex<PublishTracker>,
    connected: AtomicBool,
    resume: Notify,
}

impl Link {
    fn client(&self) -> Option<AsyncClient> {
        lock(&self.client).clone()
    }

    fn apply(&self, route: &EventRoute) {
        match route {
            EventRoute::ConnectionAcknowledged => self.connected.store(true, Ordering::SeqCst),
            EventRoute::ConnectionRefused(_) | EventRoute::Disconnected(_) => {
                self.connected.store(false, Ordering::SeqCst)
            }
            EventRoute::PublishWritten(pkid) => lock(&self.publishes).on_written(*pkid),
            EventRoute::PublishAcknowledged(pkid) => {
                lock(&self.publishes).on_acknowledged(*pkid)
            }
            _ => {}
        }
    }

    /// Mark the loop as gone and reject everything waiting on it
    fn close(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.client).take();
        lock(&self.publishes).fail_all(reason);
    }
}

/// One rumqttc client plus the tasks driving it
pub struct RumqttcConnection {
    link: Arc<Link>,
    /// Keeps tracker order equal to request channel order
    send_order: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttcConnection {
    fn start(mqtt_options: MqttOptions, capacity: usize, events: EventSink) -> Self {
        let (client, event_loop) = AsyncClient::new(mqtt_options.clone(), capacity);
        let link = Arc::new(Link {
            client: Mutex::new(Some(client)),
            publishes: Mutex::new(PublishTracker::default()),
            connected: AtomicBool::new(false),
            resume: Notify::new(),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(drive_event_loop(
            event_loop,
            EventLoopFactory {
                mqtt_options,
                capacity,
            },
            link.clone(),
            events_tx,
            shutdown_rx,
        ));
        let dispatcher = tokio::spawn(dispatch_events(events_rx, events));

        Self {
            link,
            send_order: tokio::sync::Mutex::new(()),
            shutdown_tx,
            driver: Mutex::new(Some(driver)),
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }
}

struct EventLoopFactory {
    mqtt_options: MqttOptions,
    capacity: usize,
}

impl EventLoopFactory {
    fn build(&self) -> (AsyncClient, EventLoop) {
        AsyncClient::new(self.mqtt_options.clone(), self.capacity)
    }
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    factory: EventLoopFactory,
    link: Arc<Link>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(target: "mqtt_transport", "MQTT event loop started");

    loop {
        let Some(reason) =
            poll_until_failure(&mut event_loop, &link, &events_tx, &mut shutdown_rx).await
        else {
            break;
        };

        drop(event_loop);
        link.close(&format!("connection lost: {reason}"));
        if events_tx.send(EngineEvent::Error(reason)).is_err() {
            return;
        }

        // Wait for the session's backoff before building a new event loop.
        tokio::select! {
            _ = link.resume.notified() => {
                debug!(target: "mqtt_transport", "Resuming MQTT event loop");
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        let (client, fresh) = factory.build();
        *lock(&link.client) = Some(client);
        event_loop = fresh;
    }

    link.close("connection closed");
    debug!(target: "mqtt_transport", "MQTT event loop stopped");
}

/// Poll until the event loop fails, returning the failure
///
/// Returns `None` on shutdown or once the session stopped listening.
async fn poll_until_failure(
    event_loop: &mut EventLoop,
    link: &Link,
    events_tx: &mpsc::UnboundedSender<EngineEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<String> {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return None;
                }
            }
            polled = event_loop.poll() => match polled {
                Ok(event) => {
                    let route = MessageHandler::route_mqtt_event(&event);
                    link.apply(&route);
                    if let Some(event) = MessageHandler::to_engine_event(route) {
                        if events_tx.send(event).is_err() {
                            return None;
                        }
                    }
                }
                Err(e) => return Some(e.to_string()),
            }
        }
    }
}

async fn dispatch_events(mut events_rx: mpsc::UnboundedReceiver<EngineEvent>, events: EventSink) {
    while let Some(event) = events_rx.recv().await {
        events.emit(event).await;
    }
}

#[async_trait]
impl ProtocolConnection for RumqttcConnection {
    async fn subscribe(&self, pattern: &str, qos: QoS) -> Result<(), MqttError> {
        let subscribe_error = |reason: String| MqttError::Subscribe {
            pattern: pattern.to_string(),
            reason,
        };

        let client = self
            .link
            .client()
            .ok_or_else(|| subscribe_error("event loop is down".to_string()))?;
        client
            .subscribe(pattern, qos)
            .await
            .map_err(|e| subscribe_error(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        let acked = {
            let _order = self.send_order.lock().await;
            let client = self
                .link
                .client()
                .ok_or_else(|| MqttError::Publish("event loop is down".to_string()))?;

            let (id, acked) = lock(&self.link.publishes).enqueue(qos);
            if let Err(e) = client.publish(topic, qos, retain, payload).await {
                lock(&self.link.publishes).withdraw(id);
                return Err(MqttError::Publish(e.to_string()));
            }
            acked
        };

        acked.await.unwrap_or_else(|_| {
            Err(MqttError::Publish(
                "connection closed before the broker acknowledged".to_string(),
            ))
        })
    }

    async fn end(&self, force: bool) -> Result<(), MqttError> {
        if let Some(client) = self.link.client() {
            let sent = if force {
                client.try_disconnect()
            } else {
                client.disconnect().await
            };
            if let Err(e) = sent {
                debug!(target: "mqtt_transport", "Disconnect request not queued: {}", e);
            }
        }

        let _ = self.shutdown_tx.send(true);
        let driver = lock(&self.driver).take();

        if let Some(mut handle) = driver {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(_) => info!("MQTT event loop shut down"),
                Err(_) => {
                    warn!("MQTT event loop didn't shut down gracefully, forcing abort");
                    handle.abort();
                }
            }
        }

        self.link.close("connection closed");
        Ok(())
    }

    fn reconnect(&self) -> Result<(), MqttError> {
        if lock(&self.driver).is_none() {
            return Err(MqttError::Connection("connection already ended".to_string()));
        }
        self.link.resume.notify_one();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }
}

impl Drop for RumqttcConnection {
    fn drop(&mut self) {
        for task in [&mut self.driver, &mut self.dispatcher] {
            if let Some(handle) = task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
                handle.abort();
            }
        }
        self.link.close("connection dropped");
    }
}
