//! Pure routing of raw rumqttc events
//!
//! This module turns rumqttc v5 events into routing decisions and decides which
//! of them the session needs to see as [`EngineEvent`]s.

use super::engine::EngineEvent;
use super::registry::InboundEnvelope;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use tracing::debug;

/// Classifies rumqttc events without touching session state
pub struct MessageHandler;

impl MessageHandler {
    /// Classify one event polled from the rumqttc event loop
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => {
                    if matches!(connack.code, ConnectReturnCode::Success) {
                        EventRoute::ConnectionAcknowledged
                    } else {
                        EventRoute::ConnectionRefused(format!("{:?}", connack.code))
                    }
                }
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::PubAck(puback) => EventRoute::PublishAcknowledged(puback.pkid),
                Packet::PubComp(pubcomp) => EventRoute::PublishAcknowledged(pubcomp.pkid),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: format!("{:?}", suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => EventRoute::PublishWritten(*pkid),
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Session-relevant event for a route, if any (pure function)
    pub fn to_engine_event(route: EventRoute) -> Option<EngineEvent> {
        match route {
            EventRoute::ConnectionAcknowledged => Some(EngineEvent::Connected),
            EventRoute::ConnectionRefused(code) => Some(EngineEvent::Error(format!(
                "Broker refused connection: {code}"
            ))),
            EventRoute::MessageReceived { topic, payload, .. } => {
                Some(EngineEvent::Message(InboundEnvelope::new(topic, payload)))
            }
            EventRoute::Disconnected(reason) => {
                debug!(target: "mqtt_transport", "Broker sent disconnect: {}", reason);
                Some(EngineEvent::Close)
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                debug!(target: "mqtt_transport", "Subscription {} confirmed: {}", packet_id, return_codes);
                None
            }
            EventRoute::PublishWritten(_) | EventRoute::PublishAcknowledged(_) => None,
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                None
            }
            EventRoute::OutgoingEvent => None,
        }
    }
}

/// What a polled rumqttc event means to the session
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck with a success code
    ConnectionAcknowledged,
    /// Broker answered the connect with a failure code
    ConnectionRefused(String),
    /// Inbound PUBLISH
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker-initiated DISCONNECT, with its reason code
    Disconnected(String),
    /// SUBACK
    SubscriptionConfirmed { packet_id: u16, return_codes: String },
    /// One of our PUBLISH packets went out; packet id 0 means QoS 0
    PublishWritten(u16),
    /// PUBACK or PUBCOMP completing one of our publishes
    PublishAcknowledged(u16),
    /// Anything else the broker sent, such as PINGRESP or PUBREC
    InfrastructureEvent(String),
    /// Packets we sent; nothing to do
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, Disconnect, DisconnectReasonCode, PubAck, PubComp, Publish,
    };
    use rumqttc::v5::mqttbytes::QoS;

    fn publish_event(topic: &str, payload: &'static [u8], retain: bool) -> Event {
        Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain,
            topic: Bytes::copy_from_slice(topic.as_bytes()),
            pkid: 1,
            payload: Bytes::from_static(payload),
            properties: None,
        }))
    }

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected(_)
        ));

        match MessageHandler::route_mqtt_event(&publish_event("test/topic", b"test payload", true))
        {
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                assert_eq!(topic, "test/topic");
                assert_eq!(&payload[..], b"test payload");
                assert!(retain);
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_refused_connack_routes_to_error() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::NotAuthorized,
            properties: None,
        }));

        let route = MessageHandler::route_mqtt_event(&connack);
        assert!(matches!(route, EventRoute::ConnectionRefused(_)));
        assert!(matches!(
            MessageHandler::to_engine_event(route),
            Some(EngineEvent::Error(reason)) if reason.contains("NotAuthorized")
        ));
    }

    #[test]
    fn test_to_engine_event() {
        assert_eq!(
            MessageHandler::to_engine_event(EventRoute::ConnectionAcknowledged),
            Some(EngineEvent::Connected)
        );
        assert_eq!(
            MessageHandler::to_engine_event(EventRoute::Disconnected("x".to_string())),
            Some(EngineEvent::Close)
        );
        assert_eq!(
            MessageHandler::to_engine_event(EventRoute::OutgoingEvent),
            None
        );
        assert_eq!(
            MessageHandler::to_engine_event(EventRoute::InfrastructureEvent("PingResp".into())),
            None
        );

        let route = MessageHandler::route_mqtt_event(&publish_event("a/b", b"hello", false));
        assert_eq!(
            MessageHandler::to_engine_event(route),
            Some(EngineEvent::Message(InboundEnvelope::new(
                "a/b",
                Bytes::from_static(b"hello")
            )))
        );
    }

    #[test]
    fn test_publish_progress_routes() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(7))),
            EventRoute::PublishWritten(7)
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PubAck(PubAck::new(7, None)))),
            EventRoute::PublishAcknowledged(7)
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PubComp(PubComp::new(
                9, None
            )))),
            EventRoute::PublishAcknowledged(9)
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
        assert_eq!(
            MessageHandler::to_engine_event(EventRoute::PublishAcknowledged(7)),
            None
        );
    }
}
