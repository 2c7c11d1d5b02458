//! Pure routing of rumqttc events
//!
//! The bridge only publishes, so incoming traffic is reduced to the handful
//! of signals the session driver cares about. Both the 3.1.1 and the 5.0
//! event types map onto the same [`EventRoute`].

use rumqttc::v5;
use rumqttc::{Event, Packet};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route a 3.1.1 event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged { packet_id: ack.pkid },
                Packet::PubComp(comp) => EventRoute::PublishAcknowledged {
                    packet_id: comp.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Route a 5.0 event
    pub fn route_mqtt5_event(event: &v5::Event) -> EventRoute {
        use rumqttc::v5::mqttbytes::v5::Packet as Packet5;

        match event {
            v5::Event::Incoming(incoming) => match incoming {
                Packet5::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet5::Disconnect(disconnect) => {
                    debug!(reason = ?disconnect.reason_code, "Broker sent DISCONNECT");
                    EventRoute::Disconnected
                }
                Packet5::PubAck(ack) => EventRoute::PublishAcknowledged { packet_id: ack.pkid },
                Packet5::PubComp(comp) => EventRoute::PublishAcknowledged {
                    packet_id: comp.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            v5::Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether the driver loop must stop after this route
    pub fn ends_session(route: &EventRoute) -> bool {
        matches!(route, EventRoute::Disconnected)
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish
    ConnectionAcknowledged,
    /// MQTT broker disconnected
    Disconnected,
    /// Broker confirmed a QoS 1/2 publish
    PublishAcknowledged { packet_id: u16 },
    /// Pings, suback and the like
    InfrastructureEvent(String),
    /// Outgoing traffic from the client
    OutgoingEvent,
}
