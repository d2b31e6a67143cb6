//! Pure message routing logic for MQTT events
//!
//! This module turns rumqttc events into routing decisions for the
//! supervisor task and interprets SUBACK reason codes.

use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback
                        .return_codes
                        .iter()
                        .map(Self::reason_code_byte)
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::OutgoingDisconnect,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Wire value of a SUBACK reason code (granted QoS, or 0x80 for any failure)
    pub fn reason_code_byte(code: &SubscribeReasonCode) -> u8 {
        match code {
            SubscribeReasonCode::Success(qos) => *qos as u8,
            _ => 0x80,
        }
    }

    /// Validate subscription success from SubAck
    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.is_empty() {
            return Err("Subscription acknowledged without reason codes".to_string());
        }
        if return_codes.iter().any(|&code| code >= 0x80) {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<u8>,
    },
    /// Our DISCONNECT went out during a graceful close
    OutgoingDisconnect,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, Publish, SubAck,
    };
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_route_connack_and_disconnect() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));
    }

    #[test]
    fn test_route_outgoing_packets() {
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::OutgoingDisconnect
        ));
        for outgoing in [Outgoing::Publish(3), Outgoing::PingReq, Outgoing::Subscribe(4)] {
            assert!(matches!(
                MessageHandler::route_mqtt_event(&Event::Outgoing(outgoing)),
                EventRoute::OutgoingEvent
            ));
        }
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: Bytes::from("$/device/dev1"),
            pkid: 1,
            payload: Bytes::from(r#"{"type":"CONTROL"}"#),
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived { topic, payload } => {
                assert_eq!(topic, "$/device/dev1");
                assert_eq!(payload, Bytes::from(r#"{"type":"CONTROL"}"#));
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_suback() {
        let suback = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 7,
            return_codes: vec![
                SubscribeReasonCode::Success(QoS::ExactlyOnce),
                SubscribeReasonCode::NotAuthorized,
            ],
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&suback) {
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                assert_eq!(packet_id, 7);
                assert_eq!(return_codes, vec![0x02, 0x80]);
            }
            other => panic!("Expected SubscriptionConfirmed route, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[0x00, 0x01, 0x02]).is_ok());
        assert!(MessageHandler::validate_subscription_success(&[0x80, 0x81]).is_err());
        assert!(MessageHandler::validate_subscription_success(&[0x00, 0x80]).is_err());
        assert!(MessageHandler::validate_subscription_success(&[]).is_err());
    }
}
