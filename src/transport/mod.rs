//! Transport layer for broker communication
//!
//! This module holds the managed MQTT client: the session state machine,
//! the topic-matching engine and the protocol engine adapter it drives.

pub mod mqtt;
