//! Kameo-based network resilience layer: request tracking with retries, heartbeats, link quality
//! scoring and a supervised connection state machine over a pluggable transport.

pub mod client;
pub mod core;
pub mod testing;
pub mod transport;

pub use client::{LinkActor, LinkActorArgs, LinkClient, LinkEvent, LinkObserver};
pub use core::{
    ConnectionState, Credentials, FailureReason, LinkConfig, LinkError, LinkResult, LinkSettings,
    QualityLevel, RequestId, RequestSpec,
};
pub use transport::{LinkTransport, TransportCall, TransportFailure, TransportResponse};
