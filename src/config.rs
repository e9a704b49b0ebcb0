//! Stack configuration.
//!
//! Every limit and timer of the transaction core lives in [`StackConfig`].
//! The defaults follow the Device object defaults of ASHRAE 135 (APDU timeout
//! 3 s, 3 retries, segment timeout 2 s) and a BACnet/IP sized max-APDU.

use std::time::Duration;

use crate::app::MAX_APDU_LENGTH;
use crate::datalink::DataLinkAddress;
use crate::service::Segmentation;

/// A binding that never expires, given at start-up
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StaticBinding {
    pub device_instance: u32,
    pub address: DataLinkAddress,
    /// Remote network number and station, when the device sits behind a router
    pub network: Option<(u16, Vec<u8>)>,
    pub max_apdu: usize,
    pub segmentation: Segmentation,
}

/// Configuration of a [`Stack`](crate::stack::Stack)
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StackConfig {
    /// Largest APDU this node sends or accepts
    pub max_apdu_length: usize,
    /// Segmentation this node supports
    pub segmentation: Segmentation,
    /// Time to wait for a reply to a confirmed request
    pub apdu_timeout: Duration,
    /// Retransmissions of a confirmed request before giving up
    pub apdu_retries: u8,
    /// Time to wait for a Segment-ACK or the next segment
    pub segment_timeout: Duration,
    /// Window size proposed when sending segments
    pub proposed_window_size: u8,
    /// Segments this node accepts in one message
    pub max_segments_accepted: usize,
    /// Upper bound on a reassembled message
    pub max_reassembled_apdu: usize,
    /// Number of transaction slots
    pub max_transactions: usize,
    /// Time a service handler may hold a deferred response
    pub responder_timeout: Duration,
    /// Lifetime of bindings learned from I-Am
    pub binding_ttl: Duration,
    /// Capacity of the address binding table
    pub max_bindings: usize,
    /// Create bindings from inbound I-Am
    pub learn_bindings: bool,
    pub static_bindings: Vec<StaticBinding>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_apdu_length: MAX_APDU_LENGTH,
            segmentation: Segmentation::Both,
            apdu_timeout: Duration::from_millis(3000),
            apdu_retries: 3,
            segment_timeout: Duration::from_millis(2000),
            proposed_window_size: 4,
            max_segments_accepted: 64,
            max_reassembled_apdu: 16 * 1024,
            max_transactions: 64,
            responder_timeout: Duration::from_millis(10_000),
            binding_ttl: Duration::from_secs(600),
            max_bindings: 128,
            learn_bindings: true,
            static_bindings: Vec::new(),
        }
    }
}
