//! Transaction State Machine.
//!
//! A [`TransactionPool`] owns a fixed number of transaction slots. Each live
//! slot is either an *originator* (this node sent a confirmed request and
//! waits for its reply) or a *responder* (a peer sent one and the application
//! has not answered yet).
//!
//! The pool never touches the network or the clock. Every entry point takes
//! the current time and a [`TsmActions`] collector; frames to transmit,
//! finished transactions and newly arrived requests are pushed there for the
//! caller to act on.
//!
//! Guarantees:
//!
//! - An originator transaction ends exactly once, with one [`Outcome`], and its
//!   invoke id is released at that moment.
//! - A slot is found only through its invoke id, peer route and role; replies
//!   that match nothing are counted and dropped.
//! - Handles carry the slot's generation, so a handle kept past the end of its
//!   transaction cannot act on whatever reuses the slot.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use thiserror::Error;

use super::invoke_id::InvokeIdAllocator;
use super::segmentation::{
    OutboundSegments, Reassembly, SegmentAccept, SegmentationError, WindowAck,
};
use super::{
    Apdu, MaxApduSize, MaxSegments, SegmentHeader, COMPLEX_ACK_SEGMENT_HEADER_LEN,
    CONFIRMED_SEGMENT_HEADER_LEN,
};
use crate::config::StackConfig;
use crate::network::{NpciData, Route};
use crate::service::{AbortReason, RejectReason, Segmentation, ServiceResponse};

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TsmError>;

/// Header octets of an unsegmented confirmed request
const CONFIRMED_REQUEST_HEADER_LEN: usize = 4;

/// Header octets of an unsegmented ComplexACK
const COMPLEX_ACK_HEADER_LEN: usize = 3;

/// Immediate, recoverable failures of pool operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TsmError {
    #[error("no free transaction slot")]
    NoSlotAvailable,
    #[error("no free invoke id")]
    NoInvokeIdAvailable,
    #[error("APDU of {length} bytes exceeds the peer's max-APDU of {max_apdu} and cannot be segmented")]
    ApduTooLong { length: usize, max_apdu: usize },
    #[error("transaction handle no longer refers to a live transaction")]
    StaleHandle,
    #[error("segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),
}

/// Terminal result of an originator transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// SimpleACK (empty payload) or ComplexACK service data
    Ack(Vec<u8>),
    Error { class: u32, code: u32 },
    Reject(RejectReason),
    Abort(AbortReason),
    Timeout,
    Cancelled,
    SegmentationError,
}

/// Per-request completion callback
pub type CompletionCallback = Box<dyn FnOnce(u8, Outcome) + Send>;

/// A finished originator transaction
pub struct Completion {
    pub invoke_id: u8,
    pub peer: Route,
    pub outcome: Outcome,
    pub callback: Option<CompletionCallback>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("invoke_id", &self.invoke_id)
            .field("peer", &self.peer)
            .field("outcome", &self.outcome)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// A frame the pool wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub route: Route,
    pub npci: NpciData,
    pub apdu: Vec<u8>,
}

/// A confirmed request ready for the application
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub handle: ResponderHandle,
    pub source: Route,
    pub service_choice: u8,
    pub service_data: Vec<u8>,
}

/// Everything a pool operation asks its caller to do
#[derive(Debug, Default)]
pub struct TsmActions {
    pub transmit: Vec<Transmit>,
    pub completions: Vec<Completion>,
    pub requests: Vec<InboundRequest>,
}

impl TsmActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.transmit.is_empty() && self.completions.is_empty() && self.requests.is_empty()
    }

    fn send(&mut self, route: Route, expecting_reply: bool, apdu: &Apdu) {
        let npci = if expecting_reply {
            NpciData::expecting_reply()
        } else {
            NpciData::default()
        };
        self.transmit.push(Transmit {
            route,
            npci,
            apdu: apdu.encode(),
        });
    }

    fn abort(&mut self, route: Route, invoke_id: u8, server: bool, reason: AbortReason) {
        self.send(
            route,
            false,
            &Apdu::Abort {
                server,
                invoke_id,
                abort_reason: reason.into(),
            },
        );
    }

    fn segment_ack(&mut self, route: Route, invoke_id: u8, server: bool, sequence_number: u8, window_size: u8) {
        self.send(
            route,
            false,
            &Apdu::SegmentAck {
                negative: false,
                server,
                invoke_id,
                sequence_number,
                window_size,
            },
        );
    }
}

/// Pool counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TsmStatistics {
    pub acquired: u64,
    pub completed_ack: u64,
    pub completed_error: u64,
    pub completed_reject: u64,
    pub completed_abort: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub segmentation_errors: u64,
    pub retries: u64,
    pub unmatched_replies: u64,
    pub unexpected_pdus: u64,
    pub duplicate_requests: u64,
    pub requests_received: u64,
    pub responder_timeouts: u64,
    pub peer_aborts: u64,
    pub pool_exhausted: u64,
    pub segments_sent: u64,
    pub segments_received: u64,
}

impl TsmStatistics {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Ack(_) => self.completed_ack += 1,
            Outcome::Error { .. } => self.completed_error += 1,
            Outcome::Reject(_) => self.completed_reject += 1,
            Outcome::Abort(_) => self.completed_abort += 1,
            Outcome::Timeout => self.timeouts += 1,
            Outcome::Cancelled => self.cancelled += 1,
            Outcome::SegmentationError => self.segmentation_errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Originator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    /// Acquired, invoke id held, nothing sent yet
    Allocated,
    AwaitingConfirmation,
    SegmentedTransmit,
    SegmentedReceive,
    AwaitingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotId {
    index: usize,
    generation: u32,
    invoke_id: u8,
}

/// Originator slot obtained from [`TransactionPool::acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHandle(SlotId);

impl TransactionHandle {
    pub fn invoke_id(&self) -> u8 {
        self.0.invoke_id
    }
}

/// Responder slot of a confirmed request waiting for its answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponderHandle(SlotId);

impl ResponderHandle {
    pub fn invoke_id(&self) -> u8 {
        self.0.invoke_id
    }
}

/// What [`TransactionPool::send`] transmits
pub struct OriginatorRequest {
    pub service_choice: u8,
    pub service_data: Vec<u8>,
    pub retry_limit: u8,
    pub timeout: Duration,
    /// Segmentation the peer announced in its I-Am
    pub peer_segmentation: Segmentation,
    pub callback: Option<CompletionCallback>,
}

impl OriginatorRequest {
    pub fn new(service_choice: u8, service_data: Vec<u8>, retry_limit: u8, timeout: Duration) -> Self {
        Self {
            service_choice,
            service_data,
            retry_limit,
            timeout,
            peer_segmentation: Segmentation::NoSegmentation,
            callback: None,
        }
    }
}

struct TransactionSlot {
    generation: u32,
    state: TransactionState,
    role: Role,
    invoke_id: u8,
    peer: Route,
    peer_max_apdu: usize,
    service_choice: u8,
    retry_count: u8,
    segment_retries: u8,
    retry_limit: u8,
    timeout: Duration,
    deadline: Option<Instant>,
    request: Vec<u8>,
    outbound: Option<OutboundSegments>,
    reassembly: Option<Reassembly>,
    callback: Option<CompletionCallback>,
    segmented_response_accepted: bool,
    peer_max_segments: Option<usize>,
}

impl TransactionSlot {
    fn idle(generation: u32) -> Self {
        Self {
            generation,
            state: TransactionState::Idle,
            role: Role::Originator,
            invoke_id: super::invoke_id::NO_INVOKE_ID,
            peer: Route::local_broadcast(),
            peer_max_apdu: 0,
            service_choice: 0,
            retry_count: 0,
            segment_retries: 0,
            retry_limit: 0,
            timeout: Duration::ZERO,
            deadline: None,
            request: Vec::new(),
            outbound: None,
            reassembly: None,
            callback: None,
            segmented_response_accepted: false,
            peer_max_segments: None,
        }
    }

    fn is_live(&self) -> bool {
        self.state != TransactionState::Idle
    }

    fn id(&self, index: usize) -> SlotId {
        SlotId {
            index,
            generation: self.generation,
            invoke_id: self.invoke_id,
        }
    }

    /// Drop every resource and bump the generation
    fn reset(&mut self) {
        *self = Self::idle(self.generation.wrapping_add(1));
    }
}

#[derive(Debug, Clone)]
struct PoolSettings {
    segmentation: Segmentation,
    max_apdu: usize,
    proposed_window_size: u8,
    max_segments_accepted: usize,
    max_reassembled_apdu: usize,
    segment_timeout: Duration,
    responder_timeout: Duration,
    apdu_retries: u8,
}

/// Fixed-size pool of transaction slots
pub struct TransactionPool {
    slots: Vec<TransactionSlot>,
    invoke_ids: InvokeIdAllocator,
    settings: PoolSettings,
    stats: TsmStatistics,
}

impl fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionPool")
            .field("slots", &self.slots.len())
            .field("live", &self.live_count())
            .field("stats", &self.stats)
            .finish()
    }
}

impl TransactionPool {
    pub fn new(config: &StackConfig) -> Self {
        Self {
            slots: (0..config.max_transactions)
                .map(|_| TransactionSlot::idle(0))
                .collect(),
            invoke_ids: InvokeIdAllocator::new(),
            settings: PoolSettings {
                segmentation: config.segmentation,
                max_apdu: config.max_apdu_length,
                proposed_window_size: config.proposed_window_size,
                max_segments_accepted: config.max_segments_accepted,
                max_reassembled_apdu: config.max_reassembled_apdu,
                segment_timeout: config.segment_timeout,
                responder_timeout: config.responder_timeout,
                apdu_retries: config.apdu_retries,
            },
            stats: TsmStatistics::default(),
        }
    }

    pub fn statistics(&self) -> &TsmStatistics {
        &self.stats
    }

    /// Slots currently in use
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_live()).count()
    }

    /// Invoke ids currently held by originators
    pub fn invoke_ids_in_use(&self) -> usize {
        self.invoke_ids.in_use_count()
    }

    /// State of the originator transaction holding `invoke_id`
    pub fn originator_state(&self, invoke_id: u8) -> Option<TransactionState> {
        self.slots
            .iter()
            .find(|slot| slot.is_live() && slot.role == Role::Originator && slot.invoke_id == invoke_id)
            .map(|slot| slot.state)
    }

    /// Whether a responder handle still awaits its answer
    pub fn is_pending(&self, handle: &ResponderHandle) -> bool {
        self.resolve(handle.0)
            .is_some_and(|index| self.slots[index].state == TransactionState::AwaitingResponse)
    }

    fn resolve(&self, id: SlotId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        (slot.is_live() && slot.generation == id.generation).then_some(id.index)
    }

    fn find(&self, invoke_id: u8, peer: &Route, role: Role) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.is_live()
                && slot.state != TransactionState::Allocated
                && slot.role == role
                && slot.invoke_id == invoke_id
                && slot.peer == *peer
        })
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.is_live())
    }

    /// Reserve a slot and an invoke id for a request to `peer`.
    pub fn acquire(&mut self, peer: Route, peer_max_apdu: usize) -> Result<TransactionHandle> {
        let Some(index) = self.free_slot() else {
            self.stats.pool_exhausted += 1;
            warn!("transaction pool exhausted ({} slots)", self.slots.len());
            return Err(TsmError::NoSlotAvailable);
        };

        let invoke_id = self.invoke_ids.next_free().map_err(|_| {
            warn!("no invoke id available for request to {}", peer);
            TsmError::NoInvokeIdAvailable
        })?;

        let slot = &mut self.slots[index];
        slot.state = TransactionState::Allocated;
        slot.role = Role::Originator;
        slot.invoke_id = invoke_id;
        slot.peer = peer;
        slot.peer_max_apdu = peer_max_apdu.min(self.settings.max_apdu);
        self.stats.acquired += 1;

        debug!("acquired invoke id {} for {}", invoke_id, peer);
        Ok(TransactionHandle(slot.id(index)))
    }

    /// Return a slot to idle and free its invoke id, without an outcome.
    ///
    /// Returns `false` when the handle is stale.
    pub fn release(&mut self, handle: TransactionHandle) -> bool {
        match self.resolve(handle.0) {
            Some(index) => {
                self.release_index(index);
                true
            }
            None => false,
        }
    }

    fn release_index(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if !slot.is_live() {
            return;
        }
        if slot.role == Role::Originator {
            self.invoke_ids.release(slot.invoke_id);
        }
        slot.reset();
    }

    fn complete(&mut self, index: usize, outcome: Outcome, actions: &mut TsmActions) {
        let slot = &mut self.slots[index];
        if !slot.is_live() || slot.role != Role::Originator {
            return;
        }

        debug!(
            "invoke id {} to {} completed: {:?}",
            slot.invoke_id, slot.peer, outcome
        );
        self.stats.record(&outcome);
        actions.completions.push(Completion {
            invoke_id: slot.invoke_id,
            peer: slot.peer,
            outcome,
            callback: slot.callback.take(),
        });
        self.release_index(index);
    }

    fn advertised_max_segments(&self) -> MaxSegments {
        MaxSegments::for_count(self.settings.max_segments_accepted)
    }

    /// Transmit a confirmed request on an acquired slot.
    ///
    /// A request larger than the peer's max-APDU is segmented when both ends
    /// support it; otherwise the slot is released and [`TsmError::ApduTooLong`]
    /// returned.
    pub fn send(
        &mut self,
        handle: TransactionHandle,
        request: OriginatorRequest,
        now: Instant,
        actions: &mut TsmActions,
    ) -> Result<u8> {
        let index = self
            .resolve(handle.0)
            .filter(|index| self.slots[*index].state == TransactionState::Allocated)
            .ok_or(TsmError::StaleHandle)?;

        let segmented_response_accepted = self.settings.segmentation.can_receive();
        let max_segments = self.advertised_max_segments();
        let max_response_size = MaxApduSize::for_length(self.settings.max_apdu);
        let peer_max_apdu = self.slots[index].peer_max_apdu;
        let length = CONFIRMED_REQUEST_HEADER_LEN + request.service_data.len();

        let outbound = if length <= peer_max_apdu {
            None
        } else if self.settings.segmentation.can_transmit() && request.peer_segmentation.can_receive() {
            let segment_size = peer_max_apdu.saturating_sub(CONFIRMED_SEGMENT_HEADER_LEN);
            match OutboundSegments::new(
                request.service_data.clone(),
                segment_size,
                self.settings.proposed_window_size,
                None,
            ) {
                Ok(outbound) => Some(outbound),
                Err(err) => {
                    self.release_index(index);
                    return Err(err.into());
                }
            }
        } else {
            warn!(
                "request of {} bytes exceeds max-APDU {} of {} and cannot be segmented",
                length, peer_max_apdu, self.slots[index].peer
            );
            self.release_index(index);
            return Err(TsmError::ApduTooLong {
                length,
                max_apdu: peer_max_apdu,
            });
        };

        let slot = &mut self.slots[index];
        slot.service_choice = request.service_choice;
        slot.retry_count = 0;
        slot.segment_retries = 0;
        slot.retry_limit = request.retry_limit;
        slot.timeout = request.timeout;
        slot.callback = request.callback;
        slot.segmented_response_accepted = segmented_response_accepted;

        let invoke_id = slot.invoke_id;
        match outbound {
            None => {
                let apdu = Apdu::ConfirmedRequest {
                    segment: None,
                    segmented_response_accepted,
                    max_segments,
                    max_response_size,
                    invoke_id,
                    service_choice: request.service_choice,
                    service_data: request.service_data,
                };
                slot.request = apdu.encode();
                slot.state = TransactionState::AwaitingConfirmation;
                slot.deadline = Some(now + slot.timeout);
                actions.transmit.push(Transmit {
                    route: slot.peer,
                    npci: NpciData::expecting_reply(),
                    apdu: slot.request.clone(),
                });
                debug!("sent invoke id {} to {}", invoke_id, slot.peer);
            }
            Some(outbound) => {
                debug!(
                    "sending invoke id {} to {} in {} segments",
                    invoke_id,
                    slot.peer,
                    outbound.segment_count()
                );
                slot.outbound = Some(outbound);
                slot.state = TransactionState::SegmentedTransmit;
                slot.deadline = Some(now + self.settings.segment_timeout);
                self.send_window(index, actions);
            }
        }

        Ok(invoke_id)
    }

    /// Transmit every segment of the window in flight
    fn send_window(&mut self, index: usize, actions: &mut TsmActions) {
        let max_segments = self.advertised_max_segments();
        let max_response_size = MaxApduSize::for_length(self.settings.max_apdu);
        let slot = &self.slots[index];
        let Some(outbound) = slot.outbound.as_ref() else {
            return;
        };

        for segment in outbound.current_window() {
            let (header, data) = outbound.segment(segment);
            let apdu = match slot.role {
                Role::Originator => Apdu::ConfirmedRequest {
                    segment: Some(header),
                    segmented_response_accepted: slot.segmented_response_accepted,
                    max_segments,
                    max_response_size,
                    invoke_id: slot.invoke_id,
                    service_choice: slot.service_choice,
                    service_data: data.to_vec(),
                },
                Role::Responder => Apdu::ComplexAck {
                    segment: Some(header),
                    invoke_id: slot.invoke_id,
                    service_choice: slot.service_choice,
                    service_data: data.to_vec(),
                },
            };
            trace!(
                "segment {} of invoke id {} to {}",
                header.sequence_number,
                slot.invoke_id,
                slot.peer
            );
            actions.send(slot.peer, slot.role == Role::Originator, &apdu);
            self.stats.segments_sent += 1;
        }
    }

    /// Force `Cancelled` on an originator transaction.
    ///
    /// Returns `false` if the transaction already ended.
    pub fn cancel(&mut self, handle: TransactionHandle, actions: &mut TsmActions) -> bool {
        match self.resolve(handle.0) {
            Some(index) => {
                self.complete(index, Outcome::Cancelled, actions);
                true
            }
            None => false,
        }
    }

    /// Force `Cancelled` on the live originator transaction holding `invoke_id`.
    pub fn cancel_invoke_id(&mut self, invoke_id: u8, actions: &mut TsmActions) -> bool {
        let index = self.slots.iter().position(|slot| {
            slot.is_live() && slot.role == Role::Originator && slot.invoke_id == invoke_id
        });
        match index {
            Some(index) => {
                self.complete(index, Outcome::Cancelled, actions);
                true
            }
            None => false,
        }
    }

    /// Advance every timer to `now`.
    pub fn tick(&mut self, now: Instant, actions: &mut TsmActions) {
        for index in 0..self.slots.len() {
            let slot = &self.slots[index];
            let expired = slot.is_live() && slot.deadline.is_some_and(|deadline| deadline <= now);
            if expired {
                self.expire(index, now, actions);
            }
        }
    }

    fn expire(&mut self, index: usize, now: Instant, actions: &mut TsmActions) {
        let segment_timeout = self.settings.segment_timeout;
        let slot = &mut self.slots[index];

        match (slot.role, slot.state) {
            (Role::Originator, TransactionState::AwaitingConfirmation) => {
                if slot.retry_count >= slot.retry_limit {
                    self.complete(index, Outcome::Timeout, actions);
                    return;
                }

                slot.retry_count += 1;
                self.stats.retries += 1;
                debug!(
                    "retransmitting invoke id {} to {} (retry {}/{})",
                    slot.invoke_id, slot.peer, slot.retry_count, slot.retry_limit
                );

                if let Some(outbound) = slot.outbound.as_mut() {
                    // The whole segmented request goes again
                    outbound.restart();
                    slot.segment_retries = 0;
                    slot.state = TransactionState::SegmentedTransmit;
                    slot.deadline = Some(now + segment_timeout);
                    self.send_window(index, actions);
                } else {
                    slot.deadline = Some(now + slot.timeout);
                    actions.transmit.push(Transmit {
                        route: slot.peer,
                        npci: NpciData::expecting_reply(),
                        apdu: slot.request.clone(),
                    });
                }
            }

            (_, TransactionState::SegmentedTransmit) => {
                if slot.segment_retries >= slot.retry_limit {
                    let role = slot.role;
                    match role {
                        Role::Originator => self.complete(index, Outcome::Timeout, actions),
                        Role::Responder => {
                            debug!(
                                "segmented response for invoke id {} to {} unacknowledged, dropping",
                                slot.invoke_id, slot.peer
                            );
                            self.release_index(index);
                        }
                    }
                    return;
                }

                slot.segment_retries += 1;
                slot.deadline = Some(now + segment_timeout);
                self.stats.retries += 1;
                debug!(
                    "resending segment window of invoke id {} to {}",
                    slot.invoke_id, slot.peer
                );
                self.send_window(index, actions);
            }

            (Role::Originator, TransactionState::SegmentedReceive) => {
                actions.abort(slot.peer, slot.invoke_id, false, AbortReason::TsmTimeout);
                self.complete(index, Outcome::Timeout, actions);
            }

            (Role::Responder, TransactionState::SegmentedReceive) => {
                debug!(
                    "segmented request invoke id {} from {} timed out, dropping",
                    slot.invoke_id, slot.peer
                );
                self.release_index(index);
            }

            (Role::Responder, TransactionState::AwaitingResponse) => {
                warn!(
                    "no response to invoke id {} from {} in time, aborting",
                    slot.invoke_id, slot.peer
                );
                actions.abort(
                    slot.peer,
                    slot.invoke_id,
                    true,
                    AbortReason::ApplicationExceededReplyTime,
                );
                self.stats.responder_timeouts += 1;
                self.release_index(index);
            }

            _ => slot.deadline = None,
        }
    }

    /// Correlate a reply-type APDU (ACK, Error, Reject, Abort, Segment-ACK).
    ///
    /// Returns `false` when nothing matched; the reply is dropped.
    pub fn on_reply(&mut self, source: &Route, apdu: Apdu, now: Instant, actions: &mut TsmActions) -> bool {
        let Some(invoke_id) = apdu.invoke_id() else {
            return false;
        };

        // Segment-ACK and Abort flag which side sent them
        let role = match &apdu {
            Apdu::SegmentAck { server: false, .. } | Apdu::Abort { server: false, .. } => Role::Responder,
            Apdu::ConfirmedRequest { .. } | Apdu::UnconfirmedRequest { .. } => return false,
            _ => Role::Originator,
        };

        let Some(index) = self.find(invoke_id, source, role) else {
            self.stats.unmatched_replies += 1;
            debug!(
                "dropping unmatched {:?} for invoke id {} from {}",
                apdu.pdu_type(),
                invoke_id,
                source
            );
            return false;
        };

        match role {
            Role::Originator => self.originator_reply(index, apdu, now, actions),
            Role::Responder => self.responder_reply(index, apdu, now, actions),
        }
        true
    }

    fn originator_reply(&mut self, index: usize, apdu: Apdu, now: Instant, actions: &mut TsmActions) {
        let state = self.slots[index].state;
        let awaiting = matches!(
            state,
            TransactionState::AwaitingConfirmation | TransactionState::SegmentedTransmit
        );

        match apdu {
            Apdu::Abort { abort_reason, .. } => {
                self.complete(index, Outcome::Abort(abort_reason.into()), actions);
            }
            Apdu::SimpleAck { .. } if awaiting => {
                self.complete(index, Outcome::Ack(Vec::new()), actions);
            }
            Apdu::Error {
                error_class,
                error_code,
                ..
            } if awaiting => {
                self.complete(
                    index,
                    Outcome::Error {
                        class: error_class,
                        code: error_code,
                    },
                    actions,
                );
            }
            Apdu::Reject { reject_reason, .. } if awaiting => {
                self.complete(index, Outcome::Reject(reject_reason.into()), actions);
            }
            Apdu::ComplexAck {
                segment: None,
                service_data,
                ..
            } if awaiting => {
                self.complete(index, Outcome::Ack(service_data), actions);
            }
            Apdu::ComplexAck {
                segment: Some(header),
                service_data,
                ..
            } if awaiting || state == TransactionState::SegmentedReceive => {
                self.receive_ack_segment(index, header, &service_data, now, actions);
            }
            Apdu::SegmentAck {
                negative,
                sequence_number,
                window_size,
                ..
            } if state == TransactionState::SegmentedTransmit => {
                self.window_ack(index, sequence_number, window_size, negative, now, actions);
            }
            other => {
                self.stats.unexpected_pdus += 1;
                debug!(
                    "ignoring {:?} for invoke id {} in state {:?}",
                    other.pdu_type(),
                    self.slots[index].invoke_id,
                    state
                );
            }
        }
    }

    fn responder_reply(&mut self, index: usize, apdu: Apdu, now: Instant, actions: &mut TsmActions) {
        match apdu {
            Apdu::Abort { abort_reason, .. } => {
                let slot = &self.slots[index];
                debug!(
                    "peer {} aborted invoke id {}: {}",
                    slot.peer,
                    slot.invoke_id,
                    AbortReason::from(abort_reason)
                );
                self.stats.peer_aborts += 1;
                self.release_index(index);
            }
            Apdu::SegmentAck {
                negative,
                sequence_number,
                window_size,
                ..
            } if self.slots[index].state == TransactionState::SegmentedTransmit => {
                self.window_ack(index, sequence_number, window_size, negative, now, actions);
            }
            other => {
                self.stats.unexpected_pdus += 1;
                debug!("ignoring {:?} for responder slot", other.pdu_type());
            }
        }
    }

    fn window_ack(
        &mut self,
        index: usize,
        sequence_number: u8,
        window_size: u8,
        negative: bool,
        now: Instant,
        actions: &mut TsmActions,
    ) {
        let segment_timeout = self.settings.segment_timeout;
        let slot = &mut self.slots[index];
        let Some(outbound) = slot.outbound.as_mut() else {
            return;
        };

        match outbound.acknowledge(sequence_number, window_size, negative) {
            WindowAck::Ignored => {
                trace!(
                    "segment ack {} outside window of invoke id {}",
                    sequence_number,
                    slot.invoke_id
                );
            }
            WindowAck::Advanced | WindowAck::Retransmit => {
                slot.segment_retries = 0;
                slot.deadline = Some(now + segment_timeout);
                self.send_window(index, actions);
            }
            WindowAck::Finished => match slot.role {
                Role::Originator => {
                    slot.state = TransactionState::AwaitingConfirmation;
                    slot.deadline = Some(now + slot.timeout);
                }
                Role::Responder => {
                    debug!(
                        "segmented response for invoke id {} to {} delivered",
                        slot.invoke_id, slot.peer
                    );
                    self.release_index(index);
                }
            },
        }
    }

    /// Segment of a ComplexACK answering one of our requests
    fn receive_ack_segment(
        &mut self,
        index: usize,
        header: SegmentHeader,
        data: &[u8],
        now: Instant,
        actions: &mut TsmActions,
    ) {
        let settings = self.settings.clone();
        let slot = &mut self.slots[index];
        self.stats.segments_received += 1;

        let accepted = match slot.reassembly.as_mut() {
            Some(reassembly) => reassembly.accept(header, data),
            None if !slot.segmented_response_accepted => {
                warn!(
                    "segmented ComplexACK for invoke id {} from {} although segmentation was not offered",
                    slot.invoke_id, slot.peer
                );
                actions.abort(
                    slot.peer,
                    slot.invoke_id,
                    false,
                    AbortReason::SegmentationNotSupported,
                );
                self.complete(index, Outcome::SegmentationError, actions);
                return;
            }
            None => Reassembly::start(
                header,
                data,
                settings.proposed_window_size,
                settings.max_reassembled_apdu,
                Some(settings.max_segments_accepted),
            )
            .map(|(reassembly, accept)| {
                slot.reassembly = Some(reassembly);
                accept
            }),
        };

        match accepted {
            Err(err) => {
                warn!(
                    "segmented ComplexACK for invoke id {} from {} failed: {}",
                    slot.invoke_id, slot.peer, err
                );
                actions.abort(slot.peer, slot.invoke_id, false, abort_reason_for(&err));
                self.complete(index, Outcome::SegmentationError, actions);
            }
            Ok(accept) => {
                slot.state = TransactionState::SegmentedReceive;
                slot.deadline = Some(now + settings.segment_timeout);
                let window = slot.reassembly.as_ref().map_or(1, Reassembly::window_size);

                match accept {
                    SegmentAccept::Buffered => {}
                    SegmentAccept::AckWindow { sequence_number }
                    | SegmentAccept::Duplicate { sequence_number } => {
                        actions.segment_ack(slot.peer, slot.invoke_id, false, sequence_number, window);
                    }
                    SegmentAccept::Complete { sequence_number } => {
                        actions.segment_ack(slot.peer, slot.invoke_id, false, sequence_number, window);
                        let payload = slot
                            .reassembly
                            .take()
                            .map(Reassembly::into_payload)
                            .unwrap_or_default();
                        self.complete(index, Outcome::Ack(payload), actions);
                    }
                }
            }
        }
    }

    /// Take a confirmed request from `source`.
    ///
    /// A complete request is pushed to `actions.requests`; segments of a
    /// request still being reassembled and duplicates are absorbed here.
    pub fn on_confirmed_request(&mut self, source: &Route, apdu: Apdu, now: Instant, actions: &mut TsmActions) {
        let Apdu::ConfirmedRequest {
            segment,
            segmented_response_accepted,
            max_segments,
            max_response_size,
            invoke_id,
            service_choice,
            service_data,
        } = apdu
        else {
            return;
        };

        if let Some(index) = self.find(invoke_id, source, Role::Responder) {
            match segment {
                Some(header) if self.slots[index].state == TransactionState::SegmentedReceive => {
                    self.receive_request_segment(index, header, &service_data, now, actions);
                }
                _ => {
                    self.stats.duplicate_requests += 1;
                    debug!(
                        "dropping duplicate request invoke id {} from {}",
                        invoke_id, source
                    );
                }
            }
            return;
        }

        let Some(index) = self.free_slot() else {
            self.stats.pool_exhausted += 1;
            warn!(
                "no slot for request invoke id {} from {}, aborting",
                invoke_id, source
            );
            actions.abort(*source, invoke_id, true, AbortReason::OutOfResources);
            return;
        };

        if segment.is_some() && !self.settings.segmentation.can_receive() {
            actions.abort(*source, invoke_id, true, AbortReason::SegmentationNotSupported);
            return;
        }

        self.stats.requests_received += 1;
        let slot = &mut self.slots[index];
        slot.state = TransactionState::AwaitingResponse;
        slot.role = Role::Responder;
        slot.invoke_id = invoke_id;
        slot.peer = *source;
        slot.peer_max_apdu = max_response_size.size().min(self.settings.max_apdu);
        slot.peer_max_segments = max_segments.limit();
        slot.segmented_response_accepted = segmented_response_accepted;
        slot.service_choice = service_choice;
        slot.retry_limit = self.settings.apdu_retries;

        match segment {
            None => {
                slot.deadline = Some(now + self.settings.responder_timeout);
                actions.requests.push(InboundRequest {
                    handle: ResponderHandle(slot.id(index)),
                    source: *source,
                    service_choice,
                    service_data,
                });
            }
            Some(header) => {
                slot.state = TransactionState::SegmentedReceive;
                self.receive_request_segment(index, header, &service_data, now, actions);
            }
        }
    }

    /// Segment of a confirmed request addressed to us
    fn receive_request_segment(
        &mut self,
        index: usize,
        header: SegmentHeader,
        data: &[u8],
        now: Instant,
        actions: &mut TsmActions,
    ) {
        let settings = self.settings.clone();
        let slot = &mut self.slots[index];
        self.stats.segments_received += 1;

        let accepted = match slot.reassembly.as_mut() {
            Some(reassembly) => reassembly.accept(header, data),
            None => Reassembly::start(
                header,
                data,
                settings.proposed_window_size,
                settings.max_reassembled_apdu,
                Some(settings.max_segments_accepted),
            )
            .map(|(reassembly, accept)| {
                slot.reassembly = Some(reassembly);
                accept
            }),
        };

        let accept = match accepted {
            Ok(accept) => accept,
            Err(err) => {
                warn!(
                    "segmented request invoke id {} from {} failed: {}",
                    slot.invoke_id, slot.peer, err
                );
                actions.abort(slot.peer, slot.invoke_id, true, abort_reason_for(&err));
                self.stats.segmentation_errors += 1;
                self.release_index(index);
                return;
            }
        };

        slot.deadline = Some(now + settings.segment_timeout);
        let window = slot.reassembly.as_ref().map_or(1, Reassembly::window_size);

        match accept {
            SegmentAccept::Buffered => {}
            SegmentAccept::AckWindow { sequence_number } | SegmentAccept::Duplicate { sequence_number } => {
                actions.segment_ack(slot.peer, slot.invoke_id, true, sequence_number, window);
            }
            SegmentAccept::Complete { sequence_number } => {
                actions.segment_ack(slot.peer, slot.invoke_id, true, sequence_number, window);
                let service_data = slot
                    .reassembly
                    .take()
                    .map(Reassembly::into_payload)
                    .unwrap_or_default();
                slot.state = TransactionState::AwaitingResponse;
                slot.deadline = Some(now + settings.responder_timeout);
                actions.requests.push(InboundRequest {
                    handle: ResponderHandle(slot.id(index)),
                    source: slot.peer,
                    service_choice: slot.service_choice,
                    service_data,
                });
            }
        }
    }

    /// Answer a confirmed request.
    ///
    /// `Deferred` leaves the request pending. A ComplexACK that does not fit
    /// the requester's max-APDU is segmented if the requester accepts
    /// segmented responses, and answered with an Abort otherwise.
    pub fn respond(
        &mut self,
        handle: ResponderHandle,
        response: ServiceResponse,
        now: Instant,
        actions: &mut TsmActions,
    ) -> Result<()> {
        let index = self
            .resolve(handle.0)
            .filter(|index| self.slots[*index].state == TransactionState::AwaitingResponse)
            .ok_or(TsmError::StaleHandle)?;

        let slot = &mut self.slots[index];
        let invoke_id = slot.invoke_id;
        let service_choice = slot.service_choice;
        let peer = slot.peer;

        let apdu = match response {
            ServiceResponse::Deferred => return Ok(()),
            ServiceResponse::SimpleAck => Apdu::SimpleAck {
                invoke_id,
                service_choice,
            },
            ServiceResponse::Error { class, code } => Apdu::Error {
                invoke_id,
                service_choice,
                error_class: class.into(),
                error_code: code.into(),
            },
            ServiceResponse::Reject(reason) => Apdu::Reject {
                invoke_id,
                reject_reason: reason.into(),
            },
            ServiceResponse::Abort(reason) => Apdu::Abort {
                server: true,
                invoke_id,
                abort_reason: reason.into(),
            },
            ServiceResponse::ComplexAck(service_data) => {
                if COMPLEX_ACK_HEADER_LEN + service_data.len() > slot.peer_max_apdu {
                    return self.respond_segmented(index, service_data, now, actions);
                }
                Apdu::ComplexAck {
                    segment: None,
                    invoke_id,
                    service_choice,
                    service_data,
                }
            }
        };

        actions.send(peer, false, &apdu);
        self.release_index(index);
        Ok(())
    }

    fn respond_segmented(
        &mut self,
        index: usize,
        service_data: Vec<u8>,
        now: Instant,
        actions: &mut TsmActions,
    ) -> Result<()> {
        let slot = &mut self.slots[index];
        if !slot.segmented_response_accepted || !self.settings.segmentation.can_transmit() {
            debug!(
                "response to invoke id {} needs segmentation, which {} does not accept",
                slot.invoke_id, slot.peer
            );
            actions.abort(slot.peer, slot.invoke_id, true, AbortReason::SegmentationNotSupported);
            self.release_index(index);
            return Ok(());
        }

        let segment_size = slot.peer_max_apdu.saturating_sub(COMPLEX_ACK_SEGMENT_HEADER_LEN);
        match OutboundSegments::new(
            service_data,
            segment_size,
            self.settings.proposed_window_size,
            slot.peer_max_segments,
        ) {
            Ok(outbound) => {
                debug!(
                    "segmenting response to invoke id {} for {} into {} segments",
                    slot.invoke_id,
                    slot.peer,
                    outbound.segment_count()
                );
                slot.outbound = Some(outbound);
                slot.state = TransactionState::SegmentedTransmit;
                slot.segment_retries = 0;
                slot.deadline = Some(now + self.settings.segment_timeout);
                self.send_window(index, actions);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "cannot segment response to invoke id {} for {}: {}",
                    slot.invoke_id, slot.peer, err
                );
                actions.abort(slot.peer, slot.invoke_id, true, abort_reason_for(&err));
                self.release_index(index);
                Ok(())
            }
        }
    }
}

fn abort_reason_for(err: &SegmentationError) -> AbortReason {
    match err {
        SegmentationError::Overflow { .. } | SegmentationError::TooManySegments { .. } => {
            AbortReason::BufferOverflow
        }
        SegmentationError::InvalidWindowSize(_) => AbortReason::WindowSizeOutOfRange,
        SegmentationError::SegmentSizeTooSmall(_) => AbortReason::SegmentationNotSupported,
        SegmentationError::OutOfOrder { .. } | SegmentationError::UnexpectedFirstSegment(_) => {
            AbortReason::InvalidApduInThisState
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datalink::DataLinkAddress;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    const READ_PROPERTY: u8 = 12;

    fn peer(station: u8) -> Route {
        Route::unicast(DataLinkAddress::MsTP(station))
    }

    fn pool_with(config: StackConfig) -> TransactionPool {
        TransactionPool::new(&config)
    }

    fn pool() -> TransactionPool {
        pool_with(StackConfig::default())
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn start(pool: &mut TransactionPool, to: Route, now: Instant, actions: &mut TsmActions) -> u8 {
        let handle = pool.acquire(to, 1476).unwrap();
        pool.send(
            handle,
            OriginatorRequest::new(READ_PROPERTY, vec![0x0C, 0x02, 0x00, 0x00, 0x01], 3, ms(1000)),
            now,
            actions,
        )
        .unwrap()
    }

    #[test]
    fn test_retry_bound_and_timeout() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let t0 = Instant::now();
        let invoke_id = start(&mut pool, peer(1), t0, &mut actions);
        assert_eq!(actions.transmit.len(), 1);
        let original = actions.transmit[0].apdu.clone();
        assert!(actions.transmit[0].npci.expecting_reply);

        for step in 1..=3u64 {
            pool.tick(t0 + ms(step * 1000 - 1), &mut actions);
            assert_eq!(actions.transmit.len() as u64, step);
            pool.tick(t0 + ms(step * 1000), &mut actions);
            assert_eq!(actions.transmit.len() as u64, step + 1);
            assert!(actions.completions.is_empty());
        }
        assert!(actions.transmit.iter().all(|t| t.apdu == original));

        pool.tick(t0 + ms(3999), &mut actions);
        assert!(actions.completions.is_empty());
        pool.tick(t0 + ms(4000), &mut actions);
        assert_eq!(actions.transmit.len(), 4);
        assert_eq!(actions.completions.len(), 1);
        assert_eq!(actions.completions[0].invoke_id, invoke_id);
        assert_eq!(actions.completions[0].outcome, Outcome::Timeout);
        assert_eq!(pool.invoke_ids_in_use(), 0);
        assert_eq!(pool.statistics().retries, 3);
    }

    #[test]
    fn test_ack_completes_and_releases() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let invoke_id = start(&mut pool, peer(1), now, &mut actions);

        let ack = Apdu::ComplexAck {
            segment: None,
            invoke_id,
            service_choice: READ_PROPERTY,
            service_data: vec![0x3E, 0x44, 0x00, 0x00, 0x00, 0x00, 0x3F],
        };
        assert!(pool.on_reply(&peer(1), ack.clone(), now, &mut actions));
        assert_eq!(
            actions.completions[0].outcome,
            Outcome::Ack(vec![0x3E, 0x44, 0x00, 0x00, 0x00, 0x00, 0x3F])
        );
        assert_eq!(pool.live_count(), 0);

        // A second copy finds nothing
        assert!(!pool.on_reply(&peer(1), ack, now, &mut actions));
        assert_eq!(pool.statistics().unmatched_replies, 1);
        assert_eq!(actions.completions.len(), 1);
    }

    #[test]
    fn test_reply_from_wrong_peer_is_unmatched() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let invoke_id = start(&mut pool, peer(1), now, &mut actions);

        let ack = Apdu::SimpleAck {
            invoke_id,
            service_choice: READ_PROPERTY,
        };
        assert!(!pool.on_reply(&peer(2), ack, now, &mut actions));
        assert_eq!(
            pool.originator_state(invoke_id),
            Some(TransactionState::AwaitingConfirmation)
        );
    }

    #[test]
    fn test_error_reject_abort_outcomes() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();

        let a = start(&mut pool, peer(1), now, &mut actions);
        let b = start(&mut pool, peer(1), now, &mut actions);
        let c = start(&mut pool, peer(1), now, &mut actions);

        pool.on_reply(
            &peer(1),
            Apdu::Error {
                invoke_id: a,
                service_choice: READ_PROPERTY,
                error_class: 1,
                error_code: 31,
            },
            now,
            &mut actions,
        );
        pool.on_reply(
            &peer(1),
            Apdu::Reject {
                invoke_id: b,
                reject_reason: 9,
            },
            now,
            &mut actions,
        );
        pool.on_reply(
            &peer(1),
            Apdu::Abort {
                server: true,
                invoke_id: c,
                abort_reason: 9,
            },
            now,
            &mut actions,
        );

        let outcomes: Vec<_> = actions.completions.iter().map(|c| c.outcome.clone()).collect();
        assert_eq!(
            outcomes,
            vec![
                Outcome::Error { class: 1, code: 31 },
                Outcome::Reject(RejectReason::UnrecognizedService),
                Outcome::Abort(AbortReason::OutOfResources),
            ]
        );
        assert_eq!(pool.invoke_ids_in_use(), 0);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let handle = pool.acquire(peer(1), 1476).unwrap();
        pool.send(
            handle,
            OriginatorRequest::new(READ_PROPERTY, vec![], 3, ms(1000)),
            now,
            &mut actions,
        )
        .unwrap();

        assert!(pool.cancel(handle, &mut actions));
        assert!(!pool.cancel(handle, &mut actions));
        assert_eq!(actions.completions.len(), 1);
        assert_eq!(actions.completions[0].outcome, Outcome::Cancelled);

        // Expiry after cancellation does nothing
        pool.tick(now + ms(10_000), &mut actions);
        assert_eq!(actions.completions.len(), 1);
        assert_eq!(actions.transmit.len(), 1);
    }

    #[test]
    fn test_stale_handle_cannot_touch_reused_slot() {
        let mut config = StackConfig::default();
        config.max_transactions = 1;
        let mut pool = pool_with(config);
        let mut actions = TsmActions::new();

        let first = pool.acquire(peer(1), 1476).unwrap();
        assert!(pool.release(first));
        let second = pool.acquire(peer(2), 1476).unwrap();

        assert!(!pool.release(first));
        assert_eq!(
            pool.send(
                first,
                OriginatorRequest::new(READ_PROPERTY, vec![], 0, ms(100)),
                Instant::now(),
                &mut actions
            ),
            Err(TsmError::StaleHandle)
        );
        assert!(pool.release(second));
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut config = StackConfig::default();
        config.max_transactions = 2;
        let mut pool = pool_with(config);

        pool.acquire(peer(1), 1476).unwrap();
        pool.acquire(peer(1), 1476).unwrap();
        assert_eq!(pool.acquire(peer(1), 1476).unwrap_err(), TsmError::NoSlotAvailable);
        assert_eq!(pool.statistics().pool_exhausted, 1);
    }

    #[test]
    fn test_invoke_id_exhaustion() {
        let mut config = StackConfig::default();
        config.max_transactions = 300;
        let mut pool = pool_with(config);
        for _ in 0..255 {
            pool.acquire(peer(1), 1476).unwrap();
        }
        assert_eq!(
            pool.acquire(peer(1), 1476).unwrap_err(),
            TsmError::NoInvokeIdAvailable
        );
    }

    #[test]
    fn test_too_long_without_segmentation() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let handle = pool.acquire(peer(1), 50).unwrap();
        let invoke_id = handle.invoke_id();

        let err = pool
            .send(
                handle,
                OriginatorRequest::new(READ_PROPERTY, vec![0; 60], 3, ms(1000)),
                Instant::now(),
                &mut actions,
            )
            .unwrap_err();
        assert_eq!(
            err,
            TsmError::ApduTooLong {
                length: 64,
                max_apdu: 50
            }
        );
        assert!(actions.is_empty());
        assert!(pool.originator_state(invoke_id).is_none());
        assert_eq!(pool.invoke_ids_in_use(), 0);
    }

    #[test]
    fn test_same_invoke_id_different_peers() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();

        let invoke_id = start(&mut pool, peer(1), now, &mut actions);
        // Peer B happens to use the same invoke id for its own request
        pool.on_confirmed_request(
            &peer(2),
            Apdu::ConfirmedRequest {
                segment: None,
                segmented_response_accepted: false,
                max_segments: MaxSegments::Unspecified,
                max_response_size: MaxApduSize::Up480,
                invoke_id,
                service_choice: READ_PROPERTY,
                service_data: vec![1, 2, 3],
            },
            now,
            &mut actions,
        );
        assert_eq!(actions.requests.len(), 1);

        // B's abort of its own request only releases the responder slot
        pool.on_reply(
            &peer(2),
            Apdu::Abort {
                server: false,
                invoke_id,
                abort_reason: 0,
            },
            now,
            &mut actions,
        );
        assert!(!pool.is_pending(&actions.requests[0].handle));
        assert_eq!(
            pool.originator_state(invoke_id),
            Some(TransactionState::AwaitingConfirmation)
        );

        // An ACK from B is not an answer to the request sent to A
        assert!(!pool.on_reply(
            &peer(2),
            Apdu::SimpleAck {
                invoke_id,
                service_choice: READ_PROPERTY
            },
            now,
            &mut actions
        ));
        assert!(pool.on_reply(
            &peer(1),
            Apdu::SimpleAck {
                invoke_id,
                service_choice: READ_PROPERTY
            },
            now,
            &mut actions
        ));
        assert_eq!(actions.completions.len(), 1);
        assert_eq!(actions.completions[0].outcome, Outcome::Ack(vec![]));
    }

    fn request(invoke_id: u8, segment: Option<SegmentHeader>, data: Vec<u8>) -> Apdu {
        Apdu::ConfirmedRequest {
            segment,
            segmented_response_accepted: true,
            max_segments: MaxSegments::SixtyFour,
            max_response_size: MaxApduSize::Up128,
            invoke_id,
            service_choice: READ_PROPERTY,
            service_data: data,
        }
    }

    #[test]
    fn test_responder_duplicate_and_timeout() {
        let mut config = StackConfig::default();
        config.responder_timeout = ms(500);
        let mut pool = pool_with(config);
        let mut actions = TsmActions::new();
        let now = Instant::now();

        pool.on_confirmed_request(&peer(3), request(7, None, vec![]), now, &mut actions);
        pool.on_confirmed_request(&peer(3), request(7, None, vec![]), now, &mut actions);
        assert_eq!(actions.requests.len(), 1);
        assert_eq!(pool.statistics().duplicate_requests, 1);

        pool.tick(now + ms(500), &mut actions);
        assert_eq!(
            Apdu::decode(&actions.transmit[0].apdu).unwrap(),
            Apdu::Abort {
                server: true,
                invoke_id: 7,
                abort_reason: AbortReason::ApplicationExceededReplyTime.into(),
            }
        );
        assert_eq!(pool.live_count(), 0);
        assert_eq!(
            pool.respond(actions.requests[0].handle, ServiceResponse::SimpleAck, now, &mut actions),
            Err(TsmError::StaleHandle)
        );
    }

    #[test]
    fn test_responder_out_of_resources() {
        let mut config = StackConfig::default();
        config.max_transactions = 1;
        let mut pool = pool_with(config);
        let mut actions = TsmActions::new();
        let now = Instant::now();

        pool.on_confirmed_request(&peer(3), request(1, None, vec![]), now, &mut actions);
        pool.on_confirmed_request(&peer(4), request(1, None, vec![]), now, &mut actions);
        assert_eq!(actions.requests.len(), 1);
        assert_eq!(
            Apdu::decode(&actions.transmit[0].apdu).unwrap(),
            Apdu::Abort {
                server: true,
                invoke_id: 1,
                abort_reason: AbortReason::OutOfResources.into(),
            }
        );
    }

    #[test]
    fn test_segmented_response_round_trip() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();

        pool.on_confirmed_request(&peer(3), request(5, None, vec![]), now, &mut actions);
        let handle = actions.requests[0].handle;
        let payload: Vec<u8> = (0..300u16).map(|i| i as u8).collect();

        pool.respond(handle, ServiceResponse::ComplexAck(payload.clone()), now, &mut actions)
            .unwrap();
        // Only the first segment goes before the window is negotiated
        assert_eq!(actions.transmit.len(), 1);

        let mut received: Option<Reassembly> = None;
        let mut done = false;
        while !done {
            let frames: Vec<_> = actions.transmit.drain(..).collect();
            let mut last_ack = None;
            for frame in frames {
                let Apdu::ComplexAck {
                    segment: Some(header),
                    service_data,
                    ..
                } = Apdu::decode(&frame.apdu).unwrap()
                else {
                    panic!("expected a segment");
                };
                assert!(frame.apdu.len() <= 128);
                let accept = match received.as_mut() {
                    Some(reassembly) => reassembly.accept(header, &service_data).unwrap(),
                    None => {
                        let (reassembly, accept) =
                            Reassembly::start(header, &service_data, 2, 4096, None).unwrap();
                        received = Some(reassembly);
                        accept
                    }
                };
                match accept {
                    SegmentAccept::AckWindow { sequence_number } => last_ack = Some(sequence_number),
                    SegmentAccept::Complete { sequence_number } => {
                        last_ack = Some(sequence_number);
                        done = true;
                    }
                    _ => {}
                }
            }
            let sequence_number = last_ack.expect("window must end with an ack");
            pool.on_reply(
                &peer(3),
                Apdu::SegmentAck {
                    negative: false,
                    server: false,
                    invoke_id: 5,
                    sequence_number,
                    window_size: 2,
                },
                now,
                &mut actions,
            );
        }

        assert_eq!(received.unwrap().into_payload(), payload);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_segmentation_not_accepted_by_requester() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();

        let mut apdu = request(6, None, vec![]);
        if let Apdu::ConfirmedRequest {
            segmented_response_accepted,
            ..
        } = &mut apdu
        {
            *segmented_response_accepted = false;
        }
        pool.on_confirmed_request(&peer(3), apdu, now, &mut actions);
        let handle = actions.requests[0].handle;
        pool.respond(handle, ServiceResponse::ComplexAck(vec![0; 500]), now, &mut actions)
            .unwrap();

        assert_eq!(
            Apdu::decode(&actions.transmit[0].apdu).unwrap(),
            Apdu::Abort {
                server: true,
                invoke_id: 6,
                abort_reason: AbortReason::SegmentationNotSupported.into(),
            }
        );
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_complex_ack_at_max_apdu_boundary() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();

        // Requester accepts 128 octets: 3 header octets plus 125 of data fit
        pool.on_confirmed_request(&peer(3), request(1, None, vec![]), now, &mut actions);
        pool.respond(actions.requests[0].handle, ServiceResponse::ComplexAck(vec![1; 125]), now, &mut actions)
            .unwrap();
        assert_eq!(actions.transmit.len(), 1);
        assert_eq!(actions.transmit[0].apdu.len(), 128);
        assert!(matches!(
            Apdu::decode(&actions.transmit[0].apdu).unwrap(),
            Apdu::ComplexAck { segment: None, .. }
        ));
        assert_eq!(pool.live_count(), 0);

        // One more octet and the response is segmented, never dropped
        pool.on_confirmed_request(&peer(3), request(2, None, vec![]), now, &mut actions);
        pool.respond(actions.requests[1].handle, ServiceResponse::ComplexAck(vec![2; 126]), now, &mut actions)
            .unwrap();
        assert_eq!(actions.transmit.len(), 2);
        assert!(matches!(
            Apdu::decode(&actions.transmit[1].apdu).unwrap(),
            Apdu::ComplexAck {
                segment: Some(SegmentHeader { sequence_number: 0, more_follows: true, .. }),
                invoke_id: 2,
                ..
            }
        ));
        assert_eq!(pool.live_count(), 1);
        assert_eq!(pool.statistics().segments_sent, 1);
    }

    #[test]
    fn test_segmented_request_reassembly() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let payload: Vec<u8> = (0..120u8).collect();
        let outbound = OutboundSegments::new(payload.clone(), 50, 4, None).unwrap();

        for index in 0..outbound.segment_count() {
            let (header, data) = outbound.segment(index);
            pool.on_confirmed_request(&peer(3), request(9, Some(header), data.to_vec()), now, &mut actions);
        }

        assert_eq!(actions.requests.len(), 1);
        assert_eq!(actions.requests[0].service_data, payload);
        // Ack for the first segment and for the last
        let acks: Vec<_> = actions
            .transmit
            .iter()
            .map(|t| Apdu::decode(&t.apdu).unwrap())
            .collect();
        assert_eq!(acks.len(), 2);
        assert!(matches!(
            acks[1],
            Apdu::SegmentAck {
                server: true,
                sequence_number: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_segment_gap_aborts_request() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let outbound = OutboundSegments::new(vec![0; 200], 50, 4, None).unwrap();

        for index in [0usize, 2] {
            let (header, data) = outbound.segment(index);
            pool.on_confirmed_request(&peer(3), request(9, Some(header), data.to_vec()), now, &mut actions);
        }

        assert!(actions.requests.is_empty());
        assert_eq!(
            Apdu::decode(&actions.transmit.last().unwrap().apdu).unwrap(),
            Apdu::Abort {
                server: true,
                invoke_id: 9,
                abort_reason: AbortReason::InvalidApduInThisState.into(),
            }
        );
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_segmented_complex_ack_is_reassembled() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let invoke_id = start(&mut pool, peer(1), now, &mut actions);
        actions.transmit.clear();

        let payload: Vec<u8> = (0..90u8).collect();
        let outbound = OutboundSegments::new(payload.clone(), 30, 4, None).unwrap();
        for index in 0..outbound.segment_count() {
            let (header, data) = outbound.segment(index);
            pool.on_reply(
                &peer(1),
                Apdu::ComplexAck {
                    segment: Some(header),
                    invoke_id,
                    service_choice: READ_PROPERTY,
                    service_data: data.to_vec(),
                },
                now,
                &mut actions,
            );
        }

        assert_eq!(actions.completions.len(), 1);
        assert_eq!(actions.completions[0].outcome, Outcome::Ack(payload));
        assert_eq!(actions.transmit.len(), 2);
        assert_eq!(pool.invoke_ids_in_use(), 0);
    }

    #[test]
    fn test_segmented_receive_timeout_aborts_peer() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let invoke_id = start(&mut pool, peer(1), now, &mut actions);
        actions.transmit.clear();

        let outbound = OutboundSegments::new(vec![0; 90], 30, 4, None).unwrap();
        let (header, data) = outbound.segment(0);
        pool.on_reply(
            &peer(1),
            Apdu::ComplexAck {
                segment: Some(header),
                invoke_id,
                service_choice: READ_PROPERTY,
                service_data: data.to_vec(),
            },
            now,
            &mut actions,
        );
        assert_eq!(
            pool.originator_state(invoke_id),
            Some(TransactionState::SegmentedReceive)
        );

        pool.tick(now + ms(2000), &mut actions);
        assert_eq!(actions.completions[0].outcome, Outcome::Timeout);
        assert_eq!(
            Apdu::decode(&actions.transmit.last().unwrap().apdu).unwrap(),
            Apdu::Abort {
                server: false,
                invoke_id,
                abort_reason: AbortReason::TsmTimeout.into(),
            }
        );
    }

    #[test]
    fn test_segmented_request_transmit() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let handle = pool.acquire(peer(1), 50).unwrap();
        let mut request = OriginatorRequest::new(READ_PROPERTY, vec![7; 130], 3, ms(1000));
        request.peer_segmentation = Segmentation::Both;
        let invoke_id = pool.send(handle, request, now, &mut actions).unwrap();

        assert_eq!(
            pool.originator_state(invoke_id),
            Some(TransactionState::SegmentedTransmit)
        );
        assert_eq!(actions.transmit.len(), 1);
        assert!(actions.transmit.iter().all(|t| t.apdu.len() <= 50));

        let ack = |sequence_number| Apdu::SegmentAck {
            negative: false,
            server: true,
            invoke_id,
            sequence_number,
            window_size: 4,
        };
        // 130 bytes in 44-byte segments: 3 segments
        pool.on_reply(&peer(1), ack(0), now, &mut actions);
        assert_eq!(actions.transmit.len(), 3);
        pool.on_reply(&peer(1), ack(2), now, &mut actions);
        assert_eq!(
            pool.originator_state(invoke_id),
            Some(TransactionState::AwaitingConfirmation)
        );

        pool.on_reply(
            &peer(1),
            Apdu::SimpleAck {
                invoke_id,
                service_choice: READ_PROPERTY,
            },
            now,
            &mut actions,
        );
        assert_eq!(actions.completions[0].outcome, Outcome::Ack(vec![]));
    }

    fn start_segmented(pool: &mut TransactionPool, now: Instant, actions: &mut TsmActions) -> u8 {
        let handle = pool.acquire(peer(1), 50).unwrap();
        let mut request = OriginatorRequest::new(READ_PROPERTY, vec![7; 130], 3, ms(1000));
        request.peer_segmentation = Segmentation::Both;
        pool.send(handle, request, now, actions).unwrap()
    }

    #[test]
    fn test_abort_during_segmented_transmit() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let now = Instant::now();
        let invoke_id = start_segmented(&mut pool, now, &mut actions);
        assert_eq!(
            pool.originator_state(invoke_id),
            Some(TransactionState::SegmentedTransmit)
        );

        assert!(pool.on_reply(
            &peer(1),
            Apdu::Abort {
                server: true,
                invoke_id,
                abort_reason: AbortReason::BufferOverflow.into(),
            },
            now,
            &mut actions,
        ));
        assert_eq!(actions.completions.len(), 1);
        assert_eq!(
            actions.completions[0].outcome,
            Outcome::Abort(AbortReason::BufferOverflow)
        );
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.invoke_ids_in_use(), 0);

        // Nothing left to resend
        pool.tick(now + ms(10_000), &mut actions);
        assert_eq!(actions.transmit.len(), 1);
    }

    #[test]
    fn test_segment_timer_exhaustion_times_out() {
        let mut pool = pool();
        let mut actions = TsmActions::new();
        let t0 = Instant::now();
        let segment_timeout = StackConfig::default().segment_timeout;
        let invoke_id = start_segmented(&mut pool, t0, &mut actions);
        assert_eq!(actions.transmit.len(), 1);
        let first = actions.transmit[0].apdu.clone();

        // Unacknowledged first segment goes out again once per retry
        for resend in 1..=3u32 {
            pool.tick(t0 + segment_timeout * resend, &mut actions);
            assert_eq!(actions.transmit.len(), 1 + resend as usize);
            assert!(actions.completions.is_empty());
        }
        assert!(actions.transmit.iter().all(|t| t.apdu == first));

        pool.tick(t0 + segment_timeout * 4, &mut actions);
        assert_eq!(actions.transmit.len(), 4);
        assert_eq!(actions.completions.len(), 1);
        assert_eq!(actions.completions[0].invoke_id, invoke_id);
        assert_eq!(actions.completions[0].outcome, Outcome::Timeout);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.invoke_ids_in_use(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start(u8),
        Reply(usize),
        Abort(usize),
        Cancel(usize),
        Advance(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..4).prop_map(Op::Start),
            any::<usize>().prop_map(Op::Reply),
            any::<usize>().prop_map(Op::Abort),
            any::<usize>().prop_map(Op::Cancel),
            (0u64..1500).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn every_transaction_ends_exactly_once(ops in proptest::collection::vec(op(), 1..200)) {
            let mut config = StackConfig::default();
            config.max_transactions = 8;
            let mut pool = pool_with(config);
            let mut actions = TsmActions::new();
            let t0 = Instant::now();
            let mut now = t0;

            let finished: Arc<Mutex<BTreeMap<usize, usize>>> = Arc::default();
            let mut live: Vec<(usize, u8, Route)> = Vec::new();
            let mut started = 0usize;

            let settle = |actions: &mut TsmActions, live: &mut Vec<(usize, u8, Route)>| {
                for completion in actions.completions.drain(..) {
                    live.retain(|(_, id, _)| *id != completion.invoke_id);
                    if let Some(callback) = completion.callback {
                        callback(completion.invoke_id, completion.outcome);
                    }
                }
            };

            for op in ops {
                match op {
                    Op::Start(station) => {
                        if let Ok(handle) = pool.acquire(peer(station), 1476) {
                            let tag = started;
                            started += 1;
                            let finished = finished.clone();
                            let mut request = OriginatorRequest::new(READ_PROPERTY, vec![], 2, ms(1000));
                            request.callback = Some(Box::new(move |_, _| {
                                *finished.lock().unwrap().entry(tag).or_default() += 1;
                            }));
                            let invoke_id = pool.send(handle, request, now, &mut actions).unwrap();
                            live.push((tag, invoke_id, peer(station)));
                        }
                    }
                    Op::Reply(pick) | Op::Abort(pick) if !live.is_empty() => {
                        let (_, invoke_id, route) = live[pick % live.len()];
                        let apdu = if matches!(op, Op::Reply(_)) {
                            Apdu::SimpleAck { invoke_id, service_choice: READ_PROPERTY }
                        } else {
                            Apdu::Abort { server: true, invoke_id, abort_reason: 0 }
                        };
                        // Deliver twice; the copy must be unmatched
                        pool.on_reply(&route, apdu.clone(), now, &mut actions);
                        prop_assert!(!pool.on_reply(&route, apdu, now, &mut actions));
                    }
                    Op::Cancel(pick) if !live.is_empty() => {
                        let (_, invoke_id, _) = live[pick % live.len()];
                        prop_assert!(pool.cancel_invoke_id(invoke_id, &mut actions));
                        prop_assert!(!pool.cancel_invoke_id(invoke_id, &mut actions));
                    }
                    Op::Advance(step) => {
                        now += ms(step);
                        pool.tick(now, &mut actions);
                    }
                    _ => {}
                }
                settle(&mut actions, &mut live);
                prop_assert_eq!(pool.invoke_ids_in_use(), live.len());
            }

            // Run every remaining timer out
            for _ in 0..4 {
                now += ms(1000);
                pool.tick(now, &mut actions);
                settle(&mut actions, &mut live);
            }

            let finished = finished.lock().unwrap();
            prop_assert_eq!(finished.len(), started);
            prop_assert!(finished.values().all(|count| *count == 1));
            prop_assert_eq!(pool.live_count(), 0);
        }
    }
}
