//! The protocol stack: dispatcher, transaction pool and binding table behind
//! one datalink.
//!
//! [`Stack`] is driven from outside. Feed it inbound frames with
//! [`Stack::on_frame`] (or let [`Stack::poll`] drain the datalink), and call
//! [`Stack::tick`] periodically so retries and timeouts fire. Nothing here
//! blocks or reads the clock; every entry point takes `now`.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use bacnet_tsm::config::StackConfig;
//! use bacnet_tsm::datalink::{DataLinkAddress, MemoryNetwork};
//! use bacnet_tsm::network::Route;
//! use bacnet_tsm::service::{RequestContext, Segmentation, ServiceResponse};
//! use bacnet_tsm::stack::Stack;
//!
//! let network = MemoryNetwork::new();
//! let mut client = Stack::new(StackConfig::default(), network.attach(DataLinkAddress::MsTP(1))).unwrap();
//! let mut server = Stack::new(StackConfig::default(), network.attach(DataLinkAddress::MsTP(2))).unwrap();
//!
//! server.register_confirmed_handler(12, |_choice: u8, _payload: &[u8], _context: &RequestContext| {
//!     ServiceResponse::ComplexAck(vec![0x3E, 0x3F])
//! });
//! client
//!     .bind_static(2000, Route::unicast(DataLinkAddress::MsTP(2)), 480, Segmentation::NoSegmentation)
//!     .unwrap();
//!
//! let now = Instant::now();
//! let invoke_id = client
//!     .send_confirmed(12, 2000, vec![0x0C, 0x02, 0x00, 0x07, 0xD0], 3, Duration::from_secs(3), now)
//!     .unwrap();
//! server.poll(now).unwrap();
//! client.poll(now).unwrap();
//!
//! assert_eq!(client.tsm_statistics().completed_ack, 1);
//! # let _ = invoke_id;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, trace, warn};
use thiserror::Error;

use crate::address::{AddressBindingTable, BindingError, BroadcastScope, Resolution};
use crate::app::tsm::{InboundRequest, OriginatorRequest, Transmit};
use crate::app::{
    Apdu, CompletionCallback, Outcome, ResponderHandle, TransactionPool, TsmActions, TsmError,
    TsmStatistics,
};
use crate::config::StackConfig;
use crate::datalink::{DataLink, DataLinkAddress, DataLinkError};
use crate::encoding::FrameError;
use crate::network::{decode_npdu, encode_npdu, Route, MAX_MAC_LEN};
use crate::service::{
    CommunicationControl, ConfirmedServiceHandler, IAmRequest, RejectReason, RequestContext,
    Segmentation, ServiceError, ServiceResponse, UnconfirmedServiceChoice,
    UnconfirmedServiceHandler, WhoIsRequest,
};
use crate::util::frame_dump;

/// Result type for stack operations
pub type Result<T> = std::result::Result<T, StackError>;

/// Longest NPDU header: version, control, DNET/DLEN/DADR, SNET/SLEN/SADR, hop count
pub const MAX_NPDU_HEADER_LEN: usize = 2 + 2 * (3 + MAX_MAC_LEN) + 1;

/// Errors returned to callers of the stack
#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Transaction(#[from] TsmError),
    #[error(transparent)]
    Binding(#[from] BindingError),
    #[error("datalink error: {0}")]
    DataLink(#[from] DataLinkError),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("service error: {0}")]
    Service(#[from] ServiceError),
    /// No binding for the device; a Who-Is for it has been broadcast
    #[error("device {0} has no known address")]
    Unresolved(u32),
    #[error("communication is disabled")]
    CommunicationDisabled,
    #[error("confirmed requests cannot be sent to {0}")]
    BroadcastDestination(Route),
}

/// Stack-wide completion handler for requests sent without their own callback
pub type CompletionHandler = Box<dyn FnMut(u8, Outcome) + Send>;

/// Dispatcher counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StackStatistics {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub malformed_frames: u64,
    pub unknown_pdu_types: u64,
    pub network_messages: u64,
    pub foreign_network_frames: u64,
    pub unhandled_unconfirmed: u64,
    pub unrecognized_services: u64,
    pub suppressed_sends: u64,
    pub who_is_sent: u64,
    pub bindings_learned: u64,
}

/// A confirmed request to send
pub struct ConfirmedRequest {
    pub service_choice: u8,
    pub payload: Vec<u8>,
    pub retry_limit: u8,
    pub timeout: Duration,
    pub callback: Option<CompletionCallback>,
}

impl ConfirmedRequest {
    pub fn new(service_choice: u8, payload: Vec<u8>, retry_limit: u8, timeout: Duration) -> Self {
        Self {
            service_choice,
            payload,
            retry_limit,
            timeout,
            callback: None,
        }
    }

    /// Deliver the outcome to `callback` instead of the stack-wide handler
    pub fn with_callback(mut self, callback: impl FnOnce(u8, Outcome) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }
}

/// BACnet application stack over one datalink
pub struct Stack<D: DataLink> {
    config: StackConfig,
    datalink: D,
    pool: TransactionPool,
    bindings: AddressBindingTable,
    confirmed_handlers: BTreeMap<u8, Box<dyn ConfirmedServiceHandler>>,
    unconfirmed_handlers: BTreeMap<u8, Box<dyn UnconfirmedServiceHandler>>,
    completion_handler: Option<CompletionHandler>,
    communication: Option<Box<dyn CommunicationControl>>,
    stats: StackStatistics,
}

impl<D: DataLink> fmt::Debug for Stack<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("local_address", &self.datalink.local_address())
            .field("pool", &self.pool)
            .field("bindings", &self.bindings.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<D: DataLink> Stack<D> {
    /// Create a stack; fails only on invalid static bindings.
    pub fn new(config: StackConfig, datalink: D) -> Result<Self> {
        let bindings = AddressBindingTable::from_config(&config)?;
        let pool = TransactionPool::new(&config);
        debug!(
            "stack on {} ({} transaction slots, {} static bindings)",
            datalink.local_address(),
            config.max_transactions,
            bindings.len()
        );

        Ok(Self {
            config,
            datalink,
            pool,
            bindings,
            confirmed_handlers: BTreeMap::new(),
            unconfirmed_handlers: BTreeMap::new(),
            completion_handler: None,
            communication: None,
            stats: StackStatistics::default(),
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn bindings(&self) -> &AddressBindingTable {
        &self.bindings
    }

    pub fn statistics(&self) -> &StackStatistics {
        &self.stats
    }

    pub fn tsm_statistics(&self) -> &TsmStatistics {
        self.pool.statistics()
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.pool
    }

    /// Serve a confirmed service choice; replaces any earlier handler
    pub fn register_confirmed_handler(
        &mut self,
        service_choice: u8,
        handler: impl ConfirmedServiceHandler + 'static,
    ) {
        self.confirmed_handlers.insert(service_choice, Box::new(handler));
    }

    /// Receive an unconfirmed service choice; replaces any earlier handler
    pub fn register_unconfirmed_handler(
        &mut self,
        service_choice: u8,
        handler: impl UnconfirmedServiceHandler + 'static,
    ) {
        self.unconfirmed_handlers.insert(service_choice, Box::new(handler));
    }

    pub fn set_completion_handler(&mut self, handler: impl FnMut(u8, Outcome) + Send + 'static) {
        self.completion_handler = Some(Box::new(handler));
    }

    pub fn set_communication_control(&mut self, control: impl CommunicationControl + 'static) {
        self.communication = Some(Box::new(control));
    }

    fn communication_enabled(&self) -> bool {
        self.communication
            .as_ref()
            .map_or(true, |control| control.communication_enabled())
    }

    pub fn bind_static(
        &mut self,
        device_instance: u32,
        route: Route,
        max_apdu: usize,
        segmentation: Segmentation,
    ) -> Result<()> {
        Ok(self
            .bindings
            .bind_static(device_instance, route, max_apdu, segmentation)?)
    }

    /// Drop learned bindings that have expired
    pub fn unbind_expired(&mut self, now: Instant) -> usize {
        self.bindings.unbind_expired(now)
    }

    /// Send a confirmed request to a device, returning its invoke id.
    ///
    /// The outcome goes to the completion handler.
    pub fn send_confirmed(
        &mut self,
        service_choice: u8,
        device_instance: u32,
        payload: Vec<u8>,
        retry_limit: u8,
        timeout: Duration,
        now: Instant,
    ) -> Result<u8> {
        self.send_request(
            device_instance,
            ConfirmedRequest::new(service_choice, payload, retry_limit, timeout),
            now,
        )
    }

    /// Send a confirmed request to a device looked up in the binding table.
    ///
    /// On a miss a Who-Is for the device is broadcast and
    /// [`StackError::Unresolved`] returned; the caller retries once the I-Am
    /// has been learned.
    pub fn send_request(&mut self, device_instance: u32, request: ConfirmedRequest, now: Instant) -> Result<u8> {
        if !self.communication_enabled() {
            return Err(StackError::CommunicationDisabled);
        }

        match self.bindings.get_route(device_instance, now) {
            Resolution::Bound(binding) => self.send_request_to_route(
                binding.route,
                binding.max_apdu,
                binding.segmentation,
                request,
                now,
            ),
            Resolution::Unresolved(device_instance) => {
                debug!(
                    "no binding for device {}, broadcasting Who-Is",
                    device_instance
                );
                self.send_who_is(
                    AddressBindingTable::broadcast_route(BroadcastScope::Global),
                    WhoIsRequest::for_device(device_instance),
                )?;
                Err(StackError::Unresolved(device_instance))
            }
        }
    }

    /// Send a confirmed request along an explicit route
    pub fn send_request_to_route(
        &mut self,
        route: Route,
        max_apdu: usize,
        segmentation: Segmentation,
        request: ConfirmedRequest,
        now: Instant,
    ) -> Result<u8> {
        if route.is_broadcast() {
            return Err(StackError::BroadcastDestination(route));
        }
        if !self.communication_enabled() {
            return Err(StackError::CommunicationDisabled);
        }

        let handle = self.pool.acquire(route, max_apdu)?;
        let mut actions = TsmActions::new();
        let invoke_id = self.pool.send(
            handle,
            OriginatorRequest {
                service_choice: request.service_choice,
                service_data: request.payload,
                retry_limit: request.retry_limit,
                timeout: request.timeout,
                peer_segmentation: segmentation,
                callback: request.callback,
            },
            now,
            &mut actions,
        )?;
        self.process(actions, now);
        Ok(invoke_id)
    }

    /// Send an unconfirmed request; no transaction is created
    pub fn send_unconfirmed(&mut self, service_choice: u8, route: Route, payload: &[u8]) -> Result<()> {
        if !self.communication_enabled() {
            return Err(StackError::CommunicationDisabled);
        }

        let apdu = Apdu::UnconfirmedRequest {
            service_choice,
            service_data: payload.to_vec(),
        };
        self.transmit(Transmit {
            route,
            npci: Default::default(),
            apdu: apdu.encode(),
        })
    }

    pub fn send_who_is(&mut self, route: Route, request: WhoIsRequest) -> Result<()> {
        let mut payload = Vec::new();
        request.encode(&mut payload)?;
        self.send_unconfirmed(UnconfirmedServiceChoice::WhoIs as u8, route, &payload)?;
        self.stats.who_is_sent += 1;
        Ok(())
    }

    pub fn send_i_am(&mut self, route: Route, i_am: &IAmRequest) -> Result<()> {
        let mut payload = Vec::new();
        i_am.encode(&mut payload)?;
        self.send_unconfirmed(UnconfirmedServiceChoice::IAm as u8, route, &payload)
    }

    /// Answer a confirmed request whose handler returned `Deferred`
    pub fn respond(&mut self, handle: ResponderHandle, response: ServiceResponse, now: Instant) -> Result<()> {
        let mut actions = TsmActions::new();
        self.pool.respond(handle, response, now, &mut actions)?;
        self.process(actions, now);
        Ok(())
    }

    /// Cancel an outstanding request; its outcome is `Cancelled`
    pub fn cancel(&mut self, invoke_id: u8, now: Instant) -> bool {
        let mut actions = TsmActions::new();
        let cancelled = self.pool.cancel_invoke_id(invoke_id, &mut actions);
        self.process(actions, now);
        cancelled
    }

    /// Fire every timer due at `now`
    pub fn tick(&mut self, now: Instant) {
        let mut actions = TsmActions::new();
        self.pool.tick(now, &mut actions);
        self.process(actions, now);
    }

    /// Drain the datalink, dispatching every waiting frame
    pub fn poll(&mut self, now: Instant) -> Result<usize> {
        let mut count = 0;
        while let Some((frame, source)) = self.datalink.receive()? {
            self.on_frame(&frame, source, now);
            count += 1;
        }
        Ok(count)
    }

    /// Dispatch one inbound frame. Frames that cannot be used are counted and
    /// dropped.
    pub fn on_frame(&mut self, frame: &[u8], source: DataLinkAddress, now: Instant) {
        self.stats.frames_received += 1;
        trace!("rx from {}: {}", source, frame_dump(frame));

        let (npdu, offset) = match decode_npdu(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.stats.malformed_frames += 1;
                warn!("dropping malformed NPDU from {}: {}", source, err);
                return;
            }
        };

        if npdu.is_network_message() {
            self.stats.network_messages += 1;
            match npdu.network_message_type() {
                Some(message_type) => debug!(
                    "ignoring network layer message {:?} from {}",
                    message_type, source
                ),
                None => debug!(
                    "ignoring network layer message type {:?} from {}",
                    npdu.message_type, source
                ),
            }
            return;
        }
        if npdu.is_for_remote_network() {
            self.stats.foreign_network_frames += 1;
            debug!("ignoring frame from {} for a remote network", source);
            return;
        }

        let route = Route::from_source(source, npdu.source);
        let apdu = match Apdu::decode(&frame[offset..]) {
            Ok(apdu) => apdu,
            Err(FrameError::UnknownPduType(pdu_type)) => {
                self.stats.unknown_pdu_types += 1;
                warn!("dropping unknown PDU type {} from {}", pdu_type, route);
                return;
            }
            Err(err) => {
                self.stats.malformed_frames += 1;
                warn!("dropping malformed APDU from {}: {}", route, err);
                return;
            }
        };

        let mut actions = TsmActions::new();
        match apdu {
            Apdu::ConfirmedRequest { .. } => {
                self.pool.on_confirmed_request(&route, apdu, now, &mut actions);
            }
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => self.on_unconfirmed(service_choice, &service_data, route, now),
            reply => {
                self.pool.on_reply(&route, reply, now, &mut actions);
            }
        }
        self.process(actions, now);
    }

    fn on_unconfirmed(&mut self, service_choice: u8, payload: &[u8], source: Route, now: Instant) {
        if service_choice == UnconfirmedServiceChoice::IAm as u8 && self.config.learn_bindings {
            match IAmRequest::decode(payload) {
                Ok(i_am) => match self.bindings.learn(&i_am, source, now) {
                    Ok(()) => self.stats.bindings_learned += 1,
                    Err(err) => warn!(
                        "cannot bind device {} at {}: {}",
                        i_am.device_instance, source, err
                    ),
                },
                Err(err) => debug!("undecodable I-Am from {}: {}", source, err),
            }
        }

        match self.unconfirmed_handlers.get_mut(&service_choice) {
            Some(handler) => handler.handle(service_choice, payload, &source),
            None => {
                self.stats.unhandled_unconfirmed += 1;
                trace!(
                    "no handler for unconfirmed service {} from {}",
                    service_choice,
                    source
                );
            }
        }
    }

    /// Carry out what the pool asked for, until nothing is left
    fn process(&mut self, mut actions: TsmActions, now: Instant) {
        while !actions.is_empty() {
            for transmit in actions.transmit.drain(..) {
                // A failed send is one failed attempt; the timer stays armed
                if let Err(err) = self.transmit(transmit) {
                    debug!("transmit failed: {}", err);
                }
            }

            for completion in actions.completions.drain(..) {
                match (completion.callback, self.completion_handler.as_mut()) {
                    (Some(callback), _) => callback(completion.invoke_id, completion.outcome),
                    (None, Some(handler)) => handler(completion.invoke_id, completion.outcome),
                    (None, None) => trace!(
                        "no completion handler for invoke id {}",
                        completion.invoke_id
                    ),
                }
            }

            let requests: Vec<_> = actions.requests.drain(..).collect();
            for request in requests {
                self.serve(request, now, &mut actions);
            }
        }
    }

    fn serve(&mut self, request: InboundRequest, now: Instant, actions: &mut TsmActions) {
        let context = RequestContext {
            handle: request.handle,
            source: request.source,
        };

        let response = match self.confirmed_handlers.get_mut(&request.service_choice) {
            Some(handler) => handler.handle(request.service_choice, &request.service_data, &context),
            None => {
                self.stats.unrecognized_services += 1;
                debug!(
                    "rejecting unrecognized service {} from {}",
                    request.service_choice, request.source
                );
                ServiceResponse::Reject(RejectReason::UnrecognizedService)
            }
        };

        if let Err(err) = self.pool.respond(request.handle, response, now, actions) {
            warn!(
                "cannot answer invoke id {} from {}: {}",
                request.handle.invoke_id(),
                request.source,
                err
            );
        }
    }

    fn transmit(&mut self, transmit: Transmit) -> Result<()> {
        if !self.communication_enabled() {
            self.stats.suppressed_sends += 1;
            trace!("communication disabled, not sending to {}", transmit.route);
            return Ok(());
        }

        let mut header = [0u8; MAX_NPDU_HEADER_LEN];
        let destination = transmit.route.npdu_destination();
        let header_len = encode_npdu(&mut header, destination.as_ref(), None, &transmit.npci)?;

        let mut frame = BytesMut::with_capacity(header_len + transmit.apdu.len());
        frame.extend_from_slice(&header[..header_len]);
        frame.extend_from_slice(&transmit.apdu);

        trace!("tx to {}: {}", transmit.route, frame_dump(&frame));
        match self.datalink.send_pdu(&transmit.route, &transmit.npci, &frame) {
            Ok(_) => {
                self.stats.frames_sent += 1;
                Ok(())
            }
            Err(err) => {
                self.stats.send_failures += 1;
                warn!("send to {} failed: {}", transmit.route, err);
                Err(err.into())
            }
        }
    }
}
