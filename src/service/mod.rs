//! BACnet Application Layer Services
//!
//! The transaction core is agnostic of what a service carries. This module
//! provides what the dispatcher needs at its boundary with the application:
//!
//! - service choice enumerations for confirmed and unconfirmed requests
//! - the reject, abort and error enumerations a responder answers with
//! - handler traits for confirmed and unconfirmed services, implemented for
//!   closures so simple handlers need no boilerplate
//! - the [`CommunicationControl`] predicate that gates outbound traffic
//! - Who-Is and I-Am, which the stack itself uses for address resolution
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::service::*;
//!
//! let mut buffer = Vec::new();
//! WhoIsRequest::for_device(1234).encode(&mut buffer).unwrap();
//! let decoded = WhoIsRequest::decode(&buffer).unwrap();
//! assert!(decoded.matches(1234));
//! assert!(!decoded.matches(1235));
//! ```

use thiserror::Error;

use crate::app::ResponderHandle;
use crate::encoding::{
    decode_context_unsigned, decode_enumerated, decode_object_identifier, decode_unsigned,
    encode_context_unsigned, encode_enumerated, encode_object_identifier, encode_unsigned,
    EncodingError,
};
use crate::network::Route;
use crate::reason_enum;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Object type number of the Device object
pub const DEVICE_OBJECT_TYPE: u16 = 8;

/// Largest device instance number; 4194303 itself means "unconfigured"
pub const MAX_DEVICE_INSTANCE: u32 = 0x3F_FFFF;

/// Errors that can occur during service operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Unsupported service choice
    #[error("unsupported service choice: {0}")]
    UnsupportedServiceChoice(u8),
    /// Invalid service parameters
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),
    /// Encoding/decoding error
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),
}

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and Event Services
    AcknowledgeAlarm = 0,
    ConfirmedCOVNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCOV = 5,

    // File Access Services
    AtomicReadFile = 6,
    AtomicWriteFile = 7,

    // Object Access Services
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,

    // Remote Device Management Services
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,

    // Other Services
    ReadRange = 26,
    SubscribeCOVProperty = 28,
    GetEventInformation = 29,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            1 => Ok(Self::ConfirmedCOVNotification),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            5 => Ok(Self::SubscribeCOV),
            6 => Ok(Self::AtomicReadFile),
            7 => Ok(Self::AtomicWriteFile),
            8 => Ok(Self::AddListElement),
            9 => Ok(Self::RemoveListElement),
            10 => Ok(Self::CreateObject),
            11 => Ok(Self::DeleteObject),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            15 => Ok(Self::WriteProperty),
            16 => Ok(Self::WritePropertyMultiple),
            17 => Ok(Self::DeviceCommunicationControl),
            18 => Ok(Self::ConfirmedPrivateTransfer),
            19 => Ok(Self::ConfirmedTextMessage),
            20 => Ok(Self::ReinitializeDevice),
            26 => Ok(Self::ReadRange),
            28 => Ok(Self::SubscribeCOVProperty),
            29 => Ok(Self::GetEventInformation),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

/// Unconfirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCOVNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
    UnconfirmedCOVNotificationMultiple = 11,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCOVNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            11 => Ok(Self::UnconfirmedCOVNotificationMultiple),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

reason_enum! {
    /// Reject reason codes
    RejectReason {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    },
    u8,
    64..=255
}

reason_enum! {
    /// Abort reason codes
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
    },
    u8,
    64..=255
}

reason_enum! {
    /// Error class of an Error PDU
    ErrorClass {
        Device = 0,
        Object = 1,
        Property = 2,
        Resources = 3,
        Security = 4,
        Services = 5,
        Vt = 6,
        Communication = 7,
    },
    u32,
    64..=65535
}

reason_enum! {
    /// Error code of an Error PDU (the codes the core and common handlers use)
    ErrorCode {
        Other = 0,
        DeviceBusy = 3,
        InvalidDataType = 9,
        ServiceRequestDenied = 29,
        Timeout = 30,
        UnknownObject = 31,
        UnknownProperty = 32,
        UnsupportedObjectType = 36,
        ValueOutOfRange = 37,
        WriteAccessDenied = 40,
        InvalidArrayIndex = 42,
        CommunicationDisabled = 83,
    },
    u32,
    256..=65535
}

/// Segmentation support enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum Segmentation {
    #[default]
    Both = 0,
    Transmit = 1,
    Receive = 2,
    NoSegmentation = 3,
}

impl Segmentation {
    pub fn can_transmit(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Transmit)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Receive)
    }
}

impl TryFrom<u32> for Segmentation {
    type Error = ServiceError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Both),
            1 => Ok(Self::Transmit),
            2 => Ok(Self::Receive),
            3 => Ok(Self::NoSegmentation),
            _ => Err(ServiceError::InvalidParameters("segmentation-supported")),
        }
    }
}

/// How a responder answers a confirmed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    SimpleAck,
    ComplexAck(Vec<u8>),
    Error { class: ErrorClass, code: ErrorCode },
    Reject(RejectReason),
    Abort(AbortReason),
    /// Answer later through the stack's `respond`
    Deferred,
}

/// Where a confirmed request came from and how to answer it later.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub handle: ResponderHandle,
    pub source: Route,
}

impl RequestContext {
    pub fn invoke_id(&self) -> u8 {
        self.handle.invoke_id()
    }
}

/// Application code serving one confirmed service choice.
pub trait ConfirmedServiceHandler: Send {
    fn handle(&mut self, service_choice: u8, payload: &[u8], context: &RequestContext) -> ServiceResponse;
}

impl<F> ConfirmedServiceHandler for F
where
    F: FnMut(u8, &[u8], &RequestContext) -> ServiceResponse + Send,
{
    fn handle(&mut self, service_choice: u8, payload: &[u8], context: &RequestContext) -> ServiceResponse {
        self(service_choice, payload, context)
    }
}

/// Application code receiving one unconfirmed service choice.
pub trait UnconfirmedServiceHandler: Send {
    fn handle(&mut self, service_choice: u8, payload: &[u8], source: &Route);
}

impl<F> UnconfirmedServiceHandler for F
where
    F: FnMut(u8, &[u8], &Route) + Send,
{
    fn handle(&mut self, service_choice: u8, payload: &[u8], source: &Route) {
        self(service_choice, payload, source)
    }
}

/// DeviceCommunicationControl state as seen by the stack.
///
/// While disabled, nothing leaves the node: new confirmed requests are
/// refused and retransmissions and responses are dropped. Timers keep running.
pub trait CommunicationControl: Send {
    fn communication_enabled(&self) -> bool;
}

impl<F> CommunicationControl for F
where
    F: Fn() -> bool + Send,
{
    fn communication_enabled(&self) -> bool {
        self()
    }
}

/// Who-Is request (unconfirmed service)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WhoIsRequest {
    /// Low limit of device instance range (optional)
    pub device_instance_range_low_limit: Option<u32>,
    /// High limit of device instance range (optional)
    pub device_instance_range_high_limit: Option<u32>,
}

impl WhoIsRequest {
    /// Create a new Who-Is request for all devices
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new Who-Is request for a specific device
    pub fn for_device(device_instance: u32) -> Self {
        Self::for_range(device_instance, device_instance)
    }

    /// Create a new Who-Is request for a range of devices
    pub fn for_range(low: u32, high: u32) -> Self {
        Self {
            device_instance_range_low_limit: Some(low),
            device_instance_range_high_limit: Some(high),
        }
    }

    /// Encode the Who-Is request.
    ///
    /// Limits are only sent as a pair; a half-open range encodes as an
    /// unlimited Who-Is.
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        if let (Some(low), Some(high)) = (
            self.device_instance_range_low_limit,
            self.device_instance_range_high_limit,
        ) {
            if low > MAX_DEVICE_INSTANCE || high > MAX_DEVICE_INSTANCE {
                return Err(ServiceError::InvalidParameters("device instance range"));
            }
            encode_context_unsigned(buffer, 0, low)?;
            encode_context_unsigned(buffer, 1, high)?;
        }
        Ok(())
    }

    /// Decode a Who-Is request
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::new());
        }

        let (low, consumed) = decode_context_unsigned(data, 0)?;
        let (high, _) = decode_context_unsigned(&data[consumed..], 1)
            .map_err(|_| ServiceError::InvalidParameters("Who-Is low limit without high limit"))?;
        Ok(Self::for_range(low, high))
    }

    /// Check if this request matches a device instance
    pub fn matches(&self, device_instance: u32) -> bool {
        match (
            self.device_instance_range_low_limit,
            self.device_instance_range_high_limit,
        ) {
            (Some(low), Some(high)) => device_instance >= low && device_instance <= high,
            _ => true,
        }
    }
}

/// I-Am request (unconfirmed service)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    /// Instance number of the announcing Device object
    pub device_instance: u32,
    /// Maximum APDU length accepted
    pub max_apdu_length_accepted: u32,
    pub segmentation_supported: Segmentation,
    pub vendor_identifier: u16,
}

impl IAmRequest {
    pub fn new(
        device_instance: u32,
        max_apdu_length_accepted: u32,
        segmentation_supported: Segmentation,
        vendor_identifier: u16,
    ) -> Self {
        Self {
            device_instance,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        }
    }

    /// Encode the I-Am request
    pub fn encode(&self, buffer: &mut Vec<u8>) -> Result<()> {
        encode_object_identifier(buffer, DEVICE_OBJECT_TYPE, self.device_instance)?;
        encode_unsigned(buffer, self.max_apdu_length_accepted);
        encode_enumerated(buffer, self.segmentation_supported as u32);
        encode_unsigned(buffer, self.vendor_identifier as u32);
        Ok(())
    }

    /// Decode an I-Am request
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut pos = 0;

        let ((object_type, device_instance), consumed) = decode_object_identifier(data)?;
        if object_type != DEVICE_OBJECT_TYPE {
            return Err(ServiceError::InvalidParameters("I-Am object is not a Device"));
        }
        pos += consumed;

        let (max_apdu_length_accepted, consumed) = decode_unsigned(&data[pos..])?;
        pos += consumed;

        let (segmentation, consumed) = decode_enumerated(&data[pos..])?;
        pos += consumed;

        let (vendor_identifier, _) = decode_unsigned(&data[pos..])?;
        let vendor_identifier = u16::try_from(vendor_identifier)
            .map_err(|_| ServiceError::InvalidParameters("vendor identifier"))?;

        Ok(IAmRequest::new(
            device_instance,
            max_apdu_length_accepted,
            Segmentation::try_from(segmentation)?,
            vendor_identifier,
        ))
    }
}
