#![doc = include_str!("../README.md")]

pub mod address;
pub mod app;
pub mod config;
pub mod datalink;
#[cfg(feature = "async")]
pub mod driver;
pub mod encoding;
pub mod network;
pub mod service;
pub mod stack;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use address::{AddressBindingTable, BindingError, Resolution};
pub use app::{Apdu, Outcome, TransactionPool, TsmError};
pub use config::StackConfig;
pub use datalink::{DataLink, DataLinkAddress, DataLinkType};
pub use encoding::{EncodingError, FrameError};
pub use network::{NpciData, Route};
pub use service::{ConfirmedServiceChoice, ServiceError, ServiceResponse, UnconfirmedServiceChoice};
pub use stack::{Stack, StackError};

#[cfg(feature = "async")]
pub use driver::StackHandle;

pub const BACNET_PROTOCOL_VERSION: u8 = network::BACNET_PROTOCOL_VERSION;
pub const BACNET_MAX_APDU: usize = app::MAX_APDU_LENGTH;

#[cfg(test)]
mod tests {
    use crate::{Apdu, DataLinkAddress, FrameError, NpciData, Route};

    #[test]
    fn test_frame_error_from_encoding() {
        let err: FrameError = crate::EncodingError::BufferUnderflow.into();
        assert!(matches!(err, FrameError::Encoding(_)));
    }

    #[test]
    fn test_reexports() {
        let route = Route::unicast(DataLinkAddress::MsTP(4));
        assert!(!route.is_broadcast());
        assert!(NpciData::expecting_reply().expecting_reply);
        assert_eq!(
            Apdu::decode(&[0x20, 0x01, 0x0F]).unwrap().invoke_id(),
            Some(1)
        );
    }
}
