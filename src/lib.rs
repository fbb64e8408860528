//! Basic Access Control (BAC) for eMRTDs.
//!
//! A library that establishes a BAC session with an eMRTD (Electronic Machine
//! Readable Travel Document) chip, as described in ICAO Doc 9303-11 Section 4.3.
//!
//! The handshake derives the basic access keys from the MRZ information,
//! authenticates the terminal and the chip to each other with GET CHALLENGE and
//! EXTERNAL AUTHENTICATE, and hands the resulting session keys and Send Sequence
//! Counter to the transport as a [`SecureChannel`].
//!
//! **NOTE:**
//! Please note that this crate is provided 'as is' and is not considered production-ready. Use at your own risk.
//!
//! Secure Messaging, reading of elementary files, PACE and Passive Authentication
//! are **not** part of this crate.
//!
//! # Quick Start
//!
//! ```no_run
//! use emrtd_bac::{bytes2hex, BacProtocol, EmrtdComms, EmrtdError, ErrorKind};
//! use tracing::{error, info};
//!
//! fn main() -> Result<(), EmrtdError> {
//!     tracing_subscriber::fmt()
//!         .with_max_level(tracing::Level::TRACE)
//!         .init();
//!
//!     // Document number, date of birth and date of expiry with check digits.
//!     let mrz = "L898902C<369080619406236";
//!
//!     // Establish a PC/SC context.
//!     let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
//!         Ok(ctx) => ctx,
//!         Err(err) => {
//!             error!("Failed to establish context: {err}");
//!             return Ok(());
//!         }
//!     };
//!
//!     // Use the first reader.
//!     let mut readers_buf = [0; 2048];
//!     let mut readers = ctx
//!         .list_readers(&mut readers_buf)
//!         .map_err(EmrtdError::PcscError)?;
//!     let Some(reader) = readers.next() else {
//!         error!("No readers are connected.");
//!         return Ok(());
//!     };
//!     let card = ctx
//!         .connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY)
//!         .map_err(EmrtdError::PcscError)?;
//!
//!     let mut comms = EmrtdComms::new(card);
//!     info!("ATR from attribute: {}", bytes2hex(&comms.get_atr()?));
//!     comms.select_emrtd_application()?;
//!
//!     let mut bac = BacProtocol::<&mut EmrtdComms<pcsc::Card>>::new(&mut comms);
//!     match bac.perform_handshake(mrz) {
//!         Ok(()) => info!("BAC established"),
//!         Err(err) if err.kind() == ErrorKind::AuthenticationRejected => {
//!             error!("The chip rejected the MRZ information.");
//!         }
//!         Err(err) => return Err(err),
//!     }
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

extern crate alloc;
use alloc::string::String;
use core::fmt::{self, Write};

pub mod bac;
pub mod crypto;
pub mod secure_channel;
pub mod transport;

pub use bac::{
    derive_static_keys, BacHandshake, BacProtocol, HandshakeState, SessionKeys, StaticKeys,
};
pub use crypto::{Des3, KeyDerivation, KeyType, Primitives};
pub use secure_channel::SecureChannel;
pub use transport::{Apdu, ChipTransport, EmrtdCard, EmrtdComms};

#[derive(Debug)]
#[non_exhaustive]
pub enum EmrtdError {
    RecvApduError(u8, u8),
    ShortApduResponseError(usize),
    ParseDataError(String),
    InvalidArgument(&'static str),
    VerifyMacError(),
    InvalidResponseError(),
    OverflowSscError(),
    CalculateHashError(&'static str),
    KeyDerivationError(&'static str),
    TransportUnavailableError(),
    AuthenticationRejectedError(usize),
    InvalidChallengeError(usize),
    InvalidStateError(HandshakeState),
    CancelledError(),
    TimeoutError(),
    PcscError(pcsc::Error),
    UnpadError(cipher::block_padding::UnpadError),
}
impl fmt::Display for EmrtdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::RecvApduError(ref sw1, ref sw2) => write!(
                f,
                "APDU command failed with status code: {sw1:02X} {sw2:02X}"
            ),
            Self::ShortApduResponseError(ref len) => write!(
                f,
                "APDU response must contain a status word, found len: {len}"
            ),
            Self::ParseDataError(ref error) => write!(f, "Invalid data length: {error}"),
            Self::InvalidArgument(error_msg) => write!(f, "Invalid argument: {error_msg}"),
            Self::VerifyMacError() => {
                write!(f, "Encrypted message MAC is not correct")
            }
            Self::InvalidResponseError() => {
                write!(f, "Card response is invalid")
            }
            Self::OverflowSscError() => write!(f, "SSC overflew error"),
            Self::CalculateHashError(error_msg) => {
                write!(f, "Failure during calculation of hashes: {error_msg}")
            }
            Self::KeyDerivationError(error_msg) => {
                write!(f, "Failure during key derivation: {error_msg}")
            }
            Self::TransportUnavailableError() => write!(f, "No transport is connected"),
            Self::AuthenticationRejectedError(ref len) => write!(
                f,
                "Chip rejected the authentication, response length: {len}"
            ),
            Self::InvalidChallengeError(ref len) => {
                write!(f, "Chip challenge must be 8 bytes, found len: {len}")
            }
            Self::InvalidStateError(ref state) => {
                write!(f, "Operation not allowed while the handshake is {state}")
            }
            Self::CancelledError() => write!(f, "Operation was cancelled"),
            Self::TimeoutError() => write!(f, "Operation timed out"),
            Self::PcscError(ref e) => fmt::Display::fmt(&e, f),
            Self::UnpadError(ref e) => fmt::Display::fmt(&e, f),
        }
    }
}
// TODO, change to core::error soon, hopefully?
impl std::error::Error for EmrtdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Self::PcscError(ref e) => Some(e),
            _ => None,
        }
    }
}

/// Coarse classification of an [`EmrtdError`], for callers that only need to
/// decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No transport is connected.
    TransportUnavailable,
    /// The basic access keys or session keys could not be derived.
    KeyDerivationFailure,
    /// The chip did not accept the terminal, or its answer did not authenticate it.
    /// Usually the MRZ information is wrong.
    AuthenticationRejected,
    /// Talking to the chip failed.
    TransportFailure,
    /// The operation was cancelled or timed out.
    Cancelled,
    /// Misuse of the API or an unexpected internal condition.
    Internal,
}

impl EmrtdError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match *self {
            Self::TransportUnavailableError() => ErrorKind::TransportUnavailable,
            Self::KeyDerivationError(_) | Self::CalculateHashError(_) => {
                ErrorKind::KeyDerivationFailure
            }
            Self::AuthenticationRejectedError(_)
            | Self::VerifyMacError()
            | Self::InvalidResponseError() => ErrorKind::AuthenticationRejected,
            Self::InvalidChallengeError(_)
            | Self::RecvApduError(..)
            | Self::ShortApduResponseError(_)
            | Self::PcscError(_) => ErrorKind::TransportFailure,
            Self::CancelledError() | Self::TimeoutError() => ErrorKind::Cancelled,
            Self::InvalidStateError(_)
            | Self::InvalidArgument(_)
            | Self::ParseDataError(_)
            | Self::UnpadError(_)
            | Self::OverflowSscError() => ErrorKind::Internal,
        }
    }
}

/// Converts a byte slice to an uppercase hexadecimal string.
///
/// # Arguments
///
/// * `bytes` - A slice of bytes to be converted.
///
/// # Returns
///
/// A `String` with the hexadecimal representation of the input.
///
/// # Examples
///
/// ```
/// use emrtd_bac::bytes2hex;
///
/// assert_eq!(bytes2hex(&[0x4B, 0x65, 0x79]), "4B6579");
/// assert_eq!(bytes2hex(&[]), "");
/// ```
#[must_use]
pub fn bytes2hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::new(), |mut acc, &byte| {
        // Writing to a String can not fail
        let _ = write!(&mut acc, "{byte:02X}");
        acc
    })
}
