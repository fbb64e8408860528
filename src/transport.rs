//! Chip transport used by the BAC handshake.
//!
//! [`ChipTransport`] is the capability the handshake needs from the outside
//! world. [`EmrtdComms`] implements it on top of a PC/SC card by framing the
//! GET CHALLENGE and EXTERNAL AUTHENTICATE commands as plain ISO/IEC 7816-4 APDUs.

use alloc::{vec, vec::Vec};
use pcsc::Attribute::AtrString;
use tracing::{error, info, trace, warn};

use crate::secure_channel::SecureChannel;
use crate::{bytes2hex, EmrtdError};

/// AID of the eMRTD LDS1 application.
const EMRTD_AID: &[u8; 7] = b"\xA0\x00\x00\x02\x47\x10\x01";

/// Transport towards the chip as seen by the BAC handshake.
///
/// Both exchanges block until the chip answers. Implementations report a
/// timed out or cancelled exchange as `EmrtdError::TimeoutError` or
/// `EmrtdError::CancelledError`.
pub trait ChipTransport {
    /// Sends GET CHALLENGE and returns the chip's random number RND.IC.
    fn get_challenge(&mut self) -> Result<Vec<u8>, EmrtdError>;

    /// Sends EXTERNAL AUTHENTICATE with `cmd_data` and returns the response data.
    ///
    /// An empty response means the chip rejected the cryptogram.
    fn mutual_authenticate(&mut self, cmd_data: &[u8]) -> Result<Vec<u8>, EmrtdError>;

    /// Drops any secure channel left over from a previous session.
    fn clear_secure_channel(&mut self);

    /// Installs the secure channel that protects all following commands.
    fn set_secure_channel(&mut self, channel: SecureChannel);
}

impl<T: ChipTransport + ?Sized> ChipTransport for &mut T {
    fn get_challenge(&mut self) -> Result<Vec<u8>, EmrtdError> {
        (**self).get_challenge()
    }
    fn mutual_authenticate(&mut self, cmd_data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        (**self).mutual_authenticate(cmd_data)
    }
    fn clear_secure_channel(&mut self) {
        (**self).clear_secure_channel();
    }
    fn set_secure_channel(&mut self, channel: SecureChannel) {
        (**self).set_secure_channel(channel);
    }
}

/// A short command APDU.
#[derive(Debug, Clone)]
pub struct Apdu {
    /// Class byte of the APDU
    cla: u8,
    /// Instruction byte of the APDU
    ins: u8,
    /// Parameter 1 byte of the APDU
    p1: u8,
    /// Parameter 2 byte of the APDU
    p2: u8,
    /// Command data field of the APDU, Lc is derived from its length
    cdata: Option<Vec<u8>>,
    /// Expected length of the response data field (Le) in the APDU
    le: Option<u8>,
}

impl Apdu {
    /// Constructs a new short APDU.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidArgument` if `cdata` is empty or longer than 255 bytes.
    ///
    /// # Example
    ///
    /// ```
    /// # use emrtd_bac::EmrtdError;
    /// #
    /// # fn main() -> Result<(), EmrtdError> {
    /// use emrtd_bac::Apdu;
    /// use hex_literal::hex;
    ///
    /// let apdu = Apdu::new(0x00, 0x84, 0x00, 0x00, None, Some(0x08))?;
    /// assert_eq!(apdu.to_bytes(), hex!("0084000008"));
    /// #
    /// #     Ok(())
    /// # }
    /// ```
    pub fn new(
        cla: u8,
        ins: u8,
        p1: u8,
        p2: u8,
        cdata: Option<Vec<u8>>,
        le: Option<u8>,
    ) -> Result<Self, EmrtdError> {
        if let Some(ref cdata) = cdata {
            if cdata.is_empty() || cdata.len() > 255 {
                error!(
                    "Short APDU command data must be 1 to 255 bytes, found {}",
                    cdata.len()
                );
                return Err(EmrtdError::InvalidArgument(
                    "Short APDU command data must be 1 to 255 bytes",
                ));
            }
        }

        Ok(Self {
            cla,
            ins,
            p1,
            p2,
            cdata,
            le,
        })
    }

    /// Retrieves the command header (CLA, INS, P1, P2) of the APDU.
    #[must_use]
    pub fn get_command_header(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    /// Serializes the APDU as `header || Lc || data || Le`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut apdu_bytes = self.get_command_header().to_vec();
        if let Some(ref cdata) = self.cdata {
            // Length is checked in `new`
            apdu_bytes.push(cdata.len() as u8);
            apdu_bytes.extend_from_slice(cdata);
        }
        if let Some(le) = self.le {
            apdu_bytes.push(le);
        }
        apdu_bytes
    }
}

/// pcsc card functions used in `EmrtdComms`
pub trait EmrtdCard {
    fn get_attribute_owned(&self, attribute: pcsc::Attribute) -> Result<Vec<u8>, pcsc::Error>;
    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error>;
}

impl EmrtdCard for pcsc::Card {
    fn get_attribute_owned(&self, attribute: pcsc::Attribute) -> Result<Vec<u8>, pcsc::Error> {
        self.get_attribute_owned(attribute)
    }
    fn transmit<'buf>(
        &self,
        send_buffer: &[u8],
        receive_buffer: &'buf mut [u8],
    ) -> Result<&'buf [u8], pcsc::Error> {
        self.transmit(send_buffer, receive_buffer)
    }
}

/// Maps reader errors, keeping timeouts and cancellations distinguishable.
fn map_pcsc_error(err: pcsc::Error) -> EmrtdError {
    match err {
        pcsc::Error::Timeout => {
            error!("Card did not answer before the reader timed out");
            EmrtdError::TimeoutError()
        }
        pcsc::Error::Cancelled | pcsc::Error::CancelledByUser => {
            error!("Card exchange was cancelled");
            EmrtdError::CancelledError()
        }
        err => {
            error!("PC/SC error while talking to the card: {err}");
            EmrtdError::PcscError(err)
        }
    }
}

/// Plain APDU transport to an eMRTD behind a PC/SC reader.
///
/// Holds the secure channel installed by the BAC handshake so that the layer
/// wrapping later commands can pick it up.
pub struct EmrtdComms<C: EmrtdCard> {
    /// The card interface used for communication with the eMRTD.
    card: C,
    /// Channel established by the last successful BAC handshake.
    secure_channel: Option<SecureChannel>,
}

impl<C: EmrtdCard> EmrtdComms<C> {
    /// Constructs a new `EmrtdComms` instance with the smart card interface.
    #[must_use]
    pub fn new(card: C) -> Self {
        Self {
            card,
            secure_channel: None,
        }
    }

    /// The secure channel established by the last successful handshake, if any.
    #[must_use]
    pub fn secure_channel(&self) -> Option<&SecureChannel> {
        self.secure_channel.as_ref()
    }

    /// Retrieves the Answer to Reset (ATR) from the smart card.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` wrapping the PC/SC error in case of failure.
    pub fn get_atr(&mut self) -> Result<Vec<u8>, EmrtdError> {
        self.card
            .get_attribute_owned(AtrString)
            .map_err(map_pcsc_error)
    }

    /// Sends an APDU in plaintext and receives the response.
    ///
    /// # Returns
    ///
    /// The response data and status bytes.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if the reader fails or the response is shorter than the status word.
    pub fn send(&mut self, apdu: &Apdu) -> Result<(Vec<u8>, [u8; 2]), EmrtdError> {
        let apdu_bytes = apdu.to_bytes();
        trace!("Sending APDU: {}", bytes2hex(&apdu_bytes));

        let mut response_buffer = [0; pcsc::MAX_BUFFER_SIZE];
        let response = self
            .card
            .transmit(&apdu_bytes, &mut response_buffer)
            .map_err(map_pcsc_error)?;

        if response.len() < 2 {
            error!(
                "Card response length should be greater than or equal to 2, found {}",
                response.len()
            );
            return Err(EmrtdError::ShortApduResponseError(response.len()));
        }

        let (data, status) = response.split_at(response.len() - 2);
        let status_bytes = [status[0], status[1]];
        trace!(
            "APDU response ({:02X}{:02X}): {}",
            status_bytes[0],
            status_bytes[1],
            bytes2hex(data)
        );

        Ok((data.to_vec(), status_bytes))
    }

    /// Selects the eMRTD application using AID `A0000002471001`.
    ///
    /// # Errors
    ///
    /// `EmrtdError` in case of failure during sending the APDU or a status other than `9000`.
    pub fn select_emrtd_application(&mut self) -> Result<(), EmrtdError> {
        info!(
            "Selecting eMRTD Application `International AID`: {}...",
            bytes2hex(EMRTD_AID)
        );
        let apdu = Apdu::new(0x00, 0xA4, 0x04, 0x0C, Some(EMRTD_AID.to_vec()), None)?;
        match self.send(&apdu)? {
            (_, [0x90, 0x00]) => Ok(()),
            (_, [sw1, sw2]) => {
                error!("Received invalid SW during SELECT eMRTD application: {sw1:02X} {sw2:02X}");
                Err(EmrtdError::RecvApduError(sw1, sw2))
            }
        }
    }
}

impl<C: EmrtdCard> ChipTransport for EmrtdComms<C> {
    fn get_challenge(&mut self) -> Result<Vec<u8>, EmrtdError> {
        trace!("Requesting challenge...");
        let apdu = Apdu::new(0x00, 0x84, 0x00, 0x00, None, Some(0x08))?;
        match self.send(&apdu)? {
            (rnd_ic, [0x90, 0x00]) => Ok(rnd_ic),
            (_, [sw1, sw2]) => {
                error!("Received invalid SW during GET CHALLENGE: {sw1:02X} {sw2:02X}");
                Err(EmrtdError::RecvApduError(sw1, sw2))
            }
        }
    }

    fn mutual_authenticate(&mut self, cmd_data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
        trace!("Sending EXTERNAL AUTHENTICATE...");
        let apdu = Apdu::new(0x00, 0x82, 0x00, 0x00, Some(cmd_data.to_vec()), Some(0x28))?;
        match self.send(&apdu)? {
            (resp_data, [0x90, 0x00]) => Ok(resp_data),
            // Authentication failed or security status not satisfied
            (_, [sw1 @ 0x63, sw2] | [sw1 @ 0x69, sw2 @ (0x82 | 0x88)]) => {
                warn!("Chip rejected EXTERNAL AUTHENTICATE: {sw1:02X} {sw2:02X}");
                Ok(vec![])
            }
            (_, [sw1, sw2]) => {
                error!("Received invalid SW during EXTERNAL AUTHENTICATE: {sw1:02X} {sw2:02X}");
                Err(EmrtdError::RecvApduError(sw1, sw2))
            }
        }
    }

    fn clear_secure_channel(&mut self) {
        if self.secure_channel.take().is_some() {
            trace!("Dropped previous secure channel");
        }
    }

    fn set_secure_channel(&mut self, channel: SecureChannel) {
        self.secure_channel = Some(channel);
    }
}
