//! Basic Access Control (BAC).
//!
//! Mutual authentication and session key establishment with an eMRTD chip
//! using keys derived from the MRZ.
//! For more details and examples, see ICAO Doc 9303-11 Section 4.3 and Appendix D.3
//! <https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf>
//!
//! Every attempt runs on its own [`BacHandshake`] value, which owns the chip
//! challenge and the terminal randomness of that attempt and wipes them when it
//! fails, succeeds or is dropped. [`BacProtocol`] drives one such value through
//! all steps against a [`ChipTransport`].

use alloc::vec::Vec;
use constant_time_eq::constant_time_eq;
use core::fmt;
use rand::{rngs::OsRng, CryptoRng, RngCore};
use tracing::{error, info, trace};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::{Des3, KeyType, Primitives, BLOCK_SIZE, KEY_LEN};
use crate::secure_channel::SecureChannel;
use crate::transport::ChipTransport;
use crate::{bytes2hex, EmrtdError};

/// Length of RND.IC and RND.IFD.
pub const CHALLENGE_LEN: usize = 8;

/// Length of the EXTERNAL AUTHENTICATE command data and of its response.
pub const COMMAND_LEN: usize = 40;

/// Length of the encrypted part of the command data and of its response.
const CRYPTOGRAM_LEN: usize = 32;

const ZERO_IV: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// Progress of a single BAC attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing derived yet.
    Idle,
    /// KENC and KMAC are derived.
    KeysReady,
    /// GET CHALLENGE has been sent.
    ChallengeRequested,
    /// A valid challenge was received, EXTERNAL AUTHENTICATE is being built and sent.
    Authenticating,
    /// Session keys are derived. Terminal.
    SessionEstablished,
    /// A step failed. Terminal, start over with a new handshake.
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::Idle => "idle",
            Self::KeysReady => "keys ready",
            Self::ChallengeRequested => "challenge requested",
            Self::Authenticating => "authenticating",
            Self::SessionEstablished => "session established",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The basic access keys KENC and KMAC derived from the MRZ.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StaticKeys {
    k_enc: [u8; KEY_LEN],
    k_mac: [u8; KEY_LEN],
}

impl StaticKeys {
    #[must_use]
    pub fn k_enc(&self) -> &[u8; KEY_LEN] {
        &self.k_enc
    }

    #[must_use]
    pub fn k_mac(&self) -> &[u8; KEY_LEN] {
        &self.k_mac
    }
}

/// Session keys and initial Send Sequence Counter produced by a successful handshake.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    ks_enc: [u8; KEY_LEN],
    ks_mac: [u8; KEY_LEN],
    ssc: [u8; 8],
}

impl SessionKeys {
    #[must_use]
    pub fn ks_enc(&self) -> &[u8; KEY_LEN] {
        &self.ks_enc
    }

    #[must_use]
    pub fn ks_mac(&self) -> &[u8; KEY_LEN] {
        &self.ks_mac
    }

    /// `RND.IC[4..8] || RND.IFD[4..8]`
    #[must_use]
    pub fn ssc(&self) -> &[u8; 8] {
        &self.ssc
    }
}

/// Derives the basic access keys from the MRZ information.
///
/// The key seed is the most significant 16 bytes of the hash of the MRZ
/// information (document number, date of birth and date of expiry, each
/// followed by its check digit). The MRZ information must already be valid.
///
/// # Errors
///
/// * `EmrtdError` if hashing or key derivation fails.
///
/// # Example
///
/// ```
/// # use emrtd_bac::EmrtdError;
/// #
/// # fn main() -> Result<(), EmrtdError> {
/// use emrtd_bac::{derive_static_keys, Des3};
/// use hex_literal::hex;
///
/// let keys = derive_static_keys(&Des3, "L898902C<369080619406236")?;
/// assert_eq!(keys.k_enc(), &hex!("AB94FDECF2674FDFB9B391F85D7F76F2"));
/// assert_eq!(keys.k_mac(), &hex!("7962D9ECE03D1ACD4C76089DCE131543"));
/// #
/// #     Ok(())
/// # }
/// ```
pub fn derive_static_keys<P: Primitives + ?Sized>(
    primitives: &P,
    mrz: &str,
) -> Result<StaticKeys, EmrtdError> {
    let digest = Zeroizing::new(primitives.hash(mrz.as_bytes())?);
    if digest.len() < KEY_LEN {
        error!(
            "Digest must be at least {KEY_LEN} bytes to form a key seed, found {}",
            digest.len()
        );
        return Err(EmrtdError::KeyDerivationError(
            "Digest is shorter than the key seed",
        ));
    }
    let key_seed = &digest[..KEY_LEN];

    trace!("Computing basic access keys...");
    let k_enc = primitives.derive_key(key_seed, KeyType::Encryption)?;
    let k_mac = primitives.derive_key(key_seed, KeyType::Mac)?;

    Ok(StaticKeys { k_enc, k_mac })
}

/// State of one BAC attempt.
///
/// Steps must be called in order:
/// [`derive_static_keys`](Self::derive_static_keys),
/// [`request_challenge`](Self::request_challenge),
/// [`build_authentication_command`](Self::build_authentication_command),
/// [`authenticate`](Self::authenticate),
/// [`derive_session_keys`](Self::derive_session_keys).
/// When the challenge was obtained some other way, `build_authentication_command`
/// may directly follow `derive_static_keys`.
///
/// Any error, including a step called out of order, moves the handshake to
/// [`HandshakeState::Failed`] and wipes its secrets.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BacHandshake {
    #[zeroize(skip)]
    state: HandshakeState,
    static_keys: Option<StaticKeys>,
    rnd_ic: [u8; CHALLENGE_LEN],
    rnd_ifd: [u8; CHALLENGE_LEN],
    k_ifd: [u8; KEY_LEN],
    /// Whether RND.IFD and K.IFD have been drawn for the current command.
    command_built: bool,
}

impl Default for BacHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BacHandshake {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BacHandshake")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl BacHandshake {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            static_keys: None,
            rnd_ic: [0; CHALLENGE_LEN],
            rnd_ifd: [0; CHALLENGE_LEN],
            k_ifd: [0; KEY_LEN],
            command_built: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn fail_with(&mut self, err: EmrtdError) -> EmrtdError {
        self.zeroize();
        self.state = HandshakeState::Failed;
        err
    }

    fn expect_state(
        &mut self,
        allowed: &[HandshakeState],
        step: &'static str,
    ) -> Result<(), EmrtdError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        error!("Can not {step} while the BAC handshake is {}", self.state);
        let state = self.state;
        Err(self.fail_with(EmrtdError::InvalidStateError(state)))
    }

    fn expect_command_built(&mut self, step: &'static str) -> Result<(), EmrtdError> {
        self.expect_state(&[HandshakeState::Authenticating], step)?;
        if self.command_built {
            return Ok(());
        }
        error!("Can not {step} before the authentication command is built");
        let state = self.state;
        Err(self.fail_with(EmrtdError::InvalidStateError(state)))
    }

    fn static_keys(&self) -> Result<&StaticKeys, EmrtdError> {
        self.static_keys.as_ref().ok_or_else(|| {
            error!("Basic access keys are not derived");
            EmrtdError::InvalidStateError(self.state)
        })
    }

    /// Derives KENC and KMAC from the MRZ information, see [`derive_static_keys`].
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if the handshake is not idle or key derivation fails.
    pub fn derive_static_keys<P: Primitives + ?Sized>(
        &mut self,
        primitives: &P,
        mrz: &str,
    ) -> Result<(), EmrtdError> {
        self.expect_state(&[HandshakeState::Idle], "derive the basic access keys")?;
        match derive_static_keys(primitives, mrz) {
            Ok(keys) => {
                self.static_keys = Some(keys);
                self.state = HandshakeState::KeysReady;
                Ok(())
            }
            Err(err) => Err(self.fail_with(err)),
        }
    }

    /// Sends GET CHALLENGE and returns RND.IC.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::InvalidChallengeError` if the chip does not return exactly 8 bytes.
    /// * Any error of the transport.
    pub fn request_challenge<T: ChipTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<[u8; CHALLENGE_LEN], EmrtdError> {
        self.expect_state(&[HandshakeState::KeysReady], "request a challenge")?;
        self.state = HandshakeState::ChallengeRequested;

        let challenge = match transport.get_challenge() {
            Ok(challenge) => challenge,
            Err(err) => return Err(self.fail_with(err)),
        };
        let Ok(rnd_ic) = <[u8; CHALLENGE_LEN]>::try_from(challenge.as_slice()) else {
            error!(
                "GET CHALLENGE must return {CHALLENGE_LEN} bytes, found {}",
                challenge.len()
            );
            return Err(self.fail_with(EmrtdError::InvalidChallengeError(challenge.len())));
        };

        trace!("RND.IC: {}", bytes2hex(&rnd_ic));
        self.state = HandshakeState::Authenticating;
        Ok(rnd_ic)
    }

    /// Builds the EXTERNAL AUTHENTICATE command data `E.IFD || M.IFD`.
    ///
    /// Draws fresh RND.IFD and K.IFD from `rng` on every call, encrypts
    /// `S = RND.IFD || RND.IC || K.IFD` with KENC and a zero IV, and appends the
    /// MAC of the padded cryptogram under KMAC.
    ///
    /// # Errors
    ///
    /// * `EmrtdError` if called out of order or a primitive fails.
    pub fn build_authentication_command<P, R>(
        &mut self,
        primitives: &P,
        rng: &mut R,
        rnd_ic: &[u8; CHALLENGE_LEN],
    ) -> Result<[u8; COMMAND_LEN], EmrtdError>
    where
        P: Primitives + ?Sized,
        R: RngCore + CryptoRng + ?Sized,
    {
        self.expect_state(
            &[HandshakeState::KeysReady, HandshakeState::Authenticating],
            "build the authentication command",
        )?;
        match self.try_build_authentication_command(primitives, rng, rnd_ic) {
            Ok(cmd_data) => {
                self.command_built = true;
                self.state = HandshakeState::Authenticating;
                Ok(cmd_data)
            }
            Err(err) => Err(self.fail_with(err)),
        }
    }

    fn try_build_authentication_command<P, R>(
        &mut self,
        primitives: &P,
        rng: &mut R,
        rnd_ic: &[u8; CHALLENGE_LEN],
    ) -> Result<[u8; COMMAND_LEN], EmrtdError>
    where
        P: Primitives + ?Sized,
        R: RngCore + CryptoRng + ?Sized,
    {
        self.rnd_ic = *rnd_ic;
        rng.fill_bytes(&mut self.rnd_ifd);
        rng.fill_bytes(&mut self.k_ifd);

        let keys = self.static_keys()?;
        let s = Zeroizing::new([&self.rnd_ifd[..], &self.rnd_ic[..], &self.k_ifd[..]].concat());

        let e_ifd = primitives.encrypt_cbc(keys.k_enc(), &ZERO_IV, &s)?;
        if e_ifd.len() != CRYPTOGRAM_LEN {
            error!(
                "Encrypted authentication data must be {CRYPTOGRAM_LEN} bytes, found {}",
                e_ifd.len()
            );
            return Err(EmrtdError::InvalidArgument(
                "Encrypted authentication data has the wrong length",
            ));
        }
        let m_ifd = primitives.mac(keys.k_mac(), &primitives.pad(&e_ifd)?)?;

        let mut cmd_data = [0; COMMAND_LEN];
        cmd_data[..CRYPTOGRAM_LEN].copy_from_slice(&e_ifd);
        cmd_data[CRYPTOGRAM_LEN..].copy_from_slice(&m_ifd);
        trace!("EXTERNAL AUTHENTICATE data: {}", bytes2hex(&cmd_data));
        Ok(cmd_data)
    }

    /// Sends EXTERNAL AUTHENTICATE and returns the chip's response data.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::AuthenticationRejectedError` if the chip answers with no data,
    ///   which usually means the MRZ information was wrong.
    /// * Any error of the transport.
    pub fn authenticate<T: ChipTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        cmd_data: &[u8; COMMAND_LEN],
    ) -> Result<Vec<u8>, EmrtdError> {
        self.expect_command_built("send the authentication command")?;
        match transport.mutual_authenticate(cmd_data) {
            Ok(resp_data) if resp_data.is_empty() => {
                error!("Chip returned no data for EXTERNAL AUTHENTICATE, MRZ is probably wrong");
                Err(self.fail_with(EmrtdError::AuthenticationRejectedError(0)))
            }
            Ok(resp_data) => Ok(resp_data),
            Err(err) => Err(self.fail_with(err)),
        }
    }

    /// Validates the chip's response and derives the session keys and SSC.
    ///
    /// The response starts with `E.IC || M.IC` (40 bytes), anything after that
    /// is ignored. The MAC is verified before anything is decrypted, then the
    /// echoed RND.IC and RND.IFD are compared against the values of this
    /// attempt. The session key seed is `K.IFD xor K.IC`.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::AuthenticationRejectedError` if the response is shorter than 32 bytes,
    ///   or has no complete MAC after the 32 byte cryptogram.
    /// * `EmrtdError::VerifyMacError` or `EmrtdError::InvalidResponseError` if the response
    ///   does not authenticate the chip.
    pub fn derive_session_keys<P: Primitives + ?Sized>(
        &mut self,
        primitives: &P,
        resp_data: &[u8],
    ) -> Result<SessionKeys, EmrtdError> {
        self.expect_command_built("derive the session keys")?;
        match self.try_derive_session_keys(primitives, resp_data) {
            Ok(keys) => {
                self.zeroize();
                self.state = HandshakeState::SessionEstablished;
                Ok(keys)
            }
            Err(err) => Err(self.fail_with(err)),
        }
    }

    fn try_derive_session_keys<P: Primitives + ?Sized>(
        &self,
        primitives: &P,
        resp_data: &[u8],
    ) -> Result<SessionKeys, EmrtdError> {
        if resp_data.len() < CRYPTOGRAM_LEN {
            error!(
                "EXTERNAL AUTHENTICATE response is shorter than {CRYPTOGRAM_LEN} bytes: {}",
                resp_data.len()
            );
            return Err(EmrtdError::AuthenticationRejectedError(resp_data.len()));
        }
        // E.IC is there but M.IC is cut short
        if resp_data.len() < COMMAND_LEN {
            error!(
                "EXTERNAL AUTHENTICATE response has no complete MAC, found {} bytes",
                resp_data.len()
            );
            return Err(EmrtdError::AuthenticationRejectedError(resp_data.len()));
        }
        if resp_data.len() > COMMAND_LEN {
            trace!(
                "Ignoring {} bytes after the EXTERNAL AUTHENTICATE response",
                resp_data.len() - COMMAND_LEN
            );
        }

        let keys = self.static_keys()?;
        let (e_ic, m_ic) = resp_data[..COMMAND_LEN].split_at(CRYPTOGRAM_LEN);

        let expected_m_ic = primitives.mac(keys.k_mac(), &primitives.pad(e_ic)?)?;
        if !constant_time_eq(&expected_m_ic, m_ic) {
            error!("MAC verification of the EXTERNAL AUTHENTICATE response failed");
            return Err(EmrtdError::VerifyMacError());
        }

        let resp = Zeroizing::new(primitives.decrypt_cbc(keys.k_enc(), &ZERO_IV, e_ic)?);
        if resp.len() != CRYPTOGRAM_LEN {
            error!(
                "Decrypted response must be {CRYPTOGRAM_LEN} bytes, found {}",
                resp.len()
            );
            return Err(EmrtdError::InvalidResponseError());
        }

        if !constant_time_eq(&resp[..8], &self.rnd_ic) {
            error!("RND.IC returned by the chip does not match the challenge");
            return Err(EmrtdError::InvalidResponseError());
        }
        if !constant_time_eq(&resp[8..16], &self.rnd_ifd) {
            error!("RND.IFD returned by the chip does not match the one sent");
            return Err(EmrtdError::InvalidResponseError());
        }

        let k_ic = &resp[16..CRYPTOGRAM_LEN];
        let ses_key_seed = Zeroizing::new(primitives.xor(&self.k_ifd, k_ic)?);

        trace!("Computing session keys...");
        let ks_enc = primitives.derive_key(&ses_key_seed, KeyType::Encryption)?;
        let ks_mac = primitives.derive_key(&ses_key_seed, KeyType::Mac)?;

        let mut ssc = [0; 8];
        ssc[..4].copy_from_slice(&self.rnd_ic[4..]);
        ssc[4..].copy_from_slice(&self.rnd_ifd[4..]);
        trace!("Initial SSC: {}", bytes2hex(&ssc));

        Ok(SessionKeys {
            ks_enc,
            ks_mac,
            ssc,
        })
    }
}

/// Runs BAC handshakes against a chip transport.
///
/// `P` is the primitive toolbox and `R` the source of RND.IFD and K.IFD. A
/// fresh [`BacHandshake`] is used for every call to
/// [`perform_handshake`](Self::perform_handshake).
pub struct BacProtocol<T: ChipTransport, P: Primitives = Des3, R: RngCore + CryptoRng = OsRng> {
    rng: R,
    primitives: P,
    /// The transport the handshake runs over, if one is connected.
    transport: Option<T>,
}

impl<T: ChipTransport, P: Primitives + Default, R: RngCore + CryptoRng + Default>
    BacProtocol<T, P, R>
{
    /// Constructs a new `BacProtocol` bound to `transport`.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            rng: R::default(),
            primitives: P::default(),
            transport: Some(transport),
        }
    }

    /// Constructs a new `BacProtocol` without a transport, see [`bind`](Self::bind).
    #[must_use]
    pub fn unbound() -> Self {
        Self {
            rng: R::default(),
            primitives: P::default(),
            transport: None,
        }
    }
}

impl<T: ChipTransport, P: Primitives, R: RngCore + CryptoRng> BacProtocol<T, P, R> {
    /// Constructs a new `BacProtocol` from its parts.
    #[must_use]
    pub fn from_parts(transport: Option<T>, primitives: P, rng: R) -> Self {
        Self {
            rng,
            primitives,
            transport,
        }
    }

    /// Binds a transport, returning the previously bound one.
    pub fn bind(&mut self, transport: T) -> Option<T> {
        self.transport.replace(transport)
    }

    /// Unbinds and returns the transport.
    pub fn unbind(&mut self) -> Option<T> {
        self.transport.take()
    }

    #[must_use]
    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> Option<&mut T> {
        self.transport.as_mut()
    }

    /// Establishes session keys for Basic Access Control (BAC) protocol.
    ///
    /// Any secure channel already installed on the transport is cleared before
    /// the chip is contacted, and the new one is installed only once the chip
    /// has been authenticated, so a failed attempt never leaves a channel behind.
    ///
    /// # Arguments
    ///
    /// * `mrz` - The MRZ information: document number, date of birth and date of
    ///   expiry, each followed by its check digit.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::TransportUnavailableError` if no transport is bound.
    /// * `EmrtdError::AuthenticationRejectedError` if the chip rejects the MRZ derived keys.
    /// * Any transport or primitive error, unchanged. See [`EmrtdError::kind`].
    pub fn perform_handshake(&mut self, mrz: &str) -> Result<(), EmrtdError> {
        let mut handshake = BacHandshake::new();
        handshake.derive_static_keys(&self.primitives, mrz)?;

        let Some(transport) = self.transport.as_mut() else {
            error!("Can not perform BAC, no transport is connected");
            return Err(EmrtdError::TransportUnavailableError());
        };
        transport.clear_secure_channel();

        trace!("Establishing session keys...");
        let rnd_ic = handshake.request_challenge(transport)?;
        let cmd_data =
            handshake.build_authentication_command(&self.primitives, &mut self.rng, &rnd_ic)?;
        let resp_data = handshake.authenticate(transport, &cmd_data)?;
        let session_keys = handshake.derive_session_keys(&self.primitives, &resp_data)?;

        transport.set_secure_channel(SecureChannel::from(&session_keys));
        info!("BAC session keys established");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{compute_key, xor_slices, KeyDerivation};
    use crate::ErrorKind;
    use core::cell::Cell;
    use hex_literal::hex;

    const MRZ: &str = "L898902C<369080619406236";

    // Example taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix D.3
    const RND_IC: [u8; 8] = hex!("4608F91988702212");
    const CMD_DATA: [u8; 40] =
        hex!("72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799FAE2F498F76ED92F25F1448EEA8AD90A7");
    const RESP_DATA: [u8; 40] =
        hex!("46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF2EEDC94EE178534F2F2D235D074D7449");

    #[derive(Clone, Debug)]
    struct MockRng {
        data: Vec<u8>,
        index: usize,
    }

    impl Default for MockRng {
        fn default() -> MockRng {
            // RND.IFD and K.IFD of Appendix D.3, then a second set
            let data = [
                hex!("781723860C06C226 0B795240CB7049B01C19B33E32804F0B"),
                hex!("A1B2C3D4E5F60718 293A4B5C6D7E8F90A1B2C3D4E5F60718"),
            ]
            .concat();
            MockRng { data, index: 0 }
        }
    }

    impl CryptoRng for MockRng {}

    impl RngCore for MockRng {
        fn next_u32(&mut self) -> u32 {
            let mut buf = [0; 4];
            self.fill_bytes(&mut buf);
            u32::from_be_bytes(buf)
        }

        fn next_u64(&mut self) -> u64 {
            let mut buf = [0; 8];
            self.fill_bytes(&mut buf);
            u64::from_be_bytes(buf)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest.iter_mut() {
                *byte = self.data[self.index];
                self.index = (self.index + 1) % self.data.len();
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    /// `Des3` that counts how often it decrypts.
    #[derive(Default)]
    struct CountingDes3 {
        decryptions: Cell<usize>,
    }

    impl KeyDerivation for CountingDes3 {
        fn derive_key(&self, key_seed: &[u8], key_type: KeyType) -> Result<[u8; 16], EmrtdError> {
            Des3.derive_key(key_seed, key_type)
        }
    }

    impl Primitives for CountingDes3 {
        fn hash(&self, data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
            Des3.hash(data)
        }

        fn encrypt_cbc(
            &self,
            key: &[u8; 16],
            iv: &[u8; 8],
            data: &[u8],
        ) -> Result<Vec<u8>, EmrtdError> {
            Des3.encrypt_cbc(key, iv, data)
        }

        fn decrypt_cbc(
            &self,
            key: &[u8; 16],
            iv: &[u8; 8],
            data: &[u8],
        ) -> Result<Vec<u8>, EmrtdError> {
            self.decryptions.set(self.decryptions.get() + 1);
            Des3.decrypt_cbc(key, iv, data)
        }

        fn mac(&self, key: &[u8; 16], padded_data: &[u8]) -> Result<[u8; 8], EmrtdError> {
            Des3.mac(key, padded_data)
        }
    }

    /// A chip that knows the MRZ and answers like a real eMRTD.
    struct SimulatedChip {
        keys: StaticKeys,
        challenge: Vec<u8>,
        k_ic: [u8; 16],
        /// Answer EXTERNAL AUTHENTICATE with no data, as for a wrong MRZ.
        reject: bool,
        get_challenge_error: Option<fn() -> EmrtdError>,
        /// Every decrypted `S` received.
        received: Vec<Vec<u8>>,
        channel: Option<SecureChannel>,
        clear_count: usize,
    }

    impl SimulatedChip {
        fn new(mrz: &str) -> Self {
            SimulatedChip {
                keys: derive_static_keys(&Des3, mrz).expect("valid MRZ"),
                challenge: RND_IC.to_vec(),
                k_ic: hex!("0B4F80323EB3191CB04970CB4052790B"),
                reject: false,
                get_challenge_error: None,
                received: Vec::new(),
                channel: None,
                clear_count: 0,
            }
        }
    }

    impl ChipTransport for SimulatedChip {
        fn get_challenge(&mut self) -> Result<Vec<u8>, EmrtdError> {
            if let Some(err) = self.get_challenge_error {
                return Err(err());
            }
            Ok(self.challenge.clone())
        }

        fn mutual_authenticate(&mut self, cmd_data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
            let s = Des3.decrypt_cbc(self.keys.k_enc(), &[0; 8], &cmd_data[..32])?;
            self.received.push(s.clone());
            if self.reject {
                return Ok(Vec::new());
            }
            let r = [&s[8..16], &s[..8], &self.k_ic[..]].concat();
            let e_ic = Des3.encrypt_cbc(self.keys.k_enc(), &[0; 8], &r)?;
            let m_ic = Des3.mac(self.keys.k_mac(), &Des3.pad(&e_ic)?)?;
            Ok([&e_ic[..], &m_ic[..]].concat())
        }

        fn clear_secure_channel(&mut self) {
            self.clear_count += 1;
            self.channel = None;
        }

        fn set_secure_channel(&mut self, channel: SecureChannel) {
            self.channel = Some(channel);
        }
    }

    fn handshake_after_challenge(
        rnd_ic: &[u8; 8],
    ) -> Result<(BacHandshake, [u8; COMMAND_LEN]), EmrtdError> {
        let mut rng = MockRng::default();
        let mut handshake = BacHandshake::new();
        handshake.derive_static_keys(&Des3, MRZ)?;
        let cmd_data = handshake.build_authentication_command(&Des3, &mut rng, rnd_ic)?;
        Ok((handshake, cmd_data))
    }

    #[test]
    fn test_derive_static_keys_deterministic() -> Result<(), EmrtdError> {
        let mrzs = [
            MRZ,
            "D231458907UTO7408122F1204159<<<<<<<6",
            "T22000129364081251010318",
        ];
        for mrz in mrzs {
            let first = derive_static_keys(&Des3, mrz)?;
            let second = derive_static_keys(&Des3, mrz)?;
            assert_eq!(first.k_enc(), second.k_enc());
            assert_eq!(first.k_mac(), second.k_mac());
            assert_ne!(first.k_enc(), first.k_mac());
        }
        Ok(())
    }

    #[test]
    fn test_derive_static_keys_short_digest() {
        struct ShortHash;

        impl KeyDerivation for ShortHash {
            fn derive_key(&self, seed: &[u8], key_type: KeyType) -> Result<[u8; 16], EmrtdError> {
                compute_key(seed, key_type)
            }
        }

        impl Primitives for ShortHash {
            fn hash(&self, _data: &[u8]) -> Result<Vec<u8>, EmrtdError> {
                Ok(vec![0; 12])
            }

            fn encrypt_cbc(
                &self,
                _key: &[u8; 16],
                _iv: &[u8; 8],
                data: &[u8],
            ) -> Result<Vec<u8>, EmrtdError> {
                Ok(data.to_vec())
            }

            fn decrypt_cbc(
                &self,
                _key: &[u8; 16],
                _iv: &[u8; 8],
                data: &[u8],
            ) -> Result<Vec<u8>, EmrtdError> {
                Ok(data.to_vec())
            }

            fn mac(&self, _key: &[u8; 16], _data: &[u8]) -> Result<[u8; 8], EmrtdError> {
                Ok([0; 8])
            }
        }

        let result = derive_static_keys(&ShortHash, MRZ);
        assert!(result.is_err_and(|e| matches!(e, EmrtdError::KeyDerivationError(_))));

        let mut handshake = BacHandshake::new();
        let result = handshake.derive_static_keys(&ShortHash, MRZ);
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::KeyDerivationFailure));
        assert_eq!(handshake.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_build_authentication_command_appendix_d() -> Result<(), EmrtdError> {
        let (handshake, cmd_data) = handshake_after_challenge(&RND_IC)?;
        assert_eq!(cmd_data, CMD_DATA);
        assert_eq!(handshake.state(), HandshakeState::Authenticating);
        Ok(())
    }

    #[test]
    fn test_build_authentication_command_layout() -> Result<(), EmrtdError> {
        let keys = derive_static_keys(&Des3, MRZ)?;
        for rnd_ic in [[0x00; 8], [0xFF; 8], hex!("0123456789ABCDEF")] {
            let (_, cmd_data) = handshake_after_challenge(&rnd_ic)?;
            assert_eq!(cmd_data.len(), COMMAND_LEN);

            let s = Des3.decrypt_cbc(keys.k_enc(), &[0; 8], &cmd_data[..32])?;
            assert_eq!(&s[..8], &hex!("781723860C06C226"));
            assert_eq!(&s[8..16], &rnd_ic);
            assert_eq!(&s[16..], &hex!("0B795240CB7049B01C19B33E32804F0B"));

            let m_ifd = Des3.mac(keys.k_mac(), &Des3.pad(&cmd_data[..32])?)?;
            assert_eq!(&cmd_data[32..], &m_ifd);
        }
        Ok(())
    }

    #[test]
    fn test_derive_session_keys_appendix_d() -> Result<(), EmrtdError> {
        let (mut handshake, _) = handshake_after_challenge(&RND_IC)?;
        let keys = handshake.derive_session_keys(&Des3, &RESP_DATA)?;
        assert_eq!(keys.ks_enc(), &hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"));
        assert_eq!(keys.ks_mac(), &hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"));
        assert_eq!(keys.ssc(), &hex!("887022120C06C226"));
        assert_eq!(handshake.state(), HandshakeState::SessionEstablished);
        Ok(())
    }

    #[test]
    fn test_derive_session_keys_ignores_trailing_bytes() -> Result<(), EmrtdError> {
        for trailer in [&hex!("9000")[..], &[0xAA; 24][..]] {
            let (mut handshake, _) = handshake_after_challenge(&RND_IC)?;
            let resp_data = [&RESP_DATA[..], trailer].concat();
            let keys = handshake.derive_session_keys(&Des3, &resp_data)?;
            assert_eq!(keys.ks_enc(), &hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"));
            assert_eq!(keys.ks_mac(), &hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"));
            assert_eq!(keys.ssc(), &hex!("887022120C06C226"));
        }
        Ok(())
    }

    #[test]
    fn test_derive_session_keys_matches_independent_kdf() -> Result<(), EmrtdError> {
        let mut chip = SimulatedChip::new(MRZ);
        chip.challenge = hex!("0011223344556677").to_vec();
        chip.k_ic = hex!("F0E1D2C3B4A5968778695A4B3C2D1E0F");

        let mut rng = MockRng::default();
        let mut handshake = BacHandshake::new();
        handshake.derive_static_keys(&Des3, MRZ)?;
        let rnd_ic = handshake.request_challenge(&mut chip)?;
        let cmd_data = handshake.build_authentication_command(&Des3, &mut rng, &rnd_ic)?;
        let resp_data = handshake.authenticate(&mut chip, &cmd_data)?;
        let keys = handshake.derive_session_keys(&Des3, &resp_data)?;

        let seed = xor_slices(&hex!("0B795240CB7049B01C19B33E32804F0B"), &chip.k_ic)?;
        assert_eq!(keys.ks_enc(), &compute_key(&seed, KeyType::Encryption)?);
        assert_eq!(keys.ks_mac(), &compute_key(&seed, KeyType::Mac)?);
        assert_eq!(keys.ssc(), &hex!("44556677 0C06C226"));
        Ok(())
    }

    #[test]
    fn test_derive_session_keys_short_response_is_not_decrypted() -> Result<(), EmrtdError> {
        let primitives = CountingDes3::default();
        for len in [0, 8, 31] {
            let mut handshake = BacHandshake::new();
            handshake.derive_static_keys(&primitives, MRZ)?;
            handshake.build_authentication_command(&primitives, &mut MockRng::default(), &RND_IC)?;

            let err = handshake.derive_session_keys(&primitives, &RESP_DATA[..len]).err();
            assert!(matches!(err, Some(EmrtdError::AuthenticationRejectedError(l)) if l == len));
            assert!(err.is_some_and(|e| e.kind() == ErrorKind::AuthenticationRejected));
            assert_eq!(handshake.state(), HandshakeState::Failed);
        }
        assert_eq!(primitives.decryptions.get(), 0);
        Ok(())
    }

    #[test]
    fn test_derive_session_keys_truncated_mac() -> Result<(), EmrtdError> {
        // E.IC is complete, M.IC is missing or cut short
        for len in [32, 36, 39] {
            let (mut handshake, _) = handshake_after_challenge(&RND_IC)?;
            let err = handshake.derive_session_keys(&Des3, &RESP_DATA[..len]).err();
            assert!(matches!(err, Some(EmrtdError::AuthenticationRejectedError(l)) if l == len));
            assert_eq!(handshake.state(), HandshakeState::Failed);
        }
        Ok(())
    }

    #[test]
    fn test_derive_session_keys_bad_mac() -> Result<(), EmrtdError> {
        let primitives = CountingDes3::default();
        let mut handshake = BacHandshake::new();
        handshake.derive_static_keys(&primitives, MRZ)?;
        handshake.build_authentication_command(&primitives, &mut MockRng::default(), &RND_IC)?;

        let mut resp_data = RESP_DATA;
        resp_data[39] ^= 0x01;
        let result = handshake.derive_session_keys(&primitives, &resp_data);
        assert!(result.is_err_and(|e| matches!(e, EmrtdError::VerifyMacError())));
        assert_eq!(primitives.decryptions.get(), 0);
        Ok(())
    }

    #[test]
    fn test_derive_session_keys_wrong_challenge_echo() -> Result<(), EmrtdError> {
        // Response of Appendix D.3 is only valid for RND.IC 4608F91988702212
        let (mut handshake, _) = handshake_after_challenge(&hex!("4608F91988702213"))?;
        let err = handshake.derive_session_keys(&Des3, &RESP_DATA).err();
        assert!(matches!(err, Some(EmrtdError::InvalidResponseError())));
        assert!(err.is_some_and(|e| e.kind() == ErrorKind::AuthenticationRejected));
        Ok(())
    }

    #[test]
    fn test_steps_out_of_order() -> Result<(), EmrtdError> {
        let mut handshake = BacHandshake::new();
        let err = handshake.derive_session_keys(&Des3, &[0; 40]).err();
        assert!(matches!(err, Some(EmrtdError::InvalidStateError(HandshakeState::Idle))));
        assert_eq!(handshake.state(), HandshakeState::Failed);

        // A failed handshake can not be resumed
        let err = handshake.derive_static_keys(&Des3, MRZ).err();
        assert!(matches!(err, Some(EmrtdError::InvalidStateError(HandshakeState::Failed))));

        // Sending needs a built command
        let mut chip = SimulatedChip::new(MRZ);
        let mut handshake = BacHandshake::new();
        handshake.derive_static_keys(&Des3, MRZ)?;
        handshake.request_challenge(&mut chip)?;
        let result = handshake.authenticate(&mut chip, &[0; 40]);
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::Internal));
        assert!(chip.received.is_empty());
        Ok(())
    }

    #[test]
    fn test_request_challenge_wrong_length() -> Result<(), EmrtdError> {
        for challenge in [vec![], vec![0; 7], vec![0; 9]] {
            let mut chip = SimulatedChip::new(MRZ);
            chip.challenge = challenge.clone();
            let mut handshake = BacHandshake::new();
            handshake.derive_static_keys(&Des3, MRZ)?;

            let err = handshake.request_challenge(&mut chip).err();
            let len = challenge.len();
            assert!(matches!(err, Some(EmrtdError::InvalidChallengeError(l)) if l == len));
            assert!(err.is_some_and(|e| e.kind() == ErrorKind::TransportFailure));
            assert_eq!(handshake.state(), HandshakeState::Failed);
        }
        Ok(())
    }

    #[test]
    fn test_perform_handshake() -> Result<(), EmrtdError> {
        let mut chip = SimulatedChip::new(MRZ);
        chip.channel = Some(SecureChannel::new([0xEE; 16], [0xEE; 16], [0xEE; 8]));

        let mut protocol = BacProtocol::<_, Des3, MockRng>::new(&mut chip);
        protocol.perform_handshake(MRZ)?;
        drop(protocol);

        assert_eq!(chip.clear_count, 1);
        let channel = chip.channel.as_ref().expect("channel is installed");
        assert_eq!(channel.ks_enc(), &hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"));
        assert_eq!(channel.ks_mac(), &hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"));
        assert_eq!(channel.ssc(), &hex!("887022120C06C226"));
        Ok(())
    }

    #[test]
    fn test_perform_handshake_unbound() {
        let mut protocol = BacProtocol::<SimulatedChip, Des3, MockRng>::unbound();
        let err = protocol.perform_handshake(MRZ).err();
        assert!(matches!(err, Some(EmrtdError::TransportUnavailableError())));
        assert!(err.is_some_and(|e| e.kind() == ErrorKind::TransportUnavailable));

        assert!(protocol.bind(SimulatedChip::new(MRZ)).is_none());
        assert!(protocol.perform_handshake(MRZ).is_ok());
        assert!(protocol.unbind().is_some_and(|chip| chip.channel.is_some()));
    }

    #[test]
    fn test_perform_handshake_retry_uses_fresh_randomness() -> Result<(), EmrtdError> {
        let mut chip = SimulatedChip::new(MRZ);
        chip.reject = true;
        chip.channel = Some(SecureChannel::new([0xEE; 16], [0xEE; 16], [0xEE; 8]));
        let mut protocol = BacProtocol::<_, Des3, MockRng>::new(chip);

        let result = protocol.perform_handshake(MRZ);
        assert!(result.is_err_and(|e| matches!(e, EmrtdError::AuthenticationRejectedError(0))));
        let chip = protocol.transport_mut().expect("transport is bound");
        assert!(chip.channel.is_none());
        chip.reject = false;

        protocol.perform_handshake(MRZ)?;
        let chip = protocol.transport().expect("transport is bound");
        assert!(chip.channel.is_some());
        assert_eq!(chip.clear_count, 2);
        assert_eq!(chip.received.len(), 2);

        let (first, second) = (&chip.received[0], &chip.received[1]);
        assert_eq!(first[8..16], second[8..16]);
        assert_ne!(first[..8], second[..8], "RND.IFD was reused");
        assert_ne!(first[16..], second[16..], "K.IFD was reused");
        Ok(())
    }

    #[test]
    fn test_perform_handshake_wrong_mrz() {
        let chip = SimulatedChip::new("L898902C<369080619406237");
        let mut protocol = BacProtocol::<_, Des3, MockRng>::new(chip);
        let result = protocol.perform_handshake(MRZ);
        // The simulated chip answers under its own keys, so the MAC does not verify
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::AuthenticationRejected));
        assert!(protocol.transport().is_some_and(|chip| chip.channel.is_none()));
    }

    #[test]
    fn test_perform_handshake_cancelled() {
        let mut chip = SimulatedChip::new(MRZ);
        chip.get_challenge_error = Some(EmrtdError::CancelledError);
        chip.channel = Some(SecureChannel::new([0xEE; 16], [0xEE; 16], [0xEE; 8]));
        let mut protocol = BacProtocol::from_parts(Some(chip), Des3, MockRng::default());

        let result = protocol.perform_handshake(MRZ);
        assert!(result.is_err_and(|e| e.kind() == ErrorKind::Cancelled));
        let chip = protocol.transport().expect("transport is bound");
        assert!(chip.channel.is_none());
        assert!(chip.received.is_empty());
    }
}
