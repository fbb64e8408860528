//! Session state handed over to Secure Messaging once BAC succeeds.

use core::fmt;
use tracing::error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::bac::SessionKeys;
use crate::crypto::KEY_LEN;
use crate::{bytes2hex, EmrtdError};

/// Keys and Send Sequence Counter of an established secure channel.
///
/// The key material is wiped when the channel is dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecureChannel {
    /// The session key used for encryption.
    ks_enc: [u8; KEY_LEN],
    /// The session key used for MAC generation.
    ks_mac: [u8; KEY_LEN],
    /// The Send Sequence Counter (SSC).
    ssc: [u8; 8],
}

impl SecureChannel {
    #[must_use]
    pub fn new(ks_enc: [u8; KEY_LEN], ks_mac: [u8; KEY_LEN], ssc: [u8; 8]) -> Self {
        Self {
            ks_enc,
            ks_mac,
            ssc,
        }
    }

    #[must_use]
    pub fn ks_enc(&self) -> &[u8; KEY_LEN] {
        &self.ks_enc
    }

    #[must_use]
    pub fn ks_mac(&self) -> &[u8; KEY_LEN] {
        &self.ks_mac
    }

    #[must_use]
    pub fn ssc(&self) -> &[u8; 8] {
        &self.ssc
    }

    /// Increments the Send Sequence Counter and returns the new value.
    ///
    /// Secure Messaging increments the SSC once before every protected command
    /// and once before verifying every protected response, see ICAO Doc 9303-11
    /// Section 9.8.4.
    ///
    /// # Errors
    ///
    /// * `EmrtdError::OverflowSscError` if the counter would wrap around.
    pub fn increment_ssc(&mut self) -> Result<[u8; 8], EmrtdError> {
        let Some(incremented) = u64::from_be_bytes(self.ssc).checked_add(1) else {
            error!("SSC is at its maximum value and can not be incremented");
            return Err(EmrtdError::OverflowSscError());
        };
        self.ssc = incremented.to_be_bytes();
        Ok(self.ssc)
    }
}

impl From<&SessionKeys> for SecureChannel {
    fn from(keys: &SessionKeys) -> Self {
        Self::new(*keys.ks_enc(), *keys.ks_mac(), *keys.ssc())
    }
}

impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("ssc", &bytes2hex(&self.ssc))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_increment_ssc() -> Result<(), EmrtdError> {
        // Example taken from https://www.icao.int/publications/Documents/9303_p11_cons_en.pdf Appendix D.4
        let mut channel = SecureChannel::new(
            hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"),
            hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"),
            hex!("887022120C06C226"),
        );
        assert_eq!(channel.increment_ssc()?, hex!("887022120C06C227"));
        assert_eq!(channel.increment_ssc()?, hex!("887022120C06C228"));
        assert_eq!(channel.ssc(), &hex!("887022120C06C228"));

        let mut channel = SecureChannel::new([0; 16], [0; 16], hex!("00000000FFFFFFFF"));
        assert_eq!(channel.increment_ssc()?, hex!("0000000100000000"));

        Ok(())
    }

    #[test]
    fn test_increment_ssc_overflow() {
        let mut channel = SecureChannel::new([0; 16], [0; 16], [0xFF; 8]);
        let result = channel.increment_ssc();
        assert!(result.is_err_and(|e| matches!(e, EmrtdError::OverflowSscError())));
        assert_eq!(channel.ssc(), &[0xFF; 8]);
    }

    #[test]
    fn test_debug_does_not_print_keys() {
        let channel = SecureChannel::new([0xAB; 16], [0xCD; 16], hex!("0102030405060708"));
        let debug = format!("{channel:?}");
        assert!(debug.contains("0102030405060708"));
        assert!(!debug.contains("ABAB"));
        assert!(!debug.contains("CDCD"));
    }
}
