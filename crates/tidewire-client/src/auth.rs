//! The authentication capability seam.
//!
//! Concrete mechanisms (NTLM, Kerberos, Azure AD tokens) live outside the
//! core; the session consumes them through this trait. SSPI-style
//! providers embed their initial packet in LOGIN7 and answer challenges;
//! token-based providers signal through the pre-login FEDAUTHREQUIRED
//! option and send their token in a FEDAUTHTOKEN packet after LOGIN.

use bytes::Bytes;

/// An authentication mechanism consumed during login.
pub trait AuthProvider: Send {
    /// The initial token embedded in LOGIN7 (the SSPI blob), or the
    /// federated token for [`AuthProvider::fed_auth`] providers.
    fn create_packet(&mut self) -> Bytes;

    /// Answer a server challenge; `None` ends the exchange.
    fn handle_next(&mut self, challenge: Bytes) -> Option<Bytes>;

    /// True for token-based (federated) providers: the token travels in a
    /// FEDAUTHTOKEN packet rather than the LOGIN7 SSPI slot.
    fn fed_auth(&self) -> bool {
        false
    }
}
