//! Reconnection tokens and the authority that issues and checks them.
//!
//! A token pins a session to one (client, server) pair and carries a
//! *generation*: 0 for the login token handed out by a login service,
//! +1 for every successful handshake after that. Once a generation has
//! been superseded it is *forbidden* for a while, so a replayed or leaked
//! older token cannot resume the session.
//!
//! # Wire layout
//!
//! ```text
//! offset  size  field
//! 0       8     client_id       (u64, big-endian)
//! 8       4     client_role     (i32 role code)
//! 12      8     server_id       (u64)
//! 20      4     server_role     (i32 role code)
//! 24      4     generation      (i32)
//! 28      4     created_at_sec  (i32, unix seconds)
//! ```
//!
//! The 32-byte record is XOR-ed with a repeating key before it leaves the
//! node. **This is obfuscation, not encryption.** Anyone holding one token
//! and its plaintext can recover the key. Do not rely on it as a security
//! boundary; put the transport behind TLS and authenticate logins
//! elsewhere.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use linkforge_protocol::{PeerId, RejectReason, Role};

use crate::TokenError;

/// Size of a token record before and after XOR.
pub const TOKEN_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// An immutable reconnection credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub client_id: PeerId,
    pub client_role: Role,
    pub server_id: PeerId,
    pub server_role: Role,
    pub generation: i32,
    pub created_at_sec: i32,
}

impl Token {
    /// A fail token can never validate: it carries an `Invalid` role or a
    /// negative generation.
    pub fn is_fail(&self) -> bool {
        self.client_role == Role::Invalid
            || self.server_role == Role::Invalid
            || self.generation < 0
    }

    /// Packs the token into its fixed big-endian record.
    pub fn to_bytes(&self) -> [u8; TOKEN_LEN] {
        let mut out = [0u8; TOKEN_LEN];
        out[0..8].copy_from_slice(&self.client_id.0.to_be_bytes());
        out[8..12].copy_from_slice(&self.client_role.code().to_be_bytes());
        out[12..20].copy_from_slice(&self.server_id.0.to_be_bytes());
        out[20..24].copy_from_slice(&self.server_role.code().to_be_bytes());
        out[24..28].copy_from_slice(&self.generation.to_be_bytes());
        out[28..32].copy_from_slice(&self.created_at_sec.to_be_bytes());
        out
    }

    /// Unpacks a record produced by [`Token::to_bytes`].
    ///
    /// # Errors
    /// [`TokenError::BadLength`] for anything but 32 bytes,
    /// [`TokenError::UnknownRole`] for an unmapped role code.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != TOKEN_LEN {
            return Err(TokenError::BadLength {
                expected: TOKEN_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            client_id: PeerId(read_u64(bytes, 0)),
            client_role: read_role(bytes, 8)?,
            server_id: PeerId(read_u64(bytes, 12)),
            server_role: read_role(bytes, 20)?,
            generation: read_i32(bytes, 24),
            created_at_sec: read_i32(bytes, 28),
        })
    }
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    i32::from_be_bytes(buf)
}

fn read_role(bytes: &[u8], at: usize) -> Result<Role, TokenError> {
    let code = read_i32(bytes, at);
    Role::from_code(code).ok_or(TokenError::UnknownRole(code))
}

// ---------------------------------------------------------------------------
// TokenCipher
// ---------------------------------------------------------------------------

/// Repeating-key XOR over token records.
///
/// Exposed on its own so a login service that shares the key can mint
/// encrypted login tokens without running a session manager.
#[derive(Debug, Clone)]
pub struct TokenCipher {
    key: Vec<u8>,
}

impl TokenCipher {
    /// # Errors
    /// [`TokenError::EmptyKey`] if `key` is empty.
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, TokenError> {
        let key = key.into();
        if key.is_empty() {
            return Err(TokenError::EmptyKey);
        }
        Ok(Self { key })
    }

    /// XORs `data` with the key. Applying it twice is the identity.
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }

    pub fn encrypt(&self, token: &Token) -> Vec<u8> {
        self.apply(&token.to_bytes())
    }

    /// # Errors
    /// Any [`TokenError`] from [`Token::from_bytes`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Token, TokenError> {
        Token::from_bytes(&self.apply(data))
    }
}

// ---------------------------------------------------------------------------
// TokenClock
// ---------------------------------------------------------------------------

/// Maps the monotonic `Instant`s the state machines run on to the unix
/// seconds stored in tokens.
#[derive(Debug, Clone, Copy)]
pub struct TokenClock {
    anchor: Instant,
    anchor_unix_secs: i64,
}

impl TokenClock {
    /// Anchors `now` to the current system time.
    pub fn system(now: Instant) -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Self::fixed(now, unix)
    }

    /// Anchors `anchor` to an explicit unix time. Used by tests.
    pub fn fixed(anchor: Instant, unix_secs: i64) -> Self {
        Self {
            anchor,
            anchor_unix_secs: unix_secs,
        }
    }

    /// Unix seconds at `now`. Instants before the anchor map to the anchor.
    pub fn seconds_at(&self, now: Instant) -> i32 {
        let secs = self.anchor_unix_secs + now.saturating_duration_since(self.anchor).as_secs() as i64;
        i32::try_from(secs).unwrap_or(i32::MAX)
    }
}

// ---------------------------------------------------------------------------
// TokenAuthority
// ---------------------------------------------------------------------------

/// Forbidden generations for one client.
#[derive(Debug, Clone, Copy)]
struct Forbidden {
    /// Every token created before this second belongs to an older login.
    line_started_sec: i32,
    /// Generations strictly below this are forbidden...
    below_generation: i32,
    /// ...if they were created at or before this second.
    at_sec: i32,
    expires_at: Instant,
}

/// Issues, validates and forbids tokens for one local identity.
#[derive(Debug)]
pub struct TokenAuthority {
    cipher: TokenCipher,
    clock: TokenClock,
    login_ttl_secs: i64,
    window: Duration,
    forbidden: HashMap<PeerId, Forbidden>,
}

impl TokenAuthority {
    pub fn new(
        cipher: TokenCipher,
        clock: TokenClock,
        login_ttl: Duration,
        forbidden_window: Duration,
    ) -> Self {
        Self {
            cipher,
            clock,
            login_ttl_secs: login_ttl.as_secs() as i64,
            window: forbidden_window,
            forbidden: HashMap::new(),
        }
    }

    pub fn cipher(&self) -> &TokenCipher {
        &self.cipher
    }

    /// A generation-0 token. Normally minted by a login service.
    pub fn issue_login_token(
        &self,
        client_id: PeerId,
        client_role: Role,
        server_id: PeerId,
        server_role: Role,
        now: Instant,
    ) -> Token {
        Token {
            client_id,
            client_role,
            server_id,
            server_role,
            generation: 0,
            created_at_sec: self.clock.seconds_at(now),
        }
    }

    /// The successor of `previous`: same identities, generation + 1.
    pub fn issue_next_token(&self, previous: &Token, now: Instant) -> Token {
        Token {
            generation: previous.generation.saturating_add(1),
            created_at_sec: self.clock.seconds_at(now),
            ..*previous
        }
    }

    /// A token that fails validation with `TOKEN_INVALID`. Handing it to a
    /// peer tells it to stop reconnecting.
    pub fn issue_fail_token(&self, client_id: PeerId, server_id: PeerId, now: Instant) -> Token {
        Token {
            client_id,
            client_role: Role::Invalid,
            server_id,
            server_role: Role::Invalid,
            generation: -1,
            created_at_sec: self.clock.seconds_at(now),
        }
    }

    /// Checks everything about `token` that doesn't depend on session state.
    ///
    /// Order: fail token, server identity, client identity and server role,
    /// forbidden window, login-token age (generation 0 only).
    pub fn validate(
        &self,
        token: &Token,
        expected_client: PeerId,
        expected_server: PeerId,
        expected_server_role: Role,
        now: Instant,
    ) -> Result<(), RejectReason> {
        if token.is_fail() {
            return Err(RejectReason::TokenInvalid);
        }
        if token.server_id != expected_server {
            return Err(RejectReason::ServerNotExist);
        }
        if token.client_id != expected_client || token.server_role != expected_server_role {
            return Err(RejectReason::TokenNotMatchRequest);
        }
        if self.is_forbidden(token, now) {
            return Err(RejectReason::StaleToken);
        }
        if token.generation == 0 {
            let age = self.clock.seconds_at(now) as i64 - token.created_at_sec as i64;
            if age > self.login_ttl_secs {
                return Err(RejectReason::LoginTokenExpired);
            }
        }
        Ok(())
    }

    /// Forbids every generation below `below_generation` for `client`.
    ///
    /// Only tokens created at or before this moment are affected, so a
    /// fresh login token minted later still works.
    pub fn forbid(&mut self, client: PeerId, below_generation: i32, now: Instant) {
        let at_sec = self.clock.seconds_at(now);
        let expires_at = now + self.window;
        let entry = self.forbidden.entry(client).or_insert(Forbidden {
            line_started_sec: i32::MIN,
            below_generation,
            at_sec,
            expires_at,
        });
        entry.below_generation = entry.below_generation.max(below_generation);
        entry.at_sec = at_sec;
        entry.expires_at = expires_at;
        tracing::debug!(%client, below = entry.below_generation, "token generations forbidden");
    }

    pub fn is_forbidden(&self, token: &Token, now: Instant) -> bool {
        self.forbidden.get(&token.client_id).is_some_and(|f| {
            now < f.expires_at
                && (token.created_at_sec < f.line_started_sec
                    || (token.generation < f.below_generation && token.created_at_sec <= f.at_sec))
        })
    }

    /// Starts a new generation line for `login.client_id`.
    ///
    /// Every token created before `login` is forbidden for the window.
    /// Generations of the new line start out allowed.
    pub fn restart_line(&mut self, login: &Token, now: Instant) {
        self.forbidden.insert(
            login.client_id,
            Forbidden {
                line_started_sec: login.created_at_sec,
                below_generation: 0,
                at_sec: login.created_at_sec,
                expires_at: now + self.window,
            },
        );
        tracing::debug!(client = %login.client_id, "new token line started");
    }

    /// Drops expired forbidden entries. Returns how many were dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.forbidden.len();
        self.forbidden.retain(|_, f| now < f.expires_at);
        before - self.forbidden.len()
    }

    pub fn encrypt(&self, token: &Token) -> Vec<u8> {
        self.cipher.encrypt(token)
    }

    /// # Errors
    /// See [`TokenCipher::decrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Token, TokenError> {
        self.cipher.decrypt(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLIENT: PeerId = PeerId(1001);
    const SERVER: PeerId = PeerId(7);

    fn authority(start: Instant) -> TokenAuthority {
        TokenAuthority::new(
            TokenCipher::new(b"k3y".to_vec()).unwrap(),
            TokenClock::fixed(start, 1_700_000_000),
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
    }

    fn login(auth: &TokenAuthority, now: Instant) -> Token {
        auth.issue_login_token(CLIENT, Role::Client, SERVER, Role::Gateway, now)
    }

    fn check(auth: &TokenAuthority, token: &Token, now: Instant) -> Result<(), RejectReason> {
        auth.validate(token, CLIENT, SERVER, Role::Gateway, now)
    }

    // =====================================================================
    // Layout and cipher
    // =====================================================================

    #[test]
    fn test_to_bytes_is_big_endian_fixed_layout() {
        let token = Token {
            client_id: PeerId(0x0102_0304_0506_0708),
            client_role: Role::Client,
            server_id: PeerId(9),
            server_role: Role::Game,
            generation: 2,
            created_at_sec: 0x0A0B_0C0D,
        };
        let bytes = token.to_bytes();
        assert_eq!(&bytes[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
        assert_eq!(&bytes[12..20], &[0, 0, 0, 0, 0, 0, 0, 9]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 4]);
        assert_eq!(&bytes[24..28], &[0, 0, 0, 2]);
        assert_eq!(&bytes[28..32], &[0x0A, 0x0B, 0x0C, 0x0D]);
        assert_eq!(Token::from_bytes(&bytes).unwrap(), token);
    }

    #[test]
    fn test_from_bytes_wrong_length_returns_error() {
        let err = Token::from_bytes(&[0u8; 31]).unwrap_err();
        assert_eq!(
            err,
            TokenError::BadLength {
                expected: 32,
                actual: 31
            }
        );
    }

    #[test]
    fn test_from_bytes_unknown_role_returns_error() {
        let mut bytes = [0u8; TOKEN_LEN];
        bytes[8..12].copy_from_slice(&77i32.to_be_bytes());
        assert_eq!(Token::from_bytes(&bytes).unwrap_err(), TokenError::UnknownRole(77));
    }

    #[test]
    fn test_cipher_empty_key_rejected() {
        assert_eq!(TokenCipher::new(Vec::new()).unwrap_err(), TokenError::EmptyKey);
    }

    #[test]
    fn test_cipher_obfuscates_and_reverses() {
        let now = Instant::now();
        let auth = authority(now);
        let token = login(&auth, now);
        let encrypted = auth.encrypt(&token);
        assert_eq!(encrypted.len(), TOKEN_LEN);
        assert_ne!(encrypted, token.to_bytes().to_vec());
        assert_eq!(auth.decrypt(&encrypted).unwrap(), token);
    }

    #[test]
    fn test_decrypt_with_other_key_does_not_yield_same_token() {
        let now = Instant::now();
        let auth = authority(now);
        let token = login(&auth, now);
        let other = TokenCipher::new(b"different".to_vec()).unwrap();
        let result = other.decrypt(&auth.encrypt(&token));
        assert!(result.map(|t| t != token).unwrap_or(true));
    }

    // =====================================================================
    // Issuing
    // =====================================================================

    #[test]
    fn test_issue_login_token_generation_zero() {
        let now = Instant::now();
        let auth = authority(now);
        let token = login(&auth, now);
        assert_eq!(token.generation, 0);
        assert_eq!(token.created_at_sec, 1_700_000_000);
    }

    #[test]
    fn test_issue_next_token_increments_generation_keeps_identity() {
        let start = Instant::now();
        let auth = authority(start);
        let first = login(&auth, start);
        let next = auth.issue_next_token(&first, start + Duration::from_secs(5));
        assert_eq!(next.generation, 1);
        assert_eq!(next.client_id, CLIENT);
        assert_eq!(next.server_role, Role::Gateway);
        assert_eq!(next.created_at_sec, 1_700_000_005);
    }

    #[test]
    fn test_issue_fail_token_validates_as_token_invalid() {
        let now = Instant::now();
        let auth = authority(now);
        let fail = auth.issue_fail_token(CLIENT, SERVER, now);
        assert!(fail.is_fail());
        assert_eq!(check(&auth, &fail, now), Err(RejectReason::TokenInvalid));
    }

    // =====================================================================
    // Validation
    // =====================================================================

    #[test]
    fn test_validate_login_token_ok() {
        let now = Instant::now();
        let auth = authority(now);
        assert_eq!(check(&auth, &login(&auth, now), now), Ok(()));
    }

    #[test]
    fn test_validate_other_server_returns_server_not_exist() {
        let now = Instant::now();
        let auth = authority(now);
        let token = auth.issue_login_token(CLIENT, Role::Client, PeerId(8), Role::Gateway, now);
        assert_eq!(check(&auth, &token, now), Err(RejectReason::ServerNotExist));
    }

    #[test]
    fn test_validate_other_client_returns_not_match_request() {
        let now = Instant::now();
        let auth = authority(now);
        let token = auth.issue_login_token(PeerId(5), Role::Client, SERVER, Role::Gateway, now);
        assert_eq!(check(&auth, &token, now), Err(RejectReason::TokenNotMatchRequest));
    }

    #[test]
    fn test_validate_other_server_role_returns_not_match_request() {
        let now = Instant::now();
        let auth = authority(now);
        let token = auth.issue_login_token(CLIENT, Role::Client, SERVER, Role::Game, now);
        assert_eq!(check(&auth, &token, now), Err(RejectReason::TokenNotMatchRequest));
    }

    #[test]
    fn test_validate_old_login_token_returns_expired() {
        let start = Instant::now();
        let auth = authority(start);
        let token = login(&auth, start);
        let later = start + Duration::from_secs(61);
        assert_eq!(check(&auth, &token, later), Err(RejectReason::LoginTokenExpired));
    }

    #[test]
    fn test_validate_old_reconnect_token_never_expires_by_age() {
        let start = Instant::now();
        let auth = authority(start);
        let token = auth.issue_next_token(&login(&auth, start), start);
        let later = start + Duration::from_secs(3_600);
        assert_eq!(check(&auth, &token, later), Ok(()));
    }

    // =====================================================================
    // Forbidden window
    // =====================================================================

    #[test]
    fn test_forbid_rejects_lower_generations_as_stale() {
        let now = Instant::now();
        let mut auth = authority(now);
        let g0 = login(&auth, now);
        let g1 = auth.issue_next_token(&g0, now);
        auth.forbid(CLIENT, 1, now);
        assert_eq!(check(&auth, &g0, now), Err(RejectReason::StaleToken));
        assert_eq!(check(&auth, &g1, now), Ok(()));
    }

    #[test]
    fn test_forbid_never_lowers_existing_bar() {
        let now = Instant::now();
        let mut auth = authority(now);
        let g0 = login(&auth, now);
        let g3 = Token { generation: 3, ..g0 };
        auth.forbid(CLIENT, 5, now);
        auth.forbid(CLIENT, 2, now);
        assert_eq!(check(&auth, &g3, now), Err(RejectReason::StaleToken));
    }

    #[test]
    fn test_forbid_ignores_login_token_created_later() {
        let start = Instant::now();
        let mut auth = authority(start);
        auth.forbid(CLIENT, 4, start);
        let fresh = login(&auth, start + Duration::from_secs(2));
        assert_eq!(check(&auth, &fresh, start + Duration::from_secs(2)), Ok(()));
    }

    #[test]
    fn test_forbid_expires_after_window_and_sweep_drops_it() {
        let start = Instant::now();
        let mut auth = authority(start);
        let g1 = auth.issue_next_token(&login(&auth, start), start);
        auth.forbid(CLIENT, 2, start);

        let inside = start + Duration::from_secs(299);
        assert_eq!(check(&auth, &g1, inside), Err(RejectReason::StaleToken));
        assert_eq!(auth.sweep(inside), 0);

        let after = start + Duration::from_secs(300);
        assert_eq!(check(&auth, &g1, after), Ok(()));
        assert_eq!(auth.sweep(after), 1);
    }

    #[test]
    fn test_forbidden_sets_are_per_client() {
        let now = Instant::now();
        let mut auth = authority(now);
        auth.forbid(PeerId(999), 10, now);
        assert_eq!(check(&auth, &login(&auth, now), now), Ok(()));
    }

    #[test]
    fn test_restart_line_forbids_older_tokens_keeps_new_line() {
        let start = Instant::now();
        let mut auth = authority(start);
        let old_login = login(&auth, start);
        let old_next = auth.issue_next_token(&old_login, start);
        auth.forbid(CLIENT, 2, start);

        let later = start + Duration::from_secs(2);
        let new_login = login(&auth, later);
        auth.restart_line(&new_login, later);
        let new_next = auth.issue_next_token(&new_login, later);

        assert_eq!(check(&auth, &old_login, later), Err(RejectReason::StaleToken));
        assert_eq!(check(&auth, &old_next, later), Err(RejectReason::StaleToken));
        assert_eq!(check(&auth, &new_login, later), Ok(()));
        assert_eq!(check(&auth, &new_next, later), Ok(()));

        // Forbidding within the new line only reaches the new line.
        auth.forbid(CLIENT, 1, later);
        assert_eq!(check(&auth, &new_login, later), Err(RejectReason::StaleToken));
        assert_eq!(check(&auth, &new_next, later), Ok(()));
    }

    #[test]
    fn test_generation_four_rejected_while_six_is_current() {
        let now = Instant::now();
        let mut auth = authority(now);
        let mut token = login(&auth, now);
        let mut generations = vec![token];
        for _ in 0..6 {
            token = auth.issue_next_token(&token, now);
            generations.push(token);
        }
        // Generation 5 was validated and 6 issued.
        auth.forbid(CLIENT, 5, now);
        assert_eq!(check(&auth, &generations[4], now), Err(RejectReason::StaleToken));
        assert_eq!(check(&auth, &generations[6], now), Ok(()));
    }
}
