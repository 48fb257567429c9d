//! Admin protocol: login, session authentication and password hashing.

use std::time::{Duration, Instant};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use bytes::{BufMut, BytesMut};

use aerospike_core::protocol::{
    AdminCommand, AdminField, Frame, ProtoHeader, ADMIN_HEADER_REMAINING, AS_ADMIN_MESSAGE_TYPE,
};
use aerospike_core::{Error, Result, ResultCode};

use crate::config::{AuthMode, ClientPolicy};
use crate::connection::Connection;

/// Fixed salt the server expects password hashes to be computed with.
pub const BCRYPT_SALT: &str = "$2a$10$7EqJtq98hPqEX7fNZaFWoO";

const BCRYPT_COST: u32 = 10;

/// Seconds shaved off the server-reported TTL so sessions are renewed early.
const SESSION_TTL_MARGIN: u32 = 60;

const BCRYPT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::BCRYPT,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireNone),
);

/// Hashes a password the way the server stores it.
pub fn hash_password(password: &str) -> Result<String> {
    let encoded_salt = &BCRYPT_SALT[7..];
    let decoded = BCRYPT_BASE64
        .decode(encoded_salt)
        .map_err(|e| Error::Authentication(format!("invalid bcrypt salt: {e}")))?;
    let salt: [u8; 16] = decoded
        .get(..16)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::Authentication("bcrypt salt must decode to 16 bytes".into()))?;

    let parts = bcrypt::hash_with_salt(password, BCRYPT_COST, salt)
        .map_err(|e| Error::Authentication(format!("failed to hash password: {e}")))?;
    Ok(parts.format_for_version(bcrypt::Version::TwoA))
}

/// Credentials presented when opening connections.
#[derive(Clone)]
pub struct Credentials {
    user: String,
    hashed_password: String,
    clear_password: Option<String>,
    mode: AuthMode,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Builds credentials from a policy, or `None` when no login is needed.
    pub fn from_policy(policy: &ClientPolicy) -> Result<Option<Self>> {
        if !policy.requires_authentication() {
            return Ok(None);
        }
        let user = policy.user().unwrap_or_default().to_string();
        let password = policy.password().unwrap_or_default();
        Ok(Some(Self::new(user, password, policy.auth_mode())?))
    }

    /// Creates credentials, hashing the password.
    pub fn new(user: impl Into<String>, password: &str, mode: AuthMode) -> Result<Self> {
        Ok(Self {
            user: user.into(),
            hashed_password: hash_password(password)?,
            clear_password: (mode == AuthMode::External).then(|| password.to_string()),
            mode,
        })
    }

    /// Returns the user name.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Returns the bcrypt hash sent to the server.
    pub fn hashed_password(&self) -> &str {
        &self.hashed_password
    }
}

/// Session token returned by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Opaque token bytes.
    pub token: Vec<u8>,
    /// When the token must be renewed; `None` never expires.
    pub expiration: Option<Instant>,
}

impl Session {
    /// Returns true when the session needs a fresh login.
    pub fn is_expired(&self) -> bool {
        self.expiration.is_some_and(|at| Instant::now() >= at)
    }
}

struct AdminRequest {
    buf: BytesMut,
    field_count: u8,
}

impl AdminRequest {
    fn new(command: AdminCommand) -> Self {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u64(0);
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_u8(command as u8);
        buf.put_u8(0);
        buf.put_bytes(0, ADMIN_HEADER_REMAINING - 4);
        Self { buf, field_count: 0 }
    }

    fn field(mut self, id: AdminField, data: &[u8]) -> Self {
        self.buf.put_u32(data.len() as u32 + 1);
        self.buf.put_u8(id as u8);
        self.buf.put_slice(data);
        self.field_count += 1;
        self
    }

    fn finish(mut self) -> BytesMut {
        let size = self.buf.len() - 8;
        let header = ProtoHeader::new(AS_ADMIN_MESSAGE_TYPE, size).to_u64();
        self.buf[..8].copy_from_slice(&header.to_be_bytes());
        self.buf[11] = self.field_count;
        self.buf
    }
}

/// Builds a LOGIN request.
pub fn login_request(credentials: &Credentials) -> BytesMut {
    let request = AdminRequest::new(AdminCommand::Login);
    match credentials.mode {
        AuthMode::Pki => request.finish(),
        AuthMode::Internal => request
            .field(AdminField::User, credentials.user.as_bytes())
            .field(AdminField::Credential, credentials.hashed_password.as_bytes())
            .finish(),
        AuthMode::External => {
            let clear = credentials.clear_password.as_deref().unwrap_or_default();
            request
                .field(AdminField::User, credentials.user.as_bytes())
                .field(AdminField::Credential, credentials.hashed_password.as_bytes())
                .field(AdminField::ClearPassword, clear.as_bytes())
                .finish()
        }
    }
}

/// Builds an AUTHENTICATE request presenting a session token.
pub fn authenticate_request(user: &str, token: &[u8]) -> BytesMut {
    AdminRequest::new(AdminCommand::Authenticate)
        .field(AdminField::User, user.as_bytes())
        .field(AdminField::SessionToken, token)
        .finish()
}

/// Builds the legacy AUTHENTICATE request that carries the password hash.
fn legacy_authenticate_request(credentials: &Credentials) -> BytesMut {
    AdminRequest::new(AdminCommand::Authenticate)
        .field(AdminField::User, credentials.user.as_bytes())
        .field(AdminField::Credential, credentials.hashed_password.as_bytes())
        .finish()
}

fn admin_result(body: &[u8]) -> Result<ResultCode> {
    if body.len() < ADMIN_HEADER_REMAINING {
        return Err(Error::Protocol(format!(
            "admin reply of {} bytes is shorter than its header",
            body.len()
        )));
    }
    Ok(ResultCode::from_wire(body[1]))
}

/// Parses a LOGIN reply body (without the proto header).
///
/// Returns `Ok(None)` when security is disabled on the server.
pub fn parse_login_reply(body: &[u8]) -> Result<Option<Session>> {
    match admin_result(body)? {
        ResultCode::Ok => {}
        ResultCode::SecurityNotEnabled => return Ok(None),
        code => return Err(Error::server(code, "login failed")),
    }

    let field_count = body[3];
    let mut pos = ADMIN_HEADER_REMAINING;
    let mut token = None;
    let mut ttl = None;

    for _ in 0..field_count {
        if pos + 5 > body.len() {
            return Err(Error::Protocol("truncated login reply field".into()));
        }
        let len = u32::from_be_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]])
            as usize;
        let id = body[pos + 4];
        let start = pos + 5;
        let end = start + len.saturating_sub(1);
        if len == 0 || end > body.len() {
            return Err(Error::Protocol(format!("invalid login reply field length {len}")));
        }
        let data = &body[start..end];

        if id == AdminField::SessionToken as u8 {
            token = Some(data.to_vec());
        } else if id == AdminField::SessionTtl as u8 && data.len() == 4 {
            ttl = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
        }
        pos = end;
    }

    let token = token.ok_or_else(|| {
        Error::server(ResultCode::InvalidCredential, "login reply carried no session token")
    })?;

    let expiration = ttl.filter(|t| *t > 0).map(|ttl| {
        let secs = if ttl > SESSION_TTL_MARGIN {
            ttl - SESSION_TTL_MARGIN
        } else {
            ttl
        };
        Instant::now() + Duration::from_secs(u64::from(secs))
    });

    Ok(Some(Session { token, expiration }))
}

/// Logs in on a fresh connection.
///
/// Falls back to the legacy AUTHENTICATE exchange when the server does not
/// know the LOGIN command; in that case no session is returned.
pub async fn login(conn: &mut Connection, credentials: &Credentials) -> Result<Option<Session>> {
    let frame = exchange(conn, &login_request(credentials)).await?;

    if admin_result(&frame.body)? == ResultCode::InvalidCommand {
        tracing::debug!(user = %credentials.user, "server lacks LOGIN, using AUTHENTICATE");
        let reply = exchange(conn, &legacy_authenticate_request(credentials)).await?;
        return match admin_result(&reply.body)? {
            ResultCode::Ok | ResultCode::SecurityNotEnabled => Ok(None),
            code => Err(Error::server(code, "authentication failed")),
        };
    }

    parse_login_reply(&frame.body)
}

/// Presents a session token on a fresh connection.
pub async fn authenticate(conn: &mut Connection, user: &str, token: &[u8]) -> Result<()> {
    let frame = exchange(conn, &authenticate_request(user, token)).await?;
    match admin_result(&frame.body)? {
        ResultCode::Ok | ResultCode::SecurityNotEnabled => Ok(()),
        code => Err(Error::server(code, "authentication failed")),
    }
}

async fn exchange(conn: &mut Connection, request: &[u8]) -> Result<Frame> {
    conn.write(request).await?;
    let frame = conn.read_frame().await?;
    if frame.message_type != AS_ADMIN_MESSAGE_TYPE {
        return Err(Error::Protocol(format!(
            "expected admin reply, got message type {}",
            frame.message_type
        )));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::testing::{InfoServer, MockInfo};
    use crate::cluster::ClusterContext;

    fn reply(code: u8, fields: &[(AdminField, &[u8])]) -> Vec<u8> {
        let mut body = vec![0u8; ADMIN_HEADER_REMAINING];
        body[1] = code;
        body[3] = fields.len() as u8;
        for (id, data) in fields {
            body.extend_from_slice(&(data.len() as u32 + 1).to_be_bytes());
            body.push(*id as u8);
            body.extend_from_slice(data);
        }
        body
    }

    #[test]
    fn test_hash_password_uses_fixed_salt() {
        let hash = hash_password("secret").unwrap();
        assert!(hash.starts_with(BCRYPT_SALT));
        assert_eq!(hash.len(), 60);
        assert_eq!(hash, hash_password("secret").unwrap());
        assert_ne!(hash, hash_password("other").unwrap());
    }

    #[test]
    fn test_login_request_layout() {
        let credentials = Credentials::new("admin", "admin", AuthMode::Internal).unwrap();
        let request = login_request(&credentials);

        let header = ProtoHeader::parse(&request).unwrap();
        assert_eq!(header.message_type, AS_ADMIN_MESSAGE_TYPE);
        assert_eq!(header.size, request.len() - 8);
        assert_eq!(request[10], AdminCommand::Login as u8);
        assert_eq!(request[11], 2);

        let first = &request[24..];
        assert_eq!(&first[..4], &6u32.to_be_bytes());
        assert_eq!(first[4], AdminField::User as u8);
        assert_eq!(&first[5..10], b"admin");
    }

    #[test]
    fn test_external_login_sends_clear_password() {
        let credentials = Credentials::new("ldap", "pw", AuthMode::External).unwrap();
        let request = login_request(&credentials);
        assert_eq!(request[11], 3);
        assert!(request.ends_with(b"pw"));
    }

    #[test]
    fn test_parse_login_reply_with_ttl() {
        let body = reply(
            0,
            &[
                (AdminField::SessionToken, b"tok-123"),
                (AdminField::SessionTtl, &120u32.to_be_bytes()),
            ],
        );
        let session = parse_login_reply(&body).unwrap().unwrap();
        assert_eq!(session.token, b"tok-123");

        let remaining = session.expiration.unwrap() - Instant::now();
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(55));
        assert!(!session.is_expired());
    }

    #[test]
    fn test_parse_login_reply_security_disabled() {
        let body = reply(ResultCode::SecurityNotEnabled.value() as u8, &[]);
        assert!(parse_login_reply(&body).unwrap().is_none());
    }

    #[test]
    fn test_parse_login_reply_rejects_bad_user() {
        let body = reply(ResultCode::InvalidUser.value() as u8, &[]);
        let err = parse_login_reply(&body).unwrap_err();
        assert_eq!(err.result_code(), ResultCode::InvalidUser);
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("u", "hunter2", AuthMode::External).unwrap();
        let shown = format!("{credentials:?}");
        assert!(!shown.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_login_falls_back_to_authenticate() {
        let server = InfoServer::start(MockInfo {
            legacy_auth: true,
            ..MockInfo::named("A")
        })
        .await;
        let context = ClusterContext::new(ClientPolicy::default()).unwrap();
        let mut conn = context.connect(server.addr, &server.host()).await.unwrap();
        let credentials = Credentials::new("admin", "admin", AuthMode::Internal).unwrap();

        assert_eq!(login(&mut conn, &credentials).await.unwrap(), None);
        let info = server.info();
        assert_eq!(info.logins, 1);
        assert_eq!(info.authentications, 1);

        server.update(|info| info.legacy_auth = false);
        let session = login(&mut conn, &credentials).await.unwrap().unwrap();
        assert_eq!(session.token, b"token-2");
        assert!(session.expiration.is_some());
        assert_eq!(server.info().authentications, 1);
    }
}
