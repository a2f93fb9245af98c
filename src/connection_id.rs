use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::anyhow;
use bytes::{Buf, BufMut};
use tracing::debug;

use crate::error::InvalidConnectionId;
use crate::util::buf_ext::{BufExt, BufMutExt};

/// Identifies a logical client session. It survives physical reconnects: a client that lost its
///  connection reconnects with the id it was assigned, and the server uses it to find the
///  session's existing stack.
///
/// The server id is a 32 character hex token minted by the server instance that assigned the id,
///  so ids from a previous server incarnation are recognizable as stale. The optional session tag
///  identifies the client process in the legacy text form `<sessionTag>.<channelID>.<serverID>`; it
///  is informational and does not take part in equality.
///
/// Server ids are case-insensitive: they are kept as they were received, but compared and hashed
///  without regard to case.
#[derive(Clone)]
pub struct ConnectionId {
    channel_id: i64,
    server_id: String,
    session_tag: Option<String>,
}

pub const SERVER_ID_LEN: usize = 32;

impl ConnectionId {
    /// The id a client proposes before it was assigned one
    pub const NULL_ID: ConnectionId = ConnectionId {
        channel_id: -1,
        server_id: String::new(),
        session_tag: None,
    };

    pub fn new(channel_id: i64, server_id: &str) -> Result<ConnectionId, InvalidConnectionId> {
        Self::with_session_tag(channel_id, server_id, None)
    }

    pub fn with_session_tag(channel_id: i64, server_id: &str, session_tag: Option<&str>) -> Result<ConnectionId, InvalidConnectionId> {
        let input = || format!("{}.{}", server_id, channel_id);

        if channel_id < 0 {
            return Err(InvalidConnectionId { input: input(), reason: "channel id must not be negative" });
        }
        if let Err(reason) = check_server_id(server_id) {
            return Err(InvalidConnectionId { input: input(), reason });
        }
        if let Some(session_tag) = session_tag {
            if let Err(reason) = check_session_tag(session_tag) {
                return Err(InvalidConnectionId { input: input(), reason });
            }
        }

        Ok(ConnectionId {
            channel_id,
            server_id: server_id.to_string(),
            session_tag: session_tag.map(|s| s.to_string()),
        })
    }

    /// Accepts the canonical form `<serverID>.<channelID>` and the legacy form
    ///  `<sessionTag>.<channelID>.<serverID>`. Any malformed input results in [InvalidConnectionId].
    pub fn parse(s: &str) -> Result<ConnectionId, InvalidConnectionId> {
        let err = |reason: &'static str| InvalidConnectionId { input: s.to_string(), reason };

        if s.is_empty() {
            return Err(err("empty string"));
        }

        let parts = s.split('.').collect::<Vec<_>>();
        let (session_tag, channel_id, server_id) = match parts.as_slice() {
            [server_id, channel_id] => (None, *channel_id, *server_id),
            [session_tag, channel_id, server_id] => (Some(*session_tag), *channel_id, *server_id),
            [_] => return Err(err("missing separator")),
            _ => return Err(err("too many segments")),
        };

        if let Some(session_tag) = session_tag {
            check_session_tag(session_tag).map_err(err)?;
        }
        check_server_id(server_id).map_err(err)?;

        if channel_id.is_empty() || !channel_id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err("channel id is not a non-negative decimal number"));
        }
        let channel_id = channel_id.parse::<i64>()
            .map_err(|_| err("channel id out of range"))?;

        Ok(ConnectionId {
            channel_id,
            server_id: server_id.to_string(),
            session_tag: session_tag.map(|s| s.to_string()),
        })
    }

    pub fn is_null(&self) -> bool {
        self.channel_id < 0
    }

    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn session_tag(&self) -> Option<&str> {
        self.session_tag.as_deref()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.channel_id);
        buf.put_string(&self.server_id);
        buf.put_string(self.session_tag.as_deref().unwrap_or(""));
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionId> {
        let channel_id = buf.try_get_i64()?;
        let server_id = buf.try_get_string()?;
        let session_tag = buf.try_get_string()?;
        let session_tag = if session_tag.is_empty() { None } else { Some(session_tag) };

        if channel_id == -1 && server_id.is_empty() {
            return Ok(ConnectionId {
                session_tag,
                ..Self::NULL_ID
            });
        }

        ConnectionId::with_session_tag(channel_id, &server_id, session_tag.as_deref())
            .map_err(|e| anyhow!("{}", e))
    }
}

fn check_server_id(server_id: &str) -> Result<(), &'static str> {
    if server_id.len() != SERVER_ID_LEN {
        return Err("server id must have exactly 32 characters");
    }
    if !server_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err("server id must consist of hex digits");
    }
    Ok(())
}

fn check_session_tag(session_tag: &str) -> Result<(), &'static str> {
    if session_tag.is_empty() {
        return Err("empty session tag");
    }
    if !session_tag.bytes().all(|b| b.is_ascii_graphic()) {
        return Err("session tag contains invalid characters");
    }
    // the separator of the text form
    if session_tag.contains('.') {
        return Err("session tag contains '.'");
    }
    Ok(())
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id == other.channel_id
            && self.server_id.eq_ignore_ascii_case(&other.server_id)
    }
}
impl Eq for ConnectionId {}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.channel_id.hash(state);
        for b in self.server_id.bytes() {
            b.to_ascii_lowercase().hash(state);
        }
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            return write!(f, "NULL-ID");
        }
        match &self.session_tag {
            Some(session_tag) => write!(f, "{}.{}.{}", session_tag, self.channel_id, self.server_id),
            None => write!(f, "{}.{}", self.server_id, self.channel_id),
        }
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self)
    }
}

impl FromStr for ConnectionId {
    type Err = InvalidConnectionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConnectionId::parse(s)
    }
}


/// Server side source of connection ids. Channel ids are assigned from a monotonic counter, and
///  all ids carry this server instance's id.
pub struct ConnectionIdFactory {
    server_id: String,
    next_channel_id: AtomicI64,
}

impl ConnectionIdFactory {
    /// a fresh server instance with a random server id
    pub fn new() -> ConnectionIdFactory {
        ConnectionIdFactory {
            server_id: format!("{:032x}", rand::random::<u128>()),
            next_channel_id: AtomicI64::new(0),
        }
    }

    /// Continue with state from a previous server incarnation, e.g. to accept reconnects from
    ///  clients connected to that incarnation
    pub fn with_state(server_id: &str, next_channel_id: i64) -> Result<ConnectionIdFactory, InvalidConnectionId> {
        // validates both parts
        let _ = ConnectionId::new(next_channel_id, server_id)?;

        Ok(ConnectionIdFactory {
            server_id: server_id.to_string(),
            next_channel_id: AtomicI64::new(next_channel_id),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn next_channel_id(&self) -> i64 {
        self.next_channel_id.load(Ordering::Acquire)
    }

    pub fn next_connection_id(&self, session_tag: Option<&str>) -> ConnectionId {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::AcqRel);
        let result = ConnectionId {
            channel_id,
            server_id: self.server_id.clone(),
            session_tag: session_tag.map(|s| s.to_string()),
        };
        debug!("assigned new connection id {}", result);
        result
    }

    /// true if the id was minted by this server instance (or the instance whose state it
    ///  continues)
    pub fn is_own(&self, connection_id: &ConnectionId) -> bool {
        connection_id.server_id.eq_ignore_ascii_case(&self.server_id)
    }
}

impl Default for ConnectionIdFactory {
    fn default() -> Self {
        Self::new()
    }
}
