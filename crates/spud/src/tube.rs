//! A single logical bidirectional conversation multiplexed over the shared
//! UDP socket pair, identified by a [`TubeId`] and tracked through the state
//! machine in [`TubeState`].

use std::any::Any;
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::id::TubeId;
use crate::manager::ManagerHandle;
use crate::pktinfo::Pktinfo;
use crate::wire::cbor::Value;
use crate::wire::{Command, Header};

/// The tube's position in the handshake/teardown state machine.
///
/// ```text
/// START --(create)--> UNKNOWN
/// UNKNOWN --(open, initiator)--> OPENING --(ack received)--> RUNNING
/// UNKNOWN --(open received, responder)--> RUNNING
/// RUNNING --(close sent or received)--> UNKNOWN
/// OPENING --(close sent or received)--> UNKNOWN
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TubeState {
    Start,
    Unknown,
    Opening,
    Running,
    Resuming,
}

/// Who owns the state transition (affects whether the local side is an
/// initiator or a responder for handshake purposes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// A single tube: its identifier, current state, remote peer address, and
/// the owning manager's handle for actually putting bytes on the wire.
pub struct Tube {
    id: TubeId,
    state: TubeState,
    role: Role,
    peer_addr: Option<SocketAddr>,
    /// The local-interface ancillary data captured from the packet that
    /// created this tube (responder side) or never set (initiator side),
    /// reattached to every outbound send so replies leave the interface the
    /// peer actually targeted.
    local_pktinfo: Pktinfo,
    manager: Option<ManagerHandle>,
    /// Opaque slot for caller bookkeeping. Unused by the tube core itself,
    /// carried for API parity with the original's `tube_set_data`/
    /// `tube_get_data`.
    user_data: Option<Box<dyn Any + Send>>,
}

impl Tube {
    /// Create a new tube in the `UNKNOWN` state, matching `tube_create`.
    pub fn new(id: TubeId, role: Role) -> Self {
        Self {
            id,
            state: TubeState::Unknown,
            role,
            peer_addr: None,
            local_pktinfo: Pktinfo::Empty,
            manager: None,
            user_data: None,
        }
    }

    pub fn id(&self) -> TubeId {
        self.id
    }

    pub fn state(&self) -> TubeState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn set_state(&mut self, state: TubeState) {
        self.state = state;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Record the peer and local socket addresses this tube talks over,
    /// matching `tube_set_info`/`tube_set_local`.
    pub fn set_info(&mut self, peer_addr: SocketAddr) {
        self.peer_addr = Some(peer_addr);
    }

    /// Take ownership of a pktinfo duplicate captured from the packet that
    /// created this tube, matching `tube_set_local`. `Pktinfo` is `Copy`, so
    /// callers pass their own value directly rather than calling a separate
    /// `duplicate` step.
    pub fn set_local(&mut self, pktinfo: Pktinfo) {
        self.local_pktinfo = pktinfo;
    }

    pub fn local_pktinfo(&self) -> Pktinfo {
        self.local_pktinfo
    }

    pub fn set_manager(&mut self, manager: ManagerHandle) {
        self.manager = Some(manager);
    }

    pub fn manager(&self) -> Option<&ManagerHandle> {
        self.manager.as_ref()
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any + Send>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&(dyn Any + Send)> {
        self.user_data.as_deref()
    }

    fn manager_or_err(&self) -> Result<&ManagerHandle> {
        self.manager
            .as_ref()
            .ok_or_else(|| Error::invalid_state("tube has no manager attached"))
    }

    /// Send an arbitrary packet: used by the higher-level helpers below and
    /// available directly for callers building their own commands.
    pub fn send(&self, header: Header, payload: Option<Value>) -> Result<()> {
        let peer = self
            .peer_addr
            .ok_or_else(|| Error::invalid_state("tube has no peer address"))?;
        let pktinfo = self.local_pktinfo.is_full().then_some(self.local_pktinfo);
        self.manager_or_err()?
            .send_to(peer, &header, payload.as_ref(), pktinfo.as_ref())
    }

    /// Send a CBOR value as a DATA packet.
    pub fn send_cbor(&self, value: Value) -> Result<()> {
        let header = Header::new(self.id, Command::Data);
        self.send(header, Some(value))
    }

    /// Send raw bytes as a DATA packet. Empty input sends a header-only
    /// packet with no CBOR trailer at all, matching `tube_data`'s contract
    /// for a zero-length buffer.
    pub fn send_data(&self, bytes: &[u8]) -> Result<()> {
        let header = Header::new(self.id, Command::Data);
        if bytes.is_empty() {
            self.send(header, None)
        } else {
            self.send(header, Some(Value::bytes(bytes.to_vec())))
        }
    }

    /// Send an OPEN, transitioning this (initiator) tube into OPENING.
    pub fn open(&mut self) -> Result<()> {
        if self.state != TubeState::Unknown {
            return Err(Error::invalid_state("open is only valid from UNKNOWN"));
        }
        let header = Header::new(self.id, Command::Open);
        self.send(header, None)?;
        self.state = TubeState::Opening;
        Ok(())
    }

    /// Send an ACK, used by a responder completing a handshake.
    pub fn ack(&self) -> Result<()> {
        let header = Header::new(self.id, Command::Ack);
        self.send(header, None)
    }

    /// Send a path declaration, marking the PDEC flag and setting ADEC to
    /// `reflect` (the sender's request for the peer to echo its own path
    /// declaration back).
    pub fn send_pdec(&self, declaration: &PathDeclaration, reflect: bool) -> Result<()> {
        let mut header = Header::new(self.id, Command::Data);
        header.set_pdec(true);
        header.set_adec(reflect);
        self.send(header, Some(declaration.to_value()))
    }

    /// Send a CLOSE and transition this tube back to UNKNOWN. A repeated
    /// call on an already-UNKNOWN tube is a no-op, matching the manager's
    /// double-close idempotency for received CLOSEs.
    pub fn close(&mut self) -> Result<()> {
        if self.state == TubeState::Unknown {
            return Ok(());
        }
        let header = Header::new(self.id, Command::Close);
        self.send(header, None)?;
        self.state = TubeState::Unknown;
        Ok(())
    }
}

impl std::fmt::Debug for Tube {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tube")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("role", &self.role)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Well-known keys for the path declaration CBOR map (§6 external interface).
pub const PATH_KEY_IPADDR: &str = "ipaddr";
pub const PATH_KEY_TOKEN: &str = "token";
pub const PATH_KEY_URL: &str = "url";

/// A typed helper over the CBOR map used for path declarations: the three
/// mandatory keys (`ipaddr`, `token`, `url`) plus arbitrary optional extras,
/// matching `path_mandatory_keys_create`.
#[derive(Debug, Clone)]
pub struct PathDeclaration {
    pub ipaddr: String,
    pub token: Vec<u8>,
    pub url: String,
    pub extra: Vec<(String, Value)>,
}

impl PathDeclaration {
    pub fn new(ipaddr: impl Into<String>, token: Vec<u8>, url: impl Into<String>) -> Self {
        Self {
            ipaddr: ipaddr.into(),
            token,
            url: url.into(),
            extra: Vec::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.push((key.into(), value));
        self
    }

    pub fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::text(PATH_KEY_IPADDR), Value::text(self.ipaddr.clone())),
            (Value::text(PATH_KEY_TOKEN), Value::bytes(self.token.clone())),
            (Value::text(PATH_KEY_URL), Value::text(self.url.clone())),
        ];
        for (key, value) in &self.extra {
            entries.push((Value::text(key.clone()), value.clone()));
        }
        Value::Map(entries)
    }

    /// Parse a path declaration back out of a received CBOR map, failing if
    /// any mandatory key is missing or the wrong type.
    pub fn from_value(value: &Value) -> Result<Self> {
        let ipaddr = value
            .get(PATH_KEY_IPADDR)
            .and_then(Value::as_text)
            .ok_or_else(|| Error::bad_format("path declaration missing 'ipaddr'"))?
            .to_owned();
        let token = value
            .get(PATH_KEY_TOKEN)
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::bad_format("path declaration missing 'token'"))?
            .to_vec();
        let url = value
            .get(PATH_KEY_URL)
            .and_then(Value::as_text)
            .ok_or_else(|| Error::bad_format("path declaration missing 'url'"))?
            .to_owned();
        Ok(Self {
            ipaddr,
            token,
            url,
            extra: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_tube_starts_unknown() {
        let tube = Tube::new(TubeId::from_bytes([1; 8]), Role::Initiator);
        assert_eq!(tube.state(), TubeState::Unknown);
    }

    #[test]
    fn open_without_manager_errors() {
        let mut tube = Tube::new(TubeId::from_bytes([1; 8]), Role::Initiator);
        tube.set_info("127.0.0.1:9999".parse().unwrap());
        assert!(tube.open().is_err());
        // A failed open leaves the state machine untouched.
        assert_eq!(tube.state(), TubeState::Unknown);
    }

    #[test]
    fn close_on_unknown_tube_is_a_no_op() {
        let mut tube = Tube::new(TubeId::from_bytes([2; 8]), Role::Responder);
        assert_eq!(tube.state(), TubeState::Unknown);
        assert!(tube.close().is_ok());
        assert_eq!(tube.state(), TubeState::Unknown);
    }

    #[test]
    fn path_declaration_round_trips_through_cbor() {
        let decl = PathDeclaration::new("127.0.0.1", vec![1, 2, 3], "https://example.test/path");
        let value = decl.to_value();
        let parsed = PathDeclaration::from_value(&value).unwrap();
        assert_eq!(parsed.ipaddr, decl.ipaddr);
        assert_eq!(parsed.token, decl.token);
        assert_eq!(parsed.url, decl.url);
    }

    #[test]
    fn path_declaration_rejects_missing_mandatory_key() {
        let value = Value::Map(vec![(Value::text("ipaddr"), Value::text("127.0.0.1"))]);
        assert!(PathDeclaration::from_value(&value).is_err());
    }

    /// `send_pdec`'s `reflect` argument must land on the wire as ADEC,
    /// alongside the always-set PDEC bit.
    #[tokio::test]
    async fn send_pdec_sets_pdec_and_reflects_adec() {
        let manager = crate::manager::TubeManager::new(
            crate::manager::ManagerConfig::new().bind_v6(false).port(0),
        )
        .unwrap();

        let listener = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        let peer = listener.local_addr().unwrap();

        let mut tube = Tube::new(TubeId::from_bytes([7; 8]), Role::Initiator);
        tube.set_info(peer);
        tube.set_manager(manager.handle());

        let decl = PathDeclaration::new("127.0.0.1", vec![1, 2, 3], "https://example.test/path");
        tube.send_pdec(&decl, true).unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        let packet = crate::wire::parse(&buf[..n]).unwrap();
        assert!(packet.header.pdec);
        assert!(packet.header.adec);

        tube.send_pdec(&decl, false).unwrap();
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        let packet = crate::wire::parse(&buf[..n]).unwrap();
        assert!(packet.header.pdec);
        assert!(!packet.header.adec);
    }
}
