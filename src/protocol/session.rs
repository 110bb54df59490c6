//! Connection login state machine.
//!
//! A login runs across two TCP connections. The first sends a seed and
//! credentials, picks a shard and is handed a token. The client then
//! reconnects, sends that token as a bare seed, logs in again, picks a
//! character and waits for version negotiation before entering the world.
//!
//! ```text
//! Connected -> AwaitingCredentials -> AwaitingServerSelection -> AwaitingGameLogin
//! Connected -> SeedReceived -> CharacterSelect -> VersionPending -> InWorld
//! ```
//!
//! Any state can move to `Disposed`. `VersionPending` is left by the login
//! timer, which polls until a version packet has been seen.

use crate::error::{HandshakeFault, NetError};
use crate::protocol::auth::{AuthWindow, DEFAULT_CAPACITY};
use crate::protocol::dispatch::{DispatchContext, DispatchOutcome, PacketTable};
use crate::protocol::hooks::{AccountHooks, CityInfo, ServerInfo, WorldEntry};
use crate::protocol::incoming;
use crate::protocol::outgoing::{
    ClientVersionRequest, CurrentTime, LoginComplete, LoginConfirm, MapChange, MobileStatus,
    MobileUpdate, OutgoingPacket, Outbox, SeasonChange, SupportedFeatures,
};
use crate::protocol::version::ClientVersion;
use crate::runtime::buffer::CircularBuffer;
use crate::runtime::connection::ConnectionId;
use crate::runtime::timer::TimerId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Opcode of the seed packet that opens a login connection.
const SEED_OPCODE: u8 = 0xEF;

/// Login tunables shared by every connection.
#[derive(Debug, Clone)]
pub struct ShardSettings {
    pub auth_window: usize,
    pub version_poll: Duration,
    /// Supported-features flags.
    pub features: u32,
    /// Flags word of the character list.
    pub character_flags: u32,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            auth_window: DEFAULT_CAPACITY,
            version_poll: Duration::from_secs(1),
            features: 0x0001_92DB,
            character_flags: 0x0000_01A8,
        }
    }
}

/// Process-wide login state, created once at startup and shared by every
/// worker.
pub struct Shard {
    pub(crate) auth: AuthWindow,
    pub(crate) hooks: Box<dyn AccountHooks>,
    pub(crate) settings: ShardSettings,
    packets: PacketTable<Session>,
}

impl Shard {
    pub fn new(hooks: Box<dyn AccountHooks>, settings: ShardSettings) -> Self {
        Self {
            auth: AuthWindow::new(settings.auth_window),
            hooks,
            settings,
            packets: incoming::packet_table(),
        }
    }

    pub fn auth(&self) -> &AuthWindow {
        &self.auth
    }

    pub fn settings(&self) -> &ShardSettings {
        &self.settings
    }
}

/// Where a connection is in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoginPhase {
    /// Nothing received yet.
    #[default]
    Connected,
    /// Bare seed received; expecting a game login.
    SeedReceived,
    /// Seed packet received; expecting account credentials.
    AwaitingCredentials,
    /// Credentials accepted, shard list sent.
    AwaitingServerSelection,
    /// Token issued; the client reconnects with it.
    AwaitingGameLogin,
    /// Game login accepted, character list sent.
    CharacterSelect,
    /// Character chosen; waiting for the client version.
    VersionPending,
    InWorld,
    Disposed,
}

/// Login timer bookkeeping. The session asks for a timer; the runtime arms
/// one and records its id so it can be cancelled on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginTimer {
    Requested,
    Armed(TimerId),
}

/// Result of one login timer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPoll {
    /// Version still unknown; keep polling.
    Pending,
    /// The hand-off was sent. Stop the timer.
    Entered,
    /// The connection is gone or no longer waiting. Stop the timer.
    Abandoned,
}

/// Handshake state of one connection.
#[derive(Debug, Default)]
pub struct ConnectionState {
    pub phase: LoginPhase,
    pub seed: Option<u32>,
    pub version: Option<ClientVersion>,
    /// Token issued to this connection by a server selection.
    pub auth_token: Option<u32>,
    /// Set by the first account or game login, cleared by server selection.
    pub sent_first_packet: bool,
    /// Hold back everything but version packets.
    pub block_incoming: bool,
    pub login_timer: Option<LoginTimer>,
    /// Bare seed matched a live token: this is the second connection.
    pub game_connection: bool,
    pub username: Option<String>,
    pub servers: Vec<ServerInfo>,
    pub characters: Vec<String>,
    /// Starting cities offered with the character list.
    pub cities: Vec<CityInfo>,
    /// Flags from the last create or play packet.
    pub client_flags: i32,
    pub world_entry: Option<WorldEntry>,
}

/// A connection's handshake state plus its outgoing queue.
pub struct Session {
    id: ConnectionId,
    pub(crate) state: ConnectionState,
    pub(crate) outbox: Outbox,
    shard: Arc<Shard>,
}

impl Session {
    pub fn new(id: ConnectionId, shard: Arc<Shard>, send: CircularBuffer) -> Self {
        Self {
            id,
            state: ConnectionState::default(),
            outbox: Outbox::new(send),
            shard,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Give up the outbox, e.g. to return its buffer to a pool.
    pub fn into_outbox(self) -> Outbox {
        self.outbox
    }

    pub fn is_disposed(&self) -> bool {
        self.state.phase == LoginPhase::Disposed
    }

    pub(crate) fn shard(&self) -> Arc<Shard> {
        Arc::clone(&self.shard)
    }

    pub(crate) fn send(&mut self, packet: &dyn OutgoingPacket) -> Result<(), NetError> {
        self.outbox.send(packet)
    }

    /// Stop processing this connection. Queued packets may still be flushed.
    pub fn dispose(&mut self) {
        if !self.is_disposed() {
            debug!(conn_id = %self.id, phase = ?self.state.phase, "disposing connection");
        }
        self.state.phase = LoginPhase::Disposed;
        self.state.block_incoming = false;
    }

    /// Dispose and hand back the armed login timer, if any, for cancelling.
    pub fn close(&mut self) -> Option<TimerId> {
        if self.state.phase == LoginPhase::InWorld {
            if let Some(entry) = &self.state.world_entry {
                let username = self.state.username.as_deref().unwrap_or_default();
                self.shard.hooks.left_world(username, entry);
            }
        }
        self.dispose();
        match self.state.login_timer.take() {
            Some(LoginTimer::Armed(id)) => Some(id),
            _ => None,
        }
    }

    /// Fail unless the connection is in one of `allowed`.
    pub(crate) fn require_phase(&self, allowed: &[LoginPhase]) -> Result<(), NetError> {
        if allowed.contains(&self.state.phase) {
            Ok(())
        } else {
            Err(HandshakeFault::OutOfOrder.into())
        }
    }

    pub(crate) fn set_phase(&mut self, phase: LoginPhase) {
        trace!(conn_id = %self.id, from = ?self.state.phase, to = ?phase, "login phase");
        self.state.phase = phase;
    }

    /// Mark the first login packet as seen. A connection may send it once.
    pub(crate) fn claim_first_packet(&mut self) -> Result<(), NetError> {
        if self.state.sent_first_packet {
            return Err(HandshakeFault::DuplicateFirstPacket.into());
        }
        self.state.sent_first_packet = true;
        Ok(())
    }

    /// Handle every complete frame in `recv`, consuming what was handled.
    ///
    /// Returns once the buffer is empty, the next frame is incomplete or
    /// held back, or the session was disposed. Any error ends the connection.
    pub fn pump(&mut self, recv: &mut CircularBuffer) -> Result<(), NetError> {
        let shard = Arc::clone(&self.shard);

        loop {
            if self.is_disposed() || recv.is_empty() {
                return Ok(());
            }

            if self.state.phase == LoginPhase::Connected {
                let reader = recv.reader();
                if reader.peek_at::<u8>(0)? != SEED_OPCODE {
                    if reader.remaining() < 4 {
                        return Ok(());
                    }
                    let seed = reader.peek_at::<u32>(0)?;
                    recv.consume(4);
                    self.receive_raw_seed(seed)?;
                    continue;
                }
            }

            let mut reader = recv.reader();
            match shard.packets.dispatch(self, &mut reader)? {
                DispatchOutcome::NeedData => {
                    if recv.is_full() {
                        return Err(NetError::FrameTooLarge);
                    }
                    return Ok(());
                }
                DispatchOutcome::Blocked { opcode } => {
                    trace!(conn_id = %self.id, opcode, "incoming packets blocked");
                    return Ok(());
                }
                DispatchOutcome::Handled { consumed, .. } | DispatchOutcome::Dropped { consumed, .. } => {
                    recv.consume(consumed);
                }
            }
        }
    }

    /// A connection that does not open with the seed packet sends its seed
    /// as four bare bytes. On the game connection that seed is the token.
    fn receive_raw_seed(&mut self, seed: u32) -> Result<(), NetError> {
        if seed == 0 {
            return Err(HandshakeFault::ZeroSeed.into());
        }
        self.state.seed = Some(seed);
        self.state.game_connection = self.shard.auth.contains(seed);
        debug!(conn_id = %self.id, seed, game = self.state.game_connection, "raw seed");
        self.set_phase(LoginPhase::SeedReceived);
        Ok(())
    }

    /// Ask the client for its version and wait for it before entering the
    /// world with `entry`.
    pub(crate) fn begin_world_entry(&mut self, entry: WorldEntry) -> Result<(), NetError> {
        self.send(&ClientVersionRequest)?;
        self.state.block_incoming = true;
        self.state.world_entry = Some(entry);
        self.state.login_timer = Some(LoginTimer::Requested);
        self.set_phase(LoginPhase::VersionPending);
        Ok(())
    }

    /// True once, right after a handler asked for the login timer.
    pub fn login_timer_requested(&self) -> bool {
        self.state.login_timer == Some(LoginTimer::Requested)
    }

    pub fn arm_login_timer(&mut self, id: TimerId) {
        self.state.login_timer = Some(LoginTimer::Armed(id));
    }

    /// One login timer tick.
    pub fn poll_login(&mut self) -> Result<LoginPoll, NetError> {
        if self.state.phase != LoginPhase::VersionPending {
            self.state.login_timer = None;
            return Ok(LoginPoll::Abandoned);
        }
        if self.state.version.is_none() {
            return Ok(LoginPoll::Pending);
        }
        let Some(entry) = self.state.world_entry.take() else {
            self.state.login_timer = None;
            return Ok(LoginPoll::Abandoned);
        };

        self.state.block_incoming = false;
        self.state.login_timer = None;
        self.enter_world(&entry)?;
        self.set_phase(LoginPhase::InWorld);
        let username = self.state.username.as_deref().unwrap_or_default();
        self.shard.hooks.entered_world(username, &entry);
        self.state.world_entry = Some(entry);
        Ok(LoginPoll::Entered)
    }

    fn enter_world(&mut self, entry: &WorldEntry) -> Result<(), NetError> {
        let features = self.supported_features();
        self.send(&LoginConfirm { entry })?;
        self.send(&MobileUpdate { entry })?;
        self.send(&MapChange { map: entry.map })?;
        self.send(&SeasonChange {
            season: entry.season,
        })?;
        self.send(&features)?;
        self.send(&MobileStatus { entry })?;
        self.send(&LoginComplete)?;
        self.send(&CurrentTime::now())
    }

    /// Feature flags in the width this client understands. Unknown versions
    /// get the modern form.
    pub(crate) fn supported_features(&self) -> SupportedFeatures {
        SupportedFeatures {
            flags: self.shard.settings.features,
            extended: self
                .state
                .version
                .map_or(true, |v| v >= ClientVersion::EXTENDED_FEATURES),
        }
    }
}

impl DispatchContext for Session {
    fn pre_login_restricted(&self) -> bool {
        match self.state.phase {
            LoginPhase::Connected => true,
            LoginPhase::SeedReceived => self.state.game_connection,
            _ => false,
        }
    }

    fn incoming_blocked(&self, opcode: u8) -> bool {
        self.state.block_incoming && !incoming::is_version_packet(opcode)
    }
}
