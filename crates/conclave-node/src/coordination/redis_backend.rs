//! Redis-backed coordination.
//!
//! Emulates the coordination capability on a single Redis instance:
//! - Nodes are hashes (`node:{path}`), children are sets (`children:{path}`)
//! - Creation and deletion run as Lua scripts, so sequence assignment,
//!   parent checks and the at-most-one-creator rule are atomic
//! - A session is a key with a PX TTL refreshed by a keepalive task; the
//!   ephemeral paths it owns are tracked in `owned:{session}`
//! - Every client reaps the ephemerals of sessions whose key expired
//! - Changes are published on the `events` channel and fire the local
//!   one-shot watches
//!
//! Scripts compute node keys at runtime, so this layout targets a single
//! Redis node, not Redis Cluster.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conclave_common::constants::{DEFAULT_COORDINATOR_URL, DEFAULT_SESSION_TIMEOUT_MS, redis_keys};
use conclave_common::{CoordinationError, CreateMode, NodeStat, SessionState, WatchedEvent};
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{Coordinator, WatchKind, WatchRegistry, Watcher, split_path, validate_path};

const CREATE_SCRIPT: &str = r#"
local parent = ARGV[2]
if parent ~= '/' then
  if redis.call('EXISTS', KEYS[1]) == 0 then return '!NONODE' end
  local parent_owner = redis.call('HGET', KEYS[1], 'owner')
  if parent_owner and parent_owner ~= '' then return '!EPHEMERAL' end
end
local name = ARGV[3]
if ARGV[5] == '1' then
  local sequence = redis.call('INCR', KEYS[3]) - 1
  name = name .. string.format('%010d', sequence)
end
local path
if parent == '/' then path = '/' .. name else path = parent .. '/' .. name end
local key = ARGV[1] .. path
if redis.call('EXISTS', key) == 1 then return '!EXISTS' end
redis.call('HSET', key, 'data', ARGV[4], 'owner', ARGV[6], 'version', '0', 'ctime', ARGV[8])
redis.call('SADD', KEYS[2], name)
if ARGV[6] ~= '' then redis.call('SADD', KEYS[4], path) end
redis.call('PUBLISH', ARGV[7], cjson.encode({event_type = 'node_created', path = path}))
redis.call('PUBLISH', ARGV[7], cjson.encode({event_type = 'node_children_changed', path = parent}))
return path
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return '!NONODE' end
if redis.call('SCARD', KEYS[2]) > 0 then return '!NOTEMPTY' end
if ARGV[4] ~= '-1' and redis.call('HGET', KEYS[1], 'version') ~= ARGV[4] then return '!BADVERSION' end
local owner = redis.call('HGET', KEYS[1], 'owner')
redis.call('DEL', KEYS[1], KEYS[4])
redis.call('SREM', KEYS[3], ARGV[3])
if owner and owner ~= '' then redis.call('SREM', ARGV[5] .. owner, ARGV[1]) end
redis.call('PUBLISH', ARGV[6], cjson.encode({event_type = 'node_deleted', path = ARGV[1]}))
redis.call('PUBLISH', ARGV[6], cjson.encode({event_type = 'node_children_changed', path = ARGV[2]}))
return 'OK'
"#;

const REAP_SCRIPT: &str = r#"
local paths = redis.call('SMEMBERS', KEYS[1])
local removed = 0
for _, path in ipairs(paths) do
  if redis.call('DEL', ARGV[1] .. path) == 1 then
    removed = removed + 1
    local parent, name = string.match(path, '^(.*)/([^/]+)$')
    if parent == '' then parent = '/' end
    redis.call('SREM', ARGV[2] .. parent, name)
    redis.call('PUBLISH', ARGV[3], cjson.encode({event_type = 'node_deleted', path = path}))
    redis.call('PUBLISH', ARGV[3], cjson.encode({event_type = 'node_children_changed', path = parent}))
  end
end
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[4])
return removed
"#;

/// Redis backend configuration
#[derive(Clone, Debug)]
pub struct RedisBackendConfig {
    /// Redis connection URL
    pub url: String,
    /// Prefix for every key and channel
    pub key_prefix: String,
    /// Session lifetime without a successful keepalive
    pub session_timeout: Duration,
    /// Label stored in the session key (the node id)
    pub label: String,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_COORDINATOR_URL.to_string(),
            key_prefix: redis_keys::DEFAULT_KEY_PREFIX.to_string(),
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
            label: "unknown".to_string(),
        }
    }
}

/// Key names under a prefix
#[derive(Clone, Debug)]
struct KeySpace {
    prefix: String,
}

impl KeySpace {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn node_prefix(&self) -> String {
        format!("{}{}", self.prefix, redis_keys::NODE_PREFIX)
    }

    fn node(&self, path: &str) -> String {
        format!("{}{}", self.node_prefix(), path)
    }

    fn children_prefix(&self) -> String {
        format!("{}{}", self.prefix, redis_keys::CHILDREN_PREFIX)
    }

    fn children(&self, path: &str) -> String {
        format!("{}{}", self.children_prefix(), path)
    }

    fn sequence(&self, path: &str) -> String {
        format!("{}{}{}", self.prefix, redis_keys::SEQUENCE_PREFIX, path)
    }

    fn session(&self, session_id: &str) -> String {
        format!("{}{}{}", self.prefix, redis_keys::SESSION_PREFIX, session_id)
    }

    fn sessions(&self) -> String {
        format!("{}{}", self.prefix, redis_keys::SESSIONS)
    }

    fn owned_prefix(&self) -> String {
        format!("{}{}", self.prefix, redis_keys::OWNED_PREFIX)
    }

    fn owned(&self, session_id: &str) -> String {
        format!("{}{}", self.owned_prefix(), session_id)
    }

    fn events(&self) -> String {
        format!("{}{}", self.prefix, redis_keys::EVENTS_CHANNEL)
    }
}

fn redis_error(e: redis::RedisError) -> CoordinationError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() || e.is_timeout()
    {
        CoordinationError::ConnectionLoss(e.to_string())
    } else {
        CoordinationError::Backend(e.to_string())
    }
}

/// Map the create script reply to a created path or error
fn create_reply(reply: String, path: &str, parent: &str) -> Result<String, CoordinationError> {
    match reply.as_str() {
        "!NONODE" => Err(CoordinationError::NoNode(parent.to_string())),
        "!EPHEMERAL" => Err(CoordinationError::NoChildrenForEphemerals(parent.to_string())),
        "!EXISTS" => Err(CoordinationError::NodeExists(path.to_string())),
        _ => Ok(reply),
    }
}

/// Map the delete script reply
fn delete_reply(reply: &str, path: &str) -> Result<(), CoordinationError> {
    match reply {
        "OK" => Ok(()),
        "!NONODE" => Err(CoordinationError::NoNode(path.to_string())),
        "!NOTEMPTY" => Err(CoordinationError::NotEmpty(path.to_string())),
        "!BADVERSION" => Err(CoordinationError::BadVersion(path.to_string())),
        other => Err(CoordinationError::Backend(format!(
            "unexpected delete reply {other:?} for {path}"
        ))),
    }
}

fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    format!("{:016x}", rng.random::<u64>())
}

/// State shared with the keepalive and notification tasks
struct Shared {
    conn: ConnectionManager,
    keys: KeySpace,
    session_id: String,
    label: String,
    session_timeout: Duration,
    create: redis::Script,
    delete: redis::Script,
    reap: redis::Script,
    watches: WatchRegistry,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl Shared {
    fn is_live(&self) -> Result<(), CoordinationError> {
        if self.state.borrow().is_terminal() {
            return Err(CoordinationError::SessionExpired);
        }
        Ok(())
    }

    /// Move to a terminal state once, stopping the background tasks
    fn end_session(&self, terminal: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        });
        if changed {
            self.cancel.cancel();
            self.watches.clear();
        }
    }

    async fn open_session(&self) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.keys.session(&self.session_id))
            .arg(&self.label)
            .arg("PX")
            .arg(self.session_timeout.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        let _: () = conn
            .sadd(self.keys.sessions(), &self.session_id)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    /// Extend the session TTL; false if the key is already gone
    async fn touch_session(&self) -> Result<bool, CoordinationError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.keys.session(&self.session_id))
            .arg(&self.label)
            .arg("PX")
            .arg(self.session_timeout.as_millis() as u64)
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(reply.is_some())
    }

    /// Remove every ephemeral node of a session
    async fn reap_session(&self, session_id: &str) -> Result<i64, CoordinationError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .reap
            .key(self.keys.owned(session_id))
            .key(self.keys.sessions())
            .arg(self.keys.node_prefix())
            .arg(self.keys.children_prefix())
            .arg(self.keys.events())
            .arg(session_id)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(removed)
    }

    async fn reap_expired_sessions(&self) -> Result<(), CoordinationError> {
        let mut conn = self.conn.clone();
        let sessions: Vec<String> = conn
            .smembers(self.keys.sessions())
            .await
            .map_err(redis_error)?;

        for session_id in sessions {
            if session_id == self.session_id {
                continue;
            }
            let alive: bool = conn
                .exists(self.keys.session(&session_id))
                .await
                .map_err(redis_error)?;
            if alive {
                continue;
            }
            let removed = self.reap_session(&session_id).await?;
            tracing::info!(session = %session_id, removed, "Reaped expired session");
        }

        Ok(())
    }
}

/// Keep the session alive and reap sessions of dead processes
async fn keepalive(shared: Arc<Shared>) {
    let interval = shared.session_timeout / 3;
    let mut last_ok = Instant::now();

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match shared.touch_session().await {
            Ok(true) => {
                last_ok = Instant::now();
                if let Err(e) = shared.reap_expired_sessions().await {
                    tracing::warn!(error = %e, "Session reaper failed");
                }
            }
            Ok(false) => {
                tracing::error!(session = %shared.session_id, "Session key expired");
                shared.end_session(SessionState::Expired);
                if let Err(e) = shared.reap_session(&shared.session_id).await {
                    tracing::warn!(error = %e, "Failed to reap own expired session");
                }
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Session keepalive failed");
                if last_ok.elapsed() >= shared.session_timeout {
                    tracing::error!(session = %shared.session_id, "Session timed out");
                    shared.end_session(SessionState::Expired);
                    break;
                }
            }
        }
    }
}

/// Dispatch published change notices to the local watches
async fn listen_for_changes(shared: Arc<Shared>, pubsub: redis::aio::PubSub) {
    let messages = pubsub.into_on_message();
    tokio::pin!(messages);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = messages.next() => {
                let Some(msg) = msg else {
                    // Without notices the watch contract cannot be honoured
                    tracing::error!("Change notice stream closed");
                    shared.end_session(SessionState::Expired);
                    break;
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "Unreadable change notice");
                        continue;
                    }
                };

                match serde_json::from_str::<WatchedEvent>(&payload) {
                    Ok(event) => {
                        let notified = shared.watches.trigger(&event);
                        tracing::trace!(
                            path = %event.path,
                            event = ?event.event_type,
                            notified,
                            "Change notice"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, payload = %payload, "Malformed change notice");
                    }
                }
            }
        }
    }
}

/// Coordination session backed by Redis
pub struct RedisCoordinator {
    shared: Arc<Shared>,
    state: watch::Receiver<SessionState>,
}

impl RedisCoordinator {
    /// Connect, subscribe to change notices and open a session
    pub async fn connect(config: RedisBackendConfig) -> Result<Self, CoordinationError> {
        let client = redis::Client::open(config.url.as_str()).map_err(redis_error)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(redis_error)?;
        let keys = KeySpace::new(&config.key_prefix);

        // Subscribe before the session is visible so no notice is missed
        let mut pubsub = client.get_async_pubsub().await.map_err(redis_error)?;
        pubsub
            .subscribe(keys.events())
            .await
            .map_err(redis_error)?;

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let shared = Arc::new(Shared {
            conn,
            keys,
            session_id: generate_session_id(),
            label: config.label,
            session_timeout: config.session_timeout,
            create: redis::Script::new(CREATE_SCRIPT),
            delete: redis::Script::new(DELETE_SCRIPT),
            reap: redis::Script::new(REAP_SCRIPT),
            watches: WatchRegistry::new(),
            state: state_tx,
            cancel: CancellationToken::new(),
        });

        shared.open_session().await?;
        shared.state.send_replace(SessionState::Connected);

        tokio::spawn(listen_for_changes(shared.clone(), pubsub));
        tokio::spawn(keepalive(shared.clone()));

        tracing::info!(
            session = %shared.session_id,
            timeout = ?shared.session_timeout,
            "Redis coordination session opened"
        );

        Ok(Self {
            shared,
            state: state_rx,
        })
    }
}

#[async_trait]
impl Coordinator for RedisCoordinator {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, CoordinationError> {
        validate_path(path)?;
        self.shared.is_live()?;
        let Some((parent, name)) = split_path(path) else {
            return Err(CoordinationError::NodeExists(path.to_string()));
        };

        let shared = &self.shared;
        let owner = if mode.is_ephemeral() {
            shared.session_id.as_str()
        } else {
            ""
        };

        let mut conn = shared.conn.clone();
        let reply: String = shared
            .create
            .key(shared.keys.node(parent))
            .key(shared.keys.children(parent))
            .key(shared.keys.sequence(parent))
            .key(shared.keys.owned(&shared.session_id))
            .arg(shared.keys.node_prefix())
            .arg(parent)
            .arg(name)
            .arg(data)
            .arg(if mode.is_sequential() { "1" } else { "0" })
            .arg(owner)
            .arg(shared.keys.events())
            .arg(chrono::Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        create_reply(reply, path, parent)
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError> {
        validate_path(path)?;
        self.shared.is_live()?;
        let Some((parent, name)) = split_path(path) else {
            return Err(CoordinationError::InvalidPath(path.to_string()));
        };

        let shared = &self.shared;
        let expected = version.map_or_else(|| "-1".to_string(), |v| v.to_string());

        let mut conn = shared.conn.clone();
        let reply: String = shared
            .delete
            .key(shared.keys.node(path))
            .key(shared.keys.children(path))
            .key(shared.keys.children(parent))
            .key(shared.keys.sequence(path))
            .arg(path)
            .arg(parent)
            .arg(name)
            .arg(expected)
            .arg(shared.keys.owned_prefix())
            .arg(shared.keys.events())
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;

        delete_reply(&reply, path)
    }

    async fn exists(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Option<NodeStat>, CoordinationError> {
        validate_path(path)?;
        self.shared.is_live()?;
        let shared = &self.shared;

        // Arm before reading so a deletion in between is not lost
        if let Some(watcher) = &watch {
            shared.watches.arm(path, WatchKind::Exists, watcher.clone());
        }

        let key = shared.keys.node(path);
        let mut conn = shared.conn.clone();
        let ((version, owner, ctime), data_length, num_children): (
            (Option<i32>, Option<String>, Option<i64>),
            usize,
            usize,
        ) = redis::pipe()
            .cmd("HMGET")
            .arg(&key)
            .arg("version")
            .arg("owner")
            .arg("ctime")
            .cmd("HSTRLEN")
            .arg(&key)
            .arg("data")
            .cmd("SCARD")
            .arg(shared.keys.children(path))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        let Some(version) = version else {
            if let Some(watcher) = &watch {
                shared.watches.disarm(path, WatchKind::Exists, watcher);
            }
            return Ok(None);
        };

        Ok(Some(NodeStat {
            version,
            ephemeral_owner: owner.filter(|o| !o.is_empty()),
            data_length,
            num_children,
            created_at_ms: ctime.unwrap_or_default(),
        }))
    }

    async fn get_children(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<String>, CoordinationError> {
        validate_path(path)?;
        self.shared.is_live()?;
        let shared = &self.shared;

        if let Some(watcher) = &watch {
            shared.watches.arm(path, WatchKind::Children, watcher.clone());
        }

        let mut conn = shared.conn.clone();
        if path != "/" {
            let present: bool = conn
                .exists(shared.keys.node(path))
                .await
                .map_err(redis_error)?;
            if !present {
                if let Some(watcher) = &watch {
                    shared.watches.disarm(path, WatchKind::Children, watcher);
                }
                return Err(CoordinationError::NoNode(path.to_string()));
            }
        }

        let mut names: Vec<String> = conn
            .smembers(shared.keys.children(path))
            .await
            .map_err(redis_error)?;
        names.sort();
        Ok(names)
    }

    async fn get_data(
        &self,
        path: &str,
        watch: Option<Watcher>,
    ) -> Result<Vec<u8>, CoordinationError> {
        validate_path(path)?;
        self.shared.is_live()?;
        let shared = &self.shared;

        if let Some(watcher) = &watch {
            shared.watches.arm(path, WatchKind::Data, watcher.clone());
        }

        let mut conn = shared.conn.clone();
        let data: Option<Vec<u8>> = conn
            .hget(shared.keys.node(path), "data")
            .await
            .map_err(redis_error)?;

        match data {
            Some(data) => Ok(data),
            None => {
                if let Some(watcher) = &watch {
                    shared.watches.disarm(path, WatchKind::Data, watcher);
                }
                Err(CoordinationError::NoNode(path.to_string()))
            }
        }
    }

    fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    async fn close(&self) -> Result<(), CoordinationError> {
        let shared = &self.shared;
        if shared.state.borrow().is_terminal() {
            return Ok(());
        }

        let removed = shared.reap_session(&shared.session_id).await?;
        let mut conn = shared.conn.clone();
        let _: () = conn
            .del(shared.keys.session(&shared.session_id))
            .await
            .map_err(redis_error)?;

        shared.end_session(SessionState::Closed);
        tracing::info!(session = %shared.session_id, removed, "Redis coordination session closed");
        Ok(())
    }
}
