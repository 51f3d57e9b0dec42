/// Room registry and broadcast adapter, one per namespace.
///
/// Keeps the forward index (room name -> member session ids) and the
/// reverse index (session id -> joined room names) under a single lock so
/// membership read-modify-write never interleaves within a namespace. The
/// reverse index makes disconnect cleanup proportional to the rooms the
/// session joined instead of a scan of every room.
use crate::namespace::Namespace;
use crate::parser::Packet;
use crate::socket::WriteOptions;
use std::collections::{HashMap, HashSet};
use std::sync::Weak;
use tokio::sync::RwLock;

/// Transient per-call emit options, staged before one outbound call and
/// reset unconditionally after use.
#[derive(Debug, Clone, Default)]
pub struct EmitFlags {
    /// Drop instead of queueing when the transport is not writable.
    pub volatile: bool,
    /// Force the emission through the adapter even without staged rooms.
    pub broadcast: bool,
    /// Per-message compression hint; defaults to on.
    pub compress: Option<bool>,
    /// Overrides binary-payload detection when set.
    pub binary: Option<bool>,
}

impl EmitFlags {
    pub(crate) fn write_options(&self) -> WriteOptions {
        WriteOptions {
            compress: self.compress.unwrap_or(true),
            volatile: self.volatile,
        }
    }
}

/// Rooms and flags staged via `to`/`in_`/flag calls, consumed by the next
/// emission and reset unconditionally.
#[derive(Debug, Clone, Default)]
pub(crate) struct EmitStage {
    pub rooms: Vec<String>,
    pub flags: EmitFlags,
}

/// Target filter for one broadcast: the union of members across `rooms`
/// (all registered sessions when empty), minus `except`.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub rooms: Vec<String>,
    pub except: Vec<String>,
    pub flags: EmitFlags,
}

#[derive(Default)]
struct RoomState {
    rooms: HashMap<String, HashSet<String>>,
    sids: HashMap<String, HashSet<String>>,
}

pub struct Adapter {
    nsp: Weak<Namespace>,
    state: RwLock<RoomState>,
}

impl Adapter {
    pub(crate) fn new(nsp: Weak<Namespace>) -> Self {
        Self {
            nsp,
            state: RwLock::new(RoomState::default()),
        }
    }

    /// Idempotently add a session to each named room, creating rooms on
    /// first member.
    pub async fn add_all(&self, id: &str, rooms: &[String]) {
        let mut state = self.state.write().await;
        for room in rooms {
            state
                .sids
                .entry(id.to_string())
                .or_default()
                .insert(room.clone());
            state
                .rooms
                .entry(room.clone())
                .or_default()
                .insert(id.to_string());
            tracing::debug!(session = id, room = room.as_str(), "joined room");
        }
    }

    /// Remove a session from one room, pruning the room when it empties.
    /// No-op if the session is not a member.
    pub async fn del(&self, id: &str, room: &str) {
        let mut state = self.state.write().await;
        if let Some(rooms) = state.sids.get_mut(id) {
            rooms.remove(room);
            if rooms.is_empty() {
                state.sids.remove(id);
            }
        }
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(id);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
        tracing::debug!(session = id, room = room, "left room");
    }

    /// Remove a session from every room it belongs to. Idempotent.
    pub async fn del_all(&self, id: &str) {
        let mut state = self.state.write().await;
        let Some(joined) = state.sids.remove(id) else {
            return;
        };
        for room in joined {
            if let Some(members) = state.rooms.get_mut(&room) {
                members.remove(id);
                if members.is_empty() {
                    state.rooms.remove(&room);
                }
            }
        }
        tracing::debug!(session = id, "left all rooms");
    }

    /// Encode the packet once and deliver the identical frames to every
    /// resolved, currently-live session. Dead transports are skipped.
    pub async fn broadcast(&self, mut packet: Packet, opts: BroadcastOptions) {
        let Some(nsp) = self.nsp.upgrade() else {
            return;
        };
        packet.nsp = nsp.name().to_string();
        let frames = packet.encode();
        let write_opts = opts.flags.write_options();

        let targets = self.resolve_targets(&nsp, &opts.rooms, &opts.except).await;
        tracing::debug!(
            nsp = nsp.name(),
            targets = targets.len(),
            "broadcasting packet"
        );
        for socket in targets {
            socket.send_frames(&frames, &write_opts).await;
        }
    }

    /// Session ids reachable through `rooms` (all connected sessions when
    /// empty). Read-only.
    pub async fn sockets_in(&self, rooms: &[String]) -> Vec<String> {
        let Some(nsp) = self.nsp.upgrade() else {
            return Vec::new();
        };
        if rooms.is_empty() {
            return nsp.connected_ids().await;
        }

        let state = self.state.read().await;
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for room in rooms {
            let Some(members) = state.rooms.get(room) else {
                continue;
            };
            for id in members {
                if seen.insert(id.clone()) {
                    ids.push(id.clone());
                }
            }
        }
        drop(state);

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if nsp.socket(&id).await.is_some() {
                out.push(id);
            }
        }
        out
    }

    /// Room names a session has joined. Read-only.
    pub async fn rooms_of(&self, id: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .sids
            .get(id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn resolve_targets(
        &self,
        nsp: &std::sync::Arc<Namespace>,
        rooms: &[String],
        except: &[String],
    ) -> Vec<std::sync::Arc<crate::socket::Socket>> {
        let ids: Vec<String> = if rooms.is_empty() {
            nsp.connected_ids()
                .await
                .into_iter()
                .filter(|id| !except.contains(id))
                .collect()
        } else {
            let state = self.state.read().await;
            let mut seen = HashSet::new();
            let mut ids = Vec::new();
            for room in rooms {
                let Some(members) = state.rooms.get(room) else {
                    continue;
                };
                for id in members {
                    if except.contains(id) {
                        continue;
                    }
                    if seen.insert(id.clone()) {
                        ids.push(id.clone());
                    }
                }
            }
            ids
        };

        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(socket) = nsp.socket(&id).await {
                targets.push(socket);
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::payload::Payload;
    use crate::server::Server;
    use crate::test_util;
    use std::sync::Weak;

    fn detached_adapter() -> Adapter {
        Adapter::new(Weak::<Namespace>::new())
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let adapter = detached_adapter();
        adapter.add_all("s1", &["r1".to_string(), "r2".to_string()]).await;
        adapter.add_all("s1", &["r1".to_string()]).await;

        let mut rooms = adapter.rooms_of("s1").await;
        rooms.sort();
        assert_eq!(rooms, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[tokio::test]
    async fn empty_rooms_are_pruned() {
        let adapter = detached_adapter();
        adapter.add_all("s1", &["r1".to_string()]).await;
        adapter.add_all("s2", &["r1".to_string()]).await;

        adapter.del("s1", "r1").await;
        {
            let state = adapter.state.read().await;
            assert!(state.rooms.contains_key("r1"));
        }

        adapter.del("s2", "r1").await;
        {
            let state = adapter.state.read().await;
            assert!(state.rooms.is_empty());
            assert!(state.sids.is_empty());
        }
    }

    #[tokio::test]
    async fn leave_all_twice_leaves_identical_state() {
        let adapter = detached_adapter();
        adapter.add_all("s1", &["r1".to_string(), "r2".to_string()]).await;
        adapter.add_all("s2", &["r2".to_string()]).await;

        adapter.del_all("s1").await;
        adapter.del_all("s1").await;

        assert!(adapter.rooms_of("s1").await.is_empty());
        assert_eq!(adapter.rooms_of("s2").await, vec!["r2".to_string()]);
        let state = adapter.state.read().await;
        assert_eq!(state.rooms.len(), 1);
    }

    #[tokio::test]
    async fn del_for_non_member_is_noop() {
        let adapter = detached_adapter();
        adapter.add_all("s1", &["r1".to_string()]).await;
        adapter.del("s2", "r1").await;
        adapter.del("s1", "other").await;
        assert_eq!(adapter.rooms_of("s1").await, vec!["r1".to_string()]);
    }

    #[tokio::test]
    async fn overlapping_rooms_deliver_exactly_once() {
        let server = Server::new();
        let mut first = test_util::connect(&server).await;
        let mut second = test_util::connect(&server).await;

        first
            .socket
            .join(vec!["r1".to_string(), "r2".to_string()])
            .await;
        second.socket.join(vec!["r2".to_string()]).await;
        test_util::drain(&mut first.frames);
        test_util::drain(&mut second.frames);

        let nsp = server.of("/").await;
        nsp.to("r1").to("r2").emit("evt", vec![]).await;

        // The first session is a member of both targeted rooms but still
        // receives a single copy.
        assert_eq!(
            test_util::drain_text(&mut first.frames),
            vec![r#"2["evt"]"#.to_string()]
        );
        assert_eq!(
            test_util::drain_text(&mut second.frames),
            vec![r#"2["evt"]"#.to_string()]
        );
    }

    #[tokio::test]
    async fn broadcast_without_rooms_reaches_all_connected() {
        let server = Server::new();
        let mut first = test_util::connect(&server).await;
        let mut second = test_util::connect(&server).await;
        test_util::drain(&mut first.frames);
        test_util::drain(&mut second.frames);

        server.of("/").await.emit("news", vec![Payload::from(7i64)]).await;

        assert_eq!(
            test_util::drain_text(&mut first.frames),
            vec![r#"2["news",7]"#.to_string()]
        );
        assert_eq!(
            test_util::drain_text(&mut second.frames),
            vec![r#"2["news",7]"#.to_string()]
        );
    }

    #[tokio::test]
    async fn except_list_excludes_sessions() {
        let server = Server::new();
        let mut first = test_util::connect(&server).await;
        let mut second = test_util::connect(&server).await;
        test_util::drain(&mut first.frames);
        test_util::drain(&mut second.frames);

        let nsp = server.of("/").await;
        nsp.adapter()
            .broadcast(
                Packet::event("/", "evt", vec![]),
                BroadcastOptions {
                    rooms: Vec::new(),
                    except: vec![second.socket.id().to_string()],
                    flags: EmitFlags::default(),
                },
            )
            .await;

        assert_eq!(
            test_util::drain_text(&mut first.frames),
            vec![r#"2["evt"]"#.to_string()]
        );
        assert!(test_util::drain_text(&mut second.frames).is_empty());
    }

    #[tokio::test]
    async fn sockets_in_unions_rooms_without_duplicates() {
        let server = Server::new();
        let first = test_util::connect(&server).await;
        let second = test_util::connect(&server).await;

        first
            .socket
            .join(vec!["r1".to_string(), "r2".to_string()])
            .await;
        second.socket.join(vec!["r2".to_string()]).await;

        let nsp = server.of("/").await;
        let mut ids = nsp
            .adapter()
            .sockets_in(&["r1".to_string(), "r2".to_string()])
            .await;
        ids.sort();
        let mut expected = vec![
            first.socket.id().to_string(),
            second.socket.id().to_string(),
        ];
        expected.sort();
        assert_eq!(ids, expected);

        assert!(nsp
            .adapter()
            .sockets_in(&["missing".to_string()])
            .await
            .is_empty());
    }
}
