//! # Tile World Server
//!
//! The authoritative server for a tile-based multiplayer world. Clients
//! connect over TCP, speak a compact binary frame protocol, and receive a
//! view of the world maintained entirely on this side: positions, movement,
//! visibility and the in-game clock are all decided here.
//!
//! ## Architecture
//!
//! Three cooperating loops, each polling a shared stop flag:
//!
//! - **Listener** (`network::run_listener`): accepts sockets and stages
//!   them for the other two loops.
//! - **Connection I/O** (`network::run_io_loop`): non-blocking
//!   poll-and-drain over every live socket. Decodes inbound frames into
//!   per-connection queues, encodes and sends queued outbound messages,
//!   and watches liveness. Never touches entity state.
//! - **World tick** (`world::run_world_loop`): the single owner of all
//!   entities. Drains the inbound queues, runs game logic and scheduled
//!   actions, and queues outbound messages.
//!
//! The only state shared across loops is [`connection::ConnectionShared`]
//! (two message queues plus flags) and the staged-connection lists in
//! [`network::NetHub`].
//!
//! ## Module Organization
//!
//! - `map` — immutable tile maps with walkability and reachability clusters
//! - `pathfind` — A* over a map, cluster-prechecked, with a closed result set
//! - `scheduler` / `actions` — cooperative interval-gated timed actions
//! - `entity` — the entity arena, id allocation and staging
//! - `connection` / `network` — the wire side
//! - `world` — the tick loop and message dispatch
//! - `storage` — character persistence behind a store trait

pub mod actions;
pub mod connection;
pub mod entity;
pub mod map;
pub mod network;
pub mod pathfind;
pub mod scheduler;
pub mod storage;
pub mod utils;
pub mod world;
