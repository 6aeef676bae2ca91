//! Brokerless multi-part messaging patterns over in-process pipes
//!
//! This crate provides connection-oriented, reliable, ordered
//! delivery of multi-part messages between [`Socket`]s, without any
//! broker in the middle.  A socket is a logical endpoint: it can be
//! bound to several names and connected to many peers at once, with
//! one bidirectional bounded pipe per peer.  What the socket *does*
//! with those pipes is decided by its pattern:
//!
//! - [`SocketType::Dealer`] — load-balances outgoing messages across
//!   its peers and fair-queues incoming ones.  No envelope, no rules.
//! - [`SocketType::Router`] — names each peer with an identity.
//!   Received messages arrive prefixed with the sender's identity;
//!   sent messages start with the destination identity, which is
//!   consumed.
//! - [`SocketType::Req`] — strict send/receive alternation over
//!   DEALER, with an empty delimiter frame marking the start of each
//!   request so replies can be matched up.
//! - [`SocketType::Rep`] — the service side over ROUTER, echoing the
//!   routing traceback so replies find their way back.
//!
//! A message is a sequence of frames ([`Msg`]) where every frame but
//! the last is sent with [`Flags::SEND_MORE`].  Frame boundaries and
//! message atomicity are preserved end-to-end: a peer sees all frames
//! of a message contiguously, or none of them.
//!
//! # Threading
//!
//! Each socket belongs to one thread at a time (`Send`, not `Sync`).
//! Pattern code never blocks internally: suspension happens only in
//! [`Socket::send`], [`Socket::recv`] and [`poll()`], and
//! [`Flags::DONT_WAIT`] turns suspension into [`Error::WouldBlock`].
//! Everything crossing threads goes through the internally
//! synchronized pipes and per-socket mailboxes.
//!
//! Sockets expose a real file descriptor ([`Socket::fd`]) that wakes
//! up when the socket needs attention, plus [`Socket::events`] for
//! actual readiness — the same contract [`poll()`] itself is built
//! on, usable from any external event loop.  Wire transports run on
//! the reactor threads owned by the [`Ctx`]; the [`Reactor`] and its
//! [`PollEvents`] interface are public for transport
//! implementations, as is the [`ReqEnvelopeGate`] wire validator.
//!
//! # Example
//!
//! ```
//! use msgmux::{Ctx, Flags, SocketType};
//!
//! let ctx = Ctx::new();
//! let mut rep = ctx.socket(SocketType::Rep).unwrap();
//! rep.bind("inproc://echo").unwrap();
//! let mut req = ctx.socket(SocketType::Req).unwrap();
//! req.connect("inproc://echo").unwrap();
//!
//! req.send_bytes(b"hello", Flags::NONE).unwrap();
//! let request = rep.recv(Flags::NONE).unwrap();
//! rep.send(request, Flags::NONE).unwrap();
//! assert_eq!(req.recv(Flags::NONE).unwrap().data(), b"hello");
//! ```
//!
//! # Scope
//!
//! Only the `inproc://` transport is built in; TCP and friends are
//! the business of transport crates driving the [`Reactor`].  There
//! is no brokered routing, no durable storage, and no delivery
//! guarantee beyond what the pipes themselves provide.

#![cfg(unix)]

mod array;
mod ctx;
mod dbuffer;
mod dealer;
mod error;
mod fq;
mod lb;
mod mailbox;
mod msg;
mod pipe;
mod poll;
mod proxy;
mod reactor;
mod rep;
mod req;
mod router;
mod signaler;
mod socket;

pub use ctx::Ctx;
pub use error::{Error, Result};
pub use msg::{Msg, IDENTITY, MORE};
pub use poll::{poll, PollFlags, PollItem};
pub use proxy::{proxy, proxy_steerable};
pub use reactor::{Handle, PollEvents, Reactor};
pub use req::ReqEnvelopeGate;
pub use socket::{Flags, Socket, SocketType};
