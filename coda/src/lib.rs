//! A completion-queue driven RPC core over HTTP/2.
//!
//! coda implements the three hard pieces of a general-purpose RPC framework:
//!
//! * the **call engine**, which turns application-submitted operation batches
//!   into transport stream activity and delivers exactly one completion event
//!   per batch on a [`CompletionQueue`](completion::CompletionQueue);
//! * the **client channel**, which owns a name resolver, a load-balancing
//!   policy and a set of subchannels, and routes every new call through an
//!   immutable picker snapshot;
//! * the **server core**, which demultiplexes inbound HTTP/2 streams onto
//!   registered methods and pairs them with application-posted request-call
//!   tags.
//!
//! Messages cross this crate as opaque byte buffers; serialization, TLS and
//! the HTTP/2 framer itself are collaborators behind the [`transport`]
//! contracts. The [`inmemory`] transport backs the test suite and the
//! [`transport::http2`] binding speaks the real protocol over TCP.

pub mod call;
pub mod client;
pub mod completion;
pub mod inmemory;
pub mod metadata;
pub mod server;
pub mod transport;

pub mod attributes;

pub(crate) mod codec;
pub(crate) mod rt;

mod status;

pub use status::{Code, Status};

#[doc(inline)]
pub use call::{Batch, Call};
#[doc(inline)]
pub use client::channel::{Channel, ChannelOptions};
#[doc(inline)]
pub use completion::{CompletionQueue, Next, Tag};
#[doc(inline)]
pub use server::Server;

/// A type-erased error, used where arbitrary failures are chained onto a
/// [`Status`].
pub type Error = Box<dyn std::error::Error + Send + Sync>;
