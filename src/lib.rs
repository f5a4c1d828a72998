//! Async client for the Pusher Channels websocket protocol (version 7).
//!
//! The client keeps a single websocket alive with ping/pong heartbeats,
//! reconnects with exponential backoff when the transport fails, and restores
//! every channel subscription on reconnect. Inbound events fan out to
//! per-channel and connection-wide bindings without ever blocking the reader.
//!
//! ```no_run
//! use pusher_ws::Client;
//!
//! # async fn run() -> Result<(), pusher_ws::PusherError> {
//! let client = Client::builder().with_cluster("eu").build();
//! client.connect("app-key").await?;
//!
//! let channel = client.subscribe("orders").await?;
//! let mut prices = channel.bind("price-update");
//! while let Some(data) = prices.recv().await {
//!     println!("price update: {data}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Private (`private-`) and presence (`presence-`) channels are authorized
//! either through an auth endpoint ([`ClientBuilder::with_auth_url`]) or by
//! signing locally with the app secret ([`ClientBuilder::with_app_secret`]).
//! Presence channels additionally track a member roster, see
//! [`PresenceChannel`].

mod binding;
mod channel;
mod client;
mod connection;
mod error;
mod event;
mod message;

pub use binding::{Binding, BindingId, DataBinding, EventBinding, MemberBinding};
pub use channel::{Channel, ChannelKind, PresenceChannel, SubscribeOptions, SubscriptionState};
pub use client::{Client, ClientBuilder};
pub use error::{EventError, PusherError};
pub use event::{from_data_string, Event};
pub use message::Member;
