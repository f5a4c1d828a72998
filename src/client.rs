//! The client: session state, handshake, heartbeat, dispatch, and
//! reconnection.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::HeaderMap;
use reqwest::Client as HttpClient;
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::time;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::binding::{deliver, Binding, BindingId, EventBinding, BINDING_BUFFER};
use crate::channel::{Channel, ChannelInner, PresenceChannel, SubscribeOptions};
use crate::connection::{self, Connection, ReadHalf};
use crate::error::{EventError, PusherError};
use crate::event::{from_data_string, protocol, Event};
use crate::message::{AuthResponse, ConnectionInfo, UnsubscribeData};

const DEFAULT_HOST: &str = "ws.pusherapp.com";
const PROTOCOL_VERSION: u32 = 7;

/// Idle timeout to assume when the server does not advertise one.
const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);
/// Consecutive missed pongs before the session reconnects.
const MAX_PONG_FAILURES: u32 = 2;
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub(crate) struct Config {
    cluster: Option<String>,
    insecure: bool,
    auth_url: Option<String>,
    auth_params: HashMap<String, String>,
    auth_headers: HeaderMap,
    app_secret: Option<String>,
    override_host: Option<String>,
    override_port: Option<u16>,
    pong_timeout: Duration,
    initial_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: None,
            insecure: false,
            auth_url: None,
            auth_params: HashMap::new(),
            auth_headers: HeaderMap::new(),
            app_secret: None,
            override_host: None,
            override_port: None,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            initial_reconnect_delay: INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
        }
    }
}

/// Builder for [`Client`]. Configuration is immutable once built.
#[derive(Default)]
pub struct ClientBuilder {
    config: Config,
    error_sink: Option<mpsc::Sender<PusherError>>,
}

impl ClientBuilder {
    /// Connect to `ws-<cluster>.pusher.com` instead of the default host.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.config.cluster = Some(cluster.into());
        self
    }

    /// Use plain `ws://` on port 80 instead of TLS.
    pub fn insecure(mut self) -> Self {
        self.config.insecure = true;
        self
    }

    /// Endpoint POSTed to when authorizing private and presence channels.
    pub fn with_auth_url(mut self, url: impl Into<String>) -> Self {
        self.config.auth_url = Some(url.into());
        self
    }

    /// Extra form fields sent with every authorization request.
    pub fn with_auth_params(mut self, params: HashMap<String, String>) -> Self {
        self.config.auth_params = params;
        self
    }

    /// Extra HTTP headers sent with every authorization request.
    pub fn with_auth_headers(mut self, headers: HeaderMap) -> Self {
        self.config.auth_headers = headers;
        self
    }

    /// Sign channel authorizations locally with the app secret instead of
    /// calling an auth endpoint.
    pub fn with_app_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.app_secret = Some(secret.into());
        self
    }

    pub fn with_override_host(mut self, host: impl Into<String>) -> Self {
        self.config.override_host = Some(host.into());
        self
    }

    pub fn with_override_port(mut self, port: u16) -> Self {
        self.config.override_port = Some(port);
        self
    }

    /// How long to wait for a pong after an idle-triggered ping.
    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.config.pong_timeout = timeout;
        self
    }

    pub fn with_initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.initial_reconnect_delay = delay;
        self
    }

    pub fn with_max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.max_reconnect_delay = delay;
        self
    }

    /// Channel receiving asynchronous errors and reconnection notices.
    /// Delivery never blocks; errors are dropped when the channel is full.
    pub fn with_error_sink(mut self, sink: mpsc::Sender<PusherError>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(Inner {
                config: self.config,
                http: HttpClient::new(),
                state: RwLock::new(Session::default()),
                channels: RwLock::new(HashMap::new()),
                bindings: RwLock::new(HashMap::new()),
                error_sink: self.error_sink,
                next_binding: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct Session {
    connected: bool,
    app_key: String,
    socket_id: Option<String>,
    activity_timeout: Duration,
    reconnect_delay: Duration,
    pong_failures: u32,
    connection: Option<Arc<Connection>>,
    cancel: CancellationToken,
    reset_tx: Option<mpsc::Sender<()>>,
    pong_tx: Option<mpsc::Sender<()>>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            connected: false,
            app_key: String::new(),
            socket_id: None,
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            reconnect_delay: INITIAL_RECONNECT_DELAY,
            pong_failures: 0,
            connection: None,
            cancel: CancellationToken::new(),
            reset_tx: None,
            pong_tx: None,
        }
    }
}

pub(crate) struct Inner {
    config: Config,
    http: HttpClient,
    state: RwLock<Session>,
    channels: RwLock<HashMap<String, Arc<ChannelInner>>>,
    bindings: RwLock<HashMap<String, HashMap<u64, mpsc::Sender<Event>>>>,
    error_sink: Option<mpsc::Sender<PusherError>>,
    next_binding: AtomicU64,
    closed: AtomicBool,
}

/// Client for the Pusher websocket protocol.
///
/// One client owns one logical session: a single transport kept alive with
/// ping/pong heartbeats, reconnected with exponential backoff on failure, and
/// a registry of channel subscriptions restored on every reconnect. Handles
/// are cheap to clone and share the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Establish the connection to the app identified by `app_key`. Returns
    /// once the server has confirmed the session (or rejected it).
    pub async fn connect(&self, app_key: &str) -> Result<(), PusherError> {
        {
            let mut st = self.inner.state.write();
            if st.connected {
                return Err(PusherError::Protocol("already connected".to_string()));
            }
            st.app_key = app_key.to_string();
            st.reconnect_delay = self.inner.config.initial_reconnect_delay;
            st.pong_failures = 0;
        }
        self.inner.closed.store(false, Ordering::SeqCst);
        self.inner.clone().establish().await
    }

    /// Close the transport and end the session. Idempotent; also abandons an
    /// in-flight reconnection.
    pub async fn disconnect(&self) -> Result<(), PusherError> {
        self.inner.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Server-assigned identifier for the current transport; changes on every
    /// reconnect.
    pub fn socket_id(&self) -> Option<String> {
        self.inner.state.read().socket_id.clone()
    }

    /// Idle duration after which the client pings, as advertised by the
    /// server during the handshake.
    pub fn activity_timeout(&self) -> Duration {
        self.inner.state.read().activity_timeout
    }

    /// Subscribe to a channel. Idempotent per name: the registered channel is
    /// reused if present, otherwise one is created with its variant chosen by
    /// the name prefix.
    ///
    /// On failure the channel object stays in the registry (see
    /// [`Client::channel`]) and a later call retries the subscription.
    pub async fn subscribe(&self, channel_name: &str) -> Result<Channel, PusherError> {
        self.subscribe_with(channel_name, SubscribeOptions::default())
            .await
    }

    pub async fn subscribe_with(
        &self,
        channel_name: &str,
        opts: SubscribeOptions,
    ) -> Result<Channel, PusherError> {
        let inner = Inner::ensure_channel(&self.inner, channel_name);
        inner.subscribe(&opts).await?;
        Ok(Channel { inner })
    }

    /// Subscribe to a presence channel. Fails with
    /// [`PusherError::InvalidChannelName`] unless the name carries the
    /// `presence-` prefix.
    pub async fn subscribe_presence(
        &self,
        channel_name: &str,
    ) -> Result<PresenceChannel, PusherError> {
        self.subscribe_presence_with(channel_name, SubscribeOptions::default())
            .await
    }

    pub async fn subscribe_presence_with(
        &self,
        channel_name: &str,
        opts: SubscribeOptions,
    ) -> Result<PresenceChannel, PusherError> {
        if !channel_name.starts_with("presence-") {
            return Err(PusherError::InvalidChannelName(channel_name.to_string()));
        }
        let channel = self.subscribe_with(channel_name, opts).await?;
        Ok(PresenceChannel::new(channel))
    }

    /// Remove the channel from the registry and tell the server. No-op when
    /// the channel is not registered.
    pub async fn unsubscribe(&self, channel_name: &str) -> Result<(), PusherError> {
        self.inner.unsubscribe(channel_name).await
    }

    /// The registered channel with this name, if any.
    pub fn channel(&self, channel_name: &str) -> Option<Channel> {
        self.inner
            .channels
            .read()
            .get(channel_name)
            .cloned()
            .map(|inner| Channel { inner })
    }

    /// Allocate a sink receiving every matching event on the connection,
    /// regardless of channel.
    pub fn bind(&self, event: &str) -> EventBinding {
        let id = self.inner.next_binding.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(BINDING_BUFFER);
        self.inner
            .bindings
            .write()
            .entry(event.to_string())
            .or_default()
            .insert(id, tx);
        Binding::new(id, rx)
    }

    /// Remove the named bindings for an event, or every binding for the event
    /// when `bindings` is empty.
    pub fn unbind(&self, event: &str, bindings: &[BindingId]) {
        let mut all = self.inner.bindings.write();
        if bindings.is_empty() {
            all.remove(event);
            return;
        }
        if let Some(sinks) = all.get_mut(event) {
            for binding in bindings {
                sinks.remove(&binding.0);
            }
        }
    }

    /// Send one event on the connection and reset the activity timer.
    pub async fn send_event(
        &self,
        event: &str,
        data: impl Serialize,
        channel: Option<&str>,
    ) -> Result<(), PusherError> {
        self.inner.send_event(event, data, channel).await
    }
}

impl Inner {
    fn connection_url(&self) -> Result<Url, PusherError> {
        let (scheme, default_port) = if self.config.insecure {
            ("ws", 80u16)
        } else {
            ("wss", 443u16)
        };
        let port = self.config.override_port.unwrap_or(default_port);
        let host = match (&self.config.override_host, &self.config.cluster) {
            (Some(host), _) => host.clone(),
            (None, Some(cluster)) => format!("ws-{cluster}.pusher.com"),
            (None, None) => DEFAULT_HOST.to_string(),
        };
        let app_key = self.state.read().app_key.clone();
        Url::parse(&format!(
            "{scheme}://{host}:{port}/app/{app_key}?protocol={PROTOCOL_VERSION}"
        ))
        .map_err(PusherError::from)
    }

    /// Dial, run the handshake, install the session, start its tasks, and
    /// restore any registered subscriptions.
    /// Boxed entry point for `establish`, used where it is reached through
    /// the heartbeat/dispatch -> reconnect -> establish cycle: without an
    /// explicit boxed, `Send`-annotated indirection point, rustc's
    /// auto-trait inference cannot resolve `Send` across the cycle.
    fn establish_boxed(
        self: Arc<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PusherError>> + Send>> {
        Box::pin(self.establish())
    }

    async fn establish(self: Arc<Self>) -> Result<(), PusherError> {
        let url = self.connection_url()?;
        info!(url = %url, "connecting");
        let (conn, mut stream) = connection::dial(url.as_str()).await?;

        let first = read_handshake_event(&mut stream).await?;
        match first.event.as_str() {
            protocol::ERROR => Err(decode_event_error(&first.data)),
            protocol::CONNECTION_ESTABLISHED => {
                let info: ConnectionInfo = from_data_string(&first.data)?;
                let activity_timeout = info
                    .activity_timeout
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_ACTIVITY_TIMEOUT);

                let cancel = CancellationToken::new();
                // One-slot channels: resets coalesce, pong signals never
                // block the reader.
                let (reset_tx, reset_rx) = mpsc::channel(1);
                let (pong_tx, pong_rx) = mpsc::channel(1);
                let conn = Arc::new(conn);

                {
                    let mut st = self.state.write();
                    st.connected = true;
                    st.socket_id = Some(info.socket_id.clone());
                    st.activity_timeout = activity_timeout;
                    st.reconnect_delay = self.config.initial_reconnect_delay;
                    st.pong_failures = 0;
                    st.connection = Some(conn);
                    st.cancel = cancel.clone();
                    st.reset_tx = Some(reset_tx);
                    st.pong_tx = Some(pong_tx);
                }
                info!(socket_id = %info.socket_id, ?activity_timeout, "connection established");

                let channels: Vec<Arc<ChannelInner>> =
                    self.channels.read().values().cloned().collect();
                for channel in &channels {
                    channel.reset_subscription_state();
                }

                tokio::spawn(heartbeat(
                    self.clone(),
                    cancel.clone(),
                    reset_rx,
                    pong_rx,
                    activity_timeout,
                ));
                tokio::spawn(dispatch(self.clone(), stream, cancel));

                for channel in channels {
                    if let Err(err) = channel.subscribe(&SubscribeOptions::default()).await {
                        warn!(channel = %channel.name(), %err, "failed to restore subscription");
                        self.send_error(err);
                    }
                }

                Ok(())
            }
            other => Err(PusherError::Protocol(format!(
                "unexpected event during handshake: {other}"
            ))),
        }
    }

    pub(crate) async fn disconnect(&self) -> Result<(), PusherError> {
        self.closed.store(true, Ordering::SeqCst);
        let conn = {
            let mut st = self.state.write();
            if !st.connected {
                return Ok(());
            }
            st.cancel.cancel();
            st.connected = false;
            st.connection.take()
        };
        if let Some(conn) = conn {
            conn.close().await?;
        }
        info!("disconnected");
        Ok(())
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    /// Deliver an asynchronous error to the configured sink, dropping it when
    /// no consumer is ready.
    pub(crate) fn send_error(&self, err: PusherError) {
        if let Some(sink) = &self.error_sink {
            let _ = sink.try_send(err);
        }
    }

    /// Ask the heartbeat to restart the idle wait. Coalesces: a pending
    /// request absorbs later ones, so the inbound hot path never blocks.
    fn request_activity_reset(&self) {
        if let Some(tx) = self.state.read().reset_tx.as_ref() {
            let _ = tx.try_send(());
        }
    }

    fn signal_pong(&self) {
        if let Some(tx) = self.state.read().pong_tx.as_ref() {
            let _ = tx.try_send(());
        }
    }

    fn current_connection(&self) -> Result<Arc<Connection>, PusherError> {
        self.state
            .read()
            .connection
            .clone()
            .ok_or(PusherError::NotConnected)
    }

    pub(crate) async fn send_event(
        &self,
        event: &str,
        data: impl Serialize,
        channel: Option<&str>,
    ) -> Result<(), PusherError> {
        let frame = Event::new(
            event,
            serde_json::to_value(data)?,
            channel.map(str::to_string),
        );
        let conn = self.current_connection()?;
        self.request_activity_reset();
        conn.send(frame.to_message()?).await
    }

    async fn send_frame(&self, frame: Event) -> Result<(), PusherError> {
        let conn = self.current_connection()?;
        conn.send(frame.to_message()?).await
    }

    async fn send_raw(&self, message: Message) -> Result<(), PusherError> {
        let conn = self.current_connection()?;
        conn.send(message).await
    }

    pub(crate) fn ensure_channel(this: &Arc<Self>, name: &str) -> Arc<ChannelInner> {
        if let Some(channel) = this.channels.read().get(name) {
            return channel.clone();
        }
        let mut channels = this.channels.write();
        channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ChannelInner::new(name, Arc::downgrade(this))))
            .clone()
    }

    pub(crate) async fn unsubscribe(&self, name: &str) -> Result<(), PusherError> {
        let removed = self.channels.write().remove(name);
        let Some(channel) = removed else {
            return Ok(());
        };
        channel.mark_unsubscribed();
        debug!(channel = name, "unsubscribing");
        self.send_event(
            protocol::UNSUBSCRIBE,
            UnsubscribeData {
                channel: name.to_string(),
            },
            None,
        )
        .await
    }

    /// Obtain the auth payload for a private or presence channel, either by
    /// signing locally with the app secret or by POSTing to the configured
    /// auth endpoint.
    pub(crate) async fn authorize(
        &self,
        channel: &str,
        user_data: Option<&serde_json::Value>,
    ) -> Result<AuthResponse, PusherError> {
        let socket_id = self
            .state
            .read()
            .socket_id
            .clone()
            .ok_or(PusherError::NotConnected)?;
        let channel_data = user_data.map(serde_json::to_string).transpose()?;

        if let Some(secret) = &self.config.app_secret {
            let app_key = self.state.read().app_key.clone();
            return sign_auth(&app_key, secret, &socket_id, channel, channel_data);
        }

        let auth_url = self
            .config
            .auth_url
            .as_deref()
            .ok_or_else(|| PusherError::Auth("no auth endpoint configured".to_string()))?;

        let mut form = self.config.auth_params.clone();
        form.insert("socket_id".to_string(), socket_id);
        form.insert("channel_name".to_string(), channel.to_string());
        if let Some(data) = &channel_data {
            form.insert("channel_data".to_string(), data.clone());
        }

        let response = self
            .http
            .post(auth_url)
            .headers(self.config.auth_headers.clone())
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PusherError::Auth(format!(
                "auth endpoint returned {status}"
            )));
        }
        let mut auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| PusherError::Auth(format!("malformed auth response: {e}")))?;
        if auth.channel_data.is_none() {
            auth.channel_data = channel_data;
        }
        Ok(auth)
    }

    /// Tear the session down and retry the handshake with exponential
    /// backoff until it succeeds or the client is disconnected. The first
    /// caller wins; concurrent triggers return immediately.
    async fn attempt_reconnect(self: Arc<Self>) {
        let conn = {
            let mut st = self.state.write();
            if !st.connected {
                return;
            }
            st.cancel.cancel();
            st.connected = false;
            st.connection.take()
        };
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }

        loop {
            if self.closed.load(Ordering::SeqCst) {
                debug!("reconnection abandoned, client disconnected");
                return;
            }
            let delay = {
                let mut st = self.state.write();
                let delay = st.reconnect_delay;
                st.reconnect_delay = (delay * 2).min(self.config.max_reconnect_delay);
                delay
            };
            warn!(?delay, "attempting reconnection");
            self.send_error(PusherError::Reconnecting(delay));
            time::sleep(delay).await;
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            match self.clone().establish_boxed().await {
                Ok(()) => {
                    info!("reconnection successful");
                    self.send_error(PusherError::Reconnected);
                    return;
                }
                Err(err) => {
                    warn!(%err, "reconnection failed");
                    self.send_error(PusherError::ReconnectFailed(Box::new(err)));
                }
            }
        }
    }

    /// Route one decoded inbound event.
    async fn route(&self, event: Event) {
        match event.event.as_str() {
            protocol::PING => {
                if let Err(err) = self.send_frame(Event::pong()).await {
                    warn!(%err, "failed to answer ping");
                }
            }
            protocol::PONG => self.signal_pong(),
            protocol::ERROR => {
                let err = decode_event_error(&event.data);
                error!(%err, "server error");
                self.send_error(err);
            }
            _ => {
                let sinks: Vec<mpsc::Sender<Event>> = {
                    let bindings = self.bindings.read();
                    bindings
                        .get(&event.event)
                        .map(|sinks| sinks.values().cloned().collect())
                        .unwrap_or_default()
                };
                for tx in sinks {
                    deliver(tx, event.clone());
                }
                if let Some(name) = &event.channel {
                    let channel = self.channels.read().get(name).cloned();
                    if let Some(channel) = channel {
                        channel.handle_event(&event.event, &event.data);
                    }
                }
            }
        }
    }
}

async fn read_handshake_event(stream: &mut ReadHalf) -> Result<Event, PusherError> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => return Event::from_json(text.as_str()),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(PusherError::Protocol(
        "connection closed during handshake".to_string(),
    ))
}

fn decode_event_error(data: &serde_json::Value) -> PusherError {
    let parsed = match data {
        serde_json::Value::String(text) => serde_json::from_str::<EventError>(text),
        other => serde_json::from_value(other.clone()),
    };
    match parsed {
        Ok(err) => PusherError::Event(err),
        Err(err) => PusherError::Protocol(format!("malformed pusher:error payload: {err}")),
    }
}

fn sign_auth(
    app_key: &str,
    secret: &str,
    socket_id: &str,
    channel: &str,
    channel_data: Option<String>,
) -> Result<AuthResponse, PusherError> {
    let to_sign = match &channel_data {
        Some(data) => format!("{socket_id}:{channel}:{data}"),
        None => format!("{socket_id}:{channel}"),
    };
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| PusherError::Auth("invalid app secret".to_string()))?;
    mac.update(to_sign.as_bytes());
    let signature = mac.finalize().into_bytes();
    Ok(AuthResponse {
        auth: format!("{app_key}:{}", hex::encode(signature)),
        channel_data,
    })
}

/// Heartbeat task: pings after `activity_timeout` of inbound silence, then
/// waits for the pong. Activity resets restart the idle wait; coalesced
/// through a one-slot channel so senders never block.
async fn heartbeat(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    mut reset_rx: mpsc::Receiver<()>,
    mut pong_rx: mpsc::Receiver<()>,
    activity_timeout: Duration,
) {
    let pong_timeout = inner.config.pong_timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            reset = reset_rx.recv() => {
                if reset.is_none() {
                    return;
                }
                trace!("activity timer reset");
            }
            _ = time::sleep(activity_timeout) => {
                // Drop any pong left over from a previous exchange.
                while pong_rx.try_recv().is_ok() {}
                if let Err(err) = inner.send_frame(Event::ping()).await {
                    warn!(%err, "heartbeat ping failed");
                    inner.send_error(err);
                    inner.clone().attempt_reconnect().await;
                    return;
                }
                debug!("ping sent, awaiting pong");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    pong = pong_rx.recv() => {
                        if pong.is_none() {
                            return;
                        }
                        trace!("pong received");
                        let mut st = inner.state.write();
                        st.pong_failures = 0;
                        st.reconnect_delay = inner.config.initial_reconnect_delay;
                    }
                    _ = time::sleep(pong_timeout) => {
                        let failures = {
                            let mut st = inner.state.write();
                            st.pong_failures += 1;
                            st.pong_failures
                        };
                        inner.send_error(PusherError::PongTimeout(failures));
                        if failures >= MAX_PONG_FAILURES {
                            warn!(failures, "max pong failures reached, reconnecting");
                            inner.clone().attempt_reconnect().await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Dispatcher task: the single reader for the active transport.
async fn dispatch(inner: Arc<Inner>, mut stream: ReadHalf, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    trace!(frame = %text.as_str(), "received");
                    let event = match Event::from_json(text.as_str()) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(%err, "dropping malformed frame");
                            inner.send_error(err);
                            continue;
                        }
                    };
                    inner.request_activity_reset();
                    inner.route(event).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = inner.send_raw(Message::Pong(payload)).await {
                        warn!(%err, "failed to answer websocket ping");
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    // Expected when the read races an explicit disconnect.
                    if !inner.is_connected() {
                        return;
                    }
                    error!(%err, "transport read failed");
                    inner.send_error(err.into());
                    inner.clone().attempt_reconnect().await;
                    return;
                }
                None => {
                    if !inner.is_connected() {
                        return;
                    }
                    info!("transport closed by server");
                    inner.send_error(PusherError::WebSocket(
                        tungstenite::Error::ConnectionClosed,
                    ));
                    inner.clone().attempt_reconnect().await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_app_key(builder: ClientBuilder, app_key: &str) -> Client {
        let client = builder.build();
        client.inner.state.write().app_key = app_key.to_string();
        client
    }

    #[test]
    fn connection_url_defaults_to_secure_host() {
        let client = client_with_app_key(Client::builder(), "foo");
        let url = client.inner.connection_url().unwrap();
        assert_eq!(url.as_str(), "wss://ws.pusherapp.com:443/app/foo?protocol=7");
    }

    #[test]
    fn connection_url_uses_cluster_and_insecure_port() {
        let client = client_with_app_key(Client::builder().with_cluster("eu").insecure(), "foo");
        let url = client.inner.connection_url().unwrap();
        assert_eq!(url.as_str(), "ws://ws-eu.pusher.com:80/app/foo?protocol=7");
    }

    #[test]
    fn connection_url_overrides_win() {
        let client = client_with_app_key(
            Client::builder()
                .with_cluster("eu")
                .insecure()
                .with_override_host("localhost")
                .with_override_port(1234),
            "foo",
        );
        let url = client.inner.connection_url().unwrap();
        assert_eq!(url.as_str(), "ws://localhost:1234/app/foo?protocol=7");
    }

    #[test]
    fn new_client_is_disconnected() {
        let client = Client::new();
        assert!(!client.is_connected());
        assert_eq!(client.socket_id(), None);
        assert_eq!(client.activity_timeout(), DEFAULT_ACTIVITY_TIMEOUT);
    }

    #[test]
    fn unbind_without_ids_removes_every_sink() {
        let client = Client::new();
        let _b1 = client.bind("foo");
        let _b2 = client.bind("foo");
        assert_eq!(client.inner.bindings.read()["foo"].len(), 2);

        client.unbind("foo", &[]);
        assert!(!client.inner.bindings.read().contains_key("foo"));
    }

    #[test]
    fn unbind_with_ids_leaves_the_rest() {
        let client = Client::new();
        let b1 = client.bind("foo");
        let b2 = client.bind("foo");
        let b3 = client.bind("foo");

        client.unbind("foo", &[b1.id(), b3.id()]);

        let bindings = client.inner.bindings.read();
        assert_eq!(bindings["foo"].len(), 1);
        assert!(bindings["foo"].contains_key(&b2.id().0));
    }

    #[tokio::test]
    async fn activity_resets_coalesce_without_blocking() {
        let client = Client::new();
        let (tx, mut rx) = mpsc::channel(1);
        client.inner.state.write().reset_tx = Some(tx);

        // Back-to-back requests must never block the caller; extras collapse
        // into the single pending slot.
        client.inner.request_activity_reset();
        client.inner.request_activity_reset();
        client.inner.request_activity_reset();

        assert_eq!(rx.try_recv().ok(), Some(()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_sink_delivery_is_nonblocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let client = Client::builder().with_error_sink(tx).build();

        client.inner.send_error(PusherError::NotConnected);
        // Sink full: dropped instead of blocking.
        client.inner.send_error(PusherError::Reconnected);

        assert!(matches!(rx.try_recv(), Ok(PusherError::NotConnected)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_event_without_connection_fails() {
        let client = Client::new();
        let err = client
            .send_event("foo", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PusherError::NotConnected));
    }

    #[tokio::test]
    async fn subscribe_presence_rejects_wrong_prefix() {
        let client = Client::new();
        let err = client.subscribe_presence("foo").await.unwrap_err();
        assert!(matches!(err, PusherError::InvalidChannelName(_)));
        // Nothing registered for the rejected name.
        assert!(client.channel("foo").is_none());
    }

    #[test]
    fn sign_auth_formats_key_and_hex_signature() {
        let auth = sign_auth("key", "secret", "123.456", "private-foo", None).unwrap();
        let (key, signature) = auth.auth.split_once(':').unwrap();
        assert_eq!(key, "key");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(auth.channel_data, None);

        // Same input signs identically, channel data changes the signature.
        let again = sign_auth("key", "secret", "123.456", "private-foo", None).unwrap();
        assert_eq!(auth.auth, again.auth);
        let with_data = sign_auth(
            "key",
            "secret",
            "123.456",
            "presence-foo",
            Some(r#"{"user_id":"1"}"#.to_string()),
        )
        .unwrap();
        assert_ne!(auth.auth, with_data.auth);
    }

    #[test]
    fn decode_event_error_accepts_object_and_string_payloads() {
        let object = serde_json::json!({"code": 4001, "message": "bad key"});
        let expected = EventError {
            code: 4001,
            message: "bad key".to_string(),
        };
        match decode_event_error(&object) {
            PusherError::Event(err) => assert_eq!(err, expected),
            other => panic!("unexpected error: {other}"),
        }

        let string = serde_json::Value::String(object.to_string());
        match decode_event_error(&string) {
            PusherError::Event(err) => assert_eq!(err, expected),
            other => panic!("unexpected error: {other}"),
        }
    }
}
