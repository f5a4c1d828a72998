//! Channel objects: subscription state, per-channel bindings, and the
//! presence member roster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binding::{deliver, Binding, BindingId, DataBinding, MemberBinding, BINDING_BUFFER};
use crate::client::Inner;
use crate::error::PusherError;
use crate::event::{from_data_string, protocol};
use crate::message::{Member, SubscribeData, SubscriptionSucceededData};

/// Channel variants, chosen by name prefix at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("private-") {
            ChannelKind::Private
        } else if name.starts_with("presence-") {
            ChannelKind::Presence
        } else {
            ChannelKind::Public
        }
    }

    pub fn requires_auth(self) -> bool {
        !matches!(self, ChannelKind::Public)
    }
}

/// Subscription lifecycle of a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    /// Waiting on the authorizer for a private or presence channel.
    Authorizing,
    /// Subscribe frame sent, awaiting server confirmation.
    Subscribing,
    Subscribed,
    /// Authorization or the subscribe send failed; retryable.
    Failed,
}

/// Options for subscribing to a channel.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Presence member entry (`{"user_id": ..., "user_info": ...}`) used to
    /// build `channel_data` when signing authorization locally with an app
    /// secret. Ignored for public channels.
    pub user_data: Option<Value>,
}

pub(crate) struct ChannelInner {
    name: String,
    kind: ChannelKind,
    client: Weak<Inner>,
    next_binding: AtomicU64,
    state: Mutex<ChannelState>,
}

#[derive(Default)]
struct ChannelState {
    subscription: SubscriptionState,
    bound: HashMap<String, HashMap<u64, mpsc::Sender<Value>>>,
    roster: HashMap<String, Value>,
    me: Option<Member>,
    member_added: HashMap<u64, mpsc::Sender<Member>>,
    member_removed: HashMap<u64, mpsc::Sender<Member>>,
    user_data: Option<Value>,
}

impl ChannelInner {
    pub(crate) fn new(name: &str, client: Weak<Inner>) -> Self {
        Self {
            name: name.to_string(),
            kind: ChannelKind::from_name(name),
            client,
            next_binding: AtomicU64::new(0),
            state: Mutex::new(ChannelState::default()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub(crate) fn subscription_state(&self) -> SubscriptionState {
        self.state.lock().subscription
    }

    fn set_subscription_state(&self, state: SubscriptionState) {
        self.state.lock().subscription = state;
    }

    /// Called when a new session starts so the subscription is re-issued from
    /// scratch on the fresh transport.
    pub(crate) fn reset_subscription_state(&self) {
        let mut st = self.state.lock();
        st.subscription = SubscriptionState::Unsubscribed;
        st.roster.clear();
    }

    pub(crate) fn mark_unsubscribed(&self) {
        let mut st = self.state.lock();
        st.subscription = SubscriptionState::Unsubscribed;
        st.roster.clear();
        st.me = None;
    }

    fn client(&self) -> Result<Arc<Inner>, PusherError> {
        self.client.upgrade().ok_or(PusherError::NotConnected)
    }

    /// Run the full subscribe flow: authorize when required, then send the
    /// subscribe frame. Safe to call again after a failure.
    pub(crate) async fn subscribe(&self, opts: &SubscribeOptions) -> Result<(), PusherError> {
        if self.subscription_state() == SubscriptionState::Subscribed {
            return Ok(());
        }
        let client = self.client()?;

        if let Some(user_data) = &opts.user_data {
            self.state.lock().user_data = Some(user_data.clone());
        }

        let mut payload = SubscribeData {
            channel: self.name.clone(),
            auth: None,
            channel_data: None,
        };

        if self.kind.requires_auth() {
            self.set_subscription_state(SubscriptionState::Authorizing);
            let user_data = self.state.lock().user_data.clone();
            let auth = match client.authorize(&self.name, user_data.as_ref()).await {
                Ok(auth) => auth,
                Err(err) => {
                    self.set_subscription_state(SubscriptionState::Failed);
                    return Err(err);
                }
            };
            if self.kind == ChannelKind::Presence {
                let Some(channel_data) = auth.channel_data else {
                    self.set_subscription_state(SubscriptionState::Failed);
                    return Err(PusherError::Auth(format!(
                        "auth response for {} is missing channel_data",
                        self.name
                    )));
                };
                if let Ok(me) = serde_json::from_str::<Member>(&channel_data) {
                    self.state.lock().me = Some(me);
                }
                payload.channel_data = Some(channel_data);
            }
            payload.auth = Some(auth.auth);
        }

        self.set_subscription_state(SubscriptionState::Subscribing);
        debug!(channel = %self.name, "subscribing");
        match client.send_event(protocol::SUBSCRIBE, payload, None).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_subscription_state(SubscriptionState::Failed);
                Err(err)
            }
        }
    }

    /// Route one inbound frame scoped to this channel. Invoked by the
    /// dispatcher in receive order.
    pub(crate) fn handle_event(&self, event: &str, data: &Value) {
        match event {
            protocol::INTERNAL_SUBSCRIPTION_SUCCEEDED => {
                if self.kind == ChannelKind::Presence {
                    match from_data_string::<SubscriptionSucceededData>(data) {
                        Ok(payload) => {
                            if let Some(presence) = payload.presence {
                                let mut st = self.state.lock();
                                st.roster = presence.hash;
                                debug!(
                                    channel = %self.name,
                                    count = presence.count,
                                    "presence roster initialized"
                                );
                            }
                        }
                        Err(err) => {
                            warn!(channel = %self.name, %err, "bad presence roster payload")
                        }
                    }
                }
                self.set_subscription_state(SubscriptionState::Subscribed);
                info!(channel = %self.name, "subscribed");
                // Callers bind the public event name, not the internal one.
                self.deliver_data(protocol::SUBSCRIPTION_SUCCEEDED, data);
            }
            protocol::INTERNAL_MEMBER_ADDED => match from_data_string::<Member>(data) {
                Ok(member) => {
                    let sinks: Vec<_> = {
                        let mut st = self.state.lock();
                        st.roster.insert(member.id.clone(), member.info.clone());
                        st.member_added.values().cloned().collect()
                    };
                    debug!(channel = %self.name, member = %member.id, "member added");
                    for tx in sinks {
                        deliver(tx, member.clone());
                    }
                }
                Err(err) => warn!(channel = %self.name, %err, "bad member_added payload"),
            },
            protocol::INTERNAL_MEMBER_REMOVED => match from_data_string::<Member>(data) {
                Ok(member) => {
                    let removed = {
                        let mut st = self.state.lock();
                        match st.roster.remove(&member.id) {
                            Some(info) => {
                                let sinks: Vec<_> = st.member_removed.values().cloned().collect();
                                Some((
                                    Member {
                                        id: member.id.clone(),
                                        info,
                                    },
                                    sinks,
                                ))
                            }
                            None => None,
                        }
                    };
                    // Removal of an unknown id leaves the roster untouched.
                    if let Some((member, sinks)) = removed {
                        debug!(channel = %self.name, member = %member.id, "member removed");
                        for tx in sinks {
                            deliver(tx, member.clone());
                        }
                    }
                }
                Err(err) => warn!(channel = %self.name, %err, "bad member_removed payload"),
            },
            _ => self.deliver_data(event, data),
        }
    }

    fn deliver_data(&self, event: &str, data: &Value) {
        let sinks: Vec<mpsc::Sender<Value>> = {
            let st = self.state.lock();
            st.bound
                .get(event)
                .map(|sinks| sinks.values().cloned().collect())
                .unwrap_or_default()
        };
        for tx in sinks {
            deliver(tx, data.clone());
        }
    }

    pub(crate) fn bind(&self, event: &str) -> DataBinding {
        let id = self.next_binding.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(BINDING_BUFFER);
        self.state
            .lock()
            .bound
            .entry(event.to_string())
            .or_default()
            .insert(id, tx);
        Binding::new(id, rx)
    }

    pub(crate) fn unbind(&self, event: &str, bindings: &[BindingId]) {
        let mut st = self.state.lock();
        if bindings.is_empty() {
            st.bound.remove(event);
            return;
        }
        if let Some(sinks) = st.bound.get_mut(event) {
            for binding in bindings {
                sinks.remove(&binding.0);
            }
        }
    }

    fn bind_members(&self, removed: bool) -> MemberBinding {
        let id = self.next_binding.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(BINDING_BUFFER);
        let mut st = self.state.lock();
        if removed {
            st.member_removed.insert(id, tx);
        } else {
            st.member_added.insert(id, tx);
        }
        Binding::new(id, rx)
    }

    fn members(&self) -> Vec<Member> {
        self.state
            .lock()
            .roster
            .iter()
            .map(|(id, info)| Member {
                id: id.clone(),
                info: info.clone(),
            })
            .collect()
    }

    fn member_count(&self) -> usize {
        self.state.lock().roster.len()
    }

    fn me(&self) -> Option<Member> {
        self.state.lock().me.clone()
    }
}

/// Handle to a channel in the registry. Cheap to clone; the channel itself
/// lives in the client and survives reconnects until unsubscribed.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("subscription_state", &self.subscription_state())
            .finish()
    }
}

impl Channel {
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.kind()
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.inner.subscription_state()
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.subscription_state() == SubscriptionState::Subscribed
    }

    /// Retry the subscription, e.g. after an authorization failure.
    pub async fn subscribe(&self) -> Result<(), PusherError> {
        self.inner.subscribe(&SubscribeOptions::default()).await
    }

    /// Remove the channel from the registry and tell the server.
    pub async fn unsubscribe(&self) -> Result<(), PusherError> {
        let client = self.inner.client()?;
        client.unsubscribe(self.name()).await
    }

    /// Allocate a sink receiving the `data` of every matching event on this
    /// channel.
    pub fn bind(&self, event: &str) -> DataBinding {
        self.inner.bind(event)
    }

    /// Remove the named bindings for an event, or every binding for the event
    /// when `bindings` is empty.
    pub fn unbind(&self, event: &str, bindings: &[BindingId]) {
        self.inner.unbind(event, bindings)
    }

    /// Send a client event on this channel. Event names are namespaced with
    /// `client-` on the wire; the prefix is added when missing.
    pub async fn trigger(&self, event: &str, data: impl Serialize) -> Result<(), PusherError> {
        let client = self.inner.client()?;
        let name = if event.starts_with("client-") {
            event.to_string()
        } else {
            format!("client-{event}")
        };
        client.send_event(&name, data, Some(self.name())).await
    }
}

/// Handle to a presence channel: a [`Channel`] plus the member roster.
#[derive(Clone, Debug)]
pub struct PresenceChannel {
    channel: Channel,
}

impl PresenceChannel {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn is_subscribed(&self) -> bool {
        self.channel.is_subscribed()
    }

    /// Snapshot of the current member roster.
    pub fn members(&self) -> Vec<Member> {
        self.channel.inner.members()
    }

    pub fn member_count(&self) -> usize {
        self.channel.inner.member_count()
    }

    /// The member this connection authenticated as, from the auth
    /// `channel_data`.
    pub fn me(&self) -> Option<Member> {
        self.channel.inner.me()
    }

    pub fn bind_member_added(&self) -> MemberBinding {
        self.channel.inner.bind_members(false)
    }

    pub fn bind_member_removed(&self) -> MemberBinding {
        self.channel.inner.bind_members(true)
    }

    pub fn bind(&self, event: &str) -> DataBinding {
        self.channel.bind(event)
    }

    pub fn unbind(&self, event: &str, bindings: &[BindingId]) {
        self.channel.unbind(event, bindings)
    }

    pub async fn subscribe(&self) -> Result<(), PusherError> {
        self.channel.subscribe().await
    }

    pub async fn unsubscribe(&self) -> Result<(), PusherError> {
        self.channel.unsubscribe().await
    }

    pub async fn trigger(&self, event: &str, data: impl Serialize) -> Result<(), PusherError> {
        self.channel.trigger(event, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detached_channel(name: &str) -> ChannelInner {
        ChannelInner::new(name, Weak::new())
    }

    fn double_encode(value: &Value) -> Value {
        Value::String(value.to_string())
    }

    #[test]
    fn kind_follows_name_prefix() {
        assert_eq!(ChannelKind::from_name("foo"), ChannelKind::Public);
        assert_eq!(ChannelKind::from_name("private-foo"), ChannelKind::Private);
        assert_eq!(
            ChannelKind::from_name("presence-foo"),
            ChannelKind::Presence
        );
        assert!(!ChannelKind::Public.requires_auth());
        assert!(ChannelKind::Private.requires_auth());
        assert!(ChannelKind::Presence.requires_auth());
    }

    #[tokio::test]
    async fn subscription_succeeded_marks_subscribed_and_notifies() {
        let ch = detached_channel("foo");
        let mut binding = ch.bind("pusher:subscription_succeeded");
        assert_eq!(ch.subscription_state(), SubscriptionState::Unsubscribed);

        ch.handle_event(
            protocol::INTERNAL_SUBSCRIPTION_SUCCEEDED,
            &Value::String("{}".into()),
        );

        assert_eq!(ch.subscription_state(), SubscriptionState::Subscribed);
        assert_eq!(binding.recv().await, Some(Value::String("{}".into())));
    }

    #[tokio::test]
    async fn data_events_reach_bound_sinks_only() {
        let ch = detached_channel("foo");
        let mut bound = ch.bind("price-update");
        let mut other = ch.bind("other-event");

        ch.handle_event("price-update", &json!({"price": 42}));

        assert_eq!(bound.recv().await, Some(json!({"price": 42})));
        assert_eq!(other.try_recv(), None);
    }

    #[test]
    fn unbind_removes_named_or_all_sinks() {
        let ch = detached_channel("foo");
        let b1 = ch.bind("e");
        let _b2 = ch.bind("e");
        let b3 = ch.bind("e");

        ch.unbind("e", &[b1.id(), b3.id()]);
        assert_eq!(ch.state.lock().bound["e"].len(), 1);

        ch.unbind("e", &[]);
        assert!(!ch.state.lock().bound.contains_key("e"));
    }

    #[test]
    fn presence_roster_initialized_from_subscription_succeeded() {
        let ch = detached_channel("presence-foo");
        let data = double_encode(&json!({
            "presence": {
                "ids": ["1", "2"],
                "hash": {"1": {"name": "name-1"}, "2": {"name": "name-2"}},
                "count": 2
            }
        }));
        ch.handle_event(protocol::INTERNAL_SUBSCRIPTION_SUCCEEDED, &data);

        assert_eq!(ch.member_count(), 2);
        let mut members = ch.members();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(members[0].id, "1");
        assert_eq!(members[0].info, json!({"name": "name-1"}));
        assert_eq!(members[1].id, "2");
    }

    #[tokio::test]
    async fn member_added_and_removed_update_roster() {
        let ch = detached_channel("presence-foo");
        let mut added = ch.bind_members(false);
        let mut removed = ch.bind_members(true);

        ch.handle_event(
            protocol::INTERNAL_MEMBER_ADDED,
            &double_encode(&json!({"user_id": "9", "user_info": {"name": "nine"}})),
        );
        assert_eq!(ch.member_count(), 1);
        let member = added.recv().await.unwrap();
        assert_eq!(member.id, "9");
        assert_eq!(member.info, json!({"name": "nine"}));

        ch.handle_event(
            protocol::INTERNAL_MEMBER_REMOVED,
            &double_encode(&json!({"user_id": "9"})),
        );
        assert_eq!(ch.member_count(), 0);
        let member = removed.recv().await.unwrap();
        assert_eq!(member.id, "9");
        assert_eq!(member.info, json!({"name": "nine"}));
    }

    #[tokio::test]
    async fn removing_unknown_member_is_ignored() {
        let ch = detached_channel("presence-foo");
        let mut removed = ch.bind_members(true);

        ch.handle_event(
            protocol::INTERNAL_MEMBER_REMOVED,
            &double_encode(&json!({"user_id": "ghost"})),
        );

        assert_eq!(ch.member_count(), 0);
        assert!(removed.try_recv().is_none());
    }

    #[test]
    fn reset_clears_subscription_and_roster_for_restore() {
        let ch = detached_channel("presence-foo");
        ch.handle_event(
            protocol::INTERNAL_SUBSCRIPTION_SUCCEEDED,
            &double_encode(&json!({
                "presence": {"ids": ["1"], "hash": {"1": {}}, "count": 1}
            })),
        );
        assert_eq!(ch.subscription_state(), SubscriptionState::Subscribed);

        ch.reset_subscription_state();
        assert_eq!(ch.subscription_state(), SubscriptionState::Unsubscribed);
        assert_eq!(ch.member_count(), 0);
    }
}
