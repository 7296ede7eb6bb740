//! Matches component and modal interactions to the message that is waiting
//! for them.
//!
//! Registrations are keyed by `(channel id, message id)`. There are two
//! registries: single-shot waits resolve on the first accepted interaction,
//! multi-shot waits collect up to a count or until their budget runs out.
//! Each key holds at most one live registration per registry; registering
//! again replaces the old one, whose waiter resolves as cancelled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_models::interaction::{Interaction, InteractionResponse};
use cadence_models::Snowflake;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::responder::InteractionResponder;

pub type MessageKey = (Snowflake, Snowflake);

#[derive(Debug, Clone)]
pub struct CorrelatorSettings {
    /// Budget for waits that do not name their own.
    pub default_timeout: Duration,
    /// Text of the ephemeral reply sent to non-owners.
    pub not_authorized_message: String,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(120),
            not_authorized_message: "You are not the one who can use these interactions!"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InteractionKind {
    Button,
    SelectMenu,
    Modal,
    #[default]
    Any,
}

impl InteractionKind {
    pub fn matches(self, interaction: &Interaction) -> bool {
        match self {
            InteractionKind::Button => interaction.is_button(),
            InteractionKind::SelectMenu => interaction.is_select_menu(),
            InteractionKind::Modal => interaction.is_modal_submit(),
            InteractionKind::Any => {
                interaction.is_button()
                    || interaction.is_select_menu()
                    || interaction.is_modal_submit()
            }
        }
    }
}

/// What a registration waits for.
#[derive(Debug, Clone)]
pub struct Wait {
    pub channel_id: Snowflake,
    pub message_id: Snowflake,
    pub kind: InteractionKind,
    /// Only this user may satisfy the wait. Others get a "not authorized"
    /// reply and the wait continues.
    pub owner: Option<Snowflake>,
    pub timeout: Option<Duration>,
}

impl Wait {
    pub fn new(channel_id: Snowflake, message_id: Snowflake) -> Self {
        Self {
            channel_id,
            message_id,
            kind: InteractionKind::Any,
            owner: None,
            timeout: None,
        }
    }

    pub fn kind(mut self, kind: InteractionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn owned_by(mut self, owner: Snowflake) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn key(&self) -> MessageKey {
        (self.channel_id, self.message_id)
    }
}

/// Options for a multi-shot collection.
#[derive(Debug, Clone)]
pub struct Collect {
    pub wait: Wait,
    pub max_items: usize,
    /// Restart the budget after every accepted item.
    pub reset_on_item: bool,
    /// Answer every accepted item except the last with a deferred update.
    pub ack_intermediate: bool,
}

impl Collect {
    pub fn new(wait: Wait, max_items: usize) -> Self {
        Self {
            wait,
            max_items: max_items.max(1),
            reset_on_item: false,
            ack_intermediate: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Matched(Interaction),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum Collected {
    Filled(Vec<Interaction>),
    TimedOut(Vec<Interaction>),
    Cancelled(Vec<Interaction>),
}

impl Collected {
    pub fn items(&self) -> &[Interaction] {
        match self {
            Collected::Filled(items) | Collected::TimedOut(items) | Collected::Cancelled(items) => {
                items
            }
        }
    }

    pub fn into_items(self) -> Vec<Interaction> {
        match self {
            Collected::Filled(items) | Collected::TimedOut(items) | Collected::Cancelled(items) => {
                items
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Filter {
    kind: InteractionKind,
    owner: Option<Snowflake>,
}

enum Verdict {
    Ignore,
    NotAuthorized,
    Accept,
}

impl Filter {
    fn check(&self, interaction: &Interaction) -> Verdict {
        if !self.kind.matches(interaction) {
            return Verdict::Ignore;
        }
        match (self.owner, interaction.user_id) {
            (Some(owner), Some(actor)) if owner != actor => Verdict::NotAuthorized,
            (Some(_), None) => Verdict::NotAuthorized,
            _ => Verdict::Accept,
        }
    }
}

struct SingleSlot {
    id: u64,
    filter: Filter,
    done: oneshot::Sender<Interaction>,
}

struct MultiSlot {
    id: u64,
    filter: Filter,
    items: mpsc::UnboundedSender<Interaction>,
}

pub struct Correlator {
    single: DashMap<MessageKey, SingleSlot>,
    multi: DashMap<MessageKey, MultiSlot>,
    next_id: AtomicU64,
    responder: Arc<dyn InteractionResponder>,
    settings: CorrelatorSettings,
}

impl Correlator {
    pub fn new(settings: CorrelatorSettings, responder: Arc<dyn InteractionResponder>) -> Arc<Self> {
        Arc::new(Self {
            single: DashMap::new(),
            multi: DashMap::new(),
            next_id: AtomicU64::new(0),
            responder,
            settings,
        })
    }

    pub fn settings(&self) -> &CorrelatorSettings {
        &self.settings
    }

    pub fn is_waiting(&self, channel_id: Snowflake, message_id: Snowflake) -> bool {
        let key = (channel_id, message_id);
        self.single.contains_key(&key) || self.multi.contains_key(&key)
    }

    /// Wait for the first interaction on a message that passes the filter.
    ///
    /// Resolves [`Outcome::TimedOut`] at the deadline and
    /// [`Outcome::Cancelled`] if replaced or cancelled first. Dropping the
    /// future withdraws the registration.
    pub async fn wait(&self, wait: Wait) -> Outcome {
        let key = wait.key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let timeout = wait.timeout.unwrap_or(self.settings.default_timeout);
        let (tx, rx) = oneshot::channel();
        let slot = SingleSlot {
            id,
            filter: Filter {
                kind: wait.kind,
                owner: wait.owner,
            },
            done: tx,
        };
        // The replaced slot drops here, resolving its waiter.
        if self.single.insert(key, slot).is_some() {
            tracing::debug!(channel_id = %key.0, message_id = %key.1, "replaced pending wait");
        }
        let _guard = SlotGuard {
            correlator: self,
            key,
            id,
            multi: false,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(interaction)) => Outcome::Matched(interaction),
            Ok(Err(_)) => Outcome::Cancelled,
            Err(_) => {
                tracing::debug!(channel_id = %key.0, message_id = %key.1, ?timeout, "wait timed out");
                Outcome::TimedOut
            }
        }
    }

    /// Collect up to `max_items` interactions on a message.
    pub async fn collect(&self, collect: Collect) -> Collected {
        let key = collect.wait.key();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let budget = collect.wait.timeout.unwrap_or(self.settings.default_timeout);
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.multi.insert(
            key,
            MultiSlot {
                id,
                filter: Filter {
                    kind: collect.wait.kind,
                    owner: collect.wait.owner,
                },
                items: tx,
            },
        );
        let _guard = SlotGuard {
            correlator: self,
            key,
            id,
            multi: true,
        };

        let mut items = Vec::new();
        let mut deadline = Instant::now() + budget;
        loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some(interaction) = item else {
                        return Collected::Cancelled(items);
                    };
                    if items.len() + 1 >= collect.max_items {
                        items.push(interaction);
                        return Collected::Filled(items);
                    }
                    if collect.ack_intermediate {
                        self.responder.respond(
                            interaction.id,
                            &interaction.token,
                            InteractionResponse::deferred_update(),
                        );
                    }
                    items.push(interaction);
                    if collect.reset_on_item {
                        deadline = Instant::now() + budget;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(
                        channel_id = %key.0,
                        message_id = %key.1,
                        collected = items.len(),
                        "collection budget spent"
                    );
                    return Collected::TimedOut(items);
                }
            }
        }
    }

    /// Route one interaction. Returns true if a registration took it.
    pub fn on_interaction(&self, interaction: Interaction) -> bool {
        let (Some(channel_id), Some(message_id)) = (interaction.channel_id, interaction.message_id)
        else {
            return false;
        };
        let key = (channel_id, message_id);

        let single = self
            .single
            .get(&key)
            .map(|slot| (slot.id, slot.filter.check(&interaction)));
        if let Some((id, verdict)) = single {
            match verdict {
                Verdict::Accept => {
                    if let Some((_, slot)) = self.single.remove_if(&key, |_, slot| slot.id == id) {
                        if let Err(interaction) = slot.done.send(interaction) {
                            // Waiter went away between lookup and send.
                            return self.deliver_multi(key, interaction);
                        }
                        return true;
                    }
                }
                Verdict::NotAuthorized => {
                    self.reject(&interaction);
                    return false;
                }
                Verdict::Ignore => {}
            }
        }

        self.deliver_multi(key, interaction)
    }

    fn deliver_multi(&self, key: MessageKey, interaction: Interaction) -> bool {
        let verdict = self.multi.get(&key).map(|slot| match slot.filter.check(&interaction) {
            Verdict::Accept => Some(slot.items.send(interaction.clone()).is_ok()),
            Verdict::NotAuthorized => None,
            Verdict::Ignore => Some(false),
        });
        match verdict {
            Some(Some(taken)) => taken,
            Some(None) => {
                self.reject(&interaction);
                false
            }
            None => false,
        }
    }

    fn reject(&self, interaction: &Interaction) {
        tracing::debug!(
            interaction_id = %interaction.id,
            user_id = ?interaction.user_id,
            "interaction from non-owner"
        );
        self.responder.respond(
            interaction.id,
            &interaction.token,
            InteractionResponse::message(self.settings.not_authorized_message.clone(), true),
        );
    }

    /// Resolve every wait on a message as cancelled.
    pub fn cancel(&self, channel_id: Snowflake, message_id: Snowflake) {
        let key = (channel_id, message_id);
        self.single.remove(&key);
        self.multi.remove(&key);
    }

    pub fn cancel_all(&self) {
        self.single.clear();
        self.multi.clear();
    }

    fn withdraw(&self, key: MessageKey, id: u64, multi: bool) {
        if multi {
            self.multi.remove_if(&key, |_, slot| slot.id == id);
        } else {
            self.single.remove_if(&key, |_, slot| slot.id == id);
        }
    }
}

/// Removes its own registration on drop, never a newer one.
struct SlotGuard<'a> {
    correlator: &'a Correlator,
    key: MessageKey,
    id: u64,
    multi: bool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.correlator.withdraw(self.key, self.id, self.multi);
    }
}
