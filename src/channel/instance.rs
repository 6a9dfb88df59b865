use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::channel::descriptor::{ChannelBehavior, ChannelKind, Performed};
use crate::channel::{Channel, ChannelContext};
use crate::transport::message::ClientCommand;
use crate::worker_pool::{TimerHandle, guarded};

/// Lifecycle of a [`ChannelInstance`]. `Unsubscribed` is terminal: an
/// instance is never resubscribed; a new subscribe builds a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Subscribed,
    Unsubscribed,
}

/// Whether a subscription attempt went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscribeOutcome {
    Subscribed,
    Rejected,
}

pub type SharedChannel = Arc<Mutex<ChannelInstance>>;

/// One subscription of one connection to one channel.
pub struct ChannelInstance {
    kind: String,
    behavior: Box<dyn ChannelBehavior>,
    ctx: ChannelContext,
    state: ChannelState,
    timers: Vec<TimerHandle>,
}

impl ChannelInstance {
    pub(crate) fn new(kind: &Arc<dyn ChannelKind>, ctx: ChannelContext) -> Self {
        Self {
            kind: kind.name().to_string(),
            behavior: kind.build(&ctx),
            ctx,
            state: ChannelState::Pending,
            timers: Vec::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        self.ctx.identifier()
    }

    /// Registered name of the channel type.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn context(&self) -> &ChannelContext {
        &self.ctx
    }

    /// The concrete channel object, if it is a `C`.
    pub fn channel<C: Channel>(&self) -> Option<&C> {
        self.behavior.as_any().downcast_ref::<C>()
    }

    /// Authorizes and runs the subscribe hooks. Timers start and the
    /// confirmation is released only when the subscription sticks.
    ///
    /// A hook that fails, rejects or panics leaves nothing behind: streams it
    /// opened are released before this returns.
    pub(crate) fn subscribe(shared: &SharedChannel) -> SubscribeOutcome {
        let mut guard = shared.lock();
        let this = &mut *guard;

        if !this.check_authorized() {
            info!(identifier = %this.ctx.identifier(), "subscription not authorized");
            this.teardown();
            return SubscribeOutcome::Rejected;
        }

        match guarded("channel.subscribe", || this.behavior.subscribe(&mut this.ctx)) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!(identifier = %this.ctx.identifier(), error = %e, "subscribe hook failed");
                this.teardown();
                return SubscribeOutcome::Rejected;
            }
            None => {
                this.teardown();
                return SubscribeOutcome::Rejected;
            }
        }
        if this.ctx.is_rejected() {
            info!(identifier = %this.ctx.identifier(), "subscription rejected by channel");
            this.teardown();
            return SubscribeOutcome::Rejected;
        }

        this.state = ChannelState::Subscribed;
        for (index, interval) in this.behavior.timer_intervals().into_iter().enumerate() {
            let weak = Arc::downgrade(shared);
            let timer = this.ctx.worker_pool().every("channel.timer", interval, move || {
                if let Some(instance) = weak.upgrade() {
                    instance.lock().tick(index);
                }
            });
            this.timers.extend(timer);
        }
        this.ctx.confirmation().arm();
        debug!(identifier = %this.ctx.identifier(), "subscribed");
        SubscribeOutcome::Subscribed
    }

    /// Routes `data` from a `message` command to an action or `receive`.
    pub(crate) fn perform_action(&mut self, data: &Value) {
        if self.state != ChannelState::Subscribed {
            debug!(identifier = %self.ctx.identifier(), "ignoring action for inactive channel");
            return;
        }
        let data = match ClientCommand::data_object(data) {
            Ok(data) => data,
            Err(e) => {
                warn!(identifier = %self.ctx.identifier(), error = %e, "dropping undecodable action data");
                return;
            }
        };
        let action = data.get("action").and_then(Value::as_str);

        if !self.check_authorized() {
            let name = action.unwrap_or("receive");
            guarded("channel.unauthorized", || self.behavior.unauthorized(&self.ctx, name));
            return;
        }

        let performed = guarded("channel.action", || self.behavior.perform(&mut self.ctx, action, &data));
        match performed {
            None | Some(Ok(Performed::Action)) | Some(Ok(Performed::Received)) => {}
            Some(Ok(Performed::Unknown)) => warn!(
                identifier = %self.ctx.identifier(),
                action = action.unwrap_or("receive"),
                "unable to process action"
            ),
            Some(Err(e)) => error!(
                identifier = %self.ctx.identifier(),
                action = action.unwrap_or("receive"),
                error = %e,
                "action failed"
            ),
        }
    }

    /// Runs the unsubscribe hooks and releases streams and timers, even when
    /// a hook fails or panics. Calling it again is a no-op.
    pub(crate) fn unsubscribe(&mut self) {
        if self.state == ChannelState::Subscribed {
            let outcome = guarded("channel.unsubscribe", || self.behavior.unsubscribe(&mut self.ctx));
            if let Some(Err(e)) = outcome {
                error!(identifier = %self.ctx.identifier(), error = %e, "unsubscribe hook failed");
            }
        }
        self.teardown();
    }

    fn tick(&mut self, timer: usize) {
        if self.state != ChannelState::Subscribed {
            return;
        }
        if !self.check_authorized() {
            debug!(identifier = %self.ctx.identifier(), "skipping timer for unauthorized channel");
            return;
        }
        let outcome = guarded("channel.timer", || self.behavior.tick(&mut self.ctx, timer));
        if let Some(Err(e)) = outcome {
            error!(identifier = %self.ctx.identifier(), error = %e, "channel timer failed");
        }
    }

    /// Asks the channel again and records the answer for `transmit`. A panic
    /// counts as refusal.
    fn check_authorized(&mut self) -> bool {
        let authorized = guarded("channel.authorized", || self.behavior.authorized(&self.ctx)).unwrap_or(false);
        self.ctx.set_authorized(authorized);
        authorized
    }

    fn teardown(&mut self) {
        for timer in self.timers.drain(..) {
            timer.stop();
        }
        self.ctx.stop_all_streams();
        self.ctx.target().deactivate();
        self.state = ChannelState::Unsubscribed;
    }
}
