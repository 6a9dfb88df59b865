use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelContext};
use crate::utils::error::ChannelError;

type Factory<C> = Arc<dyn Fn(&ChannelContext) -> C + Send + Sync>;

/// A client-callable action: receives the decoded `data` object.
pub type ActionFn<C> =
    Arc<dyn Fn(&mut C, &mut ChannelContext, &Value) -> Result<(), ChannelError> + Send + Sync>;

/// A subscribe/unsubscribe hook or timer callback.
pub type HookFn<C> = Arc<dyn Fn(&mut C, &mut ChannelContext) -> Result<(), ChannelError> + Send + Sync>;

/// Static description of a channel type.
///
/// ```ignore
/// ChannelDescriptor::new("ChatChannel", |_| ChatChannel::default())
///     .on_subscribe(|_, ctx| {
///         ctx.stream_from("chat");
///         Ok(())
///     })
///     .action("speak", |_, ctx, data| {
///         ctx.broadcast("chat", data)?;
///         Ok(())
///     })
/// ```
pub struct ChannelDescriptor<C> {
    name: String,
    factory: Factory<C>,
    actions: HashMap<String, ActionFn<C>>,
    receive: Option<ActionFn<C>>,
    on_subscribe: Vec<HookFn<C>>,
    on_unsubscribe: Vec<HookFn<C>>,
    timers: Vec<(Duration, HookFn<C>)>,
}

impl<C: Channel> ChannelDescriptor<C> {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ChannelContext) -> C + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            actions: HashMap::new(),
            receive: None,
            on_subscribe: Vec::new(),
            on_unsubscribe: Vec::new(),
            timers: Vec::new(),
        }
    }

    pub fn with_default(name: impl Into<String>) -> Self
    where
        C: Default,
    {
        Self::new(name, |_| C::default())
    }

    pub fn action<F>(mut self, name: impl Into<String>, action: F) -> Self
    where
        F: Fn(&mut C, &mut ChannelContext, &Value) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(action));
        self
    }

    /// Fallback for `message` commands without an `action` key.
    pub fn receive<F>(mut self, receive: F) -> Self
    where
        F: Fn(&mut C, &mut ChannelContext, &Value) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        self.receive = Some(Arc::new(receive));
        self
    }

    pub fn on_subscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C, &mut ChannelContext) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        self.on_subscribe.push(Arc::new(hook));
        self
    }

    pub fn on_unsubscribe<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut C, &mut ChannelContext) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        self.on_unsubscribe.push(Arc::new(hook));
        self
    }

    /// Runs `tick` every `interval` while the subscription is live. A zero
    /// interval is ignored.
    pub fn every<F>(mut self, interval: Duration, tick: F) -> Self
    where
        F: Fn(&mut C, &mut ChannelContext) -> Result<(), ChannelError> + Send + Sync + 'static,
    {
        if interval.is_zero() {
            warn!(channel = %self.name, "ignoring periodic timer with a zero interval");
            return self;
        }
        self.timers.push((interval, Arc::new(tick)));
        self
    }

    /// Intervals of the declared periodic timers.
    pub fn timer_intervals(&self) -> Vec<Duration> {
        self.timers.iter().map(|(interval, _)| *interval).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

}

/// Result of routing a `message` command to a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Performed {
    Action,
    Received,
    Unknown,
}

/// A registered channel type with its concrete type erased.
pub(crate) trait ChannelKind: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, ctx: &ChannelContext) -> Box<dyn ChannelBehavior>;
}

/// One live channel object with its concrete type erased.
pub(crate) trait ChannelBehavior: Send {
    fn authorized(&self, ctx: &ChannelContext) -> bool;

    fn unauthorized(&mut self, ctx: &ChannelContext, action: &str);

    fn subscribe(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError>;

    fn unsubscribe(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError>;

    fn perform(
        &mut self,
        ctx: &mut ChannelContext,
        action: Option<&str>,
        data: &Value,
    ) -> Result<Performed, ChannelError>;

    fn timer_intervals(&self) -> Vec<Duration>;

    fn tick(&mut self, ctx: &mut ChannelContext, timer: usize) -> Result<(), ChannelError>;

    fn as_any(&self) -> &dyn Any;
}

struct Kind<C>(Arc<ChannelDescriptor<C>>);

impl<C: Channel> ChannelKind for Kind<C> {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn build(&self, ctx: &ChannelContext) -> Box<dyn ChannelBehavior> {
        Box::new(Bound {
            channel: (self.0.factory)(ctx),
            descriptor: self.0.clone(),
        })
    }
}

struct Bound<C> {
    channel: C,
    descriptor: Arc<ChannelDescriptor<C>>,
}

impl<C: Channel> ChannelBehavior for Bound<C> {
    fn authorized(&self, ctx: &ChannelContext) -> bool {
        self.channel.authorized(ctx)
    }

    fn unauthorized(&mut self, ctx: &ChannelContext, action: &str) {
        self.channel.unauthorized(ctx, action)
    }

    fn subscribe(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        for hook in &self.descriptor.on_subscribe {
            hook(&mut self.channel, ctx)?;
            if ctx.is_rejected() {
                return Ok(());
            }
        }
        self.channel.subscribed(ctx)
    }

    fn unsubscribe(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        // every hook runs; the first failure is reported
        let mut outcome = Ok(());
        for hook in &self.descriptor.on_unsubscribe {
            if let Err(e) = hook(&mut self.channel, ctx) {
                outcome = outcome.and(Err(e));
            }
        }
        let unsubscribed = self.channel.unsubscribed(ctx);
        outcome.and(unsubscribed)
    }

    fn perform(
        &mut self,
        ctx: &mut ChannelContext,
        action: Option<&str>,
        data: &Value,
    ) -> Result<Performed, ChannelError> {
        let handler = match action {
            Some(name) => self.descriptor.actions.get(name).map(|f| (f, Performed::Action)),
            None => self.descriptor.receive.as_ref().map(|f| (f, Performed::Received)),
        };
        let Some((handler, performed)) = handler else {
            return Ok(Performed::Unknown);
        };
        debug!(channel = %self.descriptor.name, action = action.unwrap_or("receive"), "performing");
        handler(&mut self.channel, ctx, data)?;
        Ok(performed)
    }

    fn timer_intervals(&self) -> Vec<Duration> {
        self.descriptor.timer_intervals()
    }

    fn tick(&mut self, ctx: &mut ChannelContext, timer: usize) -> Result<(), ChannelError> {
        match self.descriptor.timers.get(timer) {
            Some((_, tick)) => tick(&mut self.channel, ctx),
            None => Ok(()),
        }
    }

    fn as_any(&self) -> &dyn Any {
        &self.channel
    }
}

/// Every channel type a server accepts subscriptions for, by name.
#[derive(Default, Clone)]
pub struct ChannelCatalog {
    kinds: HashMap<String, Arc<dyn ChannelKind>>,
}

impl ChannelCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `descriptor`, replacing any channel with the same name.
    pub fn register<C: Channel>(&mut self, descriptor: ChannelDescriptor<C>) {
        let name = descriptor.name.clone();
        self.kinds.insert(name, Arc::new(Kind(Arc::new(descriptor))));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<dyn ChannelKind>> {
        self.kinds.get(name)
    }
}
