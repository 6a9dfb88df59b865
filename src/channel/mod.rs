//! Channels: the units of logic a client subscribes to.
//!
//! A channel type implements [`Channel`] for its lifecycle and is registered
//! with a [`ChannelDescriptor`] that names it and lists its client-callable
//! actions, subscribe/unsubscribe hooks and periodic timers. Each
//! subscription gets its own [`ChannelInstance`].

pub mod context;
pub mod descriptor;
pub mod identifier;
pub mod instance;

use tracing::warn;

use crate::utils::error::ChannelError;

pub use context::{ChannelContext, ClientTarget};
pub use descriptor::{ChannelCatalog, ChannelDescriptor};
pub use identifier::ParsedIdentifier;
pub use instance::{ChannelInstance, ChannelState, SharedChannel};

/// Lifecycle of one channel subscription.
///
/// All methods have defaults, so a channel that only streams can be an
/// empty `impl`.
pub trait Channel: Send + 'static {
    /// Consulted before subscribing and again before every action.
    fn authorized(&self, ctx: &ChannelContext) -> bool {
        let _ = ctx;
        true
    }

    /// Runs after the descriptor's subscribe hooks. Call
    /// [`ChannelContext::reject`] to refuse the subscription.
    fn subscribed(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        let _ = ctx;
        Ok(())
    }

    fn unsubscribed(&mut self, ctx: &mut ChannelContext) -> Result<(), ChannelError> {
        let _ = ctx;
        Ok(())
    }

    /// Called when an action arrives but [`authorized`](Self::authorized)
    /// no longer holds. The action is dropped.
    fn unauthorized(&mut self, ctx: &ChannelContext, action: &str) {
        warn!(identifier = %ctx.identifier(), action, "unauthorized action dropped");
    }
}
