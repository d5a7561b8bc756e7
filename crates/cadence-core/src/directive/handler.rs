//! The contract capability agents implement to receive directives.

use std::collections::HashMap;

use super::{BlockingPolicy, DirectiveInfo, NamespaceAndName};

/// A capability agent that handles one or more directive kinds.
///
/// Call order for one directive is always `pre_handle_directive` then, once
/// the blocking policy allows it, `handle_directive`. `cancel_directive` may
/// arrive at any point after `pre_handle_directive`. None of these are called
/// with a sequencer lock held, so implementations may report results
/// synchronously from inside them.
pub trait DirectiveHandler: Send + Sync {
    /// Directive kinds handled, with the blocking policy for each.
    fn configurations(&self) -> HashMap<NamespaceAndName, BlockingPolicy>;

    /// Validate the payload and register bookkeeping. Runs immediately on
    /// arrival regardless of blocking.
    fn pre_handle_directive(&self, info: DirectiveInfo);

    /// Start handling. Returning `false` (unknown message id) fails the
    /// directive with the default cancel policy.
    fn handle_directive(&self, message_id: &str) -> bool;

    /// Drop a directive that was pre-handled or is being handled.
    fn cancel_directive(&self, message_id: &str);
}
