//! Signatures: the keys consumers subscribe to.
//!
//! A signature names a *class* of work item. Plain events are identified by
//! `(type_tag, id)`; RPC events additionally carry a [`Route`]. Only the
//! fields relevant to matching take part in equality and ordering:
//!
//! ```text
//! compared:  type_tag, id, route.role, route.interaction, route.to
//! ignored:   route.from, route.seq
//! ```
//!
//! so a server subscribed to "requests of `echo` addressed to me" matches a
//! request from any proxy with any sequence id.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{SeqId, ServiceId};

/// Kind of RPC interaction an event represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interaction {
    Request,
    Response,
    Busy,
    Subscribe,
    Unsubscribe,
    Notification,
}

impl fmt::Display for Interaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Busy => "busy",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Notification => "notification",
        };
        f.write_str(name)
    }
}

/// Endpoint routing carried by RPC signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub role: Cow<'static, str>,
    pub interaction: Interaction,
    pub from: ServiceId,
    pub to: ServiceId,
    pub seq: SeqId,
}

impl Route {
    fn key(&self) -> (&str, Interaction, ServiceId) {
        (&*self.role, self.interaction, self.to)
    }
}

/// Ordered key identifying a class of dispatchable work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    type_tag: Cow<'static, str>,
    id: Cow<'static, str>,
    route: Option<Route>,
}

impl Signature {
    /// A plain signature with no routing.
    pub fn new(type_tag: impl Into<Cow<'static, str>>, id: impl Into<Cow<'static, str>>) -> Self {
        Self {
            type_tag: type_tag.into(),
            id: id.into(),
            route: None,
        }
    }

    /// An RPC signature.
    pub fn routed(
        type_tag: impl Into<Cow<'static, str>>,
        id: impl Into<Cow<'static, str>>,
        route: Route,
    ) -> Self {
        Self {
            type_tag: type_tag.into(),
            id: id.into(),
            route: Some(route),
        }
    }

    /// The signature *type*; [`unsubscribe_all`] matches on this alone.
    ///
    /// [`unsubscribe_all`]: crate::dispatch::SubscriptionRegistry::unsubscribe_all
    #[must_use]
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    /// Returns a copy with `from` and `seq` replaced; matching is unaffected.
    #[must_use]
    pub fn with_origin(&self, from: ServiceId, seq: SeqId) -> Self {
        let mut sig = self.clone();
        if let Some(route) = sig.route.as_mut() {
            route.from = from;
            route.seq = seq;
        }
        sig
    }

    fn key(&self) -> (&str, &str, Option<(&str, Interaction, ServiceId)>) {
        (&*self.type_tag, &*self.id, self.route.as_ref().map(Route::key))
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Signature {}

impl PartialOrd for Signature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Signature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.type_tag, self.id)?;
        if let Some(route) = &self.route {
            write!(
                f,
                "[{} {} {}->{} {}]",
                route.role, route.interaction, route.from, route.to, route.seq
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(interaction: Interaction, from: u32, to: u32, seq: u64) -> Route {
        Route {
            role: Cow::Borrowed("main"),
            interaction,
            from: ServiceId(from),
            to: ServiceId(to),
            seq: SeqId(seq),
        }
    }

    #[test]
    fn plain_signatures_compare_on_tag_and_id() {
        assert_eq!(Signature::new("app", "ping"), Signature::new("app", "ping"));
        assert_ne!(Signature::new("app", "ping"), Signature::new("app", "pong"));
        assert!(Signature::new("a", "z") < Signature::new("b", "a"));
    }

    #[test]
    fn routed_match_ignores_sender_and_sequence() {
        let subscribed = Signature::routed("svc::method", "echo", route(Interaction::Request, 0, 7, 0));
        let incoming = Signature::routed("svc::method", "echo", route(Interaction::Request, 3, 7, 99));
        assert_eq!(subscribed, incoming);
        assert_eq!(subscribed.cmp(&incoming), Ordering::Equal);
    }

    #[test]
    fn routed_match_respects_destination_and_interaction() {
        let a = Signature::routed("svc::method", "echo", route(Interaction::Request, 0, 7, 0));
        let other_target = Signature::routed("svc::method", "echo", route(Interaction::Request, 0, 8, 0));
        let other_kind = Signature::routed("svc::method", "echo", route(Interaction::Response, 0, 7, 0));
        assert_ne!(a, other_target);
        assert_ne!(a, other_kind);
    }

    #[test]
    fn with_origin_keeps_match() {
        let sig = Signature::routed("svc::method", "echo", route(Interaction::Busy, 0, 1, 0));
        let stamped = sig.with_origin(ServiceId(5), SeqId(12));
        assert_eq!(sig, stamped);
        let r = stamped.route().unwrap();
        assert_eq!((r.from, r.seq), (ServiceId(5), SeqId(12)));
    }
}
