//! Human-readable rendering of negotiation messages.

use crate::domain::session::Role;
use crate::protocol::messages::{MessageKind, NegotiationMessage};

/// "offer" for the opening round, "counter offer" once terms have been countered twice.
pub fn offer_noun(cycle: u32) -> &'static str {
    if cycle > 1 {
        "counter offer"
    } else {
        "offer"
    }
}

/// Short label for the local side of a session.
pub fn role_label(role: Role) -> &'static str {
    match role {
        Role::Seller => "Selling",
        Role::Buyer => "Buying",
    }
}

/// Renders a received message as a single line for the local user.
///
/// Returns `None` for kinds this build does not understand.
pub fn describe(message: &NegotiationMessage, local_role: Role) -> Option<String> {
    let who = &message.proponent;
    let noun = offer_noun(message.cycle);
    let line = match message.kind {
        MessageKind::Intent => format!("{who} is preparing a bid."),
        MessageKind::Accept if message.terms().is_complete() => format!(
            "{who} accepted your {noun}. {}",
            settled_line(message, local_role)
        ),
        MessageKind::Accept => format!("{who} accepted your {noun}."),
        MessageKind::Reject => format!("{who} rejected your {noun}."),
        MessageKind::Counter => {
            let (verb, direction) = match local_role {
                Role::Seller => ("buying", "from you"),
                Role::Buyer => ("selling", "to you"),
            };
            format!(
                "{who} proposes {verb} BTC{} @ USD{} {direction}.",
                message.amount, message.price
            )
        }
        MessageKind::Resign => format!("{who} left negotiations."),
        MessageKind::Summary => settled_line(message, local_role),
        MessageKind::Unrecognized(_) => return None,
    };
    Some(line)
}

fn settled_line(message: &NegotiationMessage, local_role: Role) -> String {
    let verb = match local_role {
        Role::Seller => "sold",
        Role::Buyer => "bought",
    };
    format!(
        "You've {verb} BTC{} for USD{}.",
        message.amount, message.price
    )
}
