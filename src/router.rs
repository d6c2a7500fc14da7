//! Request router
//!
//! Chooses which upstream session serves a request, as a pure function of
//! the ledger and an optional message identity. Least-loaded selection with
//! lowest-id tie break; blacklisted sessions are skipped globally, blind
//! sessions are skipped for that message only, and both kinds of entry are
//! expired in place while we look at them.

use std::time::Instant;

use crate::ledger::Ledger;
use crate::{MessageId, SessionId, PRIMARY_SESSION_ID};

/// Pick the session that should serve a request.
///
/// Selection procedure:
///
/// 1. Candidates are the ids present in the work-load table.
/// 2. Drop ids with an unexpired blacklist entry.
/// 3. With a message id given, drop ids blind to that message.
/// 4. Of the remainder, return the minimum in-flight count, ties broken by
///    lowest id.
/// 5. If nothing remains, fall back to the least-loaded non-blacklisted id;
///    if every id is blacklisted, return the primary unconditionally.
pub fn select_session(ledger: &Ledger, message_id: Option<MessageId>) -> SessionId {
    let now = Instant::now();
    let loads = ledger.loads();

    let available = loads.iter().filter(|(id, _)| {
        if ledger.is_banned(*id, now) {
            return false;
        }
        if let Some(message_id) = message_id {
            if ledger.is_blind(message_id, *id, now) {
                return false;
            }
        }
        true
    });

    if let Some(id) = least_loaded(available) {
        return id;
    }

    // Everything is banned or blind for this message. Ignore blindness so a
    // propagation delay cannot park the whole pool, but keep honoring bans.
    let not_banned = loads.iter().filter(|(id, _)| !ledger.is_banned(*id, now));
    least_loaded(not_banned).unwrap_or(PRIMARY_SESSION_ID)
}

fn least_loaded<'a>(
    candidates: impl Iterator<Item = &'a (SessionId, usize)>,
) -> Option<SessionId> {
    candidates
        .min_by_key(|(id, load)| (*load, *id))
        .map(|(id, _)| *id)
}
