//! Pure state transitions on a message.
//!
//! Each function runs inside the store's read-modify-write and returns
//! whether the message changed. Derived counts are recomputed in the same
//! step as the set they summarize.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use notez_types::events::ReactionOp;
use notez_types::models::{DELETED_PLACEHOLDER, EditRecord, Message, ReactionGroup, ReadReceipt};

use crate::error::{GatewayError, GatewayResult};

fn ensure_not_deleted(message: &Message) -> GatewayResult<()> {
    if message.is_deleted {
        return Err(GatewayError::invalid_state("message has been deleted"));
    }
    Ok(())
}

/// Recompute every derived count from the underlying voter sets.
pub fn recount(message: &mut Message) {
    for group in &mut message.reactions {
        group.count = group.user_ids.len();
    }
    message.reaction_count = message.reactions.iter().map(|g| g.count).sum();

    if let Some(poll) = &mut message.poll {
        for option in &mut poll.options {
            option.count = option.votes.len();
        }
    }
}

pub fn apply_reaction(
    message: &mut Message,
    user_id: Uuid,
    emoji: &str,
    op: ReactionOp,
) -> GatewayResult<bool> {
    ensure_not_deleted(message)?;

    let position = message.reactions.iter().position(|g| g.emoji == emoji);
    let changed = match (op, position) {
        (ReactionOp::Add, Some(idx)) => {
            let group = &mut message.reactions[idx];
            if group.user_ids.contains(&user_id) {
                false
            } else {
                group.user_ids.push(user_id);
                true
            }
        }
        (ReactionOp::Add, None) => {
            message.reactions.push(ReactionGroup {
                emoji: emoji.to_string(),
                count: 0,
                user_ids: vec![user_id],
            });
            true
        }
        (ReactionOp::Remove, Some(idx)) => {
            let group = &mut message.reactions[idx];
            let before = group.user_ids.len();
            group.user_ids.retain(|id| *id != user_id);
            let removed = group.user_ids.len() != before;
            if group.user_ids.is_empty() {
                message.reactions.remove(idx);
            }
            removed
        }
        (ReactionOp::Remove, None) => false,
    };

    if changed {
        recount(message);
    }
    Ok(changed)
}

pub fn apply_vote(
    message: &mut Message,
    user_id: Uuid,
    option_index: usize,
    now: DateTime<Utc>,
) -> GatewayResult<bool> {
    ensure_not_deleted(message)?;

    let poll = message
        .poll
        .as_mut()
        .ok_or_else(|| GatewayError::invalid_state("message is not a poll"))?;
    if !poll.is_active {
        return Err(GatewayError::invalid_state("poll is closed"));
    }
    if poll.is_expired(now) {
        return Err(GatewayError::invalid_state("poll has expired"));
    }
    if option_index >= poll.options.len() {
        return Err(GatewayError::invalid_request("no such poll option"));
    }

    let already = poll.options[option_index].votes.contains(&user_id);
    if poll.allow_multiple {
        if already {
            return Ok(false);
        }
    } else {
        if already {
            return Err(GatewayError::invalid_state("already voted"));
        }
        // Exclusive polls: the vote moves, never duplicates.
        for option in &mut poll.options {
            option.votes.retain(|id| *id != user_id);
        }
    }
    poll.options[option_index].votes.push(user_id);

    recount(message);
    Ok(true)
}

pub fn apply_edit(
    message: &mut Message,
    editor: Uuid,
    content: &str,
    now: DateTime<Utc>,
) -> GatewayResult<bool> {
    ensure_not_deleted(message)?;
    if message.author_id != editor {
        return Err(GatewayError::Forbidden);
    }
    if message.content == content {
        return Ok(false);
    }

    let previous = std::mem::replace(&mut message.content, content.to_string());
    message.edit_history.push(EditRecord {
        content: previous,
        edited_at: now,
    });
    message.is_edited = true;
    message.edited_at = Some(now);
    Ok(true)
}

/// Soft delete. Repeating it on a deleted message changes nothing.
pub fn apply_delete(
    message: &mut Message,
    actor: Uuid,
    can_moderate: bool,
    now: DateTime<Utc>,
) -> GatewayResult<bool> {
    if message.author_id != actor && !can_moderate {
        return Err(GatewayError::Forbidden);
    }
    if message.is_deleted {
        return Ok(false);
    }

    message.content = DELETED_PLACEHOLDER.to_string();
    message.is_deleted = true;
    message.deleted_at = Some(now);
    message.deleted_by = Some(actor);
    if let Some(poll) = &mut message.poll {
        poll.is_active = false;
    }
    Ok(true)
}

pub fn apply_read(message: &mut Message, reader: Uuid, now: DateTime<Utc>) -> bool {
    if message.is_deleted || message.read_by.iter().any(|r| r.user_id == reader) {
        return false;
    }
    message.read_by.push(ReadReceipt {
        user_id: reader,
        read_at: now,
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use notez_types::models::{Identity, MessageKind, Poll};

    fn message() -> Message {
        let author = Identity {
            user_id: Uuid::new_v4(),
            username: "alice".into(),
        };
        Message::new(Uuid::new_v4(), &author, "hello".into(), MessageKind::Text)
    }

    fn poll(allow_multiple: bool) -> Message {
        let mut m = message();
        m.kind = MessageKind::Poll;
        m.poll = Some(Poll::new(
            "Lunch?".into(),
            vec!["pizza".into(), "sushi".into(), "salad".into()],
            allow_multiple,
            None,
        ));
        m
    }

    fn votes_of(m: &Message, user: Uuid) -> Vec<usize> {
        m.poll
            .as_ref()
            .unwrap()
            .options
            .iter()
            .enumerate()
            .filter(|(_, o)| o.votes.contains(&user))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_reactions_are_idempotent() {
        let mut m = message();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(apply_reaction(&mut m, a, "👍", ReactionOp::Add).unwrap());
        assert!(!apply_reaction(&mut m, a, "👍", ReactionOp::Add).unwrap());
        assert!(apply_reaction(&mut m, b, "👍", ReactionOp::Add).unwrap());
        assert!(apply_reaction(&mut m, a, "🎉", ReactionOp::Add).unwrap());
        assert_eq!(m.reactions[0].user_ids, vec![a, b]);
        assert_eq!(m.reactions[0].count, 2);
        assert_eq!(m.reaction_count, 3);

        assert!(apply_reaction(&mut m, a, "🎉", ReactionOp::Remove).unwrap());
        assert!(!apply_reaction(&mut m, a, "🎉", ReactionOp::Remove).unwrap());
        assert!(!apply_reaction(&mut m, a, "🚀", ReactionOp::Remove).unwrap());
        assert_eq!(m.reactions.len(), 1);
        assert_eq!(m.reaction_count, 2);
    }

    #[test]
    fn test_exclusive_vote_moves() {
        let mut m = poll(false);
        let voter = Uuid::new_v4();
        let now = Utc::now();

        for option in [0, 2, 1, 2] {
            apply_vote(&mut m, voter, option, now).unwrap();
            assert_eq!(votes_of(&m, voter), vec![option]);
        }
        let err = apply_vote(&mut m, voter, 2, now).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState(ref r) if r == "already voted"));

        let counts: Vec<usize> = m.poll.unwrap().options.iter().map(|o| o.count).collect();
        assert_eq!(counts, vec![0, 0, 1]);
    }

    #[test]
    fn test_multiple_choice_vote() {
        let mut m = poll(true);
        let voter = Uuid::new_v4();
        let now = Utc::now();

        assert!(apply_vote(&mut m, voter, 0, now).unwrap());
        assert!(apply_vote(&mut m, voter, 1, now).unwrap());
        assert!(!apply_vote(&mut m, voter, 1, now).unwrap());
        assert_eq!(votes_of(&m, voter), vec![0, 1]);
    }

    #[test]
    fn test_vote_rejections() {
        let now = Utc::now();
        let voter = Uuid::new_v4();

        let mut plain = message();
        assert!(matches!(
            apply_vote(&mut plain, voter, 0, now),
            Err(GatewayError::InvalidState(_))
        ));

        let mut m = poll(false);
        assert!(matches!(
            apply_vote(&mut m, voter, 7, now),
            Err(GatewayError::InvalidRequest(_))
        ));

        m.poll.as_mut().unwrap().expires_at = Some(now - Duration::seconds(1));
        assert!(matches!(
            apply_vote(&mut m, voter, 0, now),
            Err(GatewayError::InvalidState(_))
        ));
    }

    #[test]
    fn test_edit_keeps_history() {
        let mut m = message();
        let author = m.author_id;
        let now = Utc::now();

        assert!(matches!(
            apply_edit(&mut m, Uuid::new_v4(), "hijack", now),
            Err(GatewayError::Forbidden)
        ));
        assert!(apply_edit(&mut m, author, "hello world", now).unwrap());
        assert!(!apply_edit(&mut m, author, "hello world", now).unwrap());

        assert_eq!(m.content, "hello world");
        assert_eq!(m.edit_history.len(), 1);
        assert_eq!(m.edit_history[0].content, "hello");
        assert!(m.is_edited);
        assert_eq!(m.edited_at, Some(now));
    }

    #[test]
    fn test_deleted_is_terminal() {
        let mut m = poll(false);
        let author = m.author_id;
        let now = Utc::now();

        assert!(matches!(
            apply_delete(&mut m, Uuid::new_v4(), false, now),
            Err(GatewayError::Forbidden)
        ));
        assert!(apply_delete(&mut m, author, false, now).unwrap());
        assert!(!apply_delete(&mut m, author, false, now).unwrap());
        assert_eq!(m.content, DELETED_PLACEHOLDER);

        assert!(matches!(
            apply_edit(&mut m, author, "back again", now),
            Err(GatewayError::InvalidState(_))
        ));
        assert!(matches!(
            apply_reaction(&mut m, author, "👍", ReactionOp::Add),
            Err(GatewayError::InvalidState(_))
        ));
        assert!(matches!(
            apply_vote(&mut m, author, 0, now),
            Err(GatewayError::InvalidState(_))
        ));
        assert!(!apply_read(&mut m, author, now));
        assert_eq!(m.content, DELETED_PLACEHOLDER);
    }

    #[test]
    fn test_moderator_may_delete() {
        let mut m = message();
        let moderator = Uuid::new_v4();
        assert!(apply_delete(&mut m, moderator, true, Utc::now()).unwrap());
        assert_eq!(m.deleted_by, Some(moderator));
    }

    #[test]
    fn test_read_receipts_once_per_reader() {
        let mut m = message();
        let reader = Uuid::new_v4();
        assert!(apply_read(&mut m, reader, Utc::now()));
        assert!(!apply_read(&mut m, reader, Utc::now()));
        assert_eq!(m.read_by.len(), 1);
    }
}
