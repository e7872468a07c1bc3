//! Trigger filter: does this event deserve a turn?
//!
//! Pure and synchronous. An event is answered only when it explicitly
//! mentions the identity bound to its channel and was not written by that
//! identity (or any other bot).

use homunculus_core::channel::InboundEvent;

use crate::identity_manager::IdentityBinding;

/// Why an event was not answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoBinding,
    OtherChannel,
    BotAuthor,
    SelfAuthored,
    UnknownSelfId,
    NotMentioned,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoBinding => "no_binding",
            Self::OtherChannel => "other_channel",
            Self::BotAuthor => "bot_author",
            Self::SelfAuthored => "self_authored",
            Self::UnknownSelfId => "unknown_self_id",
            Self::NotMentioned => "not_mentioned",
        }
    }
}

/// The filter decision with its reason.
pub fn evaluate(event: &InboundEvent, binding: Option<&IdentityBinding>) -> Result<(), SkipReason> {
    let binding = binding.ok_or(SkipReason::NoBinding)?;
    if event.channel_id != binding.channel {
        return Err(SkipReason::OtherChannel);
    }
    if binding.bot_user_id == 0 {
        return Err(SkipReason::UnknownSelfId);
    }
    if event.author_id == binding.bot_user_id {
        return Err(SkipReason::SelfAuthored);
    }
    if event.author_is_bot {
        return Err(SkipReason::BotAuthor);
    }
    if !event.mentions(binding.bot_user_id) {
        return Err(SkipReason::NotMentioned);
    }
    Ok(())
}

pub fn should_respond(event: &InboundEvent, binding: Option<&IdentityBinding>) -> bool {
    evaluate(event, binding).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{binding, event};

    #[test]
    fn mention_of_bound_identity_triggers() {
        let b = binding("tavern", "kovach", 1001);
        assert!(should_respond(&event("tavern", 7, "<@1001> hello", &[1001]), Some(&b)));
    }

    #[test]
    fn every_rejection_has_a_reason() {
        let b = binding("tavern", "kovach", 1001);
        let cases = [
            (event("tavern", 7, "hi", &[1001]), None, SkipReason::NoBinding),
            (event("docks", 7, "hi", &[1001]), Some(&b), SkipReason::OtherChannel),
            (event("tavern", 1001, "hi", &[1001]), Some(&b), SkipReason::SelfAuthored),
            (event("tavern", 7, "hi there", &[]), Some(&b), SkipReason::NotMentioned),
            (event("tavern", 7, "<@1002> hi", &[1002]), Some(&b), SkipReason::NotMentioned),
        ];
        for (ev, bound, expected) in cases {
            assert_eq!(evaluate(&ev, bound), Err(expected), "{}", ev.content);
        }

        let mut from_bot = event("tavern", 8, "<@1001> hi", &[1001]);
        from_bot.author_is_bot = true;
        assert_eq!(evaluate(&from_bot, Some(&b)), Err(SkipReason::BotAuthor));

        let unknown = binding("tavern", "kovach", 0);
        assert_eq!(
            evaluate(&event("tavern", 7, "<@0> hi", &[0]), Some(&unknown)),
            Err(SkipReason::UnknownSelfId)
        );
    }
}
