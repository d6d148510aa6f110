use crate::domain::models::Direction;

/// Action requested by an already-transcribed voice or text phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseCommand {
    Move(Direction),
    Stop,
    FrontLight(bool),
    BackLight(bool),
    Horn,
}

/// Map a phrase to a command. Spaces and case are ignored and the first
/// matching keyword wins, so "turn left and stop" is a left turn.
pub fn interpret(phrase: &str) -> Option<PhraseCommand> {
    let text: String = phrase
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();

    let has = |keyword: &str| text.contains(keyword);

    if has("forward") || has("gostraight") {
        Some(PhraseCommand::Move(Direction::Forward))
    } else if has("backward") || has("reverse") {
        Some(PhraseCommand::Move(Direction::Backward))
    } else if has("left") {
        Some(PhraseCommand::Move(Direction::Left))
    } else if has("right") {
        Some(PhraseCommand::Move(Direction::Right))
    } else if has("stop") {
        Some(PhraseCommand::Stop)
    } else if has("frontlighton") {
        Some(PhraseCommand::FrontLight(true))
    } else if has("frontlightoff") {
        Some(PhraseCommand::FrontLight(false))
    } else if has("backlighton") {
        Some(PhraseCommand::BackLight(true))
    } else if has("backlightoff") {
        Some(PhraseCommand::BackLight(false))
    } else if has("horn") || has("beep") {
        Some(PhraseCommand::Horn)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_movement_phrases() {
        assert_eq!(
            interpret("Go Straight"),
            Some(PhraseCommand::Move(Direction::Forward))
        );
        assert_eq!(
            interpret("reverse please"),
            Some(PhraseCommand::Move(Direction::Backward))
        );
        assert_eq!(interpret("turn LEFT"), Some(PhraseCommand::Move(Direction::Left)));
        assert_eq!(interpret("stop"), Some(PhraseCommand::Stop));
    }

    #[test]
    fn test_light_phrases_ignore_spacing() {
        assert_eq!(
            interpret("front light on"),
            Some(PhraseCommand::FrontLight(true))
        );
        assert_eq!(
            interpret("Back Light Off"),
            Some(PhraseCommand::BackLight(false))
        );
    }

    #[test]
    fn test_first_keyword_wins() {
        // "right" is checked before "light"-phrases
        assert_eq!(
            interpret("bright light on"),
            Some(PhraseCommand::Move(Direction::Right))
        );
        assert_eq!(interpret("beep beep"), Some(PhraseCommand::Horn));
        assert_eq!(interpret("sing a song"), None);
    }
}
