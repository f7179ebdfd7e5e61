//! Bilingual (RU/EN) pattern families feeding the action extractor's feature
//! vector (spec §4.5).

use regex::Regex;

fn compiled(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in extractor pattern must compile")
}

/// Imperative-verb markers: a direct request phrased as a command.
pub(super) fn imperative_patterns() -> Vec<Regex> {
    vec![
        compiled(r"(?i)сделай(те)?|проверь(те)?|подготовь(те)?|согласуй(те)?|утверди(те)?"),
        compiled(r"(?i)please|could you|can you|review|approve|sign off|submit|provide"),
    ]
}

/// Action-marker words: urgency/obligation without a bare imperative verb.
pub(super) fn action_marker_patterns() -> Vec<Regex> {
    vec![
        compiled(r"(?i)нужно|необходимо|прошу|срочно"),
        compiled(r"(?i)need to|must|should|asap"),
    ]
}

/// Deadline cues: an explicit date, relative day, or weekday reference.
pub(super) fn deadline_patterns() -> Vec<Regex> {
    vec![
        compiled(r"(?i)до|к|не позднее\s+\d{1,2}[./]\d{1,2}"),
        compiled(r"(?i)by|before|EOD|end of day"),
        compiled(r"(?i)monday|tuesday|wednesday|thursday|friday|saturday|sunday"),
        compiled(r"(?i)понедельник|вторник|сред[ау]|четверг|пятниц[ау]|суббот[ау]|воскресень[ея]"),
        compiled(r"(?i)сегодня|завтра|послезавтра|today|tomorrow"),
        compiled(r"\d{1,2}[./]\d{1,2}"),
    ]
}

/// Question cues: an interrogative or a modal question, not just trailing `?`.
pub(super) fn question_patterns() -> Vec<Regex> {
    vec![
        compiled(r"(?i)когда|где|как\b|why|when|how\b"),
        compiled(r"(?i)can you|could you|можешь"),
    ]
}

/// Risk/blocker markers, bilingual.
pub(super) fn risk_patterns() -> Vec<Regex> {
    vec![
        compiled(r"(?i)риск|проблема|блокер|не работает"),
        compiled(r"(?i)risk|blocker|broken|failing|incident"),
    ]
}
