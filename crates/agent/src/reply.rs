//! Reply formatting for the chat surface.

const DEFAULT_SPEAKER: &str = "NPC";

/// `**Name:** reply`, with an optional out-of-character notice below.
pub fn format_reply(name: &str, reply: &str, ooc_notice: Option<&str>) -> String {
    let name = match name.trim() {
        "" => DEFAULT_SPEAKER,
        trimmed => trimmed,
    };
    let mut text = format!("**{name}:** {}", reply.trim());
    if let Some(notice) = ooc_notice.map(str::trim).filter(|n| !n.is_empty()) {
        text.push_str(&format!("\n\n_OOC: {notice}_"));
    }
    text
}
