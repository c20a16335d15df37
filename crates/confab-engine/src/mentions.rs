//! `@name` mention detection.

use confab_core::ids::AgentId;

/// The four spellings a user may type for a display name, lowercased:
/// as written, without spaces, hyphenated, and underscored.
pub fn mention_forms(name: &str) -> [String; 4] {
    let lower = name.trim().to_lowercase();
    [
        lower.clone(),
        lower.replace(' ', ""),
        lower.replace(' ', "-"),
        lower.replace(' ', "_"),
    ]
}

/// Agents whose display name appears as `@<form>` anywhere in `text`,
/// case-insensitively. Results follow candidate order without duplicates.
///
/// Names that are substrings of each other both match: `@Updated CFO`
/// mentions an agent called `CFO` too.
pub fn parse_mentions<'a, I>(text: &str, candidates: I) -> Vec<AgentId>
where
    I: IntoIterator<Item = (&'a AgentId, &'a str)>,
{
    let haystack = text.to_lowercase();
    let mut found: Vec<AgentId> = Vec::new();
    for (id, name) in candidates {
        if name.trim().is_empty() || found.contains(id) {
            continue;
        }
        let hit = mention_forms(name)
            .iter()
            .any(|form| haystack.contains(&format!("@{form}")));
        if hit {
            found.push(id.clone());
        }
    }
    found
}
