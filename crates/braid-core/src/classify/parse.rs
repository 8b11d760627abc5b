//! Text-level parsing: list items, inline directives, dependency phrases, slugs.

/// One work item cut out of a source unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawItem {
    pub title_line: String,
    pub description: String,
}

/// Dependency phrases, matched case-insensitively at a word start.
pub(crate) const DEPENDENCY_PHRASES: [&str; 6] = [
    "blocked by",
    "depends on",
    "depends upon",
    "waiting on",
    "after task",
    "requires task",
];

fn is_indented(line: &str) -> bool {
    line.starts_with(char::is_whitespace)
}

/// Returns the item text for "- ", "* ", "1. " and "2) " lines.
fn list_item(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if let Some(rest) = trimmed
        .strip_prefix("- ")
        .or_else(|| trimmed.strip_prefix("* "))
    {
        let rest = rest.trim();
        return (!rest.is_empty()).then_some(rest);
    }
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let rest = &trimmed[digits..];
    let rest = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

/// Splits a unit into items.
///
/// A unit with top-level list lines yields one item per list line; indented
/// lines below an item are its description. Anything else is a single item:
/// first non-empty line is the title, the rest the description.
pub(crate) fn split_items(text: &str) -> Vec<RawItem> {
    let has_list = text
        .lines()
        .any(|line| !is_indented(line) && list_item(line).is_some());

    if !has_list {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let Some(title) = lines.next() else {
            return Vec::new();
        };
        return vec![RawItem {
            title_line: title.to_string(),
            description: lines.collect::<Vec<_>>().join("\n"),
        }];
    }

    let mut items = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !is_indented(line) {
            if let Some((title, body)) = current.take() {
                items.push(RawItem {
                    title_line: title,
                    description: body.join("\n"),
                });
            }
            // 見出しなどリスト外の行は捨てる
            current = list_item(line).map(|item| (item.to_string(), Vec::new()));
        } else if let Some((_, body)) = current.as_mut() {
            body.push(line.trim().to_string());
        }
    }
    if let Some((title, body)) = current {
        items.push(RawItem {
            title_line: title,
            description: body.join("\n"),
        });
    }
    items
}

/// Inline directives found in an item.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Directives {
    pub id: Option<String>,
    pub tags: Vec<String>,
    pub impact: Option<String>,
    pub effort: Option<String>,
    pub risk: Option<String>,
}

const TRAILING: &[char] = &[',', '.', ';', ':', ')', '('];

fn take_id(line: &str, directives: &mut Directives) -> String {
    let lower = line.to_ascii_lowercase();
    let Some(start) = lower.find("[id:") else {
        return line.to_string();
    };
    let Some(len) = line[start..].find(']') else {
        return line.to_string();
    };
    let value = line[start + 4..start + len].trim();
    if !value.is_empty() && directives.id.is_none() {
        directives.id = Some(value.to_string());
    }
    format!("{}{}", &line[..start], &line[start + len + 1..])
}

/// Removes `[id: x]`, `#tag` and `impact=N` style tokens from one line.
///
/// A tag starts with a letter; `#412` is an issue reference and stays in the text.
pub(crate) fn strip_directives(line: &str, directives: &mut Directives) -> String {
    let line = take_id(line, directives);
    let mut kept: Vec<&str> = Vec::new();
    let mut words = line.split_whitespace().peekable();
    while let Some(word) = words.next() {
        if let Some(tag) = word.strip_prefix('#')
            && tag.starts_with(|c: char| c.is_alphabetic())
        {
            directives.tags.push(tag.trim_end_matches(TRAILING).to_string());
            continue;
        }

        let lower = word.to_ascii_lowercase();
        let score = ["impact", "effort", "risk"].into_iter().find_map(|field| {
            let rest = lower.strip_prefix(field)?;
            let value = rest.strip_prefix('=').or_else(|| rest.strip_prefix(':'))?;
            Some((field, word[word.len() - value.len()..].to_string()))
        });
        if let Some((field, mut value)) = score {
            if value.is_empty() {
                // "impact: 4"
                value = words.next().unwrap_or_default().to_string();
            }
            let value = value.trim_end_matches(TRAILING).to_string();
            let slot = match field {
                "impact" => &mut directives.impact,
                "effort" => &mut directives.effort,
                _ => &mut directives.risk,
            };
            slot.get_or_insert(value);
            continue;
        }
        kept.push(word);
    }
    kept.join(" ")
}

fn at_word_start(text: &str, pos: usize) -> bool {
    text[..pos]
        .chars()
        .next_back()
        .is_none_or(|c| !c.is_alphanumeric())
}

/// Byte offsets of every dependency phrase in `text`, with the phrase length.
fn phrase_positions(text: &str) -> Vec<(usize, usize)> {
    let lower = text.to_ascii_lowercase();
    let mut found: Vec<(usize, usize)> = DEPENDENCY_PHRASES
        .iter()
        .flat_map(|phrase| {
            lower
                .match_indices(phrase)
                .map(move |(pos, _)| (pos, phrase.len()))
        })
        .filter(|(pos, _)| at_word_start(&lower, *pos))
        .collect();
    found.sort_unstable();
    found
}

/// Where the first dependency phrase starts, if any.
pub(crate) fn first_dependency_phrase(text: &str) -> Option<usize> {
    phrase_positions(text).first().map(|(pos, _)| *pos)
}

fn reference_end(rest: &str) -> usize {
    let mut end = rest.len();
    for stop in [";", ")", "(", "\n", ". "] {
        if let Some(pos) = rest.find(stop) {
            end = end.min(pos);
        }
    }
    end
}

/// Dependency references in order of appearance.
///
/// `blocked by a, b and c.` yields `["a", "b", "c"]`.
pub(crate) fn dependency_refs(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for (pos, len) in phrase_positions(text) {
        let rest = text[pos + len..].trim_start_matches([':', ' ']);
        let clause = &rest[..reference_end(rest)];
        for part in clause.split(',').flat_map(|p| p.split(" and ")) {
            let part = part
                .trim()
                .trim_end_matches('.')
                .trim_matches(|c| c == '`' || c == '"' || c == '\'')
                .trim();
            let part = strip_prefix_ignore_case(part, "task ").unwrap_or(part).trim();
            if !part.is_empty() {
                refs.push(part.to_string());
            }
        }
    }
    refs
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &text[prefix.len()..])
}

/// Title with directives already removed: cut before the first dependency
/// phrase and strip trailing separators.
pub(crate) fn clean_title(title: &str) -> String {
    let cut = first_dependency_phrase(title).unwrap_or(title.len());
    title[..cut]
        .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, '(' | '-' | ',' | ';' | ':'))
        .trim()
        .to_string()
}

const MAX_SLUG_CHARS: usize = 48;

/// Deterministic id from free text: lowercase alphanumerics joined by '-'.
pub fn slug(text: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    let truncated: String = out.chars().take(MAX_SLUG_CHARS).collect();
    truncated.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::dash("- Add login", Some("Add login"))]
    #[case::star("* Add login", Some("Add login"))]
    #[case::number_dot("1. Add login", Some("Add login"))]
    #[case::number_paren("2) Add login", Some("Add login"))]
    #[case::version_number("1.5x faster builds", None)]
    #[case::plain("Add login", None)]
    #[case::empty_bullet("- ", None)]
    fn list_items(#[case] line: &str, #[case] expected: Option<&str>) {
        assert_eq!(list_item(line), expected);
    }

    #[test]
    fn list_units_split_per_item_with_continuations() {
        let text = "# Plan\n- Add login page\n  needs a form\n- Write docs\n1. Fix crash\n";
        let items = split_items(text);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].title_line, "Add login page");
        assert_eq!(items[0].description, "needs a form");
        assert_eq!(items[2].title_line, "Fix crash");
    }

    #[test]
    fn prose_unit_is_one_item() {
        let items = split_items("Speed up the build\n\nIt takes ten minutes.\nToo slow.");
        assert_eq!(
            items,
            vec![RawItem {
                title_line: "Speed up the build".into(),
                description: "It takes ten minutes.\nToo slow.".into(),
            }]
        );
    }

    #[test]
    fn directives_are_extracted_and_removed() {
        let mut d = Directives::default();
        let line = strip_directives("Fix contrast [id: a11y-1] #accessibility impact=5 effort: 2", &mut d);
        assert_eq!(line, "Fix contrast");
        assert_eq!(d.id.as_deref(), Some("a11y-1"));
        assert_eq!(d.tags, vec!["accessibility"]);
        assert_eq!(d.impact.as_deref(), Some("5"));
        assert_eq!(d.effort.as_deref(), Some("2"));
        assert_eq!(d.risk, None);
    }

    #[rstest]
    #[case::hashtag("Speed up CI #build", vec!["build"], "Speed up CI")]
    #[case::issue_ref("Fix crash on save, see #412", vec![], "Fix crash on save, see #412")]
    #[case::mixed("Fix crash #backend (see #412)", vec!["backend"], "Fix crash (see #412)")]
    #[case::trailing_punctuation("Polish #frontend.", vec!["frontend"], "Polish")]
    fn hashtags(#[case] raw: &str, #[case] tags: Vec<&str>, #[case] rest: &str) {
        let mut d = Directives::default();
        let line = strip_directives(raw, &mut d);
        assert_eq!(d.tags, tags);
        assert_eq!(line, rest);
    }

    #[test]
    fn markdown_heading_is_not_a_tag() {
        let mut d = Directives::default();
        let line = strip_directives("# Sprint plan", &mut d);
        assert!(d.tags.is_empty());
        assert_eq!(line, "# Sprint plan");
    }

    #[rstest]
    #[case::single("Deploy (blocked by setup-db)", vec!["setup-db"])]
    #[case::list("Ship it, depends on a, b and c. Then party", vec!["a", "b", "c"])]
    #[case::task_prefix("Release after task Build docs", vec!["Build docs"])]
    #[case::quoted("Waiting on `api-v2`; later", vec!["api-v2"])]
    #[case::inside_word("unblocked by nothing", vec![])]
    fn dependency_references(#[case] text: &str, #[case] expected: Vec<&str>) {
        assert_eq!(dependency_refs(text), expected);
    }

    #[rstest]
    #[case::paren("Add login page (blocked by setup-db)", "Add login page")]
    #[case::dash("Deploy - depends on build", "Deploy")]
    #[case::none("Write docs", "Write docs")]
    fn titles_are_cut_at_dependency_phrase(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(clean_title(raw), expected);
    }

    #[rstest]
    #[case::spaces("Add Login Page", "add-login-page")]
    #[case::punctuation("Fix: crash (again)!", "fix-crash-again")]
    #[case::empty("!!!", "")]
    fn slugs(#[case] text: &str, #[case] expected: &str) {
        assert_eq!(slug(text), expected);
    }
}
