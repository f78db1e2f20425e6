//! Caption fallback and post-processing.
//!
//! When the captioner fails, a template caption is built from the
//! candidate instead. Either way the caption is finished the same way:
//! custom tags are merged in, the tag list is capped and a call to action
//! may be appended.

use crate::{Candidate, Caption, CaptionConfig, CaptionStyle};

/// Most hashtags a published caption may carry.
pub const MAX_TAGS: usize = 30;

const INSPIRING: &[&str] = &[
    "{title}\n\nSmall steps every day add up.",
    "{title}\n\nKeep going. The work is paying off.",
    "{title}\n\nThis is your sign to start today.",
];

const CASUAL: &[&str] = &[
    "{title}\n\nHad to share this one.",
    "{title}\n\nWatched this way too many times.",
    "{title}\n\nOkay, this made my day.",
];

const INFORMATIVE: &[&str] = &[
    "{title}\n\nA quick breakdown worth saving.",
    "{title}\n\nHere is what you need to know.",
    "{title}\n\nOne minute, one useful idea.",
];

const CALLS_TO_ACTION: &[&str] = &[
    "Follow for more.",
    "Save this for later.",
    "Share with someone who needs it.",
    "Tell us what you think in the comments.",
];

const COMMON_TAGS: &[&str] = &["#viral", "#trending", "#explore", "#reels", "#fyp"];

fn category_tags(category: &str) -> &'static [&'static str] {
    match category.to_ascii_lowercase().as_str() {
        "motivational" => &[
            "#motivation",
            "#inspiration",
            "#mindset",
            "#success",
            "#goals",
            "#discipline",
            "#selfimprovement",
        ],
        "tech" => &[
            "#tech",
            "#technology",
            "#coding",
            "#programming",
            "#developer",
            "#gadgets",
            "#ai",
        ],
        "comedy" => &[
            "#comedy",
            "#funny",
            "#memes",
            "#humor",
            "#lol",
            "#jokes",
        ],
        _ => &[],
    }
}

/// FNV-1a over the id bytes. Stable across runs and platforms.
fn seed(candidate: &Candidate) -> u64 {
    candidate
        .id
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |hash, b| {
            (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
        })
}

fn pick<'a>(options: &[&'a str], seed: u64) -> &'a str {
    options[(seed % options.len() as u64) as usize]
}

/// Deterministic caption built from the candidate alone.
///
/// The same candidate and settings always produce the same caption.
pub fn template_caption(candidate: &Candidate, category: &str, config: &CaptionConfig) -> Caption {
    let templates = match config.style {
        CaptionStyle::Inspiring => INSPIRING,
        CaptionStyle::Casual => CASUAL,
        CaptionStyle::Informative => INFORMATIVE,
    };
    let text = pick(templates, seed(candidate)).replace("{title}", candidate.title.trim());

    let tags = category_tags(category)
        .iter()
        .chain(COMMON_TAGS)
        .map(|t| t.to_string())
        .take(config.hashtag_count)
        .collect();

    Caption { text, tags }
}

/// Merge custom tags, cap the tag list, trim the text and add a call to action.
pub fn finish_caption(mut caption: Caption, candidate: &Candidate, config: &CaptionConfig) -> Caption {
    let mut tags: Vec<String> = Vec::with_capacity(caption.tags.len() + config.custom_hashtags.len());
    for tag in caption.tags.drain(..).chain(config.custom_hashtags.iter().cloned()) {
        let tag = normalize_tag(&tag);
        if tag.len() > 1 && !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            tags.push(tag);
        }
    }
    tags.truncate(MAX_TAGS);

    let mut text = caption.text.trim().to_string();
    if config.call_to_action {
        let cta = pick(CALLS_TO_ACTION, seed(candidate).rotate_left(17));
        if !text.contains(cta) {
            text = format!("{text}\n\n{cta}");
        }
    }

    Caption {
        text: truncate_chars(&text, config.max_length),
        tags,
    }
}

fn normalize_tag(tag: &str) -> String {
    let tag = tag.trim();
    if tag.starts_with('#') {
        tag.to_string()
    } else {
        format!("#{tag}")
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ContentFlags;

    fn candidate(id: &str) -> Candidate {
        Candidate {
            id: id.into(),
            title: "  Five habits of focused people ".into(),
            description: String::new(),
            url: format!("https://example.com/v/{id}"),
            duration_secs: 40,
            view_count: 20_000,
            like_count: 900,
            category: None,
            channel: None,
            flags: ContentFlags::default(),
        }
    }

    #[test]
    fn test_template_is_deterministic() {
        let config = CaptionConfig::default();
        let a = template_caption(&candidate("vid1"), "motivational", &config);
        let b = template_caption(&candidate("vid1"), "motivational", &config);
        assert_eq!(a, b);
        assert!(a.text.starts_with("Five habits of focused people"));
        assert_eq!(a.tags[0], "#motivation");
    }

    #[test]
    fn test_template_respects_hashtag_count() {
        let config = CaptionConfig {
            hashtag_count: 3,
            ..Default::default()
        };
        let caption = template_caption(&candidate("vid1"), "tech", &config);
        assert_eq!(caption.tags, vec!["#tech", "#technology", "#coding"]);
    }

    #[test]
    fn test_unknown_category_uses_common_tags() {
        let caption = template_caption(&candidate("vid1"), "cooking", &CaptionConfig::default());
        assert_eq!(caption.tags.len(), COMMON_TAGS.len());
    }

    #[test]
    fn test_finish_merges_custom_tags_without_duplicates() {
        let config = CaptionConfig {
            custom_hashtags: vec!["rustlang".into(), "#Tech".into()],
            call_to_action: false,
            ..Default::default()
        };
        let caption = Caption {
            text: "hello".into(),
            tags: vec!["#tech".into()],
        };

        let finished = finish_caption(caption, &candidate("vid1"), &config);
        assert_eq!(finished.tags, vec!["#tech", "#rustlang"]);
        assert_eq!(finished.text, "hello");
    }

    #[test]
    fn test_finish_caps_tags() {
        let caption = Caption {
            text: "hello".into(),
            tags: (0..50).map(|i| format!("#tag{i}")).collect(),
        };
        let finished = finish_caption(caption, &candidate("vid1"), &CaptionConfig::default());
        assert_eq!(finished.tags.len(), MAX_TAGS);
    }

    #[test]
    fn test_finish_appends_call_to_action_once() {
        let config = CaptionConfig::default();
        let caption = Caption {
            text: "hello".into(),
            tags: vec![],
        };

        let once = finish_caption(caption, &candidate("vid1"), &config);
        let twice = finish_caption(once.clone(), &candidate("vid1"), &config);
        assert_ne!(once.text, "hello");
        assert_eq!(once.text, twice.text);
    }

    #[test]
    fn test_finish_truncates_on_char_boundary() {
        let config = CaptionConfig {
            max_length: 4,
            call_to_action: false,
            ..Default::default()
        };
        let caption = Caption {
            text: "héllo wörld".into(),
            tags: vec![],
        };
        assert_eq!(finish_caption(caption, &candidate("vid1"), &config).text, "héll");
    }
}
