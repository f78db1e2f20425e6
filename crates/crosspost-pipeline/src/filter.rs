//! Admission checks for discovered candidates.

use crate::{Candidate, FilterConfig, SkipReason};

/// Decide whether a candidate may enter the pipeline.
///
/// Checks run cheapest first and the first failing check wins. A candidate
/// without a category passes the category check.
pub fn admit(candidate: &Candidate, filter: &FilterConfig, category: &str) -> Result<(), SkipReason> {
    if candidate.view_count < filter.min_views {
        return Err(SkipReason::BelowMinViews);
    }

    if candidate.like_ratio() < filter.min_like_ratio {
        return Err(SkipReason::BelowLikeRatio);
    }

    if candidate.duration_secs < filter.min_duration_secs
        || candidate.duration_secs > filter.max_duration_secs
    {
        return Err(SkipReason::DurationOutOfBounds);
    }

    if let Some(found) = candidate.category.as_deref()
        && !found.eq_ignore_ascii_case(category)
    {
        return Err(SkipReason::CategoryMismatch);
    }

    if filter.reject_copyright && (candidate.flags.copyright || mentions_protected(candidate, filter)) {
        return Err(SkipReason::Copyright);
    }

    if filter.reject_nsfw && candidate.flags.nsfw {
        return Err(SkipReason::Nsfw);
    }

    Ok(())
}

fn mentions_protected(candidate: &Candidate, filter: &FilterConfig) -> bool {
    let haystack = format!("{} {}", candidate.title, candidate.description).to_lowercase();
    filter
        .copyright_keywords
        .iter()
        .any(|kw| !kw.is_empty() && haystack.contains(&kw.to_lowercase()))
}
