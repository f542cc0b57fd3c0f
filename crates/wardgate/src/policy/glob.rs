//! Path/command glob matching (spec 4.2).
//!
//! `*` matches exactly one segment; `**` matches zero or more segments; a
//! trailing `*` (not `**`) matches any suffix including multiple segments.
//! An empty pattern matches anything. Exact strings match exactly.
//! Patterns and subjects are forward-slash separated; boundary slashes are
//! stripped before matching. The same function serves command globs by
//! treating a command with no slashes as a single segment.

/// Returns true if `pattern` matches `subject` under the rules above.
pub fn glob_match(pattern: &str, subject: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let pattern = strip_boundary_slashes(pattern);
    let subject = strip_boundary_slashes(subject);

    if pattern == subject {
        return true;
    }

    // A trailing single `*` (not part of a `**` segment) matches any
    // suffix, including across multiple segments, so long as the prefix
    // before it matches exactly segment-for-segment.
    if let Some(stripped) = trailing_single_star_prefix(pattern) {
        let subject_segs: Vec<&str> = split_segments(subject);
        let prefix_segs: Vec<&str> = split_segments(stripped);
        // A trailing `*` still stands in for at least one segment (like a
        // bare `*`), just one that may itself span multiple subject
        // segments.
        if subject_segs.len() <= prefix_segs.len() {
            return false;
        }
        return prefix_segs
            .iter()
            .zip(subject_segs.iter())
            .all(|(p, s)| p == s);
    }

    let pat_segs = split_segments(pattern);
    let subj_segs = split_segments(subject);
    match_segments(&pat_segs, &subj_segs)
}

fn strip_boundary_slashes(s: &str) -> &str {
    s.trim_start_matches('/').trim_end_matches('/')
}

fn split_segments(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('/').collect()
    }
}

/// If `pattern` ends in a lone `*` segment (not `**`), returns the pattern
/// with that trailing segment removed (including the separating slash).
fn trailing_single_star_prefix(pattern: &str) -> Option<&str> {
    let segs = split_segments(pattern);
    match segs.last() {
        Some(&"*") => {
            let prefix_len = pattern.len() - 1 - usize::from(segs.len() > 1);
            Some(&pattern[..prefix_len.min(pattern.len())])
        }
        _ => None,
    }
}

fn match_segments(pat: &[&str], subj: &[&str]) -> bool {
    match pat.first() {
        None => subj.is_empty(),
        Some(&"**") => {
            // ** matches zero or more segments: try consuming 0..=all of
            // the remaining subject segments.
            for consumed in 0..=subj.len() {
                if match_segments(&pat[1..], &subj[consumed..]) {
                    return true;
                }
            }
            false
        }
        Some(&"*") => {
            if subj.is_empty() {
                return false;
            }
            match_segments(&pat[1..], &subj[1..])
        }
        Some(p) => {
            if subj.first() != Some(p) {
                return false;
            }
            match_segments(&pat[1..], &subj[1..])
        }
    }
}

#[cfg(test)]
#[path = "glob_tests.rs"]
mod tests;
