//! "Did you mean" matching for host and task names.

/// Find names similar to `target`, best match first (at most three).
///
/// Prefix matches rank first, then suffix matches, then anything within
/// an edit distance of three.
pub fn similar_names<'a, I>(target: &str, candidates: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let target_lower = target.to_lowercase();
    let mut matches: Vec<(String, usize)> = Vec::new();

    for name in candidates {
        let name_lower = name.to_lowercase();
        if name_lower == target_lower {
            continue;
        }

        if name_lower.starts_with(&target_lower) {
            matches.push((name.to_string(), 0));
            continue;
        }

        if name_lower.ends_with(&target_lower) {
            matches.push((name.to_string(), 1));
            continue;
        }

        let dist = levenshtein(&target_lower, &name_lower);
        if dist <= 3 {
            matches.push((name.to_string(), dist + 10));
        }
    }

    matches.sort_by_key(|(_, priority)| *priority);
    matches.into_iter().take(3).map(|(name, _)| name).collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let a_len = a_chars.len();
    let b_len = b_chars.len();

    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev_row: Vec<usize> = (0..=b_len).collect();
    let mut curr_row: Vec<usize> = vec![0; b_len + 1];

    for (i, a_char) in a_chars.iter().enumerate() {
        curr_row[0] = i + 1;
        for (j, b_char) in b_chars.iter().enumerate() {
            let cost = if a_char == b_char { 0 } else { 1 };
            curr_row[j + 1] = (prev_row[j + 1] + 1)
                .min(curr_row[j] + 1)
                .min(prev_row[j] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }

    prev_row[b_len]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_ranks_first() {
        let names = ["deploy:unlock", "deploy", "deploy:lock"];
        let found = similar_names("deploy:lo", names);
        assert_eq!(found, vec!["deploy:lock".to_string(), "deploy".to_string()]);
    }

    #[test]
    fn typo_within_distance_is_suggested() {
        let found = similar_names("rolback", ["rollback", "release"]);
        assert_eq!(found, vec!["rollback".to_string()]);
    }

    #[test]
    fn exact_name_is_not_suggested() {
        assert!(similar_names("web1", ["web1"]).is_empty());
    }
}
