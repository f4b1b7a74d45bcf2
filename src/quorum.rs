//! Majority quorum computation over a group's voters.

/// The number of grants a strict majority of `voters` requires.
pub fn majority(voters: usize) -> usize {
    voters / 2 + 1
}

/// The highest index that a quorum of voters has matched.
///
/// `matches` holds one match index per voter, in any order. Returns 0 for an
/// empty voter set.
pub fn committed_index(matches: &mut [u64]) -> u64 {
    if matches.is_empty() {
        return 0;
    }
    matches.sort_unstable();
    // The quorum-th highest match: every voter at or after this position has
    // replicated at least this index.
    matches[matches.len() - majority(matches.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority() {
        assert_eq!(1, majority(1));
        assert_eq!(2, majority(2));
        assert_eq!(2, majority(3));
        assert_eq!(3, majority(4));
        assert_eq!(3, majority(5));
    }

    #[test]
    fn test_committed_index() {
        assert_eq!(0, committed_index(&mut []));
        assert_eq!(5, committed_index(&mut [5]));
        assert_eq!(3, committed_index(&mut [5, 3]));
        assert_eq!(5, committed_index(&mut [5, 5, 3]));
        assert_eq!(3, committed_index(&mut [5, 3, 1]));
        assert_eq!(3, committed_index(&mut [5, 3, 3, 1]));
        assert_eq!(3, committed_index(&mut [9, 5, 3, 2, 1]));
    }
}
