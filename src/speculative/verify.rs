//! Draft verification helpers.

/// Accept the longest prefix of `draft` the target agrees with.
///
/// `target` holds the target model's choice at each of the `draft.len() + 1`
/// positions. Drafts are accepted while they match; the target's token at the
/// first mismatch (or the bonus token after a fully accepted draft) is
/// appended, so the result always holds between 1 and `draft.len() + 1`
/// tokens. Returns an empty vector only if `target` is empty.
///
/// ```
/// use nano_serve::speculative::greedy_accept;
///
/// // Target agrees on the first two drafts, then diverges
/// assert_eq!(greedy_accept(&[5, 6, 7], &[5, 6, 9, 4]), vec![5, 6, 9]);
/// // Full acceptance keeps the bonus token
/// assert_eq!(greedy_accept(&[5, 6], &[5, 6, 8]), vec![5, 6, 8]);
/// ```
pub fn greedy_accept(draft: &[u32], target: &[u32]) -> Vec<u32> {
    let num_matching = draft
        .iter()
        .zip(target)
        .take_while(|(d, t)| d == t)
        .count();
    target.iter().take(num_matching + 1).copied().collect()
}

/// Running acceptance counters for draft tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptanceStats {
    pub num_proposed: u64,
    pub num_accepted: u64,
}

impl AcceptanceStats {
    /// Record one verification: `proposed` drafts, `committed` tokens kept.
    ///
    /// The last committed token comes from the target model, not the draft.
    pub fn record(&mut self, proposed: usize, committed: usize) {
        self.num_proposed += proposed as u64;
        self.num_accepted += committed.saturating_sub(1).min(proposed) as u64;
    }

    /// Fraction of proposed drafts that were accepted.
    pub fn acceptance_rate(&self) -> f64 {
        if self.num_proposed == 0 {
            0.0
        } else {
            self.num_accepted as f64 / self.num_proposed as f64
        }
    }
}
