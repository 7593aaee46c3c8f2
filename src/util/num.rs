/// Smallest power of two that is `>= n`, never less than `2`
pub fn pow2_at_least(n: usize) -> usize {
    n.max(2)
        .checked_next_power_of_two()
        .expect("capacity overflow")
}

/// Round up `n` to the nearest `to`, `None` if that does not fit
pub fn round_up(n: u64, to: u64) -> Option<u64> {
    Some(to * (n.checked_add(to - 1)? / to))
}
