/// Exclusive prefix sum of `values` and the total (the carry into the next run).
///
/// Wraps on overflow like the device-side `uint` arithmetic it mirrors.
pub fn exclusive_prefix_sum(values: &[u32]) -> (Vec<u32>, u32) {
    let mut carry = 0u32;
    let sums = values
        .iter()
        .map(|&v| {
            let at = carry;
            carry = carry.wrapping_add(v);
            at
        })
        .collect();
    (sums, carry)
}
