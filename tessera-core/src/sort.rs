//! Stable hybrid merge sort over densely packed fixed-size records.
//!
//! The range-scan path feeds this with backend index entries that arrive in
//! storage order; the output must be sorted by ID and stable. The first
//! pass detects naturally ordered stretches; stretches shorter than
//! [`MERGE_THRESHOLD`] fall back to pairwise merging, longer ones are kept
//! as whole runs. Merging switches to exponential-then-binary galloping
//! when one side keeps winning.

use std::cmp::Ordering;

use crate::error::{Result, StoreError};

/// Natural-run cut-off: same-sense stretches at least this long are merged
/// as single runs instead of pairs.
pub const MERGE_THRESHOLD: usize = 16;

/// Consecutive wins from one side before the merge starts galloping.
const MIN_GALLOP: usize = 6;

/// Sort `nmemb` records of `elem_size` bytes each, packed densely in
/// `base`, into ascending `cmp` order.
///
/// `scratch` is caller-provided temporary storage and must hold at least
/// `nmemb * elem_size + size_of::<usize>()` bytes. Records smaller than
/// half a pointer cannot be sorted and are rejected.
pub fn merge_sort<F>(
    base: &mut [u8],
    nmemb: usize,
    elem_size: usize,
    scratch: &mut [u8],
    cmp: F,
) -> Result<()>
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    let ptr_size = std::mem::size_of::<usize>();
    if elem_size < ptr_size / 2 {
        return Err(StoreError::InvalidArgument(format!(
            "element size {} below the {} byte floor",
            elem_size,
            ptr_size / 2
        )));
    }
    if nmemb == 0 {
        return Ok(());
    }
    if base.len() < nmemb * elem_size {
        return Err(StoreError::InvalidArgument(format!(
            "base holds {} bytes, {} records of {} bytes need {}",
            base.len(),
            nmemb,
            elem_size,
            nmemb * elem_size
        )));
    }
    if scratch.len() < nmemb * elem_size + ptr_size {
        return Err(StoreError::InvalidArgument(format!(
            "scratch holds {} bytes, need at least {}",
            scratch.len(),
            nmemb * elem_size + ptr_size
        )));
    }
    if nmemb == 1 {
        return Ok(());
    }

    let mut runs = collect_runs(base, nmemb, elem_size, &cmp);

    // Bottom-up passes over the run list until a single run covers the
    // whole buffer.
    while runs.len() > 1 {
        let mut merged = Vec::with_capacity(runs.len() / 2 + 1);
        let mut i = 0;
        while i + 1 < runs.len() {
            let (lo, mid) = runs[i];
            let (mid2, hi) = runs[i + 1];
            debug_assert_eq!(mid, mid2);
            merge_runs(base, lo, mid, hi, elem_size, scratch, &cmp);
            merged.push((lo, hi));
            i += 2;
        }
        if i < runs.len() {
            merged.push(runs[i]);
        }
        runs = merged;
    }

    Ok(())
}

/// First pass: split the input into sorted runs.
///
/// Stretches of pairs that compare with the same sense form a region; a
/// region shorter than the threshold is emitted as sorted pairs, a longer
/// one as maximal monotonic runs with descending segments reversed.
fn collect_runs<F>(
    base: &mut [u8],
    nmemb: usize,
    elem_size: usize,
    cmp: &F,
) -> Vec<(usize, usize)>
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    let mut runs = Vec::new();
    let mut start = 0;

    while start < nmemb {
        if start + 1 == nmemb {
            runs.push((start, nmemb));
            break;
        }

        let sense = pair_sense(base, start, elem_size, cmp);
        let mut end = start + 2;
        while end + 1 < nmemb && pair_sense(base, end, elem_size, cmp) == sense {
            end += 2;
        }

        if end - start < MERGE_THRESHOLD {
            let mut p = start;
            while p + 1 < end {
                if elem_cmp(base, p, p + 1, elem_size, cmp) == Ordering::Greater {
                    swap_elems(base, p, p + 1, elem_size);
                }
                runs.push((p, p + 2));
                p += 2;
            }
            if p < end {
                runs.push((p, end));
            }
        } else {
            push_monotonic_runs(base, start, end, elem_size, cmp, &mut runs);
        }

        start = end;
    }

    runs
}

/// Split `[start, end)` into maximal monotonic runs. Strictly descending
/// segments are reversed in place, which keeps equal records stable.
fn push_monotonic_runs<F>(
    base: &mut [u8],
    start: usize,
    end: usize,
    elem_size: usize,
    cmp: &F,
    runs: &mut Vec<(usize, usize)>,
) where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    let mut i = start;
    while i < end {
        let mut j = i + 1;
        if j == end {
            runs.push((i, j));
            break;
        }

        if elem_cmp(base, i, j, elem_size, cmp) == Ordering::Greater {
            while j + 1 < end && elem_cmp(base, j, j + 1, elem_size, cmp) == Ordering::Greater {
                j += 1;
            }
            reverse_elems(base, i, j + 1, elem_size);
        } else {
            while j + 1 < end && elem_cmp(base, j, j + 1, elem_size, cmp) != Ordering::Greater {
                j += 1;
            }
        }

        runs.push((i, j + 1));
        i = j + 1;
    }
}

/// Merge the adjacent sorted runs `[lo, mid)` and `[mid, hi)`.
fn merge_runs<F>(
    base: &mut [u8],
    lo: usize,
    mid: usize,
    hi: usize,
    elem_size: usize,
    scratch: &mut [u8],
    cmp: &F,
) where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    let left_len = mid - lo;
    scratch[..left_len * elem_size]
        .copy_from_slice(&base[lo * elem_size..mid * elem_size]);

    let mut li = 0;
    let mut ri = mid;
    let mut dest = lo;
    let mut left_wins = 0;
    let mut right_wins = 0;

    while li < left_len && ri < hi {
        let left = &scratch[li * elem_size..(li + 1) * elem_size];
        let right = &base[ri * elem_size..(ri + 1) * elem_size];

        if cmp(left, right) != Ordering::Greater {
            base[dest * elem_size..(dest + 1) * elem_size]
                .copy_from_slice(&scratch[li * elem_size..(li + 1) * elem_size]);
            li += 1;
            dest += 1;
            left_wins += 1;
            right_wins = 0;
        } else {
            base.copy_within(ri * elem_size..(ri + 1) * elem_size, dest * elem_size);
            ri += 1;
            dest += 1;
            right_wins += 1;
            left_wins = 0;
        }

        if left_wins >= MIN_GALLOP && li < left_len && ri < hi {
            let take = gallop(left_len - li, |k| {
                let probe = &scratch[(li + k) * elem_size..(li + k + 1) * elem_size];
                let head = &base[ri * elem_size..(ri + 1) * elem_size];
                cmp(probe, head) != Ordering::Greater
            });
            base[dest * elem_size..(dest + take) * elem_size]
                .copy_from_slice(&scratch[li * elem_size..(li + take) * elem_size]);
            li += take;
            dest += take;
            left_wins = 0;
        } else if right_wins >= MIN_GALLOP && li < left_len && ri < hi {
            let take = gallop(hi - ri, |k| {
                let probe = &base[(ri + k) * elem_size..(ri + k + 1) * elem_size];
                let head = &scratch[li * elem_size..(li + 1) * elem_size];
                cmp(probe, head) == Ordering::Less
            });
            base.copy_within(
                ri * elem_size..(ri + take) * elem_size,
                dest * elem_size,
            );
            ri += take;
            dest += take;
            right_wins = 0;
        }
    }

    if li < left_len {
        base[dest * elem_size..(dest + left_len - li) * elem_size]
            .copy_from_slice(&scratch[li * elem_size..left_len * elem_size]);
    }
    // Remaining right records are already in their final position.
}

/// Length of the true prefix of a monotone predicate over `[0, len)`,
/// found by exponential probing followed by binary search.
fn gallop<P>(len: usize, pred: P) -> usize
where
    P: Fn(usize) -> bool,
{
    if len == 0 || !pred(0) {
        return 0;
    }

    let mut hit = 0;
    let mut probe = 1;
    while probe < len && pred(probe) {
        hit = probe;
        probe = probe
            .checked_mul(2)
            .unwrap_or(len);
    }
    let mut hi = probe.min(len);

    // Invariant: pred(hit) holds, pred(hi) fails (or hi == len).
    let mut lo = hit;
    while lo + 1 < hi {
        let m = lo + (hi - lo) / 2;
        if pred(m) {
            lo = m;
        } else {
            hi = m;
        }
    }
    lo + 1
}

/// Sense of the pair starting at `i`: true when it is descending.
fn pair_sense<F>(base: &[u8], i: usize, elem_size: usize, cmp: &F) -> bool
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    elem_cmp(base, i, i + 1, elem_size, cmp) == Ordering::Greater
}

fn elem_cmp<F>(base: &[u8], a: usize, b: usize, elem_size: usize, cmp: &F) -> Ordering
where
    F: Fn(&[u8], &[u8]) -> Ordering,
{
    cmp(
        &base[a * elem_size..(a + 1) * elem_size],
        &base[b * elem_size..(b + 1) * elem_size],
    )
}

fn swap_elems(base: &mut [u8], a: usize, b: usize, elem_size: usize) {
    for k in 0..elem_size {
        base.swap(a * elem_size + k, b * elem_size + k);
    }
}

fn reverse_elems(base: &mut [u8], start: usize, end: usize, elem_size: usize) {
    let (mut a, mut b) = (start, end - 1);
    while a < b {
        swap_elems(base, a, b, elem_size);
        a += 1;
        b -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pack(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn unpack(raw: &[u8]) -> Vec<u32> {
        raw.chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    fn cmp_u32(a: &[u8], b: &[u8]) -> Ordering {
        let a = u32::from_le_bytes(a.try_into().unwrap());
        let b = u32::from_le_bytes(b.try_into().unwrap());
        a.cmp(&b)
    }

    fn sort_u32(values: &[u32]) -> Vec<u32> {
        let mut base = pack(values);
        let mut scratch = vec![0u8; base.len() + std::mem::size_of::<usize>()];
        merge_sort(&mut base, values.len(), 4, &mut scratch, cmp_u32).unwrap();
        unpack(&base)
    }

    #[test]
    fn rejects_bad_arguments() {
        let mut base = [0u8; 16];
        let mut scratch = [0u8; 64];

        // Element size below the pointer floor.
        let err = merge_sort(&mut base, 8, 2, &mut scratch, |a, b| a.cmp(b));
        assert!(matches!(err, Err(StoreError::InvalidArgument(_))));

        // Scratch too small.
        let mut tiny = [0u8; 4];
        let err = merge_sort(&mut base, 4, 4, &mut tiny, |a, b| a.cmp(b));
        assert!(matches!(err, Err(StoreError::InvalidArgument(_))));

        // Base shorter than claimed.
        let err = merge_sort(&mut base, 100, 4, &mut scratch, |a, b| a.cmp(b));
        assert!(matches!(err, Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn empty_and_single_are_trivial() {
        let mut base: [u8; 0] = [];
        let mut scratch = [0u8; 8];
        merge_sort(&mut base, 0, 4, &mut scratch, cmp_u32).unwrap();

        assert_eq!(sort_u32(&[5]), vec![5]);
    }

    #[test]
    fn sorts_random_data_as_permutation() {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for len in [2usize, 7, 16, 33, 100, 1024] {
            let values: Vec<u32> = (0..len).map(|_| rng.gen_range(0..1000)).collect();
            let mut expected = values.clone();
            expected.sort();
            assert_eq!(sort_u32(&values), expected, "len={}", len);
        }
    }

    #[test]
    fn already_sorted_and_reversed_inputs() {
        let asc: Vec<u32> = (0..200).collect();
        assert_eq!(sort_u32(&asc), asc);

        let desc: Vec<u32> = (0..200).rev().collect();
        assert_eq!(sort_u32(&desc), asc);
    }

    #[test]
    fn gallop_path_merges_block_runs() {
        // Two long pre-sorted halves with disjoint value ranges force long
        // winning streaks on both sides of the merge.
        let mut values: Vec<u32> = (1000..1100).collect();
        values.extend(0..100u32);
        let mut expected = values.clone();
        expected.sort();
        assert_eq!(sort_u32(&values), expected);
    }

    #[test]
    fn stable_for_equal_keys() {
        // Records carry (key, tag); only the key participates in ordering.
        let records: Vec<(u32, u32)> = vec![
            (3, 0),
            (1, 1),
            (3, 2),
            (2, 3),
            (1, 4),
            (3, 5),
            (2, 6),
            (1, 7),
        ];
        let mut base: Vec<u8> = records
            .iter()
            .flat_map(|(k, t)| {
                let mut rec = k.to_le_bytes().to_vec();
                rec.extend(t.to_le_bytes());
                rec
            })
            .collect();
        let mut scratch = vec![0u8; base.len() + std::mem::size_of::<usize>()];

        merge_sort(&mut base, records.len(), 8, &mut scratch, |a, b| {
            cmp_u32(&a[..4], &b[..4])
        })
        .unwrap();

        let sorted: Vec<(u32, u32)> = base
            .chunks(8)
            .map(|c| {
                (
                    u32::from_le_bytes(c[..4].try_into().unwrap()),
                    u32::from_le_bytes(c[4..].try_into().unwrap()),
                )
            })
            .collect();

        // Keys ascending, tags of equal keys keep their input order.
        assert_eq!(
            sorted,
            vec![
                (1, 1),
                (1, 4),
                (1, 7),
                (2, 3),
                (2, 6),
                (3, 0),
                (3, 2),
                (3, 5),
            ]
        );
    }

    #[test]
    fn gallop_prefix_search() {
        assert_eq!(gallop(0, |_| true), 0);
        assert_eq!(gallop(10, |_| false), 0);
        assert_eq!(gallop(10, |_| true), 10);
        assert_eq!(gallop(100, |k| k < 37), 37);
        assert_eq!(gallop(3, |k| k < 1), 1);
    }
}
