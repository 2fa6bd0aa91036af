//! Contiguous tensor-contraction kernel used on the GEMM fast path.

/// Contract dense row-major `a` ([m, k]) with `b` ([k, n]) over the shared
/// k dimension, overwriting `c` ([m, n]).
///
/// The inner loop walks matched contiguous rows of `b` and `c`, so it
/// compiles to straight multiply-add sweeps the compiler can vectorize.
/// Prior contents of `c` are never read.
pub(crate) fn contract_f32(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    debug_assert!(a.len() >= m * k);
    debug_assert!(b.len() >= k * n);
    debug_assert!(c.len() >= m * n);

    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        c_row.fill(0.0);
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &a_ip) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (acc, &bv) in c_row.iter_mut().zip(b_row) {
                *acc += a_ip * bv;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_basic() {
        // [1,2;3,4] @ [5,6;7,8] = [19,22;43,50]
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [0.0; 4];
        contract_f32(&a, &b, &mut c, 2, 2, 2);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_contract_rectangular() {
        // [1,0,2] (1x3) @ [[1],[2],[3]] (3x1) = [7]
        let a = [1.0, 0.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        let mut c = [f32::NAN];
        contract_f32(&a, &b, &mut c, 1, 1, 3);
        assert_eq!(c, [7.0]);
    }

    #[test]
    fn test_contract_zero_k_zero_fills() {
        let mut c = [f32::NAN, f32::NAN];
        contract_f32(&[], &[], &mut c, 1, 2, 0);
        assert_eq!(c, [0.0, 0.0]);
    }
}
