//! Property tests for the CPU kernels against host references.

use proptest::prelude::*;

use tiled_kernels::backend::cpu::CpuBackend;
use tiled_kernels::{
    AccumulationMode, DeviceLimits, GemmKernel, KernelBackend, KernelError, ScatterIndexSet,
    ScatterKernel, Tensor, TensorDtype, TilePlan,
};

/// Small integers keep every product and partial sum exact in f32.
fn small_ints(len: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec((-8i32..8).prop_map(|v| v as f32), len)
}

fn gemm_case() -> impl Strategy<Value = (usize, usize, usize, Vec<f32>, Vec<f32>)> {
    (1usize..24, 1usize..24, 1usize..40).prop_flat_map(|(m, n, k)| {
        (Just(m), Just(n), Just(k), small_ints(m * k), small_ints(k * n))
    })
}

fn reference_gemm(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
        }
    }
    out
}

fn scatter_case() -> impl Strategy<Value = (usize, usize, Vec<i64>, Vec<i32>)> {
    (1usize..8, 1usize..6, 1usize..40).prop_flat_map(|(rows, cols, n)| {
        (
            Just(rows),
            Just(cols),
            prop::collection::vec(0..rows as i64, n),
            prop::collection::vec(-1000i32..1000, n * cols),
        )
    })
}

fn run_scatter(
    be: &CpuBackend,
    rows: usize,
    cols: usize,
    idx: &[i64],
    upd: &[i32],
    mode: AccumulationMode,
) -> Vec<i32> {
    let dest = be.upload(&Tensor::zeros(&[rows, cols], TensorDtype::I32)).unwrap();
    let updates = be
        .upload(&Tensor::from_i32(vec![idx.len(), cols], upd.to_vec()))
        .unwrap();
    let indices = ScatterIndexSet::new(idx.to_vec());
    ScatterKernel::execute(be, &indices, &updates.view(), &dest.view(), mode).unwrap();
    be.download(&dest.view()).unwrap().as_i32().to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn gemm_matches_reference_for_any_tiling(
        (m, n, k, a, b) in gemm_case(),
        block in prop::sample::select(vec![(4usize, 4usize, 4usize), (8, 16, 8), (16, 16, 32), (32, 8, 4)]),
    ) {
        let be = CpuBackend::new();
        let limits = DeviceLimits::cpu();
        let plan = TilePlan::fixed(m, n, k, 4, block, (1, 1), &limits).unwrap();
        let av = be.upload(&Tensor::new(vec![m, k], a.clone())).unwrap();
        let bv = be.upload(&Tensor::new(vec![k, n], b.clone())).unwrap();
        let c = be.upload(&Tensor::zeros(&[m, n], TensorDtype::F32)).unwrap();

        GemmKernel::execute(&be, &av.view(), &bv.view(), &c.view(), &plan).unwrap();
        let got = be.download(&c.view()).unwrap();
        let expected = reference_gemm(&a, &b, m, n, k);
        prop_assert_eq!(got.as_f32(), expected.as_slice());
    }

    #[test]
    fn scatter_sum_is_order_independent(
        (rows, cols, idx, upd) in scatter_case(),
        seed in any::<u64>(),
    ) {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let be = CpuBackend::new();
        let forward = run_scatter(&be, rows, cols, &idx, &upd, AccumulationMode::Sum);

        let mut order: Vec<usize> = (0..idx.len()).collect();
        order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(seed));
        let idx2: Vec<i64> = order.iter().map(|&i| idx[i]).collect();
        let upd2: Vec<i32> = order
            .iter()
            .flat_map(|&i| upd[i * cols..(i + 1) * cols].iter().copied())
            .collect();
        let shuffled = run_scatter(&be, rows, cols, &idx2, &upd2, AccumulationMode::Sum);
        prop_assert_eq!(&forward, &shuffled);

        let mut expected = vec![0i32; rows * cols];
        for (r, &row) in idx.iter().enumerate() {
            for j in 0..cols {
                expected[row as usize * cols + j] += upd[r * cols + j];
            }
        }
        prop_assert_eq!(forward, expected);
    }

    #[test]
    fn scatter_max_takes_largest_contender(
        (rows, cols, idx, upd) in scatter_case(),
    ) {
        let be = CpuBackend::new();
        let got = run_scatter(&be, rows, cols, &idx, &upd, AccumulationMode::Max);

        let mut expected = vec![0i32; rows * cols];
        for (r, &row) in idx.iter().enumerate() {
            for j in 0..cols {
                let slot = row as usize * cols + j;
                expected[slot] = expected[slot].max(upd[r * cols + j]);
            }
        }
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn scatter_overwrite_leaves_a_contender(
        (rows, cols, idx, upd) in scatter_case(),
    ) {
        let be = CpuBackend::new();
        let got = run_scatter(&be, rows, cols, &idx, &upd, AccumulationMode::Overwrite);

        for row in 0..rows {
            let contenders: Vec<usize> = (0..idx.len()).filter(|&r| idx[r] as usize == row).collect();
            for j in 0..cols {
                let value = got[row * cols + j];
                if contenders.is_empty() {
                    prop_assert_eq!(value, 0);
                } else {
                    prop_assert!(contenders.iter().any(|&r| upd[r * cols + j] == value));
                }
            }
        }
    }

    #[test]
    fn rejected_scatter_leaves_destination_untouched(
        (rows, cols, mut idx, upd) in scatter_case(),
        bad_pos in any::<prop::sample::Index>(),
        negative in any::<bool>(),
    ) {
        let be = CpuBackend::new();
        let pos = bad_pos.index(idx.len());
        idx[pos] = if negative { -1 } else { rows as i64 };

        let initial: Vec<i32> = (0..(rows * cols) as i32).collect();
        let dest = be.upload(&Tensor::from_i32(vec![rows, cols], initial.clone())).unwrap();
        let updates = be.upload(&Tensor::from_i32(vec![idx.len(), cols], upd)).unwrap();
        let indices = ScatterIndexSet::new(idx);

        let result = ScatterKernel::execute(&be, &indices, &updates.view(), &dest.view(), AccumulationMode::Sum);
        let is_out_of_range = matches!(result, Err(KernelError::IndexOutOfRange { .. }));
        prop_assert!(is_out_of_range);
        let after = be.download(&dest.view()).unwrap();
        prop_assert_eq!(after.as_i32(), initial.as_slice());
    }
}
