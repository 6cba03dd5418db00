//! CUDA PTX kernel sources.
//!
//! Kernels are written in PTX assembly targeting sm_53 (the first
//! architecture with native f16 conversions) and loaded at runtime via
//! cuModuleLoadData.

/// Output tile edge of the GEMM kernels; one thread per output element.
pub const GEMM_TILE: u32 = 16;

/// Threads per group for the scatter kernels.
pub const SCATTER_BLOCK: u32 = 256;

/// Accumulation mode codes understood by the scatter kernels.
pub const MODE_OVERWRITE: u32 = 0;
pub const MODE_SUM: u32 = 1;
pub const MODE_MAX: u32 = 2;

/// Null-terminated PTX source containing all kernels.
pub const PTX_MODULE: &str = concat!(
    r#"
.version 7.0
.target sm_53
.address_size 64

// -------------------------------------------------------------------------
// gemm_f32: C = A * B  (tiled 16x16 shared-memory GEMM, f32 storage)
//
// Parameters (in order):
//   param_A   : .u64  pointer to A (M x K, rows lda elements apart)
//   param_B   : .u64  pointer to B (K x N, rows ldb elements apart)
//   param_C   : .u64  pointer to C (M x N, rows ldc elements apart)
//   param_M   : .u32  number of rows in A / C
//   param_K   : .u32  inner dimension
//   param_N   : .u32  number of cols in B / C
//   param_lda : .u32  row pitch of A in elements
//   param_ldb : .u32  row pitch of B in elements
//   param_ldc : .u32  row pitch of C in elements
//
// Grid:  (ceil(N/16), ceil(M/16), 1)
// Block: (16, 16, 1)
// -------------------------------------------------------------------------
.visible .entry gemm_f32(
    .param .u64 param_A,
    .param .u64 param_B,
    .param .u64 param_C,
    .param .u32 param_M,
    .param .u32 param_K,
    .param .u32 param_N,
    .param .u32 param_lda,
    .param .u32 param_ldb,
    .param .u32 param_ldc
)
{
    .reg .u64 %rd<20>;
    .reg .u32 %r<30>;
    .reg .f32 %f<10>;
    .reg .pred %p<5>;
    .shared .align 4 .f32 tile_A[256];
    .shared .align 4 .f32 tile_B[256];

    ld.param.u64 %rd0, [param_A];
    ld.param.u64 %rd1, [param_B];
    ld.param.u64 %rd2, [param_C];
    ld.param.u32 %r0, [param_M];
    ld.param.u32 %r1, [param_K];
    ld.param.u32 %r2, [param_N];
    ld.param.u32 %r25, [param_lda];
    ld.param.u32 %r26, [param_ldb];
    ld.param.u32 %r27, [param_ldc];

    mov.u32 %r3, %tid.x;
    mov.u32 %r4, %tid.y;
    mov.u32 %r5, %ctaid.x;
    mov.u32 %r6, %ctaid.y;

    shl.b32 %r7, %r6, 4;
    add.u32 %r7, %r7, %r4;       // row = by*16 + ty
    shl.b32 %r8, %r5, 4;
    add.u32 %r8, %r8, %r3;       // col = bx*16 + tx

    mov.f32 %f0, 0f00000000;

    // Shared memory index: ty*16+tx
    shl.b32 %r9, %r4, 4;
    add.u32 %r9, %r9, %r3;

    mov.u32 %r10, 0;
GEMM_F32_TILE_LOOP:
    // tile_A[ty][tx] = A[row][t+tx], zero outside M x K
    add.u32 %r11, %r10, %r3;
    setp.lt.u32 %p0, %r7, %r0;
    setp.lt.u32 %p1, %r11, %r1;
    and.pred %p2, %p0, %p1;
    @!%p2 bra GEMM_F32_ZERO_A;
    mul.lo.u32 %r12, %r7, %r25;
    add.u32 %r12, %r12, %r11;
    mul.wide.u32 %rd3, %r12, 4;
    add.u64 %rd3, %rd0, %rd3;
    ld.global.f32 %f1, [%rd3];
    bra GEMM_F32_STORE_A;
GEMM_F32_ZERO_A:
    mov.f32 %f1, 0f00000000;
GEMM_F32_STORE_A:
    mov.u32 %r13, tile_A;
    shl.b32 %r14, %r9, 2;
    add.u32 %r13, %r13, %r14;
    st.shared.f32 [%r13], %f1;

    // tile_B[ty][tx] = B[t+ty][col], zero outside K x N
    add.u32 %r15, %r10, %r4;
    setp.lt.u32 %p0, %r15, %r1;
    setp.lt.u32 %p1, %r8, %r2;
    and.pred %p2, %p0, %p1;
    @!%p2 bra GEMM_F32_ZERO_B;
    mul.lo.u32 %r16, %r15, %r26;
    add.u32 %r16, %r16, %r8;
    mul.wide.u32 %rd4, %r16, 4;
    add.u64 %rd4, %rd1, %rd4;
    ld.global.f32 %f2, [%rd4];
    bra GEMM_F32_STORE_B;
GEMM_F32_ZERO_B:
    mov.f32 %f2, 0f00000000;
GEMM_F32_STORE_B:
    mov.u32 %r17, tile_B;
    shl.b32 %r18, %r9, 2;
    add.u32 %r17, %r17, %r18;
    st.shared.f32 [%r17], %f2;

    bar.sync 0;

    // acc += tile_A[ty][k] * tile_B[k][tx]
    mov.u32 %r19, 0;
GEMM_F32_K_LOOP:
    shl.b32 %r20, %r4, 4;
    add.u32 %r20, %r20, %r19;
    shl.b32 %r20, %r20, 2;
    mov.u32 %r21, tile_A;
    add.u32 %r21, %r21, %r20;
    ld.shared.f32 %f3, [%r21];
    shl.b32 %r22, %r19, 4;
    add.u32 %r22, %r22, %r3;
    shl.b32 %r22, %r22, 2;
    mov.u32 %r23, tile_B;
    add.u32 %r23, %r23, %r22;
    ld.shared.f32 %f4, [%r23];
    fma.rn.f32 %f0, %f3, %f4, %f0;
    add.u32 %r19, %r19, 1;
    setp.lt.u32 %p0, %r19, 16;
    @%p0 bra GEMM_F32_K_LOOP;

    bar.sync 0;

    add.u32 %r10, %r10, 16;
    setp.lt.u32 %p0, %r10, %r1;
    @%p0 bra GEMM_F32_TILE_LOOP;

    // Masked store
    setp.lt.u32 %p0, %r7, %r0;
    setp.lt.u32 %p1, %r8, %r2;
    and.pred %p2, %p0, %p1;
    @!%p2 bra GEMM_F32_DONE;
    mul.lo.u32 %r24, %r7, %r27;
    add.u32 %r24, %r24, %r8;
    mul.wide.u32 %rd5, %r24, 4;
    add.u64 %rd5, %rd2, %rd5;
    st.global.f32 [%rd5], %f0;
GEMM_F32_DONE:
    ret;
}

// -------------------------------------------------------------------------
// gemm_f16: C = A * B  (same tiling as gemm_f32, f16 storage)
//
// Operands are widened to f32 when staged into shared memory; the f32
// accumulator is rounded to nearest f16 by the single masked store.
//
// Parameters: same as gemm_f32, pitches in f16 elements.
// Grid:  (ceil(N/16), ceil(M/16), 1)
// Block: (16, 16, 1)
// -------------------------------------------------------------------------
.visible .entry gemm_f16(
    .param .u64 param_A,
    .param .u64 param_B,
    .param .u64 param_C,
    .param .u32 param_M,
    .param .u32 param_K,
    .param .u32 param_N,
    .param .u32 param_lda,
    .param .u32 param_ldb,
    .param .u32 param_ldc
)
{
    .reg .u64 %rd<20>;
    .reg .u32 %r<30>;
    .reg .f32 %f<10>;
    .reg .b16 %h<4>;
    .reg .pred %p<5>;
    .shared .align 4 .f32 tile_A[256];
    .shared .align 4 .f32 tile_B[256];

    ld.param.u64 %rd0, [param_A];
    ld.param.u64 %rd1, [param_B];
    ld.param.u64 %rd2, [param_C];
    ld.param.u32 %r0, [param_M];
    ld.param.u32 %r1, [param_K];
    ld.param.u32 %r2, [param_N];
    ld.param.u32 %r25, [param_lda];
    ld.param.u32 %r26, [param_ldb];
    ld.param.u32 %r27, [param_ldc];

    mov.u32 %r3, %tid.x;
    mov.u32 %r4, %tid.y;
    mov.u32 %r5, %ctaid.x;
    mov.u32 %r6, %ctaid.y;

    shl.b32 %r7, %r6, 4;
    add.u32 %r7, %r7, %r4;
    shl.b32 %r8, %r5, 4;
    add.u32 %r8, %r8, %r3;

    mov.f32 %f0, 0f00000000;

    shl.b32 %r9, %r4, 4;
    add.u32 %r9, %r9, %r3;

    mov.u32 %r10, 0;
GEMM_F16_TILE_LOOP:
    add.u32 %r11, %r10, %r3;
    setp.lt.u32 %p0, %r7, %r0;
    setp.lt.u32 %p1, %r11, %r1;
    and.pred %p2, %p0, %p1;
    @!%p2 bra GEMM_F16_ZERO_A;
    mul.lo.u32 %r12, %r7, %r25;
    add.u32 %r12, %r12, %r11;
    mul.wide.u32 %rd3, %r12, 2;
    add.u64 %rd3, %rd0, %rd3;
    ld.global.b16 %h0, [%rd3];
    cvt.f32.f16 %f1, %h0;
    bra GEMM_F16_STORE_A;
GEMM_F16_ZERO_A:
    mov.f32 %f1, 0f00000000;
GEMM_F16_STORE_A:
    mov.u32 %r13, tile_A;
    shl.b32 %r14, %r9, 2;
    add.u32 %r13, %r13, %r14;
    st.shared.f32 [%r13], %f1;

    add.u32 %r15, %r10, %r4;
    setp.lt.u32 %p0, %r15, %r1;
    setp.lt.u32 %p1, %r8, %r2;
    and.pred %p2, %p0, %p1;
    @!%p2 bra GEMM_F16_ZERO_B;
    mul.lo.u32 %r16, %r15, %r26;
    add.u32 %r16, %r16, %r8;
    mul.wide.u32 %rd4, %r16, 2;
    add.u64 %rd4, %rd1, %rd4;
    ld.global.b16 %h1, [%rd4];
    cvt.f32.f16 %f2, %h1;
    bra GEMM_F16_STORE_B;
GEMM_F16_ZERO_B:
    mov.f32 %f2, 0f00000000;
GEMM_F16_STORE_B:
    mov.u32 %r17, tile_B;
    shl.b32 %r18, %r9, 2;
    add.u32 %r17, %r17, %r18;
    st.shared.f32 [%r17], %f2;

    bar.sync 0;

    mov.u32 %r19, 0;
GEMM_F16_K_LOOP:
    shl.b32 %r20, %r4, 4;
    add.u32 %r20, %r20, %r19;
    shl.b32 %r20, %r20, 2;
    mov.u32 %r21, tile_A;
    add.u32 %r21, %r21, %r20;
    ld.shared.f32 %f3, [%r21];
    shl.b32 %r22, %r19, 4;
    add.u32 %r22, %r22, %r3;
    shl.b32 %r22, %r22, 2;
    mov.u32 %r23, tile_B;
    add.u32 %r23, %r23, %r22;
    ld.shared.f32 %f4, [%r23];
    fma.rn.f32 %f0, %f3, %f4, %f0;
    add.u32 %r19, %r19, 1;
    setp.lt.u32 %p0, %r19, 16;
    @%p0 bra GEMM_F16_K_LOOP;

    bar.sync 0;

    add.u32 %r10, %r10, 16;
    setp.lt.u32 %p0, %r10, %r1;
    @%p0 bra GEMM_F16_TILE_LOOP;

    setp.lt.u32 %p0, %r7, %r0;
    setp.lt.u32 %p1, %r8, %r2;
    and.pred %p2, %p0, %p1;
    @!%p2 bra GEMM_F16_DONE;
    mul.lo.u32 %r24, %r7, %r27;
    add.u32 %r24, %r24, %r8;
    mul.wide.u32 %rd5, %r24, 2;
    add.u64 %rd5, %rd2, %rd5;
    cvt.rn.f16.f32 %h2, %f0;
    st.global.b16 [%rd5], %h2;
GEMM_F16_DONE:
    ret;
}

// -------------------------------------------------------------------------
// scatter_f32: dest[rows[r] + e] (op)= updates[r * slice + e]
//
// Parameters:
//   param_dest    : .u64  pointer to dest (f32)
//   param_updates : .u64  pointer to updates (f32, n_rows x slice, dense)
//   param_rows    : .u64  pointer to per-row dest element offsets (u32)
//   param_n_rows  : .u32  number of update rows
//   param_slice   : .u32  elements per row
//   param_mode    : .u32  0 = overwrite, 1 = sum, 2 = max
//
// Max replaces only when update > current (NaN never wins, never loses)
// and retries its compare-and-swap until it succeeds or is no longer needed.
//
// Grid:  (ceil(slice/256), n_rows, 1)
// Block: (256, 1, 1)
// -------------------------------------------------------------------------
.visible .entry scatter_f32(
    .param .u64 param_dest,
    .param .u64 param_updates,
    .param .u64 param_rows,
    .param .u32 param_n_rows,
    .param .u32 param_slice,
    .param .u32 param_mode
)
{
    .reg .u64 %rd<8>;
    .reg .u32 %r<16>;
    .reg .f32 %f<4>;
    .reg .pred %p<4>;

    ld.param.u64 %rd0, [param_dest];
    ld.param.u64 %rd1, [param_updates];
    ld.param.u64 %rd2, [param_rows];
    ld.param.u32 %r0, [param_n_rows];
    ld.param.u32 %r1, [param_slice];
    ld.param.u32 %r2, [param_mode];

    mov.u32 %r3, %ctaid.y;           // row
    mov.u32 %r4, %ctaid.x;
    mov.u32 %r5, %ntid.x;
    mov.u32 %r6, %tid.x;
    mad.lo.u32 %r7, %r4, %r5, %r6;   // e
    setp.ge.u32 %p0, %r3, %r0;
    @%p0 bra SCATTER_F32_DONE;
    setp.ge.u32 %p0, %r7, %r1;
    @%p0 bra SCATTER_F32_DONE;

    mad.lo.u32 %r8, %r3, %r1, %r7;
    mul.wide.u32 %rd3, %r8, 4;
    add.u64 %rd3, %rd1, %rd3;
    ld.global.f32 %f0, [%rd3];

    mul.wide.u32 %rd4, %r3, 4;
    add.u64 %rd4, %rd2, %rd4;
    ld.global.u32 %r9, [%rd4];
    add.u32 %r9, %r9, %r7;
    mul.wide.u32 %rd5, %r9, 4;
    add.u64 %rd5, %rd0, %rd5;

    setp.eq.u32 %p1, %r2, 1;
    @%p1 bra SCATTER_F32_SUM;
    setp.eq.u32 %p1, %r2, 2;
    @%p1 bra SCATTER_F32_MAX;
    st.global.f32 [%rd5], %f0;
    bra SCATTER_F32_DONE;
SCATTER_F32_SUM:
    atom.global.add.f32 %f1, [%rd5], %f0;
    bra SCATTER_F32_DONE;
SCATTER_F32_MAX:
    mov.b32 %r10, %f0;
    ld.global.u32 %r11, [%rd5];
SCATTER_F32_MAX_LOOP:
    mov.b32 %f2, %r11;
    setp.gt.f32 %p2, %f0, %f2;
    @!%p2 bra SCATTER_F32_DONE;
    atom.global.cas.b32 %r12, [%rd5], %r11, %r10;
    setp.eq.u32 %p3, %r12, %r11;
    @%p3 bra SCATTER_F32_DONE;
    mov.u32 %r11, %r12;
    bra SCATTER_F32_MAX_LOOP;
SCATTER_F32_DONE:
    ret;
}

// -------------------------------------------------------------------------
// scatter_i32: integer variant of scatter_f32. Sums wrap.
//
// Parameters, grid and block: same as scatter_f32.
// -------------------------------------------------------------------------
.visible .entry scatter_i32(
    .param .u64 param_dest,
    .param .u64 param_updates,
    .param .u64 param_rows,
    .param .u32 param_n_rows,
    .param .u32 param_slice,
    .param .u32 param_mode
)
{
    .reg .u64 %rd<8>;
    .reg .u32 %r<16>;
    .reg .pred %p<4>;

    ld.param.u64 %rd0, [param_dest];
    ld.param.u64 %rd1, [param_updates];
    ld.param.u64 %rd2, [param_rows];
    ld.param.u32 %r0, [param_n_rows];
    ld.param.u32 %r1, [param_slice];
    ld.param.u32 %r2, [param_mode];

    mov.u32 %r3, %ctaid.y;
    mov.u32 %r4, %ctaid.x;
    mov.u32 %r5, %ntid.x;
    mov.u32 %r6, %tid.x;
    mad.lo.u32 %r7, %r4, %r5, %r6;
    setp.ge.u32 %p0, %r3, %r0;
    @%p0 bra SCATTER_I32_DONE;
    setp.ge.u32 %p0, %r7, %r1;
    @%p0 bra SCATTER_I32_DONE;

    mad.lo.u32 %r8, %r3, %r1, %r7;
    mul.wide.u32 %rd3, %r8, 4;
    add.u64 %rd3, %rd1, %rd3;
    ld.global.u32 %r10, [%rd3];

    mul.wide.u32 %rd4, %r3, 4;
    add.u64 %rd4, %rd2, %rd4;
    ld.global.u32 %r9, [%rd4];
    add.u32 %r9, %r9, %r7;
    mul.wide.u32 %rd5, %r9, 4;
    add.u64 %rd5, %rd0, %rd5;

    setp.eq.u32 %p1, %r2, 1;
    @%p1 bra SCATTER_I32_SUM;
    setp.eq.u32 %p1, %r2, 2;
    @%p1 bra SCATTER_I32_MAX;
    st.global.u32 [%rd5], %r10;
    bra SCATTER_I32_DONE;
SCATTER_I32_SUM:
    atom.global.add.u32 %r11, [%rd5], %r10;
    bra SCATTER_I32_DONE;
SCATTER_I32_MAX:
    atom.global.max.s32 %r11, [%rd5], %r10;
SCATTER_I32_DONE:
    ret;
}
"#,
    "\0"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptx_module_is_null_terminated() {
        assert!(PTX_MODULE.ends_with('\0'));
    }

    #[test]
    fn ptx_module_has_header() {
        assert!(PTX_MODULE.contains(".version 7.0"));
        assert!(PTX_MODULE.contains(".target sm_53"));
        assert!(PTX_MODULE.contains(".address_size 64"));
    }

    #[test]
    fn ptx_module_contains_kernels() {
        for name in ["gemm_f32", "gemm_f16", "scatter_f32", "scatter_i32"] {
            let entry = format!(".visible .entry {}(", name);
            assert!(PTX_MODULE.contains(&entry), "Missing kernel: {}", name);
        }
    }

    #[test]
    fn ptx_labels_are_unique() {
        let mut labels: Vec<&str> = PTX_MODULE
            .lines()
            .map(str::trim)
            .filter(|l| l.ends_with(':') && !l.starts_with("//"))
            .collect();
        let total = labels.len();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), total, "duplicate PTX label");
    }

    #[test]
    fn ptx_gemm_tiles_match_launch_constant() {
        let elements = GEMM_TILE * GEMM_TILE;
        let decl = format!(".f32 tile_A[{}]", elements);
        assert!(PTX_MODULE.contains(&decl));
    }

    #[test]
    fn ptx_scatter_uses_atomics() {
        assert!(PTX_MODULE.contains("atom.global.add.f32"));
        assert!(PTX_MODULE.contains("atom.global.cas.b32"));
        assert!(PTX_MODULE.contains("atom.global.max.s32"));
    }
}
