use edgerun::desc::{DataType, TensorDescriptor};
use edgerun::ops::gpu::candidates::fully_connected_candidates;
use edgerun::ops::gpu::fully_connected::infer_output_size;

fn nchw(n: usize, c: usize, h: usize, w: usize) -> TensorDescriptor {
    TensorDescriptor::nchw(DataType::F32, n, c, h, w)
}

#[test]
fn candidate_generation_is_deterministic() {
    let input = TensorDescriptor::mkt(DataType::F32, 2, 64, 33);
    let filter = nchw(96, 64, 1, 1);
    let out = TensorDescriptor::mkt(DataType::F32, 2, 96, 33);
    let reference = fully_connected_candidates(&input, &filter, &[out]).unwrap();
    for _ in 0..10 {
        let again = fully_connected_candidates(&input, &filter, &[out]).unwrap();
        assert_eq!(again, reference);
    }
}

#[test]
fn unit_kernel_candidates_prune_on_divisibility() {
    // 24 input channels: the base candidate plus the one the 8-gate admits.
    let set = fully_connected_candidates(&nchw(1, 24, 1, 1), &nchw(10, 24, 1, 1), &[nchw(
        1, 10, 1, 1,
    )])
    .unwrap();
    assert_eq!(set.len(), 2);

    // 7 input channels: only the base vector-width-4 candidate.
    let set = fully_connected_candidates(&nchw(1, 7, 1, 1), &nchw(10, 7, 1, 1), &[nchw(
        1, 10, 1, 1,
    )])
    .unwrap();
    assert_eq!(set.len(), 1);
}

#[test]
fn candidate_order_groups_by_algorithm_tag() {
    let input = TensorDescriptor::mkt(DataType::F32, 1, 32, 5);
    let filter = nchw(64, 32, 1, 1);
    let out = TensorDescriptor::mkt(DataType::F32, 1, 64, 5);
    let set = fully_connected_candidates(&input, &filter, &[out]).unwrap();
    assert_eq!(set.groups().len(), 1);
    let (_, configs) = &set.groups()[0];
    assert_eq!(configs.len(), set.len());
}

#[test]
fn mkt_input_buffer_is_padded_for_the_widest_tile() {
    let input = TensorDescriptor::mkt(DataType::F32, 1, 32, 33);
    let filter = nchw(64, 32, 1, 1);
    let (out, in_mem, out_mem) = infer_output_size(&input, &filter).unwrap();
    assert_eq!(out.mkt_dims(), (1, 64, 33));

    // Candidate tile widths reach 8: 33 aligns up to 40 and the descriptor
    // carries the padding obligation.
    assert_eq!(in_mem.stride[1], 40);
    assert!(in_mem.need_pad);

    // The output keeps its natural time extent.
    assert_eq!(out_mem.stride[1], 33);
    assert!(!out_mem.need_pad);
}

#[test]
fn padded_extent_fits_every_candidate_tile() {
    let input = TensorDescriptor::mkt(DataType::F32, 1, 32, 33);
    let filter = nchw(64, 32, 1, 1);
    let out = TensorDescriptor::mkt(DataType::F32, 1, 64, 33);
    let set = fully_connected_candidates(&input, &filter, &[out]).unwrap();
    let (_, in_mem, _) = infer_output_size(&input, &filter).unwrap();
    for w in set.tile_widths() {
        let w = w as usize;
        assert!(33usize.div_ceil(w) * w <= in_mem.stride[1]);
    }
}
